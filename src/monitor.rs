// Thunderbolt/USB4 authorization daemon
//
// Copyright (C) 2023, Intel Corporation
// Author: Mika Westerberg <mika.westerberg@linux.intel.com>

// Hotplug event sources. Two independent udev monitor subscriptions are kept: a post-settled
// "user" stream that drives all state transitions, and a second, diagnostic-only stream kept for
// logging parity with the original daemon (see SPEC_FULL.md §4.4 for why this isn't a true
// pre-coldplug kernel-netlink-group subscription: the safe `udev` crate binding only exposes the
// post-rule-processing group).
//
// The monitor socket is non-blocking: reading it when nothing is queued yields `None`
// immediately rather than waiting for the next event. Callers must `poll` the underlying fd
// (via `select`) before draining, exactly as the teacher's `Monitor` does.

use std::fmt::{self, Display};
use std::io;
use std::os::fd::AsRawFd;
use std::time::Duration;

use nix::sys::{select, time::TimeVal};

use crate::error::UdevError;

/// The action a hotplug event carries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    Add,
    Change,
    Remove,
}

impl Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Add => "add",
            Self::Change => "change",
            Self::Remove => "remove",
        };
        write!(f, "{s}")
    }
}

fn action_from_event_type(ty: udev::EventType) -> Option<Action> {
    match ty {
        udev::EventType::Add => Some(Action::Add),
        udev::EventType::Change => Some(Action::Change),
        udev::EventType::Remove => Some(Action::Remove),
        _ => None,
    }
}

/// A single hotplug notification.
pub struct HotplugEvent {
    pub action: Action,
    pub device: udev::Device,
}

fn subscribe() -> Result<udev::MonitorSocket, UdevError> {
    udev::MonitorBuilder::new()
        .and_then(|b| b.match_subsystem("thunderbolt"))
        .and_then(|b| b.listen())
        .map_err(|e| UdevError::Subscribe("thunderbolt", e))
}

/// Blocks until `socket`'s fd becomes readable, or `duration` elapses. Passing `None` blocks
/// forever. Returns `true` if there is at least one event to read.
fn poll(socket: &udev::MonitorSocket, duration: Option<Duration>) -> io::Result<bool> {
    let mut readfds = select::FdSet::new();
    readfds.insert(socket.as_raw_fd());

    let mut tv: Option<TimeVal> = duration.map(|duration| {
        TimeVal::new(
            duration.as_secs().try_into().unwrap(),
            #[allow(clippy::unnecessary_fallible_conversions)]
            duration.subsec_micros().try_into().unwrap(),
        )
    });
    let nfds = select::select(None, Some(&mut readfds), None, None, &mut tv)?;

    Ok(nfds > 0)
}

/// The authoritative, post-settled hotplug monitor. All state transitions derive from this
/// stream.
pub struct Monitor {
    socket: udev::MonitorSocket,
}

impl Monitor {
    /// Subscribes to thunderbolt hotplug events. Fails fast, matching the manager's "fail fast on
    /// inability to subscribe" startup requirement.
    pub fn open() -> Result<Self, UdevError> {
        Ok(Monitor { socket: subscribe()? })
    }

    /// Blocks until an event is available, or `duration` elapses. Passing `None` blocks forever.
    pub fn poll(&self, duration: Option<Duration>) -> io::Result<bool> {
        poll(&self.socket, duration)
    }

    /// Returns a mutable iterator over the events currently buffered on the socket.
    pub fn iter_mut(&mut self) -> &mut Self {
        self
    }
}

impl Iterator for Monitor {
    type Item = HotplugEvent;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let event = self.socket.iter().next()?;

            if let Some(action) = action_from_event_type(event.event_type()) {
                return Some(HotplugEvent {
                    action,
                    device: event.device(),
                });
            }
            // Events without a recognized action are dropped silently and we keep reading.
        }
    }
}

/// The diagnostic-only stream, logged but never used to derive device-table state.
pub struct KernelMonitor {
    socket: udev::MonitorSocket,
}

impl KernelMonitor {
    pub fn open() -> Result<Self, UdevError> {
        Ok(KernelMonitor { socket: subscribe()? })
    }

    /// Blocks until an event is available, or `duration` elapses. Passing `None` blocks forever.
    pub fn poll(&self, duration: Option<Duration>) -> io::Result<bool> {
        poll(&self.socket, duration)
    }

    /// Returns a mutable iterator over the events currently buffered on the socket.
    pub fn iter_mut(&mut self) -> &mut Self {
        self
    }
}

impl Iterator for KernelMonitor {
    type Item = (Action, udev::Device);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let event = self.socket.iter().next()?;

            if let Some(action) = action_from_event_type(event.event_type()) {
                return Some((action, event.device()));
            }
        }
    }
}
