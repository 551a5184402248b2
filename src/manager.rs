// Thunderbolt/USB4 authorization daemon
//
// Copyright (C) 2023, Intel Corporation
// Author: Mika Westerberg <mika.westerberg@linux.intel.com>

// The device table and the single event-dispatch loop that owns it. Everything that mutates the
// table happens on the thread running `Manager::run`; events reach it over one multiplexed
// channel fed by hotplug forwarder threads and authorization worker threads.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use crate::auth::{self, AuthCompletion, AuthEngine};
use crate::device::{Device, Status};
use crate::error::{ManagerError, UdevError};
use crate::ipc::{Event, Sink};
use crate::monitor::{Action, KernelMonitor, Monitor};
use crate::store::{self, Store};
use crate::sysfs::{self, Kind};
use crate::topology;

enum ManagerEvent {
    Hotplug { action: Action, device: udev::Device },
    KernelHotplug { action: Action, device: udev::Device },
    AuthDone(AuthCompletion),
}

/// Owns the device table and drives it from hotplug and authorization events.
pub struct Manager {
    devices: Vec<Device>,
    store: Box<dyn Store>,
    sink: Box<dyn Sink>,
    auth: AuthEngine,
    tx: Sender<ManagerEvent>,
    rx: Receiver<ManagerEvent>,
}

impl Manager {
    pub fn new(store: Box<dyn Store>, sink: Box<dyn Sink>) -> Self {
        let (tx, rx) = mpsc::channel();
        let (auth_tx, auth_rx) = mpsc::channel::<AuthCompletion>();

        // Relays authorization outcomes onto the main channel so the dispatch loop only ever
        // reads from one place.
        let relay_tx = tx.clone();
        thread::spawn(move || {
            while let Ok(completion) = auth_rx.recv() {
                if relay_tx.send(ManagerEvent::AuthDone(completion)).is_err() {
                    break;
                }
            }
        });

        Manager {
            devices: Vec::new(),
            store,
            sink,
            auth: AuthEngine::new(auth_tx),
            tx,
            rx,
        }
    }

    fn find_index(&self, uid: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.uid() == uid)
    }

    /// Step 2 and 3 of the startup sequence: load persisted records, then reconcile against what
    /// sysfs currently reports present.
    pub fn bootstrap(&mut self) -> Result<(), ManagerError> {
        for dev in store::load_all(self.store.as_ref())? {
            self.devices.push(dev);
        }

        let mut enumerator = udev::Enumerator::new().map_err(UdevError::Io)?;
        enumerator.match_subsystem("thunderbolt").map_err(UdevError::Io)?;

        for dev in enumerator.scan_devices().map_err(UdevError::Io)? {
            self.handle_presence(&dev);
        }

        Ok(())
    }

    /// Step 4 onward: services hotplug and authorization events until the channel closes (every
    /// sender, including the one `self` holds, has been dropped).
    pub fn run(mut self, monitor: Monitor, kernel_monitor: Option<KernelMonitor>) -> Result<(), ManagerError> {
        self.bootstrap()?;

        let user_tx = self.tx.clone();
        thread::spawn(move || {
            let mut monitor = monitor;
            loop {
                match monitor.poll(None) {
                    Ok(true) => {
                        for event in monitor.iter_mut() {
                            if user_tx
                                .send(ManagerEvent::Hotplug { action: event.action, device: event.device })
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    Ok(false) => continue,
                    Err(err) => {
                        log::error!("user hotplug monitor: poll failed: {err}");
                        return;
                    }
                }
            }
        });

        if let Some(mut km) = kernel_monitor {
            let kernel_tx = self.tx.clone();
            thread::spawn(move || loop {
                match km.poll(None) {
                    Ok(true) => {
                        for (action, device) in km.iter_mut() {
                            if kernel_tx.send(ManagerEvent::KernelHotplug { action, device }).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(false) => continue,
                    Err(err) => {
                        log::error!("kernel hotplug monitor: poll failed: {err}");
                        return;
                    }
                }
            });
        }

        while let Ok(event) = self.rx.recv() {
            match event {
                ManagerEvent::Hotplug { action: Action::Add, device }
                | ManagerEvent::Hotplug { action: Action::Change, device } => {
                    self.handle_presence(&device);
                }
                ManagerEvent::Hotplug { action: Action::Remove, device } => {
                    self.handle_remove(&device);
                }
                ManagerEvent::KernelHotplug { action, device } => {
                    log::debug!("kernel stream: {action} {}", device.syspath().display());
                }
                ManagerEvent::AuthDone(completion) => self.handle_auth_done(completion),
            }
        }

        Ok(())
    }

    /// Real add/change entry point: probes sysfs for the device's current snapshot and hands it
    /// to the (fully testable) presence-dispatch logic. Domain controllers have no `unique_id`
    /// and are filtered here.
    fn handle_presence(&mut self, dev: &udev::Device) {
        if sysfs::classify(dev) == Kind::Domain {
            return;
        }

        let Some(uid) = sysfs::read_uid(dev) else {
            return;
        };

        match Device::new_for_udev(uid.clone(), dev) {
            Ok(probe) => self.dispatch_present(probe),
            Err(err) => log::warn!("[{uid}] failed to read sysfs snapshot: {err}"),
        }
    }

    /// Real remove entry point: domain nodes are skipped, everything else is looked up by
    /// syspath (its `unique_id` attribute may no longer be readable by the time "remove" fires).
    fn handle_remove(&mut self, dev: &udev::Device) {
        let syspath = dev.syspath();

        if syspath
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("domain"))
        {
            return;
        }

        let idx = self
            .devices
            .iter()
            .position(|d| d.syspath().map(|p| p.as_path()) == Some(syspath));

        if let Some(idx) = idx {
            let uid = self.devices[idx].uid().to_string();
            self.dispatch_removed(&uid);
        }
    }

    /// `added`/`attached`/`changed` classification from §4.6, operating purely on an
    /// already-probed snapshot. No udev access from here down, which is what makes this path
    /// unit-testable with synthetic `Device` values.
    fn dispatch_present(&mut self, probe: Device) {
        match self.find_index(probe.uid()) {
            None => self.on_added(probe),
            Some(idx) => {
                let was_disconnected = self.devices[idx].status() == Status::Disconnected;
                let was_authorized = self.devices[idx].status().is_authorized();

                self.devices[idx].merge_connected(&probe);
                self.sink.emit(Event::Changed(&self.devices[idx]));
                self.persist(idx);

                let uid = probe.uid().to_string();
                if was_disconnected {
                    self.try_authorize(&uid);
                } else if !was_authorized && self.devices[idx].status().is_authorized() {
                    self.cascade_children(&uid);
                }
            }
        }
    }

    fn on_added(&mut self, mut device: Device) {
        if device.status() != Status::Disconnected {
            let path = self.sink.export(&device);
            device.set_object_path(Some(path));
        }

        let uid = device.uid().to_string();
        self.devices.push(device);

        let idx = self.devices.len() - 1;
        self.sink.emit(Event::Added(&self.devices[idx]));

        self.try_authorize(&uid);
    }

    fn dispatch_removed(&mut self, uid: &str) {
        let Some(idx) = self.find_index(uid) else { return };

        if self.devices[idx].stored() {
            self.devices[idx].disconnected();
            self.sink.emit(Event::Changed(&self.devices[idx]));
            self.persist(idx);
        } else {
            let removed = self.devices.remove(idx);
            self.sink.emit(Event::Removed(&removed));
            self.sink.unexport(&removed);
        }
    }

    fn handle_auth_done(&mut self, completion: AuthCompletion) {
        let Some(idx) = self.find_index(&completion.uid) else { return };

        match completion.result {
            Ok(status) => {
                self.devices[idx].set_authorized_status(status);
                self.sink.emit(Event::Changed(&self.devices[idx]));
                self.persist(idx);
                self.cascade_children(&completion.uid);
            }
            Err(err) => {
                log::warn!("[{}] authorization failed: {err}", completion.uid);
                self.devices[idx].set_authorized_status(Status::AuthError);
                self.sink.emit(Event::Changed(&self.devices[idx]));
            }
        }
    }

    fn try_authorize(&mut self, uid: &str) {
        let Some(idx) = self.find_index(uid) else { return };

        if auth::is_eligible(&self.devices[idx], &self.devices) {
            self.auth.submit(self.devices[idx].clone());
        }
    }

    fn cascade_children(&mut self, parent_uid: &str) {
        let Some(idx) = self.find_index(parent_uid) else { return };
        let parent = self.devices[idx].clone();

        let child_uids: Vec<String> = topology::children_of(&parent, &self.devices)
            .into_iter()
            .map(|d| d.uid().to_string())
            .collect();

        for uid in child_uids {
            self.try_authorize(&uid);
        }
    }

    fn persist(&self, idx: usize) {
        let device = &self.devices[idx];
        if device.stored() {
            if let Err(err) = self.store.put(device) {
                log::warn!("[{}] failed to persist record: {err}", device.uid());
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn devices_for_test(&self) -> &[Device] {
        &self.devices
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::Policy;
    use crate::error::StoreError;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    struct FakeStore {
        records: RefCell<HashMap<String, Device>>,
    }

    impl FakeStore {
        fn new() -> Self {
            FakeStore { records: RefCell::new(HashMap::new()) }
        }

        fn seed(&self, device: Device) {
            self.records.borrow_mut().insert(device.uid().to_string(), device);
        }
    }

    impl Store for FakeStore {
        fn list_uids(&self) -> Result<Vec<String>, StoreError> {
            Ok(self.records.borrow().keys().cloned().collect())
        }

        fn get(&self, uid: &str) -> Result<Device, StoreError> {
            self.records
                .borrow()
                .get(uid)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(uid.to_string()))
        }

        fn put(&self, device: &Device) -> Result<(), StoreError> {
            self.records.borrow_mut().insert(device.uid().to_string(), device.clone());
            Ok(())
        }

        fn delete(&self, uid: &str) -> Result<(), StoreError> {
            self.records.borrow_mut().remove(uid);
            Ok(())
        }
    }

    struct FakeSink {
        emitted: Rc<RefCell<Vec<String>>>,
    }

    impl FakeSink {
        fn new() -> Self {
            FakeSink { emitted: Rc::new(RefCell::new(Vec::new())) }
        }

        fn with_log() -> (Self, Rc<RefCell<Vec<String>>>) {
            let sink = Self::new();
            let log = Rc::clone(&sink.emitted);
            (sink, log)
        }
    }

    impl Sink for FakeSink {
        fn export(&self, device: &Device) -> String {
            let path = format!("/fake/{}", device.uid());
            self.emitted.borrow_mut().push(format!("export:{path}"));
            path
        }

        fn unexport(&self, device: &Device) {
            self.emitted.borrow_mut().push(format!("unexport:{}", device.uid()));
        }

        fn emit(&self, event: Event) {
            let line = match event {
                Event::Added(device) => format!("added:{}", device.uid()),
                Event::Removed(device) => format!("removed:{}", device.uid()),
                Event::Changed(device) => format!("changed:{}:{}", device.uid(), device.status()),
            };
            self.emitted.borrow_mut().push(line);
        }
    }

    fn manager() -> Manager {
        Manager::new(Box::new(FakeStore::new()), Box::new(FakeSink::new()))
    }

    fn manager_with_sink_log() -> (Manager, Rc<RefCell<Vec<String>>>) {
        let (sink, log) = FakeSink::with_log();
        (Manager::new(Box::new(FakeStore::new()), Box::new(sink)), log)
    }

    fn probe_device(uid: &str, kind: Kind, syspath: &str, authorized: bool) -> Device {
        let mut d = Device::from_store(uid.to_string(), String::from("n"), String::from("v"), Policy::Default, None);
        d.set_syspath_for_test(syspath);
        d.set_kind_for_test(kind);
        if authorized {
            d.set_authorized_status(Status::AuthConnected);
        }
        d
    }

    #[test]
    fn unknown_device_is_added_and_exported() {
        let mut mgr = manager();
        let probe = probe_device("new-uid", Kind::Peripheral, "/sys/d0/0-0", false);

        mgr.dispatch_present(probe);

        assert_eq!(mgr.devices_for_test().len(), 1);
        assert_eq!(mgr.devices_for_test()[0].uid(), "new-uid");
    }

    #[test]
    fn stored_manual_device_reattaching_is_not_auto_authorized() {
        let mut mgr = manager();
        let mut stored = Device::from_store(String::from("uid-m"), String::from("n"), String::from("v"), Policy::Manual, None);
        stored.set_stored(true);
        mgr.devices.push(stored.clone());

        let probe = probe_device("uid-m", Kind::Peripheral, "/sys/d0/0-0", false);
        mgr.dispatch_present(probe);

        let dev = &mgr.devices_for_test()[0];
        assert_eq!(dev.policy(), Policy::Manual);
        assert!(!dev.status().is_authorized());
    }

    #[test]
    fn stored_auto_device_reattaching_is_authorization_eligible() {
        let mut mgr = manager();
        let mut stored = Device::from_store(String::from("uid-a"), String::from("n"), String::from("v"), Policy::Auto, None);
        stored.set_stored(true);
        mgr.devices.push(stored);

        let probe = probe_device("uid-a", Kind::Peripheral, "/sys/d0/0-0", false);
        assert!(mgr.devices_for_test()[0].status() == Status::Disconnected);

        mgr.dispatch_present(probe);

        let dev = mgr.devices_for_test()[0].clone();
        assert_eq!(dev.status(), Status::Connected);
        assert!(auth::is_eligible(&dev, mgr.devices_for_test()));
    }

    #[test]
    fn unplugging_stored_device_keeps_record_as_disconnected() {
        let mut mgr = manager();
        let mut stored = probe_device("uid-s", Kind::Peripheral, "/sys/d0/0-0", true);
        stored.set_stored(true);
        mgr.devices.push(stored);

        mgr.dispatch_removed("uid-s");

        assert_eq!(mgr.devices_for_test().len(), 1);
        assert_eq!(mgr.devices_for_test()[0].status(), Status::Disconnected);
    }

    #[test]
    fn unplugging_unstored_device_removes_it_from_the_table() {
        let mut mgr = manager();
        let mut transient = probe_device("uid-t", Kind::Peripheral, "/sys/d0/0-0", true);
        transient.set_stored(false);
        mgr.devices.push(transient);

        mgr.dispatch_removed("uid-t");

        assert!(mgr.devices_for_test().is_empty());
    }

    #[test]
    fn child_is_authorized_only_after_parent_transitions_to_authorized() {
        let mut mgr = manager();

        let mut host = probe_device("host0", Kind::Host, "/sys/d0/0-0", false);
        host.set_policy(Policy::Auto);
        mgr.devices.push(host);

        let mut parent = probe_device("parent0", Kind::Peripheral, "/sys/d0/0-0/0-1", false);
        parent.set_policy(Policy::Auto);
        mgr.devices.push(parent);

        let mut child = probe_device("child0", Kind::Peripheral, "/sys/d0/0-0/0-1/0-1", false);
        child.set_policy(Policy::Auto);
        mgr.devices.push(child);

        assert!(!auth::is_eligible(&mgr.devices_for_test()[2], mgr.devices_for_test()));

        mgr.handle_auth_done(AuthCompletion { uid: String::from("parent0"), result: Ok(Status::AuthConnected) });

        assert!(auth::is_eligible(&mgr.devices_for_test()[2], mgr.devices_for_test()));
    }

    #[test]
    fn unknown_device_add_emits_device_added() {
        let (mut mgr, log) = manager_with_sink_log();
        let probe = probe_device("new-uid", Kind::Peripheral, "/sys/d0/0-0", false);

        mgr.dispatch_present(probe);

        assert!(log.borrow().iter().any(|l| l == "added:new-uid"));
    }

    #[test]
    fn unplugging_unstored_device_emits_device_removed() {
        let (mut mgr, log) = manager_with_sink_log();
        let mut transient = probe_device("uid-t", Kind::Peripheral, "/sys/d0/0-0", true);
        transient.set_stored(false);
        mgr.devices.push(transient);

        mgr.dispatch_removed("uid-t");

        assert!(log.borrow().iter().any(|l| l == "removed:uid-t"));
    }

    #[test]
    fn unplugging_stored_device_does_not_emit_device_removed() {
        let (mut mgr, log) = manager_with_sink_log();
        let mut stored = probe_device("uid-s", Kind::Peripheral, "/sys/d0/0-0", true);
        stored.set_stored(true);
        mgr.devices.push(stored);

        mgr.dispatch_removed("uid-s");

        assert!(!log.borrow().iter().any(|l| l.starts_with("removed:")));
    }
}
