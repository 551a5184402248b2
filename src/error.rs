// Thunderbolt/USB4 authorization daemon
//
// Copyright (C) 2023, Intel Corporation
// Author: Mika Westerberg <mika.westerberg@linux.intel.com>

// Error types for the device manager core.

use std::io;

use thiserror::Error;

/// Failures while talking to udev/sysfs.
#[derive(Debug, Error)]
pub enum UdevError {
    #[error("udev: could not subscribe to '{0}' events: {1}")]
    Subscribe(&'static str, io::Error),

    #[error("udev: could not read required attribute '{attr}' for {syspath}")]
    MissingAttribute { attr: &'static str, syspath: String },

    #[error("udev: {0}")]
    Io(#[from] io::Error),
}

/// Failures from the persistence backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no stored record for uid '{0}'")]
    NotFound(String),

    #[error("stored record for uid '{0}' is corrupt: {1}")]
    Corrupt(String, String),

    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Kernel rejected (or could not be asked to perform) authorization.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("device is not eligible for authorization")]
    NotEligible,

    #[error("kernel rejected authorization write: {0}")]
    KernelRejected(io::Error),
}

/// Parent-lookup failures in the topology index.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("device has no syspath recorded")]
    NoSyspath,
}

/// Errors that are allowed to abort the daemon at startup.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Udev(#[from] UdevError),

    #[error("failed to list devices in store: {0}")]
    Store(#[from] StoreError),
}
