// Thunderbolt/USB4 authorization daemon
//
// Copyright (C) 2023, Intel Corporation
// Author: Mika Westerberg <mika.westerberg@linux.intel.com>

// Abstract persistence for device policy records, plus a JSON-file-backed implementation.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::device::{Device, Policy};
use crate::error::StoreError;

/// On-disk shape of a persisted device record: identity and policy, nothing transient.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Record {
    pub uid: String,
    pub name: String,
    pub vendor: String,
    pub policy: Policy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl Record {
    pub fn from_device(dev: &Device) -> Self {
        Record {
            uid: dev.uid().to_string(),
            name: dev.name().to_string(),
            vendor: dev.vendor().to_string(),
            policy: dev.policy(),
            key: dev.key().map(String::from),
        }
    }

    pub fn into_device(self) -> Device {
        Device::from_store(self.uid, self.name, self.vendor, self.policy, self.key)
    }
}

/// Persistence contract the manager relies on. Addressed by uid; format is opaque to callers.
pub trait Store {
    fn list_uids(&self) -> Result<Vec<String>, StoreError>;
    fn get(&self, uid: &str) -> Result<Device, StoreError>;
    fn put(&self, device: &Device) -> Result<(), StoreError>;
    fn delete(&self, uid: &str) -> Result<(), StoreError>;
}

/// One JSON file per uid, in a directory supplied at construction time.
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    /// Opens (creating if necessary) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(JsonStore { dir })
    }

    fn path_for(&self, uid: &str) -> PathBuf {
        self.dir.join(format!("{uid}.json"))
    }
}

impl Store for JsonStore {
    fn list_uids(&self) -> Result<Vec<String>, StoreError> {
        let mut uids = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                uids.push(stem.to_string());
            }
        }

        Ok(uids)
    }

    fn get(&self, uid: &str) -> Result<Device, StoreError> {
        let path = self.path_for(uid);

        let data = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                StoreError::NotFound(uid.to_string())
            } else {
                StoreError::Io(e)
            }
        })?;

        let record: Record = serde_json::from_str(&data)
            .map_err(|e| StoreError::Corrupt(uid.to_string(), e.to_string()))?;

        if record.uid != uid {
            return Err(StoreError::Corrupt(
                uid.to_string(),
                format!("uid mismatch: record claims '{}'", record.uid),
            ));
        }

        Ok(record.into_device())
    }

    fn put(&self, device: &Device) -> Result<(), StoreError> {
        let record = Record::from_device(device);
        let data = serde_json::to_string_pretty(&record)
            .map_err(|e| StoreError::Corrupt(record.uid.clone(), e.to_string()))?;

        let path = self.path_for(&record.uid);
        let tmp = path.with_extension("json.tmp");

        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;

        Ok(())
    }

    fn delete(&self, uid: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(uid)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

/// Reads every record in `dir`, skipping (and returning separately) the ones that fail to parse.
/// Used at startup so a single corrupt record doesn't abort the daemon.
pub fn load_all(store: &dyn Store) -> Result<Vec<Device>, StoreError> {
    let uids = store.list_uids()?;
    let mut devices = Vec::with_capacity(uids.len());

    for uid in uids {
        match store.get(&uid) {
            Ok(dev) => devices.push(dev),
            Err(err) => {
                log::warn!("[{uid}] failed to load from store: {err}");
            }
        }
    }

    Ok(devices)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::Policy;

    #[test]
    fn put_then_get_round_trips_persisted_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();

        let mut dev = Device::from_store(
            String::from("uid-a"),
            String::from("Widget"),
            String::from("Acme"),
            Policy::Default,
            None,
        );
        dev.set_policy(Policy::Auto);
        dev.set_key(Some(String::from("deadbeef")));

        store.put(&dev).unwrap();

        let loaded = store.get("uid-a").unwrap();
        assert_eq!(loaded.uid(), "uid-a");
        assert_eq!(loaded.name(), "Widget");
        assert_eq!(loaded.vendor(), "Acme");
        assert_eq!(loaded.policy(), Policy::Auto);
        assert_eq!(loaded.key(), Some("deadbeef"));
        assert_eq!(loaded.status(), crate::device::Status::Disconnected);
    }

    #[test]
    fn get_missing_uid_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();

        match store.get("nope") {
            Err(StoreError::NotFound(uid)) => assert_eq!(uid, "nope"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn corrupt_record_is_skipped_during_load_all() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();

        fs::write(dir.path().join("good.json"), r#"{"uid":"good","name":"A","vendor":"B","policy":"Default"}"#).unwrap();
        fs::write(dir.path().join("bad.json"), "not json").unwrap();

        let devices = load_all(&store).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].uid(), "good");
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        store.delete("never-existed").unwrap();
    }
}
