use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::json_file::{self, StoreError};

/// Evidence that a user was over its IP limit in at least one past cycle.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DetectionRecord {
    pub(crate) user: String,
    pub(crate) ips: BTreeSet<String>,
    pub(crate) out_of_limit_count: u32,
}

impl DetectionRecord {
    pub(crate) fn first(user: &str, ips: BTreeSet<String>) -> Self {
        Self {
            user: user.to_owned(),
            ips,
            out_of_limit_count: 1,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct DetectionFile {
    #[serde(rename = "detectedUsers", default)]
    detected_users: Vec<DetectionRecord>,
}

/// Durable username -> [`DetectionRecord`] map.
///
/// Every mutation is written through to disk while the lock is held, so
/// concurrent callers never interleave a read-modify-write of the file. A
/// mutation only shows up in memory once its write succeeded.
#[derive(Debug)]
pub(crate) struct DetectionStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, DetectionRecord>>,
}

impl DetectionStore {
    #[instrument]
    pub(crate) async fn open(path: &Path) -> Result<Self, StoreError> {
        let file: DetectionFile = json_file::load_or_create(path).await?;

        let mut records = BTreeMap::new();
        for record in file.detected_users {
            if record.out_of_limit_count == 0 {
                return Err(StoreError::corrupt(
                    path,
                    format!("user {:?} has an outOfLimitCount of 0", record.user),
                ));
            }

            if records.contains_key(&record.user) {
                return Err(StoreError::corrupt(
                    path,
                    format!("user {:?} appears more than once", record.user),
                ));
            }

            records.insert(record.user.clone(), record);
        }

        debug!(count = records.len(), "Loaded detection records");

        Ok(Self {
            path: path.to_path_buf(),
            records: Mutex::new(records),
        })
    }

    pub(crate) async fn get(&self, user: &str) -> Option<DetectionRecord> {
        self.records.lock().await.get(user).cloned()
    }

    pub(crate) async fn put(&self, record: DetectionRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let mut updated = records.clone();
        updated.insert(record.user.clone(), record);
        self.persist(&updated).await?;
        *records = updated;
        Ok(())
    }

    /// Returns whether a record existed.
    pub(crate) async fn delete(&self, user: &str) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        if !records.contains_key(user) {
            return Ok(false);
        }
        let mut updated = records.clone();
        updated.remove(user);
        self.persist(&updated).await?;
        *records = updated;
        Ok(true)
    }

    pub(crate) async fn list(&self) -> Vec<DetectionRecord> {
        self.records.lock().await.values().cloned().collect()
    }

    async fn persist(&self, records: &BTreeMap<String, DetectionRecord>) -> Result<(), StoreError> {
        let file = DetectionFile {
            detected_users: records.values().cloned().collect(),
        };
        json_file::persist(&self.path, &file).await
    }
}
