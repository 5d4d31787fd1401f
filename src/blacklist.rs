//! Blacklist of market ids the engine must not copy.
//!
//! Seeded at startup from the source account's live holdings: markets the
//! real account already participates in are off limits, unless the paper
//! ledger itself already holds a position there (scale-in stays allowed;
//! the engine checks that exception before consulting this filter).

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::{info, warn};

pub struct PositionFilter {
    path: PathBuf,
    set: Mutex<HashSet<String>>,
}

impl PositionFilter {
    /// Load the persisted set; unreadable starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let set = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(ids) => ids.into_iter().collect(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "blacklist unreadable, starting empty");
                    HashSet::new()
                }
            },
            Err(_) => HashSet::new(),
        };
        Self {
            path,
            set: Mutex::new(set),
        }
    }

    /// Replace the set with the markets observed at startup.
    pub fn initialize(&self, market_ids: Vec<String>) {
        let json = {
            let mut set = self.set.lock();
            *set = market_ids.into_iter().collect();
            info!(count = set.len(), "blacklist initialized");
            serde_json::to_string_pretty(&set.iter().collect::<Vec<_>>()).unwrap_or_default()
        };
        self.persist(json);
    }

    pub fn is_blacklisted(&self, market_id: &str) -> bool {
        self.set.lock().contains(market_id)
    }

    pub fn len(&self) -> usize {
        self.set.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.lock().is_empty()
    }

    fn persist(&self, json: String) {
        if json.is_empty() {
            return;
        }
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let tmp = self.path.with_extension("tmp");
        if fs::write(&tmp, &json)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .is_err()
        {
            warn!(path = %self.path.display(), "blacklist persist failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn initialize_and_membership() {
        let dir = TempDir::new().unwrap();
        let f = PositionFilter::open(dir.path().join("positions_log.json"));
        assert!(f.is_empty());
        f.initialize(vec!["m1".into(), "m2".into()]);
        assert!(f.is_blacklisted("m1"));
        assert!(!f.is_blacklisted("m3"));
    }

    #[test]
    fn survives_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("positions_log.json");
        PositionFilter::open(&path).initialize(vec!["m1".into()]);
        let reloaded = PositionFilter::open(&path);
        assert!(reloaded.is_blacklisted("m1"));
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("positions_log.json");
        fs::write(&path, "{{{").unwrap();
        assert!(PositionFilter::open(&path).is_empty());
    }
}
