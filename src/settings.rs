//! Trade-sizing settings, persisted separately from the ledger so the
//! dashboard can change them without touching position state.

use std::fs;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// How replicated trades are sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SizingMode {
    /// Scale the source's share count by a fixed fraction.
    Percentage,
    /// Spend a fixed USD amount per copy.
    Fixed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeSettings {
    pub mode: SizingMode,
    pub percentage: f64,
    pub fixed_amount_usd: f64,
}

impl Default for TradeSettings {
    fn default() -> Self {
        Self {
            mode: SizingMode::Percentage,
            percentage: 0.10,
            fixed_amount_usd: 10.0,
        }
    }
}

/// Partial update from the dashboard.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeSettingsPatch {
    pub mode: Option<SizingMode>,
    pub percentage: Option<f64>,
    pub fixed_amount_usd: Option<f64>,
}

pub struct SettingsStore {
    path: PathBuf,
    state: Mutex<TradeSettings>,
}

impl SettingsStore {
    /// Load persisted settings, falling back to `defaults` when the file is
    /// absent or unreadable.
    pub fn open(path: impl Into<PathBuf>, defaults: TradeSettings) -> Self {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<TradeSettings>(&raw) {
                Ok(s) => s,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "settings unreadable, using defaults");
                    defaults
                }
            },
            Err(_) => defaults,
        };
        let store = Self {
            path,
            state: Mutex::new(state),
        };
        store.persist();
        store
    }

    pub fn get(&self) -> TradeSettings {
        *self.state.lock()
    }

    /// Apply a patch; invalid values are ignored field-by-field.
    pub fn patch(&self, patch: TradeSettingsPatch) -> TradeSettings {
        let updated = {
            let mut state = self.state.lock();
            if let Some(mode) = patch.mode {
                state.mode = mode;
            }
            if let Some(pct) = patch.percentage {
                if pct > 0.0 && pct <= 1.0 {
                    state.percentage = pct;
                }
            }
            if let Some(usd) = patch.fixed_amount_usd {
                if usd > 0.0 {
                    state.fixed_amount_usd = usd;
                }
            }
            *state
        };
        self.persist();
        updated
    }

    fn persist(&self) {
        let json = match serde_json::to_string_pretty(&*self.state.lock()) {
            Ok(j) => j,
            Err(_) => return,
        };
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let tmp = self.path.with_extension("tmp");
        if fs::write(&tmp, &json)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .is_err()
        {
            warn!(path = %self.path.display(), "settings persist failed");
        }
    }
}
