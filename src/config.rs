//! Process configuration from the environment.

use std::env;
use std::path::PathBuf;

use anyhow::{bail, Result};

use crate::settings::{SizingMode, TradeSettings};

#[derive(Debug, Clone)]
pub struct Config {
    /// Wallet address of the source account being copied.
    pub profile_address: String,
    pub poll_interval_ms: u64,
    pub port: u16,
    pub expected_edge: f64,
    pub slippage_delay_penalty: Option<f64>,
    pub min_order_size_shares: f64,
    /// True: startup cursor is now; false: now minus ten minutes.
    pub start_from_now: bool,
    pub enable_trade_filters: bool,
    pub skip_active_positions: bool,
    pub debug_logs: bool,
    pub starting_balance: f64,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Seed for the sizing settings file on first run.
    pub default_settings: TradeSettings,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let profile_address = match env::var("PROFILE_ADDRESS") {
            Ok(addr) if !addr.trim().is_empty() => addr.trim().to_string(),
            _ => bail!("PROFILE_ADDRESS is required"),
        };

        let fixed_copy_pct = env_parse("FIXED_COPY_PCT", 0.10_f64);
        let fixed_amount_usd = env_parse("FIXED_AMOUNT_USD", 10.0_f64);
        let mode = match env::var("TRADE_SIZE_MODE").as_deref() {
            Ok("FIXED") | Ok("fixed") => SizingMode::Fixed,
            _ => SizingMode::Percentage,
        };

        Ok(Self {
            profile_address,
            poll_interval_ms: env_parse("POLL_INTERVAL_MS", 1000_u64),
            port: env_parse("PORT", 3000_u16),
            expected_edge: env_parse("EXPECTED_EDGE", 0.06_f64),
            slippage_delay_penalty: env::var("SLIPPAGE_DELAY_PENALTY")
                .ok()
                .and_then(|v| v.parse::<f64>().ok()),
            min_order_size_shares: env_parse("MIN_ORDER_SIZE_SHARES", 1.0_f64),
            start_from_now: env_bool("START_FROM_NOW", true),
            enable_trade_filters: env_bool("ENABLE_TRADE_FILTERS", true),
            skip_active_positions: env_bool("SKIP_ACTIVE_POSITIONS", true),
            debug_logs: env_bool("DEBUG_LOGS", false),
            starting_balance: env_parse("STARTING_BALANCE", 1000.0_f64),
            data_dir: PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string())),
            log_dir: PathBuf::from(env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string())),
            default_settings: TradeSettings {
                mode,
                percentage: fixed_copy_pct,
                fixed_amount_usd,
            },
        })
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger.json")
    }

    pub fn blacklist_path(&self) -> PathBuf {
        self.data_dir.join("positions_log.json")
    }

    pub fn settings_path(&self) -> PathBuf {
        PathBuf::from("trade_settings.json")
    }
}
