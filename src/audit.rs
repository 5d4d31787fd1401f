//! Append-only operational audit: daily-rotated plain-text log with
//! category tags, plus a daily CSV of replicated trades.
//!
//! Separate from `tracing` diagnostics on purpose: these files are the
//! human-readable record the dashboard links to, rotated by date in the
//! file name rather than by a rolling appender.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditCategory {
    Boot,
    Shutdown,
    Crash,
    Trade,
    Close,
    Lifecycle,
    Api,
    Engine,
    Ledger,
    Error,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::Boot => "BOOT",
            AuditCategory::Shutdown => "SHUTDOWN",
            AuditCategory::Crash => "CRASH",
            AuditCategory::Trade => "TRADE",
            AuditCategory::Close => "CLOSE",
            AuditCategory::Lifecycle => "LIFECYCLE",
            AuditCategory::Api => "API",
            AuditCategory::Engine => "ENGINE",
            AuditCategory::Ledger => "LEDGER",
            AuditCategory::Error => "ERROR",
        }
    }
}

/// One row of the daily trade CSV.
#[derive(Debug, Clone)]
pub struct TradeCsvRow {
    pub profile_address: String,
    pub market_question: String,
    pub side: String,
    pub size: f64,
    pub price: f64,
    pub intent: String,
}

pub struct AuditLog {
    dir: PathBuf,
    // Serializes appends; files themselves are opened per write.
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %e, "audit dir creation failed");
        }
        Self {
            dir,
            write_lock: Mutex::new(()),
        }
    }

    /// Append one tagged line to today's log file.
    pub fn log(&self, category: AuditCategory, message: &str) {
        let now = Utc::now();
        let line = format!(
            "[{}] [{}] {}\n",
            now.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            category.as_str(),
            message
        );
        let path = self.dir.join(format!("bot_{}.txt", now.format("%Y-%m-%d")));

        let _guard = self.write_lock.lock();
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "audit append failed");
        }
    }

    /// Append one trade to today's CSV, writing the header on first use.
    pub fn log_trade(&self, row: &TradeCsvRow) {
        let now = Utc::now();
        let path = self
            .dir
            .join(format!("trades_{}.csv", now.format("%Y-%m-%d")));

        let _guard = self.write_lock.lock();
        let fresh = !path.exists();
        let file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "trade csv open failed");
                return;
            }
        };

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if fresh {
            let _ = writer.write_record([
                "timestamp",
                "profileAddress",
                "marketQuestion",
                "side",
                "size",
                "price",
                "intent",
            ]);
        }
        let record = [
            now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            row.profile_address.clone(),
            row.market_question.clone(),
            row.side.clone(),
            format!("{:.4}", row.size),
            format!("{:.3}", row.price),
            row.intent.clone(),
        ];
        if writer.write_record(&record).is_err() || writer.flush().is_err() {
            warn!(path = %path.display(), "trade csv append failed");
        }
    }
}
