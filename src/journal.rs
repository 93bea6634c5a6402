// =============================================================================
// Trade Journal — optional append-only JSONL log of trade records
// =============================================================================
//
// Best-effort: IO failures are logged and never propagate into the trading
// path. Disabled entirely when no path is configured.
// =============================================================================

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::types::TradeRecord;

pub struct TradeJournal {
    path: Option<PathBuf>,
    file: Mutex<Option<std::fs::File>>,
}

impl TradeJournal {
    /// Create a journal at `path`. An empty path disables journaling.
    pub fn new(path: &str) -> Self {
        if path.is_empty() {
            return Self {
                path: None,
                file: Mutex::new(None),
            };
        }

        let path = PathBuf::from(path);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| warn!(path = %path.display(), error = %e, "journal open failed"))
            .ok();

        if file.is_some() {
            info!(path = %path.display(), "trade journal enabled");
        }

        Self {
            path: Some(path),
            file: Mutex::new(file),
        }
    }

    pub fn enabled(&self) -> bool {
        self.path.is_some()
    }

    /// Append one record as a JSON line.
    pub fn append(&self, record: &TradeRecord) {
        let mut guard = self.file.lock();
        let Some(file) = guard.as_mut() else {
            return;
        };

        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "journal record failed to serialise");
                return;
            }
        };

        if let Err(e) = writeln!(file, "{line}") {
            warn!(error = %e, "journal write failed");
        }
    }
}

impl std::fmt::Debug for TradeJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeJournal")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderSide;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn record() -> TradeRecord {
        TradeRecord {
            id: "t-1".to_string(),
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            qty: dec!(10),
            price: dec!(100),
            value: dec!(1000),
            ts: Utc::now(),
            realized_pnl: None,
            realized_pnl_pct: None,
            status: "open".to_string(),
        }
    }

    #[test]
    fn disabled_journal_is_a_no_op() {
        let journal = TradeJournal::new("");
        assert!(!journal.enabled());
        journal.append(&record()); // must not panic
    }

    #[test]
    fn appends_one_json_line_per_record() {
        let dir = std::env::temp_dir().join(format!("pulse-journal-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("trades.jsonl");
        let path_str = path.to_str().unwrap();

        let journal = TradeJournal::new(path_str);
        assert!(journal.enabled());
        journal.append(&record());
        journal.append(&record());

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(parsed["symbol"], "AAPL");
        }

        std::fs::remove_dir_all(&dir).ok();
    }
}
