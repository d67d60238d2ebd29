//! Per-peer error statistics.
//!
//! Each connection keeps one [`ErrorStat`] per [`ErrorClass`]: a running
//! count, the newest few messages, and an exponential moving average of the
//! time between occurrences.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Number of recent errors remembered per class.
pub const RECENT_LIMIT: usize = 10;

/// A larger divisor makes for a slower-changing running mean.
pub const ERROR_DECAY_DIVISOR: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Refused,
    Reset,
    Unresolved,
    TimedOut,
    Other,
}

impl ErrorClass {
    pub fn classify(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::ConnectionRefused => ErrorClass::Refused,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ErrorClass::Reset,
            io::ErrorKind::TimedOut => ErrorClass::TimedOut,
            _ => ErrorClass::Other,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorClass::Refused => "refused",
            ErrorClass::Reset => "reset",
            ErrorClass::Unresolved => "unresolved",
            ErrorClass::TimedOut => "timed_out",
            ErrorClass::Other => "other",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecentError {
    /// Wall-clock microseconds.
    pub time: u64,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorStat {
    pub count: u64,
    /// Wall-clock microseconds of the newest error, 0 before the first.
    pub last_time: u64,
    /// Running mean of microseconds between errors.
    pub interval: u64,
    /// Newest first.
    pub recent: VecDeque<RecentError>,
}

impl ErrorStat {
    pub fn record_at(&mut self, message: impl Into<String>, now: u64) {
        if self.recent.len() >= RECENT_LIMIT {
            self.recent.pop_back();
        }
        self.recent.push_front(RecentError {
            time: now,
            message: message.into(),
        });

        if self.last_time > 0 {
            // True mean while samples are few, fixed-window EMA afterwards.
            let divisor = self.count.min(ERROR_DECAY_DIVISOR) as f64;
            let elapsed = now.saturating_sub(self.last_time) as f64;
            let interval = self.interval as f64;
            self.interval = (interval + ((elapsed - interval) / divisor).round()).max(0.0) as u64;
        }

        self.count += 1;
        self.last_time = now;
    }

    /// Errors per second, or 0 until two errors have been seen.
    pub fn frequency(&self) -> f64 {
        if self.interval == 0 {
            return 0.0;
        }
        1e6 / self.interval as f64
    }
}

/// All error classes observed on one connection.
#[derive(Debug, Clone, Default)]
pub struct ErrorTracker {
    stats: BTreeMap<ErrorClass, ErrorStat>,
}

impl ErrorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, class: ErrorClass, message: impl Into<String>) {
        self.record_at(class, message, now_micros());
    }

    pub fn record_at(&mut self, class: ErrorClass, message: impl Into<String>, now: u64) {
        self.stats.entry(class).or_default().record_at(message, now);
    }

    pub fn get(&self, class: ErrorClass) -> Option<&ErrorStat> {
        self.stats.get(&class)
    }

    pub fn total(&self) -> u64 {
        self.stats.values().map(|stat| stat.count).sum()
    }

    pub fn summary(&self) -> Vec<ErrorSummary> {
        self.stats
            .iter()
            .map(|(class, stat)| ErrorSummary {
                class: *class,
                count: stat.count,
                frequency: stat.frequency(),
                last_message: stat.recent.front().map(|recent| recent.message.clone()),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub class: ErrorClass,
    pub count: u64,
    pub frequency: f64,
    pub last_message: Option<String>,
}

pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
