use chrono::Local;
use serde::Deserialize;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

/// Alert severities, ordered from least to most urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiver for operator-facing notifications
pub trait AlertSink {
    fn alert(&self, message: &str, severity: Severity);
}

/// Emits alerts as tracing events
pub struct LogSink;

impl AlertSink for LogSink {
    fn alert(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Info => tracing::info!(alert = true, "{}", message),
            Severity::Warning => tracing::warn!(alert = true, "{}", message),
            Severity::Error | Severity::Critical => {
                tracing::error!(alert = true, severity = severity.as_str(), "{}", message)
            }
        }
    }
}

/// Appends alerts at or above `min_severity` to a file
pub struct FileSink {
    path: PathBuf,
    min_severity: Severity,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>, min_severity: Severity) -> Self {
        Self {
            path: path.into(),
            min_severity,
        }
    }
}

impl AlertSink for FileSink {
    fn alert(&self, message: &str, severity: Severity) {
        if severity < self.min_severity {
            return;
        }

        let line = format!(
            "{} [{}] - {}\n",
            Local::now().format("%d-%b-%y %H:%M:%S"),
            severity,
            message
        );

        // Alert delivery is best effort; the log still carries the message
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = written {
            tracing::warn!("Failed to append alert to {}: {}", self.path.display(), e);
        }
    }
}

/// Forwards every alert to each inner sink
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn AlertSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl AlertSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl AlertSink for FanoutSink {
    fn alert(&self, message: &str, severity: Severity) {
        for sink in &self.sinks {
            sink.alert(message, severity);
        }
    }
}

#[cfg(test)]
pub mod recording {
    use super::*;
    use std::sync::Mutex;

    /// Keeps every alert for later assertions
    #[derive(Default)]
    pub struct RecordingSink {
        pub alerts: Mutex<Vec<(String, Severity)>>,
    }

    impl RecordingSink {
        pub fn severities(&self) -> Vec<Severity> {
            self.alerts.lock().unwrap().iter().map(|(_, s)| *s).collect()
        }

        pub fn last(&self) -> Option<(String, Severity)> {
            self.alerts.lock().unwrap().last().cloned()
        }
    }

    impl AlertSink for RecordingSink {
        fn alert(&self, message: &str, severity: Severity) {
            self.alerts
                .lock()
                .unwrap()
                .push((message.to_string(), severity));
        }
    }
}
