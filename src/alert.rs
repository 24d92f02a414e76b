//! Operator alerts.
//!
//! [`AlertLayer`] watches the log for warnings and errors and keeps the most
//! recent ones so the console can show them on request.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// Alerts kept when no capacity is given.
pub const DEFAULT_CAPACITY: usize = 50;

/// A warning or error seen in the log.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub at: DateTime<Local>,
    pub severity: Severity,
    pub target: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

impl Severity {
    fn from_level(level: Level) -> Option<Self> {
        match level {
            Level::ERROR => Some(Severity::Error),
            Level::WARN => Some(Severity::Warning),
            _ => None,
        }
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(
            f,
            "{} {severity:<7} {}: {}",
            self.at.format("%H:%M:%S"),
            self.target,
            self.message
        )
    }
}

/// Visitor to extract the message and fields from tracing events.
struct MessageVisitor {
    message: Option<String>,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn new() -> Self {
        Self {
            message: None,
            fields: Vec::new(),
        }
    }

    fn finish(self) -> Option<String> {
        let message = self.message?;
        if self.fields.is_empty() {
            Some(message)
        } else {
            Some(format!("{message} ({})", self.fields.join(", ")))
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.push(format!("{}={value}", field.name()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        } else {
            self.fields.push(format!("{}={value:?}", field.name()));
        }
    }
}

/// Shared view of the alerts collected by an [`AlertLayer`].
#[derive(Debug, Clone)]
pub struct AlertLog {
    alerts: Arc<Mutex<VecDeque<Alert>>>,
    capacity: usize,
}

impl AlertLog {
    /// Collected alerts, oldest first.
    pub fn recent(&self) -> Vec<Alert> {
        self.alerts.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.alerts.lock().clear();
    }

    fn push(&self, alert: Alert) {
        let mut alerts = self.alerts.lock();
        if alerts.len() == self.capacity {
            alerts.pop_front();
        }
        alerts.push_back(alert);
    }
}

/// Tracing layer that records warnings and errors.
#[derive(Debug, Clone)]
pub struct AlertLayer {
    log: AlertLog,
}

impl AlertLayer {
    pub fn new(capacity: usize) -> Self {
        Self {
            log: AlertLog {
                alerts: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
                capacity: capacity.max(1),
            },
        }
    }

    pub fn log(&self) -> AlertLog {
        self.log.clone()
    }
}

impl Default for AlertLayer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<S: Subscriber> Layer<S> for AlertLayer {
    fn on_event(&self, event: &Event<'_>, _: Context<'_, S>) {
        let metadata = event.metadata();
        let Some(severity) = Severity::from_level(*metadata.level()) else {
            return;
        };

        let mut visitor = MessageVisitor::new();
        event.record(&mut visitor);

        if let Some(message) = visitor.finish() {
            self.log.push(Alert {
                at: Local::now(),
                severity,
                target: metadata.target().to_string(),
                message,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing::{error, info, warn};
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;

    fn collect(capacity: usize, emit: impl FnOnce()) -> Vec<Alert> {
        let layer = AlertLayer::new(capacity);
        let log = layer.log();
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, emit);
        log.recent()
    }

    #[test]
    fn test_keeps_warnings_and_errors() {
        let alerts = collect(10, || {
            info!("pipeline running");
            warn!(attempt = 3, "restart attempt failed");
            error!("pipeline fault");
        });

        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert_eq!(alerts[0].message, "restart attempt failed (attempt=3)");
        assert_eq!(alerts[1].severity, Severity::Error);
        assert_eq!(alerts[1].message, "pipeline fault");
    }

    #[test]
    fn test_drops_oldest_past_capacity() {
        let alerts = collect(2, || {
            warn!("first");
            warn!("second");
            warn!("third");
        });

        let messages: Vec<&str> = alerts.iter().map(|a| a.message.as_str()).collect();
        assert_eq!(messages, vec!["second", "third"]);
    }

    #[test]
    fn test_display() {
        let alert = Alert {
            at: Local::now(),
            severity: Severity::Error,
            target: "nixon_control::controller".to_string(),
            message: "pipeline fault".to_string(),
        };
        assert!(alert.to_string().ends_with("error   nixon_control::controller: pipeline fault"));
    }
}
