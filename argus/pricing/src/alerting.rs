use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{
    error::{MonitorError, MonitorResult},
    telemetry::MonitorTelemetry,
};

/// Subject line of the accuracy alert.
pub const ACCURACY_SUBJECT: &str = "Your model performance is getting low!";

/// Kind of operator alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Retraining did not bring MAPE back under the threshold.
    Accuracy,
    /// A cycle failed on infrastructure (training, encoder, registry).
    Infrastructure,
}

/// Operator-facing notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMessage {
    /// Alert kind.
    pub kind: AlertKind,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
}

fn percent(fraction: f64) -> String {
    format!("{:.2}%", fraction * 100.0)
}

impl AlertMessage {
    /// Accuracy alert carrying the pre- and post-retrain MAPE and the threshold.
    #[must_use]
    pub fn accuracy(model: &str, new_mape: f64, threshold: f64, old_mape: f64) -> Self {
        let body = format!(
            "This is an automatic message, please do not reply.\n\
             Model {model} was tested against newly observed sales and retrained, \
             but its accuracy is still below the bar. Before retraining its mean \
             absolute percentage error was {old}; after retraining it is {new}, \
             which exceeds the threshold of {limit}.\n\
             Please get in touch with the data team.",
            old = percent(old_mape),
            new = percent(new_mape),
            limit = percent(threshold),
        );
        Self {
            kind: AlertKind::Accuracy,
            subject: ACCURACY_SUBJECT.into(),
            body,
        }
    }

    /// Infrastructure alert for a failed training run.
    #[must_use]
    pub fn training_failure(model: &str, reason: &str) -> Self {
        Self {
            kind: AlertKind::Infrastructure,
            subject: format!("Retraining of {model} failed"),
            body: format!(
                "This is an automatic message, please do not reply.\n\
                 Retraining model {model} failed: {reason}\n\
                 The last training date was left unchanged; the next cycle will retry."
            ),
        }
    }

    /// Infrastructure alert for any other condition that ended a cycle.
    #[must_use]
    pub fn cycle_failure(model: &str, error: &MonitorError) -> Self {
        Self {
            kind: AlertKind::Infrastructure,
            subject: format!("Monitoring cycle for {model} failed"),
            body: format!(
                "This is an automatic message, please do not reply.\n\
                 The monitoring cycle for model {model} stopped: {error}"
            ),
        }
    }
}

/// Delivers operator alerts. Failures are reported once and never retried.
pub trait Notifier: Send + Sync {
    /// Sends `alert`.
    fn notify(&self, alert: &AlertMessage) -> MonitorResult<()>;
}

/// Outbox line consumed by an external mail relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Entry identifier.
    pub id: Uuid,
    /// When the alert was queued.
    pub created_at: DateTime<Utc>,
    /// The alert itself.
    #[serde(flatten)]
    pub alert: AlertMessage,
}

/// Appends alerts as JSON lines to an outbox file.
#[derive(Debug)]
pub struct OutboxNotifier {
    path: PathBuf,
    writer: Mutex<()>,
}

impl OutboxNotifier {
    /// Notifier writing to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
        }
    }

    /// Outbox path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every queued entry; a missing outbox reads as empty.
    pub fn entries(&self) -> MonitorResult<Vec<OutboxEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for line in BufReader::new(File::open(&self.path)?).lines() {
            let line = line?;
            if !line.trim().is_empty() {
                entries.push(serde_json::from_str(&line)?);
            }
        }
        Ok(entries)
    }

    fn append(&self, entry: &OutboxEntry) -> std::io::Result<()> {
        let _guard = self.writer.lock();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(&line)?;
        file.flush()
    }
}

impl Notifier for OutboxNotifier {
    fn notify(&self, alert: &AlertMessage) -> MonitorResult<()> {
        let entry = OutboxEntry {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            alert: alert.clone(),
        };
        self.append(&entry).map_err(|err| MonitorError::AlertDelivery {
            reason: format!("writing outbox {}: {err}", self.path.display()),
        })
    }
}

/// Publishes alerts as `monitoring.alert` events.
#[derive(Debug, Clone)]
pub struct TelemetryNotifier {
    telemetry: MonitorTelemetry,
}

impl TelemetryNotifier {
    /// Notifier publishing through `telemetry`.
    #[must_use]
    pub const fn new(telemetry: MonitorTelemetry) -> Self {
        Self { telemetry }
    }
}

impl Notifier for TelemetryNotifier {
    fn notify(&self, alert: &AlertMessage) -> MonitorResult<()> {
        self.telemetry
            .event_confirmed(
                "monitoring.alert",
                json!({ "kind": alert.kind, "subject": alert.subject, "body": alert.body }),
            )
            .map_err(|err| MonitorError::AlertDelivery {
                reason: err.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_telemetry::{EventPublisher, EventRecord, MemoryEventBus};
    use async_trait::async_trait;
    use std::sync::Arc;
    use tempfile::tempdir;

    struct DownBus;

    #[async_trait]
    impl EventPublisher for DownBus {
        async fn publish(&self, _: EventRecord) -> anyhow::Result<()> {
            anyhow::bail!("bus down")
        }
    }

    #[test]
    fn accuracy_alert_carries_both_figures_and_threshold() {
        let alert = AlertMessage::accuracy("iargus", 0.19, 0.15, 0.30);
        assert_eq!(alert.subject, ACCURACY_SUBJECT);
        assert_eq!(alert.kind, AlertKind::Accuracy);
        assert!(alert.body.contains("30.00%"));
        assert!(alert.body.contains("19.00%"));
        assert!(alert.body.contains("15.00%"));
    }

    #[test]
    fn outbox_appends_entries() {
        let dir = tempdir().unwrap();
        let notifier = OutboxNotifier::new(dir.path().join("alerts/outbox.jsonl"));
        assert!(notifier.entries().unwrap().is_empty());
        notifier
            .notify(&AlertMessage::training_failure("iargus", "loss diverged"))
            .unwrap();
        notifier
            .notify(&AlertMessage::accuracy("iargus", 0.2, 0.15, 0.3))
            .unwrap();
        let entries = notifier.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].alert.kind, AlertKind::Infrastructure);
        assert!(entries[0].alert.body.contains("loss diverged"));
        assert_eq!(entries[1].alert.subject, ACCURACY_SUBJECT);
    }

    #[test]
    fn outbox_failure_is_alert_delivery_error() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let notifier = OutboxNotifier::new(blocker.join("outbox.jsonl"));
        assert!(matches!(
            notifier.notify(&AlertMessage::accuracy("iargus", 0.2, 0.15, 0.3)),
            Err(MonitorError::AlertDelivery { .. })
        ));
    }

    #[test]
    fn telemetry_notifier_publishes_alert_events() {
        let bus = Arc::new(MemoryEventBus::new(4));
        let telemetry = MonitorTelemetry::builder("alerting")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        TelemetryNotifier::new(telemetry)
            .notify(&AlertMessage::accuracy("iargus", 0.2, 0.15, 0.3))
            .unwrap();
        let events = bus.of_type("monitoring.alert");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["kind"], "accuracy");

        let silent = TelemetryNotifier::new(MonitorTelemetry::disabled());
        assert!(silent
            .notify(&AlertMessage::accuracy("iargus", 0.2, 0.15, 0.3))
            .is_err());
    }

    #[test]
    fn telemetry_notifier_reports_bus_failure_inside_a_runtime() {
        let telemetry = MonitorTelemetry::builder("alerting")
            .event_publisher(Arc::new(DownBus))
            .build()
            .unwrap();
        let notifier = TelemetryNotifier::new(telemetry);
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let _entered = rt.enter();
        match notifier.notify(&AlertMessage::accuracy("iargus", 0.2, 0.15, 0.3)) {
            Err(MonitorError::AlertDelivery { reason }) => assert!(reason.contains("bus down")),
            other => panic!("expected delivery failure, got {other:?}"),
        }
    }
}
