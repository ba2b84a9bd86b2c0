use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use argus_telemetry::{EventPublisher, EventRecord, JsonLogger, LogLevel, LogRecord};
use serde_json::Value;
use tokio::runtime::{Builder, Handle, Runtime};

/// Builder configuring telemetry for the monitoring loop.
pub struct MonitorTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl MonitorTelemetryBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Debug,
            event_publisher: None,
        }
    }

    /// Sets the JSON log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops log records below `level`.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Assigns the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Finalizes the builder.
    pub fn build(self) -> Result<MonitorTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(JsonLogger::with_min_level(path, self.min_level)?),
            None => None,
        };
        let event = match self.event_publisher {
            Some(publisher) => Some(EventHandle::new(publisher)?),
            None => None,
        };
        Ok(MonitorTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                event,
            }),
        })
    }
}

/// Telemetry handle shared by the loop, trainer, and alerting.
#[derive(Clone)]
pub struct MonitorTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for MonitorTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorTelemetry")
            .field("module", &self.inner.module)
            .field("logs", &self.inner.logger.is_some())
            .field("events", &self.inner.event.is_some())
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLogger>,
    event: Option<EventHandle>,
}

struct EventHandle {
    runtime: Runtime,
    publisher: Arc<dyn EventPublisher>,
}

impl EventHandle {
    fn new(publisher: Arc<dyn EventPublisher>) -> Result<Self> {
        Ok(Self {
            runtime: Builder::new_current_thread().enable_all().build()?,
            publisher,
        })
    }

    fn publish(&self, record: EventRecord) -> Result<()> {
        if let Ok(handle) = Handle::try_current() {
            let publisher = Arc::clone(&self.publisher);
            handle.spawn(async move {
                if let Err(err) = publisher.publish(record).await {
                    eprintln!("monitor event publish failed: {err:?}");
                }
            });
            Ok(())
        } else {
            self.runtime.block_on(self.publisher.publish(record))
        }
    }

    /// Publishes and waits for the publisher's verdict, even inside a runtime.
    fn publish_confirmed(&self, record: EventRecord) -> Result<()> {
        if Handle::try_current().is_err() {
            return self.runtime.block_on(self.publisher.publish(record));
        }
        std::thread::scope(|scope| {
            scope
                .spawn(move || self.runtime.block_on(self.publisher.publish(record)))
                .join()
                .map_err(|_| anyhow!("event publisher panicked"))?
        })
    }
}

impl MonitorTelemetry {
    /// Returns a builder for this telemetry helper.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> MonitorTelemetryBuilder {
        MonitorTelemetryBuilder::new(module)
    }

    /// Handle that records nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                module: "monitor".into(),
                logger: None,
                event: None,
            }),
        }
    }

    /// Logs a structured record.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let record = LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Emits an event via the configured bus.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(handle) = &self.inner.event {
            handle.publish(EventRecord::new(&self.inner.module, event_type, payload))?;
        }
        Ok(())
    }

    /// Emits an event and reports whether the publisher accepted it.
    ///
    /// Unlike [`Self::event`], this never detaches the publish onto an ambient
    /// runtime, so delivery failures always reach the caller.
    pub fn event_confirmed(&self, event_type: &str, payload: Value) -> Result<()> {
        let handle = self
            .inner
            .event
            .as_ref()
            .ok_or_else(|| anyhow!("no event publisher configured"))?;
        handle.publish_confirmed(EventRecord::new(&self.inner.module, event_type, payload))
    }

    /// Log file path, when logging is enabled.
    #[must_use]
    pub fn log_path(&self) -> Option<PathBuf> {
        self.inner.logger.as_ref().map(|logger| logger.path().to_path_buf())
    }
}
