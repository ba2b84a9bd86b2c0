use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{Context, Result};
use argus_pricing::{
    alerting::{Notifier, OutboxNotifier, TelemetryNotifier},
    config::ArgusConfig,
    encoder::fit_and_persist,
    CarFeatures, Evaluator, FileEncoderStore, FsModelRegistry, JsonlRecordStore, ModelRegistry, Monitor,
    MonitorDeps, MonitorTelemetry, PredictionService, RecordStore, StateStore, TomlStateStore, Trainer,
};
use argus_telemetry::{log::read_tail, FileEventPublisher, LogLevel};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;

#[derive(Parser, Debug)]
#[command(name = "argus", version, about = "Used-car price model operations")]
struct Cli {
    /// Workspace configuration file.
    #[arg(long, global = true, default_value = "config/argus.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs one monitoring cycle.
    Monitor {
        /// Date the cycle runs as of (defaults to today).
        #[arg(long)]
        today: Option<NaiveDate>,
        /// Where operator alerts go.
        #[arg(long, value_enum, default_value_t = AlertSink::Outbox)]
        alerts: AlertSink,
    },
    /// Predicts the price of one car.
    Predict {
        #[arg(long)]
        state: String,
        #[arg(long)]
        make: String,
        #[arg(long)]
        model: String,
        #[arg(long)]
        year: i32,
        #[arg(long)]
        mileage: f64,
    },
    /// Re-fits the feature encoder on every stored record.
    FitEncoder,
    /// Trains and registers a model against the current encoder now.
    Train {
        /// Date recorded as the last training (defaults to today).
        #[arg(long)]
        today: Option<NaiveDate>,
        /// Where operator alerts go.
        #[arg(long, value_enum, default_value_t = AlertSink::Outbox)]
        alerts: AlertSink,
    },
    /// Lists registered model versions.
    Models,
    /// Shows monitoring state and recent log lines.
    Status {
        /// Number of log lines to show.
        #[arg(long, default_value_t = 10)]
        lines: usize,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum AlertSink {
    /// JSON-lines outbox read by the mail relay.
    Outbox,
    /// `monitoring.alert` events in the event log.
    Events,
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = ArgusConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    match cli.command {
        Commands::Monitor { today, alerts } => handle_monitor(&config, today, alerts, false),
        Commands::Train { today, alerts } => handle_monitor(&config, today, alerts, true),
        Commands::Predict {
            state,
            make,
            model,
            year,
            mileage,
        } => {
            let service = PredictionService::new(
                config.model_name.clone(),
                Arc::new(FsModelRegistry::new(&config.paths.registry)),
                Arc::new(FileEncoderStore::new(&config.paths.encoder)),
            );
            let request = CarFeatures {
                state,
                make,
                model,
                year,
                mileage,
            };
            let response = service.predict(&[request])?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Commands::FitEncoder => {
            let records = JsonlRecordStore::new(&config.paths.records).fetch_records(None)?;
            let store = FileEncoderStore::new(&config.paths.encoder);
            let state = fit_and_persist(&store, &records)?;
            let telemetry = build_telemetry(&config)?;
            let _ = telemetry.log(
                LogLevel::Info,
                "encoder.refit",
                json!({ "fingerprint": state.fingerprint, "rows": records.len(), "width": state.width() }),
            );
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "fingerprint": state.fingerprint,
                    "fitted_at": state.fitted_at,
                    "width": state.width(),
                    "vocabularies": state.vocabularies,
                }))?
            );
            Ok(())
        }
        Commands::Models => {
            let registry = FsModelRegistry::new(&config.paths.registry);
            let versions = registry.versions(&config.model_name)?;
            if versions.is_empty() {
                println!("no versions registered under {}", config.model_name);
            }
            for info in versions {
                println!(
                    "v{} | mape {:.4} | rows {}+{} | epochs {} | {}",
                    info.version,
                    info.metadata.mape,
                    info.metadata.train_rows,
                    info.metadata.holdout_rows,
                    info.metadata.epochs_run,
                    info.metadata.registered_at
                );
            }
            Ok(())
        }
        Commands::Status { lines } => {
            let state = TomlStateStore::new(&config.paths.state).load()?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            for record in read_tail(&config.paths.log, lines)? {
                println!(
                    "{} {} {} {}",
                    record.timestamp.to_rfc3339(),
                    record.level,
                    record.message,
                    serde_json::Value::Object(record.metadata)
                );
            }
            Ok(())
        }
    }
}

fn build_telemetry(config: &ArgusConfig) -> Result<MonitorTelemetry> {
    let publisher = FileEventPublisher::new(&config.paths.events)?;
    MonitorTelemetry::builder("monitor")
        .log_path(&config.paths.log)
        .min_level(config.logging.min_level)
        .event_publisher(Arc::new(publisher))
        .build()
}

fn build_monitor(config: &ArgusConfig, alerts: AlertSink) -> Result<Monitor> {
    let telemetry = build_telemetry(config)?;
    let registry = Arc::new(FsModelRegistry::new(&config.paths.registry));
    let notifier: Arc<dyn Notifier> = match alerts {
        AlertSink::Outbox => Arc::new(OutboxNotifier::new(&config.paths.outbox)),
        AlertSink::Events => Arc::new(TelemetryNotifier::new(telemetry.clone())),
    };
    let deps = MonitorDeps {
        records: Arc::new(JsonlRecordStore::new(&config.paths.records)),
        encoders: Arc::new(FileEncoderStore::new(&config.paths.encoder)),
        registry: registry.clone(),
        trainer: Arc::new(Trainer::new(
            config.training.clone(),
            config.model_name.clone(),
            registry.clone(),
        )),
        scorer: Arc::new(Evaluator::new(registry)),
        notifier,
        state: Arc::new(TomlStateStore::new(&config.paths.state)),
    };
    Ok(Monitor::new(
        config.model_name.clone(),
        &config.paths.lock_dir,
        deps,
        telemetry,
    ))
}

fn handle_monitor(config: &ArgusConfig, today: Option<NaiveDate>, alerts: AlertSink, retrain: bool) -> Result<()> {
    let monitor = build_monitor(config, alerts)?;
    let today = today.unwrap_or_else(|| Local::now().date_naive());
    let report = if retrain {
        monitor
            .retrain_now(today)
            .with_context(|| format!("retraining {}", config.model_name))?
    } else {
        monitor
            .run_cycle(today)
            .with_context(|| format!("monitoring cycle for {}", config.model_name))?
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_pricing::CycleOutcome;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn parses_predict_arguments() {
        let cli = Cli::try_parse_from([
            "argus", "predict", "--state", "CA", "--make", "Honda", "--model", "Civic", "--year", "2018",
            "--mileage", "30000",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("config/argus.toml"));
        assert!(matches!(cli.command, Commands::Predict { year: 2018, .. }));
    }

    #[test]
    fn parses_monitor_date_and_sink() {
        let cli = Cli::try_parse_from([
            "argus", "--config", "x.toml", "monitor", "--today", "2024-06-01", "--alerts", "events",
        ])
        .unwrap();
        match cli.command {
            Commands::Monitor { today, alerts } => {
                assert_eq!(today, NaiveDate::from_ymd_opt(2024, 6, 1));
                assert_eq!(alerts, AlertSink::Events);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn monitor_on_empty_workspace_is_a_no_op() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("argus.toml");
        fs::write(&path, "model_name = \"iargus\"\n").unwrap();
        let config = ArgusConfig::load(&path).unwrap();
        let monitor = build_monitor(&config, AlertSink::Outbox).unwrap();
        let report = monitor.run_cycle(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()).unwrap();
        assert_eq!(report.outcome, CycleOutcome::EmptyStore);
        assert!(JsonlRecordStore::new(&config.paths.records)
            .fetch_records(None)
            .unwrap()
            .is_empty());
        assert!(config.paths.log.exists());
    }

    #[test]
    fn train_after_refit_registers_a_matching_model() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("argus.toml");
        fs::write(
            &path,
            "model_name = \"iargus\"\n[training]\nepochs = 5\nhidden_units = [8, 4]\n",
        )
        .unwrap();
        let config = ArgusConfig::load(&path).unwrap();
        let makes = [("Honda", "Civic"), ("Toyota", "Camry"), ("Ford", "Focus")];
        let records: Vec<_> = (0..24_i32)
            .map(|idx| {
                let (make, model) = makes[usize::try_from(idx).unwrap() % makes.len()];
                let year = 2010 + idx % 10;
                argus_pricing::CarRecord {
                    state: (if idx % 2 == 0 { "CA" } else { "TX" }).into(),
                    make: make.into(),
                    model: model.into(),
                    year,
                    mileage: 10_000.0 + 3_000.0 * f64::from(idx),
                    price: 8_000.0 + 900.0 * f64::from(year - 2010),
                    date_added: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                }
            })
            .collect();
        JsonlRecordStore::new(&config.paths.records).append(&records).unwrap();
        run(Cli::try_parse_from(["argus", "--config", path.to_str().unwrap(), "fit-encoder"]).unwrap()).unwrap();
        run(Cli::try_parse_from([
            "argus", "--config", path.to_str().unwrap(), "train", "--today", "2024-02-01",
        ])
        .unwrap())
        .unwrap();

        let encoder = argus_pricing::EncoderStore::load(&FileEncoderStore::new(&config.paths.encoder)).unwrap();
        let model = FsModelRegistry::new(&config.paths.registry).latest("iargus").unwrap();
        assert_eq!(model.version, 1);
        assert!(model.ensure_encoder(&encoder).is_ok());
        let state = TomlStateStore::new(&config.paths.state).load().unwrap();
        assert_eq!(state.last_training_date, NaiveDate::from_ymd_opt(2024, 2, 1));
    }
}
