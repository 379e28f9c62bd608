use std::{path::PathBuf, sync::Arc};

use campus_cleanup::{
    config::AppConfig,
    db::{self, DocumentStore},
    object_store, observability,
    retention::{
        self, ManualTrigger, RunCoordinator, RunTrigger, TriggerGate, TriggerKind,
    },
};
use clap::Parser;
use serde_json::{Value, json};

const DEFAULT_CONFIG_FILE: &str = "campus-cleanup.toml";

#[derive(Parser, Debug)]
#[command(version, about = "Retention cleanup engine", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (defaults to ./campus-cleanup.toml if it exists,
    /// otherwise built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run the scheduled and manual cleanup loops (default)
    Worker,
    /// Run one cleanup now and exit.
    ///
    /// Manual runs started here do not claim the trigger document.
    Run {
        #[arg(long, value_enum, default_value = "scheduled")]
        trigger: TriggerArg,
        /// Include object storage (manual runs only)
        #[arg(long)]
        include_object_storage: bool,
        /// Purge everything regardless of age (manual runs only; requires
        /// retention.safety.allow_unconditional)
        #[arg(long)]
        full_reset: bool,
    },
    /// Request a manual run through the trigger document, as the admin app does
    Trigger {
        /// Include object storage
        #[arg(long)]
        include_object_storage: bool,
        /// Purge everything regardless of age
        #[arg(long)]
        full_reset: bool,
    },
    /// Print run status documents and recent audit log entries as JSON
    Status {
        /// Number of audit entries to show
        #[arg(short, long, default_value = "5")]
        limit: usize,
    },
    /// Validate the configuration file and exit
    CheckConfig,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum TriggerArg {
    Scheduled,
    Manual,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = load_config(args.config.as_deref());

    match args.command {
        Some(Command::CheckConfig) => run_check_config(&config),
        Some(Command::Run {
            trigger,
            include_object_storage,
            full_reset,
        }) => run_once(config, trigger, include_object_storage, full_reset).await,
        Some(Command::Trigger {
            include_object_storage,
            full_reset,
        }) => run_trigger(config, include_object_storage, full_reset).await,
        Some(Command::Status { limit }) => run_status(config, limit).await,
        Some(Command::Worker) | None => run_worker(config).await,
    }
}

fn load_config(explicit: Option<&std::path::Path>) -> AppConfig {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !default.exists() {
                return AppConfig::default();
            }
            default
        }
    };

    match AppConfig::from_file(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", path.display(), e);
            std::process::exit(1);
        }
    }
}

fn init_observability(config: &AppConfig) {
    if let Err(e) = observability::init_tracing(&config.observability.logging) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn connect_store(config: &AppConfig) -> Arc<dyn DocumentStore> {
    match db::create_document_store(&config.database).await {
        Ok(store) => {
            tracing::info!(backend = store.backend_name(), "Document store ready");
            store
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to document store");
            std::process::exit(1);
        }
    }
}

async fn run_worker(config: AppConfig) {
    init_observability(&config);
    if let Err(e) = observability::metrics::init_metrics(&config.observability.metrics) {
        tracing::error!(error = %e, "Failed to initialize metrics");
        std::process::exit(1);
    }

    let store = connect_store(&config).await;
    let worker = retention::start_retention_worker(
        store,
        object_store::default_connector(),
        config.retention,
    );

    tokio::select! {
        _ = worker => {},
        _ = shutdown_signal() => {},
    }
    tracing::info!("Retention worker stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

async fn run_once(
    config: AppConfig,
    trigger: TriggerArg,
    include_object_storage: bool,
    full_reset: bool,
) {
    init_observability(&config);
    let store = connect_store(&config).await;

    let trigger = match trigger {
        TriggerArg::Scheduled => RunTrigger::Scheduled,
        TriggerArg::Manual => RunTrigger::Manual(ManualTrigger {
            trigger_requested: true,
            include_object_storage,
            full_reset,
            ..Default::default()
        }),
    };

    let coordinator =
        RunCoordinator::new(store, object_store::default_connector(), config.retention);
    match coordinator.run(&trigger).await {
        Ok(report) => {
            println!(
                "{}",
                json!({
                    "trigger": report.trigger_kind.as_str(),
                    "success": report.success(),
                    "dryRun": report.dry_run,
                    "deletedCounts": report.deleted,
                    "errors": report.phase_errors,
                    "objectKeyErrors": report.object_key_errors.len(),
                    "auditId": report.audit_id,
                })
            );
            if !report.success() {
                std::process::exit(2);
            }
        }
        Err(e) => {
            eprintln!("Cleanup failed: {e}");
            std::process::exit(1);
        }
    }
}

async fn run_trigger(config: AppConfig, include_object_storage: bool, full_reset: bool) {
    init_observability(&config);
    let store = connect_store(&config).await;
    let gate = TriggerGate::new(store, &config.retention.documents);

    if let Err(e) = gate
        .request(include_object_storage, full_reset, chrono::Utc::now())
        .await
    {
        eprintln!("Failed to write trigger document: {e}");
        std::process::exit(1);
    }
    println!("Manual cleanup requested");
}

async fn run_status(config: AppConfig, limit: usize) {
    init_observability(&config);
    let store = connect_store(&config).await;
    let documents = &config.retention.documents;

    let mut statuses = serde_json::Map::new();
    for kind in [TriggerKind::Scheduled, TriggerKind::Manual] {
        let doc = match store
            .get(&documents.status_collection, kind.status_doc_id())
            .await
        {
            Ok(doc) => doc.map_or(Value::Null, |d| Value::Object(d.data)),
            Err(e) => {
                eprintln!("Failed to read {kind} status: {e}");
                std::process::exit(1);
            }
        };
        statuses.insert(kind.as_str().to_string(), doc);
    }

    let recent = match store.list_recent(&documents.audit_collection, limit).await {
        Ok(docs) => docs
            .into_iter()
            .map(|d| {
                let mut entry = d.data;
                entry.insert("id".into(), Value::String(d.id));
                Value::Object(entry)
            })
            .collect::<Vec<_>>(),
        Err(e) => {
            eprintln!("Failed to read audit log: {e}");
            std::process::exit(1);
        }
    };

    let output = json!({ "status": statuses, "recentRuns": recent });
    match serde_json::to_string_pretty(&output) {
        Ok(text) => println!("{text}"),
        Err(e) => {
            eprintln!("Failed to render status: {e}");
            std::process::exit(1);
        }
    }
}

fn run_check_config(config: &AppConfig) {
    let retention = &config.retention;
    let scope = retention::ObjectPurgeScope::from_config(&retention.object_store);
    println!("Configuration OK");
    println!("  database: {}", config.database.kind());
    match retention.run_at_utc.as_deref() {
        Some(at) => println!("  schedule: daily at {at} UTC"),
        None => println!("  schedule: every {}h", retention.interval_hours),
    }
    match retention.trigger_poll_interval() {
        Some(poll) => println!("  manual triggers: polled every {}s", poll.as_secs()),
        None => println!("  manual triggers: disabled"),
    }
    println!("  prefixes: {}", scope.prefixes().join(", "));
    println!("  protected prefix: {}", scope.protected_prefix());
    if retention.safety.dry_run {
        println!("  DRY RUN: nothing will be deleted");
    }
}
