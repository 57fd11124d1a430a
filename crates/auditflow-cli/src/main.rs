//! CLI: corre un pipeline desde un archivo YAML.
//!
//! Uso:
//!   auditflow-cli run <config.yaml>
//!   auditflow-cli resume <config.yaml> <run_id>

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use auditflow_adapters::default_registry;
use auditflow_config::{load_settings, resolve_pipeline};
use auditflow_core::recorder::{FilesystemPayloadStore, InMemoryAuditStore, LandscapeRecorder};
use auditflow_core::{AuditStore, Orchestrator};
use auditflow_persistence::{build_pool, DbConfig, PgAuditStore};
use log::{error, info};
use uuid::Uuid;

fn main() -> ExitCode {
    env_logger::init();
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(|s| s.as_str()) {
        Some("run") if args.len() == 3 => run(&args[2], None),
        Some("resume") if args.len() == 4 => run(&args[2], Some(&args[3])),
        _ => {
            eprintln!("usage: auditflow-cli run <config.yaml> | auditflow-cli resume <config.yaml> <run_id>");
            ExitCode::from(2)
        }
    }
}

fn run(config_path: &str, resume_run_id: Option<&str>) -> ExitCode {
    let settings = match load_settings(Path::new(config_path)) {
        Ok(settings) => settings,
        Err(e) => {
            error!("config error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let store: Arc<dyn AuditStore> = match settings.landscape.backend.as_str() {
        "memory" => Arc::new(InMemoryAuditStore::new()),
        "postgresql" => {
            let db = DbConfig::from_env();
            let url = settings.landscape.url.clone().unwrap_or(db.url);
            match build_pool(&url, db.min_idle, db.max_size) {
                Ok(pool) => Arc::new(PgAuditStore::new(pool)),
                Err(e) => {
                    error!("cannot connect landscape database: {e}");
                    return ExitCode::FAILURE;
                }
            }
        }
        other => {
            error!("unknown landscape backend '{other}' (expected 'memory' or 'postgresql')");
            return ExitCode::FAILURE;
        }
    };

    let payloads = Arc::new(FilesystemPayloadStore::new(settings.payload_store.base_path.clone()));
    let recorder = Arc::new(LandscapeRecorder::with_payload_store(store, payloads));

    let registry = default_registry();
    let (definition, run_settings) = match resolve_pipeline(&settings, &registry) {
        Ok(resolved) => resolved,
        Err(e) => {
            error!("cannot resolve pipeline: {e}");
            return ExitCode::FAILURE;
        }
    };

    let orchestrator = Orchestrator::new(definition, run_settings, recorder);
    let result = match resume_run_id {
        None => orchestrator.run(),
        Some(raw) => match Uuid::parse_str(raw) {
            Ok(run_id) => orchestrator.resume(run_id),
            Err(_) => {
                error!("'{raw}' is not a valid run id");
                return ExitCode::FAILURE;
            }
        },
    };

    match result {
        Ok(summary) => {
            info!("run {} finished: status={} rows={}",
                  summary.run_id,
                  summary.status.as_str(),
                  summary.rows_read);
            if let Some(report) = &summary.verify {
                info!("verify: {} states compared, {} mismatches",
                      report.compared_states,
                      report.mismatches.len());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("run failed: {e}");
            ExitCode::FAILURE
        }
    }
}
