//! biod - bioinformatics run orchestrator daemon
//!
//! Library components for the daemon process.

pub mod controller;
pub mod executor;
pub mod layout;
pub mod planner;
pub mod server;
pub mod status;
pub mod storage;

use std::path::PathBuf;
use std::sync::Arc;

use bio_core::{Config, ModuleCatalog};
use controller::Controller;
use executor::ExecutorConfig;
use planner::{Planner, PlannerError};
use server::AppState;
use storage::Storage;
use tracing::{info, warn};

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 7710;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
    /// HTTP server port.
    pub port: u16,
    /// Auth token for the HTTP API (optional).
    pub auth_token: Option<String>,
    /// Run layout, tool and planner settings.
    pub settings: Config,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            port: DEFAULT_PORT,
            auth_token: std::env::var("BIOD_AUTH_TOKEN").ok(),
            settings: Config::default(),
        }
    }
}

impl DaemonConfig {
    /// Build from loaded settings; `db_path` in the settings wins over the default.
    pub fn from_settings(settings: Config) -> Self {
        let db_path = settings.db_path.clone().unwrap_or_else(default_db_path);
        Self {
            db_path,
            settings,
            ..Self::default()
        }
    }
}

/// Get the default database path (~/.local/share/biod/runs.db).
pub fn default_db_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("biod").join("runs.db")
}

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    controller: Arc<Controller>,
    planner: Option<Arc<Planner>>,
}

impl Daemon {
    /// Open the store, apply migrations, and wire up the controller and planner.
    pub async fn new(
        config: DaemonConfig,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let storage = Storage::new(&config.db_path).await?;
        storage.migrate_embedded().await?;
        let storage = Arc::new(storage);

        let settings = &config.settings;
        let controller = Arc::new(Controller::new(
            storage,
            settings.base_path.clone(),
            settings.tool.clone(),
            ExecutorConfig::from_config(settings),
        ));

        let catalog = match &settings.module_catalog {
            Some(path) => ModuleCatalog::from_file(path)?,
            None => ModuleCatalog::builtin(),
        };
        let planner = match Planner::from_config(settings, catalog) {
            Ok(planner) => Some(Arc::new(planner)),
            Err(PlannerError::MissingApiKey) => {
                warn!(
                    "{} not set; workflow planning disabled",
                    planner::API_KEY_ENV
                );
                None
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            config,
            controller,
            planner,
        })
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Recover state left by a previous process, then serve the HTTP API.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("biod starting on port {}", self.config.port);
        info!("database: {}", self.config.db_path.display());
        info!("base path: {}", self.config.settings.base_path.display());
        info!("default tool: {}", self.config.settings.tool);
        if self.config.auth_token.is_some() {
            info!("auth token: enabled");
        }

        let report = self.controller.recover().await?;
        if !report.interrupted.is_empty() {
            info!("failed {} interrupted run(s)", report.interrupted.len());
        }
        if !report.orphan_dirs.is_empty() {
            info!("orphan run directories left in place: {}", report.orphan_dirs.len());
        }
        if !report.discarded.is_empty() {
            info!("discarded {} partially created run(s)", report.discarded.len());
        }
        if !report.orphan_rows.is_empty() {
            info!("runs without a run directory: {}", report.orphan_rows.len());
        }

        let state = Arc::new(AppState {
            controller: Arc::clone(&self.controller),
            planner: self.planner.clone(),
            auth_token: self.config.auth_token.clone(),
        });
        server::start_server(state, self.config.port).await
    }
}
