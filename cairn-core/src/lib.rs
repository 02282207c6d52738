pub mod audit;
pub mod calc;
pub mod change;
pub mod change_type;
pub mod changeset;
pub mod checksum;
pub mod cleaner;
pub mod command;
pub mod command_sorter;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod graph;
pub mod history;
pub mod metadata;
pub mod reader;
pub mod tokens;

use config::CairnConfig;
use error::Result;
use tokio_postgres::Client;

pub use cleaner::{CleanReport, ConfirmFn};
pub use commands::deploy::{DeployOptions, DeployReport};
pub use commands::info::{PlanBucket, PlanReport, PlannedCommand};
pub use commands::validate::ValidateReport;
pub use config::CliOverrides;
pub use error::CairnError;

/// Main entry point for the Cairn library.
///
/// Create a `Cairn` instance with a config and use its methods to
/// deploy, inspect or clean an environment programmatically.
pub struct Cairn {
    pub config: CairnConfig,
    client: Client,
}

impl Cairn {
    /// Create a new Cairn instance, connecting to the database.
    ///
    /// If `connect_retries` is configured, retries with exponential backoff.
    pub async fn new(config: CairnConfig) -> Result<Self> {
        let conn_string = config.connection_string()?;
        let client = db::connect_with_config(
            &conn_string,
            &config.database.ssl_mode,
            config.database.connect_retries,
            config.database.connect_timeout_secs,
            config.database.statement_timeout_secs,
        )
        .await?;
        Ok(Self { config, client })
    }

    /// Create a new Cairn instance with an existing database client.
    pub fn with_client(config: CairnConfig, client: Client) -> Self {
        Self { config, client }
    }

    /// Bring the environment in line with source.
    pub async fn deploy(&self, options: &DeployOptions) -> Result<DeployReport> {
        commands::deploy::execute(&self.client, &self.config, options).await
    }

    /// Show what the next deploy would do.
    pub async fn info(&self) -> Result<PlanReport> {
        commands::info::execute(&self.client, &self.config).await
    }

    /// Check deployed changes against source.
    pub async fn validate(&self) -> Result<ValidateReport> {
        commands::validate::execute(&self.client, &self.config).await
    }

    /// Drop all objects in managed schemas.
    pub async fn clean(&self, allow_clean: bool, confirm: Option<ConfirmFn<'_>>) -> Result<CleanReport> {
        commands::clean::execute(&self.client, &self.config, allow_clean, confirm).await
    }
}
