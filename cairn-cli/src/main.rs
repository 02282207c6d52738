mod output;

use std::io::{BufRead, Write};
use std::process;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use cairn_core::command::ExecuteCommand;
use cairn_core::config::{normalize_location, CairnConfig, ChangesetsConfig, CliOverrides};
use cairn_core::error::CairnError;
use cairn_core::{Cairn, DeployOptions};

#[derive(Parser)]
#[command(
    name = "cairn",
    about = "Dependency-ordered PostgreSQL schema deployment",
    version = concat!(
        env!("CARGO_PKG_VERSION"),
        " (", env!("CAIRN_GIT_HASH"), " ", env!("CAIRN_BUILD_DATE"), ")"
    ),
    propagate_version = true
)]
struct Cli {
    /// Config file path
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Database URL (overrides config)
    #[arg(long, value_name = "URL")]
    url: Option<String>,

    /// Schemas to manage, comma-separated (overrides config)
    #[arg(long, value_name = "SCHEMAS", value_delimiter = ',')]
    schemas: Option<Vec<String>>,

    /// Audit table name (overrides config)
    #[arg(long, value_name = "TABLE")]
    audit_table: Option<String>,

    /// Schema holding the audit table (overrides config)
    #[arg(long, value_name = "SCHEMA")]
    audit_schema: Option<String>,

    /// Source locations, comma-separated (overrides config)
    #[arg(long, value_name = "PATHS")]
    locations: Option<String>,

    /// Connections used for parallel deploys
    #[arg(long, value_name = "N")]
    parallel_threads: Option<usize>,

    /// Seconds to wait for the deploy lock (0 = try once)
    #[arg(long, value_name = "SECS")]
    lock_timeout: Option<u64>,

    /// Number of retries when connecting to the database
    #[arg(long, value_name = "N")]
    connect_retries: Option<u32>,

    /// SSL/TLS mode: disable, prefer, require
    #[arg(long, value_name = "MODE", value_parser = ["disable", "prefer", "require"])]
    ssl_mode: Option<String>,

    /// Connection timeout in seconds (default: 30, 0 = no timeout)
    #[arg(long, value_name = "SECS")]
    connect_timeout: Option<u32>,

    /// Statement timeout in seconds (default: 0 = no limit)
    #[arg(long, value_name = "SECS")]
    statement_timeout: Option<u32>,

    /// Output results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Enable verbose/debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy source changes to the environment
    Deploy {
        /// Roll back deployed changes that were removed from source
        #[arg(long)]
        rollback: bool,

        /// Show the plan without executing anything
        #[arg(long)]
        dry_run: bool,

        /// Also deploy changes tagged with these changesets
        #[arg(long, value_name = "NAMES", value_delimiter = ',', conflicts_with = "all_changesets")]
        changesets: Option<Vec<String>>,

        /// Deploy every changeset
        #[arg(long)]
        all_changesets: bool,

        /// Limit the deploy to these objects (schema.object, comma-separated)
        #[arg(long, value_name = "OBJECTS", value_delimiter = ',')]
        only: Vec<String>,

        /// Accept edited changes by updating their recorded hash
        #[arg(long)]
        lenient_hash: bool,

        /// Reason recorded with this deploy
        #[arg(long, value_name = "TEXT")]
        reason: Option<String>,
    },

    /// Show what the next deploy would do
    Info,

    /// Check deployed changes against source
    Validate,

    /// Drop all objects in managed schemas
    Clean {
        /// Required flag to actually run clean
        #[arg(long)]
        allow_clean: bool,

        /// Do not ask for confirmation
        #[arg(long)]
        no_prompt: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Set up logging (suppress when JSON output is requested)
    let filter = if cli.json || cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .without_time()
        .init();

    if let Err(e) = run(cli).await {
        print_error(&e);
        process::exit(exit_code(&e));
    }
}

/// Map error types to differentiated exit codes.
fn exit_code(error: &CairnError) -> i32 {
    match error {
        CairnError::ConfigError(_) => 2,
        CairnError::FatalWarningsError(_) => 3,
        CairnError::DatabaseError(_) => 4,
        CairnError::CommandFailed { .. } | CairnError::MissingRollbackError(_) => 5,
        CairnError::LockError(_) => 6,
        CairnError::CleanDisabled | CairnError::CleanAbortedError => 7,
        CairnError::GraphCycleError { .. }
        | CairnError::InvalidGraphInputError(_)
        | CairnError::UnsortableElementsError(_)
        | CairnError::UnresolvedDependencyError { .. } => 8,
        _ => 1,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CairnError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| CairnError::ConfigError(format!("Failed to serialize output: {}", e)))?;
    println!("{}", text);
    Ok(())
}

/// Show the drop plan and ask for a literal "yes" on stdin.
fn confirm_clean(plan: &[ExecuteCommand]) -> bool {
    output::print_clean_plan(plan);
    print!("{} ", "Type 'yes' to drop these objects:".yellow().bold());
    if std::io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    match std::io::stdin().lock().read_line(&mut answer) {
        Ok(_) => answer.trim().eq_ignore_ascii_case("yes"),
        Err(_) => false,
    }
}

async fn run(cli: Cli) -> Result<(), CairnError> {
    let json_output = cli.json;

    let overrides = CliOverrides {
        url: cli.url,
        schemas: cli.schemas,
        audit_table: cli.audit_table,
        audit_schema: cli.audit_schema,
        locations: cli.locations.map(|l| {
            l.split(',')
                .map(|s| normalize_location(s.trim()))
                .collect()
        }),
        parallel_threads: cli.parallel_threads,
        lock_timeout: cli.lock_timeout,
        connect_retries: cli.connect_retries,
        ssl_mode: cli.ssl_mode,
        connect_timeout: cli.connect_timeout,
        statement_timeout: cli.statement_timeout,
    };

    // Load config
    let config = CairnConfig::load(cli.config.as_deref(), &overrides)?;
    let cairn = Cairn::new(config).await?;

    match cli.command {
        Commands::Deploy {
            rollback,
            dry_run,
            changesets,
            all_changesets,
            only,
            lenient_hash,
            reason,
        } => {
            let changesets = if all_changesets {
                Some(ChangesetsConfig::All)
            } else {
                changesets.map(ChangesetsConfig::Named)
            };
            let options = DeployOptions {
                rollback,
                dry_run,
                changesets,
                only,
                lenient_hash,
                reason,
            };
            let report = cairn.deploy(&options).await?;
            if json_output {
                print_json(&report)?;
            } else {
                output::print_deploy_summary(&report);
            }
        }
        Commands::Info => {
            let report = cairn.info().await?;
            if json_output {
                print_json(&report)?;
            } else {
                output::print_plan_table(&report);
            }
        }
        Commands::Validate => {
            let report = cairn.validate().await?;
            if json_output {
                print_json(&report)?;
            } else {
                output::print_validate_result(&report);
            }
        }
        Commands::Clean {
            allow_clean,
            no_prompt,
        } => {
            let prompt: &(dyn Fn(&[ExecuteCommand]) -> bool + Send + Sync) = &confirm_clean;
            let confirm = if no_prompt || json_output { None } else { Some(prompt) };
            let report = cairn.clean(allow_clean, confirm).await?;
            if json_output {
                print_json(&report)?;
            } else {
                output::print_clean_result(&report);
            }
        }
    }

    Ok(())
}

fn print_error(error: &CairnError) {
    eprintln!("{} {}", "ERROR:".red().bold(), error);

    // Provide actionable guidance
    match error {
        CairnError::ConfigError(_) => {
            eprintln!(
                "{}",
                "Hint: Check your cairn.toml or set CAIRN_DATABASE_URL environment variable."
                    .dimmed()
            );
        }
        CairnError::DatabaseError(_) => {
            eprintln!(
                "{}",
                "Hint: Verify database is running and connection details are correct.".dimmed()
            );
        }
        CairnError::CleanDisabled => {
            eprintln!(
                "{}",
                "Hint: Pass --allow-clean flag or set clean_enabled = true in cairn.toml."
                    .dimmed()
            );
        }
        CairnError::FatalWarningsError(_) => {
            eprintln!(
                "{}",
                "Hint: Restore edited or removed changes, or pass --lenient-hash to accept edits."
                    .dimmed()
            );
        }
        CairnError::LockError(_) => {
            eprintln!(
                "{}",
                "Hint: Another deploy may be running. Retry later or raise --lock-timeout.".dimmed()
            );
        }
        CairnError::GraphCycleError { .. } => {
            eprintln!(
                "{}",
                "Hint: Break the cycle with an explicit `dependencies` or `excludeDependencies` attribute."
                    .dimmed()
            );
        }
        _ => {}
    }
}
