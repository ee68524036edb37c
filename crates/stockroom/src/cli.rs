//! Command line front end.
//!
//! A crate that owns migrations gets a full migration tool with:
//!
//! ```ignore
//! fn main() -> std::process::ExitCode {
//!     storefront_db::ensure_linked();
//!     stockroom::cli::run()
//! }
//! ```

use crate::config::{self, Config};
use crate::pool::{create_pool, mask_password};
use crate::{
    Error, MigrationRunner, MigrationState, MigrationStatus, RanMigration, Result, Schema,
    SchemaDiff, diff_schema, introspect,
};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use std::error::Error as _;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Filter used when neither `RUST_LOG` nor the config file sets one.
pub const DEFAULT_LOG_FILTER: &str = "stockroom=info";

/// Postgres migrations as Rust functions.
#[derive(Parser, Debug)]
#[command(name = "stockroom", version)]
struct Cli {
    /// Database connection URL (defaults to DATABASE_URL, then the config file)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Run pending migrations
    Migrate,
    /// Revert the most recently applied migrations
    Rollback {
        /// Number of migrations to revert
        #[arg(long, default_value_t = 1)]
        steps: usize,
    },
    /// Revert the most recent migration and apply it again
    Redo,
    /// Show migration status
    Status,
    /// Show the tables this binary declares
    Schema {
        /// Print CREATE TABLE statements instead of a summary
        #[arg(long)]
        sql: bool,
    },
    /// Compare declared tables to the database
    Diff {
        /// Exit with an error if there are differences
        #[arg(long)]
        check: bool,
    },
}

/// Parse the process arguments and run the chosen command.
pub fn run() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let (config, config_path) = match config::load() {
        Ok(Some((config, path))) => (config, Some(path)),
        Ok(None) => (Config::default(), None),
        Err(e) => {
            report(&Error::from(e));
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config);
    if let Some(path) = &config_path {
        tracing::debug!(path = %path.display(), "loaded config");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{} failed to start runtime: {e}", "error:".red().bold());
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(execute(cli, config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.log.as_deref().unwrap_or(DEFAULT_LOG_FILTER))
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn execute(cli: Cli, config: Config) -> Result<()> {
    if let Commands::Schema { sql } = cli.command {
        print_schema(&Schema::collect(), sql);
        return Ok(());
    }

    let url = config
        .resolve_database_url(cli.database_url, std::env::var("DATABASE_URL").ok())
        .ok_or_else(|| {
            Error::Config(format!(
                "no database URL: pass --database-url, set DATABASE_URL, or add database_url to {}",
                config::CONFIG_PATH
            ))
        })?;
    tracing::info!(database = %mask_password(&url), "connecting");

    let pool = create_pool(&url)?;
    let conn = pool.get().await?;
    let runner = MigrationRunner::new(&conn);

    match cli.command {
        Commands::Migrate => {
            let ran = runner.migrate().await?;
            if ran.is_empty() {
                println!("{}", "Nothing to migrate.".dimmed());
            }
            print_ran(&ran);
        }
        Commands::Rollback { steps } => {
            let ran = runner.rollback(steps).await?;
            if ran.is_empty() {
                println!("{}", "Nothing to roll back.".dimmed());
            }
            print_ran(&ran);
        }
        Commands::Redo => {
            let ran = runner.redo().await?;
            if ran.is_empty() {
                println!("{}", "Nothing to redo.".dimmed());
            }
            print_ran(&ran);
        }
        Commands::Status => print_status(&runner.status().await?),
        Commands::Diff { check } => {
            let expected = Schema::collect();
            if check {
                introspect::verify(&conn, &expected).await?;
                println!("{}", "Database matches declared schema.".green());
            } else {
                let names: Vec<&str> = expected.tables.keys().map(String::as_str).collect();
                let actual = introspect::schema(&conn, &names).await?;
                print_diff(&diff_schema(&expected, &actual));
            }
        }
        Commands::Schema { .. } => {}
    }

    Ok(())
}

fn print_ran(ran: &[RanMigration]) {
    for m in ran {
        let verb = match m.direction {
            crate::Direction::Up => "applied ".green().to_string(),
            crate::Direction::Down => "reverted".yellow().to_string(),
        };
        println!(
            "{} {} {} {}",
            verb,
            m.version.bold(),
            m.name,
            format!("({} ms)", m.duration.as_millis()).dimmed()
        );
    }
}

fn print_status(statuses: &[MigrationStatus]) {
    if statuses.is_empty() {
        println!("No migrations registered.");
        return;
    }

    for status in statuses {
        let state = match &status.state {
            MigrationState::Pending => "pending".yellow().to_string(),
            MigrationState::Applied {
                applied_at,
                modified,
            } => {
                let mut s = format!(
                    "{} {}",
                    "applied".green(),
                    applied_at.format("%Y-%m-%d %H:%M:%S UTC").dimmed()
                );
                if *modified {
                    s.push_str(&format!(" {}", "(modified since applied)".red()));
                }
                s
            }
            MigrationState::Orphaned { applied_at } => format!(
                "{} {}",
                "orphaned".red(),
                applied_at.format("%Y-%m-%d %H:%M:%S UTC").dimmed()
            ),
        };
        println!("  {}  {:<32} {}", status.version.bold(), status.name, state);
    }
}

fn print_schema(schema: &Schema, sql: bool) {
    if schema.tables.is_empty() {
        println!("No tables registered.");
        println!();
        println!(
            "Describe tables with stockroom::Table and register them with: inventory::submit!(stockroom::TableDef::new(your_fn));"
        );
        return;
    }

    if sql {
        println!("{}", schema.to_sql());
        return;
    }

    println!("Schema ({} tables):", schema.tables.len());
    println!();
    for table in schema.iter_tables() {
        println!(
            "  {} ({} columns)",
            table.name.bold(),
            table.columns.len()
        );
        for col in &table.columns {
            let mut flags = Vec::new();
            if col.primary_key {
                flags.push("PK");
            }
            if col.unique {
                flags.push("UNIQUE");
            }
            if !col.nullable {
                flags.push("NOT NULL");
            }
            let flags = if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(", "))
            };
            println!("    {} {}{}", col.name, col.pg_type.dimmed(), flags);
        }
        if table.touch_updated_at {
            println!("    {}", "updated_at maintained by trigger".dimmed());
        }
        println!();
    }
}

fn print_diff(diff: &SchemaDiff) {
    if diff.is_empty() {
        println!("{}", "Database matches declared schema.".green());
        return;
    }

    println!("{} change(s):", diff.change_count());
    for table_diff in &diff.table_diffs {
        println!("  {}", table_diff.table.bold());
        for change in &table_diff.changes {
            println!("    {}", change);
        }
    }
    println!();
    println!("{}", "Suggested SQL:".dimmed());
    print!("{}", diff.to_sql());
}

fn report(err: &Error) {
    eprintln!("{} {}", "error:".red().bold(), err);

    if let Error::Migration(migration) = err {
        if let Some(ctx) = &migration.sql {
            if let Some(code) = &ctx.code {
                eprintln!("  sqlstate: {}", code);
            }
            if let Some(line) = ctx.failing_line() {
                eprintln!("  at: {}", line.dimmed());
            }
            if let Some(detail) = &ctx.detail {
                eprintln!("  detail: {}", detail);
            }
            if let Some(hint) = &ctx.hint {
                eprintln!("  hint: {}", hint);
            }
        }
    }

    let mut source = err.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {}", cause);
        source = cause.source();
    }
}
