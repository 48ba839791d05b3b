//! memshift command line
//!
//! Moves agent memory entries from a SQLite source into PostgreSQL and
//! reports on the target afterwards.

use clap::{Parser, Subcommand};
use memshift_store::{
    DEFAULT_BATCH_SIZE, MemoryBackend, MigrationOptions, MigrationRunner, PostgresBackend,
};
use memshift_types::BackendConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "memshift")]
#[command(version, about = "Migrate agent memory entries into PostgreSQL")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Migrate memory entries from a SQLite source into the target
    Migrate {
        /// Path to the SQLite source database
        #[arg(long)]
        source: PathBuf,

        /// Target connection string (postgres://...)
        #[arg(long)]
        target: String,

        /// Validate every row without writing to the target
        #[arg(long)]
        dry_run: bool,

        /// Rows per migration batch
        #[arg(long, default_value_t = DEFAULT_BATCH_SIZE, value_parser = clap::value_parser!(u64).range(1..))]
        batch_size: u64,

        /// Run the post-migration consistency check
        #[arg(long)]
        verify: bool,

        /// Maximum pooled connections to the target
        #[arg(long, default_value_t = 10)]
        pool_size: u32,
    },
    /// Report target health, entry count, and pool utilization
    Health {
        /// Target connection string (postgres://...)
        #[arg(long)]
        target: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("memshift_store=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    if let Err(err) = run(args) {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    match args.command {
        Command::Migrate {
            source,
            target,
            dry_run,
            batch_size,
            verify,
            pool_size,
        } => {
            let mut config = BackendConfig::postgres(target);
            config.pool.max_size = pool_size;
            let backend = PostgresBackend::new(config);
            let options = MigrationOptions {
                dry_run,
                batch_size,
                verify,
            };

            let stats = MigrationRunner::new(source, backend, options).run()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::Health { target } => {
            let backend = PostgresBackend::new(BackendConfig::postgres(target));
            backend.initialize()?;
            let status = backend.health_status();
            if let Err(err) = backend.shutdown() {
                eprintln!("Warning: shutdown failed: {}", err);
            }

            println!("{}", serde_json::to_string_pretty(&status)?);
            if status.healthy {
                Ok(())
            } else {
                Err("target unhealthy".into())
            }
        }
    }
}
