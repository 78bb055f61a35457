use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

mod breach;
mod condition;
mod config;
mod db;
mod engine;
mod error;
mod http;
mod models;
mod narrative;
mod report;
mod rules;
mod sample;
mod store;
mod template;

use config::EngineConfig;
use engine::{NarrativeEngine, RunReport};
use report::ExportFormat;
use rules::CancelFlag;

#[derive(Parser)]
#[command(name = "signal-narratives")]
#[command(
    about = "Turns business signals into deduplicated narratives via operator playbooks",
    long_about = None
)]
struct Cli {
    #[command(flatten)]
    options: GlobalOptions,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalOptions {
    /// Postgres connection string; not needed with --memory
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,
    /// Use in-process stores preloaded with sample data
    #[arg(long, global = true)]
    memory: bool,
    /// Deadline for each store call
    #[arg(long, env = "NARRATIVE_STORE_TIMEOUT_MS", global = true, default_value_t = 5_000)]
    store_timeout_ms: u64,
    /// Rules evaluated at the same time
    #[arg(long, env = "NARRATIVE_MAX_CONCURRENT_RULES", global = true, default_value_t = 8)]
    max_concurrent_rules: usize,
    /// Extra signal kind accepted in playbooks (repeatable)
    #[arg(long = "signal-kind", global = true)]
    signal_kinds: Vec<String>,
    /// Only consider signals whose period ended within this many days
    #[arg(long, env = "NARRATIVE_LOOKBACK_DAYS", global = true)]
    lookback_days: Option<i64>,
}

impl GlobalOptions {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_store_timeout_ms(self.store_timeout_ms)
            .with_max_concurrent_rules(self.max_concurrent_rules)
            .with_extra_signal_kinds(self.signal_kinds.clone())
            .with_lookback_days(self.lookback_days)
    }

    async fn connect(&self) -> anyhow::Result<PgPool> {
        let database_url = self
            .database_url
            .as_deref()
            .context("DATABASE_URL must be set to a Postgres instance (or pass --memory)")?;

        PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")
    }

    async fn engine(&self) -> anyhow::Result<NarrativeEngine> {
        let config = self.engine_config();
        if self.memory {
            let store = Arc::new(sample::memory_store().await?);
            return Ok(NarrativeEngine::new(store.clone(), store.clone(), store, config));
        }

        let store = Arc::new(db::PgStore::new(self.connect().await?));
        Ok(NarrativeEngine::new(store.clone(), store.clone(), store, config))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load sample signals and playbooks
    Seed,
    /// Import signals from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Evaluate every enabled playbook and write narratives for matches
    Evaluate,
    /// Evaluate playbooks, then write default narratives for unexplained breaches
    AutoGenerate,
    /// Render a stored narrative
    Export {
        #[arg(long)]
        id: Uuid,
        #[arg(long, default_value = "markdown")]
        format: String,
        /// Write to a file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Generate a markdown digest of active narratives
    Digest {
        #[arg(long, default_value = "digest.md")]
        out: PathBuf,
    },
    /// Serve the HTTP API
    Serve {
        #[arg(long, env = "NARRATIVE_BIND", default_value = "0.0.0.0:8000")]
        bind: SocketAddr,
    },
}

fn print_run(report: RunReport) -> anyhow::Result<()> {
    for result in &report.results {
        match (&result.error, result.matched) {
            (Some(error), _) => {
                println!("- [{}] {} invalid: {}", result.priority, result.rule_name, error)
            }
            (None, true) => println!(
                "- [{}] {} matched on {} signals",
                result.priority,
                result.rule_name,
                result.evidence.len()
            ),
            (None, false) => println!("- [{}] {} no match", result.priority, result.rule_name),
        }
    }
    println!(
        "Created {} narratives, skipped {} duplicates, {} template anomalies.",
        report.created.len(),
        report.duplicates_skipped,
        report.template_anomalies
    );
    if report.skipped_no_evidence > 0 {
        println!(
            "{} matched rules cited no signal and produced no narrative.",
            report.skipped_no_evidence
        );
    }
    for id in &report.created {
        println!("  {id}");
    }
    if report.cancelled {
        println!("Run cancelled before completion.");
    }

    match report.failure {
        Some(err) => Err(err).context("run stopped early; retry once the store is reachable"),
        None => Ok(()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let options = cli.options;

    match cli.command {
        Commands::InitDb => {
            let pool = options.connect().await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let pool = options.connect().await?;
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let pool = options.connect().await?;
            let inserted = db::import_csv(&pool, &csv).await?;
            println!("Inserted {inserted} signals from {}.", csv.display());
        }
        Commands::Evaluate => {
            let engine = options.engine().await?;
            print_run(engine.evaluate_rules(&CancelFlag::new()).await)?;
        }
        Commands::AutoGenerate => {
            let engine = options.engine().await?;
            print_run(engine.auto_generate(&CancelFlag::new()).await)?;
        }
        Commands::Export { id, format, out } => {
            let format: ExportFormat = format.parse()?;
            let engine = options.engine().await?;
            let bytes = engine.export(id, format).await?;
            match out {
                Some(path) => {
                    std::fs::write(&path, bytes)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("Narrative written to {}.", path.display());
                }
                None => println!("{}", String::from_utf8_lossy(&bytes)),
            }
        }
        Commands::Digest { out } => {
            let engine = options.engine().await?;
            let narratives = engine.active_narratives().await?;
            let digest = report::build_digest(&narratives);
            std::fs::write(&out, digest)?;
            println!("Digest written to {}.", out.display());
        }
        Commands::Serve { bind } => {
            let engine = Arc::new(options.engine().await?);
            let shutdown = CancelFlag::new();
            let app = http::router(http::AppState {
                engine,
                shutdown: shutdown.clone(),
            });

            let listener = tokio::net::TcpListener::bind(bind)
                .await
                .with_context(|| format!("failed to bind {bind}"))?;
            info!("signal-narratives listening on {}", bind);
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    tokio::signal::ctrl_c().await.ok();
                    info!("shutdown requested, cancelling in-flight runs");
                    shutdown.cancel();
                })
                .await
                .context("server error")?;
        }
    }

    Ok(())
}
