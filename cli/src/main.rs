//! Command-line driver for a strata hierarchy over a SQLite store file

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::future::join_all;
use tracing::{error, info, warn};

use strata::{
    CascadeReport, Hierarchy, HierarchyConfig, Layer, LayerError, SqliteStoreProvider,
};

type SqliteHierarchy = Hierarchy<SqliteStoreProvider>;

/// Layered write-back cache in front of a SQLite file
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Store file (default: $STRATA_STORE_PATH or strata.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write one entity through a disposable writer
    Put { key: String, value: String },

    /// Delete one entity through a disposable writer
    Rm { key: String },

    /// Write many KEY=VALUE entities through the Bulk-Write layer
    Bulk { pairs: Vec<String> },

    /// Print an entity as seen from the Read layer
    Get { key: String },

    /// List the keys under a directory
    List {
        #[arg(default_value = "")]
        dir: String,
    },

    /// Run concurrent disposable writers, each saving one entity
    Demo {
        #[arg(short, long, default_value_t = 8)]
        writers: usize,
    },

    /// Delete the store file and start over
    Reset,
}

#[derive(Debug)]
struct CliError(String);

impl<E: std::error::Error> From<E> for CliError {
    fn from(e: E) -> Self {
        Self(e.to_string())
    }
}

type Result<T> = std::result::Result<T, CliError>;

fn report(report: &CascadeReport) {
    for hop in report.failures() {
        if let Err(e) = &hop.outcome {
            warn!(layer = %hop.layer, role = ?hop.role, error = %e, "cascade hop failed");
        }
    }
    if report.saved && !report.is_durable() {
        println!("saved, but not committed; run again to retry");
    }
}

/// Insert or update, depending on what the layer sees
async fn upsert(layer: &Layer, key: String, value: String) -> std::result::Result<(), LayerError> {
    if layer.fetch(&key).await?.is_some() {
        layer.update(key, value).await
    } else {
        layer.insert(key, value).await
    }
}

async fn put(hierarchy: &SqliteHierarchy, key: String, value: String) -> Result<()> {
    let writer = hierarchy.new_disposable_writer();
    upsert(&writer, key, value).await?;
    report(&writer.save().await?);
    Ok(())
}

async fn rm(hierarchy: &SqliteHierarchy, key: String) -> Result<()> {
    let writer = hierarchy.new_disposable_writer();
    if writer.fetch(&key).await?.is_none() {
        return Err(CliError(format!("no such entity: {key}")));
    }
    writer.delete(key).await?;
    report(&writer.save().await?);
    Ok(())
}

async fn bulk(hierarchy: &SqliteHierarchy, pairs: Vec<String>) -> Result<()> {
    let layer = hierarchy.bulk_write_layer();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(CliError(format!("expected KEY=VALUE, got {pair:?}")));
        };
        upsert(&layer, key.to_string(), value.to_string()).await?;
    }
    report(&layer.save().await?);
    Ok(())
}

async fn get(hierarchy: &SqliteHierarchy, key: &str) -> Result<()> {
    match hierarchy.read_layer().fetch(key).await? {
        Some(value) => println!("{}", String::from_utf8_lossy(&value)),
        None => return Err(CliError(format!("no such entity: {key}"))),
    }
    Ok(())
}

async fn list(hierarchy: &SqliteHierarchy, dir: &str) -> Result<()> {
    for key in hierarchy.read_layer().list(dir).await? {
        println!("{key}");
    }
    Ok(())
}

async fn demo(hierarchy: Arc<SqliteHierarchy>, writers: usize) -> Result<()> {
    let tasks = (0..writers).map(|i| {
        let hierarchy = Arc::clone(&hierarchy);
        tokio::spawn(async move {
            let writer = hierarchy.new_disposable_writer();
            let value = format!("written by {}", writer.id());
            upsert(&writer, format!("demo/{i}"), value).await?;
            let report = writer.save().await?;
            Ok::<_, CliError>(report)
        })
    });

    for result in join_all(tasks).await {
        report(&result??);
    }

    let stats = hierarchy.stats();
    info!(
        disposable = stats.disposable_saves,
        read = stats.read_saves,
        root = stats.root_saves,
        "demo done"
    );
    Ok(())
}

async fn run(hierarchy: Arc<SqliteHierarchy>, command: Commands) -> Result<()> {
    match command {
        Commands::Put { key, value } => put(&hierarchy, key, value).await,
        Commands::Rm { key } => rm(&hierarchy, key).await,
        Commands::Bulk { pairs } => bulk(&hierarchy, pairs).await,
        Commands::Get { key } => get(&hierarchy, &key).await,
        Commands::List { dir } => list(&hierarchy, &dir).await,
        Commands::Demo { writers } => demo(hierarchy, writers).await,
        Commands::Reset => Ok(hierarchy.reset().await?),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match HierarchyConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(db) = cli.db {
        config = config.with_store_path(db);
    }

    let hierarchy = match Hierarchy::open(config, SqliteStoreProvider::new()) {
        Ok(hierarchy) => Arc::new(hierarchy),
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let result = run(Arc::clone(&hierarchy), cli.command).await;

    // Anything a failed Root commit left behind gets one more try
    if let Err(e) = hierarchy.save().await {
        warn!(error = %e, "final flush failed");
    }
    if let Ok(hierarchy) = Arc::try_unwrap(hierarchy) {
        if let Err(e) = hierarchy.shutdown().await {
            warn!(error = %e, "closing store failed");
        }
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError(msg)) => {
            eprintln!("error: {msg}");
            ExitCode::FAILURE
        }
    }
}
