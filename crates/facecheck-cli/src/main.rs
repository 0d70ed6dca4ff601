use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use facecheck_core::{EmbeddingStore, ARCFACE_EMBEDDING_DIM};
use facecheck_hw::Camera;
use facecheck_store::{MemoryStore, RestConfig, RestStore, SqliteStore, Store};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod acquire;
mod config;
mod engine;
mod session;
mod workflow;

use acquire::ImageSource;
use config::{Config, StoreBackend};
use workflow::{Settings, Verifier};

#[derive(Parser)]
#[command(name = "facecheck", about = "Verify a face against a store of known faces")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/facecheck/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify one face from an image file or the camera
    Verify(VerifyArgs),
    /// Read commands from stdin; each one supersedes the one in flight
    Session,
    /// List stored face records
    List,
    /// Show configuration, model and store status
    Status,
    /// List V4L2 capture devices
    Devices,
}

#[derive(Args)]
#[group(required = true, multiple = false, id = "source")]
struct SourceArgs {
    /// Image file to verify
    #[arg(long)]
    image: Option<PathBuf>,
    /// Take a snapshot from the camera instead
    #[arg(long)]
    camera: bool,
}

#[derive(Args)]
struct VerifyArgs {
    #[command(flatten)]
    source: SourceArgs,
    /// Camera device (overrides camera_device from config)
    #[arg(long, requires = "camera")]
    device: Option<String>,
    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Verify(args) => verify(&config, args).await,
        Commands::Session => {
            let verifier = Arc::new(build_verifier(&config).await?);
            session::run(verifier, config.camera_device.clone()).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::List => {
            list(&config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status => {
            status(&config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Devices => {
            devices();
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn open_store(config: &Config) -> Result<Store> {
    let store = match config.store {
        StoreBackend::Sqlite => Store::Sqlite(
            SqliteStore::open(&config.db_path)
                .await
                .with_context(|| format!("opening {}", config.db_path.display()))?,
        ),
        StoreBackend::Rest => {
            let (Some(base_url), Some(api_key)) = (&config.rest_url, &config.rest_key) else {
                anyhow::bail!("rest store needs rest_url and rest_key");
            };
            Store::Rest(RestStore::new(&RestConfig {
                base_url: base_url.clone(),
                api_key: api_key.clone(),
                table: config.rest_table.clone(),
                timeout: Duration::from_secs(config.store_timeout_secs),
            })?)
        }
        StoreBackend::Memory => Store::Memory(MemoryStore::new()),
    };
    tracing::debug!(backend = store.backend(), "store ready");
    Ok(store)
}

async fn build_verifier(config: &Config) -> Result<Verifier<engine::OnnxProvider, Store>> {
    let store = open_store(config).await?;
    let provider = engine::spawn_engine(config.model_paths()).context("starting inference thread")?;
    Ok(Verifier::new(
        provider,
        store,
        Settings {
            threshold: config.match_threshold,
            strategy: config.match_strategy,
            timeouts: config.timeouts(),
            warmup: config.warmup(),
        },
    ))
}

async fn verify(config: &Config, args: VerifyArgs) -> Result<ExitCode> {
    let source = match args.source.image {
        Some(path) => ImageSource::File(path),
        None => ImageSource::Camera {
            device: args.device.unwrap_or_else(|| config.camera_device.clone()),
        },
    };
    let verifier = build_verifier(config).await?;

    let result = verifier.verify_source(&source).await;
    let code = if result.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    };

    if args.json {
        let value = match &result {
            Ok(report) => serde_json::to_value(report)?,
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        };
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        match &result {
            Ok(report) => {
                println!("{}", report.summary());
                if let Some(warning) = &report.persist_warning {
                    eprintln!("warning: {warning}");
                }
            }
            Err(e) => eprintln!("error: {e}"),
        }
    }
    Ok(code)
}

async fn list(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let records = store.list_all().await?;
    let rows: Vec<_> = records
        .iter()
        .map(|r| {
            serde_json::json!({
                "id": r.id,
                "dim": r.embedding.dim(),
                "model_version": r.embedding.model_version(),
                "created_at": r.created_at,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

async fn status(config: &Config) -> Result<()> {
    let paths = config.model_paths();
    let (backend, records) = match open_store(config).await {
        Ok(store) => {
            let count = match store.count().await {
                Ok(n) => serde_json::json!(n),
                Err(e) => serde_json::json!({ "error": e.to_string() }),
            };
            (store.backend(), count)
        }
        Err(e) => ("unavailable", serde_json::json!({ "error": format!("{e:#}") })),
    };

    let value = serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "models": {
            "detector": { "path": paths.detector, "present": paths.detector.exists() },
            "recognizer": { "path": paths.recognizer, "present": paths.recognizer.exists() },
            "ready": paths.all_present(),
            "embedding_dim": ARCFACE_EMBEDDING_DIM,
        },
        "store": {
            "backend": backend,
            "records": records,
        },
        "match": {
            "threshold": config.match_threshold,
            "strategy": config.match_strategy,
        },
        "camera_device": config.camera_device,
    });
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn devices() {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("no V4L2 capture devices found");
        return;
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_verify_needs_exactly_one_source() {
        assert!(Cli::try_parse_from(["facecheck", "verify"]).is_err());
        assert!(Cli::try_parse_from(["facecheck", "verify", "--image", "a.jpg", "--camera"]).is_err());
        assert!(Cli::try_parse_from(["facecheck", "verify", "--image", "a.jpg", "--device", "/dev/video1"]).is_err());

        let cli = Cli::try_parse_from(["facecheck", "verify", "--camera", "--device", "/dev/video2", "--json"]).unwrap();
        let Commands::Verify(args) = cli.command else {
            panic!("expected verify");
        };
        assert!(args.source.camera);
        assert_eq!(args.device.as_deref(), Some("/dev/video2"));
        assert!(args.json);
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::try_parse_from(["facecheck", "list", "--config", "/tmp/fc.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/fc.toml")));
    }

    #[tokio::test]
    async fn test_memory_store_from_config() {
        let mut config = Config::defaults(|_| None);
        config.store = StoreBackend::Memory;
        let store = open_store(&config).await.unwrap();
        assert_eq!(store.backend(), "memory");
    }
}
