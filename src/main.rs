use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_model::config::{DaqModelConfig, RemoteConfig};
use daq_model::executor::ExecutorPool;
use daq_model::logging::{self, LogFormat};
use daq_model::propagator::{MetadataPropagator, RuleSet};
use daq_model::registry::ComponentRegistry;
use daq_model::remote::{ComponentServer, RemoteBackend};
use daq_model::sim::{self, DriverRegistry};
use daq_model::Component;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "daq-modeld")]
#[command(about = "Hosts simulated instrument components and talks to running backends")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the backend daemon
    Serve {
        #[arg(long, short, default_value = "config/daq-model.toml")]
        config: PathBuf,
    },
    /// Print the components of a running backend, or only the named one
    Describe {
        #[arg(long, default_value = "127.0.0.1:7410")]
        address: String,
        component: Option<String>,
    },
    /// Read one attribute
    Get {
        #[arg(long, default_value = "127.0.0.1:7410")]
        address: String,
        component: String,
        attribute: String,
    },
    /// Write one attribute; the value is parsed as JSON, falling back to a string
    Set {
        #[arg(long, default_value = "127.0.0.1:7410")]
        address: String,
        component: String,
        attribute: String,
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => serve(config).await,
        Commands::Describe { address, component } => {
            logging::init("warn", LogFormat::Pretty)?;
            let backend = RemoteBackend::connect(&address, RemoteConfig::default()).await?;
            let proxies = match component {
                Some(name) => vec![backend.get(&name)?],
                None => backend.components().to_vec(),
            };
            for proxy in proxies {
                println!("{}", serde_json::to_string_pretty(proxy.descriptor())?);
            }
            Ok(())
        }
        Commands::Get {
            address,
            component,
            attribute,
        } => {
            logging::init("warn", LogFormat::Pretty)?;
            let backend = RemoteBackend::connect(&address, RemoteConfig::default()).await?;
            let proxy: Arc<dyn Component> = backend.get(&component)?;
            println!("{}", proxy.get(&attribute).await?);
            Ok(())
        }
        Commands::Set {
            address,
            component,
            attribute,
            value,
        } => {
            logging::init("warn", LogFormat::Pretty)?;
            let value = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
            let backend = RemoteBackend::connect(&address, RemoteConfig::default()).await?;
            let proxy: Arc<dyn Component> = backend.get(&component)?;
            proxy.set(&attribute, value).await?;
            Ok(())
        }
    }
}

async fn serve(path: PathBuf) -> Result<()> {
    let config = DaqModelConfig::load_from(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    logging::init(&config.application.log_level, config.application.log_format)?;
    info!(application = %config.application.name, config = %path.display(), "Starting backend");

    let pool = ExecutorPool::new();
    let registry = Arc::new(ComponentRegistry::new());
    if let Err(e) = sim::assemble(&config, &DriverRegistry::new(), &pool, &registry) {
        error!(error = %e, "Failed to build components");
        registry.shutdown().await.ok();
        pool.shutdown_all(config.backend.terminate_timeout()).await.ok();
        return Err(e.into());
    }

    let propagator = MetadataPropagator::start(&registry, RuleSet::standard()).await?;
    let server = ComponentServer::bind(Arc::clone(&registry), &config.backend.listen).await?;
    info!(address = %server.local_addr(), components = registry.len(), "Backend ready");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutting down");

    server.shutdown().await;
    propagator.stop().await;
    let components = registry.shutdown().await;
    let workers = pool.shutdown_all(config.backend.terminate_timeout()).await;
    components?;
    workers?;
    Ok(())
}
