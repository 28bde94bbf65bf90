//! Registry mirror server
//!
//! ```bash
//! registry-server --config registry.toml serve
//! registry-server --config registry.toml sync --repository alpine
//! registry-server --config registry.toml gc
//! ```

use std::net::SocketAddr;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use eyre::{WrapErr, bail};
use registry_mirror::Catalog;
use registry_mirror::config::Config;
use registry_mirror::sync::Syncer;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "registry-server", about = "A read-only OCI registry mirror")]
struct Cli {
    /// Configuration file
    #[arg(long, short, default_value = "registry.toml")]
    config: Utf8PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the registry API
    Serve {
        /// Address to listen on, overriding the configuration
        #[arg(long)]
        listen: Option<SocketAddr>,
    },

    /// Run configured repository syncs and print their reports
    Sync {
        /// Only sync this repository
        #[arg(long)]
        repository: Option<String>,
    },

    /// Delete content no repository holds
    Gc,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let text = tokio::fs::read_to_string(&cli.config)
        .await
        .wrap_err_with(|| format!("reading {}", cli.config))?;
    let config: Config =
        toml_edit::de::from_str(&text).wrap_err_with(|| format!("parsing {}", cli.config))?;

    let storage = config
        .storage
        .clone()
        .build()
        .await
        .wrap_err("building storage")?;
    let catalog = Catalog::new(storage.bucket(config.bucket.clone()), config.algorithms.clone());

    match cli.command {
        Command::Serve { listen } => serve(&config, catalog, listen).await,
        Command::Sync { repository } => sync(&config, catalog, repository.as_deref()).await,
        Command::Gc => {
            let deleted = catalog.collect_garbage().await?;
            tracing::info!(deleted = deleted.len(), "garbage collected");
            for digest in deleted {
                println!("{digest}");
            }
            Ok(())
        }
    }
}

async fn serve(config: &Config, catalog: Catalog, listen: Option<SocketAddr>) -> eyre::Result<()> {
    let upstreams = config.upstreams()?;
    let router = config.registry(catalog, &upstreams)?.build()?;

    let addr = listen.unwrap_or(config.server.listen);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "registry listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(%error, "unable to listen for shutdown");
            }
        })
        .await?;
    Ok(())
}

async fn sync(config: &Config, catalog: Catalog, only: Option<&str>) -> eyre::Result<()> {
    let upstreams = config.upstreams()?;
    let repositories: Vec<_> = config
        .repository
        .iter()
        .filter(|repository| only.is_none_or(|name| repository.name == name))
        .collect();
    if repositories.is_empty() {
        bail!("no repository to sync");
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("cancelling sync");
                cancel.cancel();
            }
        }
    });

    let mut failed = 0;
    for repository in repositories {
        let Some(upstream) = upstreams.get(&repository.upstream) else {
            bail!(
                "repository {} names unknown upstream {}",
                repository.name,
                repository.upstream
            );
        };
        let syncer = Syncer::new(catalog.clone(), upstream.clone());
        let run = syncer
            .run(&repository.sync_options(), cancel.child_token())
            .await?;
        if run.error.is_some() {
            failed += 1;
        }
        println!("{}", serde_json::to_string_pretty(&run)?);
    }

    if failed > 0 {
        bail!("{failed} sync run(s) failed");
    }
    Ok(())
}
