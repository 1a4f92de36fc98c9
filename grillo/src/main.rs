//! # Grillo CLI Entry Point
//!
//! The main executable of the Grillo mock server. This file drives the application lifecycle:
//!
//! 1. **Initialization**: Parses command-line arguments using [`cli::Cli`] and installs the
//!    `tracing` subscriber.
//! 2. **Loading**: Builds the service registry from the schema sources and validates the rule
//!    document against it. Any problem here aborts the process before it starts serving.
//! 3. **Serving**: Runs the [`grillo_core::MockService`] until an interrupt signal arrives,
//!    reloading the rules on `SIGHUP`.
mod cli;
mod formatter;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands, SchemaArgs, ServerArgs};
use formatter::{CheckReport, FormattedString, ServiceList};
use grillo_core::{MockService, Registry, RuleStore, RulesHandle, SchemaLoader};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    init_tracing(&args.log_level);

    let result = match args.command {
        Commands::Serve {
            schema,
            rules,
            listen,
            server,
        } => serve(schema, rules, listen, server).await,
        Commands::Check { schema, rules } => check(schema, rules.as_deref()),
        Commands::List { schema } => list(schema),
    };

    if let Err(err) = result {
        eprintln!("{}", FormattedString::from(err));
        process::exit(1);
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_registry(schema: &SchemaArgs) -> anyhow::Result<Registry> {
    let mut loader = SchemaLoader::new(&schema.includes);
    loader
        .add_sources(&schema.protos)
        .context("Failed to load the schema")?;

    let registry = loader.finish();
    if registry.is_empty() {
        anyhow::bail!("The schema does not declare any service");
    }
    Ok(registry)
}

fn load_rules(registry: &Registry, path: Option<&Path>) -> anyhow::Result<RuleStore> {
    match path {
        Some(path) => RuleStore::from_path(registry, path)
            .with_context(|| format!("Failed to load rules from '{}'", path.display())),
        None => Ok(RuleStore::default()),
    }
}

async fn serve(
    schema: SchemaArgs,
    rules: Option<PathBuf>,
    listen: SocketAddr,
    server: ServerArgs,
) -> anyhow::Result<()> {
    let registry = Arc::new(load_registry(&schema)?);
    let store = load_rules(&registry, rules.as_deref())?;

    info!(
        services = registry.services().count(),
        methods = registry.methods().count(),
        rules = store.len(),
        "Loaded schema and rules"
    );

    let service = MockService::new(registry, RulesHandle::new(store), server.options());

    if let Some(path) = rules {
        reload_on_hangup(service.clone(), path)?;
    }

    grillo_core::serve(service, listen, shutdown_signal())
        .await
        .context("Server failed")
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Caught interrupt signal"),
        Err(err) => {
            error!(error = %err, "Failed to listen for the interrupt signal");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(unix)]
fn reload_on_hangup(service: MockService, path: PathBuf) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup =
        signal(SignalKind::hangup()).context("Failed to install the SIGHUP handler")?;

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match RuleStore::from_path(service.registry(), &path) {
                Ok(store) => {
                    info!(path = %path.display(), rules = store.len(), "Reloaded rules");
                    service.rules().replace(store);
                }
                Err(err) => warn!(
                    path = %path.display(),
                    error = %err,
                    "Failed to reload rules, keeping the previous ones"
                ),
            }
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn reload_on_hangup(_service: MockService, _path: PathBuf) -> anyhow::Result<()> {
    Ok(())
}

fn check(schema: SchemaArgs, rules: Option<&Path>) -> anyhow::Result<()> {
    let registry = load_registry(&schema)?;
    let store = rules.map(|path| load_rules(&registry, Some(path))).transpose()?;

    let report = CheckReport {
        services: registry.services().count(),
        methods: registry.methods().count(),
        rules: store.map(|store| store.len()),
    };
    println!("{}", FormattedString::from(report));
    Ok(())
}

fn list(schema: SchemaArgs) -> anyhow::Result<()> {
    let registry = load_registry(&schema)?;
    println!("{}", FormattedString::from(ServiceList(&registry)));
    Ok(())
}
