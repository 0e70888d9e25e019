use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use warden_domain::config::ConfigSeverity;
use warden_engine::warden::Warden;

mod cli;

use cli::{Cli, Command, ConfigCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed = Cli::parse();

    match parsed.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, _path) = cli::load_config()?;
            serve(config).await
        }
        Some(Command::Doctor) => {
            let (config, path) = cli::load_config()?;
            let passed = cli::doctor::run(&config, &path);
            if !passed {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, path) = cli::load_config()?;
            let valid = cli::config::validate(&config, &path);
            if !valid {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _path) = cli::load_config()?;
            cli::config::show(&config);
            Ok(())
        }
        Some(Command::Run { message, conversation, json }) => {
            let (config, _path) = cli::load_config()?;
            cli::run::run(config, message, conversation, json).await
        }
        Some(Command::Version) => {
            println!("warden {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,warden_engine=debug")))
        .json()
        .init();
}

/// Boot the full runtime and run the worker and scheduler loops forever.
async fn serve(config: warden_domain::config::Config) -> anyhow::Result<()> {
    tracing::info!("warden starting");

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues.iter().filter(|i| i.severity == ConfigSeverity::Error).count()
        );
    }

    let workspace_root = config.workspace.path.clone();
    std::fs::create_dir_all(&workspace_root)?;
    std::fs::create_dir_all(&config.store.path)?;

    let warden = Arc::new(Warden::new(config)?);
    tracing::info!(workspace = %workspace_root.display(), "runtime ready");

    let worker_count = 3;
    let mut workers = Vec::with_capacity(worker_count + 1);
    for i in 0..worker_count {
        let w = warden.clone();
        workers.push(tokio::spawn(async move {
            tracing::info!(worker = i, "worker loop started");
            w.run_worker_loop().await;
        }));
    }

    let scheduler_warden = warden.clone();
    workers.push(tokio::spawn(async move {
        tracing::info!("scheduler loop started");
        scheduler_warden.run_scheduler_loop().await;
    }));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    Ok(())
}
