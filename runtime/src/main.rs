use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use config_loader::ServiceConfig;
use scriptbox_runtime::server::{self, AppState};
use scriptbox_runtime::{auth, telemetry};
use tracing::{error, info};

/// Script execution service
#[derive(Debug, Parser)]
#[command(name = "scriptbox")]
#[command(about = "Runs uploaded scripts in isolated containers")]
struct Args {
    /// Path to the YAML service config
    #[arg(long, env = "SCRIPTBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    /// Output logs in JSON format
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print a bcrypt `passwordHash` for PASSWORD and exit
    #[arg(long, value_name = "PASSWORD")]
    hash_password: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if let Some(password) = args.hash_password.as_deref() {
        let hash = auth::hash_password(password, bcrypt::DEFAULT_COST)
            .context("hashing password")?;
        println!("{}", hash);
        return Ok(());
    }
    telemetry::init(args.log_json);

    let mut config =
        ServiceConfig::load(args.config.as_deref()).context("loading service config")?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Err(err) = config.validate() {
        error!("Invalid configuration: {}", err);
        return Err(err.into());
    }

    info!(
        data_dir = %config.data_dir.display(),
        docker_host = %config.docker_host,
        languages = ?config.languages.languages().collect::<Vec<_>>(),
        users = config.users.len(),
        "Starting scriptbox"
    );

    let state = AppState::from_config(&config)?;
    server::serve(&config.bind_addr, state).await
}
