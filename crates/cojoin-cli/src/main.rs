use clap::{Parser, Subcommand};
use cojoin::engine::crypto;
use cojoin::{run_server, EngineResult, SiteConfig, SiteServer};
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "cojoin")]
#[command(about = "Cojoin site server and tooling", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the site server
    Serve {
        /// TOML configuration file
        #[arg(long, env = "COJOIN_CONFIG")]
        config: Option<PathBuf>,
        /// Overrides server.port and PORT
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the resolved configuration as JSON (secrets omitted)
    CheckConfig {
        #[arg(long, env = "COJOIN_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Print fresh nonces, one per line
    Nonce {
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve { config, port } => serve(config, port),
        Commands::CheckConfig { config } => check_config(config),
        Commands::Nonce { count } => {
            for _ in 0..count {
                println!("{}", crypto::fresh_nonce());
            }
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn serve(path: Option<PathBuf>, port: Option<u16>) -> EngineResult<()> {
    let mut config = SiteConfig::load(path.as_deref())?;
    if let Some(p) = port {
        config.server.port = p;
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let server = Arc::new(SiteServer::new(config.server)?);
        let stop = Arc::new(AtomicBool::new(false));
        let signal = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("[server] Interrupt received, stopping");
                signal.store(true, Ordering::Relaxed);
            }
        });
        run_server(server, stop).await
    })
}

fn check_config(path: Option<PathBuf>) -> EngineResult<()> {
    let config = SiteConfig::load(path.as_deref())?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
