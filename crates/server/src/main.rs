use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use gridserve_config::Settings;
use gridserve_engine::JsonEngine;
use gridserve_server::{DirectoryMonitor, MonitorConfig, Registry, Server};

/// Serve a directory of workbook documents over TCP.
#[derive(Parser)]
#[command(name = "gridserved", version, about)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address as host:port, overriding the config file
    #[arg(long)]
    listen: Option<String>,

    /// Directory of documents to serve
    #[arg(long)]
    documents_dir: Option<PathBuf>,

    /// Directory SAVE writes into
    #[arg(long)]
    save_dir: Option<PathBuf>,
}

fn apply_overrides(settings: &mut Settings, cli: &Cli) -> Result<(), String> {
    if let Some(listen) = &cli.listen {
        let (host, port) = listen
            .rsplit_once(':')
            .ok_or_else(|| format!("invalid listen address: {}", listen))?;
        settings.listen_host = host.to_string();
        settings.listen_port = port
            .parse()
            .map_err(|_| format!("invalid listen port: {}", port))?;
    }
    if let Some(dir) = &cli.documents_dir {
        settings.documents_dir = dir.clone();
    }
    if let Some(dir) = &cli.save_dir {
        settings.save_dir = dir.clone();
    }
    Ok(())
}

fn run(cli: Cli) -> Result<(), String> {
    let mut settings = Settings::load_or_default(cli.config.as_deref())
        .map_err(|e| format!("cannot load config: {}", e))?;
    apply_overrides(&mut settings, &cli)?;

    fs::create_dir_all(&settings.documents_dir)
        .map_err(|e| format!("cannot create {}: {}", settings.documents_dir.display(), e))?;
    fs::create_dir_all(&settings.save_dir)
        .map_err(|e| format!("cannot create {}: {}", settings.save_dir.display(), e))?;

    let registry = Arc::new(Registry::new());

    let _monitor = DirectoryMonitor::start(
        MonitorConfig {
            documents_dir: settings.documents_dir.clone(),
            poll_interval: settings.poll_interval(),
            reload_on_change: settings.reload_on_change,
        },
        Arc::clone(&registry),
        Arc::new(JsonEngine),
    );

    let _server = Server::start(&settings, registry)
        .map_err(|e| format!("cannot start server: {}", e))?;

    info!(
        "serving {} on {}:{}",
        settings.documents_dir.display(),
        settings.listen_host,
        settings.listen_port
    );

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("{}", message);
            ExitCode::FAILURE
        }
    }
}
