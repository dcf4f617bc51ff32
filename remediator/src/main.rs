//! Remediator - Entry Point
//!
//! Runs one deployment plan against its targets and prints the outcome.

use std::collections::HashMap;
use std::env;
use std::process::ExitCode;

use remediator::app::options::EngineOptions;
use remediator::app::run::{run, Plan};
use remediator::deploy::fsm::DeploymentStatus;
use remediator::filesys::file::File;
use remediator::logs::{init_logging, LogOptions};
use remediator::storage::layout::StorageLayout;
use remediator::storage::settings::Settings;
use remediator::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to render version: {e}"),
        }
        return ExitCode::SUCCESS;
    }

    let Some(plan_path) = cli_args.get("plan") else {
        eprintln!("Usage: remediator --plan=<file> [--settings=<file>]");
        return ExitCode::from(2);
    };

    // Load settings
    let settings_file = match cli_args.get("settings") {
        Some(path) => File::new(path),
        None => StorageLayout::default().settings_file(),
    };
    let settings = match Settings::load(&settings_file).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load settings from {}: {e}", settings_file.path().display());
            return ExitCode::FAILURE;
        }
    };

    let options = EngineOptions::from_settings(&settings);
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: settings
            .log_to_file
            .then(|| options.layout.logs_dir().path().to_path_buf()),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    let plan: Plan = match File::new(plan_path).read_json().await {
        Ok(plan) => plan,
        Err(e) => {
            error!("Failed to read plan {}: {e}", plan_path);
            return ExitCode::FAILURE;
        }
    };

    info!("Remediator {} ({}) starting", version.version, version.git_hash);
    match run(options, plan, await_shutdown_signal()).await {
        Ok(report) => {
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{}", json),
                Err(e) => error!("Failed to render report: {e}"),
            }
            if report.status == Some(DeploymentStatus::Success) {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!("Deployment run failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, cancelling...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, cancelling...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, cancelling...");
        }
    }
}
