// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

mod cli;

use cli::{Cli, Commands};
use swarmget::config;

use clap::Parser;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*};

const DEFAULT_LOG_FILTER: LevelFilter = LevelFilter::INFO;

fn log_level(cli: &Cli) -> LevelFilter {
    cli.log_level
        .or_else(|| env::var("RUST_LOG").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(DEFAULT_LOG_FILTER)
}

/// Daily rolling file log under the data dir, plus stderr with `--verbose`.
fn init_logging(cli: &Cli) -> Option<WorkerGuard> {
    let base_data_dir = config::get_app_paths()
        .map(|(_, data_dir)| data_dir)
        .unwrap_or_else(|| env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let log_dir = base_data_dir.join("logs");
    let filter = Targets::new().with_default(log_level(cli));

    let mut guard = None;
    let file_layer = match fs::create_dir_all(&log_dir).map_err(|e| e.to_string()).and_then(|_| {
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .max_log_files(31)
            .filename_prefix("swarmget")
            .filename_suffix("log")
            .build(&log_dir)
            .map_err(|e| e.to_string())
    }) {
        Ok(appender) => {
            let (non_blocking, worker_guard) = tracing_appender::non_blocking(appender);
            guard = Some(worker_guard);
            Some(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_filter(filter.clone()),
            )
        }
        Err(e) => {
            eprintln!("file logging disabled: {}", e);
            None
        }
    };
    let stderr_layer = cli.verbose.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(filter)
    });

    let _ = tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init();
    guard
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = init_logging(&cli);
    tracing::info!("STARTING SWARMGET");

    let settings = cli::settings_for(&cli);
    let result = match cli.command {
        Commands::Manifest {
            root,
            out,
            piece_size,
            sha256,
            files,
        } => cli::run_manifest(&root, &out, piece_size, sha256, &files).await,
        Commands::Fetch {
            manifest,
            out,
            peers,
            local_stores,
            status_file,
            listen_port,
        } => {
            cli::run_fetch(
                settings,
                &manifest,
                out,
                peers,
                local_stores,
                status_file,
                listen_port,
            )
            .await
        }
        Commands::Config { out } => cli::run_config(settings, out),
        Commands::Seed {
            manifest,
            dir,
            port,
        } => cli::run_seed(settings, &manifest, dir, port).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
