// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use swarmget::config::{self, Settings};
use swarmget::manifest::{Manifest, DEFAULT_PIECE_SIZE};
use swarmget::{start_with, HashAlgorithm, Progress, TransferError, TransferParameters};

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Overrides RUST_LOG and the default INFO level.
    #[arg(long, global = true)]
    pub log_level: Option<LevelFilter>,

    /// Also log to stderr.
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Settings file to use instead of the per-user one.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Hash local files into a manifest.
    Manifest {
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = DEFAULT_PIECE_SIZE)]
        piece_size: u32,
        #[arg(long)]
        sha256: bool,
        /// Paths relative to --root, in stream order.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Download the content described by a manifest.
    Fetch {
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long = "peer")]
        peers: Vec<SocketAddr>,
        #[arg(long = "local-store")]
        local_stores: Vec<PathBuf>,
        /// Write the final progress snapshot here as JSON.
        #[arg(long)]
        status_file: Option<PathBuf>,
        #[arg(long)]
        listen_port: Option<u16>,
    },
    /// Write the effective settings to a TOML file.
    Config {
        /// Defaults to the per-user settings file.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Serve verified local content until interrupted.
    Seed {
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        port: u16,
    },
}

pub fn settings_for(cli: &Cli) -> Settings {
    match &cli.config {
        Some(path) => config::load_settings_from(path.clone()),
        None => config::load_settings(),
    }
}

pub fn run_config(settings: Settings, out: Option<PathBuf>) -> Result<(), TransferError> {
    let settings = settings.validated();
    let written = match out {
        Some(path) => {
            config::save_settings_to(&settings, &path)?;
            Some(path)
        }
        None => config::save_settings(&settings)?,
    };
    match written {
        Some(path) => println!("wrote {}", path.display()),
        None => println!("no settings directory available"),
    }
    Ok(())
}

pub async fn run_manifest(
    root: &Path,
    out: &Path,
    piece_size: u32,
    sha256: bool,
    files: &[PathBuf],
) -> Result<(), TransferError> {
    let algorithm = if sha256 {
        HashAlgorithm::Sha256
    } else {
        HashAlgorithm::Sha1
    };
    let manifest = Manifest::from_local_files(root, files, piece_size, algorithm).await?;
    manifest.save(out).await?;
    println!(
        "wrote {} ({} pieces, content id {})",
        out.display(),
        manifest.piece_hashes.len(),
        manifest.content_id
    );
    Ok(())
}

pub async fn run_fetch(
    mut settings: Settings,
    manifest: &Path,
    out: PathBuf,
    peers: Vec<SocketAddr>,
    local_stores: Vec<PathBuf>,
    status_file: Option<PathBuf>,
    listen_port: Option<u16>,
) -> Result<(), TransferError> {
    let table = Arc::new(Manifest::load(manifest).await?.into_piece_table()?);
    settings.local_stores.extend(local_stores);
    if listen_port.is_some() {
        settings.listen_port = listen_port;
    }

    let handle = start_with(TransferParameters {
        table,
        source: peers,
        destination: out,
        settings,
        listener: None,
    });

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, cancelling transfer");
                handle.request_cancel();
            }
            _ = ticker.tick() => {
                if handle.is_finished() {
                    break;
                }
                println!("{}", progress_line(&handle.progress()));
            }
        }
    }

    let final_progress = handle.progress();
    let result = handle.wait().await;
    println!("{}", progress_line(&final_progress));
    if let Some(path) = status_file {
        if let Err(e) = dump_status(&path, &final_progress).await {
            tracing::error!("Failed to write status file: {}", e);
        }
    }
    match &result {
        Ok(()) => println!("transfer complete"),
        Err(e) => println!("transfer failed: {}", e),
    }
    result
}

pub async fn run_seed(
    mut settings: Settings,
    manifest: &Path,
    dir: PathBuf,
    port: u16,
) -> Result<(), TransferError> {
    let table = Arc::new(Manifest::load(manifest).await?.into_piece_table()?);
    settings.listen_port = Some(port);
    settings.seed_after_complete = true;
    settings.resume = true;

    let handle = start_with(TransferParameters {
        table,
        source: Vec::<SocketAddr>::new(),
        destination: dir,
        settings,
        listener: None,
    });
    println!("seeding on port {}, press Ctrl-C to stop", port);

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                if handle.is_finished() {
                    break;
                }
                tracing::debug!("{}", progress_line(&handle.progress()));
            }
        }
    }
    handle.cancel().await
}

pub fn progress_line(progress: &Progress) -> String {
    format!(
        "{:>6.2}% {}/{} | {} peers | down {}/s | up {}/s | eta {} | {}",
        progress.fraction() * 100.0,
        format_bytes(progress.bytes_done),
        format_bytes(progress.bytes_total),
        progress.active_peers,
        format_bytes(progress.download_rate),
        format_bytes(progress.upload_rate),
        progress.eta.map_or_else(|| "--".to_string(), format_duration),
        progress.status
    )
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes < KB {
        format!("{} B", bytes)
    } else if bytes < MB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    }
}

pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h{:02}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m{:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Writes the snapshot as pretty JSON through a temp file and rename.
pub async fn dump_status(path: &Path, progress: &Progress) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(progress).map_err(std::io::Error::other)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let temp_path = path.with_extension("json.tmp");
    tokio::fs::write(&temp_path, json).await?;
    tokio::fs::rename(&temp_path, path).await
}
