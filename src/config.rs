// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use figment::providers::{Env, Format};
use figment::{providers::Toml, Figment};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub client_id: String,

    // Networking
    pub listen_port: Option<u16>,
    pub max_peers: usize,
    pub min_peers: usize,
    pub peer_refill_interval_ms: u64,
    pub download_limit_bps: u64,
    pub upload_limit_bps: u64,
    pub max_message_length: u32,

    // Pipelining / selection
    pub pipeline_depth: usize,
    pub endgame_threshold: usize,

    // Integrity
    pub hash_failure_ceiling: u32,
    pub peer_hash_failure_limit: u32,

    // Timeouts
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub idle_timeout_secs: u64,
    pub keep_alive_secs: u64,
    pub shutdown_grace_ms: u64,
    pub tick_interval_ms: u64,

    // Retry / backoff
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_jitter_ms: u64,
    pub max_connect_attempts: u32,
    pub write_retry_attempts: u32,

    // Disk
    pub resume: bool,
    pub seed_after_complete: bool,
    pub local_stores: Vec<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            listen_port: None,
            max_peers: 30,
            min_peers: 5,
            peer_refill_interval_ms: 5_000,
            download_limit_bps: 0,
            upload_limit_bps: 0,
            max_message_length: 1 << 17,
            pipeline_depth: 5,
            endgame_threshold: 4,
            hash_failure_ceiling: 3,
            peer_hash_failure_limit: 2,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            idle_timeout_secs: 120,
            keep_alive_secs: 60,
            shutdown_grace_ms: 2_000,
            tick_interval_ms: 1_000,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            backoff_jitter_ms: 100,
            max_connect_attempts: 5,
            write_retry_attempts: 5,
            resume: true,
            seed_after_complete: false,
            local_stores: Vec::new(),
        }
    }
}

impl Settings {
    /// Clamps knobs that would otherwise stall or spin the engine.
    pub fn validated(mut self) -> Self {
        self.max_peers = self.max_peers.max(1);
        self.pipeline_depth = self.pipeline_depth.max(1);
        self.hash_failure_ceiling = self.hash_failure_ceiling.max(1);
        self.peer_hash_failure_limit = self.peer_hash_failure_limit.max(1);
        self.max_connect_attempts = self.max_connect_attempts.max(1);
        self.write_retry_attempts = self.write_retry_attempts.max(1);
        self.tick_interval_ms = self.tick_interval_ms.max(10);
        self.backoff_max_ms = self.backoff_max_ms.max(self.backoff_base_ms);
        // A request frame must at least carry one full block.
        self.max_message_length = self.max_message_length.max(16_384 + 13);
        if self.client_id.len() != 20 {
            self.client_id = generate_client_id_string();
        }
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(1))
    }
}

/// Returns the (config, data) directories, creating them if needed.
pub fn get_app_paths() -> Option<(PathBuf, PathBuf)> {
    let proj_dirs = ProjectDirs::from("org", "swarmget", "swarmget")?;
    let config_dir = proj_dirs.config_dir().to_path_buf();
    let data_dir = proj_dirs.data_local_dir().to_path_buf();

    fs::create_dir_all(&config_dir).ok()?;
    fs::create_dir_all(&data_dir).ok()?;

    Some((config_dir, data_dir))
}

pub fn load_settings() -> Settings {
    if let Some((config_dir, _)) = get_app_paths() {
        let config_file_path = config_dir.join("settings.toml");
        return load_settings_from(config_file_path);
    }

    Figment::new()
        .merge(Env::prefixed("SWARMGET_"))
        .extract()
        .unwrap_or_default()
}

pub fn load_settings_from(config_file_path: PathBuf) -> Settings {
    match Figment::new()
        .merge(Toml::file(config_file_path))
        .merge(Env::prefixed("SWARMGET_"))
        .extract()
    {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!(error = %e, "Invalid settings, falling back to defaults");
            Settings::default()
        }
    }
}

/// Writes the per-user settings file. Returns where it went, if anywhere.
pub fn save_settings(settings: &Settings) -> io::Result<Option<PathBuf>> {
    let Some((config_dir, _)) = get_app_paths() else {
        return Ok(None);
    };
    let config_file_path = config_dir.join("settings.toml");
    save_settings_to(settings, &config_file_path)?;
    Ok(Some(config_file_path))
}

/// Pretty TOML through a temp file and rename, so readers never see a
/// half-written file.
pub fn save_settings_to(settings: &Settings, config_file_path: &Path) -> io::Result<()> {
    if let Some(parent) = config_file_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let temp_file_path = config_file_path.with_extension("toml.tmp");
    let content = toml::to_string_pretty(settings).map_err(io::Error::other)?;
    fs::write(&temp_file_path, content)?;
    fs::rename(&temp_file_path, config_file_path)
}

pub fn generate_client_id_string() -> String {
    use rand::Rng;

    const CLIENT_PREFIX: &str = "-SG0100-";
    const RANDOM_LEN: usize = 12;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

    let mut rng = rand::rng();
    let random_chars: String = (0..RANDOM_LEN)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect();

    format!("{}{}", CLIENT_PREFIX, random_chars)
}
