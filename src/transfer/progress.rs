// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::TransferError;

use serde::Serialize;
use std::fmt;
use std::time::Duration;

const SMOOTHING_PERIOD_MS: f64 = 5000.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub enum TransferStatus {
    #[default]
    Connecting,
    Downloading,
    Endgame,
    /// No live sessions, but endpoints are still waiting out their backoff.
    Stalled,
    Seeding,
    Completed,
    Failed(TransferError),
    Cancelled,
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Connecting => write!(f, "Connecting"),
            TransferStatus::Downloading => write!(f, "Downloading"),
            TransferStatus::Endgame => write!(f, "Endgame"),
            TransferStatus::Stalled => write!(f, "Stalled"),
            TransferStatus::Seeding => write!(f, "Seeding"),
            TransferStatus::Completed => write!(f, "Completed"),
            TransferStatus::Failed(reason) => write!(f, "Failed: {}", reason),
            TransferStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed(_) | TransferStatus::Cancelled
        )
    }
}

/// Snapshot handed to callers through `TransferHandle::progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct Progress {
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub pieces_done: u32,
    pub pieces_total: u32,
    pub active_peers: usize,
    /// Bytes per second, smoothed.
    pub download_rate: u64,
    pub upload_rate: u64,
    pub eta: Option<Duration>,
    pub downloaded: u64,
    pub uploaded: u64,
    pub status: TransferStatus,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.bytes_total == 0 {
            return 1.0;
        }
        self.bytes_done as f64 / self.bytes_total as f64
    }
}

/// Byte counters and exponentially smoothed rates, advanced by the
/// manager's tick.
#[derive(Debug, Default, Clone)]
pub struct ProgressTracker {
    downloaded_in_interval: u64,
    uploaded_in_interval: u64,
    download_ema: f64,
    upload_ema: f64,
    total_downloaded: u64,
    total_uploaded: u64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_download(&mut self, bytes: u64) {
        self.downloaded_in_interval += bytes;
        self.total_downloaded += bytes;
    }

    pub fn record_upload(&mut self, bytes: u64) {
        self.uploaded_in_interval += bytes;
        self.total_uploaded += bytes;
    }

    pub fn tick(&mut self, dt_ms: u64) {
        let scaling_factor = if dt_ms > 0 {
            1000.0 / dt_ms as f64
        } else {
            1.0
        };
        let alpha = 1.0 - (-(dt_ms as f64) / SMOOTHING_PERIOD_MS).exp();

        let inst_download = self.downloaded_in_interval as f64 * scaling_factor;
        let inst_upload = self.uploaded_in_interval as f64 * scaling_factor;
        self.downloaded_in_interval = 0;
        self.uploaded_in_interval = 0;

        self.download_ema = inst_download * alpha + self.download_ema * (1.0 - alpha);
        self.upload_ema = inst_upload * alpha + self.upload_ema * (1.0 - alpha);
    }

    pub fn download_rate(&self) -> u64 {
        self.download_ema as u64
    }

    pub fn upload_rate(&self) -> u64 {
        self.upload_ema as u64
    }

    pub fn total_downloaded(&self) -> u64 {
        self.total_downloaded
    }

    pub fn total_uploaded(&self) -> u64 {
        self.total_uploaded
    }

    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        if remaining_bytes == 0 {
            return Some(Duration::ZERO);
        }
        let rate = self.download_ema;
        if rate < 1.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / rate))
    }
}
