// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod endpoints;
pub mod manager;
pub mod piece_manager;
pub mod progress;
pub mod selector;
pub mod state;

pub use manager::TransferManager;
pub use progress::{Progress, TransferStatus};

use crate::config::Settings;
use crate::errors::TransferError;
use crate::piece_table::PieceTable;

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    PieceCompleted {
        piece_index: u32,
    },
    TransferCompleted,
    TransferFailed(TransferError),
    PeerConnected {
        peer: SocketAddr,
    },
    PeerDisconnected {
        peer: SocketAddr,
        error: Option<TransferError>,
    },
}

/// Supplies candidate endpoints. The engine polls it once at startup and
/// again whenever it runs below `min_peers`; an empty batch means the source
/// has nothing new right now.
pub trait PeerSource: Send + 'static {
    fn fetch(&mut self) -> impl Future<Output = Vec<SocketAddr>> + Send;
}

/// A fixed list, handed out in full on every poll.
impl PeerSource for Vec<SocketAddr> {
    async fn fetch(&mut self) -> Vec<SocketAddr> {
        self.clone()
    }
}

/// Batches pushed by an external discovery task. Waits for the next batch;
/// once every sender is gone the source is dry.
impl PeerSource for mpsc::Receiver<Vec<SocketAddr>> {
    async fn fetch(&mut self) -> Vec<SocketAddr> {
        self.recv().await.unwrap_or_default()
    }
}

pub struct TransferParameters<S: PeerSource> {
    pub table: Arc<PieceTable>,
    pub source: S,
    pub destination: PathBuf,
    pub settings: Settings,
    /// Pre-bound listener for incoming sessions. When absent, one is bound on
    /// `settings.listen_port` if that is set.
    pub listener: Option<TcpListener>,
}

/// Starts a transfer with default settings. Must be called from within a
/// tokio runtime.
pub fn start<S: PeerSource>(
    table: Arc<PieceTable>,
    source: S,
    destination: impl Into<PathBuf>,
) -> TransferHandle {
    start_with(TransferParameters {
        table,
        source,
        destination: destination.into(),
        settings: Settings::default(),
        listener: None,
    })
}

pub fn start_with<S: PeerSource>(params: TransferParameters<S>) -> TransferHandle {
    let (progress_tx, progress_rx) = watch::channel(Progress {
        bytes_total: params.table.total_length(),
        pieces_total: params.table.piece_count(),
        ..Progress::default()
    });
    let (event_tx, event_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let (cancel_tx, cancel_rx) = mpsc::channel(1);

    let manager = TransferManager::new(manager::TransferManagerParameters {
        table: params.table,
        source: params.source,
        destination: params.destination,
        settings: params.settings.validated(),
        listener: params.listener,
        progress_tx,
        event_tx: event_tx.clone(),
        cancel_rx,
    });
    let task = tokio::spawn(manager.run());

    TransferHandle {
        progress_rx,
        event_tx,
        initial_events: Some(event_rx),
        cancel_tx,
        task,
    }
}

pub struct TransferHandle {
    progress_rx: watch::Receiver<Progress>,
    event_tx: broadcast::Sender<TransferEvent>,
    initial_events: Option<broadcast::Receiver<TransferEvent>>,
    cancel_tx: mpsc::Sender<()>,
    task: JoinHandle<Result<(), TransferError>>,
}

impl TransferHandle {
    pub fn progress(&self) -> Progress {
        self.progress_rx.borrow().clone()
    }

    /// Resolves on every progress publication.
    pub fn watch_progress(&self) -> watch::Receiver<Progress> {
        self.progress_rx.clone()
    }

    /// Events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.event_tx.subscribe()
    }

    /// The event stream. The first call sees every event since `start`.
    pub fn events(&mut self) -> BroadcastStream<TransferEvent> {
        let receiver = self
            .initial_events
            .take()
            .unwrap_or_else(|| self.event_tx.subscribe());
        BroadcastStream::new(receiver)
    }

    /// Asks the engine to stop without waiting for it.
    pub fn request_cancel(&self) {
        let _ = self.cancel_tx.try_send(());
    }

    /// Stops every session, waits for the engine to wind down and returns the
    /// final outcome (`TransferCancelled` unless it had already finished).
    pub async fn cancel(self) -> Result<(), TransferError> {
        self.request_cancel();
        self.wait().await
    }

    pub async fn wait(self) -> Result<(), TransferError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(TransferError::Io(format!("transfer task failed: {}", e))),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
