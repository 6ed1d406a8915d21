// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use super::state::{Action, Effect, TransferState};
use super::{PeerSource, Progress, TransferEvent, TransferStatus};

use crate::command::{PeerCommand, TransferCommand, TransferCommandSummary};
use crate::config::Settings;
use crate::errors::TransferError;
use crate::networking::{
    protocol, BlockInfo, ConnectionType, PeerSession, PeerSessionParameters, SessionTimeouts,
};
use crate::piece_table::PieceTable;
use crate::rate_limit::RateLimiter;
use crate::shortcut;
use crate::storage::FileWriter;
use crate::verifier::PieceVerifier;

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{broadcast, watch};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{interval, timeout, Duration, Instant, MissedTickBehavior};
use tracing::{event, instrument, Level};

const MANAGER_CHANNEL_CAPACITY: usize = 1024;
const PEER_CHANNEL_CAPACITY: usize = 1024;
const WRITE_BACKOFF_BASE_MS: u64 = 50;
const WRITE_BACKOFF_JITTER_MS: u64 = 25;

struct PeerHandle {
    tx: Sender<PeerCommand>,
    abort: AbortHandle,
}

pub struct TransferManagerParameters<S: PeerSource> {
    pub table: Arc<PieceTable>,
    pub source: S,
    pub destination: PathBuf,
    pub settings: Settings,
    pub listener: Option<TcpListener>,
    pub progress_tx: watch::Sender<Progress>,
    pub event_tx: broadcast::Sender<TransferEvent>,
    pub cancel_rx: Receiver<()>,
}

/// Owns the reducer and runs everything it asks for: sessions, hashing,
/// disk I/O and discovery. All results come back through `manager_rx`.
pub struct TransferManager<S: PeerSource> {
    state: TransferState,
    settings: Settings,
    table: Arc<PieceTable>,
    writer: Arc<FileWriter>,
    verifier: PieceVerifier,

    source: Option<S>,
    discovery_tx: Option<Sender<()>>,
    listener: Option<TcpListener>,

    manager_tx: Sender<TransferCommand>,
    manager_rx: Receiver<TransferCommand>,
    cancel_rx: Receiver<()>,
    shutdown_tx: broadcast::Sender<()>,
    progress_tx: watch::Sender<Progress>,
    event_tx: broadcast::Sender<TransferEvent>,

    sessions: JoinSet<()>,
    peer_handles: HashMap<SocketAddr, PeerHandle>,
    pending_incoming: HashMap<SocketAddr, TcpStream>,

    download_limiter: Arc<RateLimiter>,
    upload_limiter: Arc<RateLimiter>,
    finished: bool,
}

impl<S: PeerSource> TransferManager<S> {
    pub fn new(params: TransferManagerParameters<S>) -> Self {
        let settings = params.settings;
        let (manager_tx, manager_rx) = mpsc::channel(MANAGER_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            state: TransferState::new(params.table.clone(), settings.clone()),
            writer: Arc::new(FileWriter::new(params.destination, params.table.clone())),
            verifier: PieceVerifier::new(params.table.clone()),
            table: params.table,
            source: Some(params.source),
            discovery_tx: None,
            listener: params.listener,
            manager_tx,
            manager_rx,
            cancel_rx: params.cancel_rx,
            shutdown_tx,
            progress_tx: params.progress_tx,
            event_tx: params.event_tx,
            sessions: JoinSet::new(),
            peer_handles: HashMap::new(),
            pending_incoming: HashMap::new(),
            download_limiter: Arc::new(RateLimiter::new(settings.download_limit_bps)),
            upload_limiter: Arc::new(RateLimiter::new(settings.upload_limit_bps)),
            finished: false,
            settings,
        }
    }

    #[instrument(skip(self), fields(content = %hex::encode(self.table.content_id())))]
    pub async fn run(mut self) -> Result<(), TransferError> {
        event!(
            Level::INFO,
            pieces = self.table.piece_count(),
            bytes = self.table.total_length(),
            destination = %self.writer.root().display(),
            "Starting transfer"
        );

        if let Err(e) = self.prepare().await {
            let effects = match e {
                TransferError::TransferCancelled => self.state.update(Action::Cancel),
                other => {
                    event!(Level::ERROR, error = %other, "Failed to prepare destination");
                    self.state.status = TransferStatus::Failed(other.clone());
                    vec![Effect::Emit(TransferEvent::TransferFailed(other))]
                }
            };
            self.handle_effects(effects);
            self.publish_progress();
            return self.outcome();
        }

        let mut tick = interval(Duration::from_millis(self.settings.tick_interval_ms));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();

        while !self.finished {
            tokio::select! {
                Some(()) = self.cancel_rx.recv() => {
                    self.apply_action(Action::Cancel);
                }

                _ = tick.tick() => {
                    let now = Instant::now();
                    let dt_ms = now.saturating_duration_since(last_tick).as_millis() as u64;
                    last_tick = now;
                    self.apply_action(Action::Tick { dt_ms, now });
                    self.publish_progress();
                }

                Some(command) = self.manager_rx.recv() => {
                    event!(Level::TRACE, command = ?TransferCommandSummary(&command));
                    self.handle_command(command);
                }

                Some(joined) = self.sessions.join_next(), if !self.sessions.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            event!(Level::ERROR, error = %e, "Session task panicked");
                        }
                    }
                }
            }
        }

        self.shutdown().await;
        self.publish_progress();
        self.outcome()
    }

    /// Local shortcut, resume validation and file allocation, in that order.
    async fn prepare(&mut self) -> Result<(), TransferError> {
        let destination = self.writer.root().to_path_buf();

        let mut have = Vec::new();
        let mut shortcut_taken = false;
        if !self.settings.local_stores.is_empty() {
            match shortcut::try_local_shortcut(&self.table, &self.settings.local_stores, &destination)
                .await
            {
                Ok(taken) => shortcut_taken = taken,
                Err(e) => {
                    event!(Level::WARN, error = %e, "Local copy failed, falling back to peers");
                }
            }
        }
        if self.cancel_rx.try_recv().is_ok() {
            return Err(TransferError::TransferCancelled);
        }

        if shortcut_taken {
            have.extend(0..self.table.piece_count());
        } else if self.settings.resume && self.writer.has_existing_data().await {
            have = self.perform_validation().await?;
        }

        self.writer.create_and_allocate_files().await?;

        if self.state.accepting_incoming || self.listener.is_some() {
            self.start_listener().await;
        }

        let effects = self.state.update(Action::ValidationComplete {
            have,
            now: Instant::now(),
        });
        self.handle_effects(effects);
        self.publish_progress();
        Ok(())
    }

    /// Re-hashes existing destination data; returns the pieces that match.
    async fn perform_validation(&mut self) -> Result<Vec<u32>, TransferError> {
        let mut have = Vec::new();
        for piece_index in 0..self.table.piece_count() {
            if self.cancel_rx.try_recv().is_ok() {
                return Err(TransferError::TransferCancelled);
            }
            let data = match self.writer.assemble_piece(piece_index).await {
                Ok(data) => data,
                Err(_) => continue,
            };
            let (result, _) = self.verifier.verify_owned(piece_index, data).await;
            if result.is_ok() {
                have.push(piece_index);
            }
        }
        event!(
            Level::INFO,
            valid = have.len(),
            total = self.table.piece_count(),
            "Resume validation finished"
        );
        Ok(have)
    }

    async fn start_listener(&mut self) {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => {
                let port = self.settings.listen_port.unwrap_or(0);
                match TcpListener::bind(("0.0.0.0", port)).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        event!(Level::WARN, port, error = %e, "Could not bind listener, incoming sessions disabled");
                        self.state.accepting_incoming = false;
                        return;
                    }
                }
            }
        };
        self.state.accepting_incoming = true;
        if let Ok(addr) = listener.local_addr() {
            event!(Level::INFO, %addr, "Accepting incoming sessions");
        }

        let manager_tx = self.manager_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            if manager_tx
                                .send(TransferCommand::IncomingConnection(stream, peer))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            event!(Level::DEBUG, error = %e, "Accept failed");
                        }
                    }
                }
            }
        });
    }

    fn jitter(&self) -> Duration {
        let max = self.settings.backoff_jitter_ms;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max))
    }

    fn handle_command(&mut self, command: TransferCommand) {
        let action = match command {
            TransferCommand::SessionReady { peer, peer_id } => Action::SessionReady { peer, peer_id },
            TransferCommand::PeerBitfield(peer, pieces) => Action::PeerBitfield { peer, pieces },
            TransferCommand::Have(peer, piece_index) => Action::PeerHave { peer, piece_index },
            TransferCommand::Choked(peer) => Action::PeerChoked { peer },
            TransferCommand::Unchoked(peer) => Action::PeerUnchoked { peer },
            TransferCommand::PeerInterested(peer, interested) => {
                Action::PeerInterested { peer, interested }
            }
            TransferCommand::Block {
                peer,
                piece_index,
                offset,
                data,
            } => Action::BlockReceived {
                peer,
                piece_index,
                offset,
                data,
            },
            TransferCommand::RequestsReturned {
                peer,
                blocks,
                reason,
            } => Action::RequestsReturned {
                peer,
                blocks,
                reason,
            },
            TransferCommand::UploadRequested(peer, block) => Action::UploadRequested { peer, block },
            TransferCommand::UploadCancelled(peer, block) => Action::UploadCancelled { peer, block },
            TransferCommand::BlockSent { peer, bytes } => Action::BlockSent { peer, bytes },
            TransferCommand::SessionClosed { peer, error } => {
                self.peer_handles.remove(&peer);
                Action::SessionClosed {
                    peer,
                    error,
                    now: Instant::now(),
                    jitter: self.jitter(),
                }
            }
            TransferCommand::ConnectFailed { peer, error } => {
                self.peer_handles.remove(&peer);
                Action::ConnectFailed {
                    peer,
                    error,
                    now: Instant::now(),
                    jitter: self.jitter(),
                }
            }
            TransferCommand::IncomingConnection(stream, peer) => {
                self.pending_incoming.insert(peer, stream);
                self.apply_action(Action::IncomingConnection { peer });
                // Refused connections are dropped here.
                self.pending_incoming.remove(&peer);
                return;
            }
            TransferCommand::PeersDiscovered(peers) => Action::PeersDiscovered {
                peers,
                now: Instant::now(),
            },
            TransferCommand::PieceVerified {
                piece_index,
                result,
                data,
            } => Action::PieceVerified {
                piece_index,
                result,
                data,
            },
            TransferCommand::PieceWritten { piece_index, result } => {
                Action::PieceWritten { piece_index, result }
            }
            TransferCommand::UploadRead {
                peer,
                block,
                result,
            } => Action::UploadRead {
                peer,
                block,
                result,
            },
        };
        self.apply_action(action);
    }

    fn apply_action(&mut self, action: Action) {
        let effects = self.state.update(action);
        self.handle_effects(effects);
    }

    fn handle_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            self.handle_effect(effect);
        }
    }

    fn handle_effect(&mut self, effect: Effect) {
        match effect {
            Effect::StartSession {
                peer,
                connection_type,
            } => self.start_session(peer, connection_type),

            Effect::SendToPeer { peer, command } => {
                let Some(handle) = self.peer_handles.get(&peer) else {
                    return;
                };
                match handle.tx.try_send(command) {
                    Ok(()) => {}
                    Err(TrySendError::Full(command)) => {
                        event!(
                            Level::WARN,
                            %peer,
                            capacity = handle.tx.max_capacity(),
                            ?command,
                            "Peer command queue full, dropping session"
                        );
                        // The session's close guard reports back and its blocks are released.
                        handle.abort.abort();
                    }
                    Err(TrySendError::Closed(_)) => {
                        event!(Level::TRACE, %peer, "Session already gone");
                    }
                }
            }

            Effect::VerifyPiece { piece_index, data } => {
                let verifier = self.verifier.clone();
                let manager_tx = self.manager_tx.clone();
                let mut shutdown_rx = self.shutdown_tx.subscribe();
                tokio::spawn(async move {
                    let (result, data) = tokio::select! {
                        biased;
                        _ = shutdown_rx.recv() => return,
                        outcome = verifier.verify_owned(piece_index, data) => outcome,
                    };
                    let _ = manager_tx
                        .send(TransferCommand::PieceVerified {
                            piece_index,
                            result,
                            data,
                        })
                        .await;
                });
            }

            Effect::WritePiece { piece_index, data } => {
                let writer = self.writer.clone();
                let manager_tx = self.manager_tx.clone();
                let mut shutdown_rx = self.shutdown_tx.subscribe();
                let attempts = self.settings.write_retry_attempts;
                tokio::spawn(async move {
                    let result =
                        write_piece_with_retry(&writer, piece_index, &data, attempts, &mut shutdown_rx)
                            .await;
                    if result == Err(TransferError::TransferCancelled) {
                        return;
                    }
                    let _ = manager_tx
                        .send(TransferCommand::PieceWritten { piece_index, result })
                        .await;
                });
            }

            Effect::ReadBlock { peer, block } => {
                let writer = self.writer.clone();
                let manager_tx = self.manager_tx.clone();
                let mut shutdown_rx = self.shutdown_tx.subscribe();
                tokio::spawn(async move {
                    let result = tokio::select! {
                        biased;
                        _ = shutdown_rx.recv() => return,
                        read = read_upload_block(&writer, block) => read,
                    };
                    let _ = manager_tx
                        .send(TransferCommand::UploadRead {
                            peer,
                            block,
                            result,
                        })
                        .await;
                });
            }

            Effect::DiscoverPeers => {
                if self.discovery_tx.is_none() {
                    self.discovery_tx = self.spawn_discovery();
                }
                if let Some(discovery_tx) = &self.discovery_tx {
                    // Full means a poll is already pending.
                    let _ = discovery_tx.try_send(());
                }
            }

            Effect::Emit(transfer_event) => {
                let _ = self.event_tx.send(transfer_event);
                self.publish_progress();
            }

            Effect::Finish => {
                self.finished = true;
            }
        }
    }

    fn spawn_discovery(&mut self) -> Option<Sender<()>> {
        let mut source = self.source.take()?;
        let (discovery_tx, mut discovery_rx) = mpsc::channel::<()>(1);
        let manager_tx = self.manager_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    poll = discovery_rx.recv() => {
                        if poll.is_none() {
                            break;
                        }
                    }
                }
                let peers = tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    peers = source.fetch() => peers,
                };
                event!(Level::DEBUG, count = peers.len(), "Peer source returned candidates");
                if manager_tx
                    .send(TransferCommand::PeersDiscovered(peers))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        Some(discovery_tx)
    }

    fn start_session(&mut self, peer: SocketAddr, connection_type: ConnectionType) {
        let (peer_tx, peer_rx) = mpsc::channel::<PeerCommand>(PEER_CHANNEL_CAPACITY);
        let session = PeerSession::new(PeerSessionParameters {
            peer,
            content_id: self.table.content_id().to_vec(),
            client_id: self.settings.client_id.as_bytes().to_vec(),
            piece_count: self.table.piece_count(),
            connection_type,
            commands_rx: peer_rx,
            manager_tx: self.manager_tx.clone(),
            download_limiter: self.download_limiter.clone(),
            upload_limiter: self.upload_limiter.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
            timeouts: SessionTimeouts::from_settings(&self.settings),
            pipeline_depth: self.settings.pipeline_depth,
            max_message_length: protocol::frame_limit_for(
                self.settings.max_message_length,
                self.table.block_size(),
                self.table.piece_count(),
            ),
        });

        let abort = match connection_type {
            ConnectionType::Outgoing => {
                let manager_tx = self.manager_tx.clone();
                let mut shutdown_rx = self.shutdown_tx.subscribe();
                let connect_timeout = self.settings.connect_timeout();
                self.sessions.spawn(async move {
                    let connection = tokio::select! {
                        biased;
                        _ = shutdown_rx.recv() => return,
                        connection = dial(peer, connect_timeout, TcpStream::connect(peer)) => connection,
                    };
                    let error = match connection {
                        Ok(stream) => {
                            let _ = session.run(stream).await;
                            return;
                        }
                        Err(error) => error,
                    };
                    let _ = manager_tx
                        .send(TransferCommand::ConnectFailed { peer, error })
                        .await;
                })
            }
            ConnectionType::Incoming => {
                let Some(stream) = self.pending_incoming.remove(&peer) else {
                    event!(Level::WARN, %peer, "No pending stream for incoming session");
                    let _ = self.manager_tx.try_send(TransferCommand::ConnectFailed {
                        peer,
                        error: TransferError::Io("incoming stream missing".to_string()),
                    });
                    return;
                };
                self.sessions.spawn(async move {
                    let _ = session.run(stream).await;
                })
            }
        };

        self.peer_handles.insert(
            peer,
            PeerHandle {
                tx: peer_tx,
                abort,
            },
        );
    }

    fn publish_progress(&self) {
        self.progress_tx.send_replace(self.state.snapshot());
    }

    fn outcome(&self) -> Result<(), TransferError> {
        match &self.state.status {
            TransferStatus::Failed(e) => Err(e.clone()),
            TransferStatus::Cancelled => Err(TransferError::TransferCancelled),
            _ => Ok(()),
        }
    }

    /// Signals every task to stop and gives sessions the grace period to close
    /// their sockets before aborting the rest.
    async fn shutdown(&mut self) {
        event!(Level::INFO, status = %self.state.status, sessions = self.sessions.len(), "Shutting down transfer");
        let _ = self.shutdown_tx.send(());
        self.peer_handles.clear();
        self.discovery_tx = None;

        let grace = Duration::from_millis(self.settings.shutdown_grace_ms);
        let sessions = &mut self.sessions;
        let drained = timeout(grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            event!(Level::WARN, remaining = self.sessions.len(), "Sessions did not close in time, aborting");
            self.sessions.abort_all();
            while self.sessions.join_next().await.is_some() {}
        }
    }
}

async fn dial<T>(
    peer: SocketAddr,
    connect_timeout: Duration,
    connect: impl Future<Output = io::Result<T>>,
) -> Result<T, TransferError> {
    match timeout(connect_timeout, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(TransferError::Io(format!("connect to {} failed: {}", peer, e))),
        Err(_) => Err(TransferError::ConnectTimeout(peer)),
    }
}

async fn write_piece_with_retry(
    writer: &FileWriter,
    piece_index: u32,
    data: &[u8],
    max_attempts: u32,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<(), TransferError> {
    let mut attempt = 0;
    loop {
        let result = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return Err(TransferError::TransferCancelled),
            result = writer.write_block(piece_index, 0, data) => result,
        };
        let error = match result {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        attempt += 1;
        if attempt >= max_attempts {
            event!(Level::ERROR, piece_index, attempt, error = %error, "Disk write failed permanently");
            return Err(error.into());
        }

        let backoff = WRITE_BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(16));
        let jitter = rand::rng().random_range(0..=WRITE_BACKOFF_JITTER_MS);
        let duration = Duration::from_millis(backoff + jitter);
        event!(
            Level::WARN,
            piece_index,
            attempt,
            duration_ms = duration.as_millis() as u64,
            error = %error,
            "Retrying disk write"
        );
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return Err(TransferError::TransferCancelled),
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

async fn read_upload_block(writer: &FileWriter, block: BlockInfo) -> Result<Vec<u8>, TransferError> {
    Ok(writer
        .read_block(block.piece_index, block.offset, block.length)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece_table::{FileEntry, HashAlgorithm};
    use crate::transfer::{start_with, TransferParameters};
    use crate::verifier::digest;
    use tempfile::tempdir;

    fn table(content: &[u8], piece_size: u32) -> Arc<PieceTable> {
        let hashes = content
            .chunks(piece_size as usize)
            .map(|chunk| digest(HashAlgorithm::Sha1, chunk))
            .collect();
        Arc::new(
            PieceTable::new(
                vec![8; 20],
                HashAlgorithm::Sha1,
                piece_size,
                hashes,
                vec![FileEntry {
                    path: PathBuf::from("payload.bin"),
                    length: content.len() as u64,
                }],
            )
            .unwrap(),
        )
    }

    fn quick_settings() -> Settings {
        Settings {
            min_peers: 1,
            peer_refill_interval_ms: 50,
            tick_interval_ms: 20,
            connect_timeout_ms: 200,
            backoff_base_ms: 10,
            backoff_max_ms: 20,
            backoff_jitter_ms: 0,
            max_connect_attempts: 2,
            shutdown_grace_ms: 200,
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn test_resume_of_complete_data_needs_no_peers() {
        let dir = tempdir().unwrap();
        let content: Vec<u8> = (0..5000u32).map(|i| (i % 97) as u8).collect();
        std::fs::write(dir.path().join("payload.bin"), &content).unwrap();

        let handle = start_with(TransferParameters {
            table: table(&content, 1024),
            source: Vec::<SocketAddr>::new(),
            destination: dir.path().to_path_buf(),
            settings: quick_settings(),
            listener: None,
        });
        let progress_rx = handle.watch_progress();
        assert_eq!(handle.wait().await, Ok(()));
        let progress = progress_rx.borrow().clone();
        assert_eq!(progress.status, TransferStatus::Completed);
        assert_eq!(progress.bytes_done, 5000);
        assert_eq!(progress.active_peers, 0);
    }

    #[tokio::test]
    async fn test_partial_resume_keeps_only_valid_pieces() {
        let dir = tempdir().unwrap();
        let content: Vec<u8> = (0..4096u32).map(|i| (i % 89) as u8).collect();
        let mut on_disk = content.clone();
        on_disk[3000] ^= 0x01;
        std::fs::write(dir.path().join("payload.bin"), &on_disk).unwrap();

        let (_tx, rx) = mpsc::channel::<Vec<SocketAddr>>(1);
        let handle = start_with(TransferParameters {
            table: table(&content, 1024),
            source: rx,
            destination: dir.path().to_path_buf(),
            settings: quick_settings(),
            listener: None,
        });
        let mut progress_rx = handle.watch_progress();
        let progress = progress_rx
            .wait_for(|p| p.pieces_done > 0)
            .await
            .unwrap()
            .clone();
        assert_eq!(progress.pieces_done, 3);
        assert_eq!(progress.bytes_done, 3072);
        assert_eq!(handle.cancel().await, Err(TransferError::TransferCancelled));
    }

    #[tokio::test]
    async fn test_no_peers_available_with_dry_source() {
        let dir = tempdir().unwrap();
        let content = vec![1u8; 2048];
        // Nothing listens on a freshly released port.
        let unused = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let mut handle = start_with(TransferParameters {
            table: table(&content, 1024),
            source: vec![unused],
            destination: dir.path().to_path_buf(),
            settings: quick_settings(),
            listener: None,
        });
        let mut events = handle.events();
        let result = timeout(Duration::from_secs(10), handle.wait())
            .await
            .expect("transfer should give up");
        assert_eq!(result, Err(TransferError::NoPeersAvailable));

        use tokio_stream::StreamExt;
        let mut saw_failure = false;
        while let Some(Ok(event)) = events.next().await {
            if event == TransferEvent::TransferFailed(TransferError::NoPeersAvailable) {
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_cancel_reports_cancelled() {
        let dir = tempdir().unwrap();
        let content = vec![2u8; 2048];
        let (_tx, rx) = mpsc::channel::<Vec<SocketAddr>>(1);
        let handle = start_with(TransferParameters {
            table: table(&content, 1024),
            source: rx,
            destination: dir.path().to_path_buf(),
            settings: quick_settings(),
            listener: None,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        let progress = handle.progress();
        assert_eq!(progress.bytes_total, 2048);

        let result = timeout(Duration::from_secs(5), handle.cancel())
            .await
            .expect("cancel should finish within the grace period");
        assert_eq!(result, Err(TransferError::TransferCancelled));
    }

    #[tokio::test]
    async fn test_unwritable_destination_fails() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let content = vec![3u8; 100];

        let handle = start_with(TransferParameters {
            table: table(&content, 100),
            source: Vec::<SocketAddr>::new(),
            destination: blocker,
            settings: quick_settings(),
            listener: None,
        });
        let result = handle.wait().await;
        assert!(matches!(result, Err(TransferError::Io(_))), "{:?}", result);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_maps_timeout_and_refusal() {
        let peer: SocketAddr = "10.0.0.9:6881".parse().unwrap();
        let stalled = dial(
            peer,
            Duration::from_secs(10),
            std::future::pending::<io::Result<()>>(),
        );
        assert_eq!(stalled.await, Err(TransferError::ConnectTimeout(peer)));

        let refused = dial(peer, Duration::from_secs(10), async {
            Err::<(), _>(io::Error::from(io::ErrorKind::ConnectionRefused))
        })
        .await;
        assert!(matches!(refused, Err(TransferError::Io(_))), "{:?}", refused);
    }

    #[tokio::test]
    async fn test_silent_peer_is_retried_until_exhausted() {
        let dir = tempdir().unwrap();
        let content = vec![4u8; 2048];
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent = listener.local_addr().unwrap();
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                held.push(stream);
            }
        });

        let handle = start_with(TransferParameters {
            table: table(&content, 1024),
            source: vec![silent],
            destination: dir.path().to_path_buf(),
            settings: Settings {
                handshake_timeout_ms: 100,
                ..quick_settings()
            },
            listener: None,
        });
        let result = timeout(Duration::from_secs(10), handle.wait())
            .await
            .expect("handshake timeouts should exhaust the peer");
        assert_eq!(result, Err(TransferError::NoPeersAvailable));
        assert_eq!(
            accepted.load(std::sync::atomic::Ordering::SeqCst),
            quick_settings().max_connect_attempts as usize
        );
    }
}
