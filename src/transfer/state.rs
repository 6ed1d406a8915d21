// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use super::endpoints::{BackoffPolicy, EndpointBook};
use super::piece_manager::{BlockOutcome, PieceManager, PieceStatus};
use super::progress::{Progress, ProgressTracker, TransferStatus};
use super::selector::{is_endgame, pick_blocks, Assignments, PeerView};
use super::TransferEvent;

use crate::command::{PeerCommand, ReturnReason};
use crate::config::Settings;
use crate::errors::TransferError;
use crate::networking::{BlockInfo, ConnectionType};
use crate::piece_table::PieceTable;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::time::{Duration, Instant};
use tracing::{event, Level};

#[derive(Debug)]
pub enum Action {
    Tick {
        dt_ms: u64,
        now: Instant,
    },
    ValidationComplete {
        have: Vec<u32>,
        now: Instant,
    },
    PeersDiscovered {
        peers: Vec<SocketAddr>,
        now: Instant,
    },
    IncomingConnection {
        peer: SocketAddr,
    },
    ConnectFailed {
        peer: SocketAddr,
        error: TransferError,
        now: Instant,
        jitter: Duration,
    },
    SessionReady {
        peer: SocketAddr,
        peer_id: Vec<u8>,
    },
    SessionClosed {
        peer: SocketAddr,
        error: Option<TransferError>,
        now: Instant,
        jitter: Duration,
    },
    PeerBitfield {
        peer: SocketAddr,
        pieces: Vec<bool>,
    },
    PeerHave {
        peer: SocketAddr,
        piece_index: u32,
    },
    PeerChoked {
        peer: SocketAddr,
    },
    PeerUnchoked {
        peer: SocketAddr,
    },
    PeerInterested {
        peer: SocketAddr,
        interested: bool,
    },
    BlockReceived {
        peer: SocketAddr,
        piece_index: u32,
        offset: u32,
        data: Vec<u8>,
    },
    RequestsReturned {
        peer: SocketAddr,
        blocks: Vec<BlockInfo>,
        reason: ReturnReason,
    },
    UploadRequested {
        peer: SocketAddr,
        block: BlockInfo,
    },
    UploadCancelled {
        peer: SocketAddr,
        block: BlockInfo,
    },
    UploadRead {
        peer: SocketAddr,
        block: BlockInfo,
        result: Result<Vec<u8>, TransferError>,
    },
    BlockSent {
        peer: SocketAddr,
        bytes: u64,
    },
    PieceVerified {
        piece_index: u32,
        result: Result<(), TransferError>,
        data: Vec<u8>,
    },
    PieceWritten {
        piece_index: u32,
        result: Result<(), TransferError>,
    },
    Cancel,
}

#[derive(Debug)]
#[must_use]
pub enum Effect {
    StartSession {
        peer: SocketAddr,
        connection_type: ConnectionType,
    },
    SendToPeer {
        peer: SocketAddr,
        command: PeerCommand,
    },
    VerifyPiece {
        piece_index: u32,
        data: Vec<u8>,
    },
    WritePiece {
        piece_index: u32,
        data: Vec<u8>,
    },
    ReadBlock {
        peer: SocketAddr,
        block: BlockInfo,
    },
    DiscoverPeers,
    Emit(TransferEvent),
    /// The transfer reached a terminal status; stop the engine.
    Finish,
}

#[derive(Debug)]
pub struct PeerState {
    pub addr: SocketAddr,
    pub peer_id: Vec<u8>,
    pub connection_type: ConnectionType,
    pub ready: bool,
    pub pieces: Vec<bool>,
    pub peer_choking: bool,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_interested: bool,
    pub in_flight: BTreeSet<BlockInfo>,
    pub uploads: HashSet<BlockInfo>,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
}

impl PeerState {
    pub fn new(addr: SocketAddr, connection_type: ConnectionType, piece_count: u32) -> Self {
        Self {
            addr,
            peer_id: Vec::new(),
            connection_type,
            ready: false,
            pieces: vec![false; piece_count as usize],
            peer_choking: true,
            am_choking: true,
            am_interested: false,
            peer_interested: false,
            in_flight: BTreeSet::new(),
            uploads: HashSet::new(),
            bytes_downloaded: 0,
            bytes_uploaded: 0,
        }
    }
}

/// All mutable transfer state. Every piece transition goes through
/// [`TransferState::update`].
#[derive(Debug)]
pub struct TransferState {
    pub settings: Settings,
    pub piece_manager: PieceManager,
    pub endpoints: EndpointBook,
    pub peers: HashMap<SocketAddr, PeerState>,
    pub assignments: Assignments,
    pub progress: ProgressTracker,
    pub status: TransferStatus,
    pub validated: bool,
    pub endgame: bool,
    pub accepting_incoming: bool,
    pub source_dry: bool,
    pub last_discovery: Option<Instant>,
    verifying: HashMap<u32, BTreeSet<SocketAddr>>,
}

impl TransferState {
    pub fn new(table: Arc<PieceTable>, settings: Settings) -> Self {
        let policy = BackoffPolicy::from_settings(&settings);
        Self {
            piece_manager: PieceManager::new(table),
            endpoints: EndpointBook::new(policy),
            peers: HashMap::new(),
            assignments: Assignments::new(),
            progress: ProgressTracker::new(),
            status: TransferStatus::Connecting,
            validated: false,
            endgame: false,
            accepting_incoming: settings.listen_port.is_some(),
            source_dry: false,
            last_discovery: None,
            verifying: HashMap::new(),
            settings,
        }
    }

    pub fn table(&self) -> &Arc<PieceTable> {
        self.piece_manager.table()
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn active_peers(&self) -> usize {
        self.peers.values().filter(|peer| peer.ready).count()
    }

    pub fn our_bitfield(&self) -> Option<Vec<u8>> {
        let flags = self.piece_manager.have_flags();
        if flags.iter().any(|have| *have) {
            Some(crate::networking::protocol::pieces_to_bitfield(&flags))
        } else {
            None
        }
    }

    pub fn current_status(&self) -> TransferStatus {
        if self.status.is_terminal() || self.status == TransferStatus::Seeding {
            return self.status.clone();
        }
        if self.active_peers() == 0 {
            if self.endpoints.backing_off() > 0 {
                return TransferStatus::Stalled;
            }
            return TransferStatus::Connecting;
        }
        if self.endgame {
            TransferStatus::Endgame
        } else {
            TransferStatus::Downloading
        }
    }

    pub fn snapshot(&self) -> Progress {
        let table = self.table();
        let bytes_done = self.piece_manager.bytes_done();
        let bytes_total = table.total_length();
        Progress {
            bytes_done,
            bytes_total,
            pieces_done: self.piece_manager.pieces_done(),
            pieces_total: table.piece_count(),
            active_peers: self.active_peers(),
            download_rate: self.progress.download_rate(),
            upload_rate: self.progress.upload_rate(),
            eta: self.progress.eta(bytes_total.saturating_sub(bytes_done)),
            downloaded: self.progress.total_downloaded(),
            uploaded: self.progress.total_uploaded(),
            status: self.current_status(),
        }
    }

    pub fn update(&mut self, action: Action) -> Vec<Effect> {
        if self.is_finished() {
            return Vec::new();
        }

        match action {
            Action::Tick { dt_ms, now } => {
                self.progress.tick(dt_ms);
                let mut effects = Vec::new();
                if self.validated {
                    if self.peers.len() < self.settings.min_peers && self.discovery_due(now) {
                        self.last_discovery = Some(now);
                        effects.push(Effect::DiscoverPeers);
                    }
                    effects.extend(self.connect_more(now));
                    effects.extend(self.check_starvation());
                }
                effects
            }

            Action::ValidationComplete { have, now } => {
                let mut effects = Vec::new();
                for piece_index in have {
                    self.piece_manager.mark_have(piece_index);
                }
                self.validated = true;
                event!(
                    Level::INFO,
                    pieces_done = self.piece_manager.pieces_done(),
                    pieces_total = self.piece_manager.piece_count(),
                    "Local data validated"
                );

                if self.piece_manager.is_complete() {
                    effects.extend(self.complete());
                    return effects;
                }
                self.last_discovery = Some(now);
                effects.push(Effect::DiscoverPeers);
                effects.extend(self.connect_more(now));
                effects
            }

            Action::PeersDiscovered { peers, now } => {
                let added = peers
                    .into_iter()
                    .filter(|addr| self.endpoints.add(*addr))
                    .count();
                self.source_dry = added == 0;
                event!(Level::DEBUG, added, known = self.endpoints.len(), "Peers discovered");

                let mut effects = Vec::new();
                if self.validated {
                    effects.extend(self.connect_more(now));
                    effects.extend(self.check_starvation());
                }
                effects
            }

            Action::IncomingConnection { peer } => {
                if self.peers.len() >= self.settings.max_peers
                    || self.peers.contains_key(&peer)
                    || !self.endpoints.accept_incoming(peer)
                {
                    event!(Level::DEBUG, %peer, "Refusing incoming connection");
                    return Vec::new();
                }
                self.peers.insert(
                    peer,
                    PeerState::new(peer, ConnectionType::Incoming, self.piece_manager.piece_count()),
                );
                vec![Effect::StartSession {
                    peer,
                    connection_type: ConnectionType::Incoming,
                }]
            }

            Action::ConnectFailed {
                peer,
                error,
                now,
                jitter,
            } => {
                event!(Level::DEBUG, %peer, %error, "Connection attempt failed");
                let mut effects = self.drop_peer(&peer);
                self.endpoints.failed(&peer, now, jitter);
                effects.extend(self.connect_more(now));
                effects.extend(self.check_starvation());
                effects
            }

            Action::SessionReady { peer, peer_id } => {
                let Some(state) = self.peers.get_mut(&peer) else {
                    return Vec::new();
                };
                state.ready = true;
                state.peer_id = peer_id;
                self.endpoints.connected(&peer);
                event!(Level::INFO, %peer, "Peer connected");
                let mut effects = Vec::new();
                if let Some(bitfield) = self.our_bitfield() {
                    effects.push(Effect::SendToPeer {
                        peer,
                        command: PeerCommand::Bitfield(bitfield),
                    });
                }
                effects.push(Effect::Emit(TransferEvent::PeerConnected { peer }));
                effects
            }

            Action::SessionClosed {
                peer,
                error,
                now,
                jitter,
            } => {
                let was_ready = self.peers.get(&peer).is_some_and(|state| state.ready);
                let mut effects = self.drop_peer(&peer);
                self.endpoints.failed(&peer, now, jitter);
                if was_ready {
                    event!(Level::INFO, %peer, error = ?error, "Peer disconnected");
                    effects.push(Effect::Emit(TransferEvent::PeerDisconnected { peer, error }));
                }
                effects.extend(self.assign_all(None));
                effects.extend(self.connect_more(now));
                effects.extend(self.check_starvation());
                effects
            }

            Action::PeerBitfield { peer, pieces } => {
                let Some(state) = self.peers.get_mut(&peer) else {
                    return Vec::new();
                };
                self.piece_manager.remove_peer_pieces(&state.pieces);
                state.pieces = pieces;
                self.piece_manager.add_peer_pieces(&state.pieces);

                let mut effects = self.update_interest(&peer);
                effects.extend(self.assign_blocks(&peer));
                effects
            }

            Action::PeerHave { peer, piece_index } => {
                let Some(state) = self.peers.get_mut(&peer) else {
                    return Vec::new();
                };
                match state.pieces.get_mut(piece_index as usize) {
                    Some(has) if !*has => {
                        *has = true;
                        self.piece_manager.add_peer_have(piece_index);
                    }
                    _ => return Vec::new(),
                }

                let mut effects = self.update_interest(&peer);
                effects.extend(self.assign_blocks(&peer));
                effects
            }

            Action::PeerChoked { peer } => {
                if let Some(state) = self.peers.get_mut(&peer) {
                    state.peer_choking = true;
                }
                Vec::new()
            }

            Action::PeerUnchoked { peer } => {
                let Some(state) = self.peers.get_mut(&peer) else {
                    return Vec::new();
                };
                state.peer_choking = false;
                self.assign_blocks(&peer)
            }

            Action::PeerInterested { peer, interested } => {
                let Some(state) = self.peers.get_mut(&peer) else {
                    return Vec::new();
                };
                state.peer_interested = interested;
                if interested && state.am_choking {
                    state.am_choking = false;
                    return vec![Effect::SendToPeer {
                        peer,
                        command: PeerCommand::Unchoke,
                    }];
                }
                Vec::new()
            }

            Action::BlockReceived {
                peer,
                piece_index,
                offset,
                data,
            } => self.block_received(peer, piece_index, offset, data),

            Action::RequestsReturned {
                peer,
                blocks,
                reason,
            } => {
                let mut returned = 0;
                if let Some(state) = self.peers.get_mut(&peer) {
                    for block in &blocks {
                        if state.in_flight.remove(block) {
                            returned += 1;
                            release_assignment(&mut self.assignments, block, &peer);
                            release_if_idle(&mut self.piece_manager, &self.assignments, block.piece_index);
                        }
                    }
                }
                if returned == 0 {
                    return Vec::new();
                }
                event!(Level::DEBUG, %peer, ?reason, returned, "Requests returned to pool");
                self.assign_all(Some(&peer))
            }

            Action::UploadRequested { peer, block } => {
                let table = self.piece_manager.table().clone();
                let Some(state) = self.peers.get_mut(&peer) else {
                    return Vec::new();
                };
                let piece_length = table.piece_length(block.piece_index) as u64;
                let in_bounds = block.offset as u64 + block.length as u64 <= piece_length;
                if state.am_choking
                    || !in_bounds
                    || !self.piece_manager.has_piece(block.piece_index)
                    || !state.uploads.insert(block)
                {
                    return Vec::new();
                }
                vec![Effect::ReadBlock { peer, block }]
            }

            Action::UploadCancelled { peer, block } => {
                if let Some(state) = self.peers.get_mut(&peer) {
                    state.uploads.remove(&block);
                }
                Vec::new()
            }

            Action::UploadRead {
                peer,
                block,
                result,
            } => {
                let Some(state) = self.peers.get_mut(&peer) else {
                    return Vec::new();
                };
                if !state.uploads.remove(&block) {
                    return Vec::new();
                }
                match result {
                    Ok(data) => vec![Effect::SendToPeer {
                        peer,
                        command: PeerCommand::Upload(block, data),
                    }],
                    Err(e) => {
                        event!(Level::WARN, %peer, ?block, error = %e, "Failed to read block for upload");
                        Vec::new()
                    }
                }
            }

            Action::BlockSent { peer, bytes } => {
                self.progress.record_upload(bytes);
                if let Some(state) = self.peers.get_mut(&peer) {
                    state.bytes_uploaded += bytes;
                }
                Vec::new()
            }

            Action::PieceVerified {
                piece_index,
                result,
                data,
            } => match result {
                Ok(()) => {
                    event!(Level::DEBUG, piece_index, "Piece verified");
                    vec![Effect::WritePiece { piece_index, data }]
                }
                Err(_) => self.piece_failed(piece_index),
            },

            Action::PieceWritten { piece_index, result } => {
                if let Err(e) = result {
                    event!(Level::ERROR, piece_index, error = %e, "Giving up on piece write");
                    return self.fail(e);
                }
                self.piece_written(piece_index)
            }

            Action::Cancel => {
                event!(Level::INFO, "Transfer cancelled");
                self.status = if self.piece_manager.is_complete() {
                    TransferStatus::Completed
                } else {
                    TransferStatus::Cancelled
                };
                vec![Effect::Finish]
            }
        }
    }

    fn discovery_due(&self, now: Instant) -> bool {
        let interval = Duration::from_millis(self.settings.peer_refill_interval_ms);
        self.last_discovery
            .map_or(true, |last| now.saturating_duration_since(last) >= interval)
    }

    fn connect_more(&mut self, now: Instant) -> Vec<Effect> {
        if self.piece_manager.is_complete() {
            return Vec::new();
        }
        let free = self.settings.max_peers.saturating_sub(self.peers.len());
        if free == 0 {
            return Vec::new();
        }
        let piece_count = self.piece_manager.piece_count();
        let mut effects = Vec::new();
        for peer in self.endpoints.take_ready(now, free) {
            self.peers.insert(
                peer,
                PeerState::new(peer, ConnectionType::Outgoing, piece_count),
            );
            effects.push(Effect::StartSession {
                peer,
                connection_type: ConnectionType::Outgoing,
            });
        }
        effects
    }

    /// Fails the transfer once nothing could ever deliver the remaining pieces.
    fn check_starvation(&mut self) -> Vec<Effect> {
        if !self.validated
            || self.accepting_incoming
            || self.piece_manager.is_complete()
            || !self.source_dry
            || !self.peers.is_empty()
            || !self.endpoints.all_exhausted()
        {
            return Vec::new();
        }
        event!(Level::WARN, known = self.endpoints.len(), "Every peer exhausted its retries");
        self.fail(TransferError::NoPeersAvailable)
    }

    fn drop_peer(&mut self, addr: &SocketAddr) -> Vec<Effect> {
        let Some(state) = self.peers.remove(addr) else {
            return Vec::new();
        };
        self.piece_manager.remove_peer_pieces(&state.pieces);
        for block in &state.in_flight {
            release_assignment(&mut self.assignments, block, addr);
            release_if_idle(&mut self.piece_manager, &self.assignments, block.piece_index);
        }
        Vec::new()
    }

    fn update_interest(&mut self, addr: &SocketAddr) -> Vec<Effect> {
        let Some(state) = self.peers.get(addr) else {
            return Vec::new();
        };
        let wants = state
            .pieces
            .iter()
            .enumerate()
            .any(|(index, has)| *has && self.piece_manager.is_wanted(index as u32));

        let command = match (wants, state.am_interested) {
            (true, false) => PeerCommand::Interested,
            (false, true) => PeerCommand::NotInterested,
            _ => return Vec::new(),
        };
        if let Some(state) = self.peers.get_mut(addr) {
            state.am_interested = wants;
        }
        vec![Effect::SendToPeer {
            peer: *addr,
            command,
        }]
    }

    fn assign_blocks(&mut self, addr: &SocketAddr) -> Vec<Effect> {
        let pipeline_depth = self.settings.pipeline_depth;
        let endgame = is_endgame(&self.piece_manager, self.settings.endgame_threshold);
        self.endgame = endgame;

        let picked = {
            let Some(state) = self.peers.get(addr) else {
                return Vec::new();
            };
            if !state.ready || state.peer_choking || self.endpoints.is_banned(addr) {
                return Vec::new();
            }
            let view = PeerView {
                addr: *addr,
                pieces: &state.pieces,
                in_flight: &state.in_flight,
                slots: pipeline_depth.saturating_sub(state.in_flight.len()),
            };
            pick_blocks(&self.piece_manager, &self.assignments, &view, endgame)
        };
        if picked.is_empty() {
            return Vec::new();
        }

        if let Some(state) = self.peers.get_mut(addr) {
            for block in &picked {
                state.in_flight.insert(*block);
                self.assignments.entry(*block).or_default().insert(*addr);
                self.piece_manager.mark_requested(block.piece_index);
            }
        }
        vec![Effect::SendToPeer {
            peer: *addr,
            command: PeerCommand::Request(picked),
        }]
    }

    fn assign_all(&mut self, except: Option<&SocketAddr>) -> Vec<Effect> {
        let mut addrs: Vec<SocketAddr> = self
            .peers
            .keys()
            .filter(|addr| Some(*addr) != except)
            .copied()
            .collect();
        addrs.sort();
        addrs
            .iter()
            .flat_map(|addr| self.assign_blocks(addr))
            .collect()
    }

    fn block_received(
        &mut self,
        peer: SocketAddr,
        piece_index: u32,
        offset: u32,
        data: Vec<u8>,
    ) -> Vec<Effect> {
        let block = BlockInfo::new(piece_index, offset, data.len() as u32);
        let bytes = data.len() as u64;
        self.progress.record_download(bytes);
        if let Some(state) = self.peers.get_mut(&peer) {
            state.in_flight.remove(&block);
            state.bytes_downloaded += bytes;
        }
        release_assignment(&mut self.assignments, &block, &peer);

        let mut effects = Vec::new();
        let outcome = self
            .piece_manager
            .block_received(piece_index, offset, &data, peer);
        if outcome == BlockOutcome::Ignored {
            event!(Level::TRACE, %peer, ?block, "Ignoring duplicate or unexpected block");
        } else {
            // First copy wins; everyone else still asking for it is cancelled.
            if let Some(holders) = self.assignments.remove(&block) {
                for holder in holders {
                    if let Some(state) = self.peers.get_mut(&holder) {
                        state.in_flight.remove(&block);
                    }
                    effects.push(Effect::SendToPeer {
                        peer: holder,
                        command: PeerCommand::Cancel(block),
                    });
                }
            }
        }

        if let BlockOutcome::PieceComplete { data, contributors } = outcome {
            event!(Level::DEBUG, piece_index, "All blocks received, verifying");
            self.verifying.insert(piece_index, contributors);
            effects.push(Effect::VerifyPiece { piece_index, data });
        }

        let endgame = is_endgame(&self.piece_manager, self.settings.endgame_threshold);
        if endgame && !self.endgame {
            event!(
                Level::INFO,
                remaining = self.piece_manager.blocks_outstanding(),
                "Entering endgame"
            );
            self.endgame = true;
            effects.extend(self.assign_all(None));
        } else {
            self.endgame = endgame;
            effects.extend(self.assign_blocks(&peer));
        }
        effects
    }

    fn piece_failed(&mut self, piece_index: u32) -> Vec<Effect> {
        let contributors = self.verifying.remove(&piece_index).unwrap_or_default();
        let failures = self.piece_manager.record_failure(piece_index);
        event!(
            Level::WARN,
            piece_index,
            failures,
            peers = ?contributors,
            "Piece failed hash verification"
        );

        let mut effects = Vec::new();
        let peer_limit = self.settings.peer_hash_failure_limit;
        for contributor in &contributors {
            if self.endpoints.record_hash_failure(contributor, peer_limit)
                && self.peers.contains_key(contributor)
            {
                effects.push(Effect::SendToPeer {
                    peer: *contributor,
                    command: PeerCommand::Disconnect,
                });
            }
        }

        if failures >= self.settings.hash_failure_ceiling {
            self.piece_manager.mark_failed(piece_index);
            effects.extend(self.fail(TransferError::PieceFailed {
                piece_index,
                attempts: failures,
            }));
            return effects;
        }

        self.endgame = is_endgame(&self.piece_manager, self.settings.endgame_threshold);
        effects.extend(self.assign_all(None));
        effects
    }

    fn piece_written(&mut self, piece_index: u32) -> Vec<Effect> {
        if self.piece_manager.status(piece_index) != Some(PieceStatus::Verifying) {
            return Vec::new();
        }
        self.piece_manager.mark_have(piece_index);
        for contributor in self.verifying.remove(&piece_index).unwrap_or_default() {
            self.endpoints.record_good_piece(&contributor);
        }
        event!(
            Level::DEBUG,
            piece_index,
            done = self.piece_manager.pieces_done(),
            total = self.piece_manager.piece_count(),
            "Piece complete"
        );

        // Peers still connecting get the piece in their bitfield once ready.
        let mut effects: Vec<Effect> = self
            .peers
            .values()
            .filter(|state| state.ready)
            .map(|state| Effect::SendToPeer {
                peer: state.addr,
                command: PeerCommand::Have(piece_index),
            })
            .collect();
        effects.push(Effect::Emit(TransferEvent::PieceCompleted { piece_index }));

        if self.piece_manager.is_complete() {
            effects.extend(self.complete());
        }
        effects
    }

    fn complete(&mut self) -> Vec<Effect> {
        event!(Level::INFO, "Transfer complete");
        let mut effects = Vec::new();
        for state in self.peers.values_mut() {
            if state.am_interested {
                state.am_interested = false;
                effects.push(Effect::SendToPeer {
                    peer: state.addr,
                    command: PeerCommand::NotInterested,
                });
            }
        }
        effects.push(Effect::Emit(TransferEvent::TransferCompleted));

        if self.settings.seed_after_complete {
            self.status = TransferStatus::Seeding;
        } else {
            self.status = TransferStatus::Completed;
            effects.push(Effect::Finish);
        }
        effects
    }

    fn fail(&mut self, error: TransferError) -> Vec<Effect> {
        event!(Level::ERROR, error = %error, "Transfer failed");
        self.status = TransferStatus::Failed(error.clone());
        vec![
            Effect::Emit(TransferEvent::TransferFailed(error)),
            Effect::Finish,
        ]
    }
}

fn release_assignment(assignments: &mut Assignments, block: &BlockInfo, peer: &SocketAddr) {
    if let Some(holders) = assignments.get_mut(block) {
        holders.remove(peer);
        if holders.is_empty() {
            assignments.remove(block);
        }
    }
}

/// Puts a requested piece back to `Missing` once no block of it is in flight.
fn release_if_idle(piece_manager: &mut PieceManager, assignments: &Assignments, piece_index: u32) {
    let first = BlockInfo::new(piece_index, 0, 0);
    let in_flight = assignments
        .range(first..)
        .next()
        .is_some_and(|(block, _)| block.piece_index == piece_index);
    if !in_flight {
        piece_manager.release_if_untouched(piece_index);
    }
}
