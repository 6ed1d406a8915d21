// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt;
use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::errors::TransferError;
use crate::networking::BlockInfo;

/// Manager -> session.
#[derive(Debug, PartialEq, Clone)]
pub enum PeerCommand {
    Request(Vec<BlockInfo>),
    Cancel(BlockInfo),
    /// Our pieces, sent once right after the handshake.
    Bitfield(Vec<u8>),
    Have(u32),
    Upload(BlockInfo, Vec<u8>),
    Unchoke,
    Interested,
    NotInterested,
    Disconnect,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ReturnReason {
    Choked,
    TimedOut,
    Rejected,
}

/// Everything that flows into the manager's single ingestion loop: session
/// reports, background task results and discovery.
#[derive(Debug)]
pub enum TransferCommand {
    SessionReady {
        peer: SocketAddr,
        peer_id: Vec<u8>,
    },
    PeerBitfield(SocketAddr, Vec<bool>),
    Have(SocketAddr, u32),
    Choked(SocketAddr),
    Unchoked(SocketAddr),
    PeerInterested(SocketAddr, bool),
    Block {
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
    UploadRequested(SocketAddr, BlockInfo),
    UploadCancelled(SocketAddr, BlockInfo),
    BlockSent {
        peer: SocketAddr,
        bytes: u64,
    },
    SessionClosed {
        peer: SocketAddr,
        error: Option<TransferError>,
    },
    ConnectFailed {
        peer: SocketAddr,
        error: TransferError,
    },
    IncomingConnection(TcpStream, SocketAddr),

    PeersDiscovered(Vec<SocketAddr>),

    PieceVerified {
        piece_index: u32,
        result: Result<(), TransferError>,
        data: Vec<u8>,
    },
    PieceWritten {
        piece_index: u32,
        result: Result<(), TransferError>,
    },
    UploadRead {
        peer: SocketAddr,
        block: BlockInfo,
        result: Result<Vec<u8>, TransferError>,
    },
}

pub struct TransferCommandSummary<'a>(pub &'a TransferCommand);
impl fmt::Debug for TransferCommandSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            TransferCommand::Block {
                peer,
                piece_index,
                offset,
                data,
            } => write!(
                f,
                "BLOCK(peer: {}, index: {}, begin: {}, len: {})",
                peer,
                piece_index,
                offset,
                data.len()
            ),
            TransferCommand::PeerBitfield(peer, bitfield) => write!(
                f,
                "PEER_BITFIELD(peer: {}, have: {}/{})",
                peer,
                bitfield.iter().filter(|b| **b).count(),
                bitfield.len()
            ),
            TransferCommand::PieceVerified {
                piece_index,
                result,
                ..
            } => write!(
                f,
                "PIECE_VERIFIED(index: {}, ok: {})",
                piece_index,
                result.is_ok()
            ),
            TransferCommand::UploadRead {
                peer,
                block,
                result,
            } => write!(
                f,
                "UPLOAD_READ(peer: {}, block: {:?}, ok: {})",
                peer,
                block,
                result.is_ok()
            ),
            TransferCommand::IncomingConnection(_, addr) => {
                write!(f, "INCOMING_CONNECTION({})", addr)
            }
            other => write!(f, "{:?}", other),
        }
    }
}
