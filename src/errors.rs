// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use serde::Serialize;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("range {offset}+{length} is outside the content (total {total} bytes)")]
    OutOfBounds { offset: u64, length: u64, total: u64 },
}

/// Every failure the engine can report, from a single session hiccup up to a
/// fatal transfer outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail")]
pub enum TransferError {
    #[error("connection to {0} timed out")]
    ConnectTimeout(SocketAddr),

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("piece {piece_index} failed hash verification")]
    HashMismatch { piece_index: u32 },

    #[error("piece {piece_index} failed verification {attempts} times, content integrity cannot be established")]
    PieceFailed { piece_index: u32, attempts: u32 },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("no peers available")]
    NoPeersAvailable,

    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("transfer cancelled")]
    TransferCancelled,
}

impl TransferError {
    /// Errors that close one session and hand its work back to the pool.
    pub fn is_session_local(&self) -> bool {
        matches!(
            self,
            TransferError::ConnectTimeout(_)
                | TransferError::HandshakeRejected(_)
                | TransferError::ProtocolViolation(_)
        )
    }

    pub fn is_content_integrity(&self) -> bool {
        matches!(
            self,
            TransferError::HashMismatch { .. } | TransferError::PieceFailed { .. }
        )
    }
}

impl From<StorageError> for TransferError {
    fn from(error: StorageError) -> Self {
        TransferError::Io(error.to_string())
    }
}

impl From<std::io::Error> for TransferError {
    fn from(error: std::io::Error) -> Self {
        TransferError::Io(error.to_string())
    }
}
