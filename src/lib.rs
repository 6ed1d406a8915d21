// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Multi-peer piece transfer engine.
//!
//! Content is described by a [`PieceTable`]: fixed-size pieces, each with an
//! expected digest, laid out over one or more files. [`start`] fetches the
//! pieces from peers supplied by a [`PeerSource`], verifies every piece
//! before it is written, and reports through the returned [`TransferHandle`].

pub mod command;
pub mod config;
pub mod errors;
pub mod manifest;
pub mod networking;
pub mod piece_table;
pub mod rate_limit;
pub mod shortcut;
pub mod storage;
pub mod transfer;
pub mod verifier;

pub use config::Settings;
pub use errors::TransferError;
pub use manifest::Manifest;
pub use piece_table::{FileEntry, HashAlgorithm, PieceTable};
pub use transfer::{
    start, start_with, PeerSource, Progress, TransferEvent, TransferHandle, TransferParameters,
    TransferStatus,
};
