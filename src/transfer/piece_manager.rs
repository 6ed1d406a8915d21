// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::piece_table::PieceTable;

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use strum_macros::Display;
use tracing::{event, Level};

#[derive(PartialEq, Eq, Clone, Copy, Debug, Default, Display)]
pub enum PieceStatus {
    #[default]
    Missing,
    Requested,
    Verifying,
    Have,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Already received, out of geometry, or the piece is not being fetched.
    Ignored,
    Accepted,
    /// Last block arrived: the piece is now `Verifying`.
    PieceComplete {
        data: Vec<u8>,
        contributors: BTreeSet<SocketAddr>,
    },
}

#[derive(Debug, Clone)]
struct PieceAssembly {
    received: Vec<bool>,
    received_count: u32,
    buffer: Vec<u8>,
    contributors: BTreeSet<SocketAddr>,
}

/// Arena of per-piece state indexed by piece number. Only the transfer
/// reducer mutates it.
#[derive(Debug, Clone)]
pub struct PieceManager {
    table: Arc<PieceTable>,
    statuses: Vec<PieceStatus>,
    assemblies: HashMap<u32, PieceAssembly>,
    piece_rarity: Vec<u32>,
    failure_counts: Vec<u32>,
    pieces_done: u32,
    bytes_done: u64,
    blocks_outstanding: u64,
}

impl PieceManager {
    pub fn new(table: Arc<PieceTable>) -> Self {
        let piece_count = table.piece_count() as usize;
        let blocks_outstanding = table.total_blocks();
        Self {
            table,
            statuses: vec![PieceStatus::Missing; piece_count],
            assemblies: HashMap::new(),
            piece_rarity: vec![0; piece_count],
            failure_counts: vec![0; piece_count],
            pieces_done: 0,
            bytes_done: 0,
            blocks_outstanding,
        }
    }

    pub fn table(&self) -> &Arc<PieceTable> {
        &self.table
    }

    pub fn piece_count(&self) -> u32 {
        self.statuses.len() as u32
    }

    pub fn status(&self, piece_index: u32) -> Option<PieceStatus> {
        self.statuses.get(piece_index as usize).copied()
    }

    pub fn statuses(&self) -> &[PieceStatus] {
        &self.statuses
    }

    pub fn pieces_done(&self) -> u32 {
        self.pieces_done
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done
    }

    /// Blocks not yet received across pieces still being fetched.
    pub fn blocks_outstanding(&self) -> u64 {
        self.blocks_outstanding
    }

    pub fn is_complete(&self) -> bool {
        self.pieces_done == self.piece_count()
    }

    pub fn has_piece(&self, piece_index: u32) -> bool {
        self.status(piece_index) == Some(PieceStatus::Have)
    }

    /// Missing or partially requested.
    pub fn is_wanted(&self, piece_index: u32) -> bool {
        matches!(
            self.status(piece_index),
            Some(PieceStatus::Missing) | Some(PieceStatus::Requested)
        )
    }

    pub fn have_flags(&self) -> Vec<bool> {
        self.statuses
            .iter()
            .map(|status| *status == PieceStatus::Have)
            .collect()
    }

    pub fn rarity(&self, piece_index: u32) -> u32 {
        self.piece_rarity
            .get(piece_index as usize)
            .copied()
            .unwrap_or(0)
    }

    pub fn failure_count(&self, piece_index: u32) -> u32 {
        self.failure_counts
            .get(piece_index as usize)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_block_received(&self, piece_index: u32, block_offset: u32) -> bool {
        match self.status(piece_index) {
            Some(PieceStatus::Missing) | Some(PieceStatus::Requested) => {}
            Some(_) => return true,
            None => return false,
        }
        let block_index = (block_offset / self.table.block_size()) as usize;
        self.assemblies
            .get(&piece_index)
            .and_then(|assembly| assembly.received.get(block_index))
            .copied()
            .unwrap_or(false)
    }

    pub fn mark_requested(&mut self, piece_index: u32) {
        if let Some(status) = self.statuses.get_mut(piece_index as usize) {
            if *status == PieceStatus::Missing {
                *status = PieceStatus::Requested;
            }
        }
    }

    /// Returns a `Requested` piece with nothing received to `Missing`.
    pub fn release_if_untouched(&mut self, piece_index: u32) {
        let untouched = !self.assemblies.contains_key(&piece_index);
        if let Some(status) = self.statuses.get_mut(piece_index as usize) {
            if *status == PieceStatus::Requested && untouched {
                *status = PieceStatus::Missing;
            }
        }
    }

    /// Records a verified, persisted piece. Returns false if it was already `Have`.
    pub fn mark_have(&mut self, piece_index: u32) -> bool {
        let Some(status) = self.statuses.get(piece_index as usize).copied() else {
            return false;
        };
        if status == PieceStatus::Have {
            return false;
        }

        if matches!(status, PieceStatus::Missing | PieceStatus::Requested) {
            let received = self
                .assemblies
                .get(&piece_index)
                .map_or(0, |assembly| assembly.received_count);
            let pending = self.table.block_count(piece_index).saturating_sub(received);
            self.blocks_outstanding = self.blocks_outstanding.saturating_sub(pending as u64);
        }
        self.assemblies.remove(&piece_index);

        self.statuses[piece_index as usize] = PieceStatus::Have;
        self.pieces_done += 1;
        self.bytes_done += self.table.piece_length(piece_index) as u64;
        true
    }

    pub fn block_received(
        &mut self,
        piece_index: u32,
        block_offset: u32,
        data: &[u8],
        peer: SocketAddr,
    ) -> BlockOutcome {
        if !self.is_wanted(piece_index) {
            return BlockOutcome::Ignored;
        }
        let Some(range) = self.table.block_range(piece_index, block_offset) else {
            return BlockOutcome::Ignored;
        };
        if range.length as usize != data.len() {
            return BlockOutcome::Ignored;
        }

        let block_count = self.table.block_count(piece_index);
        let piece_length = self.table.piece_length(piece_index) as usize;
        let block_index = (block_offset / self.table.block_size()) as usize;

        let assembly = self
            .assemblies
            .entry(piece_index)
            .or_insert_with(|| PieceAssembly {
                received: vec![false; block_count as usize],
                received_count: 0,
                buffer: vec![0u8; piece_length],
                contributors: BTreeSet::new(),
            });
        if assembly.received[block_index] {
            return BlockOutcome::Ignored;
        }

        let start = block_offset as usize;
        assembly.buffer[start..start + data.len()].copy_from_slice(data);
        assembly.received[block_index] = true;
        assembly.received_count += 1;
        assembly.contributors.insert(peer);
        self.blocks_outstanding = self.blocks_outstanding.saturating_sub(1);

        if assembly.received_count < block_count {
            self.statuses[piece_index as usize] = PieceStatus::Requested;
            return BlockOutcome::Accepted;
        }

        let assembly = match self.assemblies.remove(&piece_index) {
            Some(assembly) => assembly,
            None => return BlockOutcome::Accepted,
        };
        self.statuses[piece_index as usize] = PieceStatus::Verifying;
        BlockOutcome::PieceComplete {
            data: assembly.buffer,
            contributors: assembly.contributors,
        }
    }

    /// Hash mismatch: discard everything and count the failure. Returns the
    /// new consecutive failure count.
    pub fn record_failure(&mut self, piece_index: u32) -> u32 {
        let index = piece_index as usize;
        if index >= self.statuses.len() {
            return 0;
        }
        self.assemblies.remove(&piece_index);
        if self.statuses[index] == PieceStatus::Verifying {
            self.blocks_outstanding += self.table.block_count(piece_index) as u64;
        }
        self.statuses[index] = PieceStatus::Missing;
        self.failure_counts[index] += 1;

        event!(
            Level::DEBUG,
            piece = piece_index,
            failures = self.failure_counts[index],
            "Resetting piece assembly after verification failure."
        );
        self.failure_counts[index]
    }

    pub fn mark_failed(&mut self, piece_index: u32) {
        let index = piece_index as usize;
        if index >= self.statuses.len() {
            return;
        }
        if matches!(
            self.statuses[index],
            PieceStatus::Missing | PieceStatus::Requested
        ) {
            let received = self
                .assemblies
                .remove(&piece_index)
                .map_or(0, |assembly| assembly.received_count);
            let pending = self.table.block_count(piece_index).saturating_sub(received);
            self.blocks_outstanding = self.blocks_outstanding.saturating_sub(pending as u64);
        }
        self.statuses[index] = PieceStatus::Failed;
    }

    pub fn add_peer_pieces(&mut self, pieces: &[bool]) {
        for (rarity, has) in self.piece_rarity.iter_mut().zip(pieces) {
            if *has {
                *rarity += 1;
            }
        }
    }

    pub fn remove_peer_pieces(&mut self, pieces: &[bool]) {
        for (rarity, has) in self.piece_rarity.iter_mut().zip(pieces) {
            if *has {
                *rarity = rarity.saturating_sub(1);
            }
        }
    }

    pub fn add_peer_have(&mut self, piece_index: u32) {
        if let Some(rarity) = self.piece_rarity.get_mut(piece_index as usize) {
            *rarity += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece_table::{FileEntry, HashAlgorithm, BLOCK_SIZE};
    use std::path::PathBuf;

    // Three pieces of two blocks each, the last one short.
    fn table() -> Arc<PieceTable> {
        let piece_size = BLOCK_SIZE * 2;
        let total = piece_size as u64 * 2 + 100;
        Arc::new(
            PieceTable::new(
                vec![1; 20],
                HashAlgorithm::Sha1,
                piece_size,
                vec![vec![0; 20]; 3],
                vec![FileEntry {
                    path: PathBuf::from("a.bin"),
                    length: total,
                }],
            )
            .unwrap(),
        )
    }

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_initial_state() {
        let pm = PieceManager::new(table());
        assert_eq!(pm.piece_count(), 3);
        assert!(pm.statuses().iter().all(|s| *s == PieceStatus::Missing));
        assert_eq!(pm.blocks_outstanding(), 5);
        assert!(!pm.is_complete());
    }

    #[test]
    fn test_blocks_assemble_into_a_piece() {
        let mut pm = PieceManager::new(table());
        let first = vec![1u8; BLOCK_SIZE as usize];
        let second = vec![2u8; BLOCK_SIZE as usize];

        assert_eq!(
            pm.block_received(0, BLOCK_SIZE, &second, peer(2)),
            BlockOutcome::Accepted
        );
        assert_eq!(pm.status(0), Some(PieceStatus::Requested));
        assert!(pm.is_block_received(0, BLOCK_SIZE));
        assert!(!pm.is_block_received(0, 0));

        match pm.block_received(0, 0, &first, peer(1)) {
            BlockOutcome::PieceComplete { data, contributors } => {
                assert_eq!(&data[..BLOCK_SIZE as usize], &first[..]);
                assert_eq!(&data[BLOCK_SIZE as usize..], &second[..]);
                assert_eq!(contributors.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(pm.status(0), Some(PieceStatus::Verifying));
        assert_eq!(pm.blocks_outstanding(), 3);
    }

    #[test]
    fn test_duplicate_and_malformed_blocks_are_ignored() {
        let mut pm = PieceManager::new(table());
        let block = vec![1u8; BLOCK_SIZE as usize];
        assert_eq!(pm.block_received(1, 0, &block, peer(1)), BlockOutcome::Accepted);
        assert_eq!(pm.block_received(1, 0, &block, peer(2)), BlockOutcome::Ignored);
        assert_eq!(pm.blocks_outstanding(), 4);

        // Misaligned offset, wrong length, out of range.
        assert_eq!(pm.block_received(1, 7, &block, peer(1)), BlockOutcome::Ignored);
        assert_eq!(pm.block_received(1, BLOCK_SIZE, &[0; 10], peer(1)), BlockOutcome::Ignored);
        assert_eq!(pm.block_received(9, 0, &block, peer(1)), BlockOutcome::Ignored);
    }

    #[test]
    fn test_short_final_piece() {
        let mut pm = PieceManager::new(table());
        match pm.block_received(2, 0, &[3u8; 100], peer(1)) {
            BlockOutcome::PieceComplete { data, .. } => assert_eq!(data, vec![3u8; 100]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_failure_resets_and_counts() {
        let mut pm = PieceManager::new(table());
        pm.block_received(2, 0, &[3u8; 100], peer(1));
        assert_eq!(pm.blocks_outstanding(), 4);

        assert_eq!(pm.record_failure(2), 1);
        assert_eq!(pm.status(2), Some(PieceStatus::Missing));
        assert_eq!(pm.blocks_outstanding(), 5);
        assert!(!pm.is_block_received(2, 0));

        pm.block_received(2, 0, &[3u8; 100], peer(1));
        assert_eq!(pm.record_failure(2), 2);

        pm.mark_failed(2);
        assert_eq!(pm.status(2), Some(PieceStatus::Failed));
        assert!(!pm.is_wanted(2));
        assert_eq!(pm.blocks_outstanding(), 4);
    }

    #[test]
    fn test_mark_have_accounting() {
        let mut pm = PieceManager::new(table());
        assert!(pm.mark_have(0));
        assert!(!pm.mark_have(0));
        assert_eq!(pm.pieces_done(), 1);
        assert_eq!(pm.bytes_done(), (BLOCK_SIZE * 2) as u64);
        assert_eq!(pm.blocks_outstanding(), 3);

        pm.block_received(1, 0, &vec![0u8; BLOCK_SIZE as usize], peer(1));
        assert!(pm.mark_have(1));
        assert_eq!(pm.blocks_outstanding(), 1);
        assert!(pm.mark_have(2));
        assert!(pm.is_complete());
        assert_eq!(pm.bytes_done(), pm.table().total_length());
        assert_eq!(pm.blocks_outstanding(), 0);
    }

    #[test]
    fn test_rarity_tracking() {
        let mut pm = PieceManager::new(table());
        pm.add_peer_pieces(&[true, true, false]);
        pm.add_peer_pieces(&[true, false, false]);
        pm.add_peer_have(2);
        assert_eq!((pm.rarity(0), pm.rarity(1), pm.rarity(2)), (2, 1, 1));

        pm.remove_peer_pieces(&[true, true, false]);
        assert_eq!((pm.rarity(0), pm.rarity(1), pm.rarity(2)), (1, 0, 1));
    }

    #[test]
    fn test_requested_release() {
        let mut pm = PieceManager::new(table());
        pm.mark_requested(0);
        assert_eq!(pm.status(0), Some(PieceStatus::Requested));
        pm.release_if_untouched(0);
        assert_eq!(pm.status(0), Some(PieceStatus::Missing));

        pm.block_received(0, 0, &vec![0u8; BLOCK_SIZE as usize], peer(1));
        pm.release_if_untouched(0);
        assert_eq!(pm.status(0), Some(PieceStatus::Requested));
    }
}
