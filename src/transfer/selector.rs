// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use super::piece_manager::PieceManager;
use crate::networking::BlockInfo;

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

/// Which peers currently hold a request for each outstanding block.
pub type Assignments = BTreeMap<BlockInfo, BTreeSet<SocketAddr>>;

/// What the selector needs to know about the peer it is filling.
#[derive(Debug, Clone, Copy)]
pub struct PeerView<'a> {
    pub addr: SocketAddr,
    pub pieces: &'a [bool],
    pub in_flight: &'a BTreeSet<BlockInfo>,
    pub slots: usize,
}

pub fn is_endgame(piece_manager: &PieceManager, endgame_threshold: usize) -> bool {
    let outstanding = piece_manager.blocks_outstanding();
    outstanding > 0 && outstanding <= endgame_threshold as u64
}

/// Wanted pieces the peer advertises, rarest first, ties by ascending index.
pub fn rarest_first_order(piece_manager: &PieceManager, peer_pieces: &[bool]) -> Vec<u32> {
    let mut candidates: Vec<u32> = peer_pieces
        .iter()
        .enumerate()
        .filter(|(_, has)| **has)
        .map(|(index, _)| index as u32)
        .filter(|index| piece_manager.is_wanted(*index))
        .collect();
    candidates.sort_by_key(|index| (piece_manager.rarity(*index), *index));
    candidates
}

/// Picks up to `peer.slots` blocks for one peer.
///
/// Outside endgame a block is only handed out if nobody holds it. In endgame
/// any un-received block may be duplicated, but never to a peer that already
/// has it in flight.
pub fn pick_blocks(
    piece_manager: &PieceManager,
    assignments: &Assignments,
    peer: &PeerView<'_>,
    endgame: bool,
) -> Vec<BlockInfo> {
    let mut picked = Vec::new();
    if peer.slots == 0 {
        return picked;
    }
    let table = piece_manager.table();

    for piece_index in rarest_first_order(piece_manager, peer.pieces) {
        for range in table.block_ranges(piece_index) {
            if piece_manager.is_block_received(piece_index, range.offset) {
                continue;
            }
            let block = BlockInfo::new(piece_index, range.offset, range.length);
            if peer.in_flight.contains(&block) {
                continue;
            }
            let holders = assignments.get(&block);
            let available = if endgame {
                holders.map_or(true, |peers| !peers.contains(&peer.addr))
            } else {
                holders.map_or(true, |peers| peers.is_empty())
            };
            if !available {
                continue;
            }

            picked.push(block);
            if picked.len() == peer.slots {
                return picked;
            }
        }
    }
    picked
}
