// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::{StorageError, TransferError};

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use strum_macros::{Display, EnumIter};

pub const BLOCK_SIZE: u32 = 16_384;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumIter)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    #[strum(serialize = "sha1")]
    Sha1,
    #[strum(serialize = "sha256")]
    Sha256,
}

impl HashAlgorithm {
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf, // Relative to the destination root.
    pub length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRange {
    pub offset: u32,
    pub length: u32,
}

/// One contiguous run of a piece/block byte range inside a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSlice {
    pub file_index: usize,
    pub file_offset: u64,
    pub length: u64,
    /// Where this run starts inside the caller's buffer.
    pub data_offset: usize,
}

/// Immutable description of the content: piece geometry, expected digests
/// and how the concatenated piece stream maps onto files.
#[derive(Debug, Clone)]
pub struct PieceTable {
    content_id: Vec<u8>,
    algorithm: HashAlgorithm,
    piece_size: u32,
    block_size: u32,
    piece_hashes: Vec<Vec<u8>>,
    files: Vec<FileEntry>,
    file_starts: Vec<u64>,
    total_length: u64,
}

fn malformed(msg: impl Into<String>) -> TransferError {
    TransferError::MalformedDescriptor(msg.into())
}

fn is_safe_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

impl PieceTable {
    pub fn new(
        content_id: Vec<u8>,
        algorithm: HashAlgorithm,
        piece_size: u32,
        piece_hashes: Vec<Vec<u8>>,
        files: Vec<FileEntry>,
    ) -> Result<Self, TransferError> {
        if content_id.is_empty() {
            return Err(malformed("content identifier is empty"));
        }
        if piece_size == 0 {
            return Err(malformed("piece size is zero"));
        }
        if files.is_empty() {
            return Err(malformed("file layout is empty"));
        }

        let mut file_starts = Vec::with_capacity(files.len());
        let mut total_length: u64 = 0;
        for file in &files {
            if !is_safe_relative(&file.path) {
                return Err(malformed(format!(
                    "file path {:?} must be relative and free of '..'",
                    file.path
                )));
            }
            file_starts.push(total_length);
            total_length = total_length
                .checked_add(file.length)
                .ok_or_else(|| malformed("file lengths overflow"))?;
        }
        if total_length == 0 {
            return Err(malformed("content length is zero"));
        }

        let implied_pieces = total_length.div_ceil(piece_size as u64);
        if implied_pieces > u32::MAX as u64 {
            return Err(malformed("too many pieces"));
        }
        if piece_hashes.len() as u64 != implied_pieces {
            return Err(malformed(format!(
                "{} piece hashes for {} bytes at piece size {} (expected {})",
                piece_hashes.len(),
                total_length,
                piece_size,
                implied_pieces
            )));
        }
        if let Some(bad) = piece_hashes
            .iter()
            .position(|hash| hash.len() != algorithm.digest_len())
        {
            return Err(malformed(format!(
                "hash for piece {} is not a {} digest",
                bad, algorithm
            )));
        }

        Ok(Self {
            content_id,
            algorithm,
            piece_size,
            block_size: BLOCK_SIZE,
            piece_hashes,
            files,
            file_starts,
            total_length,
        })
    }

    pub fn with_block_size(mut self, block_size: u32) -> Result<Self, TransferError> {
        if block_size == 0 {
            return Err(malformed("block size is zero"));
        }
        self.block_size = block_size;
        Ok(self)
    }

    pub fn content_id(&self) -> &[u8] {
        &self.content_id
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn piece_size(&self) -> u32 {
        self.piece_size
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn piece_offset(&self, piece_index: u32) -> u64 {
        piece_index as u64 * self.piece_size as u64
    }

    /// Length of piece `piece_index`; the final piece may be short.
    /// Returns 0 for an index past the end.
    pub fn piece_length(&self, piece_index: u32) -> u32 {
        if piece_index >= self.piece_count() {
            return 0;
        }
        let start = self.piece_offset(piece_index);
        let remaining = self.total_length - start;
        remaining.min(self.piece_size as u64) as u32
    }

    pub fn block_count(&self, piece_index: u32) -> u32 {
        self.piece_length(piece_index).div_ceil(self.block_size)
    }

    pub fn total_blocks(&self) -> u64 {
        (0..self.piece_count())
            .map(|i| self.block_count(i) as u64)
            .sum()
    }

    pub fn block_ranges(&self, piece_index: u32) -> Vec<BlockRange> {
        let piece_length = self.piece_length(piece_index);
        let mut ranges = Vec::with_capacity(self.block_count(piece_index) as usize);
        let mut offset = 0;
        while offset < piece_length {
            let length = self.block_size.min(piece_length - offset);
            ranges.push(BlockRange { offset, length });
            offset += length;
        }
        ranges
    }

    /// Geometry check for a block a peer sent or asked for.
    pub fn block_range(&self, piece_index: u32, block_offset: u32) -> Option<BlockRange> {
        let piece_length = self.piece_length(piece_index);
        if block_offset >= piece_length || block_offset % self.block_size != 0 {
            return None;
        }
        Some(BlockRange {
            offset: block_offset,
            length: self.block_size.min(piece_length - block_offset),
        })
    }

    pub fn expected_hash(&self, piece_index: u32) -> Option<&[u8]> {
        self.piece_hashes
            .get(piece_index as usize)
            .map(|hash| hash.as_slice())
    }

    pub fn file_offsets_for(
        &self,
        piece_index: u32,
        block_offset: u32,
        length: u32,
    ) -> Result<Vec<FileSlice>, StorageError> {
        let piece_length = self.piece_length(piece_index) as u64;
        let global_start = self.piece_offset(piece_index) + block_offset as u64;
        if block_offset as u64 + length as u64 > piece_length {
            return Err(StorageError::OutOfBounds {
                offset: global_start,
                length: length as u64,
                total: self.total_length,
            });
        }
        self.slices_for_range(global_start, length as u64)
    }

    /// Maps `[global_offset, global_offset + length)` onto file runs.
    pub fn slices_for_range(
        &self,
        global_offset: u64,
        length: u64,
    ) -> Result<Vec<FileSlice>, StorageError> {
        let end = global_offset
            .checked_add(length)
            .filter(|end| *end <= self.total_length)
            .ok_or(StorageError::OutOfBounds {
                offset: global_offset,
                length,
                total: self.total_length,
            })?;

        let mut slices = Vec::new();
        let first = self
            .file_starts
            .partition_point(|start| *start <= global_offset)
            .saturating_sub(1);

        let mut cursor = global_offset;
        for (file_index, file) in self.files.iter().enumerate().skip(first) {
            if cursor >= end {
                break;
            }
            let file_start = self.file_starts[file_index];
            let file_end = file_start + file.length;
            if file.length == 0 || cursor >= file_end {
                continue;
            }
            let run = (end - cursor).min(file_end - cursor);
            slices.push(FileSlice {
                file_index,
                file_offset: cursor - file_start,
                length: run,
                data_offset: (cursor - global_offset) as usize,
            });
            cursor += run;
        }
        Ok(slices)
    }
}
