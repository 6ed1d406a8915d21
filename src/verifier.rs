// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::TransferError;
use crate::piece_table::{HashAlgorithm, PieceTable};

use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::sync::Arc;

pub fn digest(algorithm: HashAlgorithm, data: &[u8]) -> Vec<u8> {
    match algorithm {
        HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
        HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
    }
}

/// Stateless piece checker. Cloning is cheap, so each verification task can
/// own one.
#[derive(Debug, Clone)]
pub struct PieceVerifier {
    table: Arc<PieceTable>,
}

impl PieceVerifier {
    pub fn new(table: Arc<PieceTable>) -> Self {
        Self { table }
    }

    pub fn verify(&self, piece_index: u32, assembled: &[u8]) -> Result<(), TransferError> {
        let expected = self
            .table
            .expected_hash(piece_index)
            .ok_or(TransferError::HashMismatch { piece_index })?;

        if assembled.len() != self.table.piece_length(piece_index) as usize {
            return Err(TransferError::HashMismatch { piece_index });
        }

        if digest(self.table.algorithm(), assembled) == expected {
            Ok(())
        } else {
            Err(TransferError::HashMismatch { piece_index })
        }
    }

    /// Runs [`verify`](Self::verify) on the blocking pool so hashing never
    /// stalls the async workers.
    pub async fn verify_owned(
        &self,
        piece_index: u32,
        assembled: Vec<u8>,
    ) -> (Result<(), TransferError>, Vec<u8>) {
        let verifier = self.clone();
        let task = tokio::task::spawn_blocking(move || {
            let result = verifier.verify(piece_index, &assembled);
            (result, assembled)
        });
        match task.await {
            Ok(outcome) => outcome,
            Err(_) => (Err(TransferError::HashMismatch { piece_index }), Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece_table::FileEntry;
    use std::path::PathBuf;
    use strum::IntoEnumIterator;

    fn table_for(content: &[u8], piece_size: u32, algorithm: HashAlgorithm) -> Arc<PieceTable> {
        let hashes = content
            .chunks(piece_size as usize)
            .map(|chunk| digest(algorithm, chunk))
            .collect();
        Arc::new(
            PieceTable::new(
                vec![9; 20],
                algorithm,
                piece_size,
                hashes,
                vec![FileEntry {
                    path: PathBuf::from("content.bin"),
                    length: content.len() as u64,
                }],
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_sha1_known_vector() {
        assert_eq!(
            hex::encode(digest(HashAlgorithm::Sha1, b"abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            hex::encode(digest(HashAlgorithm::Sha256, b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_verify_accepts_matching_pieces() {
        let content: Vec<u8> = (0..250u32).map(|i| (i % 251) as u8).collect();
        for algorithm in HashAlgorithm::iter() {
            let verifier = PieceVerifier::new(table_for(&content, 100, algorithm));
            assert!(verifier.verify(0, &content[0..100]).is_ok());
            assert!(verifier.verify(1, &content[100..200]).is_ok());
            assert!(verifier.verify(2, &content[200..250]).is_ok());
        }
    }

    #[test]
    fn test_digest_lengths_match_algorithms() {
        for algorithm in HashAlgorithm::iter() {
            assert_eq!(digest(algorithm, b"").len(), algorithm.digest_len());
        }
    }

    #[test]
    fn test_verify_rejects_flipped_byte() {
        let content = vec![0x5A; 100];
        let verifier = PieceVerifier::new(table_for(&content, 100, HashAlgorithm::Sha1));
        let mut corrupted = content.clone();
        corrupted[42] ^= 0x01;
        assert_eq!(
            verifier.verify(0, &corrupted),
            Err(TransferError::HashMismatch { piece_index: 0 })
        );
    }

    #[test]
    fn test_verify_rejects_wrong_length_and_index() {
        let content = vec![1u8; 100];
        let verifier = PieceVerifier::new(table_for(&content, 100, HashAlgorithm::Sha1));
        assert!(verifier.verify(0, &content[..99]).is_err());
        assert!(verifier.verify(5, &content).is_err());
    }

    #[tokio::test]
    async fn test_verify_owned_returns_buffer() {
        let content = vec![3u8; 64];
        let verifier = PieceVerifier::new(table_for(&content, 64, HashAlgorithm::Sha1));
        let (result, data) = verifier.verify_owned(0, content.clone()).await;
        assert!(result.is_ok());
        assert_eq!(data, content);
    }
}
