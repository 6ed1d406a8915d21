// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::TransferError;
use crate::piece_table::{FileEntry, HashAlgorithm, PieceTable, BLOCK_SIZE};
use crate::verifier::digest;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncReadExt;

pub const DEFAULT_PIECE_SIZE: u32 = 256 * 1024;

fn default_block_size() -> u32 {
    BLOCK_SIZE
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ManifestFile {
    pub path: PathBuf,
    pub length: u64,
}

/// JSON descriptor of a piece table. Digests and the content id are hex.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub content_id: String,
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
    pub piece_size: u32,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    pub piece_hashes: Vec<String>,
    pub files: Vec<ManifestFile>,
}

fn malformed(reason: impl Into<String>) -> TransferError {
    TransferError::MalformedDescriptor(reason.into())
}

impl Manifest {
    pub fn from_json(text: &str) -> Result<Self, TransferError> {
        serde_json::from_str(text).map_err(|e| malformed(e.to_string()))
    }

    pub fn to_json_pretty(&self) -> Result<String, TransferError> {
        serde_json::to_string_pretty(self).map_err(|e| malformed(e.to_string()))
    }

    pub async fn load(path: &Path) -> Result<Self, TransferError> {
        let text = fs::read_to_string(path).await?;
        Self::from_json(&text)
    }

    pub async fn save(&self, path: &Path) -> Result<(), TransferError> {
        let text = self.to_json_pretty()?;
        fs::write(path, text).await?;
        Ok(())
    }

    pub fn into_piece_table(self) -> Result<PieceTable, TransferError> {
        let content_id =
            hex::decode(&self.content_id).map_err(|e| malformed(format!("content id: {}", e)))?;
        let piece_hashes = self
            .piece_hashes
            .iter()
            .enumerate()
            .map(|(index, hash)| {
                hex::decode(hash).map_err(|e| malformed(format!("hash of piece {}: {}", index, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let files = self
            .files
            .into_iter()
            .map(|file| FileEntry {
                path: file.path,
                length: file.length,
            })
            .collect();

        PieceTable::new(
            content_id,
            self.hash_algorithm,
            self.piece_size,
            piece_hashes,
            files,
        )?
        .with_block_size(self.block_size)
    }

    pub fn from_piece_table(table: &PieceTable) -> Self {
        Self {
            content_id: hex::encode(table.content_id()),
            hash_algorithm: table.algorithm(),
            piece_size: table.piece_size(),
            block_size: table.block_size(),
            piece_hashes: (0..table.piece_count())
                .filter_map(|index| table.expected_hash(index))
                .map(hex::encode)
                .collect(),
            files: table
                .files()
                .iter()
                .map(|file| ManifestFile {
                    path: file.path.clone(),
                    length: file.length,
                })
                .collect(),
        }
    }

    /// Hashes `files` (relative to `root`) in order as one piece stream.
    pub async fn from_local_files(
        root: &Path,
        files: &[PathBuf],
        piece_size: u32,
        algorithm: HashAlgorithm,
    ) -> Result<Self, TransferError> {
        if piece_size == 0 {
            return Err(malformed("piece size is zero"));
        }

        let mut entries = Vec::with_capacity(files.len());
        for path in files {
            let metadata = fs::metadata(root.join(path)).await?;
            if !metadata.is_file() {
                return Err(malformed(format!("{} is not a regular file", path.display())));
            }
            entries.push(ManifestFile {
                path: path.clone(),
                length: metadata.len(),
            });
        }

        let mut piece_hashes = Vec::new();
        let mut piece = Vec::with_capacity(piece_size as usize);
        let mut chunk = vec![0u8; 64 * 1024];
        for entry in &entries {
            let mut file = File::open(root.join(&entry.path)).await?;
            let mut remaining = entry.length;
            while remaining > 0 {
                let want = (piece_size as usize - piece.len())
                    .min(chunk.len())
                    .min(remaining as usize);
                let read = file.read(&mut chunk[..want]).await?;
                if read == 0 {
                    return Err(malformed(format!(
                        "{} changed size while hashing",
                        entry.path.display()
                    )));
                }
                piece.extend_from_slice(&chunk[..read]);
                remaining -= read as u64;
                if piece.len() == piece_size as usize {
                    piece_hashes.push(digest(algorithm, &piece));
                    piece.clear();
                }
            }
        }
        if !piece.is_empty() {
            piece_hashes.push(digest(algorithm, &piece));
        }

        let content_id = content_id_for(algorithm, &entries, &piece_hashes);
        Ok(Self {
            content_id: hex::encode(content_id),
            hash_algorithm: algorithm,
            piece_size,
            block_size: BLOCK_SIZE,
            piece_hashes: piece_hashes.iter().map(hex::encode).collect(),
            files: entries,
        })
    }
}

/// Digest of the layout and every piece hash.
fn content_id_for(algorithm: HashAlgorithm, files: &[ManifestFile], piece_hashes: &[Vec<u8>]) -> Vec<u8> {
    let mut material = Vec::new();
    for file in files {
        material.extend_from_slice(file.path.to_string_lossy().as_bytes());
        material.push(0);
        material.extend_from_slice(&file.length.to_be_bytes());
    }
    for hash in piece_hashes {
        material.extend_from_slice(hash);
    }
    digest(algorithm, &material)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::PieceVerifier;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_manifest_from_files_verifies_its_own_content() {
        let dir = tempdir().unwrap();
        let a: Vec<u8> = (0..3000u32).map(|i| (i % 7) as u8).collect();
        let b: Vec<u8> = (0..1100u32).map(|i| (i % 13) as u8).collect();
        std::fs::write(dir.path().join("a.bin"), &a).unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/b.bin"), &b).unwrap();

        let files = vec![PathBuf::from("a.bin"), PathBuf::from("nested/b.bin")];
        let manifest = Manifest::from_local_files(dir.path(), &files, 1024, HashAlgorithm::Sha256)
            .await
            .unwrap();
        assert_eq!(manifest.piece_hashes.len(), 5);
        assert_eq!(manifest.content_id.len(), 64);

        let table = Arc::new(manifest.clone().into_piece_table().unwrap());
        assert_eq!(table.total_length(), 4100);
        let verifier = PieceVerifier::new(table.clone());
        let mut stream = a.clone();
        stream.extend_from_slice(&b);
        for (index, piece) in stream.chunks(1024).enumerate() {
            assert!(verifier.verify(index as u32, piece).is_ok());
        }
        assert_eq!(Manifest::from_piece_table(&table), manifest);
    }

    #[test]
    fn test_json_shape() {
        let text = r#"{
            "content_id": "0a0b",
            "hash_algorithm": "sha1",
            "piece_size": 4,
            "piece_hashes": ["0000000000000000000000000000000000000000"],
            "files": [{"path": "x", "length": 3}]
        }"#;
        let manifest = Manifest::from_json(text).unwrap();
        assert_eq!(manifest.block_size, BLOCK_SIZE);
        let table = manifest.into_piece_table().unwrap();
        assert_eq!(table.content_id(), &[0x0a, 0x0b]);
        assert_eq!(table.piece_count(), 1);
    }

    #[test]
    fn test_malformed_manifests_are_rejected() {
        assert!(matches!(
            Manifest::from_json("{ not json"),
            Err(TransferError::MalformedDescriptor(_))
        ));

        let mut manifest = Manifest {
            content_id: "zz".to_string(),
            hash_algorithm: HashAlgorithm::Sha1,
            piece_size: 4,
            block_size: BLOCK_SIZE,
            piece_hashes: vec!["00".repeat(20)],
            files: vec![ManifestFile {
                path: PathBuf::from("x"),
                length: 3,
            }],
        };
        assert!(matches!(
            manifest.clone().into_piece_table(),
            Err(TransferError::MalformedDescriptor(_))
        ));

        manifest.content_id = "01".to_string();
        manifest.piece_hashes = vec!["00".repeat(32)];
        assert!(matches!(
            manifest.clone().into_piece_table(),
            Err(TransferError::MalformedDescriptor(_))
        ));

        manifest.piece_hashes = vec!["00".repeat(20)];
        manifest.files[0].path = PathBuf::from("../escape");
        assert!(matches!(
            manifest.into_piece_table(),
            Err(TransferError::MalformedDescriptor(_))
        ));
    }
}
