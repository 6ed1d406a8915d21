// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::StorageError;
use crate::piece_table::{FileSlice, PieceTable};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, try_exists, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

use tracing::{event, Level};

/// Maps piece/block ranges onto the destination files.
///
/// Every file has its own lock so writes that touch the same file handle are
/// serialized, while pieces living in different files proceed in parallel.
#[derive(Debug)]
pub struct FileWriter {
    root: PathBuf,
    table: Arc<PieceTable>,
    file_locks: Vec<Mutex<()>>,
}

impl FileWriter {
    pub fn new(root: impl Into<PathBuf>, table: Arc<PieceTable>) -> Self {
        let file_locks = table.files().iter().map(|_| Mutex::new(())).collect();
        Self {
            root: root.into(),
            table,
            file_locks,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_path(&self, file_index: usize) -> PathBuf {
        self.root.join(&self.table.files()[file_index].path)
    }

    /// True when at least one destination file already exists on disk.
    pub async fn has_existing_data(&self) -> bool {
        for index in 0..self.table.files().len() {
            if try_exists(self.file_path(index)).await.unwrap_or(false) {
                return true;
            }
        }
        false
    }

    /// True when every file exists with exactly its expected length.
    pub async fn is_complete_layout(&self) -> bool {
        for (index, file) in self.table.files().iter().enumerate() {
            match fs::metadata(self.file_path(index)).await {
                Ok(meta) if meta.is_file() && meta.len() == file.length => {}
                _ => return false,
            }
        }
        true
    }

    /// Creates directories and sizes every file, keeping existing bytes.
    pub async fn create_and_allocate_files(&self) -> Result<(), StorageError> {
        for (index, file_info) in self.table.files().iter().enumerate() {
            let path = self.file_path(index);
            if let Some(parent_dir) = path.parent() {
                if !try_exists(parent_dir).await? {
                    fs::create_dir_all(parent_dir).await?;
                }
            }

            let _guard = self.file_locks[index].lock().await;
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .await?;
            if file.metadata().await?.len() != file_info.length {
                file.set_len(file_info.length).await?;
            }
        }
        Ok(())
    }

    pub async fn write_block(
        &self,
        piece_index: u32,
        block_offset: u32,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let slices = self
            .table
            .file_offsets_for(piece_index, block_offset, data.len() as u32)?;
        for slice in &slices {
            self.write_slice(slice, data).await?;
        }
        event!(
            Level::TRACE,
            piece_index,
            block_offset,
            len = data.len(),
            files = slices.len(),
            "Block written"
        );
        Ok(())
    }

    pub async fn read_block(
        &self,
        piece_index: u32,
        block_offset: u32,
        length: u32,
    ) -> Result<Vec<u8>, StorageError> {
        let slices = self
            .table
            .file_offsets_for(piece_index, block_offset, length)?;
        let mut buffer = vec![0u8; length as usize];
        for slice in &slices {
            self.read_slice(slice, &mut buffer).await?;
        }
        Ok(buffer)
    }

    /// Re-reads a whole piece from disk, e.g. for verification.
    pub async fn assemble_piece(&self, piece_index: u32) -> Result<Vec<u8>, StorageError> {
        let length = self.table.piece_length(piece_index);
        if length == 0 {
            return Err(StorageError::OutOfBounds {
                offset: self.table.piece_offset(piece_index),
                length: 0,
                total: self.table.total_length(),
            });
        }
        self.read_block(piece_index, 0, length).await
    }

    async fn write_slice(&self, slice: &FileSlice, data: &[u8]) -> Result<(), StorageError> {
        let _guard = self.file_locks[slice.file_index].lock().await;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.file_path(slice.file_index))
            .await?;
        file.seek(SeekFrom::Start(slice.file_offset)).await?;
        let end = slice.data_offset + slice.length as usize;
        file.write_all(&data[slice.data_offset..end]).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn read_slice(&self, slice: &FileSlice, buffer: &mut [u8]) -> Result<(), StorageError> {
        let _guard = self.file_locks[slice.file_index].lock().await;
        let mut file = File::open(self.file_path(slice.file_index)).await?;
        file.seek(SeekFrom::Start(slice.file_offset)).await?;
        let end = slice.data_offset + slice.length as usize;
        file.read_exact(&mut buffer[slice.data_offset..end]).await?;
        Ok(())
    }
}
