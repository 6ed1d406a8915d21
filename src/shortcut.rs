// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::errors::TransferError;
use crate::piece_table::PieceTable;
use crate::storage::FileWriter;
use crate::verifier::PieceVerifier;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tracing::{event, instrument, Level};

/// True when every piece under `root` hashes to the table's expected value.
pub async fn is_verified_copy(table: &Arc<PieceTable>, root: &Path) -> bool {
    let store = FileWriter::new(root, table.clone());
    if !store.is_complete_layout().await {
        return false;
    }

    let verifier = PieceVerifier::new(table.clone());
    for piece_index in 0..table.piece_count() {
        let data = match store.assemble_piece(piece_index).await {
            Ok(data) => data,
            Err(e) => {
                event!(Level::DEBUG, store = %root.display(), piece_index, error = %e, "Local store unreadable");
                return false;
            }
        };
        let (result, _) = verifier.verify_owned(piece_index, data).await;
        if result.is_err() {
            event!(Level::INFO, store = %root.display(), piece_index, "Local copy does not match");
            return false;
        }
    }
    true
}

/// Copies every file of the layout and flushes each copy to disk.
pub async fn copy_content(
    table: &PieceTable,
    source_root: &Path,
    destination: &Path,
) -> Result<(), TransferError> {
    if same_location(source_root, destination).await {
        return Ok(());
    }
    for file in table.files() {
        let from = source_root.join(&file.path);
        let to = destination.join(&file.path);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&from, &to).await?;
        fs::OpenOptions::new()
            .write(true)
            .open(&to)
            .await?
            .sync_data()
            .await?;
    }
    Ok(())
}

async fn same_location(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a).await, fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Copies `store` into `destination` and re-hashes what landed there.
/// Returns false when the copy does not match, e.g. because the store
/// changed after it was checked.
pub async fn install_from_store(
    table: &Arc<PieceTable>,
    store: &Path,
    destination: &Path,
) -> Result<bool, TransferError> {
    copy_content(table, store, destination).await?;
    if is_verified_copy(table, destination).await {
        return Ok(true);
    }
    event!(Level::WARN, store = %store.display(), "Copied content failed verification");
    Ok(false)
}

/// Completes the transfer from a local store when one holds a verified copy.
/// Returns false when the peer path is needed.
#[instrument(skip(table, stores), fields(stores = stores.len()))]
pub async fn try_local_shortcut(
    table: &Arc<PieceTable>,
    stores: &[PathBuf],
    destination: &Path,
) -> Result<bool, TransferError> {
    for store in stores {
        if !is_verified_copy(table, store).await {
            continue;
        }
        event!(Level::INFO, store = %store.display(), "Copying verified local content");
        if install_from_store(table, store, destination).await? {
            return Ok(true);
        }
    }
    Ok(false)
}
