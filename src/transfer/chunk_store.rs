use log::debug;
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Scratch-directory layout for in-flight transfers.
///
/// Chunk `i` of transfer `t` lives in `t_i.part`; an assembled upload lives in `t_<fileName>`.
/// Every file of a transfer therefore starts with `t_`, which is what `remove_all` relies on.
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn slot_path(&self, transfer_id: &str, chunk_index: u32) -> PathBuf {
        self.root.join(format!("{}_{}.part", transfer_id, chunk_index))
    }

    pub fn artifact_path(&self, transfer_id: &str, file_name: &str) -> PathBuf {
        self.root.join(format!("{}_{}", transfer_id, file_name))
    }

    /// Stores a chunk. Bytes go to a private temporary file first and are renamed into the slot,
    /// so a concurrent retry of the same index never observes a half-written slot.
    pub async fn write_slot(
        &self,
        transfer_id: &str,
        chunk_index: u32,
        bytes: &[u8],
    ) -> io::Result<()> {
        self.ensure_root().await?;
        let slot = self.slot_path(transfer_id, chunk_index);
        let staging = self.root.join(format!(
            "{}_{}.part.{}.tmp",
            transfer_id,
            chunk_index,
            Uuid::new_v4().simple()
        ));

        let mut file = fs::File::create(&staging).await?;
        if let Err(e) = write_all_synced(&mut file, bytes).await {
            let _ = fs::remove_file(&staging).await;
            return Err(e);
        }
        drop(file);
        fs::rename(&staging, &slot).await?;
        debug!("Stored {} bytes in {}", bytes.len(), slot.display());
        Ok(())
    }

    pub async fn read_slot(&self, transfer_id: &str, chunk_index: u32) -> io::Result<Vec<u8>> {
        fs::read(self.slot_path(transfer_id, chunk_index)).await
    }

    /// Concatenates slots `0..total_chunks` in index order into the artifact and returns its
    /// path and length. Slots are left in place.
    pub async fn assemble(
        &self,
        transfer_id: &str,
        total_chunks: u32,
        file_name: &str,
    ) -> io::Result<(PathBuf, u64)> {
        let artifact = self.artifact_path(transfer_id, file_name);
        let mut output = fs::File::create(&artifact).await?;
        let mut written = 0u64;
        for chunk_index in 0..total_chunks {
            let mut slot = fs::File::open(self.slot_path(transfer_id, chunk_index)).await?;
            written += tokio::io::copy(&mut slot, &mut output).await?;
        }
        output.flush().await?;
        output.sync_all().await?;
        Ok((artifact, written))
    }

    /// Removes slots `0..total_chunks`; missing slots are skipped. Returns how many were removed.
    pub async fn remove_slots(&self, transfer_id: &str, total_chunks: u32) -> io::Result<usize> {
        let mut removed = 0;
        for chunk_index in 0..total_chunks {
            if remove_if_present(&self.slot_path(transfer_id, chunk_index)).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Removes every scratch file of the transfer: slots, leftover staging files and the
    /// assembled artifact.
    pub async fn remove_all(&self, transfer_id: &str) -> io::Result<usize> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let prefix = format!("{}_", transfer_id);
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with(&prefix)
                && remove_if_present(&entry.path()).await?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// SHA-256 of `bytes` as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

async fn write_all_synced(file: &mut fs::File, bytes: &[u8]) -> io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

async fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
