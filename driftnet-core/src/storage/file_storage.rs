//! Single-file storage with a bitfield sidecar

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::{PieceStorage, StorageError, verify_piece};
use crate::torrent::{PieceIndex, PieceLayout};

/// File system-based storage implementation.
///
/// The torrent payload lives in one pre-allocated file `<dir>/<name>`;
/// piece `i` occupies bytes `i * piece_length ..`. The local bitfield is
/// persisted raw in a hidden sidecar `<dir>/.<name><suffix>`. Reopening an
/// existing file keeps its contents so an interrupted download resumes.
pub struct FileStorage {
    data_path: PathBuf,
    sidecar_path: PathBuf,
    layout: PieceLayout,
    piece_hashes: Vec<[u8; 20]>,
    file: Mutex<File>,
}

impl FileStorage {
    /// Opens or creates the data file and sizes it to the torrent length.
    ///
    /// # Errors
    ///
    /// - `StorageError::FilesystemError` - If `name` is not a plain file name
    /// - `StorageError::Io` - If the directory or file cannot be created
    pub async fn open(
        dir: &Path,
        name: &str,
        layout: PieceLayout,
        piece_hashes: Vec<[u8; 20]>,
        metadata_suffix: &str,
    ) -> Result<Self, StorageError> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(StorageError::FilesystemError {
                message: format!("Refusing to store torrent under name {name:?}"),
            });
        }

        fs::create_dir_all(dir).await?;
        let data_path = dir.join(name);
        let sidecar_path = dir.join(format!(".{name}{metadata_suffix}"));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&data_path)
            .await?;

        let current_len = file.metadata().await?.len();
        if current_len != layout.total_length() {
            tracing::debug!(
                "Resizing {} from {} to {} bytes",
                data_path.display(),
                current_len,
                layout.total_length()
            );
            file.set_len(layout.total_length()).await?;
        }

        Ok(Self {
            data_path,
            sidecar_path,
            layout,
            piece_hashes,
            file: Mutex::new(file),
        })
    }

    /// Path of the payload file.
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Path of the bitfield sidecar.
    pub fn sidecar_path(&self) -> &Path {
        &self.sidecar_path
    }
}

#[async_trait]
impl PieceStorage for FileStorage {
    async fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<(), StorageError> {
        verify_piece(&self.layout, &self.piece_hashes, index, data)?;

        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(self.layout.piece_offset(index)))
            .await?;
        file.write_all(data).await?;
        Ok(())
    }

    async fn read_piece(&self, index: PieceIndex) -> Result<Vec<u8>, StorageError> {
        if index.as_u32() >= self.layout.piece_count() {
            return Err(StorageError::PieceNotFound { index });
        }

        let mut buf = vec![0u8; self.layout.piece_size(index) as usize];
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(self.layout.piece_offset(index)))
            .await?;
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn sync(&self) -> Result<(), StorageError> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn load_bitfield(&self, len: usize) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(&self.sidecar_path).await {
            Ok(mut bytes) if bytes.len() >= len => {
                bytes.truncate(len);
                Ok(Some(bytes))
            }
            Ok(bytes) => {
                tracing::warn!(
                    "Ignoring short bitfield sidecar {} ({} of {} bytes)",
                    self.sidecar_path.display(),
                    bytes.len(),
                    len
                );
                Ok(None)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_bitfield(&self, bitfield: &[u8]) -> Result<(), StorageError> {
        fs::write(&self.sidecar_path, bitfield).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::test;

    use super::*;
    use crate::storage::test_fixtures::{TestContent, create_temp_download_dir};

    async fn open_storage(dir: &Path, content: &TestContent) -> FileStorage {
        FileStorage::open(
            dir,
            "payload.bin",
            content.layout,
            content.piece_hashes.clone(),
            ".meta",
        )
        .await
        .unwrap()
    }

    #[test]
    async fn test_open_preallocates_data_file() {
        let (_temp_dir, dir) = create_temp_download_dir();
        let content = TestContent::new(16, 40);

        let storage = open_storage(&dir, &content).await;

        let metadata = std::fs::metadata(storage.data_path()).unwrap();
        assert_eq!(metadata.len(), 40);
        assert_eq!(storage.sidecar_path(), dir.join(".payload.bin.meta"));
    }

    #[test]
    async fn test_write_and_read_piece_at_offset() {
        let (_temp_dir, dir) = create_temp_download_dir();
        let content = TestContent::new(16, 40);
        let storage = open_storage(&dir, &content).await;

        // Last piece is short: 40 - 2 * 16
        let last = PieceIndex::new(2);
        storage
            .write_piece(last, content.piece(last))
            .await
            .unwrap();
        storage.sync().await.unwrap();

        assert_eq!(storage.read_piece(last).await.unwrap(), content.piece(last));
        let raw = std::fs::read(storage.data_path()).unwrap();
        assert_eq!(&raw[32..40], content.piece(last));
        assert_eq!(&raw[..32], &[0u8; 32]);
    }

    #[test]
    async fn test_write_rejects_corrupt_piece() {
        let (_temp_dir, dir) = create_temp_download_dir();
        let content = TestContent::new(16, 40);
        let storage = open_storage(&dir, &content).await;

        let mut corrupt = content.piece(PieceIndex::new(0)).to_vec();
        corrupt[3] ^= 0xFF;

        let result = storage.write_piece(PieceIndex::new(0), &corrupt).await;
        assert!(matches!(result, Err(StorageError::HashMismatch { .. })));

        let raw = std::fs::read(storage.data_path()).unwrap();
        assert_eq!(&raw[..16], &[0u8; 16]);
    }

    #[test]
    async fn test_read_out_of_range_piece() {
        let (_temp_dir, dir) = create_temp_download_dir();
        let content = TestContent::new(16, 40);
        let storage = open_storage(&dir, &content).await;

        let result = storage.read_piece(PieceIndex::new(3)).await;
        assert!(matches!(result, Err(StorageError::PieceNotFound { .. })));
    }

    #[test]
    async fn test_bitfield_sidecar_round_trip() {
        let (_temp_dir, dir) = create_temp_download_dir();
        let content = TestContent::new(16, 40);
        let storage = open_storage(&dir, &content).await;

        assert_eq!(storage.load_bitfield(1).await.unwrap(), None);

        storage.save_bitfield(&[0b1010_0000]).await.unwrap();
        assert_eq!(
            storage.load_bitfield(1).await.unwrap(),
            Some(vec![0b1010_0000])
        );
        // Too short for the requested length
        assert_eq!(storage.load_bitfield(2).await.unwrap(), None);
    }

    #[test]
    async fn test_reopen_keeps_written_pieces() {
        let (_temp_dir, dir) = create_temp_download_dir();
        let content = TestContent::new(16, 40);

        {
            let storage = open_storage(&dir, &content).await;
            let index = PieceIndex::new(1);
            storage.write_piece(index, content.piece(index)).await.unwrap();
            storage.sync().await.unwrap();
        }

        let reopened = open_storage(&dir, &content).await;
        assert_eq!(
            reopened.read_piece(PieceIndex::new(1)).await.unwrap(),
            content.piece(PieceIndex::new(1))
        );
    }

    #[test]
    async fn test_open_rejects_path_like_names() {
        let (_temp_dir, dir) = create_temp_download_dir();
        let content = TestContent::new(16, 40);

        let result = FileStorage::open(
            &dir,
            "../escape",
            content.layout,
            content.piece_hashes.clone(),
            ".meta",
        )
        .await;
        assert!(matches!(result, Err(StorageError::FilesystemError { .. })));
    }
}
