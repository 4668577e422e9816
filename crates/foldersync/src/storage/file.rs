//! File-based block source with zstd compression

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use super::{BlockSource, RecordKey, RecordKind};

/// File-based block source with zstd compression
///
/// Directory structure:
/// ```text
/// folders/
///   SU5CT1g/                   # base64url("INBOX")
///     folder.json.zst          # directory record
///     header/
///       00/
///         0.json.zst           # header block 0
///         256.json.zst
///       01/
///         1.json.zst
///     body/
///       00/
///         0.json.zst
/// ```
pub struct FileBlockSource {
    root: PathBuf,
    compression_level: i32,
}

impl FileBlockSource {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).context("Failed to create block storage directory")?;
        Ok(Self {
            root,
            compression_level: 3,
        })
    }

    /// Open the source under the shared data directory (`<data_dir>/folders`)
    pub fn open_default() -> Result<Self> {
        let dir = config::ensure_data_dir()?;
        Self::new(dir.join("folders"))
    }

    /// One path component per folder id, distinct for distinct ids
    fn folder_dir(&self, folder_id: &str) -> PathBuf {
        self.root.join(URL_SAFE_NO_PAD.encode(folder_id))
    }

    fn record_path(&self, key: &RecordKey) -> PathBuf {
        let dir = self.folder_dir(&key.folder_id);
        match key.kind {
            RecordKind::Folder => dir.join("folder.json.zst"),
            RecordKind::Block(kind, id) => dir
                .join(kind.as_str())
                .join(format!("{:02x}", id & 0xff))
                .join(format!("{id}.json.zst")),
        }
    }
}

impl BlockSource for FileBlockSource {
    fn put(&self, key: &RecordKey, data: &[u8]) -> Result<()> {
        let path = self.record_path(key);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let compressed =
            zstd::encode_all(data, self.compression_level).context("Failed to compress record")?;

        // Write atomically (write to temp, then rename)
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &compressed)
            .with_context(|| format!("Failed to write {}", temp_path.display()))?;
        fs::rename(&temp_path, &path)
            .with_context(|| format!("Failed to move record into place at {}", path.display()))?;

        Ok(())
    }

    fn get(&self, key: &RecordKey) -> Result<Option<Vec<u8>>> {
        let path = self.record_path(key);

        if !path.exists() {
            return Ok(None);
        }

        let compressed = fs::read(&path)?;
        let mut decoder = zstd::Decoder::new(compressed.as_slice())?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .with_context(|| format!("Failed to decompress {}", path.display()))?;

        Ok(Some(decompressed))
    }

    fn exists(&self, key: &RecordKey) -> Result<bool> {
        Ok(self.record_path(key).exists())
    }

    fn delete(&self, key: &RecordKey) -> Result<()> {
        let path = self.record_path(key);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
            fs::create_dir_all(&self.root)?;
        }
        Ok(())
    }
}
