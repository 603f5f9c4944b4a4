//! The torrent index: one JSON record per line, append-only.
//!
//! Records are buffered and flushed in batches; a crawl discovers a few
//! torrents per second at best, so batching mostly matters at shutdown.
use super::{MetadataStore, StoreError};
use crate::bencode::{self, BencodeValue};
use crate::types::InfoHash;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Buffered entries are committed to disk once this many accumulate.
const PENDING_INFO_HASHES: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentRecord {
    pub info_hash: String,
    pub name: String,
    pub total_size: u64,
    pub discovered_on: u64,
    pub files: Vec<FileRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
}

pub struct TorrentStore {
    file: File,
    path: PathBuf,
    /// Indexed infohashes, including buffered ones.
    known: HashSet<InfoHash>,
    pending: Vec<TorrentRecord>,
}

impl TorrentStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let known = load_known(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!(
            "torrent index at {} ({} torrents indexed)",
            path.display(),
            known.len()
        );
        Ok(Self {
            file,
            path: path.to_path_buf(),
            known,
            pending: Vec::new(),
        })
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut batch = String::new();
        for record in &self.pending {
            batch.push_str(&serde_json::to_string(record)?);
            batch.push('\n');
        }
        self.file.write_all(batch.as_bytes())?;
        self.file.flush()?;
        info!(
            "{} torrents committed to {}",
            self.pending.len(),
            self.path.display()
        );
        self.pending.clear();
        Ok(())
    }
}

impl MetadataStore for TorrentStore {
    fn is_new(&self, info_hash: &InfoHash) -> bool {
        !self.known.contains(info_hash)
    }

    fn add(&mut self, info_hash: InfoHash, metadata: &[u8]) -> Result<bool, StoreError> {
        let Some(record) = parse_info_dict(&info_hash, metadata) else {
            return Ok(false);
        };
        info!("added: `{}`", record.name);
        self.known.insert(info_hash);
        self.pending.push(record);
        if self.pending.len() >= PENDING_INFO_HASHES {
            self.commit()?;
        }
        Ok(true)
    }

    fn completed_info_hashes(&self) -> HashSet<InfoHash> {
        self.known.clone()
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.commit()
    }
}

impl Drop for TorrentStore {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            warn!("{} uncommitted torrents lost", self.pending.len());
        }
    }
}

fn load_known(path: &Path) -> Result<HashSet<InfoHash>, StoreError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(err) => return Err(err.into()),
    };
    let mut known = HashSet::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let parsed: Result<TorrentRecord, _> = serde_json::from_str(&line);
        let info_hash = parsed
            .ok()
            .and_then(|record| hex::decode(record.info_hash).ok())
            .and_then(|bytes| InfoHash::from_bytes(&bytes));
        match info_hash {
            Some(info_hash) => {
                known.insert(info_hash);
            }
            None => warn!("skipping a corrupt line in {}", path.display()),
        }
    }
    Ok(known)
}

/// Decodes and validates an `info` dict, producing the index record.
///
/// Returns `None` on any structural violation: the torrent is then treated
/// as completed-but-corrupt and never refetched.
fn parse_info_dict(info_hash: &InfoHash, metadata: &[u8]) -> Option<TorrentRecord> {
    let info = bencode::decode(metadata).ok()?;
    info.as_dict()?;

    let name = std::str::from_utf8(info.get(b"name")?.as_bytes()?).ok()?;
    if name.contains('/') {
        debug!("rejecting metadata with a slash in the name");
        return None;
    }

    let mut files = Vec::new();
    match info.get(b"files") {
        // Multiple-file torrent: every entry needs an integer length and a
        // path list of clean UTF-8 components.
        Some(list) => {
            for entry in list.as_list()? {
                let length = entry.get(b"length")?.as_integer()?;
                let length = u64::try_from(length).ok()?;
                let mut components = Vec::new();
                for item in entry.get(b"path")?.as_list()? {
                    let component = std::str::from_utf8(item.as_bytes()?).ok()?;
                    if component.contains('/') {
                        return None;
                    }
                    components.push(component);
                }
                files.push(FileRecord {
                    path: components.join("/"),
                    size: length,
                });
            }
        }
        // Single-file torrent: the name is the path.
        None => {
            let length = info.get(b"length")?.as_integer()?;
            files.push(FileRecord {
                path: name.to_string(),
                size: u64::try_from(length).ok()?,
            });
        }
    }

    let total_size = files.iter().map(|file| file.size).sum();
    if total_size == 0 {
        return None;
    }

    let discovered_on = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    Some(TorrentRecord {
        info_hash: info_hash.to_string(),
        name: name.to_string(),
        total_size,
        discovered_on,
        files,
    })
}
