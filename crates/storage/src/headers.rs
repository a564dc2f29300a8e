//! Persistent header store.
//!
//! Headers live in a flat in-memory vector guarded by a [`parking_lot`]
//! read-write lock; the shared [`HeaderVerifier`] sits behind its own mutex.
//! Consumers take the guards directly via [`Storage::headers`],
//! [`Storage::mutable_headers`] and [`Storage::header_verifier`], so a lock
//! is held exactly for the duration of the access, never nested.
//!
//! Persistence is asynchronous: [`Storage::save`] enqueues a save item onto
//! a background task which coalesces bursts and flushes the header vector
//! to `headers.bin` (plus chain metadata to `meta.json`) with an atomic
//! rename.

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ember_types::{RawHeader, HEADER_SIZE};

use crate::verifier::HeaderVerifier;

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding `headers.bin` and `meta.json`.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/ember"),
        }
    }
}

/// What a save request covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveItem {
    /// Flush the header vector and chain metadata.
    Headers,
}

/// Errors from opening or flushing the store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem failure.
    #[error("storage i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk data does not round-trip.
    #[error("corrupt storage: {0}")]
    Corrupt(String),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Meta {
    chain: String,
    header_count: u64,
}

const HEADERS_FILE: &str = "headers.bin";
const META_FILE: &str = "meta.json";

/// The header store.
pub struct Storage {
    config: StorageConfig,
    headers: RwLock<Vec<RawHeader>>,
    verifier: Mutex<HeaderVerifier>,
    chain: RwLock<String>,
    save_tx: mpsc::UnboundedSender<SaveItem>,
}

impl Storage {
    /// Opens (or creates) the store under `config.data_dir` and spawns the
    /// background save task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(config: StorageConfig) -> Result<Arc<Self>, StorageError> {
        fs::create_dir_all(&config.data_dir)?;
        let (headers, chain) = load(&config.data_dir)?;

        let verifier = match headers.last() {
            Some(last) => HeaderVerifier::from_tip(headers.len() as u32 - 1, *last),
            None => HeaderVerifier::new(),
        };

        info!(
            path = %config.data_dir.display(),
            headers = headers.len(),
            chain = %chain,
            "Opened header store"
        );

        let (save_tx, save_rx) = mpsc::unbounded_channel();
        let storage = Arc::new(Self {
            config,
            headers: RwLock::new(headers),
            verifier: Mutex::new(verifier),
            chain: RwLock::new(chain),
            save_tx,
        });
        spawn_saver(Arc::downgrade(&storage), save_rx);
        Ok(storage)
    }

    /// Read access to the header vector.
    pub fn headers(&self) -> RwLockReadGuard<'_, Vec<RawHeader>> {
        self.headers.read()
    }

    /// Write access to the header vector.
    pub fn mutable_headers(&self) -> RwLockWriteGuard<'_, Vec<RawHeader>> {
        self.headers.write()
    }

    /// Exclusive access to the shared chain verifier.
    pub fn header_verifier(&self) -> MutexGuard<'_, HeaderVerifier> {
        self.verifier.lock()
    }

    /// Number of stored headers.
    pub fn header_count(&self) -> usize {
        self.headers.read().len()
    }

    /// Height of the stored tip, if any headers exist.
    pub fn latest_tip(&self) -> Option<u32> {
        let n = self.header_count();
        (n > 0).then(|| n as u32 - 1)
    }

    /// The chain name recorded in the store (empty if never set).
    pub fn get_chain(&self) -> String {
        self.chain.read().clone()
    }

    /// Records the chain name. Once set it is never overwritten.
    pub fn set_chain(&self, chain: &str) {
        let mut guard = self.chain.write();
        if guard.is_empty() {
            info!(chain, "Recording chain name");
            *guard = chain.to_owned();
        } else if *guard != chain {
            warn!(
                have = %guard,
                got = chain,
                "Refusing to overwrite recorded chain name"
            );
        }
    }

    /// Enqueues a persistence flush. Returns immediately.
    pub fn save(&self, item: SaveItem) {
        if self.save_tx.send(item).is_err() {
            warn!(?item, "Save queue is gone; dropping save request");
        }
    }

    /// Writes headers and metadata to disk with an atomic rename.
    pub fn flush(&self) -> Result<(), StorageError> {
        let (flat, count) = {
            let headers = self.headers.read();
            let mut flat = Vec::with_capacity(headers.len() * HEADER_SIZE);
            for h in headers.iter() {
                flat.extend_from_slice(h);
            }
            (flat, headers.len())
        };
        let meta = Meta {
            chain: self.get_chain(),
            header_count: count as u64,
        };

        write_atomic(&self.config.data_dir.join(HEADERS_FILE), &flat)?;
        let meta_bytes = serde_json::to_vec_pretty(&meta)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        write_atomic(&self.config.data_dir.join(META_FILE), &meta_bytes)?;

        debug!(headers = count, "Flushed header store");
        Ok(())
    }
}

fn load(dir: &Path) -> Result<(Vec<RawHeader>, String), StorageError> {
    let meta: Meta = match fs::read(dir.join(META_FILE)) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::Corrupt(format!("meta.json: {e}")))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Meta::default(),
        Err(e) => return Err(e.into()),
    };

    let headers = match fs::read(dir.join(HEADERS_FILE)) {
        Ok(bytes) => {
            if bytes.len() % HEADER_SIZE != 0 {
                return Err(StorageError::Corrupt(format!(
                    "headers.bin length {} is not a multiple of {HEADER_SIZE}",
                    bytes.len()
                )));
            }
            bytes
                .chunks_exact(HEADER_SIZE)
                .map(|c| {
                    let mut h = [0u8; HEADER_SIZE];
                    h.copy_from_slice(c);
                    h
                })
                .collect::<Vec<RawHeader>>()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    if meta.header_count != headers.len() as u64 {
        return Err(StorageError::Corrupt(format!(
            "meta.json records {} headers, headers.bin holds {}",
            meta.header_count,
            headers.len()
        )));
    }

    Ok((headers, meta.chain))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn spawn_saver(storage: Weak<Storage>, mut rx: mpsc::UnboundedReceiver<SaveItem>) {
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            // coalesce a burst of requests into a single flush
            while rx.try_recv().is_ok() {}
            let Some(storage) = storage.upgrade() else {
                break;
            };
            match item {
                SaveItem::Headers => {
                    if let Err(e) = storage.flush() {
                        warn!(error = %e, "Header flush failed");
                    }
                }
            }
        }
        debug!("Save queue closed");
    });
}
