//! Key-value persistence for wallet state.
//!
//! Logical keys mirror the browser wallet's local storage: sealed keys,
//! notes, the serialized tree and the last synced block. Values are JSON
//! text; wide integers are decimal strings and hashes are hex.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use shielded_wallet_lib::{Address, MerkleTree, Note, TreeSnapshot};
use tracing::{debug, warn};

use crate::error::{Result, WalletError};
use crate::keystore::SealedKeys;

pub const WALLET_KEYS: &str = "wallet_keys";
pub const NOTES: &str = "notes";
pub const MERKLE_TREE: &str = "merkle_tree";
pub const LAST_SYNCED_BLOCK: &str = "last_synced_block";

pub const ALL_KEYS: [&str; 4] = [WALLET_KEYS, NOTES, MERKLE_TREE, LAST_SYNCED_BLOCK];

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Durable once this returns.
    async fn put(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries().remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File store
// ---------------------------------------------------------------------------

/// One JSON file per key under a per-account directory. Writes go to a
/// temporary file first and are renamed into place.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileStore { dir: dir.into() }
    }

    /// `<data_dir>/<chain_id>/<account>`
    pub fn for_account(data_dir: &Path, chain_id: u64, account: Address) -> Self {
        Self::new(data_dir.join(chain_id.to_string()).join(format!("{account:#x}")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> WalletError {
    WalletError::Storage(format!("{action} {}: {e}", path.display()))
}

#[async_trait]
impl StateStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", &path, e)),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error("create", &self.dir, e))?;

        let path = self.path(key);
        let tmp = self.dir.join(format!(".{key}.json.tmp"));
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| io_error("write", &tmp, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| io_error("chmod", &tmp, e))?;
        }

        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error("rename", &path, e))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("remove", &path, e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Typed access
// ---------------------------------------------------------------------------

/// Everything recovered from storage. Absent or unreadable entries come
/// back as their empty defaults.
#[derive(Debug, Default)]
pub struct PersistedState {
    pub sealed_keys: Option<SealedKeys>,
    pub notes: Vec<Note>,
    pub tree: Option<MerkleTree>,
    pub last_synced_block: u64,
}

async fn read_json<T: serde::de::DeserializeOwned>(store: &dyn StateStore, key: &str) -> Result<Option<T>> {
    match store.get(key).await? {
        None => Ok(None),
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| WalletError::StorageCorrupt(format!("{key}: {e}"))),
    }
}

async fn write_json<T: serde::Serialize + Sync>(store: &dyn StateStore, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string(value).map_err(|e| WalletError::Storage(format!("{key}: {e}")))?;
    store.put(key, &raw).await
}

/// Take the value or fall back to the default, logging why.
fn or_empty<T: Default>(key: &str, loaded: Result<Option<T>>) -> T {
    match loaded {
        Ok(value) => value.unwrap_or_default(),
        Err(e) => {
            warn!(key, error = %e, "discarding unreadable persisted state");
            T::default()
        }
    }
}

pub async fn load_state(store: &dyn StateStore) -> PersistedState {
    let sealed_keys = or_empty(WALLET_KEYS, read_json::<SealedKeys>(store, WALLET_KEYS).await.map(Some));
    let notes = or_empty(NOTES, read_json::<Vec<Note>>(store, NOTES).await);
    let last_synced_block = or_empty(
        LAST_SYNCED_BLOCK,
        read_json::<String>(store, LAST_SYNCED_BLOCK)
            .await
            .and_then(|raw| {
                raw.map(|s| {
                    s.parse::<u64>()
                        .map_err(|e| WalletError::StorageCorrupt(format!("{LAST_SYNCED_BLOCK}: {e}")))
                })
                .transpose()
            }),
    );

    let tree = match read_json::<TreeSnapshot>(store, MERKLE_TREE).await {
        Ok(Some(snapshot)) => match MerkleTree::deserialize(&snapshot) {
            Ok(tree) => Some(tree),
            Err(e) => {
                warn!(error = %e, "discarding malformed merkle tree");
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, "discarding unreadable merkle tree");
            None
        }
    };

    debug!(
        notes = notes.len(),
        has_tree = tree.is_some(),
        has_keys = sealed_keys.is_some(),
        last_synced_block,
        "loaded persisted state"
    );
    PersistedState {
        sealed_keys,
        notes,
        tree,
        last_synced_block,
    }
}

pub async fn save_sealed_keys(store: &dyn StateStore, sealed: &SealedKeys) -> Result<()> {
    write_json(store, WALLET_KEYS, sealed).await
}

/// Persist notes, tree and sync height together.
pub async fn save_state(store: &dyn StateStore, notes: &[Note], tree: &TreeSnapshot, last_synced_block: u64) -> Result<()> {
    write_json(store, NOTES, &notes).await?;
    write_json(store, MERKLE_TREE, tree).await?;
    write_json(store, LAST_SYNCED_BLOCK, &last_synced_block.to_string()).await
}

pub async fn clear(store: &dyn StateStore) -> Result<()> {
    for key in ALL_KEYS {
        store.remove(key).await?;
    }
    Ok(())
}
