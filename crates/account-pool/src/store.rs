//! Durable account storage
//!
//! A JSON file mapping account ids to full Account records. All writes use
//! atomic temp-file + rename to prevent corruption on crash, and the file is
//! chmod 0600 since it contains refresh tokens.
//!
//! The store's mutex is the pool-wide sequence point: the coordinator runs
//! every compound state transition inside one `mutate` closure, and the
//! result is persisted to disk before the call returns (write-through).
//! Network I/O never runs inside a closure.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::account::Account;
use crate::error::{Error, Result};

/// Thread-safe account file manager.
pub struct AccountStore {
    path: PathBuf,
    state: Mutex<HashMap<String, Account>>,
}

impl AccountStore {
    /// Load accounts from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` (cold start with zero
    /// accounts); the replenishment loop fills the pool from there.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Store(format!("reading account file: {e}")))?;
            let accounts: HashMap<String, Account> = serde_json::from_str(&contents)
                .map_err(|e| Error::Store(format!("parsing account file: {e}")))?;
            info!(path = %path.display(), accounts = accounts.len(), "loaded account store");
            accounts
        } else {
            info!(path = %path.display(), "account file not found, starting with empty store");
            let accounts = HashMap::new();
            write_atomic(&path, &accounts).await?;
            accounts
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Apply a mutation and persist the result before returning.
    ///
    /// The closure runs under the store lock and must not block; the disk
    /// commit happens while the lock is still held, so no concurrent caller
    /// can observe unpersisted state.
    pub async fn mutate<T>(&self, f: impl FnOnce(&mut HashMap<String, Account>) -> T) -> Result<T> {
        let mut state = self.state.lock().await;
        let out = f(&mut state);
        write_atomic(&self.path, &state).await?;
        Ok(out)
    }

    /// Run a read-only closure over the current state.
    pub async fn read<T>(&self, f: impl FnOnce(&HashMap<String, Account>) -> T) -> T {
        let state = self.state.lock().await;
        f(&state)
    }

    /// Get a clone of a specific account.
    pub async fn get(&self, id: &str) -> Option<Account> {
        let state = self.state.lock().await;
        state.get(id).cloned()
    }

    /// Add or replace an account and persist to disk.
    pub async fn insert(&self, account: Account) -> Result<()> {
        let mut state = self.state.lock().await;
        debug!(account_id = %account.id, "stored account");
        state.insert(account.id.clone(), account);
        write_atomic(&self.path, &state).await
    }

    /// Number of stored accounts (including retired).
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Write accounts to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target, so a crash mid-write never leaves a corrupt file. Sets 0600
/// permissions since the file contains credential material.
async fn write_atomic(path: &Path, data: &HashMap<String, Account>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Store(format!("serializing accounts: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Store("account path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".accounts.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Store(format!("writing temp account file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Store(format!("setting account file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Store(format!("renaming temp account file: {e}")))?;

    debug!(path = %path.display(), "persisted accounts");
    Ok(())
}
