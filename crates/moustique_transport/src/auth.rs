//! Credential store.
//!
//! Users live in `<datadir>/users/users.json` as an array of
//! `{username, password_hash}` records with SHA-256 hex hashes. Writes
//! replace the whole file atomically (temp file, chmod 0600, rename).

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to access users file: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse users file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct UserRecord {
    username: String,
    password_hash: String,
}

/// SHA-256 hex digest of a password.
pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct UserAuth {
    users: RwLock<HashMap<String, String>>,
    file_path: PathBuf,
}

impl UserAuth {
    /// Open the store under `data_dir`, creating the users directory and
    /// loading any existing users file.
    pub fn open(data_dir: &Path) -> Result<Self, AuthError> {
        let users_dir = data_dir.join("users");
        fs::create_dir_all(&users_dir)?;

        let auth = Self {
            users: RwLock::new(HashMap::new()),
            file_path: users_dir.join("users.json"),
        };
        auth.load()?;
        Ok(auth)
    }

    fn load(&self) -> Result<(), AuthError> {
        let data = match fs::read(&self.file_path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let records: Vec<UserRecord> = serde_json::from_slice(&data)?;
        let mut users = self.users.write();
        users.clear();
        for record in records {
            users.insert(record.username, record.password_hash);
        }
        Ok(())
    }

    /// Persist the current user set atomically.
    pub fn save(&self) -> Result<(), AuthError> {
        let records: Vec<UserRecord> = {
            let users = self.users.read();
            let mut records: Vec<UserRecord> = users
                .iter()
                .map(|(username, password_hash)| UserRecord {
                    username: username.clone(),
                    password_hash: password_hash.clone(),
                })
                .collect();
            records.sort_by(|a, b| a.username.cmp(&b.username));
            records
        };

        let data = serde_json::to_vec_pretty(&records)?;
        let tmp_path = self.file_path.with_extension("json.tmp");
        fs::write(&tmp_path, &data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp_path, &self.file_path)?;
        Ok(())
    }

    /// Add or update a user and persist.
    pub fn add_user(&self, username: &str, password: &str) -> Result<(), AuthError> {
        self.users
            .write()
            .insert(username.to_string(), hash_password(password));
        self.save()
    }

    /// Remove a user and persist. Removing an unknown user is a no-op.
    pub fn remove_user(&self, username: &str) -> Result<(), AuthError> {
        self.users.write().remove(username);
        self.save()
    }

    /// Check a username/password pair against the stored hash.
    pub fn validate(&self, username: &str, password: &str) -> bool {
        match self.users.read().get(username) {
            Some(hash) => *hash == hash_password(password),
            None => false,
        }
    }

    pub fn contains(&self, username: &str) -> bool {
        self.users.read().contains_key(username)
    }

    /// Registered usernames, sorted.
    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.users.read().keys().cloned().collect();
        names.sort();
        names
    }
}
