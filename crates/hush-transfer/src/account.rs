//! Account key material and the password/recovery flows around it.
//!
//! The directory stores only public keys, the master-key-wrapped private
//! keys and the [`MasterKeyRecord`]. Every password hash is computed here,
//! client-side, on a blocking thread.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hush_core::config::CryptoConfig;
use hush_core::CoreEvent;
use hush_crypto::{
    derive_recovery_key_versioned, hash_password, migrate_password, submit_recovery,
    EncryptedKeyPair, KdfParams, KeyPair, MasterKey, MasterKeyRecord, OnMismatch,
    PasswordPolicy, RecoveryKey, RecoveryOutcome, SigningKeyPair, VersionedPassword,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{AccountError, TransferError, TransferResult};
use crate::events::EventSink;

/// A registered user's unlocked key material
#[derive(Debug, Clone)]
pub struct UserKeys {
    pub username: String,
    pub key_pair: KeyPair,
    pub signing: SigningKeyPair,
}

/// What the directory persists per user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub encrypted_keys: EncryptedKeyPair,
    pub master_key_record: MasterKeyRecord,
}

/// Outcome of comparing a client's password version with the server's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordVersionStatus {
    Current,
    MigrationRequired { from: u32, to: u32 },
}

/// Account/key collaborator
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// X25519 public key of `username`, if registered.
    async fn public_key(&self, username: &str) -> Result<Option<[u8; 32]>, AccountError>;

    async fn load_user(&self, username: &str) -> Result<UserRecord, AccountError>;

    async fn create_user(&self, username: &str, record: UserRecord) -> Result<(), AccountError>;

    async fn update_user(&self, username: &str, record: UserRecord) -> Result<(), AccountError>;

    async fn password_version_status(&self, client_version: u32) -> PasswordVersionStatus;
}

/// Directory kept in process memory
#[derive(Debug)]
pub struct InMemoryAccountDirectory {
    users: RwLock<HashMap<String, UserRecord>>,
    latest_password_version: u32,
}

impl InMemoryAccountDirectory {
    pub fn new(latest_password_version: u32) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            latest_password_version,
        }
    }
}

impl Default for InMemoryAccountDirectory {
    fn default() -> Self {
        Self::new(PasswordPolicy::default().latest_version())
    }
}

#[async_trait]
impl AccountDirectory for InMemoryAccountDirectory {
    async fn public_key(&self, username: &str) -> Result<Option<[u8; 32]>, AccountError> {
        let users = self.users.read().await;
        Ok(users
            .get(&normalize(username))
            .map(|record| record.encrypted_keys.public_key))
    }

    async fn load_user(&self, username: &str) -> Result<UserRecord, AccountError> {
        let username = normalize(username);
        self.users
            .read()
            .await
            .get(&username)
            .cloned()
            .ok_or(AccountError::UnknownUser(username))
    }

    async fn create_user(&self, username: &str, record: UserRecord) -> Result<(), AccountError> {
        let username = normalize(username);
        let mut users = self.users.write().await;
        if users.contains_key(&username) {
            return Err(AccountError::AlreadyExists(username));
        }
        users.insert(username, record);
        Ok(())
    }

    async fn update_user(&self, username: &str, record: UserRecord) -> Result<(), AccountError> {
        let username = normalize(username);
        let mut users = self.users.write().await;
        match users.get_mut(&username) {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(AccountError::UnknownUser(username)),
        }
    }

    async fn password_version_status(&self, client_version: u32) -> PasswordVersionStatus {
        if client_version < self.latest_password_version {
            PasswordVersionStatus::MigrationRequired {
                from: client_version,
                to: self.latest_password_version,
            }
        } else {
            PasswordVersionStatus::Current
        }
    }
}

fn normalize(username: &str) -> String {
    hush_crypto::normalize_username(username)
}

/// Build the password policy described by `[crypto]`.
pub fn policy_from_config(cfg: &CryptoConfig) -> PasswordPolicy {
    PasswordPolicy::new(
        cfg.latest_password_version,
        KdfParams {
            mem_cost_kib: cfg.argon2_mem_cost_kib,
            time_cost: cfg.argon2_time_cost,
            parallelism: cfg.argon2_parallelism,
        },
    )
}

/// Result of a successful login
#[derive(Debug)]
pub struct LoginOutcome {
    pub keys: UserKeys,
    pub status: PasswordVersionStatus,
    /// Set when the login migrated the password hash; the old recovery key
    /// no longer matches.
    pub new_recovery_key: Option<RecoveryKey>,
}

/// Result of a recovery submission
#[derive(Debug)]
pub struct RecoveredAccount {
    pub keys: UserKeys,
    pub recovery_key: RecoveryKey,
    /// The master key (and with it every key pair) was replaced
    pub regenerated: bool,
}

pub struct AccountService {
    directory: Arc<dyn AccountDirectory>,
    policy: Arc<PasswordPolicy>,
    events: EventSink,
}

impl AccountService {
    pub fn new(directory: Arc<dyn AccountDirectory>, policy: PasswordPolicy) -> Self {
        Self {
            directory,
            policy: Arc::new(policy),
            events: EventSink::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn directory(&self) -> &Arc<dyn AccountDirectory> {
        &self.directory
    }

    /// Create an account with fresh key pairs and return the unlocked keys
    /// together with the recovery key to show the user once.
    pub async fn register(
        &self,
        username: &str,
        password: &SecretString,
    ) -> TransferResult<(UserKeys, RecoveryKey)> {
        let username = validated_username(username)?;
        let hash = self
            .hash_blocking(password, &username, self.policy.latest_version())
            .await?;

        let master = MasterKey::generate();
        let (master_key_record, recovery_key) =
            MasterKeyRecord::seal(&master, &username, &hash)?;
        let keys = UserKeys {
            username: username.clone(),
            key_pair: KeyPair::generate(),
            signing: SigningKeyPair::generate(),
        };
        let encrypted_keys = EncryptedKeyPair::seal(master.as_bytes(), &keys.key_pair, &keys.signing)?;

        self.directory
            .create_user(
                &username,
                UserRecord {
                    encrypted_keys,
                    master_key_record,
                },
            )
            .await?;
        info!(username = %username, "account registered");
        Ok((keys, recovery_key))
    }

    /// Unlock the user's keys. A stored hash older than the server's latest
    /// version is migrated on the way.
    pub async fn login(
        &self,
        username: &str,
        password: &SecretString,
    ) -> TransferResult<LoginOutcome> {
        let username = validated_username(username)?;
        let record = self.directory.load_user(&username).await?;
        let stored_version = record.master_key_record.password_version;

        let hash = self.hash_blocking(password, &username, stored_version).await?;
        let master = record.master_key_record.open(&hash)?;
        let (key_pair, signing) = record.encrypted_keys.open(master.as_bytes())?;
        let keys = UserKeys {
            username: username.clone(),
            key_pair,
            signing,
        };

        let status = self.directory.password_version_status(stored_version).await;
        let new_recovery_key = match status {
            PasswordVersionStatus::Current => None,
            PasswordVersionStatus::MigrationRequired { from, to } => {
                let new_hash = self.hash_blocking(password, &username, to).await?;
                Some(self.rewrap(&username, record, &hash, &new_hash, from, to).await?)
            }
        };

        Ok(LoginOutcome {
            keys,
            status,
            new_recovery_key,
        })
    }

    /// Change the password. Returns the new recovery key.
    pub async fn change_password(
        &self,
        username: &str,
        old_password: &SecretString,
        new_password: &SecretString,
    ) -> TransferResult<RecoveryKey> {
        let username = validated_username(username)?;
        let record = self.directory.load_user(&username).await?;
        let from = record.master_key_record.password_version;
        let to = self.policy.latest_version();

        let old_hash = self.hash_blocking(old_password, &username, from).await?;
        let new_hash = self.hash_blocking(new_password, &username, to).await?;
        self.rewrap(&username, record, &old_hash, &new_hash, from, to).await
    }

    /// The recovery key matching the current password.
    pub async fn recovery_key(
        &self,
        username: &str,
        password: &SecretString,
    ) -> TransferResult<RecoveryKey> {
        let username = validated_username(username)?;
        let record = self.directory.load_user(&username).await?;
        let hash = self
            .hash_blocking(password, &username, record.master_key_record.password_version)
            .await?;
        let master = record.master_key_record.open(&hash)?;
        Ok(derive_recovery_key_versioned(&master, &username, &hash))
    }

    /// Reset the password with a recovery key.
    ///
    /// A wrong key fails with a verification error unless `on_mismatch` is
    /// [`OnMismatch::RegenerateMasterKey`], in which case the account gets a
    /// new master key and new key pairs; anything encrypted to the old keys
    /// is lost.
    pub async fn submit_recovery(
        &self,
        username: &str,
        recovery_key: &RecoveryKey,
        new_password: &SecretString,
        on_mismatch: OnMismatch,
    ) -> TransferResult<RecoveredAccount> {
        let username = validated_username(username)?;
        let record = self.directory.load_user(&username).await?;

        let outcome = {
            let master_record = record.master_key_record.clone();
            let name = username.clone();
            let key = RecoveryKey::from_bytes(*recovery_key.as_bytes());
            let password = copy_secret(new_password);
            let policy = self.policy.clone();
            tokio::task::spawn_blocking(move || {
                submit_recovery(&master_record, &name, &key, &password, &policy, on_mismatch)
            })
            .await
            .map_err(|e| AccountError::Backend(format!("recovery task failed: {e}")))??
        };

        match outcome {
            RecoveryOutcome::Rewrapped {
                record: master_key_record,
                recovery_key: new_recovery_key,
            } => {
                let master = record.master_key_record.open_with_recovery_key(recovery_key)?;
                let (key_pair, signing) = record.encrypted_keys.open(master.as_bytes())?;
                self.directory
                    .update_user(
                        &username,
                        UserRecord {
                            encrypted_keys: record.encrypted_keys,
                            master_key_record,
                        },
                    )
                    .await?;
                self.events.emit(CoreEvent::MasterKeyRewrapped {
                    username: username.clone(),
                });
                Ok(RecoveredAccount {
                    keys: UserKeys {
                        username,
                        key_pair,
                        signing,
                    },
                    recovery_key: new_recovery_key,
                    regenerated: false,
                })
            }
            RecoveryOutcome::Regenerated {
                record: master_key_record,
                recovery_key: new_recovery_key,
                master_key,
            } => {
                let keys = UserKeys {
                    username: username.clone(),
                    key_pair: KeyPair::generate(),
                    signing: SigningKeyPair::generate(),
                };
                let encrypted_keys =
                    EncryptedKeyPair::seal(master_key.as_bytes(), &keys.key_pair, &keys.signing)?;
                self.directory
                    .update_user(
                        &username,
                        UserRecord {
                            encrypted_keys,
                            master_key_record,
                        },
                    )
                    .await?;
                self.events.emit(CoreEvent::MasterKeyRegenerated {
                    username: username.clone(),
                });
                Ok(RecoveredAccount {
                    keys,
                    recovery_key: new_recovery_key,
                    regenerated: true,
                })
            }
        }
    }

    async fn rewrap(
        &self,
        username: &str,
        record: UserRecord,
        old_hash: &VersionedPassword,
        new_hash: &VersionedPassword,
        from: u32,
        to: u32,
    ) -> TransferResult<RecoveryKey> {
        let (master_key_record, recovery_key) =
            migrate_password(&record.master_key_record, username, old_hash, new_hash)?;
        self.directory
            .update_user(
                username,
                UserRecord {
                    encrypted_keys: record.encrypted_keys,
                    master_key_record,
                },
            )
            .await?;
        info!(username = %username, from, to, "password hash migrated");
        self.events.emit(CoreEvent::PasswordMigrated {
            username: username.to_string(),
            from,
            to,
        });
        Ok(recovery_key)
    }

    async fn hash_blocking(
        &self,
        password: &SecretString,
        username: &str,
        version: u32,
    ) -> TransferResult<VersionedPassword> {
        let password = copy_secret(password);
        let username = username.to_string();
        let policy = self.policy.clone();
        let hash = tokio::task::spawn_blocking(move || {
            hash_password(&password, &username, version, &policy)
        })
        .await
        .map_err(|e| AccountError::Backend(format!("hashing task failed: {e}")))??;
        Ok(hash)
    }
}

fn validated_username(username: &str) -> TransferResult<String> {
    let username = normalize(username);
    if username.is_empty() {
        return Err(TransferError::Validation("username must not be empty".into()));
    }
    Ok(username)
}

fn copy_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_owned())
}
