//! Key Hierarchy Manager.
//!
//! ```text
//! password ──KDF──▶ MasterKey ──wraps──▶ UserKey ──encrypts──▶ private key
//!                                           │                      │
//!                                           │              RSA-unwraps
//!                                           ▼                      ▼
//!                                      vault data        OrgKey / ProviderKey
//! ```
//!
//! [`KeyService`] is the only writer of decrypted material into the
//! per-account caches held by its [`KeyCacheArena`]. Every operation takes the
//! account's [`UserId`] explicitly; accounts never share state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

use vaultkey_core::config::StorageConfig;
use vaultkey_core::{
    DecryptFailure, HashPurpose, OrganizationId, ProviderId, UnlockState, UserId, VaultKeyError,
    VaultKeyResult,
};
use vaultkey_crypto::{
    decrypt_from_buffer, decrypt_to_bytes, decrypt_to_string, derive_key, encrypt, encrypt_str,
    encrypt_to_buffer, extract_public_key, generate_key, generate_key_pair, hash_password,
    hashes_equal, rsa_decrypt, rsa_encrypt, stretch_key, EncArrayBuffer, EncString, KdfConfig,
    MasterKey, OrgKey, PinKey, ProviderKey, SymmetricCryptoKey, UserKey, STRETCHED_KEY_SIZE,
};

use crate::cache::{AccountKeys, KeyCacheArena};
use crate::models::{
    EncryptedOrganizationKey, ProfileOrganization, ProfileProvider, ProfileProviderOrganization,
    ProtectedPin,
};
use crate::state::{keys, Storage, StorageLocation};

pub struct KeyService {
    storage: Storage,
    arena: KeyCacheArena,
}

impl KeyService {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            arena: KeyCacheArena::new(),
        }
    }

    /// Build from the storage section of the config file.
    pub async fn from_config(config: &StorageConfig) -> VaultKeyResult<Self> {
        Ok(Self::new(Storage::from_config(config).await?))
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// In-memory key cache for `user`, created on first use.
    pub async fn open(&self, user: &UserId) -> Arc<AccountKeys> {
        self.arena.open(user).await
    }

    pub async fn open_accounts(&self) -> Vec<UserId> {
        self.arena.open_accounts().await
    }

    // ── Master key ──────────────────────────────────────────────────────

    /// Derive the master key for an account. The email is trimmed and
    /// lowercased before use as the salt. Touches no state.
    pub async fn derive_master_key(
        password: &SecretString,
        email: &str,
        kdf: &KdfConfig,
    ) -> VaultKeyResult<MasterKey> {
        let salt = email.trim().to_lowercase();
        derive_offloaded(password, salt, *kdf).await.map(MasterKey::new)
    }

    pub async fn set_master_key(&self, user: &UserId, key: MasterKey) {
        let cache = self.arena.open(user).await;
        *cache.master_key.write().await = Some(key);
    }

    pub async fn master_key(&self, user: &UserId) -> Option<MasterKey> {
        let cache = self.arena.get(user).await?;
        let key = cache.master_key.read().await.clone();
        key
    }

    pub async fn clear_master_key(&self, user: &UserId) {
        if let Some(cache) = self.arena.get(user).await {
            *cache.master_key.write().await = None;
        }
    }

    // ── User key ────────────────────────────────────────────────────────

    /// Generate a fresh 64-byte user key wrapped under `master_key`, or under
    /// the master key held in memory when none is given.
    pub async fn make_user_key(
        &self,
        user: &UserId,
        master_key: Option<&MasterKey>,
    ) -> VaultKeyResult<(UserKey, EncString)> {
        let master = self.resolve_master_key(user, master_key).await?;
        let user_key = generate_key(STRETCHED_KEY_SIZE)?;
        let wrapped = protect_key(master.key(), &user_key)?;
        Ok((UserKey::new(user_key), wrapped))
    }

    /// Re-wrap the in-memory user key under a (new) master key.
    pub async fn encrypt_user_key_with_master_key(
        &self,
        user: &UserId,
        master_key: Option<&MasterKey>,
    ) -> VaultKeyResult<EncString> {
        let master = self.resolve_master_key(user, master_key).await?;
        let user_key = self.user_key(user).await.ok_or(VaultKeyError::NoUserKey)?;
        protect_key(master.key(), user_key.key())
    }

    /// Open a wrapped user key with a master (or PIN) key.
    ///
    /// Type 0 envelopes are opened with the raw 32-byte key; type 2 envelopes
    /// with the stretched key. A MAC or padding failure means the password
    /// was wrong and is reported as [`VaultKeyError::InvalidMasterKey`].
    pub fn unwrap_user_key(
        master_key: &SymmetricCryptoKey,
        wrapped: &EncString,
    ) -> VaultKeyResult<UserKey> {
        let raw = match wrapped {
            EncString::AesCbc256B64 { .. } => decrypt_to_bytes(wrapped, master_key),
            EncString::AesCbc256HmacSha256B64 { .. } if master_key.is_stretched() => {
                decrypt_to_bytes(wrapped, master_key)
            }
            EncString::AesCbc256HmacSha256B64 { .. } => {
                decrypt_to_bytes(wrapped, &stretch_key(master_key)?)
            }
            other => {
                return Err(VaultKeyError::UnsupportedEncryptionType(format!(
                    "user key wrapped with type {}",
                    other.encryption_type()
                )))
            }
        }
        .map_err(wrong_password)?;

        // An unauthenticated envelope can decrypt under the wrong key with
        // valid-looking padding; the length check catches most of those.
        SymmetricCryptoKey::from_bytes(&raw)
            .map(UserKey::new)
            .map_err(|_| VaultKeyError::InvalidMasterKey)
    }

    /// Unwrap the user key using the given or in-memory master key and the
    /// given or stored wrapped user key.
    pub async fn decrypt_user_key_with_master_key(
        &self,
        user: &UserId,
        master_key: Option<&MasterKey>,
        wrapped: Option<&EncString>,
    ) -> VaultKeyResult<UserKey> {
        let master = self.resolve_master_key(user, master_key).await?;
        let wrapped = match wrapped {
            Some(w) => w.clone(),
            None => self
                .encrypted_user_key(user)
                .await?
                .ok_or(VaultKeyError::NoEncryptedUserKey)?,
        };
        Self::unwrap_user_key(master.key(), &wrapped)
    }

    pub async fn set_encrypted_user_key(
        &self,
        user: &UserId,
        wrapped: &EncString,
    ) -> VaultKeyResult<()> {
        self.storage
            .set(
                &StorageLocation::disk(user),
                keys::ENCRYPTED_USER_KEY,
                &wrapped.to_string(),
            )
            .await
    }

    pub async fn encrypted_user_key(&self, user: &UserId) -> VaultKeyResult<Option<EncString>> {
        self.storage
            .get_parsed(&StorageLocation::disk(user), keys::ENCRYPTED_USER_KEY)
            .await
    }

    /// Install `key` as the in-memory user key and bring the stored copies
    /// in line with it. A stored auto-unlock key is overwritten. When a
    /// protected PIN exists, the PIN-wrapped copies (session and persisted,
    /// whichever are present) are wrapped again under the new key.
    pub async fn set_user_key(&self, user: &UserId, key: UserKey) -> VaultKeyResult<()> {
        let cache = self.arena.open(user).await;
        let previous = cache.user_key.write().await.replace(key.clone());
        self.store_additional_keys(user, &key, previous.as_ref()).await
    }

    async fn store_additional_keys(
        &self,
        user: &UserId,
        key: &UserKey,
        previous: Option<&UserKey>,
    ) -> VaultKeyResult<()> {
        let secure = StorageLocation::secure(user);
        if self.storage.get(&secure, keys::USER_KEY_AUTO).await?.is_some() {
            self.storage
                .set(&secure, keys::USER_KEY_AUTO, &key.key().key_b64())
                .await?;
        }

        let Some(protected) = self.protected_pin(user).await? else {
            return Ok(());
        };
        let cache = self.arena.open(user).await;
        let ephemeral = cache.ephemeral_pin_key.read().await.is_some();
        let persisted = self
            .storage
            .get(&StorageLocation::disk(user), keys::PIN_KEY_ENCRYPTED_USER_KEY)
            .await?
            .is_some();
        if !ephemeral && !persisted {
            return Ok(());
        }

        // The protected PIN is still under the old key when this is a rotation.
        let pin = match decrypt_to_string(&protected.pin, key.key()) {
            Ok(pin) => pin,
            Err(e) => match previous.map(|old| decrypt_to_string(&protected.pin, old.key())) {
                Some(Ok(pin)) => pin,
                _ => {
                    tracing::warn!(user = %user, error = %e, "cannot open protected PIN, PIN key not refreshed");
                    return Ok(());
                }
            },
        };
        let pin = SecretString::from(pin);
        let pin_key = Self::make_pin_key(&pin, &protected.salt, &protected.kdf).await?;

        self.store_protected_pin(user, &pin, &protected.salt, &protected.kdf, key)
            .await?;
        if ephemeral {
            self.wrap_user_key_with_pin(user, key, &pin_key, false).await?;
        }
        if persisted {
            self.wrap_user_key_with_pin(user, key, &pin_key, true).await?;
        }
        tracing::debug!(user = %user, "refreshed PIN-wrapped user key");
        Ok(())
    }

    pub async fn user_key(&self, user: &UserId) -> Option<UserKey> {
        let cache = self.arena.get(user).await?;
        let key = cache.user_key.read().await.clone();
        key
    }

    /// True when a user key is in memory or stored for auto-unlock.
    pub async fn has_user_key(&self, user: &UserId) -> VaultKeyResult<bool> {
        if self.user_key(user).await.is_some() {
            return Ok(true);
        }
        self.migrate_auto_key_if_needed(user).await?;
        Ok(self
            .storage
            .get(&StorageLocation::secure(user), keys::USER_KEY_AUTO)
            .await?
            .is_some())
    }

    /// Drop the in-memory user key; with `clear_stored`, also the stored
    /// auto-unlock copy and the session PIN-wrapped copy. A persisted
    /// PIN-wrapped key is kept.
    pub async fn clear_user_key(&self, user: &UserId, clear_stored: bool) -> VaultKeyResult<()> {
        if let Some(cache) = self.arena.get(user).await {
            *cache.user_key.write().await = None;
        }
        if clear_stored {
            self.clear_stored_user_keys(user).await?;
        }
        Ok(())
    }

    async fn clear_stored_user_keys(&self, user: &UserId) -> VaultKeyResult<()> {
        self.storage
            .remove(&StorageLocation::secure(user), keys::USER_KEY_AUTO)
            .await?;
        if let Some(cache) = self.arena.get(user).await {
            *cache.ephemeral_pin_key.write().await = None;
        }
        Ok(())
    }

    /// Key that encrypts this account's vault data: the user key, or for
    /// accounts that never migrated to a user key, the master key.
    pub async fn encryption_key(&self, user: &UserId) -> VaultKeyResult<SymmetricCryptoKey> {
        if let Some(user_key) = self.user_key(user).await {
            return Ok(user_key.into_inner());
        }
        match self.master_key(user).await {
            Some(master) => {
                tracing::debug!(user = %user, "no user key, using legacy master key");
                Ok(master.into_inner())
            }
            None => Err(VaultKeyError::NoUserKey),
        }
    }

    // ── Auto-unlock key ─────────────────────────────────────────────────

    /// Persist the in-memory user key to the secure tier.
    pub async fn store_user_key_auto(&self, user: &UserId) -> VaultKeyResult<()> {
        let user_key = self.user_key(user).await.ok_or(VaultKeyError::NoUserKey)?;
        let encoded = user_key.key().key_b64();
        self.storage
            .set(&StorageLocation::secure(user), keys::USER_KEY_AUTO, &encoded)
            .await
    }

    /// Load the auto-unlock user key. A key that does not open the account's
    /// private key is discarded and `None` returned.
    pub async fn user_key_from_storage(&self, user: &UserId) -> VaultKeyResult<Option<UserKey>> {
        self.migrate_auto_key_if_needed(user).await?;
        let Some(encoded) = self
            .storage
            .get(&StorageLocation::secure(user), keys::USER_KEY_AUTO)
            .await?
            .map(Zeroizing::new)
        else {
            return Ok(None);
        };

        let key = UserKey::new(SymmetricCryptoKey::from_b64(&encoded)?);
        if !self.validate_user_key(user, &key).await? {
            tracing::warn!(user = %user, "wrong key, throwing away stored key");
            self.clear_stored_user_keys(user).await?;
            return Ok(None);
        }
        Ok(Some(key))
    }

    /// Older clients stored the master key for auto-unlock. Replace it with
    /// the user key it unwraps.
    async fn migrate_auto_key_if_needed(&self, user: &UserId) -> VaultKeyResult<()> {
        let secure = StorageLocation::secure(user);
        let Some(encoded) = self
            .storage
            .get(&secure, keys::MASTER_KEY_AUTO)
            .await?
            .map(Zeroizing::new)
        else {
            return Ok(());
        };

        let master = MasterKey::new(SymmetricCryptoKey::from_b64(&encoded)?);
        let user_key = self
            .decrypt_user_key_with_master_key(user, Some(&master), None)
            .await?;
        self.storage
            .set(&secure, keys::USER_KEY_AUTO, &user_key.key().key_b64())
            .await?;
        self.storage.remove(&secure, keys::MASTER_KEY_AUTO).await?;
        tracing::info!(user = %user, "migrated auto-unlock key to user key");
        Ok(())
    }

    /// A user key is valid when it decrypts the stored private key and a
    /// public key can be derived from the result.
    pub async fn validate_user_key(&self, user: &UserId, key: &UserKey) -> VaultKeyResult<bool> {
        let Some(encrypted) = self.encrypted_private_key(user).await? else {
            return Ok(false);
        };
        let valid = decrypt_to_bytes(&encrypted, key.key())
            .and_then(|private_key| extract_public_key(&private_key))
            .is_ok();
        Ok(valid)
    }

    // ── Key hash ────────────────────────────────────────────────────────

    pub fn hash_password(
        password: &SecretString,
        master_key: &MasterKey,
        purpose: HashPurpose,
    ) -> String {
        hash_password(password, master_key, purpose)
    }

    pub async fn set_key_hash(&self, user: &UserId, hash: &str) -> VaultKeyResult<()> {
        self.storage
            .set(&StorageLocation::disk(user), keys::KEY_HASH, hash)
            .await
    }

    pub async fn key_hash(&self, user: &UserId) -> VaultKeyResult<Option<String>> {
        self.storage
            .get(&StorageLocation::disk(user), keys::KEY_HASH)
            .await
    }

    pub async fn clear_key_hash(&self, user: &UserId) -> VaultKeyResult<()> {
        self.storage
            .remove(&StorageLocation::disk(user), keys::KEY_HASH)
            .await
    }

    /// Check `password` against the stored key hash.
    ///
    /// The local-authorization hash is tried first. A stored hash in the
    /// older server-authorization form also matches, and is rewritten to the
    /// local form.
    pub async fn compare_and_upgrade_key_hash(
        &self,
        user: &UserId,
        password: &SecretString,
        master_key: &MasterKey,
    ) -> VaultKeyResult<bool> {
        let Some(stored) = self.key_hash(user).await? else {
            return Ok(false);
        };
        match match_key_hash(&stored, password, master_key) {
            Some(purpose) => {
                self.store_local_key_hash(user, password, master_key, Some(purpose))
                    .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Write the local-authorization hash unless `matched` says the stored
    /// hash is already in that form.
    async fn store_local_key_hash(
        &self,
        user: &UserId,
        password: &SecretString,
        master_key: &MasterKey,
        matched: Option<HashPurpose>,
    ) -> VaultKeyResult<()> {
        if matched == Some(HashPurpose::LocalAuthorization) {
            return Ok(());
        }
        let local = hash_password(password, master_key, HashPurpose::LocalAuthorization);
        self.set_key_hash(user, &local).await?;
        if matched == Some(HashPurpose::ServerAuthorization) {
            tracing::info!(user = %user, "upgraded stored key hash to local form");
        }
        Ok(())
    }

    // ── Key pair ────────────────────────────────────────────────────────

    /// Generate an RSA-2048 pair. Returns the SPKI public key and the PKCS#8
    /// private key encrypted under `key`.
    pub async fn make_key_pair(key: &SymmetricCryptoKey) -> VaultKeyResult<(Vec<u8>, EncString)> {
        let pair = tokio::task::spawn_blocking(generate_key_pair)
            .await
            .map_err(|e| VaultKeyError::Crypto(format!("key pair task: {e}")))??;
        let encrypted_private = encrypt(&pair.private_key, key)?;
        Ok((pair.public_key, encrypted_private))
    }

    /// Persist a new encrypted private key. The decrypted private and public
    /// keys are dropped first so no reader sees a stale pair.
    pub async fn set_private_key(&self, user: &UserId, encrypted: &EncString) -> VaultKeyResult<()> {
        let cache = self.arena.open(user).await;
        let location = StorageLocation::disk(user);
        let value = encrypted.to_string();
        // Same lock order as `public_key`: public slot, then private slot.
        cache
            .public_key
            .replace_source(|| {
                cache.private_key.replace_source(|| {
                    self.storage
                        .set(&location, keys::ENCRYPTED_PRIVATE_KEY, &value)
                })
            })
            .await
    }

    pub async fn encrypted_private_key(&self, user: &UserId) -> VaultKeyResult<Option<EncString>> {
        self.storage
            .get_parsed(&StorageLocation::disk(user), keys::ENCRYPTED_PRIVATE_KEY)
            .await
    }

    /// Decrypted PKCS#8 private key, cached after the first decrypt.
    pub async fn private_key(
        &self,
        user: &UserId,
    ) -> VaultKeyResult<Option<Arc<Zeroizing<Vec<u8>>>>> {
        let cache = self.arena.open(user).await;
        cache
            .private_key
            .get_or_try_init(|| async {
                let Some(encrypted) = self.encrypted_private_key(user).await? else {
                    return Ok(None);
                };
                let key = self.encryption_key(user).await?;
                decrypt_to_bytes(&encrypted, &key).map(Some)
            })
            .await
    }

    /// SPKI public key derived from the private key.
    pub async fn public_key(&self, user: &UserId) -> VaultKeyResult<Option<Arc<Vec<u8>>>> {
        let cache = self.arena.open(user).await;
        cache
            .public_key
            .get_or_try_init(|| async {
                match self.private_key(user).await? {
                    Some(private_key) => extract_public_key(&private_key).map(Some),
                    None => Ok(None),
                }
            })
            .await
    }

    /// Fingerprint phrase of `public_key`, or of this account's own public
    /// key when none is given.
    pub async fn fingerprint(
        &self,
        user: &UserId,
        material: &str,
        public_key: Option<&[u8]>,
    ) -> VaultKeyResult<Vec<String>> {
        match public_key {
            Some(public_key) => vaultkey_crypto::fingerprint(material, public_key),
            None => {
                let public_key = self.public_key(user).await?.ok_or(VaultKeyError::NoPublicKey)?;
                vaultkey_crypto::fingerprint(material, &public_key)
            }
        }
    }

    pub async fn clear_key_pair(&self, user: &UserId, memory_only: bool) -> VaultKeyResult<()> {
        if let Some(cache) = self.arena.get(user).await {
            cache.private_key.clear().await;
            cache.public_key.clear().await;
        }
        if !memory_only {
            self.storage
                .remove(&StorageLocation::disk(user), keys::ENCRYPTED_PRIVATE_KEY)
                .await?;
        }
        Ok(())
    }

    /// Fresh 64-byte key wrapped to this account's own public key.
    pub async fn make_share_key(
        &self,
        user: &UserId,
    ) -> VaultKeyResult<(EncString, SymmetricCryptoKey)> {
        let public_key = self.public_key(user).await?.ok_or(VaultKeyError::NoPublicKey)?;
        let share_key = generate_key(STRETCHED_KEY_SIZE)?;
        let wrapped = rsa_encrypt(share_key.as_bytes(), &public_key)?;
        Ok((wrapped, share_key))
    }

    /// Fresh 64-byte data key wrapped under an organization key.
    pub fn make_org_data_enc_key(
        org_key: &OrgKey,
    ) -> VaultKeyResult<(SymmetricCryptoKey, EncString)> {
        let data_key = generate_key(STRETCHED_KEY_SIZE)?;
        let wrapped = protect_key(org_key.key(), &data_key)?;
        Ok((data_key, wrapped))
    }

    // ── Organization keys ───────────────────────────────────────────────

    /// Replace the encrypted org-key map from a sync profile.
    pub async fn set_org_keys(
        &self,
        user: &UserId,
        orgs: &[ProfileOrganization],
        provider_orgs: &[ProfileProviderOrganization],
    ) -> VaultKeyResult<()> {
        let mut encrypted: HashMap<OrganizationId, EncryptedOrganizationKey> = orgs
            .iter()
            .map(|org| (org.id.clone(), EncryptedOrganizationKey::from(org)))
            .collect();
        for org in provider_orgs {
            // Direct membership wins over provider access.
            encrypted
                .entry(org.id.clone())
                .or_insert_with(|| EncryptedOrganizationKey::from(org));
        }

        let cache = self.arena.open(user).await;
        let location = StorageLocation::disk(user);
        cache
            .org_keys
            .replace_source(|| {
                self.storage
                    .set_json(&location, keys::ENCRYPTED_ORG_KEYS, &encrypted)
            })
            .await?;
        tracing::debug!(user = %user, count = encrypted.len(), "stored encrypted organization keys");
        Ok(())
    }

    /// Every organization key this account can open, decrypted once and
    /// cached. `None` when nothing is stored or nothing decrypted.
    pub async fn org_keys(
        &self,
        user: &UserId,
    ) -> VaultKeyResult<Option<Arc<HashMap<OrganizationId, OrgKey>>>> {
        let cache = self.arena.open(user).await;
        cache
            .org_keys
            .get_or_try_init(|| self.decrypt_org_keys(user))
            .await
    }

    async fn decrypt_org_keys(
        &self,
        user: &UserId,
    ) -> VaultKeyResult<Option<HashMap<OrganizationId, OrgKey>>> {
        let Some(encrypted) = self
            .storage
            .get_json::<HashMap<OrganizationId, EncryptedOrganizationKey>>(
                &StorageLocation::disk(user),
                keys::ENCRYPTED_ORG_KEYS,
            )
            .await?
        else {
            return Ok(None);
        };

        let mut decrypted = HashMap::with_capacity(encrypted.len());
        for (org_id, entry) in &encrypted {
            let key = match entry {
                EncryptedOrganizationKey::Organization { .. } => {
                    let private_key = self.private_key(user).await?.ok_or(VaultKeyError::NoPrivateKey)?;
                    entry.unwrap_with_private_key(&private_key)?
                }
                EncryptedOrganizationKey::Provider { provider_id, .. } => {
                    match self.provider_key(user, provider_id).await? {
                        Some(provider_key) => Some(entry.unwrap_with_provider_key(&provider_key)?),
                        None => {
                            tracing::warn!(
                                user = %user,
                                org = %org_id,
                                provider = %provider_id,
                                "no provider key for provider organization"
                            );
                            None
                        }
                    }
                }
            };
            if let Some(key) = key {
                decrypted.insert(org_id.clone(), key);
            }
        }

        if decrypted.is_empty() {
            return Ok(None);
        }
        tracing::debug!(user = %user, count = decrypted.len(), "decrypted organization keys");
        Ok(Some(decrypted))
    }

    /// Key for one organization. Unknown ids are `None`, not an error.
    pub async fn org_key(
        &self,
        user: &UserId,
        org_id: &OrganizationId,
    ) -> VaultKeyResult<Option<OrgKey>> {
        Ok(self
            .org_keys(user)
            .await?
            .and_then(|keys| keys.get(org_id).cloned()))
    }

    pub async fn clear_org_keys(&self, user: &UserId, memory_only: bool) -> VaultKeyResult<()> {
        if let Some(cache) = self.arena.get(user).await {
            cache.org_keys.clear().await;
        }
        if !memory_only {
            self.storage
                .remove(&StorageLocation::disk(user), keys::ENCRYPTED_ORG_KEYS)
                .await?;
        }
        Ok(())
    }

    // ── Provider keys ───────────────────────────────────────────────────

    pub async fn set_provider_keys(
        &self,
        user: &UserId,
        providers: &[ProfileProvider],
    ) -> VaultKeyResult<()> {
        let encrypted: HashMap<ProviderId, EncString> = providers
            .iter()
            .map(|p| (p.id.clone(), p.key.clone()))
            .collect();

        let cache = self.arena.open(user).await;
        let location = StorageLocation::disk(user);
        cache
            .provider_keys
            .replace_source(|| {
                self.storage
                    .set_json(&location, keys::ENCRYPTED_PROVIDER_KEYS, &encrypted)
            })
            .await
    }

    pub async fn provider_keys(
        &self,
        user: &UserId,
    ) -> VaultKeyResult<Option<Arc<HashMap<ProviderId, ProviderKey>>>> {
        let cache = self.arena.open(user).await;
        cache
            .provider_keys
            .get_or_try_init(|| async {
                let Some(encrypted) = self
                    .storage
                    .get_json::<HashMap<ProviderId, EncString>>(
                        &StorageLocation::disk(user),
                        keys::ENCRYPTED_PROVIDER_KEYS,
                    )
                    .await?
                else {
                    return Ok(None);
                };
                if encrypted.is_empty() {
                    return Ok(None);
                }

                let private_key = self.private_key(user).await?.ok_or(VaultKeyError::NoPrivateKey)?;
                let mut decrypted = HashMap::with_capacity(encrypted.len());
                for (provider_id, wrapped) in &encrypted {
                    let raw = rsa_decrypt(wrapped, &private_key)?;
                    decrypted.insert(
                        provider_id.clone(),
                        ProviderKey::new(SymmetricCryptoKey::from_bytes(&raw)?),
                    );
                }
                Ok(Some(decrypted))
            })
            .await
    }

    pub async fn provider_key(
        &self,
        user: &UserId,
        provider_id: &ProviderId,
    ) -> VaultKeyResult<Option<ProviderKey>> {
        Ok(self
            .provider_keys(user)
            .await?
            .and_then(|keys| keys.get(provider_id).cloned()))
    }

    pub async fn clear_provider_keys(&self, user: &UserId, memory_only: bool) -> VaultKeyResult<()> {
        if let Some(cache) = self.arena.get(user).await {
            cache.provider_keys.clear().await;
        }
        if !memory_only {
            self.storage
                .remove(&StorageLocation::disk(user), keys::ENCRYPTED_PROVIDER_KEYS)
                .await?;
        }
        Ok(())
    }

    // ── PIN ─────────────────────────────────────────────────────────────

    /// Derive a PIN key the same way as a master key, then stretch it.
    pub async fn make_pin_key(
        pin: &SecretString,
        salt: &str,
        kdf: &KdfConfig,
    ) -> VaultKeyResult<PinKey> {
        let derived = derive_offloaded(pin, salt.to_string(), *kdf).await?;
        Ok(PinKey::new(stretch_key(&derived)?))
    }

    /// Turn on PIN unlock: keep the PIN encrypted under the user key, so the
    /// PIN-wrapped copy can follow later user key changes, and wrap the
    /// in-memory user key under the PIN key.
    pub async fn set_pin(
        &self,
        user: &UserId,
        pin: &SecretString,
        email: &str,
        kdf: &KdfConfig,
        persist: bool,
    ) -> VaultKeyResult<()> {
        let user_key = self.user_key(user).await.ok_or(VaultKeyError::NoUserKey)?;
        let salt = email.trim().to_lowercase();
        let pin_key = Self::make_pin_key(pin, &salt, kdf).await?;
        self.store_protected_pin(user, pin, &salt, kdf, &user_key).await?;
        self.wrap_user_key_with_pin(user, &user_key, &pin_key, persist)
            .await
    }

    pub async fn protected_pin(&self, user: &UserId) -> VaultKeyResult<Option<ProtectedPin>> {
        self.storage
            .get_json(&StorageLocation::disk(user), keys::PROTECTED_PIN)
            .await
    }

    async fn store_protected_pin(
        &self,
        user: &UserId,
        pin: &SecretString,
        salt: &str,
        kdf: &KdfConfig,
        user_key: &UserKey,
    ) -> VaultKeyResult<()> {
        let protected = ProtectedPin {
            pin: encrypt_str(pin.expose_secret(), user_key.key())?,
            salt: salt.to_string(),
            kdf: *kdf,
        };
        self.storage
            .set_json(&StorageLocation::disk(user), keys::PROTECTED_PIN, &protected)
            .await
    }

    /// Wrap the in-memory user key under a PIN key. With `persist` the
    /// wrapped key survives restarts; otherwise it lasts for this session.
    pub async fn set_pin_protected_user_key(
        &self,
        user: &UserId,
        pin_key: &PinKey,
        persist: bool,
    ) -> VaultKeyResult<()> {
        let user_key = self.user_key(user).await.ok_or(VaultKeyError::NoUserKey)?;
        self.wrap_user_key_with_pin(user, &user_key, pin_key, persist)
            .await
    }

    async fn wrap_user_key_with_pin(
        &self,
        user: &UserId,
        user_key: &UserKey,
        pin_key: &PinKey,
        persist: bool,
    ) -> VaultKeyResult<()> {
        let wrapped = encrypt(user_key.key().as_bytes(), pin_key.key())?;
        if persist {
            self.storage
                .set(
                    &StorageLocation::disk(user),
                    keys::PIN_KEY_ENCRYPTED_USER_KEY,
                    &wrapped.to_string(),
                )
                .await
        } else {
            let cache = self.arena.open(user).await;
            *cache.ephemeral_pin_key.write().await = Some(wrapped);
            Ok(())
        }
    }

    /// PIN-wrapped user key: the session copy first, then the persisted one.
    pub async fn pin_protected_user_key(&self, user: &UserId) -> VaultKeyResult<Option<EncString>> {
        if let Some(cache) = self.arena.get(user).await {
            if let Some(wrapped) = cache.ephemeral_pin_key.read().await.clone() {
                return Ok(Some(wrapped));
            }
        }
        self.storage
            .get_parsed(&StorageLocation::disk(user), keys::PIN_KEY_ENCRYPTED_USER_KEY)
            .await
    }

    pub async fn decrypt_user_key_with_pin(
        &self,
        user: &UserId,
        pin: &SecretString,
        salt: &str,
        kdf: &KdfConfig,
        wrapped: Option<&EncString>,
    ) -> VaultKeyResult<UserKey> {
        let wrapped = match wrapped {
            Some(w) => w.clone(),
            None => self
                .pin_protected_user_key(user)
                .await?
                .ok_or(VaultKeyError::NoPinProtectedKey)?,
        };
        let pin_key = Self::make_pin_key(pin, salt, kdf).await?;
        Self::unwrap_user_key(pin_key.key(), &wrapped)
    }

    /// Open a master key that an older client wrapped under the PIN key.
    pub async fn decrypt_master_key_with_pin(
        &self,
        user: &UserId,
        pin: &SecretString,
        salt: &str,
        kdf: &KdfConfig,
        wrapped: Option<&EncString>,
    ) -> VaultKeyResult<MasterKey> {
        let wrapped = match wrapped {
            Some(w) => w.clone(),
            None => self
                .pin_protected_master_key(user)
                .await?
                .ok_or(VaultKeyError::NoPinProtectedKey)?,
        };
        let pin_key = Self::make_pin_key(pin, salt, kdf).await?;
        unwrap_master_key(&pin_key, &wrapped)
    }

    async fn pin_protected_master_key(&self, user: &UserId) -> VaultKeyResult<Option<EncString>> {
        self.storage
            .get_parsed(&StorageLocation::disk(user), keys::PIN_PROTECTED_MASTER_KEY)
            .await
    }

    /// Unlock through a legacy PIN-wrapped master key, then wrap the user key
    /// under the PIN key and drop the legacy copy.
    async fn migrate_old_pin_key(
        &self,
        user: &UserId,
        pin: &SecretString,
        salt: &str,
        kdf: &KdfConfig,
        old: &EncString,
    ) -> VaultKeyResult<UserKey> {
        let pin_key = Self::make_pin_key(pin, salt, kdf).await?;
        let master = unwrap_master_key(&pin_key, old)?;
        let user_key = self
            .decrypt_user_key_with_master_key(user, Some(&master), None)
            .await?;

        self.wrap_user_key_with_pin(user, &user_key, &pin_key, true)
            .await?;
        self.store_protected_pin(user, pin, salt, kdf, &user_key)
            .await?;
        self.clear_old_pin_keys(user).await?;
        tracing::info!(user = %user, "migrated legacy PIN key");
        Ok(user_key)
    }

    /// Turn PIN unlock off: every PIN-wrapped key, the protected PIN and any
    /// legacy PIN-wrapped master key.
    pub async fn clear_pin_protected_key(&self, user: &UserId) -> VaultKeyResult<()> {
        if let Some(cache) = self.arena.get(user).await {
            *cache.ephemeral_pin_key.write().await = None;
        }
        let disk = StorageLocation::disk(user);
        self.storage
            .remove(&disk, keys::PIN_KEY_ENCRYPTED_USER_KEY)
            .await?;
        self.storage.remove(&disk, keys::PROTECTED_PIN).await?;
        self.clear_old_pin_keys(user).await
    }

    pub async fn clear_old_pin_keys(&self, user: &UserId) -> VaultKeyResult<()> {
        self.storage
            .remove(&StorageLocation::disk(user), keys::PIN_PROTECTED_MASTER_KEY)
            .await
    }

    // ── Binary payloads ─────────────────────────────────────────────────

    pub async fn encrypt_to_bytes(
        &self,
        user: &UserId,
        plaintext: &[u8],
    ) -> VaultKeyResult<EncArrayBuffer> {
        let key = self.encryption_key(user).await?;
        encrypt_to_buffer(plaintext, &key)
    }

    pub async fn decrypt_from_bytes(
        &self,
        user: &UserId,
        buffer: &EncArrayBuffer,
    ) -> VaultKeyResult<Zeroizing<Vec<u8>>> {
        let key = self.encryption_key(user).await?;
        decrypt_from_buffer(buffer, &key)
    }

    // ── Unlock state machine ────────────────────────────────────────────

    pub async fn unlock_state(&self, user: &UserId) -> UnlockState {
        match self.arena.get(user).await {
            Some(cache) => cache.state().await,
            None => UnlockState::Locked,
        }
    }

    /// Unlock with the master password.
    ///
    /// When a key hash is stored the password must match it. Accounts
    /// without a wrapped user key unlock with the master key alone, which
    /// requires a stored key hash to check against.
    pub async fn unlock_with_master_password(
        &self,
        user: &UserId,
        password: &SecretString,
        email: &str,
        kdf: &KdfConfig,
    ) -> VaultKeyResult<()> {
        self.run_unlock(user, async {
            let master = Self::derive_master_key(password, email, kdf).await?;

            let stored_hash = self.key_hash(user).await?;
            let matched = match &stored_hash {
                Some(stored) => Some(
                    match_key_hash(stored, password, &master).ok_or(VaultKeyError::InvalidMasterKey)?,
                ),
                None => None,
            };

            let user_key = match self.encrypted_user_key(user).await? {
                Some(wrapped) => Some(Self::unwrap_user_key(master.key(), &wrapped)?),
                None if stored_hash.is_some() => None,
                None => return Err(VaultKeyError::NoEncryptedUserKey),
            };

            // Nothing is written until the password has opened the account.
            self.store_local_key_hash(user, password, &master, matched)
                .await?;
            self.set_master_key(user, master).await;
            Ok(user_key)
        })
        .await
    }

    pub async fn unlock_with_pin(
        &self,
        user: &UserId,
        pin: &SecretString,
        email: &str,
        kdf: &KdfConfig,
    ) -> VaultKeyResult<()> {
        self.run_unlock(user, async {
            let salt = email.trim().to_lowercase();
            if let Some(old) = self.pin_protected_master_key(user).await? {
                return self
                    .migrate_old_pin_key(user, pin, &salt, kdf, &old)
                    .await
                    .map(Some);
            }
            self.decrypt_user_key_with_pin(user, pin, &salt, kdf, None)
                .await
                .map(Some)
        })
        .await
    }

    /// Unlock with a user key obtained elsewhere (biometric, device trust,
    /// auto-unlock). The key is checked against the stored private key when
    /// one exists.
    pub async fn unlock_with_user_key(&self, user: &UserId, key: UserKey) -> VaultKeyResult<()> {
        self.run_unlock(user, async {
            if self.encrypted_private_key(user).await?.is_some()
                && !self.validate_user_key(user, &key).await?
            {
                return Err(VaultKeyError::InvalidKeyMaterial(
                    "user key does not open the account private key".into(),
                ));
            }
            Ok(Some(key))
        })
        .await
    }

    /// Drive `Locked → Unlocking → Unlocked`. Any error wipes the cache and
    /// returns the account to `Locked`.
    async fn run_unlock<F>(&self, user: &UserId, attempt: F) -> VaultKeyResult<()>
    where
        F: Future<Output = VaultKeyResult<Option<UserKey>>>,
    {
        let cache = self.arena.open(user).await;
        cache.set_state(UnlockState::Unlocking).await;

        match attempt.await {
            Ok(user_key) => {
                if let Some(user_key) = user_key {
                    *cache.user_key.write().await = Some(user_key);
                }
                cache.set_state(UnlockState::Unlocked).await;
                tracing::info!(user = %user, "vault unlocked");
                Ok(())
            }
            Err(e) => {
                cache.wipe().await;
                cache.set_state(UnlockState::Locked).await;
                tracing::warn!(user = %user, error = %e, "unlock failed");
                Err(e)
            }
        }
    }

    /// Wipe every decrypted key for `user` and mark the account locked.
    /// Stored copies are untouched.
    pub async fn lock(&self, user: &UserId) {
        self.clear_all(user).await;
        tracing::info!(user = %user, "vault locked");
    }

    pub async fn clear_all(&self, user: &UserId) {
        self.arena.clear(user).await;
    }

    /// Logout: clear memory and every persisted key for the account.
    pub async fn clear_keys(&self, user: &UserId) -> VaultKeyResult<()> {
        self.clear_user_key(user, true).await?;
        self.clear_key_hash(user).await?;
        self.clear_org_keys(user, false).await?;
        self.clear_provider_keys(user, false).await?;
        self.clear_key_pair(user, false).await?;
        self.clear_pin_protected_key(user).await?;
        self.storage
            .remove(&StorageLocation::secure(user), keys::MASTER_KEY_AUTO)
            .await?;
        self.storage
            .remove(&StorageLocation::disk(user), keys::ENCRYPTED_USER_KEY)
            .await?;
        self.clear_all(user).await;
        Ok(())
    }

    async fn resolve_master_key(
        &self,
        user: &UserId,
        given: Option<&MasterKey>,
    ) -> VaultKeyResult<MasterKey> {
        match given {
            Some(key) => Ok(key.clone()),
            None => self.master_key(user).await.ok_or(VaultKeyError::NoMasterKey),
        }
    }
}

/// Wrap `key` under `wrapping_key`. A 32-byte wrapping key is stretched
/// first so the result is always an authenticated envelope.
pub fn protect_key(
    wrapping_key: &SymmetricCryptoKey,
    key: &SymmetricCryptoKey,
) -> VaultKeyResult<EncString> {
    if wrapping_key.is_stretched() {
        encrypt(key.as_bytes(), wrapping_key)
    } else {
        encrypt(key.as_bytes(), &stretch_key(wrapping_key)?)
    }
}

fn unwrap_master_key(pin_key: &PinKey, wrapped: &EncString) -> VaultKeyResult<MasterKey> {
    let raw = decrypt_to_bytes(wrapped, pin_key.key()).map_err(wrong_password)?;
    SymmetricCryptoKey::from_bytes(&raw)
        .map(MasterKey::new)
        .map_err(|_| VaultKeyError::InvalidMasterKey)
}

/// Purpose whose hash of `password` equals `stored`, local form first.
fn match_key_hash(
    stored: &str,
    password: &SecretString,
    master_key: &MasterKey,
) -> Option<HashPurpose> {
    [HashPurpose::LocalAuthorization, HashPurpose::ServerAuthorization]
        .into_iter()
        .find(|purpose| hashes_equal(&hash_password(password, master_key, *purpose), stored))
}

fn wrong_password(e: VaultKeyError) -> VaultKeyError {
    match e {
        VaultKeyError::DecryptionFailed(DecryptFailure::MacMismatch | DecryptFailure::Padding) => {
            VaultKeyError::InvalidMasterKey
        }
        other => other,
    }
}

/// Run the KDF on the blocking pool.
async fn derive_offloaded(
    secret: &SecretString,
    salt: String,
    kdf: KdfConfig,
) -> VaultKeyResult<SymmetricCryptoKey> {
    let secret = SecretString::from(secret.expose_secret());
    tokio::task::spawn_blocking(move || derive_key(&secret, &salt, &kdf))
        .await
        .map_err(|e| VaultKeyError::Crypto(format!("KDF task: {e}")))?
}
