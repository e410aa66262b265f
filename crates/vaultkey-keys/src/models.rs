//! Sync-profile inputs and the persisted shape of encrypted org/provider keys

use serde::{Deserialize, Serialize};

use vaultkey_core::{OrganizationId, ProviderId, VaultKeyResult};
use vaultkey_crypto::{
    decrypt_to_bytes, rsa_decrypt, EncString, KdfConfig, OrgKey, ProviderKey, SymmetricCryptoKey,
};

/// Organization membership from the sync profile: org key RSA-wrapped to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileOrganization {
    pub id: OrganizationId,
    pub key: EncString,
}

/// Organization reached through a provider: org key wrapped under the provider key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileProviderOrganization {
    pub id: OrganizationId,
    pub provider_id: ProviderId,
    pub key: EncString,
}

/// Provider membership: provider key RSA-wrapped to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileProvider {
    pub id: ProviderId,
    pub key: EncString,
}

/// One entry of the persisted encrypted org-key map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EncryptedOrganizationKey {
    /// RSA-wrapped to the account public key
    Organization { key: EncString },
    /// Wrapped under the key of `provider_id`
    #[serde(rename_all = "camelCase")]
    Provider {
        provider_id: ProviderId,
        key: EncString,
    },
}

impl EncryptedOrganizationKey {
    pub fn unwrap_with_private_key(&self, private_key: &[u8]) -> VaultKeyResult<Option<OrgKey>> {
        match self {
            Self::Organization { key } => {
                let raw = rsa_decrypt(key, private_key)?;
                Ok(Some(OrgKey::new(SymmetricCryptoKey::from_bytes(&raw)?)))
            }
            Self::Provider { .. } => Ok(None),
        }
    }

    pub fn unwrap_with_provider_key(&self, provider_key: &ProviderKey) -> VaultKeyResult<OrgKey> {
        let key = match self {
            Self::Organization { key } | Self::Provider { key, .. } => key,
        };
        let raw = decrypt_to_bytes(key, provider_key.key())?;
        Ok(OrgKey::new(SymmetricCryptoKey::from_bytes(&raw)?))
    }
}

/// The account PIN encrypted under the user key, with the salt and KDF
/// settings needed to rebuild the PIN key when the user key changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectedPin {
    pub pin: EncString,
    pub salt: String,
    pub kdf: KdfConfig,
}

impl From<&ProfileOrganization> for EncryptedOrganizationKey {
    fn from(org: &ProfileOrganization) -> Self {
        Self::Organization {
            key: org.key.clone(),
        }
    }
}

impl From<&ProfileProviderOrganization> for EncryptedOrganizationKey {
    fn from(org: &ProfileProviderOrganization) -> Self {
        Self::Provider {
            provider_id: org.provider_id.clone(),
            key: org.key.clone(),
        }
    }
}
