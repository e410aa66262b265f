//! vaultkey-vault: encryption of vault records through the key hierarchy
//!
//! Each service resolves its key from [`vaultkey_keys::KeyService`]:
//!   - folders use the account encryption key
//!   - ciphers use their organization's key, or the account key
//!   - FIDO2 credentials are encrypted with the cipher that holds them

#[macro_use]
mod envelope;

pub mod cipher;
pub mod fido2;
pub mod folder;

pub use cipher::{
    update_password_history, CardView, Cipher, CipherData, CipherService, CipherView,
    CipherViewData, FieldType, FieldView, IdentityView, LoginUriView, LoginView,
    PasswordHistoryView, MAX_PASSWORD_HISTORY,
};
pub use envelope::DECRYPT_ERROR_NAME;
pub use fido2::{Fido2Key, Fido2KeyView};
pub use folder::{Folder, FolderService, FolderView};
