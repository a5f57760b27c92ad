use serde_derive::{Deserialize, Serialize};

use crate::error::CryptoErrorKind;

pub(crate) mod aespoly1305;
pub(crate) mod hasher;

pub(crate) type CryptoResult<T> = Result<T, CryptoErrorKind>;

/// The cipher a repository uses for its blocks.
///
/// The numeric id is what gets written into every volume header.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, derive_more::Display,
)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionKind {
    /// Blocks are stored in plain text
    None,
    /// AES-256 in counter mode, authenticated with Poly1305-AES
    Aes256CtrPoly1305Aes,
}

impl EncryptionKind {
    /// The id used in the volume header
    #[must_use]
    pub const fn id(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Aes256CtrPoly1305Aes => 1,
        }
    }

    /// Reverse of [`EncryptionKind::id`]
    #[must_use]
    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::None),
            1 => Some(Self::Aes256CtrPoly1305Aes),
            _ => None,
        }
    }
}

/// A trait for encrypting and decrypting data.
pub trait CryptoKey: Clone + Copy + Sized + Send + Sync + 'static {
    /// The cipher this key belongs to
    const KIND: EncryptionKind;

    /// Decrypt the given data.
    ///
    /// # Arguments
    ///
    /// * `data` - The data to decrypt.
    ///
    /// # Errors
    ///
    /// * [`CryptoErrorKind::DataDecryptionFailed`] - If the data was not produced by this key or was modified
    ///
    /// # Returns
    ///
    /// A vector containing the decrypted data.
    fn decrypt_data(&self, data: &[u8]) -> CryptoResult<Vec<u8>>;

    /// Encrypt the given data.
    ///
    /// # Arguments
    ///
    /// * `data` - The data to encrypt.
    ///
    /// # Returns
    ///
    /// A vector containing the encrypted data.
    fn encrypt_data(&self, data: &[u8]) -> CryptoResult<Vec<u8>>;
}

/// A key which does not encrypt at all.
///
/// Useful for local repositories where the storage is already trusted.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEncryption;

impl CryptoKey for NoEncryption {
    const KIND: EncryptionKind = EncryptionKind::None;

    fn decrypt_data(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn encrypt_data(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(EncryptionKind::None)]
    #[case(EncryptionKind::Aes256CtrPoly1305Aes)]
    fn test_encryption_kind_id_passes(#[case] kind: EncryptionKind) {
        assert_eq!(EncryptionKind::from_id(kind.id()), Some(kind));
    }

    #[test]
    fn test_unknown_encryption_id_fails() {
        assert_eq!(EncryptionKind::from_id(7), None);
    }
}
