use aes256ctr_poly1305aes::{
    aead::{self, Aead, AeadInPlace},
    Aes256CtrPoly1305Aes,
};
use rand::{thread_rng, RngCore};

use crate::{
    crypto::{CryptoKey, CryptoResult, EncryptionKind},
    error::CryptoErrorKind,
};

pub(crate) type Nonce = aead::Nonce<Aes256CtrPoly1305Aes>;
pub(crate) type AeadKey = aes256ctr_poly1305aes::Key;

const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 16;

/// The `Key` is used to encrypt/MAC and check/decrypt data.
///
/// It is a 64 byte key: 32 bytes for AES-256 and 32 bytes for Poly1305-AES.
/// Every call to [`CryptoKey::encrypt_data`] draws a fresh random nonce which
/// is stored in front of the ciphertext; the 16 byte tag is appended.
#[derive(Clone, Default, Debug, Copy)]
pub struct Key(AeadKey);

impl Key {
    /// Create a new random [`Key`] using a suitable entropy source.
    #[must_use]
    pub fn new() -> Self {
        let mut key = AeadKey::default();
        thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    /// Create a [`Key`] from its 64 raw bytes.
    ///
    /// # Errors
    ///
    /// * [`CryptoErrorKind::CryptoKeyTooShort`] - If `key` is not exactly 64 bytes long
    pub fn from_slice(key: &[u8]) -> CryptoResult<Self> {
        if key.len() != AeadKey::default().len() {
            return Err(CryptoErrorKind::CryptoKeyTooShort);
        }
        Ok(Self(*AeadKey::from_slice(key)))
    }

    /// The raw bytes of this key, e.g. to store it in a key file.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl CryptoKey for Key {
    const KIND: EncryptionKind = EncryptionKind::Aes256CtrPoly1305Aes;

    fn decrypt_data(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoErrorKind::DataDecryptionFailed(aead::Error));
        }

        let nonce = Nonce::from_slice(&data[0..NONCE_LEN]);
        Aes256CtrPoly1305Aes::new(&self.0)
            .decrypt(nonce, &data[NONCE_LEN..])
            .map_err(CryptoErrorKind::DataDecryptionFailed)
    }

    fn encrypt_data(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        let mut nonce = Nonce::default();
        thread_rng().fill_bytes(&mut nonce);

        let mut res = Vec::with_capacity(data.len() + NONCE_LEN + TAG_LEN);
        res.extend_from_slice(&nonce);
        res.extend_from_slice(data);
        let tag = Aes256CtrPoly1305Aes::new(&self.0)
            .encrypt_in_place_detached(&nonce, &[], &mut res[NONCE_LEN..])
            .map_err(CryptoErrorKind::DataEncryptionFailed)?;
        res.extend_from_slice(&tag);
        Ok(res)
    }
}
