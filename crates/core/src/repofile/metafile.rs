//! Metadata objects stored through the transport next to the volumes.
//!
//! ```text
//! Header  : magic "BVMETA\0\x01" (8 bytes), kind u8, uncompressed_length u32
//! Content : JSON, encoded like a block
//! ```
//!
//! Like volumes, objects are addressed by the SHA-256 of their bytes. The
//! repository config and every committed fileset are stored this way, so that
//! the local state can be recreated from the transport. Blocks need no extra
//! object: the manifest of each volume lists them.

use std::{io::Cursor, num::NonZeroU32};

use binrw::{BinRead, BinWrite};
use bytes::Bytes;
use log::debug;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    block::VolumeId,
    codec::BlockCodec,
    crypto::{hasher::hash, CryptoKey},
    error::MetaErrorKind,
    repofile::{ConfigFile, Fileset},
    transport::Transport,
    VaultResult,
};

pub(crate) mod constants {
    /// The first bytes of every metadata object
    pub(crate) const MAGIC: &[u8; 8] = b"BVMETA\0\x01";
    /// Length of [`super::MetaHeader`] including the magic
    pub(crate) const HEADER_LEN: usize = 8 + 1 + 4;
}

/// The kinds of metadata objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum MetaKind {
    /// The repository [`ConfigFile`]
    #[display(fmt = "repository config")]
    Config,
    /// A committed [`Fileset`]
    #[display(fmt = "fileset")]
    Fileset,
}

impl MetaKind {
    /// The id used in the header
    #[must_use]
    pub const fn id(self) -> u8 {
        match self {
            Self::Config => 0,
            Self::Fileset => 1,
        }
    }

    /// Reverse of [`MetaKind::id`]
    #[must_use]
    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Config),
            1 => Some(Self::Fileset),
            _ => None,
        }
    }
}

/// The fixed-size header of a metadata object.
#[derive(BinWrite, BinRead, Debug, Clone, Copy, PartialEq, Eq)]
#[brw(little, magic = b"BVMETA\0\x01")]
pub struct MetaHeader {
    /// Id of the [`MetaKind`]
    pub kind: u8,
    /// Length of the JSON if it is compressed, otherwise 0
    pub uncompressed_length: u32,
}

/// Marker trait for repository files which are stored as encoded JSON objects
pub trait RepoFile: Serialize + DeserializeOwned + Sized + Send + Sync + 'static {
    /// The [`MetaKind`] written into the header
    const KIND: MetaKind;
}

impl RepoFile for ConfigFile {
    const KIND: MetaKind = MetaKind::Config;
}

impl RepoFile for Fileset {
    const KIND: MetaKind = MetaKind::Fileset;
}

/// Whether `data` starts like a metadata object
#[must_use]
pub fn is_meta(data: &[u8]) -> bool {
    data.starts_with(constants::MAGIC)
}

/// Serializes and encodes a repository file.
///
/// # Errors
///
/// * [`MetaErrorKind::SerializingFailed`] - If the file could not be serialized
/// * If the content could not be compressed or encrypted
///
/// # Returns
///
/// The id of the object and its bytes
pub(crate) fn encode_file<F: RepoFile, C: CryptoKey>(
    codec: &BlockCodec<C>,
    file: &F,
) -> VaultResult<(VolumeId, Bytes)> {
    let json =
        serde_json::to_vec(file).map_err(|err| MetaErrorKind::SerializingFailed(F::KIND, err))?;
    let (encoded, uncompressed_length) = codec.encode(&json)?;
    let header = MetaHeader {
        kind: F::KIND.id(),
        uncompressed_length: uncompressed_length.map_or(0, NonZeroU32::get),
    };

    let mut writer = Cursor::new(Vec::with_capacity(constants::HEADER_LEN + encoded.len()));
    header
        .write(&mut writer)
        .map_err(MetaErrorKind::WritingBinaryRepresentationFailed)?;
    let mut data = writer.into_inner();
    data.extend_from_slice(&encoded);
    Ok((VolumeId::from(hash(&data)), data.into()))
}

/// Reads the header of a metadata object.
///
/// # Errors
///
/// * [`MetaErrorKind::ReadingBinaryRepresentationFailed`] - If `data` is no metadata object
/// * [`MetaErrorKind::UnknownKind`] - If the kind was written by a newer version
pub(crate) fn read_kind(data: &[u8]) -> VaultResult<MetaKind> {
    let header = MetaHeader::read(&mut Cursor::new(data))
        .map_err(MetaErrorKind::ReadingBinaryRepresentationFailed)?;
    Ok(MetaKind::from_id(header.kind).ok_or(MetaErrorKind::UnknownKind(header.kind))?)
}

/// Decodes a repository file.
///
/// # Errors
///
/// * [`MetaErrorKind::KindMismatch`] - If `data` holds another kind of file
/// * [`MetaErrorKind::DeserializingFailed`] - If the content is no valid JSON of this kind
/// * If the content could not be decrypted or decompressed
pub(crate) fn decode_file<F: RepoFile, C: CryptoKey>(
    codec: &BlockCodec<C>,
    data: &[u8],
) -> VaultResult<F> {
    let header = MetaHeader::read(&mut Cursor::new(data))
        .map_err(MetaErrorKind::ReadingBinaryRepresentationFailed)?;
    if header.kind != F::KIND.id() {
        return Err(MetaErrorKind::KindMismatch {
            expected: F::KIND,
            actual: header.kind,
        }
        .into());
    }
    let json = codec.decode(
        &data[constants::HEADER_LEN..],
        NonZeroU32::new(header.uncompressed_length),
    )?;
    Ok(serde_json::from_slice(&json)
        .map_err(|err| MetaErrorKind::DeserializingFailed(F::KIND, err))?)
}

/// Stores a repository file through the transport.
///
/// # Errors
///
/// * [`MetaErrorKind::UploadFailed`] - If the transport failed
/// * If the file could not be encoded
///
/// # Returns
///
/// The id of the new object
pub(crate) fn save_file<F: RepoFile, C: CryptoKey>(
    transport: &dyn Transport,
    codec: &BlockCodec<C>,
    file: &F,
) -> VaultResult<VolumeId> {
    let (id, data) = encode_file(codec, file)?;
    transport
        .upload(&id, data)
        .map_err(|error| MetaErrorKind::UploadFailed {
            kind: F::KIND,
            id,
            error,
        })?;
    debug!("saved {} as {id}", F::KIND);
    Ok(id)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use crate::crypto::{aespoly1305::Key, EncryptionKind, NoEncryption};

    use super::*;

    #[rstest]
    fn test_config_object_layout_passes() {
        let codec = BlockCodec::new(NoEncryption, None);
        let config = ConfigFile::new(EncryptionKind::None);

        let (id, data) = encode_file(&codec, &config).unwrap();

        assert_eq!(id, VolumeId::from(hash(&data)));
        assert!(is_meta(&data));
        assert_eq!(&data[8..9], &[0]);
        assert_eq!(&data[9..13], &0_u32.to_le_bytes());
        assert_eq!(read_kind(&data).unwrap(), MetaKind::Config);
        assert_eq!(decode_file::<ConfigFile, _>(&codec, &data).unwrap(), config);
    }

    #[rstest]
    fn test_encrypted_compressed_fileset_passes() {
        let codec = BlockCodec::new(Key::new(), Some(3));
        let fileset = Fileset {
            version: 4.into(),
            time: chrono::Local::now(),
            paths: vec!["docs".into(); 50],
            files: Vec::new(),
            skipped: Vec::new(),
            summary: crate::repofile::FilesetSummary::default(),
        };

        let (_, data) = encode_file(&codec, &fileset).unwrap();

        assert_eq!(read_kind(&data).unwrap(), MetaKind::Fileset);
        assert_eq!(decode_file::<Fileset, _>(&codec, &data).unwrap(), fileset);
        assert!(decode_file::<Fileset, _>(&BlockCodec::new(Key::new(), Some(3)), &data).is_err());
    }

    #[rstest]
    fn test_wrong_kind_fails() {
        let codec = BlockCodec::new(NoEncryption, None);
        let (_, data) = encode_file(&codec, &ConfigFile::new(EncryptionKind::None)).unwrap();

        let err = decode_file::<Fileset, _>(&codec, &data).unwrap_err();

        assert!(err.is_corruption());
    }

    #[rstest]
    fn test_volume_is_not_meta_passes() {
        assert!(!is_meta(b"BVVOL\0\0\x01rest"));
        assert!(read_kind(b"BVVOL\0\0\x01rest").is_err());
    }
}
