//! Error types and Result module.

use std::{
    num::TryFromIntError,
    ops::RangeInclusive,
    path::{PathBuf, StripPrefixError},
};

use aes256ctr_poly1305aes::aead;
use displaydoc::Display;
use thiserror::Error;

use crate::{
    block::{BlockId, RunId, VolumeId},
    repofile::{filesetfile::FilesetVersion, metafile::MetaKind},
};

/// Result type that is being returned from methods that can fail and thus have [`VaultError`]s.
pub type VaultResult<T> = Result<T, VaultError>;

// [`VaultError`] is public, but opaque and easy to keep compatible.
#[derive(Error, Debug)]
#[error(transparent)]
/// Errors that can result from blockvault.
pub struct VaultError(#[from] VaultErrorKind);

/// Coarse classification of a [`VaultError`].
///
/// This is what callers usually match on to decide whether to retry, report a
/// single file as failed or abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ErrorCategory {
    /// A local file could not be read or written
    Io,
    /// The remote transport failed
    Transport,
    /// Stored data does not match what the index says it should be
    Corruption,
    /// An ordering violation between the indexes, e.g. a fileset commit with unsealed blocks
    IndexInconsistency,
    /// The caller cancelled the operation or its deadline passed
    Cancelled,
    /// Anything else, mostly invalid arguments or configuration
    Other,
}

// Accessors for anything we do want to expose publicly.
impl VaultError {
    /// Expose the inner error kind.
    ///
    /// This is useful for matching on the error kind.
    pub fn into_inner(self) -> VaultErrorKind {
        self.0
    }

    /// Borrow the inner error kind.
    pub fn kind(&self) -> &VaultErrorKind {
        &self.0
    }

    /// Classify this error, see [`ErrorCategory`].
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.0.category()
    }

    /// Checks if the error signals corrupted or missing stored data
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        self.category() == ErrorCategory::Corruption
    }

    /// Checks if the error signals an index ordering violation
    #[must_use]
    pub fn is_index_inconsistency(&self) -> bool {
        self.category() == ErrorCategory::IndexInconsistency
    }

    /// Checks if the operation was cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.category() == ErrorCategory::Cancelled
    }

    /// Get the corresponding transport error, if the error is caused by the transport.
    ///
    /// Returns `anyhow::Error`; you need to cast this to the real transport error type
    pub fn transport_error(&self) -> Option<&anyhow::Error> {
        if let VaultErrorKind::Transport(error) = &self.0 {
            Some(error)
        } else {
            None
        }
    }
}

/// [`VaultErrorKind`] describes the errors that can happen in blockvault.
///
/// This is a non-exhaustive enum, so additional variants may be added in future. It is
/// recommended to match against the wildcard `_` instead of listing all possible variants,
/// to avoid problems when new variants are added.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum VaultErrorKind {
    /// [`CommandErrorKind`] describes the errors that can happen while executing a high-level command
    #[error(transparent)]
    Command(#[from] CommandErrorKind),

    /// [`CryptoErrorKind`] describes the errors that can happen while dealing with Cryptographic functions
    #[error(transparent)]
    Crypto(#[from] CryptoErrorKind),

    /// [`CodecErrorKind`] describes the errors that can happen while encoding or decoding blocks
    #[error(transparent)]
    Codec(#[from] CodecErrorKind),

    /// [`IdErrorKind`] describes the errors that can be returned by processing IDs
    #[error(transparent)]
    Id(#[from] IdErrorKind),

    /// [`ConfigErrorKind`] describes the errors that can be returned for the repository configuration
    #[error(transparent)]
    Config(#[from] ConfigErrorKind),

    /// [`VolumeErrorKind`] describes the errors that can be returned while reading or writing volumes
    #[error(transparent)]
    Volume(#[from] VolumeErrorKind),

    /// [`IndexErrorKind`] describes the errors that can be returned by the dedup index and volume catalog
    #[error(transparent)]
    Index(#[from] IndexErrorKind),

    /// [`FilesetErrorKind`] describes the errors that can be returned by the fileset index
    #[error(transparent)]
    Fileset(#[from] FilesetErrorKind),

    /// [`PackerErrorKind`] describes the errors that can be returned for a Packer
    #[error(transparent)]
    Packer(#[from] PackerErrorKind),

    /// [`RestoreErrorKind`] describes the errors that can happen while restoring files
    #[error(transparent)]
    Restore(#[from] RestoreErrorKind),

    /// [`StoreErrorKind`] describes the errors that can happen while persisting the index
    #[error(transparent)]
    Store(#[from] StoreErrorKind),

    /// [`MetaErrorKind`] describes the errors that can happen with metadata objects of the transport
    #[error(transparent)]
    Meta(#[from] MetaErrorKind),

    /// [`MultiprocessingErrorKind`] describes the errors that can be returned by dealing with channels
    #[error(transparent)]
    Channel(#[from] MultiprocessingErrorKind),

    /// This error is returned when the transport fails to perform an action
    #[error(transparent)]
    Transport(#[from] anyhow::Error),

    /// [`std::io::Error`]
    #[error(transparent)]
    StdIo(#[from] std::io::Error),
}

impl VaultErrorKind {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::StdIo(_) => ErrorCategory::Io,
            Self::Transport(_) => ErrorCategory::Transport,
            Self::Crypto(CryptoErrorKind::DataDecryptionFailed(_)) => ErrorCategory::Corruption,
            Self::Codec(_) => ErrorCategory::Corruption,
            Self::Volume(kind) => kind.category(),
            Self::Index(kind) => kind.category(),
            Self::Fileset(FilesetErrorKind::UnresolvedBlock { .. }) => {
                ErrorCategory::IndexInconsistency
            }
            Self::Restore(kind) => kind.category(),
            Self::Packer(PackerErrorKind::UploadFailed { .. }) => ErrorCategory::Transport,
            Self::Meta(kind) => kind.category(),
            Self::Command(CommandErrorKind::Cancelled) => ErrorCategory::Cancelled,
            _ => ErrorCategory::Other,
        }
    }
}

/// [`CommandErrorKind`] describes the errors that can happen while executing a high-level command
#[derive(Error, Debug, Display)]
pub enum CommandErrorKind {
    /// operation was cancelled
    Cancelled,
    /// another backup, prune or compaction is running on this repository
    WriterBusy,
    /// no source paths given
    NoSources,
    /// {0:?}
    FromRayonError(#[from] rayon::ThreadPoolBuildError),
    /// conversion from integer failed: `{0:?}`
    ConversionFromIntFailed(#[from] TryFromIntError),
    /// path `{0:?}` is not below its source root: `{1:?}`
    StripPrefixFailed(PathBuf, StripPrefixError),
    /// volume {0} is referenced by the index but unknown to the catalog
    VolumeNotInCatalog(VolumeId),
}

/// [`CryptoErrorKind`] describes the errors that can happen while dealing with Cryptographic functions
#[derive(Error, Debug, Display, Copy, Clone)]
pub enum CryptoErrorKind {
    /// data decryption failed: `{0:?}`
    DataDecryptionFailed(aead::Error),
    /// data encryption failed: `{0:?}`
    DataEncryptionFailed(aead::Error),
    /// crypto key too short
    CryptoKeyTooShort,
}

/// [`CodecErrorKind`] describes the errors that can happen while encoding or decoding blocks
#[derive(Error, Debug, Display)]
pub enum CodecErrorKind {
    /// compressing data failed: `{0:?}`
    CompressingDataFailed(std::io::Error),
    /// decoding Zstd compressed data failed: `{0:?}`
    DecodingZstdCompressedDataFailed(std::io::Error),
    /// length of decoded data does not match! expected {expected}, got {actual}
    LengthOfDecodedDataDoesNotMatch { expected: u32, actual: usize },
}

/// [`IdErrorKind`] describes the errors that can be returned by processing IDs
#[derive(Error, Debug, Display)]
pub enum IdErrorKind {
    /// Hex error: `{0:?}`
    #[error(transparent)]
    HexError(#[from] hex::FromHexError),
    /// Failed to parse Id from String `{0}`
    ParsingIdFromStringFailed(String),
    /// Empty hex string
    EmptyHexString,
    /// Non-ASCII hex string
    NonAsciiHexString,
}

/// [`ConfigErrorKind`] describes the errors that can be returned for the repository configuration
#[derive(Error, Debug, Display)]
pub enum ConfigErrorKind {
    /// block size {0} is not supported. Allowed values: {1:?}
    BlockSizeNotSupported(u64, RangeInclusive<u64>),
    /// volume size {0} is not supported. Allowed values: {1:?}
    VolumeSizeNotSupported(u64, RangeInclusive<u64>),
    /// compression level {0} is not supported. Allowed values: {1:?}
    CompressionLevelNotSupported(i32, RangeInclusive<i32>),
    /// repository format version {0} is not supported
    VersionNotSupported(u16),
    /// repository uses encryption `{expected}`, but the given key is `{given}`
    EncryptionMismatch { expected: String, given: String },
    /// No repository found. Is the index store initialized?
    NoRepositoryFound,
    /// The index store already contains a repository. Aborting.
    RepositoryExists,
}

/// [`VolumeErrorKind`] describes the errors that can be returned while reading or writing volumes
#[derive(Error, Debug, Display)]
pub enum VolumeErrorKind {
    /// Failed reading binary representation of the volume: `{0:?}`
    ReadingBinaryRepresentationFailed(binrw::Error),
    /// Failed writing binary representation of the volume: `{0:?}`
    WritingBinaryRepresentationFailed(binrw::Error),
    /// data is not a volume: magic bytes do not match
    WrongMagic,
    /// volume format version {0} is not supported
    VersionNotSupported(u16),
    /// unknown compression id {0}
    UnknownCompression(u8),
    /// unknown encryption id {0}
    UnknownEncryption(u8),
    /// volume is too short: {0} bytes
    TooShort(usize),
    /// volume checksum does not match its contents
    ChecksumMismatch,
    /// block {id} at offset {offset} with length {length} exceeds the payload of {payload_len} bytes
    BlockOutOfBounds {
        id: BlockId,
        offset: u32,
        length: u32,
        payload_len: usize,
    },
    /// block {0} is not contained in this volume
    BlockNotInVolume(BlockId),
    /// Conversion from `{from}` to `{to}` failed: `{source}`
    Conversion {
        to: &'static str,
        from: &'static str,
        source: TryFromIntError,
    },
}

impl VolumeErrorKind {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::WritingBinaryRepresentationFailed(_) | Self::Conversion { .. } => {
                ErrorCategory::Other
            }
            _ => ErrorCategory::Corruption,
        }
    }
}

/// [`IndexErrorKind`] describes the errors that can be returned by the dedup index and volume catalog
#[derive(Error, Debug, Display)]
pub enum IndexErrorKind {
    /// reference count of block {0} would drop below zero, the index is corrupted
    ReferenceCountUnderflow(BlockId),
    /// block {0} is not in the index
    UnknownBlock(BlockId),
    /// block {0} is committed without being reserved
    NotReserved(BlockId),
    /// block {0} is already committed
    AlreadyCommitted(BlockId),
    /// block {id} is reserved by another run {run}
    ReservedByOtherRun { id: BlockId, run: RunId },
    /// volume {0} is not in the catalog
    UnknownVolume(VolumeId),
}

impl IndexErrorKind {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::ReferenceCountUnderflow(_) | Self::UnknownBlock(_) => ErrorCategory::Corruption,
            Self::NotReserved(_) | Self::AlreadyCommitted(_) => ErrorCategory::IndexInconsistency,
            Self::ReservedByOtherRun { .. } | Self::UnknownVolume(_) => ErrorCategory::Other,
        }
    }
}

/// [`FilesetErrorKind`] describes the errors that can be returned by the fileset index
#[derive(Error, Debug, Display)]
pub enum FilesetErrorKind {
    /// run {0} is already active on this repository
    RunAlreadyActive(RunId),
    /// run {0} is not the active run
    RunNotActive(RunId),
    /// file {path:?} references block {id} which is not committed
    UnresolvedBlock { path: PathBuf, id: BlockId },
    /// fileset version {0} does not exist
    VersionNotFound(FilesetVersion),
}

/// [`PackerErrorKind`] describes the errors that can be returned for a Packer
#[derive(Error, Debug, Display)]
pub enum PackerErrorKind {
    /// Conversion from `{from}` to `{to}` failed: `{source}`
    Conversion {
        to: &'static str,
        from: &'static str,
        source: TryFromIntError,
    },
    /// block of {0} bytes does not fit into a volume
    SizeLimitExceeded(usize),
    /// failed to upload volume {volume}: `{error:?}`
    UploadFailed {
        volume: VolumeId,
        error: anyhow::Error,
    },
    /// block {0} does not decode to its raw content after encoding
    ExtraVerificationFailed(BlockId),
}

/// [`RestoreErrorKind`] describes the errors that can happen while restoring files
#[derive(Error, Debug, Display)]
pub enum RestoreErrorKind {
    /// block {id} read from volume {volume} does not match its fingerprint (got {actual})
    FingerprintMismatch {
        id: BlockId,
        volume: VolumeId,
        actual: BlockId,
    },
    /// block {0} is not in the dedup index
    BlockNotIndexed(BlockId),
    /// volume {volume} could not be fetched: {reason}
    VolumeUnavailable { volume: VolumeId, reason: String },
    /// volume {volume} is damaged: {reason}
    VolumeDamaged { volume: VolumeId, reason: String },
    /// block {id} could not be decoded: {reason}
    BlockUndecodable { id: BlockId, reason: String },
    /// file {path:?} has length {actual} after restore, expected {expected}
    LengthMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    /// restored content of file {0:?} does not match its recorded digest
    FileDigestMismatch(PathBuf),
    /// writing {path:?} failed: `{source:?}`
    DestinationIo {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl RestoreErrorKind {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::DestinationIo { .. } => ErrorCategory::Io,
            _ => ErrorCategory::Corruption,
        }
    }
}

/// [`StoreErrorKind`] describes the errors that can happen while persisting the index
#[derive(Error, Debug, Display)]
pub enum StoreErrorKind {
    /// serde_json couldn't serialize the index: `{0:?}`
    SerializingFailed(serde_json::Error),
    /// serde_json couldn't deserialize the index: `{0:?}`
    DeserializingFailed(serde_json::Error),
    /// reading the index store at {path:?} failed: `{source:?}`
    ReadingFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    /// writing the index store at {path:?} failed: `{source:?}`
    WritingFailed {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// [`MetaErrorKind`] describes the errors that can happen with metadata objects of the transport
#[derive(Error, Debug, Display)]
pub enum MetaErrorKind {
    /// serde_json couldn't serialize the {0}: `{1:?}`
    SerializingFailed(MetaKind, serde_json::Error),
    /// serde_json couldn't deserialize the {0}: `{1:?}`
    DeserializingFailed(MetaKind, serde_json::Error),
    /// Failed reading the binary representation of the metadata header: `{0:?}`
    ReadingBinaryRepresentationFailed(binrw::Error),
    /// Failed writing the binary representation of the metadata header: `{0:?}`
    WritingBinaryRepresentationFailed(binrw::Error),
    /// unknown metadata kind {0}
    UnknownKind(u8),
    /// expected a {expected}, got metadata kind {actual}
    KindMismatch { expected: MetaKind, actual: u8 },
    /// failed to upload {kind} {id}: `{error:?}`
    UploadFailed {
        kind: MetaKind,
        id: VolumeId,
        error: anyhow::Error,
    },
    /// failed to download object {id}: `{error:?}`
    DownloadFailed { id: VolumeId, error: anyhow::Error },
    /// no repository config found among {0} objects of the transport
    NoConfigFound(usize),
    /// {0} objects hold a repository config, they differ
    ConflictingConfigs(usize),
    /// fileset {version} uses block {id}, but no volume holds it
    BlockNotFound { version: FilesetVersion, id: BlockId },
}

impl MetaErrorKind {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::UploadFailed { .. } | Self::DownloadFailed { .. } => ErrorCategory::Transport,
            Self::SerializingFailed(..) | Self::WritingBinaryRepresentationFailed(_) => {
                ErrorCategory::Other
            }
            _ => ErrorCategory::Corruption,
        }
    }
}

/// [`MultiprocessingErrorKind`] describes the errors that can be returned in relation to a crossbeam or other channel
#[derive(Error, Debug, Display)]
pub enum MultiprocessingErrorKind {
    /// Receiver has been dropped unexpectedly
    ReceiverDropped,
    /// Sender has been dropped unexpectedly
    SenderDropped,
    /// worker thread `{0}` panicked
    WorkerPanicked(&'static str),
}

trait VaultErrorMarker: std::error::Error {}

impl VaultErrorMarker for CommandErrorKind {}
impl VaultErrorMarker for CryptoErrorKind {}
impl VaultErrorMarker for CodecErrorKind {}
impl VaultErrorMarker for IdErrorKind {}
impl VaultErrorMarker for ConfigErrorKind {}
impl VaultErrorMarker for VolumeErrorKind {}
impl VaultErrorMarker for IndexErrorKind {}
impl VaultErrorMarker for FilesetErrorKind {}
impl VaultErrorMarker for PackerErrorKind {}
impl VaultErrorMarker for RestoreErrorKind {}
impl VaultErrorMarker for StoreErrorKind {}
impl VaultErrorMarker for MetaErrorKind {}
impl VaultErrorMarker for MultiprocessingErrorKind {}
impl VaultErrorMarker for std::io::Error {}

impl<E> From<E> for VaultError
where
    E: VaultErrorMarker,
    VaultErrorKind: From<E>,
{
    fn from(value: E) -> Self {
        Self(VaultErrorKind::from(value))
    }
}
