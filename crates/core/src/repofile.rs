pub(crate) mod configfile;
pub(crate) mod filesetfile;
pub(crate) mod indexfile;
pub(crate) mod metafile;
pub(crate) mod volumefile;

// Part of public API
pub use {
    configfile::{ConfigFile, RepositoryId},
    filesetfile::{
        FileEntry, FileMetadata, Fileset, FilesetSummary, FilesetVersion, SkippedFile,
    },
    indexfile::{IndexBlock, IndexVolume},
    metafile::{is_meta, MetaHeader, MetaKind, RepoFile},
    volumefile::{ManifestEntry, VolumeFile, VolumeHeader},
};
