/*!
A library for deduplicated and encrypted block level backups.

# Overview

This section gives a brief overview of the primary types in this crate:

The main type is the [`Repository`] type which owns the indexes of a repository
and allows high-level actions like backing up, restoring, pruning filesets,
compacting volumes and checking the repository.

Files are cut into fixed-size blocks which are identified by the SHA-256 of
their content. Every distinct block is stored exactly once: novel blocks are
compressed, encrypted and packed into volumes, which are handed to a
[`Transport`]. A backup run ends with a new immutable [`repofile::Fileset`]
which lists the blocks of every file.

The config and every fileset are also stored through the transport, so
[`Repository::recreate`] can rebuild the local state from the transport alone.

Besides this, various `*Options` types exist which allow to specify options for the
methods of a [`Repository`]. Those types usually offer setter methods as well as
implement [`serde::Serialize`] and [`serde::Deserialize`].

Lower level data types which represent the stored repository format are
collected in the [`repofile`] module.

# Example - initialize a repository, backup to it and restore

```rust
    use std::sync::Arc;

    use blockvault_core::{
        BackupOptions, ConfigOptions, InMemoryStore, NoEncryption, Repository, RestoreOptions,
    };
    use blockvault_testing::transport::InMemoryTransport;

    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("hello.txt"), "hello world").unwrap();

    let repo = Repository::init(
        Arc::new(InMemoryTransport::new()),
        Arc::new(InMemoryStore::default()),
        NoEncryption,
        &ConfigOptions::default(),
    )
    .unwrap();

    let summary = repo
        .backup(&BackupOptions::default(), &[source.path().to_path_buf()])
        .unwrap();
    assert_eq!(summary.summary.files_processed, 1);

    let dest = tempfile::tempdir().unwrap();
    let restored = repo
        .restore(summary.version, dest.path(), &RestoreOptions::default())
        .unwrap();
    assert!(restored.is_complete());
```

# Crate features

This crate exposes a few features for controlling dependency usage.

- **cli** - Enables support for CLI features by enabling the `clap` feature.
  *This feature is disabled by default*.

- **clap** - Enables a dependency on the `clap` crate and enables parsing the
    `*Options` types from the commandline. *This feature is disabled by default*.
*/

// Workspace lints don't seem to work for this?
#![allow(clippy::redundant_pub_crate)]

pub(crate) mod archiver;
pub(crate) mod block;
pub(crate) mod cancel;
pub(crate) mod chunker;
pub(crate) mod codec;
pub(crate) mod commands;
pub(crate) mod crypto;
pub mod error;
pub(crate) mod id;
pub mod index;
pub(crate) mod progress;
/// Structs which are persisted in JSON or binary format
pub mod repofile;
pub(crate) mod repository;
pub(crate) mod store;
pub(crate) mod transport;

// blockvault_core Public API
pub use crate::{
    block::{BlockId, RunId, VolumeId, VolumeLocation},
    cancel::CancelToken,
    chunker::BlockHasher,
    codec::{max_compression_level, BlockCodec, CompressionKind},
    commands::{
        backup::{BackupOptions, BackupSummary, RunPhase},
        check::{CheckIssue, CheckOptions, CheckReport},
        compact::{CompactOptions, CompactStats},
        config::ConfigOptions,
        forget::{ForgetPlan, KeepOptions},
        restore::{FailedFile, RestoreOptions, RestoreSummary},
    },
    crypto::{aespoly1305::Key, hasher::hash, CryptoKey, EncryptionKind, NoEncryption},
    error::{ErrorCategory, VaultError, VaultErrorKind, VaultResult},
    id::Id,
    progress::{NoProgress, NoProgressBars, Progress, ProgressBars, ProgressType, VaultProgress},
    repository::Repository,
    store::{InMemoryStore, IndexStore, LocalStore, RepositorySnapshot},
    transport::Transport,
};
