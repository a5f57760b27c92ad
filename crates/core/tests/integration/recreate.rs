use std::sync::Arc;

use blockvault_core::{
    error::{ConfigErrorKind, MetaErrorKind, VaultErrorKind},
    BackupOptions, CheckOptions, ConfigOptions, InMemoryStore, IndexStore, Key, NoEncryption,
    Repository, RestoreOptions,
};
use blockvault_testing::{files_differ, source_dir, transport::InMemoryTransport, TestResult};
use pretty_assertions::assert_eq;
use rstest::rstest;

use crate::{repo_with, restored, tiny_blocks, transport};

#[rstest]
fn test_recreate_from_transport_passes(transport: Arc<InMemoryTransport>) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(4), &transport)?;
    let old = source_dir([("file", "AAAABBBB")])?;
    let new = source_dir([("file", "AAAACCCC"), ("other", "DDDD")])?;
    let first = repo.backup(&BackupOptions::default(), &[old.path().to_path_buf()])?;
    let second = repo.backup(&BackupOptions::default(), &[new.path().to_path_buf()])?;
    repo.prune(first.version)?;

    // the local state is lost
    let recreated = Repository::recreate(
        transport.clone(),
        Arc::new(InMemoryStore::default()),
        NoEncryption,
    )?;

    assert_eq!(recreated.config(), repo.config());
    assert_eq!(recreated.list_versions(), vec![second.version]);
    assert_eq!(
        recreated.dedup_index().snapshot(),
        repo.dedup_index().snapshot()
    );
    let volumes = |repo: &crate::Repo| -> Vec<_> {
        repo.volume_catalog()
            .snapshot()
            .into_iter()
            .map(|record| record.volume.id)
            .collect()
    };
    assert_eq!(volumes(&recreated), volumes(&repo));
    assert_eq!(
        recreated.fileset(second.version)?.files,
        repo.fileset(second.version)?.files
    );

    let dest = tempfile::tempdir()?;
    let summary = recreated.restore(second.version, dest.path(), &RestoreOptions::default())?;
    assert!(summary.is_complete());
    for name in ["file", "other"] {
        assert!(!files_differ(new.path().join(name), restored(&dest, &new, name))?);
    }
    let report = recreated.check(CheckOptions::default().read_data(true))?;
    assert!(report.is_ok(), "{:?}", report.issues);

    // pruning keeps working on the recreated state
    recreated.prune(second.version)?;
    assert_eq!(transport.meta_ids().len(), 1);
    Ok(())
}

#[rstest]
fn test_recreate_encrypted_repository_passes(
    transport: Arc<InMemoryTransport>,
) -> TestResult<()> {
    let key = Key::new();
    let repo = Repository::init(
        transport.clone(),
        Arc::new(InMemoryStore::default()),
        key,
        &ConfigOptions::default(),
    )?;
    let source = source_dir([("file", "some content worth keeping")])?;
    let backup = repo.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?;

    assert!(Repository::recreate(
        transport.clone(),
        Arc::new(InMemoryStore::default()),
        Key::new()
    )
    .is_err());
    assert!(Repository::recreate(
        transport.clone(),
        Arc::new(InMemoryStore::default()),
        NoEncryption
    )
    .is_err());

    let store = Arc::new(InMemoryStore::default());
    let recreated = Repository::recreate(transport.clone(), store.clone(), key)?;
    assert_eq!(recreated.list_versions(), vec![backup.version]);
    assert!(store.load()?.is_some());

    let next = recreated.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?;
    assert_eq!(next.version.0, backup.version.0 + 1);
    assert_eq!(next.summary.files_unchanged, 1);
    Ok(())
}

#[rstest]
fn test_recreate_into_used_store_fails(transport: Arc<InMemoryTransport>) -> TestResult<()> {
    let store = Arc::new(InMemoryStore::default());
    _ = Repository::init(
        transport.clone(),
        store.clone(),
        NoEncryption,
        &tiny_blocks(4),
    )?;

    let err = Repository::recreate(transport.clone(), store, NoEncryption)
        .err()
        .expect("store is in use");
    assert!(matches!(
        err.kind(),
        VaultErrorKind::Config(ConfigErrorKind::RepositoryExists)
    ));
    Ok(())
}

#[rstest]
fn test_recreate_from_empty_transport_fails(transport: Arc<InMemoryTransport>) -> TestResult<()> {
    let err = Repository::recreate(transport, Arc::new(InMemoryStore::default()), NoEncryption)
        .err()
        .expect("nothing to recreate from");
    assert!(matches!(
        err.kind(),
        VaultErrorKind::Meta(MetaErrorKind::NoConfigFound(0))
    ));
    Ok(())
}
