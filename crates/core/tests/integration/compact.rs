use std::sync::Arc;

use blockvault_core::{
    hash, BackupOptions, BlockId, CheckOptions, CompactOptions, LocalStore, NoEncryption,
    Repository, RestoreOptions,
};
use blockvault_testing::{files_differ, source_dir, transport::InMemoryTransport, TestResult};
use pretty_assertions::assert_eq;
use rstest::rstest;

use crate::{restored, repo_with, tiny_blocks, transport};

#[rstest]
fn test_compact_after_pruning_everything_passes(
    transport: Arc<InMemoryTransport>,
) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(4), &transport)?;
    let source = source_dir([("file", "AAAABBBB")])?;
    let backup = repo.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?;
    repo.prune(backup.version)?;

    let stats = repo.compact(CompactOptions::default())?;
    assert_eq!(stats.volumes_deleted, 1);
    assert_eq!(stats.blocks_removed, 2);
    assert_eq!(stats.volumes_written, 0);

    assert!(transport.volume_ids().is_empty());
    assert!(repo.dedup_index().is_empty());
    assert!(repo.volume_catalog().is_empty());
    assert!(repo.check(CheckOptions::default().read_data(true))?.is_ok());
    Ok(())
}

#[rstest]
fn test_compact_repacks_sparse_volume_passes(
    transport: Arc<InMemoryTransport>,
) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(4), &transport)?;
    let old = source_dir([("file", "AAAABBBB")])?;
    let new = source_dir([("file", "AAAACCCC")])?;
    let first = repo.backup(&BackupOptions::default(), &[old.path().to_path_buf()])?;
    let second = repo.backup(&BackupOptions::default(), &[new.path().to_path_buf()])?;
    let sparse = repo
        .dedup_index()
        .lookup(&BlockId::from(hash(b"AAAA")))
        .expect("indexed")
        .volume;

    repo.prune(first.version)?;
    let stats = repo.compact(CompactOptions::default())?;
    assert_eq!(stats.volumes_repacked, 1);
    assert_eq!(stats.blocks_repacked, 1);
    assert_eq!(stats.blocks_removed, 1);
    assert_eq!(stats.volumes_written, 1);
    assert_eq!(stats.volumes_deleted, 0);

    let moved = repo
        .dedup_index()
        .lookup(&BlockId::from(hash(b"AAAA")))
        .expect("still indexed");
    assert_ne!(moved.volume, sparse);
    assert!(!transport.volume_ids().contains(&sparse));
    assert_eq!(transport.volume_ids().len(), 2);
    assert_eq!(repo.dedup_index().len(), 2);
    assert_eq!(repo.dedup_index().refcount(&BlockId::from(hash(b"BBBB"))), None);

    let dest = tempfile::tempdir()?;
    let summary = repo.restore(second.version, dest.path(), &RestoreOptions::default())?;
    assert!(summary.is_complete());
    assert!(!files_differ(
        new.path().join("file"),
        restored(&dest, &new, "file")
    )?);

    let report = repo.check(CheckOptions::default().read_data(true))?;
    assert!(report.is_ok(), "{:?}", report.issues);
    assert_eq!(report.volumes_read, 2);
    Ok(())
}

#[rstest]
fn test_compact_keeps_volumes_below_threshold_passes(
    transport: Arc<InMemoryTransport>,
) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(4), &transport)?;
    let old = source_dir([("file", "AAAABBBB")])?;
    let new = source_dir([("file", "AAAACCCC")])?;
    let first = repo.backup(&BackupOptions::default(), &[old.path().to_path_buf()])?;
    _ = repo.backup(&BackupOptions::default(), &[new.path().to_path_buf()])?;
    repo.prune(first.version)?;

    let stats = repo.compact(CompactOptions::default().max_unused_percent(50u8))?;
    assert_eq!(stats.volumes_repacked, 0);
    assert_eq!(stats.volumes_deleted, 0);
    assert_eq!(transport.volume_ids().len(), 2);
    Ok(())
}

#[rstest]
fn test_compact_dry_run_changes_nothing_passes(
    transport: Arc<InMemoryTransport>,
) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(4), &transport)?;
    let source = source_dir([("file", "AAAABBBB")])?;
    let backup = repo.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?;
    repo.prune(backup.version)?;

    let ids = transport.ids();
    let entries = repo.dedup_index().snapshot();
    let stats = repo.compact(CompactOptions::default().dry_run(true))?;

    assert_eq!(stats.volumes_deleted, 1);
    assert_eq!(transport.ids(), ids);
    assert_eq!(repo.dedup_index().snapshot(), entries);
    Ok(())
}

#[rstest]
fn test_reopen_from_local_store_passes(transport: Arc<InMemoryTransport>) -> TestResult<()> {
    let state = tempfile::tempdir()?;
    let store = Arc::new(LocalStore::new(state.path().join("state.json")));
    let repo = Repository::init(transport.clone(), store.clone(), NoEncryption, &tiny_blocks(4))?;
    let source = source_dir([("file", "AAAABBBB"), ("other", "BBBBCCCC")])?;
    let first = repo.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?;
    _ = repo.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?;
    repo.prune(first.version)?;

    let reopened = Repository::open(transport.clone(), store, NoEncryption)?;
    assert_eq!(reopened.config(), repo.config());
    assert_eq!(reopened.list_versions(), repo.list_versions());
    assert_eq!(reopened.dedup_index().snapshot(), repo.dedup_index().snapshot());
    assert_eq!(
        reopened.volume_catalog().snapshot(),
        repo.volume_catalog().snapshot()
    );
    let latest = reopened.latest().expect("one fileset left");
    assert_eq!(latest.files, repo.latest().expect("one fileset left").files);

    // the next version continues after the pruned one
    let next = reopened.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?;
    assert_eq!(next.version.0, 3);
    Ok(())
}
