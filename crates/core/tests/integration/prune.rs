use std::sync::Arc;

use blockvault_core::{
    error::{FilesetErrorKind, VaultErrorKind},
    hash, BackupOptions, BlockId, KeepOptions, RestoreOptions,
};
use blockvault_testing::{files_differ, source_dir, transport::InMemoryTransport, TestResult};
use pretty_assertions::assert_eq;
use rstest::rstest;

use crate::{repo_with, restored, tiny_blocks, transport};

#[rstest]
fn test_prune_releases_references_passes(transport: Arc<InMemoryTransport>) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(4), &transport)?;
    let source = source_dir([("file", "AAAABBBB")])?;
    let sources = [source.path().to_path_buf()];
    let first = repo.backup(&BackupOptions::default(), &sources)?;
    let second = repo.backup(&BackupOptions::default(), &sources)?;

    let id = BlockId::from(hash(b"AAAA"));
    assert_eq!(repo.dedup_index().refcount(&id), Some(2));

    repo.prune(first.version)?;
    assert_eq!(repo.dedup_index().refcount(&id), Some(1));
    assert!(repo.dedup_index().unreferenced().is_empty());
    assert_eq!(repo.list_versions(), vec![second.version]);

    repo.prune(second.version)?;
    assert_eq!(repo.dedup_index().refcount(&id), Some(0));
    assert_eq!(repo.dedup_index().unreferenced().len(), 2);
    assert!(repo.list_versions().is_empty());
    // volumes stay until compaction
    assert_eq!(transport.volume_ids().len(), 1);
    Ok(())
}

#[rstest]
fn test_prune_twice_fails(transport: Arc<InMemoryTransport>) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(4), &transport)?;
    let source = source_dir([("file", "AAAA")])?;
    let backup = repo.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?;

    repo.prune(backup.version)?;
    let err = repo.prune(backup.version).expect_err("already pruned");
    assert!(matches!(
        err.kind(),
        VaultErrorKind::Fileset(FilesetErrorKind::VersionNotFound(version)) if *version == backup.version
    ));
    Ok(())
}

#[rstest]
fn test_restore_after_pruning_older_fileset_passes(
    transport: Arc<InMemoryTransport>,
) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(4), &transport)?;
    let old = source_dir([("file", "AAAABBBBCCCC")])?;
    let new = source_dir([("file", "AAAAXXXXCCCC")])?;
    let first = repo.backup(&BackupOptions::default(), &[old.path().to_path_buf()])?;
    let second = repo.backup(&BackupOptions::default(), &[new.path().to_path_buf()])?;

    repo.prune(first.version)?;

    let dest = tempfile::tempdir()?;
    let summary = repo.restore(second.version, dest.path(), &RestoreOptions::default())?;
    assert!(summary.is_complete());
    assert!(!files_differ(
        new.path().join("file"),
        restored(&dest, &new, "file")
    )?);
    Ok(())
}

#[rstest]
fn test_forget_keeps_last_filesets_passes(transport: Arc<InMemoryTransport>) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(4), &transport)?;
    let mut versions = Vec::new();
    for content in ["one!", "two!", "three", "four"] {
        let source = source_dir([("file", content)])?;
        versions.push(
            repo.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?
                .version,
        );
    }

    let plan = repo.forget(&KeepOptions::default().keep_last(2_usize))?;
    assert_eq!(plan.keep, vec![versions[3], versions[2]]);
    assert_eq!(plan.remove, vec![versions[1], versions[0]]);
    assert_eq!(repo.list_versions(), vec![versions[2], versions[3]]);

    // without keep options nothing is removed
    let plan = repo.forget(&KeepOptions::default())?;
    assert!(plan.remove.is_empty());
    assert_eq!(repo.list_versions().len(), 2);
    Ok(())
}
