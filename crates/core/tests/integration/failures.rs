use std::sync::Arc;

use blockvault_core::{
    hash, repofile::MetaKind, BackupOptions, BlockId, CancelToken, CheckIssue, CheckOptions,
    ErrorCategory,
};
use blockvault_testing::{
    source_dir,
    transport::{InMemoryTransport, Transfer},
    TestResult,
};
use pretty_assertions::assert_eq;
use rstest::rstest;

use crate::{one_block_per_volume, repo_with, tiny_blocks, transport};

#[rstest]
fn test_failed_upload_rolls_back_run_fails(transport: Arc<InMemoryTransport>) -> TestResult<()> {
    let repo = repo_with(&one_block_per_volume(4), &transport)?;
    let source = source_dir([("file", "AAAABBBBCCCC")])?;
    let sources = [source.path().to_path_buf()];

    // the config was the first upload
    transport.fail_uploads_from(4);
    let err = repo
        .backup(&BackupOptions::default(), &sources)
        .expect_err("third volume fails");
    assert_eq!(err.category(), ErrorCategory::Transport);

    assert!(repo.list_versions().is_empty());
    assert!(repo.dedup_index().is_empty());
    assert!(repo.volume_catalog().is_empty());
    // volumes uploaded before the failure are removed again
    assert!(transport.volume_ids().is_empty());

    transport.heal();
    let summary = repo.backup(&BackupOptions::default(), &sources)?;
    assert_eq!(summary.summary.blocks_new, 3);
    assert_eq!(summary.summary.volumes_written, 3);
    assert_eq!(transport.volume_ids().len(), 3);
    assert!(repo.check(CheckOptions::default().read_data(true))?.is_ok());
    Ok(())
}

#[rstest]
fn test_cancelled_backup_fails(transport: Arc<InMemoryTransport>) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(4), &transport)?;
    let source = source_dir([("file", "AAAABBBB")])?;

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = repo
        .backup_with_cancel(
            &BackupOptions::default(),
            &[source.path().to_path_buf()],
            cancel,
        )
        .expect_err("cancelled");
    assert!(err.is_cancelled());
    assert!(repo.list_versions().is_empty());
    assert!(repo.dedup_index().is_empty());
    assert!(transport.volume_ids().is_empty());
    Ok(())
}

#[rstest]
fn test_backup_cancelled_during_upload_fails(
    transport: Arc<InMemoryTransport>,
) -> TestResult<()> {
    let repo = repo_with(&one_block_per_volume(4), &transport)?;
    let source = source_dir([("file", "AAAABBBBCCCC")])?;
    let sources = [source.path().to_path_buf()];

    // the config was the first upload, the second one is the first volume
    let cancel = CancelToken::new();
    transport.cancel_on(Transfer::Upload, 2, cancel.clone());
    let err = repo
        .backup_with_cancel(&BackupOptions::default(), &sources, cancel)
        .expect_err("cancelled");
    assert!(err.is_cancelled());
    assert!(repo.list_versions().is_empty());
    assert!(repo.dedup_index().is_empty());
    assert!(repo.volume_catalog().is_empty());
    assert!(transport.volume_ids().is_empty());
    assert_eq!(transport.meta_ids().len(), 1);

    let summary = repo.backup(&BackupOptions::default(), &sources)?;
    assert_eq!(summary.summary.blocks_new, 3);
    assert!(repo.check(CheckOptions::default().read_data(true))?.is_ok());
    Ok(())
}

#[rstest]
fn test_check_finds_lost_fileset_object_fails(
    transport: Arc<InMemoryTransport>,
) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(4), &transport)?;
    let source = source_dir([("file", "AAAABBBB")])?;
    let backup = repo.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?;

    let before = transport.meta_ids();
    assert_eq!(before.len(), 2);
    let object = before
        .into_iter()
        .find(|id| {
            transport
                .get(id)
                .is_some_and(|data| data[8] == MetaKind::Fileset.id())
        })
        .expect("fileset is published");
    _ = transport.lose(&object);

    let report = repo.check(CheckOptions::default())?;
    assert_eq!(
        report.issues,
        vec![CheckIssue::FilesetObjectMissing {
            version: backup.version,
            object,
        }]
    );
    Ok(())
}

#[rstest]
fn test_check_finds_lost_volume_fails(transport: Arc<InMemoryTransport>) -> TestResult<()> {
    let repo = repo_with(&one_block_per_volume(4), &transport)?;
    let source = source_dir([("file", "AAAABBBB")])?;
    _ = repo.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?;
    assert!(repo.check(CheckOptions::default())?.is_ok());

    let lost = repo
        .dedup_index()
        .lookup(&BlockId::from(hash(b"BBBB")))
        .expect("indexed")
        .volume;
    _ = transport.lose(&lost);

    let report = repo.check(CheckOptions::default())?;
    assert_eq!(report.issues, vec![CheckIssue::VolumeMissing(lost)]);
    assert_eq!(report.filesets_checked, 1);
    assert_eq!(report.blocks_checked, 2);
    Ok(())
}

#[rstest]
fn test_check_read_data_finds_corruption_fails(
    transport: Arc<InMemoryTransport>,
) -> TestResult<()> {
    let repo = repo_with(&one_block_per_volume(4), &transport)?;
    let source = source_dir([("file", "AAAABBBB")])?;
    _ = repo.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?;

    let damaged = repo
        .dedup_index()
        .lookup(&BlockId::from(hash(b"AAAA")))
        .expect("indexed")
        .volume;
    transport.corrupt(&damaged, 65);

    // the structure is still intact
    assert!(repo.check(CheckOptions::default())?.is_ok());

    let report = repo.check(CheckOptions::default().read_data(true))?;
    assert_eq!(report.volumes_read, 2);
    assert_eq!(report.issues.len(), 1);
    assert!(matches!(
        &report.issues[0],
        CheckIssue::VolumeDamaged { volume, .. } if *volume == damaged
    ));
    Ok(())
}
