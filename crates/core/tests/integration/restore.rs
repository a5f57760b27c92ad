use std::{fs, path::Path, sync::Arc};

use blockvault_core::{
    hash, BackupOptions, BlockId, CancelToken, ErrorCategory, RestoreOptions, VolumeId,
};
use blockvault_testing::{
    files_differ, pseudo_random, source_dir,
    transport::{InMemoryTransport, Transfer},
    TestResult,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rstest::rstest;
use walkdir::WalkDir;

use crate::{one_block_per_volume, repo_with, restored, root, tiny_blocks, transport};

/// Regular files below `dir`
fn files_below(dir: &Path) -> Vec<std::path::PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .collect()
}

/// The volume holding the block with the given raw content
fn volume_of(repo: &crate::Repo, content: &[u8]) -> VolumeId {
    repo.dedup_index()
        .lookup(&BlockId::from(hash(content)))
        .expect("block is indexed")
        .volume
}

#[rstest]
fn test_restore_round_trip_passes(transport: Arc<InMemoryTransport>) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(1024), &transport)?;
    let big = pseudo_random(10 * 1024 + 17, 1);
    let source = source_dir([
        ("big.bin", big.as_slice()),
        ("nested/deeper/small.txt", b"small".as_slice()),
        ("nested/empty", b"".as_slice()),
        ("exact.bin", &big[..2048]),
    ])?;

    let backup = repo.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?;
    let dest = tempfile::tempdir()?;
    let summary = repo.restore(backup.version, dest.path(), &RestoreOptions::default())?;

    assert!(summary.is_complete());
    assert_eq!(summary.restored.len(), 4);
    assert_eq!(summary.bytes_written, (big.len() + 5 + 2048) as u64);
    for rel in ["big.bin", "nested/deeper/small.txt", "nested/empty", "exact.bin"] {
        assert!(
            !files_differ(source.path().join(rel), restored(&dest, &source, rel))?,
            "{rel} differs"
        );
    }
    // no leftovers from temporary files
    assert_eq!(files_below(dest.path()).len(), 4);
    Ok(())
}

#[rstest]
fn test_restore_selected_paths_passes(transport: Arc<InMemoryTransport>) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(8), &transport)?;
    let source = source_dir([
        ("docs/a.txt", "first document"),
        ("docs/b.txt", "second document"),
        ("other.txt", "not selected"),
    ])?;
    let backup = repo.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?;

    let dest = tempfile::tempdir()?;
    let opts = RestoreOptions::default().paths(vec![root(&source).join("docs")]);
    let summary = repo.restore(backup.version, dest.path(), &opts)?;

    assert_eq!(summary.restored.len(), 2);
    assert!(restored(&dest, &source, "docs/a.txt").exists());
    assert!(restored(&dest, &source, "docs/b.txt").exists());
    assert!(!restored(&dest, &source, "other.txt").exists());
    Ok(())
}

#[rstest]
fn test_restore_corrupted_block_fails(transport: Arc<InMemoryTransport>) -> TestResult<()> {
    let repo = repo_with(&one_block_per_volume(4), &transport)?;
    let source = source_dir([("bad", "AAAABBBB"), ("good", "CCCC")])?;
    let backup = repo.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?;

    // damage the payload of the volume holding "AAAA", but keep its trailer valid
    let volume = volume_of(&repo, b"AAAA");
    let mut data = transport.get(&volume).expect("volume exists").to_vec();
    data[64] ^= 0x01;
    let end = data.len() - 32;
    let checksum = hash(&data[..end]);
    data[end..].copy_from_slice(checksum.as_bytes());
    transport.put(volume, data);

    let dest = tempfile::tempdir()?;
    let summary = repo.restore(backup.version, dest.path(), &RestoreOptions::default())?;

    assert_eq!(summary.restored, vec![root(&source).join("good")]);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].path, root(&source).join("bad"));
    assert!(summary.failed[0].error.is_corruption());
    assert!(!restored(&dest, &source, "bad").exists());
    assert!(!files_differ(
        source.path().join("good"),
        restored(&dest, &source, "good")
    )?);
    assert_eq!(files_below(dest.path()).len(), 1);
    Ok(())
}

#[rstest]
fn test_restore_damaged_volume_fails(transport: Arc<InMemoryTransport>) -> TestResult<()> {
    let repo = repo_with(&one_block_per_volume(4), &transport)?;
    let source = source_dir([("file", "AAAABBBB")])?;
    let backup = repo.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?;

    transport.corrupt(&volume_of(&repo, b"BBBB"), 70);

    let dest = tempfile::tempdir()?;
    let summary = repo.restore(backup.version, dest.path(), &RestoreOptions::default())?;
    assert!(summary.restored.is_empty());
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].error.category(), ErrorCategory::Corruption);
    assert!(files_below(dest.path()).is_empty());
    Ok(())
}

#[rstest]
fn test_restore_all_or_nothing_fails(transport: Arc<InMemoryTransport>) -> TestResult<()> {
    let repo = repo_with(&one_block_per_volume(4), &transport)?;
    let source = source_dir([("lost", "AAAA"), ("kept", "BBBB")])?;
    let backup = repo.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?;

    _ = transport.lose(&volume_of(&repo, b"AAAA"));

    let dest = tempfile::tempdir()?;
    let opts = RestoreOptions::default().all_or_nothing(true);
    let err = repo
        .restore(backup.version, dest.path(), &opts)
        .expect_err("a volume is missing");
    assert!(err.is_corruption());
    assert!(files_below(dest.path()).is_empty());

    // without all-or-nothing the other file is restored
    let summary = repo.restore(backup.version, dest.path(), &RestoreOptions::default())?;
    assert_eq!(summary.restored, vec![root(&source).join("kept")]);
    assert_eq!(summary.failed.len(), 1);
    Ok(())
}

#[rstest]
fn test_restore_unknown_version_fails(transport: Arc<InMemoryTransport>) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(4), &transport)?;
    let source = source_dir([("file", "content")])?;
    let backup = repo.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?;

    let dest = tempfile::tempdir()?;
    let mut unknown = backup.version;
    unknown.0 += 1;
    assert!(repo
        .restore(unknown, dest.path(), &RestoreOptions::default())
        .is_err());
    Ok(())
}

#[rstest]
fn test_restore_overwrites_existing_file_passes(
    transport: Arc<InMemoryTransport>,
) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(4), &transport)?;
    let source = source_dir([("file", "fresh content")])?;
    let backup = repo.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?;

    let dest = tempfile::tempdir()?;
    let target = restored(&dest, &source, "file");
    fs::create_dir_all(target.parent().expect("has parent"))?;
    fs::write(&target, "some much longer stale content")?;

    let summary = repo.restore(backup.version, dest.path(), &RestoreOptions::default())?;
    assert!(summary.is_complete());
    assert_eq!(fs::read(&target)?, b"fresh content");
    Ok(())
}

#[rstest]
fn test_restore_cancelled_before_start_fails(
    transport: Arc<InMemoryTransport>,
) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(4), &transport)?;
    let source = source_dir([("file", "AAAABBBB")])?;
    let backup = repo.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?;

    let cancel = CancelToken::new();
    cancel.cancel();
    let dest = tempfile::tempdir()?;
    let err = repo
        .restore_with_cancel(backup.version, dest.path(), &RestoreOptions::default(), &cancel)
        .expect_err("cancelled");
    assert!(err.is_cancelled());
    assert_eq!(transport.download_attempts(), 0);
    assert!(files_below(dest.path()).is_empty());
    Ok(())
}

#[rstest]
fn test_restore_cancelled_between_volumes_fails(
    transport: Arc<InMemoryTransport>,
) -> TestResult<()> {
    let repo = repo_with(&one_block_per_volume(4), &transport)?;
    let source = source_dir([("first", "AAAABBBB"), ("second", "CCCCDDDD")])?;
    let backup = repo.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?;

    let cancel = CancelToken::new();
    transport.cancel_on(
        Transfer::Download,
        transport.download_attempts() + 1,
        cancel.clone(),
    );
    let dest = tempfile::tempdir()?;
    let opts = RestoreOptions::default().threads(1_usize);
    let err = repo
        .restore_with_cancel(backup.version, dest.path(), &opts, &cancel)
        .expect_err("cancelled");
    assert!(err.is_cancelled());
    assert_eq!(err.category(), ErrorCategory::Cancelled);
    // no temporary or partial file is left behind
    assert!(files_below(dest.path()).is_empty());

    let summary = repo.restore(backup.version, dest.path(), &RestoreOptions::default())?;
    assert!(summary.is_complete());
    assert_eq!(summary.volumes_fetched, 4);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn test_restore_reproduces_any_content_passes(
        content in proptest::collection::vec(any::<u8>(), 0..300),
        block_size in 1u64..64,
    ) {
        let transport = Arc::new(InMemoryTransport::new());
        let repo = repo_with(&tiny_blocks(block_size), &transport).unwrap();
        let source = source_dir([("file", &content)]).unwrap();
        let backup = repo
            .backup(&BackupOptions::default(), &[source.path().to_path_buf()])
            .unwrap();

        let dest = tempfile::tempdir().unwrap();
        let summary = repo
            .restore(backup.version, dest.path(), &RestoreOptions::default())
            .unwrap();
        prop_assert!(summary.is_complete());
        prop_assert_eq!(fs::read(restored(&dest, &source, "file")).unwrap(), content);
    }
}
