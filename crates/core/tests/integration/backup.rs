use std::{fs, path::PathBuf, sync::Arc};

use blockvault_core::{BackupOptions, ConfigOptions, RestoreOptions};
use blockvault_testing::{
    files_differ, pseudo_random, source_dir, transport::InMemoryTransport, TestResult,
};
use filetime::{set_file_mtime, FileTime};
use pretty_assertions::assert_eq;
use rstest::rstest;

use crate::{repo_with, restored, root, tiny_blocks, transport};

#[rstest]
fn test_second_backup_stores_only_new_blocks_passes(
    transport: Arc<InMemoryTransport>,
) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(4), &transport)?;

    let first = source_dir([("file", "ABCDEFGH")])?;
    let summary = repo.backup(&BackupOptions::default(), &[first.path().to_path_buf()])?;
    assert_eq!(summary.summary.files_processed, 1);
    assert_eq!(summary.summary.blocks_processed, 2);
    assert_eq!(summary.summary.blocks_new, 2);
    assert_eq!(summary.summary.volumes_written, 1);

    let second = source_dir([("file", "ABCDXXXX")])?;
    let summary = repo.backup(&BackupOptions::default(), &[second.path().to_path_buf()])?;
    assert_eq!(summary.summary.blocks_processed, 2);
    assert_eq!(summary.summary.blocks_new, 1);
    assert_eq!(summary.summary.volumes_written, 1);

    assert_eq!(repo.dedup_index().len(), 3);
    assert_eq!(transport.volume_ids().len(), 2);
    assert_eq!(repo.list_versions().len(), 2);
    Ok(())
}

#[rstest]
fn test_identical_files_are_stored_once_passes(
    transport: Arc<InMemoryTransport>,
) -> TestResult<()> {
    let repo = repo_with(&ConfigOptions::default().set_compression(0), &transport)?;
    let content = pseudo_random(1024 * 1024, 7);
    let source = source_dir([("a.bin", &content), ("copy/b.bin", &content)])?;

    let summary = repo.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?;
    assert_eq!(summary.summary.files_processed, 2);
    assert_eq!(summary.summary.blocks_processed, 2);
    assert_eq!(summary.summary.blocks_new, 1);

    let stored = transport.volume_bytes();
    assert!(stored >= 1024 * 1024);
    assert!(stored < 1024 * 1024 + 1024, "stored {stored} bytes");

    // nothing changed, only the new fileset is uploaded
    let attempts = transport.upload_attempts();
    let summary = repo.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?;
    assert_eq!(summary.summary.blocks_new, 0);
    assert_eq!(summary.summary.volumes_written, 0);
    assert_eq!(transport.upload_attempts(), attempts + 1);
    Ok(())
}

#[rstest]
fn test_recorded_names_start_with_source_name_passes(
    transport: Arc<InMemoryTransport>,
) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(16), &transport)?;
    let dir = source_dir([("top.txt", "top"), ("sub/deeper/low.txt", "low")])?;
    let single = source_dir([("alone.txt", "single file source")])?;

    let summary = repo.backup(
        &BackupOptions::default(),
        &[dir.path().to_path_buf(), single.path().join("alone.txt")],
    )?;
    let fileset = repo.fileset(summary.version)?;

    let mut names: Vec<PathBuf> = fileset.files.iter().map(|file| file.path.clone()).collect();
    names.sort();
    let mut expected = vec![
        root(&dir).join("top.txt"),
        root(&dir).join("sub").join("deeper").join("low.txt"),
        PathBuf::from("alone.txt"),
    ];
    expected.sort();
    assert_eq!(names, expected);

    let low = fileset
        .file(root(&dir).join("sub/deeper/low.txt"))
        .expect("file is recorded");
    assert_eq!(low.meta.size, 3);
    assert_eq!(low.content.len(), 1);
    Ok(())
}

#[rstest]
fn test_empty_file_is_recorded_passes(transport: Arc<InMemoryTransport>) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(4), &transport)?;
    let source = source_dir([("empty", "")])?;

    let summary = repo.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?;
    let fileset = repo.fileset(summary.version)?;
    let entry = fileset.file(root(&source).join("empty")).expect("recorded");
    assert_eq!(entry.meta.size, 0);
    assert_eq!(entry.content.len(), 1);
    Ok(())
}

#[rstest]
fn test_backup_without_sources_fails(transport: Arc<InMemoryTransport>) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(4), &transport)?;

    assert!(repo.backup(&BackupOptions::default(), &[]).is_err());
    assert!(repo.list_versions().is_empty());
    assert!(transport.volume_ids().is_empty());
    Ok(())
}

#[rstest]
fn test_missing_source_is_skipped_passes(transport: Arc<InMemoryTransport>) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(4), &transport)?;
    let source = source_dir([("present", "data")])?;

    let summary = repo.backup(
        &BackupOptions::default(),
        &[
            source.path().to_path_buf(),
            source.path().join("does-not-exist"),
        ],
    )?;
    assert_eq!(summary.summary.files_processed, 1);
    assert_eq!(summary.summary.files_skipped, 1);
    assert_eq!(summary.skipped.len(), 1);
    Ok(())
}

#[rstest]
fn test_unchanged_files_are_not_read_again_passes(
    transport: Arc<InMemoryTransport>,
) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(4), &transport)?;
    let source = source_dir([("same", "AAAABBBB"), ("changed", "CCCC")])?;
    let sources = [source.path().to_path_buf()];
    let first = repo.backup(&BackupOptions::default(), &sources)?;

    fs::write(source.path().join("changed"), "DDDDEEEE")?;
    let second = repo.backup(&BackupOptions::default(), &sources)?;
    assert_eq!(second.summary.files_processed, 2);
    assert_eq!(second.summary.files_unchanged, 1);
    assert_eq!(second.summary.blocks_processed, 2);
    assert_eq!(second.summary.blocks_new, 2);

    let same = root(&source).join("same");
    assert_eq!(
        repo.fileset(second.version)?.file(&same).expect("recorded").content,
        repo.fileset(first.version)?.file(&same).expect("recorded").content
    );

    let dest = tempfile::tempdir()?;
    let summary = repo.restore(second.version, dest.path(), &RestoreOptions::default())?;
    assert!(summary.is_complete());
    for name in ["same", "changed"] {
        assert!(!files_differ(
            source.path().join(name),
            restored(&dest, &source, name)
        )?);
    }
    Ok(())
}

#[rstest]
fn test_new_mtime_is_read_again_passes(transport: Arc<InMemoryTransport>) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(4), &transport)?;
    let source = source_dir([("file", "AAAABBBB")])?;
    let sources = [source.path().to_path_buf()];
    _ = repo.backup(&BackupOptions::default(), &sources)?;

    // same size, so only the modification time tells the change
    let file = source.path().join("file");
    fs::write(&file, "XXXXBBBB")?;
    set_file_mtime(&file, FileTime::from_unix_time(1_000_000_000, 0))?;

    let second = repo.backup(&BackupOptions::default(), &sources)?;
    assert_eq!(second.summary.files_unchanged, 0);
    assert_eq!(second.summary.blocks_processed, 2);
    assert_eq!(second.summary.blocks_new, 1);
    Ok(())
}

#[rstest]
fn test_force_reads_every_file_passes(transport: Arc<InMemoryTransport>) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(4), &transport)?;
    let source = source_dir([("file", "AAAABBBB")])?;
    let sources = [source.path().to_path_buf()];
    _ = repo.backup(&BackupOptions::default(), &sources)?;

    let unchanged = repo.backup(&BackupOptions::default(), &sources)?;
    assert_eq!(unchanged.summary.files_unchanged, 1);
    assert_eq!(unchanged.summary.blocks_processed, 0);

    let forced = repo.backup(&BackupOptions::default().force(true), &sources)?;
    assert_eq!(forced.summary.files_unchanged, 0);
    assert_eq!(forced.summary.blocks_processed, 2);
    assert_eq!(forced.summary.blocks_new, 0);
    Ok(())
}

#[rstest]
fn test_sources_with_same_name_are_kept_apart_passes(
    transport: Arc<InMemoryTransport>,
) -> TestResult<()> {
    let repo = repo_with(&tiny_blocks(4), &transport)?;
    let dir = source_dir([("a/docs/note.txt", "from a"), ("b/docs/note.txt", "from b")])?;

    let summary = repo.backup(
        &BackupOptions::default(),
        &[dir.path().join("a/docs"), dir.path().join("b/docs")],
    )?;
    assert_eq!(summary.summary.files_processed, 2);
    assert!(summary.skipped.is_empty());

    let dest = tempfile::tempdir()?;
    let restore = repo.restore(summary.version, dest.path(), &RestoreOptions::default())?;
    assert_eq!(restore.restored.len(), 2);
    assert_eq!(
        fs::read_to_string(dest.path().join("a/docs/note.txt"))?,
        "from a"
    );
    assert_eq!(
        fs::read_to_string(dest.path().join("b/docs/note.txt"))?,
        "from b"
    );
    Ok(())
}

#[cfg(unix)]
#[rstest]
fn test_unreadable_file_is_skipped_passes(transport: Arc<InMemoryTransport>) -> TestResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let repo = repo_with(&tiny_blocks(4), &transport)?;
    let source = source_dir([("readable", "AAAABBBB"), ("secret", "CCCC")])?;
    let secret = source.path().join("secret");
    fs::set_permissions(&secret, fs::Permissions::from_mode(0o000))?;
    if fs::File::open(&secret).is_ok() {
        // permissions are not enforced, e.g. for root
        return Ok(());
    }

    let summary = repo.backup(&BackupOptions::default(), &[source.path().to_path_buf()])?;
    fs::set_permissions(&secret, fs::Permissions::from_mode(0o600))?;

    assert_eq!(summary.summary.files_processed, 1);
    assert_eq!(summary.summary.files_skipped, 1);
    assert_eq!(summary.skipped[0].path, root(&source).join("secret"));
    let fileset = repo.fileset(summary.version)?;
    assert!(fileset.file(root(&source).join("readable")).is_some());
    assert!(fileset.file(root(&source).join("secret")).is_none());
    Ok(())
}
