use std::{
    collections::{HashMap, HashSet},
    ffi::OsString,
    path::{Component, Path, PathBuf},
};

use log::{debug, warn};
use walkdir::WalkDir;

use crate::{error::CommandErrorKind, VaultResult};

/// A regular file found below a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SourceEntry {
    /// Where the file is read from
    pub path: PathBuf,
    /// The path recorded in the fileset
    pub name: PathBuf,
    /// The size reported while scanning
    pub size: u64,
}

/// Result of scanning all sources.
#[derive(Debug, Default)]
pub(crate) struct Scan {
    pub files: Vec<SourceEntry>,
    /// Entries which could not be read, with the reason
    pub skipped: Vec<(PathBuf, String)>,
}

impl Scan {
    pub(crate) fn total_size(&self) -> u64 {
        self.files.iter().map(|entry| entry.size).sum()
    }
}

/// The absolute form of `path`, also for paths which do not exist.
fn absolute(path: &Path) -> PathBuf {
    path.canonicalize()
        .or_else(|_| std::env::current_dir().map(|dir| dir.join(path)))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// The normal components of the absolute path of `source`.
///
/// The final component is the one given by the caller, so a symlinked source
/// keeps the name it was given under.
fn components(source: &Path) -> Vec<OsString> {
    let normal = |path: &Path| -> Vec<OsString> {
        path.components()
            .filter_map(|component| match component {
                Component::Normal(name) => Some(name.to_owned()),
                _ => None,
            })
            .collect()
    };
    let mut parts = match (source.parent(), source.file_name()) {
        (Some(parent), Some(name)) => {
            let mut parts = normal(&absolute(parent));
            parts.push(name.to_owned());
            parts
        }
        _ => normal(&absolute(source)),
    };
    if parts.is_empty() {
        parts.push(OsString::from("root"));
    }
    parts
}

/// The names under which the content of `sources` is recorded.
///
/// Every source is recorded under its final component. Sources sharing it
/// get as many parent components as are needed to tell them apart, e.g.
/// `/x/a/docs` and `/y/b/docs` become `a/docs` and `b/docs`.
fn root_names(sources: &[PathBuf]) -> Vec<PathBuf> {
    let parts: Vec<_> = sources.iter().map(|source| components(source)).collect();
    let name = |idx: usize, depth: usize| -> PathBuf {
        parts[idx][parts[idx].len() - depth..].iter().collect()
    };

    let mut depths = vec![1; sources.len()];
    loop {
        let mut groups: HashMap<PathBuf, Vec<usize>> = HashMap::new();
        for (idx, depth) in depths.iter().enumerate() {
            groups.entry(name(idx, *depth)).or_default().push(idx);
        }
        let mut grown = false;
        for idx in groups.into_values().filter(|group| group.len() > 1).flatten() {
            if depths[idx] < parts[idx].len() {
                depths[idx] += 1;
                grown = true;
            }
        }
        if !grown {
            break;
        }
    }
    depths
        .iter()
        .enumerate()
        .map(|(idx, depth)| name(idx, *depth))
        .collect()
}

/// Walks the sources and collects every regular file.
///
/// Directories are descended into, symlinks are not followed and other
/// special files are ignored. Recorded names start with the name of their
/// source, see [`root_names`]. A source given twice is walked once, and a
/// file whose name was already recorded from another source is skipped.
///
/// # Errors
///
/// * [`CommandErrorKind::NoSources`] - If `sources` is empty
/// * [`CommandErrorKind::StripPrefixFailed`] - If a walked path is not below its source
pub(crate) fn scan(sources: &[PathBuf]) -> VaultResult<Scan> {
    if sources.is_empty() {
        return Err(CommandErrorKind::NoSources.into());
    }

    let mut seen = HashSet::new();
    let sources: Vec<PathBuf> = sources
        .iter()
        .filter(|source| {
            let fresh = seen.insert(absolute(source));
            if !fresh {
                warn!("{} is given twice, walking it once", source.display());
            }
            fresh
        })
        .cloned()
        .collect();

    let mut scan = Scan::default();
    let mut names = HashSet::new();
    for (source, root) in sources.iter().zip(root_names(&sources)) {
        for entry in WalkDir::new(source)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().unwrap_or(source);
                    let name = match path.strip_prefix(source) {
                        Ok(rel) if rel.as_os_str().is_empty() => root.clone(),
                        Ok(rel) => root.join(rel),
                        Err(_) => root.clone(),
                    };
                    warn!("cannot read {}: {err}", path.display());
                    scan.skipped.push((name, err.to_string()));
                    continue;
                }
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }
            if !file_type.is_file() {
                debug!("ignoring special file {}", entry.path().display());
                continue;
            }

            let rel = entry
                .path()
                .strip_prefix(source)
                .map_err(|err| CommandErrorKind::StripPrefixFailed(entry.path().to_path_buf(), err))?;
            let name = if rel.as_os_str().is_empty() {
                root.clone()
            } else {
                root.join(rel)
            };
            if !names.insert(name.clone()) {
                let reason = format!("{} is already recorded from another source", name.display());
                warn!("skipping {}: {reason}", entry.path().display());
                scan.skipped.push((entry.into_path(), reason));
                continue;
            }
            let size = entry.metadata().map_or(0, |meta| meta.len());
            scan.files.push(SourceEntry {
                path: entry.into_path(),
                name,
                size,
            });
        }
    }
    Ok(scan)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_scan_directory_passes() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("docs");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("a.txt"), b"ABCD").unwrap();
        fs::write(src.join("sub").join("b.txt"), b"EFGHIJ").unwrap();

        let scan = scan(&[src]).unwrap();
        let names: Vec<_> = scan.files.iter().map(|entry| entry.name.clone()).collect();

        assert_eq!(
            names,
            vec![
                PathBuf::from("docs/a.txt"),
                PathBuf::from("docs/sub/b.txt")
            ]
        );
        assert_eq!(scan.total_size(), 10);
        assert!(scan.skipped.is_empty());
    }

    #[test]
    fn test_scan_single_file_passes() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("data.bin");
        fs::write(&file, b"ABCDEFGH").unwrap();

        let scan = scan(&[file.clone()]).unwrap();

        assert_eq!(
            scan.files,
            vec![SourceEntry {
                path: file,
                name: PathBuf::from("data.bin"),
                size: 8,
            }]
        );
    }

    #[test]
    fn test_missing_source_is_skipped_passes() {
        let dir = tempdir().unwrap();

        let scan = scan(&[dir.path().join("missing")]).unwrap();

        assert!(scan.files.is_empty());
        assert_eq!(scan.skipped.len(), 1);
        assert_eq!(scan.skipped[0].0, PathBuf::from("missing"));
    }

    #[test]
    fn test_sources_with_same_name_are_told_apart_passes() {
        let dir = tempdir().unwrap();
        let sources = [
            dir.path().join("x").join("a").join("docs"),
            dir.path().join("y").join("b").join("docs"),
            dir.path().join("z").join("c"),
        ];

        assert_eq!(
            root_names(&sources),
            vec![
                PathBuf::from("a/docs"),
                PathBuf::from("b/docs"),
                PathBuf::from("c")
            ]
        );
    }

    #[test]
    fn test_same_parents_grow_further_passes() {
        let sources = [
            PathBuf::from("/p/same/docs"),
            PathBuf::from("/q/same/docs"),
            PathBuf::from("/r/docs"),
        ];

        assert_eq!(
            root_names(&sources),
            vec![
                PathBuf::from("p/same/docs"),
                PathBuf::from("q/same/docs"),
                PathBuf::from("r/docs")
            ]
        );
    }

    #[test]
    fn test_scan_sources_with_same_name_passes() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("a").join("docs");
        let second = dir.path().join("b").join("docs");
        fs::create_dir_all(&first).unwrap();
        fs::create_dir_all(&second).unwrap();
        fs::write(first.join("note.txt"), b"first").unwrap();
        fs::write(second.join("note.txt"), b"second!").unwrap();

        let scan = scan(&[first, second]).unwrap();
        let names: Vec<_> = scan.files.iter().map(|entry| entry.name.clone()).collect();

        assert_eq!(
            names,
            vec![
                PathBuf::from("a/docs/note.txt"),
                PathBuf::from("b/docs/note.txt")
            ]
        );
        assert!(scan.skipped.is_empty());
    }

    #[test]
    fn test_source_given_twice_is_walked_once_passes() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("docs");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.txt"), b"ABCD").unwrap();

        let scan = scan(&[src.clone(), src]).unwrap();

        assert_eq!(scan.files.len(), 1);
        assert_eq!(scan.files[0].name, PathBuf::from("docs/a.txt"));
        assert!(scan.skipped.is_empty());
    }

    #[test]
    fn test_colliding_name_from_nested_source_is_skipped_passes() {
        let dir = tempdir().unwrap();
        // `a/docs` and `b/docs` need two components, `a` alone holds `docs/f`
        let first = dir.path().join("one").join("a").join("docs");
        let second = dir.path().join("two").join("b").join("docs");
        let third = dir.path().join("three").join("a");
        for src in [&first, &second] {
            fs::create_dir_all(src).unwrap();
        }
        fs::create_dir_all(third.join("docs")).unwrap();
        fs::write(first.join("f"), b"first").unwrap();
        fs::write(third.join("docs").join("f"), b"third").unwrap();

        let scan = scan(&[first.clone(), second, third.clone()]).unwrap();

        assert_eq!(scan.files.len(), 1);
        assert_eq!(scan.files[0].path, first.join("f"));
        assert_eq!(scan.skipped.len(), 1);
        assert_eq!(scan.skipped[0].0, third.join("docs").join("f"));
    }

    #[test]
    fn test_no_sources_fails() {
        assert!(scan(&[]).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_not_followed_passes() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(dir.path().join("outside"), b"secret").unwrap();
        std::os::unix::fs::symlink(dir.path().join("outside"), src.join("link")).unwrap();

        let scan = scan(&[src]).unwrap();

        assert!(scan.files.is_empty());
    }
}
