//! `forget` subcommand
use std::sync::Arc;

use chrono::Duration;
use derive_setters::Setters;
use log::info;
use serde_derive::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none, DisplayFromStr};

use crate::{
    crypto::CryptoKey,
    progress::ProgressBars,
    repofile::{Fileset, FilesetVersion},
    repository::Repository,
    VaultResult,
};

#[cfg_attr(feature = "clap", derive(clap::Parser))]
#[skip_serializing_none]
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize, Setters)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
#[setters(into, strip_option)]
#[non_exhaustive]
/// Options which filesets should be kept. The newest fileset is always kept.
pub struct KeepOptions {
    /// Keep the last N filesets
    #[cfg_attr(feature = "clap", clap(long, short = 'l', value_name = "N"))]
    pub keep_last: Option<usize>,

    /// Keep filesets newer than DURATION relative to the latest fileset
    #[cfg_attr(feature = "clap", clap(long, value_name = "DURATION"))]
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub keep_within: Option<humantime::Duration>,
}

/// Which filesets are kept and which are pruned
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ForgetPlan {
    /// Versions to keep, newest first
    pub keep: Vec<FilesetVersion>,
    /// Versions to prune, newest first
    pub remove: Vec<FilesetVersion>,
}

impl KeepOptions {
    /// Whether any keep option is set
    #[must_use]
    pub const fn is_set(&self) -> bool {
        self.keep_last.is_some() || self.keep_within.is_some()
    }

    /// Decide which of the given filesets to keep.
    ///
    /// Without any keep option nothing is removed.
    #[must_use]
    pub fn plan(&self, filesets: &[Arc<Fileset>]) -> ForgetPlan {
        let mut sorted: Vec<_> = filesets.iter().collect();
        sorted.sort_unstable_by(|a, b| b.time.cmp(&a.time).then(b.version.cmp(&a.version)));

        let Some(latest) = sorted.first().map(|fileset| fileset.time) else {
            return ForgetPlan::default();
        };
        let within = self
            .keep_within
            .as_ref()
            .and_then(|d| Duration::from_std(**d).ok())
            .map(|d| latest - d);

        let mut plan = ForgetPlan::default();
        for (idx, fileset) in sorted.into_iter().enumerate() {
            let keep = !self.is_set()
                || idx == 0
                || self.keep_last.is_some_and(|n| idx < n)
                || within.is_some_and(|limit| fileset.time >= limit);
            if keep {
                plan.keep.push(fileset.version);
            } else {
                plan.remove.push(fileset.version);
            }
        }
        plan
    }
}

/// Prune all filesets not kept by `opts` and persist the repository state.
///
/// # Errors
///
/// * [`CommandErrorKind::WriterBusy`](crate::error::CommandErrorKind::WriterBusy) - If another writer is active
/// * If a fileset could not be pruned; earlier ones stay pruned
/// * If the repository state could not be saved
pub(crate) fn forget<C: CryptoKey, P: ProgressBars>(
    repo: &Repository<C, P>,
    opts: &KeepOptions,
) -> VaultResult<ForgetPlan> {
    let _guard = repo.writer_guard()?;
    let filesets: Vec<_> = repo
        .filesets
        .list_versions()
        .into_iter()
        .map(|version| repo.filesets.get(version))
        .collect::<VaultResult<_>>()?;

    let plan = opts.plan(&filesets);
    let p = repo.pb.progress_counter("removing filesets...");
    p.set_length(plan.remove.len() as u64);
    let res = plan.remove.iter().try_for_each(|version| -> VaultResult<()> {
        _ = repo.prune_fileset(*version)?;
        p.inc(1);
        Ok(())
    });
    p.finish();
    repo.persist()?;
    res?;

    info!(
        "kept {} filesets, removed {}",
        plan.keep.len(),
        plan.remove.len()
    );
    Ok(plan)
}
