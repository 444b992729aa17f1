//! Local/remote RSL convergence.
//!
//! The local and remote logs are compared by commit ancestry. A
//! strictly newer side wins wholesale; genuinely divergent logs are
//! reconciled by replaying local-only entries on top of the remote
//! head, provided the two sides touched disjoint refs. Remote-only
//! entries drive local ref updates, fast-forward only unless the
//! caller explicitly lets the remote win.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::git::Oid;
use crate::rsl;
use crate::storage::{self, ObjectKind, ReadRepository, WriteRepository};
use crate::{Cancel, RSL_REF};

/// Where the remote log is fetched for comparison. Removed on all exit
/// paths.
const REMOTE_RSL_REF: &str = "refs/gittuf/tmp/remote-rsl";

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage: {0}")]
    Storage(#[from] storage::Error),
    #[error("rsl: {0}")]
    Rsl(#[from] rsl::Error),
    #[error("local and remote logs both update: {}", refs.join(", "))]
    Diverged { refs: Vec<String> },
    #[error("nothing to reconcile: neither side has a log")]
    NoLog,
    #[error(transparent)]
    Cancelled(#[from] crate::Cancelled),
}

/// What [`reconcile`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    UpToDate,
    FastForwarded,
    Pushed,
    Reconciled,
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub action: Action,
    /// Local refs moved to the remote-recorded state.
    pub updated_refs: Vec<String>,
    /// Local refs whose tips do not converge with the remote log. The
    /// caller decides whether to overwrite, reconcile by hand, or
    /// abort.
    pub diverged_refs: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct SyncOptions {
    /// Let the remote state win for refs that diverged.
    pub overwrite_local_refs: bool,
    pub cancel: Cancel,
}

/// Removes the temporary fetch ref when dropped.
struct TempRef<'a, R: WriteRepository> {
    repo: &'a R,
    name: &'static str,
}

impl<R: WriteRepository> Drop for TempRef<'_, R> {
    fn drop(&mut self) {
        if let Err(e) = self.repo.delete_ref(self.name) {
            if !e.is_not_found() {
                log::warn!(target: "sync", "Failed to remove {}: {e}", self.name);
            }
        }
    }
}

/// Bring the local log and the remote log into agreement.
pub fn reconcile<R: WriteRepository>(
    repo: &R,
    remote: &str,
    opts: &SyncOptions,
) -> Result<SyncReport, Error> {
    opts.cancel.check()?;

    let fetched = repo.fetch(
        remote,
        &[format!("+{}:{REMOTE_RSL_REF}", *RSL_REF)],
        );
    let _guard = TempRef {
        repo,
        name: REMOTE_RSL_REF,
    };
    let remote_head = match fetched {
        Ok(()) => match repo.ref_oid(REMOTE_RSL_REF) {
            Ok(head) => Some(head),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        },
        // A remote without the ref shows up as a fetch error with some
        // transports and as a missing ref with others.
        Err(_) => None,
    };
    let local_head = match rsl::latest(repo) {
        Ok(entry) => Some(entry.id),
        Err(rsl::Error::Empty) => None,
        Err(e) => return Err(e.into()),
    };

    match (local_head, remote_head) {
        (None, None) => Err(Error::NoLog),
        (Some(_), None) => {
            // Remote has no log: everything local is new.
            push_log(repo, remote, None)?;
            Ok(SyncReport {
                action: Action::Pushed,
                updated_refs: Vec::new(),
                diverged_refs: Vec::new(),
            })
        }
        (None, Some(remote_head)) => {
            repo.set_ref(&RSL_REF, remote_head)?;
            let (updated, diverged) =
                update_local_refs(repo, remote, remote_head, None, opts)?;
            Ok(SyncReport {
                action: Action::FastForwarded,
                updated_refs: updated,
                diverged_refs: diverged,
            })
        }
        (Some(local), Some(remote_head)) if local == remote_head => Ok(SyncReport {
            action: Action::UpToDate,
            updated_refs: Vec::new(),
            diverged_refs: Vec::new(),
        }),
        (Some(local), Some(remote_head)) => {
            if repo.knows_commit(local, remote_head)? {
                // Remote strictly ahead.
                repo.set_ref(&RSL_REF, remote_head)?;
                let (updated, diverged) =
                    update_local_refs(repo, remote, remote_head, Some(local), opts)?;
                return Ok(SyncReport {
                    action: Action::FastForwarded,
                    updated_refs: updated,
                    diverged_refs: diverged,
                });
            }
            if repo.knows_commit(remote_head, local)? {
                // Local strictly ahead.
                push_log(repo, remote, Some(remote_head))?;
                return Ok(SyncReport {
                    action: Action::Pushed,
                    updated_refs: Vec::new(),
                    diverged_refs: Vec::new(),
                });
            }
            reconcile_diverged(repo, remote, local, remote_head, opts)
        }
    }
}

/// Entries from `head` down to, but excluding, `stop`.
fn entries_above<R: ReadRepository>(
    repo: &R,
    head: Oid,
    stop: Oid,
) -> Result<Vec<rsl::EntryAt>, Error> {
    let mut entries = rsl::iterate_until(repo, head, stop)?;
    entries.pop();
    Ok(entries)
}

fn touched_refs(entries: &[rsl::EntryAt]) -> BTreeSet<String> {
    entries
        .iter()
        .filter_map(|e| e.ref_name().map(str::to_owned))
        .collect()
}

fn reconcile_diverged<R: WriteRepository>(
    repo: &R,
    remote: &str,
    local_head: Oid,
    remote_head: Oid,
    opts: &SyncOptions,
) -> Result<SyncReport, Error> {
    opts.cancel.check()?;

    let ancestor = repo.common_ancestor(local_head, remote_head)?;
    let local_only = entries_above(repo, local_head, ancestor)?;
    let remote_only = entries_above(repo, remote_head, ancestor)?;

    let local_refs = touched_refs(&local_only);
    let remote_refs = touched_refs(&remote_only);
    let conflicting: Vec<String> = local_refs.intersection(&remote_refs).cloned().collect();

    if !conflicting.is_empty() && !opts.overwrite_local_refs {
        return Err(Error::Diverged { refs: conflicting });
    }

    log::info!(
        target: "sync",
        "Replaying {} local entries on top of remote head {remote_head}",
        local_only.len()
    );

    // Remote wins: reset the log, then re-commit local-only entries as
    // children of the remote head, oldest first, recomputing numbers.
    // Annotations referencing re-committed entries are remapped to the
    // new ids.
    repo.set_ref(&RSL_REF, remote_head)?;
    let mut remapped: BTreeMap<Oid, Oid> = BTreeMap::new();

    for old in local_only.iter().rev() {
        opts.cancel.check()?;
        // Entries for refs the remote also updated are dropped; the
        // caller asked for the remote state.
        if let Some(ref_name) = old.ref_name() {
            if conflicting.iter().any(|c| c == ref_name) {
                log::warn!(
                    target: "sync",
                    "Dropping local entry {} for overwritten ref {ref_name}",
                    old.id
                );
                continue;
            }
        }
        let mut entry = old.entry.clone();
        if let rsl::Entry::Annotation(annotation) = &mut entry {
            for id in annotation.entry_ids.iter_mut() {
                if let Some(new_id) = remapped.get(id) {
                    *id = *new_id;
                }
            }
        }
        let appended = rsl::append(
            repo,
            entry,
            None,
            &rsl::AppendOptions {
                skip_check_for_duplicate: true,
            },
        )?;
        if let rsl::Appended::Written(new) = appended {
            remapped.insert(old.id, new.id);
        }
    }

    let (updated_refs, diverged_refs) =
        update_local_refs(repo, remote, remote_head, Some(ancestor), opts)?;
    push_log(repo, remote, Some(remote_head))?;

    Ok(SyncReport {
        action: Action::Reconciled,
        updated_refs,
        diverged_refs,
    })
}

/// Fetch and update local refs touched by remote entries between
/// `stop` (exclusive) and `remote_head`. Commit refs fast-forward;
/// anything else must match exactly or is reported as diverged.
fn update_local_refs<R: WriteRepository>(
    repo: &R,
    remote: &str,
    remote_head: Oid,
    stop: Option<Oid>,
    opts: &SyncOptions,
) -> Result<(Vec<String>, Vec<String>), Error> {
    let entries = match stop {
        Some(stop) => entries_above(repo, remote_head, stop)?,
        None => rsl::iterate_until(repo, remote_head, rsl::first(repo)?.id)?,
    };

    // Newest entry per ref wins.
    let mut targets: BTreeMap<String, Oid> = BTreeMap::new();
    for entry in &entries {
        if let (Some(ref_name), Some(target)) = (entry.ref_name(), entry.target_id()) {
            targets.entry(ref_name.to_owned()).or_insert(target);
        }
    }
    if targets.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }

    // Make sure the objects behind those refs are present locally.
    let refspecs: Vec<String> = targets
        .keys()
        .filter(|name| !name.starts_with("refs/gittuf/tmp/"))
        .map(|name| format!("+{name}:refs/gittuf/tmp/fetch/{}", crate::attestations::escape_ref(name)))
        .collect();
    if !refspecs.is_empty() {
        if let Err(e) = repo.fetch(remote, &refspecs) {
            log::warn!(target: "sync", "Fetching updated refs failed: {e}");
        }
        for name in targets.keys() {
            let tmp = format!(
                "refs/gittuf/tmp/fetch/{}",
                crate::attestations::escape_ref(name)
            );
            let _ = repo.delete_ref(&tmp);
        }
    }

    let mut updated = Vec::new();
    let mut diverged = Vec::new();

    for (name, target) in targets {
        opts.cancel.check()?;
        let local = match repo.ref_oid(&name) {
            Ok(tip) => Some(tip),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };
        let acceptable = match local {
            None => true,
            Some(tip) if tip == target => {
                continue;
            }
            Some(tip) => match repo.object_kind(target) {
                Ok(ObjectKind::Commit) => repo.knows_commit(tip, target)?,
                Ok(_) => false,
                Err(e) if e.is_not_found() => false,
                Err(e) => return Err(e.into()),
            },
        };
        if acceptable || opts.overwrite_local_refs {
            match repo.object_kind(target) {
                Ok(_) => {
                    repo.set_ref(&name, target)?;
                    updated.push(name);
                }
                Err(e) if e.is_not_found() => {
                    log::warn!(target: "sync", "Remote objects for {name} are unavailable");
                    diverged.push(name);
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            diverged.push(name);
        }
    }
    Ok((updated, diverged))
}

/// Push the log and every ref it updates beyond `remote_head`.
fn push_log<R: WriteRepository>(
    repo: &R,
    remote: &str,
    remote_head: Option<Oid>,
) -> Result<(), Error> {
    let local_head = rsl::latest(repo)?.id;
    let entries = match remote_head {
        Some(stop) => entries_above(repo, local_head, stop)?,
        None => rsl::iterate_until(repo, local_head, rsl::first(repo)?.id)?,
    };
    let mut refspecs = vec![format!("{}:{}", *RSL_REF, *RSL_REF)];

    for name in touched_refs(&entries) {
        if repo.ref_oid(&name).is_ok() {
            refspecs.push(format!("{name}:{name}"));
        }
    }
    log::info!(target: "sync", "Pushing {} refs to {remote}", refspecs.len());
    repo.push(remote, &refspecs)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::rsl::AppendOptions;
    use crate::test::fixtures;

    /// A local repository whose log shares `shared` entries with the
    /// bare remote, created by recording `refs/heads/shared`.
    fn pair() -> (
        crate::storage::git::Repository,
        tempfile::TempDir,
        crate::storage::git::Repository,
        tempfile::TempDir,
        String,
    ) {
        let (local, local_tmp) = fixtures::repository();
        let (remote, remote_tmp) = fixtures::bare_repository();
        let url = remote.path().display().to_string();

        // A shared base entry on both sides.
        fixtures::commit(&local, "refs/heads/shared", b"shared", &[]);
        rsl::record(&local, "refs/heads/shared", None, &AppendOptions::default()).unwrap();
        local
            .push(
                &url,
                &[
                    format!("{}:{}", *RSL_REF, *RSL_REF),
                    "refs/heads/shared:refs/heads/shared".to_owned(),
                ],
            )
            .unwrap();

        (local, local_tmp, remote, remote_tmp, url)
    }

    #[test]
    fn test_up_to_date() {
        let (local, _lt, _remote, _rt, url) = pair();
        let report = reconcile(&local, &url, &SyncOptions::default()).unwrap();

        assert_eq!(report.action, Action::UpToDate);
    }

    #[test]
    fn test_remote_ahead_fast_forwards() {
        let (local, _lt, remote, _rt, url) = pair();

        // The remote gains an entry for main.
        let commit = fixtures::commit(&remote, "refs/heads/main", b"remote", &[]);
        rsl::record(&remote, "refs/heads/main", None, &AppendOptions::default()).unwrap();

        let report = reconcile(&local, &url, &SyncOptions::default()).unwrap();
        assert_eq!(report.action, Action::FastForwarded);
        assert_eq!(report.updated_refs, vec!["refs/heads/main".to_owned()]);
        assert_eq!(local.ref_oid("refs/heads/main").unwrap(), commit);
        assert_eq!(
            rsl::latest(&local).unwrap().id,
            rsl::latest(&remote).unwrap().id
        );
    }

    #[test]
    fn test_local_ahead_pushes() {
        let (local, _lt, remote, _rt, url) = pair();

        let commit = fixtures::commit(&local, "refs/heads/main", b"local", &[]);
        rsl::record(&local, "refs/heads/main", None, &AppendOptions::default()).unwrap();

        let report = reconcile(&local, &url, &SyncOptions::default()).unwrap();
        assert_eq!(report.action, Action::Pushed);
        assert_eq!(
            rsl::latest(&remote).unwrap().id,
            rsl::latest(&local).unwrap().id
        );
        assert_eq!(remote.ref_oid("refs/heads/main").unwrap(), commit);
    }

    #[test]
    fn test_divergence_disjoint_refs_reconciles() {
        let (local, _lt, remote, _rt, url) = pair();

        // Remote records main; local records feature.
        fixtures::commit(&remote, "refs/heads/main", b"remote", &[]);
        rsl::record(&remote, "refs/heads/main", None, &AppendOptions::default()).unwrap();

        fixtures::commit(&local, "refs/heads/feature", b"local", &[]);
        let feature_entry =
            rsl::record(&local, "refs/heads/feature", None, &AppendOptions::default())
                .unwrap()
                .entry()
                .clone();

        let report = reconcile(&local, &url, &SyncOptions::default()).unwrap();
        assert_eq!(report.action, Action::Reconciled);

        // Both entries survive; the replayed feature entry got a fresh
        // number above the remote head.
        let latest = rsl::latest(&local).unwrap();
        assert_eq!(latest.ref_name(), Some("refs/heads/feature"));
        assert_ne!(latest.id, feature_entry.id);
        assert_eq!(latest.number(), 3);

        let parent = rsl::parent_of(&local, latest.id).unwrap().unwrap();
        assert_eq!(parent.ref_name(), Some("refs/heads/main"));

        // The remote received the reconciled log.
        assert_eq!(rsl::latest(&remote).unwrap().id, latest.id);
    }

    #[test]
    fn test_divergence_same_ref_conflicts() {
        let (local, _lt, remote, _rt, url) = pair();

        let base = local.ref_oid("refs/heads/shared").unwrap();
        fixtures::commit(&remote, "refs/heads/main", b"remote", &[]);
        rsl::record(&remote, "refs/heads/main", None, &AppendOptions::default()).unwrap();

        fixtures::commit(&local, "refs/heads/main", b"local", &[base]);
        rsl::record(&local, "refs/heads/main", None, &AppendOptions::default()).unwrap();

        let err = reconcile(&local, &url, &SyncOptions::default()).unwrap_err();
        match err {
            Error::Diverged { refs } => {
                assert_eq!(refs, vec!["refs/heads/main".to_owned()])
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // With the override, the remote state wins.
        let remote_main = remote.ref_oid("refs/heads/main").unwrap();
        let report = reconcile(
            &local,
            &url,
            &SyncOptions {
                overwrite_local_refs: true,
                ..SyncOptions::default()
            },
        )
        .unwrap();
        assert_eq!(report.action, Action::Reconciled);
        assert_eq!(local.ref_oid("refs/heads/main").unwrap(), remote_main);
        assert_eq!(
            rsl::latest(&local).unwrap().ref_name(),
            Some("refs/heads/main")
        );
    }
}
