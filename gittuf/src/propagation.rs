//! Cross-repository propagation: folding an upstream repository's
//! subtree into a downstream ref, as directed by root metadata.
//!
//! Each run fetches the upstream log and ref into a temporary
//! workspace under `refs/gittuf/tmp/`, removed on all exit paths, and
//! is idempotent: with no new upstream entry, nothing is committed.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::crypto::Signer;
use crate::git::Oid;
use crate::rsl;
use crate::storage::{self, FileMode, ReadRepository, TreeEntry, WriteRepository};
use crate::tuf::root::PropagationDirective;
use crate::{Cancel, RSL_REF};

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage: {0}")]
    Storage(#[from] storage::Error),
    #[error("rsl: {0}")]
    Rsl(#[from] rsl::Error),
    #[error("upstream `{0}` has no log")]
    UpstreamLogMissing(String),
    #[error("upstream `{0}` has no entry for `{1}`")]
    UpstreamEntryMissing(String, String),
    #[error("path `{0}` not found in upstream tree")]
    UpstreamPathMissing(String),
    #[error(transparent)]
    Cancelled(#[from] crate::Cancelled),
}

/// What one directive's run did.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// A new downstream commit and propagation entry were created.
    Propagated { entry: rsl::EntryAt },
    /// The newest upstream entry is already folded in.
    UpToDate,
}

struct TempRefs<'a, R: WriteRepository> {
    repo: &'a R,
    names: Vec<String>,
}

impl<R: WriteRepository> Drop for TempRefs<'_, R> {
    fn drop(&mut self) {
        for name in &self.names {
            if let Err(e) = self.repo.delete_ref(name) {
                if !e.is_not_found() {
                    log::warn!(target: "propagation", "Failed to remove {name}: {e}");
                }
            }
        }
    }
}

/// Run every directive in the applied policy.
pub fn propagate_all<R: WriteRepository>(
    repo: &R,
    directives: &[PropagationDirective],
    signer: Option<&dyn Signer>,
    cancel: &Cancel,
) -> Result<Vec<(String, Outcome)>, Error> {
    let mut outcomes = Vec::with_capacity(directives.len());

    for directive in directives {
        cancel.check()?;
        let outcome = propagate(repo, directive, signer)?;
        outcomes.push((directive.name.clone(), outcome));
    }
    Ok(outcomes)
}

/// Run one directive.
pub fn propagate<R: WriteRepository>(
    repo: &R,
    directive: &PropagationDirective,
    signer: Option<&dyn Signer>,
) -> Result<Outcome, Error> {
    let upstream_rsl_ref = format!("refs/gittuf/tmp/upstream/{}/rsl", directive.name);
    let upstream_tip_ref = format!("refs/gittuf/tmp/upstream/{}/ref", directive.name);
    let _guard = TempRefs {
        repo,
        names: vec![upstream_rsl_ref.clone(), upstream_tip_ref.clone()],
    };

    repo.fetch(
        &directive.upstream_repository,
        &[
            format!("+{}:{upstream_rsl_ref}", *RSL_REF),
            format!("+{}:{upstream_tip_ref}", directive.upstream_ref),
        ],
    )?;
    let upstream_head = repo
        .ref_oid(&upstream_rsl_ref)
        .map_err(|_| Error::UpstreamLogMissing(directive.upstream_repository.clone()))?;

    let upstream_entry = latest_upstream_entry(repo, upstream_head, &directive.upstream_ref)?
        .ok_or_else(|| {
            Error::UpstreamEntryMissing(
                directive.upstream_repository.clone(),
                directive.upstream_ref.clone(),
            )
        })?;

    // Already folded in?
    let propagated_ids = downstream_propagated_entries(repo, directive)?;
    if propagated_ids.contains(&upstream_entry.id) {
        log::debug!(
            target: "propagation",
            "Upstream entry {} already propagated for `{}`",
            upstream_entry.id,
            directive.name
        );
        return Ok(Outcome::UpToDate);
    }

    // Graft the upstream subtree into the downstream tree.
    let upstream_target = upstream_entry
        .target_id()
        .expect("reference entries have targets");
    let upstream_commit = repo.read_commit(repo.peel_to_commit(upstream_target)?)?;
    let subtree = tree_at_path(repo, upstream_commit.tree, &directive.upstream_path)?
        .ok_or_else(|| Error::UpstreamPathMissing(directive.upstream_path.clone()))?;

    let downstream_tip = repo.ref_oid(&directive.downstream_ref)?;
    let downstream_commit = repo.read_commit(downstream_tip)?;
    let new_tree = graft(repo, downstream_commit.tree, &directive.downstream_path, subtree)?;

    if new_tree == downstream_commit.tree {
        // The upstream entry is new but the content is identical.
        return Ok(Outcome::UpToDate);
    }

    let commit = repo.commit(
        new_tree,
        &[downstream_tip],
        &format!(
            "Propagate contents of {} into {}",
            directive.upstream_repository, directive.downstream_path
        ),
        signer,
    )?;
    repo.set_ref(&directive.downstream_ref, commit)?;

    let appended = rsl::append(
        repo,
        rsl::Entry::Propagation(rsl::PropagationEntry {
            ref_name: directive.downstream_ref.clone(),
            target_id: commit,
            upstream_repository: directive.upstream_repository.clone(),
            upstream_entry_id: upstream_entry.id,
            number: 0,
        }),
        signer,
        &rsl::AppendOptions::default(),
    )?;
    log::info!(
        target: "propagation",
        "Propagated upstream entry {} into {}",
        upstream_entry.id,
        directive.downstream_ref
    );

    match appended {
        rsl::Appended::Written(entry) => Ok(Outcome::Propagated { entry }),
        rsl::Appended::Unchanged { .. } => Ok(Outcome::UpToDate),
    }
}

/// The newest unskipped entry for `ref_name` in the upstream log
/// rooted at `head`.
fn latest_upstream_entry<R: ReadRepository>(
    repo: &R,
    head: Oid,
    ref_name: &str,
) -> Result<Option<rsl::EntryAt>, Error> {
    let mut skipped: BTreeSet<Oid> = BTreeSet::new();
    let mut cursor = Some(rsl::load(repo, head)?);

    while let Some(entry) = cursor {
        if let rsl::Entry::Annotation(a) = &entry.entry {
            if a.skip {
                skipped.extend(a.entry_ids.iter().copied());
            }
        } else if entry.ref_name() == Some(ref_name) && !skipped.contains(&entry.id) {
            return Ok(Some(entry));
        }
        cursor = rsl::parent_of(repo, entry.id)?;
    }
    Ok(None)
}

/// Upstream entry ids already referenced by downstream propagation
/// entries for this directive.
fn downstream_propagated_entries<R: ReadRepository>(
    repo: &R,
    directive: &PropagationDirective,
) -> Result<BTreeSet<Oid>, Error> {
    let mut ids = BTreeSet::new();
    let mut cursor = match rsl::latest(repo) {
        Ok(entry) => Some(entry),
        Err(rsl::Error::Empty) => None,
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = cursor {
        if let rsl::Entry::Propagation(p) = &entry.entry {
            if p.ref_name == directive.downstream_ref
                && p.upstream_repository == directive.upstream_repository
            {
                ids.insert(p.upstream_entry_id);
            }
        }
        cursor = rsl::parent_of(repo, entry.id)?;
    }
    Ok(ids)
}

/// Resolve a `/`-separated path inside a tree. An empty path is the
/// tree itself.
fn tree_at_path<R: ReadRepository>(
    repo: &R,
    tree: Oid,
    path: &str,
) -> Result<Option<Oid>, Error> {
    if path.is_empty() {
        return Ok(Some(tree));
    }
    let mut current = tree;

    for component in path.split('/') {
        let entries = repo.read_tree(current)?;
        match entries
            .iter()
            .find(|e| e.name == component && e.mode == FileMode::Tree)
        {
            Some(entry) => current = entry.id,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// A copy of `base` with the subtree at `path` replaced by `subtree`,
/// creating intermediate trees as needed.
fn graft<R: WriteRepository>(
    repo: &R,
    base: Oid,
    path: &str,
    subtree: Oid,
) -> Result<Oid, Error> {
    let Some((head, rest)) = path.split_once('/') else {
        return splice(repo, base, path, subtree);
    };
    let entries = repo.read_tree(base)?;
    let nested_base = entries
        .iter()
        .find(|e| e.name == head && e.mode == FileMode::Tree)
        .map(|e| e.id);
    let nested = match nested_base {
        Some(nested) => graft(repo, nested, rest, subtree)?,
        None => {
            let empty = repo.write_tree(&[])?;
            graft(repo, empty, rest, subtree)?
        }
    };
    splice(repo, base, head, nested)
}

fn splice<R: WriteRepository>(
    repo: &R,
    base: Oid,
    name: &str,
    subtree: Oid,
) -> Result<Oid, Error> {
    let mut entries: Vec<TreeEntry> = repo
        .read_tree(base)?
        .into_iter()
        .filter(|e| e.name != name)
        .collect();

    entries.push(TreeEntry {
        name: name.to_owned(),
        mode: FileMode::Tree,
        id: subtree,
    });
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    repo.write_tree(&entries).map_err(Error::from)
}
