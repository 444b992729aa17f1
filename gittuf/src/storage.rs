//! Object-store adapter contract.
//!
//! The verification core reads and writes Git objects only through
//! these traits. The `git2`-backed implementation lives in
//! [`git`](crate::storage::git); everything above it is backend
//! agnostic.

pub mod git;

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use thiserror::Error;

use crate::crypto::{Signer, SignerError};
use crate::git::Oid;

#[derive(Debug, Error)]
pub enum Error {
    #[error("git: {0}")]
    Git(#[from] git2::Error),
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("object `{0}` not found")]
    NotFound(Oid),
    #[error("reference `{0}` not found")]
    RefNotFound(String),
    #[error("path `{0}` not found in tree")]
    PathNotFound(String),
    #[error("merge of {ours} and {theirs} has conflicts")]
    MergeConflict { ours: Oid, theirs: Oid },
    #[error("object `{0}` has unexpected type")]
    UnexpectedType(Oid),
    #[error("signer: {0}")]
    Signer(#[from] SignerError),
}

impl Error {
    /// Whether this error is caused by an object or reference not being found.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) | Self::RefNotFound(_) | Self::PathNotFound(_) => true,
            Self::Git(e) => crate::git::is_not_found_err(e),
            _ => false,
        }
    }
}

/// Object type, as far as the core cares.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
    Tag,
}

/// Mode of a tree entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileMode {
    Blob,
    Tree,
}

impl FileMode {
    pub fn bits(&self) -> i32 {
        match self {
            Self::Blob => 0o100_644,
            Self::Tree => 0o040_000,
        }
    }
}

/// One entry of a tree object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub mode: FileMode,
    pub id: Oid,
}

/// A commit's signature, detached from the signed content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSignature {
    pub signature: Vec<u8>,
    pub signed_data: Vec<u8>,
}

/// An owned view of a commit object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub id: Oid,
    pub tree: Oid,
    pub parents: Vec<Oid>,
    pub author: String,
    pub committer: String,
    pub message: String,
    pub signature: Option<CommitSignature>,
}

pub trait ReadRepository {
    fn path(&self) -> &Path;
    fn read_blob(&self, id: Oid) -> Result<Vec<u8>, Error>;
    /// Read the blob at `path` inside the given commit's tree.
    fn blob_at(&self, commit: Oid, path: &Path) -> Result<Vec<u8>, Error>;
    fn read_tree(&self, id: Oid) -> Result<Vec<TreeEntry>, Error>;
    fn read_commit(&self, id: Oid) -> Result<Commit, Error>;
    fn ref_oid(&self, name: &str) -> Result<Oid, Error>;
    fn object_kind(&self, id: Oid) -> Result<ObjectKind, Error>;
    /// Resolve tags down to the commit they point at.
    fn peel_to_commit(&self, id: Oid) -> Result<Oid, Error>;
    /// Whether `ancestor` is reachable from `descendant`.
    fn knows_commit(&self, ancestor: Oid, descendant: Oid) -> Result<bool, Error>;
    fn common_ancestor(&self, a: Oid, b: Oid) -> Result<Oid, Error>;
    /// Deterministic three-way merge of two commits' trees over their
    /// common ancestor. Conflicts are an error, never a default.
    fn merge_tree(&self, ours: Oid, theirs: Oid) -> Result<Oid, Error>;
}

pub trait WriteRepository: ReadRepository {
    fn write_blob(&self, bytes: &[u8]) -> Result<Oid, Error>;
    fn write_tree(&self, entries: &[TreeEntry]) -> Result<Oid, Error>;
    fn commit(
        &self,
        tree: Oid,
        parents: &[Oid],
        message: &str,
        signer: Option<&dyn Signer>,
    ) -> Result<Oid, Error>;
    fn set_ref(&self, name: &str, id: Oid) -> Result<(), Error>;
    fn delete_ref(&self, name: &str) -> Result<(), Error>;
    fn fetch(&self, remote: &str, refspecs: &[String]) -> Result<(), Error>;
    fn push(&self, remote: &str, refspecs: &[String]) -> Result<(), Error>;
    /// Escape hatch to the backing repository.
    fn raw(&self) -> &git2::Repository;
}

/// Content id a blob would have in the object store, without writing it.
pub fn blob_id(bytes: &[u8]) -> Result<Oid, git2::Error> {
    git2::Oid::hash_object(git2::ObjectType::Blob, bytes).map(Oid::from)
}

/// Write a tree from `path → blob id` leaves, creating intermediate
/// trees for `/`-separated path components.
pub fn write_nested_tree<R: WriteRepository>(
    repo: &R,
    leaves: &BTreeMap<String, Oid>,
) -> Result<Oid, Error> {
    let mut files = Vec::new();
    let mut subdirs: BTreeMap<String, BTreeMap<String, Oid>> = BTreeMap::new();

    for (path, id) in leaves {
        match path.split_once('/') {
            None => files.push(TreeEntry {
                name: path.clone(),
                mode: FileMode::Blob,
                id: *id,
            }),
            Some((dir, rest)) => {
                subdirs
                    .entry(dir.to_owned())
                    .or_default()
                    .insert(rest.to_owned(), *id);
            }
        }
    }
    for (name, entries) in subdirs {
        let id = write_nested_tree(repo, &entries)?;
        files.push(TreeEntry {
            name,
            mode: FileMode::Tree,
            id,
        });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));

    repo.write_tree(&files)
}

/// Read a tree recursively into `path → blob id` leaves.
pub fn read_nested_tree<R: ReadRepository>(
    repo: &R,
    tree: Oid,
) -> Result<BTreeMap<String, Oid>, Error> {
    let mut leaves = BTreeMap::new();

    for entry in repo.read_tree(tree)? {
        match entry.mode {
            FileMode::Blob => {
                leaves.insert(entry.name, entry.id);
            }
            FileMode::Tree => {
                for (path, id) in read_nested_tree(repo, entry.id)? {
                    leaves.insert(format!("{}/{path}", entry.name), id);
                }
            }
        }
    }
    Ok(leaves)
}
