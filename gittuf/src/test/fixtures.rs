//! Repository fixtures for tests.

use tempfile::TempDir;

use crate::git::Oid;
use crate::storage::git::Repository;
use crate::storage::{FileMode, TreeEntry, WriteRepository as _};

/// A fresh repository in a temporary directory. Keep the [`TempDir`]
/// in scope for as long as the repository is used.
pub fn repository() -> (Repository, TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let repo = Repository::create_bare(tmp.path().join("repo.git")).unwrap();

    (repo, tmp)
}

/// A bare repository usable as a fetch/push remote for another
/// fixture repository.
pub fn bare_repository() -> (Repository, TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let repo = Repository::create_bare(tmp.path().join("remote.git")).unwrap();

    (repo, tmp)
}

/// Write a tree of `(name, content)` blobs.
pub fn tree(repo: &Repository, files: &[(&str, &[u8])]) -> Oid {
    let mut entries = Vec::with_capacity(files.len());

    for (name, content) in files {
        entries.push(TreeEntry {
            name: (*name).to_owned(),
            mode: FileMode::Blob,
            id: repo.write_blob(content).unwrap(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    repo.write_tree(&entries).unwrap()
}

/// Commit a single `file.txt` with the given content onto `ref_name`.
pub fn commit(repo: &Repository, ref_name: &str, content: &[u8], parents: &[Oid]) -> Oid {
    let tree = tree(repo, &[("file.txt", content)]);
    let commit = repo
        .commit(tree, parents, &format!("commit {ref_name}"), None)
        .unwrap();

    repo.set_ref(ref_name, commit).unwrap();
    commit
}

/// A deterministic object id built from one byte, for wire-format
/// tests that never touch an object store.
pub fn oid(byte: u8) -> Oid {
    format!("{byte:02x}").repeat(20).parse().unwrap()
}
