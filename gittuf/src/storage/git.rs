//! Git implementation of the object-store adapter, using the `git2` crate.

use std::path::{Path, PathBuf};

use crate::crypto::Signer;
use crate::git::{is_not_found_err, Oid};
use crate::storage::{
    Commit, CommitSignature, Error, FileMode, ObjectKind, ReadRepository, TreeEntry,
    WriteRepository,
};

/// Name and email used for commits minted by this crate.
#[derive(Debug, Clone)]
pub struct UserInfo {
    pub name: String,
    pub email: String,
}

impl Default for UserInfo {
    fn default() -> Self {
        Self {
            name: "gittuf".to_owned(),
            email: "gittuf@localhost".to_owned(),
        }
    }
}

/// A repository on disk.
pub struct Repository {
    /// The backing Git repository.
    pub backend: git2::Repository,
    path: PathBuf,
    info: UserInfo,
}

impl Repository {
    /// Open an existing repository at or above the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let backend = git2::Repository::discover(path.as_ref())?;
        let info = Self::user_info(&backend);
        let path = backend.path().to_path_buf();

        Ok(Self {
            backend,
            path,
            info,
        })
    }

    /// Create a new bare repository.
    pub fn create_bare<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let backend = git2::Repository::init_bare(path.as_ref())?;
        let info = Self::user_info(&backend);
        let path = backend.path().to_path_buf();

        Ok(Self {
            backend,
            path,
            info,
        })
    }

    fn user_info(backend: &git2::Repository) -> UserInfo {
        let defaults = UserInfo::default();
        let config = match backend.config() {
            Ok(config) => config,
            Err(_) => return defaults,
        };
        UserInfo {
            name: config
                .get_string("user.name")
                .unwrap_or(defaults.name),
            email: config
                .get_string("user.email")
                .unwrap_or(defaults.email),
        }
    }

    fn committer(&self) -> Result<git2::Signature<'static>, Error> {
        git2::Signature::now(&self.info.name, &self.info.email).map_err(Error::from)
    }

    fn not_found(err: git2::Error, id: Oid) -> Error {
        if is_not_found_err(&err) {
            Error::NotFound(id)
        } else {
            Error::Git(err)
        }
    }
}

impl ReadRepository for Repository {
    fn path(&self) -> &Path {
        self.path.as_path()
    }

    fn read_blob(&self, id: Oid) -> Result<Vec<u8>, Error> {
        let blob = self
            .backend
            .find_blob(*id)
            .map_err(|e| Self::not_found(e, id))?;

        Ok(blob.content().to_vec())
    }

    fn blob_at(&self, commit: Oid, path: &Path) -> Result<Vec<u8>, Error> {
        let commit = self
            .backend
            .find_commit(*commit)
            .map_err(|e| Self::not_found(e, commit))?;
        let tree = commit.tree()?;
        let entry = tree
            .get_path(path)
            .map_err(|e| {
                if is_not_found_err(&e) {
                    Error::PathNotFound(path.display().to_string())
                } else {
                    Error::Git(e)
                }
            })?;
        let blob = entry
            .to_object(&self.backend)?
            .into_blob()
            .map_err(|_| Error::UnexpectedType(entry.id().into()))?;

        Ok(blob.content().to_vec())
    }

    fn read_tree(&self, id: Oid) -> Result<Vec<TreeEntry>, Error> {
        let tree = self
            .backend
            .find_tree(*id)
            .map_err(|e| Self::not_found(e, id))?;
        let mut entries = Vec::with_capacity(tree.len());

        for entry in tree.iter() {
            let name = entry
                .name()
                .ok_or_else(|| Error::UnexpectedType(entry.id().into()))?
                .to_owned();
            let mode = if entry.filemode() == FileMode::Tree.bits() {
                FileMode::Tree
            } else {
                FileMode::Blob
            };
            entries.push(TreeEntry {
                name,
                mode,
                id: entry.id().into(),
            });
        }
        Ok(entries)
    }

    fn read_commit(&self, id: Oid) -> Result<Commit, Error> {
        let commit = self
            .backend
            .find_commit(*id)
            .map_err(|e| Self::not_found(e, id))?;
        let signature = match self.backend.extract_signature(&id, None) {
            Ok((sig, data)) => Some(CommitSignature {
                signature: sig.to_vec(),
                signed_data: data.to_vec(),
            }),
            Err(e) if is_not_found_err(&e) => None,
            Err(e) => return Err(e.into()),
        };

        let author = commit.author().to_string();
        let committer = commit.committer().to_string();
        let message = commit.message().unwrap_or_default().to_owned();

        Ok(Commit {
            id,
            tree: commit.tree_id().into(),
            parents: commit.parent_ids().map(Oid::from).collect(),
            author,
            committer,
            message,
            signature,
        })
    }

    fn ref_oid(&self, name: &str) -> Result<Oid, Error> {
        self.backend
            .refname_to_id(name)
            .map(Oid::from)
            .map_err(|e| {
                if is_not_found_err(&e) {
                    Error::RefNotFound(name.to_owned())
                } else {
                    Error::Git(e)
                }
            })
    }

    fn object_kind(&self, id: Oid) -> Result<ObjectKind, Error> {
        let object = self
            .backend
            .find_object(*id, None)
            .map_err(|e| Self::not_found(e, id))?;

        match object.kind() {
            Some(git2::ObjectType::Blob) => Ok(ObjectKind::Blob),
            Some(git2::ObjectType::Tree) => Ok(ObjectKind::Tree),
            Some(git2::ObjectType::Commit) => Ok(ObjectKind::Commit),
            Some(git2::ObjectType::Tag) => Ok(ObjectKind::Tag),
            _ => Err(Error::UnexpectedType(id)),
        }
    }

    fn peel_to_commit(&self, id: Oid) -> Result<Oid, Error> {
        let object = self
            .backend
            .find_object(*id, None)
            .map_err(|e| Self::not_found(e, id))?;
        let commit = object
            .peel(git2::ObjectType::Commit)
            .map_err(|_| Error::UnexpectedType(id))?;

        Ok(commit.id().into())
    }

    fn knows_commit(&self, ancestor: Oid, descendant: Oid) -> Result<bool, Error> {
        if ancestor == descendant {
            return Ok(true);
        }
        self.backend
            .graph_descendant_of(*descendant, *ancestor)
            .map_err(Error::from)
    }

    fn common_ancestor(&self, a: Oid, b: Oid) -> Result<Oid, Error> {
        self.backend
            .merge_base(*a, *b)
            .map(Oid::from)
            .map_err(Error::from)
    }

    fn merge_tree(&self, ours: Oid, theirs: Oid) -> Result<Oid, Error> {
        let our_commit = self
            .backend
            .find_commit(*ours)
            .map_err(|e| Self::not_found(e, ours))?;
        let their_commit = self
            .backend
            .find_commit(*theirs)
            .map_err(|e| Self::not_found(e, theirs))?;
        let mut index = self
            .backend
            .merge_commits(&our_commit, &their_commit, None)?;

        if index.has_conflicts() {
            return Err(Error::MergeConflict { ours, theirs });
        }
        let tree = index.write_tree_to(&self.backend)?;

        Ok(tree.into())
    }
}

impl WriteRepository for Repository {
    fn write_blob(&self, bytes: &[u8]) -> Result<Oid, Error> {
        self.backend.blob(bytes).map(Oid::from).map_err(Error::from)
    }

    fn write_tree(&self, entries: &[TreeEntry]) -> Result<Oid, Error> {
        let mut builder = self.backend.treebuilder(None)?;

        for entry in entries {
            builder.insert(entry.name.as_str(), *entry.id, entry.mode.bits())?;
        }
        builder.write().map(Oid::from).map_err(Error::from)
    }

    fn commit(
        &self,
        tree: Oid,
        parents: &[Oid],
        message: &str,
        signer: Option<&dyn Signer>,
    ) -> Result<Oid, Error> {
        let tree = self
            .backend
            .find_tree(*tree)
            .map_err(|e| Self::not_found(e, tree))?;
        let parents = parents
            .iter()
            .map(|id| self.backend.find_commit(**id))
            .collect::<Result<Vec<_>, _>>()?;
        let parent_refs = parents.iter().collect::<Vec<_>>();
        let committer = self.committer()?;

        match signer {
            None => self
                .backend
                .commit(None, &committer, &committer, message, &tree, &parent_refs)
                .map(Oid::from)
                .map_err(Error::from),
            Some(signer) => {
                let buffer = self.backend.commit_create_buffer(
                    &committer,
                    &committer,
                    message,
                    &tree,
                    &parent_refs,
                )?;
                let content = std::str::from_utf8(&buffer)
                    .map_err(|_| git2::Error::from_str("commit buffer is not valid UTF-8"))?;
                let signature = signer.try_sign(&buffer)?;

                self.backend
                    .commit_signed(content, &signature.to_string(), None)
                    .map(Oid::from)
                    .map_err(Error::from)
            }
        }
    }

    fn set_ref(&self, name: &str, id: Oid) -> Result<(), Error> {
        self.backend
            .reference(name, *id, true, "gittuf: update reference")?;
        Ok(())
    }

    fn delete_ref(&self, name: &str) -> Result<(), Error> {
        let mut reference = self.backend.find_reference(name).map_err(|e| {
            if is_not_found_err(&e) {
                Error::RefNotFound(name.to_owned())
            } else {
                Error::Git(e)
            }
        })?;
        reference.delete().map_err(Error::from)
    }

    fn fetch(&self, remote: &str, refspecs: &[String]) -> Result<(), Error> {
        let mut remote = match self.backend.find_remote(remote) {
            Ok(remote) => remote,
            Err(_) => self.backend.remote_anonymous(remote)?,
        };
        let refspecs = refspecs.iter().map(String::as_str).collect::<Vec<_>>();

        remote
            .fetch(&refspecs, None, None)
            .map_err(Error::from)
    }

    fn push(&self, remote: &str, refspecs: &[String]) -> Result<(), Error> {
        let mut remote = match self.backend.find_remote(remote) {
            Ok(remote) => remote,
            Err(_) => self.backend.remote_anonymous(remote)?,
        };
        let refspecs = refspecs.iter().map(String::as_str).collect::<Vec<_>>();

        remote.push(&refspecs, None).map_err(Error::from)
    }

    fn raw(&self) -> &git2::Repository {
        &self.backend
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::crypto::test::signer::MockSigner;
    use crate::crypto::{Signature, Signer as _};
    use crate::test::fixtures;

    #[test]
    fn test_blob_round_trip() {
        let (repo, _tmp) = fixtures::repository();
        let id = repo.write_blob(b"hello").unwrap();

        assert_eq!(repo.read_blob(id).unwrap(), b"hello");
        assert!(repo
            .read_blob(Oid::zero())
            .is_err());
    }

    #[test]
    fn test_commit_and_refs() {
        let (repo, _tmp) = fixtures::repository();
        let tree = repo.write_tree(&[]).unwrap();
        let commit = repo.commit(tree, &[], "first", None).unwrap();

        repo.set_ref("refs/heads/main", commit).unwrap();
        assert_eq!(repo.ref_oid("refs/heads/main").unwrap(), commit);

        let read = repo.read_commit(commit).unwrap();
        assert_eq!(read.tree, tree);
        assert_eq!(read.message, "first");
        assert!(read.parents.is_empty());
        assert!(read.signature.is_none());

        repo.delete_ref("refs/heads/main").unwrap();
        assert!(repo.ref_oid("refs/heads/main").is_err());
    }

    #[test]
    fn test_signed_commit_verifies() {
        let (repo, _tmp) = fixtures::repository();
        let signer = MockSigner::from_seed([21; 32]);
        let tree = repo.write_tree(&[]).unwrap();
        let commit = repo.commit(tree, &[], "signed", Some(&signer)).unwrap();

        let read = repo.read_commit(commit).unwrap();
        let sig = read.signature.expect("commit must carry a signature");
        let parsed: Signature = std::str::from_utf8(&sig.signature)
            .unwrap()
            .parse()
            .unwrap();

        assert!(signer
            .public_key()
            .verify(&sig.signed_data, &parsed)
            .is_ok());
    }

    #[test]
    fn test_ancestry() {
        let (repo, _tmp) = fixtures::repository();
        let tree = repo.write_tree(&[]).unwrap();
        let a = repo.commit(tree, &[], "a", None).unwrap();
        let b = repo.commit(tree, &[a], "b", None).unwrap();

        assert!(repo.knows_commit(a, b).unwrap());
        assert!(!repo.knows_commit(b, a).unwrap());
        assert_eq!(repo.common_ancestor(a, b).unwrap(), a);
    }

    #[test]
    fn test_merge_tree_disjoint_changes() {
        let (repo, _tmp) = fixtures::repository();
        let base_tree = fixtures::tree(&repo, &[("a.txt", b"base"), ("b.txt", b"base")]);
        let base = repo.commit(base_tree, &[], "base", None).unwrap();

        let ours_tree = fixtures::tree(&repo, &[("a.txt", b"ours"), ("b.txt", b"base")]);
        let ours = repo.commit(ours_tree, &[base], "ours", None).unwrap();

        let theirs_tree = fixtures::tree(&repo, &[("a.txt", b"base"), ("b.txt", b"theirs")]);
        let theirs = repo.commit(theirs_tree, &[base], "theirs", None).unwrap();

        let merged = repo.merge_tree(ours, theirs).unwrap();
        let expected = fixtures::tree(&repo, &[("a.txt", b"ours"), ("b.txt", b"theirs")]);

        assert_eq!(merged, expected);
    }

    #[test]
    fn test_merge_tree_conflict_is_error() {
        let (repo, _tmp) = fixtures::repository();
        let base_tree = fixtures::tree(&repo, &[("a.txt", b"base")]);
        let base = repo.commit(base_tree, &[], "base", None).unwrap();

        let ours_tree = fixtures::tree(&repo, &[("a.txt", b"ours")]);
        let ours = repo.commit(ours_tree, &[base], "ours", None).unwrap();

        let theirs_tree = fixtures::tree(&repo, &[("a.txt", b"theirs")]);
        let theirs = repo.commit(theirs_tree, &[base], "theirs", None).unwrap();

        assert!(matches!(
            repo.merge_tree(ours, theirs),
            Err(Error::MergeConflict { .. })
        ));
    }
}
