//! The Reference State Log.
//!
//! A linear chain of commits under `refs/gittuf/reference-state-log`,
//! totally ordering every reference update and cross-repository
//! propagation. Each commit's message body is a structured record; the
//! tree is always empty. Entries are never rewritten: mistakes are
//! nullified by skip annotations.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use thiserror::Error;

use crate::crypto::Signer;
use crate::git::Oid;
use crate::storage::{self, ReadRepository, WriteRepository};
use crate::RSL_REF;

const REFERENCE_HEADER: &str = "RSL Reference Entry";
const ANNOTATION_HEADER: &str = "RSL Annotation Entry";
const PROPAGATION_HEADER: &str = "RSL Propagation Entry";

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage: {0}")]
    Storage(#[from] storage::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("the reference state log is empty")]
    Empty,
    #[error("entry `{0}` not found")]
    NotFound(Oid),
    #[error("entry `{0}` has more than one parent")]
    NotLinear(Oid),
    #[error("`{until}` is not an ancestor of `{start}`")]
    NotAncestor { start: Oid, until: Oid },
    #[error("tag `{0}` is already recorded in the log")]
    TagExists(String),
    #[error(transparent)]
    Cancelled(#[from] crate::Cancelled),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Empty | Self::NotFound(_) => true,
            Self::Storage(e) => e.is_not_found(),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unknown entry header `{0}`")]
    UnknownHeader(String),
    #[error("missing blank line after entry header")]
    MissingSeparator,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("duplicate field `{0}`")]
    DuplicateField(&'static str),
    #[error("unknown field `{0}`")]
    UnknownField(String),
    #[error("invalid value for `{field}`: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// A reference entry: `ref` moved to `target_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceEntry {
    pub ref_name: String,
    pub target_id: Oid,
    pub number: u64,
}

/// An annotation over prior entries. `skip = true` nullifies them for
/// verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationEntry {
    pub entry_ids: Vec<Oid>,
    pub skip: bool,
    pub message: String,
    pub number: u64,
}

/// Records that upstream state was folded into a subtree of the
/// downstream ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationEntry {
    pub ref_name: String,
    pub target_id: Oid,
    pub upstream_repository: String,
    pub upstream_entry_id: Oid,
    pub number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Reference(ReferenceEntry),
    Annotation(AnnotationEntry),
    Propagation(PropagationEntry),
}

/// Entry kind, for queries.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Kind {
    Reference,
    Annotation,
    Propagation,
}

impl Entry {
    pub fn kind(&self) -> Kind {
        match self {
            Self::Reference(_) => Kind::Reference,
            Self::Annotation(_) => Kind::Annotation,
            Self::Propagation(_) => Kind::Propagation,
        }
    }

    pub fn number(&self) -> u64 {
        match self {
            Self::Reference(e) => e.number,
            Self::Annotation(e) => e.number,
            Self::Propagation(e) => e.number,
        }
    }

    fn set_number(&mut self, number: u64) {
        match self {
            Self::Reference(e) => e.number = number,
            Self::Annotation(e) => e.number = number,
            Self::Propagation(e) => e.number = number,
        }
    }

    /// The ref this entry updates, for reference and propagation entries.
    pub fn ref_name(&self) -> Option<&str> {
        match self {
            Self::Reference(e) => Some(e.ref_name.as_str()),
            Self::Propagation(e) => Some(e.ref_name.as_str()),
            Self::Annotation(_) => None,
        }
    }

    /// The target this entry claims for its ref.
    pub fn target_id(&self) -> Option<Oid> {
        match self {
            Self::Reference(e) => Some(e.target_id),
            Self::Propagation(e) => Some(e.target_id),
            Self::Annotation(_) => None,
        }
    }

    /// Serialize as a commit message. Inverse of [`Entry::from_message`].
    pub fn to_message(&self) -> String {
        let mut msg = String::new();

        match self {
            Self::Reference(e) => {
                msg.push_str(REFERENCE_HEADER);
                msg.push_str("\n\n");
                msg.push_str(&format!("ref: {}\n", e.ref_name));
                msg.push_str(&format!("targetID: {}\n", e.target_id));
                msg.push_str(&format!("number: {}\n", e.number));
            }
            Self::Annotation(e) => {
                msg.push_str(ANNOTATION_HEADER);
                msg.push_str("\n\n");
                for id in &e.entry_ids {
                    msg.push_str(&format!("entryID: {id}\n"));
                }
                msg.push_str(&format!("skip: {}\n", e.skip));
                msg.push_str(&format!("number: {}\n", e.number));
                msg.push_str(&format!("message: {}\n", e.message));
            }
            Self::Propagation(e) => {
                msg.push_str(PROPAGATION_HEADER);
                msg.push_str("\n\n");
                msg.push_str(&format!("ref: {}\n", e.ref_name));
                msg.push_str(&format!("targetID: {}\n", e.target_id));
                msg.push_str(&format!("upstreamRepository: {}\n", e.upstream_repository));
                msg.push_str(&format!("upstreamEntryID: {}\n", e.upstream_entry_id));
                msg.push_str(&format!("number: {}\n", e.number));
            }
        }
        msg
    }

    /// Parse a commit message. Unknown headers and unknown fields
    /// reject the entry.
    pub fn from_message(message: &str) -> Result<Self, ParseError> {
        let message = message.trim_end_matches('\n');
        let (header, body) = message
            .split_once('\n')
            .ok_or(ParseError::MissingSeparator)?;
        let body = body
            .strip_prefix('\n')
            .ok_or(ParseError::MissingSeparator)?;

        match header {
            REFERENCE_HEADER => Self::parse_reference(body),
            ANNOTATION_HEADER => Self::parse_annotation(body),
            PROPAGATION_HEADER => Self::parse_propagation(body),
            other => Err(ParseError::UnknownHeader(other.to_owned())),
        }
    }

    fn parse_reference(body: &str) -> Result<Self, ParseError> {
        let mut ref_name = None;
        let mut target_id = None;
        let mut number = None;

        for line in body.lines() {
            let (key, value) = split_field(line)?;
            match key {
                "ref" => set_once(&mut ref_name, "ref", value.to_owned())?,
                "targetID" => set_once(&mut target_id, "targetID", parse_oid("targetID", value)?)?,
                "number" => set_once(&mut number, "number", parse_number(value)?)?,
                other => return Err(ParseError::UnknownField(other.to_owned())),
            }
        }
        Ok(Self::Reference(ReferenceEntry {
            ref_name: ref_name.ok_or(ParseError::MissingField("ref"))?,
            target_id: target_id.ok_or(ParseError::MissingField("targetID"))?,
            number: number.ok_or(ParseError::MissingField("number"))?,
        }))
    }

    fn parse_annotation(body: &str) -> Result<Self, ParseError> {
        let mut entry_ids = Vec::new();
        let mut skip = None;
        let mut number = None;
        let mut text: Option<String> = None;

        let mut lines = body.lines();
        while let Some(line) = lines.next() {
            let (key, value) = split_field(line)?;
            match key {
                "entryID" => entry_ids.push(parse_oid("entryID", value)?),
                "skip" => {
                    let parsed = match value {
                        "true" => true,
                        "false" => false,
                        other => {
                            return Err(ParseError::InvalidValue {
                                field: "skip",
                                value: other.to_owned(),
                            })
                        }
                    };
                    set_once(&mut skip, "skip", parsed)?;
                }
                "number" => set_once(&mut number, "number", parse_number(value)?)?,
                "message" => {
                    // The message is the final field and may span lines.
                    let mut message = value.to_owned();
                    for rest in lines.by_ref() {
                        message.push('\n');
                        message.push_str(rest);
                    }
                    set_once(&mut text, "message", message)?;
                }
                other => return Err(ParseError::UnknownField(other.to_owned())),
            }
        }
        if entry_ids.is_empty() {
            return Err(ParseError::MissingField("entryID"));
        }
        Ok(Self::Annotation(AnnotationEntry {
            entry_ids,
            skip: skip.ok_or(ParseError::MissingField("skip"))?,
            message: text.ok_or(ParseError::MissingField("message"))?,
            number: number.ok_or(ParseError::MissingField("number"))?,
        }))
    }

    fn parse_propagation(body: &str) -> Result<Self, ParseError> {
        let mut ref_name = None;
        let mut target_id = None;
        let mut upstream_repository = None;
        let mut upstream_entry_id = None;
        let mut number = None;

        for line in body.lines() {
            let (key, value) = split_field(line)?;
            match key {
                "ref" => set_once(&mut ref_name, "ref", value.to_owned())?,
                "targetID" => set_once(&mut target_id, "targetID", parse_oid("targetID", value)?)?,
                "upstreamRepository" => set_once(
                    &mut upstream_repository,
                    "upstreamRepository",
                    value.to_owned(),
                )?,
                "upstreamEntryID" => set_once(
                    &mut upstream_entry_id,
                    "upstreamEntryID",
                    parse_oid("upstreamEntryID", value)?,
                )?,
                "number" => set_once(&mut number, "number", parse_number(value)?)?,
                other => return Err(ParseError::UnknownField(other.to_owned())),
            }
        }
        Ok(Self::Propagation(PropagationEntry {
            ref_name: ref_name.ok_or(ParseError::MissingField("ref"))?,
            target_id: target_id.ok_or(ParseError::MissingField("targetID"))?,
            upstream_repository: upstream_repository
                .ok_or(ParseError::MissingField("upstreamRepository"))?,
            upstream_entry_id: upstream_entry_id
                .ok_or(ParseError::MissingField("upstreamEntryID"))?,
            number: number.ok_or(ParseError::MissingField("number"))?,
        }))
    }
}

fn split_field(line: &str) -> Result<(&str, &str), ParseError> {
    line.split_once(": ")
        .ok_or_else(|| ParseError::UnknownField(line.to_owned()))
}

fn set_once<T>(slot: &mut Option<T>, field: &'static str, value: T) -> Result<(), ParseError> {
    if slot.is_some() {
        return Err(ParseError::DuplicateField(field));
    }
    *slot = Some(value);
    Ok(())
}

fn parse_oid(field: &'static str, value: &str) -> Result<Oid, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidValue {
        field,
        value: value.to_owned(),
    })
}

fn parse_number(value: &str) -> Result<u64, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidValue {
        field: "number",
        value: value.to_owned(),
    })
}

/// An entry located in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryAt {
    /// The commit this entry lives in.
    pub id: Oid,
    pub entry: Entry,
}

impl std::ops::Deref for EntryAt {
    type Target = Entry;

    fn deref(&self) -> &Self::Target {
        &self.entry
    }
}

impl fmt::Display for EntryAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entry {
            Entry::Reference(e) => {
                write!(f, "{:.7} ref {} -> {:.7}", self.id, e.ref_name, e.target_id)
            }
            Entry::Annotation(e) => {
                write!(f, "{:.7} annotation skip={} over {} entries", self.id, e.skip, e.entry_ids.len())
            }
            Entry::Propagation(e) => {
                write!(f, "{:.7} propagation {} <- {}", self.id, e.ref_name, e.upstream_repository)
            }
        }
    }
}

/// Result of [`append`].
#[derive(Debug)]
pub enum Appended {
    /// A new entry was committed to the log.
    Written(EntryAt),
    /// The latest unskipped entry for the ref already records this
    /// target; nothing was committed.
    Unchanged { latest: EntryAt },
}

impl Appended {
    /// The entry now at the tip of this ref's history.
    pub fn entry(&self) -> &EntryAt {
        match self {
            Self::Written(e) => e,
            Self::Unchanged { latest } => latest,
        }
    }
}

/// Options for [`latest_for_ref`].
#[derive(Debug, Default, Clone)]
pub struct FindOptions {
    /// Ignore entries nullified by skip annotations.
    pub unskipped: bool,
    /// Start the search at this entry (inclusive) instead of the head.
    pub before_entry_id: Option<Oid>,
    /// Restrict to one entry kind. Reference and propagation entries
    /// both update refs and both match by default.
    pub kind: Option<Kind>,
}

/// Load the entry in the given commit.
pub fn load<R: ReadRepository>(repo: &R, id: Oid) -> Result<EntryAt, Error> {
    let commit = repo.read_commit(id)?;
    let entry = Entry::from_message(&commit.message)?;

    Ok(EntryAt { id, entry })
}

/// The entry at the head of the log.
pub fn latest<R: ReadRepository>(repo: &R) -> Result<EntryAt, Error> {
    let head = match repo.ref_oid(&RSL_REF) {
        Ok(head) => head,
        Err(e) if e.is_not_found() => return Err(Error::Empty),
        Err(e) => return Err(e.into()),
    };
    load(repo, head)
}

/// The parent entry, or `None` for the first entry.
pub fn parent_of<R: ReadRepository>(repo: &R, id: Oid) -> Result<Option<EntryAt>, Error> {
    let commit = repo.read_commit(id)?;

    match commit.parents.as_slice() {
        [] => Ok(None),
        [parent] => load(repo, *parent).map(Some),
        _ => Err(Error::NotLinear(id)),
    }
}

/// The first entry of the log.
pub fn first<R: ReadRepository>(repo: &R) -> Result<EntryAt, Error> {
    let mut entry = latest(repo)?;

    while let Some(parent) = parent_of(repo, entry.id)? {
        entry = parent;
    }
    Ok(entry)
}

/// Entries from `start` down to `until`, in child-to-ancestor order,
/// both inclusive. Fails if `until` is not an ancestor of `start`.
pub fn iterate_until<R: ReadRepository>(
    repo: &R,
    start: Oid,
    until: Oid,
) -> Result<Vec<EntryAt>, Error> {
    let mut entries = Vec::new();
    let mut cursor = Some(load(repo, start)?);

    while let Some(entry) = cursor {
        let id = entry.id;
        entries.push(entry);
        if id == until {
            return Ok(entries);
        }
        cursor = parent_of(repo, id)?;
    }
    Err(Error::NotAncestor { start, until })
}

/// All entries, head first. `None` when the log does not exist yet.
fn walk<R: ReadRepository>(repo: &R) -> Result<Vec<EntryAt>, Error> {
    let mut entries = Vec::new();
    let mut cursor = match latest(repo) {
        Ok(entry) => Some(entry),
        Err(Error::Empty) => None,
        Err(e) => return Err(e),
    };

    while let Some(entry) = cursor {
        let id = entry.id;
        entries.push(entry);
        cursor = parent_of(repo, id)?;
    }
    Ok(entries)
}

/// Entry ids nullified by skip annotations, walking the whole log.
pub fn skipped_entries<R: ReadRepository>(repo: &R) -> Result<BTreeSet<Oid>, Error> {
    let mut skipped = BTreeSet::new();

    for entry in walk(repo)? {
        if let Entry::Annotation(a) = &entry.entry {
            if a.skip {
                skipped.extend(a.entry_ids.iter().copied());
            }
        }
    }
    Ok(skipped)
}

/// The latest entry updating `ref_name`, subject to `opts`.
pub fn latest_for_ref<R: ReadRepository>(
    repo: &R,
    ref_name: &str,
    opts: &FindOptions,
) -> Result<Option<EntryAt>, Error> {
    let mut skipped: BTreeSet<Oid> = BTreeSet::new();
    let mut started = opts.before_entry_id.is_none();

    for entry in walk(repo)? {
        // Annotations are always younger than the entries they
        // reference, so collecting them on the way down is enough.
        if let Entry::Annotation(a) = &entry.entry {
            if a.skip {
                skipped.extend(a.entry_ids.iter().copied());
            }
        }
        if !started {
            if Some(entry.id) == opts.before_entry_id {
                started = true;
            } else {
                continue;
            }
        }
        if let Some(kind) = opts.kind {
            if entry.kind() != kind {
                continue;
            }
        } else if entry.kind() == Kind::Annotation {
            continue;
        }
        if entry.ref_name() != Some(ref_name) {
            continue;
        }
        if opts.unskipped && skipped.contains(&entry.id) {
            continue;
        }
        return Ok(Some(entry));
    }
    Ok(None)
}

/// The unskipped history of `ref_name` in chronological order, starting
/// at `from` (inclusive) when given, together with the annotations
/// referencing each returned entry.
pub struct RefHistory {
    pub entries: Vec<EntryAt>,
    pub annotations: BTreeMap<Oid, Vec<EntryAt>>,
}

pub fn history_for_ref<R: ReadRepository>(
    repo: &R,
    ref_name: &str,
    from: Option<Oid>,
) -> Result<RefHistory, Error> {
    let mut skipped: BTreeSet<Oid> = BTreeSet::new();
    let mut annotations: BTreeMap<Oid, Vec<EntryAt>> = BTreeMap::new();
    let mut entries = Vec::new();

    for entry in walk(repo)? {
        if let Entry::Annotation(a) = &entry.entry {
            if a.skip {
                skipped.extend(a.entry_ids.iter().copied());
            }
            for id in &a.entry_ids {
                annotations.entry(*id).or_default().push(entry.clone());
            }
            continue;
        }
        if entry.ref_name() == Some(ref_name) {
            let id = entry.id;
            entries.push(entry);
            if Some(id) == from {
                break;
            }
        }
    }
    entries.retain(|e| !skipped.contains(&e.id));
    entries.reverse();
    annotations.retain(|id, _| entries.iter().any(|e| e.id == *id));

    Ok(RefHistory {
        entries,
        annotations,
    })
}

/// Options for [`append`].
#[derive(Debug, Default, Clone)]
pub struct AppendOptions {
    /// Record the entry even when it duplicates the latest unskipped
    /// entry for the same ref.
    pub skip_check_for_duplicate: bool,
}

/// Append an entry as a child of the current head. The entry's number
/// is inferred from the parent; the commit is signed when a signer is
/// given.
pub fn append<R: WriteRepository>(
    repo: &R,
    mut entry: Entry,
    signer: Option<&dyn Signer>,
    opts: &AppendOptions,
) -> Result<Appended, Error> {
    let head = match latest(repo) {
        Ok(head) => Some(head),
        Err(Error::Empty) => None,
        Err(e) => return Err(e),
    };

    if let (Entry::Reference(new), false) = (&entry, opts.skip_check_for_duplicate) {
        let latest = latest_for_ref(
            repo,
            &new.ref_name,
            &FindOptions {
                unskipped: true,
                kind: Some(Kind::Reference),
                ..FindOptions::default()
            },
        )?;
        if let Some(latest) = latest {
            // Only adjacent repetition is a duplicate: A -> B -> A is
            // two legitimate updates.
            if latest.target_id() == Some(new.target_id) {
                log::debug!(
                    target: "rsl",
                    "Entry for {} already records {}; not appending",
                    new.ref_name,
                    new.target_id
                );
                return Ok(Appended::Unchanged { latest });
            }
        }
    }

    let number = head.as_ref().map(|h| h.number() + 1).unwrap_or(1);
    entry.set_number(number);

    let tree = repo.write_tree(&[])?;
    let parents = head.as_ref().map(|h| vec![h.id]).unwrap_or_default();
    let id = repo.commit(tree, &parents, &entry.to_message(), signer)?;

    repo.set_ref(&RSL_REF, id)?;
    log::debug!(target: "rsl", "Appended entry {id} (number {number})");

    Ok(Appended::Written(EntryAt { id, entry }))
}

/// Record the current state of `ref_name` as a reference entry.
///
/// Tags are immutable: recording a tag that already has a log entry is
/// refused.
pub fn record<R: WriteRepository>(
    repo: &R,
    ref_name: &str,
    signer: Option<&dyn Signer>,
    opts: &AppendOptions,
) -> Result<Appended, Error> {
    let target_id = repo.ref_oid(ref_name)?;

    if ref_name.starts_with("refs/tags/") {
        let existing = latest_for_ref(repo, ref_name, &FindOptions::default())?;
        if existing.is_some() {
            return Err(Error::TagExists(ref_name.to_owned()));
        }
    }

    append(
        repo,
        Entry::Reference(ReferenceEntry {
            ref_name: ref_name.to_owned(),
            target_id,
            number: 0,
        }),
        signer,
        opts,
    )
}

/// Append an annotation over prior entries. All referenced entries must
/// exist in the log.
pub fn annotate<R: WriteRepository>(
    repo: &R,
    entry_ids: Vec<Oid>,
    skip: bool,
    message: String,
    signer: Option<&dyn Signer>,
) -> Result<Appended, Error> {
    if entry_ids.is_empty() {
        return Err(ParseError::MissingField("entryID").into());
    }
    // Annotations may only speak about entries in the chain; a commit
    // orphaned by reconciliation does not qualify.
    let chain: BTreeSet<Oid> = walk(repo)?.into_iter().map(|e| e.id).collect();
    for id in &entry_ids {
        if !chain.contains(id) {
            return Err(Error::NotFound(*id));
        }
    }
    append(
        repo,
        Entry::Annotation(AnnotationEntry {
            entry_ids,
            skip,
            message,
            number: 0,
        }),
        signer,
        &AppendOptions::default(),
    )
}

/// Walk entries for `ref_name` from the newest down, and annotate as
/// skipped every entry whose target is no longer reachable from the
/// ref's current tip. Stops at the first reachable entry.
pub fn skip_invalid<R: WriteRepository>(
    repo: &R,
    ref_name: &str,
    signer: Option<&dyn Signer>,
) -> Result<Option<EntryAt>, Error> {
    let tip = repo.ref_oid(ref_name)?;
    let skipped = skipped_entries(repo)?;
    let mut invalid = Vec::new();

    let mut cursor = latest_for_ref(
        repo,
        ref_name,
        &FindOptions {
            kind: Some(Kind::Reference),
            ..FindOptions::default()
        },
    )?;
    while let Some(entry) = cursor {
        let target = entry.target_id().expect("reference entries have targets");
        let reachable = match repo.object_kind(target) {
            Ok(crate::storage::ObjectKind::Commit) => repo.knows_commit(target, tip)?,
            Ok(_) => target == tip,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e.into()),
        };
        if reachable {
            break;
        }
        if !skipped.contains(&entry.id) {
            invalid.push(entry.id);
        }
        // Restart below the current entry.
        cursor = match parent_of(repo, entry.id)? {
            Some(parent) => latest_for_ref(
                repo,
                ref_name,
                &FindOptions {
                    kind: Some(Kind::Reference),
                    before_entry_id: Some(parent.id),
                    ..FindOptions::default()
                },
            )?,
            None => None,
        };
    }

    if invalid.is_empty() {
        return Ok(None);
    }
    log::info!(
        target: "rsl",
        "Skipping {} entries for {ref_name} unreachable from {tip}",
        invalid.len()
    );
    match annotate(
        repo,
        invalid,
        true,
        format!("Skipping invalid entries for {ref_name}"),
        signer,
    )? {
        Appended::Written(entry) => Ok(Some(entry)),
        Appended::Unchanged { .. } => Ok(None),
    }
}

/// All entries, newest first, for display.
pub fn log_entries<R: ReadRepository>(repo: &R, limit: Option<usize>) -> Result<Vec<EntryAt>, Error> {
    let mut entries = walk(repo)?;

    if let Some(limit) = limit {
        entries.truncate(limit);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::test::fixtures;

    #[test]
    fn test_message_round_trip_reference() {
        let entry = Entry::Reference(ReferenceEntry {
            ref_name: "refs/heads/main".to_owned(),
            target_id: fixtures::oid(1),
            number: 7,
        });
        let message = entry.to_message();

        assert_eq!(
            message,
            format!(
                "RSL Reference Entry\n\nref: refs/heads/main\ntargetID: {}\nnumber: 7\n",
                fixtures::oid(1)
            )
        );
        assert_eq!(Entry::from_message(&message).unwrap(), entry);
    }

    #[test]
    fn test_message_round_trip_annotation() {
        let entry = Entry::Annotation(AnnotationEntry {
            entry_ids: vec![fixtures::oid(1), fixtures::oid(2)],
            skip: true,
            message: "bad update\nsecond line".to_owned(),
            number: 3,
        });

        assert_eq!(Entry::from_message(&entry.to_message()).unwrap(), entry);
    }

    #[test]
    fn test_message_round_trip_propagation() {
        let entry = Entry::Propagation(PropagationEntry {
            ref_name: "refs/heads/main".to_owned(),
            target_id: fixtures::oid(3),
            upstream_repository: "https://example.com/upstream".to_owned(),
            upstream_entry_id: fixtures::oid(4),
            number: 9,
        });

        assert_eq!(Entry::from_message(&entry.to_message()).unwrap(), entry);
    }

    #[test]
    fn test_unknown_header_rejected() {
        assert!(matches!(
            Entry::from_message("RSL Surprise Entry\n\nref: x\n"),
            Err(ParseError::UnknownHeader(_))
        ));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let message = format!(
            "RSL Reference Entry\n\nref: refs/heads/main\ntargetID: {}\nnumber: 1\nextra: x\n",
            fixtures::oid(1)
        );
        assert!(matches!(
            Entry::from_message(&message),
            Err(ParseError::UnknownField(_))
        ));
    }

    #[test]
    fn test_append_assigns_numbers() {
        let (repo, _tmp) = fixtures::repository();
        let a = fixtures::commit(&repo, "refs/heads/main", b"a", &[]);

        let e1 = match record(&repo, "refs/heads/main", None, &AppendOptions::default()).unwrap()
        {
            Appended::Written(e) => e,
            Appended::Unchanged { .. } => panic!("expected a new entry"),
        };
        assert_eq!(e1.number(), 1);
        assert_eq!(e1.target_id(), Some(a));

        let b = fixtures::commit(&repo, "refs/heads/main", b"b", &[a]);
        let e2 = match record(&repo, "refs/heads/main", None, &AppendOptions::default()).unwrap()
        {
            Appended::Written(e) => e,
            Appended::Unchanged { .. } => panic!("expected a new entry"),
        };
        assert_eq!(e2.number(), 2);
        assert_eq!(e2.target_id(), Some(b));

        assert_eq!(latest(&repo).unwrap().id, e2.id);
        assert_eq!(first(&repo).unwrap().id, e1.id);
    }

    #[test]
    fn test_duplicate_suppression() {
        let (repo, _tmp) = fixtures::repository();
        fixtures::commit(&repo, "refs/heads/main", b"a", &[]);

        record(&repo, "refs/heads/main", None, &AppendOptions::default()).unwrap();
        let second = record(&repo, "refs/heads/main", None, &AppendOptions::default()).unwrap();

        assert!(matches!(second, Appended::Unchanged { .. }));

        // With the check disabled, a duplicate is recorded.
        let third = record(
            &repo,
            "refs/heads/main",
            None,
            &AppendOptions {
                skip_check_for_duplicate: true,
            },
        )
        .unwrap();
        assert!(matches!(third, Appended::Written(_)));
    }

    #[test]
    fn test_non_adjacent_duplicates_allowed() {
        let (repo, _tmp) = fixtures::repository();
        let a = fixtures::commit(&repo, "refs/heads/main", b"a", &[]);
        record(&repo, "refs/heads/main", None, &AppendOptions::default()).unwrap();

        let b = fixtures::commit(&repo, "refs/heads/main", b"b", &[a]);
        record(&repo, "refs/heads/main", None, &AppendOptions::default()).unwrap();

        // Move back to `a`: same target as an older entry, but not the
        // latest one, so it must be recorded.
        repo.set_ref("refs/heads/main", a).unwrap();
        let third = record(&repo, "refs/heads/main", None, &AppendOptions::default()).unwrap();
        assert!(matches!(third, Appended::Written(_)));

        let _ = b;
    }

    #[test]
    fn test_skip_annotation_hides_entry() {
        let (repo, _tmp) = fixtures::repository();
        let a = fixtures::commit(&repo, "refs/heads/main", b"a", &[]);
        let entry_a = record(&repo, "refs/heads/main", None, &AppendOptions::default())
            .unwrap()
            .entry()
            .clone();

        let b = fixtures::commit(&repo, "refs/heads/main", b"b", &[a]);
        let entry_b = record(&repo, "refs/heads/main", None, &AppendOptions::default())
            .unwrap()
            .entry()
            .clone();

        annotate(
            &repo,
            vec![entry_b.id],
            true,
            "undo bad update".to_owned(),
            None,
        )
        .unwrap();

        let unskipped = latest_for_ref(
            &repo,
            "refs/heads/main",
            &FindOptions {
                unskipped: true,
                ..FindOptions::default()
            },
        )
        .unwrap()
        .unwrap();
        assert_eq!(unskipped.id, entry_a.id);

        let any = latest_for_ref(&repo, "refs/heads/main", &FindOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(any.id, entry_b.id);

        let _ = b;
    }

    #[test]
    fn test_annotation_requires_known_entries() {
        let (repo, _tmp) = fixtures::repository();
        fixtures::commit(&repo, "refs/heads/main", b"a", &[]);
        record(&repo, "refs/heads/main", None, &AppendOptions::default()).unwrap();

        let err = annotate(&repo, vec![fixtures::oid(0xaa)], true, String::new(), None)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_iterate_until() {
        let (repo, _tmp) = fixtures::repository();
        let a = fixtures::commit(&repo, "refs/heads/main", b"a", &[]);
        let e1 = record(&repo, "refs/heads/main", None, &AppendOptions::default())
            .unwrap()
            .entry()
            .clone();
        let b = fixtures::commit(&repo, "refs/heads/main", b"b", &[a]);
        let e2 = record(&repo, "refs/heads/main", None, &AppendOptions::default())
            .unwrap()
            .entry()
            .clone();

        let entries = iterate_until(&repo, e2.id, e1.id).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, e2.id);
        assert_eq!(entries[1].id, e1.id);

        // Walking from the older to the newer entry fails.
        assert!(matches!(
            iterate_until(&repo, e1.id, e2.id),
            Err(Error::NotAncestor { .. })
        ));

        let _ = b;
    }

    #[test]
    fn test_tag_entries_are_immutable() {
        let (repo, _tmp) = fixtures::repository();
        let a = fixtures::commit(&repo, "refs/heads/main", b"a", &[]);
        repo.set_ref("refs/tags/v1.0", a).unwrap();

        record(&repo, "refs/tags/v1.0", None, &AppendOptions::default()).unwrap();
        let err = record(&repo, "refs/tags/v1.0", None, &AppendOptions::default()).unwrap_err();

        assert!(matches!(err, Error::TagExists(_)));
    }

    #[test]
    fn test_skip_invalid() {
        let (repo, _tmp) = fixtures::repository();
        let a = fixtures::commit(&repo, "refs/heads/main", b"a", &[]);
        record(&repo, "refs/heads/main", None, &AppendOptions::default()).unwrap();

        let b = fixtures::commit(&repo, "refs/heads/main", b"b", &[a]);
        let bad = record(&repo, "refs/heads/main", None, &AppendOptions::default())
            .unwrap()
            .entry()
            .clone();

        // Reset the branch to `a`: the entry for `b` is now invalid.
        repo.set_ref("refs/heads/main", a).unwrap();
        let annotation = skip_invalid(&repo, "refs/heads/main", None)
            .unwrap()
            .expect("an annotation must be created");

        match &annotation.entry {
            Entry::Annotation(ann) => {
                assert!(ann.skip);
                assert_eq!(ann.entry_ids, vec![bad.id]);
            }
            _ => panic!("expected an annotation"),
        }

        // Idempotent: a second run finds nothing new to skip.
        assert!(skip_invalid(&repo, "refs/heads/main", None).unwrap().is_none());

        let _ = b;
    }
}
