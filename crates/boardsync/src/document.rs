use crate::types::{BoardId, ParseError, Path};
use std::fmt;
use thiserror::Error;
use tracing::trace;

/// Field separator inside a board payload
pub const FIELD_SEPARATOR: char = '%';

/// Errors from decoding or applying a board payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("payload is missing the version field")]
    MissingVersion,
    #[error("invalid version {0:?}")]
    InvalidVersion(String),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("update at version 0 cannot follow any state")]
    ZeroVersion,
    #[error("path update carries no paths")]
    MissingPath,
    #[error("payload is for board {got}, expected {expected}")]
    WrongBoard { expected: BoardId, got: BoardId },
}

/// The mutation an update carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateOp {
    Path,
    Undo,
    Clear,
}

impl fmt::Display for UpdateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateOp::Path => f.write_str("path"),
            UpdateOp::Undo => f.write_str("undo"),
            UpdateOp::Clear => f.write_str("clear"),
        }
    }
}

/// Full state of a board at one version
///
/// Text layout: `boardId%version%path1%...%pathN`. This is both the full-board
/// payload and the update payload; an update simply reflects the state after
/// the mutation it announces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: BoardId,
    pub version: u64,
    pub paths: Vec<Path>,
}

impl Snapshot {
    pub fn encode(&self) -> String {
        let mut out = format!("{}{}{}", self.id, FIELD_SEPARATOR, self.version);
        for path in &self.paths {
            out.push(FIELD_SEPARATOR);
            out.push_str(&path.to_string());
        }
        out
    }

    pub fn decode(payload: &str) -> Result<Self, SnapshotError> {
        let mut fields = payload.split(FIELD_SEPARATOR);
        let id: BoardId = fields.next().unwrap_or_default().parse()?;
        let version_field = fields.next().ok_or(SnapshotError::MissingVersion)?;
        let version = version_field
            .parse::<u64>()
            .map_err(|_| SnapshotError::InvalidVersion(version_field.to_string()))?;

        let rest: Vec<&str> = fields.collect();
        let paths = match rest.as_slice() {
            // `id%version%` is what an empty board looks like on older peers
            [""] => Vec::new(),
            tokens => tokens
                .iter()
                .map(|t| t.parse::<Path>())
                .collect::<Result<Vec<_>, _>>()?,
        };

        Ok(Self { id, version, paths })
    }
}

/// Versioned stroke history of one board
///
/// Every mutation takes the version the caller believes is current. A
/// mismatch means someone else mutated first; the call returns false and
/// leaves the document untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    id: BoardId,
    version: u64,
    history: Vec<Path>,
}

impl Document {
    pub fn new(id: BoardId) -> Self {
        Self {
            id,
            version: 0,
            history: Vec::new(),
        }
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            id: snapshot.id,
            version: snapshot.version,
            history: snapshot.paths,
        }
    }

    pub fn id(&self) -> &BoardId {
        &self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn history(&self) -> &[Path] {
        &self.history
    }

    /// Whether `snapshot` is a state this document already holds or has
    /// moved past
    ///
    /// An update that fails its guard and is not covered here means the
    /// replica missed something.
    pub fn has_seen(&self, snapshot: &Snapshot) -> bool {
        snapshot.version < self.version
            || (snapshot.version == self.version && snapshot.paths == self.history)
    }

    /// Append a path if `expected_version` is current
    pub fn append(&mut self, path: Path, expected_version: u64) -> bool {
        if expected_version != self.version {
            trace!(board = %self.id, expected_version, version = self.version, "stale append");
            return false;
        }
        self.history.push(path);
        self.version += 1;
        true
    }

    /// Drop the last path if `expected_version` is current
    ///
    /// Accepted on an empty history too; the version still moves.
    pub fn undo(&mut self, expected_version: u64) -> bool {
        if expected_version != self.version {
            trace!(board = %self.id, expected_version, version = self.version, "stale undo");
            return false;
        }
        self.history.pop();
        self.version += 1;
        true
    }

    /// Empty the history if `expected_version` is current
    pub fn clear(&mut self, expected_version: u64) -> bool {
        if expected_version != self.version {
            trace!(board = %self.id, expected_version, version = self.version, "stale clear");
            return false;
        }
        self.history.clear();
        self.version += 1;
        true
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            id: self.id.clone(),
            version: self.version,
            paths: self.history.clone(),
        }
    }

    /// Replace the whole state with `snapshot`, bypassing the guard
    pub fn bootstrap(&mut self, snapshot: Snapshot) -> Result<(), SnapshotError> {
        if snapshot.id != self.id {
            return Err(SnapshotError::WrongBoard {
                expected: self.id.clone(),
                got: snapshot.id,
            });
        }
        self.version = snapshot.version;
        self.history = snapshot.paths;
        Ok(())
    }

    /// Apply the mutation announced by an update payload
    ///
    /// The payload reflects the state after the mutation, so it is guarded
    /// against `snapshot.version - 1`. For a path update only the last path
    /// of the payload is new.
    pub fn apply_update(&mut self, op: UpdateOp, snapshot: &Snapshot) -> Result<bool, SnapshotError> {
        if snapshot.id != self.id {
            return Err(SnapshotError::WrongBoard {
                expected: self.id.clone(),
                got: snapshot.id.clone(),
            });
        }
        let expected = snapshot
            .version
            .checked_sub(1)
            .ok_or(SnapshotError::ZeroVersion)?;

        Ok(match op {
            UpdateOp::Path => {
                let path = snapshot.paths.last().ok_or(SnapshotError::MissingPath)?;
                self.append(path.clone(), expected)
            }
            UpdateOp::Undo => self.undo(expected),
            UpdateOp::Clear => self.clear(expected),
        })
    }

    /// Apply a locally originated mutation made on top of `base_version`
    pub fn apply_edit(&mut self, edit: LocalEdit, base_version: u64) -> bool {
        match edit {
            LocalEdit::Append(path) => self.append(path, base_version),
            LocalEdit::Undo => self.undo(base_version),
            LocalEdit::Clear => self.clear(base_version),
        }
    }
}

/// A mutation requested by the local user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEdit {
    Append(Path),
    Undo,
    Clear,
}

impl LocalEdit {
    pub fn op(&self) -> UpdateOp {
        match self {
            LocalEdit::Append(_) => UpdateOp::Path,
            LocalEdit::Undo => UpdateOp::Undo,
            LocalEdit::Clear => UpdateOp::Clear,
        }
    }
}
