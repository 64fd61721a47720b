//! Wire messages exchanged between peers and with the directory server.
//!
//! Each message travels as an event name plus a string payload. Board
//! payloads use the `%` separated snapshot layout from [`Snapshot`]; control
//! messages carry just a [`BoardId`]; errors carry free text.

use crate::document::{Snapshot, SnapshotError, UpdateOp};
use crate::types::{BoardId, ParseError};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown event {0:?}")]
    UnknownEvent(String),
    #[error("malformed board id in {event}: {source}")]
    BoardId {
        event: EventName,
        #[source]
        source: ParseError,
    },
    #[error("malformed payload in {event}: {source}")]
    Payload {
        event: EventName,
        #[source]
        source: SnapshotError,
    },
    #[error("undecodable frame: {0}")]
    Frame(String),
}

/// Every event name that can appear on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    GetBoardData,
    BoardData,
    BoardListen,
    BoardUnlisten,
    BoardPathUpdate,
    BoardPathAccepted,
    BoardUndoUpdate,
    BoardUndoAccepted,
    BoardClearUpdate,
    BoardClearAccepted,
    BoardDeleted,
    BoardError,
    ShareBoard,
    UnshareBoard,
    SharingBoard,
    UnsharingBoard,
}

impl EventName {
    pub const ALL: [EventName; 16] = [
        EventName::GetBoardData,
        EventName::BoardData,
        EventName::BoardListen,
        EventName::BoardUnlisten,
        EventName::BoardPathUpdate,
        EventName::BoardPathAccepted,
        EventName::BoardUndoUpdate,
        EventName::BoardUndoAccepted,
        EventName::BoardClearUpdate,
        EventName::BoardClearAccepted,
        EventName::BoardDeleted,
        EventName::BoardError,
        EventName::ShareBoard,
        EventName::UnshareBoard,
        EventName::SharingBoard,
        EventName::UnsharingBoard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::GetBoardData => "GET_BOARD_DATA",
            EventName::BoardData => "BOARD_DATA",
            EventName::BoardListen => "BOARD_LISTEN",
            EventName::BoardUnlisten => "BOARD_UNLISTEN",
            EventName::BoardPathUpdate => "BOARD_PATH_UPDATE",
            EventName::BoardPathAccepted => "BOARD_PATH_ACCEPTED",
            EventName::BoardUndoUpdate => "BOARD_UNDO_UPDATE",
            EventName::BoardUndoAccepted => "BOARD_UNDO_ACCEPTED",
            EventName::BoardClearUpdate => "BOARD_CLEAR_UPDATE",
            EventName::BoardClearAccepted => "BOARD_CLEAR_ACCEPTED",
            EventName::BoardDeleted => "BOARD_DELETED",
            EventName::BoardError => "BOARD_ERROR",
            EventName::ShareBoard => "SHARE_BOARD",
            EventName::UnshareBoard => "UNSHARE_BOARD",
            EventName::SharingBoard => "SHARING_BOARD",
            EventName::UnsharingBoard => "UNSHARING_BOARD",
        }
    }

    fn update(op: UpdateOp) -> Self {
        match op {
            UpdateOp::Path => EventName::BoardPathUpdate,
            UpdateOp::Undo => EventName::BoardUndoUpdate,
            UpdateOp::Clear => EventName::BoardClearUpdate,
        }
    }

    fn accepted(op: UpdateOp) -> Self {
        match op {
            UpdateOp::Path => EventName::BoardPathAccepted,
            UpdateOp::Undo => EventName::BoardUndoAccepted,
            UpdateOp::Clear => EventName::BoardClearAccepted,
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventName {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventName::ALL
            .iter()
            .copied()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownEvent(s.to_string()))
    }
}

/// Decoded message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Ask the owner for a full snapshot
    GetBoardData(BoardId),
    /// Full snapshot in reply to `GetBoardData`
    BoardData(Snapshot),
    Listen(BoardId),
    Unlisten(BoardId),
    /// Proposal (subscriber to owner) or broadcast (owner to subscribers)
    Update { op: UpdateOp, snapshot: Snapshot },
    /// Owner's confirmation of a proposal
    Accepted { op: UpdateOp, snapshot: Snapshot },
    /// Owner stopped sharing or deleted the board
    Deleted(BoardId),
    Error(String),
    ShareBoard(BoardId),
    UnshareBoard(BoardId),
    SharingBoard(BoardId),
    UnsharingBoard(BoardId),
}

impl Message {
    pub fn event(&self) -> EventName {
        match self {
            Message::GetBoardData(_) => EventName::GetBoardData,
            Message::BoardData(_) => EventName::BoardData,
            Message::Listen(_) => EventName::BoardListen,
            Message::Unlisten(_) => EventName::BoardUnlisten,
            Message::Update { op, .. } => EventName::update(*op),
            Message::Accepted { op, .. } => EventName::accepted(*op),
            Message::Deleted(_) => EventName::BoardDeleted,
            Message::Error(_) => EventName::BoardError,
            Message::ShareBoard(_) => EventName::ShareBoard,
            Message::UnshareBoard(_) => EventName::UnshareBoard,
            Message::SharingBoard(_) => EventName::SharingBoard,
            Message::UnsharingBoard(_) => EventName::UnsharingBoard,
        }
    }

    /// Board the message concerns, if any
    pub fn board_id(&self) -> Option<&BoardId> {
        match self {
            Message::GetBoardData(id)
            | Message::Listen(id)
            | Message::Unlisten(id)
            | Message::Deleted(id)
            | Message::ShareBoard(id)
            | Message::UnshareBoard(id)
            | Message::SharingBoard(id)
            | Message::UnsharingBoard(id) => Some(id),
            Message::BoardData(snapshot)
            | Message::Update { snapshot, .. }
            | Message::Accepted { snapshot, .. } => Some(&snapshot.id),
            Message::Error(_) => None,
        }
    }

    /// Encode into `(event name, payload)`
    pub fn encode(&self) -> (EventName, String) {
        let payload = match self {
            Message::GetBoardData(id)
            | Message::Listen(id)
            | Message::Unlisten(id)
            | Message::Deleted(id)
            | Message::ShareBoard(id)
            | Message::UnshareBoard(id)
            | Message::SharingBoard(id)
            | Message::UnsharingBoard(id) => id.to_string(),
            Message::BoardData(snapshot)
            | Message::Update { snapshot, .. }
            | Message::Accepted { snapshot, .. } => snapshot.encode(),
            Message::Error(text) => text.clone(),
        };
        (self.event(), payload)
    }

    pub fn decode(event: &str, payload: &str) -> Result<Self, ProtocolError> {
        let event: EventName = event.parse()?;

        let board_id = || {
            payload
                .parse::<BoardId>()
                .map_err(|source| ProtocolError::BoardId { event, source })
        };
        let snapshot = || {
            Snapshot::decode(payload).map_err(|source| ProtocolError::Payload { event, source })
        };

        Ok(match event {
            EventName::GetBoardData => Message::GetBoardData(board_id()?),
            EventName::BoardData => Message::BoardData(snapshot()?),
            EventName::BoardListen => Message::Listen(board_id()?),
            EventName::BoardUnlisten => Message::Unlisten(board_id()?),
            EventName::BoardPathUpdate => Message::Update {
                op: UpdateOp::Path,
                snapshot: snapshot()?,
            },
            EventName::BoardUndoUpdate => Message::Update {
                op: UpdateOp::Undo,
                snapshot: snapshot()?,
            },
            EventName::BoardClearUpdate => Message::Update {
                op: UpdateOp::Clear,
                snapshot: snapshot()?,
            },
            EventName::BoardPathAccepted => Message::Accepted {
                op: UpdateOp::Path,
                snapshot: snapshot()?,
            },
            EventName::BoardUndoAccepted => Message::Accepted {
                op: UpdateOp::Undo,
                snapshot: snapshot()?,
            },
            EventName::BoardClearAccepted => Message::Accepted {
                op: UpdateOp::Clear,
                snapshot: snapshot()?,
            },
            EventName::BoardDeleted => Message::Deleted(board_id()?),
            EventName::BoardError => Message::Error(payload.to_string()),
            EventName::ShareBoard => Message::ShareBoard(board_id()?),
            EventName::UnshareBoard => Message::UnshareBoard(board_id()?),
            EventName::SharingBoard => Message::SharingBoard(board_id()?),
            EventName::UnsharingBoard => Message::UnsharingBoard(board_id()?),
        })
    }
}
