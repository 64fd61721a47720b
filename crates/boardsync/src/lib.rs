// Board model
pub mod document;
pub mod registry;
pub mod types;

// Wire and connections
pub mod proto;
pub mod protocol;
pub mod transport;

// Sync
pub mod config;
pub mod directory;
pub mod discovery;
pub mod peer;
pub mod replication;

// Public exports
pub use config::Config;
pub use directory::DirectoryServer;
pub use discovery::{DirectoryLink, DiscoveryClient, InMemoryDirectoryLink, TcpDirectoryLink};
pub use document::{Document, LocalEdit, Snapshot, SnapshotError, UpdateOp};
pub use peer::{Peer, PeerError};
pub use protocol::{EventName, Message, ProtocolError};
pub use registry::{BoardEntry, BoardInfo, Registry};
pub use replication::{EditOutcome, ReplicationEngine, SubscriptionState};
pub use transport::{Connection, PeerLink, TransportError};
pub use types::{BoardId, Color, ParseError, Path, Point};
