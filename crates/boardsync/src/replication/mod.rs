pub mod engine;
pub mod subscription;

pub use engine::{EditOutcome, ReplicationEngine};
pub use subscription::{Listeners, SubscriptionState, Upstream};
