//! The durable half of the relay (spec.md §4.2): thread state, the bounded
//! message log, the artifact index, and the auth collaborator's tables,
//! behind a single [`Storage`] trait so callers never see SQL.

mod models;
mod sqlite;
mod traits;

pub use models::{
    AnchorSessionRecord, ArtifactRecord, ChallengeRecord, DeviceCodeRecord, NewArtifact,
    SessionRecord, ThreadMessage, ThreadState,
};
pub use sqlite::SqliteStorage;
pub use traits::Storage;
