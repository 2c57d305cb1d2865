//! Session actors: state, ingress queue, alarm-driven processing, storage.

pub mod actor;
pub mod queue;
pub mod state;
pub mod store;

pub use actor::{SessionActor, SessionCommand, SessionHandle};
pub use state::{Batch, BatchStage, BatchStatus, PendingMessage, SessionState, StoredMessage};
pub use store::{MemorySessionStore, SessionStore, SessionStoreDyn, SharedStore, SqliteSessionStore};
