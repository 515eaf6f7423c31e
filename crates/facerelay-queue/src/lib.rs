//! facerelay-queue: Message contracts and queue transport.
//!
//! Defines the JSON bodies exchanged between the stages and the
//! at-least-once queue abstraction they travel on, with an in-process
//! implementation and a SQLite-backed one shared between daemons.

pub mod memory;
pub mod messages;
pub mod queue;
pub mod sqlite;

pub use memory::MemoryQueue;
pub use messages::{Classification, InboundEvent, MessageError, ResultMessage, WorkItem};
pub use queue::{Delivery, Queue, QueueError, Receipt, Sink};
pub use sqlite::SqliteQueue;
