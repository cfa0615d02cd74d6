//! Infrastructure adapters for the scheduler's queue and completion mailbox.

pub mod mailbox;
pub mod queue;
pub use mailbox::InMemoryMailbox;
pub use queue::InMemoryQueue;
