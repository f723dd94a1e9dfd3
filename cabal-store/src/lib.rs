//! Append-only, multi-writer chat log for the cabal IRC gateway.
//!
//! [`LogStore`] is the surface the gateway consumes: publish, lookups,
//! lazy history reads and a process-wide event bus. [`LocalStore`] backs it
//! with SQLite.

pub mod db;
pub mod error;
pub mod message;
pub mod store;

pub use error::StoreError;
pub use message::{Content, Message, MessageKind, MessageValue, StoreEvent, UserInfo};
pub use store::{LocalStore, LogStore, PublishOptions, ReadOptions};
