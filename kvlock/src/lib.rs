//! Mutual exclusion for clients of a shared key-value store that has no
//! locking primitive of its own: no compare-and-swap, no transactions, only
//! `get`, `set` and `delete`.
//!
//! A lock name maps to two keys. Contenders claim both with expiring lease
//! records and resolve races by checking who wrote the first key last (see
//! [`protocol`]). Holders keep their lease alive in the background while the
//! critical section runs; holders that vanish simply stop renewing and their
//! lease ages out. The guarantee is best effort: randomized backoff makes
//! livelock between contenders unlikely, not impossible.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backoff;
pub mod config;
pub mod error;
pub mod lease;
pub mod manager;
pub mod protocol;
pub mod release;
pub mod renewal;
pub mod sequencer;
pub mod storage;
pub mod time;

pub mod test_utils;

pub use config::{LockConfig, Sequencing};
pub use error::{Error, Result};
pub use lease::{LeaseRecord, LockKeys, OwnerToken};
pub use manager::{LockManager, LockStatus};
pub use storage::{InMemoryStorage, Storage};
