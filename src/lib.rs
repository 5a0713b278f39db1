//! # Cairn
//!
//! A Redis-compatible in-memory key-value store.
//!
//! Cairn speaks RESP2 over TCP and keeps strings, lists, hashes and sets in a
//! sharded table guarded by striped key locks. Keys expire through a timing
//! wheel, writes can be logged to an append-only file that is replayed and
//! compacted, and several nodes can split the key space over a consistent
//! hash ring, running multi-key writes as two-phase transactions.

pub mod cluster;
pub mod command;
pub mod config;
pub mod error;
pub mod glob;
pub mod persistence;
pub mod resp;
pub mod server;
pub mod store;
pub mod timewheel;
