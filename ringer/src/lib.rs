//! A self-organizing ring of replicated key-value workers.
//!
//! Workers find each other by gossiping rosters until every member agrees,
//! then place each key on `replicas` consecutive up members of a
//! CRC-32 hash ring. Reads go to the lowest-latency replica; writes go to
//! all of them.
//!
//! - [`runtime`] owns a worker's state and exposes [`runtime::RingHandle`].
//! - [`connection`], [`frame`] and [`message`] carry the `type~json` line
//!   protocol between members.
//! - [`member`], [`gossip`], [`hash_ring`] and [`heartbeat`] hold the
//!   membership, convergence, placement and latency logic.
//! - [`value_store`], [`cache`] and [`store`] serve values.
//! - [`cli`], [`supervisor`], [`admin`] and [`console`] are the outer
//!   surfaces used by the `ringer` binary.

pub mod admin;
pub mod cache;
pub mod cli;
pub mod config;
pub mod connection;
pub mod console;
pub mod error;
pub mod errors;
pub mod frame;
pub mod gossip;
pub mod hash_ring;
pub mod heartbeat;
pub mod host_pattern;
pub mod member;
pub mod message;
pub mod runtime;
pub mod store;
pub mod supervisor;
pub mod timer;
pub mod value_store;
