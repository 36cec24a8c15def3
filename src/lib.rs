//! Stochastic peer-address manager.
//!
//! This crate keeps the long-lived, in-memory catalog of known network
//! peers from which a node picks outbound connections: up to roughly
//! twenty thousand address records partitioned into *new* (never
//! confirmed reachable) and *tried* (confirmed at least once)
//! populations, spread over fixed-size buckets whose placement is
//! salted with a secret key so that an attacker flooding the node with
//! fabricated addresses can neither predict nor monopolize where they
//! land.
//!
//! The two components are [`AddressManager`], the bucketed address
//! table, and [`AddrStats`], a sliding-window sightings tracker that
//! serves as a parallel popularity signal. Both persist independently
//! to checksummed local files via the [`store`] module.
#![allow(clippy::new_without_default)]
#![allow(clippy::single_match)]
#![deny(unsafe_code)]
pub mod addrmgr;
pub mod collections;
pub mod error;
pub mod hash;
pub mod peer;
pub mod stats;
pub mod store;
pub mod time;

pub use bitcoin;

pub use addrmgr::AddressManager;
pub use error::Error;
pub use hash::Key;
pub use peer::{AddrInfo, Source};
pub use stats::AddrStats;
pub use time::{Clock, LocalDuration, LocalTime, RefClock};
