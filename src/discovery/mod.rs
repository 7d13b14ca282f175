//! Node Discovery Module
//!
//! Nodes that share CPU capacity announce themselves over UDP multicast; nodes
//! that dispatch work listen and keep a roster of who is out there.
//!
//! ## Core Mechanisms
//! - **Announcements**: a JSON datagram (`magic`, address, host, OS, cores, performance
//!   index, busy/idle) sent every 3 seconds to `239.1.1.1:50000`.
//! - **Roster**: records are upserted by address on every announcement and removed once
//!   nothing was heard from them for 15 seconds.
//! - **Noise**: datagrams with a foreign magic, no cores or broken JSON are dropped silently.

pub mod roster;
pub mod service;
pub mod types;
