//! Ferry Node Library
//!
//! Session pipeline for the ferry file-transfer tool: rendezvous discovery
//! over multicast DNS and the public DHT, peer-state tracking, and the
//! password-authenticated key exchange that gates the transfer handoff.

pub mod network;
pub mod telemetry;
