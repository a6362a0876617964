//! Core shared logic for ferry
//!
//! This crate contains the pure rendezvous-identifier derivation used by both
//! sides of a ferry session. No I/O, no async — everything here is a function
//! of its inputs so both endpoints compute byte-identical results.

mod discovery_id;

pub use discovery_id::{ContentId, Deriver, DEFAULT_SLOT_LENGTH};
