//! Shared helpers for the alternator binaries.

pub mod bootstrap;
