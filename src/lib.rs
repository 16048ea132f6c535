//! Courier service wiring.
//!
//! The binary in `main.rs` loads [`Config`] and assembles the publishing
//! pipeline and recovery engine from the `courier-core` and
//! `courier-delivery` crates.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;

pub use config::Config;
