#![forbid(unsafe_code)]

//! Core utilities for the relaynet overlay transfer engine.
//!
//! This crate stays small and dependency-light. It exports the opaque
//! identifiers and transfer path used as routing keys throughout the
//! engine, shared error handling, and the settings/config layer used by
//! `relaynet-transfer`.

pub mod config;
pub mod error;
pub mod id;
pub mod path;
pub mod shuffle;

pub use error::{Error, Result};
pub use id::{Id, MultiHopId, CONTROL_ID};
pub use path::TransferPath;
