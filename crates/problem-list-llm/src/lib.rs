//! Delta extraction oracle contract.
//!
//! This crate defines what is sent to the natural-language extraction service
//! and how its (untrusted) answer is turned into validated [`ProblemChange`]s.
//! The service itself sits behind the [`ExtractionOracle`] trait: a canned
//! implementation backs deterministic tests and [`HttpOracle`] (feature
//! `http`) talks to an Ollama-compatible endpoint.

pub mod contract;
pub mod extraction;
pub mod oracle;
pub mod prompts;

#[cfg(feature = "http")]
pub mod http;

pub use contract::*;
pub use extraction::*;
pub use oracle::*;
pub use prompts::*;

#[cfg(feature = "http")]
pub use http::{HttpOracle, HttpOracleConfig};
