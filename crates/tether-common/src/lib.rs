//! # tether-common
//!
//! Shared types for the Tether network controller.
//!
//! This crate provides common functionality used across all Tether crates:
//! - The error taxonomy shared by the store, drivers and the controller
//! - Network and endpoint ID generation and name validation
//! - Generic driver option maps and well-known labels
//! - Data scopes (local vs global)

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod options;
pub mod scope;

pub use error::{ErrorKind, TetherError, TetherResult};
pub use id::{generate_id, short_id, validate_name};
pub use options::{GenericOptions, labels};
pub use scope::Scope;
