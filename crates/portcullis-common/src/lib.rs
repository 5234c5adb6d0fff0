//! # portcullis-common
//!
//! Shared types for the portcullis container networking tools.
//!
//! This crate provides the pieces every other portcullis crate leans on:
//! - The unified error type and its result alias
//! - Validated container handles
//! - Standard state file locations

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{PortcullisError, PortcullisResult};
pub use id::ContainerId;
pub use paths::PortcullisPaths;
