//! Core types, config, errors, and session model for Parley.

pub mod config;
pub mod error;
pub mod protocol;
pub mod session;

pub use error::{ParleyError, Result, Stage};
