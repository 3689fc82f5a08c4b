//! Shared type definitions
//!
//! Data types passed between the catalog, the supervisor and the HTTP front ends.

pub mod config;
pub mod model;
