//! Shared types for the Canopy workspace.
//!
//! Keep cross-crate DTOs here so the control-plane and its clients agree on
//! wire shapes without pulling server internals into client builds.

#![warn(missing_docs)]

/// Shared API DTOs for cross-crate use.
pub mod api;
