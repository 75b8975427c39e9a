//! Vision engine
//!
//! This module owns the loaded vision instances (registry), the opaque
//! inference capability seam (backend), and single-call dispatch.

pub mod backend;
pub mod dispatcher;
pub mod registry;
