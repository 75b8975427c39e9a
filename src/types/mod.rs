//! Shared type definitions
//!
//! This module contains all shared data types used across the crate.

pub mod device;
pub mod image;
pub mod task;
