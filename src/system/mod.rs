//! System probing
//!
//! Enumerates compute devices and their memory.

pub mod devices;
