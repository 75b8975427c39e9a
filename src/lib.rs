//! ImageHive Library
//!
//! Core library for the ImageHive image service: device inventory, vision
//! instance registry, inference dispatch, and the chained task pipeline
//! scheduler. The HTTP layer and desktop UI live outside this crate.

pub mod pipeline;
pub mod sources;
pub mod storage;
pub mod system;
pub mod types;
pub mod vision;

/// Initialize tracing for binaries embedding this crate.
///
/// Respects `RUST_LOG`; defaults to `info` for the crate's own spans.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("imagehive=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
