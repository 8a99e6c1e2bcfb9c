// src/lib.rs
pub mod config;
pub mod pool;
pub mod proxy;
pub mod rid;
pub mod source;
pub mod testing;

// Re-export the main surface
pub use config::PoolConfig;
pub use pool::{PoolError, SourceRef};
pub use proxy::{ProxyBand, ProxyDataset};
pub use source::{AccessMode, GeoTransform, Source, SourceBand, SourceOpener};

// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
