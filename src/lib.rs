// Record model and merge engine
pub mod error;
pub mod filelist;
pub mod histogram;
pub mod merge;

// Comparison engine
pub mod compare;
pub mod compare_config;
pub mod metrics;

// Storage
pub mod clickhouse_client;
pub mod implementations;
pub mod traits;

// Service and REST surface
pub mod auth;
pub mod config;
pub mod server;
pub mod service;

pub use error::{Error, Result};
pub use histogram::Histogram;
