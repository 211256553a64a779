pub mod aggregator;
pub mod assets;
pub mod buckets;
pub mod cache;
pub mod config;
pub mod consumer;
pub mod engine;
pub mod error;
pub mod eviction;
pub mod feed;
pub mod graceful_shutdown;
pub mod hashing;
pub mod health;
pub mod lifecycle;
pub mod query;
pub mod recorder;
pub mod replay;
pub mod schema;
pub mod types;
pub mod volume_store;
pub mod watermark;
