pub mod analyzer;
pub mod api;
pub mod batch;
pub mod cache;
pub mod config;
pub mod editor;
pub mod engine;
pub mod error;
pub mod health;
pub mod ingest;
pub mod integration;
pub mod models;
pub mod profiler;
pub mod queue;
pub mod search;
pub mod service;
pub mod store;
pub mod transport;

pub use config::Config;
pub use error::GraphError;
pub use service::GraphService;
