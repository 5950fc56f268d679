pub mod config;
pub mod db;
pub mod dictionary;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod model;
pub mod pipeline;
pub mod scoring;
pub mod signals;
pub mod snapshot;
pub mod store;

pub use error::{EngineError, EngineResult};
