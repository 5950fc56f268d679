use std::path::PathBuf;

use thiserror::Error;

/// Configuration problems. These mean the playbook itself is broken, so they
/// surface to the caller instead of being logged and skipped.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config file not readable: {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {path} is not valid JSON: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("signal rule '{0}' has no match keywords")]
    EmptyRuleKeywords(String),

    #[error("criteria for product '{0}' has no sales angles")]
    NoSalesAngles(String),

    #[error("sales angle '{angle}' has invalid weight {weight}")]
    InvalidAngleWeight { angle: String, weight: f64 },

    #[error("criteria for product '{0}' has zero total weight")]
    ZeroTotalWeight(String),

    #[error("criteria for product '{0}' matches neither the sales-angle nor the need/fit/timing shape")]
    UnknownCriteriaShape(String),

    #[error("criteria for product '{product}' is malformed: {source}")]
    MalformedCriteria {
        product: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("profile weights must sum to 1.0 (got {0})")]
    ProfileWeightSum(f64),

    #[error("invalid extraction payload: {0}")]
    InvalidExtraction(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
