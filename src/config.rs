use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ::config::{Config, Environment, File};
use serde::Deserialize;
use tracing::info;

use crate::dictionary::Dictionary;
use crate::error::{EngineError, EngineResult};
use crate::scoring::profile::ProfileWeights;
use crate::scoring::ScoringCriteria;
use crate::signals::{load_rules, SalesSignalRule};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_path: PathBuf,
    /// Built-in dictionary when unset.
    pub dictionary_path: Option<PathBuf>,
    pub rules_path: PathBuf,
    pub criteria_dir: PathBuf,
    /// Rayon threads for `run`; 0 lets rayon decide.
    pub workers: usize,
    pub profile_weights: ProfileWeights,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/signals.sqlite"),
            dictionary_path: None,
            rules_path: PathBuf::from("data/signal_rules.json"),
            criteria_dir: PathBuf::from("data/criteria"),
            workers: 0,
            profile_weights: ProfileWeights::default(),
        }
    }
}

impl Settings {
    /// Optional `signals.toml`, then `SIGNALS_*` env (`SIGNALS_DATABASE_PATH`,
    /// `SIGNALS_WORKERS`, ...).
    pub fn load() -> Result<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::with_name("signals").required(false))
            .add_source(Environment::with_prefix("SIGNALS").try_parsing(true))
            .build()
            .context("reading settings")?
            .try_deserialize()
            .context("decoding settings")?;
        settings.profile_weights.validate()?;
        Ok(settings)
    }

    pub fn dictionary(&self) -> EngineResult<Dictionary> {
        match &self.dictionary_path {
            Some(path) => Dictionary::load(path),
            None => Ok(Dictionary::builtin()),
        }
    }

    pub fn rules(&self) -> EngineResult<Vec<SalesSignalRule>> {
        load_rules(&self.rules_path)
    }

    pub fn criteria(&self) -> EngineResult<Vec<(String, ScoringCriteria)>> {
        load_criteria_dir(&self.criteria_dir)
    }
}

/// Every `*.json` in `dir`, sorted by product id.
pub fn load_criteria_dir(dir: &Path) -> EngineResult<Vec<(String, ScoringCriteria)>> {
    let read_err = |source| EngineError::ConfigRead {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(read_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_err)?
        .into_iter()
        .map(|entry| entry.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let products = paths
        .iter()
        .map(|p| ScoringCriteria::load(p))
        .collect::<EngineResult<Vec<_>>>()?;
    info!(dir = %dir.display(), products = products.len(), "criteria loaded");
    Ok(products)
}
