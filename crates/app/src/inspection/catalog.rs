//! Threshold catalog: per-model class gates and per-profile head limits.
//!
//! ```toml
//! [models.bf_defects]
//! confidence = 0.25
//! classes = "rust:80%, dent:90%"
//! sizes = { rust = 1000 }
//!
//! [profiles.standard]
//! min = 180
//! max = 240
//! ```
//!
//! `classes` and `sizes` accept either a table or the legacy `name:value`
//! list that operators type into the threshold form.

use std::{collections::HashMap, fs, path::Path};

use anyhow::{Context, Result, bail};
use ml_core::{ClassThresholds, DEFAULT_MODEL_CONFIDENCE};
use serde::Deserialize;
use tracing::warn;

use crate::inspection::head_shape::HeadLimits;

/// Source of thresholds, read once per worker at startup.
pub trait ThresholdCatalog: Send + Sync {
    fn class_thresholds(&self, model: &str) -> Result<ClassThresholds>;
    fn head_limits(&self, profile: &str) -> Result<HeadLimits>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ThresholdList {
    Table(HashMap<String, u32>),
    Legacy(String),
}

impl ThresholdList {
    fn resolve(&self) -> Result<HashMap<String, u32>> {
        match self {
            ThresholdList::Table(map) => Ok(map.clone()),
            ThresholdList::Legacy(text) => parse_threshold_pairs(text),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelEntry {
    confidence: Option<f32>,
    classes: Option<ThresholdList>,
    sizes: Option<ThresholdList>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    #[serde(default)]
    models: HashMap<String, ModelEntry>,
    #[serde(default)]
    profiles: HashMap<String, HeadLimits>,
}

/// TOML-backed catalog.
#[derive(Debug, Clone, Default)]
pub struct FileCatalog {
    file: CatalogFile,
}

impl FileCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read threshold catalog {}", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("invalid threshold catalog {}", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(text)?;
        for (name, limits) in &file.profiles {
            if limits.min > limits.max {
                bail!("profile {name}: min {} exceeds max {}", limits.min, limits.max);
            }
        }
        Ok(Self { file })
    }
}

impl ThresholdCatalog for FileCatalog {
    fn class_thresholds(&self, model: &str) -> Result<ClassThresholds> {
        let Some(entry) = self.file.models.get(model) else {
            warn!(model, "no thresholds configured for model; using defaults");
            return Ok(ClassThresholds::default());
        };
        let confidence = match &entry.classes {
            Some(list) => list
                .resolve()
                .with_context(|| format!("model {model}: bad class thresholds"))?,
            None => HashMap::new(),
        };
        let sizes = match &entry.sizes {
            Some(list) => list
                .resolve()
                .with_context(|| format!("model {model}: bad size thresholds"))?,
            None => HashMap::new(),
        };
        let model_confidence = entry.confidence.unwrap_or(DEFAULT_MODEL_CONFIDENCE);
        if !(0.0..=1.0).contains(&model_confidence) {
            bail!("model {model}: confidence {model_confidence} is outside 0.0..=1.0");
        }
        Ok(ClassThresholds::new(confidence, sizes, model_confidence))
    }

    fn head_limits(&self, profile: &str) -> Result<HeadLimits> {
        match self.file.profiles.get(profile) {
            Some(limits) => Ok(*limits),
            None => {
                warn!(profile, "no head limits for profile; using defaults");
                Ok(HeadLimits::default())
            }
        }
    }
}

/// Parse `"rust:80%, dent:90"` into a name to value map. A trailing `%` is
/// accepted and ignored.
pub fn parse_threshold_pairs(text: &str) -> Result<HashMap<String, u32>> {
    let mut out = HashMap::new();
    for pair in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((name, value)) = pair.split_once(':') else {
            bail!("expected <name>:<value>, got {pair:?}");
        };
        let name = name.trim();
        if name.is_empty() {
            bail!("missing class name in {pair:?}");
        }
        let value = value
            .trim()
            .trim_end_matches('%')
            .trim()
            .parse::<u32>()
            .with_context(|| format!("bad threshold value in {pair:?}"))?;
        out.insert(name.to_string(), value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_pairs() {
        let parsed = parse_threshold_pairs("rust:80%, dent:90%,damage: 75").unwrap();
        assert_eq!(parsed["rust"], 80);
        assert_eq!(parsed["dent"], 90);
        assert_eq!(parsed["damage"], 75);
        assert!(parse_threshold_pairs("").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_pairs_fail() {
        assert!(parse_threshold_pairs("rust=80").is_err());
        assert!(parse_threshold_pairs("rust:eighty").is_err());
        assert!(parse_threshold_pairs(":80").is_err());
    }

    #[test]
    fn test_catalog_mixes_forms() {
        let catalog = FileCatalog::from_toml_str(
            r#"
            [models.bf]
            confidence = 0.3
            classes = "rust:80%"
            sizes = { rust = 1000 }

            [profiles.standard]
            min = 170
            max = 230
            "#,
        )
        .unwrap();
        let thresholds = catalog.class_thresholds("bf").unwrap();
        assert_eq!(thresholds.model_confidence(), 0.3);
        assert_eq!(thresholds.class_confidence("rust"), 0.8);
        assert_eq!(thresholds.min_area("rust"), 1000.0);
        let limits = catalog.head_limits("standard").unwrap();
        assert_eq!(limits.min, 170.0);
    }

    #[test]
    fn test_missing_entries_fall_back() {
        let catalog = FileCatalog::default();
        let thresholds = catalog.class_thresholds("od").unwrap();
        assert_eq!(thresholds.model_confidence(), DEFAULT_MODEL_CONFIDENCE);
        assert_eq!(catalog.head_limits("any").unwrap(), HeadLimits::default());
    }

    #[test]
    fn test_bad_legacy_string_fails_lookup() {
        let catalog = FileCatalog::from_toml_str(
            r#"
            [models.od]
            classes = "rust 80"
            "#,
        )
        .unwrap();
        assert!(catalog.class_thresholds("od").is_err());
    }

    #[test]
    fn test_inverted_profile_rejected() {
        let err = FileCatalog::from_toml_str(
            r#"
            [profiles.bad]
            min = 250
            max = 200
            "#,
        );
        assert!(err.is_err());
    }
}
