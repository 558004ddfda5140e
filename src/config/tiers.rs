//! Quality tier profiles.
//!
//! A quality tier names a resource profile (VRAM ceiling, timeout, sampling
//! steps, optimization flags) chosen when a task is dispatched. The tier
//! vocabulary is configuration data: the built-in table can be replaced by a
//! TOML file.
//!
//! ```toml
//! default = "standard"
//!
//! [tiers.draft]
//! max_vram_gb = 6
//! timeout_secs = 90
//! steps = 8
//! optimizations = ["fp16"]
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Resource limits and flags for one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierProfile {
    pub max_vram_gb: u32,
    pub timeout_secs: u64,
    pub steps: u32,
    #[serde(default)]
    pub optimizations: Vec<String>,
}

impl TierProfile {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// The outcome of a tier lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTier {
    /// Name of the tier whose profile applies.
    pub name: String,
    pub profile: TierProfile,
    /// What the request asked for, if anything.
    pub requested: Option<String>,
    /// True when the request named no tier or an unknown one.
    pub fell_back: bool,
}

#[derive(Debug, Deserialize)]
struct TierFile {
    default: String,
    tiers: BTreeMap<String, TierProfile>,
}

/// Lookup table from tier name to profile, with a default for unknown names.
#[derive(Debug, Clone)]
pub struct TierTable {
    default_tier: String,
    tiers: BTreeMap<String, TierProfile>,
}

impl TierTable {
    /// The `low / standard / high / premium` table, defaulting to `standard`.
    pub fn builtin() -> Self {
        let profile = |max_vram_gb, timeout_secs, steps, optimizations: &[&str]| TierProfile {
            max_vram_gb,
            timeout_secs,
            steps,
            optimizations: optimizations.iter().map(|s| s.to_string()).collect(),
        };

        let mut tiers = BTreeMap::new();
        tiers.insert("low".to_string(), profile(6, 120, 12, &["fp16", "tiled_vae"]));
        tiers.insert("standard".to_string(), profile(12, 300, 25, &["fp16"]));
        tiers.insert("high".to_string(), profile(16, 600, 40, &[]));
        tiers.insert("premium".to_string(), profile(24, 1200, 60, &["hires_fix"]));

        Self {
            default_tier: "standard".to_string(),
            tiers,
        }
    }

    /// Build a table, checking that the default names a defined tier.
    pub fn new(default_tier: &str, tiers: BTreeMap<String, TierProfile>) -> Result<Self> {
        let tiers: BTreeMap<String, TierProfile> = tiers
            .into_iter()
            .map(|(name, profile)| (name.to_ascii_lowercase(), profile))
            .collect();
        let default_tier = default_tier.to_ascii_lowercase();

        if tiers.is_empty() {
            return Err(Error::Config("tier table defines no tiers".to_string()));
        }
        if !tiers.contains_key(&default_tier) {
            return Err(Error::Config(format!(
                "default tier {default_tier:?} is not defined"
            )));
        }
        for (name, profile) in &tiers {
            if profile.timeout_secs == 0 || profile.steps == 0 {
                return Err(Error::Config(format!(
                    "tier {name:?} needs a non-zero timeout_secs and steps"
                )));
            }
        }

        Ok(Self {
            default_tier,
            tiers,
        })
    }

    /// Load a table from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read tier file {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad tier file {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let file: TierFile =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        Self::new(&file.default, file.tiers)
    }

    pub fn default_tier(&self) -> &str {
        &self.default_tier
    }

    pub fn get(&self, name: &str) -> Option<&TierProfile> {
        self.tiers.get(&name.to_ascii_lowercase())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tiers.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TierProfile)> {
        self.tiers.iter().map(|(name, profile)| (name.as_str(), profile))
    }

    /// Resolve a requested tier. Missing or unknown names resolve to the
    /// default tier instead of failing.
    pub fn resolve(&self, requested: Option<&str>) -> ResolvedTier {
        let requested = requested.map(str::trim).filter(|s| !s.is_empty());

        if let Some(name) = requested {
            let key = name.to_ascii_lowercase();
            if let Some(profile) = self.tiers.get(&key) {
                return ResolvedTier {
                    name: key,
                    profile: profile.clone(),
                    requested: Some(name.to_string()),
                    fell_back: false,
                };
            }
            warn!(
                requested = name,
                default = %self.default_tier,
                "unknown quality tier, using default"
            );
        }

        ResolvedTier {
            name: self.default_tier.clone(),
            profile: self.tiers[&self.default_tier].clone(),
            requested: requested.map(str::to_string),
            fell_back: true,
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_defaults_to_standard() {
        let table = TierTable::builtin();
        assert_eq!(table.default_tier(), "standard");
        assert_eq!(
            table.names().collect::<Vec<_>>(),
            vec!["high", "low", "premium", "standard"]
        );
    }

    #[test]
    fn known_tiers_resolve_case_insensitively() {
        let table = TierTable::builtin();
        let resolved = table.resolve(Some("HIGH"));
        assert_eq!(resolved.name, "high");
        assert!(!resolved.fell_back);
        assert_eq!(resolved.profile.max_vram_gb, 16);
    }

    #[test]
    fn missing_and_blank_tiers_fall_back() {
        let table = TierTable::builtin();
        for requested in [None, Some(""), Some("   ")] {
            let resolved = table.resolve(requested);
            assert_eq!(resolved.name, "standard");
            assert!(resolved.fell_back);
            assert_eq!(resolved.requested, None);
        }
    }

    #[test]
    fn file_table_replaces_vocabulary() {
        let table = TierTable::from_toml(
            r#"
            default = "Draft"

            [tiers.draft]
            max_vram_gb = 6
            timeout_secs = 90
            steps = 8

            [tiers.final]
            max_vram_gb = 24
            timeout_secs = 900
            steps = 50
            optimizations = ["hires_fix"]
            "#,
        )
        .unwrap();

        assert_eq!(table.default_tier(), "draft");
        assert!(table.get("standard").is_none());
        assert_eq!(table.resolve(Some("standard")).name, "draft");
        assert_eq!(table.get("final").unwrap().optimizations, vec!["hires_fix"]);
    }

    #[test]
    fn undefined_default_is_rejected() {
        let err = TierTable::from_toml(
            r#"
            default = "ultra"

            [tiers.low]
            max_vram_gb = 6
            timeout_secs = 90
            steps = 8
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("ultra"));
    }
}
