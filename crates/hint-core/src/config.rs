//! Centralized configuration management with TOML support.
//!
//! Provides the construction parameters for a hierarchical invertible layer
//! with load/save capabilities and upfront validation.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{HintError, Result};

/// Where the channel-mixing permutation is applied around the coupling split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermuteMode {
    /// No permutation.
    None,
    /// Permute only the lower (second) half after splitting.
    Lower,
    /// Permute the whole tensor on entry and un-permute on exit.
    Both,
    /// Permute the whole tensor on entry only.
    Full,
}

/// Which reference coupling block the standard constructor builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CouplingKind {
    /// Volume-preserving additive coupling (logdet 0).
    Additive,
    /// Affine coupling with soft-clamped log-scale (nonzero logdet).
    Affine,
}

/// Construction parameters for a hierarchical invertible layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HintConfig {
    /// Number of spatial dimensions (2 for images, 3 for volumes).
    pub spatial_rank: usize,
    /// Channel count of the input tensor.
    pub n_channels: usize,
    /// Hidden width of the per-block conditioner network.
    pub hidden_channels: usize,
    /// Reference coupling block variant.
    pub coupling: CouplingKind,
    /// Soft-clamp bound on the affine log-scale.
    pub clamp: f64,
    /// Permutation placement.
    pub permute: PermuteMode,
    /// Whether public calls return the Jacobian log-determinant.
    pub logdet: bool,
    /// Seed for the fixed channel shuffle permutation.
    pub seed: u64,
}

impl Default for HintConfig {
    fn default() -> Self {
        Self {
            spatial_rank: 2,
            n_channels: 8,
            hidden_channels: 32,
            coupling: CouplingKind::Affine,
            clamp: 2.0,
            permute: PermuteMode::None,
            logdet: true,
            seed: 0,
        }
    }
}

impl HintConfig {
    /// Validate configuration values.
    ///
    /// The channel count must halve exactly (staying even) until it reaches
    /// a width of at most 4, and the leaf width itself must still be even so
    /// the final split is well defined. Anything else would force the
    /// recursion to round block sizes, which silently breaks invertibility.
    pub fn validate(&self) -> Result<()> {
        if self.spatial_rank != 2 && self.spatial_rank != 3 {
            return Err(HintError::Config(format!(
                "spatial_rank must be 2 or 3, got {}",
                self.spatial_rank
            )));
        }
        if self.hidden_channels == 0 {
            return Err(HintError::Config("hidden_channels must be > 0".into()));
        }
        if self.clamp <= 0.0 {
            return Err(HintError::Config(format!(
                "clamp must be > 0, got {}",
                self.clamp
            )));
        }
        let mut c = self.n_channels;
        if c < 2 {
            return Err(HintError::Config(format!(
                "n_channels must be >= 2, got {}",
                c
            )));
        }
        while c > 4 {
            if c % 2 != 0 {
                return Err(HintError::Config(format!(
                    "n_channels={} is not exactly halvable down to a leaf width <= 4 \
                     (stuck at odd width {})",
                    self.n_channels, c
                )));
            }
            c /= 2;
        }
        if c % 2 != 0 {
            return Err(HintError::Config(format!(
                "n_channels={} reaches odd leaf width {}, which cannot be split",
                self.n_channels, c
            )));
        }
        Ok(())
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| HintError::Config(format!("TOML serialization failed: {e}")))?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        HintConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_non_halvable_channels() {
        for bad in [1, 3, 5, 6, 12, 24] {
            let cfg = HintConfig {
                n_channels: bad,
                ..Default::default()
            };
            assert!(
                cfg.validate().is_err(),
                "n_channels={} should be rejected",
                bad
            );
        }
        for good in [2, 4, 8, 16, 64] {
            let cfg = HintConfig {
                n_channels: good,
                ..Default::default()
            };
            cfg.validate().unwrap();
        }
    }

    #[test]
    fn test_rejects_bad_spatial_rank() {
        let cfg = HintConfig {
            spatial_rank: 4,
            ..Default::default()
        };
        assert!(cfg.validate().unwrap_err().is_config());
    }

    #[test]
    fn test_toml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hint.toml");
        let cfg = HintConfig {
            n_channels: 16,
            permute: PermuteMode::Both,
            coupling: CouplingKind::Additive,
            ..Default::default()
        };
        cfg.save(&path).unwrap();
        let loaded = HintConfig::load(&path).unwrap();
        assert_eq!(loaded.n_channels, 16);
        assert_eq!(loaded.permute, PermuteMode::Both);
        assert_eq!(loaded.coupling, CouplingKind::Additive);
    }
}
