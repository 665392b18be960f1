//! Reconstruction settings, stored as a TOML document.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::algorithm::AlgorithmOptions;
use crate::enums::{AlgorithmKind, AlignmentMethod, OutputOrientation};
use crate::error::ReconstructError;
use crate::planner::DEFAULT_MAX_VOXELS;
use crate::temporal::{CorrelationSettings, DEFAULT_MAX_TIME_DIFF, TemporalAligner, TimeCalibration};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read or write settings: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error(transparent)]
    Invalid(#[from] ReconstructError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructParams {
    /// Algorithm name, see [`AlgorithmKind`].
    pub algorithm: String,
    pub orientation: OutputOrientation,
    /// Shrink the input rectangle by this percentage on every side.
    pub mask_reduce: f64,
    /// Estimation used when `time_calibration` is absent.
    pub alignment_method: AlignmentMethod,
    /// Reconstruct flow (coloured pixels) only.
    pub angio: bool,
    /// Largest gap between positions a frame may be interpolated across (ms).
    pub max_time_diff: f64,
    pub max_voxels: usize,
    /// Output spacing (mm). Smallest input pixel spacing when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spacing: Option<f64>,
    /// Worker threads for the fill. Rayon's global pool when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_calibration: Option<TimeCalibration>,
    pub correlation: CorrelationSettings,
    pub algorithm_options: AlgorithmOptions,
}

impl Default for ReconstructParams {
    fn default() -> Self {
        Self {
            algorithm: AlgorithmKind::default().name().to_string(),
            orientation: OutputOrientation::default(),
            mask_reduce: 3.0,
            alignment_method: AlignmentMethod::default(),
            angio: false,
            max_time_diff: DEFAULT_MAX_TIME_DIFF,
            max_voxels: DEFAULT_MAX_VOXELS,
            spacing: None,
            threads: None,
            time_calibration: None,
            correlation: CorrelationSettings::default(),
            algorithm_options: AlgorithmOptions::default(),
        }
    }
}

impl ReconstructParams {
    pub fn algorithm_kind(&self) -> Result<AlgorithmKind, ReconstructError> {
        self.algorithm.parse()
    }

    pub fn aligner(&self) -> TemporalAligner {
        TemporalAligner::new(self.max_time_diff)
            .with_method(self.alignment_method)
            .with_correlation(self.correlation)
    }

    /// Checks that do not need any input data.
    pub fn validate(&self) -> Result<(), ReconstructError> {
        self.algorithm_kind()?;
        if !(self.mask_reduce.is_finite() && (0.0..50.0).contains(&self.mask_reduce)) {
            return Err(ReconstructError::invalid_option(
                "mask_reduce",
                "must be a percentage below 50",
            ));
        }
        if !(self.max_time_diff.is_finite() && self.max_time_diff > 0.0) {
            return Err(ReconstructError::invalid_option("max_time_diff", "must be positive"));
        }
        if self.max_voxels == 0 {
            return Err(ReconstructError::invalid_option("max_voxels", "must be positive"));
        }
        if let Some(spacing) = self.spacing
            && !(spacing.is_finite() && spacing > 0.0)
        {
            return Err(ReconstructError::invalid_option("spacing", "must be positive"));
        }
        if self.threads == Some(0) {
            return Err(ReconstructError::invalid_option("threads", "must be at least 1"));
        }
        if let Some(calibration) = &self.time_calibration {
            calibration.validate()?;
        }
        self.correlation.validate()
    }

    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        let params: Self = toml::from_str(text)?;
        params.validate()?;
        Ok(params)
    }

    pub fn to_toml_string(&self) -> Result<String, SettingsError> {
        Ok(toml::to_string(self)?)
    }

    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = fs::read_to_string(path)?;
        let params = Self::from_toml_str(&text)?;
        log::info!("Loaded reconstruction settings from {}", path.display());
        Ok(params)
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_round_trip() {
        let mut params = ReconstructParams {
            algorithm: "splat".into(),
            orientation: OutputOrientation::MeanFrame,
            spacing: Some(0.4),
            threads: Some(3),
            time_calibration: Some(TimeCalibration::new(-12.5, 1.0)),
            ..Default::default()
        };
        params.algorithm_options.splat.sigma = Some(0.6);
        params.algorithm_options.splat.fill_holes = false;

        let text = params.to_toml_string().unwrap();
        assert!(text.contains("algorithm = \"splat\""));
        assert_eq!(ReconstructParams::from_toml_str(&text).unwrap(), params);
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let params = ReconstructParams::from_toml_str(
            r#"
            algorithm = "DW"
            alignment_method = "SpanFit"

            [algorithm_options.average]
            radius = 1.5
            "#,
        )
        .unwrap();
        assert_eq!(params.algorithm_kind().unwrap(), AlgorithmKind::LocalAverage);
        assert_eq!(params.alignment_method, AlignmentMethod::SpanFit);
        assert_eq!(params.algorithm_options.average.radius, Some(1.5));
        assert_eq!(params.max_time_diff, DEFAULT_MAX_TIME_DIFF);
        assert!(params.algorithm_options.splat.fill_holes);
        assert!(params.time_calibration.is_none());
    }

    #[test]
    fn test_invalid_documents() {
        assert!(matches!(
            ReconstructParams::from_toml_str("algorithm = \"thunder\""),
            Err(SettingsError::Invalid(ReconstructError::UnknownAlgorithm(_)))
        ));
        assert!(matches!(
            ReconstructParams::from_toml_str("max_time_diff = -1.0"),
            Err(SettingsError::Invalid(ReconstructError::InvalidOption { .. }))
        ));
        assert!(matches!(
            ReconstructParams::from_toml_str("max_voxels = \"many\""),
            Err(SettingsError::Parse(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("us-reconstruct-settings-{}.toml", std::process::id()));
        let params = ReconstructParams {
            angio: true,
            ..Default::default()
        };
        params.save(&path).unwrap();
        assert_eq!(ReconstructParams::load(&path).unwrap(), params);
        std::fs::remove_file(&path).unwrap();
    }
}
