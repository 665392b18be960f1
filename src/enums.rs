use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ReconstructError;

/// Slicing axis of the output volume, for image export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Axial,
    Coronal,
    Sagittal,
}

/// Voxel filling algorithm, selected by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AlgorithmKind {
    /// Nearest pixel of the closest frame plane.
    #[default]
    NearestFrame,
    /// Distance weighted average over nearby frames.
    LocalAverage,
    /// Gaussian splatting of every input pixel.
    GaussianSplat,
}

impl AlgorithmKind {
    pub const ALL: [AlgorithmKind; 3] = [
        AlgorithmKind::NearestFrame,
        AlgorithmKind::LocalAverage,
        AlgorithmKind::GaussianSplat,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AlgorithmKind::NearestFrame => "nearest",
            AlgorithmKind::LocalAverage => "average",
            AlgorithmKind::GaussianSplat => "splat",
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AlgorithmKind {
    type Err = ReconstructError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nearest" | "vnn" | "nearestframe" => Ok(AlgorithmKind::NearestFrame),
            "average" | "dw" | "localaverage" => Ok(AlgorithmKind::LocalAverage),
            "splat" | "gaussian" | "pnn" | "gaussiansplat" => Ok(AlgorithmKind::GaussianSplat),
            _ => Err(ReconstructError::UnknownAlgorithm(s.to_string())),
        }
    }
}

/// Orientation of the output volume axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputOrientation {
    /// Axes of the patient reference space.
    #[default]
    PatientReference,
    FirstFrame,
    MiddleFrame,
    /// Normalized mean of all frame orientations.
    MeanFrame,
}

/// How to estimate the time offset between frames and positions when no
/// explicit calibration is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AlignmentMethod {
    Disabled,
    /// Map the position time span onto the frame time span.
    SpanFit,
    /// Correlate frame motion with tracked probe speed.
    #[default]
    MotionCorrelation,
}

/// Lifecycle of a reconstructer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconstructState {
    #[default]
    Idle,
    DataLoaded,
    Aligned,
    VolumePlanned,
    Reconstructing,
    Done,
    Error,
}
