use serde::{Deserialize, Serialize};

use super::{CancelToken, FillOutcome, ReconstructAlgorithm, ReconstructInput, check_positive, fill_voxels};
use crate::error::ReconstructError;
use crate::volume::OutputVolume;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AverageOptions {
    /// Frames closer than this (mm) contribute. Twice the volume spacing
    /// when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,
}

/// Distance weighted average of bilinear samples from every nearby frame,
/// with weight `1 - d / radius`.
#[derive(Debug, Clone)]
pub struct LocalAverage {
    options: AverageOptions,
}

impl LocalAverage {
    pub fn new(options: AverageOptions) -> Result<Self, ReconstructError> {
        check_positive("average.radius", options.radius)?;
        Ok(Self { options })
    }
}

impl ReconstructAlgorithm for LocalAverage {
    fn name(&self) -> &'static str {
        "local average"
    }

    fn reconstruct(
        &self,
        input: &ReconstructInput,
        volume: &mut OutputVolume,
        cancel: &CancelToken,
    ) -> Result<FillOutcome, ReconstructError> {
        let radius = self.options.radius.unwrap_or(2.0 * volume.params().spacing);

        let outcome = fill_voxels(input, volume, cancel, radius, |candidates, p_d| {
            let (mut sum, mut weights) = (0.0, 0.0);
            for &i in candidates {
                let p_u = input.to_frame(i, p_d);
                let distance = p_u.z.abs();
                if distance >= radius {
                    continue;
                }
                if let Some(v) = input.sample_bilinear(i, &p_u) {
                    let w = 1.0 - distance / radius;
                    sum += w * v;
                    weights += w;
                }
            }
            (weights > 0.0).then(|| (sum / weights).round().clamp(0.0, 255.0) as u8)
        });
        Ok(outcome)
    }
}
