use serde::{Deserialize, Serialize};

use super::{CancelToken, FillOutcome, ReconstructAlgorithm, ReconstructInput, check_positive, fill_voxels};
use crate::error::ReconstructError;
use crate::volume::OutputVolume;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NearestOptions {
    /// Largest voxel to frame plane distance (mm). Twice the volume spacing
    /// when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_distance: Option<f64>,
}

/// Voxel nearest neighbour: each voxel takes the nearest pixel of the
/// closest frame plane.
#[derive(Debug, Clone)]
pub struct NearestFrame {
    options: NearestOptions,
}

impl NearestFrame {
    pub fn new(options: NearestOptions) -> Result<Self, ReconstructError> {
        check_positive("nearest.max_distance", options.max_distance)?;
        Ok(Self { options })
    }
}

impl ReconstructAlgorithm for NearestFrame {
    fn name(&self) -> &'static str {
        "nearest frame"
    }

    fn reconstruct(
        &self,
        input: &ReconstructInput,
        volume: &mut OutputVolume,
        cancel: &CancelToken,
    ) -> Result<FillOutcome, ReconstructError> {
        let max_distance = self
            .options
            .max_distance
            .unwrap_or(2.0 * volume.params().spacing);

        let outcome = fill_voxels(input, volume, cancel, max_distance, |candidates, p_d| {
            let mut best: Option<(f64, u8)> = None;
            // candidates are ascending, so ties keep the lower frame index
            for &i in candidates {
                let p_u = input.to_frame(i, p_d);
                let distance = p_u.z.abs();
                if distance > max_distance || best.is_some_and(|(d, _)| distance >= d) {
                    continue;
                }
                if let Some(v) = input.sample_nearest(i, &p_u) {
                    best = Some((distance, v));
                }
            }
            best.map(|(_, v)| v)
        });
        Ok(outcome)
    }
}
