use std::sync::atomic::{AtomicU64, Ordering};

use ndarray::parallel::prelude::*;
use ndarray::Zip;
use serde::{Deserialize, Serialize};

use super::{CancelToken, FillOutcome, ReconstructAlgorithm, ReconstructInput, check_positive};
use crate::error::ReconstructError;
use crate::volume::OutputVolume;

/// Fixed-point scale of the splat weights. Integer sums make the result
/// independent of the order in which workers add their contributions.
const WEIGHT_SCALE: f64 = (1u64 << 16) as f64;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplatOptions {
    /// Kernel standard deviation (mm). The volume spacing when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sigma: Option<f64>,
    /// Fill empty voxels from their non-empty neighbours afterwards.
    pub fill_holes: bool,
}

impl Default for SplatOptions {
    fn default() -> Self {
        Self {
            sigma: None,
            fill_holes: true,
        }
    }
}

/// Pixel driven reconstruction: every masked pixel adds a Gaussian weighted
/// contribution to the voxels within three standard deviations.
#[derive(Debug, Clone)]
pub struct GaussianSplat {
    options: SplatOptions,
}

impl GaussianSplat {
    pub fn new(options: SplatOptions) -> Result<Self, ReconstructError> {
        check_positive("splat.sigma", options.sigma)?;
        Ok(Self { options })
    }

    /// Mean of the filled 26-neighbours of every empty voxel.
    fn fill_holes(volume: &mut OutputVolume, weights: &[AtomicU64]) {
        let snapshot = volume.data().clone();
        let (nz, ny, nx) = snapshot.dim();
        let filled = |z: usize, y: usize, x: usize| weights[(z * ny + y) * nx + x].load(Ordering::Relaxed) > 0;

        Zip::indexed(volume.data_mut()).par_for_each(|(z, y, x), out| {
            if filled(z, y, x) {
                return;
            }
            let (mut sum, mut count) = (0u32, 0u32);
            for zz in z.saturating_sub(1)..=(z + 1).min(nz - 1) {
                for yy in y.saturating_sub(1)..=(y + 1).min(ny - 1) {
                    for xx in x.saturating_sub(1)..=(x + 1).min(nx - 1) {
                        if filled(zz, yy, xx) {
                            sum += snapshot[[zz, yy, xx]] as u32;
                            count += 1;
                        }
                    }
                }
            }
            if count > 0 {
                *out = ((sum as f64) / (count as f64)).round() as u8;
            }
        });
    }
}

impl ReconstructAlgorithm for GaussianSplat {
    fn name(&self) -> &'static str {
        "gaussian splat"
    }

    fn reconstruct(
        &self,
        input: &ReconstructInput,
        volume: &mut OutputVolume,
        cancel: &CancelToken,
    ) -> Result<FillOutcome, ReconstructError> {
        let spacing = volume.params().spacing;
        let sigma = self.options.sigma.unwrap_or(spacing);
        let reach = 3.0 * sigma;
        let (nz, ny, nx) = volume.dim();
        let upper = [nx - 1, ny - 1, nz - 1];

        let values: Vec<AtomicU64> = (0..nz * ny * nx).map(|_| AtomicU64::new(0)).collect();
        let weights: Vec<AtomicU64> = (0..nz * ny * nx).map(|_| AtomicU64::new(0)).collect();
        let masked: Vec<(usize, usize)> = input
            .mask()
            .indexed_iter()
            .filter(|&(_, &m)| m != 0)
            .map(|(index, _)| index)
            .collect();

        (0..input.frame_count()).into_par_iter().for_each(|i| {
            if cancel.is_cancelled() {
                return;
            }
            let frame = input.frame(i);
            let d_m_u = input.d_m_u()[i];
            for &(row, col) in &masked {
                let value = frame[[row, col]] as u64;
                let p = d_m_u.coord(&input.pixel_position(row, col));

                let mut lo = [0usize; 3];
                let mut hi = [0usize; 3];
                let mut outside = false;
                for axis in 0..3 {
                    let first = ((p[axis] - reach) / spacing).ceil().max(0.0);
                    let last = ((p[axis] + reach) / spacing).floor();
                    if last < first || last < 0.0 || first > upper[axis] as f64 {
                        outside = true;
                        break;
                    }
                    lo[axis] = first as usize;
                    hi[axis] = (last as usize).min(upper[axis]);
                }
                if outside {
                    continue;
                }

                for z in lo[2]..=hi[2] {
                    let dz = z as f64 * spacing - p.z;
                    for y in lo[1]..=hi[1] {
                        let dy = y as f64 * spacing - p.y;
                        for x in lo[0]..=hi[0] {
                            let dx = x as f64 * spacing - p.x;
                            let d2 = dx * dx + dy * dy + dz * dz;
                            if d2 > reach * reach {
                                continue;
                            }
                            let wq = ((-d2 / (2.0 * sigma * sigma)).exp() * WEIGHT_SCALE).round() as u64;
                            if wq == 0 {
                                continue;
                            }
                            let idx = (z * ny + y) * nx + x;
                            weights[idx].fetch_add(wq, Ordering::Relaxed);
                            values[idx].fetch_add(wq * value, Ordering::Relaxed);
                        }
                    }
                }
            }
        });

        if cancel.is_cancelled() {
            return Ok(FillOutcome::Cancelled);
        }

        Zip::indexed(volume.data_mut()).par_for_each(|(z, y, x), out| {
            let idx = (z * ny + y) * nx + x;
            let w = weights[idx].load(Ordering::Relaxed);
            if w > 0 {
                let v = values[idx].load(Ordering::Relaxed);
                *out = (v as f64 / w as f64).round().clamp(0.0, 255.0) as u8;
            }
        });

        if self.options.fill_holes {
            Self::fill_holes(volume, &weights);
        }
        Ok(FillOutcome::Completed)
    }
}
