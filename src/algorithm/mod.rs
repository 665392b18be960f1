//! Voxel filling algorithms.
//!
//! Every algorithm reads the same [`ReconstructInput`] (intensity frames,
//! their poses in data space and the probe mask) and writes into a zeroed
//! [`OutputVolume`]. Work is spread over the rayon pool that is current when
//! [`run_fill`] is called.

mod average;
mod nearest;
mod splat;

pub use average::{AverageOptions, LocalAverage};
pub use nearest::{NearestFrame, NearestOptions};
pub use splat::{GaussianSplat, SplatOptions};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ndarray::parallel::prelude::*;
use ndarray::{Array2, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use web_time::Instant;

use crate::enums::AlgorithmKind;
use crate::error::ReconstructError;
use crate::geometry::{BoundingBox3D, Transform3D, Vector3D};
use crate::interpolator::Interpolator;
use crate::volume::OutputVolume;

/// Shared cancellation flag, checked between slices or frames.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    Completed,
    Cancelled,
}

/// Per-algorithm option tables of the settings document.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgorithmOptions {
    pub nearest: NearestOptions,
    pub average: AverageOptions,
    pub splat: SplatOptions,
}

/// Everything an algorithm needs, already expressed in data space.
#[derive(Debug, Clone)]
pub struct ReconstructInput {
    /// Intensity of every usable frame, indexed (frame, row, column).
    frames: Array3<u8>,
    d_m_u: Vec<Transform3D>,
    u_m_d: Vec<Transform3D>,
    /// Non-zero where a pixel carries data, indexed (row, column).
    mask: Array2<u8>,
    /// Millimetres per pixel along columns and rows.
    pixel_spacing: (f64, f64),
}

impl ReconstructInput {
    pub fn new(
        frames: Array3<u8>,
        d_m_u: Vec<Transform3D>,
        mask: Array2<u8>,
        pixel_spacing: (f64, f64),
    ) -> Result<Self, ReconstructError> {
        let (n, h, w) = frames.dim();
        if n == 0 {
            return Err(ReconstructError::NoFrames);
        }
        if d_m_u.len() != n {
            return Err(ReconstructError::FrameCountMismatch {
                images: n,
                timestamps: d_m_u.len(),
            });
        }
        if mask.dim() != (h, w) {
            let (mh, mw) = mask.dim();
            return Err(ReconstructError::InvalidProbe(format!(
                "mask is {mw}x{mh} but frames are {w}x{h}"
            )));
        }
        let (sx, sy) = pixel_spacing;
        if !(sx > 0.0 && sy > 0.0) {
            return Err(ReconstructError::InvalidProbe(format!(
                "spacing must be positive, got ({sx}, {sy})"
            )));
        }
        let u_m_d = d_m_u.iter().map(|m| m.inverse()).collect();
        Ok(Self {
            frames,
            d_m_u,
            u_m_d,
            mask,
            pixel_spacing,
        })
    }

    /// Same frames placed with different poses.
    pub fn with_poses(&self, d_m_u: Vec<Transform3D>) -> Result<Self, ReconstructError> {
        Self::new(self.frames.clone(), d_m_u, self.mask.clone(), self.pixel_spacing)
    }

    pub fn frame_count(&self) -> usize {
        self.d_m_u.len()
    }

    /// Frame size as (width, height).
    pub fn frame_dims(&self) -> (usize, usize) {
        let (_, h, w) = self.frames.dim();
        (w, h)
    }

    pub fn frame(&self, index: usize) -> ArrayView2<'_, u8> {
        self.frames.index_axis(Axis(0), index)
    }

    pub fn d_m_u(&self) -> &[Transform3D] {
        &self.d_m_u
    }

    pub fn mask(&self) -> &Array2<u8> {
        &self.mask
    }

    pub fn pixel_spacing(&self) -> (f64, f64) {
        self.pixel_spacing
    }

    /// Frame-space position of `p_d` for frame `index`.
    #[inline]
    pub(crate) fn to_frame(&self, index: usize, p_d: &Vector3D) -> Vector3D {
        self.u_m_d[index].coord(p_d)
    }

    /// Frame-space position of pixel (row, col).
    #[inline]
    pub(crate) fn pixel_position(&self, row: usize, col: usize) -> Vector3D {
        Vector3D::new(col as f64 * self.pixel_spacing.0, row as f64 * self.pixel_spacing.1, 0.0)
    }

    /// Value of the nearest masked pixel.
    #[inline]
    pub(crate) fn sample_nearest(&self, index: usize, p_u: &Vector3D) -> Option<u8> {
        let (row, col) = Interpolator::nearest_pixel(p_u, self.pixel_spacing, self.frame_dims())?;
        (self.mask[[row, col]] != 0).then(|| self.frames[[index, row, col]])
    }

    /// Bilinear sample, valid when the nearest pixel is masked in.
    #[inline]
    pub(crate) fn sample_bilinear(&self, index: usize, p_u: &Vector3D) -> Option<f64> {
        let dims = self.frame_dims();
        let (x, y) = Interpolator::pixel_coords(p_u, self.pixel_spacing, dims)?;
        let (row, col) = Interpolator::nearest_pixel(p_u, self.pixel_spacing, dims)?;
        if self.mask[[row, col]] == 0 {
            return None;
        }
        Some(Interpolator::bilinear_interpolate(&self.frame(index), y, x))
    }

    /// Data-space bounding box of every frame, grown by `margin`.
    pub(crate) fn frame_bounds(&self, margin: f64) -> Vec<BoundingBox3D> {
        let (w, h) = self.frame_dims();
        let corners = [
            self.pixel_position(0, 0),
            self.pixel_position(0, w - 1),
            self.pixel_position(h - 1, 0),
            self.pixel_position(h - 1, w - 1),
        ];
        self.d_m_u
            .iter()
            .map(|d_m_u| {
                let points: Vec<Vector3D> = corners.iter().map(|c| d_m_u.coord(c)).collect();
                // four corners, never empty
                BoundingBox3D::from_points(&points)
                    .unwrap_or_else(|| BoundingBox3D::from_point(&Vector3D::zeros()))
                    .inflated(margin)
            })
            .collect()
    }
}

pub trait ReconstructAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;

    fn reconstruct(
        &self,
        input: &ReconstructInput,
        volume: &mut OutputVolume,
        cancel: &CancelToken,
    ) -> Result<FillOutcome, ReconstructError>;
}

pub(crate) fn check_positive(name: &str, value: Option<f64>) -> Result<(), ReconstructError> {
    match value {
        Some(v) if !(v.is_finite() && v > 0.0) => {
            Err(ReconstructError::invalid_option(name, format!("must be positive, got {v}")))
        }
        _ => Ok(()),
    }
}

/// Build the algorithm for `kind`, rejecting invalid options up front.
pub fn create_algorithm(
    kind: AlgorithmKind,
    options: &AlgorithmOptions,
) -> Result<Box<dyn ReconstructAlgorithm>, ReconstructError> {
    let algorithm: Box<dyn ReconstructAlgorithm> = match kind {
        AlgorithmKind::NearestFrame => Box::new(NearestFrame::new(options.nearest)?),
        AlgorithmKind::LocalAverage => Box::new(LocalAverage::new(options.average)?),
        AlgorithmKind::GaussianSplat => Box::new(GaussianSplat::new(options.splat)?),
    };
    Ok(algorithm)
}

/// Run `algorithm`, on a dedicated pool of `threads` workers when given.
pub fn run_fill(
    algorithm: &dyn ReconstructAlgorithm,
    input: &ReconstructInput,
    volume: &mut OutputVolume,
    cancel: &CancelToken,
    threads: Option<usize>,
) -> Result<FillOutcome, ReconstructError> {
    let start = Instant::now();
    let outcome = match threads {
        Some(n) => {
            let pool = rayon::ThreadPoolBuilder::new().num_threads(n).build()?;
            pool.install(|| algorithm.reconstruct(input, volume, cancel))?
        }
        None => algorithm.reconstruct(input, volume, cancel)?,
    };
    log::info!(
        "{} fill of {} frames {:?} after {:?}",
        algorithm.name(),
        input.frame_count(),
        outcome,
        start.elapsed()
    );
    Ok(outcome)
}

/// Voxel scan shared by the voxel-driven algorithms: parallel over z slices,
/// `voxel` gets the frames whose grown bounding box contains the voxel and
/// the voxel position in data space.
pub(crate) fn fill_voxels<F>(
    input: &ReconstructInput,
    volume: &mut OutputVolume,
    cancel: &CancelToken,
    margin: f64,
    voxel: F,
) -> FillOutcome
where
    F: Fn(&[usize], &Vector3D) -> Option<u8> + Sync,
{
    let spacing = volume.params().spacing;
    let bounds = input.frame_bounds(margin);

    volume
        .data_mut()
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(z, mut slice)| {
            if cancel.is_cancelled() {
                return;
            }
            let pz = z as f64 * spacing;
            let in_slice: Vec<usize> = (0..bounds.len())
                .filter(|&i| pz >= bounds[i].min.z && pz <= bounds[i].max.z)
                .collect();
            if in_slice.is_empty() {
                return;
            }
            let mut candidates = Vec::with_capacity(in_slice.len());
            for (y, mut row) in slice.axis_iter_mut(Axis(0)).enumerate() {
                let py = y as f64 * spacing;
                for (x, value) in row.iter_mut().enumerate() {
                    let p_d = Vector3D::new(x as f64 * spacing, py, pz);
                    candidates.clear();
                    candidates.extend(in_slice.iter().copied().filter(|&i| bounds[i].contains(&p_d, 0.0)));
                    if candidates.is_empty() {
                        continue;
                    }
                    if let Some(v) = voxel(&candidates, &p_d) {
                        *value = v;
                    }
                }
            }
        });

    if cancel.is_cancelled() {
        FillOutcome::Cancelled
    } else {
        FillOutcome::Completed
    }
}
