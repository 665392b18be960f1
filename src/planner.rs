//! Output grid planning: orientation, bounding box, spacing and dimensions.

use nalgebra::{Quaternion, UnitQuaternion, Vector4};

use crate::enums::OutputOrientation;
use crate::error::ReconstructError;
use crate::geometry::{BoundingBox3D, Transform3D, Vector3D};
use crate::interpolator::Interpolator;

/// 32 Mi voxels, 32 MiB of `u8` output.
pub const DEFAULT_MAX_VOXELS: usize = 32 * 1024 * 1024;

/// Geometry of the output grid in patient reference space.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputVolumeParams {
    /// `pr_m_d`: data space of the volume to patient reference.
    pub orientation: Transform3D,
    /// Number of voxels along x, y and z.
    pub dim: [usize; 3],
    /// Isotropic voxel spacing (mm).
    pub spacing: f64,
    /// Size of the bounding box in data space (mm).
    pub extent: Vector3D,
    /// Spacing chosen when none is requested.
    pub input_spacing: f64,
    pub max_voxels: usize,
}

impl OutputVolumeParams {
    pub fn new(orientation: Transform3D, extent: Vector3D, spacing: f64, max_voxels: usize) -> Self {
        let mut params = Self {
            orientation,
            dim: [1, 1, 1],
            spacing,
            extent,
            input_spacing: spacing,
            max_voxels,
        };
        params.set_spacing(spacing);
        params
    }

    fn dims_for(extent: &Vector3D, spacing: f64) -> [usize; 3] {
        let n = |e: f64| Interpolator::grid_points(e, spacing);
        [n(extent.x), n(extent.y), n(extent.z)]
    }

    /// Position of voxel (0, 0, 0) in patient reference space.
    pub fn origin(&self) -> Vector3D {
        self.orientation.translation()
    }

    /// Saturates at `usize::MAX`.
    pub fn voxel_count(&self) -> usize {
        self.dim.iter().fold(1usize, |count, &n| count.saturating_mul(n))
    }

    /// Change the spacing and recompute the dimensions from the extent.
    pub fn set_spacing(&mut self, spacing: f64) {
        self.spacing = spacing;
        if spacing.is_finite() && spacing > 0.0 {
            self.dim = Self::dims_for(&self.extent, spacing);
        }
    }

    /// Request `n` voxels along `axis` (0 = x, 1 = y, 2 = z); the spacing is
    /// recomputed from that axis' extent and applies to all axes.
    pub fn set_dim(&mut self, axis: usize, n: usize) -> Result<(), ReconstructError> {
        if axis > 2 {
            return Err(ReconstructError::invalid_option("dim", format!("no axis {axis}")));
        }
        let extent = self.extent[axis];
        if n < 2 || extent <= 0.0 {
            return Err(ReconstructError::invalid_option(
                "dim",
                format!("cannot fit {n} voxels into an extent of {extent} mm"),
            ));
        }
        self.set_spacing(extent / (n - 1) as f64);
        Ok(())
    }

    /// Grow the spacing until the grid holds at most `max_voxels` voxels.
    /// Returns whether the spacing changed.
    pub fn constrain_volume_size(&mut self) -> bool {
        let mut changed = false;
        for _ in 0..64 {
            let count: f64 = self.dim.iter().map(|&n| n as f64).product();
            if count <= self.max_voxels as f64 {
                break;
            }
            let factor = (count / self.max_voxels as f64).cbrt().max(1.001);
            self.set_spacing(self.spacing * factor);
            changed = true;
        }
        changed
    }

    pub fn validate(&self) -> Result<(), ReconstructError> {
        if !(self.spacing.is_finite() && self.spacing > 0.0) {
            return Err(ReconstructError::invalid_option("spacing", "must be positive"));
        }
        if self.dim.contains(&0) {
            return Err(ReconstructError::invalid_option("dim", "must be non-zero on every axis"));
        }
        if self.max_voxels == 0 {
            return Err(ReconstructError::invalid_option("max_voxels", "must be positive"));
        }
        let count = self.dim.iter().try_fold(1usize, |count, &n| count.checked_mul(n));
        match count {
            Some(count) if count <= self.max_voxels => Ok(()),
            _ => Err(ReconstructError::invalid_option(
                "dim",
                format!(
                    "{}x{}x{} voxels exceed the limit of {}",
                    self.dim[0], self.dim[1], self.dim[2], self.max_voxels
                ),
            )),
        }
    }
}

/// Planner output: the grid plus every frame pose in data space.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedVolume {
    pub params: OutputVolumeParams,
    /// `d_m_u` per valid frame.
    pub d_m_u: Vec<Transform3D>,
}

impl PlannedVolume {
    /// Re-express the frame poses for a replacement grid.
    pub fn reoriented(&self, params: OutputVolumeParams) -> Result<PlannedVolume, ReconstructError> {
        params.validate()?;
        let new_d_m_old_d = params.orientation.inverse() * self.params.orientation;
        let d_m_u = self.d_m_u.iter().map(|m| new_d_m_old_d * *m).collect();
        Ok(PlannedVolume { params, d_m_u })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanSettings {
    pub orientation: OutputOrientation,
    /// Requested spacing; the input pixel spacing is used when `None`.
    pub spacing: Option<f64>,
    /// Smallest pixel spacing of the frames (mm).
    pub input_spacing: f64,
    pub max_voxels: usize,
}

/// Rotation part of `pr_m_dd` for the given strategy.
pub fn reference_orientation(strategy: OutputOrientation, pr_m_u: &[Transform3D]) -> Transform3D {
    let Some(first) = pr_m_u.first() else {
        return Transform3D::identity();
    };
    let rotation = match strategy {
        OutputOrientation::PatientReference => return Transform3D::identity(),
        OutputOrientation::FirstFrame => first.rotation(),
        OutputOrientation::MiddleFrame => pr_m_u[pr_m_u.len() / 2].rotation(),
        OutputOrientation::MeanFrame => mean_rotation(pr_m_u),
    };
    Transform3D::from_rotation(&rotation)
}

/// Normalized sum of the frame quaternions, each flipped into the
/// hemisphere of the first.
fn mean_rotation(poses: &[Transform3D]) -> UnitQuaternion<f64> {
    let reference = poses[0].rotation();
    let sum = poses.iter().fold(Vector4::zeros(), |acc, pose| {
        let q = pose.rotation();
        if q.coords.dot(&reference.coords) < 0.0 {
            acc - q.coords
        } else {
            acc + q.coords
        }
    });
    if sum.norm() < 1e-9 {
        return reference;
    }
    UnitQuaternion::new_normalize(Quaternion::from(sum))
}

/// Fit an output grid around every frame's input rectangle.
pub fn plan_output_volume(
    pr_m_u: &[Transform3D],
    corners: &[Vector3D; 4],
    settings: &PlanSettings,
) -> Result<PlannedVolume, ReconstructError> {
    if pr_m_u.len() < 2 {
        return Err(ReconstructError::TooFewFrames { found: pr_m_u.len() });
    }
    if !(settings.input_spacing.is_finite() && settings.input_spacing > 0.0) {
        return Err(ReconstructError::invalid_option("input_spacing", "must be positive"));
    }
    if let Some(spacing) = settings.spacing
        && !(spacing.is_finite() && spacing > 0.0)
    {
        return Err(ReconstructError::invalid_option("spacing", "must be positive"));
    }

    let pr_m_dd = reference_orientation(settings.orientation, pr_m_u);
    let dd_m_pr = pr_m_dd.inverse();

    let mut bounds: Option<BoundingBox3D> = None;
    for pose in pr_m_u {
        let dd_m_u = dd_m_pr * *pose;
        for corner in corners {
            let p = dd_m_u.coord(corner);
            match bounds.as_mut() {
                Some(b) => b.expand(&p),
                None => bounds = Some(BoundingBox3D::from_point(&p)),
            }
        }
    }
    let bounds = bounds.ok_or(ReconstructError::TooFewFrames { found: 0 })?;

    let d_m_dd = Transform3D::from_translation(&-bounds.min);
    let pr_m_d = pr_m_dd * d_m_dd.inverse();
    let d_m_pr = d_m_dd * dd_m_pr;

    let spacing = settings.spacing.unwrap_or(settings.input_spacing);
    let mut params = OutputVolumeParams::new(pr_m_d, bounds.range(), spacing, settings.max_voxels);
    params.input_spacing = settings.input_spacing;
    if params.constrain_volume_size() {
        log::warn!(
            "Output volume exceeds {} voxels, spacing increased from {spacing:.3} to {:.3} mm",
            settings.max_voxels,
            params.spacing
        );
    }
    params.validate()?;

    let d_m_u = pr_m_u.iter().map(|pose| d_m_pr * *pose).collect();
    log::info!(
        "Planned output volume {}x{}x{} at {:.3} mm",
        params.dim[0],
        params.dim[1],
        params.dim[2],
        params.spacing
    );
    Ok(PlannedVolume { params, d_m_u })
}
