//! Probe footprint description: pixel spacing, sector shape and the mask of
//! valid pixels inside each ultrasound frame.

use nalgebra::Matrix4;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::ReconstructError;
use crate::geometry::{Transform3D, Vector3D};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProbeType {
    /// No sector information, the whole frame is valid.
    #[default]
    None,
    Linear,
    Sector,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeGeometry {
    pub probe_type: ProbeType,
    /// Millimetres per pixel along columns and rows.
    pub spacing: (f64, f64),
    /// Frame size in pixels (width, height).
    pub dimensions: (usize, usize),
    /// Probe origin in pixel coordinates (column, row). For sector probes
    /// this is the apex of the sector.
    pub origin: (f64, f64),
    /// Start of the imaged depth range in mm from the origin.
    pub depth_start: f64,
    /// End of the imaged depth range in mm from the origin.
    pub depth_end: f64,
    /// Width of the footprint: mm for linear probes, radians for sectors.
    pub width: f64,
    /// Explicit mask of valid pixels, indexed (row, column). Generated from
    /// the sector when absent.
    pub mask: Option<Array2<u8>>,
}

impl ProbeGeometry {
    /// Probe that accepts every pixel of a `width` x `height` frame.
    pub fn full_frame(spacing: (f64, f64), dimensions: (usize, usize)) -> Self {
        Self {
            probe_type: ProbeType::None,
            spacing,
            dimensions,
            origin: (dimensions.0 as f64 / 2.0, 0.0),
            depth_start: 0.0,
            depth_end: dimensions.1 as f64 * spacing.1,
            width: dimensions.0 as f64 * spacing.0,
            mask: None,
        }
    }

    pub fn validate(&self) -> Result<(), ReconstructError> {
        let (sx, sy) = self.spacing;
        if !(sx.is_finite() && sy.is_finite() && sx > 0.0 && sy > 0.0) {
            return Err(ReconstructError::InvalidProbe(format!(
                "spacing must be positive, got ({sx}, {sy})"
            )));
        }
        let (w, h) = self.dimensions;
        if w == 0 || h == 0 {
            return Err(ReconstructError::InvalidProbe(format!(
                "frame dimensions must be non-zero, got {w}x{h}"
            )));
        }
        if let Some(mask) = &self.mask
            && mask.dim() != (h, w)
        {
            let (mh, mw) = mask.dim();
            return Err(ReconstructError::InvalidProbe(format!(
                "mask is {mw}x{mh} but frames are {w}x{h}"
            )));
        }
        if matches!(self.probe_type, ProbeType::Linear | ProbeType::Sector) {
            if self.depth_end <= self.depth_start {
                return Err(ReconstructError::InvalidProbe(
                    "depth end must lie beyond depth start".into(),
                ));
            }
            if self.width <= 0.0 {
                return Err(ReconstructError::InvalidProbe("width must be positive".into()));
            }
        }
        Ok(())
    }

    /// Maps frame space `u` (mm, origin in the upper-left pixel, x along
    /// columns, y along rows) to tool space `t` (origin at the probe origin,
    /// z along the ultrasound ray, y to the left).
    pub fn t_m_u(&self) -> Transform3D {
        let (sx, sy) = self.spacing;
        let ox = self.origin.0 * sx;
        let oy = self.origin.1 * sy;
        #[rustfmt::skip]
        let rotation = Matrix4::new(
            0.0, 0.0, -1.0, 0.0,
            -1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );
        let to_origin = Transform3D::from_translation(&Vector3D::new(-ox, -oy, 0.0));
        // rotation is orthonormal, so this cannot fail
        let rotation = Transform3D::from_matrix(rotation).unwrap_or_default();
        rotation * to_origin
    }

    /// The explicit mask, or one generated from the probe sector.
    pub fn mask(&self) -> Array2<u8> {
        match &self.mask {
            Some(mask) => mask.clone(),
            None => self.generate_mask(),
        }
    }

    pub fn generate_mask(&self) -> Array2<u8> {
        let (w, h) = self.dimensions;
        let (sx, sy) = self.spacing;
        let half_width = self.width / 2.0;
        Array2::from_shape_fn((h, w), |(row, col)| {
            let dx = (col as f64 - self.origin.0) * sx;
            let dy = (row as f64 - self.origin.1) * sy;
            let inside = match self.probe_type {
                ProbeType::None => true,
                ProbeType::Linear => {
                    dy >= self.depth_start && dy <= self.depth_end && dx.abs() <= half_width
                }
                ProbeType::Sector => {
                    let r = dx.hypot(dy);
                    let angle = dx.atan2(dy);
                    dy >= 0.0
                        && r >= self.depth_start
                        && r <= self.depth_end
                        && angle.abs() <= half_width
                }
            };
            if inside { 255 } else { 0 }
        })
    }

    /// Corners of the valid region in frame space (mm), used to size the
    /// output volume. `reduce_percent` shrinks the rectangle on every side.
    pub fn input_rectangle(&self, reduce_percent: f64) -> Result<[Vector3D; 4], ReconstructError> {
        let mask = self.mask();
        let (h, w) = mask.dim();
        let (mut xmin, mut xmax, mut ymin, mut ymax) = (w, 0, h, 0);
        for ((row, col), &v) in mask.indexed_iter() {
            if v != 0 {
                xmin = xmin.min(col);
                xmax = xmax.max(col);
                ymin = ymin.min(row);
                ymax = ymax.max(row);
            }
        }
        if xmin > xmax || ymin > ymax {
            return Err(ReconstructError::InvalidProbe(
                "mask contains no valid pixels".into(),
            ));
        }

        let reduce = reduce_percent.clamp(0.0, 49.0) / 100.0;
        let rx = (xmax - xmin) as f64 * reduce;
        let ry = (ymax - ymin) as f64 * reduce;
        let (sx, sy) = self.spacing;
        let x0 = (xmin as f64 + rx) * sx;
        let x1 = (xmax as f64 - rx) * sx;
        let y0 = (ymin as f64 + ry) * sy;
        let y1 = (ymax as f64 - ry) * sy;
        Ok([
            Vector3D::new(x0, y0, 0.0),
            Vector3D::new(x1, y0, 0.0),
            Vector3D::new(x0, y1, 0.0),
            Vector3D::new(x1, y1, 0.0),
        ])
    }
}
