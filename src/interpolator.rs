use ndarray::ArrayView2;

use crate::geometry::Vector3D;

/// Pixel lookup in ultrasound frames. Pixel (col, row) sits at
/// `(col * sx, row * sy)` in frame space.
pub(crate) struct Interpolator;

impl Interpolator {
    /// Continuous pixel coordinates (x, y) of a frame-space point, or `None`
    /// when it falls outside the `width` x `height` frame.
    #[inline]
    pub(crate) fn pixel_coords(
        p_u: &Vector3D,
        spacing: (f64, f64),
        (width, height): (usize, usize),
    ) -> Option<(f64, f64)> {
        let x = p_u.x / spacing.0;
        let y = p_u.y / spacing.1;
        let inside =
            x >= -0.5 && y >= -0.5 && x < width as f64 - 0.5 && y < height as f64 - 0.5;
        inside.then_some((x, y))
    }

    /// Nearest pixel as (row, col).
    #[inline]
    pub(crate) fn nearest_pixel(
        p_u: &Vector3D,
        spacing: (f64, f64),
        dims: (usize, usize),
    ) -> Option<(usize, usize)> {
        let (x, y) = Self::pixel_coords(p_u, spacing, dims)?;
        let col = (x.round().max(0.0) as usize).min(dims.0 - 1);
        let row = (y.round().max(0.0) as usize).min(dims.1 - 1);
        Some((row, col))
    }

    /// Number of grid points needed to cover `extent` mm. A corner exactly on
    /// a grid line does not get an extra point.
    #[inline]
    pub(crate) fn grid_points(extent: f64, spacing: f64) -> usize {
        ((extent / spacing - 1e-9).ceil().max(0.0) as usize).saturating_add(1)
    }

    #[inline]
    pub(crate) fn bilinear_interpolate(slice: &ArrayView2<u8>, y: f64, x: f64) -> f64 {
        let (height, width) = slice.dim();
        let y = y.clamp(0.0, (height - 1) as f64);
        let x = x.clamp(0.0, (width - 1) as f64);

        let y0 = y.floor() as usize;
        let x0 = x.floor() as usize;
        let y1 = (y0 + 1).min(height - 1);
        let x1 = (x0 + 1).min(width - 1);

        let dy = y - y0 as f64;
        let dx = x - x0 as f64;
        let one_minus_dx = 1.0 - dx;
        let one_minus_dy = 1.0 - dy;

        let v00 = slice[[y0, x0]] as f64;
        let v01 = slice[[y0, x1]] as f64;
        let v10 = slice[[y1, x0]] as f64;
        let v11 = slice[[y1, x1]] as f64;

        let v0 = v00.mul_add(one_minus_dx, v01 * dx);
        let v1 = v10.mul_add(one_minus_dx, v11 * dx);

        v0.mul_add(one_minus_dy, v1 * dy)
    }
}
