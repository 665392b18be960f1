//! Geometry primitives shared by every stage of the reconstruction.
//!
//! Transforms follow the `a_m_b` naming convention: `a_m_b` maps coordinates
//! given in space `b` into space `a`, so `a_m_c = a_m_b * b_m_c`.

use std::ops::Mul;

use nalgebra::{Matrix3, Matrix4, Rotation3, Translation3, UnitQuaternion, Vector3};

use crate::error::ReconstructError;

/// Points and directions in millimetres.
pub type Vector3D = Vector3<f64>;

/// Quaternion distance below which two orientations are treated as identical.
const SAME_ORIENTATION_EPS: f64 = 1e-12;

/// Immutable 4x4 homogeneous transform with its inverse cached.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform3D {
    matrix: Matrix4<f64>,
    inverse: Matrix4<f64>,
}

impl Default for Transform3D {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform3D {
    pub fn identity() -> Self {
        Self {
            matrix: Matrix4::identity(),
            inverse: Matrix4::identity(),
        }
    }

    /// Build from an arbitrary affine matrix. Singular matrices are rejected.
    pub fn from_matrix(matrix: Matrix4<f64>) -> Result<Self, ReconstructError> {
        let inverse = matrix
            .try_inverse()
            .ok_or_else(|| ReconstructError::InvalidTransform("matrix is singular".into()))?;
        if !inverse.iter().all(|v| v.is_finite()) {
            return Err(ReconstructError::InvalidTransform(
                "matrix contains non-finite values".into(),
            ));
        }
        Ok(Self { matrix, inverse })
    }

    /// Build from the upper three rows of a homogeneous matrix, row major.
    pub fn from_rows(rows: &[[f64; 4]; 3]) -> Result<Self, ReconstructError> {
        let mut m = Matrix4::identity();
        for (r, row) in rows.iter().enumerate() {
            for (c, value) in row.iter().enumerate() {
                m[(r, c)] = *value;
            }
        }
        Self::from_matrix(m)
    }

    /// Rigid transform. The inverse is exact (transposed rotation).
    pub fn from_rotation_translation(rotation: &UnitQuaternion<f64>, translation: &Vector3D) -> Self {
        let r = rotation.to_rotation_matrix();
        let matrix = Translation3::from(*translation).to_homogeneous() * r.to_homogeneous();
        let r_inv = r.inverse();
        let inverse =
            r_inv.to_homogeneous() * Translation3::from(-*translation).to_homogeneous();
        Self { matrix, inverse }
    }

    pub fn from_translation(translation: &Vector3D) -> Self {
        Self::from_rotation_translation(&UnitQuaternion::identity(), translation)
    }

    pub fn from_rotation(rotation: &UnitQuaternion<f64>) -> Self {
        Self::from_rotation_translation(rotation, &Vector3D::zeros())
    }

    pub fn matrix(&self) -> &Matrix4<f64> {
        &self.matrix
    }

    pub fn inverse(&self) -> Self {
        Self {
            matrix: self.inverse,
            inverse: self.matrix,
        }
    }

    /// Transform a point.
    #[inline]
    pub fn coord(&self, p: &Vector3D) -> Vector3D {
        let m = &self.matrix;
        Vector3D::new(
            m[(0, 0)] * p.x + m[(0, 1)] * p.y + m[(0, 2)] * p.z + m[(0, 3)],
            m[(1, 0)] * p.x + m[(1, 1)] * p.y + m[(1, 2)] * p.z + m[(1, 3)],
            m[(2, 0)] * p.x + m[(2, 1)] * p.y + m[(2, 2)] * p.z + m[(2, 3)],
        )
    }

    /// Transform a direction (translation ignored).
    #[inline]
    pub fn vector(&self, v: &Vector3D) -> Vector3D {
        self.linear() * v
    }

    pub fn translation(&self) -> Vector3D {
        Vector3D::new(self.matrix[(0, 3)], self.matrix[(1, 3)], self.matrix[(2, 3)])
    }

    pub fn linear(&self) -> Matrix3<f64> {
        self.matrix.fixed_view::<3, 3>(0, 0).into_owned()
    }

    /// Rotation part with any axis scaling removed.
    pub fn rotation(&self) -> UnitQuaternion<f64> {
        let mut m = self.linear();
        for mut col in m.column_iter_mut() {
            let n = col.norm();
            if n > 0.0 {
                col /= n;
            }
        }
        let q = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(m));
        UnitQuaternion::new_normalize(q.into_inner())
    }
}

impl Mul for Transform3D {
    type Output = Transform3D;

    fn mul(self, rhs: Transform3D) -> Transform3D {
        Transform3D {
            matrix: self.matrix * rhs.matrix,
            inverse: rhs.inverse * self.inverse,
        }
    }
}

impl Mul for &Transform3D {
    type Output = Transform3D;

    fn mul(self, rhs: &Transform3D) -> Transform3D {
        *self * *rhs
    }
}

/// Element-wise blend of the two matrices. Does not keep the rotation
/// orthonormal; use [`slerp_interpolate`] for poses.
pub fn interpolate(a: &Transform3D, b: &Transform3D, t: f64) -> Result<Transform3D, ReconstructError> {
    Transform3D::from_matrix(a.matrix * (1.0 - t) + b.matrix * t)
}

/// Pose interpolation: linear in translation, spherical in rotation.
pub fn slerp_interpolate(a: &Transform3D, b: &Transform3D, t: f64) -> Transform3D {
    let pa = a.translation();
    let pb = b.translation();
    let p = pa + (pb - pa) * t;

    let qa = a.rotation();
    let qb = b.rotation();
    let same = (qa.coords - qb.coords).norm() < SAME_ORIENTATION_EPS
        || (qa.coords + qb.coords).norm() < SAME_ORIENTATION_EPS;
    let q = if same {
        qa
    } else {
        // try_slerp only gives up when the quaternions are almost equal
        qa.try_slerp(&qb, t, 1e-9).unwrap_or_else(|| qa.nlerp(&qb, t))
    };
    Transform3D::from_rotation_translation(&q, &p)
}

/// Axis aligned box, grown point by point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox3D {
    pub min: Vector3D,
    pub max: Vector3D,
}

impl BoundingBox3D {
    pub fn from_point(p: &Vector3D) -> Self {
        Self { min: *p, max: *p }
    }

    /// Smallest box containing all points, `None` for an empty iterator.
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Vector3D>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut bb = Self::from_point(first);
        for p in iter {
            bb.expand(p);
        }
        Some(bb)
    }

    pub fn expand(&mut self, p: &Vector3D) {
        self.min = self.min.inf(p);
        self.max = self.max.sup(p);
    }

    pub fn range(&self) -> Vector3D {
        self.max - self.min
    }

    pub fn contains(&self, p: &Vector3D, tolerance: f64) -> bool {
        (0..3).all(|i| p[i] >= self.min[i] - tolerance && p[i] <= self.max[i] + tolerance)
    }

    /// The box grown by `margin` on every side.
    pub fn inflated(&self, margin: f64) -> Self {
        let m = Vector3D::repeat(margin);
        Self {
            min: self.min - m,
            max: self.max + m,
        }
    }
}
