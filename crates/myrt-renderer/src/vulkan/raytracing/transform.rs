//! Conversion between application transforms and the instance transform format.
//!
//! Application transforms are column-major 4x4 matrices (`m[column][row]`).
//! Instances store the top three rows of the matrix, row-major. Getting this
//! wrong does not fail, it silently rotates the geometry, so both directions
//! live here and nowhere else.

/// Column-major 4x4 matrix, `m[column][row]`.
pub type Mat4 = [[f32; 4]; 4];

/// Row-major 3x4 matrix, `m[row][column]`.
pub type InstanceTransform = [[f32; 4]; 3];

pub const IDENTITY: Mat4 = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// Transpose into row-major order and drop the bottom `(0, 0, 0, 1)` row.
pub fn to_instance_transform(m: &Mat4) -> InstanceTransform {
    let mut out = [[0.0; 4]; 3];
    for (r, row) in out.iter_mut().enumerate() {
        for (c, value) in row.iter_mut().enumerate() {
            *value = m[c][r];
        }
    }
    out
}

/// Inverse of [`to_instance_transform`], restoring the affine bottom row.
pub fn from_instance_transform(t: &InstanceTransform) -> Mat4 {
    let mut out = IDENTITY;
    for (r, row) in t.iter().enumerate() {
        for (c, &value) in row.iter().enumerate() {
            out[c][r] = value;
        }
    }
    out
}

/// Column-major translation matrix.
pub fn translation(x: f32, y: f32, z: f32) -> Mat4 {
    let mut m = IDENTITY;
    m[3] = [x, y, z, 1.0];
    m
}
