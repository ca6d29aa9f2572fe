use std::ops::Mul;

/// column-major 4x4 matrix, laid out the way `glUniformMatrix4fv` expects
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mat4(pub [[f32; 4]; 4]);

impl Mat4 {
    pub const IDENTITY: Mat4 = Mat4([
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ]);

    pub fn translation(x: f32, y: f32, z: f32) -> Mat4 {
        let mut m = Mat4::IDENTITY;
        m.0[3] = [x, y, z, 1.0];
        m
    }

    /// rotation of `degrees` around the axis `(x, y, z)`
    pub fn rotation(degrees: f32, x: f32, y: f32, z: f32) -> Mat4 {
        let len = (x * x + y * y + z * z).sqrt();
        if len == 0.0 {
            return Mat4::IDENTITY;
        }
        let (x, y, z) = (x / len, y / len, z / len);
        let (s, c) = degrees.to_radians().sin_cos();
        let t = 1.0 - c;

        Mat4([
            [t * x * x + c, t * x * y + s * z, t * x * z - s * y, 0.0],
            [t * x * y - s * z, t * y * y + c, t * y * z + s * x, 0.0],
            [t * x * z + s * y, t * y * z - s * x, t * z * z + c, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ])
    }

    /// perspective projection, same as `glFrustum`
    pub fn frustum(left: f32, right: f32, bottom: f32, top: f32, near: f32, far: f32) -> Mat4 {
        let (w, h, d) = (right - left, top - bottom, far - near);
        Mat4([
            [2.0 * near / w, 0.0, 0.0, 0.0],
            [0.0, 2.0 * near / h, 0.0, 0.0],
            [(right + left) / w, (top + bottom) / h, -(far + near) / d, -1.0],
            [0.0, 0.0, -2.0 * far * near / d, 0.0],
        ])
    }

    pub fn translate(self, x: f32, y: f32, z: f32) -> Mat4 {
        self * Mat4::translation(x, y, z)
    }

    pub fn rotate(self, degrees: f32, x: f32, y: f32, z: f32) -> Mat4 {
        self * Mat4::rotation(degrees, x, y, z)
    }

    /// upper-left 3x3, used as normal matrix for rigid transforms
    pub fn normal_matrix(&self) -> [f32; 9] {
        let m = &self.0;
        [m[0][0], m[0][1], m[0][2], m[1][0], m[1][1], m[1][2], m[2][0], m[2][1], m[2][2]]
    }

    pub fn transform(&self, v: [f32; 4]) -> [f32; 4] {
        let mut out = [0.0; 4];
        for (row, value) in out.iter_mut().enumerate() {
            *value = (0..4).map(|col| self.0[col][row] * v[col]).sum();
        }
        out
    }

    pub fn as_ptr(&self) -> *const f32 {
        self.0.as_ptr().cast()
    }
}

impl Mul for Mat4 {
    type Output = Mat4;

    fn mul(self, rhs: Mat4) -> Mat4 {
        let mut out = [[0.0; 4]; 4];
        for (col, column) in out.iter_mut().enumerate() {
            for (row, value) in column.iter_mut().enumerate() {
                *value = (0..4).map(|k| self.0[k][row] * rhs.0[col][k]).sum();
            }
        }
        Mat4(out)
    }
}
