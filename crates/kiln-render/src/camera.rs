//! Camera and view matrices.

use glam::{Mat4, Vec3};

/// Camera for the main 3D view.
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub direction: Vec3,
    pub up: Vec3,
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 2.0, 8.0),
            direction: Vec3::NEG_Z,
            up: Vec3::Y,
            fov: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Camera {
    /// Create a camera looking at `target`.
    pub fn new(
        position: Vec3,
        target: Vec3,
        up: Vec3,
        fov: f32,
        aspect: f32,
        near: f32,
        far: f32,
    ) -> Self {
        let direction = (target - position).normalize();
        Self {
            position,
            direction,
            up,
            fov,
            aspect,
            near,
            far,
        }
    }

    /// Look at a target position.
    pub fn look_at(&mut self, target: Vec3) {
        self.direction = (target - self.position).normalize();
    }

    /// Set the aspect ratio.
    pub fn set_aspect(&mut self, aspect: f32) {
        self.aspect = aspect;
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.direction, self.up)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov, self.aspect, self.near, self.far)
    }

    /// Combined view-projection matrix.
    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }
}

/// View and projection matrices for the sun's shadow view.
///
/// An orthographic box of `extent` world units centered on `center`,
/// looking along the sun direction.
pub fn sun_shadow_matrices(direction: Vec3, center: Vec3, extent: f32) -> (Mat4, Mat4) {
    let direction = direction.normalize_or_zero();
    // Pick an up vector that is not parallel to the light direction.
    let up = if direction.y.abs() > 0.99 {
        Vec3::Z
    } else {
        Vec3::Y
    };

    let eye = center - direction * extent;
    let view = Mat4::look_at_rh(eye, center, up);
    let projection = Mat4::orthographic_rh(
        -extent,
        extent,
        -extent,
        extent,
        0.0,
        extent * 2.0,
    );
    (view, projection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn view_matrix_is_invertible() {
        let camera = Camera::default();
        let view = camera.view_matrix();
        let identity = view * view.inverse();
        assert_relative_eq!(identity.to_cols_array()[0], 1.0, epsilon = 1e-5);
        assert_relative_eq!(identity.to_cols_array()[5], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn shadow_matrices_contain_the_center() {
        let (view, projection) = sun_shadow_matrices(
            Vec3::new(-0.4, -1.0, -0.3),
            Vec3::new(10.0, 0.0, 10.0),
            50.0,
        );
        let clip = projection * view * Vec3::new(10.0, 0.0, 10.0).extend(1.0);
        let ndc = clip / clip.w;
        assert!(ndc.x.abs() <= 1.0);
        assert!(ndc.y.abs() <= 1.0);
        assert!((0.0..=1.0).contains(&ndc.z));
    }

    #[test]
    fn vertical_sun_still_produces_finite_matrices() {
        let (view, projection) = sun_shadow_matrices(Vec3::NEG_Y, Vec3::ZERO, 20.0);
        assert!(view.is_finite());
        assert!(projection.is_finite());
    }
}
