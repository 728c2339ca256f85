// SPDX-License-Identifier: CEPL-1.0
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Per-frame global uniform block, `set = 0, binding = 0`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct ViewProjection {
    pub view: Mat4,
    pub proj: Mat4,
}

#[derive(Clone, Copy, Debug)]
pub struct Camera {
    pub eye: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Camera {
            eye: Vec3::new(-5.0, 3.0, -5.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            fov_y: 70f32.to_radians(),
            near: 0.1,
            far: 256.0,
        }
    }
}

impl Camera {
    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.eye, self.target, self.up)
    }

    /// Depth 0..1 with Y flipped for Vulkan clip space.
    pub fn projection(&self, width: u32, height: u32) -> Mat4 {
        let aspect = if height == 0 {
            1.0
        } else {
            width as f32 / height as f32
        };
        let mut proj = Mat4::perspective_rh(self.fov_y, aspect, self.near, self.far);
        proj.y_axis.y *= -1.0;
        proj
    }

    pub fn matrices(&self, width: u32, height: u32) -> ViewProjection {
        ViewProjection {
            view: self.view(),
            proj: self.projection(width, height),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_block_is_two_matrices() {
        assert_eq!(std::mem::size_of::<ViewProjection>(), 128);
    }

    #[test]
    fn projection_flips_y() {
        let cam = Camera::default();
        let flipped = cam.projection(256, 256);
        let plain = Mat4::perspective_rh(cam.fov_y, 1.0, cam.near, cam.far);
        assert_eq!(flipped.y_axis.y, -plain.y_axis.y);
        assert_eq!(flipped.x_axis.x, plain.x_axis.x);
    }

    #[test]
    fn zero_height_does_not_produce_nan() {
        let m = Camera::default().projection(640, 0);
        assert!(m.to_cols_array().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn view_maps_target_onto_negative_z() {
        let cam = Camera::default();
        let p = cam.view().transform_point3(cam.target);
        assert!(p.x.abs() < 1e-4 && p.y.abs() < 1e-4);
        assert!(p.z < 0.0);
    }
}
