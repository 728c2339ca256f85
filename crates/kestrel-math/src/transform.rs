// SPDX-License-Identifier: CEPL-1.0
use glam::{EulerRot, Mat4, Quat, Vec3};

/// Position, yaw/pitch/roll (radians) and scale of one drawable.
/// Right-handed, +Y up, forward is -Z at rest.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Transform {
    position: Vec3,
    rotation: Vec3,
    scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Transform {
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn from_position(position: Vec3) -> Self {
        Transform {
            position,
            ..Default::default()
        }
    }

    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }
    pub fn rotation(&self) -> Vec3 {
        self.rotation
    }
    pub fn scale(&self) -> Vec3 {
        self.scale
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    pub fn offset_position(&mut self, delta: Vec3) {
        self.position += delta;
    }

    /// Accumulate a yaw (x), pitch (y), roll (z) delta.
    pub fn rotate_ypr(&mut self, delta: Vec3) {
        self.rotation += delta;
    }

    pub fn set_scale(&mut self, scale: Vec3) {
        self.scale = scale;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn orientation(&self) -> Quat {
        Quat::from_euler(EulerRot::YXZ, self.rotation.x, self.rotation.y, self.rotation.z)
    }

    /// Model matrix: translate * rotate * scale.
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.orientation(), self.position)
    }

    pub fn forward(&self) -> Vec3 {
        self.orientation() * Vec3::NEG_Z
    }
    pub fn backward(&self) -> Vec3 {
        -self.forward()
    }
    pub fn right(&self) -> Vec3 {
        self.orientation() * Vec3::X
    }
    pub fn left(&self) -> Vec3 {
        -self.right()
    }
    pub fn up(&self) -> Vec3 {
        self.orientation() * Vec3::Y
    }
    pub fn down(&self) -> Vec3 {
        -self.up()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    fn close(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-5
    }

    #[test]
    fn default_is_identity() {
        assert_eq!(Transform::default().matrix(), Mat4::IDENTITY);
    }

    #[test]
    fn matrix_applies_scale_then_translation() {
        let t = Transform::from_position(Vec3::new(1.0, 2.0, 3.0)).with_scale(Vec3::splat(2.0));
        let p = t.matrix().transform_point3(Vec3::new(1.0, 0.0, 0.0));
        assert!(close(p, Vec3::new(3.0, 2.0, 3.0)));
    }

    #[test]
    fn yaw_quarter_turn_moves_forward_to_negative_x() {
        let mut t = Transform::default();
        t.rotate_ypr(Vec3::new(FRAC_PI_2, 0.0, 0.0));
        assert!(close(t.forward(), Vec3::NEG_X));
        assert!(close(t.up(), Vec3::Y));
        assert!(close(t.left(), Vec3::Z));
    }

    #[test]
    fn reset_restores_defaults() {
        let mut t = Transform::from_position(Vec3::ONE);
        t.rotate_ypr(Vec3::splat(0.3));
        t.offset_position(Vec3::X);
        t.reset();
        assert_eq!(t, Transform::default());
    }
}
