// SPDX-License-Identifier: CEPL-1.0
//! Object transforms and the view/projection camera.
mod camera;
mod transform;

pub use camera::{Camera, ViewProjection};
pub use glam::{EulerRot, Mat4, Quat, Vec2, Vec3, Vec4};
pub use transform::Transform;
