//! 样条控制器：链上骨骼摆到起止骨骼之间的 Hermite 曲线上

use glam::{Quat, Vec3};

use super::limb::find_between;
use super::{Axis, ControlFrame};
use crate::skeleton::{BoneAtom, RefSkeleton};

/// 链上骨骼的旋转方式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SplineRotationMode {
    /// 保持原旋转
    #[default]
    None,
    /// 骨骼轴沿曲线切线
    AlongSpline,
    /// 在起止骨骼旋转之间插值
    Interpolate,
}

#[derive(Clone, Debug)]
pub struct SplineControl {
    /// 从受控骨骼往上数的链长
    pub spline_length: usize,
    pub spline_bone_axis: Axis,
    pub invert_spline_bone_axis: bool,
    pub start_spline_tension: f32,
    pub end_spline_tension: f32,
    pub bone_rot_mode: SplineRotationMode,
}

impl Default for SplineControl {
    fn default() -> Self {
        Self {
            spline_length: 2,
            spline_bone_axis: Axis::X,
            invert_spline_bone_axis: false,
            start_spline_tension: 10.0,
            end_spline_tension: 10.0,
            bone_rot_mode: SplineRotationMode::None,
        }
    }
}

impl SplineControl {
    /// 起始骨骼之下到受控骨骼为止，父骨骼在前
    pub(crate) fn affected_bones(&self, bone: usize, skeleton: &RefSkeleton) -> Vec<usize> {
        if self.spline_length < 2 || bone >= skeleton.bone_count() {
            return Vec::new();
        }
        let mut out = vec![0; self.spline_length];
        out[self.spline_length - 1] = bone;
        let mut walk = bone;
        for i in 1..self.spline_length {
            if walk == 0 {
                log::debug!("[骨骼控制] 样条链越过根骨骼");
                return Vec::new();
            }
            walk = skeleton.parent_index(walk);
            out[self.spline_length - (i + 1)] = walk;
        }
        out
    }

    pub(crate) fn calculate(&self, bone: usize, frame: &ControlFrame) -> Vec<BoneAtom> {
        let affected = self.affected_bones(bone, frame.skeleton);
        if affected.is_empty() || affected[0] == 0 {
            return Vec::new();
        }
        let start = frame.skeleton.parent_index(affected[0]);
        let spaces = frame.space_bases;

        let axis = if self.invert_spline_bone_axis {
            -self.spline_bone_axis.unit()
        } else {
            self.spline_bone_axis.unit()
        };
        let start_pos = spaces[start].translation;
        let start_tangent = self.start_spline_tension * spaces[start].transform_vector(axis);
        let end_pos = spaces[bone].translation;
        let end_tangent = self.end_spline_tension * spaces[bone].transform_vector(axis);

        let len = self.spline_length;
        let mut out = vec![BoneAtom::IDENTITY; len];
        // 末端骨骼不动
        out[len - 1] = spaces[bone];

        for i in 1..len {
            let out_index = len - (i + 1);
            let modify = affected[out_index];
            let alpha = 1.0 - i as f32 / len as f32;
            let new_pos = cubic_interp(start_pos, start_tangent, end_pos, end_tangent, alpha);

            let mut atom = spaces[modify];
            match self.bone_rot_mode {
                SplineRotationMode::None => {}
                SplineRotationMode::AlongSpline => {
                    let dir = cubic_interp_derivative(start_pos, start_tangent, end_pos, end_tangent, alpha)
                        .normalize_or_zero();
                    if dir != Vec3::ZERO {
                        let current = spaces[modify].transform_vector(axis).normalize_or_zero();
                        atom.rotation = (find_between(current, dir) * atom.rotation).normalize();
                    }
                }
                SplineRotationMode::Interpolate => {
                    atom.rotation = Quat::slerp(spaces[start].rotation, spaces[bone].rotation, alpha).normalize();
                }
            }
            atom.translation = new_pos;
            out[out_index] = atom;
        }
        out
    }
}

/// 三次 Hermite 插值
pub(crate) fn cubic_interp(p0: Vec3, t0: Vec3, p1: Vec3, t1: Vec3, a: f32) -> Vec3 {
    let a2 = a * a;
    let a3 = a2 * a;
    (2.0 * a3 - 3.0 * a2 + 1.0) * p0 + (a3 - 2.0 * a2 + a) * t0 + (a3 - a2) * t1 + (-2.0 * a3 + 3.0 * a2) * p1
}

fn cubic_interp_derivative(p0: Vec3, t0: Vec3, p1: Vec3, t1: Vec3, a: f32) -> Vec3 {
    let a2 = a * a;
    (6.0 * a2 - 6.0 * a) * p0 + (3.0 * a2 - 4.0 * a + 1.0) * t0 + (3.0 * a2 - 2.0 * a) * t1 + (-6.0 * a2 + 6.0 * a) * p1
}
