//! 扭转骨与旋转倍增控制器

use glam::{Quat, Vec3};

use super::limb::find_between;
use super::ControlFrame;
use crate::skeleton::{unwind_radians, BoneAtom};

/// 把源骨骼相对参考姿态的滚转按比例传给受控骨骼
#[derive(Clone, Debug)]
pub struct TwistControl {
    pub source_bone_name: String,
    pub twist_angle_scale: f32,
}

impl Default for TwistControl {
    fn default() -> Self {
        Self {
            source_bone_name: String::new(),
            twist_angle_scale: 0.5,
        }
    }
}

impl TwistControl {
    pub(crate) fn calculate(&self, bone: usize, frame: &ControlFrame) -> Vec<BoneAtom> {
        let Some(source) = frame.skeleton.find_bone_by_name(&self.source_bone_name) else {
            return Vec::new();
        };

        let (roll_axis, roll_angle) = extract_roll(frame, source).to_axis_angle();
        let (roll_axis, roll_angle) = if roll_axis.dot(Vec3::X) < 0.0 {
            (-roll_axis, -roll_angle)
        } else {
            (roll_axis, roll_angle)
        };
        let roll_angle = unwind_radians(roll_angle);

        let ref_rotation = frame.skeleton.ref_pose(bone).rotation;
        let new_rotation = (ref_rotation * Quat::from_axis_angle(roll_axis, roll_angle * self.twist_angle_scale)).normalize();
        vec![rebuild_in_component(frame, bone, new_rotation)]
    }
}

/// 源骨骼局部旋转相对参考旋转的滚转（绕 X 轴）部分
fn extract_roll(frame: &ControlFrame, bone: usize) -> Quat {
    let local = frame.local_atoms[bone].rotation;
    let reference = frame.skeleton.ref_pose(bone).rotation;

    // 先把 X 轴对齐到参考姿态，剩下的就是滚转
    let to_ref = find_between(local * Vec3::X, reference * Vec3::X);
    let aligned = to_ref * local;
    (reference.inverse() * aligned).normalize()
}

/// 受控骨骼相对参考旋转的增量乘以倍数
#[derive(Clone, Debug)]
pub struct MultiplyControl {
    pub multiplier: f32,
}

impl Default for MultiplyControl {
    fn default() -> Self {
        Self { multiplier: 1.0 }
    }
}

impl MultiplyControl {
    pub(crate) fn calculate(&self, bone: usize, frame: &ControlFrame) -> Vec<BoneAtom> {
        let ref_rotation = frame.skeleton.ref_pose(bone).rotation;
        let delta = (ref_rotation.inverse() * frame.local_atoms[bone].rotation).normalize();

        let (mut axis, mut angle) = delta.to_axis_angle();
        let (ref_axis, _) = ref_rotation.to_axis_angle();
        if axis.dot(ref_axis) < 0.0 {
            axis = -axis;
            angle = -angle;
        }
        let angle = unwind_radians(angle);

        let new_rotation = (ref_rotation * Quat::from_axis_angle(axis, angle * self.multiplier)).normalize();
        vec![rebuild_in_component(frame, bone, new_rotation)]
    }
}

fn rebuild_in_component(frame: &ControlFrame, bone: usize, local_rotation: Quat) -> BoneAtom {
    let local = BoneAtom::from_rotation_translation(local_rotation, frame.local_atoms[bone].translation);
    if bone == 0 {
        local
    } else {
        local * frame.space_bases[frame.skeleton.parent_index(bone)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::ControlEnv;
    use crate::test_util::biped_skeleton;

    #[test]
    fn test_twist_takes_scaled_roll() {
        let skel = biped_skeleton();
        let mut locals = skel.ref_pose_array();
        let mut spaces = skel.ref_component_space_all().to_vec();
        // 小腿绕自身 X 轴滚转 0.8
        let calf = skel.find_bone_by_name("l_calf").unwrap();
        locals[calf].rotation = skel.ref_pose(calf).rotation * Quat::from_rotation_x(0.8);
        spaces[calf] = locals[calf] * spaces[skel.parent_index(calf)];

        let env = ControlEnv::default();
        let frame = ControlFrame {
            skeleton: &skel,
            local_atoms: &locals,
            space_bases: &spaces,
            env: &env,
        };
        let control = TwistControl {
            source_bone_name: "l_calf".to_string(),
            twist_angle_scale: 0.5,
        };
        let foot = skel.find_bone_by_name("l_foot").unwrap();
        let out = control.calculate(foot, &frame);
        assert_eq!(out.len(), 1);

        let local = out[0] * spaces[calf].inverse();
        let expected = skel.ref_pose(foot).rotation * Quat::from_rotation_x(0.4);
        assert!(local.rotation.dot(expected).abs() > 0.9999);
    }

    #[test]
    fn test_twist_missing_source_does_nothing() {
        let skel = biped_skeleton();
        let locals = skel.ref_pose_array();
        let spaces = skel.ref_component_space_all().to_vec();
        let env = ControlEnv::default();
        let frame = ControlFrame {
            skeleton: &skel,
            local_atoms: &locals,
            space_bases: &spaces,
            env: &env,
        };
        let control = TwistControl {
            source_bone_name: "nope".to_string(),
            ..Default::default()
        };
        assert!(control.calculate(3, &frame).is_empty());
    }

    #[test]
    fn test_multiply_doubles_delta() {
        let skel = biped_skeleton();
        let mut locals = skel.ref_pose_array();
        let head = skel.find_bone_by_name("head").unwrap();
        locals[head].rotation = skel.ref_pose(head).rotation * Quat::from_rotation_z(0.3);
        let spaces = skel.ref_component_space_all().to_vec();
        let env = ControlEnv::default();
        let frame = ControlFrame {
            skeleton: &skel,
            local_atoms: &locals,
            space_bases: &spaces,
            env: &env,
        };
        let control = MultiplyControl { multiplier: 2.0 };
        let out = control.calculate(head, &frame);
        let local = out[0] * spaces[skel.parent_index(head)].inverse();
        let expected = skel.ref_pose(head).rotation * Quat::from_rotation_z(0.6);
        assert!(local.rotation.dot(expected).abs() > 0.9999);
    }
}
