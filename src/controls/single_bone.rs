//! 单骨骼控制器：在指定空间里叠加或替换旋转 / 平移

use glam::{Quat, Vec3};

use super::{BoneControlSpace, ControlFrame};
use crate::skeleton::BoneAtom;

#[derive(Clone, Debug, Default)]
pub struct SingleBoneControl {
    pub apply_translation: bool,
    /// true 叠加，false 替换
    pub add_translation: bool,
    pub bone_translation: Vec3,
    pub bone_translation_space: BoneControlSpace,

    pub apply_rotation: bool,
    pub add_rotation: bool,
    pub bone_rotation: Quat,
    pub bone_rotation_space: BoneControlSpace,

    /// 额外缩放
    pub bone_scale: Option<f32>,
}

impl SingleBoneControl {
    pub(crate) fn calculate(&self, bone: usize, frame: &ControlFrame) -> Vec<BoneAtom> {
        let mut new_bone = frame.space_bases[bone];

        if self.apply_rotation {
            let frame_rotation = frame.frame_to_component(bone, &self.bone_rotation_space).rotation;
            if self.add_rotation {
                // 在目标空间里旋转：F * R * F⁻¹ * bone
                let world_delta = frame_rotation * self.bone_rotation * frame_rotation.inverse();
                new_bone.rotation = (world_delta * new_bone.rotation).normalize();
            } else {
                new_bone.rotation = (frame_rotation * self.bone_rotation).normalize();
            }
        }

        if self.apply_translation {
            let to_component = frame.frame_to_component(bone, &self.bone_translation_space);
            if self.add_translation {
                new_bone.translation += to_component.transform_vector(self.bone_translation);
            } else {
                new_bone.translation = to_component.transform_point(self.bone_translation);
            }
        }

        vec![new_bone]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::ControlEnv;
    use crate::test_util::biped_skeleton;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn test_add_translation_in_parent_space() {
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
        let head = skel.find_bone_by_name("head").unwrap();
        let control = SingleBoneControl {
            apply_translation: true,
            add_translation: true,
            bone_translation: Vec3::new(0.0, 0.0, 2.0),
            bone_translation_space: BoneControlSpace::ParentBoneSpace,
            ..Default::default()
        };
        let out = control.calculate(head, &frame);
        assert_eq!(out.len(), 1);
        let expected = spaces[head].translation + spaces[skel.parent_index(head)].transform_vector(Vec3::new(0.0, 0.0, 2.0));
        assert!(out[0].translation.abs_diff_eq(expected, 0.001));
    }

    #[test]
    fn test_replace_rotation_in_world_space() {
        let skel = biped_skeleton();
        let locals = skel.ref_pose_array();
        let spaces = skel.ref_component_space_all().to_vec();
        let env = ControlEnv {
            local_to_world: BoneAtom::from_rotation(Quat::from_rotation_z(FRAC_PI_2)),
            line_check: None,
        };
        let frame = ControlFrame {
            skeleton: &skel,
            local_atoms: &locals,
            space_bases: &spaces,
            env: &env,
        };
        let control = SingleBoneControl {
            apply_rotation: true,
            bone_rotation: Quat::from_rotation_z(FRAC_PI_2),
            bone_rotation_space: BoneControlSpace::World,
            ..Default::default()
        };
        let out = control.calculate(1, &frame);
        // 世界空间转 90° 恰好抵消组件到世界的旋转
        assert!(out[0].rotation.dot(Quat::IDENTITY).abs() > 0.999);
    }
}
