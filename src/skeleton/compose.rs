//! 骨架合成与骨骼控制器应用
//!
//! 按合成顺序把局部变换累乘成组件空间变换，并在每根骨骼处
//! 应用挂在它上面的控制器链表。

use super::{BoneAtom, BoneVisibility, RefSkeleton};
use crate::controls::{ControlEnv, ControlFrame, SkelControlSet};

/// 实例的姿态缓冲
#[derive(Clone, Debug, Default)]
pub struct PoseBuffers {
    /// 局部空间变换
    pub local_atoms: Vec<BoneAtom>,
    /// 组件空间变换
    pub space_bases: Vec<BoneAtom>,
    /// 本次合成中已处理的骨骼
    pub processed: Vec<bool>,
}

impl PoseBuffers {
    pub fn new(bone_count: usize) -> Self {
        Self {
            local_atoms: vec![BoneAtom::IDENTITY; bone_count],
            space_bases: vec![BoneAtom::IDENTITY; bone_count],
            processed: vec![false; bone_count],
        }
    }

    pub fn from_ref_pose(skeleton: &RefSkeleton) -> Self {
        Self {
            local_atoms: skeleton.ref_pose_array(),
            space_bases: skeleton.ref_component_space_all().to_vec(),
            processed: vec![false; skeleton.bone_count()],
        }
    }

    pub fn bone_count(&self) -> usize {
        self.local_atoms.len()
    }

    /// 用父骨骼的组件空间变换重算 `bone` 的组件空间变换
    fn recompose(&mut self, skeleton: &RefSkeleton, bone: usize) {
        self.space_bases[bone] = if bone == 0 {
            self.local_atoms[0]
        } else {
            self.local_atoms[bone] * self.space_bases[skeleton.parent_index(bone)]
        };
    }
}

/// 合成选项
#[derive(Clone, Copy, Debug)]
pub struct ComposeOptions<'a> {
    pub lod: usize,
    pub recently_rendered: bool,
    /// 忽略全部控制器（首帧数组刚分配时）
    pub ignore_controllers: bool,
    /// 运行前物理控制器
    pub run_pre_physics: bool,
    /// 运行后物理控制器
    pub run_post_physics: bool,
    pub zero_weight_thresh: f32,
    pub mesh_name: &'a str,
}

/// 按合成顺序合成骨架
pub fn compose_skeleton(
    pose: &mut PoseBuffers,
    skeleton: &RefSkeleton,
    compose_order: &[usize],
    visibility: &[BoneVisibility],
    mut controls: Option<&mut SkelControlSet>,
    options: &ComposeOptions,
    env: &ControlEnv,
) {
    let bone_count = skeleton.bone_count();
    if pose.local_atoms.len() != bone_count || pose.space_bases.len() != bone_count {
        log::error!(
            "[骨架合成] {} 骨骼数组大小 {} / {} 与骨架 {} 不一致",
            options.mesh_name,
            pose.local_atoms.len(),
            pose.space_bases.len(),
            bone_count
        );
        return;
    }
    pose.processed.clear();
    pose.processed.resize(bone_count, false);

    for &bone in compose_order {
        if bone >= bone_count {
            log::error!("[骨架合成] {} 骨骼索引越界: {}", options.mesh_name, bone);
            continue;
        }
        pose.processed[bone] = true;

        if bone != 0 {
            let parent = skeleton.parent_index(bone);
            if !pose.processed[parent] {
                log::error!(
                    "[骨架合成] {} 骨骼 {} 在父骨骼 {} 之前处理",
                    options.mesh_name,
                    skeleton.bone_name(bone),
                    skeleton.bone_name(parent)
                );
                #[cfg(feature = "strict-nan-checks")]
                debug_assert!(false, "parent composed after child");
            }
        }
        pose.recompose(skeleton, bone);
        sanitize_space_base(pose, skeleton, bone, options.mesh_name);

        if options.ignore_controllers {
            continue;
        }
        if let Some(set) = controls.as_deref_mut() {
            apply_controllers_for_bone(pose, skeleton, bone, set, options, env);
        }
    }

    // 隐藏骨骼缩放清零，位置取父骨骼
    for bone in 0..visibility.len().min(bone_count) {
        if visibility[bone].is_visible() {
            continue;
        }
        let parent_space = if bone == 0 {
            pose.space_bases[0]
        } else {
            pose.space_bases[skeleton.parent_index(bone)]
        };
        let space = &mut pose.space_bases[bone];
        space.translation = parent_space.translation;
        space.scale = glam::Vec3::ZERO;
    }
}

fn sanitize_space_base(pose: &mut PoseBuffers, skeleton: &RefSkeleton, bone: usize, mesh_name: &str) {
    let space = &mut pose.space_bases[bone];
    if space.contains_nan() {
        log::error!("[骨架合成] {} 骨骼 {} 出现 NaN，重置为单位变换", mesh_name, skeleton.bone_name(bone));
        #[cfg(feature = "strict-nan-checks")]
        debug_assert!(false, "NaN in composed bone");
        *space = BoneAtom::IDENTITY;
    }
    space.normalize_rotation();
}

/// 在 `bone` 处依次应用控制器链表
pub fn apply_controllers_for_bone(
    pose: &mut PoseBuffers,
    skeleton: &RefSkeleton,
    bone: usize,
    set: &mut SkelControlSet,
    options: &ComposeOptions,
    env: &ControlEnv,
) {
    let Some(list) = set.list_for_bone(bone).map(|l| l.to_vec()) else {
        return;
    };
    let thresh = options.zero_weight_thresh;

    for control_index in list {
        let Some(control) = set.controls.get_mut(control_index) else {
            continue;
        };

        let weight = control.control_alpha();
        if weight <= thresh {
            continue;
        }
        if !control.runs_in_pass(options.run_pre_physics, options.run_post_physics) {
            continue;
        }
        if control.ignore_at_or_above_lod.map_or(false, |lod| options.lod >= lod) {
            continue;
        }
        if !options.recently_rendered && control.ignore_when_not_rendered {
            continue;
        }

        let affected: Vec<usize> = control
            .affected_bones(bone, skeleton)
            .into_iter()
            .filter(|&b| b < skeleton.bone_count())
            .collect();
        if affected.is_empty() {
            continue;
        }

        let (mut new_transforms, new_scales) = {
            let frame = ControlFrame {
                skeleton,
                local_atoms: &pose.local_atoms,
                space_bases: &pose.space_bases,
                env,
            };
            let transforms = control.calculate_new_bone_transforms(bone, &frame);
            let scales = control.calculate_new_bone_scales(bone, &frame);
            (transforms, scales)
        };

        if !new_transforms.is_empty() && new_transforms.len() != affected.len() {
            log::warn!(
                "[骨骼控制] {} 控制器 {} 输出 {} 个变换，影响骨骼 {} 个，跳过",
                options.mesh_name,
                control.name,
                new_transforms.len(),
                affected.len()
            );
            continue;
        }

        for (i, transform) in new_transforms.iter_mut().enumerate() {
            if transform.contains_nan() {
                log::error!(
                    "[骨骼控制] {} 控制器 {} 在骨骼 {} 输出 NaN，重置为单位变换",
                    options.mesh_name,
                    control.name,
                    skeleton.bone_name(affected[i])
                );
                #[cfg(feature = "strict-nan-checks")]
                debug_assert!(false, "NaN from bone controller");
                *transform = BoneAtom::IDENTITY;
            }
        }

        let alpha = control.blend_type.alpha(weight);
        blend_control_output(pose, skeleton, &affected, &new_transforms, &new_scales, alpha, options);

        // 已处理但不在影响列表里的骨骼，父骨骼可能被移动过，重新合成
        let first = affected[0];
        for b in (first + 1)..=bone.min(skeleton.bone_count() - 1) {
            if pose.processed[b] && !affected.contains(&b) {
                pose.recompose(skeleton, b);
            }
        }
    }
}

/// 把控制器输出按 alpha 写回局部变换与组件空间
///
/// `transforms` 是组件空间结果，转回相对父骨骼的局部变换后混合；父骨骼同在影响列表里时，
/// 以控制器给出的父骨骼结果为基准。`scales` 是累计缩放，同理除以父骨骼的新缩放得到相对缩放。
fn blend_control_output(
    pose: &mut PoseBuffers,
    skeleton: &RefSkeleton,
    affected: &[usize],
    transforms: &[BoneAtom],
    scales: &[f32],
    alpha: f32,
    options: &ComposeOptions,
) {
    let thresh = options.zero_weight_thresh;
    if alpha <= thresh {
        return;
    }
    let parent_slot = |i: usize| -> Option<usize> {
        let a = affected[i];
        if a == 0 {
            return None;
        }
        let parent = skeleton.parent_index(a);
        affected[..i].iter().position(|&p| p == parent)
    };

    if !transforms.is_empty() && transforms.len() == affected.len() {
        for (i, &a) in affected.iter().enumerate() {
            let parent_space = if a == 0 {
                BoneAtom::IDENTITY
            } else {
                match parent_slot(i) {
                    Some(j) => transforms[j],
                    None => pose.space_bases[skeleton.parent_index(a)],
                }
            };

            // 求逆会反转父骨骼缩放，这里只取平移和旋转，缩放沿用原局部值
            let mut relative = transforms[i] * parent_space.inverse();
            relative.scale = pose.local_atoms[a].scale;

            if alpha >= 1.0 - thresh {
                pose.local_atoms[a] = relative;
            } else {
                pose.local_atoms[a].blend_with(&relative, alpha);
            }
            pose.local_atoms[a].normalize_rotation();
            pose.recompose(skeleton, a);
            sanitize_space_base(pose, skeleton, a, options.mesh_name);
        }
    }

    if !scales.is_empty() && scales.len() == affected.len() {
        for (i, &a) in affected.iter().enumerate() {
            let parent_scale = parent_slot(i).map_or(1.0, |j| scales[j]);
            let relative = if parent_scale == 0.0 { 1.0 } else { scales[i] / parent_scale };
            let factor = if alpha >= 1.0 - thresh {
                relative
            } else {
                1.0 + (relative - 1.0) * alpha
            };
            pose.local_atoms[a].scale *= factor;
            pose.space_bases[a].scale *= factor;
        }
    }
}
