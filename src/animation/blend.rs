//! 混合类节点
//!
//! 按权重混合、同步组载体、Morph 驱动、瞄准偏移和镜像。

use glam::{Quat, Vec2};

use super::PoseOutput;
use crate::skeleton::{BoneAtom, MirrorInfo, RefSkeleton};

/// 两路按权重混合，目标权重随时间过渡
#[derive(Clone, Debug, Default)]
pub struct BlendByWeight {
    /// 第二路子节点的当前权重
    pub child2_weight: f32,
    pub child2_weight_target: f32,
    pub blend_time_to_go: f32,
}

impl BlendByWeight {
    /// 设置目标权重
    pub fn set_blend_target(&mut self, target: f32, blend_time: f32) {
        self.child2_weight_target = target.clamp(0.0, 1.0);
        if blend_time <= 0.0 {
            self.child2_weight = self.child2_weight_target;
            self.blend_time_to_go = 0.0;
        } else {
            self.blend_time_to_go = blend_time;
        }
    }

    pub(crate) fn tick(&mut self, delta_time: f32) {
        if self.blend_time_to_go > 0.0 {
            if self.blend_time_to_go > delta_time {
                let delta = self.child2_weight_target - self.child2_weight;
                self.child2_weight += delta * (delta_time / self.blend_time_to_go);
                self.blend_time_to_go -= delta_time;
            } else {
                self.child2_weight = self.child2_weight_target;
                self.blend_time_to_go = 0.0;
            }
        }
    }

    pub(crate) fn child_weights(&self, child_count: usize) -> Vec<f32> {
        let mut weights = vec![0.0; child_count];
        match child_count {
            0 => {}
            1 => weights[0] = 1.0,
            _ => {
                weights[0] = 1.0 - self.child2_weight;
                weights[1] = self.child2_weight;
            }
        }
        weights
    }
}

/// 同步组载体：N 路加权直通，后代序列节点加入该组
#[derive(Clone, Debug)]
pub struct SyncGroupNode {
    pub group_name: String,
    pub rate_scale: f32,
    /// 用户设置的子节点权重，tick 时归一化
    pub weights: Vec<f32>,
}

impl SyncGroupNode {
    pub fn new(group_name: impl Into<String>) -> Self {
        Self {
            group_name: group_name.into(),
            rate_scale: 1.0,
            weights: Vec::new(),
        }
    }

    pub(crate) fn child_weights(&self, child_count: usize) -> Vec<f32> {
        let mut weights: Vec<f32> = (0..child_count)
            .map(|i| self.weights.get(i).copied().unwrap_or(0.0).max(0.0))
            .collect();
        let total: f32 = weights.iter().sum();
        if total > 0.0 {
            weights.iter_mut().for_each(|w| *w /= total);
        } else if let Some(first) = weights.first_mut() {
            *first = 1.0;
        }
        weights
    }
}

/// 把节点总权重写到 Morph 图中同名的权重节点
#[derive(Clone, Debug)]
pub struct MorphDriver {
    pub morph_node_name: String,
}

/// 一根骨骼的 3×3 瞄准偏移
///
/// 下标顺序：左上、左中、左下、中上、中中、中下、右上、右中、右下。
#[derive(Clone, Debug)]
pub struct AimOffsetProfile {
    pub bone_name: String,
    pub offsets: [Quat; 9],
}

#[derive(Clone, Debug, Default)]
pub struct AimOffset {
    /// 瞄准方向 [-1, 1]²，x 向右，y 向上
    pub aim: Vec2,
    pub profiles: Vec<AimOffsetProfile>,
    bone_indices: Vec<Option<usize>>,
}

impl AimOffset {
    pub fn new(profiles: Vec<AimOffsetProfile>) -> Self {
        Self {
            aim: Vec2::ZERO,
            profiles,
            bone_indices: Vec::new(),
        }
    }

    pub(crate) fn link(&mut self, skeleton: &RefSkeleton) {
        self.bone_indices = self
            .profiles
            .iter()
            .map(|p| {
                let index = skeleton.find_bone_by_name(&p.bone_name);
                if index.is_none() {
                    log::warn!("[动画节点] 瞄准偏移找不到骨骼 {}", p.bone_name);
                }
                index
            })
            .collect();
    }

    /// 双线性插值出一根骨骼的偏移
    pub fn interpolate(&self, offsets: &[Quat; 9]) -> Quat {
        let aim = self.aim.clamp(Vec2::splat(-1.0), Vec2::splat(1.0));
        let column = |c: usize| -> Quat {
            let up = offsets[c * 3];
            let center = offsets[c * 3 + 1];
            let down = offsets[c * 3 + 2];
            if aim.y >= 0.0 {
                center.slerp(up, aim.y)
            } else {
                center.slerp(down, -aim.y)
            }
        };
        let result = if aim.x >= 0.0 {
            column(1).slerp(column(2), aim.x)
        } else {
            column(1).slerp(column(0), -aim.x)
        };
        result.normalize()
    }

    /// 在子节点姿态上叠加偏移（局部空间左乘）
    pub(crate) fn apply(&self, pose: &mut PoseOutput, required: &[usize]) {
        for (profile, index) in self.profiles.iter().zip(&self.bone_indices) {
            let Some(bone) = *index else {
                continue;
            };
            if bone >= pose.atoms.len() || required.binary_search(&bone).is_err() {
                continue;
            }
            let offset = self.interpolate(&profile.offsets);
            let atom = &mut pose.atoms[bone];
            atom.rotation = (offset * atom.rotation).normalize();
        }
    }
}

/// 镜像节点
#[derive(Clone, Debug)]
pub struct MirrorNode {
    pub enable_mirroring: bool,
}

impl Default for MirrorNode {
    fn default() -> Self {
        Self { enable_mirroring: true }
    }
}

impl MirrorNode {
    /// 沿 X 轴镜像；有镜像来源的骨骼取来源骨骼的镜像
    pub(crate) fn apply(&self, pose: &mut PoseOutput, required: &[usize], mirror_table: &[MirrorInfo]) {
        if !self.enable_mirroring {
            return;
        }
        if mirror_table.len() != pose.atoms.len() {
            log::debug!("[动画节点] 镜像表长度 {} 与骨骼数不一致，跳过镜像", mirror_table.len());
            return;
        }
        let source: Vec<BoneAtom> = pose.atoms.clone();
        for &bone in required {
            let from = mirror_table[bone].source_index;
            let from = if from < source.len() { from } else { bone };
            pose.atoms[bone] = source[from].mirror_x();
        }
        pose.root_motion_delta = pose.root_motion_delta.mirror_x();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_blend_by_weight_over_time() {
        let mut blend = BlendByWeight::default();
        blend.set_blend_target(1.0, 1.0);
        blend.tick(0.5);
        assert!((blend.child2_weight - 0.5).abs() < 1.0e-5);
        assert_eq!(blend.child_weights(2), vec![0.5, 0.5]);
        blend.tick(1.0);
        assert_eq!(blend.child_weights(2), vec![0.0, 1.0]);
    }

    #[test]
    fn test_sync_group_weights_normalized() {
        let mut node = SyncGroupNode::new("walk");
        node.weights = vec![1.0, 3.0];
        assert_eq!(node.child_weights(2), vec![0.25, 0.75]);
        node.weights.clear();
        assert_eq!(node.child_weights(2), vec![1.0, 0.0]);
    }

    #[test]
    fn test_aim_offset_corners_and_center() {
        let mut offsets = [Quat::IDENTITY; 9];
        // 右中
        offsets[7] = Quat::from_rotation_z(-1.0);
        // 中上
        offsets[3] = Quat::from_rotation_y(-0.5);
        let mut aim = AimOffset::new(Vec::new());
        assert!(aim.interpolate(&offsets).dot(Quat::IDENTITY).abs() > 0.9999);
        aim.aim = Vec2::new(1.0, 0.0);
        assert!(aim.interpolate(&offsets).dot(offsets[7]).abs() > 0.9999);
        aim.aim = Vec2::new(0.0, 0.5);
        assert!(aim.interpolate(&offsets).dot(Quat::from_rotation_y(-0.25)).abs() > 0.9999);
    }

    #[test]
    fn test_mirror_swaps_sources() {
        let mut pose = PoseOutput {
            atoms: vec![
                BoneAtom::IDENTITY,
                BoneAtom::from_translation(Vec3::new(1.0, 2.0, 3.0)),
                BoneAtom::from_translation(Vec3::new(-5.0, 0.0, 0.0)),
            ],
            root_motion_delta: BoneAtom::from_translation(Vec3::new(4.0, 0.0, 0.0)),
            has_root_motion: true,
            curve_keys: Vec::new(),
        };
        let table = [
            MirrorInfo { source_index: 0 },
            MirrorInfo { source_index: 2 },
            MirrorInfo { source_index: 1 },
        ];
        MirrorNode::default().apply(&mut pose, &[0, 1, 2], &table);
        assert_eq!(pose.atoms[1].translation, Vec3::new(5.0, 0.0, 0.0));
        assert_eq!(pose.atoms[2].translation, Vec3::new(-1.0, 2.0, 3.0));
        assert_eq!(pose.root_motion_delta.translation, Vec3::new(-4.0, 0.0, 0.0));
    }
}
