//! 物理姿态耦合
//!
//! 物理资产描述每个刚体绑定的骨骼和标记；姿态来源（宿主物理引擎或自带的
//! Rapier 刚体集）提供世界空间刚体姿态。两个方向：
//! - 混入：模拟中的刚体姿态按物理权重覆盖组件空间变换
//! - 推送：动画姿态写给运动学刚体
//!
//! 混入每 tick 只做一次，`begin_tick` 清除标记。

mod rapier_bodies;

pub use rapier_bodies::RapierBodies;

use crate::skeleton::{BoneAtom, PoseBuffers, RefSkeleton};
use crate::WarnOnce;

/// 物理资产中的一个刚体
#[derive(Clone, Debug)]
pub struct BodySetup {
    pub bone_name: String,
    pub blocks_zero_extent: bool,
    pub blocks_non_zero_extent: bool,
    /// 参与包围盒计算
    pub considered_for_bounds: bool,
    /// 跟随动画
    pub kinematic: bool,
    /// 参与模拟（混入）
    pub simulated: bool,
    /// 碰撞球半径
    pub radius: f32,
}

impl BodySetup {
    /// 默认是参与模拟的动态刚体
    pub fn new(bone_name: impl Into<String>) -> Self {
        Self {
            bone_name: bone_name.into(),
            blocks_zero_extent: true,
            blocks_non_zero_extent: true,
            considered_for_bounds: true,
            kinematic: false,
            simulated: true,
            radius: 2.0,
        }
    }

    /// 运动学刚体：跟随动画，不参与混入
    pub fn kinematic(mut self) -> Self {
        self.kinematic = true;
        self.simulated = false;
        self
    }
}

/// 物理资产（只读共享）
#[derive(Clone, Debug, Default)]
pub struct PhysicsAsset {
    pub name: String,
    pub bodies: Vec<BodySetup>,
}

impl PhysicsAsset {
    pub fn new(name: impl Into<String>, bodies: Vec<BodySetup>) -> Self {
        Self {
            name: name.into(),
            bodies,
        }
    }

    pub fn find_body(&self, bone_name: &str) -> Option<usize> {
        self.bodies.iter().position(|b| b.bone_name == bone_name)
    }

    /// 每个刚体对应的骨骼索引
    pub fn link_bones(&self, skeleton: &RefSkeleton) -> Vec<Option<usize>> {
        self.bodies
            .iter()
            .map(|body| {
                let index = skeleton.find_bone_by_name(&body.bone_name);
                if index.is_none() {
                    log::warn!("[物理] {} 的刚体绑定骨骼 {} 不存在", self.name, body.bone_name);
                }
                index
            })
            .collect()
    }

    /// 物理资产引用的全部骨骼（必需骨骼补充用）
    pub fn bone_indices(&self, skeleton: &RefSkeleton) -> Vec<usize> {
        self.bodies
            .iter()
            .filter_map(|b| skeleton.find_bone_by_name(&b.bone_name))
            .collect()
    }
}

/// 物理姿态来源
///
/// 刚体按物理资产中的顺序编号，姿态都在世界空间。
pub trait PhysicsPoseSource {
    fn is_simulating(&self) -> bool;

    fn body_count(&self) -> usize;

    /// 模拟后的刚体姿态
    fn body_pose(&self, body: usize) -> Option<BoneAtom>;

    /// 运动学刚体的目标姿态
    fn set_kinematic_target(&mut self, body: usize, pose: &BoneAtom);

    /// 推进模拟；宿主物理引擎自行步进时保持空实现
    fn advance(&mut self, _delta_time: f32) {}
}

/// 实例侧的物理耦合状态
#[derive(Clone, Debug, Default)]
pub struct PhysicsBlend {
    body_bones: Vec<Option<usize>>,
    has_had_physics_blended_in: bool,
    warned: WarnOnce,
}

impl PhysicsBlend {
    pub fn new(asset: &PhysicsAsset, skeleton: &RefSkeleton) -> Self {
        Self {
            body_bones: asset.link_bones(skeleton),
            has_had_physics_blended_in: false,
            warned: WarnOnce::default(),
        }
    }

    /// 每个刚体对应的骨骼
    pub fn body_bones(&self) -> &[Option<usize>] {
        &self.body_bones
    }

    /// tick 开始时调用
    pub fn begin_tick(&mut self) {
        self.has_had_physics_blended_in = false;
    }

    pub fn has_had_physics_blended_in(&self) -> bool {
        self.has_had_physics_blended_in
    }

    /// 把模拟刚体的姿态混入组件空间变换
    ///
    /// 受影响骨骼的局部变换反算；未受物理驱动的子骨骼沿新的父骨骼重算组件空间。
    /// 返回本次是否真正执行了混入。
    #[allow(clippy::too_many_arguments)]
    pub fn blend_in_physics(
        &mut self,
        source: &dyn PhysicsPoseSource,
        asset: &PhysicsAsset,
        skeleton: &RefSkeleton,
        pose: &mut PoseBuffers,
        required_bones: &[usize],
        local_to_world: &BoneAtom,
        physics_weight: f32,
    ) -> bool {
        if self.has_had_physics_blended_in {
            if self.warned.first("double_blend") {
                log::warn!("[物理] {} 同一 tick 内重复混入物理，已忽略", asset.name);
            }
            return false;
        }
        if !source.is_simulating() || physics_weight <= 0.0 {
            return false;
        }
        let bone_count = skeleton.bone_count();
        if pose.space_bases.len() != bone_count || pose.local_atoms.len() != bone_count {
            return false;
        }

        let world_to_component = local_to_world.inverse();
        let weight = physics_weight.min(1.0);
        let mut changed = vec![false; bone_count];
        for (body, setup) in asset.bodies.iter().enumerate() {
            if !setup.simulated {
                continue;
            }
            let Some(Some(bone)) = self.body_bones.get(body).copied() else {
                continue;
            };
            let Some(world) = source.body_pose(body) else {
                continue;
            };
            let mut component = world * world_to_component;
            // 物理不驱动缩放
            component.scale = pose.space_bases[bone].scale;
            let blended = BoneAtom::blend(&pose.space_bases[bone], &component, weight);
            pose.space_bases[bone] = blended;
            pose.space_bases[bone].normalize_rotation();
            changed[bone] = true;
        }

        // 必需骨骼严格递增，父骨骼总在子骨骼之前
        for &bone in required_bones {
            if bone >= bone_count {
                continue;
            }
            let parent = skeleton.parent_index(bone);
            if changed[bone] {
                pose.local_atoms[bone] = if bone == 0 {
                    pose.space_bases[0]
                } else {
                    pose.space_bases[bone] * pose.space_bases[parent].inverse()
                };
                pose.local_atoms[bone].normalize_rotation();
            } else if bone != 0 && changed[parent] {
                pose.space_bases[bone] = pose.local_atoms[bone] * pose.space_bases[parent];
                changed[bone] = true;
            }
        }

        self.has_had_physics_blended_in = true;
        true
    }

    /// 把动画姿态推给运动学刚体，返回推送的刚体数
    pub fn update_kinematic_bodies(
        &self,
        source: &mut dyn PhysicsPoseSource,
        asset: &PhysicsAsset,
        pose: &PoseBuffers,
        local_to_world: &BoneAtom,
    ) -> usize {
        let mut pushed = 0;
        for (body, setup) in asset.bodies.iter().enumerate() {
            if !setup.kinematic {
                continue;
            }
            let Some(Some(bone)) = self.body_bones.get(body).copied() else {
                continue;
            };
            let Some(component) = pose.space_bases.get(bone) else {
                continue;
            };
            let world = *component * *local_to_world;
            source.set_kinematic_target(body, &world);
            pushed += 1;
        }
        pushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::two_bone_skeleton;
    use glam::{Quat, Vec3};

    /// 固定姿态的来源
    struct FixedSource {
        simulating: bool,
        poses: Vec<BoneAtom>,
        targets: Vec<Option<BoneAtom>>,
    }

    impl PhysicsPoseSource for FixedSource {
        fn is_simulating(&self) -> bool {
            self.simulating
        }

        fn body_count(&self) -> usize {
            self.poses.len()
        }

        fn body_pose(&self, body: usize) -> Option<BoneAtom> {
            self.poses.get(body).copied()
        }

        fn set_kinematic_target(&mut self, body: usize, pose: &BoneAtom) {
            self.targets[body] = Some(*pose);
        }
    }

    #[test]
    fn test_blend_in_once_per_tick() {
        let skel = two_bone_skeleton();
        let asset = PhysicsAsset::new("asset", vec![BodySetup::new("root")]);
        let mut blend = PhysicsBlend::new(&asset, &skel);
        let source = FixedSource {
            simulating: true,
            poses: vec![BoneAtom::from_translation(Vec3::new(0.0, 0.0, 10.0))],
            targets: vec![None],
        };
        let mut pose = PoseBuffers::from_ref_pose(&skel);
        let required = [0, 1];

        assert!(blend.blend_in_physics(&source, &asset, &skel, &mut pose, &required, &BoneAtom::IDENTITY, 0.5));
        assert!((pose.space_bases[0].translation - Vec3::new(0.0, 0.0, 5.0)).length() < 1.0e-5);
        // 子骨骼跟随
        assert!((pose.space_bases[1].translation - Vec3::new(10.0, 0.0, 5.0)).length() < 1.0e-5);
        assert!((pose.local_atoms[0].translation - Vec3::new(0.0, 0.0, 5.0)).length() < 1.0e-5);

        // 同一 tick 第二次调用不生效
        assert!(!blend.blend_in_physics(&source, &asset, &skel, &mut pose, &required, &BoneAtom::IDENTITY, 0.5));
        assert!((pose.space_bases[0].translation - Vec3::new(0.0, 0.0, 5.0)).length() < 1.0e-5);

        blend.begin_tick();
        assert!(!blend.has_had_physics_blended_in());
        assert!(blend.blend_in_physics(&source, &asset, &skel, &mut pose, &required, &BoneAtom::IDENTITY, 1.0));
        assert!((pose.space_bases[0].translation - Vec3::new(0.0, 0.0, 10.0)).length() < 1.0e-5);
    }

    #[test]
    fn test_blend_in_converts_world_to_component() {
        let skel = two_bone_skeleton();
        let asset = PhysicsAsset::new("asset", vec![BodySetup::new("child")]);
        let mut blend = PhysicsBlend::new(&asset, &skel);
        // 组件空间 → 世界空间：绕 Z 转 90°
        let local_to_world = BoneAtom::from_rotation(Quat::from_rotation_z(std::f32::consts::FRAC_PI_2));
        let source = FixedSource {
            simulating: true,
            poses: vec![BoneAtom::from_rotation_translation(
                local_to_world.rotation,
                Vec3::new(0.0, 20.0, 0.0),
            )],
            targets: vec![None],
        };
        let mut pose = PoseBuffers::from_ref_pose(&skel);
        assert!(blend.blend_in_physics(&source, &asset, &skel, &mut pose, &[0, 1], &local_to_world, 1.0));
        let child = pose.space_bases[1];
        assert!((child.translation - Vec3::new(20.0, 0.0, 0.0)).length() < 1.0e-4);
        assert!(child.rotation.abs_diff_eq(Quat::IDENTITY, 1.0e-4) || child.rotation.abs_diff_eq(-Quat::IDENTITY, 1.0e-4));
        assert!((pose.local_atoms[1].translation - Vec3::new(20.0, 0.0, 0.0)).length() < 1.0e-4);
    }

    #[test]
    fn test_not_simulating_skips_blend() {
        let skel = two_bone_skeleton();
        let asset = PhysicsAsset::new("asset", vec![BodySetup::new("root")]);
        let mut blend = PhysicsBlend::new(&asset, &skel);
        let source = FixedSource {
            simulating: false,
            poses: vec![BoneAtom::from_translation(Vec3::ONE)],
            targets: vec![None],
        };
        let mut pose = PoseBuffers::from_ref_pose(&skel);
        assert!(!blend.blend_in_physics(&source, &asset, &skel, &mut pose, &[0, 1], &BoneAtom::IDENTITY, 1.0));
        assert_eq!(pose.space_bases[0], BoneAtom::IDENTITY);
    }

    #[test]
    fn test_kinematic_push_uses_world_space() {
        let skel = two_bone_skeleton();
        let asset = PhysicsAsset::new(
            "asset",
            vec![BodySetup::new("root"), BodySetup::new("child").kinematic()],
        );
        let blend = PhysicsBlend::new(&asset, &skel);
        let mut source = FixedSource {
            simulating: false,
            poses: vec![BoneAtom::IDENTITY; 2],
            targets: vec![None; 2],
        };
        let pose = PoseBuffers::from_ref_pose(&skel);
        let local_to_world = BoneAtom::from_translation(Vec3::new(0.0, 0.0, 100.0));
        assert_eq!(blend.update_kinematic_bodies(&mut source, &asset, &pose, &local_to_world), 1);
        assert!(source.targets[0].is_none());
        let target = source.targets[1].unwrap();
        assert!((target.translation - Vec3::new(10.0, 0.0, 100.0)).length() < 1.0e-5);
    }

    #[test]
    fn test_missing_bone_is_unlinked() {
        let skel = two_bone_skeleton();
        let asset = PhysicsAsset::new("asset", vec![BodySetup::new("tail"), BodySetup::new("child")]);
        let blend = PhysicsBlend::new(&asset, &skel);
        assert_eq!(blend.body_bones(), &[None, Some(1)]);
        assert_eq!(asset.bone_indices(&skel), vec![1]);
    }
}
