//! 测试夹具

use glam::{Quat, Vec3};

use crate::host::{ActorBase, MoveHit, OwnerActor, OwnerRole};
use crate::root_motion::RootMotionMode;
use crate::skeleton::{BoneAtom, RefBone, RefSkeleton};

/// root(0) → child(1)，child 在 (10, 0, 0)
pub fn two_bone_skeleton() -> RefSkeleton {
    RefSkeleton::new(vec![
        RefBone::new("root", 0, BoneAtom::IDENTITY),
        RefBone::new("child", 0, BoneAtom::from_translation(Vec3::new(10.0, 0.0, 0.0))),
    ])
    .unwrap()
}

/// 简化的人形骨架，深度优先排列
///
/// ```text
/// 0 root
/// 1   pelvis
/// 2     spine → 3 neck → 4 head
/// 5     l_thigh → 6 l_calf → 7 l_foot
/// 8     r_thigh → 9 r_calf → 10 r_foot
/// ```
pub fn biped_skeleton() -> RefSkeleton {
    let t = |x: f32, y: f32, z: f32| BoneAtom::from_translation(Vec3::new(x, y, z));
    RefSkeleton::new(vec![
        RefBone::new("root", 0, BoneAtom::IDENTITY),
        RefBone::new("pelvis", 0, t(0.0, 0.0, 100.0)),
        RefBone::new("spine", 1, t(0.0, 0.0, 10.0)),
        RefBone::new("neck", 2, t(0.0, 0.0, 20.0)),
        RefBone::new("head", 3, t(0.0, 0.0, 10.0)),
        RefBone::new("l_thigh", 1, t(10.0, 0.0, -5.0)),
        RefBone::new("l_calf", 5, t(0.0, 0.0, -45.0)),
        RefBone::new("l_foot", 6, t(0.0, 0.0, -45.0)),
        RefBone::new("r_thigh", 1, t(-10.0, 0.0, -5.0)),
        RefBone::new("r_calf", 8, t(0.0, 0.0, -45.0)),
        RefBone::new("r_foot", 9, t(0.0, 0.0, -45.0)),
    ])
    .unwrap()
}

/// 记录调用的拥有者
#[derive(Debug)]
pub struct TestOwner {
    pub role: OwnerRole,
    pub stagger_tag: u32,
    pub location: Vec3,
    pub rotation: Quat,
    pub base: Option<ActorBase>,
    pub destroyed: bool,
    /// 物理步进消耗根运动的比例
    pub physics_consume_fraction: f32,
    pub destroy_during_physics: bool,
    pub mode_changes: Vec<(RootMotionMode, RootMotionMode)>,
    pub moves_without_base: usize,
}

impl Default for TestOwner {
    fn default() -> Self {
        Self {
            role: OwnerRole::default(),
            stagger_tag: 0,
            location: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            base: None,
            destroyed: false,
            physics_consume_fraction: 0.0,
            destroy_during_physics: false,
            mode_changes: Vec::new(),
            moves_without_base: 0,
        }
    }
}

impl OwnerActor for TestOwner {
    fn role(&self) -> OwnerRole {
        self.role
    }

    fn stagger_tag(&self) -> u32 {
        self.stagger_tag
    }

    fn set_stagger_tag(&mut self, tag: u32) {
        self.stagger_tag = tag;
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    fn location(&self) -> Vec3 {
        self.location
    }

    fn rotation(&self) -> Quat {
        self.rotation
    }

    fn move_actor(&mut self, delta: Vec3, new_rotation: Quat) -> Option<MoveHit> {
        if self.base.is_none() {
            self.moves_without_base += 1;
        }
        self.location += delta;
        self.rotation = new_rotation;
        None
    }

    fn base(&self) -> Option<ActorBase> {
        self.base
    }

    fn set_base(&mut self, base: Option<ActorBase>) {
        self.base = base;
    }

    fn perform_physics(&mut self, _delta_time: f32, root_motion_delta: Vec3) -> Vec3 {
        let consumed = root_motion_delta * self.physics_consume_fraction;
        self.location += consumed;
        if self.destroy_during_physics {
            self.destroyed = true;
        }
        consumed
    }

    fn root_motion_mode_changed(&mut self, previous: RootMotionMode, current: RootMotionMode) {
        self.mode_changes.push((previous, current));
    }
}
