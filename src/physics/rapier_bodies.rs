//! Rapier 刚体集
//!
//! 自带的物理姿态来源：物理资产里每个刚体对应一个 Rapier 刚体。
//! - 运动学刚体：`KinematicPositionBased`，由动画推送目标姿态
//! - 模拟刚体：`Dynamic`，步进后读回姿态用于混入
//! - 其余：`Fixed`

use glam::{Quat, Vec3};
use rapier3d::na::{Quaternion, Translation3, UnitQuaternion};
use rapier3d::prelude::*;

use super::{PhysicsAsset, PhysicsPoseSource};
use crate::skeleton::{BoneAtom, RefSkeleton};

/// 基于 Rapier 的刚体集
pub struct RapierBodies {
    physics_pipeline: PhysicsPipeline,
    integration_parameters: IntegrationParameters,
    island_manager: IslandManager,
    broad_phase: DefaultBroadPhase,
    narrow_phase: NarrowPhase,
    rigid_body_set: RigidBodySet,
    collider_set: ColliderSet,
    impulse_joint_set: ImpulseJointSet,
    multibody_joint_set: MultibodyJointSet,
    ccd_solver: CCDSolver,

    /// 与物理资产刚体一一对应
    handles: Vec<RigidBodyHandle>,
    simulating: bool,
    /// 固定步长的频率
    pub fps: f32,
    pub max_substep_count: u32,
    /// Z 轴向上，单位厘米
    pub gravity: Vec3,
    /// 未满一个固定步的剩余时间
    time_accumulator: f32,
}

impl RapierBodies {
    /// 按物理资产和参考姿态建立刚体
    pub fn new(asset: &PhysicsAsset, skeleton: &RefSkeleton, local_to_world: &BoneAtom) -> Self {
        let mut rigid_body_set = RigidBodySet::new();
        let mut collider_set = ColliderSet::new();
        let mut handles = Vec::with_capacity(asset.bodies.len());

        for (setup, bone) in asset.bodies.iter().zip(asset.link_bones(skeleton)) {
            let world = match bone {
                Some(b) => skeleton.ref_component_space(b) * *local_to_world,
                None => *local_to_world,
            };
            let body_type = if setup.kinematic {
                RigidBodyType::KinematicPositionBased
            } else if setup.simulated {
                RigidBodyType::Dynamic
            } else {
                RigidBodyType::Fixed
            };
            let body = RigidBodyBuilder::new(body_type)
                .position(atom_to_isometry(&world))
                .ccd_enabled(false)
                .build();
            let handle = rigid_body_set.insert(body);
            let collider = ColliderBuilder::ball(setup.radius.max(0.01)).build();
            collider_set.insert_with_parent(collider, handle, &mut rigid_body_set);
            handles.push(handle);
        }

        let fps = 60.0;
        let mut integration_parameters = IntegrationParameters::default();
        integration_parameters.dt = 1.0 / fps;

        log::debug!("[物理] {} 创建 {} 个刚体", asset.name, handles.len());

        Self {
            physics_pipeline: PhysicsPipeline::new(),
            integration_parameters,
            island_manager: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            rigid_body_set,
            collider_set,
            impulse_joint_set: ImpulseJointSet::new(),
            multibody_joint_set: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            handles,
            simulating: false,
            fps,
            max_substep_count: 4,
            gravity: Vec3::new(0.0, 0.0, -980.0),
            time_accumulator: 0.0,
        }
    }

    pub fn set_simulating(&mut self, simulating: bool) {
        self.simulating = simulating;
    }

    /// 按固定步长推进
    ///
    /// 不足一步的时间留到下次；超过最大子步数的部分丢弃。返回实际步数。
    pub fn step(&mut self, delta_time: f32) -> u32 {
        let fixed_dt = 1.0 / self.fps.max(1.0);
        self.time_accumulator += delta_time.max(0.0);

        let mut steps = 0;
        while self.time_accumulator >= fixed_dt && steps < self.max_substep_count.max(1) {
            self.step_once(fixed_dt);
            self.time_accumulator -= fixed_dt;
            steps += 1;
        }
        if self.time_accumulator >= fixed_dt {
            log::debug!("[物理] 子步数达到上限，丢弃 {:.4}s", self.time_accumulator);
            self.time_accumulator = 0.0;
        }
        steps
    }

    fn step_once(&mut self, dt: f32) {
        self.integration_parameters.dt = dt;
        let gravity = vector![self.gravity.x, self.gravity.y, self.gravity.z];
        self.physics_pipeline.step(
            &gravity,
            &self.integration_parameters,
            &mut self.island_manager,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.rigid_body_set,
            &mut self.collider_set,
            &mut self.impulse_joint_set,
            &mut self.multibody_joint_set,
            &mut self.ccd_solver,
            None,
            &(),
            &(),
        );
    }
}

impl PhysicsPoseSource for RapierBodies {
    fn is_simulating(&self) -> bool {
        self.simulating
    }

    fn body_count(&self) -> usize {
        self.handles.len()
    }

    fn body_pose(&self, body: usize) -> Option<BoneAtom> {
        let handle = self.handles.get(body)?;
        let rb = self.rigid_body_set.get(*handle)?;
        Some(isometry_to_atom(rb.position()))
    }

    fn set_kinematic_target(&mut self, body: usize, pose: &BoneAtom) {
        let Some(handle) = self.handles.get(body) else {
            return;
        };
        if let Some(rb) = self.rigid_body_set.get_mut(*handle) {
            if rb.is_kinematic() {
                rb.set_next_kinematic_position(atom_to_isometry(pose));
            }
        }
    }

    fn advance(&mut self, delta_time: f32) {
        self.step(delta_time);
    }
}

/// BoneAtom → Rapier 等距变换（丢弃缩放）
fn atom_to_isometry(atom: &BoneAtom) -> Isometry<Real> {
    let q = atom.rotation;
    Isometry::from_parts(
        Translation3::new(atom.translation.x, atom.translation.y, atom.translation.z),
        UnitQuaternion::from_quaternion(Quaternion::new(q.w, q.x, q.y, q.z)),
    )
}

fn isometry_to_atom(iso: &Isometry<Real>) -> BoneAtom {
    let t = iso.translation.vector;
    let q = iso.rotation.quaternion();
    BoneAtom::from_rotation_translation(Quat::from_xyzw(q.i, q.j, q.k, q.w), Vec3::new(t.x, t.y, t.z))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::BodySetup;
    use crate::test_util::two_bone_skeleton;

    fn asset() -> PhysicsAsset {
        PhysicsAsset::new(
            "asset",
            vec![BodySetup::new("root").kinematic(), BodySetup::new("child")],
        )
    }

    #[test]
    fn test_bodies_start_at_ref_pose() {
        let skel = two_bone_skeleton();
        let bodies = RapierBodies::new(&asset(), &skel, &BoneAtom::IDENTITY);
        assert_eq!(bodies.body_count(), 2);
        let child = bodies.body_pose(1).unwrap();
        assert!((child.translation - Vec3::new(10.0, 0.0, 0.0)).length() < 1.0e-4);
        assert!(bodies.body_pose(2).is_none());
    }

    #[test]
    fn test_kinematic_target_reached_after_step() {
        let skel = two_bone_skeleton();
        let mut bodies = RapierBodies::new(&asset(), &skel, &BoneAtom::IDENTITY);
        let target = BoneAtom::from_rotation_translation(Quat::from_rotation_z(0.5), Vec3::new(1.0, 2.0, 3.0));
        bodies.set_kinematic_target(0, &target);
        assert_eq!(bodies.step(1.0 / 60.0 + 1.0e-4), 1);
        let pose = bodies.body_pose(0).unwrap();
        assert!((pose.translation - target.translation).length() < 1.0e-3);
        assert!(pose.rotation.dot(target.rotation).abs() > 0.9999);
    }

    #[test]
    fn test_dynamic_body_falls() {
        let skel = two_bone_skeleton();
        let mut bodies = RapierBodies::new(&asset(), &skel, &BoneAtom::IDENTITY);
        bodies.set_simulating(true);
        assert!(bodies.is_simulating());
        let before = bodies.body_pose(1).unwrap().translation.z;
        bodies.step(0.1);
        let after = bodies.body_pose(1).unwrap().translation.z;
        assert!(after < before);
    }

    #[test]
    fn test_step_accumulates_partial_time() {
        let skel = two_bone_skeleton();
        let mut bodies = RapierBodies::new(&asset(), &skel, &BoneAtom::IDENTITY);
        assert_eq!(bodies.step(0.01), 0);
        assert_eq!(bodies.step(0.01), 1);
    }
}
