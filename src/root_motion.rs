//! 根运动处理
//!
//! 把网格空间的根运动增量转到世界空间，按模式移动 / 旋转拥有者，
//! 或累积起来交给物理步进消耗。

use glam::{Quat, Vec3};

use crate::host::OwnerActor;
use crate::skeleton::BoneAtom;

/// 根运动平移模式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RootMotionMode {
    #[default]
    Ignore,
    /// 直接移动拥有者
    Translate,
    /// 交给拥有者的物理步进
    Accel,
    /// 脱离硬附着基座后移动，再重新附着
    Relative,
}

/// 根运动旋转模式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RootMotionRotationMode {
    #[default]
    Ignore,
    RotateActor,
}

/// 一帧根运动处理的结果
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RootMotionResult {
    /// 本帧提取出的世界空间位移
    pub world_translation: Vec3,
    /// 本帧被拥有者消耗掉的位移
    pub consumed: Vec3,
    /// 物理步进期间拥有者被销毁
    pub owner_destroyed: bool,
}

/// 根运动状态
#[derive(Clone, Debug)]
pub struct RootMotionState {
    pub mode: RootMotionMode,
    /// 上一帧生效的模式
    pub previous_mode: RootMotionMode,
    pub rotation_mode: RootMotionRotationMode,
    /// Accel 模式下网格空间的逐轴缩放
    pub accel_scale: Vec3,
    /// 尚未被消耗的世界空间位移
    pub root_motion_delta: Vec3,
    pub root_motion_velocity: Vec3,
    /// 根骨骼局部平移（网格空间），每次求值后记录
    pub root_bone_translation: Vec3,

    pending_mode: Option<RootMotionMode>,
    had_root_motion: bool,
    /// (期望旋转, 实际写入后的旋转)，用于抵消宿主量化旋转带来的累积误差
    last_rotation: Option<(Quat, Quat)>,
}

impl Default for RootMotionState {
    fn default() -> Self {
        Self {
            mode: RootMotionMode::Ignore,
            previous_mode: RootMotionMode::Ignore,
            rotation_mode: RootMotionRotationMode::Ignore,
            accel_scale: Vec3::ONE,
            root_motion_delta: Vec3::ZERO,
            root_motion_velocity: Vec3::ZERO,
            root_bone_translation: Vec3::ZERO,
            pending_mode: None,
            had_root_motion: false,
            last_rotation: None,
        }
    }
}

impl RootMotionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否有任何根运动模式生效（跳帧策略使用）
    pub fn is_active(&self) -> bool {
        self.mode != RootMotionMode::Ignore || self.rotation_mode != RootMotionRotationMode::Ignore
    }

    /// 切换平移模式
    ///
    /// 还有根运动时切到 Ignore 会推迟一帧，让物理看到最后一步。
    pub fn set_mode(&mut self, mode: RootMotionMode) {
        if mode == self.mode {
            self.pending_mode = None;
            return;
        }
        if mode == RootMotionMode::Ignore && self.had_root_motion {
            log::debug!("[根运动] 切换到 Ignore 推迟一帧");
            self.pending_mode = Some(mode);
        } else {
            self.pending_mode = None;
            self.mode = mode;
        }
    }

    pub fn pending_mode(&self) -> Option<RootMotionMode> {
        self.pending_mode
    }

    /// 清空累积量（detach 时调用）
    pub fn reset(&mut self) {
        self.root_motion_delta = Vec3::ZERO;
        self.root_motion_velocity = Vec3::ZERO;
        self.pending_mode = None;
        self.had_root_motion = false;
        self.last_rotation = None;
    }

    /// 处理一帧根运动
    pub fn process(
        &mut self,
        delta: &BoneAtom,
        has_root_motion: bool,
        local_to_world: &BoneAtom,
        delta_time: f32,
        mut owner: Option<&mut dyn OwnerActor>,
    ) -> RootMotionResult {
        let mut result = RootMotionResult::default();

        if self.previous_mode != self.mode {
            log::debug!("[根运动] 模式变化 {:?} -> {:?}", self.previous_mode, self.mode);
            if let Some(owner) = owner.as_deref_mut() {
                owner.root_motion_mode_changed(self.previous_mode, self.mode);
            }
        }

        self.had_root_motion = has_root_motion;
        if !has_root_motion {
            self.root_motion_velocity = Vec3::ZERO;
            self.finish_frame();
            return result;
        }

        // ========== 平移 ==========
        if self.mode != RootMotionMode::Ignore {
            let mut mesh_translation = delta.translation;
            if self.mode == RootMotionMode::Accel {
                mesh_translation *= self.accel_scale;
            }
            let world = local_to_world.transform_vector(mesh_translation);
            result.world_translation = world;
            self.root_motion_velocity = if delta_time > 0.0 { world / delta_time } else { Vec3::ZERO };
            self.root_motion_delta += world;
        }

        // ========== 旋转 ==========
        let new_rotation = match (&owner, self.rotation_mode) {
            (Some(owner), RootMotionRotationMode::RotateActor) if !is_identity(delta.rotation) => {
                let mesh_to_world = local_to_world.rotation;
                let world_delta = (mesh_to_world * delta.rotation * mesh_to_world.inverse()).normalize();
                let current = owner.rotation();
                let base = match self.last_rotation {
                    Some((desired, applied)) if current.dot(applied).abs() > 1.0 - 1.0e-6 => desired,
                    _ => current,
                };
                Some((world_delta * base).normalize())
            }
            _ => None,
        };

        let Some(owner) = owner else {
            self.finish_frame();
            return result;
        };

        let apply_translation = matches!(self.mode, RootMotionMode::Translate | RootMotionMode::Relative)
            && self.previous_mode == self.mode;
        if apply_translation || new_rotation.is_some() {
            let translation = if apply_translation { self.root_motion_delta } else { Vec3::ZERO };
            let rotation = new_rotation.unwrap_or_else(|| owner.rotation());

            let saved_base = owner.base().filter(|b| self.mode == RootMotionMode::Relative && b.hard_attach);
            if saved_base.is_some() {
                owner.set_base(None);
            }
            let start = owner.location();
            if let Some(hit) = owner.move_actor(translation, rotation) {
                log::debug!("[根运动] 移动受阻 time={:.3}", hit.time);
            }
            if saved_base.is_some() {
                owner.set_base(saved_base);
            }

            if apply_translation {
                result.consumed = owner.location() - start;
                self.root_motion_delta = Vec3::ZERO;
            }
            if let Some(desired) = new_rotation {
                self.last_rotation = Some((desired, owner.rotation()));
            }
        }

        if self.mode == RootMotionMode::Accel && self.previous_mode == self.mode {
            let consumed = owner.perform_physics(delta_time, self.root_motion_delta);
            self.root_motion_delta -= consumed;
            result.consumed += consumed;
            if owner.is_destroyed() {
                log::debug!("[根运动] 物理步进期间拥有者被销毁");
                result.owner_destroyed = true;
                return result;
            }
        }

        self.finish_frame();
        result
    }

    fn finish_frame(&mut self) {
        self.previous_mode = self.mode;
        if let Some(mode) = self.pending_mode.take() {
            self.mode = mode;
        }
    }
}

fn is_identity(q: Quat) -> bool {
    q.w.abs() > 1.0 - 1.0e-6
}
