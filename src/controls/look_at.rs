//! 注视控制器：让骨骼的某个轴指向目标点

use glam::{EulerRot, Quat, Vec2, Vec3};

use super::limb::find_between;
use super::{build_rotation_from_axes, Axis, BoneControlSpace, ControlFrame};
use crate::skeleton::BoneAtom;

const KINDA_SMALL: f32 = 1.0e-4;

#[derive(Clone, Debug)]
pub struct LookAtControl {
    // ========== 目标 ==========
    pub target_location: Vec3,
    pub target_location_space: BoneControlSpace,
    /// 插值目标；`target_location_interp_speed > 0` 时每帧向它靠拢
    pub desired_target_location: Vec3,
    pub target_location_interp_speed: f32,

    // ========== 轴 ==========
    pub look_at_axis: Axis,
    pub invert_look_at_axis: bool,
    /// 同时约束向上轴；否则只做最小旋转，保留动画的滚转
    pub define_up_axis: bool,
    pub up_axis: Axis,
    pub invert_up_axis: bool,

    // ========== 逐轴过滤 ==========
    pub allow_rotation_x: bool,
    pub allow_rotation_y: bool,
    pub allow_rotation_z: bool,
    /// 各轴角度范围（度），x 为下限 y 为上限
    pub rotation_angle_range_x: Vec2,
    pub rotation_angle_range_y: Vec2,
    pub rotation_angle_range_z: Vec2,
    pub allow_rotation_space: BoneControlSpace,

    // ========== 角度限制 ==========
    pub enable_limit: bool,
    /// 以参考姿态的朝向为限制基准，否则以当前朝向
    pub limit_based_on_ref_pose: bool,
    /// 度
    pub max_angle: f32,
    /// 超过此角度视为越界（度）
    pub outer_max_angle: f32,
    /// 度
    pub dead_zone_angle: f32,
    /// 越界时淡出
    pub disable_beyond_limit: bool,
    pub blend_in_time: f32,
    pub blend_out_time: f32,

    look_at_alpha: f32,
    look_at_alpha_target: f32,
    look_at_alpha_blend_time_to_go: f32,
}

impl Default for LookAtControl {
    fn default() -> Self {
        Self {
            target_location: Vec3::ZERO,
            target_location_space: BoneControlSpace::World,
            desired_target_location: Vec3::ZERO,
            target_location_interp_speed: 0.0,
            look_at_axis: Axis::X,
            invert_look_at_axis: false,
            define_up_axis: false,
            up_axis: Axis::Z,
            invert_up_axis: false,
            allow_rotation_x: true,
            allow_rotation_y: true,
            allow_rotation_z: true,
            rotation_angle_range_x: Vec2::new(-180.0, 180.0),
            rotation_angle_range_y: Vec2::new(-180.0, 180.0),
            rotation_angle_range_z: Vec2::new(-180.0, 180.0),
            allow_rotation_space: BoneControlSpace::BoneSpace,
            enable_limit: false,
            limit_based_on_ref_pose: true,
            max_angle: 45.0,
            outer_max_angle: 45.0,
            dead_zone_angle: 0.0,
            disable_beyond_limit: false,
            blend_in_time: 0.2,
            blend_out_time: 0.2,
            look_at_alpha: 1.0,
            look_at_alpha_target: 1.0,
            look_at_alpha_blend_time_to_go: 0.0,
        }
    }
}

impl LookAtControl {
    pub fn look_at_alpha(&self) -> f32 {
        self.look_at_alpha
    }

    pub fn set_look_at_alpha(&mut self, alpha: f32, blend_time: f32) {
        if self.look_at_alpha_target != alpha {
            self.look_at_alpha_target = alpha;
            self.look_at_alpha_blend_time_to_go = blend_time * (alpha - self.look_at_alpha).abs();
        }
    }

    /// 设置目标点；无插值速度时立即生效
    pub fn set_target_location(&mut self, location: Vec3) {
        self.desired_target_location = location;
        if self.target_location_interp_speed <= 0.0 {
            self.target_location = location;
        }
    }

    pub(crate) fn tick(&mut self, delta_time: f32) {
        let blend_delta = self.look_at_alpha_target - self.look_at_alpha;
        if self.look_at_alpha_blend_time_to_go > KINDA_SMALL && blend_delta.abs() > KINDA_SMALL {
            if self.look_at_alpha_blend_time_to_go <= delta_time {
                self.look_at_alpha = self.look_at_alpha_target;
                self.look_at_alpha_blend_time_to_go = 0.0;
            } else {
                self.look_at_alpha += blend_delta / self.look_at_alpha_blend_time_to_go * delta_time;
                self.look_at_alpha_blend_time_to_go -= delta_time;
            }
        } else {
            self.look_at_alpha = self.look_at_alpha_target;
            self.look_at_alpha_blend_time_to_go = 0.0;
        }

        if self.target_location_interp_speed > 0.0 {
            let delta = self.desired_target_location - self.target_location;
            if delta.length_squared() < KINDA_SMALL {
                self.target_location = self.desired_target_location;
            } else {
                let step = (delta_time * self.target_location_interp_speed).clamp(0.0, 1.0);
                self.target_location += delta * step;
            }
        }
    }

    pub(crate) fn affected_bones(&self, bone: usize) -> Vec<usize> {
        if !self.allow_rotation_x && !self.allow_rotation_y && !self.allow_rotation_z {
            return Vec::new();
        }
        vec![bone]
    }

    fn look_axis_dir(&self) -> Vec3 {
        let axis = self.look_at_axis.unit();
        if self.invert_look_at_axis {
            -axis
        } else {
            axis
        }
    }

    /// 死区与角度限制，返回是否越界
    fn apply_look_direction_limits(
        &mut self,
        desired: &mut Vec3,
        current: Vec3,
        bone: usize,
        frame: &ControlFrame,
        zero_weight: f32,
    ) -> bool {
        let mut dead_zone = 0.0;
        if self.dead_zone_angle > 0.0 && current.length() > KINDA_SMALL && desired.length() > KINDA_SMALL {
            let (axis, angle) = find_axis_and_angle(current, *desired);
            dead_zone = self.dead_zone_angle.to_radians();
            *desired = Quat::from_axis_angle(axis, (angle - dead_zone).max(0.0)) * current;
        }

        if !self.enable_limit {
            return false;
        }
        let limit_dir = if self.limit_based_on_ref_pose {
            frame
                .skeleton
                .ref_component_space(bone)
                .transform_vector(self.look_axis_dir())
                .normalize_or_zero()
        } else {
            current
        };
        if limit_dir.length() < KINDA_SMALL || desired.length() < KINDA_SMALL {
            return false;
        }

        let (axis, angle) = find_axis_and_angle(limit_dir, *desired);
        let max_rad = self.max_angle.to_radians();
        let outer_rad = self.outer_max_angle.to_radians();
        if angle > max_rad {
            *desired = Quat::from_axis_angle(axis, max_rad) * limit_dir;
        }

        if angle > outer_rad {
            if self.disable_beyond_limit && self.look_at_alpha_target > zero_weight {
                log::debug!("[骨骼控制] 注视目标越界，淡出");
                self.set_look_at_alpha(0.0, self.blend_out_time);
            }
            true
        } else {
            if self.disable_beyond_limit
                && angle <= outer_rad - dead_zone
                && self.look_at_alpha_target < 1.0 - zero_weight
            {
                self.set_look_at_alpha(1.0, self.blend_in_time);
            }
            false
        }
    }

    pub(crate) fn calculate(&mut self, bone: usize, frame: &ControlFrame) -> Vec<BoneAtom> {
        const ZERO_WEIGHT: f32 = 1.0e-5;

        let current = frame.space_bases[bone];
        let base_look_dir = current.transform_vector(self.look_axis_dir()).normalize_or_zero();
        let base_bone_pos = current.translation;

        let target = frame.point_to_component(bone, &self.target_location_space, self.target_location);
        let mut desired = (target - base_bone_pos).normalize_or_zero();

        self.apply_look_direction_limits(&mut desired, base_look_dir, bone, frame, ZERO_WEIGHT);
        if self.look_at_alpha < ZERO_WEIGHT || desired == Vec3::ZERO {
            return Vec::new();
        }

        let mut new_bone = current;
        if !self.define_up_axis {
            new_bone.rotation = (find_between(base_look_dir, desired) * current.rotation).normalize();
        } else {
            if self.up_axis == self.look_at_axis {
                log::warn!("[骨骼控制] 注视控制器的向上轴与注视轴相同");
            }
            let look_dir = if self.invert_look_at_axis { -desired } else { desired };
            let up_component = frame.env.local_to_world.inverse_transform_vector(Vec3::Z);
            let right = look_dir.cross(up_component);
            let right = if right.length() < KINDA_SMALL { Vec3::Y } else { right.normalize() };
            let mut up_dir = right.cross(look_dir);
            if self.invert_up_axis {
                up_dir = -up_dir;
            }
            if look_dir != up_dir && look_dir.dot(up_dir) < 0.1 {
                new_bone.rotation = build_rotation_from_axes(self.look_at_axis, look_dir, self.up_axis, up_dir);
            }
        }
        new_bone.translation = base_bone_pos;

        if self.enable_limit || !self.allow_rotation_x || !self.allow_rotation_y || !self.allow_rotation_z {
            new_bone.rotation = self.filter_rotation(bone, frame, current.rotation, new_bone.rotation);
        }

        vec![new_bone]
    }

    /// 在指定空间里按轴过滤 / 夹紧旋转增量
    fn filter_rotation(&self, bone: usize, frame: &ControlFrame, current: Quat, desired: Quat) -> Quat {
        let to_frame = frame.frame_to_component(bone, &self.allow_rotation_space).rotation.inverse();
        let current_in_frame = to_frame * current;
        let desired_in_frame = to_frame * desired;
        let delta = desired_in_frame * current_in_frame.inverse();

        let (yaw, pitch, roll) = delta.to_euler(EulerRot::ZYX);
        let clamp = |allowed: bool, angle: f32, range: Vec2| {
            if allowed {
                angle.clamp(range.x.to_radians(), range.y.to_radians())
            } else {
                0.0
            }
        };
        let roll = clamp(self.allow_rotation_x, roll, self.rotation_angle_range_x);
        let pitch = clamp(self.allow_rotation_y, pitch, self.rotation_angle_range_y);
        let yaw = clamp(self.allow_rotation_z, yaw, self.rotation_angle_range_z);

        let filtered = Quat::from_euler(EulerRot::ZYX, yaw, pitch, roll) * current_in_frame;
        (to_frame.inverse() * filtered).normalize()
    }
}

fn find_axis_and_angle(a: Vec3, b: Vec3) -> (Vec3, f32) {
    let a = a.normalize_or_zero();
    let b = b.normalize_or_zero();
    let cross = a.cross(b);
    let size = cross.length();
    if size < KINDA_SMALL {
        let (axis, _) = a.any_orthonormal_pair();
        return (axis, if a.dot(b) > 0.0 { 0.0 } else { std::f32::consts::PI });
    }
    let mut angle = size.min(1.0).asin();
    if a.dot(b) < 0.0 {
        angle = std::f32::consts::PI - angle;
    }
    (cross / size, angle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::ControlEnv;
    use crate::test_util::biped_skeleton;

    fn frame_parts() -> (crate::skeleton::RefSkeleton, Vec<BoneAtom>, Vec<BoneAtom>) {
        let skel = biped_skeleton();
        let locals = skel.ref_pose_array();
        let spaces = skel.ref_component_space_all().to_vec();
        (skel, locals, spaces)
    }

    #[test]
    fn test_points_axis_at_target() {
        let (skel, locals, spaces) = frame_parts();
        let env = ControlEnv::default();
        let frame = ControlFrame {
            skeleton: &skel,
            local_atoms: &locals,
            space_bases: &spaces,
            env: &env,
        };
        let head = skel.find_bone_by_name("head").unwrap();
        let head_pos = spaces[head].translation;
        let mut look = LookAtControl {
            target_location: head_pos + Vec3::new(0.0, 50.0, 0.0),
            target_location_space: BoneControlSpace::Component,
            ..Default::default()
        };
        let out = look.calculate(head, &frame);
        assert_eq!(out.len(), 1);
        assert!((out[0].rotation * Vec3::X).abs_diff_eq(Vec3::Y, 1.0e-4));
        assert!(out[0].translation.abs_diff_eq(head_pos, 1.0e-5));
    }

    #[test]
    fn test_limit_clamps_and_fades_beyond() {
        let (skel, locals, spaces) = frame_parts();
        let env = ControlEnv::default();
        let frame = ControlFrame {
            skeleton: &skel,
            local_atoms: &locals,
            space_bases: &spaces,
            env: &env,
        };
        let head = skel.find_bone_by_name("head").unwrap();
        let head_pos = spaces[head].translation;
        let mut look = LookAtControl {
            target_location: head_pos + Vec3::new(0.0, 50.0, 0.0),
            target_location_space: BoneControlSpace::Component,
            enable_limit: true,
            max_angle: 30.0,
            outer_max_angle: 60.0,
            disable_beyond_limit: true,
            blend_out_time: 0.5,
            ..Default::default()
        };
        let out = look.calculate(head, &frame);
        let dir = out[0].rotation * Vec3::X;
        assert!((dir.angle_between(Vec3::X) - 30f32.to_radians()).abs() < 1.0e-3);

        // 90° 超过外限，开始淡出
        look.tick(0.25);
        assert!(look.look_at_alpha() < 1.0);
        look.tick(0.5);
        assert_eq!(look.look_at_alpha(), 0.0);
    }

    #[test]
    fn test_disallowed_axes() {
        let look = LookAtControl {
            allow_rotation_x: false,
            allow_rotation_y: false,
            allow_rotation_z: false,
            ..Default::default()
        };
        assert!(look.affected_bones(3).is_empty());
    }
}
