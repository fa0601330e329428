//! 两骨骼肢体 IK 与脚部贴地

use glam::{Vec2, Vec3};

use super::{build_rotation_from_axes, Axis, BoneControlSpace, ControlFrame};
use crate::skeleton::{BoneAtom, RefSkeleton};

const KINDA_SMALL: f32 = 1.0e-4;

/// 两骨骼 IK：上臂 → 下臂 → 末端
#[derive(Clone, Debug)]
pub struct LimbControl {
    pub effector_location: Vec3,
    pub effector_location_space: BoneControlSpace,
    pub joint_target_location: Vec3,
    pub joint_target_location_space: BoneControlSpace,

    /// 沿肢体方向的骨骼轴
    pub bone_axis: Axis,
    /// 垂直于关节平面的骨骼轴
    pub joint_axis: Axis,
    pub invert_bone_axis: bool,
    pub invert_joint_axis: bool,

    /// 保持末端骨骼相对下臂的旋转
    pub maintain_effector_rel_rot: bool,
    /// 末端骨骼旋转取效果器所在空间
    pub take_rotation_from_effector_space: bool,
    /// 在原有旋转上叠加最小旋转，而不是重建基
    pub rotate_joint: bool,

    pub allow_stretching: bool,
    /// x: 开始拉伸的伸展比例，y: 最大拉伸比例
    pub stretch_limits: Vec2,
}

impl Default for LimbControl {
    fn default() -> Self {
        Self {
            effector_location: Vec3::ZERO,
            effector_location_space: BoneControlSpace::Component,
            joint_target_location: Vec3::ZERO,
            joint_target_location_space: BoneControlSpace::Component,
            bone_axis: Axis::X,
            joint_axis: Axis::Y,
            invert_bone_axis: false,
            invert_joint_axis: false,
            maintain_effector_rel_rot: false,
            take_rotation_from_effector_space: false,
            rotate_joint: false,
            allow_stretching: false,
            stretch_limits: Vec2::new(0.5, 1.0),
        }
    }
}

/// 两骨骼解算结果（组件空间位置）
struct LimbSolution {
    joint_pos: Vec3,
    end_pos: Vec3,
    plane_normal: Vec3,
}

impl LimbControl {
    /// [上臂, 下臂, 末端]；骨架太短时为空
    pub(crate) fn affected_bones(&self, bone: usize, skeleton: &RefSkeleton) -> Vec<usize> {
        limb_bones(bone, skeleton).map(|(u, l)| vec![u, l, bone]).unwrap_or_default()
    }

    pub(crate) fn calculate(&self, bone: usize, frame: &ControlFrame) -> Vec<BoneAtom> {
        let desired_pos = frame.point_to_component(bone, &self.effector_location_space, self.effector_location);
        self.solve(bone, frame, desired_pos)
    }

    /// 给定组件空间目标位置求解
    pub(crate) fn solve(&self, bone: usize, frame: &ControlFrame, desired_pos: Vec3) -> Vec<BoneAtom> {
        let Some((upper, lower)) = limb_bones(bone, frame.skeleton) else {
            return Vec::new();
        };
        let spaces = frame.space_bases;

        let root_pos = spaces[upper].translation;
        let initial_joint_pos = spaces[lower].translation;
        let initial_end_pos = spaces[bone].translation;

        let effector_rel = if self.maintain_effector_rel_rot {
            spaces[bone] * spaces[lower].inverse()
        } else {
            BoneAtom::IDENTITY
        };

        let mut desired_pos = desired_pos;
        let mut desired_delta = desired_pos - root_pos;
        let mut desired_length = desired_delta.length();
        let desired_dir = if desired_length < KINDA_SMALL {
            desired_length = KINDA_SMALL;
            Vec3::X
        } else {
            desired_delta / desired_length
        };

        // 非均匀缩放不支持，按最大轴缩放修正长度
        let bone_scaling = spaces[upper].max_axis_scale();
        if bone_scaling > KINDA_SMALL && (1.0 - bone_scaling).abs() > KINDA_SMALL {
            desired_length /= bone_scaling;
            desired_delta = desired_dir * desired_length;
            desired_pos = root_pos + desired_delta;
        }

        let joint_target_pos =
            frame.point_to_component(bone, &self.joint_target_location_space, self.joint_target_location);
        let (plane_normal, bend_dir) = joint_plane(desired_dir, joint_target_pos - root_pos);

        let mut lower_length = frame.local_atoms[bone].translation.length();
        let mut upper_length = frame.local_atoms[lower].translation.length();
        let max_length = lower_length + upper_length;

        if self.allow_stretching {
            let scale_range = self.stretch_limits.y - self.stretch_limits.x;
            if scale_range > KINDA_SMALL && max_length > KINDA_SMALL {
                let reach_ratio = desired_length / max_length;
                let scaling =
                    (self.stretch_limits.y - 1.0) * ((reach_ratio - self.stretch_limits.x) / scale_range).clamp(0.0, 1.0);
                if scaling > KINDA_SMALL {
                    lower_length *= 1.0 + scaling;
                    upper_length *= 1.0 + scaling;
                }
            }
        }

        let solution = solve_two_bone(
            root_pos,
            desired_pos,
            desired_dir,
            desired_length,
            bend_dir,
            plane_normal,
            upper_length,
            lower_length,
        );

        let mut upper_tm = spaces[upper];
        let mut lower_tm = spaces[lower];
        if self.rotate_joint {
            let old_dir = (initial_joint_pos - root_pos).normalize_or_zero();
            let new_dir = (solution.joint_pos - root_pos).normalize_or_zero();
            upper_tm.rotation = (find_between(old_dir, new_dir) * upper_tm.rotation).normalize();

            let old_dir = (initial_end_pos - initial_joint_pos).normalize_or_zero();
            let new_dir = (solution.end_pos - solution.joint_pos).normalize_or_zero();
            lower_tm.rotation = (find_between(old_dir, new_dir) * lower_tm.rotation).normalize();
        } else {
            let joint_axis_dir = if self.invert_joint_axis { -solution.plane_normal } else { solution.plane_normal };

            let upper_dir = (solution.joint_pos - root_pos).normalize_or_zero();
            let bone_axis_dir = if self.invert_bone_axis { -upper_dir } else { upper_dir };
            if bone_axis_dir != Vec3::ZERO {
                upper_tm.rotation = build_rotation_from_axes(self.bone_axis, bone_axis_dir, self.joint_axis, joint_axis_dir);
            }

            let lower_dir = (solution.end_pos - solution.joint_pos).normalize_or_zero();
            let bone_axis_dir = if self.invert_bone_axis { -lower_dir } else { lower_dir };
            if bone_axis_dir != Vec3::ZERO {
                lower_tm.rotation = build_rotation_from_axes(self.bone_axis, bone_axis_dir, self.joint_axis, joint_axis_dir);
            }
        }
        upper_tm.translation = root_pos;
        lower_tm.translation = solution.joint_pos;

        let mut end_tm = spaces[bone];
        if self.take_rotation_from_effector_space {
            end_tm.rotation = frame.frame_to_component(bone, &self.effector_location_space).rotation;
        } else if self.maintain_effector_rel_rot {
            end_tm.rotation = (effector_rel * lower_tm).rotation;
        }
        end_tm.translation = solution.end_pos;

        vec![upper_tm, lower_tm, end_tm]
    }
}

fn limb_bones(bone: usize, skeleton: &RefSkeleton) -> Option<(usize, usize)> {
    if bone == 0 || bone >= skeleton.bone_count() {
        return None;
    }
    let lower = skeleton.parent_index(bone);
    if lower == 0 {
        return None;
    }
    Some((skeleton.parent_index(lower), lower))
}

/// 关节平面法线与弯曲方向
fn joint_plane(desired_dir: Vec3, joint_target_delta: Vec3) -> (Vec3, Vec3) {
    if joint_target_delta.length() < KINDA_SMALL {
        return (Vec3::Z, Vec3::Y);
    }
    let normal = desired_dir.cross(joint_target_delta);
    if normal.length() < KINDA_SMALL {
        return desired_dir.any_orthonormal_pair();
    }
    let bend = (joint_target_delta - joint_target_delta.dot(desired_dir) * desired_dir).normalize();
    (normal.normalize(), bend)
}

#[allow(clippy::too_many_arguments)]
fn solve_two_bone(
    root_pos: Vec3,
    desired_pos: Vec3,
    desired_dir: Vec3,
    desired_length: f32,
    bend_dir: Vec3,
    plane_normal: Vec3,
    upper_length: f32,
    lower_length: f32,
) -> LimbSolution {
    let max_length = upper_length + lower_length;
    let mut end_pos = desired_pos;
    let joint_pos;

    if desired_length > max_length {
        // 够不到：完全伸直
        end_pos = root_pos + max_length * desired_dir;
        joint_pos = root_pos + upper_length * desired_dir;
    } else {
        let two_ab = 2.0 * upper_length * desired_length;
        let cos_angle = if two_ab != 0.0 {
            (upper_length * upper_length + desired_length * desired_length - lower_length * lower_length) / two_ab
        } else {
            0.0
        };
        let reverse_upper_bone = cos_angle < 0.0;

        if !(-1.0..=1.0).contains(&cos_angle) {
            // 三角形不成立：两段折回
            if upper_length > lower_length {
                joint_pos = root_pos + upper_length * desired_dir;
                end_pos = joint_pos - lower_length * desired_dir;
            } else {
                joint_pos = root_pos - upper_length * desired_dir;
                end_pos = joint_pos + lower_length * desired_dir;
            }
        } else {
            let angle = cos_angle.acos();
            let joint_line_dist = upper_length * angle.sin();
            let proj_sq = upper_length * upper_length - joint_line_dist * joint_line_dist;
            let mut proj_dist = if proj_sq > 0.0 { proj_sq.sqrt() } else { 0.0 };
            if reverse_upper_bone {
                proj_dist = -proj_dist;
            }
            joint_pos = root_pos + proj_dist * desired_dir + joint_line_dist * bend_dir;
        }
    }

    LimbSolution {
        joint_pos,
        end_pos,
        plane_normal,
    }
}

/// 从 `from` 转到 `to` 的最小旋转（任一为零向量时返回单位旋转）
pub(crate) fn find_between(from: Vec3, to: Vec3) -> glam::Quat {
    if from == Vec3::ZERO || to == Vec3::ZERO {
        return glam::Quat::IDENTITY;
    }
    glam::Quat::from_rotation_arc(from.normalize(), to.normalize())
}

/// 脚部贴地：效果器来自腿部射线检测
#[derive(Clone, Debug)]
pub struct FootPlacementControl {
    pub limb: LimbControl,
    pub foot_offset: f32,
    pub foot_up_axis: Axis,
    pub invert_foot_up_axis: bool,
    pub orient_foot_to_ground: bool,
    /// 角度（度）
    pub max_foot_orient_adjust: f32,
    pub max_up_adjustment: f32,
    pub max_down_adjustment: f32,
    pub only_enable_for_up_adjustment: bool,
}

impl Default for FootPlacementControl {
    fn default() -> Self {
        Self {
            limb: LimbControl::default(),
            foot_offset: 0.0,
            foot_up_axis: Axis::X,
            invert_foot_up_axis: false,
            orient_foot_to_ground: true,
            max_foot_orient_adjust: 30.0,
            max_up_adjustment: 50.0,
            max_down_adjustment: 0.0,
            only_enable_for_up_adjustment: false,
        }
    }
}

impl FootPlacementControl {
    pub(crate) fn calculate(&self, bone: usize, frame: &ControlFrame) -> Vec<BoneAtom> {
        let Some((upper, _)) = limb_bones(bone, frame.skeleton) else {
            return Vec::new();
        };
        let local_to_world = frame.env.local_to_world;
        let world_to_local = local_to_world.inverse();

        let world_root = local_to_world.transform_point(frame.space_bases[upper].translation);
        let world_end = local_to_world.transform_point(frame.space_bases[bone].translation);
        let leg_dir = (world_end - world_root).normalize_or_zero();

        // 射线多延长 100，避开检测的边界误差
        let check_end = world_end + (100.0 + self.foot_offset + self.max_down_adjustment) * leg_dir;
        let mut hit = frame
            .env
            .line_check
            .and_then(|check| check.leg_line_check(world_root, check_end));

        let mut leg_adjust = 0.0;
        if let Some(h) = hit {
            // 正值向下，负值向上
            leg_adjust = (h.location - world_end).dot(leg_dir);
            if leg_adjust > self.foot_offset + self.max_down_adjustment {
                hit = None;
            }
        }

        let desired_world = match hit {
            Some(_) => {
                leg_adjust -= self.foot_offset;
                leg_adjust = leg_adjust.clamp(-self.max_up_adjustment, self.max_down_adjustment);
                if self.only_enable_for_up_adjustment && leg_adjust >= 0.0 {
                    return Vec::new();
                }
                world_end + leg_adjust * leg_dir
            }
            None => {
                if self.only_enable_for_up_adjustment {
                    return Vec::new();
                }
                world_end + self.max_down_adjustment * leg_dir
            }
        };

        let desired_pos = world_to_local.transform_point(desired_world);
        let mut out = self.limb.solve(bone, frame, desired_pos);
        if out.len() != 3 {
            return out;
        }

        if let Some(h) = hit {
            let foot_world = local_to_world.transform_point(out[2].translation);
            if self.orient_foot_to_ground && (foot_world - desired_world).length() < 1.0 && h.normal != Vec3::ZERO {
                let axis = self.foot_up_axis.unit();
                let axis = if self.invert_foot_up_axis { -axis } else { axis };
                let current_dir = (out[2].rotation * axis).normalize_or_zero();
                let normal_cs = world_to_local.transform_vector(h.normal).normalize_or_zero();
                let delta = find_between(current_dir, normal_cs);

                let (delta_axis, delta_angle) = delta.to_axis_angle();
                let max_rad = self.max_foot_orient_adjust.to_radians();
                let clamped = crate::skeleton::unwind_radians(delta_angle).clamp(-max_rad, max_rad);
                let delta = glam::Quat::from_axis_angle(delta_axis, clamped);
                out[2].rotation = (delta * out[2].rotation).normalize();
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::ControlEnv;
    use crate::host::{LegLineCheck, LineHit};
    use crate::skeleton::{PoseBuffers, RefBone};

    /// 肩(0) → 上臂(1) → 前臂(2) → 手(3)，每段长 10，沿 X 轴
    fn arm() -> RefSkeleton {
        RefSkeleton::new(vec![
            RefBone::new("shoulder", 0, BoneAtom::IDENTITY),
            RefBone::new("upperarm", 0, BoneAtom::from_translation(Vec3::new(0.0, 0.0, 0.0))),
            RefBone::new("forearm", 1, BoneAtom::from_translation(Vec3::new(10.0, 0.0, 0.0))),
            RefBone::new("hand", 2, BoneAtom::from_translation(Vec3::new(10.0, 0.0, 0.0))),
        ])
        .unwrap()
    }

    #[test]
    fn test_affected_bones() {
        let skel = arm();
        let limb = LimbControl::default();
        assert_eq!(limb.affected_bones(3, &skel), vec![1, 2, 3]);
        // 前臂的祖父骨骼是根骨骼，链条照样成立
        assert_eq!(limb.affected_bones(2, &skel), vec![0, 1, 2]);
        assert!(limb.affected_bones(1, &skel).is_empty());
        assert!(limb.affected_bones(0, &skel).is_empty());
    }

    #[test]
    fn test_reaches_target_inside_range() {
        let skel = arm();
        let pose = PoseBuffers::from_ref_pose(&skel);
        let env = ControlEnv::default();
        let frame = ControlFrame {
            skeleton: &skel,
            local_atoms: &pose.local_atoms,
            space_bases: &pose.space_bases,
            env: &env,
        };
        let limb = LimbControl {
            effector_location: Vec3::new(12.0, 0.0, 0.0),
            joint_target_location: Vec3::new(6.0, 10.0, 0.0),
            ..Default::default()
        };
        let out = limb.calculate(3, &frame);
        assert_eq!(out.len(), 3);
        assert!(out[2].translation.abs_diff_eq(Vec3::new(12.0, 0.0, 0.0), 0.001));
        // 关节到两端距离保持骨长，并弯向关节目标
        assert!(((out[1].translation - out[0].translation).length() - 10.0).abs() < 0.001);
        assert!(((out[2].translation - out[1].translation).length() - 10.0).abs() < 0.001);
        assert!(out[1].translation.y > 0.0);
        // 上臂 X 轴指向关节
        let upper_x = out[0].rotation * Vec3::X;
        let expected = (out[1].translation - out[0].translation).normalize();
        assert!(upper_x.abs_diff_eq(expected, 0.001));
    }

    #[test]
    fn test_out_of_reach_extends_fully() {
        let skel = arm();
        let pose = PoseBuffers::from_ref_pose(&skel);
        let env = ControlEnv::default();
        let frame = ControlFrame {
            skeleton: &skel,
            local_atoms: &pose.local_atoms,
            space_bases: &pose.space_bases,
            env: &env,
        };
        let limb = LimbControl {
            effector_location: Vec3::new(0.0, 50.0, 0.0),
            joint_target_location: Vec3::new(0.0, 0.0, 10.0),
            ..Default::default()
        };
        let out = limb.calculate(3, &frame);
        assert!(out[2].translation.abs_diff_eq(Vec3::new(0.0, 20.0, 0.0), 0.001));
        assert!(out[1].translation.abs_diff_eq(Vec3::new(0.0, 10.0, 0.0), 0.001));
    }

    struct Floor {
        height: f32,
    }

    impl LegLineCheck for Floor {
        fn leg_line_check(&self, start: Vec3, end: Vec3) -> Option<LineHit> {
            if (start.z - self.height) * (end.z - self.height) > 0.0 {
                return None;
            }
            let t = (start.z - self.height) / (start.z - end.z);
            Some(LineHit {
                location: start + (end - start) * t,
                normal: Vec3::Z,
            })
        }
    }

    /// 髋(1) 在 z=20，膝(2) 在 z=10（稍向前），踝(3) 在 z=0
    fn leg() -> RefSkeleton {
        RefSkeleton::new(vec![
            RefBone::new("root", 0, BoneAtom::IDENTITY),
            RefBone::new("thigh", 0, BoneAtom::from_translation(Vec3::new(0.0, 0.0, 20.0))),
            RefBone::new("calf", 1, BoneAtom::from_translation(Vec3::new(1.0, 0.0, -10.0))),
            RefBone::new("foot", 2, BoneAtom::from_translation(Vec3::new(-1.0, 0.0, -10.0))),
        ])
        .unwrap()
    }

    #[test]
    fn test_foot_lifts_onto_step() {
        let skel = leg();
        let pose = PoseBuffers::from_ref_pose(&skel);
        let floor = Floor { height: 3.0 };
        let env = ControlEnv {
            local_to_world: BoneAtom::IDENTITY,
            line_check: Some(&floor),
        };
        let frame = ControlFrame {
            skeleton: &skel,
            local_atoms: &pose.local_atoms,
            space_bases: &pose.space_bases,
            env: &env,
        };
        let foot = FootPlacementControl {
            limb: LimbControl {
                joint_target_location: Vec3::new(10.0, 0.0, 10.0),
                ..Default::default()
            },
            orient_foot_to_ground: false,
            ..Default::default()
        };
        let out = foot.calculate(3, &frame);
        assert_eq!(out.len(), 3);
        assert!((out[2].translation.z - 3.0).abs() < 0.01);
    }

    #[test]
    fn test_only_up_adjustment_ignores_drop() {
        let skel = leg();
        let pose = PoseBuffers::from_ref_pose(&skel);
        let floor = Floor { height: -5.0 };
        let env = ControlEnv {
            local_to_world: BoneAtom::IDENTITY,
            line_check: Some(&floor),
        };
        let frame = ControlFrame {
            skeleton: &skel,
            local_atoms: &pose.local_atoms,
            space_bases: &pose.space_bases,
            env: &env,
        };
        let foot = FootPlacementControl {
            max_down_adjustment: 10.0,
            only_enable_for_up_adjustment: true,
            ..Default::default()
        };
        assert!(foot.calculate(3, &frame).is_empty());
    }
}
