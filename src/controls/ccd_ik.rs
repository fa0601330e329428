//! CCD IK 控制器
//!
//! 从链尾（或链首）开始逐根旋转骨骼，让链末端逼近目标。
//! 每轮结束比较末端误差，误差变大时恢复到最佳一轮的结果。

use glam::{EulerRot, Quat, Vec3};

use super::{BoneControlSpace, ControlFrame};
use crate::skeleton::{BoneAtom, RefSkeleton};

/// IK 链节点的角度限制（局部空间，弧度）
#[derive(Clone, Debug, Default)]
pub struct IkLink {
    /// 单次求解后相对父骨骼的最大旋转角，0 表示不限制
    pub max_angle: f32,
    pub has_limits: bool,
    pub limit_min: Vec3,
    pub limit_max: Vec3,
}

#[derive(Clone, Debug)]
pub struct CcdIkControl {
    pub effector_location: Vec3,
    pub effector_location_space: BoneControlSpace,
    /// 末端骨骼局部空间的末端偏移
    pub effector_translation_from_bone: Vec3,

    /// 链上骨骼数（含受控骨骼）
    pub num_bones: usize,
    /// 每根骨骼最多迭代次数
    pub max_per_bone_iterations: u32,
    /// 距离平方小于此值视为到达
    pub precision: f32,
    /// 单步最大旋转角（弧度），0 表示不限制
    pub max_angle_steps: f32,
    /// 从链首开始迭代
    pub start_from_tail: bool,

    /// 按链顺序（链首在前）的角度限制，长度不足时其余节点不受限
    pub links: Vec<IkLink>,

    /// 上一次求解用掉的迭代次数
    pub iterations_count: u32,
}

impl Default for CcdIkControl {
    fn default() -> Self {
        Self {
            effector_location: Vec3::ZERO,
            effector_location_space: BoneControlSpace::Component,
            effector_translation_from_bone: Vec3::ZERO,
            num_bones: 2,
            max_per_bone_iterations: 10,
            precision: 1.0,
            max_angle_steps: 0.0,
            start_from_tail: false,
            links: Vec::new(),
            iterations_count: 0,
        }
    }
}

impl CcdIkControl {
    /// 链上骨骼，父骨骼在前；链越过根骨骼时为空
    pub(crate) fn affected_bones(&self, bone: usize, skeleton: &RefSkeleton) -> Vec<usize> {
        if self.num_bones < 2 || bone >= skeleton.bone_count() {
            return Vec::new();
        }
        let mut out = vec![0; self.num_bones];
        let mut walk = bone;
        for i in (0..self.num_bones).rev() {
            if walk == 0 {
                log::debug!("[骨骼控制] CCD IK 链越过根骨骼");
                return Vec::new();
            }
            out[i] = walk;
            walk = skeleton.parent_index(walk);
        }
        out
    }

    pub(crate) fn calculate(&mut self, bone: usize, frame: &ControlFrame) -> Vec<BoneAtom> {
        let chain = self.affected_bones(bone, frame.skeleton);
        if chain.is_empty() {
            return Vec::new();
        }
        let n = chain.len();

        let mut locals: Vec<BoneAtom> = chain.iter().map(|&b| frame.local_atoms[b]).collect();
        let mut spaces: Vec<BoneAtom> = chain.iter().map(|&b| frame.space_bases[b]).collect();
        let chain_length: f32 =
            locals.iter().map(|l| l.translation.length()).sum::<f32>() + self.effector_translation_from_bone.length();

        // 链首的父骨骼在本控制器内不变
        let head_parent = match frame.skeleton.parent_index(chain[0]) {
            0 => BoneAtom::IDENTITY,
            p => frame.space_bases[p],
        };

        let mut target = frame.point_to_component(bone, &self.effector_location_space, self.effector_location);
        let start_pos = spaces[0].translation;
        let delta = target - start_pos;
        let mut desired_length = delta.length();
        let desired_dir = if desired_length < self.precision {
            desired_length = self.precision;
            Vec3::X
        } else {
            delta / desired_length
        };
        if desired_length > chain_length - self.precision {
            target = start_pos + desired_dir * (chain_length - self.precision);
        }

        let max_iterations = self.max_per_bone_iterations as usize * (n - 1);
        let mut index = if self.start_from_tail { 1 } else { n - 1 };
        let mut best_dist_sq = f32::MAX;
        let mut best = (locals.clone(), spaces.clone());
        let mut iterations = 0usize;

        loop {
            let end_pos = self.chain_end(&spaces);
            let dist_sq = (target - end_pos).length_squared();

            // 一整轮结束时比较误差
            let round_start = if self.start_from_tail { index == 1 } else { index == n - 1 };
            if round_start {
                if dist_sq < best_dist_sq {
                    best_dist_sq = dist_sq;
                    best = (locals.clone(), spaces.clone());
                } else if iterations > 0 {
                    (locals, spaces) = best.clone();
                    break;
                }
            }
            if dist_sq <= self.precision || iterations >= max_iterations {
                break;
            }

            self.rotate_link(index - 1, target, end_pos, &mut locals, &mut spaces, &head_parent);

            if self.start_from_tail {
                index += 1;
                if index >= n {
                    index = 1;
                }
            } else {
                index -= 1;
                if index < 1 {
                    index = n - 1;
                }
            }
            iterations += 1;
        }

        let final_dist_sq = (target - self.chain_end(&spaces)).length_squared();
        if final_dist_sq > best_dist_sq {
            (_, spaces) = best;
        }
        self.iterations_count = iterations as u32;
        spaces
    }

    fn chain_end(&self, spaces: &[BoneAtom]) -> Vec3 {
        spaces[spaces.len() - 1].transform_point(self.effector_translation_from_bone)
    }

    /// 旋转链上第 `i` 根骨骼，使末端转向目标，并刷新其后的骨骼
    fn rotate_link(
        &self,
        i: usize,
        target: Vec3,
        end_pos: Vec3,
        locals: &mut [BoneAtom],
        spaces: &mut [BoneAtom],
        head_parent: &BoneAtom,
    ) {
        let start = spaces[i].translation;
        let to_end = (end_pos - start).normalize_or_zero();
        let to_target = (target - start).normalize_or_zero();
        if to_end == Vec3::ZERO || to_target == Vec3::ZERO {
            return;
        }
        if to_end.dot(to_target) >= 1.0 - 1.0e-8 {
            return;
        }

        let (axis, mut angle) = find_axis_and_angle(to_end, to_target);
        if self.max_angle_steps > 0.0 && angle > self.max_angle_steps {
            angle = self.max_angle_steps;
        }

        let mut rotated = spaces[i];
        rotated.rotation = (Quat::from_axis_angle(axis, angle) * rotated.rotation).normalize();

        let parent = if i == 0 { *head_parent } else { spaces[i - 1] };
        let mut local = rotated * parent.inverse();
        local.scale = locals[i].scale;
        if let Some(link) = self.links.get(i) {
            local.rotation = apply_link_limits(local.rotation, link);
        }
        locals[i] = local;
        spaces[i] = local * parent;

        for j in (i + 1)..spaces.len() {
            spaces[j] = locals[j] * spaces[j - 1];
            spaces[j].remove_scaling();
        }
    }
}

/// 两单位向量之间的旋转轴与角度
fn find_axis_and_angle(a: Vec3, b: Vec3) -> (Vec3, f32) {
    let cross = a.cross(b);
    let size = cross.length();
    if size < 1.0e-4 {
        let (axis, _) = a.any_orthonormal_pair();
        let angle = if a.dot(b) > 0.0 { 0.0 } else { std::f32::consts::PI };
        return (axis, angle);
    }
    let mut angle = size.min(1.0).asin();
    if a.dot(b) < 0.0 {
        angle = std::f32::consts::PI - angle;
    }
    (cross / size, angle)
}

/// 角度限制：先限制总角度，再按 XYZ 欧拉角逐轴夹紧
fn apply_link_limits(rotation: Quat, link: &IkLink) -> Quat {
    let mut rotation = rotation;
    if link.max_angle > 0.0 {
        let (axis, angle) = rotation.to_axis_angle();
        let angle = crate::skeleton::unwind_radians(angle);
        if angle.abs() > link.max_angle {
            rotation = Quat::from_axis_angle(axis, link.max_angle.copysign(angle));
        }
    }
    if link.has_limits {
        let (x, y, z) = rotation.to_euler(EulerRot::XYZ);
        rotation = Quat::from_euler(
            EulerRot::XYZ,
            x.clamp(link.limit_min.x, link.limit_max.x),
            y.clamp(link.limit_min.y, link.limit_max.y),
            z.clamp(link.limit_min.z, link.limit_max.z),
        );
    }
    rotation.normalize()
}
