//! 骨骼系统：骨骼原子变换、参考骨架、必需骨骼与合成

mod bone;
mod compose;
mod reference;
mod required_bones;

pub use bone::{BoneVisibility, MirrorInfo, RefBone};
pub use compose::{apply_controllers_for_bone, compose_skeleton, ComposeOptions, PoseBuffers};
pub use reference::RefSkeleton;
pub use required_bones::{
    build_compose_passes, ensure_parents_present, merge_bone_index_arrays, rebuild_visibility,
    recalc_required_bones, ComposeOrder, RequiredBonesInputs,
};

use glam::{Mat4, Quat, Vec3, Vec4};
use std::ops::Mul;

/// 四元数 w² 接近 1 时视为单位旋转，不叠加
const DELTA: f32 = 1.0e-5;
/// 缩放小于此值时求逆结果记为 0
const SMALL_NUMBER: f32 = 1.0e-8;

/// 骨骼原子变换（旋转 + 平移 + 逐轴缩放）
///
/// 合成约定固定为 `child = local * parent`：`a * b` 表示先做 `a` 再做 `b`。
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoneAtom {
    pub rotation: Quat,
    pub translation: Vec3,
    pub scale: Vec3,
}

impl Default for BoneAtom {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl BoneAtom {
    pub const IDENTITY: Self = Self {
        rotation: Quat::IDENTITY,
        translation: Vec3::ZERO,
        scale: Vec3::ONE,
    };

    pub fn new(rotation: Quat, translation: Vec3, scale: Vec3) -> Self {
        Self { rotation, translation, scale }
    }

    pub fn from_rotation_translation(rotation: Quat, translation: Vec3) -> Self {
        Self { rotation, translation, scale: Vec3::ONE }
    }

    pub fn from_translation(translation: Vec3) -> Self {
        Self { translation, ..Self::IDENTITY }
    }

    pub fn from_rotation(rotation: Quat) -> Self {
        Self { rotation, ..Self::IDENTITY }
    }

    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }

    /// 变换点（缩放 → 旋转 → 平移）
    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.rotation * (self.scale * point) + self.translation
    }

    /// 变换方向（不含平移）
    pub fn transform_vector(&self, vector: Vec3) -> Vec3 {
        self.rotation * (self.scale * vector)
    }

    pub fn inverse_transform_point(&self, point: Vec3) -> Vec3 {
        (self.rotation.inverse() * (point - self.translation)) * safe_recip(self.scale)
    }

    pub fn inverse_transform_vector(&self, vector: Vec3) -> Vec3 {
        (self.rotation.inverse() * vector) * safe_recip(self.scale)
    }

    /// 逆变换，满足 `(a * b.inverse()) * b == a`（均匀缩放下精确）
    pub fn inverse(&self) -> Self {
        let inv_rotation = self.rotation.inverse();
        let inv_scale = safe_recip(self.scale);
        let inv_translation = inv_scale * (inv_rotation * -self.translation);
        Self {
            rotation: inv_rotation,
            translation: inv_translation,
            scale: inv_scale,
        }
    }

    /// 第 `index` 根轴（0=X, 1=Y, 2=Z）在父空间中的方向，含缩放
    pub fn axis(&self, index: usize) -> Vec3 {
        let unit = match index {
            0 => Vec3::X,
            1 => Vec3::Y,
            _ => Vec3::Z,
        };
        self.transform_vector(unit)
    }

    pub fn contains_nan(&self) -> bool {
        self.rotation.is_nan() || self.translation.is_nan() || self.scale.is_nan()
    }

    pub fn is_rotation_normalized(&self) -> bool {
        (self.rotation.length_squared() - 1.0).abs() < 0.01
    }

    /// 四元数归一化；退化时回到单位旋转
    pub fn normalize_rotation(&mut self) {
        let len_sq = self.rotation.length_squared();
        if len_sq > SMALL_NUMBER && len_sq.is_finite() {
            self.rotation = self.rotation.normalize();
        } else {
            self.rotation = Quat::IDENTITY;
        }
    }

    /// 线性混合：平移和缩放线性插值，旋转走最短路径后归一化
    pub fn blend(a: &Self, b: &Self, alpha: f32) -> Self {
        Self {
            rotation: a.rotation.lerp(b.rotation, alpha),
            translation: a.translation.lerp(b.translation, alpha),
            scale: a.scale.lerp(b.scale, alpha),
        }
    }

    /// `self = blend(self, other, alpha)`
    pub fn blend_with(&mut self, other: &Self, alpha: f32) {
        *self = Self::blend(self, other, alpha);
    }

    /// 相对于基准的差量（用于叠加动画）
    pub fn delta_from(&self, base: &Self) -> Self {
        Self {
            rotation: self.rotation * base.rotation.inverse(),
            translation: self.translation - base.translation,
            scale: self.scale - base.scale,
        }
    }

    /// 叠加差量：平移和缩放相加，旋转左乘
    pub fn accumulate_with_additive_scale(&mut self, delta: &Self) {
        // 单位旋转差量跳过，避免累积误差
        if delta.rotation.w * delta.rotation.w < 1.0 - DELTA * DELTA {
            self.rotation = delta.rotation * self.rotation;
        }
        self.translation += delta.translation;
        self.scale += delta.scale;
        self.normalize_rotation();
    }

    /// 带权重的累加（用于多路混合）
    pub fn accumulate_weighted(&mut self, other: &Self, weight: f32) {
        // 保证在同一半球
        let rotation = if self.rotation.dot(other.rotation) < 0.0 {
            -other.rotation
        } else {
            other.rotation
        };
        self.rotation = Quat::from_vec4(Vec4::from(self.rotation) + Vec4::from(rotation) * weight);
        self.translation += other.translation * weight;
        self.scale += other.scale * weight;
    }

    /// 清零，用于加权累加的起点
    pub fn zeroed() -> Self {
        Self {
            rotation: Quat::from_xyzw(0.0, 0.0, 0.0, 0.0),
            translation: Vec3::ZERO,
            scale: Vec3::ZERO,
        }
    }

    /// 去掉缩放
    pub fn remove_scaling(&mut self) {
        self.scale = Vec3::ONE;
    }

    pub fn max_axis_scale(&self) -> f32 {
        self.scale.abs().max_element()
    }

    /// 沿 X 轴镜像
    pub fn mirror_x(&self) -> Self {
        Self {
            rotation: Quat::from_xyzw(self.rotation.x, -self.rotation.y, -self.rotation.z, self.rotation.w),
            translation: Vec3::new(-self.translation.x, self.translation.y, self.translation.z),
            scale: self.scale,
        }
    }

    /// 近似相等
    pub fn equals(&self, other: &Self, tolerance: f32) -> bool {
        let same_rotation = self.rotation.dot(other.rotation).abs() > 1.0 - tolerance;
        same_rotation
            && self.translation.abs_diff_eq(other.translation, tolerance)
            && self.scale.abs_diff_eq(other.scale, tolerance)
    }
}

impl Mul for BoneAtom {
    type Output = BoneAtom;

    /// `a * b`：先做 `a`，再做 `b`
    fn mul(self, rhs: BoneAtom) -> BoneAtom {
        BoneAtom {
            rotation: rhs.rotation * self.rotation,
            translation: rhs.rotation * (rhs.scale * self.translation) + rhs.translation,
            scale: self.scale * rhs.scale,
        }
    }
}

fn safe_recip(v: Vec3) -> Vec3 {
    let r = |x: f32| if x.abs() <= SMALL_NUMBER { 0.0 } else { 1.0 / x };
    Vec3::new(r(v.x), r(v.y), r(v.z))
}

/// 把角度收到 (-π, π]
pub fn unwind_radians(mut angle: f32) -> f32 {
    use std::f32::consts::{PI, TAU};
    while angle > PI {
        angle -= TAU;
    }
    while angle < -PI {
        angle += TAU;
    }
    angle
}
