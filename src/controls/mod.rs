//! 骨骼控制器
//!
//! 每个控制器挂在一根参考骨骼上，同一骨骼的控制器组成有序链表。
//! 控制器种类是一个封闭的枚举，合成时按骨骼逐个调用：
//! `affected_bones` → `calculate_new_bone_transforms` → `calculate_new_bone_scales`。

mod ccd_ik;
mod limb;
mod look_at;
mod single_bone;
mod spline;
mod twist;

pub use ccd_ik::{CcdIkControl, IkLink};
pub use limb::{FootPlacementControl, LimbControl};
pub use look_at::LookAtControl;
pub use single_bone::SingleBoneControl;
pub use spline::{SplineControl, SplineRotationMode};
pub use twist::{MultiplyControl, TwistControl};

use glam::Vec3;

use crate::animation::NodeId;
use crate::host::LegLineCheck;
use crate::skeleton::{BoneAtom, RefSkeleton};

/// 控制器坐标空间
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum BoneControlSpace {
    World,
    #[default]
    Component,
    ParentBoneSpace,
    BoneSpace,
    OtherBoneSpace(String),
}

/// 骨骼轴
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Axis {
    #[default]
    X,
    Y,
    Z,
}

impl Axis {
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    pub fn unit(self) -> Vec3 {
        match self {
            Axis::X => Vec3::X,
            Axis::Y => Vec3::Y,
            Axis::Z => Vec3::Z,
        }
    }
}

/// 强度到混合系数的曲线
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AlphaBlendType {
    #[default]
    Linear,
    Cubic,
    Sinusoidal,
    EaseIn,
    EaseOut,
    EaseInOut,
}

impl AlphaBlendType {
    pub fn alpha(self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            AlphaBlendType::Linear => t,
            AlphaBlendType::Cubic => t * t * (3.0 - 2.0 * t),
            AlphaBlendType::Sinusoidal => ((t - 0.5) * std::f32::consts::PI).sin() * 0.5 + 0.5,
            AlphaBlendType::EaseIn => t * t,
            AlphaBlendType::EaseOut => 1.0 - (1.0 - t) * (1.0 - t),
            AlphaBlendType::EaseInOut => {
                if t < 0.5 {
                    2.0 * t * t
                } else {
                    1.0 - 2.0 * (1.0 - t) * (1.0 - t)
                }
            }
        }
    }
}

/// 合成期间控制器可访问的宿主环境
#[derive(Clone, Copy, Default)]
pub struct ControlEnv<'a> {
    /// 组件到世界的变换
    pub local_to_world: BoneAtom,
    pub line_check: Option<&'a dyn LegLineCheck>,
}

/// 控制器求值时看到的姿态
pub struct ControlFrame<'a> {
    pub skeleton: &'a RefSkeleton,
    pub local_atoms: &'a [BoneAtom],
    pub space_bases: &'a [BoneAtom],
    pub env: &'a ControlEnv<'a>,
}

impl ControlFrame<'_> {
    /// 从指定空间到组件空间的变换
    pub fn frame_to_component(&self, bone: usize, space: &BoneControlSpace) -> BoneAtom {
        match space {
            BoneControlSpace::World => self.env.local_to_world.inverse(),
            BoneControlSpace::Component => BoneAtom::IDENTITY,
            BoneControlSpace::ParentBoneSpace => {
                if bone == 0 {
                    BoneAtom::IDENTITY
                } else {
                    self.space_bases[self.skeleton.parent_index(bone)]
                }
            }
            BoneControlSpace::BoneSpace => self.space_bases[bone],
            BoneControlSpace::OtherBoneSpace(name) => match self.skeleton.find_bone_by_name(name) {
                Some(other) => self.space_bases[other],
                None => BoneAtom::IDENTITY,
            },
        }
    }

    /// 把某空间下的点转到组件空间
    pub fn point_to_component(&self, bone: usize, space: &BoneControlSpace, point: Vec3) -> Vec3 {
        self.frame_to_component(bone, space).transform_point(point)
    }
}

/// 控制器种类
#[derive(Clone, Debug)]
pub enum SkelControlKind {
    SingleBone(SingleBoneControl),
    Limb(LimbControl),
    FootPlacement(FootPlacementControl),
    LookAt(LookAtControl),
    Spline(SplineControl),
    Twist(TwistControl),
    Multiply(MultiplyControl),
    CcdIk(CcdIkControl),
}

impl SkelControlKind {
    fn affected_bones(&self, bone: usize, skeleton: &RefSkeleton) -> Vec<usize> {
        match self {
            SkelControlKind::SingleBone(_) => vec![bone],
            SkelControlKind::LookAt(c) => c.affected_bones(bone),
            SkelControlKind::Twist(_) | SkelControlKind::Multiply(_) => vec![bone],
            SkelControlKind::Limb(c) => c.affected_bones(bone, skeleton),
            SkelControlKind::FootPlacement(c) => c.limb.affected_bones(bone, skeleton),
            SkelControlKind::Spline(c) => c.affected_bones(bone, skeleton),
            SkelControlKind::CcdIk(c) => c.affected_bones(bone, skeleton),
        }
    }

    fn calculate_new_bone_transforms(&mut self, bone: usize, frame: &ControlFrame) -> Vec<BoneAtom> {
        match self {
            SkelControlKind::SingleBone(c) => c.calculate(bone, frame),
            SkelControlKind::Limb(c) => c.calculate(bone, frame),
            SkelControlKind::FootPlacement(c) => c.calculate(bone, frame),
            SkelControlKind::LookAt(c) => c.calculate(bone, frame),
            SkelControlKind::Spline(c) => c.calculate(bone, frame),
            SkelControlKind::Twist(c) => c.calculate(bone, frame),
            SkelControlKind::Multiply(c) => c.calculate(bone, frame),
            SkelControlKind::CcdIk(c) => c.calculate(bone, frame),
        }
    }

    fn calculate_new_bone_scales(&self, _bone: usize, _frame: &ControlFrame) -> Vec<f32> {
        match self {
            SkelControlKind::SingleBone(c) => c.bone_scale.map(|s| vec![s]).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    fn tick(&mut self, delta_time: f32) {
        if let SkelControlKind::LookAt(c) = self {
            c.tick(delta_time);
        }
    }

    /// 种类自身附加的权重
    fn alpha_scale(&self) -> f32 {
        match self {
            SkelControlKind::LookAt(c) => c.look_at_alpha(),
            _ => 1.0,
        }
    }
}

/// 骨骼控制器
#[derive(Clone, Debug)]
pub struct SkelControl {
    pub name: String,
    pub kind: SkelControlKind,

    // ========== 强度 ==========
    pub strength: f32,
    pub control_strength_target: f32,
    pub blend_in_time: f32,
    pub blend_out_time: f32,
    pub blend_time_to_go: f32,
    pub blend_type: AlphaBlendType,

    // ========== 运行条件 ==========
    /// 在物理前的合成中运行
    pub pre_physics: bool,
    /// 在物理混合之后运行
    pub post_physics: bool,
    /// LOD 大于等于此值时不运行
    pub ignore_at_or_above_lod: Option<usize>,
    pub ignore_when_not_rendered: bool,

    // ========== 动画元数据驱动 ==========
    pub controlled_by_anim_metadata: bool,
    pub invert_metadata_weight: bool,
    pub anim_metadata_weight: f32,
    metadata_tick_tag: u64,

    /// 强度取这些节点权重之和
    pub strength_from_anim_nodes: Vec<NodeId>,
    /// 激活状态传递给链表中的下一个控制器
    pub propagate_set_active: bool,
}

impl SkelControl {
    pub fn new(name: impl Into<String>, kind: SkelControlKind) -> Self {
        Self {
            name: name.into(),
            kind,
            strength: 1.0,
            control_strength_target: 1.0,
            blend_in_time: 0.2,
            blend_out_time: 0.2,
            blend_time_to_go: 0.0,
            blend_type: AlphaBlendType::Linear,
            pre_physics: true,
            post_physics: false,
            ignore_at_or_above_lod: None,
            ignore_when_not_rendered: false,
            controlled_by_anim_metadata: false,
            invert_metadata_weight: false,
            anim_metadata_weight: 0.0,
            metadata_tick_tag: 0,
            strength_from_anim_nodes: Vec::new(),
            propagate_set_active: false,
        }
    }

    /// 有效权重 = 强度 × 元数据权重
    pub fn control_alpha(&self) -> f32 {
        let metadata = if self.controlled_by_anim_metadata {
            if self.invert_metadata_weight {
                1.0 - self.anim_metadata_weight
            } else {
                self.anim_metadata_weight
            }
        } else {
            1.0
        };
        self.strength * metadata * self.kind.alpha_scale()
    }

    pub fn runs_in_pass(&self, run_pre_physics: bool, run_post_physics: bool) -> bool {
        (run_pre_physics && self.pre_physics) || (run_post_physics && self.post_physics)
    }

    /// 推进强度混合
    pub fn tick_skel_control(&mut self, delta_time: f32, node_weight_sum: Option<f32>) {
        if let Some(sum) = node_weight_sum {
            let new_strength = sum.min(1.0);
            self.strength = new_strength;
            self.control_strength_target = new_strength;
            self.blend_time_to_go = 0.0;
        } else if self.blend_time_to_go != 0.0 {
            if self.blend_time_to_go > delta_time {
                let blend_delta = self.control_strength_target - self.strength;
                self.strength += blend_delta * (delta_time / self.blend_time_to_go);
                self.blend_time_to_go -= delta_time;
            } else {
                self.strength = self.control_strength_target;
                self.blend_time_to_go = 0.0;
            }
        }
        self.kind.tick(delta_time);
    }

    /// 激活 / 关闭（按 blend in / out 时间过渡）
    pub fn set_skel_control_active(&mut self, active: bool) {
        let (target, blend_time) = if active {
            (1.0, self.blend_in_time)
        } else {
            (0.0, self.blend_out_time)
        };
        self.blend_time_to_go = blend_time * (target - self.strength).abs();
        self.control_strength_target = target;
        if self.blend_time_to_go <= 0.0 {
            self.strength = target;
            self.blend_time_to_go = 0.0;
        }
    }

    /// 设置目标强度
    pub fn set_skel_control_strength(&mut self, strength: f32, blend_time: f32) {
        let strength = strength.clamp(0.0, 1.0);
        if self.strength != strength {
            self.control_strength_target = strength;
            self.blend_time_to_go = blend_time.max(0.0);
            if self.blend_time_to_go <= 0.0 {
                self.strength = strength;
            }
        }
    }

    /// 累加动画元数据权重，每个 tick tag 先清零一次
    pub fn add_metadata_weight(&mut self, weight: f32, tick_tag: u64) {
        if self.metadata_tick_tag != tick_tag {
            self.metadata_tick_tag = tick_tag;
            self.anim_metadata_weight = 0.0;
        }
        self.anim_metadata_weight = (self.anim_metadata_weight + weight).min(1.0);
    }

    fn expire_metadata(&mut self, tick_tag: u64) {
        if self.controlled_by_anim_metadata && self.metadata_tick_tag != tick_tag {
            self.metadata_tick_tag = tick_tag;
            self.anim_metadata_weight = 0.0;
        }
    }

    pub fn affected_bones(&self, bone: usize, skeleton: &RefSkeleton) -> Vec<usize> {
        self.kind.affected_bones(bone, skeleton)
    }

    pub fn calculate_new_bone_transforms(&mut self, bone: usize, frame: &ControlFrame) -> Vec<BoneAtom> {
        self.kind.calculate_new_bone_transforms(bone, frame)
    }

    pub fn calculate_new_bone_scales(&self, bone: usize, frame: &ControlFrame) -> Vec<f32> {
        self.kind.calculate_new_bone_scales(bone, frame)
    }
}

/// 挂在同一骨骼上的控制器链表
#[derive(Clone, Debug)]
pub struct SkelControlList {
    pub bone_name: String,
    pub bone_index: Option<usize>,
    /// 控制器在 `SkelControlSet::controls` 中的下标，顺序即执行顺序
    pub controls: Vec<usize>,
}

/// 一棵动画树的全部控制器
#[derive(Clone, Debug, Default)]
pub struct SkelControlSet {
    pub controls: Vec<SkelControl>,
    pub lists: Vec<SkelControlList>,
    /// 骨骼 → 链表下标
    bone_heads: Vec<Option<usize>>,
}

impl SkelControlSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 把控制器追加到骨骼链表末尾
    pub fn add_control(&mut self, bone_name: &str, control: SkelControl) -> usize {
        let index = self.controls.len();
        self.controls.push(control);
        match self.lists.iter_mut().find(|l| l.bone_name == bone_name) {
            Some(list) => list.controls.push(index),
            None => self.lists.push(SkelControlList {
                bone_name: bone_name.to_string(),
                bone_index: None,
                controls: vec![index],
            }),
        }
        index
    }

    /// 按名字解析骨骼索引；找不到的链表不会生效
    pub fn link_to_skeleton(&mut self, skeleton: &RefSkeleton) {
        self.bone_heads = vec![None; skeleton.bone_count()];
        for (list_index, list) in self.lists.iter_mut().enumerate() {
            list.bone_index = skeleton.find_bone_by_name(&list.bone_name);
            match list.bone_index {
                Some(bone) => self.bone_heads[bone] = Some(list_index),
                None => log::warn!("[骨骼控制] 骨架中找不到骨骼 {}，控制链表跳过", list.bone_name),
            }
        }
    }

    pub fn list_for_bone(&self, bone: usize) -> Option<&[usize]> {
        let list_index = (*self.bone_heads.get(bone)?)?;
        Some(&self.lists[list_index].controls)
    }

    pub fn find_control(&self, name: &str) -> Option<usize> {
        self.controls.iter().position(|c| c.name == name)
    }

    pub fn control(&self, index: usize) -> Option<&SkelControl> {
        self.controls.get(index)
    }

    pub fn control_mut(&mut self, index: usize) -> Option<&mut SkelControl> {
        self.controls.get_mut(index)
    }

    /// 链表中的下一个控制器
    pub fn next_control(&self, index: usize) -> Option<usize> {
        self.lists.iter().find_map(|list| {
            let pos = list.controls.iter().position(|&c| c == index)?;
            list.controls.get(pos + 1).copied()
        })
    }

    /// 激活 / 关闭控制器，按需传递给后续控制器
    pub fn set_skel_control_active(&mut self, index: usize, active: bool) {
        let mut current = Some(index);
        while let Some(i) = current {
            let Some(control) = self.controls.get_mut(i) else {
                break;
            };
            control.set_skel_control_active(active);
            current = if control.propagate_set_active {
                self.next_control(i)
            } else {
                None
            };
        }
    }

    /// 根据动画元数据给控制器加权
    pub fn apply_metadata_weight(&mut self, control_name: &str, weight: f32, tick_tag: u64) {
        for control in self.controls.iter_mut().filter(|c| c.name == control_name) {
            if control.controlled_by_anim_metadata {
                control.add_metadata_weight(weight, tick_tag);
            }
        }
    }

    /// tick 所有控制器
    ///
    /// `node_weight` 返回相关节点的总权重，不相关时返回 None。
    pub fn tick<F>(&mut self, delta_time: f32, tick_tag: u64, node_weight: F)
    where
        F: Fn(NodeId) -> Option<f32>,
    {
        for control in &mut self.controls {
            control.expire_metadata(tick_tag);
            let sum = if control.strength_from_anim_nodes.is_empty() {
                None
            } else {
                Some(
                    control
                        .strength_from_anim_nodes
                        .iter()
                        .filter_map(|&n| node_weight(n))
                        .sum::<f32>(),
                )
            };
            control.tick_skel_control(delta_time, sum);
        }
    }
}

/// 把任意正交基组装成旋转：`look_axis` 对齐 `look_dir`，`up_axis` 尽量对齐 `up_dir`
pub(crate) fn build_rotation_from_axes(look_axis: Axis, look_dir: Vec3, up_axis: Axis, up_dir: Vec3) -> glam::Quat {
    let look = look_dir.normalize_or_zero();
    let mut up = (up_dir - look * up_dir.dot(look)).normalize_or_zero();
    if up == Vec3::ZERO || look_axis == up_axis {
        up = look.any_orthonormal_vector();
    }
    let a = look_axis.index();
    let mut b = up_axis.index();
    if a == b {
        b = (a + 1) % 3;
    }
    let c = 3 - a - b;
    let mut cols = [Vec3::ZERO; 3];
    cols[a] = look;
    cols[b] = up;
    cols[c] = cols[(c + 1) % 3].cross(cols[(c + 2) % 3]);
    glam::Quat::from_mat3(&glam::Mat3::from_cols(cols[0], cols[1], cols[2])).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::biped_skeleton;

    fn plain(name: &str) -> SkelControl {
        SkelControl::new(name, SkelControlKind::SingleBone(SingleBoneControl::default()))
    }

    #[test]
    fn test_blend_in_over_time() {
        let mut control = plain("a");
        control.strength = 0.0;
        control.blend_in_time = 1.0;
        control.set_skel_control_active(true);
        assert!((control.blend_time_to_go - 1.0).abs() < 0.001);
        control.tick_skel_control(0.5, None);
        assert!((control.strength - 0.5).abs() < 0.001);
        control.tick_skel_control(0.6, None);
        assert!((control.strength - 1.0).abs() < 0.001);
        assert_eq!(control.blend_time_to_go, 0.0);
    }

    #[test]
    fn test_instant_deactivate() {
        let mut control = plain("a");
        control.blend_out_time = 0.0;
        control.set_skel_control_active(false);
        assert_eq!(control.strength, 0.0);
    }

    #[test]
    fn test_metadata_weight_resets_per_tick_tag() {
        let mut control = plain("a");
        control.controlled_by_anim_metadata = true;
        control.add_metadata_weight(0.3, 1);
        control.add_metadata_weight(0.3, 1);
        assert!((control.control_alpha() - 0.6).abs() < 0.001);
        control.add_metadata_weight(0.2, 2);
        assert!((control.control_alpha() - 0.2).abs() < 0.001);
        control.expire_metadata(3);
        assert_eq!(control.control_alpha(), 0.0);
        control.invert_metadata_weight = true;
        assert!((control.control_alpha() - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_list_order_and_propagation() {
        let skel = biped_skeleton();
        let mut set = SkelControlSet::new();
        let mut first = plain("first");
        first.propagate_set_active = true;
        first.blend_out_time = 0.0;
        let mut second = plain("second");
        second.blend_out_time = 0.0;
        let a = set.add_control("head", first);
        let b = set.add_control("head", second);
        set.add_control("missing_bone", plain("orphan"));
        set.link_to_skeleton(&skel);

        let head = skel.find_bone_by_name("head").unwrap();
        assert_eq!(set.list_for_bone(head), Some(&[a, b][..]));
        assert_eq!(set.next_control(a), Some(b));

        set.set_skel_control_active(a, false);
        assert_eq!(set.controls[a].strength, 0.0);
        assert_eq!(set.controls[b].strength, 0.0);
    }

    #[test]
    fn test_strength_from_nodes() {
        let mut set = SkelControlSet::new();
        let mut control = plain("driven");
        control.strength_from_anim_nodes = vec![NodeId(1), NodeId(2)];
        set.add_control("root", control);
        set.tick(0.1, 1, |n| if n == NodeId(1) { Some(0.4) } else { None });
        assert!((set.controls[0].strength - 0.4).abs() < 0.001);
        set.tick(0.1, 2, |_| Some(0.8));
        assert!((set.controls[0].strength - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_blend_types_hit_endpoints() {
        for blend in [
            AlphaBlendType::Linear,
            AlphaBlendType::Cubic,
            AlphaBlendType::Sinusoidal,
            AlphaBlendType::EaseIn,
            AlphaBlendType::EaseOut,
            AlphaBlendType::EaseInOut,
        ] {
            assert!(blend.alpha(0.0).abs() < 0.001);
            assert!((blend.alpha(1.0) - 1.0).abs() < 0.001);
        }
    }

    #[test]
    fn test_build_rotation_from_axes() {
        let q = build_rotation_from_axes(Axis::X, Vec3::Y, Axis::Z, Vec3::Z);
        assert!((q * Vec3::X).abs_diff_eq(Vec3::Y, 0.001));
        assert!((q * Vec3::Z).abs_diff_eq(Vec3::Z, 0.001));
    }
}
