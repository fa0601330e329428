//! Morph 图
//!
//! 权重节点把自身权重乘到子节点上，姿态节点输出一个 Morph 目标，
//! 骨骼夹角节点按两根骨骼轴的夹角查表得到权重。

use std::sync::Arc;

use super::{find_in_sets, ActiveMorph, MorphTarget, MorphTargetSet};
use crate::controls::Axis;
use crate::model::MaterialParams;
use crate::skeleton::{BoneAtom, RefSkeleton};

/// 按两根骨骼轴夹角驱动的权重节点
#[derive(Clone, Debug)]
pub struct WeightByBoneAngle {
    pub base_bone_name: String,
    pub base_bone_axis: Axis,
    pub invert_base_bone_axis: bool,
    pub angle_bone_name: String,
    pub angle_bone_axis: Axis,
    pub invert_angle_bone_axis: bool,
    /// (角度, 权重)，按角度升序
    pub angle_weight_table: Vec<(f32, f32)>,
    /// 同时写材质标量参数
    pub material_slot: Option<usize>,
    pub scalar_param_name: Option<String>,

    /// 最近一次算出的夹角（度）
    pub angle: f32,
    pub node_weight: f32,
    base_bone: Option<usize>,
    angle_bone: Option<usize>,
}

impl WeightByBoneAngle {
    pub fn new(base_bone_name: impl Into<String>, angle_bone_name: impl Into<String>) -> Self {
        Self {
            base_bone_name: base_bone_name.into(),
            base_bone_axis: Axis::X,
            invert_base_bone_axis: false,
            angle_bone_name: angle_bone_name.into(),
            angle_bone_axis: Axis::X,
            invert_angle_bone_axis: false,
            angle_weight_table: vec![(0.0, 0.0), (90.0, 1.0)],
            material_slot: None,
            scalar_param_name: None,
            angle: 0.0,
            node_weight: 0.0,
            base_bone: None,
            angle_bone: None,
        }
    }

    fn link(&mut self, skeleton: &RefSkeleton) {
        self.base_bone = skeleton.find_bone_by_name(&self.base_bone_name);
        self.angle_bone = skeleton.find_bone_by_name(&self.angle_bone_name);
        if self.base_bone.is_none() || self.angle_bone.is_none() {
            log::warn!(
                "[Morph] 骨骼夹角节点找不到骨骼 {} / {}",
                self.base_bone_name,
                self.angle_bone_name
            );
        }
    }

    /// 查表，两端外夹紧
    pub fn weight_for_angle(&self, angle: f32) -> f32 {
        let table = &self.angle_weight_table;
        let Some(first) = table.first() else {
            return 0.0;
        };
        if angle <= first.0 {
            return first.1;
        }
        for pair in table.windows(2) {
            let (a0, w0) = pair[0];
            let (a1, w1) = pair[1];
            if angle <= a1 {
                let span = a1 - a0;
                return if span > 0.0 { w0 + (w1 - w0) * (angle - a0) / span } else { w1 };
            }
        }
        table[table.len() - 1].1
    }

    fn update(&mut self, space_bases: &[BoneAtom], params: &mut MaterialParams) {
        let (Some(base), Some(other)) = (self.base_bone, self.angle_bone) else {
            self.node_weight = 0.0;
            return;
        };
        let (Some(base_atom), Some(other_atom)) = (space_bases.get(base), space_bases.get(other)) else {
            self.node_weight = 0.0;
            return;
        };
        let mut base_dir = base_atom.transform_vector(self.base_bone_axis.unit()).normalize_or_zero();
        if self.invert_base_bone_axis {
            base_dir = -base_dir;
        }
        let mut angle_dir = other_atom.transform_vector(self.angle_bone_axis.unit()).normalize_or_zero();
        if self.invert_angle_bone_axis {
            angle_dir = -angle_dir;
        }
        self.angle = base_dir.dot(angle_dir).clamp(-1.0, 1.0).acos().to_degrees();
        self.node_weight = self.weight_for_angle(self.angle);

        if let (Some(slot), Some(param)) = (self.material_slot, &self.scalar_param_name) {
            params.set_scalar(slot, param, self.node_weight);
        }
    }
}

/// Morph 节点种类
#[derive(Clone, Debug)]
pub enum MorphNodeKind {
    /// 把权重乘到子节点上
    Weight { node_weight: f32 },
    /// 输出一个 Morph 目标
    Pose {
        morph_name: String,
        weight: f32,
        target: Option<Arc<MorphTarget>>,
    },
    WeightByBoneAngle(WeightByBoneAngle),
}

#[derive(Clone, Debug)]
pub struct MorphNode {
    pub name: String,
    pub kind: MorphNodeKind,
    pub children: Vec<usize>,
}

/// Morph 节点图
#[derive(Clone, Debug, Default)]
pub struct MorphGraph {
    pub nodes: Vec<MorphNode>,
    pub roots: Vec<usize>,
}

impl MorphGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: impl Into<String>, kind: MorphNodeKind) -> usize {
        self.nodes.push(MorphNode {
            name: name.into(),
            kind,
            children: Vec::new(),
        });
        self.nodes.len() - 1
    }

    pub fn add_pose(&mut self, name: impl Into<String>, morph_name: impl Into<String>) -> usize {
        self.add_node(
            name,
            MorphNodeKind::Pose {
                morph_name: morph_name.into(),
                weight: 1.0,
                target: None,
            },
        )
    }

    pub fn add_child(&mut self, parent: usize, child: usize) {
        let len = self.nodes.len();
        if let Some(node) = self.nodes.get_mut(parent) {
            if child < len && !node.children.contains(&child) {
                node.children.push(child);
            }
        }
    }

    pub fn add_root(&mut self, node: usize) {
        if node < self.nodes.len() && !self.roots.contains(&node) {
            self.roots.push(node);
        }
    }

    pub fn find_node(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 设置权重节点的权重
    pub fn set_node_weight(&mut self, name: &str, weight: f32) -> bool {
        let Some(index) = self.find_node(name) else {
            return false;
        };
        match &mut self.nodes[index].kind {
            MorphNodeKind::Weight { node_weight } => {
                *node_weight = weight;
                true
            }
            _ => false,
        }
    }

    /// 解析姿态节点的目标
    pub fn link_targets(&mut self, sets: &[Arc<MorphTargetSet>]) {
        for node in &mut self.nodes {
            if let MorphNodeKind::Pose { morph_name, target, .. } = &mut node.kind {
                *target = find_in_sets(sets, morph_name);
                if target.is_none() {
                    log::warn!("[Morph] 找不到 Morph 目标 {}", morph_name);
                }
            }
        }
    }

    pub fn link_bones(&mut self, skeleton: &RefSkeleton) {
        for node in &mut self.nodes {
            if let MorphNodeKind::WeightByBoneAngle(angle) = &mut node.kind {
                angle.link(skeleton);
            }
        }
    }

    /// 用最新的组件空间姿态刷新骨骼夹角节点
    pub fn update_bone_angles(&mut self, space_bases: &[BoneAtom], params: &mut MaterialParams) {
        for node in &mut self.nodes {
            if let MorphNodeKind::WeightByBoneAngle(angle) = &mut node.kind {
                angle.update(space_bases, params);
            }
        }
    }

    /// 收集激活的 Morph；同一目标出现多次时权重相加
    pub fn active_morphs(&self, min_weight: f32) -> Vec<ActiveMorph> {
        let mut out: Vec<ActiveMorph> = Vec::new();
        for &root in &self.roots {
            self.collect(root, 1.0, 0, &mut out);
        }
        out.retain(|m| m.weight.abs() > min_weight);
        out
    }

    fn collect(&self, index: usize, weight: f32, depth: usize, out: &mut Vec<ActiveMorph>) {
        // 图保证无环，深度上限只防配置错误
        if depth > self.nodes.len() {
            log::error!("[Morph] Morph 图存在环，停止遍历");
            return;
        }
        let Some(node) = self.nodes.get(index) else {
            return;
        };
        let node_weight = match &node.kind {
            MorphNodeKind::Weight { node_weight } => *node_weight,
            MorphNodeKind::WeightByBoneAngle(angle) => angle.node_weight,
            MorphNodeKind::Pose { weight: pose_weight, target, .. } => {
                if let Some(target) = target {
                    let w = weight * pose_weight;
                    match out.iter_mut().find(|m| m.same_target(target)) {
                        Some(existing) => existing.weight += w,
                        None => out.push(ActiveMorph::new(target.clone(), w)),
                    }
                }
                return;
            }
        };
        let w = weight * node_weight;
        if w == 0.0 {
            return;
        }
        for &child in &node.children {
            self.collect(child, w, depth + 1, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::biped_skeleton;
    use glam::Quat;

    fn face_set() -> Vec<Arc<MorphTargetSet>> {
        vec![Arc::new(MorphTargetSet::new(
            "face",
            vec![MorphTarget::new("smile"), MorphTarget::new("blink")],
        ))]
    }

    #[test]
    fn test_weight_nodes_multiply() {
        let mut graph = MorphGraph::new();
        let outer = graph.add_node("outer", MorphNodeKind::Weight { node_weight: 0.5 });
        let inner = graph.add_node("inner", MorphNodeKind::Weight { node_weight: 0.5 });
        let smile = graph.add_pose("smile_pose", "smile");
        let blink = graph.add_pose("blink_pose", "blink");
        graph.add_child(outer, inner);
        graph.add_child(inner, smile);
        graph.add_child(outer, blink);
        // 同一姿态节点从两条路径到达，合并为一条
        graph.add_child(outer, smile);
        graph.add_root(outer);
        graph.link_targets(&face_set());

        let morphs = graph.active_morphs(1.0e-5);
        assert_eq!(morphs.len(), 2);
        let smile = morphs.iter().find(|m| m.target.name == "smile").unwrap();
        assert!((smile.weight - 0.75).abs() < 1.0e-5);

        assert!(graph.set_node_weight("outer", 0.0));
        assert!(graph.active_morphs(1.0e-5).is_empty());
        assert!(!graph.set_node_weight("smile_pose", 1.0));
    }

    #[test]
    fn test_add_child_ignores_unknown_nodes() {
        let mut graph = MorphGraph::new();
        let outer = graph.add_node("outer", MorphNodeKind::Weight { node_weight: 1.0 });
        let smile = graph.add_pose("smile_pose", "smile");
        graph.add_child(outer, 7);
        graph.add_child(9, smile);
        graph.add_child(outer, smile);
        graph.add_root(outer);
        graph.link_targets(&face_set());
        assert_eq!(graph.active_morphs(1.0e-5).len(), 1);
    }

    #[test]
    fn test_weight_by_bone_angle() {
        let skel = biped_skeleton();
        let mut graph = MorphGraph::new();
        let mut node = WeightByBoneAngle::new("spine", "head");
        node.material_slot = Some(0);
        node.scalar_param_name = Some("neck_bend".into());
        let angle = graph.add_node("angle", MorphNodeKind::WeightByBoneAngle(node));
        let pose = graph.add_pose("smile_pose", "smile");
        graph.add_child(angle, pose);
        graph.add_root(angle);
        graph.link_targets(&face_set());
        graph.link_bones(&skel);

        let mut spaces = skel.ref_component_space_all().to_vec();
        let head = skel.find_bone_by_name("head").unwrap();
        spaces[head].rotation = Quat::from_rotation_z(std::f32::consts::FRAC_PI_4);
        let mut params = MaterialParams::default();
        graph.update_bone_angles(&spaces, &mut params);

        let morphs = graph.active_morphs(1.0e-5);
        assert_eq!(morphs.len(), 1);
        assert!((morphs[0].weight - 0.5).abs() < 1.0e-3);
        assert!((params.scalar(0, "neck_bend").unwrap() - 0.5).abs() < 1.0e-3);
    }

    #[test]
    fn test_table_clamps() {
        let node = WeightByBoneAngle::new("a", "b");
        assert_eq!(node.weight_for_angle(-10.0), 0.0);
        assert_eq!(node.weight_for_angle(180.0), 1.0);
        assert!((node.weight_for_angle(45.0) - 0.5).abs() < 1.0e-5);
    }
}
