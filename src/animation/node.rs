//! 动画节点
//!
//! 节点全部放在 `AnimTree` 的 arena 里，用 `NodeId` 互相引用。
//! 节点图是 DAG，共享子节点靠 tick tag 保证一帧只处理一次。

use super::blend::{AimOffset, BlendByWeight, MirrorNode, MorphDriver, SyncGroupNode};
use super::sequence_player::SequencePlayer;
use super::slot::Slot;
use super::PoseOutput;

/// 节点在 arena 中的索引
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// 到子节点的连接
#[derive(Clone, Debug)]
pub struct ChildLink {
    pub name: String,
    pub node: Option<NodeId>,
    /// 子节点混合权重，同一父节点下之和为 1
    pub weight: f32,
}

/// 节点种类
#[derive(Clone, Debug)]
pub enum AnimNodeKind {
    SequencePlayer(SequencePlayer),
    BlendByWeight(BlendByWeight),
    Slot(Slot),
    SyncGroup(SyncGroupNode),
    MorphDriver(MorphDriver),
    /// 从上一次物理混合后的姿态取局部变换
    PhysicsPoseSource,
    /// 自身相关性驱动引用它的骨骼控制器
    SkelControlCarrier,
    AimOffset(AimOffset),
    Mirror(MirrorNode),
}

impl AnimNodeKind {
    /// 叶子节点没有子连接
    pub fn is_leaf(&self) -> bool {
        matches!(self, AnimNodeKind::SequencePlayer(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            AnimNodeKind::SequencePlayer(_) => "SequencePlayer",
            AnimNodeKind::BlendByWeight(_) => "BlendByWeight",
            AnimNodeKind::Slot(_) => "Slot",
            AnimNodeKind::SyncGroup(_) => "SyncGroup",
            AnimNodeKind::MorphDriver(_) => "MorphDriver",
            AnimNodeKind::PhysicsPoseSource => "PhysicsPoseSource",
            AnimNodeKind::SkelControlCarrier => "SkelControlCarrier",
            AnimNodeKind::AimOffset(_) => "AimOffset",
            AnimNodeKind::Mirror(_) => "Mirror",
        }
    }
}

/// 动画节点
#[derive(Clone, Debug)]
pub struct AnimNode {
    pub name: String,
    pub kind: AnimNodeKind,
    pub children: Vec<ChildLink>,

    // ========== tick 状态 ==========
    /// 本帧从根节点累乘下来的总权重
    pub node_total_weight: f32,
    pub relevant: bool,
    pub just_became_relevant: bool,

    // ========== 标签 ==========
    pub(crate) init_tag: u64,
    pub(crate) tick_tag: u64,
    pub(crate) end_event_tag: u64,
    pub(crate) cached_atoms_tag: u64,

    pub(crate) parents: Vec<NodeId>,
    /// 多个父节点共享时缓存求值结果
    pub(crate) cache_results: bool,
    pub(crate) cached: Option<PoseOutput>,
}

impl AnimNode {
    pub fn new(name: impl Into<String>, kind: AnimNodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            children: Vec::new(),
            node_total_weight: 0.0,
            relevant: false,
            just_became_relevant: false,
            init_tag: 0,
            tick_tag: 0,
            end_event_tag: 0,
            cached_atoms_tag: 0,
            parents: Vec::new(),
            cache_results: false,
            cached: None,
        }
    }

    pub fn parents(&self) -> &[NodeId] {
        &self.parents
    }

    /// 只有一个子连接的直通节点：子权重恒为 1
    pub(crate) fn set_pass_through_weights(&mut self) {
        for (i, child) in self.children.iter_mut().enumerate() {
            child.weight = if i == 0 { 1.0 } else { 0.0 };
        }
    }
}
