//! 动画系统
//!
//! 动画序列 / 动画集、节点图（arena + 索引）、节点 tick 与姿态求值、
//! 同步组和插槽播放。

mod bezier;
mod blend;
mod node;
mod sequence;
mod sequence_player;
mod slot;
mod tree;

pub use bezier::BezierCurve;
pub use blend::{AimOffset, AimOffsetProfile, BlendByWeight, MirrorNode, MorphDriver, SyncGroupNode};
pub use node::{AnimNode, AnimNodeKind, ChildLink, NodeId};
pub use sequence::{AnimNotify, AnimSequence, AnimSet, AnimSetList, BoneKey, BoneTrack, CurveTrack};
pub use sequence_player::{RootBoneOption, RootRotationOption, SequencePlayer};
pub use slot::{Slot, SlotState};
pub use tree::{AnimTree, EvalContext, RelevanceEvent, SyncGroup};

use crate::skeleton::{BoneAtom, RefSkeleton};

/// 动画曲线采样出的命名权重（Morph 曲线）
#[derive(Clone, Debug, PartialEq)]
pub struct CurveKey {
    pub name: String,
    pub weight: f32,
}

/// 触发的动画通知
#[derive(Clone, Debug, PartialEq)]
pub struct AnimNotifyEvent {
    pub node: NodeId,
    pub sequence: String,
    pub notify: String,
    pub time: f32,
}

/// 一次姿态求值的结果
#[derive(Clone, Debug)]
pub struct PoseOutput {
    /// 局部空间变换，大小等于参考骨骼数
    pub atoms: Vec<BoneAtom>,
    /// 网格空间的根运动增量
    pub root_motion_delta: BoneAtom,
    pub has_root_motion: bool,
    pub curve_keys: Vec<CurveKey>,
}

impl PoseOutput {
    /// 参考姿态
    pub fn ref_pose(skeleton: &RefSkeleton) -> Self {
        Self {
            atoms: skeleton.ref_pose_array(),
            root_motion_delta: BoneAtom::IDENTITY,
            has_root_motion: false,
            curve_keys: Vec::new(),
        }
    }
}
