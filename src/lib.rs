//! Skel Runtime - 角色实例的逐帧骨骼动画求值管线
//!
//! 每帧把动画节点图、物理姿态、面部动画、骨骼控制器和 Morph 目标
//! 合成为一组可直接用于蒙皮的组件空间骨骼变换：
//! - Tick 控制（跳帧 / 插值 / LOD）
//! - 动画节点图的 tick 与姿态求值
//! - 必需骨骼计算与三遍合成
//! - 根运动处理
//! - 面部动画叠加
//! - Morph 聚合
//! - 物理混合与运动学推送

pub mod animation;
pub mod config;
pub mod context;
pub mod controls;
pub mod face;
pub mod host;
pub mod model;
pub mod morph;
pub mod physics;
pub mod root_motion;
pub mod skeleton;
pub mod tick;

#[cfg(test)]
pub(crate) mod test_util;

pub use animation::{AnimSequence, AnimSet, AnimSetList, AnimTree, CurveKey, NodeId};
pub use config::AnimConfig;
pub use context::PipelineContext;
pub use controls::{SkelControl, SkelControlKind};
pub use model::{InstanceSettings, SkeletalInstance, SkeletalMesh};
pub use morph::{ActiveMorph, MorphTarget, MorphTargetSet};
pub use physics::{PhysicsAsset, PhysicsPoseSource, RapierBodies};
pub use skeleton::{BoneAtom, BoneVisibility, RefBone, RefSkeleton};

use std::collections::HashSet;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SkelError {
    #[error("Invalid skeleton: {0}")]
    InvalidSkeleton(String),

    #[error("Bone not found: {0}")]
    BoneNotFound(String),

    #[error("Animation not found: {0}")]
    AnimationNotFound(String),

    #[error("Invalid LOD: {0}")]
    InvalidLod(usize),

    #[error("Face animation error: {0}")]
    FaceAnimation(String),

    #[error("Physics error: {0}")]
    Physics(String),

    #[error("Invalid anim tree: {0}")]
    InvalidAnimTree(String),

    #[error("Instance destroyed")]
    InstanceDestroyed,
}

pub type Result<T> = std::result::Result<T, SkelError>;

/// 按 key 去重的一次性警告记录
#[derive(Clone, Debug, Default)]
pub struct WarnOnce {
    seen: HashSet<String>,
}

impl WarnOnce {
    /// 第一次见到该 key 时返回 true
    pub fn first(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return false;
        }
        self.seen.insert(key.to_string());
        true
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}
