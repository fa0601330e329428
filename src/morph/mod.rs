//! Morph 目标系统
//!
//! - Morph 图：动画树驱动的权重节点 / 姿态节点 / 骨骼夹角权重节点
//! - 聚合：合并树 Morph 与曲线 Morph，保证同一目标只出现一次

mod manager;
mod morph;

pub use manager::MorphManager;
pub use morph::{MorphGraph, MorphNode, MorphNodeKind, WeightByBoneAngle};

use std::sync::Arc;

/// Morph 目标（顶点数据由渲染侧持有，这里只有名字和材质联动）
#[derive(Clone, Debug, PartialEq)]
pub struct MorphTarget {
    pub name: String,
    /// 联动的材质槽
    pub material_slot: Option<usize>,
    /// 联动的材质标量参数名；None 时用 Morph 名
    pub scalar_param_name: Option<String>,
}

impl MorphTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            material_slot: None,
            scalar_param_name: None,
        }
    }

    pub fn with_material(mut self, slot: usize, param: impl Into<String>) -> Self {
        self.material_slot = Some(slot);
        self.scalar_param_name = Some(param.into());
        self
    }

    /// 材质参数名
    pub fn param_name(&self) -> &str {
        self.scalar_param_name.as_deref().unwrap_or(&self.name)
    }
}

/// Morph 目标集
#[derive(Clone, Debug, Default)]
pub struct MorphTargetSet {
    pub name: String,
    pub targets: Vec<Arc<MorphTarget>>,
}

impl MorphTargetSet {
    pub fn new(name: impl Into<String>, targets: Vec<MorphTarget>) -> Self {
        Self {
            name: name.into(),
            targets: targets.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn find_morph_target(&self, name: &str) -> Option<Arc<MorphTarget>> {
        self.targets.iter().find(|t| t.name == name).cloned()
    }
}

/// 在多个目标集中按名字查找，先加入的优先
pub fn find_in_sets(sets: &[Arc<MorphTargetSet>], name: &str) -> Option<Arc<MorphTarget>> {
    sets.iter().find_map(|s| s.find_morph_target(name))
}

/// 激活的 Morph（目标 + 权重）
#[derive(Clone, Debug)]
pub struct ActiveMorph {
    pub target: Arc<MorphTarget>,
    pub weight: f32,
}

impl ActiveMorph {
    pub fn new(target: Arc<MorphTarget>, weight: f32) -> Self {
        Self { target, weight }
    }

    pub fn same_target(&self, other: &Arc<MorphTarget>) -> bool {
        Arc::ptr_eq(&self.target, other) || self.target.name == other.name
    }
}
