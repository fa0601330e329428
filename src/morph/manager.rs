//! Morph 管理器
//!
//! 每帧合并两路 Morph：
//! - 动画树（Morph 图）输出的 Morph，原样保留
//! - 动画曲线 key 解析出的 Morph，同名去重、与树冲突时丢弃

use std::sync::Arc;

use super::{find_in_sets, ActiveMorph, MorphTargetSet};
use crate::animation::CurveKey;
use crate::model::MaterialParams;
use crate::WarnOnce;

/// Morph 管理器
#[derive(Clone, Debug, Default)]
pub struct MorphManager {
    active_morphs: Vec<ActiveMorph>,
    /// 本帧曲线驱动的 Morph
    curve_morphs: Vec<ActiveMorph>,
}

impl MorphManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 本帧最终的激活 Morph 列表
    pub fn active_morphs(&self) -> &[ActiveMorph] {
        &self.active_morphs
    }

    pub fn curve_morphs(&self) -> &[ActiveMorph] {
        &self.curve_morphs
    }

    /// 把动画曲线 key 解析为 Morph
    ///
    /// 权重不超过 `min_weight` 的 key 丢弃；同名 key 后者覆盖前者。
    /// 命中的目标同时写入联动的材质标量参数，上一帧有、这一帧没有的参数清零。
    pub fn apply_curve_keys(
        &mut self,
        keys: &[CurveKey],
        sets: &[Arc<MorphTargetSet>],
        params: &mut MaterialParams,
        min_weight: f32,
        warn: &mut WarnOnce,
    ) {
        let mut unique: Vec<CurveKey> = Vec::with_capacity(keys.len());
        for key in keys.iter().filter(|k| k.weight > min_weight) {
            match unique.iter_mut().find(|k| k.name == key.name) {
                Some(existing) => {
                    if (existing.weight - key.weight).abs() > f32::EPSILON && warn.first(&format!("curve:{}", key.name)) {
                        log::warn!(
                            "[Morph] 曲线 {} 出现多次且权重不同 ({} / {})，取后者",
                            key.name,
                            existing.weight,
                            key.weight
                        );
                    }
                    existing.weight = key.weight;
                }
                None => unique.push(key.clone()),
            }
        }

        let previous = std::mem::take(&mut self.curve_morphs);
        for key in &unique {
            let Some(target) = find_in_sets(sets, &key.name) else {
                continue;
            };
            if let Some(slot) = target.material_slot {
                params.set_scalar(slot, target.param_name(), key.weight);
            }
            self.curve_morphs.push(ActiveMorph::new(target, key.weight));
        }

        for old in &previous {
            let still_active = self.curve_morphs.iter().any(|m| m.same_target(&old.target));
            if still_active {
                continue;
            }
            if let Some(slot) = old.target.material_slot {
                params.set_scalar(slot, old.target.param_name(), 0.0);
            }
        }
    }

    /// 合并树 Morph 与曲线 Morph，保证同一目标只出现一次
    pub fn update_active_morphs(&mut self, tree_morphs: &[ActiveMorph], warn: &mut WarnOnce) {
        self.active_morphs.clear();
        self.active_morphs.extend_from_slice(tree_morphs);
        let tree_count = self.active_morphs.len();

        for curve in &self.curve_morphs {
            if curve.weight.abs() <= f32::EPSILON {
                continue;
            }
            // 曲线之间重复：后来的覆盖
            if let Some(pos) = self.active_morphs[tree_count..]
                .iter()
                .position(|m| m.same_target(&curve.target))
            {
                if warn.first(&format!("dup:{}", curve.target.name)) {
                    log::warn!("[Morph] 曲线 Morph {} 重复，保留最后一个", curve.target.name);
                }
                self.active_morphs.remove(tree_count + pos);
            }
            if self.active_morphs[..tree_count].iter().any(|m| m.same_target(&curve.target)) {
                if warn.first(&format!("tree:{}", curve.target.name)) {
                    log::warn!("[Morph] Morph {} 已由动画树驱动，忽略曲线", curve.target.name);
                }
                continue;
            }
            self.active_morphs.push(curve.clone());
        }
    }

    pub fn clear(&mut self) {
        self.active_morphs.clear();
        self.curve_morphs.clear();
    }
}
