//! 动画管线全局配置
//!
//! 所有参数扁平化，直接在代码中修改默认值即可。
//! 管线内部不直接读全局配置，而是通过 `PipelineContext` 拿到本帧快照。

use once_cell::sync::Lazy;
use std::sync::RwLock;

/// 动画配置（扁平化，不嵌套）
#[derive(Debug, Clone)]
pub struct AnimConfig {
    // ========== 权重阈值 ==========
    /// 节点 / 控制器权重视为 0 的阈值，默认 1e-5
    pub zero_anim_weight_thresh: f32,
    /// Morph 曲线最小混合权重，默认 1e-5
    pub min_morph_blend_weight: f32,

    // ========== 跳帧距离因子 ==========
    /// 距离因子大于此值时不跳帧，默认 0.3
    pub skip_distance_factor_near: f32,
    /// 距离因子大于此值时跳帧率为 1，默认 0.15
    pub skip_distance_factor_mid: f32,
    /// 距离因子大于此值时跳帧率为 2，否则为 3，默认 0.075
    pub skip_distance_factor_far: f32,

    // ========== 跳帧上限 ==========
    /// 最近渲染过时的最大跳帧率，默认 3
    pub max_node_skip_rate_rendered: u32,
    /// 未渲染时的最大跳帧率，默认 4
    pub max_node_skip_rate_hidden: u32,

    // ========== 插值 ==========
    /// 跳帧期间是否用缓存姿态插值，默认 true
    pub enable_interpolation: bool,

    // ========== 调试 ==========
    /// LOD 切换与必需骨骼重建时输出日志，默认 false
    pub log_lod_changes: bool,
    /// 是否输出调试日志，默认 false
    pub debug_log: bool,
}

impl Default for AnimConfig {
    fn default() -> Self {
        Self {
            // ====== 权重阈值 ======
            // 低于这个权重的节点不会被 tick，也不会参与求值
            zero_anim_weight_thresh: 1.0e-5,
            // 低于这个权重的曲线 Morph 直接丢弃
            min_morph_blend_weight: 1.0e-5,

            // ====== 跳帧距离因子 ======
            // 距离因子 = 屏幕尺寸占比，1.0 贴近镜头，0 无穷远
            // 越远跳得越多
            skip_distance_factor_near: 0.3,
            skip_distance_factor_mid: 0.15,
            skip_distance_factor_far: 0.075,

            // ====== 跳帧上限 ======
            // 30FPS 下超过这个值动作会明显卡顿
            max_node_skip_rate_rendered: 3,
            max_node_skip_rate_hidden: 4,

            // ====== 插值 ======
            enable_interpolation: true,

            // ====== 调试 ======
            log_lod_changes: false,
            debug_log: false,
        }
    }
}

/// 全局配置实例
static ANIM_CONFIG: Lazy<RwLock<AnimConfig>> = Lazy::new(|| RwLock::new(AnimConfig::default()));

/// 获取当前配置（只读）
pub fn get_config() -> AnimConfig {
    ANIM_CONFIG.read().unwrap().clone()
}

/// 手动设置配置（用于运行时调试）
pub fn set_config(config: AnimConfig) {
    *ANIM_CONFIG.write().unwrap() = config;
}

/// 重置为默认配置
pub fn reset_config() {
    *ANIM_CONFIG.write().unwrap() = AnimConfig::default();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds() {
        let config = AnimConfig::default();
        assert!((config.zero_anim_weight_thresh - 1.0e-5).abs() < 1.0e-9);
        assert!((config.skip_distance_factor_near - 0.3).abs() < 0.001);
        assert!((config.skip_distance_factor_mid - 0.15).abs() < 0.001);
        assert!((config.skip_distance_factor_far - 0.075).abs() < 0.001);
        assert_eq!(config.max_node_skip_rate_rendered, 3);
        assert_eq!(config.max_node_skip_rate_hidden, 4);
    }
}
