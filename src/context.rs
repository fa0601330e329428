//! 管线上下文
//!
//! 把原本散落的全局状态（配置快照、分屏标记、物理阶段标记、
//! 面部 SDK 一次性初始化）收拢到一个对象里，随 tick 传入。

use once_cell::sync::OnceCell;

use crate::config::{get_config, AnimConfig};

/// 每帧管线上下文
#[derive(Debug)]
pub struct PipelineContext {
    /// 本帧使用的配置快照
    pub config: AnimConfig,
    /// 应用时间（秒），面部动画 SDK tick 使用
    pub app_time: f64,
    /// 世界时间（秒）
    pub world_time: f32,
    /// 是否分屏
    pub split_screen: bool,
    /// 过场 / 交互模式下关闭距离跳帧
    pub interactive_mode: bool,
    /// 当前是否处于组件 tick 之后的物理汇合点
    pub post_tick_component_update: bool,
    /// 降细节时额外加的跳帧率（0 或 1）
    pub last_drop_rate: u32,
    /// 下一个 owner 错峰标签
    next_stagger_tag: u32,
    face_sdk_init: OnceCell<bool>,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::with_config(get_config())
    }

    pub fn with_config(config: AnimConfig) -> Self {
        Self {
            config,
            app_time: 0.0,
            world_time: 0.0,
            split_screen: false,
            interactive_mode: false,
            post_tick_component_update: false,
            last_drop_rate: 0,
            next_stagger_tag: 0,
            face_sdk_init: OnceCell::new(),
        }
    }

    /// 推进时间
    pub fn advance(&mut self, delta_time: f32) {
        self.app_time += delta_time as f64;
        self.world_time += delta_time;
    }

    /// 为新 owner 分配错峰标签（从 1 开始）
    pub fn allocate_stagger_tag(&mut self) -> u32 {
        self.next_stagger_tag += 1;
        self.next_stagger_tag
    }

    /// 面部动画 SDK 只初始化一次
    ///
    /// 返回初始化函数的结果；之后的调用直接返回缓存值。
    pub fn ensure_face_sdk_initialized<F>(&self, init: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        *self.face_sdk_init.get_or_init(|| {
            let ok = init();
            if ok {
                log::info!("[面部动画] SDK 初始化完成");
            } else {
                log::warn!("[面部动画] SDK 初始化失败");
            }
            ok
        })
    }

    /// 0 阈值的简写
    pub fn zero_weight(&self) -> f32 {
        self.config.zero_anim_weight_thresh
    }
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_face_sdk_init_runs_once() {
        let ctx = PipelineContext::with_config(AnimConfig::default());
        let mut calls = 0;
        assert!(ctx.ensure_face_sdk_initialized(|| {
            calls += 1;
            true
        }));
        assert!(ctx.ensure_face_sdk_initialized(|| false));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_stagger_tags_are_distinct() {
        let mut ctx = PipelineContext::with_config(AnimConfig::default());
        let a = ctx.allocate_stagger_tag();
        let b = ctx.allocate_stagger_tag();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }
}
