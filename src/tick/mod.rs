//! Tick 控制：跳帧率、跳帧判定与丢帧时间累计
//!
//! 两个独立的跳帧率：
//! - 节点跳帧率：同时跳过节点 tick 和骨骼求值
//! - 骨骼跳帧率：只跳过骨骼求值
//!
//! 同一 owner 的所有实例共享错峰标签，跳帧对齐；不同 owner 错开。

use crate::context::PipelineContext;
use crate::host::OwnerRole;

/// 本帧 tick 判定所需的输入
#[derive(Clone, Copy, Debug, Default)]
pub struct TickInputs {
    pub recently_rendered: bool,
    /// 屏幕尺寸因子，1 贴近镜头，0 无穷远
    pub distance_factor: f32,
    pub owner_role: Option<OwnerRole>,
    /// 当前或上一帧有根运动，或根旋转模式不为 Ignore
    pub root_motion_active: bool,
    pub low_update_frame_rate: u32,
    pub anim_lod_frame_rate: u32,
    pub anim_lod_distance_factor: f32,
    /// owner 错峰标签（0 表示没有 owner）
    pub stagger_tag: u32,
}

/// 本帧 tick 判定结果
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickDecision {
    pub skip_tick_anim_nodes: bool,
    pub skip_get_bone_atoms: bool,
    pub interpolate_bone_atoms: bool,
    /// 未经根运动覆盖的节点跳帧率（插值系数使用）
    pub node_skip_rate: u32,
    pub effective_node_skip_rate: u32,
    pub effective_bone_skip_rate: u32,
}

impl TickDecision {
    /// 插值系数
    pub fn interpolation_alpha(&self) -> f32 {
        interpolation_alpha(self.node_skip_rate)
    }
}

/// 跳帧插值系数 `0.25 + 1 / (2 * max(rate, 2))`
pub fn interpolation_alpha(skip_rate: u32) -> f32 {
    0.25 + 1.0 / (skip_rate.max(2) * 2) as f32
}

/// 按可见性、距离、owner 计算节点跳帧率
pub fn node_skip_rate(ctx: &PipelineContext, inputs: &TickInputs) -> u32 {
    if ctx.interactive_mode {
        return 0;
    }
    let cfg = &ctx.config;

    let mut rate = if !inputs.recently_rendered {
        4
    } else if inputs.distance_factor > cfg.skip_distance_factor_near {
        0
    } else if inputs.distance_factor > cfg.skip_distance_factor_mid {
        1
    } else if inputs.distance_factor > cfg.skip_distance_factor_far {
        2
    } else {
        3
    };

    if ctx.split_screen {
        rate += 1;
    }
    rate += ctx.last_drop_rate;

    if let Some(role) = inputs.owner_role {
        if role.human_controlled && role.locally_controlled {
            rate = 0;
        } else if role.dead {
            rate += 1;
        }
    }

    let max = if inputs.recently_rendered {
        cfg.max_node_skip_rate_rendered
    } else {
        cfg.max_node_skip_rate_hidden
    };
    rate.min(max)
}

/// 骨骼求值跳帧率
pub fn bone_skip_rate(inputs: &TickInputs) -> u32 {
    let mut rate = 1;
    if !inputs.recently_rendered {
        rate = rate.max(inputs.low_update_frame_rate);
    }
    if inputs.distance_factor < inputs.anim_lod_distance_factor {
        rate = rate.max(inputs.anim_lod_frame_rate);
    }
    rate
}

/// 每个实例的 tick 控制器
#[derive(Clone, Debug, Default)]
pub struct TickController {
    pub tick_count: u64,
    /// 节点 tick 被跳过期间累计的时间
    pub accumulated_dropped_delta_time: f32,
    /// 整个组件 tick 被跳过期间累计的时间
    pub component_dropped_delta_time: f32,
    pub last_decision: TickDecision,
}

impl TickController {
    pub fn new() -> Self {
        Self::default()
    }

    /// 计算本帧跳帧判定（会推进 tick 计数）
    pub fn update(&mut self, ctx: &PipelineContext, inputs: &TickInputs) -> TickDecision {
        let node_rate = node_skip_rate(ctx, inputs);
        let mut effective_node = node_rate;
        let mut effective_bone = bone_skip_rate(inputs);

        if inputs.root_motion_active {
            effective_node = 0;
            effective_bone = 0;
        }

        self.tick_count += 1;
        let frame = self.tick_count + inputs.stagger_tag as u64;

        let mut skip_nodes = false;
        let mut skip_bones = false;
        if effective_node > 1 {
            if frame % effective_node as u64 > 0 {
                skip_nodes = true;
                skip_bones = true;
            }
        } else if effective_bone > 1 && frame % effective_bone as u64 > 0 {
            skip_bones = true;
        }

        // 人类控制的 pawn 从不跳过节点 tick，玩法事件依赖动画
        if skip_nodes && inputs.owner_role.map_or(false, |r| r.human_controlled) {
            skip_nodes = false;
        }

        let interpolate = ctx.config.enable_interpolation
            && inputs.recently_rendered
            && (effective_node > 1 || effective_bone > 1);

        let decision = TickDecision {
            skip_tick_anim_nodes: skip_nodes,
            skip_get_bone_atoms: skip_bones,
            interpolate_bone_atoms: interpolate,
            node_skip_rate: node_rate,
            effective_node_skip_rate: effective_node,
            effective_bone_skip_rate: effective_bone,
        };
        if ctx.config.debug_log && decision != self.last_decision {
            log::debug!(
                "[Tick] 跳帧率 节点 {} 骨骼 {}，跳过节点 {} 骨骼 {}",
                effective_node,
                effective_bone,
                skip_nodes,
                skip_bones
            );
        }
        self.last_decision = decision;
        decision
    }

    /// 是否整帧跳过组件 tick
    pub fn should_bypass_component(
        decision: &TickDecision,
        recently_rendered: bool,
        required_bones_up_to_date: bool,
        arrays_sized: bool,
    ) -> bool {
        decision.skip_tick_anim_nodes
            && decision.skip_get_bone_atoms
            && !recently_rendered
            && required_bones_up_to_date
            && arrays_sized
    }

    /// 整帧跳过：时间留到下一次执行
    pub fn drop_component_tick(&mut self, delta_time: f32) {
        self.component_dropped_delta_time += delta_time;
    }

    /// 执行的这一帧实际使用的时间（含之前整帧跳过的时间）
    pub fn take_component_delta(&mut self, delta_time: f32) -> f32 {
        let dt = delta_time + self.component_dropped_delta_time;
        self.component_dropped_delta_time = 0.0;
        dt
    }

    /// 节点 tick 使用的时间；跳过时累计并返回 None
    pub fn node_tick_delta(&mut self, delta_time: f32, skip_tick_anim_nodes: bool) -> Option<f32> {
        if skip_tick_anim_nodes {
            self.accumulated_dropped_delta_time += delta_time;
            None
        } else {
            let dt = delta_time + self.accumulated_dropped_delta_time;
            self.accumulated_dropped_delta_time = 0.0;
            Some(dt)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnimConfig;

    fn ctx() -> PipelineContext {
        PipelineContext::with_config(AnimConfig::default())
    }

    fn visible(distance_factor: f32) -> TickInputs {
        TickInputs {
            recently_rendered: true,
            distance_factor,
            ..Default::default()
        }
    }

    #[test]
    fn test_node_skip_rate_table() {
        let c = ctx();
        assert_eq!(node_skip_rate(&c, &visible(0.5)), 0);
        assert_eq!(node_skip_rate(&c, &visible(0.2)), 1);
        assert_eq!(node_skip_rate(&c, &visible(0.1)), 2);
        assert_eq!(node_skip_rate(&c, &visible(0.01)), 3);
        let hidden = TickInputs::default();
        assert_eq!(node_skip_rate(&c, &hidden), 4);
    }

    #[test]
    fn test_owner_and_split_screen_adjust() {
        let mut c = ctx();
        c.split_screen = true;
        // 2 + 1，未超过上限
        assert_eq!(node_skip_rate(&c, &visible(0.1)), 3);
        // 3 + 1，夹到 3
        assert_eq!(node_skip_rate(&c, &visible(0.01)), 3);

        let c = ctx();
        let mut inputs = visible(0.1);
        inputs.owner_role = Some(OwnerRole {
            dead: true,
            ..Default::default()
        });
        assert_eq!(node_skip_rate(&c, &inputs), 3);
        inputs.owner_role = Some(OwnerRole {
            human_controlled: true,
            locally_controlled: true,
            dead: false,
        });
        assert_eq!(node_skip_rate(&c, &inputs), 0);
    }

    #[test]
    fn test_interactive_mode_never_skips() {
        let mut c = ctx();
        c.interactive_mode = true;
        assert_eq!(node_skip_rate(&c, &TickInputs::default()), 0);
    }

    #[test]
    fn test_bone_skip_rate() {
        let mut inputs = TickInputs {
            recently_rendered: false,
            low_update_frame_rate: 2,
            anim_lod_frame_rate: 3,
            anim_lod_distance_factor: 0.5,
            distance_factor: 0.1,
            ..Default::default()
        };
        assert_eq!(bone_skip_rate(&inputs), 3);
        inputs.distance_factor = 0.9;
        assert_eq!(bone_skip_rate(&inputs), 2);
        inputs.recently_rendered = true;
        assert_eq!(bone_skip_rate(&inputs), 1);
    }

    #[test]
    fn test_skip_pattern_with_stagger() {
        let c = ctx();
        let mut tick = TickController::new();
        let mut inputs = visible(0.01);
        inputs.stagger_tag = 2;
        // 帧号 = tick 计数 + 2：3 求值，4 / 5 跳过，6 求值
        let pattern: Vec<bool> = (0..4).map(|_| tick.update(&c, &inputs).skip_get_bone_atoms).collect();
        assert_eq!(pattern, vec![false, true, true, false]);
        assert!(tick.last_decision.interpolate_bone_atoms);
    }

    #[test]
    fn test_root_motion_disables_skipping() {
        let c = ctx();
        let mut tick = TickController::new();
        let mut inputs = visible(0.01);
        inputs.root_motion_active = true;
        for _ in 0..4 {
            let d = tick.update(&c, &inputs);
            assert!(!d.skip_get_bone_atoms);
            assert!(!d.skip_tick_anim_nodes);
            assert!(!d.interpolate_bone_atoms);
        }
    }

    #[test]
    fn test_human_owner_never_skips_node_tick() {
        let c = ctx();
        let mut tick = TickController::new();
        let mut inputs = visible(0.01);
        inputs.owner_role = Some(OwnerRole {
            human_controlled: true,
            locally_controlled: false,
            dead: false,
        });
        let mut saw_bone_skip = false;
        for _ in 0..3 {
            let d = tick.update(&c, &inputs);
            assert!(!d.skip_tick_anim_nodes);
            saw_bone_skip |= d.skip_get_bone_atoms;
        }
        assert!(saw_bone_skip);
    }

    #[test]
    fn test_dropped_delta_accounting() {
        let mut tick = TickController::new();
        assert_eq!(tick.node_tick_delta(0.1, true), None);
        assert_eq!(tick.node_tick_delta(0.1, true), None);
        let dt = tick.node_tick_delta(0.1, false).unwrap();
        assert!((dt - 0.3).abs() < 1.0e-6);
        assert_eq!(tick.accumulated_dropped_delta_time, 0.0);

        tick.drop_component_tick(0.05);
        let dt = tick.take_component_delta(0.1);
        assert!((dt - 0.15).abs() < 1.0e-6);
        assert_eq!(tick.component_dropped_delta_time, 0.0);
    }

    #[test]
    fn test_interpolation_alpha() {
        assert!((interpolation_alpha(0) - 0.5).abs() < 1.0e-6);
        assert!((interpolation_alpha(2) - 0.5).abs() < 1.0e-6);
        assert!((interpolation_alpha(4) - 0.375).abs() < 1.0e-6);
    }
}
