//! 插槽节点
//!
//! 子节点 0 为源姿态，其余子节点为自定义动画通道（序列播放节点）。
//! 播放自定义动画时淡入到该通道，结束或停止时淡出回源姿态。
//! 淡入淡出期间插槽在 always-tick 列表中，淡出完成后自行移除。

/// 插槽状态
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SlotState {
    #[default]
    Stopped,
    BlendingIn,
    Playing,
    BlendingOut,
}

#[derive(Clone, Debug)]
pub struct Slot {
    state: SlotState,
    /// 自定义通道当前权重 [0, 1]
    custom_weight: f32,
    target_weight: f32,
    blend_time_to_go: f32,
    /// 当前自定义通道的子节点下标（>= 1）
    active_child: usize,
    pub blend_out_time: f32,
    /// 自定义动画播完后自动淡出
    pub auto_blend_out: bool,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            state: SlotState::Stopped,
            custom_weight: 0.0,
            target_weight: 0.0,
            blend_time_to_go: 0.0,
            active_child: 1,
            blend_out_time: 0.2,
            auto_blend_out: true,
        }
    }
}

impl Slot {
    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn custom_weight(&self) -> f32 {
        self.custom_weight
    }

    pub fn active_child(&self) -> usize {
        self.active_child
    }

    pub fn is_playing_custom(&self) -> bool {
        matches!(self.state, SlotState::BlendingIn | SlotState::Playing)
    }

    /// 开始淡入指定通道
    pub(crate) fn begin_blend_in(&mut self, child: usize, blend_in_time: f32, blend_out_time: f32) {
        if child != self.active_child {
            // 换通道时旧通道直接让位
            self.active_child = child;
        }
        self.blend_out_time = blend_out_time.max(0.0);
        self.target_weight = 1.0;
        self.blend_time_to_go = blend_in_time.max(0.0) * (1.0 - self.custom_weight);
        self.state = SlotState::BlendingIn;
        if self.blend_time_to_go <= 0.0 {
            self.custom_weight = 1.0;
            self.blend_time_to_go = 0.0;
            self.state = SlotState::Playing;
        }
    }

    /// 开始淡出
    pub(crate) fn begin_blend_out(&mut self, blend_out_time: f32) {
        if self.state == SlotState::Stopped {
            return;
        }
        self.target_weight = 0.0;
        self.blend_time_to_go = blend_out_time.max(0.0) * self.custom_weight;
        self.state = SlotState::BlendingOut;
        if self.blend_time_to_go <= 0.0 {
            self.custom_weight = 0.0;
            self.blend_time_to_go = 0.0;
            self.state = SlotState::Stopped;
        }
    }

    /// 推进淡入淡出；淡出完成时返回 true
    pub(crate) fn tick(&mut self, delta_time: f32) -> bool {
        if self.blend_time_to_go > 0.0 {
            if delta_time >= self.blend_time_to_go {
                self.custom_weight = self.target_weight;
                self.blend_time_to_go = 0.0;
            } else {
                self.custom_weight += (self.target_weight - self.custom_weight) * (delta_time / self.blend_time_to_go);
                self.blend_time_to_go -= delta_time;
            }
        }

        match self.state {
            SlotState::BlendingIn if self.blend_time_to_go <= 0.0 => {
                self.state = SlotState::Playing;
                false
            }
            SlotState::BlendingOut if self.blend_time_to_go <= 0.0 => {
                self.state = SlotState::Stopped;
                true
            }
            SlotState::Stopped => true,
            _ => false,
        }
    }

    /// 子节点权重：源 = 1 - w，当前通道 = w
    pub(crate) fn child_weights(&self, child_count: usize) -> Vec<f32> {
        let mut weights = vec![0.0; child_count];
        if child_count == 0 {
            return weights;
        }
        let custom = if self.active_child < child_count {
            self.custom_weight
        } else {
            0.0
        };
        weights[0] = 1.0 - custom;
        if custom > 0.0 {
            weights[self.active_child] = custom;
        }
        weights
    }

    /// 自定义通道的动画播完
    pub(crate) fn on_child_anim_end(&mut self, child: usize) {
        if child == self.active_child && self.auto_blend_out && self.is_playing_custom() {
            self.begin_blend_out(self.blend_out_time);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blend_in_then_out() {
        let mut slot = Slot::default();
        slot.begin_blend_in(1, 0.5, 0.5);
        assert_eq!(slot.state(), SlotState::BlendingIn);
        assert!(!slot.tick(0.25));
        assert!((slot.custom_weight() - 0.5).abs() < 1.0e-5);
        assert_eq!(slot.child_weights(2), vec![0.5, 0.5]);
        assert!(!slot.tick(0.3));
        assert_eq!(slot.state(), SlotState::Playing);
        assert_eq!(slot.child_weights(2), vec![0.0, 1.0]);

        slot.on_child_anim_end(1);
        assert_eq!(slot.state(), SlotState::BlendingOut);
        assert!(!slot.tick(0.25));
        assert!(slot.tick(0.3));
        assert_eq!(slot.state(), SlotState::Stopped);
        assert_eq!(slot.child_weights(2), vec![1.0, 0.0]);
    }

    #[test]
    fn test_instant_blend() {
        let mut slot = Slot::default();
        slot.begin_blend_in(2, 0.0, 0.0);
        assert_eq!(slot.state(), SlotState::Playing);
        assert_eq!(slot.child_weights(3), vec![0.0, 0.0, 1.0]);
        slot.begin_blend_out(0.0);
        assert_eq!(slot.state(), SlotState::Stopped);
    }

    #[test]
    fn test_end_of_other_channel_ignored() {
        let mut slot = Slot::default();
        slot.begin_blend_in(1, 0.0, 0.2);
        slot.on_child_anim_end(2);
        assert_eq!(slot.state(), SlotState::Playing);
    }
}
