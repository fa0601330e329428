//! 材质标量参数
//!
//! Morph 目标、骨骼夹角节点和面部图都会写材质参数，按 (材质槽, 参数名) 存放。

use std::collections::HashMap;

/// 实例的材质标量参数表
#[derive(Clone, Debug, Default)]
pub struct MaterialParams {
    scalars: HashMap<(usize, String), f32>,
}

impl MaterialParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入标量参数
    pub fn set_scalar(&mut self, slot: usize, name: &str, value: f32) {
        self.scalars.insert((slot, name.to_string()), value);
    }

    pub fn scalar(&self, slot: usize, name: &str) -> Option<f32> {
        self.scalars.get(&(slot, name.to_string())).copied()
    }

    pub fn len(&self) -> usize {
        self.scalars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scalars.is_empty()
    }

    pub fn clear(&mut self) {
        self.scalars.clear();
    }
}
