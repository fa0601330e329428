//! 面部动画
//!
//! 面部动画 SDK 以主骨骼列表的形式输出骨骼变换，管线在姿态求值之后、
//! 合成之前把它们叠加（或替换）到局部变换上。SDK 的坐标系 Y 轴与引擎相反。

mod instance;

pub use instance::FaceAnimInstance;

use glam::{Quat, Vec3};

use crate::skeleton::BoneAtom;

/// 面部骨骼的叠加方式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FaceBlendMode {
    /// 面部姿态相对参考姿态的差值叠加到局部变换
    #[default]
    Additive,
    /// 覆盖旋转和平移，保留缩放
    Replace,
}

/// SDK tick 后的播放状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FacePlaybackState {
    Playing,
    /// 片段刚开始，需要播放关联音频
    StartAudio,
    Stopped,
}

/// SDK 采样出的一根骨骼（SDK 坐标系）
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FaceBoneSample {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    pub weight: f32,
}

impl FaceBoneSample {
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self {
            position,
            rotation,
            scale: Vec3::ONE,
            weight: 1.0,
        }
    }

    /// 转到引擎坐标系：位置和旋转虚部的 Y 取反
    pub fn to_engine_atom(&self) -> BoneAtom {
        let q = self.rotation;
        let mut atom = BoneAtom::new(
            Quat::from_xyzw(q.x, -q.y, q.z, q.w),
            Vec3::new(self.position.x, -self.position.y, self.position.z),
            self.scale,
        );
        atom.normalize_rotation();
        atom
    }
}

/// 面部图中节点回调产生的事件
#[derive(Clone, Debug, PartialEq)]
pub enum FaceGraphEvent {
    /// Morph 目标节点
    Morph { name: String, weight: f32 },
    /// 材质参数节点
    MaterialParam { slot: usize, name: String, value: f32 },
}

/// 主骨骼到骨架骨骼的链接
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaceBoneLink {
    Linked(usize),
    /// 骨架里没有这根骨骼
    Absent,
}

/// 面部动画 SDK
///
/// 每个实例持有自己的 SDK actor 实例（播放游标、寄存器），共享只读的 actor 数据。
pub trait FaceAnimSdk {
    /// 进程级初始化，只会被调用一次
    fn initialize(&mut self) -> bool {
        true
    }

    fn set_actor(&mut self, asset: &str);

    fn play_anim(&mut self, group: &str, name: &str) -> bool;
    fn stop_anim(&mut self);
    fn is_playing(&self) -> bool;

    /// `audio_offset` 为音频同步偏移（秒），没有音频时为 -1
    fn tick(&mut self, app_time: f64, audio_offset: f32) -> FacePlaybackState;

    fn begin_frame(&mut self);
    fn end_frame(&mut self);

    /// 主骨骼列表
    fn master_bone_names(&self) -> Vec<String>;

    /// SDK 请求重新链接骨骼；调用后清除请求
    fn take_relink_request(&mut self) -> bool {
        false
    }

    /// 采样主骨骼列表中第 `index` 根骨骼
    fn sample_bone(&self, index: usize) -> Option<FaceBoneSample>;

    /// 面部资产中该骨骼的参考姿态（SDK 坐标系）
    fn reference_bone(&self, index: usize) -> Option<FaceBoneSample>;

    /// 本帧面部图节点回调产生的事件
    fn drain_graph_events(&mut self) -> Vec<FaceGraphEvent> {
        Vec::new()
    }
}
