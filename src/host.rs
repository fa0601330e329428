//! 宿主接口
//!
//! 管线只通过这些 trait 访问外部协作者：拥有者 Actor、音频组件、
//! 渲染对象、流送管理器和腿部射线检测。

use glam::{Quat, Vec3};

use crate::morph::ActiveMorph;
use crate::root_motion::RootMotionMode;
use crate::skeleton::BoneAtom;

/// 拥有者角色信息（影响跳帧策略）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OwnerRole {
    /// 人类玩家控制
    pub human_controlled: bool,
    /// 本地控制
    pub locally_controlled: bool,
    /// 已死亡
    pub dead: bool,
}

/// Actor 附着的基座
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActorBase {
    pub id: u64,
    /// 硬附着（随基座移动）
    pub hard_attach: bool,
}

/// 移动碰撞结果
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MoveHit {
    pub location: Vec3,
    pub normal: Vec3,
    /// 实际完成的比例 [0, 1]
    pub time: f32,
}

/// 拥有者 Actor
pub trait OwnerActor {
    fn role(&self) -> OwnerRole;

    /// 错峰标签；0 表示尚未分配
    fn stagger_tag(&self) -> u32;
    fn set_stagger_tag(&mut self, tag: u32);

    fn is_destroyed(&self) -> bool;

    fn location(&self) -> Vec3;
    fn rotation(&self) -> Quat;

    /// 移动 Actor，返回碰撞（若有）
    fn move_actor(&mut self, delta: Vec3, new_rotation: Quat) -> Option<MoveHit>;

    fn base(&self) -> Option<ActorBase>;
    fn set_base(&mut self, base: Option<ActorBase>);

    /// 以根运动驱动一次物理步进，返回本步实际消耗的位移
    fn perform_physics(&mut self, delta_time: f32, root_motion_delta: Vec3) -> Vec3;

    /// 根运动模式变化通知
    fn root_motion_mode_changed(&mut self, _previous: RootMotionMode, _current: RootMotionMode) {}
}

/// 音频组件（面部动画同步）
pub trait AudioComponent {
    fn play(&mut self);
    fn stop(&mut self);
    fn is_playing(&self) -> bool;
    fn is_finished(&self) -> bool;
    /// 当前播放时间（秒）
    fn playback_time(&self) -> f32;
    fn pitch_multiplier(&self) -> f32;
    fn set_cue(&mut self, cue: &str);
}

/// 提交给渲染线程的一帧
///
/// 数组都是克隆出来的，管线后续修改不会影响已提交的帧。
#[derive(Clone, Debug)]
pub struct RenderFrame {
    pub lod: usize,
    pub space_bases: Vec<BoneAtom>,
    pub active_morphs: Vec<ActiveMorph>,
}

/// 渲染对象
pub trait RenderObject {
    fn update(&mut self, frame: RenderFrame);

    /// 切换实例顶点权重
    fn toggle_vertex_influences(&mut self, _lod: usize, _enabled: bool) {}
}

/// 流送管理器
pub trait StreamingNotifier {
    fn primitive_attached(&mut self, name: &str);
    fn primitive_detached(&mut self, name: &str);
}

/// 射线检测结果
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LineHit {
    pub location: Vec3,
    pub normal: Vec3,
}

/// 腿部射线检测（脚部贴地控制器使用，世界空间）
pub trait LegLineCheck {
    fn leg_line_check(&self, start: Vec3, end: Vec3) -> Option<LineHit>;
}

/// 一次 tick 能用到的宿主服务
#[derive(Default)]
pub struct HostServices<'a> {
    pub owner: Option<&'a mut dyn OwnerActor>,
    pub audio: Option<&'a mut dyn AudioComponent>,
    pub renderer: Option<&'a mut dyn RenderObject>,
    pub streaming: Option<&'a mut dyn StreamingNotifier>,
    pub line_check: Option<&'a dyn LegLineCheck>,
}

impl<'a> HostServices<'a> {
    pub fn owner(&self) -> Option<&dyn OwnerActor> {
        match self.owner.as_ref() {
            Some(owner) => {
                let owner: &dyn OwnerActor = &**owner;
                Some(owner)
            }
            None => None,
        }
    }

    pub fn owner_mut(&mut self) -> Option<&mut dyn OwnerActor> {
        match self.owner.as_mut() {
            Some(owner) => {
                let owner: &mut dyn OwnerActor = &mut **owner;
                Some(owner)
            }
            None => None,
        }
    }

    pub fn audio_mut(&mut self) -> Option<&mut dyn AudioComponent> {
        match self.audio.as_mut() {
            Some(audio) => {
                let audio: &mut dyn AudioComponent = &mut **audio;
                Some(audio)
            }
            None => None,
        }
    }

    pub fn renderer_mut(&mut self) -> Option<&mut dyn RenderObject> {
        match self.renderer.as_mut() {
            Some(renderer) => {
                let renderer: &mut dyn RenderObject = &mut **renderer;
                Some(renderer)
            }
            None => None,
        }
    }

    pub fn streaming_mut(&mut self) -> Option<&mut dyn StreamingNotifier> {
        match self.streaming.as_mut() {
            Some(streaming) => {
                let streaming: &mut dyn StreamingNotifier = &mut **streaming;
                Some(streaming)
            }
            None => None,
        }
    }
}
