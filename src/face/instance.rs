//! 面部动画实例：播放控制、音频同步、骨骼链接与叠加

use std::sync::Arc;

use glam::Quat;

use super::{FaceAnimSdk, FaceBlendMode, FaceBoneLink, FaceGraphEvent, FacePlaybackState};
use crate::context::PipelineContext;
use crate::host::AudioComponent;
use crate::model::MaterialParams;
use crate::morph::{find_in_sets, ActiveMorph, MorphTargetSet};
use crate::skeleton::{BoneAtom, RefSkeleton};
use crate::WarnOnce;

/// 角色实例上的面部动画
pub struct FaceAnimInstance {
    sdk: Box<dyn FaceAnimSdk>,
    pub blend_mode: FaceBlendMode,
    /// 没有播放片段时也 tick SDK
    pub allow_non_anim_tick: bool,
    asset: Option<String>,

    // ========== 骨骼链接 ==========
    bone_links: Vec<FaceBoneLink>,
    /// 上次链接时的骨骼数，变化即重新链接
    linked_bone_count: usize,

    /// 面部图驱动的 Morph，按树 Morph 参与聚合
    face_morphs: Vec<ActiveMorph>,
    has_audio_cue: bool,
    warned: WarnOnce,
}

impl std::fmt::Debug for FaceAnimInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaceAnimInstance")
            .field("blend_mode", &self.blend_mode)
            .field("asset", &self.asset)
            .field("bone_links", &self.bone_links)
            .field("face_morphs", &self.face_morphs.len())
            .finish()
    }
}

impl FaceAnimInstance {
    pub fn new(sdk: Box<dyn FaceAnimSdk>) -> Self {
        Self {
            sdk,
            blend_mode: FaceBlendMode::Additive,
            allow_non_anim_tick: false,
            asset: None,
            bone_links: Vec::new(),
            linked_bone_count: 0,
            face_morphs: Vec::new(),
            has_audio_cue: false,
            warned: WarnOnce::default(),
        }
    }

    pub fn with_blend_mode(mut self, mode: FaceBlendMode) -> Self {
        self.blend_mode = mode;
        self
    }

    /// 绑定面部资产，下次叠加时重新链接骨骼
    pub fn set_actor(&mut self, asset: &str) {
        if self.asset.as_deref() == Some(asset) {
            return;
        }
        self.sdk.set_actor(asset);
        self.asset = Some(asset.to_string());
        self.bone_links.clear();
        self.linked_bone_count = 0;
    }

    pub fn asset(&self) -> Option<&str> {
        self.asset.as_deref()
    }

    pub fn bone_links(&self) -> &[FaceBoneLink] {
        &self.bone_links
    }

    pub fn face_morphs(&self) -> &[ActiveMorph] {
        &self.face_morphs
    }

    // ========== 播放控制 ==========

    /// 播放面部动画；有音频 cue 时先停掉音频并换 cue
    pub fn play_face_anim(
        &mut self,
        group: &str,
        name: &str,
        audio_cue: Option<&str>,
        mut audio: Option<&mut dyn AudioComponent>,
    ) -> bool {
        if let (Some(cue), Some(a)) = (audio_cue, audio.as_mut()) {
            a.stop();
            a.set_cue(cue);
        }
        self.has_audio_cue = audio_cue.is_some();

        if self.sdk.play_anim(group, name) {
            return true;
        }
        log::warn!("[面部动画] 播放失败: {}/{}", group, name);
        self.sdk.stop_anim();
        if let Some(a) = audio.as_mut() {
            a.stop();
        }
        self.has_audio_cue = false;
        false
    }

    pub fn stop_face_anim(&mut self, audio: Option<&mut dyn AudioComponent>) {
        if let Some(a) = audio {
            a.stop();
        }
        self.sdk.stop_anim();
        self.has_audio_cue = false;
    }

    pub fn is_playing_face_anim(&self) -> bool {
        self.sdk.is_playing()
    }

    /// tick SDK 并处理音频同步
    ///
    /// 没有片段在播放且不允许空闲 tick 时直接返回 None。
    pub fn tick(&mut self, ctx: &PipelineContext, mut audio: Option<&mut dyn AudioComponent>) -> Option<FacePlaybackState> {
        let sdk = &mut self.sdk;
        if !ctx.ensure_face_sdk_initialized(|| sdk.initialize()) {
            return None;
        }
        if !self.sdk.is_playing() && !self.allow_non_anim_tick {
            return None;
        }

        // 音频同步偏移：按音调缩放的播放时间
        let audio_offset = match audio.as_ref() {
            Some(a) if a.is_playing() => a.playback_time() * a.pitch_multiplier(),
            _ => -1.0,
        };
        let state = self.sdk.tick(ctx.app_time, audio_offset);
        match state {
            FacePlaybackState::StartAudio => {
                if let Some(a) = audio.as_mut() {
                    a.play();
                }
            }
            FacePlaybackState::Stopped => {
                let audio_done = !self.has_audio_cue || audio.as_ref().map_or(true, |a| a.is_finished());
                if audio_done && self.sdk.is_playing() {
                    self.sdk.stop_anim();
                    self.has_audio_cue = false;
                }
            }
            FacePlaybackState::Playing => {}
        }
        Some(state)
    }

    // ========== 叠加 ==========

    /// 按名字把主骨骼列表链接到骨架，找不到的记为 Absent
    pub fn relink(&mut self, skeleton: &RefSkeleton) {
        let names = self.sdk.master_bone_names();
        self.bone_links = names
            .iter()
            .map(|name| match skeleton.find_bone_by_name(name) {
                Some(index) => FaceBoneLink::Linked(index),
                None => {
                    if self.warned.first(name) {
                        log::warn!("[面部动画] 骨架中找不到面部骨骼 {}", name);
                    }
                    FaceBoneLink::Absent
                }
            })
            .collect();
        self.linked_bone_count = skeleton.bone_count();
    }

    fn needs_relink(&mut self, skeleton: &RefSkeleton) -> bool {
        // 先取走 SDK 的请求，避免下一帧重复链接
        let requested = self.sdk.take_relink_request();
        requested || self.linked_bone_count != skeleton.bone_count() || self.bone_links.is_empty()
    }

    /// 把面部骨骼叠加到局部变换，并处理面部图的 Morph / 材质参数回调
    pub fn apply_overlay(
        &mut self,
        local_atoms: &mut [BoneAtom],
        skeleton: &RefSkeleton,
        morph_sets: &[Arc<MorphTargetSet>],
        params: &mut MaterialParams,
    ) {
        self.sdk.begin_frame();
        if self.needs_relink(skeleton) {
            self.relink(skeleton);
        }

        for (i, link) in self.bone_links.iter().enumerate() {
            let FaceBoneLink::Linked(bone) = *link else {
                continue;
            };
            if bone >= local_atoms.len() {
                continue;
            }
            let Some(sample) = self.sdk.sample_bone(i) else {
                continue;
            };
            let weight = sample.weight.clamp(0.0, 1.0);
            if weight <= 0.0 {
                continue;
            }
            let face = sample.to_engine_atom();
            let local = &mut local_atoms[bone];
            match self.blend_mode {
                FaceBlendMode::Additive => {
                    let reference = match self.sdk.reference_bone(i) {
                        Some(r) => r.to_engine_atom(),
                        None => skeleton.ref_pose(bone),
                    };
                    let delta = scale_delta(&face.delta_from(&reference), weight);
                    local.accumulate_with_additive_scale(&delta);
                }
                FaceBlendMode::Replace => {
                    let target = BoneAtom::new(face.rotation, face.translation, local.scale);
                    if weight >= 1.0 {
                        *local = target;
                    } else {
                        local.blend_with(&target, weight);
                    }
                    local.normalize_rotation();
                }
            }
        }

        self.face_morphs.clear();
        for event in self.sdk.drain_graph_events() {
            match event {
                FaceGraphEvent::Morph { name, weight } => {
                    let Some(target) = find_in_sets(morph_sets, &name) else {
                        if self.warned.first(&format!("morph:{}", name)) {
                            log::warn!("[面部动画] 找不到面部 Morph {}", name);
                        }
                        continue;
                    };
                    match self.face_morphs.iter_mut().find(|m| m.same_target(&target)) {
                        Some(existing) => existing.weight = weight,
                        None => self.face_morphs.push(ActiveMorph::new(target, weight)),
                    }
                }
                FaceGraphEvent::MaterialParam { slot, name, value } => {
                    params.set_scalar(slot, &name, value);
                }
            }
        }

        self.sdk.end_frame();
    }
}

/// 按权重缩放叠加差量
fn scale_delta(delta: &BoneAtom, weight: f32) -> BoneAtom {
    if weight >= 1.0 {
        return *delta;
    }
    BoneAtom::new(
        Quat::IDENTITY.slerp(delta.rotation, weight),
        delta.translation * weight,
        delta.scale * weight,
    )
}
