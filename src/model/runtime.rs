//! 角色实例运行时
//!
//! `SkeletalInstance` 串起每帧的完整管线：
//! Tick 判定 → 节点 tick → 面部 tick → 必需骨骼 → 姿态求值 → 根运动
//! → 面部叠加 → Morph 聚合 → 合成（含物理混入）→ 缓存 / 插值 → 提交渲染。

use std::sync::Arc;

use glam::Vec3;
use rayon::prelude::*;

use super::{MaterialParams, SkeletalMesh};
use crate::animation::{AnimTree, EvalContext, PoseOutput};
use crate::context::PipelineContext;
use crate::controls::ControlEnv;
use crate::face::FaceAnimInstance;
use crate::host::{AudioComponent, HostServices, RenderFrame, RenderObject, StreamingNotifier};
use crate::morph::{ActiveMorph, MorphManager};
use crate::physics::{PhysicsAsset, PhysicsBlend, PhysicsPoseSource};
use crate::root_motion::RootMotionState;
use crate::skeleton::{
    build_compose_passes, compose_skeleton, rebuild_visibility, recalc_required_bones, BoneAtom, BoneVisibility,
    ComposeOptions, ComposeOrder, PoseBuffers, RefSkeleton, RequiredBonesInputs,
};
use crate::tick::{TickController, TickInputs};
use crate::{Result, SkelError, WarnOnce};

/// 每个实例的可调参数
#[derive(Clone, Debug)]
pub struct InstanceSettings {
    /// 不可见时的骨骼求值帧率（跳帧率），0 表示不限制
    pub low_update_frame_rate: u32,
    /// 动画 LOD 帧率（跳帧率）
    pub anim_lod_frame_rate: u32,
    /// 距离因子低于此值时启用动画 LOD 帧率
    pub anim_lod_distance_factor: f32,

    // ========== 不可见时 ==========
    pub update_morphs_when_not_rendered: bool,
    pub update_skel_when_not_rendered: bool,
    pub tick_anim_nodes_when_not_rendered: bool,
    pub ignore_controllers_when_not_rendered: bool,

    /// 输出参考姿态，忽略动画树
    pub force_refpose: bool,
    /// 提取根运动后把根骨骼局部变换重置为单位变换
    pub force_discard_root_motion: bool,

    // ========== 物理 ==========
    /// 物理姿态混入权重 [0, 1]
    pub physics_weight: f32,
    pub update_kinematic_bones_from_animation: bool,

    /// Accel 模式下根运动的逐轴缩放
    pub root_motion_accel_scale: Vec3,
    /// LOD 带替代顶点权重时使用替代必需骨骼
    pub always_use_instance_weights: bool,

    // ========== 面部动画 ==========
    pub enable_face_animation: bool,
    pub allow_face_anim_non_anim_tick: bool,
    /// detach 后保留面部动画实例
    pub keep_face_instance_on_detach: bool,
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            // ====== 跳帧 ======
            // 0 = 不额外限制骨骼求值帧率
            low_update_frame_rate: 0,
            anim_lod_frame_rate: 0,
            anim_lod_distance_factor: 0.0,

            // ====== 不可见时 ======
            // 不可见时默认不更新 Morph，但仍然更新骨骼（挂件、碰撞依赖它）
            update_morphs_when_not_rendered: false,
            update_skel_when_not_rendered: true,
            tick_anim_nodes_when_not_rendered: true,
            ignore_controllers_when_not_rendered: false,

            force_refpose: false,
            force_discard_root_motion: false,

            // ====== 物理 ======
            // 0 = 纯动画驱动
            physics_weight: 0.0,
            update_kinematic_bones_from_animation: true,

            root_motion_accel_scale: Vec3::ONE,
            always_use_instance_weights: false,

            // ====== 面部动画 ======
            enable_face_animation: true,
            allow_face_anim_non_anim_tick: false,
            keep_face_instance_on_detach: false,
        }
    }
}

/// 角色实例
pub struct SkeletalInstance {
    pub name: String,
    mesh: Option<Arc<SkeletalMesh>>,
    tree: Option<AnimTree>,
    pub settings: InstanceSettings,

    // ========== 姿态 ==========
    /// 当前显示的姿态
    pose: PoseBuffers,
    /// 最近一次完整求值的姿态（跳帧复用 / 插值目标）
    cache: PoseBuffers,
    cache_valid: bool,
    /// 首次合成忽略控制器（数组刚分配，控制器读到的是参考姿态）
    first_compose: bool,

    // ========== 必需骨骼 ==========
    visibility: Vec<BoneVisibility>,
    required_bones: Vec<usize>,
    /// 按骨骼索引标记是否必需，插值时使用
    required_mask: Vec<bool>,
    compose_order: ComposeOrder,
    required_bones_dirty: bool,

    // ========== LOD ==========
    predicted_lod: usize,
    forced_lod: Option<usize>,
    current_lod: usize,

    // ========== 宿主写入的帧状态 ==========
    pub recently_rendered: bool,
    pub distance_factor: f32,
    /// 组件到世界的变换
    pub local_to_world: BoneAtom,

    tick_controller: TickController,
    root_motion: RootMotionState,
    morph_manager: MorphManager,
    material_params: MaterialParams,
    face: Option<FaceAnimInstance>,

    // ========== 物理 ==========
    physics_asset: Option<Arc<PhysicsAsset>>,
    physics_blend: PhysicsBlend,
    physics_source: Option<Box<dyn PhysicsPoseSource>>,

    warned: WarnOnce,
}

impl std::fmt::Debug for SkeletalInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkeletalInstance")
            .field("name", &self.name)
            .field("mesh", &self.mesh.as_ref().map(|m| m.name.as_str()))
            .field("lod", &self.current_lod)
            .field("required_bones", &self.required_bones.len())
            .field("cache_valid", &self.cache_valid)
            .field("has_physics_source", &self.physics_source.is_some())
            .finish()
    }
}

impl SkeletalInstance {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mesh: None,
            tree: None,
            settings: InstanceSettings::default(),
            pose: PoseBuffers::default(),
            cache: PoseBuffers::default(),
            cache_valid: false,
            first_compose: true,
            visibility: Vec::new(),
            required_bones: Vec::new(),
            required_mask: Vec::new(),
            compose_order: ComposeOrder::default(),
            required_bones_dirty: true,
            predicted_lod: 0,
            forced_lod: None,
            current_lod: 0,
            recently_rendered: true,
            distance_factor: 1.0,
            local_to_world: BoneAtom::IDENTITY,
            tick_controller: TickController::new(),
            root_motion: RootMotionState::new(),
            morph_manager: MorphManager::new(),
            material_params: MaterialParams::new(),
            face: None,
            physics_asset: None,
            physics_blend: PhysicsBlend::default(),
            physics_source: None,
            warned: WarnOnce::default(),
        }
    }

    // ========== 生命周期 ==========

    /// 绑定网格和动画树
    ///
    /// 动画树从模板深拷贝；已绑定时先解除旧的绑定。
    pub fn attach(
        &mut self,
        mesh: Arc<SkeletalMesh>,
        template: Option<&AnimTree>,
        settings: InstanceSettings,
        streaming: Option<&mut dyn StreamingNotifier>,
    ) -> Result<()> {
        if mesh.lod_models.is_empty() {
            return Err(SkelError::InvalidLod(0));
        }
        let skeleton = &mesh.skeleton;

        let tree = match template {
            Some(template) => {
                let mut tree = template.clone();
                tree.finalize()?;
                let anim_sets = tree.anim_sets().clone();
                tree.init_tree(skeleton, anim_sets);
                tree.morph_graph.link_targets(&mesh.morph_sets);
                Some(tree)
            }
            None => None,
        };

        let was_attached = self.mesh.is_some();
        if was_attached {
            log::debug!("[实例] {} 重新绑定到 {}", self.name, mesh.name);
        }

        self.pose = PoseBuffers::from_ref_pose(skeleton);
        self.cache = PoseBuffers::from_ref_pose(skeleton);
        self.cache_valid = false;
        self.first_compose = true;
        self.visibility = vec![BoneVisibility::Visible; skeleton.bone_count()];
        self.required_bones.clear();
        self.required_mask.clear();
        self.compose_order = ComposeOrder::default();
        self.required_bones_dirty = true;
        self.current_lod = self.effective_lod(mesh.lod_count());
        self.morph_manager.clear();
        self.root_motion.reset();
        self.tick_controller = TickController::new();
        self.physics_blend = match &self.physics_asset {
            Some(asset) => PhysicsBlend::new(asset, skeleton),
            None => PhysicsBlend::default(),
        };

        if let Some(face) = self.face.as_mut() {
            face.allow_non_anim_tick = settings.allow_face_anim_non_anim_tick;
            if settings.enable_face_animation {
                if let Some(asset) = &mesh.face_asset {
                    face.set_actor(asset);
                }
            }
        }

        self.tree = tree;
        self.settings = settings;
        self.mesh = Some(mesh);

        if let Some(streaming) = streaming {
            if was_attached {
                streaming.primitive_detached(&self.name);
            }
            streaming.primitive_attached(&self.name);
        }
        log::debug!("[实例] {} 已绑定", self.name);
        Ok(())
    }

    /// 解除绑定，清空缓存、Morph 和根运动累积量
    pub fn detach(&mut self, streaming: Option<&mut dyn StreamingNotifier>) {
        if self.mesh.take().is_none() {
            return;
        }
        self.tree = None;
        self.pose = PoseBuffers::default();
        self.cache = PoseBuffers::default();
        self.cache_valid = false;
        self.visibility.clear();
        self.required_bones.clear();
        self.required_mask.clear();
        self.compose_order = ComposeOrder::default();
        self.required_bones_dirty = true;
        self.morph_manager.clear();
        self.material_params.clear();
        self.root_motion.reset();
        self.tick_controller = TickController::new();
        self.physics_blend = PhysicsBlend::default();
        if !self.settings.keep_face_instance_on_detach {
            self.face = None;
        }
        self.warned.clear();

        if let Some(streaming) = streaming {
            streaming.primitive_detached(&self.name);
        }
        log::debug!("[实例] {} 已解除绑定", self.name);
    }

    pub fn is_attached(&self) -> bool {
        self.mesh.is_some()
    }

    /// 设置物理资产和姿态来源，必需骨骼随之重建
    pub fn set_physics(&mut self, asset: Arc<PhysicsAsset>, source: Option<Box<dyn PhysicsPoseSource>>) {
        self.physics_blend = match &self.mesh {
            Some(mesh) => PhysicsBlend::new(&asset, &mesh.skeleton),
            None => PhysicsBlend::default(),
        };
        self.physics_asset = Some(asset);
        self.physics_source = source;
        self.required_bones_dirty = true;
    }

    pub fn clear_physics(&mut self) {
        self.physics_asset = None;
        self.physics_source = None;
        self.physics_blend = PhysicsBlend::default();
        self.required_bones_dirty = true;
    }

    pub fn set_face_instance(&mut self, mut face: FaceAnimInstance) {
        face.allow_non_anim_tick = self.settings.allow_face_anim_non_anim_tick;
        if let Some(asset) = self.mesh.as_ref().and_then(|m| m.face_asset.as_deref()) {
            if self.settings.enable_face_animation {
                face.set_actor(asset);
            }
        }
        self.face = Some(face);
    }

    // ========== LOD / 可见性 ==========

    /// 渲染端预测的 LOD
    pub fn set_lod(&mut self, lod: usize) {
        self.predicted_lod = lod;
    }

    /// 强制 LOD；`None` 取消
    pub fn set_forced_lod(&mut self, lod: Option<usize>) -> Result<()> {
        if let (Some(lod), Some(mesh)) = (lod, &self.mesh) {
            if lod >= mesh.lod_count() {
                return Err(SkelError::InvalidLod(lod));
            }
        }
        self.forced_lod = lod;
        Ok(())
    }

    /// 当前生效的 LOD
    pub fn lod(&self) -> usize {
        self.current_lod
    }

    fn effective_lod(&self, lod_count: usize) -> usize {
        self.forced_lod.unwrap_or(self.predicted_lod).min(lod_count.saturating_sub(1))
    }

    pub fn hide_bone_by_name(&mut self, bone_name: &str) -> Result<()> {
        self.set_bone_hidden(bone_name, true)
    }

    pub fn unhide_bone_by_name(&mut self, bone_name: &str) -> Result<()> {
        self.set_bone_hidden(bone_name, false)
    }

    fn set_bone_hidden(&mut self, bone_name: &str, hidden: bool) -> Result<()> {
        let mesh = self.mesh.as_ref().ok_or_else(|| SkelError::BoneNotFound(bone_name.to_string()))?;
        let bone = mesh
            .skeleton
            .find_bone_by_name(bone_name)
            .ok_or_else(|| SkelError::BoneNotFound(bone_name.to_string()))?;
        if bone >= self.visibility.len() {
            return Err(SkelError::BoneNotFound(bone_name.to_string()));
        }
        self.visibility[bone] = if hidden {
            BoneVisibility::ExplicitlyHidden
        } else {
            BoneVisibility::Visible
        };
        rebuild_visibility(&mut self.visibility, &mesh.skeleton);
        self.required_bones_dirty = true;
        Ok(())
    }

    pub fn bone_visibility(&self) -> &[BoneVisibility] {
        &self.visibility
    }

    // ========== 查询 ==========

    pub fn mesh(&self) -> Option<&Arc<SkeletalMesh>> {
        self.mesh.as_ref()
    }

    pub fn tree(&self) -> Option<&AnimTree> {
        self.tree.as_ref()
    }

    pub fn tree_mut(&mut self) -> Option<&mut AnimTree> {
        self.tree.as_mut()
    }

    pub fn local_atoms(&self) -> &[BoneAtom] {
        &self.pose.local_atoms
    }

    pub fn space_bases(&self) -> &[BoneAtom] {
        &self.pose.space_bases
    }

    pub fn cached_local_atoms(&self) -> &[BoneAtom] {
        &self.cache.local_atoms
    }

    pub fn cached_space_bases(&self) -> &[BoneAtom] {
        &self.cache.space_bases
    }

    pub fn required_bones(&self) -> &[usize] {
        &self.required_bones
    }

    pub fn compose_order(&self) -> &ComposeOrder {
        &self.compose_order
    }

    pub fn active_morphs(&self) -> &[ActiveMorph] {
        self.morph_manager.active_morphs()
    }

    pub fn material_params(&self) -> &MaterialParams {
        &self.material_params
    }

    pub fn root_motion(&self) -> &RootMotionState {
        &self.root_motion
    }

    pub fn root_motion_mut(&mut self) -> &mut RootMotionState {
        &mut self.root_motion
    }

    pub fn tick_controller(&self) -> &TickController {
        &self.tick_controller
    }

    pub fn physics_source(&self) -> Option<&dyn PhysicsPoseSource> {
        self.physics_source.as_deref()
    }

    pub fn has_had_physics_blended_in(&self) -> bool {
        self.physics_blend.has_had_physics_blended_in()
    }

    /// 挂点的组件空间变换
    pub fn socket_transform(&self, socket_name: &str) -> Option<BoneAtom> {
        let mesh = self.mesh.as_ref()?;
        let socket = mesh.find_socket(socket_name)?;
        let bone = mesh.skeleton.find_bone_by_name(&socket.bone_name)?;
        let space = self.pose.space_bases.get(bone)?;
        Some(socket.relative * *space)
    }

    // ========== 面部动画 ==========

    pub fn play_face_anim(
        &mut self,
        group: &str,
        name: &str,
        audio_cue: Option<&str>,
        audio: Option<&mut dyn AudioComponent>,
    ) -> bool {
        match self.face.as_mut() {
            Some(face) => face.play_face_anim(group, name, audio_cue, audio),
            None => {
                if self.warned.first("face:none") {
                    log::warn!("[面部动画] {} 没有面部动画实例", self.name);
                }
                false
            }
        }
    }

    pub fn stop_face_anim(&mut self, audio: Option<&mut dyn AudioComponent>) {
        if let Some(face) = self.face.as_mut() {
            face.stop_face_anim(audio);
        }
    }

    pub fn is_playing_face_anim(&self) -> bool {
        self.face.as_ref().map_or(false, |f| f.is_playing_face_anim())
    }

    pub fn face_instance(&self) -> Option<&FaceAnimInstance> {
        self.face.as_ref()
    }

    // ========== 每帧 ==========

    /// 每帧 tick
    ///
    /// 只有拥有者已销毁时返回 `InstanceDestroyed`；求值中的问题都在本地恢复。
    pub fn tick(&mut self, ctx: &mut PipelineContext, host: &mut HostServices, delta_time: f32) -> Result<()> {
        let Some(mesh) = self.mesh.clone() else {
            return Ok(());
        };
        if host.owner().map_or(false, |o| o.is_destroyed()) {
            return Err(SkelError::InstanceDestroyed);
        }

        self.physics_blend.begin_tick();

        // 同一 owner 的实例共享错峰标签
        let stagger_tag = match host.owner_mut() {
            Some(owner) => {
                if owner.stagger_tag() == 0 {
                    let tag = ctx.allocate_stagger_tag();
                    owner.set_stagger_tag(tag);
                }
                owner.stagger_tag()
            }
            None => 0,
        };

        let inputs = TickInputs {
            recently_rendered: self.recently_rendered,
            distance_factor: self.distance_factor,
            owner_role: host.owner().map(|o| o.role()),
            root_motion_active: self.root_motion.is_active(),
            low_update_frame_rate: self.settings.low_update_frame_rate,
            anim_lod_frame_rate: self.settings.anim_lod_frame_rate,
            anim_lod_distance_factor: self.settings.anim_lod_distance_factor,
            stagger_tag,
        };
        let decision = self.tick_controller.update(ctx, &inputs);

        let arrays_sized = self.arrays_sized(&mesh.skeleton);
        let required_up_to_date =
            !self.required_bones_dirty && self.current_lod == self.effective_lod(mesh.lod_count());
        if TickController::should_bypass_component(&decision, self.recently_rendered, required_up_to_date, arrays_sized)
        {
            self.tick_controller.drop_component_tick(delta_time);
            return Ok(());
        }
        let delta_time = self.tick_controller.take_component_delta(delta_time);

        // ========== 节点 tick ==========
        if self.recently_rendered || self.settings.tick_anim_nodes_when_not_rendered {
            if let Some(node_dt) = self.tick_controller.node_tick_delta(delta_time, decision.skip_tick_anim_nodes) {
                if let Some(tree) = self.tree.as_mut() {
                    tree.tick(node_dt, &mesh.skeleton, ctx.zero_weight());
                }
            }
        }

        // ========== 面部 tick ==========
        if self.settings.enable_face_animation {
            if let Some(face) = self.face.as_mut() {
                face.tick(ctx, host.audio_mut());
            }
        }

        if !self.recently_rendered && !self.settings.update_skel_when_not_rendered {
            return Ok(());
        }
        self.update_skel_pose(ctx, host, delta_time)?;

        if let Some(renderer) = host.renderer_mut() {
            self.submit_render_frame(renderer);
        }
        Ok(())
    }

    /// 骨骼求值（tick 的后半段）
    ///
    /// 同一 tick 内可以被再次调用（挂件更新等）。物理已经混入时保留混入后的姿态，
    /// 不再重新求值。
    /// `ctx.post_tick_component_update` 为 true 时只做运动学推送和物理步进。
    pub fn update_skel_pose(&mut self, ctx: &PipelineContext, host: &mut HostServices, delta_time: f32) -> Result<()> {
        let Some(mesh) = self.mesh.clone() else {
            return Ok(());
        };
        let skeleton = &mesh.skeleton;

        if !self.arrays_sized(skeleton) {
            log::debug!("[实例] {} 骨骼数组重新分配", self.name);
            self.pose = PoseBuffers::from_ref_pose(skeleton);
            self.cache = PoseBuffers::from_ref_pose(skeleton);
            self.cache_valid = false;
            self.first_compose = true;
            self.required_bones_dirty = true;
        }
        if self.visibility.len() != skeleton.bone_count() {
            self.visibility = vec![BoneVisibility::Visible; skeleton.bone_count()];
            self.required_bones_dirty = true;
        }

        let lod = self.effective_lod(mesh.lod_count());
        if lod != self.current_lod {
            if ctx.config.log_lod_changes {
                log::info!("[LOD] {} LOD {} -> {}", self.name, self.current_lod, lod);
            }
            self.current_lod = lod;
            self.required_bones_dirty = true;
        }
        if self.required_bones_dirty {
            self.rebuild_required_bones(ctx, &mesh, host.renderer_mut());
        }

        if ctx.post_tick_component_update {
            self.push_kinematic_bodies(delta_time);
            return Ok(());
        }

        if self.physics_blend.has_had_physics_blended_in() {
            log::debug!("[实例] {} 本 tick 已混入物理，保留当前姿态", self.name);
            return Ok(());
        }

        let decision = self.tick_controller.last_decision;

        // ========== 跳帧：复用缓存 ==========
        if decision.skip_get_bone_atoms && self.cache_valid {
            if decision.interpolate_bone_atoms {
                let alpha = decision.interpolation_alpha();
                interpolate_toward(&mut self.pose.local_atoms, &self.cache.local_atoms, &self.required_mask, alpha);
                interpolate_toward(&mut self.pose.space_bases, &self.cache.space_bases, &self.required_mask, alpha);
            }
            return Ok(());
        }

        // ========== 姿态求值 ==========
        let simulating = self.physics_source.as_ref().map_or(false, |s| s.is_simulating());
        let output = match self.tree.as_mut() {
            Some(tree) if !self.settings.force_refpose => {
                let physics_pose = if simulating {
                    Some(self.pose.space_bases.as_slice())
                } else {
                    None
                };
                tree.evaluate(&EvalContext {
                    skeleton,
                    required_bones: &self.required_bones,
                    mirror_table: &mesh.mirror_table,
                    physics_pose,
                    zero_weight: ctx.zero_weight(),
                })
            }
            _ => PoseOutput::ref_pose(skeleton),
        };

        // ========== 根运动 ==========
        self.root_motion.root_bone_translation = output.atoms.first().map_or(Vec3::ZERO, |a| a.translation);
        self.root_motion.accel_scale = self.settings.root_motion_accel_scale;
        let result = self.root_motion.process(
            &output.root_motion_delta,
            output.has_root_motion,
            &self.local_to_world,
            delta_time,
            host.owner_mut(),
        );
        if result.owner_destroyed {
            log::debug!("[实例] {} 根运动处理期间拥有者被销毁", self.name);
            return Err(SkelError::InstanceDestroyed);
        }

        // 插值时在缓存上求新姿态，显示姿态留在另一侧
        let interpolate = decision.interpolate_bone_atoms && self.cache_valid;
        if interpolate {
            std::mem::swap(&mut self.pose, &mut self.cache);
        }

        for &bone in &self.required_bones {
            if let Some(atom) = output.atoms.get(bone) {
                self.pose.local_atoms[bone] = *atom;
            }
        }
        if self.settings.force_discard_root_motion {
            if let Some(root) = self.pose.local_atoms.first_mut() {
                *root = BoneAtom::IDENTITY;
            }
        }

        // ========== 面部叠加 ==========
        // 先于 Morph 聚合，面部图的 Morph 在同一帧生效
        if self.settings.enable_face_animation {
            if let Some(face) = self.face.as_mut() {
                face.apply_overlay(&mut self.pose.local_atoms, skeleton, &mesh.morph_sets, &mut self.material_params);
            }
        }

        // ========== Morph ==========
        let skip_morphs =
            self.settings.force_refpose || (!self.recently_rendered && !self.settings.update_morphs_when_not_rendered);
        if skip_morphs {
            self.morph_manager.clear();
        } else {
            let min_weight = ctx.config.min_morph_blend_weight;
            self.morph_manager.apply_curve_keys(
                &output.curve_keys,
                &mesh.morph_sets,
                &mut self.material_params,
                min_weight,
                &mut self.warned,
            );
            let mut tree_morphs = match self.tree.as_mut() {
                Some(tree) => {
                    tree.morph_graph.update_bone_angles(&self.pose.space_bases, &mut self.material_params);
                    tree.active_morphs(min_weight)
                }
                None => Vec::new(),
            };
            if let Some(face) = &self.face {
                tree_morphs.extend_from_slice(face.face_morphs());
            }
            self.morph_manager.update_active_morphs(&tree_morphs, &mut self.warned);
        }

        // ========== 合成 ==========
        let ignore_controllers = self.first_compose
            || (!self.recently_rendered && self.settings.ignore_controllers_when_not_rendered);
        let env = ControlEnv {
            local_to_world: self.local_to_world,
            line_check: host.line_check,
        };
        let blend_physics = simulating && self.settings.physics_weight > 0.0;
        let mut options = ComposeOptions {
            lod: self.current_lod,
            recently_rendered: self.recently_rendered,
            ignore_controllers,
            run_pre_physics: true,
            run_post_physics: !blend_physics,
            zero_weight_thresh: ctx.zero_weight(),
            mesh_name: &mesh.name,
        };
        compose_skeleton(
            &mut self.pose,
            skeleton,
            &self.compose_order.bones,
            &self.visibility,
            self.tree.as_mut().map(|t| &mut t.skel_controls),
            &options,
            &env,
        );

        if blend_physics {
            if let (Some(asset), Some(source)) = (&self.physics_asset, &self.physics_source) {
                self.physics_blend.blend_in_physics(
                    &**source,
                    asset,
                    skeleton,
                    &mut self.pose,
                    &self.required_bones,
                    &self.local_to_world,
                    self.settings.physics_weight,
                );
            }
            options.run_pre_physics = false;
            options.run_post_physics = true;
            compose_skeleton(
                &mut self.pose,
                skeleton,
                &self.compose_order.bones,
                &self.visibility,
                self.tree.as_mut().map(|t| &mut t.skel_controls),
                &options,
                &env,
            );
        }
        self.first_compose = false;

        // ========== 缓存 / 插值 ==========
        if interpolate {
            std::mem::swap(&mut self.pose, &mut self.cache);
            let alpha = decision.interpolation_alpha();
            interpolate_toward(&mut self.pose.local_atoms, &self.cache.local_atoms, &self.required_mask, alpha);
            interpolate_toward(&mut self.pose.space_bases, &self.cache.space_bases, &self.required_mask, alpha);
            self.cache_valid = true;
        } else if decision.effective_node_skip_rate > 1 || decision.effective_bone_skip_rate > 1 {
            self.cache.clone_from(&self.pose);
            self.cache_valid = true;
        } else {
            self.cache_valid = false;
        }
        Ok(())
    }

    fn arrays_sized(&self, skeleton: &RefSkeleton) -> bool {
        let count = skeleton.bone_count();
        self.pose.local_atoms.len() == count && self.pose.space_bases.len() == count
    }

    fn rebuild_required_bones(
        &mut self,
        ctx: &PipelineContext,
        mesh: &SkeletalMesh,
        renderer: Option<&mut dyn RenderObject>,
    ) {
        let skeleton = &mesh.skeleton;
        let lod = self.current_lod.min(mesh.lod_count().saturating_sub(1));
        let Some(model) = mesh.lod_models.get(lod) else {
            return;
        };
        let use_instance_weights = self.settings.always_use_instance_weights && model.has_alt_weights();
        let physics_bones = self
            .physics_asset
            .as_ref()
            .map(|asset| asset.bone_indices(skeleton))
            .unwrap_or_default();

        self.required_bones = recalc_required_bones(
            skeleton,
            &RequiredBonesInputs {
                lod_required: model.required_bones_for(use_instance_weights),
                visibility: &self.visibility,
                physics_bones: &physics_bones,
                per_poly_bones: &mesh.per_poly_bones,
                mirror_table: &mesh.mirror_table,
            },
        );
        if model.has_alt_weights() {
            if let Some(renderer) = renderer {
                renderer.toggle_vertex_influences(lod, use_instance_weights);
            }
        }

        let (pre_pass, post_pass) = match &self.tree {
            Some(tree) => (tree.pre_pass_bone_names.as_slice(), tree.post_pass_bone_names.as_slice()),
            None => (&[][..], &[][..]),
        };
        self.compose_order = build_compose_passes(skeleton, &self.required_bones, pre_pass, post_pass);

        self.required_mask.clear();
        self.required_mask.resize(skeleton.bone_count(), false);
        for &bone in &self.required_bones {
            self.required_mask[bone] = true;
        }
        self.required_bones_dirty = false;
        // 缓存里的骨骼集合与新的必需骨骼不一致
        self.cache_valid = false;

        if ctx.config.log_lod_changes {
            log::info!(
                "[必需骨骼] {} LOD {} 共 {} 根骨骼",
                self.name,
                lod,
                self.required_bones.len()
            );
        }
    }

    /// 组件 tick 之后的物理汇合点
    fn push_kinematic_bodies(&mut self, delta_time: f32) {
        let (Some(asset), Some(source)) = (&self.physics_asset, self.physics_source.as_mut()) else {
            return;
        };
        if !source.is_simulating() && self.settings.update_kinematic_bones_from_animation {
            let pushed = self
                .physics_blend
                .update_kinematic_bodies(&mut **source, asset, &self.pose, &self.local_to_world);
            log::trace!("[物理] {} 推送 {} 个运动学刚体", self.name, pushed);
        }
        source.advance(delta_time);
    }

    /// 提交给渲染对象的数据都是克隆，之后修改实时数组不影响渲染线程
    fn submit_render_frame(&self, renderer: &mut dyn RenderObject) {
        renderer.update(RenderFrame {
            lod: self.current_lod,
            space_bases: self.pose.space_bases.clone(),
            active_morphs: self.morph_manager.active_morphs().to_vec(),
        });
    }
}

/// 必需骨骼从当前值向目标线性插值
fn interpolate_toward(live: &mut [BoneAtom], target: &[BoneAtom], required_mask: &[bool], alpha: f32) {
    live.par_iter_mut()
        .zip(target.par_iter())
        .zip(required_mask.par_iter())
        .for_each(|((atom, target), &required)| {
            if required {
                atom.blend_with(target, alpha);
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::animation::{AnimNodeKind, AnimSequence, AnimSet, AnimSetList, BoneKey, BoneTrack, SequencePlayer};
    use crate::config::AnimConfig;
    use crate::model::{LodModel, Socket};
    use crate::physics::{BodySetup, RapierBodies};
    use crate::test_util::{two_bone_skeleton, TestOwner};
    use crate::skeleton::RefBone;
    use glam::Quat;
    use std::f32::consts::FRAC_PI_2;

    /// root → b1 → b2 → b3，每节沿 X 轴 10
    fn chain_skeleton() -> RefSkeleton {
        let t = BoneAtom::from_translation(Vec3::new(10.0, 0.0, 0.0));
        RefSkeleton::new(vec![
            RefBone::new("root", 0, BoneAtom::IDENTITY),
            RefBone::new("b1", 0, t),
            RefBone::new("b2", 1, t),
            RefBone::new("b3", 2, t),
        ])
        .unwrap()
    }

    fn anim_sets() -> AnimSetList {
        let offset = Vec3::new(10.0, 0.0, 0.0);
        let mut set = AnimSet::new("test");
        set.add_sequence(AnimSequence::new("turn", 1.0).with_track(BoneTrack::new(
            "child",
            vec![
                BoneKey::new(0.0, offset, Quat::from_rotation_z(FRAC_PI_2)),
                BoneKey::new(1.0, offset, Quat::from_rotation_z(FRAC_PI_2)),
            ],
        )));
        set.add_sequence(AnimSequence::new("sweep", 1.0).with_track(BoneTrack::new(
            "child",
            vec![
                BoneKey::new(0.0, offset, Quat::IDENTITY),
                BoneKey::new(1.0, offset, Quat::from_rotation_z(FRAC_PI_2)),
            ],
        )));
        set.add_sequence(AnimSequence::new("bend", 1.0).with_track(BoneTrack::new(
            "b2",
            vec![
                BoneKey::new(0.0, offset, Quat::IDENTITY),
                BoneKey::new(1.0, offset, Quat::from_rotation_z(FRAC_PI_2)),
            ],
        )));
        let mut sets = AnimSetList::new();
        sets.push(set);
        sets
    }

    fn single_player_tree(anim: &str) -> AnimTree {
        let mut tree = AnimTree::new();
        let mut player = SequencePlayer::new(anim);
        player.play_anim(true, 1.0, 0.0);
        let root = tree.add_node(anim, AnimNodeKind::SequencePlayer(player));
        tree.set_root(root);
        tree.set_anim_sets(anim_sets());
        tree
    }

    fn two_bone_mesh() -> Arc<SkeletalMesh> {
        let mesh = SkeletalMesh::new("two_bone", two_bone_skeleton(), vec![LodModel::new(vec![0, 1])])
            .unwrap()
            .with_socket(Socket::new("tip", "child", BoneAtom::from_translation(Vec3::new(5.0, 0.0, 0.0))));
        Arc::new(mesh)
    }

    fn attached(mesh: Arc<SkeletalMesh>, anim: &str) -> SkeletalInstance {
        let mut instance = SkeletalInstance::new("instance");
        instance
            .attach(mesh, Some(&single_player_tree(anim)), InstanceSettings::default(), None)
            .unwrap();
        instance
    }

    fn ctx() -> PipelineContext {
        PipelineContext::with_config(AnimConfig::default())
    }

    #[derive(Default)]
    struct TestRenderer {
        frames: Vec<RenderFrame>,
    }

    impl RenderObject for TestRenderer {
        fn update(&mut self, frame: RenderFrame) {
            self.frames.push(frame);
        }
    }

    #[derive(Default)]
    struct TestStreaming {
        attached: Vec<String>,
        detached: Vec<String>,
    }

    impl StreamingNotifier for TestStreaming {
        fn primitive_attached(&mut self, name: &str) {
            self.attached.push(name.to_string());
        }

        fn primitive_detached(&mut self, name: &str) {
            self.detached.push(name.to_string());
        }
    }

    #[test]
    fn test_two_bone_single_animation() {
        let mut instance = attached(two_bone_mesh(), "turn");
        let mut c = ctx();
        instance.tick(&mut c, &mut HostServices::default(), 1.0 / 30.0).unwrap();

        let space = instance.space_bases();
        assert!(space[0].equals(&BoneAtom::IDENTITY, 1.0e-5));
        assert!((space[1].translation - Vec3::new(10.0, 0.0, 0.0)).length() < 1.0e-4);
        assert!(space[1].rotation.dot(Quat::from_rotation_z(FRAC_PI_2)).abs() > 0.9999);
        for &bone in instance.required_bones() {
            assert!((space[bone].rotation.length() - 1.0).abs() < 1.0e-4);
        }
    }

    #[test]
    fn test_lod_drop_leaves_removed_bone_stale() {
        let mesh = SkeletalMesh::new(
            "chain",
            chain_skeleton(),
            vec![LodModel::new(vec![0, 1, 2, 3]), LodModel::new(vec![0, 1, 2])],
        )
        .unwrap();
        let mut instance = attached(Arc::new(mesh), "bend");
        let mut c = ctx();
        instance.tick(&mut c, &mut HostServices::default(), 0.1).unwrap();
        assert_eq!(instance.required_bones(), &[0, 1, 2, 3]);
        let stale = instance.space_bases()[3];
        let before_b2 = instance.space_bases()[2];

        instance.set_lod(1);
        instance.tick(&mut c, &mut HostServices::default(), 0.3).unwrap();
        assert_eq!(instance.lod(), 1);
        assert_eq!(instance.required_bones(), &[0, 1, 2]);
        assert_eq!(instance.compose_order().bones, vec![0, 1, 2]);
        assert_eq!(instance.space_bases()[3], stale);
        assert!(!instance.space_bases()[2].equals(&before_b2, 1.0e-4));
        assert!(instance.space_bases().iter().all(|a| !a.contains_nan()));
        assert!(instance.local_atoms().iter().all(|a| !a.contains_nan()));
    }

    #[test]
    fn test_forced_lod_out_of_range() {
        let mut instance = attached(two_bone_mesh(), "turn");
        assert!(matches!(instance.set_forced_lod(Some(3)), Err(SkelError::InvalidLod(3))));
        assert!(instance.set_forced_lod(Some(0)).is_ok());
        assert!(instance.set_forced_lod(None).is_ok());
    }

    #[test]
    fn test_skip_frames_interpolate_toward_cache() {
        let mut instance = attached(two_bone_mesh(), "sweep");
        instance.distance_factor = 0.01;
        let mut c = ctx();
        let alpha = 0.25 + 1.0 / 6.0;
        let mut host = HostServices::default();

        // 第 1 帧：缓存无效，完整求值
        instance.tick(&mut c, &mut host, 0.1).unwrap();
        let decision = instance.tick_controller().last_decision;
        assert_eq!(decision.effective_node_skip_rate, 3);
        assert!(decision.skip_get_bone_atoms);
        assert!(decision.interpolate_bone_atoms);
        assert_eq!(instance.local_atoms(), instance.cached_local_atoms());

        // 第 2 帧：跳过，显示姿态已等于缓存
        instance.tick(&mut c, &mut host, 0.1).unwrap();
        for (shown, cached) in instance.local_atoms().iter().zip(instance.cached_local_atoms()) {
            assert!(shown.equals(cached, 1.0e-6));
        }
        let shown = instance.local_atoms()[1];

        // 第 3 帧：完整求值，节点拿到累计的 0.3s
        instance.tick(&mut c, &mut host, 0.1).unwrap();
        assert!(!instance.tick_controller().last_decision.skip_get_bone_atoms);
        let fresh = instance.cached_local_atoms()[1];
        assert!(!fresh.equals(&shown, 1.0e-4));
        let expected = BoneAtom::blend(&shown, &fresh, alpha);
        assert!(instance.local_atoms()[1].equals(&expected, 1.0e-5));

        // 第 4 帧：跳过，继续向缓存靠近
        let shown = instance.local_atoms()[1];
        instance.tick(&mut c, &mut host, 0.1).unwrap();
        assert!(instance.tick_controller().last_decision.skip_get_bone_atoms);
        let expected = BoneAtom::blend(&shown, &fresh, alpha);
        assert!(instance.local_atoms()[1].equals(&expected, 1.0e-5));
    }

    #[test]
    fn test_skipped_tick_leaves_pose_untouched() {
        let mut instance = attached(two_bone_mesh(), "sweep");
        instance.recently_rendered = false;
        let mut c = ctx();
        let mut host = HostServices::default();

        instance.tick(&mut c, &mut host, 0.1).unwrap();
        let locals = instance.local_atoms().to_vec();
        let spaces = instance.space_bases().to_vec();

        // 第 2、3 帧整帧跳过
        instance.tick(&mut c, &mut host, 0.1).unwrap();
        instance.tick(&mut c, &mut host, 0.1).unwrap();
        assert!((instance.tick_controller().component_dropped_delta_time - 0.2).abs() < 1.0e-6);

        // 跳帧判定下再次求值也不改动
        instance.update_skel_pose(&c, &mut host, 0.0).unwrap();
        assert_eq!(instance.local_atoms(), locals.as_slice());
        assert_eq!(instance.space_bases(), spaces.as_slice());
    }

    #[test]
    fn test_renderer_receives_cloned_frame() {
        let mut instance = attached(two_bone_mesh(), "turn");
        let mut renderer = TestRenderer::default();
        let mut c = ctx();
        {
            let mut host = HostServices {
                renderer: Some(&mut renderer),
                ..Default::default()
            };
            instance.tick(&mut c, &mut host, 0.1).unwrap();
        }
        assert_eq!(renderer.frames.len(), 1);
        assert_eq!(renderer.frames[0].lod, 0);
        assert_eq!(renderer.frames[0].space_bases.as_slice(), instance.space_bases());
    }

    #[test]
    fn test_socket_transform() {
        let mut instance = attached(two_bone_mesh(), "turn");
        instance.tick(&mut ctx(), &mut HostServices::default(), 0.1).unwrap();
        let socket = instance.socket_transform("tip").unwrap();
        // child 绕 Z 转 90°，挂点偏移 (5,0,0) 变成 (0,5,0)
        assert!((socket.translation - Vec3::new(10.0, 5.0, 0.0)).length() < 1.0e-4);
        assert!(instance.socket_transform("missing").is_none());
    }

    #[test]
    fn test_hidden_bone_collapses() {
        let mut instance = attached(two_bone_mesh(), "turn");
        instance.hide_bone_by_name("child").unwrap();
        assert!(matches!(
            instance.hide_bone_by_name("missing"),
            Err(SkelError::BoneNotFound(_))
        ));
        instance.tick(&mut ctx(), &mut HostServices::default(), 0.1).unwrap();
        assert_eq!(instance.required_bones(), &[0]);
        let child = instance.space_bases()[1];
        assert_eq!(child.scale, Vec3::ZERO);
        assert_eq!(child.translation, instance.space_bases()[0].translation);

        instance.unhide_bone_by_name("child").unwrap();
        instance.tick(&mut ctx(), &mut HostServices::default(), 0.1).unwrap();
        assert_eq!(instance.required_bones(), &[0, 1]);
        assert_eq!(instance.space_bases()[1].scale, Vec3::ONE);
    }

    #[test]
    fn test_destroyed_owner_bails() {
        let mut instance = attached(two_bone_mesh(), "turn");
        let mut owner = TestOwner {
            destroyed: true,
            ..Default::default()
        };
        let mut renderer = TestRenderer::default();
        {
            let mut host = HostServices {
                owner: Some(&mut owner),
                renderer: Some(&mut renderer),
                ..Default::default()
            };
            let result = instance.tick(&mut ctx(), &mut host, 0.1);
            assert!(matches!(result, Err(SkelError::InstanceDestroyed)));
        }
        assert!(renderer.frames.is_empty());
    }

    #[test]
    fn test_owner_gets_stagger_tag() {
        let mut instance = attached(two_bone_mesh(), "turn");
        let mut owner = TestOwner::default();
        let mut c = ctx();
        {
            let mut host = HostServices {
                owner: Some(&mut owner),
                ..Default::default()
            };
            instance.tick(&mut c, &mut host, 0.1).unwrap();
        }
        assert_eq!(owner.stagger_tag, 1);
    }

    #[test]
    fn test_attach_detach_notifies_streaming() {
        let mut streaming = TestStreaming::default();
        let mut instance = SkeletalInstance::new("hero");
        instance
            .attach(two_bone_mesh(), None, InstanceSettings::default(), Some(&mut streaming))
            .unwrap();
        assert!(instance.is_attached());
        assert_eq!(instance.local_atoms().len(), 2);

        instance.detach(Some(&mut streaming));
        assert!(!instance.is_attached());
        assert!(instance.local_atoms().is_empty());
        assert!(instance.active_morphs().is_empty());
        assert_eq!(streaming.attached, vec!["hero".to_string()]);
        assert_eq!(streaming.detached, vec!["hero".to_string()]);
    }

    #[test]
    fn test_force_refpose_ignores_tree() {
        let mut instance = attached(two_bone_mesh(), "turn");
        instance.settings.force_refpose = true;
        instance.tick(&mut ctx(), &mut HostServices::default(), 0.1).unwrap();
        let skel = two_bone_skeleton();
        for bone in 0..2 {
            assert!(instance.space_bases()[bone].equals(&skel.ref_component_space(bone), 1.0e-5));
        }
    }

    fn physics_asset() -> Arc<PhysicsAsset> {
        Arc::new(PhysicsAsset::new(
            "two_bone_physics",
            vec![BodySetup::new("root").kinematic(), BodySetup::new("child")],
        ))
    }

    #[test]
    fn test_physics_blend_in_once_per_tick() {
        let mut instance = attached(two_bone_mesh(), "turn");
        let asset = physics_asset();
        let mut bodies = RapierBodies::new(&asset, &two_bone_skeleton(), &BoneAtom::IDENTITY);
        bodies.set_simulating(true);
        bodies.step(0.1);
        instance.set_physics(asset, Some(Box::new(bodies)));
        instance.settings.physics_weight = 1.0;

        let mut c = ctx();
        let mut host = HostServices::default();
        instance.tick(&mut c, &mut host, 0.0).unwrap();
        assert!(instance.has_had_physics_blended_in());
        // 刚体在重力下落下，child 跟随
        assert!(instance.space_bases()[1].translation.z < -1.0);

        let after_blend = instance.space_bases().to_vec();
        let locals_after_blend = instance.local_atoms().to_vec();
        instance.update_skel_pose(&c, &mut host, 0.0).unwrap();
        assert!(instance.has_had_physics_blended_in());
        // 同一 tick 再次求值，物理姿态保留
        assert!(instance.space_bases()[1].translation.z < -1.0);
        assert_eq!(instance.space_bases(), after_blend.as_slice());
        assert_eq!(instance.local_atoms(), locals_after_blend.as_slice());

        // 下一个 tick 重新求值并再次混入
        instance.tick(&mut c, &mut host, 0.0).unwrap();
        assert!(instance.has_had_physics_blended_in());
        assert!(instance.space_bases()[1].translation.z < -1.0);
    }

    #[test]
    fn test_kinematic_push_after_component_tick() {
        let mut instance = attached(two_bone_mesh(), "turn");
        let asset = physics_asset();
        let bodies = RapierBodies::new(&asset, &two_bone_skeleton(), &BoneAtom::IDENTITY);
        instance.set_physics(asset, Some(Box::new(bodies)));
        instance.local_to_world = BoneAtom::from_translation(Vec3::new(0.0, 0.0, 50.0));

        let mut c = ctx();
        let mut host = HostServices::default();
        instance.tick(&mut c, &mut host, 0.0).unwrap();

        c.post_tick_component_update = true;
        instance.update_skel_pose(&c, &mut host, 1.0 / 60.0 + 1.0e-4).unwrap();
        let root_body = instance.physics_source().unwrap().body_pose(0).unwrap();
        assert!((root_body.translation - Vec3::new(0.0, 0.0, 50.0)).length() < 1.0e-3);
    }
}
