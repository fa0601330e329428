//! 动画树
//!
//! 节点放在一个 arena 里，拓扑序（父节点在前）只算一次存进 tick 数组。
//! 每帧：
//! 1. 从根节点往下累乘权重，处理相关性变化，tick 相关节点
//! 2. tick always-tick 列表（可能在迭代中增删，变化时从头再来）
//! 3. 同步组：主节点推进，从节点对齐相对位置
//! 4. 按节点相关性 tick 骨骼控制器
//!
//! 求值从根节点递归，权重低于阈值的子节点不访问；多父节点共享的子节点缓存结果，
//! 每次求值结束后统一清掉。

use std::collections::HashSet;

use glam::Vec2;

use super::node::{AnimNode, AnimNodeKind, ChildLink, NodeId};
use super::sequence_player::AdvanceResult;
use super::{AnimNotifyEvent, AnimSetList, CurveKey, PoseOutput};
use crate::controls::SkelControlSet;
use crate::morph::{ActiveMorph, MorphGraph};
use crate::skeleton::{BoneAtom, MirrorInfo, RefSkeleton};
use crate::{Result, SkelError, WarnOnce};

/// 相关性变化
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelevanceEvent {
    pub node: NodeId,
    pub became_relevant: bool,
}

/// 同步组
#[derive(Clone, Debug)]
pub struct SyncGroup {
    pub name: String,
    pub rate_scale: f32,
    /// 主节点的组相对位置 [0, 1)
    pub synch_pct_position: f32,
    pub master: Option<NodeId>,
    pub notify_master: Option<NodeId>,
    /// 本帧登记的成员
    pub members: Vec<NodeId>,
    last_master: Option<NodeId>,
}

impl SyncGroup {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rate_scale: 1.0,
            synch_pct_position: 0.0,
            master: None,
            notify_master: None,
            members: Vec::new(),
            last_master: None,
        }
    }
}

/// 一次求值需要的外部数据
#[derive(Clone, Copy, Debug)]
pub struct EvalContext<'a> {
    pub skeleton: &'a RefSkeleton,
    /// 严格递增的必需骨骼
    pub required_bones: &'a [usize],
    pub mirror_table: &'a [MirrorInfo],
    /// 上一次物理混合后的组件空间姿态
    pub physics_pose: Option<&'a [BoneAtom]>,
    pub zero_weight: f32,
}

/// 动画树
#[derive(Clone, Debug)]
pub struct AnimTree {
    nodes: Vec<AnimNode>,
    root: Option<NodeId>,
    /// 拓扑序，父节点在前
    tick_array: Vec<NodeId>,
    tick_weights: Vec<f32>,
    always_tick: Vec<NodeId>,
    finalized: bool,

    // ========== 标签 ==========
    tick_tag: u64,
    init_tag: u64,
    cached_atoms_tag: u64,
    cache_clear_list: Vec<NodeId>,

    // ========== 合成 / 控制器 / Morph ==========
    /// 先于主遍合成的骨骼（IK 源骨骼等），包含其后代
    pub pre_pass_bone_names: Vec<String>,
    /// 最后合成的骨骼（扭转骨骼等），包含其后代
    pub post_pass_bone_names: Vec<String>,
    pub skel_controls: SkelControlSet,
    pub morph_graph: MorphGraph,

    sync_groups: Vec<SyncGroup>,
    anim_sets: AnimSetList,

    // ========== 事件 ==========
    relevance_events: Vec<RelevanceEvent>,
    notify_events: Vec<AnimNotifyEvent>,
    anim_end_events: Vec<NodeId>,
    warned: WarnOnce,
}

impl Default for AnimTree {
    fn default() -> Self {
        Self::new()
    }
}

impl AnimTree {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
            tick_array: Vec::new(),
            tick_weights: Vec::new(),
            always_tick: Vec::new(),
            finalized: false,
            tick_tag: 0,
            // 节点初始标签为 0，首次 tick 必然触发初始化
            init_tag: 1,
            cached_atoms_tag: 0,
            cache_clear_list: Vec::new(),
            pre_pass_bone_names: Vec::new(),
            post_pass_bone_names: Vec::new(),
            skel_controls: SkelControlSet::new(),
            morph_graph: MorphGraph::new(),
            sync_groups: Vec::new(),
            anim_sets: AnimSetList::new(),
            relevance_events: Vec::new(),
            notify_events: Vec::new(),
            anim_end_events: Vec::new(),
            warned: WarnOnce::default(),
        }
    }

    // ========== 构建 ==========

    pub fn add_node(&mut self, name: impl Into<String>, kind: AnimNodeKind) -> NodeId {
        self.nodes.push(AnimNode::new(name, kind));
        self.finalized = false;
        NodeId(self.nodes.len() - 1)
    }

    /// 连接父子节点
    pub fn connect(&mut self, parent: NodeId, child: NodeId, weight: f32) -> Result<()> {
        if parent.0 >= self.nodes.len() || child.0 >= self.nodes.len() {
            return Err(SkelError::InvalidAnimTree(format!(
                "连接越界: {} -> {}",
                parent.0, child.0
            )));
        }
        if self.nodes[parent.0].kind.is_leaf() {
            return Err(SkelError::InvalidAnimTree(format!(
                "叶子节点 {} 不能有子节点",
                self.nodes[parent.0].name
            )));
        }
        let name = self.nodes[child.0].name.clone();
        self.nodes[parent.0].children.push(ChildLink {
            name,
            node: Some(child),
            weight,
        });
        self.finalized = false;
        Ok(())
    }

    pub fn set_root(&mut self, root: NodeId) {
        self.root = Some(root);
        self.finalized = false;
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// 建立父节点表、tick 拓扑序和同步组；有环时报错
    pub fn finalize(&mut self) -> Result<()> {
        let root = self
            .root
            .ok_or_else(|| SkelError::InvalidAnimTree("没有根节点".into()))?;
        if root.0 >= self.nodes.len() {
            return Err(SkelError::InvalidAnimTree(format!("根节点 {} 越界", root.0)));
        }

        // 从根可达的节点
        let mut reachable = vec![false; self.nodes.len()];
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if reachable[id.0] {
                continue;
            }
            reachable[id.0] = true;
            stack.extend(self.nodes[id.0].children.iter().filter_map(|c| c.node));
        }

        for node in &mut self.nodes {
            node.parents.clear();
        }
        let mut in_degree = vec![0usize; self.nodes.len()];
        for parent in 0..self.nodes.len() {
            if !reachable[parent] {
                continue;
            }
            let children: Vec<NodeId> = self.nodes[parent].children.iter().filter_map(|c| c.node).collect();
            for child in children {
                let parents = &mut self.nodes[child.0].parents;
                if !parents.contains(&NodeId(parent)) {
                    parents.push(NodeId(parent));
                    in_degree[child.0] += 1;
                }
            }
        }

        // Kahn，用栈保持深度优先的顺序
        let reachable_count = reachable.iter().filter(|&&r| r).count();
        let mut order = Vec::with_capacity(reachable_count);
        let mut ready = if in_degree[root.0] == 0 { vec![root] } else { Vec::new() };
        while let Some(id) = ready.pop() {
            order.push(id);
            let mut seen = HashSet::new();
            for link in self.nodes[id.0].children.iter().rev() {
                let Some(child) = link.node else {
                    continue;
                };
                if !seen.insert(child) {
                    continue;
                }
                in_degree[child.0] -= 1;
                if in_degree[child.0] == 0 {
                    ready.push(child);
                }
            }
        }
        if order.len() != reachable_count {
            return Err(SkelError::InvalidAnimTree("节点图存在环".into()));
        }

        for node in &mut self.nodes {
            node.cache_results = node.parents.len() > 1;
        }
        self.tick_array = order;
        self.tick_weights = vec![0.0; self.nodes.len()];
        self.always_tick.retain(|id| reachable[id.0]);
        self.build_sync_groups();
        self.finalized = true;
        log::debug!(
            "[动画树] 完成构建: {} 个节点, {} 个同步组",
            self.tick_array.len(),
            self.sync_groups.len()
        );
        Ok(())
    }

    /// 同步组节点的后代序列节点加入该组
    fn build_sync_groups(&mut self) {
        self.sync_groups.clear();
        for index in 0..self.tick_array.len() {
            let id = self.tick_array[index];
            let AnimNodeKind::SyncGroup(group) = &self.nodes[id.0].kind else {
                continue;
            };
            let (name, rate_scale) = (group.group_name.clone(), group.rate_scale);
            if !self.sync_groups.iter().any(|g| g.name == name) {
                let mut sync = SyncGroup::new(name.clone());
                sync.rate_scale = rate_scale;
                self.sync_groups.push(sync);
            }

            let mut visited = HashSet::new();
            let mut stack: Vec<NodeId> = self.nodes[id.0].children.iter().filter_map(|c| c.node).collect();
            while let Some(next) = stack.pop() {
                if !visited.insert(next) {
                    continue;
                }
                let node = &mut self.nodes[next.0];
                match &mut node.kind {
                    AnimNodeKind::SequencePlayer(player) => {
                        if player.sync_group.is_none() {
                            player.sync_group = Some(name.clone());
                        }
                    }
                    // 嵌套的同步组节点管自己的后代
                    AnimNodeKind::SyncGroup(_) => continue,
                    _ => {}
                }
                stack.extend(node.children.iter().filter_map(|c| c.node));
            }
        }

        // 手动指定了组名的序列节点
        for node in &self.nodes {
            if let AnimNodeKind::SequencePlayer(player) = &node.kind {
                if let Some(name) = &player.sync_group {
                    if !self.sync_groups.iter().any(|g| &g.name == name) {
                        self.sync_groups.push(SyncGroup::new(name.clone()));
                    }
                }
            }
        }
    }

    // ========== 初始化 ==========

    /// 绑定骨架与动画集，所有节点在下次被访问时重新初始化
    pub fn init_tree(&mut self, skeleton: &RefSkeleton, anim_sets: AnimSetList) {
        self.anim_sets = anim_sets;
        self.skel_controls.link_to_skeleton(skeleton);
        self.morph_graph.link_bones(skeleton);
        self.init_tag += 1;
        self.warned.clear();
    }

    /// 更换动画集
    pub fn set_anim_sets(&mut self, anim_sets: AnimSetList) {
        self.anim_sets = anim_sets;
        self.init_tag += 1;
    }

    pub fn anim_sets(&self) -> &AnimSetList {
        &self.anim_sets
    }

    /// 更换序列节点播放的动画
    pub fn set_anim(&mut self, player: NodeId, anim_name: &str) -> bool {
        let Some(node) = self.nodes.get_mut(player.0) else {
            return false;
        };
        let AnimNodeKind::SequencePlayer(p) = &mut node.kind else {
            return false;
        };
        p.anim_seq_name = anim_name.to_string();
        node.init_tag = 0;
        true
    }

    /// 延迟初始化：初始化标签落后时执行一次
    fn init_node(&mut self, id: NodeId, skeleton: &RefSkeleton) {
        let init_tag = self.init_tag;
        let node = &mut self.nodes[id.0];
        if node.init_tag == init_tag {
            return;
        }
        node.init_tag = init_tag;
        match &mut node.kind {
            AnimNodeKind::SequencePlayer(player) => {
                if !player.link(&self.anim_sets, skeleton) && self.warned.first(&player.anim_seq_name) {
                    log::warn!(
                        "[动画树] 节点 {} 找不到动画 {}，使用参考姿态",
                        node.name,
                        player.anim_seq_name
                    );
                }
            }
            AnimNodeKind::AimOffset(aim) => aim.link(skeleton),
            _ => {}
        }
    }

    // ========== 查询 ==========

    pub fn node(&self, id: NodeId) -> Option<&AnimNode> {
        self.nodes.get(id.0)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut AnimNode> {
        self.nodes.get_mut(id.0)
    }

    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.name == name).map(NodeId)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_weight(&self, id: NodeId) -> f32 {
        self.nodes.get(id.0).map_or(0.0, |n| n.node_total_weight)
    }

    pub fn is_relevant(&self, id: NodeId) -> bool {
        self.nodes.get(id.0).is_some_and(|n| n.relevant)
    }

    pub fn sync_group(&self, name: &str) -> Option<&SyncGroup> {
        self.sync_groups.iter().find(|g| g.name == name)
    }

    pub fn tick_tag(&self) -> u64 {
        self.tick_tag
    }

    /// 根据动画树节点算出的激活 Morph
    pub fn active_morphs(&self, min_weight: f32) -> Vec<ActiveMorph> {
        self.morph_graph.active_morphs(min_weight)
    }

    // ========== 节点控制 ==========

    /// 在插槽上播放自定义动画
    pub fn play_custom_anim(
        &mut self,
        slot: NodeId,
        anim_name: &str,
        rate: f32,
        blend_in_time: f32,
        blend_out_time: f32,
        looping: bool,
    ) -> bool {
        if self.anim_sets.find_sequence(anim_name).is_none() {
            if self.warned.first(anim_name) {
                log::warn!("[动画树] 插槽播放失败，找不到动画 {}", anim_name);
            }
            return false;
        }
        let Some(node) = self.nodes.get(slot.0) else {
            return false;
        };
        let AnimNodeKind::Slot(state) = &node.kind else {
            log::warn!("[动画树] 节点 {} 不是插槽", node.name);
            return false;
        };
        let channels = node.children.len();
        if channels < 2 {
            log::warn!("[动画树] 插槽 {} 没有自定义通道", node.name);
            return false;
        }
        // 正在播放时换到下一个通道，交叉淡入
        let channel = if state.custom_weight() > 0.0 && channels > 2 {
            state.active_child() % (channels - 1) + 1
        } else {
            state.active_child().min(channels - 1)
        };
        let Some(player_id) = node.children[channel].node else {
            return false;
        };

        let player_node = &mut self.nodes[player_id.0];
        let AnimNodeKind::SequencePlayer(player) = &mut player_node.kind else {
            log::warn!("[动画树] 插槽通道 {} 不是序列节点", player_node.name);
            return false;
        };
        if player.anim_seq_name != anim_name {
            player.anim_seq_name = anim_name.to_string();
            player_node.init_tag = 0;
        }
        player.play_anim(looping, rate, 0.0);

        if let AnimNodeKind::Slot(state) = &mut self.nodes[slot.0].kind {
            state.begin_blend_in(channel, blend_in_time, blend_out_time);
        }
        if !self.always_tick.contains(&slot) {
            self.always_tick.push(slot);
        }
        true
    }

    /// 停止插槽上的自定义动画
    pub fn stop_custom_anim(&mut self, slot: NodeId, blend_out_time: f32) {
        let Some(AnimNodeKind::Slot(state)) = self.nodes.get_mut(slot.0).map(|n| &mut n.kind) else {
            return;
        };
        state.begin_blend_out(blend_out_time);
        if !self.always_tick.contains(&slot) {
            self.always_tick.push(slot);
        }
    }

    /// 设置两路混合节点的目标权重
    pub fn set_blend_target(&mut self, node: NodeId, target: f32, blend_time: f32) -> bool {
        match self.nodes.get_mut(node.0).map(|n| &mut n.kind) {
            Some(AnimNodeKind::BlendByWeight(blend)) => {
                blend.set_blend_target(target, blend_time);
                true
            }
            _ => false,
        }
    }

    /// 设置瞄准方向
    pub fn set_aim(&mut self, node: NodeId, aim: Vec2) -> bool {
        match self.nodes.get_mut(node.0).map(|n| &mut n.kind) {
            Some(AnimNodeKind::AimOffset(offset)) => {
                offset.aim = aim;
                true
            }
            _ => false,
        }
    }

    /// 节点加入 always-tick 列表
    pub fn add_always_tick(&mut self, node: NodeId) {
        if node.0 < self.nodes.len() && !self.always_tick.contains(&node) {
            self.always_tick.push(node);
        }
    }

    pub fn remove_always_tick(&mut self, node: NodeId) {
        self.always_tick.retain(|&n| n != node);
    }

    // ========== 事件 ==========

    pub fn take_relevance_events(&mut self) -> Vec<RelevanceEvent> {
        std::mem::take(&mut self.relevance_events)
    }

    pub fn take_notify_events(&mut self) -> Vec<AnimNotifyEvent> {
        std::mem::take(&mut self.notify_events)
    }

    pub fn take_anim_end_events(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.anim_end_events)
    }

    // ========== tick ==========

    /// 每帧 tick 节点图
    pub fn tick(&mut self, delta_time: f32, skeleton: &RefSkeleton, zero_weight: f32) {
        let Some(root) = self.root else {
            return;
        };
        if !self.finalized {
            if let Err(e) = self.finalize() {
                log::error!("[动画树] {}", e);
                return;
            }
        }

        self.tick_tag += 1;
        let tick_tag = self.tick_tag;
        self.tick_weights.iter_mut().for_each(|w| *w = 0.0);
        self.tick_weights[root.0] = 1.0;
        for &id in &self.tick_array {
            self.nodes[id.0].just_became_relevant = false;
        }
        for group in &mut self.sync_groups {
            group.last_master = group.master.take();
            group.notify_master = None;
            group.members.clear();
        }

        for index in 0..self.tick_array.len() {
            let id = self.tick_array[index];
            let weight = self.tick_weights[id.0];
            let node = &mut self.nodes[id.0];
            if !node.relevant {
                // 不打标签：always-tick 遍历靠旧标签找出本帧还没 tick 的节点
                if weight <= zero_weight {
                    continue;
                }
                node.relevant = true;
                node.just_became_relevant = true;
                self.relevance_events.push(RelevanceEvent {
                    node: id,
                    became_relevant: true,
                });
            } else if weight <= zero_weight {
                node.tick_tag = tick_tag;
                node.relevant = false;
                node.node_total_weight = weight;
                self.relevance_events.push(RelevanceEvent {
                    node: id,
                    became_relevant: false,
                });
                self.on_cease_relevant(id);
                continue;
            }
            node.node_total_weight = weight;

            self.init_node(id, skeleton);
            self.nodes[id.0].tick_tag = tick_tag;
            self.tick_node(id, delta_time);

            let node = &self.nodes[id.0];
            for link in &node.children {
                if let Some(child) = link.node {
                    self.tick_weights[child.0] += link.weight * weight;
                }
            }
        }

        // 迭代中列表长度变化时从头再来，已 tick 的节点靠标签跳过
        let mut index = 0;
        while index < self.always_tick.len() {
            let id = self.always_tick[index];
            let len_before = self.always_tick.len();
            if self.nodes[id.0].tick_tag != tick_tag {
                self.init_node(id, skeleton);
                self.nodes[id.0].tick_tag = tick_tag;
                self.tick_node(id, delta_time);
            }
            if self.always_tick.len() != len_before {
                index = 0;
            } else {
                index += 1;
            }
        }

        self.tick_sync_groups(delta_time);

        let nodes = &self.nodes;
        self.skel_controls.tick(delta_time, tick_tag, |n| {
            nodes
                .get(n.0)
                .filter(|node| node.relevant)
                .map(|node| node.node_total_weight)
        });
    }

    fn on_cease_relevant(&mut self, id: NodeId) {
        if let AnimNodeKind::MorphDriver(driver) = &self.nodes[id.0].kind {
            self.morph_graph.set_node_weight(&driver.morph_node_name, 0.0);
        }
    }

    /// tick 单个节点并更新子节点权重
    fn tick_node(&mut self, id: NodeId, delta_time: f32) {
        let tick_tag = self.tick_tag;
        let node = &mut self.nodes[id.0];
        let weight = node.node_total_weight;
        let child_count = node.children.len();
        let mut child_weights: Option<Vec<f32>> = None;
        let mut register_group: Option<usize> = None;
        let mut advanced: Option<AdvanceResult> = None;
        let mut leave_always_tick = false;

        match &mut node.kind {
            AnimNodeKind::SequencePlayer(player) => {
                if let Some(seq) = player.sequence() {
                    for control_name in &seq.skel_control_metadata {
                        self.skel_controls.apply_metadata_weight(control_name, weight, tick_tag);
                    }
                }
                register_group = player
                    .sync_group
                    .as_ref()
                    .and_then(|name| self.sync_groups.iter().position(|g| &g.name == name));
                if register_group.is_none() {
                    advanced = Some(player.tick(delta_time, weight));
                }
            }
            AnimNodeKind::BlendByWeight(blend) => {
                blend.tick(delta_time);
                child_weights = Some(blend.child_weights(child_count));
            }
            AnimNodeKind::Slot(slot) => {
                leave_always_tick = slot.tick(delta_time);
                child_weights = Some(slot.child_weights(child_count));
            }
            AnimNodeKind::SyncGroup(group) => {
                child_weights = Some(group.child_weights(child_count));
                if let Some(sync) = self.sync_groups.iter_mut().find(|g| g.name == group.group_name) {
                    sync.rate_scale = group.rate_scale;
                }
            }
            AnimNodeKind::MorphDriver(driver) => {
                self.morph_graph.set_node_weight(&driver.morph_node_name, weight);
                node.set_pass_through_weights();
            }
            AnimNodeKind::PhysicsPoseSource
            | AnimNodeKind::SkelControlCarrier
            | AnimNodeKind::AimOffset(_)
            | AnimNodeKind::Mirror(_) => node.set_pass_through_weights(),
        }

        if let Some(weights) = child_weights {
            for (link, w) in node.children.iter_mut().zip(weights) {
                link.weight = w;
            }
        }
        if leave_always_tick {
            self.always_tick.retain(|&n| n != id);
        }
        if let Some(group) = register_group {
            self.register_sync_member(group, id);
        }
        if let Some(result) = advanced {
            self.handle_advance(id, result);
        }
    }

    /// 登记同步组成员，按权重选主节点和通知主节点
    fn register_sync_member(&mut self, group: usize, id: NodeId) {
        let node = &self.nodes[id.0];
        let AnimNodeKind::SequencePlayer(player) = &node.kind else {
            return;
        };
        let weight = node.node_total_weight;
        let nodes = &self.nodes;
        let sync = &mut self.sync_groups[group];
        sync.members.push(id);

        let heavier = |current: Option<NodeId>| current.map_or(true, |c| nodes[c.0].node_total_weight < weight);
        if player.synchronize && !player.force_always_slave && heavier(sync.master) {
            sync.master = Some(id);
        }
        if !player.no_notifies && heavier(sync.notify_master) {
            sync.notify_master = Some(id);
        }
    }

    fn tick_sync_groups(&mut self, delta_time: f32) {
        for group_index in 0..self.sync_groups.len() {
            let group = &self.sync_groups[group_index];
            if group.members.is_empty() {
                continue;
            }
            let members = group.members.clone();
            let (master, notify_master, last_master) = (group.master, group.notify_master, group.last_master);
            let rate_scale = group.rate_scale;
            let mut pct = group.synch_pct_position;
            let mut master_direction = 1.0;

            if let Some(master_id) = master {
                let node = &mut self.nodes[master_id.0];
                let weight = node.node_total_weight;
                let just_became_relevant = node.just_became_relevant;
                if let AnimNodeKind::SequencePlayer(player) = &mut node.kind {
                    // 接替旧主节点时从组位置继续
                    if just_became_relevant && last_master.is_some_and(|m| m != master_id) {
                        player.current_time = player.find_group_position(pct);
                    }
                    player.previous_time = player.current_time;
                    let move_delta = player.move_delta(delta_time, rate_scale);
                    if move_delta < 0.0 {
                        master_direction = -1.0;
                    }
                    let result = if player.playing {
                        let fire = notify_master == Some(master_id) && weight >= player.notify_weight_threshold;
                        player.advance_by(move_delta, delta_time, fire)
                    } else {
                        AdvanceResult::default()
                    };
                    pct = player.group_relative_position();
                    self.handle_advance(master_id, result);
                }
            }
            self.sync_groups[group_index].synch_pct_position = pct;

            for id in members {
                if Some(id) == master {
                    continue;
                }
                let node = &mut self.nodes[id.0];
                let weight = node.node_total_weight;
                let AnimNodeKind::SequencePlayer(player) = &mut node.kind else {
                    continue;
                };
                player.previous_time = player.current_time;
                if !player.playing {
                    continue;
                }
                let fire = notify_master == Some(id) && weight >= player.notify_weight_threshold;
                let result = if player.synchronize && master.is_some() {
                    let mut move_delta = player.find_group_position(pct) - player.current_time;
                    // 循环动画按主节点方向绕一圈
                    if player.looping && move_delta * master_direction < 0.0 {
                        move_delta += player.anim_length() * master_direction;
                    }
                    player.advance_by(move_delta, delta_time, fire)
                } else {
                    let move_delta = player.move_delta(delta_time, rate_scale);
                    player.advance_by(move_delta, delta_time, fire)
                };
                self.handle_advance(id, result);
            }
        }
    }

    fn handle_advance(&mut self, id: NodeId, result: AdvanceResult) {
        if !result.notifies.is_empty() {
            if let AnimNodeKind::SequencePlayer(player) = &self.nodes[id.0].kind {
                for (notify, time) in result.notifies {
                    self.notify_events.push(AnimNotifyEvent {
                        node: id,
                        sequence: player.anim_seq_name.clone(),
                        notify,
                        time,
                    });
                }
            }
        }
        if result.ended {
            self.report_anim_end(id);
        }
    }

    /// 动画播完：每个 tick 标签只报告一次
    fn report_anim_end(&mut self, id: NodeId) {
        let tick_tag = self.tick_tag;
        let node = &mut self.nodes[id.0];
        if node.end_event_tag == tick_tag {
            return;
        }
        node.end_event_tag = tick_tag;
        self.anim_end_events.push(id);

        let parents = node.parents.clone();
        for parent in parents {
            let parent_node = &mut self.nodes[parent.0];
            let Some(channel) = parent_node.children.iter().position(|c| c.node == Some(id)) else {
                continue;
            };
            if let AnimNodeKind::Slot(slot) = &mut parent_node.kind {
                slot.on_child_anim_end(channel);
            }
        }
    }

    // ========== 求值 ==========

    /// 求值整棵树的局部姿态
    pub fn evaluate(&mut self, ctx: &EvalContext) -> PoseOutput {
        let Some(root) = self.root else {
            return PoseOutput::ref_pose(ctx.skeleton);
        };
        if !self.finalized {
            log::warn!("[动画树] 未完成构建，返回参考姿态");
            return PoseOutput::ref_pose(ctx.skeleton);
        }
        self.cached_atoms_tag += 1;
        let mut out = self.evaluate_node(root, ctx);
        for id in std::mem::take(&mut self.cache_clear_list) {
            self.nodes[id.0].cached = None;
        }
        for &bone in ctx.required_bones {
            if let Some(atom) = out.atoms.get_mut(bone) {
                atom.normalize_rotation();
            }
        }
        out
    }

    fn evaluate_node(&mut self, id: NodeId, ctx: &EvalContext) -> PoseOutput {
        self.init_node(id, ctx.skeleton);

        let cached_atoms_tag = self.cached_atoms_tag;
        let node = &self.nodes[id.0];
        if node.cache_results && node.cached_atoms_tag == cached_atoms_tag {
            if let Some(cached) = &node.cached {
                return cached.clone();
            }
        }

        let leaf = match &node.kind {
            AnimNodeKind::SequencePlayer(player) => {
                if player.force_refpose_when_not_playing && !player.playing {
                    Some(PoseOutput::ref_pose(ctx.skeleton))
                } else {
                    Some(player.evaluate(ctx.skeleton, ctx.required_bones))
                }
            }
            AnimNodeKind::PhysicsPoseSource => ctx
                .physics_pose
                .filter(|pose| pose.len() == ctx.skeleton.bone_count())
                .map(|pose| locals_from_component_space(pose, ctx)),
            _ => None,
        };

        let mut out = match leaf {
            Some(pose) => pose,
            None => self.blend_children(id, ctx),
        };

        let node = &mut self.nodes[id.0];
        match &node.kind {
            AnimNodeKind::AimOffset(aim) => aim.apply(&mut out, ctx.required_bones),
            AnimNodeKind::Mirror(mirror) => mirror.apply(&mut out, ctx.required_bones, ctx.mirror_table),
            _ => {}
        }

        if node.cache_results {
            node.cached = Some(out.clone());
            node.cached_atoms_tag = cached_atoms_tag;
            self.cache_clear_list.push(id);
        }
        out
    }

    /// 按子连接权重混合，权重低于阈值的子节点跳过，剩余权重重新归一
    fn blend_children(&mut self, id: NodeId, ctx: &EvalContext) -> PoseOutput {
        let links: Vec<(NodeId, f32)> = self.nodes[id.0]
            .children
            .iter()
            .filter(|c| c.weight > ctx.zero_weight)
            .filter_map(|c| c.node.map(|n| (n, c.weight)))
            .collect();
        let total: f32 = links.iter().map(|(_, w)| w).sum();
        if links.is_empty() || total <= ctx.zero_weight {
            return PoseOutput::ref_pose(ctx.skeleton);
        }
        if links.len() == 1 {
            return self.evaluate_node(links[0].0, ctx);
        }

        let mut out = PoseOutput::ref_pose(ctx.skeleton);
        for &bone in ctx.required_bones {
            out.atoms[bone] = BoneAtom::zeroed();
        }
        let mut root_motion = BoneAtom::zeroed();
        let mut curve_keys: Vec<CurveKey> = Vec::new();

        for (child, weight) in links {
            let pose = self.evaluate_node(child, ctx);
            let weight = weight / total;
            for &bone in ctx.required_bones {
                if let Some(atom) = pose.atoms.get(bone) {
                    out.atoms[bone].accumulate_weighted(atom, weight);
                }
            }
            // 没有根运动的子节点贡献单位增量
            root_motion.accumulate_weighted(&pose.root_motion_delta, weight);
            out.has_root_motion |= pose.has_root_motion;
            for key in pose.curve_keys {
                match curve_keys.iter_mut().find(|k| k.name == key.name) {
                    Some(existing) => existing.weight += key.weight * weight,
                    None => curve_keys.push(CurveKey {
                        name: key.name,
                        weight: key.weight * weight,
                    }),
                }
            }
        }

        for &bone in ctx.required_bones {
            out.atoms[bone].normalize_rotation();
        }
        if out.has_root_motion {
            root_motion.normalize_rotation();
            out.root_motion_delta = root_motion;
        }
        out.curve_keys = curve_keys;
        out
    }
}

/// 组件空间姿态转回局部空间
fn locals_from_component_space(space_bases: &[BoneAtom], ctx: &EvalContext) -> PoseOutput {
    let mut out = PoseOutput::ref_pose(ctx.skeleton);
    for &bone in ctx.required_bones {
        out.atoms[bone] = if bone == 0 {
            space_bases[0]
        } else {
            let parent = ctx.skeleton.parent_index(bone);
            space_bases[bone] * space_bases[parent].inverse()
        };
    }
    out
}
