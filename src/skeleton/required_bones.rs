//! 必需骨骼与合成顺序
//!
//! 必需骨骼数组始终严格递增；合成顺序 = 前置遍 ⊕ 主遍 ⊕ 后置遍，
//! 保证任意骨骼的父骨骼先于它被处理。

use super::{BoneVisibility, MirrorInfo, RefSkeleton};

/// 合并两个严格递增的骨骼索引数组，结果仍严格递增
pub fn merge_bone_index_arrays(base: &[usize], insert: &[usize]) -> Vec<usize> {
    let mut out = Vec::with_capacity(base.len() + insert.len());
    let (mut i, mut j) = (0, 0);
    while i < base.len() || j < insert.len() {
        let next = match (base.get(i), insert.get(j)) {
            (Some(&a), Some(&b)) if a == b => {
                i += 1;
                j += 1;
                a
            }
            (Some(&a), Some(&b)) if a < b => {
                i += 1;
                a
            }
            (Some(_), Some(&b)) => {
                j += 1;
                b
            }
            (Some(&a), None) => {
                i += 1;
                a
            }
            (None, Some(&b)) => {
                j += 1;
                b
            }
            (None, None) => break,
        };
        out.push(next);
    }
    out
}

/// 补齐父骨骼（根骨骼不要求）
pub fn ensure_parents_present(bones: &mut Vec<usize>, skeleton: &RefSkeleton) {
    // 倒序扫描：新加入的父骨骼索引更小，会在后续迭代中被处理
    let mut present = vec![false; skeleton.bone_count()];
    for &b in bones.iter() {
        if b < present.len() {
            present[b] = true;
        }
    }
    for b in (1..present.len()).rev() {
        if present[b] {
            present[skeleton.parent_index(b)] = true;
        }
    }
    bones.clear();
    bones.extend(present.iter().enumerate().filter(|(_, &p)| p).map(|(i, _)| i));
}

/// 按索引顺序重建可见性：父骨骼不可见时子骨骼标记为 HiddenByParent
pub fn rebuild_visibility(visibility: &mut [BoneVisibility], skeleton: &RefSkeleton) {
    let count = visibility.len().min(skeleton.bone_count());
    for b in 0..count {
        if visibility[b] == BoneVisibility::ExplicitlyHidden {
            continue;
        }
        if b == 0 {
            visibility[b] = BoneVisibility::Visible;
            continue;
        }
        let parent = skeleton.parent_index(b);
        visibility[b] = if visibility[parent].is_visible() {
            BoneVisibility::Visible
        } else {
            BoneVisibility::HiddenByParent
        };
    }
}

/// 必需骨骼计算的输入
#[derive(Clone, Copy, Debug)]
pub struct RequiredBonesInputs<'a> {
    /// 当前 LOD 的必需骨骼（已考虑实例权重的替代列表）
    pub lod_required: &'a [usize],
    pub visibility: &'a [BoneVisibility],
    /// 物理资产引用的骨骼（无序）
    pub physics_bones: &'a [usize],
    /// 逐多边形碰撞骨骼（无序）
    pub per_poly_bones: &'a [usize],
    /// 镜像表；长度必须等于骨骼数才生效
    pub mirror_table: &'a [MirrorInfo],
}

fn sorted_unique(bones: &[usize], bone_count: usize) -> Vec<usize> {
    let mut v: Vec<usize> = bones.iter().copied().filter(|&b| b < bone_count).collect();
    v.sort_unstable();
    v.dedup();
    v
}

/// 重新计算必需骨骼
pub fn recalc_required_bones(skeleton: &RefSkeleton, inputs: &RequiredBonesInputs) -> Vec<usize> {
    let bone_count = skeleton.bone_count();
    let mut required = sorted_unique(inputs.lod_required, bone_count);

    // 先剔除不可见骨骼，再做物理 / 镜像补充
    if !inputs.visibility.is_empty() {
        required.retain(|&b| inputs.visibility.get(b).map_or(true, |v| v.is_visible()));
    }

    if !inputs.physics_bones.is_empty() {
        required = merge_bone_index_arrays(&required, &sorted_unique(inputs.physics_bones, bone_count));
    }
    if !inputs.per_poly_bones.is_empty() {
        required = merge_bone_index_arrays(&required, &sorted_unique(inputs.per_poly_bones, bone_count));
    }

    let use_mirror = inputs.mirror_table.len() == bone_count;
    if !inputs.mirror_table.is_empty() && !use_mirror {
        log::warn!(
            "[必需骨骼] 镜像表长度 {} 与骨骼数 {} 不一致，忽略",
            inputs.mirror_table.len(),
            bone_count
        );
    }

    // 镜像闭包和父骨骼闭包互相影响，迭代到不动点
    loop {
        let before = required.len();
        if use_mirror {
            let sources: Vec<usize> = required
                .iter()
                .map(|&b| inputs.mirror_table[b].source_index)
                .filter(|&s| s < bone_count)
                .collect();
            required = merge_bone_index_arrays(&required, &sorted_unique(&sources, bone_count));
        }
        ensure_parents_present(&mut required, skeleton);
        if required.len() == before {
            break;
        }
    }

    required
}

/// 三遍合成顺序
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ComposeOrder {
    pub bones: Vec<usize>,
    pub pre_pass_len: usize,
    pub post_pass_len: usize,
}

impl ComposeOrder {
    pub fn pre_pass(&self) -> &[usize] {
        &self.bones[..self.pre_pass_len]
    }

    pub fn main_pass(&self) -> &[usize] {
        &self.bones[self.pre_pass_len..self.bones.len() - self.post_pass_len]
    }

    pub fn post_pass(&self) -> &[usize] {
        &self.bones[self.bones.len() - self.post_pass_len..]
    }
}

/// 收集命名骨骼及其全部后代
///
/// 父索引总小于子索引，一次正向扫描即可把标记传给所有后代，
/// 不要求后代在数组里紧跟在命名骨骼之后。
fn collect_named_subtrees(skeleton: &RefSkeleton, names: &[String], exclude: &[bool]) -> Vec<bool> {
    let bone_count = skeleton.bone_count();
    let mut in_subtree = vec![false; bone_count];
    for name in names {
        match skeleton.find_bone_by_name(name) {
            Some(start) => in_subtree[start] = true,
            None => log::warn!("[合成顺序] 找不到骨骼: {}", name),
        }
    }
    for j in 1..bone_count {
        if !in_subtree[j] && in_subtree[skeleton.parent_index(j)] {
            in_subtree[j] = true;
        }
    }
    // 被排除的骨骼自身不入遍，但它的后代照常标记
    in_subtree
        .iter()
        .zip(exclude)
        .map(|(&marked, &excluded)| marked && !excluded)
        .collect()
}

/// 根据前置 / 后置骨骼名单构建合成顺序
pub fn build_compose_passes(
    skeleton: &RefSkeleton,
    required: &[usize],
    pre_pass_names: &[String],
    post_pass_names: &[String],
) -> ComposeOrder {
    if pre_pass_names.is_empty() && post_pass_names.is_empty() {
        return ComposeOrder {
            bones: required.to_vec(),
            pre_pass_len: 0,
            post_pass_len: 0,
        };
    }

    let bone_count = skeleton.bone_count();
    let mut is_required = vec![false; bone_count];
    for &b in required {
        if b < bone_count {
            is_required[b] = true;
        }
    }

    let nothing = vec![false; bone_count];
    let pre_marked = collect_named_subtrees(skeleton, pre_pass_names, &nothing);
    let mut pre: Vec<usize> = (0..bone_count).filter(|&b| pre_marked[b]).collect();
    ensure_parents_present(&mut pre, skeleton);
    pre.retain(|&b| is_required[b]);

    let mut in_pre = vec![false; bone_count];
    for &b in &pre {
        in_pre[b] = true;
    }

    let post_marked = collect_named_subtrees(skeleton, post_pass_names, &in_pre);
    let post: Vec<usize> = (0..bone_count).filter(|&b| post_marked[b] && is_required[b]).collect();

    let main: Vec<usize> = required
        .iter()
        .copied()
        .filter(|&b| b < bone_count && !in_pre[b] && !post_marked[b])
        .collect();

    let pre_pass_len = pre.len();
    let post_pass_len = post.len();
    let mut bones = pre;
    bones.extend(main);
    bones.extend(post);

    ComposeOrder {
        bones,
        pre_pass_len,
        post_pass_len,
    }
}
