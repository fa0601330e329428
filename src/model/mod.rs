//! 骨骼网格资源与角色实例运行时

mod material;
mod runtime;

pub use material::MaterialParams;
pub use runtime::{InstanceSettings, SkeletalInstance};

use std::sync::Arc;

use crate::morph::MorphTargetSet;
use crate::skeleton::{BoneAtom, MirrorInfo, RefSkeleton};
use crate::{Result, SkelError};

/// 单个 LOD 的骨骼数据
#[derive(Clone, Debug)]
pub struct LodModel {
    /// 严格递增的必需骨骼
    pub required_bones: Vec<usize>,
    /// 实例顶点权重对应的必需骨骼（替代默认列表）
    pub alt_required_bones: Option<Vec<usize>>,
}

impl LodModel {
    pub fn new(required_bones: Vec<usize>) -> Self {
        Self {
            required_bones,
            alt_required_bones: None,
        }
    }

    pub fn with_alt_weights(mut self, alt_required_bones: Vec<usize>) -> Self {
        self.alt_required_bones = Some(alt_required_bones);
        self
    }

    /// 是否带替代顶点权重
    pub fn has_alt_weights(&self) -> bool {
        self.alt_required_bones.is_some()
    }

    /// 按是否启用实例权重取必需骨骼
    pub fn required_bones_for(&self, use_instance_weights: bool) -> &[usize] {
        match (&self.alt_required_bones, use_instance_weights) {
            (Some(alt), true) => alt,
            _ => &self.required_bones,
        }
    }
}

/// 挂点
#[derive(Clone, Debug)]
pub struct Socket {
    pub name: String,
    pub bone_name: String,
    /// 相对骨骼的偏移
    pub relative: BoneAtom,
}

impl Socket {
    pub fn new(name: impl Into<String>, bone_name: impl Into<String>, relative: BoneAtom) -> Self {
        Self {
            name: name.into(),
            bone_name: bone_name.into(),
            relative,
        }
    }
}

/// 骨骼网格（只读共享资源）
#[derive(Clone, Debug)]
pub struct SkeletalMesh {
    pub name: String,
    pub skeleton: RefSkeleton,
    pub lod_models: Vec<LodModel>,
    pub sockets: Vec<Socket>,
    /// 开启逐多边形碰撞的骨骼
    pub per_poly_bones: Vec<usize>,
    pub mirror_table: Vec<MirrorInfo>,
    pub morph_sets: Vec<Arc<MorphTargetSet>>,
    /// 面部动画资产名
    pub face_asset: Option<String>,
}

impl SkeletalMesh {
    /// 构建并校验网格
    pub fn new(name: impl Into<String>, skeleton: RefSkeleton, lod_models: Vec<LodModel>) -> Result<Self> {
        let name = name.into();
        if lod_models.is_empty() {
            return Err(SkelError::InvalidLod(0));
        }
        for (lod, model) in lod_models.iter().enumerate() {
            validate_lod_bones(&skeleton, &model.required_bones)
                .map_err(|e| SkelError::InvalidSkeleton(format!("{} LOD {}: {}", name, lod, e)))?;
            if let Some(alt) = &model.alt_required_bones {
                validate_lod_bones(&skeleton, alt)
                    .map_err(|e| SkelError::InvalidSkeleton(format!("{} LOD {} 实例权重: {}", name, lod, e)))?;
            }
        }
        Ok(Self {
            name,
            skeleton,
            lod_models,
            sockets: Vec::new(),
            per_poly_bones: Vec::new(),
            mirror_table: Vec::new(),
            morph_sets: Vec::new(),
            face_asset: None,
        })
    }

    pub fn with_socket(mut self, socket: Socket) -> Self {
        self.sockets.push(socket);
        self
    }

    pub fn with_per_poly_bones(mut self, bones: Vec<usize>) -> Self {
        self.per_poly_bones = bones;
        self
    }

    pub fn with_mirror_table(mut self, table: Vec<MirrorInfo>) -> Self {
        self.mirror_table = table;
        self
    }

    pub fn with_morph_set(mut self, set: MorphTargetSet) -> Self {
        self.morph_sets.push(Arc::new(set));
        self
    }

    pub fn with_face_asset(mut self, asset: impl Into<String>) -> Self {
        self.face_asset = Some(asset.into());
        self
    }

    pub fn lod_count(&self) -> usize {
        self.lod_models.len()
    }

    pub fn find_socket(&self, name: &str) -> Option<&Socket> {
        self.sockets.iter().find(|s| s.name == name)
    }
}

/// LOD 必需骨骼：严格递增、不越界、父骨骼在列表中（或为根）
fn validate_lod_bones(skeleton: &RefSkeleton, bones: &[usize]) -> std::result::Result<(), String> {
    let bone_count = skeleton.bone_count();
    if bones.windows(2).any(|w| w[0] >= w[1]) {
        return Err("必需骨骼不是严格递增".to_string());
    }
    for &bone in bones {
        if bone >= bone_count {
            return Err(format!("骨骼索引 {} 越界", bone));
        }
        let parent = skeleton.parent_index(bone);
        if bone != 0 && parent != 0 && bones.binary_search(&parent).is_err() {
            return Err(format!(
                "骨骼 {} 的父骨骼 {} 不在列表中",
                skeleton.bone_name(bone),
                skeleton.bone_name(parent)
            ));
        }
    }
    Ok(())
}
