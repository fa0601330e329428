//! 参考骨架

use std::collections::HashMap;

use super::{BoneAtom, RefBone};
use crate::{Result, SkelError};

/// 参考骨架：有序骨骼列表，父骨骼索引总是小于子骨骼
#[derive(Clone, Debug)]
pub struct RefSkeleton {
    bones: Vec<RefBone>,
    name_to_index: HashMap<String, usize>,
    /// 绑定姿态的组件空间变换
    ref_component_space: Vec<BoneAtom>,
}

impl RefSkeleton {
    /// 构建并校验骨架
    pub fn new(bones: Vec<RefBone>) -> Result<Self> {
        if bones.is_empty() {
            return Err(SkelError::InvalidSkeleton("骨架为空".to_string()));
        }

        let mut name_to_index = HashMap::with_capacity(bones.len());
        for (i, bone) in bones.iter().enumerate() {
            if i == 0 {
                if bone.parent_index != 0 {
                    return Err(SkelError::InvalidSkeleton(format!(
                        "根骨骼 {} 的父索引必须为 0",
                        bone.name
                    )));
                }
            } else if bone.parent_index >= i {
                return Err(SkelError::InvalidSkeleton(format!(
                    "骨骼 {}({}) 的父索引 {} 不在它之前",
                    bone.name, i, bone.parent_index
                )));
            }
            if name_to_index.insert(bone.name.clone(), i).is_some() {
                return Err(SkelError::InvalidSkeleton(format!("骨骼名重复: {}", bone.name)));
            }
        }

        let mut ref_component_space: Vec<BoneAtom> = Vec::with_capacity(bones.len());
        for (i, bone) in bones.iter().enumerate() {
            let mut local = bone.bind_pose;
            local.normalize_rotation();
            let cs = if i == 0 {
                local
            } else {
                local * ref_component_space[bone.parent_index]
            };
            ref_component_space.push(cs);
        }

        Ok(Self {
            bones,
            name_to_index,
            ref_component_space,
        })
    }

    /// 获取骨骼数量
    pub fn bone_count(&self) -> usize {
        self.bones.len()
    }

    /// 获取骨骼
    pub fn get_bone(&self, index: usize) -> Option<&RefBone> {
        self.bones.get(index)
    }

    pub fn bones(&self) -> &[RefBone] {
        &self.bones
    }

    /// 通过名称查找骨骼
    pub fn find_bone_by_name(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    pub fn parent_index(&self, index: usize) -> usize {
        self.bones[index].parent_index
    }

    pub fn bone_name(&self, index: usize) -> &str {
        self.bones.get(index).map(|b| b.name.as_str()).unwrap_or("None")
    }

    /// 局部绑定姿态
    pub fn ref_pose(&self, index: usize) -> BoneAtom {
        self.bones[index].bind_pose
    }

    /// 绑定姿态的组件空间变换
    pub fn ref_component_space(&self, index: usize) -> BoneAtom {
        self.ref_component_space[index]
    }

    pub fn ref_component_space_all(&self) -> &[BoneAtom] {
        &self.ref_component_space
    }

    /// 用绑定姿态填充指定骨骼
    pub fn fill_ref_pose(&self, atoms: &mut [BoneAtom], required: &[usize]) {
        for &b in required {
            if let Some(atom) = atoms.get_mut(b) {
                *atom = self.bones[b].bind_pose;
            }
        }
    }

    /// 完整的绑定姿态数组
    pub fn ref_pose_array(&self) -> Vec<BoneAtom> {
        self.bones.iter().map(|b| b.bind_pose).collect()
    }

    /// `child` 是否是 `ancestor` 的后代
    pub fn bone_is_child_of(&self, child: usize, ancestor: usize) -> bool {
        if child >= self.bones.len() || ancestor >= child {
            return false;
        }
        let mut current = child;
        while current != 0 {
            current = self.bones[current].parent_index;
            if current == ancestor {
                return true;
            }
        }
        false
    }

    /// 从 `index` 向上走 `steps` 层，越过根时返回 None
    pub fn ancestor(&self, index: usize, steps: usize) -> Option<usize> {
        let mut current = index;
        for _ in 0..steps {
            if current == 0 {
                return None;
            }
            current = self.bones[current].parent_index;
        }
        Some(current)
    }
}
