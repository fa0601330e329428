//! 参考骨骼

use super::BoneAtom;

/// 参考骨骼（绑定姿态）
#[derive(Clone, Debug)]
pub struct RefBone {
    pub name: String,
    /// 父骨骼索引；根骨骼为 0
    pub parent_index: usize,
    /// 局部空间绑定变换（缩放为 1）
    pub bind_pose: BoneAtom,
}

impl RefBone {
    pub fn new(name: impl Into<String>, parent_index: usize, bind_pose: BoneAtom) -> Self {
        Self {
            name: name.into(),
            parent_index,
            bind_pose,
        }
    }
}

/// 骨骼可见性（每骨骼一字节）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum BoneVisibility {
    #[default]
    Visible = 0,
    /// 用户显式隐藏
    ExplicitlyHidden = 1,
    /// 父骨骼被隐藏
    HiddenByParent = 2,
}

impl BoneVisibility {
    pub fn is_visible(self) -> bool {
        self == BoneVisibility::Visible
    }
}

/// 镜像表条目
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MirrorInfo {
    /// 镜像来源骨骼；等于自身表示只做轴翻转
    pub source_index: usize,
}
