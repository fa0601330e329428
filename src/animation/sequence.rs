//! 动画序列与动画集
//!
//! 序列按骨骼名存储关键帧轨道，采样时按时间查找前后关键帧插值。
//! 骨骼名到骨架索引的对应关系由播放节点在延迟初始化时建立。

use std::sync::Arc;

use glam::{Quat, Vec3};

use super::BezierCurve;
use crate::skeleton::{BoneAtom, RefSkeleton};

/// 骨骼关键帧
#[derive(Clone, Debug)]
pub struct BoneKey {
    pub time: f32,
    pub translation: Vec3,
    pub rotation: Quat,
    /// 到下一关键帧的缓动；None 为线性
    pub ease: Option<BezierCurve>,
}

impl BoneKey {
    pub fn new(time: f32, translation: Vec3, rotation: Quat) -> Self {
        Self {
            time,
            translation,
            rotation,
            ease: None,
        }
    }
}

/// 单根骨骼的关键帧轨道
#[derive(Clone, Debug)]
pub struct BoneTrack {
    pub bone_name: String,
    /// 按时间升序
    pub keys: Vec<BoneKey>,
}

impl BoneTrack {
    pub fn new(bone_name: impl Into<String>, mut keys: Vec<BoneKey>) -> Self {
        keys.sort_by(|a, b| a.time.total_cmp(&b.time));
        Self {
            bone_name: bone_name.into(),
            keys,
        }
    }

    /// 查找前后关键帧
    fn search_closest(&self, time: f32) -> (Option<&BoneKey>, Option<&BoneKey>) {
        let next = self.keys.partition_point(|k| k.time <= time);
        let prev = if next > 0 { self.keys.get(next - 1) } else { None };
        (prev, self.keys.get(next))
    }

    /// 在时间点采样（不处理循环）
    pub fn sample(&self, time: f32) -> (Vec3, Quat) {
        match self.search_closest(time) {
            (Some(prev), Some(next)) => {
                let span = next.time - prev.time;
                let mut t = if span > 0.0 { (time - prev.time) / span } else { 0.0 };
                if let Some(ease) = &prev.ease {
                    t = ease.evaluate(t);
                }
                let translation = prev.translation.lerp(next.translation, t);
                let rotation = prev.rotation.slerp(next.rotation, t).normalize();
                (translation, rotation)
            }
            (Some(k), None) | (None, Some(k)) => (k.translation, k.rotation),
            (None, None) => (Vec3::ZERO, Quat::IDENTITY),
        }
    }
}

/// 标量曲线（Morph 曲线）
#[derive(Clone, Debug)]
pub struct CurveTrack {
    pub name: String,
    /// (时间, 值)，按时间升序
    pub keys: Vec<(f32, f32)>,
}

impl CurveTrack {
    pub fn new(name: impl Into<String>, mut keys: Vec<(f32, f32)>) -> Self {
        keys.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { name: name.into(), keys }
    }

    pub fn sample(&self, time: f32) -> f32 {
        let next = self.keys.partition_point(|k| k.0 <= time);
        match (next.checked_sub(1).and_then(|i| self.keys.get(i)), self.keys.get(next)) {
            (Some(&(t0, v0)), Some(&(t1, v1))) => {
                let span = t1 - t0;
                if span > 0.0 {
                    v0 + (v1 - v0) * ((time - t0) / span)
                } else {
                    v0
                }
            }
            (Some(&(_, v)), None) | (None, Some(&(_, v))) => v,
            (None, None) => 0.0,
        }
    }
}

/// 动画通知
#[derive(Clone, Debug)]
pub struct AnimNotify {
    pub time: f32,
    pub name: String,
}

/// 动画序列
#[derive(Clone, Debug)]
pub struct AnimSequence {
    pub name: String,
    /// 长度（秒）
    pub sequence_length: f32,
    pub rate_scale: f32,
    pub tracks: Vec<BoneTrack>,
    pub curves: Vec<CurveTrack>,
    /// 按时间升序
    pub notifies: Vec<AnimNotify>,
    /// 播放时按节点权重驱动的骨骼控制器名
    pub skel_control_metadata: Vec<String>,
}

impl AnimSequence {
    pub fn new(name: impl Into<String>, sequence_length: f32) -> Self {
        Self {
            name: name.into(),
            sequence_length: sequence_length.max(0.0),
            rate_scale: 1.0,
            tracks: Vec::new(),
            curves: Vec::new(),
            notifies: Vec::new(),
            skel_control_metadata: Vec::new(),
        }
    }

    pub fn with_track(mut self, track: BoneTrack) -> Self {
        self.tracks.push(track);
        self
    }

    pub fn with_curve(mut self, curve: CurveTrack) -> Self {
        self.curves.push(curve);
        self
    }

    pub fn with_notify(mut self, time: f32, name: impl Into<String>) -> Self {
        self.notifies.push(AnimNotify {
            time,
            name: name.into(),
        });
        self.notifies.sort_by(|a, b| a.time.total_cmp(&b.time));
        self
    }

    /// 轨道 → 骨骼索引
    pub fn link_to_skeleton(&self, skeleton: &RefSkeleton) -> Vec<Option<usize>> {
        self.tracks
            .iter()
            .map(|t| skeleton.find_bone_by_name(&t.bone_name))
            .collect()
    }

    /// 采样一条轨道，缩放取参考姿态
    pub fn bone_atom(&self, track_index: usize, time: f32, ref_pose: &BoneAtom) -> BoneAtom {
        match self.tracks.get(track_index) {
            Some(track) => {
                let time = time.clamp(0.0, self.sequence_length);
                let (translation, rotation) = track.sample(time);
                BoneAtom::new(rotation, translation, ref_pose.scale)
            }
            None => *ref_pose,
        }
    }

    /// 区间 (from, to] 内的通知；`to < from` 视为循环跨越结尾
    pub fn notifies_between(&self, from: f32, to: f32, looping: bool) -> Vec<&AnimNotify> {
        if to >= from {
            self.notifies.iter().filter(|n| n.time > from && n.time <= to).collect()
        } else if looping {
            self.notifies
                .iter()
                .filter(|n| n.time > from)
                .chain(self.notifies.iter().filter(|n| n.time <= to))
                .collect()
        } else {
            Vec::new()
        }
    }
}

/// 动画集
#[derive(Clone, Debug, Default)]
pub struct AnimSet {
    pub name: String,
    pub sequences: Vec<Arc<AnimSequence>>,
}

impl AnimSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sequences: Vec::new(),
        }
    }

    pub fn add_sequence(&mut self, sequence: AnimSequence) {
        self.sequences.push(Arc::new(sequence));
    }

    pub fn find_sequence(&self, name: &str) -> Option<Arc<AnimSequence>> {
        self.sequences.iter().find(|s| s.name == name).cloned()
    }
}

/// 实例绑定的动画集列表，后加入的优先
#[derive(Clone, Debug, Default)]
pub struct AnimSetList {
    pub sets: Vec<Arc<AnimSet>>,
}

impl AnimSetList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, set: AnimSet) {
        self.sets.push(Arc::new(set));
    }

    pub fn find_sequence(&self, name: &str) -> Option<Arc<AnimSequence>> {
        self.sets.iter().rev().find_map(|set| set.find_sequence(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk() -> AnimSequence {
        AnimSequence::new("walk", 1.0)
            .with_track(BoneTrack::new(
                "root",
                vec![
                    BoneKey::new(0.0, Vec3::ZERO, Quat::IDENTITY),
                    BoneKey::new(1.0, Vec3::new(10.0, 0.0, 0.0), Quat::from_rotation_z(1.0)),
                ],
            ))
            .with_curve(CurveTrack::new("smile", vec![(0.0, 0.0), (1.0, 1.0)]))
            .with_notify(0.5, "footstep")
    }

    #[test]
    fn test_track_sampling_interpolates() {
        let seq = walk();
        let atom = seq.bone_atom(0, 0.5, &BoneAtom::IDENTITY);
        assert!(atom.translation.abs_diff_eq(Vec3::new(5.0, 0.0, 0.0), 1.0e-4));
        assert!(atom.rotation.dot(Quat::from_rotation_z(0.5)).abs() > 0.9999);
        // 超出长度夹到末帧
        let end = seq.bone_atom(0, 3.0, &BoneAtom::IDENTITY);
        assert!(end.translation.abs_diff_eq(Vec3::new(10.0, 0.0, 0.0), 1.0e-4));
        // 越界轨道取参考姿态
        let reference = BoneAtom::from_translation(Vec3::Z);
        assert_eq!(seq.bone_atom(7, 0.5, &reference), reference);
    }

    #[test]
    fn test_curve_sampling() {
        let seq = walk();
        assert!((seq.curves[0].sample(0.25) - 0.25).abs() < 1.0e-5);
        assert!((seq.curves[0].sample(-1.0)).abs() < 1.0e-5);
    }

    #[test]
    fn test_notifies_between_wraps_when_looping() {
        let seq = walk();
        assert_eq!(seq.notifies_between(0.4, 0.6, false).len(), 1);
        assert_eq!(seq.notifies_between(0.5, 0.6, false).len(), 0);
        assert_eq!(seq.notifies_between(0.9, 0.6, true).len(), 1);
        assert_eq!(seq.notifies_between(0.9, 0.6, false).len(), 0);
    }

    #[test]
    fn test_set_list_later_set_wins() {
        let mut base = AnimSet::new("base");
        base.add_sequence(AnimSequence::new("idle", 1.0));
        let mut overrides = AnimSet::new("override");
        overrides.add_sequence(AnimSequence::new("idle", 2.0));
        let mut list = AnimSetList::new();
        list.push(base);
        list.push(overrides);
        let idle = list.find_sequence("idle").unwrap();
        assert!((idle.sequence_length - 2.0).abs() < 1.0e-6);
        assert!(list.find_sequence("run").is_none());
    }
}
