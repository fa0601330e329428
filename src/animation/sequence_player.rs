//! 序列播放节点
//!
//! 负责时间推进、循环、通知、动画结束事件、根运动提取和同步组位置换算。

use std::sync::Arc;

use glam::{Quat, Vec3};

use super::sequence::AnimSequence;
use super::{AnimSetList, CurveKey, PoseOutput};
use crate::skeleton::{BoneAtom, RefSkeleton};

/// 根骨骼平移各轴的处理方式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RootBoneOption {
    /// 按动画
    #[default]
    Default,
    /// 锁定到参考姿态
    Discard,
    /// 锁定到参考姿态，位移作为根运动提取
    Translate,
}

/// 根骨骼旋转的处理方式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RootRotationOption {
    #[default]
    Default,
    Discard,
    Extract,
}

/// 时间推进的结果
#[derive(Clone, Debug, Default)]
pub(crate) struct AdvanceResult {
    /// (通知名, 通知时间)
    pub notifies: Vec<(String, f32)>,
    pub ended: bool,
}

#[derive(Clone, Debug)]
pub struct SequencePlayer {
    pub anim_seq_name: String,
    pub rate: f32,
    pub playing: bool,
    pub looping: bool,
    pub current_time: f32,
    /// 本帧推进前的时间（根运动使用）
    pub previous_time: f32,

    // ========== 通知 ==========
    pub no_notifies: bool,
    /// 不在同步组时，节点权重低于此值不触发通知
    pub notify_weight_threshold: f32,

    // ========== 根运动 ==========
    pub root_bone_option: [RootBoneOption; 3],
    pub root_rotation_option: RootRotationOption,
    pub zero_root_translation: bool,
    pub zero_root_rotation: bool,

    /// 非循环播放结束后请求实例使用参考姿态
    pub force_refpose_when_not_playing: bool,

    // ========== 同步组 ==========
    pub sync_group: Option<String>,
    pub synchronize: bool,
    pub force_always_slave: bool,
    pub reverse_sync: bool,
    pub sync_pos_offset: f32,

    sequence: Option<Arc<AnimSequence>>,
    /// 骨骼索引 → 轨道索引
    bone_to_track: Vec<Option<usize>>,
}

impl SequencePlayer {
    pub fn new(anim_seq_name: impl Into<String>) -> Self {
        Self {
            anim_seq_name: anim_seq_name.into(),
            rate: 1.0,
            playing: false,
            looping: false,
            current_time: 0.0,
            previous_time: 0.0,
            no_notifies: false,
            notify_weight_threshold: 0.0,
            root_bone_option: [RootBoneOption::Default; 3],
            root_rotation_option: RootRotationOption::Default,
            zero_root_translation: false,
            zero_root_rotation: false,
            force_refpose_when_not_playing: false,
            sync_group: None,
            synchronize: true,
            force_always_slave: false,
            reverse_sync: false,
            sync_pos_offset: 0.0,
            sequence: None,
            bone_to_track: Vec::new(),
        }
    }

    pub fn sequence(&self) -> Option<&Arc<AnimSequence>> {
        self.sequence.as_ref()
    }

    /// 解析序列并建立骨骼到轨道的对应；找不到时返回 false
    pub(crate) fn link(&mut self, sets: &AnimSetList, skeleton: &RefSkeleton) -> bool {
        self.sequence = if self.anim_seq_name.is_empty() {
            None
        } else {
            sets.find_sequence(&self.anim_seq_name)
        };
        self.bone_to_track = vec![None; skeleton.bone_count()];
        let Some(seq) = &self.sequence else {
            return self.anim_seq_name.is_empty();
        };
        for (track, bone) in seq.link_to_skeleton(skeleton).into_iter().enumerate() {
            if let Some(bone) = bone {
                self.bone_to_track[bone] = Some(track);
            }
        }
        if self.current_time > seq.sequence_length {
            self.current_time = seq.sequence_length;
        }
        true
    }

    pub fn anim_length(&self) -> f32 {
        self.sequence.as_ref().map_or(0.0, |s| s.sequence_length)
    }

    pub fn play_anim(&mut self, looping: bool, rate: f32, start_time: f32) {
        self.looping = looping;
        self.rate = rate;
        self.current_time = start_time;
        self.previous_time = start_time;
        self.playing = true;
    }

    pub fn stop_anim(&mut self) {
        self.playing = false;
    }

    /// 归一化播放位置 [0, 1]
    pub fn normalized_position(&self) -> f32 {
        let length = self.anim_length();
        if length > 0.0 {
            (self.current_time / length).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// 本帧时间推进量
    pub(crate) fn move_delta(&self, delta_time: f32, group_rate_scale: f32) -> f32 {
        let rate_scale = self.sequence.as_ref().map_or(1.0, |s| s.rate_scale);
        self.rate * rate_scale * group_rate_scale * delta_time
    }

    /// 不在同步组时的 tick
    pub(crate) fn tick(&mut self, delta_time: f32, node_total_weight: f32) -> AdvanceResult {
        self.previous_time = self.current_time;
        if !self.playing || self.sequence.is_none() {
            return AdvanceResult::default();
        }
        let move_delta = self.move_delta(delta_time, 1.0);
        let fire = node_total_weight >= self.notify_weight_threshold;
        self.advance_by(move_delta, delta_time, fire)
    }

    /// 推进时间：先发通知，再处理循环与结束
    pub(crate) fn advance_by(&mut self, move_delta: f32, delta_time: f32, fire_notifies: bool) -> AdvanceResult {
        let mut result = AdvanceResult::default();
        let Some(seq) = self.sequence.clone() else {
            return result;
        };
        if move_delta == 0.0 || delta_time == 0.0 {
            return result;
        }

        if fire_notifies && !self.no_notifies {
            result.notifies = self.collect_notifies(&seq, move_delta);
        }

        self.current_time += move_delta;
        let end = seq.sequence_length;
        if self.current_time > end {
            if self.looping && end > 0.0 {
                self.current_time %= end;
            } else {
                self.current_time = end;
                self.playing = false;
                result.ended = true;
            }
        } else if self.current_time < 0.0 {
            if self.looping && end > 0.0 {
                self.current_time = self.current_time.rem_euclid(end);
            } else {
                self.current_time = 0.0;
                self.playing = false;
                result.ended = true;
            }
        }
        result
    }

    fn collect_notifies(&self, seq: &AnimSequence, move_delta: f32) -> Vec<(String, f32)> {
        let length = seq.sequence_length;
        let from = self.current_time;
        let to = from + move_delta;
        let hits = if move_delta > 0.0 {
            if to <= length {
                seq.notifies_between(from, to, false)
            } else if self.looping && length > 0.0 {
                seq.notifies_between(from, to % length, true)
            } else {
                seq.notifies_between(from, length, false)
            }
        } else {
            // 倒放：区间 [to, from)
            seq.notifies
                .iter()
                .filter(|n| n.time < from && n.time >= to.max(0.0))
                .collect()
        };
        hits.into_iter().map(|n| (n.name.clone(), n.time)).collect()
    }

    // ========== 同步组 ==========

    /// 同步组中的相对位置，考虑偏移与反向同步
    pub fn group_relative_position(&self) -> f32 {
        let length = self.anim_length();
        if length <= 0.0 {
            return 0.0;
        }
        let relative = (self.current_time / length - self.sync_pos_offset).rem_euclid(1.0);
        if self.reverse_sync {
            1.0 - relative
        } else {
            relative
        }
    }

    /// 组相对位置换算到本节点的归一化位置
    pub fn find_group_relative_position(&self, group_relative_position: f32) -> f32 {
        let normalized = (group_relative_position + self.sync_pos_offset).rem_euclid(1.0);
        if self.reverse_sync {
            1.0 - normalized
        } else {
            normalized
        }
    }

    /// 组相对位置换算到本节点的时间
    pub fn find_group_position(&self, group_relative_position: f32) -> f32 {
        self.find_group_relative_position(group_relative_position) * self.anim_length()
    }

    // ========== 求值 ==========

    pub(crate) fn evaluate(&self, skeleton: &RefSkeleton, required: &[usize]) -> PoseOutput {
        let mut out = PoseOutput::ref_pose(skeleton);
        let Some(seq) = &self.sequence else {
            return out;
        };

        for &bone in required {
            if let Some(track) = self.bone_to_track.get(bone).copied().flatten() {
                out.atoms[bone] = seq.bone_atom(track, self.current_time, &skeleton.ref_pose(bone));
            }
        }

        if let Some(root_track) = self.bone_to_track.first().copied().flatten() {
            self.process_root(seq, root_track, skeleton, &mut out);
        }

        out.curve_keys = seq
            .curves
            .iter()
            .map(|c| CurveKey {
                name: c.name.clone(),
                weight: c.sample(self.current_time),
            })
            .collect();
        out
    }

    /// 根运动提取与根骨骼锁定
    fn process_root(&self, seq: &AnimSequence, track: usize, skeleton: &RefSkeleton, out: &mut PoseOutput) {
        let ref_root = skeleton.ref_pose(0);
        let extract_translation = self.root_bone_option.contains(&RootBoneOption::Translate);
        let extract_rotation = self.root_rotation_option == RootRotationOption::Extract;

        if extract_translation || extract_rotation {
            out.has_root_motion = true;
            let (start_time, end_time) = (self.previous_time, self.current_time);
            if start_time != end_time {
                let sample = |t: f32| seq.bone_atom(track, t, &ref_root);
                let start = sample(start_time);
                let end = sample(end_time);
                let first = sample(0.0);
                let last = sample(seq.sequence_length);
                let reverse = self.move_delta(1.0, 1.0) < 0.0;
                let wrapped_forward = self.looping && !reverse && start_time > end_time;
                let wrapped_backward = self.looping && reverse && start_time < end_time;

                let mut delta = BoneAtom::IDENTITY;
                if extract_translation {
                    let mut t = if wrapped_forward {
                        (last.translation - start.translation) + (end.translation - first.translation)
                    } else if wrapped_backward {
                        (end.translation - last.translation) + (first.translation - start.translation)
                    } else {
                        end.translation - start.translation
                    };
                    for axis in 0..3 {
                        if self.root_bone_option[axis] != RootBoneOption::Translate {
                            t[axis] = 0.0;
                        }
                    }
                    delta.translation = t;
                }
                if extract_rotation {
                    let r = if wrapped_forward {
                        (last.rotation * start.rotation.inverse()) * (end.rotation * first.rotation.inverse())
                    } else if wrapped_backward {
                        (last.rotation * end.rotation.inverse()) * (start.rotation * first.rotation.inverse())
                    } else {
                        end.rotation * start.rotation.inverse()
                    };
                    delta.rotation = r.normalize();
                }
                out.root_motion_delta = delta;
            }
        }

        let root = &mut out.atoms[0];
        for axis in 0..3 {
            if self.root_bone_option[axis] != RootBoneOption::Default {
                root.translation[axis] = ref_root.translation[axis];
            }
        }
        if self.root_rotation_option != RootRotationOption::Default {
            root.rotation = ref_root.rotation;
        }
        if self.zero_root_translation {
            root.translation = Vec3::ZERO;
        }
        if self.zero_root_rotation {
            root.rotation = Quat::IDENTITY;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::animation::{AnimSet, BoneKey, BoneTrack};
    use crate::test_util::two_bone_skeleton;

    fn linked(seq: AnimSequence) -> SequencePlayer {
        let mut set = AnimSet::new("test");
        let name = seq.name.clone();
        set.add_sequence(seq);
        let mut sets = AnimSetList::new();
        sets.push(set);
        let mut player = SequencePlayer::new(name);
        assert!(player.link(&sets, &two_bone_skeleton()));
        player
    }

    fn moving_root() -> AnimSequence {
        AnimSequence::new("move", 1.0).with_track(BoneTrack::new(
            "root",
            vec![
                BoneKey::new(0.0, Vec3::ZERO, Quat::IDENTITY),
                BoneKey::new(1.0, Vec3::new(100.0, 0.0, 0.0), Quat::IDENTITY),
            ],
        ))
    }

    #[test]
    fn test_non_looping_stops_at_end() {
        let mut player = linked(moving_root());
        player.play_anim(false, 1.0, 0.0);
        assert!(!player.tick(0.6, 1.0).ended);
        let result = player.tick(0.6, 1.0);
        assert!(result.ended);
        assert!(!player.playing);
        assert!((player.current_time - 1.0).abs() < 1.0e-6);
    }

    #[test]
    fn test_looping_wraps_and_fires_notify() {
        let mut player = linked(moving_root().with_notify(0.1, "step"));
        player.play_anim(true, 1.0, 0.8);
        let result = player.tick(0.4, 1.0);
        assert!(!result.ended);
        assert!((player.current_time - 0.2).abs() < 1.0e-5);
        assert_eq!(result.notifies.len(), 1);
        assert_eq!(result.notifies[0].0, "step");
    }

    #[test]
    fn test_notify_weight_threshold() {
        let mut player = linked(moving_root().with_notify(0.1, "step"));
        player.notify_weight_threshold = 0.5;
        player.play_anim(false, 1.0, 0.0);
        assert!(player.tick(0.2, 0.3).notifies.is_empty());
    }

    #[test]
    fn test_root_translation_extraction_locks_root() {
        let skel = two_bone_skeleton();
        let mut player = linked(moving_root());
        player.root_bone_option = [RootBoneOption::Translate, RootBoneOption::Default, RootBoneOption::Default];
        player.play_anim(true, 1.0, 0.0);
        player.tick(0.25, 1.0);
        let out = player.evaluate(&skel, &[0, 1]);
        assert!(out.has_root_motion);
        assert!(out.root_motion_delta.translation.abs_diff_eq(Vec3::new(25.0, 0.0, 0.0), 1.0e-3));
        assert!(out.atoms[0].translation.abs_diff_eq(skel.ref_pose(0).translation, 1.0e-5));

        // 跨越循环结尾：0.9 → 0.1，共 20
        player.current_time = 0.9;
        player.tick(0.2, 1.0);
        let out = player.evaluate(&skel, &[0, 1]);
        assert!(out.root_motion_delta.translation.abs_diff_eq(Vec3::new(20.0, 0.0, 0.0), 1.0e-3));
    }

    #[test]
    fn test_group_position_round_trip() {
        let mut player = linked(moving_root());
        player.sync_pos_offset = 0.25;
        player.current_time = 0.5;
        let relative = player.group_relative_position();
        assert!((relative - 0.25).abs() < 1.0e-5);
        assert!((player.find_group_position(relative) - 0.5).abs() < 1.0e-5);
        player.reverse_sync = true;
        assert!((player.group_relative_position() - 0.75).abs() < 1.0e-5);
    }

    #[test]
    fn test_missing_sequence_gives_ref_pose() {
        let skel = two_bone_skeleton();
        let mut player = SequencePlayer::new("nope");
        assert!(!player.link(&AnimSetList::new(), &skel));
        let out = player.evaluate(&skel, &[0, 1]);
        assert_eq!(out.atoms, skel.ref_pose_array());
        assert!(!out.has_root_motion);
    }
}
