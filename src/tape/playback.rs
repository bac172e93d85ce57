//! 回放控制
//!
//! 回放位置总是夹在 [start_time, end_time] 之内。任意时刻的状态都从时间线头部重新折叠，
//! 所以向后拖动与向前拖动得到的结果一致。

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, TimeDelta, Utc};

use super::loader::Tape;
use crate::capture::record::RequestRecord;

impl Tape {
    /// 指定时刻每个请求的状态（按 ID 升序）
    pub fn requests_at_time(&self, time: DateTime<Utc>) -> Vec<RequestRecord> {
        let mut states = BTreeMap::new();
        for entry in self.timeline.iter().take_while(|e| e.time <= time) {
            if let Some(record) = self.snapshot_at(entry) {
                states.insert(record.id, record);
            }
        }
        states.into_values().collect()
    }

    /// 当前回放位置的请求状态
    pub fn current_requests(&self) -> Vec<RequestRecord> {
        self.requests_at_time(self.current_time)
    }

    pub fn seek_to_time(&mut self, time: DateTime<Utc>) {
        self.current_time = time.clamp(self.start_time, self.end_time);
    }

    /// 按比例定位，`percent` 取 0.0 到 1.0
    pub fn seek_to_percent(&mut self, percent: f64) {
        let percent = if percent.is_nan() { 0.0 } else { percent.clamp(0.0, 1.0) };
        let total = self.duration.num_nanoseconds().unwrap_or(i64::MAX) as f64;
        let offset = TimeDelta::nanoseconds((total * percent) as i64);
        self.seek_to_time(self.start_time + offset);
    }

    /// 前进到下一个事件时刻，返回之后是否还有事件
    pub fn step_forward(&mut self) -> bool {
        let current = self.current_time;
        let Some(next) = self.timeline.iter().map(|e| e.time).find(|t| *t > current) else {
            return false;
        };
        self.seek_to_time(next);
        self.timeline.iter().any(|e| e.time > next)
    }

    /// 后退到上一个事件时刻，返回之前是否还有事件
    pub fn step_backward(&mut self) -> bool {
        let current = self.current_time;
        let Some(prev) = self.timeline.iter().rev().map(|e| e.time).find(|t| *t < current) else {
            return false;
        };
        self.seek_to_time(prev);
        self.timeline.iter().any(|e| e.time < prev)
    }

    /// 回放进度（0.0 到 1.0）
    pub fn progress(&self) -> f64 {
        let total = self.duration.num_nanoseconds().unwrap_or(0);
        if total <= 0 {
            return 0.0;
        }
        let elapsed = (self.current_time - self.start_time).num_nanoseconds().unwrap_or(0);
        (elapsed as f64 / total as f64).clamp(0.0, 1.0)
    }

    /// 按播放时钟推进回放位置，返回是否还在播放
    pub fn advance(&mut self, clock: &PlaybackClock, now: Instant) -> bool {
        let (time, finished) = clock.tape_time(now, self.end_time);
        self.seek_to_time(time);
        !finished
    }
}

/// 播放时钟：把墙上时间按倍速映射为磁带时间
#[derive(Debug, Clone, Copy)]
pub struct PlaybackClock {
    wall_start: Instant,
    tape_start: DateTime<Utc>,
    speed: f64,
}

impl PlaybackClock {
    pub fn new(tape_start: DateTime<Utc>, speed: f64) -> Self {
        Self::starting_at(Instant::now(), tape_start, speed)
    }

    pub fn starting_at(wall_start: Instant, tape_start: DateTime<Utc>, speed: f64) -> Self {
        let speed = if speed.is_finite() && speed > 0.0 { speed } else { 1.0 };
        Self {
            wall_start,
            tape_start,
            speed,
        }
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// 返回 (磁带时间, 是否已到结尾)，到达结尾时夹在 `end`
    pub fn tape_time(&self, now: Instant, end: DateTime<Utc>) -> (DateTime<Utc>, bool) {
        let elapsed = now.saturating_duration_since(self.wall_start).as_secs_f64() * self.speed;
        let offset = TimeDelta::nanoseconds((elapsed * 1e9).min(i64::MAX as f64) as i64);
        let time = self.tape_start + offset;
        if time >= end { (end, true) } else { (time, false) }
    }
}
