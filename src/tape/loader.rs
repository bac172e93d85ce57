//! Tape 读取
//!
//! 逐行解析，坏行直接跳过。请求表保存每个请求在文件中最后出现的状态，
//! 时间线按事件时间稳定排序，回放时从时间线重新折叠出任意时刻的状态。

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;

use super::event::{TapeError, TapeEvent, TapeEventType, TapeSession};
use crate::capture::record::RequestRecord;

/// 时间线上的一个请求事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineEntry {
    pub time: DateTime<Utc>,
    /// 在 [`Tape::events`] 中的下标
    pub event_index: usize,
    pub request_id: u64,
}

#[derive(Debug, Clone)]
pub struct Tape {
    pub file_path: PathBuf,
    pub session: Option<TapeSession>,
    /// 成功解析的全部事件（文件顺序）
    pub events: Vec<TapeEvent>,
    /// 每个请求的最终状态，按 ID 升序
    pub requests: Vec<RequestRecord>,
    request_index: HashMap<u64, usize>,
    pub timeline: Vec<TimelineEntry>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: TimeDelta,
    /// 回放位置
    pub current_time: DateTime<Utc>,
    /// 被跳过的坏行数
    pub skipped_lines: usize,
}

impl Tape {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, TapeError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file), path)
    }

    pub fn from_reader<R: BufRead>(mut reader: R, path: &Path) -> Result<Self, TapeError> {
        let mut session = None;
        let mut events = Vec::new();
        let mut timeline = Vec::new();
        let mut latest: HashMap<u64, RequestRecord> = HashMap::new();
        let mut session_start = None;
        let mut session_end = None;
        let mut skipped_lines = 0;

        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let event: TapeEvent = match serde_json::from_slice(&line) {
                Ok(event) => event,
                Err(e) => {
                    tracing::debug!("跳过无法解析的 Tape 行: {}", e);
                    skipped_lines += 1;
                    continue;
                }
            };

            match event.event_type {
                TapeEventType::SessionStart => {
                    if let Ok(data) = TapeSession::deserialize(&event.data) {
                        session_start = Some(data.start_time);
                        session = Some(data);
                    }
                }
                TapeEventType::SessionEnd => session_end = Some(event.timestamp),
                _ => match RequestRecord::deserialize(&event.data) {
                    Ok(record) => {
                        timeline.push(TimelineEntry {
                            time: event.timestamp,
                            event_index: events.len(),
                            request_id: record.id,
                        });
                        latest.insert(record.id, record);
                    }
                    Err(e) => tracing::debug!("跳过无法解析的请求事件 seq={}: {}", event.sequence, e),
                },
            }
            events.push(event);
        }

        let mut requests: Vec<RequestRecord> = latest.into_values().collect();
        requests.sort_by_key(|r| r.id);
        let request_index = requests
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id, i))
            .collect();

        // 稳定排序：同一时刻的事件保持文件顺序
        timeline.sort_by_key(|e: &TimelineEntry| e.time);

        let start_time = session_start
            .or_else(|| timeline.first().map(|e| e.time))
            .unwrap_or_default();
        let end_time = session_end
            .or_else(|| timeline.last().map(|e| e.time))
            .unwrap_or(start_time)
            .max(start_time);

        Ok(Self {
            file_path: path.to_path_buf(),
            session,
            events,
            requests,
            request_index,
            timeline,
            start_time,
            end_time,
            duration: end_time - start_time,
            current_time: start_time,
            skipped_lines,
        })
    }

    /// 请求的最终状态
    pub fn request(&self, id: u64) -> Option<&RequestRecord> {
        self.request_index.get(&id).map(|&i| &self.requests[i])
    }

    /// 时间线条目对应事件中记录的请求状态
    pub fn snapshot_at(&self, entry: &TimelineEntry) -> Option<RequestRecord> {
        let event = self.events.get(entry.event_index)?;
        RequestRecord::deserialize(&event.data).ok()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capture::record::RequestStatus;
    use crate::tape::recorder::TapeRecorder;

    pub(crate) fn t(secs: i64) -> DateTime<Utc> {
        "2026-05-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap() + TimeDelta::seconds(secs)
    }

    pub(crate) fn record(id: u64, status: RequestStatus, output_tokens: u64) -> RequestRecord {
        RequestRecord {
            id,
            model: format!("model-{}", id),
            status,
            status_code: if status == RequestStatus::Pending { 0 } else { 200 },
            output_tokens,
            ..Default::default()
        }
    }

    /// 写出一盘带乱序事件的 Tape：
    /// #1 在 1s 开始、4s 完成；#2 在 2s 开始、3s 完成（文件里先写 #2 的完成事件）
    pub(crate) fn sample_tape(dir: &Path) -> Tape {
        let path = dir.join("sample.tape");
        let mut recorder = TapeRecorder::create(&path).unwrap();
        let session = TapeSession {
            listen_addr: "127.0.0.1:8080".to_string(),
            target_url: "https://api.openai.com".to_string(),
            start_time: t(0),
            version: "1.0".to_string(),
            session_id: None,
        };
        recorder.write_event_at(t(0), TapeEventType::SessionStart, &session).unwrap();
        recorder
            .write_event_at(t(3), TapeEventType::RequestComplete, &record(2, RequestStatus::Complete, 20))
            .unwrap();
        recorder
            .write_event_at(t(1), TapeEventType::RequestStart, &record(1, RequestStatus::Pending, 0))
            .unwrap();
        recorder
            .write_event_at(t(2), TapeEventType::RequestStart, &record(2, RequestStatus::Pending, 0))
            .unwrap();
        recorder
            .write_event_at(t(4), TapeEventType::RequestComplete, &record(1, RequestStatus::Complete, 10))
            .unwrap();
        recorder
            .write_event_at(t(5), TapeEventType::SessionEnd, &serde_json::json!({}))
            .unwrap();
        Tape::load(&path).unwrap()
    }

    #[test]
    fn test_load_builds_sorted_timeline() {
        let dir = tempfile::tempdir().unwrap();
        let tape = sample_tape(dir.path());

        assert_eq!(tape.events.len(), 6);
        assert_eq!(tape.timeline.len(), 4);
        assert!(tape.timeline.windows(2).all(|w| w[0].time <= w[1].time));
        assert_eq!(tape.timeline[0].request_id, 1);
        assert_eq!(tape.start_time, t(0));
        assert_eq!(tape.end_time, t(5));
        assert_eq!(tape.duration, TimeDelta::seconds(5));
        assert_eq!(tape.current_time, tape.start_time);
        assert_eq!(tape.session.as_ref().unwrap().listen_addr, "127.0.0.1:8080");
    }

    /// 请求表保存文件中最后出现的状态（#2 的最后一行是 request_start）
    #[test]
    fn test_requests_keep_last_in_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let tape = sample_tape(dir.path());

        let ids: Vec<u64> = tape.requests.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(tape.request(1).unwrap().status, RequestStatus::Complete);
        assert_eq!(tape.request(2).unwrap().status, RequestStatus::Pending);
        assert!(tape.request(3).is_none());
    }

    #[test]
    fn test_bad_lines_are_skipped() {
        let input = concat!(
            "{\"timestamp\":\"2026-05-01T12:00:01Z\",\"type\":\"request_start\",\"seq\":1,\"data\":{\"id\":1,\"status\":0}}\n",
            "not json at all\n",
            "\n",
            "{\"timestamp\":\"2026-05-01T12:00:02Z\",\"type\":\"mystery\",\"seq\":2,\"data\":{}}\n",
            "{\"timestamp\":\"2026-05-01T12:00:03Z\",\"type\":\"request_complete\",\"seq\":3,\"data\":{\"id\":1,\"status\":1}}",
        );
        let tape = Tape::from_reader(input.as_bytes(), Path::new("mem.tape")).unwrap();

        assert_eq!(tape.skipped_lines, 2);
        assert_eq!(tape.events.len(), 2);
        assert_eq!(tape.requests.len(), 1);
        assert_eq!(tape.requests[0].status, RequestStatus::Complete);
        // 没有 session 事件时由时间线决定起止
        assert!(tape.session.is_none());
        assert_eq!(tape.start_time, t(1));
        assert_eq!(tape.end_time, t(3));
    }

    #[test]
    fn test_empty_tape() {
        let tape = Tape::from_reader(&b""[..], Path::new("empty.tape")).unwrap();
        assert!(tape.requests.is_empty());
        assert!(tape.timeline.is_empty());
        assert_eq!(tape.duration, TimeDelta::zero());
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Tape::load(dir.path().join("nope.tape")),
            Err(TapeError::Io(_))
        ));
    }
}
