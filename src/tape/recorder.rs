//! Tape 写入
//!
//! 追加写 NDJSON，每个事件写完即 flush + fsync。序号由写入器自己维护，
//! 写入器只能有一个逻辑写者：运行中的代理通过 [`super::writer::TapeWriter`] 把事件交给唯一的后台任务。

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::event::{TAPE_VERSION, TapeError, TapeEvent, TapeEventType, TapeSession};
use crate::capture::record::RequestRecord;

pub struct TapeRecorder {
    file: File,
    sequence: u64,
}

impl TapeRecorder {
    /// 创建（或截断）Tape 文件
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, TapeError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file, sequence: 0 })
    }

    /// 最近一次写入的序号
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// 以当前时间写入事件，返回序号
    pub fn write_event<T: Serialize>(
        &mut self,
        event_type: TapeEventType,
        data: &T,
    ) -> Result<u64, TapeError> {
        self.write_event_at(Utc::now(), event_type, data)
    }

    /// 以指定时间写入事件
    pub fn write_event_at<T: Serialize>(
        &mut self,
        timestamp: DateTime<Utc>,
        event_type: TapeEventType,
        data: &T,
    ) -> Result<u64, TapeError> {
        let data = serde_json::to_value(data)?;
        self.sequence += 1;
        let event = TapeEvent {
            timestamp,
            event_type,
            sequence: self.sequence,
            data,
        };

        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(self.sequence)
    }

    pub fn write_session_start(&mut self, listen_addr: &str, target_url: &str) -> Result<u64, TapeError> {
        let session = TapeSession {
            listen_addr: listen_addr.to_string(),
            target_url: target_url.to_string(),
            start_time: Utc::now(),
            version: TAPE_VERSION.to_string(),
            session_id: Some(uuid::Uuid::new_v4().to_string()),
        };
        self.write_event_at(session.start_time, TapeEventType::SessionStart, &session)
    }

    pub fn write_session_end(&mut self) -> Result<u64, TapeError> {
        self.write_event(TapeEventType::SessionEnd, &serde_json::json!({}))
    }

    /// 导出会话快照
    ///
    /// session_start 取最早请求的开始时间；每个请求写一个清空响应字段的 request_start，
    /// 已结束的请求再写一个时间为开始时间 + 耗时的 request_complete。返回写入的事件数。
    pub fn export_session<P: AsRef<Path>>(
        path: P,
        listen_addr: &str,
        target_url: &str,
        records: &[RequestRecord],
    ) -> Result<u64, TapeError> {
        let mut recorder = Self::create(path)?;

        let start_time = records
            .iter()
            .map(|r| r.start_time)
            .min()
            .unwrap_or_else(Utc::now);
        let session = TapeSession {
            listen_addr: listen_addr.to_string(),
            target_url: target_url.to_string(),
            start_time,
            version: TAPE_VERSION.to_string(),
            session_id: Some(uuid::Uuid::new_v4().to_string()),
        };
        recorder.write_event_at(start_time, TapeEventType::SessionStart, &session)?;

        for record in records {
            recorder.write_event_at(
                record.start_time,
                TapeEventType::RequestStart,
                &record.as_pending(),
            )?;
            if record.status.is_terminal() {
                recorder.write_event_at(record.end_time(), TapeEventType::RequestComplete, record)?;
            }
        }

        recorder.write_session_end()?;
        Ok(recorder.sequence())
    }
}
