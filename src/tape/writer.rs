//! 后台 Tape 写入
//!
//! 请求路径只把事件发进 channel，唯一的后台任务在阻塞线程池里批量写盘，
//! fsync 不会占用 tokio 工作线程。事件时间在发送时取，序号按 channel 顺序分配。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::event::{TapeError, TapeEventType};
use super::recorder::TapeRecorder;
use crate::capture::record::RequestRecord;

/// 单批最多写入的事件数
const MAX_BATCH: usize = 256;

enum TapeCommand {
    Request {
        timestamp: DateTime<Utc>,
        event_type: TapeEventType,
        record: Box<RequestRecord>,
    },
    /// 写入 session_end 后停止，回传最终序号
    Finish(oneshot::Sender<Result<u64, TapeError>>),
}

/// Tape 写入句柄，可在多个代理实例间克隆共享
#[derive(Clone)]
pub struct TapeWriter {
    sender: mpsc::UnboundedSender<TapeCommand>,
}

impl TapeWriter {
    /// 启动后台写入任务（需要在 tokio 运行时内调用）
    pub fn spawn(recorder: TapeRecorder) -> Self {
        // 无界：丢弃事件会让 request_start / request_complete 不再成对
        let (sender, mut receiver) = mpsc::unbounded_channel::<TapeCommand>();
        let recorder = Arc::new(Mutex::new(recorder));

        tokio::spawn(async move {
            while let Some(first) = receiver.recv().await {
                let mut batch = vec![first];
                while batch.len() < MAX_BATCH {
                    match receiver.try_recv() {
                        Ok(command) => batch.push(command),
                        Err(_) => break,
                    }
                }

                let recorder = recorder.clone();
                match tokio::task::spawn_blocking(move || write_batch(&recorder, batch)).await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!("Tape 写入任务异常退出: {}", e);
                        break;
                    }
                }
            }
        });

        Self { sender }
    }

    pub fn request_start(&self, record: &RequestRecord) {
        self.send(TapeEventType::RequestStart, record);
    }

    pub fn request_update(&self, record: &RequestRecord) {
        self.send(TapeEventType::RequestUpdate, record);
    }

    pub fn request_complete(&self, record: &RequestRecord) {
        self.send(TapeEventType::RequestComplete, record);
    }

    fn send(&self, event_type: TapeEventType, record: &RequestRecord) {
        let command = TapeCommand::Request {
            timestamp: Utc::now(),
            event_type,
            record: Box::new(record.clone()),
        };
        if self.sender.send(command).is_err() {
            tracing::debug!("Tape 已关闭，丢弃事件 #{}", record.id);
        }
    }

    /// 写完已排队的事件和 session_end，停止后台任务，返回最终序号
    pub async fn finish(&self) -> Result<u64, TapeError> {
        let (reply, done) = oneshot::channel();
        self.sender
            .send(TapeCommand::Finish(reply))
            .map_err(|_| TapeError::Closed)?;
        done.await.map_err(|_| TapeError::Closed)?
    }
}

/// 写入一批事件，返回是否已收到停止命令
fn write_batch(recorder: &Mutex<TapeRecorder>, batch: Vec<TapeCommand>) -> bool {
    let mut recorder = recorder.lock();
    for command in batch {
        match command {
            TapeCommand::Request {
                timestamp,
                event_type,
                record,
            } => {
                if let Err(e) = recorder.write_event_at(timestamp, event_type, &*record) {
                    tracing::warn!("写入 Tape {:?} 事件失败: {}", event_type, e);
                }
            }
            TapeCommand::Finish(reply) => {
                let _ = reply.send(recorder.write_session_end());
                return true;
            }
        }
    }
    false
}
