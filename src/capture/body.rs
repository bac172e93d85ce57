//! 边转发边记录的响应体

use std::io::Read;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use flate2::read::GzDecoder;
use futures::Stream;
use futures::stream::BoxStream;

use super::finalize::{CaptureGuard, Exchange};
use crate::common::HeaderMultiMap;

/// 包装上游响应流
///
/// 每个分片原样转发给客户端，同时保留一份副本。首个分片到达时记录首字节时间。
/// 上游结束或收满 Content-Length 时正常收尾；上游出错时按中断收尾，不写缓存；
/// 在此之前被丢弃说明客户端已断开。
pub struct RecordingBody {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    guard: CaptureGuard,
    status_code: u16,
    headers: HeaderMultiMap,
    expected_len: Option<u64>,
    buffer: BytesMut,
    ttft: Option<Duration>,
}

impl RecordingBody {
    pub fn new(
        inner: BoxStream<'static, reqwest::Result<Bytes>>,
        guard: CaptureGuard,
        status_code: u16,
        headers: HeaderMultiMap,
        expected_len: Option<u64>,
    ) -> Self {
        Self {
            inner,
            guard,
            status_code,
            headers,
            expected_len,
            buffer: BytesMut::new(),
            ttft: None,
        }
    }

    fn take_exchange(&mut self) -> Exchange {
        Exchange {
            status_code: self.status_code,
            headers: std::mem::take(&mut self.headers),
            body: std::mem::take(&mut self.buffer).freeze(),
            ttft: self.ttft,
            from_cache: false,
        }
    }

    fn finish(&mut self) {
        let exchange = self.take_exchange();
        self.guard.complete(exchange);
    }

    fn abort(&mut self) {
        let exchange = self.take_exchange();
        self.guard.abort(exchange);
    }
}

impl Stream for RecordingBody {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        match this.inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                if this.ttft.is_none() && !chunk.is_empty() {
                    this.ttft = Some(this.guard.elapsed());
                }
                this.buffer.extend_from_slice(&chunk);
                // 收满后服务端可能不再轮询流，这里提前收尾
                if this
                    .expected_len
                    .is_some_and(|len| this.buffer.len() as u64 >= len)
                {
                    this.finish();
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                tracing::warn!("读取上游响应流失败: {}", e);
                this.abort();
                Poll::Ready(Some(Err(std::io::Error::other(e))))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
        }
    }
}

/// `Content-Encoding` 含 gzip 时解压，失败时原样返回
pub fn decompress_if_gzip(headers: &HeaderMultiMap, body: Bytes) -> Bytes {
    let gzip = headers
        .get("content-encoding")
        .is_some_and(|values| values.iter().any(|v| v.to_ascii_lowercase().contains("gzip")));
    if !gzip || body.is_empty() {
        return body;
    }

    let mut out = Vec::new();
    match GzDecoder::new(&body[..]).read_to_end(&mut out) {
        Ok(_) => Bytes::from(out),
        Err(e) => {
            tracing::debug!("gzip 解压失败，保留原始响应体: {}", e);
            body
        }
    }
}
