//! 请求捕获
//!
//! 每个代理实例把 LLM 端点的请求登记到共享的 [`RequestRegistry`]，
//! 响应边转发边记录，结束时恰好收尾一次。

pub mod body;
pub mod endpoint;
pub mod finalize;
pub mod handler;
pub mod record;
pub mod registry;
pub mod server;

pub use finalize::CaptureServices;
pub use handler::ProxyInstance;
pub use record::{RequestRecord, RequestStatus};
pub use registry::{RequestRegistry, spawn_log_observer};
pub use server::serve_proxy;
