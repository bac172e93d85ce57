//! 请求查看 API
//!
//! 只读 HTTP 接口：列表、详情与统计，数据来自共享的请求登记表快照

mod handlers;
mod router;
mod types;

pub use router::{create_inspect_router, serve_inspect};
