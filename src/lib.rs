pub mod cache;
pub mod charset;
pub mod config;
pub mod dispatch;
pub mod encoding;
pub mod exception;
pub mod form;
pub mod header;
pub mod hooks;
pub mod param;
pub mod pipeline;
pub mod request;
pub mod response;
pub mod staticfile;
pub mod tools;
pub mod tree;
pub mod util;

pub use cache::ResponseCache;
pub use charset::Charset;
pub use config::{AppConfig, Config, ServerConfig};
pub use dispatch::{Arguments, Handler, Node, TreeNode};
pub use encoding::HttpEncoding;
pub use exception::Exception;
pub use hooks::{HookMap, HookPoint};
pub use param::{HttpRequestMethod, HttpVersion};
pub use pipeline::{Context, RequestPipeline, Server, ServingGuard};
pub use request::{RawRequest, Request};
pub use response::{Body, Cookie, Response, Served};
pub use tools::{Tool, ToolBox, ToolConf};
pub use tree::{Application, Tree};
pub use util::HtmlBuilder;
