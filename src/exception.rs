// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # Exception 模块
//!
//! 该模块定义了请求处理管线在整个生命周期中可能抛出的各类异常情况。
//!
//! ## 设计意图
//! - **错误分类**：涵盖协议解析错误、对象树分发错误、处理器错误以及控制流信号。
//! - **控制流信号**：`RequestHandled`、`Redirect`、`InternalRedirect` 并不是真正的失败，
//!   而是钩子或处理器用来提前终止或改变处理流程的手段。
//! - **语义映射**：每个变体都可以通过 [`Exception::status_code`] 转换为 HTTP 状态码。

use std::fmt;

/// 请求处理过程中发生的异常类型。
#[derive(Debug, Clone, PartialEq)]
pub enum Exception {
    /// 客户端发送的请求头无法解析为合法的 UTF-8 字符串。
    RequestIsNotUtf8,
    /// 请求行格式不正确（例如缺少协议版本）。
    MalformedRequestLine(String),
    /// 客户端使用了服务器无法识别的 HTTP 方法。对应 `501 Not Implemented`。
    UnSupportedRequestMethod,
    /// 客户端与服务器的 HTTP 主版本号不一致。对应 `505`。
    UnsupportedHttpVersion,
    /// 违反协议的请求，例如 HTTP/1.1 请求缺少 `Host` 头。对应 `400`。
    BadRequest(String),
    /// 对象树中没有任何处理器能够匹配该路径。携带原始路径用于诊断。
    NotFound(String),
    /// 处理器或钩子主动抛出的 HTTP 错误。
    HttpError { status: u16, message: Option<String> },
    /// 钩子或处理器已经完整填充了响应，要求提前结束处理。不是失败。
    RequestHandled,
    /// 外部重定向（3xx）。`status` 为空时根据协议版本选择 302 或 303。
    Redirect { url: String, status: Option<u16> },
    /// 进程内重定向：在不往返客户端的情况下重新分发到新的路径。
    InternalRedirect { path: String, query_string: String },
    /// 同一请求中内部重定向到了已经访问过的路径。
    RedirectLoop(String),
    /// 请求头或请求体超过了配置的大小上限。对应 `413`。
    EntityTooLarge { limit: u64 },
    /// 应用代码中未被捕获的错误（包括 panic）。对应 `500`。
    HandlerError(String),
    /// 传输层中断。不会触发常规错误处理器，只会尽力运行清理钩子后向上传播。
    Interrupted,
    /// 两个应用被挂载到了同一个前缀。
    DuplicateMount(String),
    /// 配置文件无法读取或解析。
    ConfigError(String),
    /// 错误处理流程本身又失败了。
    DoubleFailure { first: String, second: String },
}

use Exception::*;

impl Exception {
    /// 该异常映射到的 HTTP 状态码。
    pub fn status_code(&self) -> u16 {
        match self {
            RequestIsNotUtf8 | MalformedRequestLine(_) | BadRequest(_) => 400,
            UnSupportedRequestMethod => 501,
            UnsupportedHttpVersion => 505,
            NotFound(_) => 404,
            HttpError { status, .. } => *status,
            RequestHandled => 200,
            Redirect { status, .. } => status.unwrap_or(303),
            InternalRedirect { .. } => 200,
            EntityTooLarge { .. } => 413,
            RedirectLoop(_)
            | HandlerError(_)
            | Interrupted
            | DuplicateMount(_)
            | ConfigError(_)
            | DoubleFailure { .. } => 500,
        }
    }

    /// 是否属于控制流信号而非错误。
    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            RequestHandled | Redirect { .. } | InternalRedirect { .. }
        )
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestIsNotUtf8 => write!(f, "Request bytes can't be parsed in UTF-8"),
            MalformedRequestLine(line) => write!(f, "Malformed request line: {:?}", line),
            UnSupportedRequestMethod => write!(f, "Unsupported request method"),
            UnsupportedHttpVersion => write!(f, "Unsupported HTTP version"),
            BadRequest(msg) => write!(f, "Bad request: {}", msg),
            NotFound(path) => write!(f, "The path '{}' was not found.", path),
            HttpError { status, message } => match message {
                Some(m) => write!(f, "HTTP error {}: {}", status, m),
                None => write!(f, "HTTP error {}", status),
            },
            RequestHandled => write!(f, "Request handled"),
            Redirect { url, .. } => write!(f, "Redirect to {}", url),
            InternalRedirect { path, query_string } => {
                if query_string.is_empty() {
                    write!(f, "Internal redirect to {}", path)
                } else {
                    write!(f, "Internal redirect to {}?{}", path, query_string)
                }
            }
            RedirectLoop(path) => write!(f, "InternalRedirect loop detected at {}", path),
            EntityTooLarge { limit } => write!(f, "Request entity exceeds {} bytes", limit),
            HandlerError(msg) => write!(f, "Handler error: {}", msg),
            Interrupted => write!(f, "Request interrupted"),
            DuplicateMount(prefix) => write!(f, "An application is already mounted at '{}'", prefix),
            ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            DoubleFailure { first, second } => write!(
                f,
                "=====First Error=====\n\n{}\n\n=====Second Error=====\n\n{}\n",
                first, second
            ),
        }
    }
}

impl std::error::Error for Exception {}

impl From<std::io::Error> for Exception {
    fn from(e: std::io::Error) -> Self {
        HandlerError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(NotFound("/x".to_string()).status_code(), 404);
        assert_eq!(EntityTooLarge { limit: 10 }.status_code(), 413);
        assert_eq!(BadRequest("no host".to_string()).status_code(), 400);
        assert_eq!(UnsupportedHttpVersion.status_code(), 505);
        assert_eq!(
            HttpError { status: 403, message: None }.status_code(),
            403
        );
        assert_eq!(HandlerError("boom".to_string()).status_code(), 500);
    }

    #[test]
    fn test_control_flow_signals() {
        assert!(RequestHandled.is_control_flow());
        assert!(Redirect { url: "/a/".to_string(), status: None }.is_control_flow());
        assert!(!NotFound("/".to_string()).is_control_flow());
    }

    #[test]
    fn test_not_found_display_carries_path() {
        let msg = NotFound("/missing/page".to_string()).to_string();
        assert!(msg.contains("/missing/page"));
    }

    #[test]
    fn test_io_error_becomes_handler_error() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        match Exception::from(io) {
            HandlerError(msg) => assert!(msg.contains("disk gone")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
