// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 协议参数与常量模块
//!
//! 该模块定义了 `webtree` 遵循的 HTTP 协议相关常量和数据结构，包括：
//! - 常见的 HTTP 状态码及其原因短语（Reason Phrase）。
//! - 响应头的分类顺序表（通用头 → 响应头 → 实体头 → 其他）。
//! - 静态文件工具使用的 MIME 类型映射表。
//! - HTTP 方法、版本的强类型定义。

use std::{cmp::Ordering, collections::HashMap, fmt, str::FromStr};

use lazy_static::lazy_static;
use regex::Regex;

use crate::exception::Exception;

/// 服务器名称标识，用于 HTTP 响应头的 `Server` 字段
pub const SERVER_NAME: &str = concat!("webtree/", env!("CARGO_PKG_VERSION"));

/// HTTP 协议规定的换行符（Carriage Return Line Feed）
pub const CRLF: &str = "\r\n";

lazy_static! {
    /// HTTP 状态码与其对应的标准原因短语映射表。
    ///
    /// 参考标准：[RFC 9110: HTTP Semantics](https://www.rfc-editor.org/rfc/rfc9110.html)。
    pub static ref STATUS_CODES: HashMap<u16, &'static str> = {
        let mut map = HashMap::new();
        // 1xx: 信息响应
        map.insert(100, "Continue");
        map.insert(101, "Switching Protocols");

        // 2xx: 成功响应
        map.insert(200, "OK");
        map.insert(201, "Created");
        map.insert(202, "Accepted");
        map.insert(203, "Non-Authoritative Information");
        map.insert(204, "No Content");
        map.insert(205, "Reset Content");
        map.insert(206, "Partial Content");

        // 3xx: 重定向
        map.insert(300, "Multiple Choices");
        map.insert(301, "Moved Permanently");
        map.insert(302, "Found");
        map.insert(303, "See Other");
        map.insert(304, "Not Modified");
        map.insert(305, "Use Proxy");
        map.insert(307, "Temporary Redirect");
        map.insert(308, "Permanent Redirect");

        // 4xx: 客户端错误
        map.insert(400, "Bad Request");
        map.insert(401, "Unauthorized");
        map.insert(402, "Payment Required");
        map.insert(403, "Forbidden");
        map.insert(404, "Not Found");
        map.insert(405, "Method Not Allowed");
        map.insert(406, "Not Acceptable");
        map.insert(407, "Proxy Authentication Required");
        map.insert(408, "Request Timeout");
        map.insert(409, "Conflict");
        map.insert(410, "Gone");
        map.insert(411, "Length Required");
        map.insert(412, "Precondition Failed");
        map.insert(413, "Request Entity Too Large");
        map.insert(414, "Request-URI Too Long");
        map.insert(415, "Unsupported Media Type");
        map.insert(416, "Range Not Satisfiable");
        map.insert(417, "Expectation Failed");

        // 5xx: 服务端错误
        map.insert(500, "Internal Server Error");
        map.insert(501, "Not Implemented");
        map.insert(502, "Bad Gateway");
        map.insert(503, "Service Unavailable");
        map.insert(504, "Gateway Timeout");
        map.insert(505, "HTTP Version Not Supported");
        map
    };
}

/// 通用头（General Header Fields），排序类别 0
pub const GENERAL_HEADER_FIELDS: [&str; 9] = [
    "Cache-Control",
    "Connection",
    "Date",
    "Pragma",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
    "Via",
    "Warning",
];

/// 响应头（Response Header Fields），排序类别 1
pub const RESPONSE_HEADER_FIELDS: [&str; 9] = [
    "Accept-Ranges",
    "Age",
    "Etag",
    "Location",
    "Proxy-Authenticate",
    "Retry-After",
    "Server",
    "Vary",
    "Www-Authenticate",
];

/// 实体头（Entity Header Fields），排序类别 2
pub const ENTITY_HEADER_FIELDS: [&str; 10] = [
    "Allow",
    "Content-Encoding",
    "Content-Language",
    "Content-Length",
    "Content-Location",
    "Content-Md5",
    "Content-Range",
    "Content-Type",
    "Expires",
    "Last-Modified",
];

lazy_static! {
    /// 头名称（已规范化为 Title-Case）到排序类别的映射；未出现的头归入类别 3。
    pub static ref HEADER_ORDER: HashMap<&'static str, u8> = {
        let mut map = HashMap::new();
        for name in GENERAL_HEADER_FIELDS.iter() {
            map.insert(*name, 0);
        }
        for name in RESPONSE_HEADER_FIELDS.iter() {
            map.insert(*name, 1);
        }
        for name in ENTITY_HEADER_FIELDS.iter() {
            map.insert(*name, 2);
        }
        map
    };

    static ref VERSION_PATTERN: Regex = Regex::new(r"^HTTP/(\d+)\.(\d+)$").unwrap();
}

lazy_static! {
    /// 文件后缀名到 MIME 类型的映射表，供静态文件工具设置 `Content-Type`。
    pub static ref MIME_TYPES: HashMap<&'static str, &'static str> = {
        let mut map = HashMap::new();
        map.insert("css", "text/css;charset=utf-8");
        map.insert("csv", "text/csv");
        map.insert("gif", "image/gif");
        map.insert("gz", "application/gzip");
        map.insert("htm", "text/html;charset=utf-8");
        map.insert("html", "text/html;charset=utf-8");
        map.insert("ico", "image/x-icon");
        map.insert("jpeg", "image/jpeg");
        map.insert("jpg", "image/jpeg");
        map.insert("js", "text/javascript;charset=utf-8");
        map.insert("json", "application/json");
        map.insert("mjs", "text/javascript");
        map.insert("mp3", "audio/mpeg");
        map.insert("mp4", "video/mp4");
        map.insert("otf", "font/otf");
        map.insert("pdf", "application/pdf");
        map.insert("png", "image/png");
        map.insert("svg", "image/svg+xml");
        map.insert("tar", "application/x-tar");
        map.insert("ttf", "font/ttf");
        map.insert("txt", "text/plain");
        map.insert("wasm", "application/wasm");
        map.insert("webm", "video/webm");
        map.insert("webp", "image/webp");
        map.insert("woff", "font/woff");
        map.insert("woff2", "font/woff2");
        map.insert("xml", "text/xml");
        map.insert("zip", "application/zip");
        map
    };
}

/// HTTP 协议版本。按 (主版本, 次版本) 逐项比较。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HttpVersion {
    pub major: u16,
    pub minor: u16,
}

impl HttpVersion {
    pub const V1_0: HttpVersion = HttpVersion { major: 1, minor: 0 };
    pub const V1_1: HttpVersion = HttpVersion { major: 1, minor: 1 };

    /// 从 `HTTP/x.y` 形式的字符串解析版本号
    pub fn from_http(s: &str) -> Result<Self, Exception> {
        let caps = VERSION_PATTERN
            .captures(s.trim())
            .ok_or(Exception::UnsupportedHttpVersion)?;
        let major = caps[1]
            .parse::<u16>()
            .map_err(|_| Exception::UnsupportedHttpVersion)?;
        let minor = caps[2]
            .parse::<u16>()
            .map_err(|_| Exception::UnsupportedHttpVersion)?;
        Ok(Self { major, minor })
    }

    /// 协商出实际使用的版本：取客户端与服务端版本中较小的一个。
    ///
    /// 只有主版本号不同才需要拒绝（RFC 2616 10.5.6），次版本差异会被平滑降级。
    pub fn negotiate(client: HttpVersion, server: HttpVersion) -> Result<Self, Exception> {
        if client.major != server.major {
            return Err(Exception::UnsupportedHttpVersion);
        }
        Ok(std::cmp::min(client, server))
    }
}

impl PartialOrd for HttpVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HttpVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor).cmp(&(other.major, other.minor))
    }
}

impl fmt::Display for HttpVersion {
    /// 将版本格式化为报文中使用的 `HTTP/x.y`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// 标准 HTTP 请求方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpRequestMethod {
    Get,
    Head,
    Options,
    Post,
    Put,
    Patch,
    Delete,
    Trace,
    Connect,
}

impl HttpRequestMethod {
    /// 该方法是否携带需要解析的请求体（POST/PUT 语义）
    pub fn has_body(&self) -> bool {
        matches!(
            self,
            HttpRequestMethod::Post | HttpRequestMethod::Put | HttpRequestMethod::Patch
        )
    }

    /// 是否为 HEAD 类方法：响应中不得包含消息体
    pub fn is_head(&self) -> bool {
        *self == HttpRequestMethod::Head
    }
}

impl FromStr for HttpRequestMethod {
    type Err = Exception;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "GET" => Ok(HttpRequestMethod::Get),
            "HEAD" => Ok(HttpRequestMethod::Head),
            "OPTIONS" => Ok(HttpRequestMethod::Options),
            "POST" => Ok(HttpRequestMethod::Post),
            "PUT" => Ok(HttpRequestMethod::Put),
            "PATCH" => Ok(HttpRequestMethod::Patch),
            "DELETE" => Ok(HttpRequestMethod::Delete),
            "TRACE" => Ok(HttpRequestMethod::Trace),
            "CONNECT" => Ok(HttpRequestMethod::Connect),
            _ => Err(Exception::UnSupportedRequestMethod),
        }
    }
}

impl fmt::Display for HttpRequestMethod {
    /// 将枚举格式化为 HTTP 标准大写方法名
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            HttpRequestMethod::Get => "GET",
            HttpRequestMethod::Head => "HEAD",
            HttpRequestMethod::Options => "OPTIONS",
            HttpRequestMethod::Post => "POST",
            HttpRequestMethod::Put => "PUT",
            HttpRequestMethod::Patch => "PATCH",
            HttpRequestMethod::Delete => "DELETE",
            HttpRequestMethod::Trace => "TRACE",
            HttpRequestMethod::Connect => "CONNECT",
        };
        write!(f, "{}", name)
    }
}

/// 状态码对应的标准原因短语；未知状态码返回空字符串
pub fn reason_phrase(code: u16) -> &'static str {
    STATUS_CODES.get(&code).copied().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse_and_display() {
        let v = HttpVersion::from_http("HTTP/1.1").unwrap();
        assert_eq!(v, HttpVersion::V1_1);
        assert_eq!(v.to_string(), "HTTP/1.1");
        assert!(HttpVersion::from_http("HTTP/one").is_err());
    }

    #[test]
    fn test_version_ordering() {
        assert!(HttpVersion::V1_0 < HttpVersion::V1_1);
        assert!(HttpVersion { major: 1, minor: 10 } > HttpVersion::V1_1);
    }

    #[test]
    fn test_version_negotiation() {
        let v = HttpVersion::negotiate(HttpVersion::V1_1, HttpVersion::V1_0).unwrap();
        assert_eq!(v, HttpVersion::V1_0);
        let v = HttpVersion::negotiate(HttpVersion::V1_0, HttpVersion::V1_1).unwrap();
        assert_eq!(v, HttpVersion::V1_0);
        let two = HttpVersion { major: 2, minor: 0 };
        assert_eq!(
            HttpVersion::negotiate(two, HttpVersion::V1_1),
            Err(Exception::UnsupportedHttpVersion)
        );
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("get".parse::<HttpRequestMethod>(), Ok(HttpRequestMethod::Get));
        assert_eq!("PUT".parse::<HttpRequestMethod>(), Ok(HttpRequestMethod::Put));
        assert!("BREW".parse::<HttpRequestMethod>().is_err());
        assert!(HttpRequestMethod::Post.has_body());
        assert!(!HttpRequestMethod::Get.has_body());
    }

    #[test]
    fn test_header_order_categories() {
        assert_eq!(HEADER_ORDER.get("Date"), Some(&0));
        assert_eq!(HEADER_ORDER.get("Server"), Some(&1));
        assert_eq!(HEADER_ORDER.get("Content-Length"), Some(&2));
        assert_eq!(HEADER_ORDER.get("X-Custom"), None);
    }

    #[test]
    fn test_reason_phrase() {
        assert_eq!(reason_phrase(404), "Not Found");
        assert_eq!(reason_phrase(299), "");
    }
}
