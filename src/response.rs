// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 响应模型与收尾
//!
//! `Response` 是处理器和钩子修改的内存模型；[`Response::finalize`] 把它转换为
//! 可以直接写到连接上的状态行、有序头部列表和消息体：
//!
//! 1. 规范化状态（缺省 `200 OK`，非法状态降级为 `500`）。
//! 2. 需要时把消息体物化并计算 `Content-Length`。
//! 3. 头部按 通用头 → 响应头 → 实体头 → 其他 稳定排序；`Content-Length` 排在实体头的最后。
//! 4. 每个 Cookie 追加一个 `Set-Cookie`。
//! 5. HEAD 请求在头部计算完成后清空消息体。

use std::{
    fmt,
    io::{self, Read},
};

use bytes::Bytes;
use chrono::prelude::*;
use log::debug;

use crate::{
    exception::Exception,
    header::HeaderMap,
    param::*,
    util::{http_date, HtmlBuilder},
};

type ChunkIter = Box<dyn Iterator<Item = io::Result<Bytes>> + Send>;

/// 响应消息体：由字节块组成的惰性序列，只能被消费一次。
pub enum Body {
    Empty,
    /// 已经在内存中的若干块
    Full(Vec<Bytes>),
    /// 流式产生的块（例如按块读取的文件）
    Stream(ChunkIter),
}

impl Body {
    /// 以固定块大小从 `reader` 流式读取
    pub fn from_reader<R: Read + Send + 'static>(reader: R, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let mut reader = reader;
        let mut done = false;
        let iter = std::iter::from_fn(move || {
            if done {
                return None;
            }
            let mut buffer = vec![0u8; chunk_size];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        done = true;
                        return None;
                    }
                    Ok(n) => {
                        buffer.truncate(n);
                        return Some(Ok(Bytes::from(buffer)));
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        done = true;
                        return Some(Err(e));
                    }
                }
            }
        });
        Body::Stream(Box::new(iter))
    }

    /// 长度是否无需消费即可得知
    pub fn is_materialized(&self) -> bool {
        !matches!(self, Body::Stream(_))
    }

    /// 消费全部块并拼接
    pub fn collect(self) -> io::Result<Bytes> {
        match self {
            Body::Empty => Ok(Bytes::new()),
            Body::Full(mut chunks) if chunks.len() == 1 => Ok(chunks.remove(0)),
            Body::Full(chunks) => Ok(Bytes::from(chunks.concat())),
            Body::Stream(iter) => {
                let mut out = Vec::new();
                for chunk in iter {
                    out.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(out))
            }
        }
    }

    /// 转换为块迭代器，交给传输层逐块写出
    pub fn into_chunks(self) -> ChunkIter {
        match self {
            Body::Empty => Box::new(std::iter::empty()),
            Body::Full(chunks) => Box::new(chunks.into_iter().map(Ok)),
            Body::Stream(iter) => iter,
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Empty
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => write!(f, "Body::Empty"),
            Body::Full(chunks) => write!(
                f,
                "Body::Full({} bytes)",
                chunks.iter().map(|c| c.len()).sum::<usize>()
            ),
            Body::Stream(_) => write!(f, "Body::Stream"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        if b.is_empty() {
            Body::Empty
        } else {
            Body::Full(vec![b])
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Body::from(Bytes::from(v))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::from(Bytes::from(s))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Body::from(Bytes::from_static(s.as_bytes()))
    }
}

impl From<Vec<String>> for Body {
    fn from(parts: Vec<String>) -> Self {
        Body::Full(parts.into_iter().map(Bytes::from).collect())
    }
}

/// 响应 Cookie
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub max_age: Option<i64>,
    pub expires: Option<DateTime<Utc>>,
    pub secure: bool,
    pub http_only: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn max_age(mut self, seconds: i64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn http_only(mut self) -> Self {
        self.http_only = true;
        self
    }

    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    /// `Set-Cookie` 头的值
    pub fn to_header_value(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(domain) = &self.domain {
            out.push_str(&format!("; Domain={}", domain));
        }
        if let Some(path) = &self.path {
            out.push_str(&format!("; Path={}", path));
        }
        if let Some(max_age) = self.max_age {
            out.push_str(&format!("; Max-Age={}", max_age));
        }
        if let Some(expires) = &self.expires {
            out.push_str(&format!("; Expires={}", http_date(expires)));
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        out
    }
}

/// 按名称去重的 Cookie 集合，保持设置顺序
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CookieJar {
    cookies: Vec<Cookie>,
}

impl CookieJar {
    /// 设置 Cookie；同名的旧值被替换
    pub fn set(&mut self, cookie: Cookie) {
        match self.cookies.iter_mut().find(|c| c.name == cookie.name) {
            Some(existing) => *existing = cookie,
            None => self.cookies.push(cookie),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cookie> {
        self.cookies.iter()
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

/// 交给传输层的最终结果
#[derive(Debug)]
pub struct Served {
    /// 例如 `200 OK`
    pub status: String,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl Served {
    pub fn status_code(&self) -> u16 {
        self.status
            .split_whitespace()
            .next()
            .and_then(|c| c.parse().ok())
            .unwrap_or(500)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug)]
pub struct Response {
    /// 原始状态，可能尚未规范化（例如 `"404"` 或 `"299 Custom"`）
    status: Option<String>,
    headers: HeaderMap,
    cookies: CookieJar,
    body: Body,
    /// 处理器或钩子是否已经设置过消息体；空消息体也算已设置
    body_set: bool,
    /// finalize 之后的有序头部列表
    header_list: Vec<(String, String)>,
    date: DateTime<Utc>,
}

impl Response {
    pub fn new() -> Self {
        let date = Utc::now();
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", "text/html");
        headers.insert("Server", SERVER_NAME);
        headers.insert("Date", http_date(&date));
        Self {
            status: None,
            headers,
            cookies: CookieJar::default(),
            body: Body::Empty,
            body_set: false,
            header_list: Vec::new(),
            date,
        }
    }

    /// 把原始状态规范化为 (状态码, 原因短语)。
    ///
    /// - 缺省：`200 OK`
    /// - 非数字或不在 100..=599：`500 Internal Server Error`
    /// - 缺少原因短语：使用标准短语（未知状态码为空串）
    pub fn check_status(status: Option<&str>) -> (u16, String) {
        let status = match status {
            Some(s) if !s.trim().is_empty() => s.trim(),
            _ => return (200, "OK".to_string()),
        };
        let (code, reason) = match status.split_once(' ') {
            Some((code, reason)) => (code, Some(reason.trim())),
            None => (status, None),
        };
        let code = match code.parse::<u16>() {
            Ok(c) if (100..=599).contains(&c) => c,
            _ => {
                debug!("非法的响应状态 {:?}，改为 500", status);
                return (500, reason_phrase(500).to_string());
            }
        };
        let reason = match reason {
            Some(r) if !r.is_empty() => r.to_string(),
            _ => reason_phrase(code).to_string(),
        };
        (code, reason)
    }

    /// 生成最终的有序头部列表。调用后 `body()` 即为应当发送的消息体。
    pub fn finalize(
        &mut self,
        version: HttpVersion,
        method: HttpRequestMethod,
    ) -> Result<Vec<(String, String)>, Exception> {
        let (code, reason) = Self::check_status(self.status.as_deref());
        self.status = Some(format!("{} {}", code, reason));

        // 这些状态不能带消息体
        if code < 200 || code == 204 || code == 205 || code == 304 {
            self.headers.remove("Content-Length");
            self.body = Body::Empty;
        } else if !self.headers.contains("Content-Length") {
            let must_measure = version < HttpVersion::V1_1 || method.is_head();
            if self.body.is_materialized() || must_measure {
                let content = std::mem::take(&mut self.body).collect()?;
                self.headers
                    .insert("Content-Length", content.len().to_string());
                self.body = Body::from(content);
            }
        }

        let mut list: Vec<(String, String)> = self
            .headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        list.sort_by_key(|(k, _)| {
            let category = HEADER_ORDER.get(k.as_str()).copied().unwrap_or(3);
            (category, k == "Content-Length")
        });

        for cookie in self.cookies.iter() {
            list.push(("Set-Cookie".to_string(), cookie.to_header_value()));
        }

        if method.is_head() {
            self.body = Body::Empty;
        }

        self.header_list = list.clone();
        Ok(list)
    }

    /// 把响应设置为重定向
    pub fn set_redirect(&mut self, url: &str, code: u16) {
        self.status = Some(code.to_string());
        match code {
            304 => {
                for name in ENTITY_HEADER_FIELDS.iter() {
                    self.headers.remove(name);
                }
                self.body = Body::Empty;
            }
            305 => {
                self.headers.insert("Location", url);
                self.body = Body::Empty;
            }
            _ => {
                self.headers.insert("Content-Type", "text/html;charset=utf-8");
                self.headers.insert("Location", url);
                self.body = Body::from(HtmlBuilder::redirect(code, url).build());
            }
        }
        self.body_set = true;
        self.headers.remove("Content-Length");
    }

    /// 把响应设置为 HTML 错误页
    pub fn set_error_page(&mut self, code: u16, html: String) {
        self.status = Some(code.to_string());
        self.headers.insert("Content-Type", "text/html;charset=utf-8");
        self.headers.remove("Content-Length");
        self.body = Body::from(html);
        self.body_set = true;
    }

    /// 交出最终结果；应在 finalize 之后调用
    pub fn into_served(self) -> Served {
        Served {
            status: self.status.unwrap_or_else(|| "200 OK".to_string()),
            headers: self.header_list,
            body: self.body,
        }
    }
}

/// 最后的兜底响应：不运行钩子、不经过 finalize、不依赖任何其他组件。
pub fn bare_error(extra: Option<&str>) -> Served {
    let mut body = String::from("Unrecoverable error in the server.");
    if let Some(extra) = extra {
        body.push('\n');
        body.push_str(extra);
    }
    Served {
        status: "500 Internal Server Error".to_string(),
        headers: vec![
            ("Content-Type".to_string(), "text/plain".to_string()),
            ("Content-Length".to_string(), body.len().to_string()),
        ],
        body: Body::from(body),
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = Some(status.into());
    }

    pub fn set_status_code(&mut self, code: u16) {
        self.status = Some(code.to_string());
    }

    /// 当前状态码（未设置时视为 200）
    pub fn status_code(&self) -> u16 {
        Self::check_status(self.status.as_deref()).0
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn cookies_mut(&mut self) -> &mut CookieJar {
        &mut self.cookies
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
        self.body_set = true;
    }

    /// 取走消息体，之后视为未设置
    pub fn take_body(&mut self) -> Body {
        self.body_set = false;
        std::mem::take(&mut self.body)
    }

    pub fn has_body(&self) -> bool {
        self.body_set
    }

    pub fn header_list(&self) -> &[(String, String)] {
        &self.header_list
    }

    pub fn date(&self) -> DateTime<Utc> {
        self.date
    }
}
