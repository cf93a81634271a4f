// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # HTTP 请求处理模块
//!
//! 负责把传输层交来的原始数据整理为 `Request` 模型：
//! 1. [`RawRequest::from_head`]：把原始请求头字节拆分为请求行与头部对（UTF-8 校验、大小上限）。
//! 2. [`Request::process_headers`]：解析请求行、协商协议版本、解析查询参数与 Cookie。
//! 3. [`Request::process_body`]：流式读取请求体并解析表单字段。
//!
//! `Request` 在一次请求中被创建一次，随后由钩子和分发器修改，请求结束时丢弃。

use std::io::Read;

use bytes::Bytes;
use log::{error, info};

use crate::{
    exception::Exception,
    form::{self, ParamMap, ParsedBody},
    header::HeaderMap,
    param::*,
};

/// 传输层交给管线的原始请求数据。管线本身从不解析 socket 帧。
#[derive(Debug, Clone)]
pub struct RawRequest {
    /// 客户端地址（IP:端口）
    pub remote_addr: String,
    /// 客户端主机名；无法反查时与地址相同
    pub remote_host: String,
    /// 原始请求行，例如 `GET /path HTTP/1.1`
    pub request_line: String,
    /// 按到达顺序排列的请求头
    pub headers: Vec<(String, String)>,
    /// `http` 或 `https`
    pub scheme: String,
}

impl RawRequest {
    pub fn new(request_line: &str, headers: &[(&str, &str)]) -> Self {
        Self {
            remote_addr: "127.0.0.1".to_string(),
            remote_host: "localhost".to_string(),
            request_line: request_line.to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            scheme: "http".to_string(),
        }
    }

    /// 从原始字节缓冲区构建 `RawRequest`。
    ///
    /// # 逻辑步骤
    /// 1. 大小检查：请求头超过 `max_header_size` 直接判定为 413。
    /// 2. 验证编码：确保请求头是合法的 UTF-8 字符串。
    /// 3. 拆分首行与头部；以空白开头的行视为上一个头部的续行。
    ///
    /// `buffer` 可以包含请求体的开头部分，空行之后的内容会被忽略。
    pub fn from_head(buffer: &[u8], max_header_size: u64, id: u128) -> Result<Self, Exception> {
        let head_len = buffer
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .unwrap_or(buffer.len());
        if head_len as u64 > max_header_size {
            error!("[ID{}]请求头长度{}超过上限{}", id, head_len, max_header_size);
            return Err(Exception::EntityTooLarge {
                limit: max_header_size,
            });
        }

        let head = match std::str::from_utf8(&buffer[..head_len]) {
            Ok(s) => s,
            Err(_) => {
                error!("[ID{}]无法解析HTTP请求", id);
                return Err(Exception::RequestIsNotUtf8);
            }
        };

        let mut lines = head.split(CRLF);
        let request_line = lines.next().unwrap_or("").to_string();
        let mut headers: Vec<(String, String)> = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                match headers.last_mut() {
                    Some((_, value)) => {
                        value.push(' ');
                        value.push_str(line.trim());
                        continue;
                    }
                    None => {
                        return Err(Exception::BadRequest(
                            "header continuation without a header".to_string(),
                        ))
                    }
                }
            }
            match line.split_once(':') {
                Some((name, value)) => {
                    headers.push((name.trim().to_string(), value.trim().to_string()))
                }
                None => {
                    error!("[ID{}]非法的请求头：{}", id, line);
                    return Err(Exception::BadRequest(format!("Illegal header line: {}", line)));
                }
            }
        }

        Ok(Self {
            remote_addr: String::new(),
            remote_host: String::new(),
            request_line,
            headers,
            scheme: "http".to_string(),
        })
    }

    /// `Content-Length` 头（若存在且合法）
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse().ok())
    }
}

/// 一次 HTTP 请求的完整模型。
#[derive(Debug, Clone)]
pub struct Request {
    remote_addr: String,
    remote_host: String,
    scheme: String,
    request_line: String,
    method: HttpRequestMethod,
    /// 相对于挂载点的路径（不含查询字符串）
    path: String,
    query_string: String,
    /// 客户端声明的协议版本
    protocol: HttpVersion,
    /// 与服务端协商后实际生效的协议版本
    version: HttpVersion,
    headers: HeaderMap,
    cookies: Vec<(String, String)>,
    /// 位置参数（来自协议层，例如 XML-RPC）
    param_list: Vec<String>,
    /// 关键字参数（查询字符串与表单字段）
    params: ParamMap,
    /// 实际匹配到的对象路径；钩子可以预先设置它以改变分发目标
    object_path: Option<String>,
    original_path: String,
    original_params: ParamMap,
    original_param_list: Vec<String>,
    /// 应用挂载前缀
    script_name: String,
    /// `scheme://host`
    base: String,
    process_request_body: bool,
    execute_main: bool,
    /// 非表单类型的原始请求体
    body: Option<Bytes>,
    /// urlencoded 表单的原始字节，供按字符集重新解码
    form_body: Option<Bytes>,
}

impl Request {
    /// 创建一个尚未解析的请求；解析失败时错误处理器仍能使用它。
    pub fn new(raw: &RawRequest, server_version: HttpVersion) -> Self {
        Self {
            remote_addr: raw.remote_addr.clone(),
            remote_host: raw.remote_host.clone(),
            scheme: raw.scheme.clone(),
            request_line: raw.request_line.clone(),
            method: HttpRequestMethod::Get,
            path: String::new(),
            query_string: String::new(),
            protocol: server_version,
            version: server_version,
            headers: HeaderMap::new(),
            cookies: Vec::new(),
            param_list: Vec::new(),
            params: ParamMap::new(),
            object_path: None,
            original_path: String::new(),
            original_params: ParamMap::new(),
            original_param_list: Vec::new(),
            script_name: String::new(),
            base: String::new(),
            process_request_body: false,
            execute_main: true,
            body: None,
            form_body: None,
        }
    }

    /// 解析请求行与请求头。
    ///
    /// # 错误处理
    /// - 请求行不是三段：`MalformedRequestLine`
    /// - 无法识别的方法：`UnSupportedRequestMethod`
    /// - 主版本号不一致：`UnsupportedHttpVersion`
    /// - HTTP/1.1 缺少 `Host`：`BadRequest`
    pub fn process_headers(
        &mut self,
        raw: &RawRequest,
        server_version: HttpVersion,
        id: u128,
    ) -> Result<(), Exception> {
        let parts: Vec<&str> = raw.request_line.split_whitespace().collect();
        if parts.len() != 3 {
            error!("[ID{}]HTTP请求行格式不正确：{}", id, raw.request_line);
            return Err(Exception::MalformedRequestLine(raw.request_line.clone()));
        }

        self.method = match parts[0].parse() {
            Ok(m) => m,
            Err(e) => {
                error!("[ID{}]不支持的HTTP请求方法：{}", id, parts[0]);
                return Err(e);
            }
        };
        self.process_request_body = self.method.has_body();

        // 协议版本：取 min(客户端, 服务端)，只有主版本号不同才拒绝
        self.protocol = HttpVersion::from_http(parts[2])?;
        self.version = match HttpVersion::negotiate(self.protocol, server_version) {
            Ok(v) => v,
            Err(e) => {
                error!("[ID{}]不支持的HTTP协议版本：{}", id, parts[2]);
                return Err(e);
            }
        };

        let target = strip_absolute_uri(parts[1]);
        match target.split_once('?') {
            Some((path, qs)) => {
                self.path = path.to_string();
                self.query_string = qs.to_string();
            }
            None => {
                self.path = target.to_string();
                self.query_string = String::new();
            }
        }
        self.params = form::parse_query(&self.query_string);

        for (name, value) in &raw.headers {
            let value = value.trim();
            self.headers.append(name, value);
            // 有的客户端会把多个 Cookie 分在不同行发送
            if name.eq_ignore_ascii_case("cookie") {
                self.cookies.extend(parse_cookie_header(value));
            }
        }

        info!("[ID{}] {} - {}", id, raw.remote_addr, raw.request_line.trim());

        self.object_path = None;
        self.original_path = self.path.clone();
        self.original_params = self.params.clone();
        self.original_param_list = self.param_list.clone();

        if self.version >= HttpVersion::V1_1 && !self.headers.contains("Host") {
            return Err(Exception::BadRequest(
                "HTTP/1.1 requires a 'Host' request header.".to_string(),
            ));
        }
        self.base = format!(
            "{}://{}",
            self.scheme,
            self.headers.get("Host").unwrap_or("")
        );
        Ok(())
    }

    /// 流式读取并解析请求体，表单字段覆盖查询字符串中的同名参数。
    pub fn process_body(&mut self, reader: &mut dyn Read, limit: u64) -> Result<(), Exception> {
        let content_length = match self.headers.get("Content-Length") {
            Some(v) => Some(v.trim().parse::<u64>().map_err(|_| {
                Exception::BadRequest(format!("Invalid Content-Length: {}", v))
            })?),
            None => None,
        };
        let raw = form::read_body(reader, content_length, limit)?;
        let content_type = self.headers.get("Content-Type");
        if form::is_urlencoded(content_type) {
            self.form_body = Some(Bytes::copy_from_slice(&raw));
        }
        match form::parse_body(content_type, raw)? {
            ParsedBody::Fields(fields) => self.params.override_with(fields),
            ParsedBody::Raw(bytes) => self.body = Some(bytes),
        }
        Ok(())
    }

    /// 进程内重定向：改写路径，并在给出查询字符串时替换参数表
    pub fn redirect_internally(&mut self, path: &str, query_string: &str) {
        self.path = path.to_string();
        if !query_string.is_empty() {
            self.query_string = query_string.to_string();
            self.params = form::parse_query(query_string);
        }
        self.object_path = None;
    }
}

/// 请求目标可能是绝对 URI（`http://host/path`），此时只保留路径部分
fn strip_absolute_uri(target: &str) -> &str {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = target.strip_prefix(scheme) {
            return match rest.find('/') {
                Some(i) => &rest[i..],
                None => "/",
            };
        }
    }
    target
}

/// 解析 `Cookie` 请求头：`a=1; b=2`
pub fn parse_cookie_header(value: &str) -> Vec<(String, String)> {
    value
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().trim_matches('"').to_string()))
        })
        .collect()
}

// --- 访问器 ---

impl Request {
    pub fn method(&self) -> HttpRequestMethod {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    /// 生效的协议版本
    pub fn version(&self) -> HttpVersion {
        self.version
    }

    /// 客户端声明的协议版本
    pub fn protocol(&self) -> HttpVersion {
        self.protocol
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .rev()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn param_list(&self) -> &[String] {
        &self.param_list
    }

    pub fn param_list_mut(&mut self) -> &mut Vec<String> {
        &mut self.param_list
    }

    pub fn params(&self) -> &ParamMap {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParamMap {
        &mut self.params
    }

    pub fn object_path(&self) -> Option<&str> {
        self.object_path.as_deref()
    }

    pub fn set_object_path(&mut self, object_path: Option<String>) {
        self.object_path = object_path;
    }

    pub fn original_path(&self) -> &str {
        &self.original_path
    }

    pub fn original_params(&self) -> &ParamMap {
        &self.original_params
    }

    pub fn original_param_list(&self) -> &[String] {
        &self.original_param_list
    }

    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    pub fn set_script_name(&mut self, script_name: impl Into<String>) {
        self.script_name = script_name.into();
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// 改写 `scheme://host`，重定向等绝对地址由此生成
    pub fn set_base(&mut self, base: impl Into<String>) {
        self.base = base.into();
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn request_line(&self) -> &str {
        &self.request_line
    }

    pub fn process_request_body(&self) -> bool {
        self.process_request_body
    }

    pub fn set_process_request_body(&mut self, value: bool) {
        self.process_request_body = value;
    }

    /// 是否仍需执行主处理器；主处理型工具处理完请求后会将其置为 false
    pub fn execute_main(&self) -> bool {
        self.execute_main
    }

    pub fn set_execute_main(&mut self, value: bool) {
        self.execute_main = value;
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn form_body(&self) -> Option<&Bytes> {
        self.form_body.as_ref()
    }
}
