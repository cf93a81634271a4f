// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 请求参数与请求体解析
//!
//! 查询字符串与表单字段统一进入 [`ParamMap`]：
//! - 只出现一次的字段是单值 [`Param::One`]；
//! - 重复出现的字段按出现顺序组成 [`Param::Many`]；
//! - `multipart/form-data` 中带文件名的部分是 [`FieldValue::File`]，其余是文本。
//!
//! 请求体的读取是流式的：每读入一块就检查累计大小，超过上限立即返回
//! `EntityTooLarge`，不会先把整个请求体缓存在内存里再判断。

use std::{collections::BTreeMap, io::Read};

use bytes::Bytes;
use log::debug;

use crate::exception::Exception;

/// 单次从请求体流读取的块大小
const READ_CHUNK: usize = 8192;

/// 上传的文件
#[derive(Debug, Clone, PartialEq)]
pub struct FileUpload {
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// 字段的单个值
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    File(FileUpload),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            FieldValue::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileUpload> {
        match self {
            FieldValue::File(f) => Some(f),
            FieldValue::Text(_) => None,
        }
    }
}

/// 参数值：单值或按顺序排列的多值
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    One(FieldValue),
    Many(Vec<FieldValue>),
}

impl Param {
    pub fn text(value: impl Into<String>) -> Self {
        Param::One(FieldValue::Text(value.into()))
    }

    /// 单值文本参数的内容；多值或文件返回 `None`
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Param::One(v) => v.as_text(),
            Param::Many(_) => None,
        }
    }

    pub fn values(&self) -> Vec<&FieldValue> {
        match self {
            Param::One(v) => vec![v],
            Param::Many(vs) => vs.iter().collect(),
        }
    }
}

/// 关键字参数表
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamMap(BTreeMap<String, Param>);

impl ParamMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Param> {
        self.0.get(key)
    }

    /// 单值文本参数的快捷访问
    pub fn text(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|p| p.as_text())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, param: Param) {
        self.0.insert(key.into(), param);
    }

    pub fn remove(&mut self, key: &str) -> Option<Param> {
        self.0.remove(key)
    }

    /// 追加一个值：首次出现为单值，再次出现升级为列表
    pub fn push(&mut self, key: impl Into<String>, value: FieldValue) {
        let key = key.into();
        let merged = match self.0.remove(&key) {
            None => Param::One(value),
            Some(Param::One(first)) => Param::Many(vec![first, value]),
            Some(Param::Many(mut list)) => {
                list.push(value);
                Param::Many(list)
            }
        };
        self.0.insert(key, merged);
    }

    /// 用 `other` 中的键覆盖当前表中的同名键
    pub fn override_with(&mut self, other: ParamMap) {
        self.0.extend(other.0);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Param)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// 解析查询字符串（保留空值）
pub fn parse_query(query_string: &str) -> ParamMap {
    let mut params = ParamMap::new();
    for (key, value) in url::form_urlencoded::parse(query_string.as_bytes()) {
        params.push(key.into_owned(), FieldValue::Text(value.into_owned()));
    }
    params
}

/// 从流中读取请求体，边读边检查大小上限。
///
/// `content_length` 已知时先做一次预检查，然后最多只读这么多字节。
pub fn read_body(
    reader: &mut dyn Read,
    content_length: Option<u64>,
    limit: u64,
) -> Result<Vec<u8>, Exception> {
    if let Some(len) = content_length {
        if len > limit {
            return Err(Exception::EntityTooLarge { limit });
        }
    }
    let mut body = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let want = match content_length {
            Some(len) => {
                let remaining = len.saturating_sub(body.len() as u64);
                if remaining == 0 {
                    break;
                }
                remaining.min(READ_CHUNK as u64) as usize
            }
            None => READ_CHUNK,
        };
        let n = match reader.read(&mut chunk[..want]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::ConnectionAborted | std::io::ErrorKind::ConnectionReset
                ) =>
            {
                return Err(Exception::Interrupted)
            }
            Err(e) => return Err(e.into()),
        };
        if (body.len() + n) as u64 > limit {
            return Err(Exception::EntityTooLarge { limit });
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Ok(body)
}

/// 请求体解析结果
#[derive(Debug, PartialEq)]
pub enum ParsedBody {
    /// 表单字段
    Fields(ParamMap),
    /// 其他内容类型，原样保留
    Raw(Bytes),
}

const URLENCODED: &str = "application/x-www-form-urlencoded";

fn mime_of(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// 缺省 `Content-Type` 视为 urlencoded 表单
pub fn is_urlencoded(content_type: Option<&str>) -> bool {
    mime_of(content_type.unwrap_or(URLENCODED)) == URLENCODED
}

/// 按 `&` 与 `=` 拆分 urlencoded 数据，`+` 还原为空格后做百分号解码，
/// 结果保持原始字节，由调用方按字符集解码
pub fn raw_pairs(input: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    input
        .split(|b| *b == b'&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.iter().position(|b| *b == b'=') {
            Some(i) => (unquote_plus(&pair[..i]), unquote_plus(&pair[i + 1..])),
            None => (unquote_plus(pair), Vec::new()),
        })
        .collect()
}

fn unquote_plus(part: &[u8]) -> Vec<u8> {
    let spaced: Vec<u8> = part
        .iter()
        .map(|b| if *b == b'+' { b' ' } else { *b })
        .collect();
    percent_encoding::percent_decode(&spaced).collect()
}

/// 按 `Content-Type` 解析请求体
pub fn parse_body(content_type: Option<&str>, body: Vec<u8>) -> Result<ParsedBody, Exception> {
    let content_type = content_type.unwrap_or(URLENCODED);
    let mime = mime_of(content_type);
    match mime.as_str() {
        "application/x-www-form-urlencoded" => {
            let mut fields = ParamMap::new();
            for (key, value) in url::form_urlencoded::parse(&body) {
                fields.push(key.into_owned(), FieldValue::Text(value.into_owned()));
            }
            Ok(ParsedBody::Fields(fields))
        }
        "multipart/form-data" => {
            let boundary = header_param(content_type, "boundary").ok_or_else(|| {
                Exception::BadRequest("multipart body without boundary".to_string())
            })?;
            parse_multipart(&body, &boundary).map(ParsedBody::Fields)
        }
        _ => {
            debug!("请求体类型 {} 不是表单，保留原始内容", mime);
            Ok(ParsedBody::Raw(Bytes::from(body)))
        }
    }
}

/// 从 `type; key=value; key2="value"` 形式的头部值中提取参数
fn header_param(value: &str, name: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|part| {
        let (key, val) = part.trim().split_once('=')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(val.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

/// 分隔符后面只能跟 `--`（结束）或行尾（允许行尾前的空白）
fn ends_delimiter(rest: &[u8]) -> bool {
    let trimmed: &[u8] = match rest.iter().position(|b| *b != b' ' && *b != b'\t') {
        Some(i) => &rest[i..],
        None => &[],
    };
    rest.starts_with(b"--") || trimmed.starts_with(b"\r\n") || trimmed.is_empty()
}

/// 从 `from` 起查找下一个完整的 `CRLF--boundary` 分隔符
fn next_delimiter(body: &[u8], delimiter: &[u8], from: usize) -> Option<usize> {
    let mut from = from;
    loop {
        let at = find(body, delimiter, from)?;
        if ends_delimiter(&body[at + delimiter.len()..]) {
            return Some(at);
        }
        from = at + 1;
    }
}

fn parse_multipart(body: &[u8], boundary: &str) -> Result<ParamMap, Exception> {
    // 第一个分隔符前面可以没有 CRLF，之后的分隔符都以 CRLF 开头
    let delimiter = format!("\r\n--{}", boundary).into_bytes();
    let malformed = || Exception::BadRequest("malformed multipart body".to_string());

    let mut fields = ParamMap::new();
    let mut pos = if body.starts_with(&delimiter[2..]) {
        delimiter.len() - 2
    } else {
        next_delimiter(body, &delimiter, 0).ok_or_else(malformed)? + delimiter.len()
    };
    loop {
        // 结束分隔符 `--boundary--`
        if body[pos..].starts_with(b"--") {
            break;
        }
        let line_end = find(body, b"\r\n", pos).ok_or_else(malformed)?;
        let part_start = line_end + 2;
        let next = next_delimiter(body, &delimiter, line_end).ok_or_else(malformed)?;
        if next < part_start {
            return Err(malformed());
        }
        let part = &body[part_start..next];

        let split = find(part, b"\r\n\r\n", 0).ok_or_else(malformed)?;
        let head = std::str::from_utf8(&part[..split]).map_err(|_| Exception::RequestIsNotUtf8)?;
        let content = &part[split + 4..];

        let mut name = None;
        let mut filename = None;
        let mut content_type = None;
        for line in head.split("\r\n") {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            if key.trim().eq_ignore_ascii_case("content-disposition") {
                name = header_param(value, "name");
                filename = header_param(value, "filename");
            } else if key.trim().eq_ignore_ascii_case("content-type") {
                content_type = Some(value.trim().to_string());
            }
        }
        let name = name.ok_or_else(malformed)?;
        let value = match filename {
            Some(filename) => FieldValue::File(FileUpload {
                filename,
                content_type,
                data: Bytes::copy_from_slice(content),
            }),
            None => FieldValue::Text(String::from_utf8_lossy(content).into_owned()),
        };
        fields.push(name, value);

        pos = next + delimiter.len();
        if pos >= body.len() {
            break;
        }
    }
    Ok(fields)
}
