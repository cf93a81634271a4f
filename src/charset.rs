// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 字符集
//!
//! `encode` 与 `decode` 工具使用的字符集转换与 `Accept-Charset` 协商。
//! 只支持 HTTP 场景中常见的几种字符集，无法识别的名称在协商时被跳过。

use std::{fmt, str::FromStr};

use crate::exception::Exception;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Charset {
    Utf8,
    /// 带 BOM 的小端序 UTF-16
    Utf16,
    Utf16Le,
    Utf16Be,
    Latin1,
    Ascii,
}

impl FromStr for Charset {
    type Err = Exception;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Charset::Utf8),
            "utf-16" | "utf16" => Ok(Charset::Utf16),
            "utf-16le" => Ok(Charset::Utf16Le),
            "utf-16be" => Ok(Charset::Utf16Be),
            "iso-8859-1" | "latin-1" | "latin1" => Ok(Charset::Latin1),
            "us-ascii" | "ascii" => Ok(Charset::Ascii),
            other => Err(Exception::ConfigError(format!("unknown charset '{}'", other))),
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Charset::Utf8 => "utf-8",
            Charset::Utf16 => "utf-16",
            Charset::Utf16Le => "utf-16le",
            Charset::Utf16Be => "utf-16be",
            Charset::Latin1 => "iso-8859-1",
            Charset::Ascii => "us-ascii",
        };
        write!(f, "{}", name)
    }
}

impl Charset {
    /// 文本无法用该字符集表示时返回 `None`
    pub fn encode(&self, text: &str) -> Option<Vec<u8>> {
        match self {
            Charset::Utf8 => Some(text.as_bytes().to_vec()),
            Charset::Utf16 => {
                let mut out = vec![0xff, 0xfe];
                out.extend(text.encode_utf16().flat_map(|u| u.to_le_bytes()));
                Some(out)
            }
            Charset::Utf16Le => Some(text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()),
            Charset::Utf16Be => Some(text.encode_utf16().flat_map(|u| u.to_be_bytes()).collect()),
            Charset::Latin1 => single_byte(text, 0xff),
            Charset::Ascii => single_byte(text, 0x7f),
        }
    }

    /// 字节不是合法的该字符集文本时返回 `None`
    pub fn decode(&self, bytes: &[u8]) -> Option<String> {
        match self {
            Charset::Utf8 => String::from_utf8(bytes.to_vec()).ok(),
            Charset::Utf16 => match bytes {
                [0xff, 0xfe, rest @ ..] => utf16(rest, u16::from_le_bytes),
                [0xfe, 0xff, rest @ ..] => utf16(rest, u16::from_be_bytes),
                _ => utf16(bytes, u16::from_le_bytes),
            },
            Charset::Utf16Le => utf16(bytes, u16::from_le_bytes),
            Charset::Utf16Be => utf16(bytes, u16::from_be_bytes),
            Charset::Latin1 => Some(bytes.iter().map(|b| *b as char).collect()),
            Charset::Ascii => {
                if bytes.is_ascii() {
                    Some(bytes.iter().map(|b| *b as char).collect())
                } else {
                    None
                }
            }
        }
    }
}

fn single_byte(text: &str, max: u32) -> Option<Vec<u8>> {
    text.chars()
        .map(|c| if c as u32 <= max { Some(c as u8) } else { None })
        .collect()
}

fn utf16(bytes: &[u8], unit: fn([u8; 2]) -> u16) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes.chunks_exact(2).map(|c| unit([c[0], c[1]])).collect();
    String::from_utf16(&units).ok()
}

/// `Accept-Charset` 中的一项；`*` 以 `None` 表示
#[derive(Debug, Clone, PartialEq)]
pub struct CharsetRange {
    pub name: Option<String>,
    pub q: f32,
}

/// 解析 `Accept-Charset`，按 q 值从高到低稳定排序，保留 `q=0` 的项
pub fn parse_accept_charset(header: &str) -> Vec<CharsetRange> {
    let mut ranges: Vec<CharsetRange> = header
        .split(',')
        .filter_map(|item| {
            let mut parts = item.split(';');
            let name = parts.next()?.trim().to_ascii_lowercase();
            if name.is_empty() {
                return None;
            }
            let q = parts
                .find_map(|p| p.trim().strip_prefix("q="))
                .and_then(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            Some(CharsetRange {
                name: if name == "*" { None } else { Some(name) },
                q,
            })
        })
        .collect();
    ranges.sort_by(|a, b| b.q.partial_cmp(&a.q).unwrap_or(std::cmp::Ordering::Equal));
    ranges
}

/// 按客户端偏好依次尝试，返回第一个能表示 `text` 的字符集及编码结果。
/// `*` 代表 `default`；`q=0` 的项不可接受。
pub fn negotiate(
    ranges: &[CharsetRange],
    default: Charset,
    text: &str,
) -> Option<(Charset, Vec<u8>)> {
    ranges
        .iter()
        .filter(|r| r.q > 0.0)
        .filter_map(|r| match &r.name {
            None => Some(default),
            Some(name) => name.parse::<Charset>().ok(),
        })
        .find_map(|charset| charset.encode(text).map(|bytes| (charset, bytes)))
}
