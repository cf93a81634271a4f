// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! 响应体压缩：gzip / deflate / brotli

use std::{
    fmt,
    io::{self, Write},
    str::FromStr,
};

use brotli::enc::{self, backward_references::BrotliEncoderParams};
use flate2::{
    write::{DeflateEncoder, GzEncoder},
    Compression,
};
use log::debug;

/// 支持的内容编码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpEncoding {
    Gzip,
    Deflate,
    Br,
}

impl FromStr for HttpEncoding {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Ok(HttpEncoding::Gzip),
            "deflate" => Ok(HttpEncoding::Deflate),
            "br" => Ok(HttpEncoding::Br),
            _ => Err(()),
        }
    }
}

impl fmt::Display for HttpEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HttpEncoding::Gzip => "gzip",
            HttpEncoding::Deflate => "deflate",
            HttpEncoding::Br => "br",
        };
        write!(f, "{}", name)
    }
}

/// 解析 `Accept-Encoding`，忽略 `q=0` 的编码，按 q 值从高到低排序
pub fn parse_accept_encoding(header: &str) -> Vec<HttpEncoding> {
    let mut weighted: Vec<(HttpEncoding, f32)> = header
        .split(',')
        .filter_map(|item| {
            let mut parts = item.split(';');
            let encoding = parts.next()?.parse::<HttpEncoding>().ok()?;
            let q = parts
                .find_map(|p| p.trim().strip_prefix("q="))
                .and_then(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            if q <= 0.0 {
                None
            } else {
                Some((encoding, q))
            }
        })
        .collect();
    weighted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    weighted.into_iter().map(|(e, _)| e).collect()
}

/// 在客户端可接受的编码中选出服务端启用的一个；客户端偏好优先
pub fn decide_encoding(
    accept_encoding: &[HttpEncoding],
    enabled: &[HttpEncoding],
) -> Option<HttpEncoding> {
    accept_encoding
        .iter()
        .find(|e| enabled.contains(e))
        .copied()
}

pub fn compress(data: &[u8], mode: HttpEncoding) -> io::Result<Vec<u8>> {
    let result = match mode {
        HttpEncoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        HttpEncoding::Deflate => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        HttpEncoding::Br => {
            let params = BrotliEncoderParams::default();
            let mut output = Vec::new();
            enc::BrotliCompress(&mut io::Cursor::new(data), &mut output, &params)?;
            Ok(output)
        }
    };

    if let Ok(ref compressed) = result {
        let ratio = if !data.is_empty() {
            (1.0 - compressed.len() as f64 / data.len() as f64) * 100.0
        } else {
            0.0
        };
        debug!(
            "压缩完成: {}, 原始大小: {} bytes, 压缩后: {} bytes, 压缩率: {:.1}%",
            mode,
            data.len(),
            compressed.len(),
            ratio
        );
    }
    result
}

/// 已经压缩过的内容类型再压缩没有收益
pub fn should_skip_compression(mime_type: &str) -> bool {
    let skip_types = [
        "image/jpeg",
        "image/png",
        "image/gif",
        "image/webp",
        "image/x-icon",
        "video/",
        "audio/",
        "application/zip",
        "application/x-7z-compressed",
        "application/gzip",
        "application/x-gzip",
        "font/woff",
        "font/woff2",
    ];
    let mime_type = mime_type.trim().to_ascii_lowercase();
    skip_types
        .iter()
        .any(|&skip_type| mime_type.starts_with(skip_type))
}
