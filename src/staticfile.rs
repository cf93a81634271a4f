// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! 静态文件输出：MIME 类型、`Last-Modified` 与条件请求、分块读取

use std::{
    ffi::OsStr,
    fs::{self, File},
    io,
    path::{Component, Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use percent_encoding::percent_decode_str;

use crate::{
    exception::Exception, param::MIME_TYPES, pipeline::Context, response::Body, util::http_date,
};

pub fn get_mime(extension: &OsStr) -> &'static str {
    let extension = match extension.to_str() {
        Some(e) => e.to_ascii_lowercase(),
        None => {
            error!("无法将&OsStr转换为&str类型");
            return "application/octet-stream";
        }
    };
    match MIME_TYPES.get(extension.as_str()) {
        Some(v) => *v,
        None => "application/octet-stream",
    }
}

/// 把 `file` 写入当前响应。
///
/// 文件不存在或是目录时返回 `NotFound`，没有读权限时返回 403。
/// 如果请求带有 `If-Modified-Since` 且文件未变化，响应为 304。
pub fn serve_file(
    ctx: &mut Context,
    file: &Path,
    content_type: Option<&str>,
) -> Result<(), Exception> {
    let id = ctx.id();
    let metadata = match fs::metadata(file) {
        Ok(m) if m.is_file() => m,
        Ok(_) => return Err(Exception::NotFound(file.display().to_string())),
        Err(e) => return Err(io_error(e, file, id)),
    };

    if let Ok(modified) = metadata.modified() {
        let modified: DateTime<Utc> = modified.into();
        ctx.response
            .headers_mut()
            .insert("Last-Modified", http_date(&modified));

        let since = ctx
            .request
            .header("If-Modified-Since")
            .and_then(|v| DateTime::parse_from_rfc2822(v.trim()).ok());
        if let Some(since) = since {
            // HTTP 日期只精确到秒
            if modified.timestamp() <= since.timestamp() {
                debug!("[ID{}]文件{}未修改，返回304", id, file.display());
                ctx.response.set_redirect("", 304);
                return Ok(());
            }
        }
    }

    let mime = match content_type {
        Some(t) => t,
        None => file.extension().map_or("application/octet-stream", get_mime),
    };
    debug!("[ID{}]输出文件{}，Content-Type: {}", id, file.display(), mime);

    let handle = File::open(file).map_err(|e| io_error(e, file, id))?;
    let chunk_size = ctx.server().chunk_size();
    let headers = ctx.response.headers_mut();
    headers.insert("Content-Type", mime);
    headers.insert("Content-Length", metadata.len().to_string());
    ctx.response.set_body(Body::from_reader(handle, chunk_size));
    Ok(())
}

fn io_error(e: io::Error, file: &Path, id: u128) -> Exception {
    match e.kind() {
        io::ErrorKind::NotFound => Exception::NotFound(file.display().to_string()),
        io::ErrorKind::PermissionDenied => {
            warn!("[ID{}]没有权限读取{}", id, file.display());
            Exception::HttpError {
                status: 403,
                message: None,
            }
        }
        _ => {
            error!("[ID{}]无法读取文件{}: {}", id, file.display(), e);
            Exception::HandlerError(e.to_string())
        }
    }
}

/// 把 URL 中 `section` 之后的部分映射到 `dir` 下的文件。
///
/// 含有 `..`、根路径或盘符的路径被视为目录穿越，返回 403。
pub fn map_to_dir(dir: &Path, section: &str, path: &str) -> Result<PathBuf, Exception> {
    let section = section.trim_end_matches('/');
    let rest = if section == "global" {
        path
    } else {
        path.strip_prefix(section).unwrap_or(path)
    };
    let decoded = percent_decode_str(rest).decode_utf8_lossy();
    let relative = Path::new(decoded.trim_start_matches('/'));

    let mut target = dir.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => target.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Exception::HttpError {
                    status: 403,
                    message: Some("path traversal is not allowed".to_string()),
                })
            }
        }
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_mime() {
        assert_eq!(get_mime(OsStr::new("html")), "text/html;charset=utf-8");
        assert_eq!(get_mime(OsStr::new("CSS")), "text/css;charset=utf-8");
        assert_eq!(get_mime(OsStr::new("png")), "image/png");
        assert_eq!(get_mime(OsStr::new("unknown")), "application/octet-stream");
    }

    #[test]
    fn test_map_to_dir() {
        let dir = Path::new("/srv/static");
        assert_eq!(
            map_to_dir(dir, "/static", "/static/css/site.css").unwrap(),
            PathBuf::from("/srv/static/css/site.css")
        );
        assert_eq!(
            map_to_dir(dir, "/static/", "/static/a%20b.txt").unwrap(),
            PathBuf::from("/srv/static/a b.txt")
        );
        assert_eq!(
            map_to_dir(dir, "global", "/x.txt").unwrap(),
            PathBuf::from("/srv/static/x.txt")
        );
    }

    #[test]
    fn test_map_to_dir_rejects_traversal() {
        let dir = Path::new("/srv/static");
        for path in ["/static/../secret", "/static/a/%2E%2E/%2E%2E/etc/passwd"] {
            match map_to_dir(dir, "/static", path) {
                Err(Exception::HttpError { status, .. }) => assert_eq!(status, 403),
                other => panic!("unexpected {:?}", other),
            }
        }
    }
}
