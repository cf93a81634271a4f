// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

use chrono::{DateTime, Utc};

use crate::param::reason_phrase;

/// 错误页与重定向页使用的简单 HTML 生成器
pub struct HtmlBuilder {
    title: String,
    css: String,
    body: String,
}

impl HtmlBuilder {
    pub fn from_status_code(code: u16, note: Option<&str>) -> Self {
        let reason = reason_phrase(code);
        let title = format!("{} {}", code, reason);
        let css = r"
            body {
                width: 35em;
                margin: 0 auto;
                font-family: Tahoma, Verdana, Arial, sans-serif;
            }
            pre {
                white-space: pre-wrap;
            }
            "
        .to_string();
        let description = match note {
            Some(n) => escape_html(n),
            None => reason.to_string(),
        };
        let body = format!(
            r"
            <h2>{}</h2>
            <p>{}</p>
            ",
            escape_html(&title),
            description
        );
        Self { title, css, body }
    }

    /// 在页面末尾附加错误追踪信息（仅在调试开关打开时调用）
    pub fn with_traceback(mut self, traceback: &str) -> Self {
        self.body
            .push_str(&format!("<pre id=\"traceback\">{}</pre>", escape_html(traceback)));
        self
    }

    /// 重定向响应的正文：给不会自动跳转的客户端一个可点击的链接
    pub fn redirect(code: u16, url: &str) -> Self {
        let url = escape_html(url);
        let mut page = Self::from_status_code(code, None);
        page.body = format!(
            "<p>This resource can be found at <a href=\"{}\">{}</a>.</p>",
            url, url
        );
        page
    }

    pub fn build(&self) -> String {
        format!(
            r##"<!DOCTYPE html>
            <html>
                <head>
                    <meta charset="utf-8">
                    <title>{}</title>
                    <style>{}</style>
                </head>
                <body>
                {}
                </body>
            </html>"##,
            escape_html(&self.title),
            self.css,
            self.body
        )
    }
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// RFC 1123 格式的 HTTP 日期，例如 `Sun, 06 Nov 1994 08:49:37 GMT`
pub fn http_date(date: &DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// 将头名称规范化为 Title-Case：每个非字母字符之后的字母大写，其余小写。
pub fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if c.is_ascii_alphabetic() {
            if upper {
                out.push(c.to_ascii_uppercase());
            } else {
                out.push(c.to_ascii_lowercase());
            }
            upper = false;
        } else {
            out.push(c);
            upper = true;
        }
    }
    out
}

/// 以 `base` 为基准解析相对路径 `path`，并消除 `.` 与 `..` 段。
///
/// 绝对路径（以 `/` 开头）直接规范化后返回。
pub fn url_join(base: &str, path: &str) -> String {
    let origin = match url::Url::parse("http://localhost/") {
        Ok(u) => u,
        Err(_) => return path.to_string(),
    };
    let joined = origin
        .join(base)
        .and_then(|b| b.join(path))
        .map(|u| u.path().to_string());
    joined.unwrap_or_else(|_| path.to_string())
}

/// 把 panic 载荷转换为可读的错误描述
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("content-type"), "Content-Type");
        assert_eq!(title_case("CONTENT-LENGTH"), "Content-Length");
        assert_eq!(title_case("www-authenticate"), "Www-Authenticate");
        assert_eq!(title_case("x-forwarded-for"), "X-Forwarded-For");
        assert_eq!(title_case("etag"), "Etag");
    }

    #[test]
    fn test_http_date() {
        let date = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        assert_eq!(http_date(&date), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<a href='x'>&</a>"), "&lt;a href=&#39;x&#39;&gt;&amp;&lt;/a&gt;");
    }

    #[test]
    fn test_html_builder_from_status_code() {
        let html = HtmlBuilder::from_status_code(404, Some("找不到 /nope")).build();
        assert!(html.contains("404 Not Found"));
        assert!(html.contains("找不到 /nope"));
        assert!(html.contains("<!DOCTYPE html>"));
        assert!(!html.contains("traceback"));
    }

    #[test]
    fn test_html_builder_unknown_code_does_not_panic() {
        let html = HtmlBuilder::from_status_code(599, None).build();
        assert!(html.contains("599"));
    }

    #[test]
    fn test_html_builder_traceback_is_escaped() {
        let html = HtmlBuilder::from_status_code(500, None)
            .with_traceback("boom <script>")
            .build();
        assert!(html.contains("id=\"traceback\""));
        assert!(html.contains("boom &lt;script&gt;"));
    }

    #[test]
    fn test_redirect_page() {
        let html = HtmlBuilder::redirect(303, "/a/b/?x=1&y=2").build();
        assert!(html.contains("href=\"/a/b/?x=1&amp;y=2\""));
    }

    #[test]
    fn test_url_join() {
        assert_eq!(url_join("/a/b", "c"), "/a/c");
        assert_eq!(url_join("/a/b/", "c"), "/a/b/c");
        assert_eq!(url_join("/a/b", "/x/y"), "/x/y");
        assert_eq!(url_join("/a/b/c", "../d"), "/a/d");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("oops");
        assert_eq!(panic_message(payload.as_ref()), "oops");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
    }
}
