// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 工具
//!
//! 工具是带名字、可配置的钩子组合，通过 `tools.<名称>.<选项>` 形式的配置键启用。
//! 每个请求开始时，[`ToolBox::setup`] 读取该路径的合并配置，把 `on = true` 的工具
//! 按优先级挂到本次请求的 [`HookMap`] 上。
//!
//! 工具分三类：
//! - [`Tool::Hook`]：在一个挂载点上运行的回调；
//! - [`Tool::Main`]：在 `before_main` 运行，返回 `true` 表示已经生成了响应，主处理器不再执行；
//! - [`Tool::Compound`]：自行在多个挂载点上挂载回调。
//!
//! 内置工具：`response_headers`、`gzip`、`encode`、`decode`、`staticdir`、`staticfile`、
//! `caching`、`virtual_host`、`base_url`。

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use log::{debug, error, warn};
use toml::Value;

use crate::{
    cache::{CachedResponse, ResponseCache},
    charset::{self, Charset},
    config::{Merged, ServerConfig},
    dispatch::{Arguments, Handler},
    encoding::{compress, decide_encoding, parse_accept_encoding, should_skip_compression, HttpEncoding},
    exception::Exception,
    form::{self, FieldValue, ParamMap},
    hooks::{HookMap, HookPoint},
    param::HttpRequestMethod,
    pipeline::Context,
    response::Response,
    staticfile,
};

/// 单个工具的选项
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolConf(BTreeMap<String, Value>);

impl ToolConf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.0.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(|v| v.as_integer())
    }

    /// 字符串数组，或以逗号分隔的字符串
    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// 启用该工具的配置段
    pub fn section(&self) -> &str {
        self.get_str("section").unwrap_or("global")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

type HookFn = Arc<dyn Fn(&mut Context, &ToolConf) -> Result<(), Exception> + Send + Sync>;
type MainFn = Arc<dyn Fn(&mut Context, &ToolConf) -> Result<bool, Exception> + Send + Sync>;
type SetupFn = Arc<dyn Fn(&mut HookMap<Context>, ToolConf) + Send + Sync>;

#[derive(Clone)]
pub enum Tool {
    Hook { point: HookPoint, callable: HookFn },
    Main { callable: MainFn },
    Compound { setup: SetupFn },
}

impl Tool {
    pub fn hook<F>(point: HookPoint, callable: F) -> Self
    where
        F: Fn(&mut Context, &ToolConf) -> Result<(), Exception> + Send + Sync + 'static,
    {
        Tool::Hook {
            point,
            callable: Arc::new(callable),
        }
    }

    pub fn main<F>(callable: F) -> Self
    where
        F: Fn(&mut Context, &ToolConf) -> Result<bool, Exception> + Send + Sync + 'static,
    {
        Tool::Main {
            callable: Arc::new(callable),
        }
    }

    pub fn compound<F>(setup: F) -> Self
    where
        F: Fn(&mut HookMap<Context>, ToolConf) + Send + Sync + 'static,
    {
        Tool::Compound {
            setup: Arc::new(setup),
        }
    }

    /// 把工具挂到 `hooks` 上
    pub fn setup(&self, hooks: &mut HookMap<Context>, conf: ToolConf) {
        match self {
            Tool::Hook { point, callable } => {
                let callable = callable.clone();
                hooks.attach_with(*point, conf, move |ctx: &mut Context, conf: &ToolConf| {
                    callable(ctx, conf)
                });
            }
            Tool::Main { callable } => {
                let callable = callable.clone();
                hooks.attach_with(
                    HookPoint::BeforeMain,
                    conf,
                    move |ctx: &mut Context, conf: &ToolConf| {
                        if !ctx.request.execute_main() {
                            return Ok(());
                        }
                        if callable(ctx, conf)? {
                            ctx.request.set_execute_main(false);
                        }
                        Ok(())
                    },
                );
            }
            Tool::Compound { setup } => setup(hooks, conf),
        }
    }

    /// 主处理型工具可以直接当作处理器挂到对象树上；没有处理请求时返回 404
    pub fn handler(&self, conf: ToolConf) -> Option<Handler> {
        let callable = match self {
            Tool::Main { callable } => callable.clone(),
            _ => return None,
        };
        Some(Handler::exposed(move |ctx: &mut Context, _: Arguments| {
            if callable(ctx, &conf)? {
                Ok(ctx.response.take_body())
            } else {
                Err(Exception::NotFound(ctx.request.path().to_string()))
            }
        }))
    }

    /// 用工具包装一个处理器：`before_main` 上的回调先于处理器执行，
    /// `before_finalize` 上的回调在处理器返回之后执行。其他挂载点上的回调不会运行。
    pub fn wrap(&self, conf: ToolConf, inner: Handler) -> Handler {
        let mut hooks = HookMap::new();
        self.setup(&mut hooks, conf);
        let exposed = inner.is_exposed();
        Handler::new(exposed, move |ctx: &mut Context, args: Arguments| {
            hooks.run(HookPoint::BeforeMain, ctx)?;
            if ctx.request.execute_main() {
                let body = inner.call(ctx, args)?;
                ctx.response.set_body(body);
            }
            hooks.run(HookPoint::BeforeFinalize, ctx)?;
            Ok(ctx.response.take_body())
        })
    }
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tool::Hook { point, .. } => write!(f, "Tool::Hook({})", point),
            Tool::Main { .. } => write!(f, "Tool::Main"),
            Tool::Compound { .. } => write!(f, "Tool::Compound"),
        }
    }
}

/// 优先级越小越先挂载
pub const PRIORITY_VIRTUAL_HOST: i32 = 10;
pub const PRIORITY_BASE_URL: i32 = 10;
pub const PRIORITY_DECODE: i32 = 20;
pub const PRIORITY_STATIC: i32 = 30;
pub const PRIORITY_RESPONSE_HEADERS: i32 = 40;
pub const PRIORITY_DEFAULT: i32 = 50;
pub const PRIORITY_ENCODE: i32 = 70;
pub const PRIORITY_GZIP: i32 = 80;
pub const PRIORITY_CACHING: i32 = 90;

#[derive(Debug, Clone)]
struct Registered {
    tool: Tool,
    priority: i32,
}

/// 名称 → 工具
#[derive(Debug, Clone, Default)]
pub struct ToolBox {
    tools: BTreeMap<String, Registered>,
}

impl ToolBox {
    pub fn new() -> Self {
        Self::default()
    }

    /// 含全部内置工具的工具箱
    pub fn with_builtins(server: &ServerConfig) -> Self {
        let mut toolbox = Self::new();
        toolbox.register(
            "response_headers",
            PRIORITY_RESPONSE_HEADERS,
            Tool::hook(HookPoint::BeforeFinalize, response_headers),
        );
        toolbox.register(
            "gzip",
            PRIORITY_GZIP,
            Tool::hook(HookPoint::BeforeFinalize, gzip),
        );
        toolbox.register(
            "encode",
            PRIORITY_ENCODE,
            Tool::hook(HookPoint::BeforeFinalize, encode),
        );
        toolbox.register(
            "decode",
            PRIORITY_DECODE,
            Tool::hook(HookPoint::BeforeMain, decode),
        );
        toolbox.register(
            "base_url",
            PRIORITY_BASE_URL,
            Tool::hook(HookPoint::BeforeRequestBody, base_url),
        );
        toolbox.register("staticdir", PRIORITY_STATIC, Tool::main(staticdir));
        toolbox.register("staticfile", PRIORITY_STATIC, Tool::main(staticfile));
        toolbox.register(
            "virtual_host",
            PRIORITY_VIRTUAL_HOST,
            Tool::hook(HookPoint::BeforeRequestBody, virtual_host),
        );
        let cache = Arc::new(Mutex::new(ResponseCache::from_capacity(server.cache_size())));
        toolbox.register("caching", PRIORITY_CACHING, caching(cache));
        toolbox
    }

    pub fn register(&mut self, name: &str, priority: i32, tool: Tool) {
        self.tools
            .insert(name.to_string(), Registered { tool, priority });
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name).map(|r| &r.tool)
    }

    /// 从合并配置中按工具名收集选项
    pub fn tool_confs(merged: &Merged) -> BTreeMap<String, ToolConf> {
        let mut confs: BTreeMap<String, ToolConf> = BTreeMap::new();
        for (key, value) in merged {
            let Some((name, option)) = key
                .strip_prefix("tools.")
                .and_then(|rest| rest.split_once('.'))
            else {
                continue;
            };
            confs
                .entry(name.to_string())
                .or_default()
                .insert(option, value.clone());
        }
        confs
    }

    /// 把启用的工具挂到 `hooks` 上，返回按挂载顺序排列的工具名
    pub fn setup(&self, hooks: &mut HookMap<Context>, merged: &Merged) -> Vec<String> {
        let mut enabled: Vec<(i32, String, ToolConf)> = Vec::new();
        for (name, conf) in Self::tool_confs(merged) {
            if !conf.get_bool("on", false) {
                continue;
            }
            match self.tools.get(&name) {
                Some(registered) => enabled.push((registered.priority, name, conf)),
                None => warn!("配置启用了不存在的工具 {}，已忽略", name),
            }
        }
        enabled.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        let mut names = Vec::with_capacity(enabled.len());
        for (_, name, conf) in enabled {
            if let Some(registered) = self.tools.get(&name) {
                registered.tool.setup(hooks, conf);
            }
            names.push(name);
        }
        names
    }
}

// --- 内置工具 ---

/// `tools.response_headers.headers`：`[["X-Frame-Options", "DENY"]]`，
/// 或 `headers.X-Frame-Options = "DENY"` 形式的子键
fn response_headers(ctx: &mut Context, conf: &ToolConf) -> Result<(), Exception> {
    let mut pairs: Vec<(String, String)> = Vec::new();
    if let Some(Value::Array(items)) = conf.get("headers") {
        for item in items {
            if let Some([Value::String(name), Value::String(value)]) =
                item.as_array().map(|a| a.as_slice())
            {
                pairs.push((name.clone(), value.clone()));
            }
        }
    }
    for (key, value) in conf.iter() {
        if let (Some(name), Some(value)) = (key.strip_prefix("headers."), value.as_str()) {
            pairs.push((name.to_string(), value.to_string()));
        }
    }
    for (name, value) in pairs {
        ctx.response.headers_mut().insert(&name, value);
    }
    Ok(())
}

fn gzip(ctx: &mut Context, conf: &ToolConf) -> Result<(), Exception> {
    let id = ctx.id();
    if ctx.response.status_code() != 200 || ctx.response.headers().contains("Content-Encoding") {
        return Ok(());
    }
    let content_type = ctx
        .response
        .headers()
        .get("Content-Type")
        .unwrap_or("")
        .to_string();
    if should_skip_compression(&content_type) {
        debug!("[ID{}]内容类型{}无需压缩", id, content_type);
        return Ok(());
    }
    let mime_types = conf.get_str_list("mime_types");
    if !mime_types.is_empty() && !mime_types.iter().any(|m| content_type.starts_with(m.as_str())) {
        return Ok(());
    }
    ctx.response.headers_mut().append("Vary", "Accept-Encoding");

    let accepted = match ctx.request.header("Accept-Encoding") {
        Some(header) => parse_accept_encoding(header),
        None => return Ok(()),
    };
    let mut enabled: Vec<HttpEncoding> = conf
        .get_str_list("encodings")
        .iter()
        .filter_map(|e| e.parse().ok())
        .collect();
    if enabled.is_empty() {
        enabled = vec![HttpEncoding::Gzip, HttpEncoding::Deflate, HttpEncoding::Br];
    }
    let encoding = match decide_encoding(&accepted, &enabled) {
        Some(e) => e,
        None => return Ok(()),
    };

    let body = ctx.response.take_body().collect()?;
    match compress(&body, encoding) {
        Ok(compressed) => {
            debug!("[ID{}]使用{}压缩编码", id, encoding);
            let headers = ctx.response.headers_mut();
            headers.insert("Content-Encoding", encoding.to_string());
            headers.remove("Content-Length");
            ctx.response.set_body(compressed);
        }
        Err(e) => {
            error!("[ID{}]压缩失败: {}，返回未压缩内容", id, e);
            ctx.response.set_body(body);
        }
    }
    Ok(())
}

/// 给文本响应选择字符集。
///
/// `tools.encode.encoding` 强制使用某个字符集；否则按 `Accept-Charset` 协商，
/// 请求没有该头时使用 `default_encoding`（缺省 utf-8）。没有可接受的字符集时返回 406。
fn encode(ctx: &mut Context, conf: &ToolConf) -> Result<(), Exception> {
    let id = ctx.id();
    let content_type = ctx
        .response
        .headers()
        .get("Content-Type")
        .unwrap_or("")
        .to_string();
    if !content_type.starts_with("text/") || content_type.to_ascii_lowercase().contains("charset=")
    {
        return Ok(());
    }
    let body = ctx.response.take_body().collect()?;
    let text = match std::str::from_utf8(&body) {
        Ok(text) => text.to_string(),
        Err(_) => {
            debug!("[ID{}]响应体不是 UTF-8 文本，跳过字符集编码", id);
            ctx.response.set_body(body);
            return Ok(());
        }
    };

    let chosen = match conf.get_str("encoding") {
        Some(name) => {
            let forced: Charset = name.parse()?;
            match forced.encode(&text) {
                Some(bytes) => (forced, bytes),
                None => {
                    return Err(Exception::HttpError {
                        status: 500,
                        message: Some(format!("the response could not be encoded with {}", forced)),
                    })
                }
            }
        }
        None => {
            let default: Charset = conf
                .get_str("default_encoding")
                .unwrap_or("utf-8")
                .parse()?;
            let ranges = match ctx.request.header("Accept-Charset") {
                Some(header) => charset::parse_accept_charset(header),
                None => vec![charset::CharsetRange { name: None, q: 1.0 }],
            };
            match charset::negotiate(&ranges, default, &text) {
                Some(found) => found,
                None => {
                    warn!("[ID{}]没有可接受的字符集：{:?}", id, ctx.request.header("Accept-Charset"));
                    let message = format!(
                        "Your client sent this Accept-Charset header: {}. We tried these charsets: {}.",
                        ctx.request.header("Accept-Charset").unwrap_or(""),
                        ranges
                            .iter()
                            .filter_map(|r| r.name.as_deref())
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                    return Err(Exception::HttpError {
                        status: 406,
                        message: Some(message),
                    });
                }
            }
        }
    };

    let (charset, bytes) = chosen;
    debug!("[ID{}]响应使用字符集{}", id, charset);
    let headers = ctx.response.headers_mut();
    headers.insert("Content-Type", format!("{};charset={}", content_type, charset));
    headers.remove("Content-Length");
    ctx.response.set_body(bytes);
    Ok(())
}

/// `tools.decode.encoding`（缺省 utf-8）：按给定字符集重新解码查询字符串
/// 与 urlencoded 表单，表单字段仍覆盖同名查询参数，multipart 字段保持不变
fn decode(ctx: &mut Context, conf: &ToolConf) -> Result<(), Exception> {
    let charset: Charset = conf.get_str("encoding").unwrap_or("utf-8").parse()?;
    let query = form::raw_pairs(ctx.request.query_string().as_bytes());
    let body = ctx
        .request
        .form_body()
        .map(|b| form::raw_pairs(b))
        .unwrap_or_default();

    let decode_pairs = |pairs: &[(Vec<u8>, Vec<u8>)]| -> Result<ParamMap, Exception> {
        let mut params = ParamMap::new();
        for (key, value) in pairs {
            match (charset.decode(key), charset.decode(value)) {
                (Some(key), Some(value)) => params.push(key, FieldValue::Text(value)),
                _ => {
                    return Err(Exception::BadRequest(format!(
                        "the request parameters are not valid {}",
                        charset
                    )))
                }
            }
        }
        Ok(params)
    };
    let mut decoded = decode_pairs(&query)?;
    decoded.override_with(decode_pairs(&body)?);

    let params = ctx.request.params_mut();
    for (key, _) in query.iter().chain(body.iter()) {
        params.remove(&String::from_utf8_lossy(key));
    }
    params.override_with(decoded);
    debug!("[ID{}]请求参数按{}重新解码", ctx.id(), charset);
    Ok(())
}

/// `tools.base_url.base` 给出对外的 `scheme://host`，缺省取 Host 头；
/// `use_x_forwarded_host`（缺省 true）时以代理转发的主机为准
fn base_url(ctx: &mut Context, conf: &ToolConf) -> Result<(), Exception> {
    let mut base = match conf.get_str("base") {
        Some(base) => base.to_string(),
        None => ctx.request.header("Host").unwrap_or("").to_string(),
    };
    if conf.get_bool("use_x_forwarded_host", true) {
        if let Some(forwarded) = ctx
            .request
            .header("X-Forwarded-Host")
            .and_then(|h| h.split(',').next())
        {
            base = forwarded.trim().to_string();
        }
    }
    if !base.contains("://") {
        base = format!("{}://{}", ctx.request.scheme(), base);
    }
    let base = base.trim_end_matches('/').to_string();
    debug!("[ID{}]请求基地址改写为{}", ctx.id(), base);
    ctx.request.set_base(base);
    Ok(())
}

fn resolve_dir(conf: &ToolConf, key: &str) -> Result<PathBuf, Exception> {
    let value = conf.get_str(key).ok_or_else(|| {
        Exception::ConfigError(format!("the '{}' option of this tool is required", key))
    })?;
    let path = PathBuf::from(value);
    match conf.get_str("root") {
        Some(root) if path.is_relative() => Ok(Path::new(root).join(path)),
        _ => Ok(path),
    }
}

fn is_get_or_head(ctx: &Context) -> bool {
    matches!(
        ctx.request.method(),
        HttpRequestMethod::Get | HttpRequestMethod::Head
    )
}

/// 按扩展名覆盖 MIME：`content_types.md = "text/markdown"`
fn content_type_override<'a>(conf: &'a ToolConf, file: &Path) -> Option<&'a str> {
    let ext = file.extension()?.to_str()?;
    conf.get_str(&format!("content_types.{}", ext))
}

fn staticdir(ctx: &mut Context, conf: &ToolConf) -> Result<bool, Exception> {
    if !is_get_or_head(ctx) {
        return Ok(false);
    }
    let dir = resolve_dir(conf, "dir")?;
    let mut target = staticfile::map_to_dir(&dir, conf.section(), ctx.request.path())?;
    if target.is_dir() {
        match conf.get_str("index") {
            Some(index) => target.push(index),
            None => return Ok(false),
        }
    }
    let content_type = content_type_override(conf, &target);
    match staticfile::serve_file(ctx, &target, content_type) {
        Ok(()) => Ok(true),
        Err(Exception::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

fn staticfile(ctx: &mut Context, conf: &ToolConf) -> Result<bool, Exception> {
    if !is_get_or_head(ctx) {
        return Ok(false);
    }
    let file = resolve_dir(conf, "filename")?;
    let content_type = content_type_override(conf, &file);
    match staticfile::serve_file(ctx, &file, content_type) {
        Ok(()) => Ok(true),
        Err(Exception::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// `tools.virtual_host.<域名> = "<前缀>"`：按 Host 把请求路径加上前缀
fn virtual_host(ctx: &mut Context, conf: &ToolConf) -> Result<(), Exception> {
    let forwarded = if conf.get_bool("use_x_forwarded_host", true) {
        ctx.request.header("X-Forwarded-Host")
    } else {
        None
    };
    let host = match forwarded.or_else(|| ctx.request.header("Host")) {
        Some(h) => h.to_string(),
        None => return Ok(()),
    };
    if let Some(prefix) = conf.get_str(&host) {
        let prefix = prefix.trim_end_matches('/');
        if !prefix.is_empty() {
            let path = format!("{}{}", prefix, ctx.request.path());
            debug!("[ID{}]虚拟主机{}，路径改写为{}", ctx.id(), host, path);
            ctx.request.set_path(path);
        }
    }
    Ok(())
}

const CACHE_HIT_NOTE: &str = "caching.hit";

fn lock_cache(cache: &Mutex<ResponseCache>, id: u128) -> MutexGuard<'_, ResponseCache> {
    match cache.lock() {
        Ok(lock) => lock,
        Err(poisoned) => {
            warn!("[ID{}]缓存锁被污染，恢复并继续", id);
            poisoned.into_inner()
        }
    }
}

fn cache_key(ctx: &Context) -> String {
    let request = &ctx.request;
    format!(
        "{}{}{}?{}|{}",
        request.header("Host").unwrap_or(""),
        request.script_name(),
        request.path(),
        request.query_string(),
        request.header("Accept-Encoding").unwrap_or("")
    )
}

/// `tools.caching.delay`：条目存活秒数，默认 600
fn caching(cache: Arc<Mutex<ResponseCache>>) -> Tool {
    Tool::compound(move |hooks: &mut HookMap<Context>, conf: ToolConf| {
        let delay = Duration::from_secs(conf.get_int("delay").unwrap_or(600).max(0) as u64);

        let lookup = cache.clone();
        hooks.attach(HookPoint::BeforeMain, move |ctx: &mut Context| {
            if !ctx.request.execute_main() || !is_get_or_head(ctx) {
                return Ok(());
            }
            let key = cache_key(ctx);
            let hit = lock_cache(&lookup, ctx.id()).find(&key);
            if let Some(hit) = hit {
                debug!("[ID{}]响应缓存命中：{}", ctx.id(), key);
                let mut seen = BTreeSet::new();
                let headers = ctx.response.headers_mut();
                for (name, value) in &hit.headers {
                    if seen.insert(name.to_ascii_lowercase()) {
                        headers.remove(name);
                    }
                    headers.append(name, value.clone());
                }
                ctx.response.set_status(hit.status);
                ctx.response.set_body(hit.body);
                ctx.request.set_execute_main(false);
                ctx.set_note(CACHE_HIT_NOTE, "true");
            }
            Ok(())
        });

        let store = cache.clone();
        hooks.attach(HookPoint::BeforeFinalize, move |ctx: &mut Context| {
            if ctx.note(CACHE_HIT_NOTE).is_some()
                || ctx.request.method() != HttpRequestMethod::Get
                || ctx.response.status_code() != 200
            {
                return Ok(());
            }
            let body = ctx.response.take_body().collect()?;
            let (code, reason) = Response::check_status(ctx.response.status());
            let headers = ctx
                .response
                .headers()
                .iter()
                .filter(|(name, _)| !name.eq_ignore_ascii_case("Date"))
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect();
            let key = cache_key(ctx);
            lock_cache(&store, ctx.id()).push(
                &key,
                CachedResponse {
                    status: format!("{} {}", code, reason),
                    headers,
                    body: body.clone(),
                },
                delay,
            );
            ctx.response.set_body(body);
            Ok(())
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{RawRequest, Request};

    fn context(request_line: &str, headers: &[(&str, &str)]) -> Context {
        let raw = RawRequest::new(request_line, headers);
        let server = Arc::new(ServerConfig::default());
        let mut request = Request::new(&raw, server.protocol_version());
        request
            .process_headers(&raw, server.protocol_version(), 1)
            .unwrap();
        Context::new(request, server, 1)
    }

    #[test]
    fn test_tool_confs_group_by_name() {
        let mut merged = Merged::new();
        merged.insert("tools.gzip.on".into(), Value::Boolean(true));
        merged.insert("tools.gzip.mime_types".into(), Value::String("text/html".into()));
        merged.insert("tools.virtual_host.www.example.com".into(), Value::String("/blog".into()));
        merged.insert("log.level".into(), Value::String("debug".into()));

        let confs = ToolBox::tool_confs(&merged);
        assert_eq!(confs.len(), 2);
        assert!(confs["gzip"].get_bool("on", false));
        assert_eq!(confs["gzip"].get_str_list("mime_types"), vec!["text/html"]);
        assert_eq!(confs["virtual_host"].get_str("www.example.com"), Some("/blog"));
    }

    #[test]
    fn test_setup_orders_by_priority_and_skips_disabled() {
        let toolbox = ToolBox::with_builtins(&ServerConfig::default());
        let mut merged = Merged::new();
        merged.insert("tools.caching.on".into(), Value::Boolean(true));
        merged.insert("tools.gzip.on".into(), Value::Boolean(true));
        merged.insert("tools.response_headers.on".into(), Value::Boolean(true));
        merged.insert("tools.staticdir.on".into(), Value::Boolean(false));
        merged.insert("tools.nonexistent.on".into(), Value::Boolean(true));

        let mut hooks = HookMap::new();
        let names = toolbox.setup(&mut hooks, &merged);
        assert_eq!(names, vec!["response_headers", "gzip", "caching"]);
        assert_eq!(hooks.len(HookPoint::BeforeFinalize), 3);
        assert_eq!(hooks.len(HookPoint::BeforeMain), 1);
    }

    #[test]
    fn test_response_headers_tool() {
        let mut ctx = context("GET / HTTP/1.1", &[("Host", "x")]);
        let conf = ToolConf::new()
            .with(
                "headers",
                Value::Array(vec![Value::Array(vec![
                    Value::String("X-Frame-Options".into()),
                    Value::String("DENY".into()),
                ])]),
            )
            .with("headers.X-Powered-By", "webtree");
        response_headers(&mut ctx, &conf).unwrap();
        assert_eq!(ctx.response.headers().get("X-Frame-Options"), Some("DENY"));
        assert_eq!(ctx.response.headers().get("x-powered-by"), Some("webtree"));
    }

    #[test]
    fn test_gzip_tool_compresses_text() {
        let mut ctx = context("GET / HTTP/1.1", &[("Host", "x"), ("Accept-Encoding", "gzip")]);
        ctx.response.set_body("hello hello hello hello hello hello");
        gzip(&mut ctx, &ToolConf::new()).unwrap();
        assert_eq!(ctx.response.headers().get("Content-Encoding"), Some("gzip"));
        assert_eq!(ctx.response.headers().get("Vary"), Some("Accept-Encoding"));
        let body = ctx.response.take_body().collect().unwrap();
        assert_eq!(&body[0..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn test_gzip_tool_skips_without_accept_encoding_or_for_images() {
        let mut ctx = context("GET / HTTP/1.1", &[("Host", "x")]);
        ctx.response.set_body("plain");
        gzip(&mut ctx, &ToolConf::new()).unwrap();
        assert!(!ctx.response.headers().contains("Content-Encoding"));

        let mut ctx = context("GET / HTTP/1.1", &[("Host", "x"), ("Accept-Encoding", "gzip")]);
        ctx.response.headers_mut().insert("Content-Type", "image/png");
        ctx.response.set_body("png bytes");
        gzip(&mut ctx, &ToolConf::new()).unwrap();
        assert!(!ctx.response.headers().contains("Content-Encoding"));
    }

    #[test]
    fn test_virtual_host_tool() {
        let mut ctx = context("GET /post/1 HTTP/1.1", &[("Host", "blog.example.com")]);
        let conf = ToolConf::new().with("blog.example.com", "/blog/");
        virtual_host(&mut ctx, &conf).unwrap();
        assert_eq!(ctx.request.path(), "/blog/post/1");

        let mut ctx = context(
            "GET / HTTP/1.1",
            &[("Host", "internal"), ("X-Forwarded-Host", "blog.example.com")],
        );
        let conf = conf.with("use_x_forwarded_host", false);
        virtual_host(&mut ctx, &conf).unwrap();
        assert_eq!(ctx.request.path(), "/");
    }

    #[test]
    fn test_main_tool_as_handler() {
        let tool = Tool::main(|ctx, conf| {
            if conf.get_bool("handle", false) {
                ctx.response.set_body("handled");
                Ok(true)
            } else {
                Ok(false)
            }
        });
        let mut ctx = context("GET /x HTTP/1.1", &[("Host", "x")]);
        let handler = tool.handler(ToolConf::new().with("handle", true)).unwrap();
        let body = handler.call(&mut ctx, Arguments::default()).unwrap();
        assert_eq!(body.collect().unwrap(), bytes::Bytes::from("handled"));

        let handler = tool.handler(ToolConf::new()).unwrap();
        assert!(matches!(
            handler.call(&mut ctx, Arguments::default()),
            Err(Exception::NotFound(_))
        ));
        assert!(Tool::hook(HookPoint::BeforeMain, |_, _| Ok(())).handler(ToolConf::new()).is_none());
    }

    #[test]
    fn test_wrap_runs_before_and_after_inner_handler() {
        let tool = Tool::compound(|hooks, _conf| {
            hooks.attach(HookPoint::BeforeMain, |ctx| {
                ctx.set_note("before", "yes");
                Ok(())
            });
            hooks.attach(HookPoint::BeforeFinalize, |ctx| {
                let body = ctx.response.take_body().collect()?;
                let upper = String::from_utf8_lossy(&body).to_uppercase();
                ctx.response.set_body(upper);
                Ok(())
            });
        });
        let inner = Handler::exposed(|ctx: &mut Context, _| {
            Ok(format!("seen {}", ctx.note("before").unwrap_or("no")))
        });
        let wrapped = tool.wrap(ToolConf::new(), inner);
        assert!(wrapped.is_exposed());

        let mut ctx = context("GET / HTTP/1.1", &[("Host", "x")]);
        let body = wrapped.call(&mut ctx, Arguments::default()).unwrap();
        assert_eq!(body.collect().unwrap(), bytes::Bytes::from("SEEN YES"));
    }

    const MAO: &str = "\u{6bdb}\u{6cfd}\u{4e1c}: Sing, Little Birdie?";

    fn encoded(accept_charset: Option<&str>, conf: &ToolConf) -> Result<Context, Exception> {
        let mut headers = vec![("Host", "x")];
        if let Some(value) = accept_charset {
            headers.push(("Accept-Charset", value));
        }
        let mut ctx = context("GET /mao HTTP/1.1", &headers);
        ctx.response.set_body(MAO);
        encode(&mut ctx, conf).map(|()| ctx)
    }

    #[test]
    fn test_encode_defaults_to_utf8() {
        let mut ctx = encoded(None, &ToolConf::new()).unwrap();
        assert_eq!(
            ctx.response.headers().get("Content-Type"),
            Some("text/html;charset=utf-8")
        );
        let body = ctx.response.take_body().collect().unwrap();
        assert_eq!(&body[..], MAO.as_bytes());
    }

    #[test]
    fn test_encode_negotiates_accept_charset() {
        let mut ctx = encoded(Some("utf-16"), &ToolConf::new()).unwrap();
        assert_eq!(
            ctx.response.headers().get("Content-Type"),
            Some("text/html;charset=utf-16")
        );
        let body = ctx.response.take_body().collect().unwrap();
        assert_eq!(&body[..2], &[0xff, 0xfe]);

        // latin-1 放不下中文，退到 q 值更低的 utf-16
        let ctx = encoded(Some("iso-8859-1;q=1, utf-16;q=0.5"), &ToolConf::new()).unwrap();
        assert_eq!(
            ctx.response.headers().get("Content-Type"),
            Some("text/html;charset=utf-16")
        );

        let ctx = encoded(Some("*;q=1, utf-7;q=.2"), &ToolConf::new()).unwrap();
        assert_eq!(
            ctx.response.headers().get("Content-Type"),
            Some("text/html;charset=utf-8")
        );
    }

    #[test]
    fn test_encode_not_acceptable() {
        match encoded(Some("iso-8859-1, *;q=0"), &ToolConf::new()) {
            Err(Exception::HttpError { status, message }) => {
                assert_eq!(status, 406);
                assert!(message.unwrap().contains("iso-8859-1"));
            }
            other => panic!("expected 406, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_encode_forced_and_skips_binary() {
        let conf = ToolConf::new().with("encoding", "utf-16be");
        let mut ctx = encoded(Some("iso-8859-1"), &conf).unwrap();
        let body = ctx.response.take_body().collect().unwrap();
        assert_eq!(&body[..2], &[0x6b, 0xdb]);

        let conf = ToolConf::new().with("encoding", "us-ascii");
        assert!(matches!(
            encoded(None, &conf),
            Err(Exception::HttpError { status: 500, .. })
        ));

        let mut ctx = context("GET / HTTP/1.1", &[("Host", "x")]);
        ctx.response.headers_mut().insert("Content-Type", "image/png");
        ctx.response.set_body("png bytes");
        encode(&mut ctx, &ToolConf::new()).unwrap();
        assert_eq!(ctx.response.headers().get("Content-Type"), Some("image/png"));
    }

    #[test]
    fn test_decode_uses_configured_charset() {
        let mut ctx = context("GET /?price=%A31&keep=yes HTTP/1.1", &[("Host", "x")]);
        ctx.request
            .params_mut()
            .push("upload", FieldValue::Text("multipart".into()));
        let conf = ToolConf::new().with("encoding", "iso-8859-1");
        decode(&mut ctx, &conf).unwrap();
        assert_eq!(ctx.request.params().text("price"), Some("\u{a3}1"));
        assert_eq!(ctx.request.params().text("keep"), Some("yes"));
        assert_eq!(ctx.request.params().text("upload"), Some("multipart"));
        assert_eq!(ctx.request.params().len(), 3);
    }

    #[test]
    fn test_decode_rejects_invalid_bytes() {
        let mut ctx = context("GET /?price=%A31 HTTP/1.1", &[("Host", "x")]);
        assert!(matches!(
            decode(&mut ctx, &ToolConf::new()),
            Err(Exception::BadRequest(_))
        ));
        let conf = ToolConf::new().with("encoding", "klingon");
        assert!(matches!(
            decode(&mut ctx, &conf),
            Err(Exception::ConfigError(_))
        ));
    }

    #[test]
    fn test_base_url_tool() {
        let mut ctx = context(
            "GET / HTTP/1.1",
            &[("Host", "internal:8080"), ("X-Forwarded-Host", "www.example.com, proxy")],
        );
        base_url(&mut ctx, &ToolConf::new()).unwrap();
        assert_eq!(ctx.request.base(), "http://www.example.com");

        let conf = ToolConf::new()
            .with("base", "https://shop.example.com/")
            .with("use_x_forwarded_host", false);
        base_url(&mut ctx, &conf).unwrap();
        assert_eq!(ctx.request.base(), "https://shop.example.com");
    }
}
