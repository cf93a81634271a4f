// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 请求处理管线
//!
//! 一个 [`RequestPipeline`] 负责一次请求的完整生命周期：
//!
//! ```text
//! Start → HeadersParsed → BodyParsed → Dispatched → Finalized → Closed
//!                      ↘ Error（错误处理器接管后仍会 finalize）
//! ```
//!
//! 1. 解析请求行与请求头，定位挂载的应用，把配置中启用的工具挂到本次请求的钩子表上。
//! 2. `on_start_resource` → `before_request_body` → 读取请求体 → `before_main`。
//! 3. 若 `execute_main` 仍为真且钩子没有设置消息体，分发到对象树上的处理器；处理器可以抛出 `InternalRedirect`，
//!    管线在不重新运行 `before_main` 的情况下重新分发，并用已访问集合检测循环。
//! 4. `before_finalize` → finalize。
//! 5. 无论成功与否都运行 `on_end_resource`。
//!
//! 传输层写完响应后调用 [`RequestPipeline::close`]，运行 `on_end_request`。
//!
//! `RequestHandled` 安静地结束处理；`Redirect` 直接设置重定向响应并 finalize，
//! 不运行 `before_finalize`；`Interrupted` 跳过错误处理器直接向上传播。
//! 其他异常交给错误处理器，错误处理器再失败时返回不依赖任何组件的裸 500 响应。

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    io::Read,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use log::{debug, error, info, warn};
use toml::Value;
use url::{form_urlencoded, Url};

use crate::{
    config::{Config, Merged, RedirectMatch, ServerConfig},
    dispatch::{self, Arguments, Resolved},
    exception::Exception,
    hooks::{HookMap, HookPoint},
    param::HttpVersion,
    request::{RawRequest, Request},
    response::{bare_error, Body, Response, Served},
    tools::ToolBox,
    tree::{Application, Tree},
    util::{panic_message, url_join, HtmlBuilder},
};

/// 钩子与处理器共享的请求上下文
pub struct Context {
    pub request: Request,
    pub response: Response,
    id: u128,
    /// 钩子之间传递信息的便签
    notes: BTreeMap<String, String>,
    server: Arc<ServerConfig>,
    config: Merged,
    app: Option<Arc<Application>>,
}

impl Context {
    pub fn new(request: Request, server: Arc<ServerConfig>, id: u128) -> Self {
        Self {
            request,
            response: Response::new(),
            id,
            notes: BTreeMap::new(),
            server,
            config: Merged::new(),
            app: None,
        }
    }

    pub fn id(&self) -> u128 {
        self.id
    }

    pub fn server(&self) -> &ServerConfig {
        &self.server
    }

    /// 当前路径合并后的配置
    pub fn config(&self) -> &Merged {
        &self.config
    }

    pub fn config_value(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    pub fn app(&self) -> Option<&Arc<Application>> {
        self.app.as_ref()
    }

    pub fn note(&self, key: &str) -> Option<&str> {
        self.notes.get(key).map(|s| s.as_str())
    }

    pub fn set_note(&mut self, key: &str, value: impl Into<String>) {
        self.notes.insert(key.to_string(), value.into());
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("request", &self.request)
            .field("response", &self.response)
            .field("notes", &self.notes)
            .finish_non_exhaustive()
    }
}

/// 宿主的并发槽位。内部重定向期间先释放、重新分发前再取回。
pub trait ServingGuard: Send {
    fn release(&mut self);
    fn acquire(&mut self);
}

/// 所有请求共享的只读部分：配置、挂载表、工具箱
#[derive(Debug)]
pub struct Server {
    config: Config,
    server_config: Arc<ServerConfig>,
    tree: Tree,
    toolbox: ToolBox,
}

impl Server {
    pub fn new(config: Config, tree: Tree) -> Self {
        let toolbox = ToolBox::with_builtins(config.server());
        let server_config = Arc::new(config.server().clone());
        Self {
            config,
            server_config,
            tree,
            toolbox,
        }
    }

    pub fn with_toolbox(mut self, toolbox: ToolBox) -> Self {
        self.toolbox = toolbox;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn toolbox(&self) -> &ToolBox {
        &self.toolbox
    }

    pub fn toolbox_mut(&mut self) -> &mut ToolBox {
        &mut self.toolbox
    }

    /// 为一次请求创建管线
    pub fn pipeline(self: &Arc<Self>, raw: RawRequest, id: u128) -> RequestPipeline {
        RequestPipeline::new(self.clone(), raw, id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Start,
    HeadersParsed,
    BodyParsed,
    Dispatched,
    Finalized,
    Closed,
    Error,
}

pub struct RequestPipeline {
    server: Arc<Server>,
    raw: RawRequest,
    ctx: Context,
    hooks: HookMap<Context>,
    state: PipelineState,
    guard: Option<Box<dyn ServingGuard>>,
    /// 错误处理失败时使用的兜底响应
    bare: Option<Served>,
}

impl RequestPipeline {
    pub fn new(server: Arc<Server>, raw: RawRequest, id: u128) -> Self {
        let server_config = server.server_config.clone();
        let request = Request::new(&raw, server_config.protocol_version());
        Self {
            ctx: Context::new(request, server_config, id),
            server,
            raw,
            hooks: HookMap::new(),
            state: PipelineState::Start,
            guard: None,
            bare: None,
        }
    }

    pub fn with_guard(mut self, guard: Box<dyn ServingGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.ctx
    }

    /// 处理请求并交出响应。只有 `Interrupted` 会以错误形式返回。
    pub fn run(&mut self, body: &mut dyn Read) -> Result<Served, Exception> {
        let id = self.ctx.id;
        if self.state != PipelineState::Start {
            error!("[ID{}]同一条管线被重复运行", id);
            return Err(Exception::HandlerError(
                "request pipeline already ran".to_string(),
            ));
        }

        let mut interrupted = match self.respond(body) {
            Ok(()) => false,
            Err(Exception::Interrupted) => true,
            Err(e) => self.handle_error(e).is_err(),
        };

        match self.hooks.run(HookPoint::OnEndResource, &mut self.ctx) {
            Ok(()) => {}
            Err(Exception::Interrupted) => interrupted = true,
            Err(e) => error!("[ID{}]on_end_resource 失败：{}", id, e),
        }

        if interrupted {
            warn!("[ID{}]连接中断，放弃响应", id);
            self.state = PipelineState::Error;
            return Err(Exception::Interrupted);
        }

        let served = match self.bare.take() {
            Some(bare) => bare,
            None => std::mem::take(&mut self.ctx.response).into_served(),
        };
        info!("[ID{}]响应状态：{}", id, served.status);
        Ok(served)
    }

    /// 传输层写完响应后调用
    pub fn close(&mut self) -> Result<(), Exception> {
        if self.state == PipelineState::Closed {
            return Ok(());
        }
        self.state = PipelineState::Closed;
        self.hooks.run(HookPoint::OnEndRequest, &mut self.ctx)
    }

    fn respond(&mut self, body: &mut dyn Read) -> Result<(), Exception> {
        match self.process(body) {
            Ok(()) => {}
            Err(Exception::RequestHandled) => {
                debug!("[ID{}]请求已由钩子处理完毕", self.ctx.id);
            }
            Err(Exception::Redirect { url, status }) => self.apply_redirect(&url, status),
            Err(Exception::InternalRedirect { path, .. }) => {
                return Err(Exception::HandlerError(format!(
                    "internal redirect to '{}' raised outside the main handler",
                    path
                )))
            }
            Err(e) => return Err(e),
        }
        self.finalize()
    }

    fn process(&mut self, body: &mut dyn Read) -> Result<(), Exception> {
        let server = self.server.clone();
        let id = self.ctx.id;

        self.ctx
            .request
            .process_headers(&self.raw, server.server_config.protocol_version(), id)?;
        self.state = PipelineState::HeadersParsed;

        let path = self.ctx.request.path().to_string();
        let (app, path_info) = match server.tree.dispatch_request(&path) {
            Some(found) => found,
            None => {
                warn!("[ID{}]没有应用挂载在路径 {} 上", id, path);
                return Err(Exception::NotFound(path));
            }
        };
        debug!(
            "[ID{}]应用 '{}'，应用内路径 '{}'",
            id,
            app.script_name(),
            path_info
        );
        self.ctx.request.set_script_name(app.script_name());
        self.ctx.request.set_path(path_info.clone());

        self.hooks = app.hooks().clone();
        self.ctx.config = app.config().merged(server.config.global(), &path_info);
        let tools = server.toolbox.setup(&mut self.hooks, &self.ctx.config);
        if !tools.is_empty() {
            debug!("[ID{}]启用的工具：{:?}", id, tools);
        }
        self.ctx.app = Some(app);

        self.hooks.run(HookPoint::OnStartResource, &mut self.ctx)?;
        self.hooks.run(HookPoint::BeforeRequestBody, &mut self.ctx)?;
        if self.ctx.request.process_request_body() {
            let limit = server.server_config.max_request_body_size();
            self.ctx.request.process_body(body, limit)?;
        }
        self.state = PipelineState::BodyParsed;

        self.hooks.run(HookPoint::BeforeMain, &mut self.ctx)?;
        // 钩子已经给出消息体时不再分发
        if self.ctx.request.execute_main() && !self.ctx.response.has_body() {
            self.call_main()?;
        }
        self.state = PipelineState::Dispatched;

        self.hooks.run(HookPoint::BeforeFinalize, &mut self.ctx)
    }

    /// 调用主处理器，跟随内部重定向直到得到消息体
    fn call_main(&mut self) -> Result<(), Exception> {
        let id = self.ctx.id;
        let mode = self.ctx.server().redirect_match();
        let recursive = self.ctx.server().recursive_redirect();

        let mut visited = BTreeSet::new();
        visited.insert(visit_key(
            self.ctx.request.path(),
            self.ctx.request.query_string(),
            mode,
        ));

        loop {
            match self.invoke_handler() {
                Ok(body) => {
                    self.ctx.response.set_body(body);
                    return Ok(());
                }
                Err(Exception::InternalRedirect { path, query_string }) => {
                    let target = url_join(self.ctx.request.path(), &path);
                    let effective_qs = if query_string.is_empty() {
                        self.ctx.request.query_string().to_string()
                    } else {
                        query_string.clone()
                    };
                    if !visited.insert(visit_key(&target, &effective_qs, mode)) && !recursive {
                        error!("[ID{}]内部重定向出现循环：{}", id, target);
                        return Err(Exception::RedirectLoop(target));
                    }
                    info!("[ID{}]内部重定向到 {}", id, target);

                    if let Some(guard) = self.guard.as_mut() {
                        guard.release();
                    }
                    self.ctx.request.redirect_internally(&target, &query_string);
                    if let Some(guard) = self.guard.as_mut() {
                        guard.acquire();
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn invoke_handler(&mut self) -> Result<Body, Exception> {
        let id = self.ctx.id;
        let app = match self.ctx.app.clone() {
            Some(app) => app,
            None => return Err(Exception::NotFound(self.ctx.request.path().to_string())),
        };

        // 钩子可以预先指定对象路径
        let preset = self.ctx.request.object_path().map(|p| p.to_string());
        let path = preset
            .clone()
            .unwrap_or_else(|| self.ctx.request.path().to_string());

        let resolved = match dispatch::resolve(app.root(), &path) {
            Ok(resolved) => resolved,
            Err(Exception::NotFound(missing)) => match app.fallback(&path) {
                Some(handler) => {
                    debug!("[ID{}]路径 {} 使用兜底处理器", id, path);
                    Resolved {
                        handler: handler.clone(),
                        object_path: path.clone(),
                        virtual_path: Vec::new(),
                        via_index: false,
                    }
                }
                None => {
                    warn!("[ID{}]请求的路径：{} 不存在，返回404", id, missing);
                    return Err(Exception::NotFound(missing));
                }
            },
            Err(e) => return Err(e),
        };

        if preset.is_none() {
            let request = &self.ctx.request;
            if let Some(url) = dispatch::canonical_redirect(
                &resolved,
                request.script_name(),
                request.path(),
                request.query_string(),
            ) {
                return Err(Exception::Redirect {
                    url,
                    status: Some(301),
                });
            }
        }
        debug!("[ID{}]分发到 {}", id, resolved.object_path);
        self.ctx
            .request
            .set_object_path(Some(resolved.object_path.clone()));

        let mut positional = resolved.virtual_path;
        positional.extend(self.ctx.request.param_list().iter().cloned());
        let args = Arguments {
            positional,
            keywords: self.ctx.request.params().clone(),
        };

        let handler = resolved.handler;
        let ctx = &mut self.ctx;
        match catch_unwind(AssertUnwindSafe(|| handler.call(ctx, args))) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("[ID{}]处理器 panic：{}", id, message);
                Err(Exception::HandlerError(message))
            }
        }
    }

    fn apply_redirect(&mut self, url: &str, status: Option<u16>) {
        let code = status.unwrap_or(if self.ctx.request.version() >= HttpVersion::V1_1 {
            303
        } else {
            302
        });
        let location = absolute_url(&self.ctx.request, url);
        info!("[ID{}]重定向({})到 {}", self.ctx.id, code, location);
        self.ctx.response.set_redirect(&location, code);
    }

    fn finalize(&mut self) -> Result<(), Exception> {
        let version = self.ctx.request.version();
        let method = self.ctx.request.method();
        self.ctx.response.finalize(version, method)?;
        if self.state != PipelineState::Error {
            self.state = PipelineState::Finalized;
        }
        Ok(())
    }

    /// 只有 `Interrupted` 会以错误形式返回
    fn handle_error(&mut self, err: Exception) -> Result<(), Exception> {
        let id = self.ctx.id;
        self.state = PipelineState::Error;
        match &err {
            Exception::NotFound(_) => warn!("[ID{}]{}", id, err),
            _ => error!("[ID{}]处理请求时发生异常：{}", id, err),
        }

        match self.error_response(&err) {
            Ok(()) => Ok(()),
            Err(Exception::Interrupted) => Err(Exception::Interrupted),
            Err(second) => {
                error!("[ID{}]错误处理器本身失败：{}", id, second);
                let extra = if self.ctx.server().show_tracebacks() {
                    Some(
                        Exception::DoubleFailure {
                            first: err.to_string(),
                            second: second.to_string(),
                        }
                        .to_string(),
                    )
                } else {
                    None
                };
                self.bare = Some(bare_error(extra.as_deref()));
                Ok(())
            }
        }
    }

    fn error_response(&mut self, err: &Exception) -> Result<(), Exception> {
        // 新的响应只保留 Cookie
        let cookies = std::mem::take(self.ctx.response.cookies_mut());
        self.ctx.response = Response::new();
        *self.ctx.response.cookies_mut() = cookies;

        self.hooks
            .run(HookPoint::BeforeErrorResponse, &mut self.ctx)?;

        let on_error = self.ctx.app.as_ref().and_then(|app| app.on_error().cloned());
        match on_error {
            Some(on_error) => {
                let ctx = &mut self.ctx;
                match catch_unwind(AssertUnwindSafe(|| on_error(ctx, err))) {
                    Ok(result) => result?,
                    Err(payload) => {
                        return Err(Exception::HandlerError(panic_message(payload.as_ref())))
                    }
                }
            }
            None => self.default_error_page(err),
        }

        self.finalize()?;
        self.hooks
            .run(HookPoint::AfterErrorResponse, &mut self.ctx)
    }

    fn default_error_page(&mut self, err: &Exception) {
        let code = err.status_code();
        let mut page = HtmlBuilder::from_status_code(code, Some(&err.to_string()));
        if self.ctx.server().show_tracebacks() {
            page = page.with_traceback(&format!("{:?}", err));
        }
        self.ctx.response.set_error_page(code, page.build());
    }
}

impl fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("state", &self.state)
            .field("ctx", &self.ctx)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

/// 内部重定向循环检测使用的键
fn visit_key(path: &str, query_string: &str, mode: RedirectMatch) -> String {
    match mode {
        RedirectMatch::Exact => format!("{}?{}", path, query_string),
        RedirectMatch::Normalized => {
            let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query_string.as_bytes())
                .into_owned()
                .collect();
            pairs.sort();
            let query = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish();
            format!("{}?{}", path, query)
        }
    }
}

/// `Location` 必须是绝对地址；相对地址以当前请求地址为基准解析
fn absolute_url(request: &Request, url: &str) -> String {
    let current = format!(
        "{}{}{}",
        request.base(),
        request.script_name(),
        request.path()
    );
    match Url::parse(&current).and_then(|base| base.join(url)) {
        Ok(absolute) => absolute.to_string(),
        Err(_) => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::TreeNode;
    use std::sync::Mutex;

    fn server_with(root: TreeNode) -> Arc<Server> {
        let mut tree = Tree::new();
        tree.mount(Application::new(root), "/").unwrap();
        Arc::new(Server::new(Config::new(), tree))
    }

    fn serve(server: &Arc<Server>, request_line: &str, headers: &[(&str, &str)]) -> Served {
        let raw = RawRequest::new(request_line, headers);
        let mut pipeline = server.pipeline(raw, 7);
        let served = pipeline.run(&mut std::io::empty()).unwrap();
        pipeline.close().unwrap();
        served
    }

    fn body_of(served: Served) -> String {
        String::from_utf8(served.body.collect().unwrap().to_vec()).unwrap()
    }

    #[test]
    fn test_visit_key_modes() {
        assert_eq!(visit_key("/a", "b=2&a=1", RedirectMatch::Exact), "/a?b=2&a=1");
        assert_eq!(
            visit_key("/a", "b=2&a=1", RedirectMatch::Normalized),
            visit_key("/a", "a=1&b=2", RedirectMatch::Normalized)
        );
    }

    #[test]
    fn test_absolute_url() {
        let raw = RawRequest::new("GET /blog/post HTTP/1.1", &[("Host", "example.com")]);
        let mut request = Request::new(&raw, HttpVersion::V1_1);
        request.process_headers(&raw, HttpVersion::V1_1, 0).unwrap();
        assert_eq!(absolute_url(&request, "/x"), "http://example.com/x");
        assert_eq!(absolute_url(&request, "other"), "http://example.com/blog/other");
        assert_eq!(
            absolute_url(&request, "https://elsewhere.org/"),
            "https://elsewhere.org/"
        );
    }

    #[test]
    fn test_states() {
        let server = server_with(TreeNode::page(|_, _| Ok("hi")));
        let raw = RawRequest::new("GET / HTTP/1.1", &[("Host", "x")]);
        let mut pipeline = server.pipeline(raw, 1);
        assert_eq!(pipeline.state(), PipelineState::Start);
        pipeline.run(&mut std::io::empty()).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Finalized);
        assert!(pipeline.run(&mut std::io::empty()).is_err());
        pipeline.close().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Closed);
    }

    #[test]
    fn test_bad_request_goes_through_error_handler() {
        let server = server_with(TreeNode::page(|_, _| Ok("hi")));
        let served = serve(&server, "GET / HTTP/1.1", &[]);
        assert_eq!(served.status_code(), 400);
        assert!(body_of(served).contains("Host"));
    }

    #[test]
    fn test_handler_panic_becomes_500() {
        let root = TreeNode::new().with_child(
            "boom",
            TreeNode::page(|_, _| -> Result<&'static str, Exception> { panic!("kaboom") }),
        );
        let server = server_with(root);
        let served = serve(&server, "GET /boom HTTP/1.1", &[("Host", "x")]);
        assert_eq!(served.status_code(), 500);
    }

    #[test]
    fn test_redirect_defaults_depend_on_version() {
        let root = TreeNode::new().with_child(
            "go",
            TreeNode::page(|_, _| -> Result<&'static str, Exception> {
                Err(Exception::Redirect {
                    url: "/target".to_string(),
                    status: None,
                })
            }),
        );
        let server = server_with(root);
        let served = serve(&server, "GET /go HTTP/1.1", &[("Host", "x")]);
        assert_eq!(served.status_code(), 303);
        assert_eq!(served.header("Location"), Some("http://x/target"));

        let served = serve(&server, "GET /go HTTP/1.0", &[("Host", "x")]);
        assert_eq!(served.status_code(), 302);
    }

    struct CountingGuard(Arc<Mutex<Vec<&'static str>>>);

    impl ServingGuard for CountingGuard {
        fn release(&mut self) {
            self.0.lock().unwrap().push("release");
        }

        fn acquire(&mut self) {
            self.0.lock().unwrap().push("acquire");
        }
    }

    #[test]
    fn test_internal_redirect_releases_guard() {
        let root = TreeNode::new()
            .with_child(
                "old",
                TreeNode::page(|_, _| -> Result<&'static str, Exception> {
                    Err(Exception::InternalRedirect {
                        path: "new".to_string(),
                        query_string: "v=2".to_string(),
                    })
                }),
            )
            .with_child(
                "new",
                TreeNode::page(|_, args: Arguments| {
                    Ok(format!("new {}", args.kw("v").unwrap_or("-")))
                }),
            );
        let server = server_with(root);
        let events = Arc::new(Mutex::new(Vec::new()));
        let raw = RawRequest::new("GET /old?v=1 HTTP/1.1", &[("Host", "x")]);
        let mut pipeline = server
            .pipeline(raw, 3)
            .with_guard(Box::new(CountingGuard(events.clone())));
        let served = pipeline.run(&mut std::io::empty()).unwrap();
        assert_eq!(served.status_code(), 200);
        assert_eq!(body_of(served), "new 2");
        assert_eq!(*events.lock().unwrap(), vec!["release", "acquire"]);
        assert_eq!(pipeline.context().request.object_path(), Some("/new"));
    }
}
