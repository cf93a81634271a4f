// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 对象树分发
//!
//! 应用的处理逻辑组织成一棵由 [`Node`] 构成的树，URL 路径的每一段对应树上的一个子节点。
//! [`resolve`] 把路径映射到一个公开的处理器，同时给出实际走过的对象路径和剩余的虚拟路径段。
//!
//! ## 查找顺序（从最具体到最宽泛）
//! 1. 最深节点下名为 `index` 的子节点，结果标记为 `via_index`。
//! 2. 最深节点本身（需要是公开的处理器）。
//! 3. 从倒数第二层开始逐层向上，每层的 `default` 子节点；被剥掉的段成为虚拟路径。
//!    空路径只在 1、2 都失败后才尝试根节点的 `default`。
//!
//! 查找之前，每一段都会先做百分号解码，再把 `.` 替换为 `_`（虚拟路径保留原样）。
//! 没有显式公开的处理器对分发是不可见的。

use std::{collections::BTreeMap, fmt, sync::Arc};

use log::debug;
use percent_encoding::percent_decode_str;

use crate::{exception::Exception, form::ParamMap, pipeline::Context, response::Body};

/// 对象树节点
pub trait Node: Send + Sync {
    /// 名为 `name` 的子节点
    fn child(&self, name: &str) -> Option<Arc<dyn Node>>;
    /// 节点自身携带的处理器
    fn handler(&self) -> Option<Handler>;
}

type HandlerFn = dyn Fn(&mut Context, Arguments) -> Result<Body, Exception> + Send + Sync;

/// 可调用的处理器，附带是否对外公开的标记
#[derive(Clone)]
pub struct Handler {
    func: Arc<HandlerFn>,
    exposed: bool,
}

impl Handler {
    pub fn new<F, R>(exposed: bool, func: F) -> Self
    where
        F: Fn(&mut Context, Arguments) -> Result<R, Exception> + Send + Sync + 'static,
        R: Into<Body>,
    {
        Self {
            func: Arc::new(move |ctx: &mut Context, args: Arguments| func(ctx, args).map(Into::into)),
            exposed,
        }
    }

    /// 可以被 URL 访问到的处理器
    pub fn exposed<F, R>(func: F) -> Self
    where
        F: Fn(&mut Context, Arguments) -> Result<R, Exception> + Send + Sync + 'static,
        R: Into<Body>,
    {
        Self::new(true, func)
    }

    /// 只能在代码中调用、对分发不可见的处理器
    pub fn internal<F, R>(func: F) -> Self
    where
        F: Fn(&mut Context, Arguments) -> Result<R, Exception> + Send + Sync + 'static,
        R: Into<Body>,
    {
        Self::new(false, func)
    }

    pub fn is_exposed(&self) -> bool {
        self.exposed
    }

    pub fn call(&self, ctx: &mut Context, args: Arguments) -> Result<Body, Exception> {
        (self.func)(ctx, args)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("exposed", &self.exposed)
            .finish_non_exhaustive()
    }
}

/// 传给处理器的参数：位置参数来自虚拟路径与协议层参数，关键字参数来自查询字符串与表单
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    pub positional: Vec<String>,
    pub keywords: ParamMap,
}

impl Arguments {
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.positional.get(index).map(|s| s.as_str())
    }

    pub fn kw(&self, name: &str) -> Option<&str> {
        self.keywords.text(name)
    }
}

type SubnodeFn = dyn Fn(&str) -> Option<Arc<dyn Node>> + Send + Sync;

/// 静态构建的对象树节点；`subnodes` 用于按名称动态生成子节点
#[derive(Clone, Default)]
pub struct TreeNode {
    handler: Option<Handler>,
    children: BTreeMap<String, Arc<dyn Node>>,
    subnodes: Option<Arc<SubnodeFn>>,
}

impl TreeNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// 只带一个公开处理器的叶子节点
    pub fn page<F, R>(func: F) -> Self
    where
        F: Fn(&mut Context, Arguments) -> Result<R, Exception> + Send + Sync + 'static,
        R: Into<Body>,
    {
        Self::new().with_handler(Handler::exposed(func))
    }

    pub fn with_handler(mut self, handler: Handler) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_child(mut self, name: &str, node: impl Node + 'static) -> Self {
        self.children.insert(name.to_string(), Arc::new(node));
        self
    }

    pub fn with_child_arc(mut self, name: &str, node: Arc<dyn Node>) -> Self {
        self.children.insert(name.to_string(), node);
        self
    }

    /// 挂一个公开的 `index` 处理器
    pub fn with_index<F, R>(self, func: F) -> Self
    where
        F: Fn(&mut Context, Arguments) -> Result<R, Exception> + Send + Sync + 'static,
        R: Into<Body>,
    {
        self.with_child("index", TreeNode::page(func))
    }

    /// 挂一个公开的 `default` 处理器
    pub fn with_default<F, R>(self, func: F) -> Self
    where
        F: Fn(&mut Context, Arguments) -> Result<R, Exception> + Send + Sync + 'static,
        R: Into<Body>,
    {
        self.with_child("default", TreeNode::page(func))
    }

    /// 静态子节点中找不到时调用的动态查找
    pub fn with_subnodes<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<Arc<dyn Node>> + Send + Sync + 'static,
    {
        self.subnodes = Some(Arc::new(lookup));
        self
    }
}

impl Node for TreeNode {
    fn child(&self, name: &str) -> Option<Arc<dyn Node>> {
        match self.children.get(name) {
            Some(node) => Some(node.clone()),
            None => self.subnodes.as_ref().and_then(|lookup| lookup(name)),
        }
    }

    fn handler(&self) -> Option<Handler> {
        self.handler.clone()
    }
}

impl fmt::Debug for TreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeNode")
            .field("handler", &self.handler)
            .field("children", &self.children.keys().collect::<Vec<_>>())
            .field("subnodes", &self.subnodes.is_some())
            .finish()
    }
}

/// 分发结果
#[derive(Debug, Clone)]
pub struct Resolved {
    pub handler: Handler,
    /// 实际消费的对象路径，例如 `/blog/index` 或 `/blog/default`
    pub object_path: String,
    /// 被 `default` 处理器吸收的剩余路径段
    pub virtual_path: Vec<String>,
    /// 是否通过 `index` 命中
    pub via_index: bool,
}

fn exposed_handler(node: &Arc<dyn Node>) -> Option<Handler> {
    node.handler().filter(|h| h.is_exposed())
}

fn object_path(names: &[String], last: Option<&str>) -> String {
    let mut path = String::new();
    for name in names.iter().map(|s| s.as_str()).chain(last) {
        path.push('/');
        path.push_str(name);
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

/// 把路径拆分为解码后的段
pub fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| percent_decode_str(s).decode_utf8_lossy().into_owned())
        .collect()
}

/// 在以 `root` 为根的对象树上解析 `path`。结果只取决于对象树与路径本身。
pub fn resolve(root: &Arc<dyn Node>, path: &str) -> Result<Resolved, Exception> {
    let segments = split_path(path);
    let names: Vec<String> = segments.iter().map(|s| s.replace('.', "_")).collect();
    let n = names.len();

    // trail[k] 是消费了前 k 段之后到达的节点
    let mut trail: Vec<Arc<dyn Node>> = vec![root.clone()];
    for name in &names {
        let next = match trail.last().and_then(|node| node.child(name)) {
            Some(next) => next,
            None => break,
        };
        trail.push(next);
    }

    if trail.len() == n + 1 {
        let node = &trail[n];
        if let Some(handler) = node.child("index").as_ref().and_then(exposed_handler) {
            debug!("路径 {} 命中 index", path);
            return Ok(Resolved {
                handler,
                object_path: object_path(&names, Some("index")),
                virtual_path: Vec::new(),
                via_index: true,
            });
        }
        if let Some(handler) = exposed_handler(node) {
            debug!("路径 {} 命中节点本身", path);
            return Ok(Resolved {
                handler,
                object_path: object_path(&names, None),
                virtual_path: Vec::new(),
                via_index: false,
            });
        }
    }

    // 至少剥掉一段；空路径直接落到根节点
    let deepest = if n == 0 { 0 } else { n - 1 };
    for k in (0..=deepest).rev() {
        if k >= trail.len() {
            continue;
        }
        if let Some(handler) = trail[k].child("default").as_ref().and_then(exposed_handler) {
            debug!("路径 {} 命中第{}层的 default", path, k);
            return Ok(Resolved {
                handler,
                object_path: object_path(&names[..k], Some("default")),
                virtual_path: segments[k..].to_vec(),
                via_index: false,
            });
        }
    }

    Err(Exception::NotFound(path.to_string()))
}

/// 通过 `index` 命中但请求路径缺少结尾斜杠时，返回规范地址
pub fn canonical_redirect(
    resolved: &Resolved,
    script_name: &str,
    path: &str,
    query_string: &str,
) -> Option<String> {
    if !resolved.via_index || path.ends_with('/') {
        return None;
    }
    let mut url = format!("{}{}/", script_name, path);
    if !query_string.is_empty() {
        url.push('?');
        url.push_str(query_string);
    }
    Some(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok() -> Result<&'static str, Exception> {
        Ok("ok")
    }

    fn sample_tree() -> Arc<dyn Node> {
        let blog = TreeNode::new()
            .with_index(|_, _| ok())
            .with_default(|_, _| ok())
            .with_child("archive", TreeNode::page(|_, _| ok()));
        let root = TreeNode::new()
            .with_index(|_, _| ok())
            .with_child("blog", blog)
            .with_child("feed_xml", TreeNode::page(|_, _| ok()))
            .with_child(
                "secret",
                TreeNode::new().with_handler(Handler::internal(|_, _| ok())),
            )
            .with_default(|_, _| ok());
        Arc::new(root)
    }

    #[test]
    fn test_root_index() {
        let resolved = resolve(&sample_tree(), "/").unwrap();
        assert_eq!(resolved.object_path, "/index");
        assert!(resolved.via_index);
        assert!(resolved.virtual_path.is_empty());
    }

    #[test]
    fn test_index_beats_node_and_default() {
        let resolved = resolve(&sample_tree(), "/blog").unwrap();
        assert_eq!(resolved.object_path, "/blog/index");
        assert!(resolved.via_index);
    }

    #[test]
    fn test_node_itself() {
        let resolved = resolve(&sample_tree(), "/blog/archive").unwrap();
        assert_eq!(resolved.object_path, "/blog/archive");
        assert!(!resolved.via_index);
    }

    #[test]
    fn test_dots_become_underscores() {
        let resolved = resolve(&sample_tree(), "/feed.xml").unwrap();
        assert_eq!(resolved.object_path, "/feed_xml");
    }

    #[test]
    fn test_deepest_default_wins() {
        let resolved = resolve(&sample_tree(), "/blog/2024/hello.html").unwrap();
        assert_eq!(resolved.object_path, "/blog/default");
        assert_eq!(resolved.virtual_path, vec!["2024", "hello.html"]);
    }

    #[test]
    fn test_root_default_receives_virtual_path() {
        let resolved = resolve(&sample_tree(), "/foo/bar").unwrap();
        assert_eq!(resolved.object_path, "/default");
        assert_eq!(resolved.virtual_path, vec!["foo", "bar"]);
    }

    #[test]
    fn test_unexposed_handler_is_invisible() {
        let resolved = resolve(&sample_tree(), "/secret").unwrap();
        assert_eq!(resolved.object_path, "/default");
        assert_eq!(resolved.virtual_path, vec!["secret"]);
    }

    #[test]
    fn test_not_found_without_default() {
        let root: Arc<dyn Node> = Arc::new(TreeNode::new().with_index(|_, _| ok()));
        match resolve(&root, "/missing/page") {
            Err(Exception::NotFound(path)) => assert_eq!(path, "/missing/page"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_empty_path_uses_root_default_last() {
        let root: Arc<dyn Node> = Arc::new(TreeNode::new().with_default(|_, _| ok()));
        let resolved = resolve(&root, "").unwrap();
        assert_eq!(resolved.object_path, "/default");
        assert!(resolved.virtual_path.is_empty());

        let root: Arc<dyn Node> = Arc::new(
            TreeNode::page(|_, _| ok()).with_default(|_, _| ok()),
        );
        assert_eq!(resolve(&root, "/").unwrap().object_path, "/");
    }

    #[test]
    fn test_percent_decoding() {
        let resolved = resolve(&sample_tree(), "/blog/caf%C3%A9%20menu").unwrap();
        assert_eq!(resolved.virtual_path, vec!["café menu"]);
    }

    #[test]
    fn test_dynamic_subnodes() {
        let users = TreeNode::new().with_subnodes(|name| {
            if name.chars().all(|c| c.is_ascii_digit()) {
                Some(Arc::new(TreeNode::page(|_, _| ok())) as Arc<dyn Node>)
            } else {
                None
            }
        });
        let root: Arc<dyn Node> = Arc::new(TreeNode::new().with_child("users", users));
        assert_eq!(resolve(&root, "/users/42").unwrap().object_path, "/users/42");
        assert!(resolve(&root, "/users/bob").is_err());
    }

    #[test]
    fn test_canonical_redirect() {
        let tree = sample_tree();
        let resolved = resolve(&tree, "/blog").unwrap();
        assert_eq!(
            canonical_redirect(&resolved, "/app", "/blog", "x=1"),
            Some("/app/blog/?x=1".to_string())
        );
        let resolved = resolve(&tree, "/blog/").unwrap();
        assert_eq!(canonical_redirect(&resolved, "", "/blog/", ""), None);
        let resolved = resolve(&tree, "/blog/archive").unwrap();
        assert_eq!(canonical_redirect(&resolved, "", "/blog/archive", ""), None);
    }
}
