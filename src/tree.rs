// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 挂载表
//!
//! 每个 [`Application`] 挂载在一个路径前缀（script name）下；请求路径按段边界做最长前缀匹配，
//! 命中的前缀之后的部分（path info）交给该应用的对象树分发。

use std::{collections::BTreeMap, fmt, path::PathBuf, sync::Arc};

use log::info;

use crate::{
    config::AppConfig,
    dispatch::{Handler, Node},
    exception::Exception,
    hooks::HookMap,
    pipeline::Context,
    staticfile,
};

/// 应用自定义的错误页生成器
pub type ErrorHandler = Arc<dyn Fn(&mut Context, &Exception) -> Result<(), Exception> + Send + Sync>;

pub struct Application {
    root: Arc<dyn Node>,
    script_name: String,
    config: AppConfig,
    hooks: HookMap<Context>,
    on_error: Option<ErrorHandler>,
    /// 对象树中找不到时按路径兜底的处理器
    fallbacks: BTreeMap<String, Handler>,
}

impl Application {
    pub fn new(root: impl Node + 'static) -> Self {
        Self::from_arc(Arc::new(root))
    }

    pub fn from_arc(root: Arc<dyn Node>) -> Self {
        Self {
            root,
            script_name: String::new(),
            config: AppConfig::default(),
            hooks: HookMap::new(),
            on_error: None,
            fallbacks: BTreeMap::new(),
        }
    }

    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut Context, &Exception) -> Result<(), Exception> + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    pub fn with_fallback(mut self, path: &str, handler: Handler) -> Self {
        self.fallbacks.insert(path.to_string(), handler);
        self
    }

    /// 对象树没有处理 `/favicon.ico` 时，返回磁盘上的图标文件
    pub fn with_favicon(self, file: impl Into<PathBuf>) -> Self {
        let file = file.into();
        let handler = Handler::exposed(move |ctx: &mut Context, _| {
            staticfile::serve_file(ctx, &file, None)?;
            Ok(ctx.response.take_body())
        });
        self.with_fallback("/favicon.ico", handler)
    }

    /// 应用级钩子；每个请求开始时会复制一份
    pub fn hooks_mut(&mut self) -> &mut HookMap<Context> {
        &mut self.hooks
    }
}

impl Application {
    pub fn root(&self) -> &Arc<dyn Node> {
        &self.root
    }

    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn hooks(&self) -> &HookMap<Context> {
        &self.hooks
    }

    pub fn on_error(&self) -> Option<&ErrorHandler> {
        self.on_error.as_ref()
    }

    pub fn fallback(&self, path: &str) -> Option<&Handler> {
        self.fallbacks.get(path)
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("script_name", &self.script_name)
            .field("config", &self.config)
            .field("hooks", &self.hooks)
            .field("fallbacks", &self.fallbacks.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// 前缀 → 应用
#[derive(Debug, Default)]
pub struct Tree {
    apps: BTreeMap<String, Arc<Application>>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// 把应用挂载到 `script_name`。结尾的 `/` 会被去掉，`/` 等价于空前缀。
    pub fn mount(
        &mut self,
        mut app: Application,
        script_name: &str,
    ) -> Result<Arc<Application>, Exception> {
        let script_name = script_name.trim_end_matches('/').to_string();
        if !script_name.is_empty() && !script_name.starts_with('/') {
            return Err(Exception::ConfigError(format!(
                "script name '{}' must start with '/'",
                script_name
            )));
        }
        if self.apps.contains_key(&script_name) {
            return Err(Exception::DuplicateMount(script_name));
        }
        info!("应用已挂载到 '{}'", script_name);
        app.script_name = script_name.clone();
        let app = Arc::new(app);
        self.apps.insert(script_name, app.clone());
        Ok(app)
    }

    /// 与 `path` 匹配的最长挂载前缀
    pub fn script_name_for(&self, path: &str) -> Option<&str> {
        let mut candidate = path.trim_end_matches('/');
        loop {
            if let Some((key, _)) = self.apps.get_key_value(candidate) {
                return Some(key.as_str());
            }
            if candidate.is_empty() {
                return None;
            }
            candidate = match candidate.rfind('/') {
                Some(i) => &candidate[..i],
                None => "",
            };
        }
    }

    /// 找到负责 `path` 的应用，并给出应用内的路径
    pub fn dispatch_request(&self, path: &str) -> Option<(Arc<Application>, String)> {
        let script_name = self.script_name_for(path)?;
        let app = self.apps.get(script_name)?.clone();
        let path_info = path[script_name.len()..].to_string();
        Some((app, path_info))
    }

    /// 拼出应用内路径对应的站内绝对路径
    pub fn url(&self, script_name: &str, path: &str) -> String {
        let script_name = script_name.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{}{}", script_name, path)
        } else {
            format!("{}/{}", script_name, path)
        }
    }

    pub fn get(&self, script_name: &str) -> Option<&Arc<Application>> {
        self.apps.get(script_name.trim_end_matches('/'))
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::TreeNode;

    fn app() -> Application {
        Application::new(TreeNode::page(|_, _| Ok("root")))
    }

    fn tree() -> Tree {
        let mut tree = Tree::new();
        tree.mount(app(), "/").unwrap();
        tree.mount(app(), "/blog/").unwrap();
        tree.mount(app(), "/blog/admin").unwrap();
        tree
    }

    #[test]
    fn test_longest_prefix_on_segment_boundary() {
        let tree = tree();
        assert_eq!(tree.script_name_for("/blog/admin/users"), Some("/blog/admin"));
        assert_eq!(tree.script_name_for("/blog/post/1"), Some("/blog"));
        assert_eq!(tree.script_name_for("/blog"), Some("/blog"));
        assert_eq!(tree.script_name_for("/blogger"), Some(""));
        assert_eq!(tree.script_name_for("/"), Some(""));
    }

    #[test]
    fn test_no_root_app() {
        let mut tree = Tree::new();
        tree.mount(app(), "/api").unwrap();
        assert_eq!(tree.script_name_for("/other"), None);
        assert!(tree.dispatch_request("/other").is_none());
    }

    #[test]
    fn test_dispatch_request_path_info() {
        let tree = tree();
        let (app, path_info) = tree.dispatch_request("/blog/post/1").unwrap();
        assert_eq!(app.script_name(), "/blog");
        assert_eq!(path_info, "/post/1");

        let (app, path_info) = tree.dispatch_request("/blog").unwrap();
        assert_eq!(app.script_name(), "/blog");
        assert_eq!(path_info, "");
    }

    #[test]
    fn test_duplicate_mount_is_rejected() {
        let mut tree = tree();
        assert_eq!(
            tree.mount(app(), "/blog").unwrap_err(),
            Exception::DuplicateMount("/blog".to_string())
        );
        assert!(matches!(
            tree.mount(app(), "relative"),
            Err(Exception::ConfigError(_))
        ));
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_url() {
        let tree = tree();
        assert_eq!(tree.url("/blog", "/post/1"), "/blog/post/1");
        assert_eq!(tree.url("", "a"), "/a");
    }
}
