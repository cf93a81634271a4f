// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 配置
//!
//! 配置文件是 TOML，分为三部分：
//!
//! ```toml
//! [server]            # 服务器参数，见 ServerConfig
//! port = 7878
//!
//! [global]            # 对所有应用、所有路径生效的键
//! "tools.gzip.on" = true
//!
//! [apps."/blog"."/static"]   # 挂载在 /blog 的应用中，/static 及其子路径的配置
//! "tools.staticdir.on" = true
//! "tools.staticdir.dir" = "static"
//! ```
//!
//! 键既可以写成带引号的点分形式，也可以写成嵌套表，二者在合并时会被展开为同样的点分键。

use std::{collections::BTreeMap, fs::File, io::prelude::*};

use log::{error, warn};
use serde_derive::{Deserialize, Serialize};
use toml::{Table, Value};

use crate::{exception::Exception, param::HttpVersion};

/// 内部重定向的循环检测如何比较两个目标
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RedirectMatch {
    /// 路径与查询字符串逐字节比较
    #[default]
    Exact,
    /// 查询参数排序后再比较
    Normalized,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_local")]
    local: bool,
    #[serde(default)]
    worker_threads: usize,
    #[serde(default = "default_protocol_version")]
    protocol_version: String,
    #[serde(default = "default_max_request_header_size")]
    max_request_header_size: u64,
    #[serde(default = "default_max_request_body_size")]
    max_request_body_size: u64,
    #[serde(default)]
    show_tracebacks: bool,
    #[serde(default)]
    recursive_redirect: bool,
    #[serde(default)]
    redirect_match: RedirectMatch,
    #[serde(default = "default_chunk_size")]
    chunk_size: usize,
    #[serde(default = "default_cache_size")]
    cache_size: usize,
    #[serde(default)]
    favicon: Option<String>,
}

fn default_port() -> u16 {
    7878
}

fn default_local() -> bool {
    true
}

fn default_protocol_version() -> String {
    "HTTP/1.1".to_string()
}

fn default_max_request_header_size() -> u64 {
    500 * 1024 // 500KB
}

fn default_max_request_body_size() -> u64 {
    100 * 1024 * 1024 // 100MB
}

fn default_chunk_size() -> usize {
    262144 // 256KB
}

fn default_cache_size() -> usize {
    64
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            local: default_local(),
            worker_threads: 0,
            protocol_version: default_protocol_version(),
            max_request_header_size: default_max_request_header_size(),
            max_request_body_size: default_max_request_body_size(),
            show_tracebacks: false,
            recursive_redirect: false,
            redirect_match: RedirectMatch::Exact,
            chunk_size: default_chunk_size(),
            cache_size: default_cache_size(),
            favicon: None,
        }
    }
}

impl ServerConfig {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local(&self) -> bool {
        self.local
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// 服务端支持的最高协议版本；配置非法时按 HTTP/1.1 处理
    pub fn protocol_version(&self) -> HttpVersion {
        HttpVersion::from_http(&self.protocol_version).unwrap_or(HttpVersion::V1_1)
    }

    pub fn max_request_header_size(&self) -> u64 {
        self.max_request_header_size
    }

    pub fn max_request_body_size(&self) -> u64 {
        self.max_request_body_size
    }

    pub fn show_tracebacks(&self) -> bool {
        self.show_tracebacks
    }

    pub fn recursive_redirect(&self) -> bool {
        self.recursive_redirect
    }

    pub fn redirect_match(&self) -> RedirectMatch {
        self.redirect_match
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    pub fn favicon(&self) -> Option<&str> {
        self.favicon.as_deref()
    }

    pub fn set_show_tracebacks(&mut self, value: bool) {
        self.show_tracebacks = value;
    }

    pub fn set_recursive_redirect(&mut self, value: bool) {
        self.recursive_redirect = value;
    }

    pub fn set_redirect_match(&mut self, value: RedirectMatch) {
        self.redirect_match = value;
    }

    pub fn set_max_request_body_size(&mut self, value: u64) {
        self.max_request_body_size = value;
    }

    pub fn set_protocol_version(&mut self, value: HttpVersion) {
        self.protocol_version = value.to_string();
    }
}

/// 单个应用的配置：路径段 → 该路径下生效的键
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct AppConfig {
    sections: BTreeMap<String, Table>,
}

/// 合并后的扁平配置：点分键 → 值
pub type Merged = BTreeMap<String, Value>;

impl AppConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在某个路径段下设置一个键
    pub fn set(&mut self, section: &str, key: &str, value: impl Into<Value>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    pub fn with(mut self, section: &str, key: &str, value: impl Into<Value>) -> Self {
        self.set(section, key, value);
        self
    }

    pub fn sections(&self) -> impl Iterator<Item = (&String, &Table)> {
        self.sections.iter()
    }

    /// 计算 `path` 的有效配置：先展开 `global`，再按从短到长的顺序叠加所有匹配的路径段。
    ///
    /// 每个 `tools.<name>.*` 键还会带上 `tools.<name>.section`，记录最后一次设置该工具的段；
    /// 来自 `global` 的工具记为 `global`。
    pub fn merged(&self, global: &Table, path: &str) -> Merged {
        let mut merged = Merged::new();
        apply_section(&mut merged, global, "global");

        let mut matching: Vec<(&String, &Table)> = self
            .sections
            .iter()
            .filter(|(section, _)| section_matches(section, path))
            .collect();
        matching.sort_by_key(|(section, _)| section.trim_end_matches('/').len());
        for (section, table) in matching {
            apply_section(&mut merged, table, section);
        }
        merged
    }
}

/// 路径段匹配按段边界进行：`/static` 匹配 `/static` 与 `/static/a.css`，不匹配 `/statics`
fn section_matches(section: &str, path: &str) -> bool {
    let section = section.trim_end_matches('/');
    if section.is_empty() {
        return true;
    }
    path == section
        || path
            .strip_prefix(section)
            .map_or(false, |rest| rest.starts_with('/'))
}

fn apply_section(merged: &mut Merged, table: &Table, section: &str) {
    let mut flat = Merged::new();
    flatten("", table, &mut flat);
    for (key, value) in flat {
        if let Some(tool) = key
            .strip_prefix("tools.")
            .and_then(|rest| rest.split('.').next())
        {
            merged.insert(
                format!("tools.{}.section", tool),
                Value::String(section.to_string()),
            );
        }
        merged.insert(key, value);
    }
}

fn flatten(prefix: &str, table: &Table, out: &mut Merged) {
    for (key, value) in table {
        let full = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            Value::Table(inner) => flatten(&full, inner, out),
            other => {
                out.insert(full, other.clone());
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    global: Table,
    #[serde(default)]
    apps: BTreeMap<String, AppConfig>,
}

impl Config {
    pub fn new() -> Self {
        let mut config = Self::default();
        config.normalize();
        config
    }

    /// 从 TOML 文本构建配置
    pub fn from_toml_str(text: &str) -> Result<Self, Exception> {
        let mut config: Config = toml::from_str(text).map_err(|e| {
            error!("无法成功从配置文件构建配置对象：{}", e);
            Exception::ConfigError(e.to_string())
        })?;
        config.normalize();
        Ok(config)
    }

    pub fn from_toml(filename: &str) -> Result<Self, Exception> {
        let mut file = File::open(filename)
            .map_err(|e| Exception::ConfigError(format!("no such file {}: {}", filename, e)))?;
        let mut str_val = String::new();
        file.read_to_string(&mut str_val)
            .map_err(|e| Exception::ConfigError(format!("error reading {}: {}", filename, e)))?;
        Self::from_toml_str(&str_val)
    }

    fn normalize(&mut self) {
        if self.server.worker_threads == 0 {
            self.server.worker_threads = num_cpus::get();
        }
        if self.server.cache_size == 0 {
            warn!("cache_size被设置为0，但缓存工具至少需要一个槽位，因此该值将被改为1。");
            self.server.cache_size = 1;
        }
        if self.server.chunk_size == 0 {
            warn!("chunk_size被设置为0，改为默认值");
            self.server.chunk_size = default_chunk_size();
        }
    }
}

impl Config {
    pub fn server(&self) -> &ServerConfig {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut ServerConfig {
        &mut self.server
    }

    pub fn global(&self) -> &Table {
        &self.global
    }

    pub fn global_mut(&mut self) -> &mut Table {
        &mut self.global
    }

    /// 挂载前缀对应的应用配置
    pub fn app(&self, script_name: &str) -> AppConfig {
        self.apps.get(script_name).cloned().unwrap_or_default()
    }

    pub fn apps(&self) -> impl Iterator<Item = (&String, &AppConfig)> {
        self.apps.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [server]
        port = 8080
        worker_threads = 2
        show_tracebacks = true
        redirect_match = "normalized"

        [global]
        "tools.gzip.on" = true

        [global.tools.response_headers]
        on = true

        [apps."/blog"."/"]
        "tools.gzip.on" = false

        [apps."/blog"."/static"]
        "tools.staticdir.on" = true
        "tools.staticdir.dir" = "static"
    "#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.server().port(), 8080);
        assert_eq!(config.server().worker_threads(), 2);
        assert!(config.server().show_tracebacks());
        assert_eq!(config.server().redirect_match(), RedirectMatch::Normalized);
        assert_eq!(config.server().max_request_body_size(), 100 * 1024 * 1024);
        assert_eq!(config.server().protocol_version(), HttpVersion::V1_1);
    }

    #[test]
    fn test_defaults_when_empty() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.server().port(), 7878);
        assert!(config.server().worker_threads() > 0);
        assert_eq!(config.server().max_request_header_size(), 500 * 1024);
        assert!(!config.server().recursive_redirect());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        assert!(matches!(
            Config::from_toml_str("[server\nport = "),
            Err(Exception::ConfigError(_))
        ));
    }

    #[test]
    fn test_merged_layers_shortest_to_longest() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let app = config.app("/blog");

        let merged = app.merged(config.global(), "/static/site.css");
        assert_eq!(merged.get("tools.gzip.on"), Some(&Value::Boolean(false)));
        assert_eq!(merged.get("tools.response_headers.on"), Some(&Value::Boolean(true)));
        assert_eq!(merged.get("tools.staticdir.dir"), Some(&Value::String("static".into())));
        assert_eq!(
            merged.get("tools.staticdir.section"),
            Some(&Value::String("/static".into()))
        );
        assert_eq!(
            merged.get("tools.response_headers.section"),
            Some(&Value::String("global".into()))
        );

        let merged = app.merged(config.global(), "/statics");
        assert!(merged.get("tools.staticdir.on").is_none());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            Config::from_toml("/definitely/not/here.toml"),
            Err(Exception::ConfigError(_))
        ));
    }
}
