// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 钩子注册表
//!
//! 每个请求持有一份 [`HookMap`]，按挂载顺序在固定的挂载点上运行回调。
//!
//! ## 失败隔离
//! 被标记为 failsafe 的挂载点上，每个回调独立运行：错误和 panic 只记录日志，
//! 不影响后续回调，也不会向上传播。唯一的例外是 `Exception::Interrupted`，
//! 它表示连接已经中断，必须继续向上传递。
//!
//! 其他挂载点上第一个失败的回调终止该挂载点并返回错误；回调 panic 时返回
//! `Exception::HandlerError`，不会穿过 [`HookMap::run`]。
//!
//! 回调只拿到请求上下文，拿不到注册表本身，所以运行期间不可能再挂载新的回调。

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    str::FromStr,
    sync::Arc,
};

use log::{debug, error};

use crate::{exception::Exception, util::panic_message};

/// 钩子挂载点，按请求生命周期中的执行顺序排列
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HookPoint {
    OnStartResource,
    BeforeRequestBody,
    BeforeMain,
    BeforeFinalize,
    OnEndResource,
    OnEndRequest,
    BeforeErrorResponse,
    AfterErrorResponse,
}

impl HookPoint {
    pub const ALL: [HookPoint; 8] = [
        HookPoint::OnStartResource,
        HookPoint::BeforeRequestBody,
        HookPoint::BeforeMain,
        HookPoint::BeforeFinalize,
        HookPoint::OnEndResource,
        HookPoint::OnEndRequest,
        HookPoint::BeforeErrorResponse,
        HookPoint::AfterErrorResponse,
    ];

    /// 默认失败隔离的挂载点
    pub const FAILSAFE: [HookPoint; 3] = [
        HookPoint::OnStartResource,
        HookPoint::OnEndResource,
        HookPoint::OnEndRequest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::OnStartResource => "on_start_resource",
            HookPoint::BeforeRequestBody => "before_request_body",
            HookPoint::BeforeMain => "before_main",
            HookPoint::BeforeFinalize => "before_finalize",
            HookPoint::OnEndResource => "on_end_resource",
            HookPoint::OnEndRequest => "on_end_request",
            HookPoint::BeforeErrorResponse => "before_error_response",
            HookPoint::AfterErrorResponse => "after_error_response",
        }
    }
}

impl FromStr for HookPoint {
    type Err = Exception;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HookPoint::ALL
            .iter()
            .find(|p| p.as_str() == s)
            .copied()
            .ok_or_else(|| Exception::ConfigError(format!("unknown hook point '{}'", s)))
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub type Callback<C> = Arc<dyn Fn(&mut C) -> Result<(), Exception> + Send + Sync>;

/// 挂载点 → 有序回调列表
pub struct HookMap<C> {
    hooks: BTreeMap<HookPoint, Vec<Callback<C>>>,
    failsafe: BTreeSet<HookPoint>,
}

impl<C> HookMap<C> {
    pub fn new() -> Self {
        Self {
            hooks: BTreeMap::new(),
            failsafe: HookPoint::FAILSAFE.iter().copied().collect(),
        }
    }

    /// 在挂载点末尾追加回调
    pub fn attach<F>(&mut self, point: HookPoint, callback: F)
    where
        F: Fn(&mut C) -> Result<(), Exception> + Send + Sync + 'static,
    {
        self.hooks.entry(point).or_default().push(Arc::new(callback));
    }

    /// 追加一个绑定了配置的回调，每次运行时配置以引用形式传入
    pub fn attach_with<T, F>(&mut self, point: HookPoint, conf: T, callback: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&mut C, &T) -> Result<(), Exception> + Send + Sync + 'static,
    {
        self.attach(point, move |ctx: &mut C| callback(ctx, &conf));
    }

    /// 把回调插到挂载点最前面
    pub fn insert_first<F>(&mut self, point: HookPoint, callback: F)
    where
        F: Fn(&mut C) -> Result<(), Exception> + Send + Sync + 'static,
    {
        self.hooks
            .entry(point)
            .or_default()
            .insert(0, Arc::new(callback));
    }

    pub fn set_failsafe(&mut self, point: HookPoint, failsafe: bool) {
        if failsafe {
            self.failsafe.insert(point);
        } else {
            self.failsafe.remove(&point);
        }
    }

    pub fn is_failsafe(&self, point: HookPoint) -> bool {
        self.failsafe.contains(&point)
    }

    pub fn len(&self, point: HookPoint) -> usize {
        self.hooks.get(&point).map_or(0, |v| v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.values().all(|v| v.is_empty())
    }

    /// 按挂载顺序运行某个挂载点上的全部回调。
    pub fn run(&self, point: HookPoint, ctx: &mut C) -> Result<(), Exception> {
        let callbacks: Vec<Callback<C>> = match self.hooks.get(&point) {
            Some(list) if !list.is_empty() => list.clone(),
            _ => return Ok(()),
        };
        debug!("运行挂载点 {} 上的 {} 个回调", point, callbacks.len());

        if !self.is_failsafe(point) {
            for callback in callbacks {
                match catch_unwind(AssertUnwindSafe(|| callback(ctx))) {
                    Ok(result) => result?,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        error!("挂载点 {} 上的回调 panic：{}", point, message);
                        return Err(Exception::HandlerError(message));
                    }
                }
            }
            return Ok(());
        }

        for callback in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(ctx))) {
                Ok(Ok(())) => {}
                Ok(Err(Exception::Interrupted)) => return Err(Exception::Interrupted),
                Ok(Err(e)) => error!("挂载点 {} 上的回调失败，已忽略：{}", point, e),
                Err(payload) => error!(
                    "挂载点 {} 上的回调 panic，已忽略：{}",
                    point,
                    panic_message(payload.as_ref())
                ),
            }
        }
        Ok(())
    }
}

impl<C> Default for HookMap<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Clone for HookMap<C> {
    fn clone(&self) -> Self {
        Self {
            hooks: self.hooks.clone(),
            failsafe: self.failsafe.clone(),
        }
    }
}

impl<C> fmt::Debug for HookMap<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: BTreeMap<&str, usize> = self
            .hooks
            .iter()
            .map(|(point, list)| (point.as_str(), list.len()))
            .collect();
        f.debug_struct("HookMap")
            .field("hooks", &counts)
            .field("failsafe", &self.failsafe)
            .finish()
    }
}
