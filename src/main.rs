// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 演示宿主
//!
//! 基于 Tokio 运行时的最小 HTTP/1.x 宿主：异步读取请求头与请求体，把同步的
//! [`RequestPipeline`] 放进 `spawn_blocking` 运行，再把结果写回连接。
//!
//! - 每个连接只处理一个请求（`Connection: close`）
//! - HTTP/1.1 响应没有 `Content-Length` 时使用分块传输
//! - 挂载一个演示应用：首页、回显、表单问候与 JSON 状态页

use std::{
    io::Cursor,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::{Arc, Mutex},
    time::Instant,
};

use bytes::Bytes;
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    runtime::Builder,
    sync::mpsc,
};

use webtree::{
    param::{reason_phrase, HttpRequestMethod, CRLF},
    Application, Arguments, Config, Context, Exception, HtmlBuilder, HttpVersion, RawRequest,
    Served, Server, ServingGuard, Tree, TreeNode,
};

/// 程序入口点：初始化日志、加载配置、构建运行时并启动监听循环
fn main() {
    if let Err(e) = log4rs::init_file("config/log4rs.yaml", Default::default()) {
        eprintln!("无法初始化日志系统：{}", e);
        return;
    }

    let config = match Config::from_toml("config/development.toml") {
        Ok(config) => {
            info!("配置文件已载入");
            config
        }
        Err(e) => {
            warn!("无法载入配置文件（{}），使用默认配置", e);
            Config::new()
        }
    };

    let runtime = match Builder::new_multi_thread()
        .worker_threads(config.server().worker_threads())
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("无法构建Tokio运行时：{}", e);
            return;
        }
    };

    if let Err(e) = runtime.block_on(serve(config)) {
        error!("服务端异常退出：{}", e);
    }
}

/// 演示应用的对象树
fn demo_application(config: &Config) -> Application {
    let root = TreeNode::new()
        .with_index(|_, _| Ok("Hello from webtree!"))
        .with_child(
            "echo",
            TreeNode::new().with_default(|_, args: Arguments| Ok(args.positional.join("/"))),
        )
        .with_child(
            "greet",
            TreeNode::page(|_, args: Arguments| {
                Ok(format!("Hello, {}!", args.kw("name").unwrap_or("world")))
            }),
        )
        .with_child("status", TreeNode::page(status_page));

    let mut app = Application::new(root).with_config(config.app("/"));
    if let Some(favicon) = config.server().favicon() {
        app = app.with_favicon(favicon);
    }
    app
}

fn status_page(ctx: &mut Context, _: Arguments) -> Result<String, Exception> {
    let status = json!({
        "id": ctx.id().to_string(),
        "path": ctx.request.path(),
        "script_name": ctx.request.script_name(),
        "version": ctx.request.version().to_string(),
        "remote_addr": ctx.request.remote_addr(),
    });
    ctx.response
        .headers_mut()
        .insert("Content-Type", "application/json");
    Ok(status.to_string())
}

/// 活跃请求计数；内部重定向期间不占用槽位
struct ActiveSlot {
    active: Arc<Mutex<u32>>,
    id: u128,
}

impl ActiveSlot {
    fn new(active: Arc<Mutex<u32>>, id: u128) -> Self {
        let mut slot = Self { active, id };
        slot.acquire();
        slot
    }

    fn update(&self, delta: i64) {
        let mut lock = match self.active.lock() {
            Ok(lock) => lock,
            Err(poisoned) => {
                warn!("[ID{}]连接计数锁被污染，恢复并继续", self.id);
                poisoned.into_inner()
            }
        };
        *lock = (*lock as i64 + delta).max(0) as u32;
    }
}

impl ServingGuard for ActiveSlot {
    fn release(&mut self) {
        self.update(-1);
    }

    fn acquire(&mut self) {
        self.update(1);
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.release();
    }
}

async fn serve(config: Config) -> Result<(), Exception> {
    let port = config.server().port();
    let address = match config.server().local() {
        true => Ipv4Addr::new(127, 0, 0, 1),
        false => Ipv4Addr::new(0, 0, 0, 0),
    };
    info!("服务端将在{}:{}上监听Socket连接", address, port);

    let mut tree = Tree::new();
    tree.mount(demo_application(&config), "/")?;
    let server = Arc::new(Server::new(config, tree));

    let listener = TcpListener::bind(SocketAddrV4::new(address, port))
        .await
        .map_err(|e| {
            error!("无法绑定端口：{}，错误：{}", port, e);
            Exception::from(e)
        })?;
    info!("端口{}绑定完成", port);

    let active_connection = Arc::new(Mutex::new(0u32));
    let mut id: u128 = 0;
    loop {
        let (stream, addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!("接受连接失败：{}", e);
                    continue;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("接收到停机信号，正在退出...");
                return Ok(());
            }
        };
        debug!("[ID{}]TCP连接已建立：{}", id, addr);

        let server = Arc::clone(&server);
        let active = Arc::clone(&active_connection);
        tokio::spawn(async move {
            handle_connection(stream, addr, id, server, active).await;
        });
        id += 1;
    }
}

/// 读到空行为止，返回 (请求头, 已经读到的请求体开头)
async fn read_head(
    stream: &mut TcpStream,
    limit: u64,
    id: u128,
) -> Result<(Vec<u8>, Vec<u8>), Exception> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.map_err(|e| {
            error!("[ID{}]读取TCPStream时遇到错误: {}", id, e);
            Exception::Interrupted
        })?;
        if n == 0 {
            return Err(Exception::Interrupted);
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buffer.split_off(pos + 4);
            return Ok((buffer, rest));
        }
        if buffer.len() as u64 > limit {
            return Err(Exception::EntityTooLarge { limit });
        }
    }
}

/// 按 `Content-Length` 读取请求体，最多读到上限多一个字节，交给管线判定 413
async fn read_body(
    stream: &mut TcpStream,
    mut body: Vec<u8>,
    content_length: Option<u64>,
    limit: u64,
    id: u128,
) -> Result<Vec<u8>, Exception> {
    let wanted = match content_length {
        Some(length) => length.min(limit.saturating_add(1)) as usize,
        None => return Ok(body),
    };
    let mut chunk = vec![0u8; 8192];
    while body.len() < wanted {
        let n = stream.read(&mut chunk).await.map_err(|e| {
            error!("[ID{}]读取请求体失败: {}", id, e);
            Exception::Interrupted
        })?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(wanted);
    Ok(body)
}

async fn write_early_error(stream: &mut TcpStream, id: u128, e: &Exception) {
    let code = e.status_code();
    let body = HtmlBuilder::from_status_code(code, Some(&e.to_string())).build();
    let head = format!(
        "HTTP/1.1 {} {}{crlf}Content-Type: text/html;charset=utf-8{crlf}Content-Length: {}{crlf}Connection: close{crlf}{crlf}",
        code,
        reason_phrase(code),
        body.len(),
        crlf = CRLF
    );
    if let Err(e) = stream.write_all(head.as_bytes()).await {
        error!("[ID{}]发送响应头失败: {}", id, e);
        return;
    }
    let _ = stream.write_all(body.as_bytes()).await;
    let _ = stream.flush().await;
}

/// 状态行与头部
fn wire_head(version: HttpVersion, served: &Served, chunked: bool) -> Bytes {
    let mut head = format!("{} {}{}", version, served.status, CRLF);
    for (name, value) in &served.headers {
        head.push_str(&format!("{}: {}{}", name, value, CRLF));
    }
    if chunked {
        head.push_str(&format!("Transfer-Encoding: chunked{}", CRLF));
    }
    head.push_str(&format!("Connection: close{}{}", CRLF, CRLF));
    Bytes::from(head)
}

fn chunk_frame(data: &[u8]) -> Bytes {
    let mut framed = format!("{:X}{}", data.len(), CRLF).into_bytes();
    framed.extend_from_slice(data);
    framed.extend_from_slice(CRLF.as_bytes());
    Bytes::from(framed)
}

/// 单个连接的生命周期：读取请求、运行管线、写回响应
async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    id: u128,
    server: Arc<Server>,
    active: Arc<Mutex<u32>>,
) {
    let start_time = Instant::now();
    let header_limit = server.config().server().max_request_header_size();
    let body_limit = server.config().server().max_request_body_size();

    let (head, rest) = match read_head(&mut stream, header_limit, id).await {
        Ok(pair) => pair,
        Err(Exception::Interrupted) => return,
        Err(e) => {
            warn!("[ID{}]请求头读取失败：{}", id, e);
            write_early_error(&mut stream, id, &e).await;
            return;
        }
    };
    let mut raw = match RawRequest::from_head(&head, header_limit, id) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("[ID{}]解析HTTP请求失败: {}", id, e);
            write_early_error(&mut stream, id, &e).await;
            return;
        }
    };
    raw.remote_addr = addr.ip().to_string();
    raw.remote_host = addr.ip().to_string();
    debug!("[ID{}]HTTP请求头接收完毕", id);

    let body = match read_body(&mut stream, rest, raw.content_length(), body_limit, id).await {
        Ok(body) => body,
        Err(_) => return,
    };

    let (tx, mut rx) = mpsc::channel::<Bytes>(8);
    let task = tokio::task::spawn_blocking(move || {
        let slot = ActiveSlot::new(active, id);
        let mut pipeline = server.pipeline(raw, id).with_guard(Box::new(slot));
        let served = match pipeline.run(&mut Cursor::new(body)) {
            Ok(served) => served,
            Err(_) => {
                let _ = pipeline.close();
                return;
            }
        };

        let request = &pipeline.context().request;
        let version = request.version();
        let code = served.status_code();
        let chunked = version >= HttpVersion::V1_1
            && served.header("Content-Length").is_none()
            && request.method() != HttpRequestMethod::Head
            && code >= 200
            && code != 204
            && code != 304;

        let mut sent = tx.blocking_send(wire_head(version, &served, chunked)).is_ok();
        for chunk in served.body.into_chunks() {
            if !sent {
                break;
            }
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    error!("[ID{}]读取响应体失败: {}", id, e);
                    sent = false;
                    break;
                }
            };
            if chunk.is_empty() {
                continue;
            }
            let data = if chunked { chunk_frame(&chunk) } else { chunk };
            sent = tx.blocking_send(data).is_ok();
        }
        if sent && chunked {
            let _ = tx.blocking_send(Bytes::from(format!("0{}{}", CRLF, CRLF)));
        }
        drop(tx);
        if let Err(e) = pipeline.close() {
            warn!("[ID{}]on_end_request 中断：{}", id, e);
        }
    });

    while let Some(data) = rx.recv().await {
        if let Err(e) = stream.write_all(&data).await {
            error!("[ID{}]写入响应失败: {}", id, e);
            break;
        }
    }
    drop(rx);
    let _ = stream.flush().await;
    if let Err(e) = task.await {
        error!("[ID{}]请求处理任务异常结束: {}", id, e);
    }
    debug!(
        "[ID{}]请求处理完成，服务端用时{}ms。",
        id,
        start_time.elapsed().as_millis()
    );
}
