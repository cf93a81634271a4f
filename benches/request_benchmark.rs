use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use webtree::{
    Application, Arguments, Config, HttpVersion, RawRequest, Request, Server, Tree, TreeNode,
};

fn simple_request_parse_benchmark(c: &mut Criterion) {
    let request = b"GET / HTTP/1.1\r\nHost: localhost:7878\r\nUser-Agent: Test\r\n\r\n";

    c.bench_function("simple_request_parse", |b| {
        b.iter(|| {
            let raw = RawRequest::from_head(black_box(request), 512 * 1024, 0).unwrap();
            let mut req = Request::new(&raw, HttpVersion::V1_1);
            req.process_headers(&raw, HttpVersion::V1_1, 0).unwrap();
        });
    });
}

fn complex_request_parse_benchmark(c: &mut Criterion) {
    let request = b"GET /path/to/resource?id=123&name=test HTTP/1.1\r\n\
                    Host: localhost:7878\r\n\
                    User-Agent: Mozilla/5.0 (Windows NT 10.0; Win64; x64)\r\n\
                    Accept: text/html,application/xhtml+xml\r\n\
                    Accept-Language: en-US,en;q=0.9\r\n\
                    Accept-Encoding: gzip, deflate, br\r\n\
                    Cookie: session=abc123; theme=dark\r\n\
                    Connection: keep-alive\r\n\
                    \r\n";

    c.bench_function("complex_request_parse", |b| {
        b.iter(|| {
            let raw = RawRequest::from_head(black_box(request), 512 * 1024, 0).unwrap();
            let mut req = Request::new(&raw, HttpVersion::V1_1);
            req.process_headers(&raw, HttpVersion::V1_1, 0).unwrap();
        });
    });
}

fn demo_server() -> Arc<Server> {
    let root = TreeNode::new()
        .with_index(|_, _| Ok("index"))
        .with_child(
            "greet",
            TreeNode::page(|_, args: Arguments| {
                Ok(format!("Hello, {}!", args.kw("name").unwrap_or("world")))
            }),
        )
        .with_default(|_, args: Arguments| Ok(args.positional.join("/")));
    let mut tree = Tree::new();
    tree.mount(Application::new(root), "/").unwrap();
    Arc::new(Server::new(Config::new(), tree))
}

fn pipeline_methods_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_run");
    let server = demo_server();

    let requests = [
        ("GET_index", "GET / HTTP/1.1"),
        ("HEAD_index", "HEAD / HTTP/1.1"),
        ("GET_query", "GET /greet?name=bench HTTP/1.1"),
        ("GET_default", "GET /a/b/c/d HTTP/1.1"),
        ("GET_1_0", "GET / HTTP/1.0"),
    ];

    for (name, line) in requests.iter() {
        group.bench_with_input(BenchmarkId::from_parameter(name), line, |b, line| {
            b.iter(|| {
                let raw = RawRequest::new(black_box(line), &[("Host", "localhost")]);
                let mut pipeline = server.pipeline(raw, 0);
                let served = pipeline.run(&mut std::io::empty()).unwrap();
                let _ = served.body.collect().unwrap();
                pipeline.close().unwrap();
            });
        });
    }

    group.finish();
}

fn post_form_benchmark(c: &mut Criterion) {
    let server = demo_server();
    let body = b"name=bench&extra=1&extra=2";

    c.bench_function("pipeline_post_form", |b| {
        b.iter(|| {
            let raw = RawRequest::new(
                "POST /greet HTTP/1.1",
                &[
                    ("Host", "localhost"),
                    ("Content-Type", "application/x-www-form-urlencoded"),
                    ("Content-Length", "26"),
                ],
            );
            let mut pipeline = server.pipeline(raw, 0);
            let served = pipeline.run(&mut &body[..]).unwrap();
            black_box(served.status_code());
        });
    });
}

criterion_group!(
    benches,
    simple_request_parse_benchmark,
    complex_request_parse_benchmark,
    pipeline_methods_benchmark,
    post_form_benchmark
);
criterion_main!(benches);
