//! Integration tests for Idlegate

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use idlegate::app::App;
use idlegate::config::Config;
use idlegate::process::ProcessState;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const BACKEND_BODY: &str = "hello from backend";

/// Minimal backend that echoes the path and forwarding headers
async fn spawn_backend_on(listener: TcpListener) -> Arc<AtomicUsize> {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let hits = Arc::clone(&counter);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    // Readiness probes are HEAD requests and not counted
                    if req.method() != Method::HEAD {
                        hits.fetch_add(1, Ordering::SeqCst);
                    }
                    let forwarded_for = req
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-")
                        .to_string();
                    let body = format!(
                        "{} path={} xff={}",
                        BACKEND_BODY,
                        req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/"),
                        forwarded_for
                    );
                    async move { Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body)))) }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    hits
}

async fn spawn_backend() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (addr, spawn_backend_on(listener).await)
}

fn test_config(backend: SocketAddr, command: &str) -> Config {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.server.backend_url = format!("http://{}", backend);
    config.server.drain_timeout = Duration::from_secs(2);
    config.process.command = command.to_string();
    config.process.kill_grace = Duration::from_secs(2);
    config.reconcile.poll_interval = Duration::from_millis(20);
    config.gate.retry_interval = Duration::from_millis(20);
    config
}

fn marker_command(marker: &Path) -> String {
    format!("echo started >> '{}'; exec sleep 30", marker.display())
}

fn marker_lines(marker: &Path) -> usize {
    std::fs::read_to_string(marker)
        .map(|content| content.lines().count())
        .unwrap_or(0)
}

struct RunningApp {
    addr: SocketAddr,
    app_handle: JoinHandle<i32>,
    signal_tx: oneshot::Sender<()>,
}

impl RunningApp {
    async fn shutdown(self) -> i32 {
        let _ = self.signal_tx.send(());
        tokio::time::timeout(Duration::from_secs(15), self.app_handle)
            .await
            .expect("shutdown should be bounded")
            .unwrap()
    }
}

async fn start_app(app: App) -> RunningApp {
    let listener = app.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (signal_tx, signal_rx) = oneshot::channel::<()>();

    let app_handle = tokio::spawn(app.run(listener, async move {
        let _ = signal_rx.await;
    }));

    RunningApp {
        addr,
        app_handle,
        signal_tx,
    }
}

/// Send a simple HTTP request and get response
async fn http_get(addr: SocketAddr, path: &str) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let mut stream = TcpStream::connect(addr).await?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, addr
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

/// Send a request on a connection that stays open afterwards
async fn keep_alive_get(addr: SocketAddr) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", addr);
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = vec![0u8; 4096];
    let mut response = String::new();
    while !response.contains(BACKEND_BODY) {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before response");
        response.push_str(&String::from_utf8_lossy(&buf[..n]));
    }
    (stream, response)
}

async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test]
async fn test_pure_proxy_forwards_requests() {
    let (backend, hits) = spawn_backend().await;
    let app = App::new(test_config(backend, "")).unwrap();
    assert!(app.supervisor().is_none());

    let running = start_app(app).await;

    let response = http_get(running.addr, "/snapshot?action=1").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {}", response);
    assert!(response.contains("path=/snapshot?action=1"));
    assert!(response.contains("xff=127.0.0.1"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    assert_eq!(running.shutdown().await, 0);
}

#[tokio::test]
async fn test_request_waits_for_backend_to_come_up() {
    // Reserve a port, leave it closed for a while
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let backend = reserved.local_addr().unwrap();
    drop(reserved);

    let app = App::new(test_config(backend, "")).unwrap();
    let running = start_app(app).await;

    let request = tokio::spawn(http_get(running.addr, "/"));
    let request = async move { request.await.unwrap().map_err(|e| e.to_string()) };

    tokio::time::sleep(Duration::from_millis(300)).await;
    let listener = TcpListener::bind(backend).await.unwrap();
    let hits = spawn_backend_on(listener).await;

    let response = tokio::time::timeout(Duration::from_secs(5), request)
        .await
        .expect("request should complete once the backend listens")
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {}", response);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    assert_eq!(running.shutdown().await, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_daemon_follows_connection_demand() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("starts");
    let (backend, _hits) = spawn_backend().await;

    let app = App::new(test_config(backend, &marker_command(&marker))).unwrap();
    let supervisor = app.supervisor().expect("command configured");
    let counter = app.counter();
    let running = start_app(app).await;

    assert_eq!(supervisor.state(), ProcessState::Stopped);
    assert_eq!(marker_lines(&marker), 0);

    // First client starts the daemon
    let (stream, response) = keep_alive_get(running.addr).await;
    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {}", response);
    assert!(wait_until(Duration::from_secs(2), || supervisor.state() == ProcessState::Running).await);
    assert_eq!(counter.count(), 1);
    // The shell writes the marker after the spawn; closing early would cut it off
    assert!(wait_until(Duration::from_secs(2), || marker_lines(&marker) == 1).await);

    // Last connection closed, so the daemon is stopped again
    drop(stream);
    assert!(wait_until(Duration::from_secs(5), || counter.count() == 0
        && supervisor.state() == ProcessState::Stopped)
    .await);

    // A new client brings it back
    let (stream, response) = keep_alive_get(running.addr).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(wait_until(Duration::from_secs(2), || supervisor.state() == ProcessState::Running).await);
    assert!(wait_until(Duration::from_secs(2), || marker_lines(&marker) == 2).await);
    drop(stream);

    assert_eq!(running.shutdown().await, 0);
    assert_eq!(supervisor.state(), ProcessState::Stopped);
}

#[cfg(unix)]
#[tokio::test]
async fn test_concurrent_clients_spawn_one_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("starts");
    let (backend, _hits) = spawn_backend().await;

    let mut config = test_config(backend, &marker_command(&marker));
    config.process.start_delay = Duration::from_millis(200);
    let app = App::new(config).unwrap();
    let supervisor = app.supervisor().unwrap();
    let running = start_app(app).await;

    let addr = running.addr;
    let requests: Vec<_> = (0..5)
        .map(|_| tokio::spawn(async move { keep_alive_get(addr).await }))
        .collect();

    let mut streams = Vec::new();
    for request in requests {
        let (stream, response) = request.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        streams.push(stream);
    }

    assert!(wait_until(Duration::from_secs(2), || supervisor.state() == ProcessState::Running).await);
    assert!(wait_until(Duration::from_secs(2), || marker_lines(&marker) == 1).await);

    drop(streams);
    assert!(wait_until(Duration::from_secs(5), || supervisor.state() == ProcessState::Stopped).await);
    assert_eq!(marker_lines(&marker), 1);

    assert_eq!(running.shutdown().await, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_shutdown_with_running_daemon_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("starts");
    let (backend, _hits) = spawn_backend().await;

    let app = App::new(test_config(backend, &marker_command(&marker))).unwrap();
    let supervisor = app.supervisor().unwrap();
    let running = start_app(app).await;

    // Hold a keep-alive connection so the daemon stays up
    let (stream, _response) = keep_alive_get(running.addr).await;
    assert!(wait_until(Duration::from_secs(2), || supervisor.state() == ProcessState::Running).await);

    let started = Instant::now();
    assert_eq!(running.shutdown().await, 0);
    assert!(started.elapsed() < Duration::from_secs(6));
    assert_eq!(supervisor.state(), ProcessState::Stopped);
    drop(stream);
}

#[cfg(unix)]
#[tokio::test]
async fn test_shutdown_with_stopped_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("starts");
    let (backend, _hits) = spawn_backend().await;

    let app = App::new(test_config(backend, &marker_command(&marker))).unwrap();
    let supervisor = app.supervisor().unwrap();
    let counter = app.counter();
    let running = start_app(app).await;

    let (stream, _response) = keep_alive_get(running.addr).await;
    assert!(wait_until(Duration::from_secs(2), || marker_lines(&marker) == 1).await);
    drop(stream);
    assert!(wait_until(Duration::from_secs(5), || counter.count() == 0
        && supervisor.state() == ProcessState::Stopped)
    .await);

    // Nothing left to stop; shutdown must still succeed
    assert_eq!(running.shutdown().await, 0);
    assert_eq!(supervisor.state(), ProcessState::Stopped);
    assert_eq!(marker_lines(&marker), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn test_shutdown_during_start_delay() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("starts");
    let (backend, _hits) = spawn_backend().await;

    let mut config = test_config(backend, &marker_command(&marker));
    config.process.start_delay = Duration::from_secs(30);
    let app = App::new(config).unwrap();
    let supervisor = app.supervisor().unwrap();
    let running = start_app(app).await;

    // The backend is already up, so the client is answered while the daemon
    // is still in its start delay
    let (stream, _response) = keep_alive_get(running.addr).await;
    assert!(wait_until(Duration::from_secs(2), || supervisor.state() == ProcessState::Starting).await);

    let started = Instant::now();
    assert_eq!(running.shutdown().await, 0);
    assert!(started.elapsed() < Duration::from_secs(6));
    assert_eq!(supervisor.state(), ProcessState::Stopped);
    drop(stream);
}

#[tokio::test]
async fn test_shutdown_releases_parked_requests() {
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let backend = reserved.local_addr().unwrap();
    drop(reserved);

    let app = App::new(test_config(backend, "")).unwrap();
    let running = start_app(app).await;

    let addr = running.addr;
    let request = tokio::spawn(async move { http_get(addr, "/").await.map_err(|e| e.to_string()) });
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(running.shutdown().await, 0);

    let response = request.await.unwrap().unwrap();
    assert!(response.starts_with("HTTP/1.1 503"), "unexpected response: {}", response);
    assert!(response.to_lowercase().contains("x-proxy-error: backend_unavailable"));
}

const SWITCHING_PROTOCOLS: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: echo\r\nConnection: Upgrade\r\n\r\n";

/// Raw backend: answers probes with 200 and everything else with
/// `upgrade_reply`, followed by an echo tunnel
async fn spawn_upgrade_backend(upgrade_reply: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let Ok(n) = stream.read(&mut buf).await else { return };
                    if n == 0 {
                        return;
                    }
                    head.extend_from_slice(&buf[..n]);
                }

                if head.starts_with(b"HEAD") {
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                        .await;
                    return;
                }

                let _ = stream.write_all(upgrade_reply).await;
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

#[tokio::test]
async fn test_upgrade_tunnel_counts_as_hijacked() {
    use idlegate::counter::ConnectionEvent;

    let backend = spawn_upgrade_backend(SWITCHING_PROTOCOLS).await;
    let app = App::new(test_config(backend, "")).unwrap();
    let counter = app.counter();
    let running = start_app(app).await;

    let mut stream = TcpStream::connect(running.addr).await.unwrap();
    let request = format!(
        "GET /ws HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: echo\r\n\r\n",
        running.addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before upgrade response");
        head.extend_from_slice(&buf[..n]);
    }
    assert!(head.starts_with(b"HTTP/1.1 101"), "unexpected response: {}", String::from_utf8_lossy(&head));

    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
    assert_eq!(counter.count(), 1);

    drop(stream);
    assert!(wait_until(Duration::from_secs(2), || counter.count() == 0).await);
    assert_eq!(counter.last_event(), Some(ConnectionEvent::Hijacked));

    assert_eq!(running.shutdown().await, 0);
}

#[tokio::test]
async fn test_failed_upgrade_reports_request_id() {
    let backend = spawn_upgrade_backend(b"garbage\r\n\r\n").await;
    let app = App::new(test_config(backend, "")).unwrap();
    let running = start_app(app).await;

    let mut stream = TcpStream::connect(running.addr).await.unwrap();
    let request = format!(
        "GET /ws HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: echo\r\nX-Request-ID: upgrade-42\r\n\r\n",
        running.addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    let mut buf = [0u8; 1024];
    while !response.ends_with('}') {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before error body");
        response.push_str(&String::from_utf8_lossy(&buf[..n]));
    }
    assert!(response.starts_with("HTTP/1.1 502"), "unexpected response: {}", response);
    assert!(response.to_lowercase().contains("x-proxy-error: connection_failed"));
    assert!(response.contains("\"request_id\":\"upgrade-42\""));

    drop(stream);
    assert_eq!(running.shutdown().await, 0);
}
