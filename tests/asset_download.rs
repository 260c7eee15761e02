use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use xray_harmony::app::{AssetKind, AssetManager, DownloadProgress, DownloadStatus};
use xray_harmony::BridgeError;

const BODY_LEN: usize = 4096;

/// 极简 HTTP/1.1 服务，每个连接一个线程，响应后关闭连接
struct TestServer {
    base: String,
}

impl TestServer {
    fn start(gate: Option<Receiver<()>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let gate = Arc::new(Mutex::new(gate));
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let gate = gate.clone();
                thread::spawn(move || handle(stream, gate));
            }
        });
        Self { base }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

fn handle(mut stream: TcpStream, gate: Arc<Mutex<Option<Receiver<()>>>>) {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut request_line = String::new();
    reader.read_line(&mut request_line).unwrap();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap() == 0 || line == "\r\n" {
            break;
        }
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();
    let body = vec![0xABu8; BODY_LEN];

    match (method.as_str(), path.as_str()) {
        ("GET", "/geoip.dat") => {
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Length: {BODY_LEN}\r\nConnection: close\r\n\r\n"
            )
            .unwrap();
            stream.write_all(&body).unwrap();
        }
        ("GET", "/slow.dat") => {
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Length: {BODY_LEN}\r\nConnection: close\r\n\r\n"
            )
            .unwrap();
            stream.write_all(&body[..1024]).unwrap();
            stream.flush().unwrap();
            if let Some(rx) = gate.lock().unwrap().take() {
                let _ = rx.recv_timeout(Duration::from_secs(10));
            }
            stream.write_all(&body[1024..]).unwrap();
        }
        ("GET", "/short.dat") => {
            // 声明的长度大于实际发送
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Length: {BODY_LEN}\r\nConnection: close\r\n\r\n"
            )
            .unwrap();
            stream.write_all(&body[..100]).unwrap();
        }
        ("HEAD", "/old.dat") => {
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Length: {BODY_LEN}\r\nLast-Modified: Mon, 01 Jan 2001 00:00:00 GMT\r\nConnection: close\r\n\r\n"
            )
            .unwrap();
        }
        ("HEAD", "/new.dat") => {
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Length: {BODY_LEN}\r\nLast-Modified: Fri, 01 Jan 2100 00:00:00 GMT\r\nConnection: close\r\n\r\n"
            )
            .unwrap();
        }
        ("HEAD", "/bigger.dat") => {
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Length: 999999\r\nConnection: close\r\n\r\n"
            )
            .unwrap();
        }
        _ => {
            write!(
                stream,
                "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            )
            .unwrap();
        }
    }
    let _ = stream.flush();
}

#[test]
fn download_completes_and_reports_progress() {
    let server = TestServer::start(None);
    let dir = tempfile::tempdir().unwrap();
    let manager = AssetManager::new(dir.path()).unwrap();

    let mut events: Vec<DownloadProgress> = Vec::new();
    manager
        .download(AssetKind::GeoIp, Some(&server.url("/geoip.dat")), &mut |p| {
            events.push(p.clone())
        })
        .unwrap();

    let first = events.first().unwrap();
    assert_eq!(first.status, DownloadStatus::Downloading);
    assert_eq!(first.downloaded, 0);
    let last = events.last().unwrap();
    assert_eq!(last.status, DownloadStatus::Completed);
    assert_eq!(last.downloaded, BODY_LEN as u64);
    assert_eq!(last.total, BODY_LEN as u64);
    assert_eq!(last.percentage, Some(100.0));

    let info = manager.info(AssetKind::GeoIp).unwrap();
    assert!(info.exists);
    assert_eq!(info.size, BODY_LEN as u64);
    assert!(manager.verify(AssetKind::GeoIp).unwrap());
    assert!(!dir.path().join("geoip.dat.tmp").exists());
    assert!(!manager.is_downloading(AssetKind::GeoIp));
}

#[test]
fn http_error_fails_and_cleans_up() {
    let server = TestServer::start(None);
    let dir = tempfile::tempdir().unwrap();
    let manager = AssetManager::new(dir.path()).unwrap();

    let mut last = None;
    let err = manager
        .download(AssetKind::GeoSite, Some(&server.url("/missing.dat")), &mut |p| {
            last = Some(p.clone())
        })
        .unwrap_err();
    assert!(matches!(err, BridgeError::Transport(ref m) if m.contains("404")));
    let last = last.unwrap();
    assert_eq!(last.status, DownloadStatus::Failed);
    assert!(last.error.is_some());
    assert!(!manager.exists(AssetKind::GeoSite));
    assert!(!dir.path().join("geosite.dat.tmp").exists());
}

#[test]
fn truncated_body_does_not_replace_file() {
    let server = TestServer::start(None);
    let dir = tempfile::tempdir().unwrap();
    let manager = AssetManager::new(dir.path()).unwrap();
    std::fs::write(dir.path().join("geoip.dat"), vec![1u8; 2048]).unwrap();

    let err = manager
        .download(AssetKind::GeoIp, Some(&server.url("/short.dat")), &mut |_| {})
        .unwrap_err();
    assert!(matches!(err, BridgeError::Transport(_)));
    assert_eq!(manager.info(AssetKind::GeoIp).unwrap().size, 2048);
    assert!(!dir.path().join("geoip.dat.tmp").exists());
}

#[test]
fn concurrent_download_of_same_kind_is_rejected() {
    let (open_gate, gate) = channel();
    let server = TestServer::start(Some(gate));
    let dir = tempfile::tempdir().unwrap();
    let manager = Arc::new(AssetManager::new(dir.path()).unwrap());

    let url = server.url("/slow.dat");
    let worker = {
        let manager = manager.clone();
        thread::spawn(move || manager.download(AssetKind::GeoSite, Some(&url), &mut |_| {}))
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while !manager.is_downloading(AssetKind::GeoSite) {
        assert!(Instant::now() < deadline, "download never started");
        thread::sleep(Duration::from_millis(5));
    }

    let second = manager.download(AssetKind::GeoSite, Some(&server.url("/slow.dat")), &mut |_| {});
    assert!(matches!(second, Err(BridgeError::AlreadyDownloading(AssetKind::GeoSite))));
    assert!(matches!(
        manager.delete(AssetKind::GeoSite),
        Err(BridgeError::AlreadyDownloading(_))
    ));

    // 另一类资源不受影响
    manager
        .download(AssetKind::GeoIp, Some(&server.url("/geoip.dat")), &mut |_| {})
        .unwrap();

    open_gate.send(()).unwrap();
    worker.join().unwrap().unwrap();
    assert!(!manager.is_downloading(AssetKind::GeoSite));
    assert_eq!(manager.info(AssetKind::GeoSite).unwrap().size, BODY_LEN as u64);
}

#[test]
fn check_update_compares_size_and_date() {
    let server = TestServer::start(None);
    let dir = tempfile::tempdir().unwrap();
    let manager = AssetManager::new(dir.path()).unwrap();

    // 本地不存在时无需请求
    assert!(manager.check_update(AssetKind::GeoIp, Some("http://127.0.0.1:1/none")).unwrap());

    std::fs::write(dir.path().join("geoip.dat"), vec![0u8; BODY_LEN]).unwrap();
    assert!(!manager.check_update(AssetKind::GeoIp, Some(&server.url("/old.dat"))).unwrap());
    assert!(manager.check_update(AssetKind::GeoIp, Some(&server.url("/new.dat"))).unwrap());
    assert!(manager.check_update(AssetKind::GeoIp, Some(&server.url("/bigger.dat"))).unwrap());
    assert!(matches!(
        manager.check_update(AssetKind::GeoIp, Some(&server.url("/nothing"))),
        Err(BridgeError::Transport(_))
    ));
}
