use crate::imagehandler::{Entry, ImageFile, ImageFileSystem, OpenError, RootDirectory};
use crate::state::WebserverState;
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::{Router, routing::get};
use std::fmt::Write as _;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

const CHUNK_SIZE: usize = 64 * 1024;

pub async fn readiness_probe(State(state): State<WebserverState>) -> impl IntoResponse {
    match tokio::fs::metadata(state.filesystem.base_image()).await {
        Ok(metadata) if metadata.is_file() => StatusCode::NO_CONTENT,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub async fn liveness_probe() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

pub fn create_app(filesystem: Arc<ImageFileSystem>) -> Router {
    Router::new()
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/", get(list_images))
        .route("/{*path}", get(serve_image))
        .with_state(WebserverState { filesystem })
}

async fn list_images(State(state): State<WebserverState>) -> Response {
    serve(state, "/".to_string(), None).await
}

async fn serve_image(
    State(state): State<WebserverState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    serve(state, path, range).await
}

async fn serve(state: WebserverState, path: String, range: Option<String>) -> Response {
    let filesystem = state.filesystem.clone();
    // generating the image may block for a while
    let opened = tokio::task::spawn_blocking(move || filesystem.open(&path)).await;

    match opened {
        Ok(Ok(entry)) => {
            let info = entry.info();
            debug!(
                "Serving {} ({} bytes, mode {:o})",
                info.name, info.size, info.mode
            );
            match entry {
                Entry::RootDirectory(directory) => directory_listing(&directory),
                Entry::RegisteredFile(file) => file_response(file, range.as_deref()),
            }
        }
        Ok(Err(OpenError::NotFound(name))) => {
            debug!("Image {} is not registered", name);
            (StatusCode::NOT_FOUND, "404 page not found\n").into_response()
        }
        Ok(Err(OpenError::Stream { .. })) => internal_server_error(),
        Err(err) => {
            error!("Image open task failed: {}", err);
            internal_server_error()
        }
    }
}

fn internal_server_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "500 Internal Server Error\n",
    )
        .into_response()
}

fn directory_listing(directory: &RootDirectory) -> Response {
    let mut html = String::from("<!doctype html>\n<pre>\n");
    for entry in directory.entries() {
        let mut name = escape_html(&entry.name);
        if entry.is_dir {
            name.push('/');
        }
        let _ = writeln!(html, "<a href=\"{}\">{}</a>", name, name);
    }
    html.push_str("</pre>\n");
    Html(html).into_response()
}

fn escape_html(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&#34;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[derive(Debug, PartialEq, Eq)]
enum ByteRange {
    Full,
    /// Inclusive bounds
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Parses a single-range `Range` header. A reversed or out-of-bounds range is unsatisfiable;
/// anything else that is not a single byte range is ignored, which serves the whole file.
fn parse_range(value: &str, size: u64) -> ByteRange {
    let Some(spec) = value.trim().strip_prefix("bytes=") else {
        return ByteRange::Full;
    };
    if spec.contains(',') {
        return ByteRange::Full;
    }
    let Some((first, last)) = spec.split_once('-') else {
        return ByteRange::Full;
    };
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        let Ok(suffix) = last.parse::<u64>() else {
            return ByteRange::Full;
        };
        if suffix == 0 || size == 0 {
            return ByteRange::Unsatisfiable;
        }
        return ByteRange::Partial {
            start: size.saturating_sub(suffix),
            end: size - 1,
        };
    }

    let Ok(start) = first.parse::<u64>() else {
        return ByteRange::Full;
    };
    let end = if last.is_empty() {
        u64::MAX
    } else {
        match last.parse::<u64>() {
            Ok(end) if end >= start => end,
            Ok(_) => return ByteRange::Unsatisfiable,
            Err(_) => return ByteRange::Full,
        }
    };
    if start >= size {
        return ByteRange::Unsatisfiable;
    }
    ByteRange::Partial {
        start,
        end: end.min(size - 1),
    }
}

fn file_response(file: ImageFile, range: Option<&str>) -> Response {
    let size = file.info().size;
    let range = range.map_or(ByteRange::Full, |value| parse_range(value, size));

    let (status, start, length) = match range {
        ByteRange::Full => (StatusCode::OK, 0, size),
        ByteRange::Partial { start, end } => (StatusCode::PARTIAL_CONTENT, start, end - start + 1),
        ByteRange::Unsatisfiable => {
            return (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{}", size))],
            )
                .into_response();
        }
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, length);
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, start + length - 1, size),
        );
    }

    builder
        .body(stream_body(file, start, length))
        .unwrap_or_else(|err| {
            error!("Failed to build image response: {}", err);
            internal_server_error()
        })
}

/// Streams `length` bytes from `start`, reading the file on the blocking pool.
fn stream_body(mut file: ImageFile, start: u64, length: u64) -> Body {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(4);

    tokio::task::spawn_blocking(move || {
        if let Err(err) = file.seek(SeekFrom::Start(start)) {
            let _ = tx.blocking_send(Err(err));
            return;
        }
        let mut remaining = length;
        while remaining > 0 {
            let mut chunk = vec![0u8; remaining.min(CHUNK_SIZE as u64) as usize];
            match file.read(&mut chunk) {
                Ok(0) => {
                    let _ = tx.blocking_send(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "image stream ended early",
                    )));
                    return;
                }
                Ok(n) => {
                    chunk.truncate(n);
                    remaining -= n as u64;
                    // the client went away
                    if tx.blocking_send(Ok(Bytes::from(chunk))).is_err() {
                        return;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("Failed to read image {}: {}", file.info().name, err);
                    let _ = tx.blocking_send(Err(err));
                    return;
                }
            }
        }
    });

    Body::from_stream(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imagehandler::testing::PrefixFactory;
    use crate::imagehandler::{ImageRegistry, StreamFactory};
    use crate::secret_bytes::SecretBytes;
    use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
    use std::net::SocketAddr;

    struct TestServer {
        addr: SocketAddr,
        registry: Arc<ImageRegistry>,
        client: reqwest::Client,
    }

    impl TestServer {
        fn url(&self, path: &str) -> String {
            format!("http://{}{}", self.addr, path)
        }
    }

    async fn start(factory: PrefixFactory, base_image: &std::path::Path) -> TestServer {
        let factory: Arc<dyn StreamFactory> = Arc::new(factory);
        let registry = Arc::new(ImageRegistry::new("http://localhost:8080", factory.clone()));
        let filesystem = Arc::new(ImageFileSystem::new(registry.clone(), factory, base_image));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, create_app(filesystem)).await.unwrap();
        });

        TestServer {
            addr,
            registry,
            client: reqwest::Client::builder().no_proxy().build().unwrap(),
        }
    }

    async fn start_with_image() -> TestServer {
        let server = start(
            PrefixFactory::new(b"base:"),
            std::path::Path::new("/base.iso"),
        )
        .await;
        server
            .registry
            .register(
                "host-xyz-45.qcow",
                SecretBytes::from(b"asietonarst".as_slice()),
            )
            .unwrap();
        server
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(
            parse_range("bytes=2-5", 14),
            ByteRange::Partial { start: 2, end: 5 }
        );
        assert_eq!(
            parse_range("bytes=3-100", 14),
            ByteRange::Partial { start: 3, end: 13 }
        );
        assert_eq!(
            parse_range("bytes=4-", 14),
            ByteRange::Partial { start: 4, end: 13 }
        );
        assert_eq!(
            parse_range("bytes=-4", 14),
            ByteRange::Partial { start: 10, end: 13 }
        );
        assert_eq!(
            parse_range("bytes=-40", 14),
            ByteRange::Partial { start: 0, end: 13 }
        );
        assert_eq!(parse_range("bytes=14-", 14), ByteRange::Unsatisfiable);
        assert_eq!(parse_range("bytes=-0", 14), ByteRange::Unsatisfiable);
        assert_eq!(parse_range("bytes=0-", 0), ByteRange::Unsatisfiable);
        assert_eq!(parse_range("bytes=5-2", 14), ByteRange::Unsatisfiable);
        assert_eq!(parse_range("bytes=0-1,4-5", 14), ByteRange::Full);
        assert_eq!(parse_range("items=1-2", 14), ByteRange::Full);
        assert_eq!(parse_range("bytes=a-b", 14), ByteRange::Full);
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("a<b>&\"'"), "a&lt;b&gt;&amp;&#34;&#39;");
    }

    #[tokio::test]
    async fn test_get_image() {
        let server = start_with_image().await;
        let response = server
            .client
            .get(server.url("/host-xyz-45.qcow"))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_LENGTH], "16");
        assert_eq!(response.headers()["accept-ranges"], "bytes");
        assert_eq!(response.text().await.unwrap(), "base:asietonarst");
    }

    #[tokio::test]
    async fn test_get_image_range() {
        let server = start_with_image().await;
        let response = server
            .client
            .get(server.url("/host-xyz-45.qcow"))
            .header(RANGE, "bytes=5-9")
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes 5-9/16");
        assert_eq!(response.text().await.unwrap(), "asiet");
    }

    #[tokio::test]
    async fn test_get_image_unsatisfiable_range() {
        let server = start_with_image().await;
        let response = server
            .client
            .get(server.url("/host-xyz-45.qcow"))
            .header(RANGE, "bytes=100-")
            .send()
            .await
            .unwrap();

        assert_eq!(
            response.status(),
            reqwest::StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes */16");
    }

    #[tokio::test]
    async fn test_get_image_reversed_range() {
        let server = start_with_image().await;
        let response = server
            .client
            .get(server.url("/host-xyz-45.qcow"))
            .header(RANGE, "bytes=5-2")
            .send()
            .await
            .unwrap();

        assert_eq!(
            response.status(),
            reqwest::StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes */16");
    }

    #[tokio::test]
    async fn test_get_unregistered_image() {
        let server = start_with_image().await;
        let response = server
            .client
            .get(server.url("/missing.qcow"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stream_failure_is_server_error() {
        let mut factory = PrefixFactory::new(b"base:");
        factory.fail_open = true;
        let server = start(factory, std::path::Path::new("/base.iso")).await;
        server
            .registry
            .register("a.qcow", SecretBytes::default())
            .unwrap();

        let response = server
            .client
            .get(server.url("/a.qcow"))
            .send()
            .await
            .unwrap();
        assert_eq!(
            response.status(),
            reqwest::StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_directory_listing() {
        let server = start_with_image().await;
        let response = server.client.get(server.url("/")).send().await.unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body = response.text().await.unwrap();
        assert!(body.contains("<a href=\"host-xyz-45.qcow\">host-xyz-45.qcow</a>"));
    }

    #[tokio::test]
    async fn test_upsert_serves_latest_payload() {
        let server = start_with_image().await;
        server
            .registry
            .register("host-xyz-45.qcow", SecretBytes::from(b"updated".as_slice()))
            .unwrap();

        let body = server
            .client
            .get(server.url("/host-xyz-45.qcow"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "base:updated");
    }

    #[tokio::test]
    async fn test_health_probes() {
        let base_image = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        let server = start(PrefixFactory::new(b""), base_image.path()).await;
        let live = server
            .client
            .get(server.url("/health/live"))
            .send()
            .await
            .unwrap();
        assert_eq!(live.status(), reqwest::StatusCode::NO_CONTENT);
        let ready = server
            .client
            .get(server.url("/health/ready"))
            .send()
            .await
            .unwrap();
        assert_eq!(ready.status(), reqwest::StatusCode::NO_CONTENT);

        let server = start(
            PrefixFactory::new(b""),
            std::path::Path::new("/nonexistent/base.iso"),
        )
        .await;
        let ready = server
            .client
            .get(server.url("/health/ready"))
            .send()
            .await
            .unwrap();
        assert_eq!(ready.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    }
}
