//! HTTP publisher for the generated XMLTV file and playlist.
//!
//! Files are read from disk on every request. Nothing is shared with the generator
//! beyond the two paths.

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use log::{error, info, warn};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

const XMLTV_CONTENT_TYPE: &str = "application/xml";
const M3U_CONTENT_TYPE: &str = "audio/x-mpegurl";
const TEXT_CONTENT_TYPE: &str = "text/plain";
const CACHE_CONTROL: &str = "max-age=300";

#[derive(Debug, Clone)]
pub struct ServedFiles {
    pub epg: PathBuf,
    pub m3u: PathBuf,
}

type SharedFiles = Arc<ServedFiles>;

pub fn router(files: ServedFiles) -> Router {
    Router::new()
        .route("/", get(epg))
        .route("/guide.xml", get(epg))
        .route("/epg.xml", get(epg))
        .route("/channels.m3u", get(playlist))
        .route("/playlist.m3u", get(playlist))
        .route("/lineup.m3u", get(playlist))
        .route("/health", get(health))
        .route("/status", get(status))
        .fallback(not_found)
        .with_state(Arc::new(files))
}

/// Bind and serve until the process is stopped.
pub async fn serve(listen_addr: SocketAddr, files: ServedFiles) -> Result<(), String> {
    info!("EPG file path: {}", files.epg.display());
    info!("M3U file path: {}", files.m3u.display());
    let app = router(files);

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .map_err(|e| format!("binding {} failed: {}", listen_addr, e))?;
    info!("Starting HTTP server on {}", listen_addr);
    info!("Access EPG at http://{}/epg.xml", listen_addr);
    info!("Access M3U at http://{}/channels.m3u", listen_addr);
    info!("Server status at http://{}/status", listen_addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| format!("HTTP server failed: {}", e))
}

async fn epg(State(files): State<SharedFiles>) -> Response {
    serve_file(&files.epg, XMLTV_CONTENT_TYPE, "EPG").await
}

async fn playlist(State(files): State<SharedFiles>) -> Response {
    serve_file(&files.m3u, M3U_CONTENT_TYPE, "M3U playlist").await
}

async fn serve_file(path: &Path, content_type: &'static str, kind: &str) -> Response {
    match tokio::fs::read(path).await {
        Ok(content) => {
            info!("Served {} file: {}", kind, path.display());
            (
                [(header::CONTENT_TYPE, content_type), (header::CACHE_CONTROL, CACHE_CONTROL)],
                content,
            )
                .into_response()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("{} file not found: {}", kind, path.display());
            text(StatusCode::NOT_FOUND, format!("{} file not found", kind))
        }
        Err(e) => {
            error!("Error serving {}: {}", kind, e);
            text(StatusCode::INTERNAL_SERVER_ERROR, format!("Error serving {}: {}", kind, e))
        }
    }
}

async fn health() -> Response {
    text(StatusCode::OK, "OK".to_string())
}

struct FileStatus {
    exists: bool,
    size: u64,
    modified: u64,
}

async fn file_status(path: &Path) -> FileStatus {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => FileStatus {
            exists: true,
            size: meta.len(),
            modified: meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0),
        },
        _ => FileStatus {
            exists: false,
            size: 0,
            modified: 0,
        },
    }
}

async fn status(State(files): State<SharedFiles>) -> Response {
    let mut body = String::from("HDHomeRun EPG to XMLTV Server Status\n");
    for (label, path) in [("EPG File", &files.epg), ("M3U File", &files.m3u)] {
        let s = file_status(path).await;
        let _ = write!(
            body,
            "\n{}: {}\n  Exists: {}\n  Size: {} bytes\n  Last Modified: {}\n",
            label,
            path.display(),
            s.exists,
            s.size,
            s.modified
        );
    }
    body.push_str(
        "\nAvailable Endpoints:\n  /epg.xml - XMLTV EPG data\n  /channels.m3u - M3U playlist\n  /health - Health check\n  /status - This status page\n",
    );
    text(StatusCode::OK, body)
}

async fn not_found() -> Response {
    text(StatusCode::NOT_FOUND, "Not found".to_string())
}

fn text(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)], body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn files_in(dir: &TempDir) -> ServedFiles {
        ServedFiles {
            epg: dir.path().join("epg.xml"),
            m3u: dir.path().join("channels.m3u"),
        }
    }

    async fn request(app: Router, uri: &str) -> (StatusCode, Option<String>, String) {
        let res = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = res.status();
        let content_type = res
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn xmltv_routes_serve_the_guide() {
        let dir = TempDir::new().unwrap();
        let files = files_in(&dir);
        std::fs::write(&files.epg, "<tv/>").unwrap();

        for uri in ["/", "/guide.xml", "/epg.xml"] {
            let (status, content_type, body) = request(router(files.clone()), uri).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
            assert_eq!(content_type.as_deref(), Some(XMLTV_CONTENT_TYPE));
            assert_eq!(body, "<tv/>");
        }
    }

    #[tokio::test]
    async fn playlist_routes_serve_the_m3u() {
        let dir = TempDir::new().unwrap();
        let files = files_in(&dir);
        std::fs::write(&files.m3u, "#EXTM3U\n").unwrap();

        for uri in ["/channels.m3u", "/playlist.m3u", "/lineup.m3u"] {
            let (status, content_type, body) = request(router(files.clone()), uri).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
            assert_eq!(content_type.as_deref(), Some(M3U_CONTENT_TYPE));
            assert_eq!(body, "#EXTM3U\n");
        }
    }

    #[tokio::test]
    async fn missing_file_is_404() {
        let dir = TempDir::new().unwrap();
        let (status, _, body) = request(router(files_in(&dir)), "/epg.xml").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "EPG file not found");
    }

    #[tokio::test]
    async fn health_status_and_unknown_paths() {
        let dir = TempDir::new().unwrap();
        let files = files_in(&dir);
        std::fs::write(&files.epg, "12345").unwrap();

        let (status, _, body) = request(router(files.clone()), "/health").await;
        assert_eq!((status, body.as_str()), (StatusCode::OK, "OK"));

        let (status, _, body) = request(router(files.clone()), "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("EPG File: "));
        assert!(body.contains("Exists: true\n  Size: 5 bytes"));
        assert!(body.contains("Exists: false\n  Size: 0 bytes"));

        let (status, _, body) = request(router(files), "/nope").await;
        assert_eq!((status, body.as_str()), (StatusCode::NOT_FOUND, "Not found"));
    }
}
