use crate::cache::Cache;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use dav_server::DavHandler;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
struct CachedBody {
    generation: u64,
    gzipped: Bytes,
    content_type: String,
}

/// Wraps a `dav_server::DavHandler`, caching the gzip-compressed PROPFIND
/// body rclone re-polls constantly. Grounded on the source system's
/// `PropfindCache`/`refreshParentXml`: rather than hand-assembling the
/// multistatus XML the Go original does, this lets `dav-server` render it
/// (the teacher's stack already pulls in `dav-server`, see TEACHER's sibling
/// example) and caches the rendered bytes, keyed by path and invalidated by
/// the torrent index's rebuild generation counter instead of per-path dirty
/// tracking.
pub struct CachingDavHandler {
    inner: DavHandler,
    cache: Arc<Cache>,
    entries: Mutex<HashMap<String, CachedBody>>,
}

impl CachingDavHandler {
    pub fn new(inner: DavHandler, cache: Arc<Cache>) -> Self {
        CachingDavHandler {
            inner,
            cache,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn handle(&self, req: Request<Body>) -> Response {
        let is_propfind = req.method().as_str().eq_ignore_ascii_case("PROPFIND");
        let key = path_key(req.uri().path());
        let generation = self.cache.index.generation();

        if is_propfind {
            let cached = self.entries.lock().unwrap().get(&key).cloned();
            if let Some(body) = cached.filter(|b| b.generation == generation) {
                return gzipped_response(body);
            }
        }

        let resp = self.inner.handle(req).await;

        if is_propfind && resp.status() == StatusCode::MULTI_STATUS {
            let content_type = resp
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/xml; charset=utf-8")
                .to_string();

            let (_parts, body) = resp.into_parts();
            let bytes = match axum::body::to_bytes(body, usize::MAX).await {
                Ok(b) => b,
                Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            };

            let cached = CachedBody {
                generation,
                gzipped: gzip(&bytes),
                content_type,
            };
            self.entries.lock().unwrap().insert(key, cached.clone());
            return gzipped_response(cached);
        }

        resp.map(Body::new)
    }
}

fn path_key(path: &str) -> String {
    let digest = Sha256::digest(path.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn gzip(data: &[u8]) -> Bytes {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let _ = encoder.write_all(data);
    Bytes::from(encoder.finish().unwrap_or_default())
}

fn gzipped_response(body: CachedBody) -> Response {
    Response::builder()
        .status(StatusCode::MULTI_STATUS)
        .header(header::CONTENT_TYPE, body.content_type)
        .header(header::CONTENT_ENCODING, "gzip")
        .body(Body::from(body.gzipped))
        .expect("static header set is valid")
}
