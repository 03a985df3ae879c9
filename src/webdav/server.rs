use crate::cache::Cache;
use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::webdav::propfind::CachingDavHandler;
use crate::webdav::VaultFileSystem;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use dav_server::fakels::FakeLs;
use dav_server::DavHandler;
use std::sync::Arc;

#[derive(Clone)]
struct ProviderDav {
    cache: Arc<Cache>,
    handler: Arc<CachingDavHandler>,
    prefix: String,
}

impl ProviderDav {
    /// Resolves a raw request path to a file's download URL, for the
    /// `stream_with_rclone` 302 shortcut (spec §4.7: skip the in-process
    /// ranged-fetch proxy and hand the client rclone's own resolved link).
    /// Only matches the `<folder>/<torrent>/<file>` shape `VaultFileSystem`
    /// treats as `Resolved::File`; everything else falls through to the
    /// generic dav-server handler.
    async fn resolve_file_redirect(&self, path: &str) -> Option<String> {
        let rel = path.strip_prefix(&self.prefix)?.trim_start_matches('/');
        let mut segments = rel.split('/').filter(|s| !s.is_empty());
        let _folder = segments.next()?;
        let torrent_name = segments.next()?;
        let file_name = segments.next()?;
        if segments.next().is_some() {
            return None;
        }

        let ct = self.cache.get_torrent_by_name(torrent_name)?;
        let file = ct.torrent.files.get(file_name)?.clone();
        self.cache.get_download_link(&ct.torrent.id, &file).await.ok()
    }
}

/// Builds one read-only WebDAV mount per configured provider under
/// `/<urlBase>/webdav/<providerName>`, each gated until that provider's
/// cache has completed its initial sync (spec §4.7 "Readiness gate").
/// Merged into the top-level router alongside the qBittorrent façade.
pub fn build_router(orchestrator: &Arc<Orchestrator>, config: &Config) -> Router {
    let mut router = Router::new();

    for provider_cfg in &config.providers {
        let Some(cache) = orchestrator.cache(&provider_cfg.folder) else {
            continue;
        };

        let fs = VaultFileSystem::new(cache.clone());
        let dav = DavHandler::builder()
            .filesystem(Box::new(fs))
            .locksystem(FakeLs::new())
            .build_handler();

        let prefix = format!("{}/webdav/{}", config.url_base, provider_cfg.folder);
        let state = ProviderDav {
            cache: cache.clone(),
            handler: Arc::new(CachingDavHandler::new(dav, cache)),
            prefix: prefix.clone(),
        };

        let mounted = Router::new()
            .route(&prefix, any(serve_dav))
            .route(&format!("{prefix}/{{*rest}}"), any(serve_dav))
            .with_state(state);

        router = router.merge(mounted);
    }

    router
}

async fn serve_dav(State(state): State<ProviderDav>, req: Request<Body>) -> Response {
    if !state.cache.is_ready() {
        return (StatusCode::SERVICE_UNAVAILABLE, [(header::RETRY_AFTER, "5")]).into_response();
    }

    let is_read = matches!(*req.method(), Method::GET | Method::HEAD);
    if state.cache.stream_with_rclone && is_read {
        if let Some(url) = state.resolve_file_redirect(req.uri().path()).await {
            return match HeaderValue::try_from(url) {
                Ok(location) => (StatusCode::FOUND, [(header::LOCATION, location)]).into_response(),
                Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            };
        }
    }

    state.handler.handle(req).await
}
