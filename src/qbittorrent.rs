use crate::cache::CachedTorrent;
use crate::config::get_config;
use crate::error::AppError;
use crate::helpers::add_trackers_to_magnet_uri::add_trackers_to_magnet_uri;
use crate::helpers::parse_magnet_uri::parse_magnet_uri;
use crate::orchestrator::Orchestrator;
use crate::provider::Submission;
use axum::extract::{FromRequest, Multipart, Query, Request, State};
use axum::http::Method;
use axum::http::Uri;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Form, Json, Router};
use reqwest::StatusCode;
use rs_torrent_magnet::magnet_from_torrent;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

pub async fn auth_login() -> impl IntoResponse {
    "Ok."
}

async fn app_version() -> &'static str {
    "v4.3.2"
}

async fn app_webapi_version() -> &'static str {
    "2.7"
}

async fn app_buildinfo() -> impl IntoResponse {
    Json(json!({
        "bitness": 64,
        "boost": "1.75.0",
        "libtorrent": "1.2.11.0",
        "openssl": "1.1.1i",
        "qt": "5.15.2",
        "zlib": "1.2.11"
    }))
}

async fn app_shutdown() -> impl IntoResponse {
    StatusCode::OK
}

async fn app_preferences() -> impl IntoResponse {
    let config = get_config();
    let save_path = config.data_dir.join("downloads").to_string_lossy().into_owned();

    Json(json!({
        "save_path": save_path,
        "max_active_downloads": 5,
        "max_active_torrents": 10,
        "max_active_uploads": 5,
        "dht": true, // allows magnets with no trackers to be added
    }))
}

async fn app_set_preferences() -> impl IntoResponse {
    StatusCode::OK
}

async fn app_default_save_path() -> impl IntoResponse {
    let config = get_config();
    config.data_dir.join("downloads").to_string_lossy().into_owned()
}

#[derive(Debug, Deserialize)]
struct QBTorrentsInfoRequest {
    #[allow(dead_code)]
    pub category: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct QBittorrentTorrent {
    pub hash: String,
    pub name: String,
    pub size: u64,
    pub progress: f32, // 0.0-1.0
    #[serde(rename = "eta")]
    pub eta_secs: u32,
    pub state: String,
    pub category: Option<String>,
    pub save_path: Option<String>,
    pub ratio: f32,
    pub last_activity: i64,
}

/// There's no qBittorrent-native notion of a debrid torrent; this maps the
/// fields `*arr` tooling actually reads off `CachedTorrent`. Ratio/eta have
/// no analog in the new data model and are always reported as zero.
fn to_qbittorrent(ct: &CachedTorrent) -> QBittorrentTorrent {
    let save_path = get_config().data_dir.join("downloads");
    QBittorrentTorrent {
        hash: ct.torrent.info_hash.clone(),
        name: ct.torrent.name.clone(),
        size: ct.torrent.size,
        progress: if ct.is_complete { 1.0 } else { 0.0 },
        eta_secs: 0,
        state: if ct.is_complete {
            "uploading".to_string()
        } else {
            "downloading".to_string()
        },
        category: None,
        save_path: Some(save_path.to_string_lossy().into_owned()),
        ratio: 0.0,
        last_activity: ct.added_on.timestamp(),
    }
}

/// Categories only steer which provider `torrents/add` routes a new
/// submission to (see `Config::provider_for_category`); nothing is stored
/// per-torrent afterward, so `category` here is accepted for client
/// compatibility but otherwise unused.
async fn torrents_info(
    State(orchestrator): State<Arc<Orchestrator>>,
    Query(_query): Query<QBTorrentsInfoRequest>,
) -> impl IntoResponse {
    let mut out = Vec::new();
    for cache in orchestrator.caches() {
        for ct in cache.index.all().values() {
            out.push(to_qbittorrent(ct));
        }
    }
    Json(out)
}

fn find_by_hash(orchestrator: &Orchestrator, hash: &str) -> Option<Arc<CachedTorrent>> {
    orchestrator.caches().into_iter().find_map(|cache| {
        cache
            .index
            .all()
            .values()
            .find(|ct| ct.torrent.info_hash.eq_ignore_ascii_case(hash))
            .cloned()
    })
}

#[derive(Debug, Deserialize)]
struct QBTorrentsHashRequest {
    pub hash: String,
}

async fn torrents_files(
    State(orchestrator): State<Arc<Orchestrator>>,
    Query(query): Query<QBTorrentsHashRequest>,
) -> Response {
    let Some(ct) = find_by_hash(&orchestrator, &query.hash) else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "Torrent not found"}))).into_response();
    };

    Json(
        ct.torrent
            .files
            .values()
            .map(|f| {
                json!({
                    "name": f.name,
                    "size": f.size,
                    "progress": 1.0,
                    "priority": 1,
                    "piece_range": [0, 0],
                    "availability": 1.0,
                })
            })
            .collect::<Vec<_>>(),
    )
    .into_response()
}

async fn torrent_properties(
    State(orchestrator): State<Arc<Orchestrator>>,
    Query(query): Query<QBTorrentsHashRequest>,
) -> Response {
    let Some(ct) = find_by_hash(&orchestrator, &query.hash) else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "Torrent not found"}))).into_response();
    };

    let torrent = to_qbittorrent(&ct);
    Json(json!({
        "hash": torrent.hash,
        "save_path": torrent.save_path,
        "seeding_time": 0,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct QBTorrentsDeleteRequest {
    pub hashes: String,
}

async fn torrents_delete(
    State(orchestrator): State<Arc<Orchestrator>>,
    Form(request): Form<QBTorrentsDeleteRequest>,
) -> Response {
    let hashes: Vec<String> = request
        .hashes
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if hashes.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "No hashes provided"}))).into_response();
    }

    for hash in &hashes {
        for cache in orchestrator.caches() {
            let hit = cache
                .index
                .all()
                .values()
                .find(|ct| ct.torrent.info_hash.eq_ignore_ascii_case(hash))
                .map(|ct| ct.torrent.id.clone());

            if let Some(id) = hit {
                if let Err(e) = cache.on_remove(&id).await {
                    warn!("failed to remove torrent {} ({}): {}", id, hash, e);
                }
                break;
            }
        }
    }

    StatusCode::OK.into_response()
}

async fn add_torrent(
    orchestrator: Arc<Orchestrator>,
    magnet_uris: Vec<String>,
    category: Option<String>,
) -> Result<Response, AppError> {
    if magnet_uris.is_empty() {
        return Ok((StatusCode::BAD_REQUEST, Json(json!({"error": "No magnet URIs provided"}))).into_response());
    }

    let config = get_config();
    let Some(folder) = config.provider_for_category(category.as_deref()).map(str::to_string) else {
        return Ok((StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "no provider configured"}))).into_response());
    };

    let Some(cache) = orchestrator.cache(&folder) else {
        return Ok((StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "provider not ready"}))).into_response());
    };

    for magnet_uri in magnet_uris {
        let magnet_uri = add_trackers_to_magnet_uri(&magnet_uri);
        if parse_magnet_uri(&magnet_uri).is_none() {
            return Ok((StatusCode::BAD_REQUEST, Json(json!({"error": "Invalid magnet URI"}))).into_response());
        }

        if let Err(e) = cache.add_torrent(Submission::Magnet(magnet_uri)).await {
            warn!("failed to add torrent to {}: {}", folder, e);
            return Ok((StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))).into_response());
        }
    }

    Ok(StatusCode::OK.into_response())
}

async fn add_torrent_file(
    orchestrator: Arc<Orchestrator>,
    bytes: Vec<u8>,
    category: Option<String>,
) -> Result<Response, AppError> {
    let config = get_config();
    let Some(folder) = config.provider_for_category(category.as_deref()).map(str::to_string) else {
        return Ok((StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "no provider configured"}))).into_response());
    };

    let Some(cache) = orchestrator.cache(&folder) else {
        return Ok((StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "provider not ready"}))).into_response());
    };

    if let Err(e) = cache.add_torrent(Submission::TorrentFile(bytes)).await {
        warn!("failed to add torrent file to {}: {}", folder, e);
        return Ok((StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))).into_response());
    }

    Ok(StatusCode::OK.into_response())
}

#[derive(Debug, Deserialize)]
pub struct QBTorrentsAddRequest {
    pub urls: Option<String>,
    pub category: Option<String>,
}

async fn torrents_add_get(
    State(orchestrator): State<Arc<Orchestrator>>,
    Query(query): Query<QBTorrentsAddRequest>,
) -> Result<Response, AppError> {
    let urls = query.urls.as_deref().unwrap_or("");
    let magnet_uris: Vec<String> = urls
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    add_torrent(orchestrator, magnet_uris, query.category).await
}

async fn torrents_add_post(state: State<Arc<Orchestrator>>, parts: Parts, req: Request) -> Result<Response, AppError> {
    let content_type = parts
        .headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    match content_type.split(';').next().unwrap_or("") {
        "application/x-www-form-urlencoded" => {
            let Form(data) = Form::<QBTorrentsAddRequest>::from_request(req, &state).await?;

            let mut magnet_uris = Vec::new();
            if let Some(urls) = data.urls {
                for url in urls.split(',') {
                    let url = url.trim();
                    if !url.is_empty() {
                        magnet_uris.push(url.to_string());
                    }
                }
            }

            add_torrent(state.0, magnet_uris, data.category).await
        }
        "multipart/form-data" => {
            let mut magnet_uris = Vec::new();
            let mut torrent_files = Vec::new();
            let mut category = None;
            let mut multipart = Multipart::from_request(req, &state).await?;
            while let Some(field) = multipart.next_field().await? {
                match field.name().unwrap_or("") {
                    "category" => {
                        category = Some(field.text().await?);
                    }
                    "torrents" => {
                        let bytes = field.bytes().await?;
                        torrent_files.push(bytes.to_vec());
                    }
                    "urls" => {
                        let urls = field.text().await?;
                        for url in urls.split('\n') {
                            let url = url.trim();
                            if !url.is_empty() {
                                magnet_uris.push(url.to_string());
                            }
                        }
                    }
                    _ => {}
                }
            }

            if !magnet_uris.is_empty() {
                return add_torrent(state.0, magnet_uris, category).await;
            }

            if let Some(bytes) = torrent_files.into_iter().next() {
                return add_torrent_file(state.0, bytes, category).await;
            }

            Ok((StatusCode::BAD_REQUEST, Json(json!({"error": "No magnet URIs provided"}))).into_response())
        }
        _ => Ok((StatusCode::UNSUPPORTED_MEDIA_TYPE, Json(json!({"error": "Unsupported content type"}))).into_response()),
    }
}

#[derive(Debug, Deserialize)]
struct QBTorrentsSetCategoryRequest {
    #[allow(dead_code)]
    pub hashes: String,
    #[allow(dead_code)]
    pub category: String,
}

async fn torrents_set_category(Query(_query): Query<QBTorrentsSetCategoryRequest>) -> impl IntoResponse {
    // Categories only steer routing at submission time; nothing stored
    // per-torrent to retag, so this is a no-op ack for client compatibility.
    StatusCode::OK
}

async fn torrents_categories() -> impl IntoResponse {
    let config = get_config();
    let save_path = config.data_dir.join("downloads").to_string_lossy().into_owned();

    let mut category_map = HashMap::new();
    for category in &config.categories {
        category_map.insert(
            category.clone(),
            json!({
                "name": category,
                "savePath": save_path,
            }),
        );
    }

    Json(category_map)
}

#[derive(Debug, Deserialize)]
struct QBTorrentsCreateCategoryRequest {
    pub category: String,
}

async fn torrents_create_category(Form(request): Form<QBTorrentsCreateCategoryRequest>) -> impl IntoResponse {
    warn!(
        "Attempted to create a torrent category `{}`, you should properly configure your client or add the category manually.",
        request.category
    );

    (StatusCode::FORBIDDEN, "Torrent categories are hard coded.")
}

#[derive(Debug, Deserialize)]
struct QBTorrentsRemoveCategoryRequest {
    pub categories: String,
}

async fn torrents_remove_category(Form(request): Form<QBTorrentsRemoveCategoryRequest>) -> impl IntoResponse {
    warn!(
        "Attempted to remove torrent categories `{}`, you should properly configure your client or remove the category manually.",
        request.categories
    );
    (StatusCode::FORBIDDEN, "Torrent categories are hard coded.")
}

async fn fallback(uri: Uri, method: Method) -> impl IntoResponse {
    warn!("Missing implementation for route `{} {}`", method, uri);
    (StatusCode::NOT_FOUND, Json(json!({"error": "Route not implemented"})))
}

pub fn mimic_qbittorrent() -> Router<Arc<Orchestrator>> {
    Router::new()
        .route("/api/v2/auth/login", get(auth_login).post(auth_login))
        .route("/api/v2/app/buildinfo", get(app_buildinfo))
        .route("/api/v2/app/shutdown", get(app_shutdown))
        .route("/api/v2/app/preferences", get(app_preferences).post(app_set_preferences))
        .route("/api/v2/app/defaultSavePath", get(app_default_save_path))
        .route("/api/v2/app/webapiVersion", get(app_webapi_version))
        .route("/api/v2/app/version", get(app_version))
        .route("/api/v2/torrents/info", get(torrents_info))
        .route("/api/v2/torrents/files", get(torrents_files))
        .route("/api/v2/torrents/properties", get(torrent_properties))
        .route(
            "/api/v2/torrents/delete",
            get(torrents_delete).post(torrents_delete).delete(torrents_delete),
        )
        .route("/api/v2/torrents/add", get(torrents_add_get).post(torrents_add_post))
        .route("/api/v2/torrents/setCategory", get(torrents_set_category))
        .route("/api/v2/torrents/categories", get(torrents_categories))
        .route("/api/v2/torrents/createCategory", post(torrents_create_category))
        .route("/api/v2/torrents/removeCategory", post(torrents_remove_category))
        .route("/api/v2/{*path}", any(fallback))
}
