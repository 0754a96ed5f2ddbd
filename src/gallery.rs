// The gallery server: the other end of the upload client.
//
// Uploaded images land in one flat directory under a timestamp name. The index page lists
// them newest first, and two JSON endpoints delete them again. Filenames coming back from
// clients are only ever used as bare names inside that directory.

use std::{
    collections::{BTreeMap, HashSet},
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        multipart::MultipartRejection,
        rejection::{FormRejection, JsonRejection},
        DefaultBodyLimit, Form, Multipart, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tower_http::services::ServeDir;

use crate::config::GalleryConfig;

const ALLOWED_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".bmp", ".webp"];
const SESSION_COOKIE: &str = "session";
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct GalleryState {
    inner: Arc<GalleryInner>,
}

struct GalleryInner {
    uploads_dir: PathBuf,
    per_page: usize,
    token: Option<String>,
    sessions: Mutex<HashSet<String>>,
}

impl GalleryState {
    /// Without a token, login always succeeds and nothing needs a session.
    pub fn new(uploads_dir: PathBuf, per_page: usize, token: Option<String>) -> Self {
        Self {
            inner: Arc::new(GalleryInner {
                uploads_dir,
                per_page: per_page.max(1),
                token,
                sessions: Mutex::new(HashSet::new()),
            }),
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        if self.inner.token.is_none() {
            return true;
        }
        let Some(session) = session_cookie(headers) else {
            return false;
        };
        self.inner
            .sessions
            .lock()
            .map(|sessions| sessions.contains(&session))
            .unwrap_or(false)
    }

    fn require_session(&self, headers: &HeaderMap) -> Result<(), AppError> {
        if self.authorized(headers) {
            Ok(())
        } else {
            Err(AppError::Unauthorized("Not logged in".to_string()))
        }
    }
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

/// Everything after the last dot, dot included, or "" if there is none.
fn extension(name: &str) -> &str {
    name.rfind('.').map(|i| &name[i..]).unwrap_or("")
}

pub fn is_allowed_image(name: &str) -> bool {
    let ext = extension(name).to_ascii_lowercase();
    ALLOWED_EXTENSIONS.contains(&ext.as_str())
}

/// Maps a client-supplied name to a file directly inside `dir`, or `None` if the name could
/// point anywhere else or isn't an image.
pub fn safe_upload_path(dir: &Path, filename: &str) -> Option<PathBuf> {
    if filename.is_empty() || filename.contains(['/', '\\']) {
        return None;
    }
    // Rejects "." and "..", which have no file name component.
    if Path::new(filename).file_name().and_then(|n| n.to_str()) != Some(filename) {
        return None;
    }
    if !is_allowed_image(filename) {
        return None;
    }
    Some(dir.join(filename))
}

pub fn format_file_size(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let (mut div, mut exp) = (UNIT, 0);
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let unit = "KMGTPE".as_bytes()[exp] as char;
    format!("{:.2} {}B", bytes as f64 / div as f64, unit)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub name: String,
    pub size: u64,
    pub modified: SystemTime,
}

impl ImageInfo {
    pub fn url(&self) -> String {
        format!("/uploads/{}", self.name)
    }
}

/// Image files directly inside `dir`, newest first.
pub fn list_images(dir: &Path) -> Result<Vec<ImageInfo>> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !is_allowed_image(&name) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.is_dir() {
            continue;
        }
        images.push(ImageInfo {
            name,
            size: metadata.len(),
            modified: metadata.modified().unwrap_or(UNIX_EPOCH),
        });
    }
    images.sort_by(|a, b| b.modified.cmp(&a.modified));
    Ok(images)
}

#[derive(Debug, PartialEq, Eq)]
pub struct GalleryPage {
    pub images: Vec<ImageInfo>,
    pub current_page: usize,
    pub total_pages: usize,
}

/// Cuts one page out of `images`. Out-of-range pages are clamped; there is always a page 1.
pub fn paginate(images: Vec<ImageInfo>, page: usize, per_page: usize) -> GalleryPage {
    let per_page = per_page.max(1);
    let total = images.len();
    let total_pages = total.div_ceil(per_page).max(1);
    let current_page = page.clamp(1, total_pages);
    let images = images
        .into_iter()
        .skip((current_page - 1) * per_page)
        .take(per_page)
        .collect();
    GalleryPage { images, current_page, total_pages }
}

/// `?page=` as sent by a browser. Anything unparsable or below 1 means page 1.
fn requested_page(raw: Option<&str>) -> usize {
    raw.and_then(|p| p.trim().parse::<i64>().ok())
        .filter(|&p| p >= 1)
        .map(|p| usize::try_from(p).unwrap_or(usize::MAX))
        .unwrap_or(1)
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

const PAGE_HEAD: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Gallery</title>
<style>
body { font-family: sans-serif; margin: 2em; }
.grid { display: grid; grid-template-columns: repeat(auto-fill, minmax(220px, 1fr)); gap: 1em; }
figure { margin: 0; }
figure img { width: 100%; height: 220px; object-fit: cover; }
figcaption { font-size: 0.8em; color: #555; }
nav a, nav span { margin-right: 0.5em; }
</style>
<script>
async function deleteImage(name) {
  if (!confirm("Delete " + name + "?")) return;
  const res = await fetch("/api/v1/delete", {
    method: "POST",
    headers: { "Content-Type": "application/json" },
    body: JSON.stringify({ filename: name }),
  });
  if (res.ok) location.reload(); else alert((await res.json()).error);
}
</script>
</head>
<body>
<h1>Gallery</h1>
"#;

const PAGE_TAIL: &str = "</body>\n</html>\n";

fn render_index(page: &GalleryPage) -> String {
    let mut html = String::from(PAGE_HEAD);
    if page.images.is_empty() {
        html.push_str("<p>No images yet.</p>\n");
    }
    html.push_str("<div class=\"grid\">\n");
    for image in &page.images {
        let name = escape_html(&image.name);
        let url = escape_html(&image.url());
        let created = DateTime::<Local>::from(image.modified).format("%Y-%m-%d %H:%M:%S");
        html.push_str(&format!(
            "<figure><a href=\"{url}\"><img src=\"{url}\" alt=\"{name}\" loading=\"lazy\"></a>\
             <figcaption>{name}<br>{size} &middot; {created} \
             <button onclick=\"deleteImage('{name}')\">Delete</button></figcaption></figure>\n",
            size = format_file_size(image.size),
        ));
    }
    html.push_str("</div>\n<nav>\n");
    if page.current_page > 1 {
        html.push_str(&format!("<a href=\"/?page={}\">&laquo; Prev</a>\n", page.current_page - 1));
    }
    for n in 1..=page.total_pages {
        if n == page.current_page {
            html.push_str(&format!("<span>{n}</span>\n"));
        } else {
            html.push_str(&format!("<a href=\"/?page={n}\">{n}</a>\n"));
        }
    }
    if page.current_page < page.total_pages {
        html.push_str(&format!("<a href=\"/?page={}\">Next &raquo;</a>\n", page.current_page + 1));
    }
    html.push_str(&format!(
        "</nav>\n<p>Page {} of {}</p>\n",
        page.current_page, page.total_pages
    ));
    html.push_str(PAGE_TAIL);
    html
}

pub fn router(state: GalleryState) -> Router {
    let uploads = ServeDir::new(&state.inner.uploads_dir);
    Router::new()
        .route("/", get(index))
        .route("/login", post(login))
        .route("/api/v1/upload", post(upload_image))
        .route("/api/v1/delete", post(delete_image))
        .route("/api/v1/delete-batch", post(delete_batch))
        .nest_service("/uploads", uploads)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Runs the gallery until the process is killed.
pub async fn serve(config: &GalleryConfig, token: Option<String>) -> Result<()> {
    std::fs::create_dir_all(&config.uploads_dir)
        .with_context(|| format!("failed to create {}", config.uploads_dir))?;
    if token.is_none() {
        warn!("No gallery token configured; anyone can upload and delete");
    }
    let state = GalleryState::new(PathBuf::from(&config.uploads_dir), config.per_page, token);
    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!("Gallery listening on {}, serving {}", listener.local_addr()?, config.uploads_dir);
    axum::serve(listener, router(state)).await.context("gallery server failed")
}

#[derive(Deserialize)]
struct PageQuery {
    page: Option<String>,
}

async fn index(State(state): State<GalleryState>, Query(query): Query<PageQuery>) -> Response {
    let page = requested_page(query.page.as_deref());
    let dir = state.inner.uploads_dir.clone();
    let listed = tokio::task::spawn_blocking(move || list_images(&dir)).await;
    match listed {
        Ok(Ok(images)) => {
            debug!("Listing page {} of {} images", page, images.len());
            Html(render_index(&paginate(images, page, state.inner.per_page))).into_response()
        }
        Ok(Err(e)) => {
            error!("Failed to load images: {:#}", e);
            let html = format!("{PAGE_HEAD}<p class=\"error\">Failed to load images</p>\n{PAGE_TAIL}");
            (StatusCode::INTERNAL_SERVER_ERROR, Html(html)).into_response()
        }
        Err(e) => {
            error!("Image listing task failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Html("Failed to load images")).into_response()
        }
    }
}

#[derive(Deserialize)]
struct LoginForm {
    #[serde(default)]
    token: String,
}

async fn login(
    State(state): State<GalleryState>,
    form: Result<Form<LoginForm>, FormRejection>,
) -> Result<Response, AppError> {
    let Ok(Form(form)) = form else {
        return Err(AppError::BadRequest("Invalid login form".to_string()));
    };
    if let Some(expected) = &state.inner.token {
        if form.token.trim() != expected {
            warn!("Rejected login with a bad token");
            return Err(AppError::Unauthorized("Invalid token".to_string()));
        }
    }
    let session = format!("{:032x}", rand::random::<u128>());
    state
        .inner
        .sessions
        .lock()
        .map_err(|_| AppError::Internal("session store poisoned".to_string()))?
        .insert(session.clone());
    let cookie = format!("{SESSION_COOKIE}={session}; Path=/; HttpOnly");
    Ok(([(header::SET_COOKIE, cookie)], Json(MessageResponse::new("Logged in"))).into_response())
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl MessageResponse {
    fn new(message: &str) -> Self {
        Self { message: message.to_string(), filename: None }
    }

    fn with_filename(message: &str, filename: String) -> Self {
        Self { message: message.to_string(), filename: Some(filename) }
    }
}

/// Keeps the uploaded name's extension if it looks like one.
fn upload_extension(original: Option<&str>) -> String {
    let ext = original.map(extension).unwrap_or("");
    if ext.len() > 1 && ext[1..].chars().all(|c| c.is_ascii_alphanumeric()) {
        ext.to_string()
    } else {
        String::new()
    }
}

/// Writes `data` under a fresh `<unix nanos><ext>` name and returns that name.
fn store_upload(dir: &Path, ext: &str, data: &[u8]) -> io::Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    // Two uploads within the same nanosecond get neighbouring names instead of clobbering.
    for bump in 0..16 {
        let name = format!("{}{}", nanos + bump, ext);
        let file = std::fs::OpenOptions::new().write(true).create_new(true).open(dir.join(&name));
        match file {
            Ok(mut file) => {
                io::Write::write_all(&mut file, data)?;
                return Ok(name);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(io::ErrorKind::AlreadyExists, "no free upload name"))
}

async fn upload_image(
    State(state): State<GalleryState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<MessageResponse>, AppError> {
    state.require_session(&headers)?;
    let no_image = || AppError::BadRequest("No image is received".to_string());
    let mut multipart = multipart.map_err(|_| no_image())?;

    let (ext, data): (String, Bytes) = loop {
        let Some(field) = multipart.next_field().await.map_err(|_| no_image())? else {
            return Err(no_image());
        };
        if field.name() != Some("image") {
            continue;
        }
        let ext = upload_extension(field.file_name());
        let data = field.bytes().await.map_err(|_| no_image())?;
        break (ext, data);
    };

    let dir = state.inner.uploads_dir.clone();
    let size = data.len();
    let stored = tokio::task::spawn_blocking(move || store_upload(&dir, &ext, &data)).await;
    let filename = match stored {
        Ok(Ok(filename)) => filename,
        Ok(Err(e)) => {
            error!("Unable to save upload: {}", e);
            return Err(AppError::Internal("Unable to save the image".to_string()));
        }
        Err(e) => {
            error!("Upload task failed: {}", e);
            return Err(AppError::Internal("Unable to save the image".to_string()));
        }
    };
    info!("Stored {} ({})", filename, format_file_size(size as u64));
    Ok(Json(MessageResponse::with_filename("Image uploaded successfully", filename)))
}

#[derive(Deserialize)]
struct DeleteRequest {
    #[serde(default)]
    filename: String,
}

#[derive(Debug)]
enum DeleteFailure {
    InvalidName,
    NotFound,
    Failed,
}

impl DeleteFailure {
    fn reason(&self) -> &'static str {
        match self {
            DeleteFailure::InvalidName => "invalid filename",
            DeleteFailure::NotFound => "not found",
            DeleteFailure::Failed => "delete failed",
        }
    }
}

async fn remove_upload(dir: &Path, filename: &str) -> Result<(), DeleteFailure> {
    let path = safe_upload_path(dir, filename).ok_or(DeleteFailure::InvalidName)?;
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {
            info!("Deleted {}", filename);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(DeleteFailure::NotFound),
        Err(e) => {
            error!("Failed to delete {}: {}", path.display(), e);
            Err(DeleteFailure::Failed)
        }
    }
}

async fn delete_image(
    State(state): State<GalleryState>,
    headers: HeaderMap,
    body: Result<Json<DeleteRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, AppError> {
    state.require_session(&headers)?;
    let Ok(Json(body)) = body else {
        return Err(AppError::BadRequest("Invalid request body".to_string()));
    };
    match remove_upload(&state.inner.uploads_dir, &body.filename).await {
        Ok(()) => Ok(Json(MessageResponse::with_filename("Image deleted successfully", body.filename))),
        Err(DeleteFailure::InvalidName) => {
            warn!("Refusing to delete {:?}", body.filename);
            Err(AppError::BadRequest("Invalid filename".to_string()))
        }
        Err(DeleteFailure::NotFound) => Err(AppError::NotFound("File not found".to_string())),
        Err(DeleteFailure::Failed) => Err(AppError::Internal("Failed to delete file".to_string())),
    }
}

#[derive(Deserialize)]
struct DeleteBatchRequest {
    #[serde(default)]
    filenames: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteBatchResponse {
    pub deleted: Vec<String>,
    pub failed: BTreeMap<String, String>,
}

async fn delete_batch(
    State(state): State<GalleryState>,
    headers: HeaderMap,
    body: Result<Json<DeleteBatchRequest>, JsonRejection>,
) -> Result<Json<DeleteBatchResponse>, AppError> {
    state.require_session(&headers)?;
    let Ok(Json(body)) = body else {
        return Err(AppError::BadRequest("Invalid request body".to_string()));
    };
    if body.filenames.is_empty() {
        return Err(AppError::BadRequest("No filenames provided".to_string()));
    }

    let mut response = DeleteBatchResponse {
        deleted: Vec::with_capacity(body.filenames.len()),
        failed: BTreeMap::new(),
    };
    for name in body.filenames {
        match remove_upload(&state.inner.uploads_dir, &name).await {
            Ok(()) => response.deleted.push(name),
            Err(failure) => {
                response.failed.insert(name, failure.reason().to_string());
            }
        }
    }
    info!("Batch delete: {} deleted, {} failed", response.deleted.len(), response.failed.len());
    Ok(Json(response))
}
