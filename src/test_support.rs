//! In-process portal stood up for service tests: a real HTTP surface
//! with version-tagged listings, so conditional fetches and probes are
//! exercised over the wire instead of against hand-rolled stubs.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::PortalApi;
use crate::models::listing::{DirectoryListing, FileItem, FolderItem, SortBy, SortOrder};
use crate::models::tree::TreeNode;
use crate::paths;

pub fn test_api(portal: &FakePortal) -> Arc<PortalApi> {
    Arc::new(PortalApi::new(
        portal.url(),
        Arc::new(|| Some("test-token".to_string())),
    ))
}

pub struct FakePortal {
    addr: SocketAddr,
    state: Arc<PortalState>,
    server: tokio::task::JoinHandle<()>,
}

struct DirEntry {
    subdirs: BTreeSet<String>,
    files: Vec<i64>,
    version: u64,
    created_at: String,
}

struct FileRecord {
    dir: String,
    item: FileItem,
    blob_missing: bool,
}

#[derive(Default)]
struct PortalState {
    dirs: Mutex<HashMap<String, DirEntry>>,
    records: Mutex<HashMap<i64, FileRecord>>,
    required_token: Mutex<Option<String>>,
    listing_delays: Mutex<HashMap<String, Duration>>,
    refresh_calls: Mutex<Vec<(String, bool)>>,
    fail_probes: AtomicBool,
    fail_refresh: AtomicBool,
    list_requests: AtomicUsize,
    full_list_responses: AtomicUsize,
    exists_requests: AtomicUsize,
    metadata_requests: AtomicUsize,
}

impl FakePortal {
    pub async fn spawn() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let state = Arc::new(PortalState::default());
        state.dirs.lock().unwrap().insert(String::new(), new_dir());

        let app = Router::new()
            .route("/api/file-explorer/list", get(list_directory))
            .route("/api/file-explorer/tree", get(directory_tree))
            .route("/api/file-explorer/exists", get(path_exists))
            .route("/api/file-explorer/files/:file_id/metadata", get(file_metadata))
            .route("/api/file-explorer/refresh-cache", post(refresh_cache))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake portal");
        let addr = listener.local_addr().expect("fake portal addr");
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, state, server }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn add_folder(&self, path: &str) {
        let path = paths::normalize(path);
        let mut dirs = self.state.dirs.lock().unwrap();
        ensure_dir(&mut dirs, &path);
        bump_versions(&mut dirs, &path);
    }

    pub fn add_file(&self, dir: &str, file_id: i64, name: &str) {
        let dir = paths::normalize(dir);
        {
            let mut dirs = self.state.dirs.lock().unwrap();
            ensure_dir(&mut dirs, &dir);
            if let Some(entry) = dirs.get_mut(&dir) {
                entry.files.push(file_id);
            }
            bump_versions(&mut dirs, &dir);
        }
        self.state.records.lock().unwrap().insert(
            file_id,
            FileRecord {
                dir: dir.clone(),
                item: file_item(file_id, name),
                blob_missing: false,
            },
        );
    }

    pub fn remove_file(&self, file_id: i64) {
        let record = self.state.records.lock().unwrap().remove(&file_id);
        if let Some(record) = record {
            let mut dirs = self.state.dirs.lock().unwrap();
            if let Some(entry) = dirs.get_mut(&record.dir) {
                entry.files.retain(|id| *id != file_id);
            }
            bump_versions(&mut dirs, &record.dir);
        }
    }

    pub fn remove_folder(&self, path: &str) {
        let path = paths::normalize(path);
        let orphaned_files = {
            let mut dirs = self.state.dirs.lock().unwrap();
            let prefix = format!("{path}/");
            let doomed: Vec<String> = dirs
                .keys()
                .filter(|key| **key == path || key.starts_with(&prefix))
                .cloned()
                .collect();
            let mut orphaned = Vec::new();
            for key in &doomed {
                if let Some(entry) = dirs.remove(key) {
                    orphaned.extend(entry.files);
                }
            }
            let parent = paths::parent(&path).unwrap_or_default();
            if let Some(entry) = dirs.get_mut(&parent) {
                entry.subdirs.remove(paths::display_name(&path));
            }
            bump_versions(&mut dirs, &parent);
            orphaned
        };
        let mut records = self.state.records.lock().unwrap();
        for file_id in orphaned_files {
            records.remove(&file_id);
        }
    }

    pub fn mark_blob_missing(&self, file_id: i64) {
        if let Some(record) = self.state.records.lock().unwrap().get_mut(&file_id) {
            record.blob_missing = true;
        }
    }

    pub fn require_token(&self, token: &str) {
        *self.state.required_token.lock().unwrap() = Some(token.to_string());
    }

    pub fn fail_probes(&self, fail: bool) {
        self.state.fail_probes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_refresh(&self, fail: bool) {
        self.state.fail_refresh.store(fail, Ordering::SeqCst);
    }

    pub fn delay_listing(&self, path: &str, delay: Duration) {
        self.state
            .listing_delays
            .lock()
            .unwrap()
            .insert(paths::normalize(path), delay);
    }

    pub fn list_requests(&self) -> usize {
        self.state.list_requests.load(Ordering::SeqCst)
    }

    pub fn full_list_responses(&self) -> usize {
        self.state.full_list_responses.load(Ordering::SeqCst)
    }

    pub fn exists_requests(&self) -> usize {
        self.state.exists_requests.load(Ordering::SeqCst)
    }

    pub fn metadata_requests(&self) -> usize {
        self.state.metadata_requests.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> Vec<(String, bool)> {
        self.state.refresh_calls.lock().unwrap().clone()
    }
}

impl Drop for FakePortal {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn new_dir() -> DirEntry {
    DirEntry {
        subdirs: BTreeSet::new(),
        files: Vec::new(),
        version: 1,
        created_at: Utc::now().to_rfc3339(),
    }
}

fn ensure_dir(dirs: &mut HashMap<String, DirEntry>, path: &str) {
    if path.is_empty() {
        dirs.entry(String::new()).or_insert_with(new_dir);
        return;
    }
    let mut assembled = String::new();
    for segment in path.split('/') {
        let child = if assembled.is_empty() {
            segment.to_string()
        } else {
            format!("{assembled}/{segment}")
        };
        dirs.entry(assembled.clone())
            .or_insert_with(new_dir)
            .subdirs
            .insert(segment.to_string());
        dirs.entry(child.clone()).or_insert_with(new_dir);
        assembled = child;
    }
}

fn bump_versions(dirs: &mut HashMap<String, DirEntry>, path: &str) {
    if let Some(entry) = dirs.get_mut(path) {
        entry.version += 1;
    }
    for ancestor in paths::ancestors(path) {
        if let Some(entry) = dirs.get_mut(&ancestor) {
            entry.version += 1;
        }
    }
}

fn file_item(file_id: i64, name: &str) -> FileItem {
    let extension = name.rsplit_once('.').map(|(_, ext)| ext.to_string());
    FileItem {
        id: Some(file_id),
        name: name.to_string(),
        size: Some(1024),
        extension,
        uploader_name: Some("Prof. Okafor".to_string()),
        modified_at: Some(Utc::now().to_rfc3339()),
        previewable: false,
        download_ref: Some(format!("/api/files/{file_id}/download")),
        orphaned: false,
    }
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(default)]
    path: String,
    page: Option<u32>,
    #[serde(rename = "pageSize")]
    page_size: Option<u32>,
    #[serde(rename = "sortBy")]
    sort_by: Option<String>,
    #[serde(rename = "sortOrder")]
    sort_order: Option<String>,
}

async fn list_directory(
    State(portal): State<Arc<PortalState>>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Response {
    portal.list_requests.fetch_add(1, Ordering::SeqCst);
    if let Some(denied) = check_token(&portal, &headers) {
        return denied;
    }

    let path = paths::normalize(&params.path);
    let delay = portal.listing_delays.lock().unwrap().get(&path).copied();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let page = params.page.unwrap_or(1).max(1);
    let page_size = params.page_size.unwrap_or(50).clamp(1, 100);
    let sort_by = params
        .sort_by
        .as_deref()
        .and_then(|value| SortBy::from_str(value).ok())
        .unwrap_or(SortBy::Name);
    let sort_order = params
        .sort_order
        .as_deref()
        .and_then(|value| SortOrder::from_str(value).ok())
        .unwrap_or(SortOrder::Asc);

    let (listing, version) = {
        let dirs = portal.dirs.lock().unwrap();
        let entry = match dirs.get(&path) {
            Some(entry) => entry,
            None => return not_found("Path not found"),
        };
        let version = entry.version;
        let records = portal.records.lock().unwrap();
        (
            build_listing(&dirs, &records, &path, page, page_size, sort_by, sort_order),
            version,
        )
    };

    let tag = format!("\"{path}|v{version}|p{page}|n{page_size}|{sort_by}|{sort_order}\"");
    if headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        == Some(tag.as_str())
    {
        return StatusCode::NOT_MODIFIED.into_response();
    }

    portal.full_list_responses.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::OK,
        [(header::ETAG, tag)],
        Json(success_body("Directory listing retrieved", listing)),
    )
        .into_response()
}

fn build_listing(
    dirs: &HashMap<String, DirEntry>,
    records: &HashMap<i64, FileRecord>,
    path: &str,
    page: u32,
    page_size: u32,
    sort_by: SortBy,
    sort_order: SortOrder,
) -> DirectoryListing {
    let entry = &dirs[path];
    let mut folders: Vec<FolderItem> = entry
        .subdirs
        .iter()
        .map(|name| {
            let child_path = if path.is_empty() {
                name.clone()
            } else {
                format!("{path}/{name}")
            };
            let child = dirs.get(&child_path);
            FolderItem {
                path: child_path,
                name: name.clone(),
                item_count: child.map(|c| (c.subdirs.len() + c.files.len()) as i64),
                modified_at: child.map(|c| c.created_at.clone()),
                folder_type: Some("CUSTOM".to_string()),
                is_own_folder: false,
            }
        })
        .collect();
    if sort_by == SortBy::Name && sort_order == SortOrder::Desc {
        folders.reverse();
    }

    let mut files: Vec<FileItem> = entry
        .files
        .iter()
        .filter_map(|id| records.get(id).map(|record| record.item.clone()))
        .collect();
    files.sort_by(|a, b| {
        let ordering = match sort_by {
            SortBy::Name => a.name.cmp(&b.name),
            SortBy::Size => a.size.cmp(&b.size),
            SortBy::ModifiedAt => a.modified_at.cmp(&b.modified_at),
        };
        match sort_order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    });

    let total_items = (folders.len() + files.len()) as u64;
    let total_pages = ((total_items + page_size as u64 - 1) / page_size as u64).max(1) as u32;
    let offset = ((page - 1) * page_size) as usize;
    let span = page_size as usize;

    // Folders page before files, matching the real backend's layout.
    let paged_folders: Vec<FolderItem> = folders.iter().skip(offset).take(span).cloned().collect();
    let consumed = paged_folders.len();
    let file_offset = offset.saturating_sub(folders.len());
    let paged_files: Vec<FileItem> = files
        .iter()
        .skip(file_offset)
        .take(span - consumed)
        .cloned()
        .collect();

    DirectoryListing {
        path: path.to_string(),
        parent_path: paths::parent(path),
        page,
        page_size,
        sort_by,
        sort_order,
        folders: paged_folders,
        files: paged_files,
        total_items,
        total_pages,
        has_more: offset + span < total_items as usize,
    }
}

#[derive(Deserialize)]
struct TreeParams {
    #[serde(default)]
    path: String,
    depth: Option<u8>,
}

async fn directory_tree(
    State(portal): State<Arc<PortalState>>,
    headers: HeaderMap,
    Query(params): Query<TreeParams>,
) -> Response {
    if let Some(denied) = check_token(&portal, &headers) {
        return denied;
    }

    let path = paths::normalize(&params.path);
    let depth = params.depth.unwrap_or(1).min(3);
    let dirs = portal.dirs.lock().unwrap();
    if !dirs.contains_key(&path) {
        return not_found("Path not found");
    }
    let version = dirs[&path].version;
    let tag = format!("\"tree|{path}|v{version}|d{depth}\"");
    if headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        == Some(tag.as_str())
    {
        return StatusCode::NOT_MODIFIED.into_response();
    }

    let node = build_tree(&dirs, &path, depth);
    (
        StatusCode::OK,
        [(header::ETAG, tag)],
        Json(success_body("Directory tree retrieved", node)),
    )
        .into_response()
}

fn build_tree(dirs: &HashMap<String, DirEntry>, path: &str, depth: u8) -> TreeNode {
    let entry = &dirs[path];
    let children = if depth == 0 {
        None
    } else {
        Some(
            entry
                .subdirs
                .iter()
                .map(|name| {
                    let child_path = if path.is_empty() {
                        name.clone()
                    } else {
                        format!("{path}/{name}")
                    };
                    build_tree(dirs, &child_path, depth - 1)
                })
                .collect(),
        )
    };
    TreeNode {
        path: path.to_string(),
        name: if path.is_empty() {
            "Uploads".to_string()
        } else {
            paths::display_name(path).to_string()
        },
        has_children: !entry.subdirs.is_empty(),
        children,
        expanded: false,
    }
}

#[derive(Deserialize)]
struct ExistsParams {
    #[serde(default)]
    path: String,
}

async fn path_exists(
    State(portal): State<Arc<PortalState>>,
    headers: HeaderMap,
    Query(params): Query<ExistsParams>,
) -> Response {
    portal.exists_requests.fetch_add(1, Ordering::SeqCst);
    if let Some(denied) = check_token(&portal, &headers) {
        return denied;
    }
    if portal.fail_probes.load(Ordering::SeqCst) {
        return server_error("probe backend unavailable");
    }
    let path = paths::normalize(&params.path);
    if portal.dirs.lock().unwrap().contains_key(&path) {
        (
            StatusCode::OK,
            Json(success_body("Path exists", true)),
        )
            .into_response()
    } else {
        not_found("Path not found")
    }
}

async fn file_metadata(
    State(portal): State<Arc<PortalState>>,
    headers: HeaderMap,
    UrlPath(file_id): UrlPath<i64>,
) -> Response {
    portal.metadata_requests.fetch_add(1, Ordering::SeqCst);
    if let Some(denied) = check_token(&portal, &headers) {
        return denied;
    }
    if portal.fail_probes.load(Ordering::SeqCst) {
        return server_error("probe backend unavailable");
    }
    let records = portal.records.lock().unwrap();
    match records.get(&file_id) {
        Some(record) => (
            StatusCode::OK,
            Json(success_body(
                "File metadata retrieved",
                json!({ "file": record.item, "blobMissing": record.blob_missing }),
            )),
        )
            .into_response(),
        None => not_found("File not found"),
    }
}

#[derive(Deserialize)]
struct RefreshParams {
    #[serde(default)]
    path: String,
    #[serde(default)]
    recursive: bool,
}

async fn refresh_cache(
    State(portal): State<Arc<PortalState>>,
    headers: HeaderMap,
    Query(params): Query<RefreshParams>,
) -> Response {
    if let Some(denied) = check_token(&portal, &headers) {
        return denied;
    }
    if portal.fail_refresh.load(Ordering::SeqCst) {
        return server_error("cache backend unavailable");
    }
    portal
        .refresh_calls
        .lock()
        .unwrap()
        .push((paths::normalize(&params.path), params.recursive));
    (
        StatusCode::OK,
        Json(success_body("Cache refreshed", true)),
    )
        .into_response()
}

fn check_token(portal: &PortalState, headers: &HeaderMap) -> Option<Response> {
    let required = portal.required_token.lock().unwrap().clone()?;
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if presented == Some(format!("Bearer {required}").as_str()) {
        None
    } else {
        Some(
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "success": false,
                    "message": "Authentication required",
                    "data": null,
                })),
            )
                .into_response(),
        )
    }
}

fn success_body<T: serde::Serialize>(message: &str, data: T) -> Value {
    json!({ "success": true, "message": message, "data": data })
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "success": false, "message": message, "data": null })),
    )
        .into_response()
}

fn server_error(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "message": message, "data": null })),
    )
        .into_response()
}
