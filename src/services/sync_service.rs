//! Poll-based liveness reconciliation. While a view is on screen, the
//! portal is probed on an interval for folders and file records that
//! another actor deleted out from under the client.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::api::PortalApi;
use crate::models::listing::FileItem;
use crate::paths;

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// What the hosting view is currently showing. Queried at the start of
/// every pass so the loop always reconciles the live screen, not the
/// one from thirty seconds ago.
#[derive(Debug, Clone, Default)]
pub struct ViewSnapshot {
    pub path: Option<String>,
    pub files: Vec<FileItem>,
}

pub type ViewSource = Arc<dyn Fn() -> ViewSnapshot + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Folder,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NavigationReason {
    Deleted,
}

/// User-facing wording for a deletion, emitted alongside the structural
/// events so every surface shows the same text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionNotice {
    pub title: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "event")]
pub enum SyncEvent {
    PathDeleted {
        path: String,
        item_type: ItemType,
    },
    FilesDeleted {
        files: Vec<FileItem>,
    },
    FilesRemoved {
        files: Vec<FileItem>,
    },
    NavigationRequested {
        path: String,
        reason: NavigationReason,
        deleted_path: String,
    },
    Notice(DeletionNotice),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DeletedId {
    Path(String),
    File(i64),
}

type Callback = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

struct Listener {
    id: u64,
    callback: Callback,
}

struct SyncShared {
    deleted: Mutex<HashSet<DeletedId>>,
    listeners: Mutex<Vec<Listener>>,
    next_listener_id: AtomicU64,
    last_sync_at: Mutex<Option<DateTime<Utc>>>,
}

#[derive(Clone)]
struct SyncContext {
    api: Arc<PortalApi>,
    view_source: ViewSource,
    shared: Arc<SyncShared>,
}

pub struct SyncService {
    context: SyncContext,
    visible: watch::Sender<bool>,
    runner: Mutex<Option<CancellationToken>>,
}

impl SyncService {
    pub fn new(api: Arc<PortalApi>, view_source: ViewSource) -> Self {
        let (visible, _) = watch::channel(true);
        Self {
            context: SyncContext {
                api,
                view_source,
                shared: Arc::new(SyncShared {
                    deleted: Mutex::new(HashSet::new()),
                    listeners: Mutex::new(Vec::new()),
                    next_listener_id: AtomicU64::new(1),
                    last_sync_at: Mutex::new(None),
                }),
            },
            visible,
            runner: Mutex::new(None),
        }
    }

    /// Spawn the polling loop on the current tokio runtime. Calling
    /// `start` while already running is a no-op.
    pub fn start(&self, interval: Duration) {
        let mut runner = self.runner.lock().unwrap();
        if runner.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        tokio::spawn(run_loop(
            self.context.clone(),
            self.visible.subscribe(),
            cancel.clone(),
            interval,
        ));
        *runner = Some(cancel);
        log::info!("liveness sync started (interval {interval:?})");
    }

    /// Halt future passes. Coarse: a pass already underway finishes and
    /// may still emit events.
    pub fn stop(&self) {
        if let Some(cancel) = self.runner.lock().unwrap().take() {
            cancel.cancel();
            log::info!("liveness sync stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.runner.lock().unwrap().is_some()
    }

    /// Gate the loop on view visibility. Hidden stops the timer
    /// entirely; becoming visible again runs one immediate pass and
    /// then resumes the regular cadence.
    pub fn set_visible(&self, visible: bool) {
        self.visible.send_if_modified(|current| {
            if *current == visible {
                false
            } else {
                *current = visible;
                true
            }
        });
    }

    pub fn subscribe<F>(&self, callback: F) -> SyncSubscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = self
            .context
            .shared
            .next_listener_id
            .fetch_add(1, Ordering::SeqCst);
        self.context.shared.listeners.lock().unwrap().push(Listener {
            id,
            callback: Arc::new(callback),
        });
        SyncSubscription {
            shared: Arc::downgrade(&self.context.shared),
            id,
        }
    }

    /// Run one reconciliation pass right now. No-op unless started.
    pub async fn revalidate_now(&self) {
        if !self.is_running() {
            return;
        }
        perform_sync(&self.context).await;
    }

    /// Probe a single file record, for callers about to act on one file
    /// rather than the whole view. Fails open on transport errors.
    pub async fn validate_file(&self, file_id: i64) -> bool {
        match self.context.api.file_record_exists(file_id).await {
            Ok(true) => true,
            Ok(false) => {
                handle_deleted_files(&self.context.shared, vec![placeholder_file(file_id)]);
                false
            }
            Err(e) => {
                log::warn!("file record probe failed for {file_id}, assuming it exists: {e}");
                true
            }
        }
    }

    pub fn is_path_deleted(&self, path: &str) -> bool {
        self.context
            .shared
            .deleted
            .lock()
            .unwrap()
            .contains(&DeletedId::Path(paths::normalize(path)))
    }

    pub fn is_file_deleted(&self, file_id: i64) -> bool {
        self.context
            .shared
            .deleted
            .lock()
            .unwrap()
            .contains(&DeletedId::File(file_id))
    }

    /// Forget every deletion mark, e.g. when the hosting view switches
    /// to a different account or root.
    pub fn clear_deleted(&self) {
        self.context.shared.deleted.lock().unwrap().clear();
    }

    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        *self.context.shared.last_sync_at.lock().unwrap()
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        if let Ok(mut runner) = self.runner.lock() {
            if let Some(cancel) = runner.take() {
                cancel.cancel();
            }
        }
    }
}

/// Removing a listener happens by dropping this handle (or calling
/// `unsubscribe`, which reads better at call sites).
pub struct SyncSubscription {
    shared: Weak<SyncShared>,
    id: u64,
}

impl SyncSubscription {
    pub fn unsubscribe(self) {
        drop(self)
    }
}

impl Drop for SyncSubscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            if let Ok(mut listeners) = shared.listeners.lock() {
                listeners.retain(|listener| listener.id != self.id);
            }
        }
    }
}

async fn run_loop(
    context: SyncContext,
    mut visibility: watch::Receiver<bool>,
    cancel: CancellationToken,
    interval: Duration,
) {
    let mut run_now = false;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        if !*visibility.borrow_and_update() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = visibility.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if *visibility.borrow() {
                        run_now = true;
                    }
                }
            }
            continue;
        }
        if run_now {
            run_now = false;
            perform_sync(&context).await;
            continue;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {
                perform_sync(&context).await;
            }
            changed = visibility.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

/// One reconciliation pass: probe the viewed folder, then each visible
/// file record. Probes run sequentially so a pass never floods the
/// portal. Transport errors fail open; only an authoritative 404 marks
/// anything deleted.
async fn perform_sync(context: &SyncContext) {
    let snapshot = (context.view_source)();
    let path = snapshot
        .path
        .as_deref()
        .map(paths::normalize)
        .unwrap_or_default();
    if path.is_empty() && snapshot.files.is_empty() {
        return;
    }

    if !path.is_empty() {
        match context.api.folder_exists(&path).await {
            Ok(true) => {}
            Ok(false) => handle_deleted_path(&context.shared, &path),
            Err(e) => {
                log::warn!("path probe failed for {path:?}, assuming it still exists: {e}");
            }
        }
    }

    let mut confirmed_deleted = Vec::new();
    for file in &snapshot.files {
        let file_id = match file.id {
            Some(id) => id,
            None => continue,
        };
        match context.api.file_record_exists(file_id).await {
            Ok(true) => {}
            Ok(false) => confirmed_deleted.push(file.clone()),
            Err(e) => {
                log::warn!("file record probe failed for {file_id}, assuming it still exists: {e}");
            }
        }
    }
    if !confirmed_deleted.is_empty() {
        handle_deleted_files(&context.shared, confirmed_deleted);
    }

    *context.shared.last_sync_at.lock().unwrap() = Some(Utc::now());
}

fn handle_deleted_path(shared: &SyncShared, path: &str) {
    let newly_marked = shared
        .deleted
        .lock()
        .unwrap()
        .insert(DeletedId::Path(path.to_string()));
    if !newly_marked {
        return;
    }
    log::info!("folder removed by another actor: {path:?}");
    notify(
        shared,
        &SyncEvent::PathDeleted {
            path: path.to_string(),
            item_type: ItemType::Folder,
        },
    );
    notify(
        shared,
        &SyncEvent::Notice(folder_deleted_notice(paths::display_name(path))),
    );

    // Send the user to the parent, unless the parent is already known
    // to be gone too, in which case the root is the only safe place.
    let parent = paths::parent(path).unwrap_or_default();
    let parent_gone = shared
        .deleted
        .lock()
        .unwrap()
        .contains(&DeletedId::Path(parent.clone()));
    notify(
        shared,
        &SyncEvent::NavigationRequested {
            path: if parent_gone { String::new() } else { parent },
            reason: NavigationReason::Deleted,
            deleted_path: path.to_string(),
        },
    );
}

fn handle_deleted_files(shared: &SyncShared, files: Vec<FileItem>) {
    let newly_marked: Vec<FileItem> = {
        let mut deleted = shared.deleted.lock().unwrap();
        files
            .into_iter()
            .filter(|file| match file.id {
                Some(id) => deleted.insert(DeletedId::File(id)),
                None => false,
            })
            .collect()
    };
    if newly_marked.is_empty() {
        return;
    }
    log::info!("{} file record(s) removed by another actor", newly_marked.len());
    notify(
        shared,
        &SyncEvent::FilesDeleted {
            files: newly_marked.clone(),
        },
    );
    let notice = if newly_marked.len() == 1 {
        file_deleted_notice(&newly_marked[0].name)
    } else {
        files_deleted_notice(newly_marked.len())
    };
    notify(shared, &SyncEvent::Notice(notice));
    notify(
        shared,
        &SyncEvent::FilesRemoved {
            files: newly_marked,
        },
    );
}

fn notify(shared: &SyncShared, event: &SyncEvent) {
    let callbacks: Vec<Callback> = shared
        .listeners
        .lock()
        .unwrap()
        .iter()
        .map(|listener| listener.callback.clone())
        .collect();
    for callback in callbacks {
        // One failing subscriber must not starve the rest.
        if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
            log::error!("sync listener panicked while handling {event:?}");
        }
    }
}

fn file_deleted_notice(name: &str) -> DeletionNotice {
    DeletionNotice {
        title: "File Deleted by Administrator".to_string(),
        message: format!(
            "\"{name}\" has been deleted from the system and is no longer available."
        ),
    }
}

fn files_deleted_notice(count: usize) -> DeletionNotice {
    DeletionNotice {
        title: "Files Deleted by Administrator".to_string(),
        message: format!(
            "{count} files have been deleted from the system and are no longer available."
        ),
    }
}

fn folder_deleted_notice(name: &str) -> DeletionNotice {
    DeletionNotice {
        title: "Folder Deleted by Administrator".to_string(),
        message: format!(
            "\"{name}\" has been deleted from the system. Redirecting to available folder."
        ),
    }
}

fn placeholder_file(file_id: i64) -> FileItem {
    FileItem {
        id: Some(file_id),
        name: "File".to_string(),
        size: None,
        extension: None,
        uploader_name: None,
        modified_at: None,
        previewable: false,
        download_ref: None,
        orphaned: false,
    }
}
