//! Directory browsing over the portal API, with conditional fetches
//! driven by opaque version tags.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::api::{Conditional, PortalApi};
use crate::error::ExplorerError;
use crate::models::listing::{DirectoryListing, ListingQuery, SortBy, SortOrder};
use crate::models::tree::TreeNode;
use crate::paths;

#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub page_size: u32,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            page_size: 50,
            sort_by: SortBy::Name,
            sort_order: SortOrder::Asc,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    pub page: u32,
    pub force_refresh: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            page: 1,
            force_refresh: false,
        }
    }
}

impl LoadOptions {
    pub fn page(page: u32) -> Self {
        Self {
            page,
            ..Self::default()
        }
    }

    pub fn forced() -> Self {
        Self {
            force_refresh: true,
            ..Self::default()
        }
    }
}

/// How a directory load resolved.
///
/// `Unchanged` means the server confirmed our cached copy is still
/// current and the listing carried here was re-rendered from cache.
/// `Superseded` means another navigation started while this one was in
/// flight; its response was cached but the view was left alone.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded(DirectoryListing),
    Unchanged(DirectoryListing),
    Superseded,
}

impl LoadOutcome {
    pub fn listing(&self) -> Option<&DirectoryListing> {
        match self {
            LoadOutcome::Loaded(listing) | LoadOutcome::Unchanged(listing) => Some(listing),
            LoadOutcome::Superseded => None,
        }
    }

    pub fn not_modified(&self) -> bool {
        matches!(self, LoadOutcome::Unchanged(_))
    }
}

/// Cache key for one rendered page. Any change to path, page, or sort
/// addresses a different server response, so each combination gets its
/// own version tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ListingKey {
    path: String,
    page: u32,
    sort_by: SortBy,
    sort_order: SortOrder,
}

impl ListingKey {
    fn for_query(query: &ListingQuery) -> Self {
        Self {
            path: query.path.clone(),
            page: query.page,
            sort_by: query.sort_by,
            sort_order: query.sort_order,
        }
    }
}

/// Tag and body are kept together: a not-modified answer must be able
/// to re-render the page even when the view has since moved elsewhere.
struct CachedListing {
    tag: String,
    listing: DirectoryListing,
}

struct BrowserState {
    current_path: String,
    current_page: u32,
    current_listing: Option<DirectoryListing>,
    sort_by: SortBy,
    sort_order: SortOrder,
    listing_cache: HashMap<ListingKey, CachedListing>,
    tree_tags: HashMap<String, String>,
    expanded_nodes: HashSet<String>,
}

pub struct DirectoryBrowser {
    api: Arc<PortalApi>,
    page_size: u32,
    state: Mutex<BrowserState>,
    generation: AtomicU64,
}

impl DirectoryBrowser {
    pub fn new(api: Arc<PortalApi>, options: BrowserOptions) -> Self {
        Self {
            api,
            page_size: options.page_size.max(1),
            state: Mutex::new(BrowserState {
                current_path: String::new(),
                current_page: 1,
                current_listing: None,
                sort_by: options.sort_by,
                sort_order: options.sort_order,
                listing_cache: HashMap::new(),
                tree_tags: HashMap::new(),
                expanded_nodes: HashSet::new(),
            }),
            generation: AtomicU64::new(0),
        }
    }

    /// Load one page of a directory, revalidating the cached copy with
    /// its version tag unless `force_refresh` skips the validator.
    pub async fn load_directory(
        &self,
        path: &str,
        options: LoadOptions,
    ) -> Result<LoadOutcome, ExplorerError> {
        let path = paths::normalize(path);
        let page = options.page.max(1);

        let (generation, query, mut tag) = {
            let mut state = self.state.lock().unwrap();
            // This navigation supersedes any fetch still in flight.
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            state.current_path = path.clone();
            state.current_page = page;
            let query = ListingQuery {
                path,
                page,
                page_size: self.page_size,
                sort_by: state.sort_by,
                sort_order: state.sort_order,
            };
            let tag = if options.force_refresh {
                None
            } else {
                let key = ListingKey::for_query(&query);
                state.listing_cache.get(&key).map(|entry| entry.tag.clone())
            };
            (generation, query, tag)
        };

        loop {
            let fetched = self.api.fetch_listing(&query, tag.as_deref()).await?;
            let key = ListingKey::for_query(&query);
            let mut state = self.state.lock().unwrap();
            let superseded = self.generation.load(Ordering::SeqCst) != generation;

            match fetched {
                Conditional::NotModified => {
                    if let Some(entry) = state.listing_cache.get(&key) {
                        let listing = entry.listing.clone();
                        if superseded {
                            return Ok(LoadOutcome::Superseded);
                        }
                        log::debug!("directory unchanged (304): {:?}", query.path);
                        state.current_listing = Some(listing.clone());
                        return Ok(LoadOutcome::Unchanged(listing));
                    }
                    // Not-modified without a cached body to re-render.
                    // Drop the orphaned tag and fetch the page outright.
                    state.listing_cache.remove(&key);
                    if tag.is_none() {
                        return Err(ExplorerError::General(
                            "server answered not-modified without a validator".to_string(),
                        ));
                    }
                    tag = None;
                    drop(state);
                }
                Conditional::Fresh {
                    data,
                    tag: fresh_tag,
                } => {
                    if let Some(fresh_tag) = fresh_tag {
                        state.listing_cache.insert(
                            key,
                            CachedListing {
                                tag: fresh_tag,
                                listing: data.clone(),
                            },
                        );
                    }
                    if superseded {
                        log::debug!("discarding stale response for {:?}", query.path);
                        return Ok(LoadOutcome::Superseded);
                    }
                    state.current_listing = Some(data.clone());
                    return Ok(LoadOutcome::Loaded(data));
                }
            }
        }
    }

    pub async fn navigate_to_folder(&self, path: &str) -> Result<LoadOutcome, ExplorerError> {
        self.load_directory(path, LoadOptions::default()).await
    }

    /// Step to the parent folder. The server-reported parent path wins
    /// over local string surgery when a listing is present.
    pub async fn navigate_up(&self) -> Result<LoadOutcome, ExplorerError> {
        let (at_root, parent, current) = {
            let state = self.state.lock().unwrap();
            let parent = state
                .current_listing
                .as_ref()
                .and_then(|listing| listing.parent_path.clone())
                .or_else(|| paths::parent(&state.current_path))
                .unwrap_or_default();
            (
                state.current_path.is_empty(),
                parent,
                state.current_listing.clone(),
            )
        };
        if at_root {
            if let Some(listing) = current {
                return Ok(LoadOutcome::Unchanged(listing));
            }
            return self.load_directory("", LoadOptions::default()).await;
        }
        self.navigate_to_folder(&parent).await
    }

    /// Advance one page. Returns `Ok(None)` when nothing is loaded yet;
    /// at the last page this is a local no-op that echoes the current
    /// listing without touching the network.
    pub async fn load_next_page(&self) -> Result<Option<LoadOutcome>, ExplorerError> {
        let step = {
            let state = self.state.lock().unwrap();
            match &state.current_listing {
                Some(listing) if listing.has_more => {
                    Some((state.current_path.clone(), state.current_page + 1))
                }
                Some(listing) => return Ok(Some(LoadOutcome::Unchanged(listing.clone()))),
                None => None,
            }
        };
        match step {
            Some((path, page)) => self
                .load_directory(&path, LoadOptions::page(page))
                .await
                .map(Some),
            None => Ok(None),
        }
    }

    pub async fn load_previous_page(&self) -> Result<Option<LoadOutcome>, ExplorerError> {
        let step = {
            let state = self.state.lock().unwrap();
            if state.current_listing.is_none() {
                None
            } else if state.current_page > 1 {
                Some((state.current_path.clone(), state.current_page - 1))
            } else {
                return Ok(state.current_listing.clone().map(LoadOutcome::Unchanged));
            }
        };
        match step {
            Some((path, page)) => self
                .load_directory(&path, LoadOptions::page(page))
                .await
                .map(Some),
            None => Ok(None),
        }
    }

    /// Change the sort field. Selecting the already-active field while
    /// ascending flips to descending; anything else resets to ascending.
    /// Cached pages for the current path are stale under the new order
    /// and are dropped before the forced reload from page one.
    pub async fn change_sort(
        &self,
        sort_by: SortBy,
        sort_order: Option<SortOrder>,
    ) -> Result<LoadOutcome, ExplorerError> {
        let path = {
            let mut state = self.state.lock().unwrap();
            let order = sort_order.unwrap_or(
                if state.sort_by == sort_by && state.sort_order == SortOrder::Asc {
                    SortOrder::Desc
                } else {
                    SortOrder::Asc
                },
            );
            state.sort_by = sort_by;
            state.sort_order = order;
            let path = state.current_path.clone();
            state.listing_cache.retain(|key, _| key.path != path);
            path
        };
        self.load_directory(&path, LoadOptions::forced()).await
    }

    /// Reload the current directory from scratch, optionally asking the
    /// server to rebuild its own cache for this path first. A failed
    /// server-side refresh is logged and does not block the reload.
    pub async fn refresh(&self, invalidate_server_cache: bool) -> Result<LoadOutcome, ExplorerError> {
        let path = {
            let mut state = self.state.lock().unwrap();
            let path = state.current_path.clone();
            state.listing_cache.retain(|key, _| key.path != path);
            path
        };
        if invalidate_server_cache {
            if let Err(e) = self.api.refresh_server_cache(&path, false).await {
                log::warn!("server cache refresh failed for {path:?}: {e}");
            }
        }
        self.load_directory(&path, LoadOptions::forced()).await
    }

    /// After an upload, move, or delete under `path` (current directory
    /// when `None`): drop every cached tag the write could have changed,
    /// ask the server to rebuild recursively, and reload the view if it
    /// can see the written path. Returns `Ok(None)` when the view was
    /// unaffected.
    pub async fn refresh_after_write(
        &self,
        path: Option<&str>,
    ) -> Result<Option<LoadOutcome>, ExplorerError> {
        let target = {
            let mut state = self.state.lock().unwrap();
            let target = match path {
                Some(path) => paths::normalize(path),
                None => state.current_path.clone(),
            };
            invalidate_cached(&mut state, &target);
            target
        };

        if let Err(e) = self.api.refresh_server_cache(&target, true).await {
            log::warn!("server cache refresh failed for {target:?}: {e}");
        }

        let current = self.state.lock().unwrap().current_path.clone();
        if paths::affects_view(&current, &target) {
            return self
                .load_directory(&current, LoadOptions::forced())
                .await
                .map(Some);
        }
        Ok(None)
    }

    /// Fetch a subtree for the sidebar, revalidating with the path's
    /// tree tag. `Ok(None)` means not modified: the caller keeps its
    /// rendered nodes. Loaded paths are marked expanded.
    pub async fn load_tree_children(
        &self,
        path: &str,
        depth: u8,
    ) -> Result<Option<TreeNode>, ExplorerError> {
        let path = paths::normalize(path);
        let tag = self.state.lock().unwrap().tree_tags.get(&path).cloned();
        match self.api.fetch_tree(&path, depth, tag.as_deref()).await? {
            Conditional::NotModified => {
                log::debug!("tree unchanged (304): {path:?}");
                Ok(None)
            }
            Conditional::Fresh { mut data, tag } => {
                let mut state = self.state.lock().unwrap();
                if let Some(tag) = tag {
                    state.tree_tags.insert(path.clone(), tag);
                }
                state.expanded_nodes.insert(path);
                data.expanded = true;
                Ok(Some(data))
            }
        }
    }

    /// Recover from a directory that disappeared out from under the
    /// view: walk toward the root and land on the nearest ancestor the
    /// server still knows. A probe failure skips that ancestor rather
    /// than stranding the user on a dead path.
    pub async fn handle_folder_not_found(&self, path: &str) -> Result<LoadOutcome, ExplorerError> {
        let path = paths::normalize(path);
        log::warn!("folder no longer exists, walking to nearest parent: {path:?}");
        for ancestor in paths::ancestors(&path) {
            if ancestor.is_empty() {
                break;
            }
            match self.api.folder_exists(&ancestor).await {
                Ok(true) => return self.navigate_to_folder(&ancestor).await,
                Ok(false) => continue,
                Err(e) => {
                    log::warn!("existence probe failed for {ancestor:?}: {e}");
                    continue;
                }
            }
        }
        self.navigate_to_folder("").await
    }

    pub fn path(&self) -> String {
        self.state.lock().unwrap().current_path.clone()
    }

    pub fn page(&self) -> u32 {
        self.state.lock().unwrap().current_page
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn listing(&self) -> Option<DirectoryListing> {
        self.state.lock().unwrap().current_listing.clone()
    }

    pub fn sort(&self) -> (SortBy, SortOrder) {
        let state = self.state.lock().unwrap();
        (state.sort_by, state.sort_order)
    }

    pub fn has_more(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .current_listing
            .as_ref()
            .map(|listing| listing.has_more)
            .unwrap_or(false)
    }

    pub fn total_pages(&self) -> u32 {
        self.state
            .lock()
            .unwrap()
            .current_listing
            .as_ref()
            .map(|listing| listing.total_pages)
            .unwrap_or(1)
    }

    pub fn is_expanded(&self, path: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .expanded_nodes
            .contains(&paths::normalize(path))
    }
}

/// Drop cached tags for `path`, every ancestor up to the root, and the
/// root itself. Sibling branches keep their tags; a write cannot have
/// changed what they contain.
fn invalidate_cached(state: &mut BrowserState, path: &str) {
    let mut affected: HashSet<String> = HashSet::new();
    affected.insert(path.to_string());
    for ancestor in paths::ancestors(path) {
        affected.insert(ancestor);
    }
    affected.insert(String::new());
    state.listing_cache.retain(|key, _| !affected.contains(&key.path));
    state.tree_tags.retain(|tree_path, _| !affected.contains(tree_path));
}
