//! Client-side directory cache and liveness synchronization for the
//! archive portal's file explorer.
//!
//! [`DirectoryBrowser`] mirrors one directory of the server's file
//! store at a time, revalidating cached pages with opaque version tags
//! so unchanged views cost a header exchange instead of a payload.
//! [`SyncService`] polls the active view for folders and file records
//! deleted by other actors and emits repair events the hosting UI can
//! act on.

mod api;
mod error;
mod models;
pub(crate) mod paths;
mod services;
#[cfg(test)]
mod test_support;

pub use api::{Conditional, PortalApi, TokenSource};
pub use error::ExplorerError;
pub use models::listing::{
    DirectoryListing, FileItem, FolderItem, ListingQuery, SortBy, SortOrder,
};
pub use models::tree::TreeNode;
pub use services::browser_service::{BrowserOptions, DirectoryBrowser, LoadOptions, LoadOutcome};
pub use services::sync_service::{
    DeletionNotice, ItemType, NavigationReason, SyncEvent, SyncService, SyncSubscription,
    ViewSnapshot, ViewSource, DEFAULT_SYNC_INTERVAL,
};
