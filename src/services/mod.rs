pub mod browser_service;
pub mod sync_service;
