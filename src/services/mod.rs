pub mod archive;
pub mod change_monitor;
pub mod enumerator;
pub mod fs_feed;
pub mod index_store;
pub mod reconciler;
pub mod search_service;
