pub mod capability;
pub mod config;
pub mod daemon;
pub mod error;
pub mod fingerprint;
pub mod logging;
pub mod path_filter;
pub mod queue;
pub mod reconciler;
pub mod state_store;
pub mod uploader;
pub mod watcher;
