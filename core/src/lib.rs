pub mod backends;
pub mod config;
pub mod errors;
pub mod files;
pub mod ops;
pub mod progress;
pub mod task;
pub mod warn_once;
