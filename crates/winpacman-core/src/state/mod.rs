pub mod config;
pub mod dirs;

pub use config::{AppConfig, SyncInterval, WindowState};
pub use dirs::AppDirs;
