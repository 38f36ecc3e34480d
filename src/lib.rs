pub mod config;
pub mod ipc;
pub mod logs;
pub mod process_scan;
pub mod protocol;
pub mod registry;
pub mod shutdown;
pub mod supervisor;
pub mod utils;
pub mod watcher;
