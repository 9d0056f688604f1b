pub mod config;
pub mod config_persistence;
pub mod db_manager;
pub mod discovery;
pub mod document;
pub mod error;
pub mod extract;
pub mod location;
pub mod notify;
pub mod order;
pub mod persistence;
pub mod protocol;
pub mod selector;
pub mod sync_controller;
pub mod tree;

pub use error::{EngineError, Result};
pub use order::TransformKind;
pub use sync_controller::SyncController;
pub use tree::{HostTree, SharedTree};
