//! Gore Game Server Library
//!
//! This library provides the core functionality for the Gore 2D online RPG
//! server: NPC spawning, the tick-driven world, and session handling.
//!
//! ## Modules
//!
//! - `auth` - Account credentials, permissions and account creation
//! - `config` - Server configuration management
//! - `error` - Error types and result definitions
//! - `game` - Game world, maps, spawners and entities
//! - `net` - Network handling, sessions and say commands
//! - `protocol` - Line-delimited JSON message protocol

pub mod auth;
pub mod config;
pub mod error;
pub mod game;
pub mod net;
pub mod protocol;
pub mod state;

// Re-export commonly used types
pub use config::ServerConfig;
pub use error::{GoreError, Result};
pub use state::AppState;

/// Server version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
