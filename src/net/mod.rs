//! Networking module
//!
//! This module handles all network-related functionality for the Gore server:
//! - TCP socket handling
//! - Session management and login caps
//! - Message dispatch by session state
//! - Say commands

pub mod commands;
pub mod dispatcher;
pub mod handler;
pub mod session;

pub use dispatcher::{DispatcherSettings, SessionDispatcher};
pub use handler::ConnectionHandler;
pub use session::{Session, SessionId, SessionLimits, SessionManager, SessionState};
