//! Error handling module
//!
//! Defines custom error types for the Gore server.

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::game::ids::{CharacterId, CharacterTemplateId, MapId};

/// Main error type for the Gore server
#[derive(Error, Debug)]
pub enum GoreError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Protocol-related errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Authentication errors
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Game logic errors
    #[error("Game error: {0}")]
    Game(#[from] GameError),

    /// Persistence errors
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Network-specific errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Server is full ({0} connections)")]
    ServerFull(usize),

    #[error("Too many connections from {0}")]
    TooManyConnections(String),

    #[error("Session not found: {0}")]
    SessionNotFound(u64),

    #[error("Write buffer full")]
    WriteBufferFull,

    #[error("Read error: {0}")]
    ReadError(String),

    #[error("Write error: {0}")]
    WriteError(String),
}

/// Protocol-specific errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Unexpected message in state {state}: {message}")]
    UnexpectedMessage { state: String, message: String },
}

/// Authentication-specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account already logged in")]
    AlreadyLoggedIn,

    #[error("Account banned until {0}")]
    Banned(String),

    #[error("Server is full")]
    ServerFull,

    #[error("Too many connections from this address")]
    TooManyConnectionsFromIp,

    #[error("Invalid username format")]
    InvalidUsername,

    #[error("Invalid password format")]
    InvalidPassword,

    #[error("Invalid email address")]
    InvalidEmail,

    #[error("Account creation failed: {0}")]
    AccountCreationFailed(String),

    #[error("Character does not belong to this account")]
    CharacterNotOwned,
}

/// Game logic errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GameError {
    #[error("Character not found: {0}")]
    CharacterNotFound(CharacterId),

    #[error("Character template not found: {0}")]
    TemplateNotFound(CharacterTemplateId),

    #[error("Map not found: {0}")]
    MapNotFound(MapId),

    #[error("Map already loaded: {0}")]
    MapAlreadyLoaded(MapId),

    #[error("Spawn region belongs to map {region_map} but spawner map is {spawner_map}")]
    RegionMapMismatch { spawner_map: MapId, region_map: MapId },

    #[error("Invalid spawn amount: {0}")]
    InvalidSpawnAmount(u8),

    #[error("Spawn region out of range: {0}")]
    InvalidRegion(String),

    #[error("Invalid location: ({x}, {y})")]
    InvalidLocation { x: f32, y: f32 },

    #[error("Invalid character state: {0}")]
    InvalidCharacterState(String),

    #[error("Target out of range")]
    OutOfRange,
}

/// Persistence-specific errors
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt record {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("Storage I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for Gore operations
pub type Result<T> = std::result::Result<T, GoreError>;

/// Rejection reasons reported to clients for a failed login
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginFailure {
    /// Invalid username or password
    InvalidCredentials,
    /// Account is already logged in and eviction is disabled
    AccountInUse,
    /// Account is banned
    Banned,
    /// Server-wide connection cap reached
    ServerFull,
    /// Per-address connection cap reached
    TooManyConnections,
    /// Anything else
    Unknown,
}

impl From<&AuthError> for LoginFailure {
    fn from(err: &AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials
            | AuthError::InvalidUsername
            | AuthError::InvalidPassword => LoginFailure::InvalidCredentials,
            AuthError::AlreadyLoggedIn => LoginFailure::AccountInUse,
            AuthError::Banned(_) => LoginFailure::Banned,
            AuthError::ServerFull => LoginFailure::ServerFull,
            AuthError::TooManyConnectionsFromIp => LoginFailure::TooManyConnections,
            _ => LoginFailure::Unknown,
        }
    }
}

impl From<AuthError> for LoginFailure {
    fn from(err: AuthError) -> Self {
        LoginFailure::from(&err)
    }
}
