//! Client and server message definitions
//!
//! Messages are internally tagged JSON objects, one per line:
//!
//! ```text
//! {"type":"login","name":"hero","password":"secret"}
//! {"type":"character_moved","character":1073741824,"position":{"x":12.0,"y":40.0}}
//! ```

use serde::{Deserialize, Serialize};

use crate::auth::UserPermissions;
use crate::error::LoginFailure;
use crate::game::ids::{AccountId, CharacterId, MapId};
use crate::game::map::MapEvent;
use crate::game::region::Vector2;

/// Messages sent by clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Login {
        name: String,
        password: String,
    },
    CreateAccount {
        name: String,
        password: String,
        email: String,
    },
    SelectCharacter {
        character: CharacterId,
    },
    /// Walk in a direction; a zero vector stops
    Move {
        x: f32,
        y: f32,
    },
    /// Chat line; lines starting with `/` are commands
    Say {
        text: String,
    },
    Attack {
        target: CharacterId,
    },
    Logout,
}

impl ClientMessage {
    /// Short name for logs and error replies
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Login { .. } => "login",
            ClientMessage::CreateAccount { .. } => "create_account",
            ClientMessage::SelectCharacter { .. } => "select_character",
            ClientMessage::Move { .. } => "move",
            ClientMessage::Say { .. } => "say",
            ClientMessage::Attack { .. } => "attack",
            ClientMessage::Logout => "logout",
        }
    }
}

/// A character an account may play
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterSummary {
    pub id: CharacterId,
    pub name: String,
    pub map: MapId,
}

/// Messages sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    LoginAccepted {
        account: AccountId,
        name: String,
        permissions: UserPermissions,
        characters: Vec<CharacterSummary>,
    },
    LoginRejected {
        reason: LoginFailure,
    },
    AccountCreated {
        name: String,
    },
    AccountCreationFailed {
        message: String,
    },
    EnteredWorld {
        character: CharacterId,
        map: MapId,
        position: Vector2,
    },
    CharacterSpawned {
        character: CharacterId,
        name: String,
        position: Vector2,
        npc: bool,
    },
    CharacterDespawned {
        character: CharacterId,
    },
    CharacterMoved {
        character: CharacterId,
        position: Vector2,
    },
    CharacterDied {
        character: CharacterId,
    },
    Chat {
        from: String,
        text: String,
    },
    Announcement {
        text: String,
    },
    /// Feedback for a single session (command replies, rejected actions)
    SystemMessage {
        text: String,
    },
    Disconnected {
        reason: String,
    },
}

impl ServerMessage {
    pub fn system(text: impl Into<String>) -> Self {
        ServerMessage::SystemMessage { text: text.into() }
    }
}

impl From<&MapEvent> for ServerMessage {
    fn from(event: &MapEvent) -> Self {
        match event {
            MapEvent::CharacterSpawned {
                character,
                name,
                position,
                npc,
                ..
            } => ServerMessage::CharacterSpawned {
                character: *character,
                name: name.clone(),
                position: *position,
                npc: *npc,
            },
            MapEvent::CharacterDespawned { character, .. } => ServerMessage::CharacterDespawned {
                character: *character,
            },
            MapEvent::CharacterMoved {
                character,
                position,
                ..
            } => ServerMessage::CharacterMoved {
                character: *character,
                position: *position,
            },
            MapEvent::CharacterDied { character, .. } => ServerMessage::CharacterDied {
                character: *character,
            },
        }
    }
}
