//! Session dispatcher
//!
//! Owns the connection lifecycle and routes each decoded client message to
//! the account service, the world or the command registry according to the
//! session's state:
//!
//! ```text
//! Connected --login--> Authenticated --select--> InWorld
//!     \                     |                      |
//!      `------------------> Disconnected <--------'
//! ```
//!
//! Game mutations go through the owning map's lock, so they land between
//! ticks. Outbound world deltas arrive through [`WorldObserver`] once a tick
//! has completed.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::auth::{AccountService, CreateAccountRequest};
use crate::error::{AuthError, GoreError, LoginFailure, PersistenceError};
use crate::game::character::Character;
use crate::game::ids::{AccountId, CharacterId, MapId};
use crate::game::map::MapEvent;
use crate::game::persistence::CharacterSnapshot;
use crate::game::region::Vector2;
use crate::game::world::{GameWorld, WorldObserver};
use crate::net::commands::{CommandContext, CommandRegistry};
use crate::net::session::{Session, SessionId, SessionLimits, SessionManager, SessionState};
use crate::protocol::{CharacterSummary, ClientMessage, ServerMessage};

/// Longest chat line relayed, in characters
pub const MAX_CHAT_LENGTH: usize = 200;

/// Dispatcher behaviour switches
#[derive(Debug, Clone, Copy)]
pub struct DispatcherSettings {
    /// Evict an existing session of the same account instead of rejecting
    pub drop_existing_connection: bool,
    pub limits: SessionLimits,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            drop_existing_connection: true,
            limits: SessionLimits::default(),
        }
    }
}

/// Routes client messages and owns every session
pub struct SessionDispatcher {
    settings: DispatcherSettings,
    sessions: SessionManager,
    world: Arc<GameWorld>,
    accounts: AccountService,
    commands: CommandRegistry,
}

impl SessionDispatcher {
    pub fn new(settings: DispatcherSettings, world: Arc<GameWorld>, accounts: AccountService) -> Self {
        Self {
            settings,
            sessions: SessionManager::with_limits(settings.limits),
            world,
            accounts,
            commands: CommandRegistry::with_defaults(),
        }
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn world(&self) -> &Arc<GameWorld> {
        &self.world
    }

    pub fn accounts(&self) -> &AccountService {
        &self.accounts
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    /// Register a new connection
    pub fn connect(
        &self,
        address: SocketAddr,
        outbound_tx: Option<mpsc::Sender<ServerMessage>>,
    ) -> Arc<Session> {
        self.sessions.create_session(address, outbound_tx)
    }

    /// Handle one decoded client message.
    ///
    /// Messages that do not fit the session's state are answered with a
    /// system message and change nothing.
    pub fn handle_message(&self, session: &Arc<Session>, message: ClientMessage) {
        session.touch();
        let state = session.state();

        match (state, message) {
            (SessionState::Connected, ClientMessage::Login { name, password }) => {
                self.login(session, &name, &password)
            }
            (
                SessionState::Connected,
                ClientMessage::CreateAccount {
                    name,
                    password,
                    email,
                },
            ) => self.create_account(session, name, password, email),
            (SessionState::Authenticated, ClientMessage::SelectCharacter { character }) => {
                self.select_character(session, character)
            }
            (SessionState::InWorld, ClientMessage::Move { x, y }) => {
                self.move_character(session, Vector2::new(x, y))
            }
            (SessionState::InWorld, ClientMessage::Say { text }) => self.say(session, &text),
            (SessionState::InWorld, ClientMessage::Attack { target }) => {
                self.attack(session, target)
            }
            (SessionState::Authenticated | SessionState::InWorld, ClientMessage::Logout) => {
                self.disconnect(session.id, "Logged out");
            }
            (SessionState::Disconnected, message) => {
                debug!(
                    session_id = session.id,
                    message = message.kind(),
                    "Message after disconnect ignored"
                );
            }
            (state, message) => {
                debug!(
                    session_id = session.id,
                    state = %state,
                    message = message.kind(),
                    "Unexpected message for state"
                );
                session.send(ServerMessage::system(format!(
                    "Cannot {} right now",
                    message.kind().replace('_', " ")
                )));
            }
        }
    }

    fn login(&self, session: &Arc<Session>, name: &str, password: &str) {
        let account = match self.accounts.authenticate(name, password) {
            Ok(account) => account,
            Err(GoreError::Auth(e)) => {
                self.reject_login(session, LoginFailure::from(&e));
                return;
            }
            Err(e) => {
                error!(session_id = session.id, error = %e, "Login failed");
                self.reject_login(session, LoginFailure::Unknown);
                return;
            }
        };

        if let Err(holder) =
            self.sessions
                .claim_account(session, account.id, &account.name, account.permissions)
        {
            if !self.settings.drop_existing_connection {
                self.reject_login(session, LoginFailure::AccountInUse);
                return;
            }

            info!(
                username = %account.name,
                old_session = holder,
                new_session = session.id,
                "Dropping existing connection for account"
            );
            if !self.disconnect(holder, "Logged in from another location") {
                // Holder is already leaving; its claim goes with it
                self.sessions.release_account(holder, account.id);
            }

            // Another login may have won the account while the old one left
            if self
                .sessions
                .claim_account(session, account.id, &account.name, account.permissions)
                .is_err()
            {
                self.reject_login(session, LoginFailure::AccountInUse);
                return;
            }
        }

        if let Err(e) = self.sessions.reserve_login(session) {
            self.sessions.release_account(session.id, account.id);
            self.reject_login(session, LoginFailure::from(&e));
            return;
        }

        if !session.transition_state(SessionState::Connected, SessionState::Authenticated) {
            // Disconnected while logging in
            self.sessions.release_account(session.id, account.id);
            self.sessions.release_login(session);
            debug!(session_id = session.id, "Session closed during login");
            return;
        }

        let characters = match self.world.store().account_characters(account.id) {
            Ok(list) if list.is_empty() => {
                // Account creation could not make one; try again now
                match self.create_starting_character(account.id, &account.name) {
                    Ok(snapshot) => vec![summary(&snapshot)],
                    Err(e) => {
                        warn!(account_id = %account.id, error = %e, "Failed to create starting character");
                        session.send(ServerMessage::system("Could not create your character"));
                        Vec::new()
                    }
                }
            }
            Ok(list) => list.iter().map(summary).collect(),
            Err(e) => {
                warn!(account_id = %account.id, error = %e, "Failed to list characters");
                session.send(ServerMessage::system("Could not load your characters"));
                Vec::new()
            }
        };

        info!(
            session_id = session.id,
            username = %account.name,
            permissions = account.permissions.name(),
            "Login successful"
        );
        session.send(ServerMessage::LoginAccepted {
            account: account.id,
            name: account.name,
            permissions: account.permissions,
            characters,
        });
    }

    fn reject_login(&self, session: &Session, reason: LoginFailure) {
        info!(session_id = session.id, reason = ?reason, "Login rejected");
        session.send(ServerMessage::LoginRejected { reason });
    }

    fn create_account(&self, session: &Session, name: String, password: String, email: String) {
        let request = CreateAccountRequest {
            name,
            password,
            email,
        };

        let account = match self.accounts.create_account(&request, session.ip()) {
            Ok(account) => account,
            Err(GoreError::Auth(e)) => {
                session.send(ServerMessage::AccountCreationFailed {
                    message: e.to_string(),
                });
                return;
            }
            Err(e) => {
                error!(session_id = session.id, error = %e, "Account creation failed");
                session.send(ServerMessage::AccountCreationFailed {
                    message: "Account creation failed, try again later".to_string(),
                });
                return;
            }
        };

        let created = self.create_starting_character(account.id, &account.name);
        session.send(ServerMessage::AccountCreated {
            name: account.name.clone(),
        });
        if let Err(e) = created {
            warn!(account_id = %account.id, error = %e, "Failed to create starting character");
            session.send(ServerMessage::system(
                "Your character could not be created yet, it will be made when you log in",
            ));
        }
    }

    /// New character named after the account at the invalid-load location
    fn create_starting_character(
        &self,
        account: AccountId,
        name: &str,
    ) -> std::result::Result<CharacterSnapshot, PersistenceError> {
        let settings = &self.world.settings;
        self.world.store().create_character(
            account,
            name,
            settings.invalid_user_load_map,
            settings.invalid_user_load_position,
        )
    }

    fn select_character(&self, session: &Arc<Session>, id: CharacterId) {
        let account = match session.account() {
            Some(account) => account,
            None => return,
        };

        let snapshot = match self.world.store().load_character(id) {
            Ok(snapshot) => snapshot,
            Err(PersistenceError::NotFound(_)) => {
                session.send(ServerMessage::system("No such character"));
                return;
            }
            Err(e) => {
                error!(session_id = session.id, character = %id, error = %e, "Failed to load character");
                session.send(ServerMessage::system(
                    "Could not load your character, try again later",
                ));
                return;
            }
        };

        if snapshot.account != account {
            warn!(session_id = session.id, character = %id, "Character selection for foreign character");
            session.send(ServerMessage::system(AuthError::CharacterNotOwned.to_string()));
            return;
        }

        let character = Character::from_snapshot(&snapshot);
        let (map, position) = match self.world.place_user(character, snapshot.map, snapshot.position)
        {
            Ok(placed) => placed,
            Err(e) => {
                error!(session_id = session.id, character = %id, error = %e, "Failed to place character");
                session.send(ServerMessage::system("Could not enter the world"));
                return;
            }
        };

        self.sessions.bind_character(session, id, map);
        if !session.transition_state(SessionState::Authenticated, SessionState::InWorld) {
            // Disconnected while entering; the character must not stay behind
            self.sessions.unbind_character(session);
            self.world.remove_user(map, id);
            debug!(session_id = session.id, character = %id, "Session closed while entering world");
            return;
        }
        info!(
            session_id = session.id,
            character = %id,
            map_id = %map,
            position = %position,
            "Character entered world"
        );

        session.send(ServerMessage::EnteredWorld {
            character: id,
            map,
            position,
        });
        for message in self.visible_characters(map, id) {
            session.send(message);
        }
    }

    /// Spawn messages for everything alive on a map, except `viewer`
    fn visible_characters(&self, map: MapId, viewer: CharacterId) -> Vec<ServerMessage> {
        self.world
            .with_map(map, |m| {
                m.characters()
                    .filter(|c| c.is_alive() && c.id() != viewer)
                    .map(|c| ServerMessage::CharacterSpawned {
                        character: c.id(),
                        name: c.name().to_string(),
                        position: c.position(),
                        npc: c.is_npc(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn move_character(&self, session: &Session, direction: Vector2) {
        let (character, map) = match session.character().zip(session.map()) {
            Some(pair) => pair,
            None => return,
        };

        let result = self
            .world
            .with_map(map, |m| m.set_direction(character, direction));
        if let Some(Err(e)) = result {
            debug!(session_id = session.id, error = %e, "Move rejected");
            session.send(ServerMessage::system("You cannot move right now"));
        }
    }

    fn say(&self, session: &Arc<Session>, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        if let Some(line) = text.strip_prefix('/') {
            let ctx = CommandContext {
                dispatcher: self,
                session,
            };
            let outcome = self.commands.dispatch(&ctx, line);
            session.send(ServerMessage::system(outcome.message()));
            return;
        }

        let (character, map) = match session.character().zip(session.map()) {
            Some(pair) => pair,
            None => return,
        };
        let from = self
            .world
            .with_map(map, |m| m.character(character).map(|c| c.name().to_string()))
            .flatten()
            .or_else(|| session.username())
            .unwrap_or_default();
        let text: String = text.chars().take(MAX_CHAT_LENGTH).collect();

        debug!(session_id = session.id, map_id = %map, "Chat");
        let message = ServerMessage::Chat { from, text };
        for recipient in self.sessions.sessions_on_map(map) {
            recipient.send(message.clone());
        }
    }

    fn attack(&self, session: &Session, target: CharacterId) {
        let (character, map) = match session.character().zip(session.map()) {
            Some(pair) => pair,
            None => return,
        };

        let now = self.world.now();
        match self.world.with_map(map, |m| m.attack(character, target, now)) {
            Some(Ok(outcome)) => {
                debug!(
                    session_id = session.id,
                    target = %target,
                    damage = outcome.damage,
                    killed = outcome.killed,
                    "Attack landed"
                );
            }
            Some(Err(e)) => session.send(ServerMessage::system(e.to_string())),
            None => {}
        }
    }

    /// Disconnect a session: save its character, take it off the map,
    /// notify the client and forget the session.
    ///
    /// Returns `false` if the session was already gone.
    pub fn disconnect(&self, id: SessionId, reason: &str) -> bool {
        let session = match self.sessions.get(id) {
            Some(session) => session,
            None => return false,
        };
        let previous = match session.mark_disconnected() {
            Some(previous) => previous,
            None => return false,
        };

        if let Some((character, map)) = self.sessions.unbind_character(&session) {
            self.save_and_remove(character, map);
        }

        session.send(ServerMessage::Disconnected {
            reason: reason.to_string(),
        });
        session.close();
        self.sessions.remove(id);

        info!(
            session_id = id,
            username = ?session.username(),
            previous_state = %previous,
            reason = %reason,
            "Session disconnected"
        );
        true
    }

    fn save_and_remove(&self, character: CharacterId, map: MapId) {
        let snapshot: Option<CharacterSnapshot> = self
            .world
            .with_map(map, |m| m.character(character).and_then(|c| c.to_snapshot()))
            .flatten();

        match snapshot {
            Some(snapshot) => {
                if let Err(e) = self.world.store().save_character(&snapshot) {
                    error!(character = %character, error = %e, "Failed to save character on disconnect");
                }
            }
            None => warn!(character = %character, map_id = %map, "Character missing on disconnect"),
        }

        self.world.remove_user(map, character);
    }

    /// Disconnect a session on behalf of a moderator or ban
    pub fn kick(&self, id: SessionId, reason: &str) -> bool {
        let kicked = self.disconnect(id, reason);
        if kicked {
            warn!(session_id = id, reason = %reason, "Session kicked");
        }
        kicked
    }

    /// Disconnect sessions idle past the configured limit
    pub fn cleanup_idle(&self) -> usize {
        let idle = self.sessions.idle_sessions();
        let count = idle
            .into_iter()
            .filter(|&id| self.disconnect(id, "Idle timeout"))
            .count();
        if count > 0 {
            info!(count = count, "Disconnected idle sessions");
        }
        count
    }

    /// Disconnect everyone, used at shutdown
    pub fn disconnect_all(&self, reason: &str) -> usize {
        self.sessions
            .session_ids()
            .into_iter()
            .filter(|&id| self.disconnect(id, reason))
            .count()
    }

    /// Unload a map and send its players back to character selection.
    ///
    /// Characters are saved by the world before the map goes away; their
    /// sessions stay logged in.
    pub fn unload_map(&self, map: MapId) -> crate::error::Result<Vec<CharacterId>> {
        let saved = self.world.unload_map(map)?;

        for session in self.sessions.sessions_on_map(map) {
            if !session.transition_state(SessionState::InWorld, SessionState::Authenticated) {
                continue;
            }
            self.sessions.unbind_character(&session);
            session.send(ServerMessage::system(
                "Your map was closed, select a character to continue",
            ));
        }

        info!(map_id = %map, saved = saved.len(), "Map unloaded");
        Ok(saved)
    }

    /// Send a message to every in-world session
    pub fn broadcast(&self, message: ServerMessage) {
        self.sessions.for_each_in_world(|s| s.send(message.clone()));
    }
}

impl WorldObserver for SessionDispatcher {
    fn on_map_events(&self, map: MapId, events: &[MapEvent]) {
        let recipients = self.sessions.sessions_on_map(map);
        if recipients.is_empty() {
            return;
        }

        let messages: Vec<ServerMessage> = events.iter().map(ServerMessage::from).collect();
        for session in recipients {
            for message in &messages {
                session.send(message.clone());
            }
        }
    }

    fn on_character_transferred(&self, character: CharacterId, to: MapId) {
        let session = match self.sessions.get_by_character(character) {
            Some(session) => session,
            None => return,
        };
        session.set_map(to);

        let position = self
            .world
            .with_map(to, |m| m.character(character).map(|c| c.position()))
            .flatten()
            .unwrap_or(Vector2::ZERO);
        session.send(ServerMessage::EnteredWorld {
            character,
            map: to,
            position,
        });
        for message in self.visible_characters(to, character) {
            session.send(message);
        }
    }

    fn on_character_stranded(&self, character: CharacterId) {
        let session = match self.sessions.get_by_character(character) {
            Some(session) => session,
            None => return,
        };

        // The world already saved it and took it off every map
        self.sessions.unbind_character(&session);
        session.send(ServerMessage::system(
            "Your character could not be placed in the world",
        ));
        self.disconnect(session.id, "Character could not be placed");
    }
}

fn summary(snapshot: &CharacterSnapshot) -> CharacterSummary {
    CharacterSummary {
        id: snapshot.id,
        name: snapshot.name.clone(),
        map: snapshot.map,
    }
}

impl std::fmt::Debug for SessionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDispatcher")
            .field("settings", &self.settings)
            .field("sessions", &self.sessions.count())
            .field("commands", &self.commands.len())
            .finish()
    }
}
