//! Session management module
//!
//! Manages client sessions including:
//! - Session state machine (connected -> authenticated -> in world)
//! - Per-session identity (account, permissions, active character)
//! - Login caps per address and server-wide
//! - Thread-safe session registry

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};

use crate::auth::UserPermissions;
use crate::error::{AuthError, GoreError, NetworkError, Result};
use crate::game::ids::{AccountId, CharacterId, MapId};
use crate::protocol::ServerMessage;

/// Unique session identifier
pub type SessionId = u64;

/// Session state in the connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Socket open, not logged in
    Connected,
    /// Logged in, no character selected
    Authenticated,
    /// Playing a character
    InWorld,
    /// Terminal
    Disconnected,
}

impl SessionState {
    /// Check if the session is still active
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Disconnected)
    }

    /// Get a human-readable name for the state
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Connected => "Connected",
            SessionState::Authenticated => "Authenticated",
            SessionState::InWorld => "InWorld",
            SessionState::Disconnected => "Disconnected",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A connected client session
pub struct Session {
    /// Unique session identifier
    pub id: SessionId,
    /// Remote address of the client
    pub address: SocketAddr,
    /// Current session state
    state: RwLock<SessionState>,
    /// Account (set after login)
    account: RwLock<Option<AccountId>>,
    /// Account name (set after login)
    username: RwLock<Option<String>>,
    /// Permission level of the account
    permissions: RwLock<UserPermissions>,
    /// Active character (set when in world)
    character: RwLock<Option<CharacterId>>,
    /// Map the active character is on
    map: RwLock<Option<MapId>>,
    /// Whether this session holds a login slot
    holds_login_slot: AtomicBool,
    /// Time of session creation
    pub created_at: Instant,
    /// Time of last activity
    last_activity: RwLock<Instant>,
    /// Outbound message channel
    outbound_tx: Option<mpsc::Sender<ServerMessage>>,
    /// Signalled when the server closes the session
    close: Notify,
}

impl Session {
    /// Create a new session
    pub fn new(id: SessionId, address: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id,
            address,
            state: RwLock::new(SessionState::Connected),
            account: RwLock::new(None),
            username: RwLock::new(None),
            permissions: RwLock::new(UserPermissions::User),
            character: RwLock::new(None),
            map: RwLock::new(None),
            holds_login_slot: AtomicBool::new(false),
            created_at: now,
            last_activity: RwLock::new(now),
            outbound_tx: None,
            close: Notify::new(),
        }
    }

    /// Create a new session with an outbound channel
    pub fn with_channel(
        id: SessionId,
        address: SocketAddr,
        outbound_tx: mpsc::Sender<ServerMessage>,
    ) -> Self {
        let mut session = Self::new(id, address);
        session.outbound_tx = Some(outbound_tx);
        session
    }

    /// Get the IP address (without port)
    pub fn ip(&self) -> IpAddr {
        self.address.ip()
    }

    /// Get the current session state
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Transition to a new state if currently in the expected state
    pub fn transition_state(&self, expected: SessionState, new_state: SessionState) -> bool {
        let mut state = self.state.write();
        if *state != expected {
            return false;
        }
        *state = new_state;
        drop(state);

        debug!(
            session_id = self.id,
            old_state = %expected,
            new_state = %new_state,
            "Session state changed"
        );
        true
    }

    /// Move to `Disconnected`. Returns the previous state, or `None` if the
    /// session was already disconnected.
    pub fn mark_disconnected(&self) -> Option<SessionState> {
        let mut state = self.state.write();
        if *state == SessionState::Disconnected {
            return None;
        }
        let previous = *state;
        *state = SessionState::Disconnected;
        Some(previous)
    }

    /// Check if session is active
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    pub fn account(&self) -> Option<AccountId> {
        *self.account.read()
    }

    /// Get the username
    pub fn username(&self) -> Option<String> {
        self.username.read().clone()
    }

    pub fn permissions(&self) -> UserPermissions {
        *self.permissions.read()
    }

    pub(crate) fn set_identity(&self, account: AccountId, username: &str, permissions: UserPermissions) {
        *self.account.write() = Some(account);
        *self.username.write() = Some(username.to_string());
        *self.permissions.write() = permissions;
    }

    pub fn character(&self) -> Option<CharacterId> {
        *self.character.read()
    }

    pub fn map(&self) -> Option<MapId> {
        *self.map.read()
    }

    pub(crate) fn set_character(&self, character: CharacterId, map: MapId) {
        *self.character.write() = Some(character);
        *self.map.write() = Some(map);
    }

    pub(crate) fn set_map(&self, map: MapId) {
        *self.map.write() = Some(map);
    }

    /// Clear the active character, returning it with its map
    pub(crate) fn take_character(&self) -> Option<(CharacterId, MapId)> {
        let character = self.character.write().take()?;
        let map = self.map.write().take()?;
        Some((character, map))
    }

    /// Update the last activity timestamp
    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    /// Get the last activity time
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.read()
    }

    /// Get the duration since last activity
    pub fn idle_duration(&self) -> Duration {
        self.last_activity().elapsed()
    }

    /// Check if the session has been idle too long
    pub fn is_idle(&self, max_idle: Duration) -> bool {
        self.idle_duration() > max_idle
    }

    /// Queue a message for the client without blocking.
    ///
    /// A full queue drops the message; the client is too slow to keep up.
    pub fn try_send(&self, message: ServerMessage) -> Result<()> {
        if let Some(tx) = &self.outbound_tx {
            tx.try_send(message).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!(session_id = self.id, "Outbound queue full, dropping message");
                    GoreError::Network(NetworkError::WriteBufferFull)
                }
                mpsc::error::TrySendError::Closed(_) => {
                    GoreError::Network(NetworkError::ConnectionClosed)
                }
            })?;
        }
        Ok(())
    }

    /// Send, ignoring delivery failures
    pub fn send(&self, message: ServerMessage) {
        if let Err(e) = self.try_send(message) {
            trace!(session_id = self.id, error = %e, "Message not delivered");
        }
    }

    /// Ask the connection task to close the socket
    pub fn close(&self) {
        self.close.notify_one();
    }

    /// Resolves once [`Session::close`] has been called
    pub async fn closed(&self) {
        self.close.notified().await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state())
            .field("username", &self.username())
            .field("character", &self.character())
            .field("created_at", &self.created_at)
            .field("idle_duration", &self.idle_duration())
            .finish()
    }
}

/// Connection caps enforced at login
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Server-wide logged-in sessions
    pub max_connections: usize,
    /// Logged-in sessions per address
    pub max_connections_per_ip: usize,
    /// Maximum idle time before disconnect
    pub max_idle: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_connections: 500,
            max_connections_per_ip: 3,
            max_idle: Duration::from_secs(300),
        }
    }
}

/// Thread-safe session manager
pub struct SessionManager {
    /// Map of session ID to session
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Logged-in account to session
    account_to_session: DashMap<AccountId, SessionId>,
    /// Active character to session
    character_to_session: DashMap<CharacterId, SessionId>,
    /// Logged-in sessions per address
    logins_per_ip: DashMap<IpAddr, usize>,
    /// Logged-in sessions server-wide
    logins: AtomicUsize,
    /// Next session ID to assign
    next_id: AtomicU64,
    limits: SessionLimits,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new() -> Self {
        Self::with_limits(SessionLimits::default())
    }

    /// Create a session manager with custom limits
    pub fn with_limits(limits: SessionLimits) -> Self {
        Self {
            sessions: DashMap::new(),
            account_to_session: DashMap::new(),
            character_to_session: DashMap::new(),
            logins_per_ip: DashMap::new(),
            logins: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            limits,
        }
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    /// Create and register a session
    pub fn create_session(
        &self,
        address: SocketAddr,
        outbound_tx: Option<mpsc::Sender<ServerMessage>>,
    ) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(match outbound_tx {
            Some(tx) => Session::with_channel(id, address, tx),
            None => Session::new(id, address),
        });

        self.sessions.insert(id, session.clone());
        info!(session_id = id, address = %address, "Session created");
        session
    }

    /// Reserve a login slot for a session, enforcing both caps
    pub fn reserve_login(&self, session: &Session) -> std::result::Result<(), AuthError> {
        if session.holds_login_slot.load(Ordering::SeqCst) {
            return Ok(());
        }

        let max = self.limits.max_connections;
        if self
            .logins
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .is_err()
        {
            warn!(session_id = session.id, max = max, "Server full");
            return Err(AuthError::ServerFull);
        }

        let ip = session.ip();
        let mut per_ip = self.logins_per_ip.entry(ip).or_insert(0);
        if *per_ip >= self.limits.max_connections_per_ip {
            drop(per_ip);
            self.logins.fetch_sub(1, Ordering::SeqCst);
            warn!(
                session_id = session.id,
                ip = %ip,
                max = self.limits.max_connections_per_ip,
                "Connection limit exceeded for IP"
            );
            return Err(AuthError::TooManyConnectionsFromIp);
        }
        *per_ip += 1;
        drop(per_ip);

        session.holds_login_slot.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Give back a session's login slot. Safe to call more than once.
    pub(crate) fn release_login(&self, session: &Session) {
        if !session.holds_login_slot.swap(false, Ordering::SeqCst) {
            return;
        }

        self.logins.fetch_sub(1, Ordering::SeqCst);
        let ip = session.ip();
        if let Some(mut count) = self.logins_per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
        }
        self.logins_per_ip.remove_if(&ip, |_, count| *count == 0);
    }

    /// Get a session by ID
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|r| r.clone())
    }

    /// Session currently logged in to an account
    pub fn get_by_account(&self, account: AccountId) -> Option<Arc<Session>> {
        self.account_to_session
            .get(&account)
            .and_then(|id| self.get(*id))
    }

    /// Session playing a character
    pub fn get_by_character(&self, character: CharacterId) -> Option<Arc<Session>> {
        self.character_to_session
            .get(&character)
            .and_then(|id| self.get(*id))
    }

    /// Session by account name, ignoring case
    pub fn get_by_username(&self, username: &str) -> Option<Arc<Session>> {
        let wanted = crate::auth::normalize_username(username);
        self.sessions
            .iter()
            .find(|s| s.username().as_deref() == Some(wanted.as_str()))
            .map(|s| s.clone())
    }

    /// Claim an account for a session.
    ///
    /// Check and insert happen under the account's index entry, so two
    /// logins to one account cannot both succeed. Returns the id of the
    /// session already holding the account on failure.
    pub fn claim_account(
        &self,
        session: &Session,
        account: AccountId,
        username: &str,
        permissions: UserPermissions,
    ) -> std::result::Result<(), SessionId> {
        match self.account_to_session.entry(account) {
            Entry::Occupied(entry) if *entry.get() != session.id => return Err(*entry.get()),
            Entry::Occupied(_) => {}
            Entry::Vacant(entry) => {
                entry.insert(session.id);
            }
        }

        session.set_identity(account, username, permissions);
        debug!(
            session_id = session.id,
            account_id = %account,
            username = %username,
            "Account bound to session"
        );
        Ok(())
    }

    /// Drop a session's claim on an account
    pub fn release_account(&self, session: SessionId, account: AccountId) {
        self.account_to_session
            .remove_if(&account, |_, id| *id == session);
    }

    pub fn bind_character(&self, session: &Session, character: CharacterId, map: MapId) {
        session.set_character(character, map);
        self.character_to_session.insert(character, session.id);
    }

    pub fn unbind_character(&self, session: &Session) -> Option<(CharacterId, MapId)> {
        let (character, map) = session.take_character()?;
        self.character_to_session
            .remove_if(&character, |_, id| *id == session.id);
        Some((character, map))
    }

    /// Remove a session and release everything it holds
    pub fn remove(&self, id: SessionId) {
        if let Some((_, session)) = self.sessions.remove(&id) {
            if let Some(account) = session.account() {
                self.account_to_session.remove_if(&account, |_, sid| *sid == id);
            }
            if let Some(character) = session.character() {
                self.character_to_session
                    .remove_if(&character, |_, sid| *sid == id);
            }
            self.release_login(&session);

            info!(
                session_id = id,
                username = ?session.username(),
                "Session removed"
            );
        }
    }

    /// Get the count of sessions
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Logged-in sessions server-wide
    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    /// Logged-in sessions from one address
    pub fn logins_from_ip(&self, ip: IpAddr) -> usize {
        self.logins_per_ip.get(&ip).map(|c| *c).unwrap_or(0)
    }

    /// Get list of all session IDs
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|r| *r.key()).collect()
    }

    /// Sessions idle longer than the configured limit
    pub fn idle_sessions(&self) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|s| s.is_active() && s.is_idle(self.limits.max_idle))
            .map(|s| s.id)
            .collect()
    }

    /// Sessions playing on a map
    pub fn sessions_on_map(&self, map: MapId) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|s| s.state() == SessionState::InWorld && s.map() == Some(map))
            .map(|s| s.clone())
            .collect()
    }

    /// Iterate over all in-world sessions
    pub fn for_each_in_world<F>(&self, f: F)
    where
        F: Fn(&Session),
    {
        for session in self.sessions.iter() {
            if session.state() == SessionState::InWorld {
                f(&session);
            }
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_address() -> SocketAddr {
        "127.0.0.1:12345".parse().unwrap()
    }

    fn limits(max_connections: usize, per_ip: usize) -> SessionLimits {
        SessionLimits {
            max_connections,
            max_connections_per_ip: per_ip,
            max_idle: Duration::from_secs(300),
        }
    }

    #[test]
    fn test_session_creation() {
        let session = Session::new(1, test_address());
        assert_eq!(session.id, 1);
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.is_active());
        assert_eq!(session.permissions(), UserPermissions::User);
    }

    #[test]
    fn test_session_state_transition() {
        let session = Session::new(1, test_address());

        assert!(session.transition_state(SessionState::Connected, SessionState::Authenticated));
        assert_eq!(session.state(), SessionState::Authenticated);

        assert!(!session.transition_state(SessionState::Connected, SessionState::InWorld));
        assert_eq!(session.state(), SessionState::Authenticated);
    }

    #[test]
    fn test_mark_disconnected_once() {
        let session = Session::new(1, test_address());
        assert_eq!(session.mark_disconnected(), Some(SessionState::Connected));
        assert_eq!(session.mark_disconnected(), None);
        assert!(!session.is_active());
    }

    #[test]
    fn test_session_manager_remove() {
        let manager = SessionManager::new();
        let session = manager.create_session(test_address(), None);
        let id = session.id;

        manager.remove(id);
        assert!(manager.get(id).is_none());
        assert_eq!(manager.count(), 0);
        manager.remove(id);
    }

    #[test]
    fn test_account_lookup() {
        let manager = SessionManager::new();
        let session = manager.create_session(test_address(), None);
        manager
            .claim_account(&session, AccountId::new(9), "testuser", UserPermissions::Admin)
            .unwrap();

        assert_eq!(manager.get_by_account(AccountId::new(9)).unwrap().id, session.id);
        assert_eq!(manager.get_by_username("TestUser").unwrap().id, session.id);
        assert_eq!(session.permissions(), UserPermissions::Admin);

        manager.remove(session.id);
        assert!(manager.get_by_account(AccountId::new(9)).is_none());
    }

    #[test]
    fn test_account_claimed_once() {
        let manager = SessionManager::new();
        let first = manager.create_session(test_address(), None);
        let second = manager.create_session(test_address(), None);
        let account = AccountId::new(4);

        manager
            .claim_account(&first, account, "hero", UserPermissions::User)
            .unwrap();
        assert_eq!(
            manager.claim_account(&second, account, "hero", UserPermissions::User),
            Err(first.id)
        );
        assert_eq!(second.account(), None);

        // Releasing from the wrong session leaves the claim alone
        manager.release_account(second.id, account);
        assert_eq!(manager.get_by_account(account).unwrap().id, first.id);

        manager.release_account(first.id, account);
        manager
            .claim_account(&second, account, "hero", UserPermissions::User)
            .unwrap();
        assert_eq!(manager.get_by_account(account).unwrap().id, second.id);
    }

    #[test]
    fn test_per_ip_login_limit() {
        let manager = SessionManager::with_limits(limits(10, 2));
        let a = manager.create_session("192.168.1.1:1".parse().unwrap(), None);
        let b = manager.create_session("192.168.1.1:2".parse().unwrap(), None);
        let c = manager.create_session("192.168.1.1:3".parse().unwrap(), None);
        let other = manager.create_session("192.168.1.2:1".parse().unwrap(), None);

        assert!(manager.reserve_login(&a).is_ok());
        assert!(manager.reserve_login(&b).is_ok());
        assert_eq!(
            manager.reserve_login(&c),
            Err(AuthError::TooManyConnectionsFromIp)
        );
        assert!(manager.reserve_login(&other).is_ok());
        assert_eq!(manager.login_count(), 3);

        manager.remove(a.id);
        assert!(manager.reserve_login(&c).is_ok());
        assert_eq!(manager.logins_from_ip("192.168.1.1".parse().unwrap()), 2);
    }

    #[test]
    fn test_global_login_limit() {
        let manager = SessionManager::with_limits(limits(1, 5));
        let a = manager.create_session("10.0.0.1:1".parse().unwrap(), None);
        let b = manager.create_session("10.0.0.2:1".parse().unwrap(), None);

        assert!(manager.reserve_login(&a).is_ok());
        assert!(manager.reserve_login(&a).is_ok(), "reserving twice is a no-op");
        assert_eq!(manager.reserve_login(&b), Err(AuthError::ServerFull));
        assert_eq!(manager.login_count(), 1);
    }

    #[test]
    fn test_session_touch() {
        let session = Session::new(1, test_address());
        let initial = session.last_activity();

        std::thread::sleep(std::time::Duration::from_millis(10));
        session.touch();

        assert!(session.last_activity() > initial);
    }

    #[tokio::test]
    async fn test_try_send_reports_full_queue() {
        let (tx, mut rx) = mpsc::channel(1);
        let session = Session::with_channel(1, test_address(), tx);

        session.try_send(ServerMessage::system("one")).unwrap();
        assert!(matches!(
            session.try_send(ServerMessage::system("two")),
            Err(GoreError::Network(NetworkError::WriteBufferFull))
        ));
        assert_eq!(rx.recv().await, Some(ServerMessage::system("one")));
    }

    #[test]
    fn test_close_wakes_waiter() {
        let session = Arc::new(Session::new(1, test_address()));
        session.close();
        tokio_test::block_on(async {
            tokio::time::timeout(Duration::from_millis(100), session.closed())
                .await
                .unwrap();
        });
    }
}
