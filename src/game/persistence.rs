//! Persistence module
//!
//! The server treats storage as a black box behind the [`GameStore`] trait:
//! plain records go in and come out, and every call may fail. Two stores are
//! provided:
//! - [`MemoryStore`] keeps everything in memory (tests, dev mode)
//! - [`JsonStore`] reads and writes a directory of JSON files

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::auth::{normalize_username, UserPermissions};
use crate::error::PersistenceError;
use crate::game::collision::MapLayout;
use crate::game::ids::{AccountId, CharacterId, CharacterTemplateId, MapId};
use crate::game::region::{SpawnRegion, Vector2};

/// Result type for storage calls
pub type StoreResult<T> = std::result::Result<T, PersistenceError>;

/// One persisted spawner definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnConfigRow {
    pub template: CharacterTemplateId,
    pub amount: u8,
    pub region: SpawnRegion,
}

/// Persisted state of a user character
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterSnapshot {
    pub id: CharacterId,
    pub account: AccountId,
    pub name: String,
    pub map: MapId,
    pub position: Vector2,
    pub respawn_map: MapId,
    pub respawn_position: Vector2,
    pub hp: i32,
    pub max_hp: i32,
    pub attack: i32,
}

impl CharacterSnapshot {
    /// Fresh character standing at `position` on `map`
    pub fn new(
        id: CharacterId,
        account: AccountId,
        name: impl Into<String>,
        map: MapId,
        position: Vector2,
    ) -> Self {
        Self {
            id,
            account,
            name: name.into(),
            map,
            position,
            respawn_map: map,
            respawn_position: position,
            hp: 100,
            max_hp: 100,
            attack: 10,
        }
    }
}

/// Persisted account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: AccountId,
    /// Normalised account name
    pub name: String,
    /// Argon2 PHC string
    pub password_hash: String,
    pub email: String,
    #[serde(default)]
    pub permissions: UserPermissions,
    pub created_ip: IpAddr,
    pub created_at: DateTime<Utc>,
}

impl AccountRecord {
    /// New record created now; `name` must already be normalised
    pub fn new(
        id: AccountId,
        name: &str,
        password_hash: &str,
        email: &str,
        permissions: UserPermissions,
        created_ip: IpAddr,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            password_hash: password_hash.to_string(),
            email: email.to_string(),
            permissions,
            created_ip,
            created_at: Utc::now(),
        }
    }
}

/// A timed account ban
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanRecord {
    pub account: AccountId,
    pub reason: String,
    pub issued_by: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl BanRecord {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Storage contract consumed by the server core
pub trait GameStore: Send + Sync {
    /// Ids of every map that should be loaded at startup
    fn map_ids(&self) -> StoreResult<Vec<MapId>>;

    /// Static collision layout of a map
    fn load_map_layout(&self, map: MapId) -> StoreResult<MapLayout>;

    /// Spawner definitions for a map
    fn load_spawn_config(&self, map: MapId) -> StoreResult<Vec<SpawnConfigRow>>;

    fn load_character(&self, id: CharacterId) -> StoreResult<CharacterSnapshot>;

    fn save_character(&self, snapshot: &CharacterSnapshot) -> StoreResult<()>;

    /// Characters owned by an account
    fn account_characters(&self, account: AccountId) -> StoreResult<Vec<CharacterSnapshot>>;

    /// Create a character for an account at the given start location
    fn create_character(
        &self,
        account: AccountId,
        name: &str,
        map: MapId,
        position: Vector2,
    ) -> StoreResult<CharacterSnapshot>;

    /// Create an account. Returns `false` if the name is taken.
    fn try_create_account(
        &self,
        name: &str,
        password_hash: &str,
        email: &str,
        ip: IpAddr,
    ) -> StoreResult<bool>;

    /// Look up an account by (case-insensitive) name
    fn load_account(&self, name: &str) -> StoreResult<Option<AccountRecord>>;

    fn insert_ban(&self, ban: BanRecord) -> StoreResult<()>;

    /// Longest-running ban still active at `now`
    fn active_ban(&self, account: AccountId, now: DateTime<Utc>) -> StoreResult<Option<BanRecord>>;

    /// Remove all bans of an account, returning how many were removed
    fn remove_bans(&self, account: AccountId) -> StoreResult<usize>;
}

#[derive(Debug, Default)]
struct StoreData {
    layouts: BTreeMap<MapId, MapLayout>,
    spawns: HashMap<MapId, Vec<SpawnConfigRow>>,
    characters: BTreeMap<CharacterId, CharacterSnapshot>,
    accounts: HashMap<String, AccountRecord>,
    bans: Vec<BanRecord>,
    next_account_id: u32,
    next_character_id: u32,
}

/// In-memory [`GameStore`]
#[derive(Debug)]
pub struct MemoryStore {
    data: RwLock<StoreData>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(StoreData {
                next_account_id: 1,
                next_character_id: 1,
                ..Default::default()
            }),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate a storage outage: while unavailable every call fails
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PersistenceError::Unavailable("store offline".to_string()))
        }
    }

    /// Register a map and its spawn configuration
    pub fn insert_map(&self, layout: MapLayout, spawns: Vec<SpawnConfigRow>) {
        let mut data = self.data.write();
        data.spawns.insert(layout.id, spawns);
        data.layouts.insert(layout.id, layout);
    }

    /// Insert an account directly, returning its id
    pub fn insert_account(
        &self,
        name: &str,
        password_hash: &str,
        permissions: UserPermissions,
    ) -> AccountId {
        let mut data = self.data.write();
        let id = AccountId::new(data.next_account_id);
        data.next_account_id += 1;
        let key = normalize_username(name);
        let record = AccountRecord::new(
            id,
            &key,
            password_hash,
            "",
            permissions,
            IpAddr::from([127, 0, 0, 1]),
        );
        data.accounts.insert(key, record);
        id
    }

    /// Insert or replace a character snapshot directly
    pub fn insert_character(&self, snapshot: CharacterSnapshot) {
        let mut data = self.data.write();
        data.next_character_id = data.next_character_id.max(snapshot.id.raw() + 1);
        data.characters.insert(snapshot.id, snapshot);
    }

    /// All bans recorded for an account, active or not
    pub fn bans_for(&self, account: AccountId) -> Vec<BanRecord> {
        self.data
            .read()
            .bans
            .iter()
            .filter(|b| b.account == account)
            .cloned()
            .collect()
    }
}

impl GameStore for MemoryStore {
    fn map_ids(&self) -> StoreResult<Vec<MapId>> {
        self.check_available()?;
        Ok(self.data.read().layouts.keys().copied().collect())
    }

    fn load_map_layout(&self, map: MapId) -> StoreResult<MapLayout> {
        self.check_available()?;
        self.data
            .read()
            .layouts
            .get(&map)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(format!("map {}", map)))
    }

    fn load_spawn_config(&self, map: MapId) -> StoreResult<Vec<SpawnConfigRow>> {
        self.check_available()?;
        Ok(self.data.read().spawns.get(&map).cloned().unwrap_or_default())
    }

    fn load_character(&self, id: CharacterId) -> StoreResult<CharacterSnapshot> {
        self.check_available()?;
        self.data
            .read()
            .characters
            .get(&id)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(format!("character {}", id)))
    }

    fn save_character(&self, snapshot: &CharacterSnapshot) -> StoreResult<()> {
        self.check_available()?;
        self.data
            .write()
            .characters
            .insert(snapshot.id, snapshot.clone());
        Ok(())
    }

    fn account_characters(&self, account: AccountId) -> StoreResult<Vec<CharacterSnapshot>> {
        self.check_available()?;
        Ok(self
            .data
            .read()
            .characters
            .values()
            .filter(|c| c.account == account)
            .cloned()
            .collect())
    }

    fn create_character(
        &self,
        account: AccountId,
        name: &str,
        map: MapId,
        position: Vector2,
    ) -> StoreResult<CharacterSnapshot> {
        self.check_available()?;
        let mut data = self.data.write();
        let id = CharacterId::new(data.next_character_id);
        data.next_character_id += 1;
        let snapshot = CharacterSnapshot::new(id, account, name, map, position);
        data.characters.insert(id, snapshot.clone());
        Ok(snapshot)
    }

    fn try_create_account(
        &self,
        name: &str,
        password_hash: &str,
        email: &str,
        ip: IpAddr,
    ) -> StoreResult<bool> {
        self.check_available()?;
        let key = normalize_username(name);
        let mut data = self.data.write();
        if data.accounts.contains_key(&key) {
            return Ok(false);
        }

        let id = AccountId::new(data.next_account_id);
        data.next_account_id += 1;
        let record = AccountRecord::new(id, &key, password_hash, email, UserPermissions::User, ip);
        data.accounts.insert(key, record);
        Ok(true)
    }

    fn load_account(&self, name: &str) -> StoreResult<Option<AccountRecord>> {
        self.check_available()?;
        Ok(self
            .data
            .read()
            .accounts
            .get(&normalize_username(name))
            .cloned())
    }

    fn insert_ban(&self, ban: BanRecord) -> StoreResult<()> {
        self.check_available()?;
        self.data.write().bans.push(ban);
        Ok(())
    }

    fn active_ban(&self, account: AccountId, now: DateTime<Utc>) -> StoreResult<Option<BanRecord>> {
        self.check_available()?;
        Ok(self
            .data
            .read()
            .bans
            .iter()
            .filter(|b| b.account == account && b.is_active(now))
            .max_by_key(|b| b.expires_at)
            .cloned())
    }

    fn remove_bans(&self, account: AccountId) -> StoreResult<usize> {
        self.check_available()?;
        let mut data = self.data.write();
        let before = data.bans.len();
        data.bans.retain(|b| b.account != account);
        Ok(before - data.bans.len())
    }
}

/// Map file: collision layout plus the map's spawners
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MapFile {
    #[serde(flatten)]
    layout: MapLayout,
    #[serde(default)]
    spawns: Vec<SpawnConfigRow>,
}

/// [`GameStore`] backed by a directory of JSON files.
///
/// ```text
/// <root>/maps/<id>.json         layout + spawns
/// <root>/characters/<id>.json   character snapshots
/// <root>/accounts.json          account records
/// <root>/bans.json              ban records
/// ```
///
/// Everything is read into a [`MemoryStore`] at open. A write reaches disk
/// before it is committed to memory, so a failed write leaves both unchanged.
#[derive(Debug)]
pub struct JsonStore {
    root: PathBuf,
    memory: MemoryStore,
}

impl JsonStore {
    /// Open (and if needed create) a data directory
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("maps"))?;
        fs::create_dir_all(root.join("characters"))?;

        let memory = MemoryStore::new();

        for path in json_files(&root.join("maps"))? {
            let file: MapFile = read_json(&path)?;
            debug!(map_id = %file.layout.id, spawns = file.spawns.len(), "Loaded map file");
            memory.insert_map(file.layout, file.spawns);
        }

        for path in json_files(&root.join("characters"))? {
            let snapshot: CharacterSnapshot = read_json(&path)?;
            memory.insert_character(snapshot);
        }

        let accounts_path = root.join("accounts.json");
        if accounts_path.exists() {
            let accounts: Vec<AccountRecord> = read_json(&accounts_path)?;
            let mut data = memory.data.write();
            for account in accounts {
                data.next_account_id = data.next_account_id.max(account.id.raw() + 1);
                data.accounts.insert(account.name.clone(), account);
            }
        }

        let bans_path = root.join("bans.json");
        if bans_path.exists() {
            let bans: Vec<BanRecord> = read_json(&bans_path)?;
            memory.data.write().bans = bans;
        }

        let data = memory.data.read();
        info!(
            root = %root.display(),
            maps = data.layouts.len(),
            characters = data.characters.len(),
            accounts = data.accounts.len(),
            "JSON store opened"
        );
        drop(data);

        Ok(Self { root, memory })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn write_accounts<'a>(&self, accounts: impl Iterator<Item = &'a AccountRecord>) -> StoreResult<()> {
        let mut accounts: Vec<&AccountRecord> = accounts.collect();
        accounts.sort_by_key(|a| a.id);
        write_json(&self.root.join("accounts.json"), &accounts)
    }

    fn write_bans(&self, bans: &[BanRecord]) -> StoreResult<()> {
        write_json(&self.root.join("bans.json"), bans)
    }

    fn character_path(&self, id: CharacterId) -> PathBuf {
        self.root.join("characters").join(format!("{}.json", id))
    }
}

impl GameStore for JsonStore {
    fn map_ids(&self) -> StoreResult<Vec<MapId>> {
        self.memory.map_ids()
    }

    fn load_map_layout(&self, map: MapId) -> StoreResult<MapLayout> {
        self.memory.load_map_layout(map)
    }

    fn load_spawn_config(&self, map: MapId) -> StoreResult<Vec<SpawnConfigRow>> {
        self.memory.load_spawn_config(map)
    }

    fn load_character(&self, id: CharacterId) -> StoreResult<CharacterSnapshot> {
        self.memory.load_character(id)
    }

    fn save_character(&self, snapshot: &CharacterSnapshot) -> StoreResult<()> {
        self.memory.check_available()?;
        let mut data = self.memory.data.write();
        write_json(&self.character_path(snapshot.id), snapshot)?;
        data.characters.insert(snapshot.id, snapshot.clone());
        Ok(())
    }

    fn account_characters(&self, account: AccountId) -> StoreResult<Vec<CharacterSnapshot>> {
        self.memory.account_characters(account)
    }

    fn create_character(
        &self,
        account: AccountId,
        name: &str,
        map: MapId,
        position: Vector2,
    ) -> StoreResult<CharacterSnapshot> {
        self.memory.check_available()?;
        let mut data = self.memory.data.write();
        let id = CharacterId::new(data.next_character_id);
        let snapshot = CharacterSnapshot::new(id, account, name, map, position);
        write_json(&self.character_path(id), &snapshot)?;

        data.next_character_id += 1;
        data.characters.insert(id, snapshot.clone());
        Ok(snapshot)
    }

    fn try_create_account(
        &self,
        name: &str,
        password_hash: &str,
        email: &str,
        ip: IpAddr,
    ) -> StoreResult<bool> {
        self.memory.check_available()?;
        let key = normalize_username(name);
        let mut data = self.memory.data.write();
        if data.accounts.contains_key(&key) {
            return Ok(false);
        }

        let record = AccountRecord::new(
            AccountId::new(data.next_account_id),
            &key,
            password_hash,
            email,
            UserPermissions::User,
            ip,
        );
        self.write_accounts(data.accounts.values().chain(std::iter::once(&record)))?;

        data.next_account_id += 1;
        data.accounts.insert(key, record);
        Ok(true)
    }

    fn load_account(&self, name: &str) -> StoreResult<Option<AccountRecord>> {
        self.memory.load_account(name)
    }

    fn insert_ban(&self, ban: BanRecord) -> StoreResult<()> {
        self.memory.check_available()?;
        let mut data = self.memory.data.write();
        let mut bans = data.bans.clone();
        bans.push(ban);
        self.write_bans(&bans)?;
        data.bans = bans;
        Ok(())
    }

    fn active_ban(&self, account: AccountId, now: DateTime<Utc>) -> StoreResult<Option<BanRecord>> {
        self.memory.active_ban(account, now)
    }

    fn remove_bans(&self, account: AccountId) -> StoreResult<usize> {
        self.memory.check_available()?;
        let mut data = self.memory.data.write();
        let kept: Vec<BanRecord> = data
            .bans
            .iter()
            .filter(|b| b.account != account)
            .cloned()
            .collect();
        let removed = data.bans.len() - kept.len();
        if removed > 0 {
            self.write_bans(&kept)?;
            data.bans = kept;
        }
        Ok(removed)
    }
}

fn json_files(dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<T> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| {
        error!(path = %path.display(), error = %e, "Corrupt data file");
        PersistenceError::Corrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
    })
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> StoreResult<()> {
    let content = serde_json::to_string_pretty(value).map_err(|e| PersistenceError::Corrupt {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    // Write to a temp file first so a crash never leaves a half-written record
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path).map_err(|e| {
        warn!(path = %path.display(), error = %e, "Failed to replace data file");
        PersistenceError::Io(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn ip() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    #[test]
    fn test_try_create_account_rejects_duplicate() {
        let store = MemoryStore::new();
        assert!(store.try_create_account("Alice", "hash", "a@x.io", ip()).unwrap());
        assert!(!store.try_create_account("alice", "hash", "a@x.io", ip()).unwrap());

        let account = store.load_account("ALICE").unwrap().unwrap();
        assert_eq!(account.name, "alice");
        assert_eq!(account.permissions, UserPermissions::User);
    }

    #[test]
    fn test_character_round_trip() {
        let store = MemoryStore::new();
        let account = store.insert_account("bob", "hash", UserPermissions::User);
        let created = store
            .create_character(account, "Bob", MapId::new(1), Vector2::new(5.0, 6.0))
            .unwrap();

        let mut loaded = store.load_character(created.id).unwrap();
        assert_eq!(loaded, created);

        loaded.position = Vector2::new(50.0, 60.0);
        store.save_character(&loaded).unwrap();
        assert_eq!(store.account_characters(account).unwrap(), vec![loaded]);
    }

    #[test]
    fn test_unavailable_store_fails() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.load_account("x"),
            Err(PersistenceError::Unavailable(_))
        ));
        store.set_available(true);
        assert!(store.load_account("x").unwrap().is_none());
    }

    #[test]
    fn test_active_ban_respects_expiry() {
        let store = MemoryStore::new();
        let account = store.insert_account("eve", "hash", UserPermissions::User);
        let now = Utc::now();

        store
            .insert_ban(BanRecord {
                account,
                reason: "spam".to_string(),
                issued_by: "mod".to_string(),
                issued_at: now,
                expires_at: now + Duration::hours(1),
            })
            .unwrap();

        assert!(store.active_ban(account, now).unwrap().is_some());
        assert!(store
            .active_ban(account, now + Duration::hours(2))
            .unwrap()
            .is_none());
        assert_eq!(store.remove_bans(account).unwrap(), 1);
        assert!(store.active_ban(account, now).unwrap().is_none());
    }

    #[test]
    fn test_json_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let layout = MapLayout::new(MapId::new(3), 320.0, 240.0);
        let map_file = MapFile {
            layout: layout.clone(),
            spawns: vec![SpawnConfigRow {
                template: CharacterTemplateId::new(1),
                amount: 2,
                region: SpawnRegion::new(MapId::new(3), 0, 0, 50, 50),
            }],
        };
        fs::create_dir_all(dir.path().join("maps")).unwrap();
        write_json(&dir.path().join("maps").join("3.json"), &map_file).unwrap();

        let account_id;
        let character;
        {
            let store = JsonStore::open(dir.path()).unwrap();
            assert_eq!(store.map_ids().unwrap(), vec![MapId::new(3)]);
            assert_eq!(store.load_spawn_config(MapId::new(3)).unwrap().len(), 1);

            assert!(store.try_create_account("carol", "hash", "c@x.io", ip()).unwrap());
            account_id = store.load_account("carol").unwrap().unwrap().id;
            character = store
                .create_character(account_id, "Carol", MapId::new(3), Vector2::new(1.0, 2.0))
                .unwrap();
        }

        let reopened = JsonStore::open(dir.path()).unwrap();
        assert_eq!(reopened.load_map_layout(MapId::new(3)).unwrap(), layout);
        assert_eq!(reopened.load_account("carol").unwrap().unwrap().id, account_id);
        assert_eq!(reopened.load_character(character.id).unwrap(), character);
    }

    #[test]
    fn test_json_store_failed_write_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();

        // A directory in the way makes the final rename fail
        let accounts_path = dir.path().join("accounts.json");
        fs::create_dir(&accounts_path).unwrap();
        assert!(store.try_create_account("carol", "hash", "c@x.io", ip()).is_err());
        assert!(store.load_account("carol").unwrap().is_none());

        fs::remove_dir(&accounts_path).unwrap();
        assert!(store.try_create_account("carol", "hash", "c@x.io", ip()).unwrap());
        let account = store.load_account("carol").unwrap().unwrap().id;
        assert_eq!(account, AccountId::new(1));

        fs::create_dir(dir.path().join("characters").join("1.json")).unwrap();
        assert!(store
            .create_character(account, "Carol", MapId::new(1), Vector2::ZERO)
            .is_err());
        assert!(store.account_characters(account).unwrap().is_empty());

        fs::create_dir(dir.path().join("bans.json")).unwrap();
        let now = Utc::now();
        let ban = BanRecord {
            account,
            reason: "spam".to_string(),
            issued_by: "mod".to_string(),
            issued_at: now,
            expires_at: now + Duration::hours(1),
        };
        assert!(store.insert_ban(ban).is_err());
        assert!(store.active_ban(account, now).unwrap().is_none());
    }
}
