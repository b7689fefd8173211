//! World module
//!
//! Manages the game world including:
//! - The fixed-rate update loop (`server_update_rate_ms` per tick)
//! - Loading and unloading maps with their spawners
//! - Ticking independent maps in parallel
//! - Handing each tick's events to the session layer
//! - Periodic autosave of user characters

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{GameError, Result};
use crate::game::character::Character;
use crate::game::ids::{CharacterId, CharacterIdAllocator, MapId};
use crate::game::map::{GameMap, MapEvent, MapStats, MapTransfer, TickSummary};
use crate::game::persistence::GameStore;
use crate::game::region::Vector2;
use crate::game::spawner::SpawnLoadPolicy;
use crate::game::template::TemplateRegistry;
use crate::game::time::{GameClock, TickCount};

/// Default update rate in milliseconds
pub const DEFAULT_UPDATE_RATE_MS: u64 = 50;

/// Default interval between generic respawn passes
pub const DEFAULT_RESPAWNABLES_UPDATE_RATE_MS: u32 = 500;

/// Ticks between milestone log lines
const TICK_LOG_INTERVAL: u64 = 1_000;

/// World settings
#[derive(Debug, Clone)]
pub struct WorldSettings {
    /// World name
    pub name: String,
    /// Milliseconds per tick
    pub update_rate_ms: u64,
    /// Milliseconds between generic respawn passes on each map
    pub respawnables_update_rate_ms: u32,
    /// Autosave interval in ticks (0 to disable)
    pub autosave_interval: u64,
    /// What to do with unresolvable spawn rows
    pub spawn_load_policy: SpawnLoadPolicy,
    /// Fixed seed for map random sources
    pub rng_seed: Option<u64>,
    /// Map used when a character's stored location is unusable
    pub invalid_user_load_map: MapId,
    /// Position used with `invalid_user_load_map`
    pub invalid_user_load_position: Vector2,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            name: "Gore".to_string(),
            update_rate_ms: DEFAULT_UPDATE_RATE_MS,
            respawnables_update_rate_ms: DEFAULT_RESPAWNABLES_UPDATE_RATE_MS,
            autosave_interval: 0,
            spawn_load_policy: SpawnLoadPolicy::default(),
            rng_seed: None,
            invalid_user_load_map: MapId::new(1),
            invalid_user_load_position: Vector2::new(32.0, 32.0),
        }
    }
}

/// World state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldState {
    /// World is initializing
    Initializing,
    /// World is running normally
    Running,
    /// World is shutting down
    ShuttingDown,
    /// World has stopped
    Stopped,
}

impl WorldState {
    /// Check if the world is accepting new connections
    pub fn accepting_connections(&self) -> bool {
        matches!(self, WorldState::Running)
    }
}

/// Receives what each tick produced. Implemented by the session layer.
pub trait WorldObserver: Send + Sync {
    /// Events committed by one map during the last tick
    fn on_map_events(&self, map: MapId, events: &[MapEvent]);

    /// A character was moved to another map by the world. `to` equals the
    /// source map when the move failed and the character was put back.
    fn on_character_transferred(&self, character: CharacterId, to: MapId);

    /// A character could not be placed on any map. It has been saved and is
    /// no longer in the world.
    fn on_character_stranded(&self, character: CharacterId);
}

/// Totals for one world tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorldTickReport {
    pub maps: usize,
    pub updated: usize,
    pub failed: usize,
    pub respawned: usize,
    pub events: usize,
}

/// Game world - owns the maps and drives the tick
pub struct GameWorld {
    /// World settings
    pub settings: WorldSettings,
    /// Current world state
    state: RwLock<WorldState>,
    /// Current tick number
    tick: AtomicU64,
    /// Whether the world is running
    running: AtomicBool,
    /// Time the world started
    start_time: RwLock<Option<Instant>>,
    /// Millisecond tick source
    clock: GameClock,
    /// Loaded maps
    maps: DashMap<MapId, Arc<Mutex<GameMap>>>,
    /// Shared read-only templates
    templates: Arc<TemplateRegistry>,
    /// NPC id source shared by every map
    ids: Arc<CharacterIdAllocator>,
    /// Storage collaborator
    store: Arc<dyn GameStore>,
    /// Ticks since last autosave
    ticks_since_autosave: AtomicU64,
}

impl GameWorld {
    /// Create a new game world with custom settings
    pub fn new(
        settings: WorldSettings,
        templates: Arc<TemplateRegistry>,
        store: Arc<dyn GameStore>,
    ) -> Self {
        info!(
            name = %settings.name,
            update_rate_ms = settings.update_rate_ms,
            templates = templates.len(),
            "Creating game world"
        );

        Self {
            settings,
            state: RwLock::new(WorldState::Initializing),
            tick: AtomicU64::new(0),
            running: AtomicBool::new(false),
            start_time: RwLock::new(None),
            clock: GameClock::new(),
            maps: DashMap::new(),
            templates,
            ids: Arc::new(CharacterIdAllocator::new()),
            store,
            ticks_since_autosave: AtomicU64::new(0),
        }
    }

    /// Get the current world state
    pub fn state(&self) -> WorldState {
        *self.state.read()
    }

    /// Set the world state
    pub fn set_state(&self, new_state: WorldState) {
        let mut state = self.state.write();
        let old_state = *state;
        *state = new_state;
        info!(
            old_state = ?old_state,
            new_state = ?new_state,
            "World state changed"
        );
    }

    /// Get the current tick number
    pub fn tick(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    /// Check if the world is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get the uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time
            .read()
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    /// Current millisecond tick count
    pub fn now(&self) -> TickCount {
        self.clock.now()
    }

    pub fn store(&self) -> &Arc<dyn GameStore> {
        &self.store
    }

    pub fn templates(&self) -> &Arc<TemplateRegistry> {
        &self.templates
    }

    fn map_rng(&self, map: MapId) -> StdRng {
        match self.settings.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ u64::from(map.raw())),
            None => StdRng::from_entropy(),
        }
    }

    /// Load a map and build its spawners
    pub fn load_map(&self, map: MapId) -> Result<()> {
        if self.maps.contains_key(&map) {
            return Err(GameError::MapAlreadyLoaded(map).into());
        }

        let layout = self.store.load_map_layout(map)?;
        let rows = self.store.load_spawn_config(map)?;

        let mut game_map = GameMap::new(
            layout,
            Arc::clone(&self.templates),
            Arc::clone(&self.ids),
            self.map_rng(map),
            self.settings.respawnables_update_rate_ms,
        );
        let spawners = game_map.load_spawners(&rows, self.settings.spawn_load_policy, self.now())?;

        info!(
            map_id = %map,
            spawners = spawners,
            npcs = game_map.character_count(),
            "Map loaded"
        );
        self.maps.insert(map, Arc::new(Mutex::new(game_map)));
        Ok(())
    }

    /// Load every map the store knows about. Failed maps are logged and
    /// skipped; returns how many loaded.
    pub fn load_all_maps(&self) -> Result<usize> {
        let ids = self.store.map_ids()?;
        let mut loaded = 0;

        for map in ids {
            match self.load_map(map) {
                Ok(()) => loaded += 1,
                Err(e) => error!(map_id = %map, error = %e, "Failed to load map"),
            }
        }

        info!(loaded = loaded, "Maps loaded");
        Ok(loaded)
    }

    /// Unload a map. User characters on it are saved first; its spawners,
    /// NPCs and pending retries are dropped with it.
    pub fn unload_map(&self, map: MapId) -> Result<Vec<CharacterId>> {
        let (_, handle) = self
            .maps
            .remove(&map)
            .ok_or(GameError::MapNotFound(map))?;

        let snapshots = handle.lock().user_snapshots();
        let mut saved = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            match self.store.save_character(&snapshot) {
                Ok(()) => saved.push(snapshot.id),
                Err(e) => error!(
                    map_id = %map,
                    character = %snapshot.id,
                    error = %e,
                    "Failed to save character during map unload"
                ),
            }
        }

        Ok(saved)
    }

    pub fn map(&self, map: MapId) -> Option<Arc<Mutex<GameMap>>> {
        self.maps.get(&map).map(|m| Arc::clone(m.value()))
    }

    pub fn has_map(&self, map: MapId) -> bool {
        self.maps.contains_key(&map)
    }

    /// Loaded map ids in ascending order
    pub fn map_ids(&self) -> Vec<MapId> {
        let mut ids: Vec<MapId> = self.maps.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    pub fn map_count(&self) -> usize {
        self.maps.len()
    }

    /// Run `f` against a map while holding its lock
    pub fn with_map<R>(&self, map: MapId, f: impl FnOnce(&mut GameMap) -> R) -> Option<R> {
        let handle = self.map(map)?;
        let mut guard = handle.lock();
        Some(f(&mut guard))
    }

    /// Stats of a loaded map
    pub fn map_stats(&self, map: MapId) -> Option<MapStats> {
        self.with_map(map, |m| m.stats())
    }

    /// Put a user character on `map` at `position`, falling back to the
    /// configured invalid-load location when that map is not loaded or the
    /// position is not legal.
    pub fn place_user(
        &self,
        character: Character,
        map: MapId,
        position: Vector2,
    ) -> std::result::Result<(MapId, Vector2), GameError> {
        if let Some(handle) = self.map(map) {
            let mut game_map = handle.lock();
            if game_map.is_legal_position(position, character.body_size()) {
                game_map.insert_user(character, position)?;
                return Ok((map, position));
            }
        }

        let fallback_map = self.settings.invalid_user_load_map;
        let fallback_position = self.settings.invalid_user_load_position;
        warn!(
            character = %character.id(),
            map_id = %map,
            position = %position,
            fallback_map = %fallback_map,
            "Stored location unusable, using fallback"
        );

        let handle = self
            .map(fallback_map)
            .ok_or(GameError::MapNotFound(fallback_map))?;
        let mut game_map = handle.lock();
        game_map.insert_user(character, fallback_position)?;
        Ok((fallback_map, fallback_position))
    }

    /// Take a user character off its map
    pub fn remove_user(&self, map: MapId, character: CharacterId) -> Option<Character> {
        self.with_map(map, |m| m.remove_character(character)).flatten()
    }

    /// Run the game world tick loop
    pub async fn run(
        &self,
        shutdown_rx: &mut broadcast::Receiver<()>,
        observer: Arc<dyn WorldObserver>,
    ) {
        info!(
            name = %self.settings.name,
            update_rate_ms = self.settings.update_rate_ms,
            maps = self.map_count(),
            autosave_interval = self.settings.autosave_interval,
            "Starting game world"
        );

        // Mark as running
        self.running.store(true, Ordering::SeqCst);
        *self.start_time.write() = Some(Instant::now());
        self.set_state(WorldState::Running);

        let mut tick_interval = interval(Duration::from_millis(self.settings.update_rate_ms.max(1)));
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    self.process_tick(observer.as_ref());
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        self.set_state(WorldState::ShuttingDown);
        info!("Performing final save before shutdown");
        self.save_all();

        self.running.store(false, Ordering::SeqCst);
        self.set_state(WorldState::Stopped);

        info!(
            total_ticks = self.tick(),
            uptime_secs = self.uptime_secs(),
            "Game world stopped"
        );
    }

    /// Process one tick at the clock's current time
    pub fn process_tick(&self, observer: &dyn WorldObserver) -> WorldTickReport {
        let now = self.now();
        let report = self.process_tick_at(now, observer);

        if self.settings.autosave_interval > 0 {
            let ticks = self.ticks_since_autosave.fetch_add(1, Ordering::SeqCst) + 1;
            if ticks >= self.settings.autosave_interval {
                self.ticks_since_autosave.store(0, Ordering::SeqCst);
                self.save_all();
            }
        }

        report
    }

    /// Process one tick at an explicit time.
    ///
    /// Every map finishes its tick before any event is handed out, and maps
    /// are reported in ascending id order.
    pub fn process_tick_at(&self, now: TickCount, observer: &dyn WorldObserver) -> WorldTickReport {
        let tick_num = self.tick.fetch_add(1, Ordering::SeqCst);

        let mut maps: Vec<(MapId, Arc<Mutex<GameMap>>)> = self
            .maps
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();
        maps.sort_by_key(|(id, _)| *id);

        let results: Vec<(MapId, TickSummary, Vec<MapEvent>, Vec<MapTransfer>)> = maps
            .par_iter()
            .map(|(id, handle)| {
                let mut map = handle.lock();
                let summary = map.tick(now);
                (*id, summary, map.drain_events(), map.drain_transfers())
            })
            .collect();

        let mut report = WorldTickReport {
            maps: results.len(),
            ..Default::default()
        };
        let mut transfers = Vec::new();

        for (map, summary, events, map_transfers) in results {
            report.updated += summary.updated;
            report.failed += summary.failed;
            report.respawned += summary.respawned;
            report.events += events.len();
            if !events.is_empty() {
                observer.on_map_events(map, &events);
            }
            transfers.extend(map_transfers);
        }

        for transfer in transfers {
            self.apply_transfer(transfer, observer);
        }

        if tick_num % TICK_LOG_INTERVAL == 0 {
            debug!(
                tick = tick_num,
                maps = report.maps,
                updated = report.updated,
                failed = report.failed,
                "Game tick milestone"
            );
        }

        report
    }

    fn apply_transfer(&self, transfer: MapTransfer, observer: &dyn WorldObserver) {
        let mut character = match self.remove_user(transfer.from, transfer.character) {
            Some(c) => c,
            None => return,
        };
        character.revive();
        let original = character.clone();

        let error = match self.place_user(character, transfer.to, transfer.position) {
            Ok((map, position)) => {
                debug!(
                    character = %transfer.character,
                    from = %transfer.from,
                    to = %map,
                    position = %position,
                    "Character transferred"
                );
                observer.on_character_transferred(transfer.character, map);
                return;
            }
            Err(e) => e,
        };

        warn!(
            character = %transfer.character,
            from = %transfer.from,
            to = %transfer.to,
            error = %error,
            "Transfer failed, returning character to its map"
        );

        let snapshot = original.to_snapshot();
        let position = original.position();
        let returned = self
            .with_map(transfer.from, |m| m.insert_user(original, position))
            .unwrap_or(Err(GameError::MapNotFound(transfer.from)));
        if returned.is_ok() {
            observer.on_character_transferred(transfer.character, transfer.from);
            return;
        }

        error!(
            character = %transfer.character,
            from = %transfer.from,
            "Character could not be placed on any map"
        );
        if let Some(snapshot) = snapshot {
            if let Err(e) = self.store.save_character(&snapshot) {
                error!(character = %transfer.character, error = %e, "Failed to save stranded character");
            }
        }
        observer.on_character_stranded(transfer.character);
    }

    /// Save every user character in the world. Returns (saved, failed).
    pub fn save_all(&self) -> (usize, usize) {
        let snapshots: Vec<_> = self
            .map_ids()
            .into_iter()
            .filter_map(|id| self.with_map(id, |m| m.user_snapshots()))
            .flatten()
            .collect();

        if snapshots.is_empty() {
            return (0, 0);
        }

        info!(characters = snapshots.len(), "Starting autosave");
        let mut saved = 0;
        let mut failed = 0;

        for snapshot in &snapshots {
            match self.store.save_character(snapshot) {
                Ok(()) => saved += 1,
                Err(e) => {
                    failed += 1;
                    error!(character = %snapshot.id, error = %e, "Failed to autosave character");
                }
            }
        }

        info!(saved = saved, failed = failed, "Autosave complete");
        (saved, failed)
    }

    /// Get world info as a string
    pub fn info(&self) -> String {
        format!(
            "{} - {} maps - Tick {} - Uptime {}s",
            self.settings.name,
            self.map_count(),
            self.tick(),
            self.uptime_secs()
        )
    }
}

impl std::fmt::Debug for GameWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameWorld")
            .field("settings", &self.settings)
            .field("state", &self.state())
            .field("tick", &self.tick())
            .field("running", &self.is_running())
            .field("maps", &self.map_ids())
            .field("uptime_secs", &self.uptime_secs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserPermissions;
    use crate::game::collision::MapLayout;
    use crate::game::ids::{CharacterTemplateId, AccountId};
    use crate::game::persistence::{CharacterSnapshot, MemoryStore, SpawnConfigRow};
    use crate::game::region::{Rect, SpawnRegion};
    use crate::game::template::CharacterTemplate;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(MapId, MapEvent)>>,
        transfers: Mutex<Vec<(CharacterId, MapId)>>,
        stranded: Mutex<Vec<CharacterId>>,
    }

    impl WorldObserver for Recorder {
        fn on_map_events(&self, map: MapId, events: &[MapEvent]) {
            self.events
                .lock()
                .extend(events.iter().cloned().map(|e| (map, e)));
        }

        fn on_character_transferred(&self, character: CharacterId, to: MapId) {
            self.transfers.lock().push((character, to));
        }

        fn on_character_stranded(&self, character: CharacterId) {
            self.stranded.lock().push(character);
        }
    }

    fn store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for id in [1u16, 2] {
            store.insert_map(
                MapLayout::new(MapId::new(id), 400.0, 400.0),
                vec![SpawnConfigRow {
                    template: CharacterTemplateId::new(1),
                    amount: 2,
                    region: SpawnRegion::new(MapId::new(id), 0, 0, 100, 100),
                }],
            );
        }
        store
    }

    fn world(store: Arc<MemoryStore>) -> GameWorld {
        let templates = Arc::new(TemplateRegistry::from_templates(vec![CharacterTemplate::new(
            CharacterTemplateId::new(1),
            "Bat",
        )]));
        let settings = WorldSettings {
            rng_seed: Some(3),
            ..Default::default()
        };
        GameWorld::new(settings, templates, store)
    }

    fn snapshot(id: u32, map: u16, position: Vector2) -> CharacterSnapshot {
        CharacterSnapshot::new(
            CharacterId::new(id),
            AccountId::new(id),
            format!("hero{}", id),
            MapId::new(map),
            position,
        )
    }

    #[test]
    fn test_world_state() {
        let world = world(store());
        assert_eq!(world.state(), WorldState::Initializing);
        world.set_state(WorldState::Running);
        assert!(world.state().accepting_connections());
        world.set_state(WorldState::Stopped);
        assert!(!world.state().accepting_connections());
    }

    #[test]
    fn test_load_and_unload_maps() {
        let world = world(store());
        assert_eq!(world.load_all_maps().unwrap(), 2);
        assert_eq!(world.map_ids(), vec![MapId::new(1), MapId::new(2)]);
        assert!(matches!(
            world.load_map(MapId::new(1)),
            Err(crate::error::GoreError::Game(GameError::MapAlreadyLoaded(_)))
        ));

        world.unload_map(MapId::new(2)).unwrap();
        assert!(!world.has_map(MapId::new(2)));
        assert!(world.unload_map(MapId::new(2)).is_err());
    }

    #[test]
    fn test_tick_delivers_events_after_tick() {
        let world = world(store());
        world.load_all_maps().unwrap();
        let recorder = Recorder::default();

        let report = world.process_tick_at(TickCount::from_millis(10), &recorder);
        assert_eq!(report.maps, 2);
        assert_eq!(report.updated, 4);

        let spawned = recorder
            .events
            .lock()
            .iter()
            .filter(|(_, e)| matches!(e, MapEvent::CharacterSpawned { .. }))
            .count();
        assert_eq!(spawned, 4);
        assert_eq!(world.tick(), 1);
    }

    #[test]
    fn test_place_user_falls_back() {
        let world = world(store());
        world.load_all_maps().unwrap();

        let lost = Character::from_snapshot(&snapshot(1, 9, Vector2::new(10.0, 10.0)));
        let (map, position) = world
            .place_user(lost, MapId::new(9), Vector2::new(10.0, 10.0))
            .unwrap();
        assert_eq!(map, world.settings.invalid_user_load_map);
        assert_eq!(position, world.settings.invalid_user_load_position);

        let walled = Character::from_snapshot(&snapshot(2, 2, Vector2::new(390.0, 390.0)));
        let (map, _) = world
            .place_user(walled, MapId::new(2), Vector2::new(390.0, 390.0))
            .unwrap();
        assert_eq!(map, MapId::new(1));

        let fine = Character::from_snapshot(&snapshot(3, 2, Vector2::new(200.0, 200.0)));
        let (map, position) = world
            .place_user(fine, MapId::new(2), Vector2::new(200.0, 200.0))
            .unwrap();
        assert_eq!((map, position), (MapId::new(2), Vector2::new(200.0, 200.0)));
    }

    #[test]
    fn test_save_all_and_unload_persist_users() {
        let store = store();
        let account = store.insert_account("hero", "hash", UserPermissions::User);
        let world = world(store.clone());
        world.load_all_maps().unwrap();

        let mut snap = snapshot(7, 1, Vector2::new(200.0, 200.0));
        snap.account = account;
        world
            .place_user(Character::from_snapshot(&snap), MapId::new(1), snap.position)
            .unwrap();

        assert_eq!(world.save_all(), (1, 0));
        assert_eq!(store.load_character(CharacterId::new(7)).unwrap().account, account);

        assert_eq!(world.unload_map(MapId::new(1)).unwrap(), vec![CharacterId::new(7)]);
    }

    #[test]
    fn test_respawn_transfer_moves_character() {
        let world = world(store());
        world.load_all_maps().unwrap();
        let recorder = Recorder::default();

        let mut snap = snapshot(5, 1, Vector2::new(200.0, 200.0));
        snap.respawn_map = MapId::new(2);
        snap.respawn_position = Vector2::new(250.0, 250.0);
        world
            .place_user(Character::from_snapshot(&snap), MapId::new(1), snap.position)
            .unwrap();

        world.with_map(MapId::new(1), |m| {
            m.kill_character(CharacterId::new(5), TickCount::from_millis(0))
                .unwrap()
        });
        world.process_tick_at(TickCount::from_millis(6_000), &recorder);

        assert_eq!(
            recorder.transfers.lock().as_slice(),
            &[(CharacterId::new(5), MapId::new(2))]
        );
        let character = world
            .with_map(MapId::new(2), |m| m.character(CharacterId::new(5)).cloned())
            .flatten()
            .unwrap();
        assert!(character.is_alive());
        assert_eq!(character.position(), Vector2::new(250.0, 250.0));
        assert!(world
            .with_map(MapId::new(1), |m| m.character(CharacterId::new(5)).is_none())
            .unwrap());
    }

    #[test]
    fn test_failed_transfer_returns_character_to_source_map() {
        let store = Arc::new(MemoryStore::new());
        store.insert_map(MapLayout::new(MapId::new(1), 400.0, 400.0), Vec::new());
        store.insert_map(
            MapLayout::new(MapId::new(2), 400.0, 400.0)
                .with_wall(Rect::new(0.0, 0.0, 400.0, 400.0)),
            Vec::new(),
        );
        let world = GameWorld::new(
            WorldSettings {
                rng_seed: Some(3),
                invalid_user_load_map: MapId::new(9),
                ..Default::default()
            },
            Arc::new(TemplateRegistry::default()),
            store.clone(),
        );
        world.load_all_maps().unwrap();
        let recorder = Recorder::default();

        let mut snap = snapshot(5, 1, Vector2::new(200.0, 200.0));
        snap.respawn_map = MapId::new(2);
        snap.respawn_position = Vector2::new(250.0, 250.0);
        world
            .place_user(Character::from_snapshot(&snap), MapId::new(1), snap.position)
            .unwrap();

        world.with_map(MapId::new(1), |m| {
            m.kill_character(CharacterId::new(5), TickCount::from_millis(0))
                .unwrap()
        });
        world.process_tick_at(TickCount::from_millis(6_000), &recorder);

        let character = world
            .with_map(MapId::new(1), |m| m.character(CharacterId::new(5)).cloned())
            .flatten()
            .expect("character back on its source map");
        assert!(character.is_alive());
        assert_eq!(character.position(), Vector2::new(200.0, 200.0));
        assert_eq!(
            recorder.transfers.lock().as_slice(),
            &[(CharacterId::new(5), MapId::new(1))]
        );
        assert!(recorder.stranded.lock().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let world = Arc::new(world(store()));
        world.load_all_maps().unwrap();
        let (tx, mut rx) = broadcast::channel(1);

        let runner = Arc::clone(&world);
        let handle = tokio::spawn(async move {
            runner.run(&mut rx, Arc::new(Recorder::default())).await;
        });

        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(world.state(), WorldState::Stopped);
        assert!(world.tick() > 0);
    }
}
