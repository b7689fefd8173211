//! Game maps
//!
//! A `GameMap` is the unit of simulation: it owns the entity registry for
//! one map, the spawners configured for it, its random source and its
//! statistics. Nothing on a map is shared with another map, so maps can be
//! ticked in parallel.
//!
//! All state changes clients should hear about are buffered as
//! [`MapEvent`]s and drained by the world after the tick that produced them.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::error::GameError;
use crate::game::character::{Character, SpawnerId, StatusEffectKind, UpdateContext};
use crate::game::collision::MapLayout;
use crate::game::ids::{CharacterId, CharacterIdAllocator, MapId};
use crate::game::persistence::{CharacterSnapshot, SpawnConfigRow};
use crate::game::region::Vector2;
use crate::game::spawner::{load_spawners, NpcSpawner, SpawnContext, SpawnLoadPolicy};
use crate::game::template::TemplateRegistry;
use crate::game::time::TickCount;

/// Maximum distance between attacker and target for a melee hit
pub const ATTACK_RANGE: f32 = 48.0;

/// How long a hit that does not kill holds the target in place
pub const HIT_STUN_MS: u32 = 250;

/// Per-map counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MapStats {
    /// NPCs placed into play (initial spawn, respawn or retry)
    pub npc_spawned: u64,
    /// Spawner-owned NPCs killed
    pub spawned_npc_killed: u64,
    /// Placement retries after a failure
    pub placement_retries: u64,
}

/// State change produced by a tick or a mutation between ticks
#[derive(Debug, Clone, PartialEq)]
pub enum MapEvent {
    CharacterSpawned {
        map: MapId,
        character: CharacterId,
        name: String,
        position: Vector2,
        npc: bool,
    },
    CharacterDespawned {
        map: MapId,
        character: CharacterId,
    },
    CharacterMoved {
        map: MapId,
        character: CharacterId,
        position: Vector2,
    },
    CharacterDied {
        map: MapId,
        character: CharacterId,
    },
}

/// Request to move a character to another map, handled by the world
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapTransfer {
    pub character: CharacterId,
    pub from: MapId,
    pub to: MapId,
    pub position: Vector2,
}

/// Result of one map tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub updated: usize,
    pub failed: usize,
    pub respawned: usize,
}

/// Result of a melee attack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttackOutcome {
    pub damage: i32,
    pub killed: bool,
}

/// One loaded map
pub struct GameMap {
    id: MapId,
    layout: MapLayout,
    characters: BTreeMap<CharacterId, Character>,
    spawners: Vec<NpcSpawner>,
    templates: Arc<TemplateRegistry>,
    ids: Arc<CharacterIdAllocator>,
    rng: StdRng,
    stats: MapStats,
    events: Vec<MapEvent>,
    transfers: Vec<MapTransfer>,
    last_tick: Option<TickCount>,
    last_respawn_check: TickCount,
    respawnables_update_rate_ms: u32,
}

impl GameMap {
    pub fn new(
        layout: MapLayout,
        templates: Arc<TemplateRegistry>,
        ids: Arc<CharacterIdAllocator>,
        rng: StdRng,
        respawnables_update_rate_ms: u32,
    ) -> Self {
        Self {
            id: layout.id,
            layout,
            characters: BTreeMap::new(),
            spawners: Vec::new(),
            templates,
            ids,
            rng,
            stats: MapStats::default(),
            events: Vec::new(),
            transfers: Vec::new(),
            last_tick: None,
            last_respawn_check: TickCount::ZERO,
            respawnables_update_rate_ms,
        }
    }

    /// Create this map's spawners from its configuration rows
    pub fn load_spawners(
        &mut self,
        rows: &[SpawnConfigRow],
        policy: SpawnLoadPolicy,
        now: TickCount,
    ) -> Result<usize, GameError> {
        let templates = Arc::clone(&self.templates);
        let ids = Arc::clone(&self.ids);
        let mut ctx = SpawnContext {
            now,
            characters: &mut self.characters,
            layout: &self.layout,
            rng: &mut self.rng,
            stats: &mut self.stats,
            events: &mut self.events,
            ids: &ids,
        };

        let spawners = load_spawners(self.id, rows, &templates, policy, &mut ctx)?;
        let loaded = spawners.len();
        self.spawners.extend(spawners);
        self.last_respawn_check = now;
        Ok(loaded)
    }

    pub fn id(&self) -> MapId {
        self.id
    }

    pub fn layout(&self) -> &MapLayout {
        &self.layout
    }

    pub fn stats(&self) -> MapStats {
        self.stats
    }

    pub fn spawners(&self) -> &[NpcSpawner] {
        &self.spawners
    }

    pub fn spawner(&self, id: SpawnerId) -> Option<&NpcSpawner> {
        self.spawners.get(id.0)
    }

    pub fn character(&self, id: CharacterId) -> Option<&Character> {
        self.characters.get(&id)
    }

    pub fn character_mut(&mut self, id: CharacterId) -> Option<&mut Character> {
        self.characters.get_mut(&id)
    }

    /// Characters in update order
    pub fn characters(&self) -> impl Iterator<Item = &Character> {
        self.characters.values()
    }

    pub fn character_count(&self) -> usize {
        self.characters.len()
    }

    pub fn user_count(&self) -> usize {
        self.characters.values().filter(|c| !c.is_npc()).count()
    }

    pub fn is_legal_position(&self, position: Vector2, size: Vector2) -> bool {
        self.layout.is_legal_position(position, size)
    }

    /// Put a user character into play at `position`
    pub fn insert_user(
        &mut self,
        mut character: Character,
        position: Vector2,
    ) -> Result<(), GameError> {
        if !self.layout.is_legal_position(position, character.body_size()) {
            return Err(GameError::InvalidLocation {
                x: position.x,
                y: position.y,
            });
        }

        let id = character.id();
        character.set_map(self.id);
        character.set_position(position);
        character.set_alive(true);
        self.events.push(MapEvent::CharacterSpawned {
            map: self.id,
            character: id,
            name: character.name().to_string(),
            position,
            npc: false,
        });
        self.characters.insert(id, character);

        debug!(map_id = %self.id, character = %id, position = %position, "Character entered map");
        Ok(())
    }

    /// Take a user character out of the map
    pub fn remove_character(&mut self, id: CharacterId) -> Option<Character> {
        let character = self.characters.get(&id)?;
        if character.is_npc() {
            // NPCs belong to their spawner for the lifetime of the map
            return None;
        }

        let character = self.characters.remove(&id)?;
        self.events.push(MapEvent::CharacterDespawned {
            map: self.id,
            character: id,
        });
        debug!(map_id = %self.id, character = %id, "Character left map");
        Some(character)
    }

    /// Request movement for a character; a zero vector stops it
    pub fn set_direction(&mut self, id: CharacterId, direction: Vector2) -> Result<(), GameError> {
        if !direction.is_finite() {
            return Err(GameError::InvalidLocation {
                x: direction.x,
                y: direction.y,
            });
        }

        let character = self
            .characters
            .get_mut(&id)
            .ok_or(GameError::CharacterNotFound(id))?;
        if !character.is_alive() {
            return Err(GameError::InvalidCharacterState("character is dead".to_string()));
        }
        character.set_direction(direction);
        Ok(())
    }

    /// Move a character to `position` on this map.
    ///
    /// Returns `Ok(false)` when the target is illegal. Spawner-owned NPCs are
    /// then handed to their spawner's no-legal-position handler.
    pub fn teleport(
        &mut self,
        id: CharacterId,
        position: Vector2,
        now: TickCount,
    ) -> Result<bool, GameError> {
        let character = self
            .characters
            .get_mut(&id)
            .ok_or(GameError::CharacterNotFound(id))?;

        if self.layout.is_legal_position(position, character.body_size()) {
            character.set_position(position);
            character.stop();
            self.events.push(MapEvent::CharacterMoved {
                map: self.id,
                character: id,
                position,
            });
            return Ok(true);
        }

        if let Some(spawner) = character.spawner().and_then(|s| self.spawners.get(s.0)) {
            spawner.handle_no_legal_position_found(character, position, now);
            self.events.push(MapEvent::CharacterDespawned {
                map: self.id,
                character: id,
            });
        }
        Ok(false)
    }

    /// Kill a character. Returns `true` if it was alive.
    pub fn kill_character(&mut self, id: CharacterId, now: TickCount) -> Result<bool, GameError> {
        let character = self
            .characters
            .get_mut(&id)
            .ok_or(GameError::CharacterNotFound(id))?;

        if !character.kill(now) {
            return Ok(false);
        }
        self.on_died(id);
        Ok(true)
    }

    /// Melee attack from one character on another
    pub fn attack(
        &mut self,
        attacker: CharacterId,
        target: CharacterId,
        now: TickCount,
    ) -> Result<AttackOutcome, GameError> {
        if attacker == target {
            return Err(GameError::InvalidCharacterState(
                "cannot attack yourself".to_string(),
            ));
        }

        let (from, damage) = {
            let a = self
                .characters
                .get(&attacker)
                .ok_or(GameError::CharacterNotFound(attacker))?;
            if !a.is_alive() {
                return Err(GameError::InvalidCharacterState("attacker is dead".to_string()));
            }
            (a.position(), a.attack())
        };

        let victim = self
            .characters
            .get_mut(&target)
            .ok_or(GameError::CharacterNotFound(target))?;
        if !victim.is_alive() {
            return Err(GameError::InvalidCharacterState("target is dead".to_string()));
        }
        if from.distance_to(&victim.position()) > ATTACK_RANGE {
            return Err(GameError::OutOfRange);
        }

        let killed = victim.apply_damage(damage, now);
        if killed {
            self.on_died(target);
        } else {
            victim.add_status_effect(StatusEffectKind::Stun, HIT_STUN_MS, now);
        }

        trace!(
            map_id = %self.id,
            attacker = %attacker,
            target = %target,
            damage = damage,
            killed = killed,
            "Attack"
        );
        Ok(AttackOutcome { damage, killed })
    }

    /// Death notification: fired once per alive → dead transition
    fn on_died(&mut self, id: CharacterId) {
        self.events.push(MapEvent::CharacterDied {
            map: self.id,
            character: id,
        });

        let character = match self.characters.get_mut(&id) {
            Some(c) => c,
            None => return,
        };
        if let Some(spawner) = character.spawner().and_then(|s| self.spawners.get(s.0)) {
            spawner.on_killed(character, &mut self.rng, &mut self.stats);
        }
    }

    /// Advance the map by one tick.
    ///
    /// Entities update in id order, then spawners in creation order, then
    /// the respawn pass runs if its interval has passed. A failing entity is
    /// logged and skipped; the rest of the tick still runs.
    pub fn tick(&mut self, now: TickCount) -> TickSummary {
        let elapsed_ms = match self.last_tick {
            Some(last) => now.elapsed_since(last),
            None => 0,
        };
        self.last_tick = Some(now);

        let mut summary = TickSummary::default();
        let mut ctx = UpdateContext {
            now,
            elapsed_ms,
            layout: &self.layout,
            rng: &mut self.rng,
        };

        for (id, character) in self.characters.iter_mut() {
            match character.update(&mut ctx) {
                Ok(moved) => {
                    summary.updated += 1;
                    if moved {
                        self.events.push(MapEvent::CharacterMoved {
                            map: self.id,
                            character: *id,
                            position: character.position(),
                        });
                    }
                }
                Err(e) => {
                    summary.failed += 1;
                    character.stop();
                    warn!(map_id = %self.id, character = %id, error = %e, "Entity update failed");
                }
            }
        }

        let mut spawn_ctx = SpawnContext {
            now,
            characters: &mut self.characters,
            layout: &self.layout,
            rng: &mut self.rng,
            stats: &mut self.stats,
            events: &mut self.events,
            ids: &self.ids,
        };
        for spawner in &self.spawners {
            spawner.update(&mut spawn_ctx);
        }

        if now.has_elapsed(self.last_respawn_check, self.respawnables_update_rate_ms) {
            self.last_respawn_check = now;
            summary.respawned = self.respawn_due(now);
        }

        summary
    }

    /// Generic respawn: revive dead characters whose delay has passed at
    /// their staged respawn target
    fn respawn_due(&mut self, now: TickCount) -> usize {
        let due: Vec<CharacterId> = self
            .characters
            .values()
            .filter(|c| !c.is_alive() && !c.is_awaiting_position() && c.is_respawn_due(now))
            .map(|c| c.id())
            .collect();

        let mut respawned = 0;
        for id in due {
            let character = match self.characters.get_mut(&id) {
                Some(c) => c,
                None => continue,
            };

            let target_map = character.respawn_map().unwrap_or(self.id);
            let position = character.respawn_position().unwrap_or(character.position());

            if target_map != self.id {
                self.transfers.push(MapTransfer {
                    character: id,
                    from: self.id,
                    to: target_map,
                    position,
                });
                continue;
            }

            if self.layout.is_legal_position(position, character.body_size()) {
                character.set_position(position);
                character.revive();
                if character.is_npc() {
                    self.stats.npc_spawned += 1;
                }
                self.events.push(MapEvent::CharacterSpawned {
                    map: self.id,
                    character: id,
                    name: character.name().to_string(),
                    position,
                    npc: character.is_npc(),
                });
                respawned += 1;
            } else if let Some(spawner) = character.spawner().and_then(|s| self.spawners.get(s.0)) {
                spawner.handle_no_legal_position_found(character, position, now);
            } else {
                // Users stay dead and are retried on the next pass
                trace!(map_id = %self.id, character = %id, "Respawn position blocked");
            }
        }

        respawned
    }

    /// Take the events buffered since the last drain
    pub fn drain_events(&mut self) -> Vec<MapEvent> {
        std::mem::take(&mut self.events)
    }

    /// Take pending cross-map respawns
    pub fn drain_transfers(&mut self) -> Vec<MapTransfer> {
        std::mem::take(&mut self.transfers)
    }

    /// Snapshot every user character on the map
    pub fn user_snapshots(&self) -> Vec<CharacterSnapshot> {
        self.characters
            .values()
            .filter_map(|c| c.to_snapshot())
            .collect()
    }
}

impl Drop for GameMap {
    fn drop(&mut self) {
        info!(
            map_id = %self.id,
            characters = self.characters.len(),
            spawners = self.spawners.len(),
            "Map unloaded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::character::CharacterKind;
    use crate::game::ids::{AccountId, CharacterTemplateId};
    use crate::game::region::{Rect, SpawnRegion};
    use crate::game::template::CharacterTemplate;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;

    fn templates() -> Arc<TemplateRegistry> {
        Arc::new(TemplateRegistry::from_templates(vec![
            CharacterTemplate::new(CharacterTemplateId::new(1), "Wolf").with_respawn_secs(2),
        ]))
    }

    fn map_with_spawner(amount: u8) -> GameMap {
        let layout = MapLayout::new(MapId::new(1), 300.0, 300.0);
        let mut map = GameMap::new(
            layout,
            templates(),
            Arc::new(CharacterIdAllocator::new()),
            StdRng::seed_from_u64(9),
            500,
        );
        map.load_spawners(
            &[SpawnConfigRow {
                template: CharacterTemplateId::new(1),
                amount,
                region: SpawnRegion::new(MapId::new(1), 0, 0, 100, 100),
            }],
            SpawnLoadPolicy::Skip,
            TickCount::ZERO,
        )
        .unwrap();
        map
    }

    fn user(id: u32) -> Character {
        Character::from_snapshot(&CharacterSnapshot::new(
            CharacterId::new(id),
            AccountId::new(id),
            format!("user{}", id),
            MapId::new(1),
            Vector2::new(150.0, 150.0),
        ))
    }

    #[test]
    fn test_kill_stages_respawn_and_counts_once() {
        let mut map = map_with_spawner(3);
        let npc = map.spawners()[0].slots()[0];
        map.drain_events();

        assert!(map.kill_character(npc, TickCount::from_millis(100)).unwrap());
        assert!(!map.kill_character(npc, TickCount::from_millis(110)).unwrap());
        map.tick(TickCount::from_millis(150));

        let character = map.character(npc).unwrap();
        assert!(!character.is_alive());
        assert!(character.respawn_position().is_some());
        assert_eq!(map.stats().spawned_npc_killed, 1);

        let died = map
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, MapEvent::CharacterDied { .. }))
            .count();
        assert_eq!(died, 1);
    }

    #[test]
    fn test_generic_respawn_after_delay() {
        let mut map = map_with_spawner(1);
        let npc = map.spawners()[0].slots()[0];
        map.kill_character(npc, TickCount::from_millis(1_000)).unwrap();
        let staged = map.character(npc).unwrap().respawn_position().unwrap();

        map.tick(TickCount::from_millis(2_500));
        assert!(!map.character(npc).unwrap().is_alive());

        let summary = map.tick(TickCount::from_millis(3_000));
        assert_eq!(summary.respawned, 1);
        let character = map.character(npc).unwrap();
        assert!(character.is_alive());
        assert_eq!(character.position(), staged);
        assert_eq!(map.stats().npc_spawned, 2);
    }

    #[test]
    fn test_blocked_respawn_goes_to_spawner() {
        let mut map = map_with_spawner(1);
        let npc = map.spawners()[0].slots()[0];
        map.kill_character(npc, TickCount::from_millis(0)).unwrap();
        map.layout.walls.push(Rect::new(0.0, 0.0, 300.0, 300.0));

        map.tick(TickCount::from_millis(2_000));
        let character = map.character(npc).unwrap();
        assert!(!character.is_alive());
        assert_eq!(
            character.awaiting_position_since(),
            Some(TickCount::from_millis(2_000))
        );

        map.layout.walls.clear();
        map.tick(TickCount::from_millis(2_999));
        assert!(!map.character(npc).unwrap().is_alive());
        map.tick(TickCount::from_millis(3_000));
        assert!(map.character(npc).unwrap().is_alive());
        assert_eq!(map.stats().placement_retries, 1);
    }

    #[test]
    fn test_failing_entity_does_not_abort_tick() {
        let mut map = map_with_spawner(2);
        map.insert_user(user(1), Vector2::new(150.0, 150.0)).unwrap();
        map.insert_user(user(2), Vector2::new(200.0, 200.0)).unwrap();
        map.tick(TickCount::from_millis(0));

        map.character_mut(CharacterId::new(1))
            .unwrap()
            .set_direction(Vector2::new(f32::INFINITY, 0.0));
        map.set_direction(CharacterId::new(2), Vector2::new(1.0, 0.0))
            .unwrap();

        let summary = map.tick(TickCount::from_millis(100));
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.updated, 3);
        assert!(map.character(CharacterId::new(2)).unwrap().position().x > 200.0);
    }

    #[test]
    fn test_set_direction_rejects_non_finite() {
        let mut map = map_with_spawner(1);
        map.insert_user(user(1), Vector2::new(150.0, 150.0)).unwrap();
        assert!(map
            .set_direction(CharacterId::new(1), Vector2::new(f32::NAN, 1.0))
            .is_err());
    }

    #[test]
    fn test_insert_user_rejects_illegal_position() {
        let mut map = map_with_spawner(1);
        let result = map.insert_user(user(1), Vector2::new(299.0, 10.0));
        assert!(matches!(result, Err(GameError::InvalidLocation { .. })));
        assert!(map.character(CharacterId::new(1)).is_none());
    }

    #[test]
    fn test_remove_character_only_users() {
        let mut map = map_with_spawner(1);
        let npc = map.spawners()[0].slots()[0];
        map.insert_user(user(1), Vector2::new(150.0, 150.0)).unwrap();

        assert!(map.remove_character(npc).is_none());
        let removed = map.remove_character(CharacterId::new(1)).unwrap();
        assert_eq!(removed.kind(), CharacterKind::User(AccountId::new(1)));
        assert!(map.remove_character(CharacterId::new(1)).is_none());
    }

    #[test]
    fn test_attack_kills_npc_through_spawner() {
        let mut map = map_with_spawner(1);
        let npc = map.spawners()[0].slots()[0];
        let npc_pos = map.character(npc).unwrap().position();
        map.insert_user(user(1), npc_pos).unwrap();

        let mut killed = false;
        for i in 0..10 {
            let outcome = map
                .attack(CharacterId::new(1), npc, TickCount::from_millis(i))
                .unwrap();
            if outcome.killed {
                killed = true;
                break;
            }
        }
        assert!(killed);
        assert_eq!(map.stats().spawned_npc_killed, 1);
        assert!(matches!(
            map.attack(CharacterId::new(1), npc, TickCount::from_millis(20)),
            Err(GameError::InvalidCharacterState(_))
        ));
    }

    #[test]
    fn test_hit_stuns_target_briefly() {
        let mut map = map_with_spawner(1);
        map.insert_user(user(1), Vector2::new(100.0, 100.0)).unwrap();
        map.insert_user(user(2), Vector2::new(120.0, 100.0)).unwrap();
        map.set_direction(CharacterId::new(2), Vector2::new(1.0, 0.0))
            .unwrap();
        map.tick(TickCount::from_millis(900));
        let start = map.character(CharacterId::new(2)).unwrap().position();

        let outcome = map
            .attack(CharacterId::new(1), CharacterId::new(2), TickCount::from_millis(1_000))
            .unwrap();
        assert!(!outcome.killed);
        assert!(map
            .character(CharacterId::new(2))
            .unwrap()
            .has_status_effect(StatusEffectKind::Stun));

        // Held in place while stunned
        map.tick(TickCount::from_millis(1_100));
        assert_eq!(map.character(CharacterId::new(2)).unwrap().position(), start);

        // Free to move once it wears off
        map.tick(TickCount::from_millis(1_000 + HIT_STUN_MS + 100));
        let character = map.character(CharacterId::new(2)).unwrap();
        assert!(!character.has_status_effect(StatusEffectKind::Stun));
        assert!(character.position().x > start.x);
    }

    #[test]
    fn test_attack_out_of_range() {
        let mut map = map_with_spawner(1);
        map.insert_user(user(1), Vector2::new(10.0, 10.0)).unwrap();
        map.insert_user(user(2), Vector2::new(250.0, 250.0)).unwrap();
        assert_eq!(
            map.attack(CharacterId::new(1), CharacterId::new(2), TickCount::ZERO),
            Err(GameError::OutOfRange)
        );
    }

    #[test]
    fn test_user_respawn_to_other_map_is_transferred() {
        let mut map = map_with_spawner(1);
        let mut snapshot = CharacterSnapshot::new(
            CharacterId::new(1),
            AccountId::new(1),
            "traveller",
            MapId::new(1),
            Vector2::new(150.0, 150.0),
        );
        snapshot.respawn_map = MapId::new(2);
        map.insert_user(Character::from_snapshot(&snapshot), Vector2::new(150.0, 150.0))
            .unwrap();

        map.kill_character(CharacterId::new(1), TickCount::from_millis(0))
            .unwrap();
        map.tick(TickCount::from_millis(6_000));

        let transfers = map.drain_transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].to, MapId::new(2));
    }
}
