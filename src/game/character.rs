//! Character entities
//!
//! A `Character` is any entity that lives on a map: user-controlled
//! characters loaded through a session, and NPCs created by a spawner.
//! Characters handle:
//! - Liveness (hit points, kill, revive)
//! - Staged respawn targets
//! - Per-tick movement integration, AI and status-effect timers

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::GameError;
use crate::game::collision::MapLayout;
use crate::game::ids::{AccountId, CharacterId, MapId};
use crate::game::persistence::CharacterSnapshot;
use crate::game::region::Vector2;
use crate::game::template::{AiKind, CharacterTemplate};
use crate::game::time::TickCount;

/// How often a wandering NPC picks a new direction
pub const WANDER_DECISION_MS: u32 = 3_000;

/// Collision size of user-controlled characters
pub const USER_BODY_SIZE: Vector2 = Vector2 { x: 16.0, y: 24.0 };

/// Movement speed of user-controlled characters (units per second)
pub const USER_MOVE_SPEED: f32 = 120.0;

/// Delay before a dead user character is respawned
pub const USER_RESPAWN_DELAY_MS: u32 = 5_000;

/// Index of a spawner on its map.
///
/// This is the NPC's only link back to the spawner that created it. It does
/// not keep the spawner alive; it is only used to call back into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpawnerId(pub usize);

/// Who controls a character
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacterKind {
    /// Loaded from persistence for a logged-in account
    User(AccountId),
    /// Created by a spawner
    Npc,
}

/// Timed status effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusEffectKind {
    /// Cannot move
    Stun,
    /// Moves 50% faster
    Haste,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEffect {
    pub kind: StatusEffectKind,
    pub applied_at: TickCount,
    pub duration_ms: u32,
}

impl StatusEffect {
    pub fn is_expired(&self, now: TickCount) -> bool {
        now.has_elapsed(self.applied_at, self.duration_ms)
    }
}

/// Everything a character needs from its map to update for one tick
pub struct UpdateContext<'a> {
    pub now: TickCount,
    pub elapsed_ms: u32,
    pub layout: &'a MapLayout,
    pub rng: &'a mut StdRng,
}

/// A character on a map
#[derive(Debug, Clone)]
pub struct Character {
    id: CharacterId,
    name: String,
    kind: CharacterKind,
    template: Option<Arc<CharacterTemplate>>,
    map: MapId,
    position: Vector2,
    velocity: Vector2,
    body_size: Vector2,
    move_speed: f32,
    hp: i32,
    max_hp: i32,
    attack: i32,
    alive: bool,
    died_at: Option<TickCount>,
    respawn_delay_ms: u32,
    respawn_map: Option<MapId>,
    respawn_position: Option<Vector2>,
    spawner: Option<SpawnerId>,
    awaiting_position_since: Option<TickCount>,
    placement_retries: u32,
    status_effects: Vec<StatusEffect>,
    ai_decided_at: Option<TickCount>,
}

impl Character {
    /// Create an NPC from a template. It starts dead until it is placed.
    pub fn new_npc(
        id: CharacterId,
        template: Arc<CharacterTemplate>,
        map: MapId,
        spawner: Option<SpawnerId>,
    ) -> Self {
        Self {
            id,
            name: template.name.clone(),
            kind: CharacterKind::Npc,
            map,
            position: Vector2::ZERO,
            velocity: Vector2::ZERO,
            body_size: template.body_size,
            move_speed: template.move_speed,
            hp: template.max_hp,
            max_hp: template.max_hp,
            attack: template.attack,
            alive: false,
            died_at: None,
            respawn_delay_ms: template.respawn_delay_ms(),
            respawn_map: None,
            respawn_position: None,
            spawner,
            awaiting_position_since: None,
            placement_retries: 0,
            status_effects: Vec::new(),
            ai_decided_at: None,
            template: Some(template),
        }
    }

    /// Create a user-controlled character from a persisted snapshot
    pub fn from_snapshot(snapshot: &CharacterSnapshot) -> Self {
        let max_hp = snapshot.max_hp.max(1);
        Self {
            id: snapshot.id,
            name: snapshot.name.clone(),
            kind: CharacterKind::User(snapshot.account),
            template: None,
            map: snapshot.map,
            position: snapshot.position,
            velocity: Vector2::ZERO,
            body_size: USER_BODY_SIZE,
            move_speed: USER_MOVE_SPEED,
            hp: snapshot.hp.clamp(1, max_hp),
            max_hp,
            attack: snapshot.attack,
            alive: false,
            died_at: None,
            respawn_delay_ms: USER_RESPAWN_DELAY_MS,
            respawn_map: Some(snapshot.respawn_map),
            respawn_position: Some(snapshot.respawn_position),
            spawner: None,
            awaiting_position_since: None,
            placement_retries: 0,
            status_effects: Vec::new(),
            ai_decided_at: None,
        }
    }

    pub fn id(&self) -> CharacterId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> CharacterKind {
        self.kind
    }

    pub fn is_npc(&self) -> bool {
        self.kind == CharacterKind::Npc
    }

    pub fn template(&self) -> Option<&Arc<CharacterTemplate>> {
        self.template.as_ref()
    }

    pub fn map(&self) -> MapId {
        self.map
    }

    pub fn position(&self) -> Vector2 {
        self.position
    }

    pub fn velocity(&self) -> Vector2 {
        self.velocity
    }

    pub fn body_size(&self) -> Vector2 {
        self.body_size
    }

    pub fn hp(&self) -> i32 {
        self.hp
    }

    pub fn max_hp(&self) -> i32 {
        self.max_hp
    }

    pub fn attack(&self) -> i32 {
        self.attack
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn died_at(&self) -> Option<TickCount> {
        self.died_at
    }

    pub fn respawn_map(&self) -> Option<MapId> {
        self.respawn_map
    }

    pub fn respawn_position(&self) -> Option<Vector2> {
        self.respawn_position
    }

    pub fn spawner(&self) -> Option<SpawnerId> {
        self.spawner
    }

    /// Tick at which a placement failure was recorded, if one is pending
    pub fn awaiting_position_since(&self) -> Option<TickCount> {
        self.awaiting_position_since
    }

    pub fn is_awaiting_position(&self) -> bool {
        self.awaiting_position_since.is_some()
    }

    pub fn placement_retries(&self) -> u32 {
        self.placement_retries
    }

    pub fn status_effects(&self) -> &[StatusEffect] {
        &self.status_effects
    }

    /// Whether the respawn delay since death has passed
    pub fn is_respawn_due(&self, now: TickCount) -> bool {
        match self.died_at {
            Some(died_at) => now.has_elapsed(died_at, self.respawn_delay_ms),
            None => false,
        }
    }

    pub(crate) fn set_position(&mut self, position: Vector2) {
        self.position = position;
    }

    pub(crate) fn set_map(&mut self, map: MapId) {
        self.map = map;
    }

    pub(crate) fn set_alive(&mut self, alive: bool) {
        self.alive = alive;
    }

    /// Request movement in a direction. The vector is normalised; zero stops.
    pub fn set_direction(&mut self, direction: Vector2) {
        self.velocity = direction.normalized().scale(self.move_speed);
    }

    pub(crate) fn stop(&mut self) {
        self.velocity = Vector2::ZERO;
    }

    /// Record a placement failure; keeps the first recorded tick
    pub(crate) fn mark_awaiting_position(&mut self, now: TickCount) {
        if self.awaiting_position_since.is_none() {
            self.awaiting_position_since = Some(now);
        }
    }

    pub(crate) fn clear_awaiting_position(&mut self) {
        self.awaiting_position_since = None;
    }

    pub(crate) fn count_placement_retry(&mut self) -> u32 {
        self.placement_retries = self.placement_retries.saturating_add(1);
        self.placement_retries
    }

    pub(crate) fn reset_placement_retries(&mut self) {
        self.placement_retries = 0;
    }

    /// Stage where the generic respawn should put this character
    pub(crate) fn stage_respawn(&mut self, map: MapId, position: Vector2) {
        self.respawn_map = Some(map);
        self.respawn_position = Some(position);
    }

    /// Kill the character. Returns `true` only on the alive → dead
    /// transition, so death notifications fire once per death.
    pub fn kill(&mut self, now: TickCount) -> bool {
        if !self.alive {
            return false;
        }

        self.alive = false;
        self.hp = 0;
        self.died_at = Some(now);
        self.velocity = Vector2::ZERO;
        self.status_effects.clear();
        true
    }

    /// Bring the character back with full hit points
    pub(crate) fn revive(&mut self) {
        self.alive = true;
        self.hp = self.max_hp;
        self.died_at = None;
        self.velocity = Vector2::ZERO;
    }

    /// Apply damage; returns `true` if this hit killed the character
    pub fn apply_damage(&mut self, amount: i32, now: TickCount) -> bool {
        if !self.alive || amount <= 0 {
            return false;
        }

        self.hp = self.hp.saturating_sub(amount);
        if self.hp <= 0 {
            return self.kill(now);
        }
        false
    }

    pub fn add_status_effect(&mut self, kind: StatusEffectKind, duration_ms: u32, now: TickCount) {
        self.status_effects.retain(|e| e.kind != kind);
        self.status_effects.push(StatusEffect {
            kind,
            applied_at: now,
            duration_ms,
        });
    }

    pub fn has_status_effect(&self, kind: StatusEffectKind) -> bool {
        self.status_effects.iter().any(|e| e.kind == kind)
    }

    /// Advance this character by one tick.
    ///
    /// Returns whether the position changed. Dead characters are skipped.
    pub fn update(&mut self, ctx: &mut UpdateContext<'_>) -> Result<bool, GameError> {
        if !self.alive {
            return Ok(false);
        }

        let now = ctx.now;
        self.status_effects.retain(|e| !e.is_expired(now));

        if let Some(template) = &self.template {
            if template.ai == AiKind::Wander {
                self.update_wander(ctx);
            }
        }

        if self.has_status_effect(StatusEffectKind::Stun) {
            return Ok(false);
        }

        if self.velocity == Vector2::ZERO || ctx.elapsed_ms == 0 {
            return Ok(false);
        }

        let mut step = self.velocity.scale(ctx.elapsed_ms as f32 / 1000.0);
        if self.has_status_effect(StatusEffectKind::Haste) {
            step = step.scale(1.5);
        }

        let target = self.position.add(step);
        if !target.is_finite() {
            return Err(GameError::InvalidLocation {
                x: target.x,
                y: target.y,
            });
        }

        if ctx.layout.is_legal_position(target, self.body_size) {
            self.position = target;
            Ok(true)
        } else {
            trace!(character = %self.id, target = %target, "Movement blocked");
            self.velocity = Vector2::ZERO;
            Ok(false)
        }
    }

    fn update_wander(&mut self, ctx: &mut UpdateContext<'_>) {
        let due = match self.ai_decided_at {
            Some(at) => ctx.now.has_elapsed(at, WANDER_DECISION_MS),
            None => true,
        };
        if !due {
            return;
        }

        self.ai_decided_at = Some(ctx.now);
        if ctx.rng.gen_bool(0.5) {
            self.velocity = Vector2::ZERO;
        } else {
            let angle: f32 = ctx.rng.gen_range(0.0..std::f32::consts::TAU);
            self.set_direction(Vector2::new(angle.cos(), angle.sin()));
        }
    }

    /// Snapshot of a user character for persistence
    pub fn to_snapshot(&self) -> Option<CharacterSnapshot> {
        let account = match self.kind {
            CharacterKind::User(account) => account,
            CharacterKind::Npc => return None,
        };

        Some(CharacterSnapshot {
            id: self.id,
            account,
            name: self.name.clone(),
            map: self.map,
            position: self.position,
            respawn_map: self.respawn_map.unwrap_or(self.map),
            respawn_position: self.respawn_position.unwrap_or(self.position),
            hp: if self.alive { self.hp } else { self.max_hp },
            max_hp: self.max_hp,
            attack: self.attack,
        })
    }
}
