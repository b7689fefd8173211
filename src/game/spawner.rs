//! NPC spawners
//!
//! A spawner keeps a fixed population of NPCs of one template alive inside a
//! region of its map. Its slots are filled once at construction and never
//! change size; dead or displaced NPCs are reused, not replaced.
//!
//! Placement failures are deferred: the NPC is parked as "awaiting position"
//! and retried no sooner than [`FIND_NEW_POSITION_TIMEOUT_MS`] later, so a
//! blocked region does not cost a collision query every tick.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::GameError;
use crate::game::character::{Character, SpawnerId};
use crate::game::collision::MapLayout;
use crate::game::ids::{CharacterId, CharacterIdAllocator, CharacterTemplateId, MapId};
use crate::game::map::{MapEvent, MapStats};
use crate::game::persistence::SpawnConfigRow;
use crate::game::region::{SpawnRegion, Vector2};
use crate::game::template::{CharacterTemplate, TemplateRegistry};
use crate::game::time::TickCount;

/// Minimum wait between a placement failure and the next attempt
pub const FIND_NEW_POSITION_TIMEOUT_MS: u32 = 1_000;

/// Retry count interval at which a stuck NPC is reported
const RETRY_WARN_INTERVAL: u32 = 10;

/// What to do when one spawn configuration row cannot be resolved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnLoadPolicy {
    /// Log the row and keep loading the others
    #[default]
    Skip,
    /// Fail the whole map load
    AbortMap,
}

/// Mutable map state a spawner works against
pub struct SpawnContext<'a> {
    pub now: TickCount,
    pub characters: &'a mut BTreeMap<CharacterId, Character>,
    pub layout: &'a MapLayout,
    pub rng: &'a mut StdRng,
    pub stats: &'a mut MapStats,
    pub events: &'a mut Vec<MapEvent>,
    pub ids: &'a CharacterIdAllocator,
}

/// Keeps `amount` NPCs of one template alive in a region
#[derive(Debug)]
pub struct NpcSpawner {
    id: SpawnerId,
    map: MapId,
    template: Arc<CharacterTemplate>,
    amount: u8,
    region: SpawnRegion,
    slots: Vec<CharacterId>,
}

impl NpcSpawner {
    /// Resolve the template, validate the region and spawn `amount` NPCs
    pub fn new(
        id: SpawnerId,
        template_id: CharacterTemplateId,
        amount: u8,
        region: SpawnRegion,
        map: MapId,
        templates: &TemplateRegistry,
        ctx: &mut SpawnContext<'_>,
    ) -> Result<Self, GameError> {
        let template = templates
            .get(template_id)
            .ok_or(GameError::TemplateNotFound(template_id))?;

        if region.map != map {
            return Err(GameError::RegionMapMismatch {
                spawner_map: map,
                region_map: region.map,
            });
        }

        if amount == 0 {
            return Err(GameError::InvalidSpawnAmount(amount));
        }

        if !region.is_valid() {
            return Err(GameError::InvalidRegion(region.to_string()));
        }

        let mut spawner = Self {
            id,
            map,
            template,
            amount,
            region,
            slots: Vec::with_capacity(amount as usize),
        };

        for _ in 0..amount {
            let npc_id = ctx.ids.allocate();
            let npc = Character::new_npc(npc_id, spawner.template.clone(), map, Some(id));
            ctx.characters.insert(npc_id, npc);
            spawner.slots.push(npc_id);

            let position = region.random_position(&mut *ctx.rng);
            spawner.try_place(ctx, npc_id, position);
        }

        debug!(
            map_id = %map,
            spawner = id.0,
            template = %spawner.template.name,
            amount = amount,
            region = %region,
            "Spawner created"
        );

        Ok(spawner)
    }

    pub fn id(&self) -> SpawnerId {
        self.id
    }

    pub fn map(&self) -> MapId {
        self.map
    }

    pub fn template(&self) -> &Arc<CharacterTemplate> {
        &self.template
    }

    pub fn amount(&self) -> u8 {
        self.amount
    }

    pub fn region(&self) -> &SpawnRegion {
        &self.region
    }

    /// Ids of the NPCs this spawner owns, one per slot
    pub fn slots(&self) -> &[CharacterId] {
        &self.slots
    }

    /// Stage a fresh respawn position for a dead NPC.
    ///
    /// The NPC is not moved here; the map's respawn pass does that when the
    /// template's respawn delay has passed.
    pub fn on_killed(&self, npc: &mut Character, rng: &mut StdRng, stats: &mut MapStats) {
        let position = self.region.random_position(rng);
        npc.stage_respawn(self.map, position);
        stats.spawned_npc_killed += 1;

        debug!(
            map_id = %self.map,
            npc = %npc.id(),
            respawn_at = %position,
            "Spawned NPC killed"
        );
    }

    /// Park an NPC whose placement target is illegal.
    ///
    /// The NPC is taken out of play without going through the kill path and
    /// the failure tick is recorded (the first one wins). The position is
    /// returned unchanged; the retry happens in [`NpcSpawner::update`].
    pub fn handle_no_legal_position_found(
        &self,
        npc: &mut Character,
        position: Vector2,
        now: TickCount,
    ) -> Vector2 {
        npc.set_alive(false);
        npc.stop();
        npc.mark_awaiting_position(now);

        debug!(
            map_id = %self.map,
            npc = %npc.id(),
            position = %position,
            "No legal position found"
        );
        position
    }

    /// Retry placement for NPCs whose failure timeout has passed
    pub fn update(&self, ctx: &mut SpawnContext<'_>) {
        let now = ctx.now;

        for &npc_id in &self.slots {
            let since = match ctx.characters.get(&npc_id) {
                Some(npc) => match npc.awaiting_position_since() {
                    Some(since) => since,
                    None => continue,
                },
                None => continue,
            };

            if !now.has_elapsed(since, FIND_NEW_POSITION_TIMEOUT_MS) {
                continue;
            }

            let retries = match ctx.characters.get_mut(&npc_id) {
                Some(npc) => {
                    npc.clear_awaiting_position();
                    npc.count_placement_retry()
                }
                None => continue,
            };
            ctx.stats.placement_retries += 1;

            if retries % RETRY_WARN_INTERVAL == 0 {
                warn!(
                    map_id = %self.map,
                    npc = %npc_id,
                    retries = retries,
                    region = %self.region,
                    "NPC still has no legal position"
                );
            }

            let position = self.region.random_position(&mut *ctx.rng);
            self.try_place(ctx, npc_id, position);
        }
    }

    /// Move an NPC to `position` and bring it into play, or park it
    fn try_place(&self, ctx: &mut SpawnContext<'_>, npc_id: CharacterId, position: Vector2) -> bool {
        let npc = match ctx.characters.get_mut(&npc_id) {
            Some(npc) => npc,
            None => return false,
        };

        if !ctx.layout.is_legal_position(position, npc.body_size()) {
            self.handle_no_legal_position_found(npc, position, ctx.now);
            return false;
        }

        npc.set_position(position);
        npc.revive();
        npc.clear_awaiting_position();
        npc.reset_placement_retries();
        ctx.stats.npc_spawned += 1;
        ctx.events.push(MapEvent::CharacterSpawned {
            map: self.map,
            character: npc_id,
            name: npc.name().to_string(),
            position,
            npc: true,
        });
        true
    }
}

/// Build every spawner configured for a map.
///
/// Spawner ids are assigned in row order, counting only rows that loaded.
pub fn load_spawners(
    map: MapId,
    rows: &[SpawnConfigRow],
    templates: &TemplateRegistry,
    policy: SpawnLoadPolicy,
    ctx: &mut SpawnContext<'_>,
) -> Result<Vec<NpcSpawner>, GameError> {
    let mut spawners = Vec::with_capacity(rows.len());

    for (row_index, row) in rows.iter().enumerate() {
        let id = SpawnerId(spawners.len());
        match NpcSpawner::new(id, row.template, row.amount, row.region, map, templates, ctx) {
            Ok(spawner) => spawners.push(spawner),
            Err(e) => {
                error!(
                    map_id = %map,
                    row = row_index,
                    template = %row.template,
                    error = %e,
                    "Failed to create spawner"
                );
                if policy == SpawnLoadPolicy::AbortMap {
                    return Err(e);
                }
            }
        }
    }

    info!(
        map_id = %map,
        loaded = spawners.len(),
        configured = rows.len(),
        "Spawners loaded"
    );
    Ok(spawners)
}
