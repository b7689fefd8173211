//! Character templates
//!
//! Templates are immutable definitions loaded once at startup. Every spawner
//! (and every NPC it creates) holds an `Arc` to the template it was built
//! from; the registry is never mutated after load, so it is shared between
//! maps without locking.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{GoreError, PersistenceError, Result};
use crate::game::ids::CharacterTemplateId;
use crate::game::region::Vector2;

/// Behaviour tag driving an NPC's per-tick AI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiKind {
    /// Never moves on its own
    #[default]
    Stationary,
    /// Picks a random direction every few seconds
    Wander,
}

/// One entry of a template's loot table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LootEntry {
    pub item_id: u32,
    /// Drop chance in `[0, 1]`
    pub chance: f32,
    #[serde(default = "default_loot_amount")]
    pub amount: u16,
}

fn default_loot_amount() -> u16 {
    1
}

/// Immutable character definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterTemplate {
    pub id: CharacterTemplateId,
    pub name: String,
    /// Body sprite reference
    #[serde(default)]
    pub body: String,
    /// Collision size
    #[serde(default = "default_body_size")]
    pub body_size: Vector2,
    #[serde(default = "default_max_hp")]
    pub max_hp: i32,
    #[serde(default = "default_attack")]
    pub attack: i32,
    /// Movement speed in map units per second
    #[serde(default = "default_move_speed")]
    pub move_speed: f32,
    #[serde(default)]
    pub ai: AiKind,
    /// Seconds between death and respawn
    #[serde(default = "default_respawn_secs")]
    pub respawn_secs: u32,
    #[serde(default)]
    pub loot: Vec<LootEntry>,
}

fn default_body_size() -> Vector2 {
    Vector2::new(16.0, 16.0)
}

fn default_max_hp() -> i32 {
    50
}

fn default_attack() -> i32 {
    5
}

fn default_move_speed() -> f32 {
    60.0
}

fn default_respawn_secs() -> u32 {
    10
}

impl CharacterTemplate {
    /// Minimal template with default stats
    pub fn new(id: CharacterTemplateId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            body: String::new(),
            body_size: default_body_size(),
            max_hp: default_max_hp(),
            attack: default_attack(),
            move_speed: default_move_speed(),
            ai: AiKind::default(),
            respawn_secs: default_respawn_secs(),
            loot: Vec::new(),
        }
    }

    pub fn with_body_size(mut self, width: f32, height: f32) -> Self {
        self.body_size = Vector2::new(width, height);
        self
    }

    pub fn with_ai(mut self, ai: AiKind) -> Self {
        self.ai = ai;
        self
    }

    pub fn with_max_hp(mut self, max_hp: i32) -> Self {
        self.max_hp = max_hp;
        self
    }

    pub fn with_respawn_secs(mut self, secs: u32) -> Self {
        self.respawn_secs = secs;
        self
    }

    /// Respawn delay in milliseconds
    pub fn respawn_delay_ms(&self) -> u32 {
        self.respawn_secs.saturating_mul(1000)
    }
}

/// Read-only lookup of templates by id
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: HashMap<CharacterTemplateId, Arc<CharacterTemplate>>,
}

impl TemplateRegistry {
    /// Build a registry from a set of templates
    pub fn from_templates(templates: impl IntoIterator<Item = CharacterTemplate>) -> Self {
        let templates = templates
            .into_iter()
            .map(|t| (t.id, Arc::new(t)))
            .collect::<HashMap<_, _>>();

        debug!(count = templates.len(), "Template registry built");
        Self { templates }
    }

    /// Load templates from a JSON array file
    pub fn load_json(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GoreError::Persistence(PersistenceError::Unavailable(format!(
                "{}: {}",
                path.display(),
                e
            )))
        })?;

        let templates: Vec<CharacterTemplate> =
            serde_json::from_str(&content).map_err(|e| {
                GoreError::Persistence(PersistenceError::Corrupt {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })
            })?;

        let registry = Self::from_templates(templates);
        info!(
            path = %path.display(),
            count = registry.len(),
            "Character templates loaded"
        );
        Ok(registry)
    }

    /// Resolve a template id
    pub fn get(&self, id: CharacterTemplateId) -> Option<Arc<CharacterTemplate>> {
        self.templates.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup_shares_template() {
        let registry = TemplateRegistry::from_templates(vec![CharacterTemplate::new(
            CharacterTemplateId::new(1),
            "Bat",
        )]);

        let a = registry.get(CharacterTemplateId::new(1)).unwrap();
        let b = registry.get(CharacterTemplateId::new(1)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get(CharacterTemplateId::new(2)).is_none());
    }

    #[test]
    fn test_template_deserialize_defaults() {
        let json = r#"[{"id": 3, "name": "Slime", "ai": "wander"}]"#;
        let templates: Vec<CharacterTemplate> = serde_json::from_str(json).unwrap();

        assert_eq!(templates[0].id, CharacterTemplateId::new(3));
        assert_eq!(templates[0].ai, AiKind::Wander);
        assert_eq!(templates[0].max_hp, 50);
        assert_eq!(templates[0].respawn_delay_ms(), 10_000);
    }

    #[test]
    fn test_load_json_missing_file() {
        let result = TemplateRegistry::load_json(Path::new("/nonexistent/templates.json"));
        assert!(matches!(
            result,
            Err(GoreError::Persistence(PersistenceError::Unavailable(_)))
        ));
    }
}
