//! Game module
//!
//! This module contains the core game logic for the Gore server:
//! - World management (fixed-rate tick, parallel map updates, autosave)
//! - Maps (entity registry, respawn machinery, statistics, events)
//! - NPC spawners and their placement retry state machine
//! - Characters, templates and collision
//! - Persistence contracts and stores

pub mod character;
pub mod collision;
pub mod ids;
pub mod map;
pub mod persistence;
pub mod region;
pub mod spawner;
pub mod template;
pub mod time;
pub mod world;
