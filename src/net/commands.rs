//! Say commands
//!
//! Lines a player says that start with `/` are looked up in a
//! [`CommandRegistry`]. Each command names the minimum permission it needs;
//! the registry checks it once, before the handler runs, so a rejected
//! command never touches game or account state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::auth::UserPermissions;
use crate::game::character::StatusEffectKind;
use crate::game::persistence::BanRecord;
use crate::game::region::Vector2;
use crate::net::dispatcher::SessionDispatcher;
use crate::net::session::Session;
use crate::protocol::ServerMessage;

/// Longest ban accepted, in minutes (ten years)
const MAX_BAN_MINUTES: i64 = 10 * 365 * 24 * 60;

const DEFAULT_HASTE_SECS: u32 = 10;
const MAX_HASTE_SECS: u32 = 300;

/// `<n>d`, `<n>h`, `<n>m` in that order, each optional
static DURATION_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:(\d+)d)?(?:(\d+)h)?(?:(\d+)m)?$").expect("valid duration regex")
});

/// Failure of a single command invocation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Arguments could not be parsed; carries the usage line
    #[error("Usage: {0}")]
    Usage(String),

    /// The command ran but could not do what was asked
    #[error("{0}")]
    Failed(String),
}

/// What the issuing session gets back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Reply(String),
    Unknown(String),
    PermissionDenied(String),
    InvalidArguments(String),
}

impl CommandOutcome {
    /// Text shown to the issuer
    pub fn message(&self) -> String {
        match self {
            CommandOutcome::Reply(text) => text.clone(),
            CommandOutcome::Unknown(name) => format!("Unknown command: {}", name),
            CommandOutcome::PermissionDenied(name) => {
                format!("You do not have permission to use /{}", name)
            }
            CommandOutcome::InvalidArguments(message) => message.clone(),
        }
    }
}

/// Everything a handler may act on
pub struct CommandContext<'a> {
    pub dispatcher: &'a SessionDispatcher,
    pub session: &'a Arc<Session>,
}

impl CommandContext<'_> {
    fn issuer_name(&self) -> String {
        self.session.username().unwrap_or_default()
    }
}

pub type CommandHandler = fn(&CommandContext<'_>, &[&str]) -> Result<String, CommandError>;

/// A registered command
#[derive(Clone)]
pub struct CommandSpec {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub permission: UserPermissions,
    pub usage: &'static str,
    pub help: &'static str,
    pub handler: CommandHandler,
}

/// Name → command lookup
pub struct CommandRegistry {
    commands: Vec<CommandSpec>,
    by_name: HashMap<&'static str, usize>,
}

impl CommandRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Registry with every built-in command
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for spec in builtin_commands() {
            registry.register(spec);
        }
        registry
    }

    /// Add a command. A later registration replaces an earlier name.
    pub fn register(&mut self, spec: CommandSpec) {
        let index = self.commands.len();
        self.by_name.insert(spec.name, index);
        for &alias in spec.aliases {
            self.by_name.insert(alias, index);
        }
        self.commands.push(spec);
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.by_name
            .get(name.to_ascii_lowercase().as_str())
            .map(|&i| &self.commands[i])
    }

    /// Commands visible at a permission level, in registration order
    pub fn available_to(&self, permissions: UserPermissions) -> impl Iterator<Item = &CommandSpec> {
        self.commands
            .iter()
            .filter(move |c| permissions.includes(c.permission))
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Parse and run one command line (without the leading `/`)
    pub fn dispatch(&self, ctx: &CommandContext<'_>, line: &str) -> CommandOutcome {
        let mut parts = line.split_whitespace();
        let name = match parts.next() {
            Some(n) => n,
            None => return CommandOutcome::Unknown(String::new()),
        };
        let args: Vec<&str> = parts.collect();

        let spec = match self.get(name) {
            Some(spec) => spec,
            None => return CommandOutcome::Unknown(name.to_string()),
        };

        if !ctx.session.permissions().includes(spec.permission) {
            warn!(
                session_id = ctx.session.id,
                command = spec.name,
                required = spec.permission.name(),
                "Command rejected: insufficient permission"
            );
            return CommandOutcome::PermissionDenied(spec.name.to_string());
        }

        debug!(session_id = ctx.session.id, command = spec.name, args = args.len(), "Running command");
        match (spec.handler)(ctx, &args) {
            Ok(reply) => CommandOutcome::Reply(reply),
            Err(e) => CommandOutcome::InvalidArguments(e.to_string()),
        }
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Parse a ban duration such as `30`, `2h`, `1d12h30m`.
///
/// A bare number is minutes. Zero and anything over ten years is rejected.
pub fn parse_duration(input: &str) -> Option<ChronoDuration> {
    let input = input.trim().to_ascii_lowercase();
    if input.is_empty() {
        return None;
    }

    if let Ok(minutes) = input.parse::<i64>() {
        return (1..=MAX_BAN_MINUTES)
            .contains(&minutes)
            .then(|| ChronoDuration::minutes(minutes));
    }

    let caps = DURATION_REGEX.captures(&input)?;
    let part = |i: usize| -> Option<i64> {
        match caps.get(i) {
            Some(m) => m.as_str().parse().ok(),
            None => Some(0),
        }
    };
    let (days, hours, minutes) = (part(1)?, part(2)?, part(3)?);
    let total = days
        .checked_mul(24 * 60)?
        .checked_add(hours.checked_mul(60)?)?
        .checked_add(minutes)?;

    (1..=MAX_BAN_MINUTES)
        .contains(&total)
        .then(|| ChronoDuration::minutes(total))
}

fn builtin_commands() -> Vec<CommandSpec> {
    vec![
        CommandSpec {
            name: "help",
            aliases: &["commands"],
            permission: UserPermissions::User,
            usage: "/help",
            help: "List the commands you can use",
            handler: cmd_help,
        },
        CommandSpec {
            name: "online",
            aliases: &["players"],
            permission: UserPermissions::User,
            usage: "/online",
            help: "Show how many players are online",
            handler: cmd_online,
        },
        CommandSpec {
            name: "whoami",
            aliases: &[],
            permission: UserPermissions::User,
            usage: "/whoami",
            help: "Show your account and position",
            handler: cmd_whoami,
        },
        CommandSpec {
            name: "status",
            aliases: &["uptime"],
            permission: UserPermissions::User,
            usage: "/status",
            help: "Show world name, loaded maps, tick and uptime",
            handler: cmd_status,
        },
        CommandSpec {
            name: "announce",
            aliases: &[],
            permission: UserPermissions::Moderator,
            usage: "/announce <message>",
            help: "Send a message to everyone in the world",
            handler: cmd_announce,
        },
        CommandSpec {
            name: "kick",
            aliases: &[],
            permission: UserPermissions::Moderator,
            usage: "/kick <name> [reason]",
            help: "Disconnect a player",
            handler: cmd_kick,
        },
        CommandSpec {
            name: "ban",
            aliases: &["banuser"],
            permission: UserPermissions::Moderator,
            usage: "/ban <name> <duration> <reason>",
            help: "Ban an account, e.g. /ban troll 1d12h spamming",
            handler: cmd_ban,
        },
        CommandSpec {
            name: "unban",
            aliases: &[],
            permission: UserPermissions::Admin,
            usage: "/unban <name>",
            help: "Lift every ban on an account",
            handler: cmd_unban,
        },
        CommandSpec {
            name: "teleport",
            aliases: &["tp"],
            permission: UserPermissions::Moderator,
            usage: "/teleport <x> <y>",
            help: "Move yourself on the current map",
            handler: cmd_teleport,
        },
        CommandSpec {
            name: "haste",
            aliases: &[],
            permission: UserPermissions::Moderator,
            usage: "/haste [seconds]",
            help: "Move faster for a while (default 10s, at most 300s)",
            handler: cmd_haste,
        },
        CommandSpec {
            name: "spawnstats",
            aliases: &[],
            permission: UserPermissions::Moderator,
            usage: "/spawnstats",
            help: "Show spawner counters for your map",
            handler: cmd_spawnstats,
        },
    ]
}

fn cmd_help(ctx: &CommandContext<'_>, _args: &[&str]) -> Result<String, CommandError> {
    let lines: Vec<String> = ctx
        .dispatcher
        .commands()
        .available_to(ctx.session.permissions())
        .map(|c| format!("{} - {}", c.usage, c.help))
        .collect();
    Ok(format!("Available commands:\n{}", lines.join("\n")))
}

fn cmd_online(ctx: &CommandContext<'_>, _args: &[&str]) -> Result<String, CommandError> {
    let count = ctx.dispatcher.sessions().login_count();
    Ok(match count {
        1 => "There is 1 player online".to_string(),
        n => format!("There are {} players online", n),
    })
}

fn cmd_whoami(ctx: &CommandContext<'_>, _args: &[&str]) -> Result<String, CommandError> {
    let name = ctx.issuer_name();
    let permissions = ctx.session.permissions().name();

    let location = ctx.session.character().zip(ctx.session.map()).and_then(|(id, map)| {
        ctx.dispatcher
            .world()
            .with_map(map, |m| m.character(id).map(|c| (map, c.position())))
            .flatten()
    });

    Ok(match location {
        Some((map, position)) => format!("{} ({}) on map {} at {}", name, permissions, map, position),
        None => format!("{} ({})", name, permissions),
    })
}

fn cmd_status(ctx: &CommandContext<'_>, _args: &[&str]) -> Result<String, CommandError> {
    Ok(ctx.dispatcher.world().info())
}

fn cmd_announce(ctx: &CommandContext<'_>, args: &[&str]) -> Result<String, CommandError> {
    if args.is_empty() {
        return Err(CommandError::Usage("/announce <message>".to_string()));
    }

    let text = args.join(" ");
    info!(issuer = %ctx.issuer_name(), text = %text, "Announcement");
    ctx.dispatcher.broadcast(ServerMessage::Announcement { text });
    Ok("Announcement sent".to_string())
}

fn cmd_kick(ctx: &CommandContext<'_>, args: &[&str]) -> Result<String, CommandError> {
    let target = args
        .first()
        .ok_or_else(|| CommandError::Usage("/kick <name> [reason]".to_string()))?;
    let reason = if args.len() > 1 {
        args[1..].join(" ")
    } else {
        "Kicked by a moderator".to_string()
    };

    let session = ctx
        .dispatcher
        .sessions()
        .get_by_username(target)
        .ok_or_else(|| CommandError::Failed(format!("{} is not online", target)))?;
    if session.id == ctx.session.id {
        return Err(CommandError::Failed("You cannot kick yourself".to_string()));
    }
    check_outranks(ctx.session.permissions(), session.permissions())?;

    ctx.dispatcher.kick(session.id, &reason);
    info!(issuer = %ctx.issuer_name(), target = %target, reason = %reason, "Player kicked");
    Ok(format!("Kicked {}", target))
}

fn cmd_ban(ctx: &CommandContext<'_>, args: &[&str]) -> Result<String, CommandError> {
    const USAGE: &str = "/ban <name> <duration> <reason>";
    if args.len() < 3 {
        return Err(CommandError::Usage(USAGE.to_string()));
    }

    let duration = parse_duration(args[1]).ok_or_else(|| {
        CommandError::Failed(format!("Invalid duration '{}', use e.g. 30m, 2h or 1d12h", args[1]))
    })?;
    let reason = args[2..].join(" ");

    let store = ctx.dispatcher.world().store();
    let account = store
        .load_account(args[0])
        .map_err(|e| CommandError::Failed(format!("Could not look up account: {}", e)))?
        .ok_or_else(|| CommandError::Failed(format!("No account named {}", args[0])))?;
    if Some(account.id) == ctx.session.account() {
        return Err(CommandError::Failed("You cannot ban yourself".to_string()));
    }
    check_outranks(ctx.session.permissions(), account.permissions)?;

    let now = Utc::now();
    let ban = BanRecord {
        account: account.id,
        reason: reason.clone(),
        issued_by: ctx.issuer_name(),
        issued_at: now,
        expires_at: now + duration,
    };
    let expires_at = ban.expires_at;
    store
        .insert_ban(ban)
        .map_err(|e| CommandError::Failed(format!("Could not store ban: {}", e)))?;

    info!(
        issuer = %ctx.issuer_name(),
        target = %account.name,
        expires_at = %expires_at,
        reason = %reason,
        "Account banned"
    );

    if let Some(session) = ctx.dispatcher.sessions().get_by_account(account.id) {
        ctx.dispatcher.kick(session.id, &format!("Banned: {}", reason));
    }

    Ok(format!(
        "Banned {} until {}",
        account.name,
        expires_at.format("%Y-%m-%d %H:%M UTC")
    ))
}

fn cmd_unban(ctx: &CommandContext<'_>, args: &[&str]) -> Result<String, CommandError> {
    let name = args
        .first()
        .ok_or_else(|| CommandError::Usage("/unban <name>".to_string()))?;

    let store = ctx.dispatcher.world().store();
    let account = store
        .load_account(name)
        .map_err(|e| CommandError::Failed(format!("Could not look up account: {}", e)))?
        .ok_or_else(|| CommandError::Failed(format!("No account named {}", name)))?;
    let removed = store
        .remove_bans(account.id)
        .map_err(|e| CommandError::Failed(format!("Could not remove bans: {}", e)))?;

    info!(issuer = %ctx.issuer_name(), target = %account.name, removed = removed, "Account unbanned");
    Ok(match removed {
        0 => format!("{} has no bans", account.name),
        n => format!("Removed {} ban(s) from {}", n, account.name),
    })
}

fn cmd_teleport(ctx: &CommandContext<'_>, args: &[&str]) -> Result<String, CommandError> {
    const USAGE: &str = "/teleport <x> <y>";
    let (x, y) = match args {
        [x, y] => (
            x.parse::<f32>().map_err(|_| CommandError::Usage(USAGE.to_string()))?,
            y.parse::<f32>().map_err(|_| CommandError::Usage(USAGE.to_string()))?,
        ),
        _ => return Err(CommandError::Usage(USAGE.to_string())),
    };
    let target = Vector2::new(x, y);
    if !target.is_finite() {
        return Err(CommandError::Usage(USAGE.to_string()));
    }

    let (character, map) = ctx
        .session
        .character()
        .zip(ctx.session.map())
        .ok_or_else(|| CommandError::Failed("You are not in the world".to_string()))?;

    let world = ctx.dispatcher.world();
    let now = world.now();
    let moved = world
        .with_map(map, |m| m.teleport(character, target, now))
        .ok_or_else(|| CommandError::Failed("Your map is not loaded".to_string()))?
        .map_err(|e| CommandError::Failed(e.to_string()))?;

    if moved {
        Ok(format!("Teleported to {}", target))
    } else {
        Err(CommandError::Failed(format!("{} is blocked", target)))
    }
}

fn cmd_haste(ctx: &CommandContext<'_>, args: &[&str]) -> Result<String, CommandError> {
    const USAGE: &str = "/haste [seconds]";
    let seconds = match args {
        [] => DEFAULT_HASTE_SECS,
        [n] => n
            .parse::<u32>()
            .ok()
            .filter(|s| (1..=MAX_HASTE_SECS).contains(s))
            .ok_or_else(|| CommandError::Usage(USAGE.to_string()))?,
        _ => return Err(CommandError::Usage(USAGE.to_string())),
    };

    let (character, map) = ctx
        .session
        .character()
        .zip(ctx.session.map())
        .ok_or_else(|| CommandError::Failed("You are not in the world".to_string()))?;

    let world = ctx.dispatcher.world();
    let now = world.now();
    world
        .with_map(map, |m| {
            m.character_mut(character)
                .filter(|c| c.is_alive())
                .map(|c| c.add_status_effect(StatusEffectKind::Haste, seconds * 1_000, now))
        })
        .flatten()
        .ok_or_else(|| CommandError::Failed("You cannot do that right now".to_string()))?;

    debug!(issuer = %ctx.issuer_name(), seconds = seconds, "Haste applied");
    Ok(format!("Hasted for {}s", seconds))
}

fn cmd_spawnstats(ctx: &CommandContext<'_>, _args: &[&str]) -> Result<String, CommandError> {
    let map = ctx
        .session
        .map()
        .ok_or_else(|| CommandError::Failed("You are not in the world".to_string()))?;
    let world = ctx.dispatcher.world();
    let (stats, spawners, users) = world
        .with_map(map, |m| (m.stats(), m.spawners().len(), m.user_count()))
        .ok_or_else(|| CommandError::Failed("Your map is not loaded".to_string()))?;

    Ok(format!(
        "Map {}: {} players, {} spawners, {} spawned, {} killed, {} placement retries",
        map, users, spawners, stats.npc_spawned, stats.spawned_npc_killed, stats.placement_retries
    ))
}

/// Owners may act on anyone; everyone else only on lower ranks
fn check_outranks(issuer: UserPermissions, target: UserPermissions) -> Result<(), CommandError> {
    if issuer == UserPermissions::Owner || issuer > target {
        Ok(())
    } else {
        Err(CommandError::Failed(
            "You cannot do that to someone of equal or higher rank".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30"), Some(ChronoDuration::minutes(30)));
        assert_eq!(parse_duration("2h"), Some(ChronoDuration::hours(2)));
        assert_eq!(
            parse_duration("1d12h30m"),
            Some(ChronoDuration::minutes(24 * 60 + 12 * 60 + 30))
        );
        assert_eq!(parse_duration("1D"), Some(ChronoDuration::days(1)));
    }

    #[test]
    fn test_parse_duration_rejects_bad_input() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("0"), None);
        assert_eq!(parse_duration("0d0h"), None);
        assert_eq!(parse_duration("-5"), None);
        assert_eq!(parse_duration("12x"), None);
        assert_eq!(parse_duration("30m2h"), None);
        assert_eq!(parse_duration("99999999999999999999d"), None);
        assert_eq!(parse_duration("5000d"), None);
    }

    #[test]
    fn test_registry_aliases() {
        let registry = CommandRegistry::with_defaults();
        assert_eq!(registry.get("tp").unwrap().name, "teleport");
        assert_eq!(registry.get("BANUSER").unwrap().name, "ban");
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn test_available_to_filters_by_permission() {
        let registry = CommandRegistry::with_defaults();
        let user: Vec<_> = registry
            .available_to(UserPermissions::User)
            .map(|c| c.name)
            .collect();
        assert_eq!(user, vec!["help", "online", "whoami", "status"]);

        let admin = registry.available_to(UserPermissions::Admin).count();
        assert_eq!(admin, registry.len());
    }

    #[test]
    fn test_check_outranks() {
        assert!(check_outranks(UserPermissions::Moderator, UserPermissions::User).is_ok());
        assert!(check_outranks(UserPermissions::Moderator, UserPermissions::Moderator).is_err());
        assert!(check_outranks(UserPermissions::Admin, UserPermissions::Owner).is_err());
        assert!(check_outranks(UserPermissions::Owner, UserPermissions::Owner).is_ok());
    }

    #[test]
    fn test_outcome_messages() {
        assert_eq!(
            CommandOutcome::Unknown("dance".to_string()).message(),
            "Unknown command: dance"
        );
        assert_eq!(
            CommandOutcome::InvalidArguments(CommandError::Usage("/kick <name>".to_string()).to_string())
                .message(),
            "Usage: /kick <name>"
        );
    }
}
