//! Configuration & CLI surface (component J).
//!
//! A thin bootstrapper: resolve process arguments (and their defaults)
//! into an immutable [`Config`], the only part of this system that is
//! "just CLI parsing" (§4.J).

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use nix::unistd::{Group, Uid, User};

use crate::buffer::MIN_BUFFER_SIZE;

const DEFAULT_IPC_BASE: &str = "/tmp/smb_manager";
const DEFAULT_BUFFER_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(
    name = "smb_manager",
    about = "Shared-memory broadcast channel manager",
    disable_help_flag = true
)]
pub struct Cli {
    /// Administrative namespace; defaults to the invoking user's login name.
    #[arg(short = 'v', long = "vlan")]
    pub vlan: Option<String>,

    /// Comma-separated u:<user-or-uid> / g:<group-or-gid> entries.
    #[arg(short = 'p', long = "permissions")]
    pub permissions: Option<String>,

    /// Default buffer size in bytes; must be >= 65535.
    #[arg(short = 'b', long = "buffer_size")]
    pub buffer_size: Option<u64>,

    /// Path to the log file, or "-" for stdout.
    #[arg(short = 'l', long = "log_file")]
    pub log_file: Option<String>,

    /// Daemonize after init.
    #[arg(short = 'd', long = "daemon")]
    pub daemon: bool,

    #[arg(short = 'h', long = "help", action = clap::ArgAction::Help)]
    help: (),
}

/// Resolved, immutable configuration for one Manager run (§3).
#[derive(Debug, Clone)]
pub struct Config {
    pub vlan: String,
    pub permitted_uids: HashSet<u32>,
    pub permitted_gids: HashSet<u32>,
    pub default_buffer_size: u64,
    pub log_file_path: String,
    pub daemonize: bool,
}

impl Config {
    pub fn socket_path(&self) -> PathBuf {
        PathBuf::from(DEFAULT_IPC_BASE)
            .join(&self.vlan)
            .join("manager.sock")
    }

    fn default_log_path(vlan: &str) -> String {
        format!("{DEFAULT_IPC_BASE}/{vlan}/manager.log")
    }

    /// Resolve a parsed [`Cli`] into a [`Config`], applying defaults and
    /// validating everything the CLI surface itself is responsible for
    /// (§4.J). Any failure here is a fatal CLI error (exit code 1).
    pub fn resolve(cli: Cli) -> Result<Config> {
        let current_user_name = current_login_name()?;

        let vlan = cli.vlan.unwrap_or_else(|| current_user_name.clone());

        let permissions = cli
            .permissions
            .unwrap_or_else(|| format!("u:{current_user_name}"));
        let (permitted_uids, permitted_gids) = parse_permissions(&permissions)?;

        let default_buffer_size = cli.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        if default_buffer_size < MIN_BUFFER_SIZE {
            bail!(
                "buffer_size must be at least {MIN_BUFFER_SIZE} bytes (got {default_buffer_size})"
            );
        }

        let log_file_path = cli.log_file.unwrap_or_else(|| Self::default_log_path(&vlan));
        if cli.daemon && log_file_path == "-" {
            bail!("--daemon is incompatible with logging to stdout");
        }

        Ok(Config {
            vlan,
            permitted_uids,
            permitted_gids,
            default_buffer_size,
            log_file_path,
            daemonize: cli.daemon,
        })
    }
}

fn current_login_name() -> Result<String> {
    User::from_uid(Uid::current())
        .context("looking up invoking user")?
        .map(|u| u.name)
        .ok_or_else(|| anyhow!("invoking uid has no passwd entry"))
}

/// Parse a comma-separated `u:`/`g:`-tagged permission list into UID and
/// GID sets (§4.J). A bare numeric token after the tag is taken as the
/// id directly; otherwise it is resolved via the system user/group
/// database.
fn parse_permissions(spec: &str) -> Result<(HashSet<u32>, HashSet<u32>)> {
    let mut uids = HashSet::new();
    let mut gids = HashSet::new();

    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (tag, name) = entry
            .split_once(':')
            .ok_or_else(|| anyhow!("permission entry {entry:?} is missing a u:/g: tag"))?;
        match tag {
            "u" => uids.insert(resolve_uid(name)?),
            "g" => gids.insert(resolve_gid(name)?),
            other => bail!("unknown permission tag {other:?} in entry {entry:?}"),
        };
    }

    Ok((uids, gids))
}

fn resolve_uid(token: &str) -> Result<u32> {
    if let Ok(uid) = token.parse::<u32>() {
        return Ok(uid);
    }
    User::from_name(token)
        .with_context(|| format!("looking up user {token:?}"))?
        .map(|u| u.uid.as_raw())
        .ok_or_else(|| anyhow!("unknown user {token:?}"))
}

fn resolve_gid(token: &str) -> Result<u32> {
    if let Ok(gid) = token.parse::<u32>() {
        return Ok(gid);
    }
    Group::from_name(token)
        .with_context(|| format!("looking up group {token:?}"))?
        .map(|g| g.gid.as_raw())
        .ok_or_else(|| anyhow!("unknown group {token:?}"))
}
