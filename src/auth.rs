//! Credential admission (component G).

use std::collections::HashSet;

use log::warn;
use nix::sys::socket::UnixCredentials;
use nix::unistd::{Gid, Group, Uid, User};

/// Frozen at Manager init (§3).
#[derive(Debug, Clone)]
pub struct PermittedCredentials {
    pub uids: HashSet<u32>,
    pub gids: HashSet<u32>,
}

impl PermittedCredentials {
    /// `uid ∈ permitted_uids ∨ gid ∈ permitted_gids` (§4.G).
    pub fn admits(&self, creds: &UnixCredentials) -> bool {
        self.uids.contains(&creds.uid()) || self.gids.contains(&creds.gid())
    }

    /// Log a rejection, resolving the peer's uid/gid to names where
    /// possible (§4.G: `<unknown>` if not resolvable).
    pub fn log_rejection(&self, creds: &UnixCredentials) {
        let user = User::from_uid(Uid::from_raw(creds.uid()))
            .ok()
            .flatten()
            .map(|u| u.name)
            .unwrap_or_else(|| "<unknown>".to_string());
        let group = Group::from_gid(Gid::from_raw(creds.gid()))
            .ok()
            .flatten()
            .map(|g| g.name)
            .unwrap_or_else(|| "<unknown>".to_string());
        warn!(
            "rejected connection from pid {} uid {}({user}) gid {}({group}): not in permitted credential sets",
            creds.pid(),
            creds.uid(),
            creds.gid(),
        );
    }
}
