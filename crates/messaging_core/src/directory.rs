//! Who can the local user message, and what do they look like.
//!
//! Derived from the accepted-connection graph on every call; no caching.
//! Degenerate data may list the same peer through more than one connection
//! record, so results are deduplicated by peer id, first-seen order kept.

use std::collections::{HashMap, HashSet};

use shared::{domain::UserId, protocol::Peer};
use tracing::warn;

use crate::{error::DirectoryError, ConnectionGraph};

pub async fn list_peers(
    graph: &dyn ConnectionGraph,
    local_user: UserId,
) -> Result<Vec<Peer>, DirectoryError> {
    let connections = graph
        .accepted_connections_for(local_user)
        .await
        .map_err(|source| DirectoryError::Unavailable { source })?;

    let mut seen = HashSet::new();
    let mut peer_ids = Vec::new();
    for connection in &connections {
        let Some(other) = connection.other_party(local_user) else {
            warn!(
                connection_id = connection.id.0,
                "connection record does not involve the local user; skipping"
            );
            continue;
        };
        if other == local_user {
            continue;
        }
        if seen.insert(other) {
            peer_ids.push(other);
        }
    }

    if peer_ids.is_empty() {
        return Ok(Vec::new());
    }

    let profiles = graph
        .profiles_by_ids(&peer_ids)
        .await
        .map_err(|source| DirectoryError::Unavailable { source })?;
    let mut by_id: HashMap<UserId, Peer> = profiles
        .into_iter()
        .map(|peer| (peer.user_id, peer))
        .collect();

    Ok(peer_ids
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect())
}
