use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{SignalError, SignalResult};
use crate::ids::{ConnectionId, ConnectionType, PeerId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub kind: ConnectionType,
    pub peer_id: PeerId,
}

/// Peer → connection bookkeeping for one relay session.
///
/// Connection ids are globally unique: saving an id that is already present
/// fails regardless of which peer or type it was registered under.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: DashMap<ConnectionId, ConnectionInfo>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(
        &self,
        peer_id: &PeerId,
        connection_id: &ConnectionId,
        kind: ConnectionType,
    ) -> SignalResult<ConnectionInfo> {
        match self.entries.entry(connection_id.clone()) {
            Entry::Occupied(_) => Err(SignalError::DuplicateConnection(connection_id.clone())),
            Entry::Vacant(slot) => {
                let info = ConnectionInfo {
                    connection_id: connection_id.clone(),
                    kind,
                    peer_id: peer_id.clone(),
                };
                slot.insert(info.clone());
                Ok(info)
            }
        }
    }

    pub fn find_by_id(&self, connection_id: &ConnectionId) -> Option<ConnectionInfo> {
        self.entries.get(connection_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, peer_id: &PeerId, connection_id: &ConnectionId) -> bool {
        self.entries
            .get(connection_id)
            .is_some_and(|entry| entry.peer_id == *peer_id)
    }

    /// Best effort; a missing entry is logged, not an error.
    pub fn remove(&self, peer_id: &PeerId, connection_id: &ConnectionId) -> Option<ConnectionInfo> {
        let removed = self
            .entries
            .remove_if(connection_id, |_, info| info.peer_id == *peer_id)
            .map(|(_, info)| info);
        if removed.is_none() {
            tracing::debug!(
                target = "signalling",
                peer = %peer_id,
                connection_id = %connection_id,
                "connection already gone from registry"
            );
        }
        removed
    }

    pub fn remove_peer(&self, peer_id: &PeerId) -> Vec<ConnectionInfo> {
        let ids: Vec<ConnectionId> = self
            .entries
            .iter()
            .filter(|entry| entry.peer_id == *peer_id)
            .map(|entry| entry.key().clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.entries.remove(id).map(|(_, info)| info))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn id(raw: &str) -> ConnectionId {
        ConnectionId::new(raw)
    }

    #[test]
    fn duplicate_id_is_refused_for_any_peer_or_type() {
        let registry = ConnectionRegistry::new();
        registry
            .save(&PeerId::new("a"), &id("dc_one"), ConnectionType::Data)
            .unwrap();

        let err = registry
            .save(&PeerId::new("b"), &id("dc_one"), ConnectionType::Media)
            .unwrap_err();
        assert!(matches!(err, SignalError::DuplicateConnection(ref dup) if *dup == id("dc_one")));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.find_by_id(&id("dc_one")).map(|info| info.peer_id),
            Some(PeerId::new("a"))
        );
    }

    #[test]
    fn concurrent_saves_admit_exactly_one() {
        let registry = ConnectionRegistry::new();
        let wins = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for n in 0..8 {
                let registry = &registry;
                let wins = &wins;
                scope.spawn(move || {
                    let peer = PeerId::new(format!("peer-{n}"));
                    if registry.save(&peer, &id("mc_race"), ConnectionType::Media).is_ok() {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });
        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_only_matches_the_owning_peer() {
        let registry = ConnectionRegistry::new();
        let owner = PeerId::new("owner");
        registry.save(&owner, &id("dc_x"), ConnectionType::Data).unwrap();

        assert!(registry.remove(&PeerId::new("stranger"), &id("dc_x")).is_none());
        assert!(registry.contains(&owner, &id("dc_x")));
        assert!(registry.remove(&owner, &id("dc_x")).is_some());
        assert!(registry.remove(&owner, &id("dc_x")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_peer_evicts_all_of_its_connections() {
        let registry = ConnectionRegistry::new();
        let leaving = PeerId::new("leaving");
        let staying = PeerId::new("staying");
        registry.save(&leaving, &id("dc_1"), ConnectionType::Data).unwrap();
        registry.save(&leaving, &id("mc_2"), ConnectionType::Media).unwrap();
        registry.save(&staying, &id("dc_3"), ConnectionType::Data).unwrap();

        let evicted = registry.remove_peer(&leaving);
        assert_eq!(evicted.len(), 2);
        assert!(evicted.iter().all(|info| info.peer_id == leaving));
        assert_eq!(registry.len(), 1);
    }
}
