use dashmap::{DashMap, mapref::entry::Entry};
use std::sync::Arc;

use crate::error::JoinError;
use crate::peer::{Peer, PeerId};

/// Who is online: username to connection handle.
///
/// Every operation locks at most one shard for the duration of a map access.
/// Callers never hold a guard across I/O; broadcast targets are copied out
/// with [`Registry::targets`] before anything is written.
#[derive(Clone, Default)]
pub struct Registry {
    peers: Arc<DashMap<String, Peer>>,
}

impl Registry {
    /// Inserts `peer` under `name` if the name is free. The absence check and
    /// the insert happen under one shard lock, so concurrent joins with the
    /// same name admit exactly one caller.
    ///
    /// `on_admit` runs inside that critical section, before the entry becomes
    /// visible to anyone else. It must not touch the registry.
    pub fn register<F>(&self, name: &str, peer: Peer, on_admit: F) -> Result<(), JoinError>
    where
        F: FnOnce(&Peer),
    {
        match self.peers.entry(name.to_string()) {
            Entry::Occupied(_) => Err(JoinError::NameTaken),
            Entry::Vacant(slot) => {
                on_admit(&peer);
                slot.insert(peer);
                Ok(())
            }
        }
    }

    /// Removes `name` if it still belongs to connection `id`. Removing an
    /// absent name, or one since taken by another connection, is a no-op.
    pub fn unregister(&self, name: &str, id: PeerId) -> Option<Peer> {
        self.peers
            .remove_if(name, |_, peer| peer.id() == id)
            .map(|(_, peer)| peer)
    }

    pub fn lookup(&self, name: &str) -> Option<Peer> {
        self.peers.get(name).map(|guard| guard.clone())
    }

    /// Sorted names of everyone currently registered.
    pub fn snapshot(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Copies out every live entry so delivery can happen without a lock held.
    pub fn targets(&self) -> Vec<(String, Peer)> {
        self.peers
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

#[cfg(test)]
impl Registry {
    pub(crate) fn contains(&self, name: &str) -> bool {
        self.peers.contains_key(name)
    }

    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, thread};

    use super::*;
    use crate::peer::Outbox;

    fn peer() -> (Peer, Outbox) {
        let addr: SocketAddr = "127.0.0.1:5555".parse().expect("addr");
        Peer::new(addr, 8)
    }

    #[test]
    fn rejects_duplicate_names() {
        let registry = Registry::default();
        let (alice, _a) = peer();
        let (impostor, _b) = peer();

        registry.register("alice", alice, |_| {}).expect("first registration");
        let second = registry.register("alice", impostor, |_| panic!("must not admit"));

        assert_eq!(second, Err(JoinError::NameTaken));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_registrations_admit_one() {
        let registry = Registry::default();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let (candidate, _outbox) = peer();
                    registry.register("carol", candidate, |_| {}).is_ok()
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .filter(|ok| *ok)
            .count();

        assert_eq!(admitted, 1);
        assert_eq!(registry.snapshot(), vec!["carol".to_string()]);
    }

    #[test]
    fn unregister_is_idempotent_and_owner_checked() {
        let registry = Registry::default();
        let (first, _a) = peer();
        let first_id = first.id();
        registry.register("dave", first, |_| {}).expect("register");

        assert!(registry.unregister("dave", first_id).is_some());
        assert!(registry.unregister("dave", first_id).is_none());
        assert!(registry.unregister("nobody", first_id).is_none());

        let (second, _b) = peer();
        registry.register("dave", second, |_| {}).expect("name is free again");
        assert!(registry.unregister("dave", first_id).is_none());
        assert!(registry.contains("dave"));
    }

    #[test]
    fn snapshot_and_lookup_track_membership() {
        let registry = Registry::default();
        let (bob, _b) = peer();
        let (alice, _a) = peer();
        let alice_id = alice.id();
        let bob_id = bob.id();

        registry.register("bob", bob, |_| {}).expect("bob");
        registry.register("alice", alice, |_| {}).expect("alice");

        assert_eq!(registry.snapshot(), vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(registry.lookup("alice").map(|p| p.id()), Some(alice_id));
        assert!(registry.lookup("ghost").is_none());

        registry.unregister("bob", bob_id);
        assert_eq!(registry.snapshot(), vec!["alice".to_string()]);
        assert_eq!(registry.targets().len(), 1);
    }

    #[test]
    fn admit_hook_runs_before_entry_is_visible() {
        let registry = Registry::default();
        let (erin, _e) = peer();
        let mut ran = false;

        registry
            .register("erin", erin, |_| ran = true)
            .expect("register");

        assert!(ran);
        assert!(registry.contains("erin"));
    }
}
