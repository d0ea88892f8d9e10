use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use rustc_hash::FxHashMap;

use crate::message::{MessageId, SenderId};

/// The sender id of the local end point. A client's id is assigned by the server during the
///  handshake.
pub struct LocalIdentity {
    sender_id: AtomicU32,
}
impl LocalIdentity {
    pub fn new(sender_id: SenderId) -> LocalIdentity {
        LocalIdentity {
            sender_id: AtomicU32::new(sender_id.to_raw()),
        }
    }

    pub fn sender_id(&self) -> SenderId {
        SenderId::from_raw(self.sender_id.load(Ordering::Acquire))
    }

    pub fn set_sender_id(&self, sender_id: SenderId) {
        self.sender_id.store(sender_id.to_raw(), Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PeerInfo {
    pub sender_id: SenderId,
    pub addr: SocketAddr,
    /// the connect request the peer was registered with, if it did a handshake
    pub connect_request_id: Option<MessageId>,
}

/// Maps sender ids to transport addresses and back. A server registers its clients here, a
///  client has its server as the only entry.
#[derive(Default)]
pub struct PeerRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    by_id: FxHashMap<SenderId, PeerInfo>,
    by_addr: FxHashMap<SocketAddr, SenderId>,
}

impl PeerRegistry {
    pub fn new() -> PeerRegistry {
        Default::default()
    }

    pub fn register(&self, sender_id: SenderId, addr: SocketAddr, connect_request_id: Option<MessageId>) {
        let mut inner = self.inner.write().unwrap();
        if let Some(previous) = inner.by_id.insert(sender_id, PeerInfo { sender_id, addr, connect_request_id }) {
            inner.by_addr.remove(&previous.addr);
        }
        inner.by_addr.insert(addr, sender_id);
    }

    pub fn remove(&self, sender_id: SenderId) -> Option<PeerInfo> {
        let mut inner = self.inner.write().unwrap();
        let removed = inner.by_id.remove(&sender_id)?;
        if inner.by_addr.get(&removed.addr) == Some(&sender_id) {
            inner.by_addr.remove(&removed.addr);
        }
        Some(removed)
    }

    pub fn get(&self, sender_id: SenderId) -> Option<PeerInfo> {
        self.inner.read().unwrap()
            .by_id.get(&sender_id)
            .cloned()
    }

    pub fn addr_of(&self, sender_id: SenderId) -> Option<SocketAddr> {
        self.get(sender_id)
            .map(|info| info.addr)
    }

    pub fn lookup_addr(&self, addr: SocketAddr) -> Option<PeerInfo> {
        let inner = self.inner.read().unwrap();
        inner.by_addr.get(&addr)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    pub fn contains(&self, sender_id: SenderId) -> bool {
        self.inner.read().unwrap()
            .by_id.contains_key(&sender_id)
    }

    pub fn ids(&self) -> Vec<SenderId> {
        let mut result = self.inner.read().unwrap()
            .by_id.keys()
            .cloned()
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    /// Picks a sender id for a connecting client: the claimed id if it is free, the lowest free
    ///  id otherwise
    pub fn free_sender_id(&self, claimed: Option<SenderId>) -> SenderId {
        let inner = self.inner.read().unwrap();
        if let Some(claimed) = claimed {
            if claimed != SenderId::SERVER && !inner.by_id.contains_key(&claimed) {
                return claimed;
            }
        }

        (1..=u32::MAX)
            .map(SenderId::from_raw)
            .find(|id| !inner.by_id.contains_key(id))
            .unwrap_or(SenderId::SERVER)
    }
}

/// Per-peer state of a processor. Each peer's state has its own lock, so work for different
///  peers never contends beyond the short map lookup.
pub struct PeerMap<T> {
    peers: RwLock<FxHashMap<SenderId, Arc<Mutex<T>>>>,
}

impl<T> Default for PeerMap<T> {
    fn default() -> Self {
        PeerMap {
            peers: Default::default(),
        }
    }
}

impl<T> PeerMap<T> {
    pub fn new() -> PeerMap<T> {
        Default::default()
    }

    fn get(&self, peer: SenderId) -> Option<Arc<Mutex<T>>> {
        self.peers.read().unwrap()
            .get(&peer)
            .cloned()
    }

    /// Runs `f` on a peer's state if there is state for the peer
    pub fn with_existing<R>(&self, peer: SenderId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let state = self.get(peer)?;
        let mut state = state.lock().unwrap();
        Some(f(&mut state))
    }

    pub fn with_or_insert<R>(&self, peer: SenderId, create: impl FnOnce() -> T, f: impl FnOnce(&mut T) -> R) -> R {
        let state = match self.get(peer) {
            Some(state) => state,
            None => self.peers.write().unwrap()
                .entry(peer)
                .or_insert_with(|| Arc::new(Mutex::new(create())))
                .clone(),
        };
        let mut state = state.lock().unwrap();
        f(&mut state)
    }

    /// Runs `f` for every peer, locking one peer's state at a time
    pub fn for_each(&self, mut f: impl FnMut(SenderId, &mut T)) {
        let snapshot = self.peers.read().unwrap()
            .iter()
            .map(|(peer, state)| (*peer, state.clone()))
            .collect::<Vec<_>>();

        for (peer, state) in snapshot {
            let mut state = state.lock().unwrap();
            f(peer, &mut state);
        }
    }

    pub fn remove(&self, peer: SenderId) -> bool {
        self.peers.write().unwrap()
            .remove(&peer)
            .is_some()
    }

    pub fn contains(&self, peer: SenderId) -> bool {
        self.peers.read().unwrap()
            .contains_key(&peer)
    }
}

impl<T: Default> PeerMap<T> {
    pub fn with<R>(&self, peer: SenderId, f: impl FnOnce(&mut T) -> R) -> R {
        self.with_or_insert(peer, T::default, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_addr;

    fn id(raw: u32) -> SenderId {
        SenderId::from_raw(raw)
    }

    #[test]
    fn test_registry_lookup_both_ways() {
        let registry = PeerRegistry::new();
        registry.register(id(3), test_addr(3), Some(MessageId::from_raw(1)));

        assert_eq!(registry.addr_of(id(3)), Some(test_addr(3)));
        assert_eq!(registry.lookup_addr(test_addr(3)).map(|p| p.sender_id), Some(id(3)));
        assert_eq!(registry.lookup_addr(test_addr(4)), None);

        registry.remove(id(3));
        assert_eq!(registry.addr_of(id(3)), None);
        assert_eq!(registry.lookup_addr(test_addr(3)), None);
    }

    #[test]
    fn test_registry_reregister_moves_address() {
        let registry = PeerRegistry::new();
        registry.register(id(3), test_addr(3), None);
        registry.register(id(3), test_addr(9), None);

        assert_eq!(registry.lookup_addr(test_addr(3)), None);
        assert_eq!(registry.lookup_addr(test_addr(9)).map(|p| p.sender_id), Some(id(3)));
    }

    #[test]
    fn test_free_sender_id() {
        let registry = PeerRegistry::new();
        assert_eq!(registry.free_sender_id(None), id(1));
        assert_eq!(registry.free_sender_id(Some(id(7))), id(7));

        registry.register(id(1), test_addr(1), None);
        registry.register(id(7), test_addr(7), None);
        assert_eq!(registry.free_sender_id(None), id(2));
        assert_eq!(registry.free_sender_id(Some(id(7))), id(2));
        assert_eq!(registry.free_sender_id(Some(SenderId::SERVER)), id(2));
    }

    #[test]
    fn test_peer_map() {
        let map = PeerMap::<u32>::new();
        assert_eq!(map.with_existing(id(1), |v| *v), None);

        map.with(id(1), |v| *v += 5);
        map.with(id(1), |v| *v += 1);
        map.with(id(2), |v| *v = 10);
        assert_eq!(map.with_existing(id(1), |v| *v), Some(6));

        let mut all = Vec::new();
        map.for_each(|peer, v| all.push((peer, *v)));
        all.sort();
        assert_eq!(all, vec![(id(1), 6), (id(2), 10)]);

        assert!(map.remove(id(1)));
        assert!(!map.contains(id(1)));
        assert!(!map.remove(id(1)));
    }
}
