//! Domain table
//!
//! One entry per domain init has spawned, indexed by domain id. Id 0 is init
//! itself and is never handed out again. A freed id is reused before the
//! table grows; when it must grow, its capacity doubles.

use alloc::string::String;
use alloc::vec::Vec;

use tern_cap::Capability;
use tern_ipc::{ChannelId, DomainId};

/// Domain id of init
pub const INIT_DOMAIN: DomainId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Free,
    Running,
    /// Allocated, dispatcher not (or no longer) runnable
    Stopped,
}

#[derive(Debug)]
pub struct DomainRecord {
    pub id: DomainId,
    pub name: String,
    pub state: DomainState,
    pub core: usize,
    pub dispatcher: Option<Capability>,
    /// The domain's root CNode
    pub cnode: Option<Capability>,
    /// Init's side of the domain's init channel
    pub channel: Option<ChannelId>,
    /// Other channels init opened on the domain's behalf
    pub owned_channels: Vec<ChannelId>,
}

impl DomainRecord {
    fn new(id: DomainId, name: &str, core: usize) -> Self {
        Self {
            id,
            name: String::from(name),
            state: DomainState::Stopped,
            core,
            dispatcher: None,
            cnode: None,
            channel: None,
            owned_channels: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct DomainTable {
    slots: Vec<Option<DomainRecord>>,
    capacity: usize,
}

impl DomainTable {
    /// Table with room for `capacity` domains, init already in slot 0
    pub fn new(capacity: usize, init_core: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        let mut init = DomainRecord::new(INIT_DOMAIN, "init", init_core);
        init.state = DomainState::Running;
        slots.push(Some(init));
        Self { slots, capacity }
    }

    /// Reserve an id for a new domain, in state `Stopped`
    pub fn alloc(&mut self, name: &str, core: usize) -> DomainId {
        let free = self.slots.iter().skip(1).position(Option::is_none).map(|i| i + 1);
        let id = match free {
            Some(id) => id,
            None => {
                if self.slots.len() == self.capacity {
                    self.slots.reserve_exact(self.capacity);
                    self.capacity *= 2;
                }
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        self.slots[id] = Some(DomainRecord::new(id, name, core));
        id
    }

    /// Free `id`, handing back its record; init's entry cannot be released
    pub fn release(&mut self, id: DomainId) -> Option<DomainRecord> {
        if id == INIT_DOMAIN {
            return None;
        }
        self.slots.get_mut(id).and_then(Option::take)
    }

    pub fn get(&self, id: DomainId) -> Option<&DomainRecord> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: DomainId) -> Option<&mut DomainRecord> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    pub fn state(&self, id: DomainId) -> DomainState {
        self.get(id).map_or(DomainState::Free, |d| d.state)
    }

    /// Domain whose init channel is `chan`
    pub fn by_channel(&self, chan: ChannelId) -> Option<DomainId> {
        self.slots
            .iter()
            .flatten()
            .find(|d| d.channel == Some(chan))
            .map(|d| d.id)
    }

    /// Live domain ids in ascending order
    pub fn ids(&self) -> impl Iterator<Item = DomainId> + '_ {
        self.slots.iter().flatten().map(|d| d.id)
    }

    /// Number of live domains, init included
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_owns_id_zero() {
        let mut table = DomainTable::new(4, 0);
        assert_eq!(table.state(INIT_DOMAIN), DomainState::Running);
        assert_eq!(table.get(INIT_DOMAIN).map(|d| d.name.as_str()), Some("init"));
        assert!(table.release(INIT_DOMAIN).is_none());
        assert_eq!(table.alloc("a", 0), 1);
    }

    #[test]
    fn test_lowest_free_id_reused() {
        let mut table = DomainTable::new(8, 0);
        let a = table.alloc("a", 0);
        let b = table.alloc("b", 0);
        let c = table.alloc("c", 0);
        assert_eq!((a, b, c), (1, 2, 3));

        assert_eq!(table.release(b).map(|d| d.name), Some(String::from("b")));
        assert_eq!(table.release(a).map(|d| d.id), Some(1));
        assert_eq!(table.state(a), DomainState::Free);
        assert_eq!(table.alloc("d", 0), 1);
        assert_eq!(table.alloc("e", 0), 2);
        assert_eq!(table.alloc("f", 0), 4);
        assert_eq!(table.ids().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_capacity_doubles() {
        let mut table = DomainTable::new(2, 0);
        assert_eq!(table.capacity(), 2);
        table.alloc("a", 0);
        assert_eq!(table.capacity(), 2);
        table.alloc("b", 0);
        assert_eq!(table.capacity(), 4);
        table.alloc("c", 0);
        table.alloc("d", 0);
        assert_eq!(table.capacity(), 8);
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn test_ids_unique_while_live() {
        let mut table = DomainTable::new(1, 0);
        let mut live = Vec::new();
        for round in 0..20 {
            live.push(table.alloc("x", 0));
            if round % 3 == 0 {
                let victim = live.remove(0);
                table.release(victim);
            }
        }
        let mut sorted = live.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), live.len());
        assert!(!live.contains(&INIT_DOMAIN));
    }

    #[test]
    fn test_by_channel() {
        let mut table = DomainTable::new(4, 0);
        let id = table.alloc("svc", 0);
        table.get_mut(id).unwrap().channel = Some(7);
        assert_eq!(table.by_channel(7), Some(id));
        assert_eq!(table.by_channel(8), None);
    }
}
