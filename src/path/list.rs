use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::path::path::{Path, PathType};

/// Stable handle to a path inside one table. A stale handle (path already
/// removed, slot reused) never resolves to another path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathId {
    pub(crate) path_type: PathType,
    slot: usize,
    generation: u64,
}

impl PathId {
    pub fn path_type(&self) -> PathType {
        self.path_type
    }
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    seq: u64,
    path: Option<Path>,
}

/// Insertion-ordered arena of paths with O(1) removal by handle and an
/// index on `cmd_id`.
#[derive(Debug)]
pub(crate) struct PathList {
    path_type: PathType,
    slots: Vec<Slot>,
    free: Vec<usize>,
    order: BTreeMap<u64, usize>,
    by_cmd_id: HashMap<String, BTreeSet<u64>>,
    next_seq: u64,
}

impl PathList {
    pub(crate) fn new(path_type: PathType) -> Self {
        Self {
            path_type,
            slots: Vec::new(),
            free: Vec::new(),
            order: BTreeMap::new(),
            by_cmd_id: HashMap::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub(crate) fn push(&mut self, path: Path) -> PathId {
        debug_assert_eq!(path.path_type, self.path_type);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_cmd_id.entry(path.cmd_id.clone()).or_default().insert(seq);

        let slot = match self.free.pop() {
            Some(slot) => {
                let s = &mut self.slots[slot];
                s.generation += 1;
                s.seq = seq;
                s.path = Some(path);
                slot
            }
            None => {
                self.slots.push(Slot { generation: 0, seq, path: Some(path) });
                self.slots.len() - 1
            }
        };
        self.order.insert(seq, slot);
        PathId { path_type: self.path_type, slot, generation: self.slots[slot].generation }
    }

    fn live_slot(&self, id: PathId) -> Option<&Slot> {
        if id.path_type != self.path_type {
            return None;
        }
        self.slots
            .get(id.slot)
            .filter(|s| s.generation == id.generation && s.path.is_some())
    }

    pub(crate) fn contains(&self, id: PathId) -> bool {
        self.live_slot(id).is_some()
    }

    pub(crate) fn get(&self, id: PathId) -> Option<&Path> {
        self.live_slot(id)?.path.as_ref()
    }

    /// `cmd_id` must not be changed through this reference; the index
    /// would go stale.
    pub(crate) fn get_mut(&mut self, id: PathId) -> Option<&mut Path> {
        if !self.contains(id) {
            return None;
        }
        self.slots[id.slot].path.as_mut()
    }

    pub(crate) fn remove(&mut self, id: PathId) -> Option<Path> {
        if !self.contains(id) {
            return None;
        }
        let slot = &mut self.slots[id.slot];
        let path = slot.path.take()?;
        let seq = slot.seq;
        self.order.remove(&seq);
        if let Some(seqs) = self.by_cmd_id.get_mut(&path.cmd_id) {
            seqs.remove(&seq);
            if seqs.is_empty() {
                self.by_cmd_id.remove(&path.cmd_id);
            }
        }
        self.free.push(id.slot);
        Some(path)
    }

    /// Oldest path carrying `cmd_id`.
    pub(crate) fn find(&self, cmd_id: &str) -> Option<PathId> {
        let seq = self.by_cmd_id.get(cmd_id)?.first()?;
        let slot = *self.order.get(seq)?;
        Some(self.id_of(slot))
    }

    fn id_of(&self, slot: usize) -> PathId {
        PathId { path_type: self.path_type, slot, generation: self.slots[slot].generation }
    }

    /// Handles in insertion order.
    pub(crate) fn ids(&self) -> Vec<PathId> {
        self.order.values().map(|slot| self.id_of(*slot)).collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (PathId, &Path)> {
        self.order.values().filter_map(|slot| {
            let path = self.slots[*slot].path.as_ref()?;
            Some((self.id_of(*slot), path))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn path_for(cmd_id: &str) -> Path {
        let mut cmd = Message::new_cmd("c");
        cmd.set_cmd_id(cmd_id);
        Path::new(PathType::Out, &cmd, None, u64::MAX)
    }

    #[test]
    fn keeps_insertion_order_across_removal() {
        let mut list = PathList::new(PathType::Out);
        let a = list.push(path_for("a"));
        let b = list.push(path_for("b"));
        let c = list.push(path_for("c"));
        list.remove(b).unwrap();
        let d = list.push(path_for("d"));
        assert_eq!(list.ids(), vec![a, c, d]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn stale_handle_does_not_alias_reused_slot() {
        let mut list = PathList::new(PathType::Out);
        let a = list.push(path_for("a"));
        list.remove(a).unwrap();
        let b = list.push(path_for("b"));
        assert!(list.get(a).is_none());
        assert!(list.remove(a).is_none());
        assert_eq!(list.get(b).unwrap().cmd_id(), "b");
    }

    #[test]
    fn find_returns_oldest_match() {
        let mut list = PathList::new(PathType::Out);
        let first = list.push(path_for("dup"));
        let second = list.push(path_for("dup"));
        assert_eq!(list.find("dup"), Some(first));
        list.remove(first);
        assert_eq!(list.find("dup"), Some(second));
        list.remove(second);
        assert_eq!(list.find("dup"), None);
        assert!(list.is_empty());
    }

    #[test]
    fn handle_of_other_direction_is_rejected() {
        let mut out = PathList::new(PathType::Out);
        let id = out.push(path_for("a"));
        let in_list = PathList::new(PathType::In);
        assert!(!in_list.contains(id));
    }
}
