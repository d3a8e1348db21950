// Tracking list - arena-backed doubly linked list
//
// Every live GPU resource of a device sits in one of these, in creation
// order. Nodes live in a slot arena and link to each other by index, so
// insert-at-tail and remove-by-handle are both O(1). Handles carry the slot
// generation; a handle whose node was removed never resolves again, even
// after its slot is reused.

/// Stable reference to one node of a [`TrackingList`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    index: u32,
    generation: u32,
}

struct Node<T> {
    value: T,
    prev: Option<u32>,
    next: Option<u32>,
}

struct Slot<T> {
    generation: u32,
    node: Option<Node<T>>,
}

pub struct TrackingList<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl<T> Default for TrackingList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TrackingList<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `value` at the tail and return the handle that removes it.
    pub fn register(&mut self, value: T) -> NodeHandle {
        let node = Node {
            value,
            prev: self.tail,
            next: None,
        };

        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].node = Some(node);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                (self.slots.len() - 1) as u32
            }
        };

        match self.tail {
            Some(tail) => {
                if let Some(tail_node) = self.node_at_mut(tail) {
                    tail_node.next = Some(index);
                }
            }
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;

        self.handle_at(index)
    }

    /// Unlink the node and hand its value back.
    ///
    /// Returns `None` for a stale handle or one that never belonged to this
    /// list; the list is left untouched in that case.
    pub fn unregister(&mut self, handle: NodeHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);

        match node.prev {
            Some(prev) => {
                if let Some(prev_node) = self.node_at_mut(prev) {
                    prev_node.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => {
                if let Some(next_node) = self.node_at_mut(next) {
                    next_node.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }
        self.len -= 1;

        Some(node.value)
    }

    pub fn contains(&self, handle: NodeHandle) -> bool {
        self.node(handle).is_some()
    }

    pub fn get(&self, handle: NodeHandle) -> Option<&T> {
        self.node(handle).map(|node| &node.value)
    }

    pub fn get_mut(&mut self, handle: NodeHandle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.node.as_mut().map(|node| &mut node.value)
    }

    pub fn head(&self) -> Option<NodeHandle> {
        self.head.map(|index| self.handle_at(index))
    }

    pub fn tail(&self) -> Option<NodeHandle> {
        self.tail.map(|index| self.handle_at(index))
    }

    pub fn next(&self, handle: NodeHandle) -> Option<NodeHandle> {
        self.node(handle)?.next.map(|index| self.handle_at(index))
    }

    pub fn prev(&self, handle: NodeHandle) -> Option<NodeHandle> {
        self.node(handle)?.prev.map(|index| self.handle_at(index))
    }

    /// Head-to-tail traversal
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    /// Drop every node. Outstanding handles become stale.
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.node.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.head = None;
        self.tail = None;
        self.len = 0;
    }

    fn node(&self, handle: NodeHandle) -> Option<&Node<T>> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.node.as_ref()
    }

    fn node_at_mut(&mut self, index: u32) -> Option<&mut Node<T>> {
        self.slots.get_mut(index as usize)?.node.as_mut()
    }

    fn handle_at(&self, index: u32) -> NodeHandle {
        NodeHandle {
            index,
            generation: self.slots[index as usize].generation,
        }
    }
}

pub struct Iter<'a, T> {
    list: &'a TrackingList<T>,
    cursor: Option<u32>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (NodeHandle, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let node = self.list.slots[index as usize].node.as_ref()?;
        self.cursor = node.next;
        Some((self.list.handle_at(index), &node.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(list: &TrackingList<&'static str>) -> Vec<&'static str> {
        list.iter().map(|(_, value)| *value).collect()
    }

    #[test]
    fn removing_middle_node_relinks_neighbours() {
        let mut list = TrackingList::new();
        let a = list.register("A");
        let b = list.register("B");
        let c = list.register("C");

        assert_eq!(list.unregister(b), Some("B"));

        assert_eq!(values(&list), vec!["A", "C"]);
        assert_eq!(list.head(), Some(a));
        assert_eq!(list.tail(), Some(c));
        assert_eq!(list.next(a), Some(c));
        assert_eq!(list.prev(c), Some(a));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn removing_boundaries_updates_head_and_tail() {
        let mut list = TrackingList::new();
        let a = list.register("A");
        let b = list.register("B");
        let c = list.register("C");

        list.unregister(a);
        assert_eq!(list.head(), Some(b));
        assert_eq!(list.prev(b), None);

        list.unregister(c);
        assert_eq!(list.tail(), Some(b));
        assert_eq!(list.next(b), None);

        list.unregister(b);
        assert!(list.is_empty());
        assert_eq!(list.head(), None);
        assert_eq!(list.tail(), None);
    }

    #[test]
    fn stale_handles_are_rejected() {
        let mut list = TrackingList::new();
        let a = list.register("A");
        list.unregister(a);

        assert_eq!(list.unregister(a), None);
        assert!(!list.contains(a));
        assert_eq!(list.get(a), None);
    }

    #[test]
    fn reused_slot_does_not_resolve_old_handle() {
        let mut list = TrackingList::new();
        let old = list.register("old");
        list.unregister(old);
        let new = list.register("new");

        assert_ne!(old, new);
        assert_eq!(list.get(old), None);
        assert_eq!(list.get(new), Some(&"new"));
    }

    #[test]
    fn new_entries_go_to_the_tail() {
        let mut list = TrackingList::new();
        let a = list.register("A");
        list.register("B");
        list.unregister(a);
        list.register("C");

        assert_eq!(values(&list), vec!["B", "C"]);
    }

    #[test]
    fn clear_empties_and_invalidates() {
        let mut list = TrackingList::new();
        let a = list.register("A");
        list.register("B");

        list.clear();

        assert!(list.is_empty());
        assert_eq!(list.head(), None);
        assert_eq!(list.tail(), None);
        assert!(!list.contains(a));

        let c = list.register("C");
        assert_eq!(list.head(), Some(c));
        assert_eq!(list.tail(), Some(c));
    }
}
