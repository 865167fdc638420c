//! Arena-backed ordered queues.
//!
//! A [`QueueArena`] owns a pool of nodes and hosts any number of circular,
//! sentinel-terminated queues built out of them. Every node is addressed through a
//! [`NodeId`] that stays valid while the node is linked, so callers can remember a
//! position, splice runs of nodes from one queue into another, or remove a node from the
//! middle of a queue in O(1).
//!
//! The sentinel of a queue is itself a node: [`QueueArena::end`] returns it, and
//! [`QueueArena::begin`] returns the first element or the sentinel when the queue is empty.
//! Walking with [`QueueArena::next`] from `begin` until `end` visits the queue in order.
//!
//! Handles carry a generation. Once a node is removed its slot can be reused, and any
//! handle to the old occupant reads as absent instead of aliasing the new one.

use std::mem;

/// Stable handle to a node (or a queue sentinel) inside a [`QueueArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

/// Handle to one queue inside a [`QueueArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(NodeId);

#[derive(Debug)]
enum Slot<T> {
    Sentinel,
    Occupied(T),
    Vacant,
}

#[derive(Debug)]
struct Node<T> {
    previous: u32,
    next: u32,
    generation: u32,
    slot: Slot<T>,
}

/// Node pool hosting many ordered queues.
#[derive(Debug)]
pub struct QueueArena<T> {
    nodes: Vec<Node<T>>,
    free: Vec<u32>,
}

impl<T> Default for QueueArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> QueueArena<T> {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self { nodes: Vec::new(), free: Vec::new() }
    }

    /// Creates a new, empty queue.
    pub fn create_queue(&mut self) -> QueueId {
        QueueId(self.allocate(Slot::Sentinel))
    }

    /// Releases a queue's sentinel, dropping anything still linked into it.
    pub fn remove_queue(&mut self, queue: QueueId) {
        while self.pop_front(queue).is_some() {}
        if self.is_sentinel(queue.0) {
            self.release(queue.0.index);
        }
    }

    /// First node of the queue, or its sentinel when empty.
    #[inline]
    pub fn begin(&self, queue: QueueId) -> NodeId {
        self.next(queue.0)
    }

    /// The queue's sentinel.
    #[inline]
    pub fn end(&self, queue: QueueId) -> NodeId {
        queue.0
    }

    /// Node after `node`. The node after the last element is the sentinel.
    #[inline]
    pub fn next(&self, node: NodeId) -> NodeId {
        self.handle(self.nodes[node.index as usize].next)
    }

    /// Node before `node`. The node before the first element is the sentinel.
    #[inline]
    pub fn previous(&self, node: NodeId) -> NodeId {
        self.handle(self.nodes[node.index as usize].previous)
    }

    /// First element, if any.
    pub fn front(&self, queue: QueueId) -> Option<NodeId> {
        let first = self.begin(queue);
        (first != queue.0).then_some(first)
    }

    /// Last element, if any.
    pub fn back(&self, queue: QueueId) -> Option<NodeId> {
        let last = self.previous(queue.0);
        (last != queue.0).then_some(last)
    }

    /// True when the queue has no elements.
    #[inline]
    pub fn is_empty(&self, queue: QueueId) -> bool {
        self.nodes[queue.0.index as usize].next == queue.0.index
    }

    /// Counts the queue's elements by walking it.
    pub fn size(&self, queue: QueueId) -> usize {
        self.iter(queue).count()
    }

    /// Links a new node holding `value` immediately before `before`.
    ///
    /// Passing a queue's sentinel appends to that queue.
    pub fn insert(&mut self, before: NodeId, value: T) -> NodeId {
        debug_assert!(self.is_live(before), "insert position is not linked");
        let node = self.allocate(Slot::Occupied(value));
        self.link(before.index, node.index);
        node
    }

    /// Appends `value` to the back of the queue.
    pub fn push_back(&mut self, queue: QueueId, value: T) -> NodeId {
        self.insert(queue.0, value)
    }

    /// Unlinks a node and returns its value.
    ///
    /// Returns `None` for stale handles and sentinels.
    pub fn remove(&mut self, node: NodeId) -> Option<T> {
        if !self.contains(node) {
            return None;
        }
        self.unlink(node.index);
        match self.release(node.index) {
            Slot::Occupied(value) => Some(value),
            _ => None,
        }
    }

    /// Removes and returns the first element.
    pub fn pop_front(&mut self, queue: QueueId) -> Option<T> {
        let first = self.front(queue)?;
        self.remove(first)
    }

    /// Unlinks `node` from wherever it is and relinks it before `before`.
    pub fn move_node(&mut self, before: NodeId, node: NodeId) {
        debug_assert!(self.contains(node), "moved node is not linked");
        self.unlink(node.index);
        self.link(before.index, node.index);
    }

    /// Splices the run `first..=last` so that it sits immediately before `before`.
    ///
    /// The run must be contiguous and must not contain `before`. The source and
    /// destination may be different queues of the same arena.
    pub fn move_range(&mut self, before: NodeId, first: NodeId, last: NodeId) {
        let (first, last, before) = (first.index, last.index, before.index);

        let first_previous = self.nodes[first as usize].previous;
        let last_next = self.nodes[last as usize].next;
        self.nodes[first_previous as usize].next = last_next;
        self.nodes[last_next as usize].previous = first_previous;

        let before_previous = self.nodes[before as usize].previous;
        self.nodes[first as usize].previous = before_previous;
        self.nodes[last as usize].next = before;
        self.nodes[before_previous as usize].next = first;
        self.nodes[before as usize].previous = last;
    }

    /// Value stored at `node`, if the handle is still live.
    pub fn get(&self, node: NodeId) -> Option<&T> {
        match self.nodes.get(node.index as usize) {
            Some(Node { generation, slot: Slot::Occupied(value), .. })
                if *generation == node.generation =>
            {
                Some(value)
            }
            _ => None,
        }
    }

    /// Mutable value stored at `node`, if the handle is still live.
    pub fn get_mut(&mut self, node: NodeId) -> Option<&mut T> {
        match self.nodes.get_mut(node.index as usize) {
            Some(Node { generation, slot: Slot::Occupied(value), .. })
                if *generation == node.generation =>
            {
                Some(value)
            }
            _ => None,
        }
    }

    /// True when `node` is a live element (not a sentinel).
    pub fn contains(&self, node: NodeId) -> bool {
        self.get(node).is_some()
    }

    /// Iterates a queue front to back.
    pub fn iter(&self, queue: QueueId) -> Iter<'_, T> {
        Iter { arena: self, current: self.begin(queue), end: queue.0 }
    }

    fn is_sentinel(&self, node: NodeId) -> bool {
        matches!(
            self.nodes.get(node.index as usize),
            Some(Node { generation, slot: Slot::Sentinel, .. }) if *generation == node.generation
        )
    }

    fn is_live(&self, node: NodeId) -> bool {
        self.contains(node) || self.is_sentinel(node)
    }

    fn handle(&self, index: u32) -> NodeId {
        NodeId { index, generation: self.nodes[index as usize].generation }
    }

    fn allocate(&mut self, slot: Slot<T>) -> NodeId {
        match self.free.pop() {
            Some(index) => {
                let node = &mut self.nodes[index as usize];
                node.generation = node.generation.wrapping_add(1);
                node.previous = index;
                node.next = index;
                node.slot = slot;
                NodeId { index, generation: node.generation }
            }
            None => {
                let index = self.nodes.len() as u32;
                self.nodes.push(Node { previous: index, next: index, generation: 0, slot });
                NodeId { index, generation: 0 }
            }
        }
    }

    fn release(&mut self, index: u32) -> Slot<T> {
        self.free.push(index);
        mem::replace(&mut self.nodes[index as usize].slot, Slot::Vacant)
    }

    fn link(&mut self, before: u32, index: u32) {
        let previous = self.nodes[before as usize].previous;
        let node = &mut self.nodes[index as usize];
        node.previous = previous;
        node.next = before;
        self.nodes[previous as usize].next = index;
        self.nodes[before as usize].previous = index;
    }

    fn unlink(&mut self, index: u32) {
        let (previous, next) = {
            let node = &self.nodes[index as usize];
            (node.previous, node.next)
        };
        self.nodes[previous as usize].next = next;
        self.nodes[next as usize].previous = previous;
        let node = &mut self.nodes[index as usize];
        node.previous = index;
        node.next = index;
    }
}

/// Front-to-back iterator over one queue.
pub struct Iter<'a, T> {
    arena: &'a QueueArena<T>,
    current: NodeId,
    end: NodeId,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (NodeId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        while self.current != self.end {
            let node = self.current;
            self.current = self.arena.next(node);
            if let Some(value) = self.arena.get(node) {
                return Some((node, value));
            }
        }
        None
    }
}
