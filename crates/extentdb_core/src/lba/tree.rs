//! Arena-allocated B-tree keyed by logical address.

use crate::error::{CoreError, CoreResult};
use crate::lba::LbaEntry;
use crate::types::Laddr;

/// Reference to a node in one of the two arenas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeRef {
    Leaf(usize),
    Internal(usize),
}

#[derive(Debug, Clone, Default)]
struct Leaf {
    entries: Vec<LbaEntry>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// `keys[i]` is the smallest key reachable through `children[i + 1]`.
#[derive(Debug, Clone)]
struct Internal {
    keys: Vec<Laddr>,
    children: Vec<NodeRef>,
}

/// An ordered index of non-overlapping LBA entries.
///
/// Nodes live in two arenas (leaves and internal nodes) and refer to each
/// other by index. The leftmost leaf is always leaf 0: splits only ever
/// add nodes to the right of the node being split.
#[derive(Debug, Clone)]
pub struct LbaTree {
    leaves: Vec<Leaf>,
    internals: Vec<Internal>,
    root: NodeRef,
    leaf_capacity: usize,
    internal_capacity: usize,
    len: usize,
    depth: usize,
    splits: u64,
}

impl LbaTree {
    /// Creates an empty tree with the given node capacities.
    #[must_use]
    pub fn new(leaf_capacity: usize, internal_capacity: usize) -> Self {
        Self {
            leaves: vec![Leaf::default()],
            internals: Vec::new(),
            root: NodeRef::Leaf(0),
            leaf_capacity: leaf_capacity.max(2),
            internal_capacity: internal_capacity.max(3),
            len: 0,
            depth: 1,
            splits: 0,
        }
    }

    /// Removes every entry and node.
    pub fn clear(&mut self) {
        *self = Self::new(self.leaf_capacity, self.internal_capacity);
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the tree holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the number of levels; 1 while the root is a leaf.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Returns the number of node splits since creation.
    #[must_use]
    pub fn splits(&self) -> u64 {
        self.splits
    }

    /// Returns the number of allocated nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.leaves.len() + self.internals.len()
    }

    /// Inserts an entry.
    ///
    /// # Errors
    ///
    /// Returns `Overlap` if the entry intersects a live entry, or
    /// `InvalidOperation` for an empty or overflowing range.
    pub fn insert(&mut self, entry: LbaEntry) -> CoreResult<()> {
        if entry.len == 0 {
            return Err(CoreError::invalid_operation("cannot map an empty range"));
        }
        let Some(end) = entry.laddr.checked_add(entry.len) else {
            return Err(CoreError::invalid_operation(format!(
                "range at {} overflows the address space",
                entry.laddr
            )));
        };
        if let Some(existing) = self.range(entry.laddr.as_u64(), end.as_u64()).first() {
            return Err(CoreError::Overlap {
                laddr: entry.laddr,
                len: entry.len,
                existing: existing.laddr,
            });
        }

        let (leaf_idx, path) = self.find_leaf(entry.laddr);
        let leaf = &mut self.leaves[leaf_idx];
        let pos = leaf.entries.partition_point(|e| e.laddr < entry.laddr);
        leaf.entries.insert(pos, entry);
        self.len += 1;

        if self.leaves[leaf_idx].entries.len() > self.leaf_capacity {
            self.split_leaf(leaf_idx, path);
        }
        Ok(())
    }

    /// Returns the entry starting exactly at `laddr`.
    #[must_use]
    pub fn get(&self, laddr: Laddr) -> Option<&LbaEntry> {
        let (leaf_idx, _) = self.find_leaf(laddr);
        let entries = &self.leaves[leaf_idx].entries;
        let pos = entries.partition_point(|e| e.laddr < laddr);
        entries.get(pos).filter(|e| e.laddr == laddr)
    }

    /// Returns the entry starting exactly at `laddr` for modification.
    ///
    /// Callers must not change `laddr` or `len`.
    pub fn get_mut(&mut self, laddr: Laddr) -> Option<&mut LbaEntry> {
        let (leaf_idx, _) = self.find_leaf(laddr);
        let entries = &mut self.leaves[leaf_idx].entries;
        let pos = entries.partition_point(|e| e.laddr < laddr);
        entries.get_mut(pos).filter(|e| e.laddr == laddr)
    }

    /// Removes the entry starting exactly at `laddr`.
    pub fn remove(&mut self, laddr: Laddr) -> Option<LbaEntry> {
        let (leaf_idx, _) = self.find_leaf(laddr);
        let entries = &mut self.leaves[leaf_idx].entries;
        let pos = entries.partition_point(|e| e.laddr < laddr);
        if entries.get(pos).is_some_and(|e| e.laddr == laddr) {
            self.len -= 1;
            Some(entries.remove(pos))
        } else {
            None
        }
    }

    /// Returns all entries intersecting `[start, end)`, in address order.
    #[must_use]
    pub fn range(&self, start: u64, end: u64) -> Vec<LbaEntry> {
        let mut out = Vec::new();
        if start >= end {
            return out;
        }

        let (leaf_idx, _) = self.find_leaf(Laddr::new(start));
        let pos = self.leaves[leaf_idx]
            .entries
            .partition_point(|e| e.laddr.as_u64() <= start);

        // Only the closest entry below `start` can reach into the range
        if let Some(prev) = self.entry_before(leaf_idx, pos) {
            if prev.end() > start {
                out.push(*prev);
            }
        }

        let mut cursor = Some((leaf_idx, pos));
        while let Some((idx, mut i)) = cursor {
            let leaf = &self.leaves[idx];
            while let Some(entry) = leaf.entries.get(i) {
                if entry.laddr.as_u64() >= end {
                    return out;
                }
                out.push(*entry);
                i += 1;
            }
            cursor = leaf.next.map(|next| (next, 0));
        }
        out
    }

    /// Iterates over all entries in address order.
    pub fn iter(&self) -> impl Iterator<Item = &LbaEntry> + '_ {
        let mut leaf = Some(0);
        std::iter::from_fn(move || {
            let idx = leaf?;
            let current = &self.leaves[idx];
            leaf = current.next;
            Some(current.entries.iter())
        })
        .flatten()
    }

    /// Checks the structural invariants of the tree.
    ///
    /// # Errors
    ///
    /// Returns a corruption error describing the first violation found.
    pub fn check_invariants(&self) -> CoreResult<()> {
        let mut count = 0;
        let mut prev_end: Option<u64> = None;
        for entry in self.iter() {
            if entry.len == 0 || entry.refcount == 0 {
                return Err(CoreError::corruption(format!(
                    "degenerate entry at {}",
                    entry.laddr
                )));
            }
            if let Some(end) = prev_end {
                if entry.laddr.as_u64() < end {
                    return Err(CoreError::corruption(format!(
                        "entry at {} overlaps its predecessor",
                        entry.laddr
                    )));
                }
            }
            prev_end = Some(entry.end());
            count += 1;
        }
        if count != self.len {
            return Err(CoreError::corruption(format!(
                "leaf chain holds {count} entries, tree counts {}",
                self.len
            )));
        }
        self.check_node(self.root, None, None, 1)
    }

    fn check_node(
        &self,
        node: NodeRef,
        low: Option<Laddr>,
        high: Option<Laddr>,
        level: usize,
    ) -> CoreResult<()> {
        let in_bounds =
            |key: Laddr| low.map_or(true, |l| key >= l) && high.map_or(true, |h| key < h);
        match node {
            NodeRef::Leaf(idx) => {
                let leaf = &self.leaves[idx];
                if level != self.depth {
                    return Err(CoreError::corruption(format!(
                        "leaf {idx} at level {level}, depth is {}",
                        self.depth
                    )));
                }
                if leaf.entries.len() > self.leaf_capacity {
                    return Err(CoreError::corruption(format!("leaf {idx} over capacity")));
                }
                if leaf.entries.iter().any(|e| !in_bounds(e.laddr)) {
                    return Err(CoreError::corruption(format!(
                        "leaf {idx} holds a key outside its separators"
                    )));
                }
                Ok(())
            }
            NodeRef::Internal(idx) => {
                let internal = &self.internals[idx];
                if internal.children.len() != internal.keys.len() + 1
                    || internal.children.len() > self.internal_capacity
                {
                    return Err(CoreError::corruption(format!(
                        "internal node {idx} has {} keys for {} children",
                        internal.keys.len(),
                        internal.children.len()
                    )));
                }
                if internal.keys.windows(2).any(|w| w[0] >= w[1])
                    || internal.keys.iter().any(|k| !in_bounds(*k))
                {
                    return Err(CoreError::corruption(format!(
                        "internal node {idx} has misordered keys"
                    )));
                }
                for (i, child) in internal.children.iter().enumerate() {
                    let child_low = if i == 0 { low } else { Some(internal.keys[i - 1]) };
                    let child_high = internal.keys.get(i).copied().or(high);
                    self.check_node(*child, child_low, child_high, level + 1)?;
                }
                Ok(())
            }
        }
    }

    /// Descends to the leaf that holds (or would hold) `key`.
    ///
    /// Returns the leaf index and the internal nodes visited, each with the
    /// child position taken.
    fn find_leaf(&self, key: Laddr) -> (usize, Vec<(usize, usize)>) {
        let mut path = Vec::with_capacity(self.depth);
        let mut node = self.root;
        loop {
            match node {
                NodeRef::Leaf(idx) => return (idx, path),
                NodeRef::Internal(idx) => {
                    let internal = &self.internals[idx];
                    let pos = internal.keys.partition_point(|k| *k <= key);
                    path.push((idx, pos));
                    node = internal.children[pos];
                }
            }
        }
    }

    /// Returns the entry immediately before position `pos` of leaf `leaf_idx`,
    /// walking back over empty leaves.
    fn entry_before(&self, leaf_idx: usize, pos: usize) -> Option<&LbaEntry> {
        if pos > 0 {
            return self.leaves[leaf_idx].entries.get(pos - 1);
        }
        let mut cursor = self.leaves[leaf_idx].prev;
        while let Some(idx) = cursor {
            if let Some(entry) = self.leaves[idx].entries.last() {
                return Some(entry);
            }
            cursor = self.leaves[idx].prev;
        }
        None
    }

    fn split_leaf(&mut self, leaf_idx: usize, path: Vec<(usize, usize)>) {
        let mid = self.leaves[leaf_idx].entries.len() / 2;
        let right_entries = self.leaves[leaf_idx].entries.split_off(mid);
        let separator = right_entries[0].laddr;
        let old_next = self.leaves[leaf_idx].next;

        let right_idx = self.leaves.len();
        self.leaves.push(Leaf {
            entries: right_entries,
            prev: Some(leaf_idx),
            next: old_next,
        });
        if let Some(next) = old_next {
            self.leaves[next].prev = Some(right_idx);
        }
        self.leaves[leaf_idx].next = Some(right_idx);
        self.splits += 1;

        self.insert_separator(
            path,
            separator,
            NodeRef::Leaf(leaf_idx),
            NodeRef::Leaf(right_idx),
        );
    }

    fn insert_separator(
        &mut self,
        mut path: Vec<(usize, usize)>,
        key: Laddr,
        left: NodeRef,
        right: NodeRef,
    ) {
        match path.pop() {
            None => {
                let root_idx = self.internals.len();
                self.internals.push(Internal {
                    keys: vec![key],
                    children: vec![left, right],
                });
                self.root = NodeRef::Internal(root_idx);
                self.depth += 1;
            }
            Some((parent, pos)) => {
                let internal = &mut self.internals[parent];
                internal.keys.insert(pos, key);
                internal.children.insert(pos + 1, right);
                if internal.children.len() > self.internal_capacity {
                    self.split_internal(parent, path);
                }
            }
        }
    }

    fn split_internal(&mut self, idx: usize, path: Vec<(usize, usize)>) {
        let internal = &mut self.internals[idx];
        let mid = internal.children.len() / 2;
        let right_children = internal.children.split_off(mid);
        let mut right_keys = internal.keys.split_off(mid - 1);
        let promoted = right_keys.remove(0);

        let right_idx = self.internals.len();
        self.internals.push(Internal {
            keys: right_keys,
            children: right_children,
        });
        self.splits += 1;

        self.insert_separator(
            path,
            promoted,
            NodeRef::Internal(idx),
            NodeRef::Internal(right_idx),
        );
    }
}
