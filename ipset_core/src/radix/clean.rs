//! Combine, compact and sort: turning a dirty tree into a clean one.

use super::RadixTree;
use crate::constants::{MAX_DEPTH, NUM_BITS, NUM_CHILDREN};
use crate::errors::Error;
use crate::types::{ChildRef, IpKey, Leaf, LeafIdx, NodeIdx};
use log::{debug, info, trace};
use metrics::{counter, gauge};
use std::num::NonZeroU32;

/// What becomes of a node once its children are merged.
enum Collapse {
    Keep,
    /// Only one entry is left; it takes the node's place.
    Into(ChildRef),
    Gone,
}

impl<K: IpKey> RadixTree<K> {
    /// Merge sibling leaves that together form the next-coarser block,
    /// bottom-up. A node left with one entry is replaced by it, so a full
    /// node ends up as a single leaf in its parent.
    pub(crate) fn combine(&mut self) {
        let root = match self.root {
            Some(ChildRef::Node(n)) => n,
            _ => return,
        };
        // (node, next slot to scan, slot in parent)
        let mut stack: [(u32, u8, u8); MAX_DEPTH] = [(0, 0, 0); MAX_DEPTH];
        stack[0] = (root.get(), 0, 0);
        let mut depth = 1usize;
        while depth > 0 {
            let (n, next, _) = stack[depth - 1];
            let descend = {
                let node = self.nodes.get(n);
                node.entries()
                    .filter(|e| e.first >= next as usize)
                    .find_map(|e| match e.child {
                        ChildRef::Node(c) => Some((c, e.first)),
                        ChildRef::Leaf(_) => None,
                    })
            };
            if let Some((c, slot)) = descend {
                stack[depth - 1].1 = slot as u8 + 1;
                if depth < MAX_DEPTH {
                    stack[depth] = (c.get(), 0, slot as u8);
                    depth += 1;
                }
                continue;
            }
            let outcome = self.merge_children(n);
            depth -= 1;
            let replacement = match outcome {
                Collapse::Keep => continue,
                Collapse::Into(c) => Some(c),
                Collapse::Gone => None,
            };
            trace!("[CLEAN] node {} replaced by {:?}", n, replacement);
            if let Some(idx) = NonZeroU32::new(n) {
                self.nodes.free(idx);
            }
            let slot = stack[depth].2 as usize;
            match (depth.checked_sub(1), replacement) {
                (None, r) => self.root = r,
                (Some(p), Some(c)) => self.nodes.get_mut(stack[p].0).set_entry(slot, 1, c),
                (Some(p), None) => self.nodes.get_mut(stack[p].0).clear_span(slot, 1),
            }
        }
    }

    /// Merge mergeable leaf pairs inside node `n`, then report whether the
    /// node is still needed.
    fn merge_children(&mut self, n: u32) -> Collapse {
        let np = self.nodes.get(n).prefix;
        for lp in (np + 1..=np + NUM_BITS).rev() {
            let span = 1usize << (np + NUM_BITS - lp);
            let mut i = 0;
            while i + span < NUM_CHILDREN {
                let pair = {
                    let node = self.nodes.get(n);
                    match (node.entry(i), node.entry(i + span)) {
                        (Some(a), Some(b)) if a.first == i && a.span == span && b.first == i + span && b.span == span => {
                            match (a.child, b.child) {
                                (ChildRef::Leaf(la), ChildRef::Leaf(lb))
                                    if self.leaf(la).prefix == lp && self.leaf(lb).prefix == lp =>
                                {
                                    Some((la, lb))
                                }
                                _ => None,
                            }
                        }
                        _ => None,
                    }
                };
                if let Some((la, lb)) = pair {
                    self.leaves.get_mut(la.get()).prefix = lp - 1;
                    self.leaves.free(lb.0);
                    self.nodes
                        .get_mut(n)
                        .set_entry(i, 2 * span, ChildRef::Leaf(la));
                }
                i += 2 * span;
            }
        }
        let node = self.nodes.get(n);
        match node.entry_count() {
            0 => Collapse::Gone,
            1 => node.entries().next().map_or(Collapse::Gone, |e| Collapse::Into(e.child)),
            _ => Collapse::Keep,
        }
    }

    /// Squeeze out freed slots so both arrays are dense.
    pub(crate) fn compact(&mut self) -> Result<(), Error> {
        let root = match self.root {
            None => {
                self.clear();
                return Ok(());
            }
            Some(r) => r,
        };
        let live_nodes = self.nodes.live();
        let live_leaves = self.leaves.live();
        let mut node_holes: Vec<u32> = self
            .nodes
            .free_slots()
            .iter()
            .copied()
            .filter(|&i| (i as usize) < live_nodes)
            .collect();
        let mut leaf_holes: Vec<u32> = self
            .leaves
            .free_slots()
            .iter()
            .copied()
            .filter(|&i| (i as usize) < live_leaves)
            .collect();
        if node_holes.is_empty() && leaf_holes.is_empty() {
            self.nodes.truncate(live_nodes);
            self.leaves.truncate(live_leaves);
            return Ok(());
        }
        trace!(
            "[CLEAN] compacting {} node holes, {} leaf holes",
            node_holes.len(),
            leaf_holes.len()
        );

        let mut relocate = |tree: &mut Self, c: ChildRef| -> Result<ChildRef, Error> {
            Ok(match c {
                ChildRef::Node(n) if n.get() as usize >= live_nodes => {
                    let to = node_holes.pop().ok_or(Error::Corrupt("node free list"))?;
                    tree.nodes.relocate(n.get(), to);
                    ChildRef::Node(NodeIdx(nz(to)?))
                }
                ChildRef::Leaf(l) if l.get() as usize >= live_leaves => {
                    let to = leaf_holes.pop().ok_or(Error::Corrupt("leaf free list"))?;
                    tree.leaves.relocate(l.get(), to);
                    ChildRef::Leaf(LeafIdx(nz(to)?))
                }
                other => other,
            })
        };

        let root = relocate(self, root)?;
        self.root = Some(root);
        let mut stack: Vec<u32> = Vec::with_capacity(MAX_DEPTH * NUM_CHILDREN);
        if let ChildRef::Node(n) = root {
            stack.push(n.get());
        }
        while let Some(n) = stack.pop() {
            for slot in 0..NUM_CHILDREN {
                let raw = self.nodes.get(n).child[slot];
                let Some(c) = ChildRef::from_raw(raw) else {
                    continue;
                };
                let moved = relocate(self, c)?;
                if moved != c {
                    self.nodes.get_mut(n).child[slot] = moved.to_raw();
                }
                if let ChildRef::Node(m) = moved {
                    stack.push(m.get());
                }
            }
        }
        self.nodes.truncate(live_nodes);
        self.leaves.truncate(live_leaves);
        Ok(())
    }

    /// Renumber leaves so the array is in address order. Needs a compact tree.
    pub(crate) fn sort_leaves(&mut self) -> Result<(), Error> {
        let len = self.leaves.len();
        if len <= 1 {
            return Ok(());
        }
        let mut remap: Vec<u32> = Vec::new();
        remap.try_reserve_exact(len)?;
        remap.resize(len, 0);
        let mut sorted: Vec<Leaf<K>> = Vec::new();
        sorted.try_reserve_exact(len)?;
        sorted.push(Leaf::default());

        // Rank leaves by a depth-first visit, which is address order.
        let mut stack: Vec<(u32, usize)> = Vec::with_capacity(MAX_DEPTH);
        match self.root {
            Some(ChildRef::Leaf(l)) => {
                remap[l.get() as usize] = 1;
                sorted.push(*self.leaf(l));
            }
            Some(ChildRef::Node(n)) => stack.push((n.get(), 0)),
            None => {}
        }
        while let Some(top) = stack.last_mut() {
            let (n, slot) = *top;
            if slot >= NUM_CHILDREN {
                stack.pop();
                continue;
            }
            top.1 += 1;
            match ChildRef::from_raw(self.nodes.get(n).child[slot]) {
                Some(ChildRef::Leaf(l)) => {
                    remap[l.get() as usize] = sorted.len() as u32;
                    sorted.push(*self.leaf(l));
                }
                Some(ChildRef::Node(c)) => stack.push((c.get(), 0)),
                None => {}
            }
        }
        if sorted.len() != len {
            return Err(Error::Corrupt("unreachable leaves after compaction"));
        }

        let fix = |c: ChildRef| match c {
            ChildRef::Leaf(l) => match NonZeroU32::new(remap[l.get() as usize]) {
                Some(nz) => ChildRef::Leaf(LeafIdx(nz)),
                None => c,
            },
            other => other,
        };
        for n in 1..self.nodes.len() as u32 {
            self.nodes.get_mut(n).map_children(fix);
        }
        self.root = self.root.map(fix);
        self.leaves.replace(sorted);
        Ok(())
    }

    /// Combine, compact and sort. Afterwards the tree is clean.
    pub fn clean(&mut self) -> Result<(), Error> {
        counter!("ipset_cleans_total").increment(1);
        self.make_owned()?;
        self.combine();
        self.compact()?;
        self.sort_leaves()?;
        self.dirty = false;
        let nodes = self.nodes.len().saturating_sub(1);
        let leaves = self.leaves.len().saturating_sub(1);
        gauge!("ipset_nodes").set(nodes as f64);
        gauge!("ipset_leaves").set(leaves as f64);
        info!("[CLEAN] {} nodes, {} leaves", nodes, leaves);
        debug!("[CLEAN] root {:?}", self.root);
        Ok(())
    }
}

#[inline]
fn nz(idx: u32) -> Result<NonZeroU32, Error> {
    NonZeroU32::new(idx).ok_or(Error::Corrupt("sentinel slot on free list"))
}

#[cfg(test)]
mod tests {
    use crate::radix::RadixTree;
    use crate::types::{ChildRef, Ipv4Key, Ipv6Key};

    fn v4(a: u8, b: u8, c: u8, d: u8) -> u128 {
        u32::from_be_bytes([a, b, c, d]) as u128
    }

    #[test]
    fn adjacent_slash24s_become_one_slash23() {
        let mut t = RadixTree::<Ipv4Key>::new();
        t.insert(v4(10, 0, 0, 0), 24).unwrap();
        t.insert(v4(10, 0, 1, 0), 24).unwrap();
        t.clean().unwrap();
        assert_eq!(t.blocks().collect::<Vec<_>>(), vec![(v4(10, 0, 0, 0), 23)]);
        assert_eq!(t.count_exact(), (512, false));
        assert!(matches!(t.root, Some(ChildRef::Leaf(_))));
        assert_eq!(t.leaves.len(), 2);
        assert_eq!(t.nodes.len(), 1);
    }

    #[test]
    fn full_node_collapses_through_levels() {
        let mut t = RadixTree::<Ipv4Key>::new();
        for c in 0..=255u8 {
            t.insert(v4(172, 16, c, 0), 24).unwrap();
        }
        t.insert(v4(9, 9, 9, 9), 32).unwrap();
        t.clean().unwrap();
        assert_eq!(
            t.blocks().collect::<Vec<_>>(),
            vec![(v4(9, 9, 9, 9), 32), (v4(172, 16, 0, 0), 16)]
        );
        assert!(t.verify().is_ok());
    }

    #[test]
    fn clean_leaves_no_holes_and_sorted_leaves() {
        let mut t = RadixTree::<Ipv4Key>::new();
        for b in (0..40u8).rev() {
            t.insert(v4(b * 3, 0, 0, 0), 16).unwrap();
        }
        for b in (0..40u8).step_by(2) {
            t.remove(v4(b * 3, 0, 0, 0), 16).unwrap();
        }
        t.clean().unwrap();
        assert!(t.nodes.free_slots().is_empty());
        assert!(t.leaves.free_slots().is_empty());
        assert_eq!(t.leaves.len(), 21);
        assert!(t.leaves_sorted());
        assert!(t.verify().is_ok());
        let from_leaves: Vec<_> = t.leaves.as_slice()[1..]
            .iter()
            .map(|l| (l.ip.0 as u128, l.prefix))
            .collect();
        assert_eq!(from_leaves, t.blocks().collect::<Vec<_>>());
    }

    #[test]
    fn second_clean_is_byte_identical() {
        let mut t = RadixTree::<Ipv6Key>::new();
        for i in 0..50u128 {
            t.insert((0x2001_0db8u128 << 96) | (i * 7919) << 64, 64).unwrap();
        }
        t.remove(0x2001_0db8u128 << 96, 64).unwrap();
        t.clean().unwrap();
        let before: Vec<_> = t.leaves.as_slice().iter().map(|l| (l.ip, l.prefix)).collect();
        let nodes_before: Vec<_> = t.nodes.as_slice().iter().map(|n| (n.ip, n.child, n.span_log)).collect();
        t.clean().unwrap();
        let after: Vec<_> = t.leaves.as_slice().iter().map(|l| (l.ip, l.prefix)).collect();
        let nodes_after: Vec<_> = t.nodes.as_slice().iter().map(|n| (n.ip, n.child, n.span_log)).collect();
        assert_eq!(before, after);
        assert_eq!(nodes_before, nodes_after);
    }

    #[test]
    fn cleaning_an_emptied_tree_releases_storage() {
        let mut t = RadixTree::<Ipv4Key>::new();
        t.insert(v4(1, 2, 3, 4), 32).unwrap();
        t.remove(v4(1, 2, 3, 4), 32).unwrap();
        t.clean().unwrap();
        assert!(t.is_empty());
        assert_eq!(t.leaves.len(), 0);
    }
}
