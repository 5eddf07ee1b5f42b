//! Insert and remove of CIDR blocks.

use super::{FindOutcome, FindResult, RadixTree, Step};
use crate::constants::{MAX_DEPTH, NUM_CHILDREN};
use crate::errors::Error;
use crate::helpers::{canonical, floor_level, host_mask, leaf_span, sibling_bit, slot_at};
use crate::types::{ChildRef, IpKey, Leaf, LeafIdx, Node, NodeIdx};
use log::{debug, trace};

impl<K: IpKey> RadixTree<K> {
    fn alloc_leaf(&mut self, ip: u128, prefix: u8) -> Result<LeafIdx, Error> {
        let idx = LeafIdx(self.leaves.alloc()?);
        *self.leaves.get_mut(idx.get()) = Leaf::new(ip, prefix);
        Ok(idx)
    }

    fn alloc_node(&mut self, ip: u128, prefix: u8) -> Result<NodeIdx, Error> {
        let idx = NodeIdx(self.nodes.alloc()?);
        *self.nodes.get_mut(idx.get()) = Node::new(ip, prefix);
        Ok(idx)
    }

    #[inline]
    fn node_mut(&mut self, n: u32) -> &mut Node<K> {
        self.nodes.get_mut(n)
    }

    /// Point the link described by `step` (or the root) at `child`.
    fn relink(&mut self, step: Option<Step>, child: Option<ChildRef>) {
        match (step, child) {
            (None, c) => self.root = c,
            (Some(s), Some(c)) => self.node_mut(s.node).set_entry(s.slot as usize, 1, c),
            (Some(s), None) => self.node_mut(s.node).clear_span(s.slot as usize, 1),
        }
    }

    /// Free `c` and, for a node, everything below it.
    pub(crate) fn destroy(&mut self, c: ChildRef) {
        let mut stack: Vec<NodeIdx> = Vec::with_capacity(MAX_DEPTH * NUM_CHILDREN);
        match c {
            ChildRef::Leaf(l) => {
                self.leaves.free(l.0);
                return;
            }
            ChildRef::Node(n) => stack.push(n),
        }
        while let Some(n) = stack.pop() {
            let children: Vec<ChildRef> = self.node(n).entries().map(|e| e.child).collect();
            for child in children {
                match child {
                    ChildRef::Leaf(l) => self.leaves.free(l.0),
                    ChildRef::Node(c) => stack.push(c),
                }
            }
            self.nodes.free(n.0);
        }
    }

    /// Free every entry starting inside `[first, first + span)` of `n` and clear the slots.
    fn destroy_span(&mut self, n: u32, first: usize, span: usize) {
        let doomed: Vec<ChildRef> = self
            .nodes
            .get(n)
            .entries()
            .filter(|e| e.first >= first && e.first < first + span)
            .map(|e| e.child)
            .collect();
        for c in doomed {
            self.destroy(c);
        }
        self.node_mut(n).clear_span(first, span);
    }

    /// Add `ip/prefix` to the tree.
    pub fn insert(&mut self, ip: u128, prefix: u8) -> Result<(), Error> {
        if prefix > K::BITS {
            return Err(Error::Prefix {
                prefix,
                max: K::BITS,
            });
        }
        self.make_owned()?;
        let ip = canonical(ip, prefix, K::BITS);
        let found = self.find(ip, prefix);
        trace!("[INSERT] {:x}/{} -> {:?}", ip, prefix, found.outcome);
        self.insert_found(ip, prefix, &found)?;
        self.dirty = true;
        if self.leaves.take_grew() {
            debug!("[INSERT] leaf array grew; combining adjacent blocks");
            self.combine();
        }
        Ok(())
    }

    fn insert_found(&mut self, ip: u128, prefix: u8, found: &FindResult) -> Result<(), Error> {
        let last = found.path.last();
        match found.outcome {
            FindOutcome::Found => Ok(()),
            FindOutcome::Empty => {
                let l = self.alloc_leaf(ip, prefix)?;
                self.root = Some(ChildRef::Leaf(l));
                Ok(())
            }
            FindOutcome::MultiLeaf => {
                let step = last.ok_or(Error::Corrupt("empty slot without a parent"))?;
                let l = self.alloc_leaf(ip, prefix)?;
                self.node_mut(step.node)
                    .set_entry(step.slot as usize, found.span, ChildRef::Leaf(l));
                Ok(())
            }
            FindOutcome::Subset => match found.terminal {
                Some(ChildRef::Leaf(l)) => {
                    // The stored block is inside the new one: widen it in place.
                    *self.leaves.get_mut(l.get()) = Leaf::new(ip, prefix);
                    Ok(())
                }
                Some(node @ ChildRef::Node(_)) => {
                    debug!("[INSERT] {:x}/{} replaces a subtree", ip, prefix);
                    self.destroy(node);
                    // The subtree freed at least two leaves, so this reuses one.
                    let l = self.alloc_leaf(ip, prefix)?;
                    self.relink(last, Some(ChildRef::Leaf(l)));
                    Ok(())
                }
                None => {
                    let step = last.ok_or(Error::Corrupt("slot range without a parent"))?;
                    let (first, span) = (step.slot as usize, found.span);
                    self.destroy_span(step.node, first, span);
                    let l = self.alloc_leaf(ip, prefix)?;
                    self.node_mut(step.node)
                        .set_entry(first, span, ChildRef::Leaf(l));
                    Ok(())
                }
            },
            FindOutcome::NotFound => {
                let old = found
                    .terminal
                    .ok_or(Error::Corrupt("divergence without a terminal"))?;
                self.split_above(old, last, ip, prefix, found.matched)
            }
        }
    }

    /// Put a new node above `old` holding both `old` and the new block.
    fn split_above(
        &mut self,
        old: ChildRef,
        link: Option<Step>,
        ip: u128,
        prefix: u8,
        matched: u8,
    ) -> Result<(), Error> {
        let width = K::BITS;
        let np = floor_level(matched);
        let node_ip = canonical(ip, np, width);
        let l = self.alloc_leaf(ip, prefix)?;
        let n = match self.alloc_node(node_ip, np) {
            Ok(n) => n,
            Err(e) => {
                self.leaves.free(l.0);
                return Err(e);
            }
        };
        debug!(
            "[INSERT] new node {:x}/{} above divergence at bit {}",
            node_ip, np, matched
        );
        let (old_ip, old_prefix) = self.block_of(old);
        let old_span = match old {
            ChildRef::Node(_) => 1,
            ChildRef::Leaf(_) => leaf_span(np, old_prefix),
        };
        let new_span = leaf_span(np, prefix);
        let old_first = slot_at(old_ip, np, width) & !(old_span - 1);
        let new_first = slot_at(ip, np, width) & !(new_span - 1);
        {
            let node = self.node_mut(n.get());
            node.set_entry(old_first, old_span, old);
            node.set_entry(new_first, new_span, ChildRef::Leaf(l));
        }
        self.relink(link, Some(ChildRef::Node(n)));
        Ok(())
    }

    /// Take `ip/prefix` out of the tree, splitting stored blocks as needed.
    pub fn remove(&mut self, ip: u128, prefix: u8) -> Result<(), Error> {
        if prefix > K::BITS {
            return Err(Error::Prefix {
                prefix,
                max: K::BITS,
            });
        }
        let ip = canonical(ip, prefix, K::BITS);
        let found = self.find(ip, prefix);
        trace!("[REMOVE] {:x}/{} -> {:?}", ip, prefix, found.outcome);
        match found.outcome {
            FindOutcome::Empty | FindOutcome::NotFound | FindOutcome::MultiLeaf => return Ok(()),
            _ => {}
        }
        self.make_owned()?;
        let last = found.path.last();
        match (found.outcome, found.terminal) {
            (FindOutcome::Found, Some(ChildRef::Leaf(l))) => {
                let (leaf_ip, leaf_prefix) = {
                    let leaf = self.leaf(l);
                    (leaf.ip.to_u128(), leaf.prefix)
                };
                self.detach(&found, ChildRef::Leaf(l));
                if leaf_prefix < prefix {
                    debug!(
                        "[REMOVE] splitting {:x}/{} around {:x}/{}",
                        leaf_ip, leaf_prefix, ip, prefix
                    );
                    // Put back every half-block between the stored block and the hole.
                    for p in leaf_prefix + 1..=prefix {
                        let sib = canonical(ip, p, K::BITS) ^ sibling_bit(p, K::BITS);
                        self.insert(sib, p)?;
                    }
                }
            }
            (FindOutcome::Subset, Some(t)) => self.detach(&found, t),
            (FindOutcome::Subset, None) => {
                let step = last.ok_or(Error::Corrupt("slot range without a parent"))?;
                self.destroy_span(step.node, step.slot as usize, found.span);
                self.fix_single_child(found.path.as_slice());
                if self.root.is_none() {
                    self.clear();
                }
            }
            _ => return Err(Error::Corrupt("found without a leaf")),
        }
        self.dirty = true;
        Ok(())
    }

    /// Unlink and free the search terminal `t`, then tidy the ancestors.
    fn detach(&mut self, found: &FindResult, t: ChildRef) {
        match found.path.last() {
            None => self.root = None,
            Some(step) => self
                .node_mut(step.node)
                .clear_span(step.slot as usize, found.span),
        }
        self.destroy(t);
        self.fix_single_child(found.path.as_slice());
        if self.root.is_none() {
            self.clear();
        }
    }

    /// Walk up `path` removing empty nodes and hoisting only-children.
    fn fix_single_child(&mut self, path: &[Step]) {
        for i in (0..path.len()).rev() {
            let n = path[i].node;
            let parent = i.checked_sub(1).map(|p| path[p]);
            let (count, only) = {
                let node = self.nodes.get(n);
                (node.entry_count(), node.entries().next())
            };
            if count >= 2 {
                return;
            }
            if let Some(idx) = std::num::NonZeroU32::new(n) {
                self.nodes.free(idx);
            }
            match only {
                None => {
                    trace!("[REMOVE] node {} emptied", n);
                    self.relink(parent, None);
                }
                Some(e) => {
                    trace!("[REMOVE] node {} collapses into its only child", n);
                    self.relink(parent, Some(e.child));
                    return;
                }
            }
        }
    }

    /// Empty the tree and release its storage.
    pub fn remove_all(&mut self) {
        self.clear();
    }

    fn check_mask_prefix(prefix: u8) -> Result<(), Error> {
        if prefix == 0 || prefix > K::BITS {
            return Err(Error::Prefix {
                prefix,
                max: K::BITS,
            });
        }
        Ok(())
    }

    /// Replace the content with the first address of every occupied
    /// `prefix`-sized block.
    pub fn mask(&mut self, prefix: u8) -> Result<(), Error> {
        Self::check_mask_prefix(prefix)?;
        let width = K::BITS;
        if prefix == width {
            return Ok(());
        }
        let step = 1u128 << (width - prefix);
        let mut bases: Vec<u128> = Vec::new();
        for (ip, p) in self.blocks() {
            if p >= prefix {
                let base = canonical(ip, prefix, width);
                if bases.last() != Some(&base) {
                    bases.try_reserve(1)?;
                    bases.push(base);
                }
                continue;
            }
            let end = ip | host_mask(p, width);
            let mut base = ip;
            loop {
                bases.try_reserve(1)?;
                bases.push(base);
                if end - base < step {
                    break;
                }
                base += step;
            }
        }
        debug!("[MASK] /{}: {} blocks remain", prefix, bases.len());
        self.clear();
        for base in bases {
            self.insert(base, width)?;
        }
        self.dirty = true;
        Ok(())
    }

    /// Fill every occupied `prefix`-sized block completely.
    pub fn mask_and_fill(&mut self, prefix: u8) -> Result<(), Error> {
        Self::check_mask_prefix(prefix)?;
        let width = K::BITS;
        let mut fills: Vec<u128> = Vec::new();
        for (ip, p) in self.blocks() {
            if p > prefix {
                let base = canonical(ip, prefix, width);
                if fills.last() != Some(&base) {
                    fills.try_reserve(1)?;
                    fills.push(base);
                }
            }
        }
        debug!("[MASK] fill /{}: {} blocks", prefix, fills.len());
        for base in fills {
            self.insert(base, prefix)?;
        }
        Ok(())
    }
}
