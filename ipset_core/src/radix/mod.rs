//! Radix tree engine: 16-way Patricia trie over two record arenas.
//!
//! All arithmetic happens on `u128` values holding the address in the low
//! `K::BITS` bits. Traversals use explicit stacks bounded by `MAX_DEPTH`.

mod clean;
mod mutate;

use crate::arena::ArenaBuffer;
use crate::constants::{MAX_DEPTH, NUM_BITS, NUM_CHILDREN};
use crate::errors::Error;
use crate::helpers::{canonical, common_prefix_len, host_mask, leaf_span, slot_at};
use crate::types::{ChildRef, IpKey, Leaf, LeafIdx, Node, NodeIdx};
use std::ops::ControlFlow;

/// How a search for `ip/prefix` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FindOutcome {
    /// A stored leaf equals or contains the query.
    Found,
    /// Stored content lies strictly inside the query block.
    Subset,
    /// Bits diverged before reaching anything that overlaps the query.
    NotFound,
    /// An empty slot range where the query can be attached directly.
    MultiLeaf,
    Empty,
}

/// One step of the descent: a node and the first slot followed in it.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Step {
    pub node: u32,
    pub slot: u8,
}

/// Ancestors of the search terminal, root first.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Path {
    steps: [Step; MAX_DEPTH],
    len: usize,
}

impl Path {
    fn new() -> Self {
        Path {
            steps: [Step::default(); MAX_DEPTH],
            len: 0,
        }
    }

    fn push(&mut self, node: NodeIdx, slot: usize) {
        self.steps[self.len] = Step {
            node: node.get(),
            slot: slot as u8,
        };
        self.len += 1;
    }

    pub fn last(&self) -> Option<Step> {
        self.len.checked_sub(1).map(|i| self.steps[i])
    }

    pub fn as_slice(&self) -> &[Step] {
        &self.steps[..self.len]
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FindResult {
    pub outcome: FindOutcome,
    /// Where the search stopped; `None` for a slot range (`MultiLeaf`, or
    /// `Subset` over several siblings).
    pub terminal: Option<ChildRef>,
    pub path: Path,
    /// Slots covered in the last path node: by the terminal entry, or by the
    /// query when `terminal` is `None`.
    pub span: usize,
    pub matched: u8,
}

#[derive(Clone)]
pub struct RadixTree<K: IpKey> {
    pub(crate) nodes: ArenaBuffer<Node<K>>,
    pub(crate) leaves: ArenaBuffer<Leaf<K>>,
    pub(crate) root: Option<ChildRef>,
    pub(crate) dirty: bool,
}

impl<K: IpKey> Default for RadixTree<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: IpKey> RadixTree<K> {
    pub const WIDTH: u8 = K::BITS;

    pub fn new() -> Self {
        RadixTree {
            nodes: ArenaBuffer::new(),
            leaves: ArenaBuffer::new(),
            root: None,
            dirty: false,
        }
    }

    pub fn from_parts(
        nodes: ArenaBuffer<Node<K>>,
        leaves: ArenaBuffer<Leaf<K>>,
        root: Option<ChildRef>,
    ) -> Self {
        RadixTree {
            nodes,
            leaves,
            root,
            dirty: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_mapped(&self) -> bool {
        self.nodes.is_mapped() || self.leaves.is_mapped()
    }

    #[inline]
    pub(crate) fn node(&self, n: NodeIdx) -> &Node<K> {
        self.nodes.get(n.get())
    }

    #[inline]
    pub(crate) fn leaf(&self, l: LeafIdx) -> &Leaf<K> {
        self.leaves.get(l.get())
    }

    /// Base address and prefix of whatever `c` refers to.
    pub(crate) fn block_of(&self, c: ChildRef) -> (u128, u8) {
        match c {
            ChildRef::Node(n) => {
                let node = self.node(n);
                (node.ip.to_u128(), node.prefix)
            }
            ChildRef::Leaf(l) => {
                let leaf = self.leaf(l);
                (leaf.ip.to_u128(), leaf.prefix)
            }
        }
    }

    /// Detach from any mapped file so the arenas can be written.
    pub fn make_owned(&mut self) -> Result<(), Error> {
        self.nodes.make_owned()?;
        self.leaves.make_owned()
    }

    /// Drop all content and storage.
    pub fn clear(&mut self) {
        self.nodes.reset();
        self.leaves.reset();
        self.root = None;
        self.dirty = false;
    }

    /// Classify `ip/prefix` against the stored blocks. `ip` must already be
    /// canonical for `prefix`.
    pub(crate) fn find(&self, ip: u128, prefix: u8) -> FindResult {
        let width = K::BITS;
        let mut res = FindResult {
            outcome: FindOutcome::Empty,
            terminal: None,
            path: Path::new(),
            span: 1,
            matched: 0,
        };
        let mut cur = match self.root {
            Some(c) => c,
            None => return res,
        };
        loop {
            match cur {
                ChildRef::Node(n) => {
                    let node = self.node(n);
                    let np = node.prefix;
                    let matched = common_prefix_len(ip, node.ip.to_u128(), width);
                    res.matched = matched;
                    if matched < np {
                        res.outcome = if matched >= prefix {
                            FindOutcome::Subset
                        } else {
                            FindOutcome::NotFound
                        };
                        res.terminal = Some(cur);
                        return res;
                    }
                    if prefix <= np {
                        res.outcome = FindOutcome::Subset;
                        res.terminal = Some(cur);
                        return res;
                    }
                    let slot = slot_at(ip, np, width);
                    if prefix < np + NUM_BITS {
                        // The query covers several sibling slots.
                        let span = leaf_span(np, prefix);
                        let first = slot & !(span - 1);
                        match node.entry(first) {
                            Some(e) if e.span >= span => {
                                res.path.push(n, e.first);
                                res.span = e.span;
                                res.terminal = Some(e.child);
                                res.outcome = FindOutcome::Found;
                            }
                            _ => {
                                res.path.push(n, first);
                                res.span = span;
                                res.outcome = if node.occupied(first, span) {
                                    FindOutcome::Subset
                                } else {
                                    FindOutcome::MultiLeaf
                                };
                            }
                        }
                        return res;
                    }
                    match node.entry(slot) {
                        None => {
                            res.path.push(n, slot);
                            res.span = 1;
                            res.outcome = FindOutcome::MultiLeaf;
                            return res;
                        }
                        Some(e) => {
                            res.path.push(n, e.first);
                            res.span = e.span;
                            cur = e.child;
                        }
                    }
                }
                ChildRef::Leaf(l) => {
                    let leaf = self.leaf(l);
                    let lp = leaf.prefix;
                    let matched = common_prefix_len(ip, leaf.ip.to_u128(), width);
                    res.matched = matched;
                    res.terminal = Some(cur);
                    res.outcome = if matched >= lp {
                        if prefix >= lp {
                            FindOutcome::Found
                        } else {
                            FindOutcome::Subset
                        }
                    } else if matched >= prefix {
                        FindOutcome::Subset
                    } else {
                        FindOutcome::NotFound
                    };
                    return res;
                }
            }
        }
    }

    /// Whether the single address `ip` is in the set.
    pub fn contains(&self, ip: u128) -> bool {
        self.find(ip, K::BITS).outcome == FindOutcome::Found
    }

    /// Whether every address of `ip/prefix` is in the set.
    pub fn contains_block(&self, ip: u128, prefix: u8) -> bool {
        let ip = canonical(ip, prefix, K::BITS);
        self.find(ip, prefix).outcome == FindOutcome::Found
    }

    /// Ordered depth-first iterator over stored blocks; works on dirty trees.
    pub fn blocks(&self) -> Blocks<'_, K> {
        let mut it = Blocks {
            tree: self,
            stack: [(0, 0); MAX_DEPTH],
            depth: 0,
            pending: None,
        };
        match self.root {
            Some(ChildRef::Node(n)) => {
                it.stack[0] = (n.get(), 0);
                it.depth = 1;
            }
            Some(ChildRef::Leaf(l)) => it.pending = Some(l),
            None => {}
        }
        it
    }

    /// Blocks straight from the leaf array; ordered only on a clean tree.
    pub(crate) fn leaf_blocks(&self) -> impl Iterator<Item = (u128, u8)> + '_ {
        self.leaves
            .as_slice()
            .iter()
            .skip(1)
            .map(|l| (l.ip.to_u128(), l.prefix))
    }

    /// Visit blocks in address order until `f` breaks.
    pub fn walk<F>(&self, mut f: F) -> ControlFlow<()>
    where
        F: FnMut(u128, u8) -> ControlFlow<()>,
    {
        for (ip, prefix) in self.blocks() {
            f(ip, prefix)?;
        }
        ControlFlow::Continue(())
    }

    /// Address count as `(value, overflowed)`; only `::/0` overflows.
    pub fn count_exact(&self) -> (u128, bool) {
        let mut total: u128 = 0;
        for (_, prefix) in self.blocks() {
            let host = (K::BITS - prefix) as u32;
            if host >= 128 {
                return (0, true);
            }
            match total.checked_add(1u128 << host) {
                Some(t) => total = t,
                None => return (0, true),
            }
        }
        (total, false)
    }

    pub fn count_approx(&self) -> f64 {
        self.blocks()
            .map(|(_, p)| 2f64.powi((K::BITS - p) as i32))
            .sum()
    }

    /// First and last address held, or `None` when empty.
    pub fn range(&self) -> Option<(u128, u128)> {
        let mut it = self.blocks();
        let first = it.next()?;
        let (last_ip, last_p) = it.last().unwrap_or(first);
        Some((first.0, last_ip | host_mask(last_p, K::BITS)))
    }

    /// Whether the leaf array enumerates blocks in ascending address order.
    pub(crate) fn leaves_sorted(&self) -> bool {
        let leaves = self.leaves.as_slice();
        if leaves.len() <= 1 {
            return true;
        }
        leaves[1..]
            .windows(2)
            .all(|w| w[0].ip.to_u128() | host_mask(w[0].prefix, K::BITS) < w[1].ip.to_u128())
    }

    /// Check every reference and prefix reachable from the root, and that
    /// no live record is left unreachable.
    pub(crate) fn verify(&self) -> Result<(), Error> {
        let width = K::BITS;
        let n_nodes = self.nodes.len();
        let n_leaves = self.leaves.len();
        let node_ok = |idx: u32| (idx as usize) < n_nodes;
        let leaf_ok = |idx: u32| (idx as usize) < n_leaves;
        let check_leaf = |l: LeafIdx| -> Result<(u128, u8), Error> {
            if !leaf_ok(l.get()) {
                return Err(Error::Corrupt("leaf index out of range"));
            }
            let leaf = self.leaf(l);
            let ip = leaf.ip.to_u128();
            if leaf.prefix > width || canonical(ip, leaf.prefix, width) != ip {
                return Err(Error::Corrupt("invalid leaf prefix"));
            }
            Ok((ip, leaf.prefix))
        };
        let check_node = |n: NodeIdx| -> Result<(u128, u8), Error> {
            if !node_ok(n.get()) {
                return Err(Error::Corrupt("node index out of range"));
            }
            let node = self.node(n);
            let ip = node.ip.to_u128();
            if node.prefix % NUM_BITS != 0
                || node.prefix >= width
                || canonical(ip, node.prefix, width) != ip
            {
                return Err(Error::Corrupt("invalid node prefix"));
            }
            Ok((ip, node.prefix))
        };

        // Every slot past the sentinel is either reached exactly once or free.
        let mut seen_nodes = vec![false; n_nodes];
        let mut seen_leaves = vec![false; n_leaves];
        let mut stack: Vec<u32> = Vec::with_capacity(MAX_DEPTH * NUM_CHILDREN);
        match self.root {
            None => {}
            Some(ChildRef::Leaf(l)) => {
                check_leaf(l)?;
                seen_leaves[l.get() as usize] = true;
            }
            Some(ChildRef::Node(n)) => {
                check_node(n)?;
                seen_nodes[n.get() as usize] = true;
                stack.push(n.get());
            }
        }
        while let Some(raw) = stack.pop() {
            let node = self.nodes.get(raw);
            let np = node.prefix;
            let nip = node.ip.to_u128();
            let mut covered = 0usize;
            for first in 0..NUM_CHILDREN {
                let raw_child = node.child[first];
                if raw_child == 0 {
                    continue;
                }
                let span_log = node.span_log[first];
                if span_log > NUM_BITS {
                    return Err(Error::Corrupt("invalid child span"));
                }
                let span = 1usize << span_log;
                if first % span != 0 || first < covered {
                    return Err(Error::Corrupt("overlapping child slots"));
                }
                covered = first + span;
                let child =
                    ChildRef::from_raw(raw_child).ok_or(Error::Corrupt("invalid child index"))?;
                let (cip, cp) = match child {
                    ChildRef::Leaf(l) => {
                        let block = check_leaf(l)?;
                        if std::mem::replace(&mut seen_leaves[l.get() as usize], true) {
                            return Err(Error::Corrupt("leaf referenced twice"));
                        }
                        block
                    }
                    ChildRef::Node(c) => {
                        let block = check_node(c)?;
                        if span != 1 {
                            return Err(Error::Corrupt("node spans several slots"));
                        }
                        if std::mem::replace(&mut seen_nodes[c.get() as usize], true) {
                            return Err(Error::Corrupt("node referenced twice"));
                        }
                        stack.push(c.get());
                        block
                    }
                };
                if cp <= np
                    || common_prefix_len(cip, nip, width) < np
                    || (matches!(child, ChildRef::Leaf(_)) && leaf_span(np, cp) != span)
                    || slot_at(cip, np, width) != first
                {
                    return Err(Error::Corrupt("child outside its slot"));
                }
            }
            if covered > NUM_CHILDREN {
                return Err(Error::Corrupt("child span past end of node"));
            }
        }
        let reached_nodes = seen_nodes.iter().filter(|&&s| s).count();
        let reached_leaves = seen_leaves.iter().filter(|&&s| s).count();
        if reached_nodes != self.nodes.live().saturating_sub(1) {
            return Err(Error::Corrupt("unreachable node records"));
        }
        if reached_leaves != self.leaves.live().saturating_sub(1) {
            return Err(Error::Corrupt("unreachable leaf records"));
        }
        Ok(())
    }
}

/// Depth-first block iterator, ascending by address.
pub struct Blocks<'a, K: IpKey> {
    tree: &'a RadixTree<K>,
    stack: [(u32, u8); MAX_DEPTH],
    depth: usize,
    pending: Option<LeafIdx>,
}

impl<K: IpKey> Iterator for Blocks<'_, K> {
    type Item = (u128, u8);

    fn next(&mut self) -> Option<(u128, u8)> {
        if let Some(l) = self.pending.take() {
            let leaf = self.tree.leaf(l);
            return Some((leaf.ip.to_u128(), leaf.prefix));
        }
        while self.depth > 0 {
            let (n, next) = self.stack[self.depth - 1];
            let node = self.tree.nodes.get(n);
            let mut slot = next as usize;
            while slot < NUM_CHILDREN && node.child[slot] == 0 {
                slot += 1;
            }
            if slot >= NUM_CHILDREN {
                self.depth -= 1;
                continue;
            }
            let span = 1usize << node.span_log[slot];
            self.stack[self.depth - 1].1 = (slot + span) as u8;
            match ChildRef::from_raw(node.child[slot]) {
                Some(ChildRef::Leaf(l)) => {
                    let leaf = self.tree.leaf(l);
                    return Some((leaf.ip.to_u128(), leaf.prefix));
                }
                Some(ChildRef::Node(c)) if self.depth < MAX_DEPTH => {
                    self.stack[self.depth] = (c.get(), 0);
                    self.depth += 1;
                }
                _ => {}
            }
        }
        None
    }
}
