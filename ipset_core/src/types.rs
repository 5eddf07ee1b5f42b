//! Data structures for the IP set radix tree

use crate::constants::NUM_CHILDREN;
use crate::helpers::{read_u32, read_u64, write_u32, write_u64};
use crate::options::IpSetOptions;
use crate::radix::RadixTree;
use memoffset::offset_of;
use std::fmt;
use std::mem::size_of;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::num::NonZeroU32;

/// Address family held by a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// Address width in bits.
    pub const fn bits(self) -> u8 {
        match self {
            IpFamily::V4 => 32,
            IpFamily::V6 => 128,
        }
    }

    /// Family byte as written in the file header.
    pub const fn wire(self) -> u8 {
        match self {
            IpFamily::V4 => 4,
            IpFamily::V6 => 6,
        }
    }
}

/// How IPv6 content is presented while iterating or walking a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ipv6Policy {
    /// Only IPv4 sets produce output.
    Ignore,
    /// IPv4 as-is; IPv4-mapped IPv6 as IPv4; other IPv6 skipped.
    AsV4,
    /// Native addresses of either family.
    #[default]
    Mix,
    /// Everything as IPv6; IPv4 is mapped into `::ffff:0:0/96`.
    Force,
    /// Only IPv6 sets produce output.
    Only,
}

/// Number of addresses in a set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IpCount {
    /// Exact count, saturating at `u64::MAX`.
    pub exact: u64,
    pub approx: f64,
}

/// Plain-old-data record stored in an arena and dumped byte-for-byte.
///
/// # Safety
/// Implementors must be `#[repr(C)]` and every bit pattern of their
/// non-padding bytes must be a valid value, so a mapped file can be viewed
/// as a slice of them.
pub unsafe trait Record: Copy + Default + 'static {
    /// Decode one record laid out as in memory, optionally byte-swapped.
    fn decode(bytes: &[u8], swap: bool) -> Self;
    /// Encode into a zeroed buffer of `size_of::<Self>()` bytes.
    fn encode(&self, out: &mut [u8]);
}

/// Fixed-width address key; arithmetic is done on `u128` with the address
/// right-aligned in the low `BITS` bits.
pub trait IpKey: Copy + Default + Eq + Ord + fmt::Debug + Send + Sync + 'static {
    const BITS: u8;
    const FAMILY: IpFamily;
    fn from_u128(v: u128) -> Self;
    fn to_u128(self) -> u128;
    fn decode(bytes: &[u8], swap: bool) -> Self;
    fn encode(self, out: &mut [u8]);
    fn to_addr(v: u128) -> IpAddr;
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv4Key(pub u32);

impl IpKey for Ipv4Key {
    const BITS: u8 = 32;
    const FAMILY: IpFamily = IpFamily::V4;

    #[inline]
    fn from_u128(v: u128) -> Self {
        Ipv4Key(v as u32)
    }
    #[inline]
    fn to_u128(self) -> u128 {
        self.0 as u128
    }
    fn decode(bytes: &[u8], swap: bool) -> Self {
        Ipv4Key(read_u32(bytes, 0, swap))
    }
    fn encode(self, out: &mut [u8]) {
        write_u32(out, 0, self.0);
    }
    fn to_addr(v: u128) -> IpAddr {
        IpAddr::V4(Ipv4Addr::from(v as u32))
    }
}

/// IPv6 key as two native-order halves; field order gives address order.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv6Key {
    pub hi: u64,
    pub lo: u64,
}

impl IpKey for Ipv6Key {
    const BITS: u8 = 128;
    const FAMILY: IpFamily = IpFamily::V6;

    #[inline]
    fn from_u128(v: u128) -> Self {
        Ipv6Key {
            hi: (v >> 64) as u64,
            lo: v as u64,
        }
    }
    #[inline]
    fn to_u128(self) -> u128 {
        ((self.hi as u128) << 64) | self.lo as u128
    }
    fn decode(bytes: &[u8], swap: bool) -> Self {
        Ipv6Key {
            hi: read_u64(bytes, 0, swap),
            lo: read_u64(bytes, 8, swap),
        }
    }
    fn encode(self, out: &mut [u8]) {
        write_u64(out, 0, self.hi);
        write_u64(out, 8, self.lo);
    }
    fn to_addr(v: u128) -> IpAddr {
        IpAddr::V6(Ipv6Addr::from(v))
    }
}

// ---- arena indices -------------------------------------------------------

/// Index into the node arena. Slot 0 is the sentinel and never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeIdx(pub NonZeroU32);

/// Index into the leaf arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeafIdx(pub NonZeroU32);

impl NodeIdx {
    #[inline]
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl LeafIdx {
    #[inline]
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

/// Tag bit distinguishing leaf references inside a packed child slot.
pub const LEAF_TAG: u32 = 1 << 31;

/// What a child slot (or the root) refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildRef {
    Node(NodeIdx),
    Leaf(LeafIdx),
}

impl ChildRef {
    /// Unpack a stored slot value; 0 is an empty slot.
    #[inline]
    pub fn from_raw(raw: u32) -> Option<ChildRef> {
        let idx = NonZeroU32::new(raw & !LEAF_TAG)?;
        Some(if raw & LEAF_TAG != 0 {
            ChildRef::Leaf(LeafIdx(idx))
        } else {
            ChildRef::Node(NodeIdx(idx))
        })
    }

    #[inline]
    pub fn to_raw(self) -> u32 {
        match self {
            ChildRef::Node(n) => n.get(),
            ChildRef::Leaf(l) => l.get() | LEAF_TAG,
        }
    }
}

// ---- records -------------------------------------------------------------

/// Interior node covering `2^(BITS - prefix)` addresses split into
/// `NUM_CHILDREN` equal sub-blocks.
///
/// Each occupied range of slots is stored once: `child[first]` holds the
/// packed reference and `span_log[first]` the log2 of how many consecutive
/// slots it covers. The other slots in that range stay zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Node<K> {
    pub ip: K,
    pub child: [u32; NUM_CHILDREN],
    pub span_log: [u8; NUM_CHILDREN],
    pub prefix: u8,
    pub reserved: [u8; 3],
}

/// One stored CIDR block.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Leaf<K> {
    pub ip: K,
    pub prefix: u8,
    pub reserved: [u8; 3],
}

/// One canonical child entry of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub first: usize,
    pub span: usize,
    pub child: ChildRef,
}

impl<K: IpKey> Node<K> {
    pub fn new(ip: u128, prefix: u8) -> Self {
        Node {
            ip: K::from_u128(ip),
            prefix,
            ..Default::default()
        }
    }

    /// The entry whose range covers `slot`, if any.
    pub fn entry(&self, slot: usize) -> Option<Entry> {
        for log in 0..=4u8 {
            let first = slot & !((1usize << log) - 1);
            if self.child[first] != 0 && self.span_log[first] == log {
                return ChildRef::from_raw(self.child[first]).map(|child| Entry {
                    first,
                    span: 1 << log,
                    child,
                });
            }
        }
        None
    }

    #[inline]
    pub fn child(&self, slot: usize) -> Option<ChildRef> {
        self.entry(slot).map(|e| e.child)
    }

    /// Canonical entries in ascending slot order.
    pub fn entries(&self) -> impl Iterator<Item = Entry> + '_ {
        (0..NUM_CHILDREN).filter_map(move |i| {
            ChildRef::from_raw(self.child[i]).map(|child| Entry {
                first: i,
                span: 1 << self.span_log[i],
                child,
            })
        })
    }

    pub fn entry_count(&self) -> usize {
        self.child.iter().filter(|&&c| c != 0).count()
    }

    /// Whether any entry starts inside `[first, first + span)`.
    pub fn occupied(&self, first: usize, span: usize) -> bool {
        self.child[first..first + span].iter().any(|&c| c != 0)
    }

    /// Point `span` slots starting at `first` at `child`.
    pub fn set_entry(&mut self, first: usize, span: usize, child: ChildRef) {
        debug_assert!(span.is_power_of_two() && first % span == 0 && first + span <= NUM_CHILDREN);
        self.clear_span(first, span);
        self.child[first] = child.to_raw();
        self.span_log[first] = span.trailing_zeros() as u8;
    }

    pub fn clear_span(&mut self, first: usize, span: usize) {
        self.child[first..first + span].fill(0);
        self.span_log[first..first + span].fill(0);
    }

    /// Remap every stored reference through `f`.
    pub fn map_children(&mut self, mut f: impl FnMut(ChildRef) -> ChildRef) {
        for raw in self.child.iter_mut() {
            if let Some(c) = ChildRef::from_raw(*raw) {
                *raw = f(c).to_raw();
            }
        }
    }
}

impl<K: IpKey> Leaf<K> {
    pub fn new(ip: u128, prefix: u8) -> Self {
        Leaf {
            ip: K::from_u128(ip),
            prefix,
            reserved: [0; 3],
        }
    }
}

unsafe impl<K: IpKey> Record for Node<K> {
    fn decode(bytes: &[u8], swap: bool) -> Self {
        let mut node = Node::<K> {
            ip: K::decode(&bytes[offset_of!(Node<K>, ip)..], swap),
            ..Default::default()
        };
        let base = offset_of!(Node<K>, child);
        for (i, c) in node.child.iter_mut().enumerate() {
            *c = read_u32(bytes, base + 4 * i, swap);
        }
        let spans = offset_of!(Node<K>, span_log);
        node.span_log.copy_from_slice(&bytes[spans..spans + NUM_CHILDREN]);
        node.prefix = bytes[offset_of!(Node<K>, prefix)];
        node
    }

    fn encode(&self, out: &mut [u8]) {
        debug_assert_eq!(out.len(), size_of::<Self>());
        self.ip.encode(&mut out[offset_of!(Node<K>, ip)..]);
        let base = offset_of!(Node<K>, child);
        for (i, &c) in self.child.iter().enumerate() {
            write_u32(out, base + 4 * i, c);
        }
        let spans = offset_of!(Node<K>, span_log);
        out[spans..spans + NUM_CHILDREN].copy_from_slice(&self.span_log);
        out[offset_of!(Node<K>, prefix)] = self.prefix;
    }
}

unsafe impl<K: IpKey> Record for Leaf<K> {
    fn decode(bytes: &[u8], swap: bool) -> Self {
        Leaf {
            ip: K::decode(&bytes[offset_of!(Leaf<K>, ip)..], swap),
            prefix: bytes[offset_of!(Leaf<K>, prefix)],
            reserved: [0; 3],
        }
    }

    fn encode(&self, out: &mut [u8]) {
        debug_assert_eq!(out.len(), size_of::<Self>());
        self.ip.encode(&mut out[offset_of!(Leaf<K>, ip)..]);
        out[offset_of!(Leaf<K>, prefix)] = self.prefix;
    }
}

// ---- the set handle ------------------------------------------------------

/// Family-specific tree behind an [`IpSet`].
#[derive(Clone)]
pub(crate) enum Tree {
    V4(RadixTree<Ipv4Key>),
    V6(RadixTree<Ipv6Key>),
}

/// A set of IPv4 or IPv6 CIDR blocks.
#[derive(Clone)]
pub struct IpSet {
    pub(crate) tree: Tree,
    pub(crate) auto_convert: bool,
    pub(crate) options: IpSetOptions,
}

impl fmt::Debug for IpSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpSet")
            .field("family", &self.family())
            .field("dirty", &self.is_dirty())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// Run `$body` against whichever family tree `$tree` holds, binding it to `$t`.
macro_rules! with_tree {
    ($tree:expr, $t:ident => $body:expr) => {
        match $tree {
            $crate::types::Tree::V4($t) => $body,
            $crate::types::Tree::V6($t) => $body,
        }
    };
}
pub(crate) use with_tree;
