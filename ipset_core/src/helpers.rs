//! Helper functions for radix tree bit math and byte handling

use crate::constants::NUM_BITS;

/// Low `width - prefix` bits set: the host part of a block.
#[inline]
pub fn host_mask(prefix: u8, width: u8) -> u128 {
    debug_assert!(prefix <= width && width <= 128);
    let host = (width - prefix) as u32;
    if host >= 128 {
        u128::MAX
    } else {
        (1u128 << host) - 1
    }
}

/// All-ones mask covering the whole address width.
#[inline]
pub fn width_mask(width: u8) -> u128 {
    host_mask(0, width)
}

// Canonicalise a key: zero host bits beyond `prefix`.
#[inline(always)]
pub fn canonical(ip: u128, prefix: u8, width: u8) -> u128 {
    ip & !host_mask(prefix, width)
}

/// Last address of the block `ip/prefix`.
#[inline]
pub fn block_end(ip: u128, prefix: u8, width: u8) -> u128 {
    canonical(ip, prefix, width) | host_mask(prefix, width)
}

/// Number of leading bits two `width`-bit keys share.
#[inline]
pub fn common_prefix_len(a: u128, b: u128, width: u8) -> u8 {
    let diff = (a ^ b) & width_mask(width);
    if diff == 0 {
        return width;
    }
    (diff.leading_zeros() - (128 - width as u32)) as u8
}

/// Child slot selected by the `NUM_BITS` bits that follow `bitpos`.
#[inline]
pub fn slot_at(ip: u128, bitpos: u8, width: u8) -> usize {
    debug_assert!(bitpos + NUM_BITS <= width);
    ((ip >> (width - bitpos - NUM_BITS)) & ((1 << NUM_BITS) - 1)) as usize
}

/// How many slots of a node with `node_prefix` a leaf of `leaf_prefix` fills.
#[inline]
pub fn leaf_span(node_prefix: u8, leaf_prefix: u8) -> usize {
    debug_assert!(leaf_prefix > node_prefix);
    let level_end = node_prefix + NUM_BITS;
    if leaf_prefix >= level_end {
        1
    } else {
        1 << (level_end - leaf_prefix)
    }
}

/// Round a bit position down to a node boundary.
#[inline]
pub fn floor_level(bits: u8) -> u8 {
    bits - bits % NUM_BITS
}

/// The bit that separates the two halves of a `prefix - 1` block.
#[inline]
pub fn sibling_bit(prefix: u8, width: u8) -> u128 {
    debug_assert!(prefix >= 1 && prefix <= width);
    1u128 << (width - prefix)
}

/// `::ffff:0:0`, base of the IPv4-mapped IPv6 range.
pub const V4_MAPPED_BASE: u128 = 0xffff_0000_0000;
/// Prefix length of the IPv4-mapped range.
pub const V4_MAPPED_PREFIX: u8 = 96;

/// IPv6 block for an IPv4 block.
#[inline]
pub fn v4_to_mapped(ip: u128, prefix: u8) -> (u128, u8) {
    (V4_MAPPED_BASE | (ip & 0xFFFF_FFFF), prefix + V4_MAPPED_PREFIX)
}

/// IPv4 block for an IPv6 block lying inside `::ffff:0:0/96`.
#[inline]
pub fn mapped_to_v4(ip: u128, prefix: u8) -> Option<(u128, u8)> {
    if prefix >= V4_MAPPED_PREFIX && canonical(ip, V4_MAPPED_PREFIX, 128) == V4_MAPPED_BASE {
        Some((ip & 0xFFFF_FFFF, prefix - V4_MAPPED_PREFIX))
    } else {
        None
    }
}

/// Whether the IPv6 block contains the whole IPv4-mapped range.
#[inline]
pub fn covers_mapped(ip: u128, prefix: u8) -> bool {
    prefix <= V4_MAPPED_PREFIX && canonical(V4_MAPPED_BASE, prefix, 128) == canonical(ip, prefix, 128)
}

/// Split the inclusive range `[start, end]` into the minimal list of
/// CIDR blocks, in ascending order.
pub fn range_to_cidrs(mut start: u128, end: u128, width: u8) -> Vec<(u128, u8)> {
    let mut out = Vec::new();
    if start > end {
        return out;
    }
    loop {
        // Largest aligned block starting at `start` that stays within `end`.
        let align = if start == 0 {
            width as u32
        } else {
            start.trailing_zeros().min(width as u32)
        };
        let span = end - start;
        let fit = if span == u128::MAX {
            128
        } else {
            127 - (span + 1).leading_zeros()
        };
        let host = align.min(fit).min(width as u32);
        let prefix = width - host as u8;
        out.push((start, prefix));
        let last = start | host_mask(prefix, width);
        if last >= end {
            break;
        }
        start = last + 1;
    }
    out
}

// ---- native-order byte access --------------------------------------------

#[inline]
pub fn read_u16(bytes: &[u8], off: usize, swap: bool) -> u16 {
    let v = u16::from_ne_bytes([bytes[off], bytes[off + 1]]);
    if swap {
        v.swap_bytes()
    } else {
        v
    }
}

#[inline]
pub fn read_u32(bytes: &[u8], off: usize, swap: bool) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[off..off + 4]);
    let v = u32::from_ne_bytes(b);
    if swap {
        v.swap_bytes()
    } else {
        v
    }
}

#[inline]
pub fn read_u64(bytes: &[u8], off: usize, swap: bool) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[off..off + 8]);
    let v = u64::from_ne_bytes(b);
    if swap {
        v.swap_bytes()
    } else {
        v
    }
}

#[inline]
pub fn write_u16(out: &mut [u8], off: usize, v: u16) {
    out[off..off + 2].copy_from_slice(&v.to_ne_bytes());
}

#[inline]
pub fn write_u32(out: &mut [u8], off: usize, v: u32) {
    out[off..off + 4].copy_from_slice(&v.to_ne_bytes());
}

#[inline]
pub fn write_u64(out: &mut [u8], off: usize, v: u64) {
    out[off..off + 8].copy_from_slice(&v.to_ne_bytes());
}
