//! Legacy IPv4 layout: one record per /24, base address plus a 256-bit map.

use super::{read_record, FileHeader};
use crate::constants::{LEGACY_BLOCK_LEN, LEGACY_WORDS_PER_SLASH24};
use crate::errors::Error;
use crate::helpers::{block_end, range_to_cidrs, read_u32, write_u32};
use crate::options::RecordVersion;
use crate::radix::RadixTree;
use crate::types::{IpFamily, Ipv4Key};
use log::trace;
use std::io::{Read, Write};

type Bitmap = [u32; LEGACY_WORDS_PER_SLASH24];

pub(crate) fn read<R: Read>(r: &mut R, hdr: &FileHeader) -> Result<RadixTree<Ipv4Key>, Error> {
    let mut tree = RadixTree::new();
    let mut buf = [0u8; LEGACY_BLOCK_LEN];
    while read_record(r, &mut buf)? {
        let base = read_u32(&buf, 0, hdr.swap);
        if base & 0xFF != 0 {
            return Err(Error::Corrupt("legacy block base is not /24 aligned"));
        }
        let mut map: Bitmap = [0; LEGACY_WORDS_PER_SLASH24];
        for (w, word) in map.iter_mut().enumerate() {
            *word = read_u32(&buf, 4 + 4 * w, hdr.swap);
        }
        insert_bitmap(&mut tree, base as u128, &map, 32)?;
    }
    tree.clean()?;
    Ok(tree)
}

/// Insert the runs of set bits in a 256-address bitmap anchored at `base`.
pub(crate) fn insert_bitmap<K: crate::types::IpKey>(
    tree: &mut RadixTree<K>,
    base: u128,
    map: &Bitmap,
    width: u8,
) -> Result<(), Error> {
    if map.iter().all(|&w| w == u32::MAX) {
        return tree.insert(base, width - 8);
    }
    let bit = |i: usize| map[i / 32] & (1 << (i % 32)) != 0;
    let mut i = 0usize;
    while i < 256 {
        if !bit(i) {
            i += 1;
            continue;
        }
        let start = i;
        while i < 256 && bit(i) {
            i += 1;
        }
        for (ip, p) in range_to_cidrs(base + start as u128, base + i as u128 - 1, width) {
            tree.insert(ip, p)?;
        }
    }
    Ok(())
}

/// Write IPv4 blocks, ascending and disjoint, as /24 records.
pub(crate) fn write<W: Write>(
    blocks: impl Iterator<Item = (u128, u8)>,
    w: &mut W,
) -> Result<(), Error> {
    w.write_all(&FileHeader::plain(RecordVersion::Legacy, IpFamily::V4).encode())?;
    let mut current: Option<(u32, Bitmap)> = None;
    let mut records = 0u64;
    for (ip, prefix) in blocks {
        let ip = ip as u32;
        if prefix <= 24 {
            if let Some((base, map)) = current.take() {
                write_block(w, base, &map)?;
                records += 1;
            }
            let last = block_end(ip as u128, prefix, 32) as u32;
            let full = [u32::MAX; LEGACY_WORDS_PER_SLASH24];
            let mut base = ip;
            loop {
                write_block(w, base, &full)?;
                records += 1;
                if base >= last & !0xFF {
                    break;
                }
                base += 0x100;
            }
            continue;
        }
        let base = ip & !0xFF;
        match &current {
            Some((b, _)) if *b == base => {}
            _ => {
                if let Some((b, map)) = current.take() {
                    write_block(w, b, &map)?;
                    records += 1;
                }
                current = Some((base, [0; LEGACY_WORDS_PER_SLASH24]));
            }
        }
        if let Some((_, map)) = current.as_mut() {
            let first = (ip & 0xFF) as usize;
            let last = (block_end(ip as u128, prefix, 32) as u32 & 0xFF) as usize;
            for i in first..=last {
                map[i / 32] |= 1 << (i % 32);
            }
        }
    }
    if let Some((base, map)) = current {
        write_block(w, base, &map)?;
        records += 1;
    }
    trace!("[WRITE] {} legacy /24 records", records);
    Ok(())
}

fn write_block<W: Write>(w: &mut W, base: u32, map: &Bitmap) -> Result<(), Error> {
    let mut buf = [0u8; LEGACY_BLOCK_LEN];
    write_u32(&mut buf, 0, base);
    for (i, &word) in map.iter().enumerate() {
        write_u32(&mut buf, 4 + 4 * i, word);
    }
    w.write_all(&buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::read_header;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> u128 {
        u32::from_be_bytes([a, b, c, d]) as u128
    }

    #[test]
    fn bitmap_runs_become_cidrs() {
        let mut t = RadixTree::<Ipv4Key>::new();
        let mut map: Bitmap = [0; LEGACY_WORDS_PER_SLASH24];
        // .0 - .15 and .255
        map[0] = 0xFFFF;
        map[7] = 1 << 31;
        insert_bitmap(&mut t, v4(10, 1, 2, 0), &map, 32).unwrap();
        t.clean().unwrap();
        assert_eq!(
            t.blocks().collect::<Vec<_>>(),
            vec![(v4(10, 1, 2, 0), 28), (v4(10, 1, 2, 255), 32)]
        );
    }

    #[test]
    fn coarse_blocks_expand_to_full_records() {
        let mut out = Vec::new();
        let blocks = vec![(v4(10, 0, 0, 0), 22), (v4(10, 0, 4, 7), 32)];
        write(blocks.into_iter(), &mut out).unwrap();
        // header + 4 full /24s + one partial
        assert_eq!(out.len(), 48 + 5 * LEGACY_BLOCK_LEN);

        let mut r = &out[..];
        let hdr = read_header(&mut r).unwrap();
        let t = read(&mut r, &hdr).unwrap();
        assert_eq!(
            t.blocks().collect::<Vec<_>>(),
            vec![(v4(10, 0, 0, 0), 22), (v4(10, 0, 4, 7), 32)]
        );
    }

    #[test]
    fn misaligned_base_is_corrupt() {
        let mut out = Vec::new();
        write(std::iter::once((v4(10, 0, 0, 1), 32)), &mut out).unwrap();
        // Nudge the base address off its /24 boundary.
        let base_off = 48;
        let base = read_u32(&out, base_off, false) | 0x10;
        write_u32(&mut out, base_off, base);
        let mut r = &out[..];
        let hdr = read_header(&mut r).unwrap();
        assert!(matches!(read(&mut r, &hdr), Err(Error::Corrupt(_))));
    }
}
