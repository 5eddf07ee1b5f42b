//! CIDR/bitmap stream: `address, marker` records, where the marker is either
//! a prefix length or announces a 256-address bitmap.

use super::legacy::insert_bitmap;
use super::{read_record, FileHeader};
use crate::constants::{CIDRBMAP_BLOCK_BITS, CIDRBMAP_MAP256, CIDRBMAP_WORDS};
use crate::errors::Error;
use crate::helpers::{block_end, canonical, read_u32, write_u32};
use crate::options::RecordVersion;
use crate::radix::RadixTree;
use crate::types::{IpFamily, IpKey};
use log::trace;
use std::io::{Read, Write};

type Bitmap = [u32; CIDRBMAP_WORDS];

/// Address bytes per record: native `u32` for IPv4, big-endian for IPv6.
fn addr_len<K: IpKey>() -> usize {
    K::BITS as usize / 8
}

fn decode_addr<K: IpKey>(bytes: &[u8], swap: bool) -> u128 {
    match K::FAMILY {
        IpFamily::V4 => read_u32(bytes, 0, swap) as u128,
        IpFamily::V6 => {
            let mut b = [0u8; 16];
            b.copy_from_slice(&bytes[..16]);
            u128::from_be_bytes(b)
        }
    }
}

fn encode_addr<K: IpKey>(ip: u128, out: &mut [u8]) {
    match K::FAMILY {
        IpFamily::V4 => write_u32(out, 0, ip as u32),
        IpFamily::V6 => out[..16].copy_from_slice(&ip.to_be_bytes()),
    }
}

pub(crate) fn read<K: IpKey, R: Read>(r: &mut R, hdr: &FileHeader) -> Result<RadixTree<K>, Error> {
    let width = K::BITS;
    let alen = addr_len::<K>();
    let mut tree = RadixTree::<K>::new();
    let mut rec = [0u8; 17];
    let mut map_bytes = [0u8; 4 * CIDRBMAP_WORDS];
    while read_record(r, &mut rec[..alen + 1])? {
        let ip = decode_addr::<K>(&rec, hdr.swap);
        let marker = rec[alen];
        if marker == CIDRBMAP_MAP256 {
            if !read_record(r, &mut map_bytes)? {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "bitmap missing after marker",
                )));
            }
            if canonical(ip, width - CIDRBMAP_BLOCK_BITS, width) != ip {
                return Err(Error::Corrupt("bitmap base is not block aligned"));
            }
            let mut map: Bitmap = [0; CIDRBMAP_WORDS];
            for (i, w) in map.iter_mut().enumerate() {
                *w = read_u32(&map_bytes, 4 * i, hdr.swap);
            }
            insert_bitmap(&mut tree, ip, &map, width)?;
        } else if marker <= width {
            tree.insert(ip, marker)?;
        } else {
            return Err(Error::Corrupt("unknown record marker"));
        }
    }
    tree.clean()?;
    Ok(tree)
}

/// Pending 256-address block while writing.
struct Pending {
    base: u128,
    map: Bitmap,
    blocks: usize,
    single: (u128, u8),
}

/// Write a clean tree. Blocks of 256 addresses or more are already maximal
/// CIDRs and go out as-is; finer blocks are gathered per 256-address block
/// and written as one CIDR record when they form one, else as a bitmap.
pub(crate) fn write<K: IpKey, W: Write>(tree: &RadixTree<K>, w: &mut W) -> Result<(), Error> {
    let width = K::BITS;
    w.write_all(&FileHeader::plain(RecordVersion::CidrBitmap, K::FAMILY).encode())?;
    let mut pending: Option<Pending> = None;
    let mut records = 0u64;
    for (ip, prefix) in tree.blocks() {
        if prefix <= width - CIDRBMAP_BLOCK_BITS {
            if let Some(p) = pending.take() {
                flush::<K, W>(w, p)?;
                records += 1;
            }
            write_cidr::<K, W>(w, ip, prefix)?;
            records += 1;
            continue;
        }
        let base = canonical(ip, width - CIDRBMAP_BLOCK_BITS, width);
        if pending.as_ref().map_or(true, |p| p.base != base) {
            if let Some(p) = pending.take() {
                flush::<K, W>(w, p)?;
                records += 1;
            }
        }
        let p = pending.get_or_insert(Pending {
            base,
            map: [0; CIDRBMAP_WORDS],
            blocks: 0,
            single: (ip, prefix),
        });
        let first = (ip - base) as usize;
        let last = (block_end(ip, prefix, width) - base) as usize;
        for i in first..=last {
            p.map[i / 32] |= 1 << (i % 32);
        }
        p.blocks += 1;
    }
    if let Some(p) = pending {
        flush::<K, W>(w, p)?;
        records += 1;
    }
    trace!("[WRITE] {} cidr/bitmap records", records);
    Ok(())
}

fn flush<K: IpKey, W: Write>(w: &mut W, p: Pending) -> Result<(), Error> {
    if p.blocks == 1 {
        return write_cidr::<K, W>(w, p.single.0, p.single.1);
    }
    let alen = addr_len::<K>();
    let mut buf = [0u8; 17 + 4 * CIDRBMAP_WORDS];
    encode_addr::<K>(p.base, &mut buf);
    buf[alen] = CIDRBMAP_MAP256;
    for (i, &word) in p.map.iter().enumerate() {
        write_u32(&mut buf, alen + 1 + 4 * i, word);
    }
    w.write_all(&buf[..alen + 1 + 4 * CIDRBMAP_WORDS])?;
    Ok(())
}

fn write_cidr<K: IpKey, W: Write>(w: &mut W, ip: u128, prefix: u8) -> Result<(), Error> {
    let alen = addr_len::<K>();
    let mut buf = [0u8; 17];
    encode_addr::<K>(ip, &mut buf);
    buf[alen] = prefix;
    w.write_all(&buf[..alen + 1])?;
    Ok(())
}
