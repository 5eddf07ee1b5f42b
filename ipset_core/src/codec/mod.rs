//! On-disk formats: common header plus the three record layouts.

pub(crate) mod cidr_bitmap;
pub(crate) mod legacy;
pub(crate) mod radix_dump;

use crate::constants::{
    COMPRESSION_NONE, FILE_HEADER_LEN, FILE_HEADER_VERSION, FILE_MAGIC, FILE_TYPE_IPSET,
    LEGACY_BLOCK_LEN, NUM_CHILDREN,
};
use crate::errors::Error;
use crate::helpers::{mapped_to_v4, read_u16, read_u32, write_u16, write_u32};
use crate::options::{IpSetOptions, RecordVersion};
use crate::radix::RadixTree;
use crate::types::{IpFamily, Ipv4Key, Ipv6Key, Leaf, Node, Tree};
use log::{debug, info, warn};
use memmap2::Mmap;
use metrics::counter;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::mem::size_of;
use std::path::Path;
use std::sync::Arc;

/// Byte-order flag of this host as written at offset 4.
const NATIVE_ORDER: u8 = if cfg!(target_endian = "little") { 1 } else { 0 };

/// Decoded common header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FileHeader {
    /// Producer byte order differs from ours.
    pub swap: bool,
    pub version: RecordVersion,
    pub family: IpFamily,
    pub record_size: u32,
    pub children: u32,
    pub leaf_count: u32,
    pub leaf_size: u32,
    pub node_count: u32,
    pub node_size: u32,
    pub root_index: u32,
    pub root_is_leaf: bool,
}

impl FileHeader {
    /// Header for a stream body without radix bookkeeping.
    pub fn plain(version: RecordVersion, family: IpFamily) -> Self {
        FileHeader {
            swap: false,
            version,
            family,
            record_size: match version {
                RecordVersion::Legacy => LEGACY_BLOCK_LEN as u32,
                _ => 1,
            },
            children: 0,
            leaf_count: 0,
            leaf_size: 0,
            node_count: 0,
            node_size: 0,
            root_index: 0,
            root_is_leaf: false,
        }
    }

    pub fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut b = [0u8; FILE_HEADER_LEN];
        b[0..4].copy_from_slice(&FILE_MAGIC);
        b[4] = NATIVE_ORDER;
        b[5] = FILE_TYPE_IPSET;
        b[6] = FILE_HEADER_VERSION;
        b[7] = COMPRESSION_NONE;
        write_u16(&mut b, 8, self.version as u16);
        b[10] = self.family.wire();
        write_u32(&mut b, 12, self.record_size);
        write_u32(&mut b, 16, FILE_HEADER_LEN as u32);
        write_u32(&mut b, 20, self.children);
        write_u32(&mut b, 24, self.leaf_count);
        write_u32(&mut b, 28, self.leaf_size);
        write_u32(&mut b, 32, self.node_count);
        write_u32(&mut b, 36, self.node_size);
        write_u32(&mut b, 40, self.root_index);
        write_u32(&mut b, 44, self.root_is_leaf as u32);
        b
    }

    pub fn decode(b: &[u8; FILE_HEADER_LEN]) -> Result<Self, Error> {
        if b[0..4] != FILE_MAGIC || b[5] != FILE_TYPE_IPSET {
            return Err(Error::FileType);
        }
        let swap = match b[4] {
            0 | 1 => b[4] != NATIVE_ORDER,
            _ => return Err(Error::FileHeader("byte order flag")),
        };
        if b[6] != FILE_HEADER_VERSION {
            return Err(Error::FileHeader("header layout version"));
        }
        let version = RecordVersion::try_from(read_u16(b, 8, swap))?;
        if b[7] != COMPRESSION_NONE {
            return Err(Error::FileHeader("compressed streams are not supported"));
        }
        if read_u32(b, 16, swap) as usize != FILE_HEADER_LEN {
            return Err(Error::FileHeader("header length"));
        }
        let family = match b[10] {
            4 => IpFamily::V4,
            6 => IpFamily::V6,
            _ => return Err(Error::FileHeader("address family")),
        };
        let hdr = FileHeader {
            swap,
            version,
            family,
            record_size: read_u32(b, 12, swap),
            children: read_u32(b, 20, swap),
            leaf_count: read_u32(b, 24, swap),
            leaf_size: read_u32(b, 28, swap),
            node_count: read_u32(b, 32, swap),
            node_size: read_u32(b, 36, swap),
            root_index: read_u32(b, 40, swap),
            root_is_leaf: match read_u32(b, 44, swap) {
                0 => false,
                1 => true,
                _ => return Err(Error::FileHeader("root-is-leaf flag")),
            },
        };
        hdr.validate()?;
        Ok(hdr)
    }

    fn validate(&self) -> Result<(), Error> {
        match self.version {
            RecordVersion::Legacy => {
                if self.family == IpFamily::V6 {
                    return Err(Error::FileHeader("legacy records cannot hold IPv6"));
                }
                if self.record_size as usize != LEGACY_BLOCK_LEN {
                    return Err(Error::FileHeader("record size"));
                }
            }
            RecordVersion::CidrBitmap => {
                if self.record_size != 1 {
                    return Err(Error::FileHeader("record size"));
                }
            }
            RecordVersion::RadixDump => {
                if self.record_size != 1 {
                    return Err(Error::FileHeader("record size"));
                }
                if self.children as usize != NUM_CHILDREN {
                    return Err(Error::FileHeader("children per node"));
                }
                let (ns, ls) = match self.family {
                    IpFamily::V4 => (size_of::<Node<Ipv4Key>>(), size_of::<Leaf<Ipv4Key>>()),
                    IpFamily::V6 => (size_of::<Node<Ipv6Key>>(), size_of::<Leaf<Ipv6Key>>()),
                };
                if self.node_size as usize != ns || self.leaf_size as usize != ls {
                    return Err(Error::FileHeader("node or leaf record size"));
                }
                if self.leaf_count == 0 {
                    if self.node_count > 1 || self.root_index != 0 {
                        return Err(Error::FileHeader("root of an empty set"));
                    }
                } else {
                    let limit = if self.root_is_leaf {
                        self.leaf_count
                    } else {
                        self.node_count
                    };
                    if self.root_index == 0 || self.root_index >= limit {
                        return Err(Error::FileHeader("root index"));
                    }
                }
            }
        }
        Ok(())
    }

    /// Bytes of radix data following the header.
    pub fn radix_body_len(&self) -> Option<usize> {
        let nodes = (self.node_count as usize).checked_mul(self.node_size as usize)?;
        let leaves = (self.leaf_count as usize).checked_mul(self.leaf_size as usize)?;
        nodes.checked_add(leaves)
    }
}

/// Fill `buf` from `r`. `Ok(false)` on a clean end of stream before any
/// byte; a partial record is an `UnexpectedEof` error.
pub(crate) fn read_record<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool, Error> {
    let mut got = 0;
    while got < buf.len() {
        match r.read(&mut buf[got..]) {
            Ok(0) if got == 0 => return Ok(false),
            Ok(0) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated record",
                )))
            }
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(true)
}

pub(crate) fn read_header<R: Read>(r: &mut R) -> Result<FileHeader, Error> {
    let mut b = [0u8; FILE_HEADER_LEN];
    r.read_exact(&mut b)?;
    FileHeader::decode(&b)
}

/// Read a whole set (header and body) from a stream into owned memory.
pub(crate) fn read_tree<R: Read>(r: &mut R) -> Result<Tree, Error> {
    let hdr = read_header(r)?;
    counter!("ipset_reads_total").increment(1);
    info!(
        "[READ] record version {:?}, family {:?}, swapped={}",
        hdr.version, hdr.family, hdr.swap
    );
    let tree = match (hdr.version, hdr.family) {
        (RecordVersion::Legacy, _) => Tree::V4(legacy::read(r, &hdr)?),
        (RecordVersion::RadixDump, IpFamily::V4) => Tree::V4(radix_dump::read(r, &hdr)?),
        (RecordVersion::RadixDump, IpFamily::V6) => Tree::V6(radix_dump::read(r, &hdr)?),
        (RecordVersion::CidrBitmap, IpFamily::V4) => Tree::V4(cidr_bitmap::read(r, &hdr)?),
        (RecordVersion::CidrBitmap, IpFamily::V6) => Tree::V6(cidr_bitmap::read(r, &hdr)?),
    };
    Ok(tree)
}

/// Open `path`, mapping radix dumps when allowed, else reading into owned memory.
pub(crate) fn load_tree(path: &Path, opts: &IpSetOptions) -> Result<Tree, Error> {
    let open_err = |source| Error::Open {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(open_err)?;
    if !opts.allow_mmap {
        return read_tree(&mut BufReader::new(file));
    }
    // SAFETY: the mapping is read-only; callers must not truncate the file
    // while a set is backed by it.
    let map = match unsafe { Mmap::map(&file) } {
        Ok(m) => Arc::new(m),
        Err(e) => {
            warn!("[MMAP] mapping {} failed ({e}); reading instead", path.display());
            return read_tree(&mut BufReader::new(file));
        }
    };
    let bytes: &[u8] = &map;
    let hdr = read_header(&mut &bytes[..])?;
    if hdr.version == RecordVersion::RadixDump && !hdr.swap {
        let mapped = match hdr.family {
            IpFamily::V4 => radix_dump::map::<Ipv4Key>(Arc::clone(&map), &hdr)?.map(Tree::V4),
            IpFamily::V6 => radix_dump::map::<Ipv6Key>(Arc::clone(&map), &hdr)?.map(Tree::V6),
        };
        if let Some(tree) = mapped {
            counter!("ipset_reads_total").increment(1);
            info!("[MMAP] {} mapped ({} bytes)", path.display(), map.len());
            return Ok(tree);
        }
        warn!("[MMAP] {} is not suitably aligned; reading instead", path.display());
    } else {
        debug!("[READ] {} needs decoding; not mapping", path.display());
    }
    read_tree(&mut &bytes[..])
}

/// Write the header and body of a clean tree.
pub(crate) fn write_tree<W: Write>(
    tree: &Tree,
    version: RecordVersion,
    w: &mut W,
) -> Result<(), Error> {
    let mut w = BufWriter::new(w);
    match (tree, version) {
        (Tree::V4(t), RecordVersion::Legacy) => legacy::write(t.blocks(), &mut w)?,
        (Tree::V6(t), RecordVersion::Legacy) => {
            legacy::write(mapped_v4_blocks(t)?.into_iter(), &mut w)?
        }
        (Tree::V4(t), RecordVersion::RadixDump) => radix_dump::write(t, &mut w)?,
        (Tree::V6(t), RecordVersion::RadixDump) => radix_dump::write(t, &mut w)?,
        (Tree::V4(t), RecordVersion::CidrBitmap) => cidr_bitmap::write(t, &mut w)?,
        (Tree::V6(t), RecordVersion::CidrBitmap) => cidr_bitmap::write(t, &mut w)?,
    }
    w.flush()?;
    counter!("ipset_writes_total").increment(1);
    info!("[WRITE] record version {:?}", version);
    Ok(())
}

/// IPv4 view of an IPv6 tree whose every block is IPv4-mapped.
fn mapped_v4_blocks(t: &RadixTree<Ipv6Key>) -> Result<Vec<(u128, u8)>, Error> {
    t.blocks()
        .map(|(ip, p)| mapped_to_v4(ip, p).ok_or(Error::Ipv6))
        .collect()
}
