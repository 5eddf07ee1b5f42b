//! Radix dump: the node array followed by the leaf array, as held in memory.

use super::FileHeader;
use crate::arena::{ArenaBuffer, MappedRegion};
use crate::constants::{FILE_HEADER_LEN, NUM_CHILDREN};
use crate::errors::Error;
use crate::options::RecordVersion;
use crate::radix::RadixTree;
use crate::types::{ChildRef, IpKey, Leaf, LeafIdx, Node, NodeIdx, Record};
use log::{debug, warn};
use memmap2::Mmap;
use std::io::{self, Read, Write};
use std::mem::size_of;
use std::num::NonZeroU32;
use std::sync::Arc;

fn root_of(hdr: &FileHeader) -> Option<ChildRef> {
    let idx = NonZeroU32::new(hdr.root_index)?;
    Some(if hdr.root_is_leaf {
        ChildRef::Leaf(LeafIdx(idx))
    } else {
        ChildRef::Node(NodeIdx(idx))
    })
}

fn read_records<T: Record, R: Read>(r: &mut R, count: u32, swap: bool) -> Result<Vec<T>, Error> {
    let mut out = Vec::new();
    out.try_reserve_exact(count as usize)?;
    let mut buf = vec![0u8; size_of::<T>()];
    for _ in 0..count {
        r.read_exact(&mut buf)?;
        out.push(T::decode(&buf, swap));
    }
    Ok(out)
}

/// Verify a freshly loaded tree and note whether it still needs cleaning.
fn finish<K: IpKey>(mut tree: RadixTree<K>) -> Result<RadixTree<K>, Error> {
    tree.verify()?;
    if !tree.leaves_sorted() {
        debug!("[READ] leaf array is not sorted; set marked dirty");
        tree.dirty = true;
    }
    Ok(tree)
}

pub(crate) fn read<K: IpKey, R: Read>(r: &mut R, hdr: &FileHeader) -> Result<RadixTree<K>, Error> {
    let nodes: Vec<Node<K>> = read_records(r, hdr.node_count, hdr.swap)?;
    let leaves: Vec<Leaf<K>> = read_records(r, hdr.leaf_count, hdr.swap)?;
    finish(RadixTree::from_parts(
        ArenaBuffer::from_vec(nodes),
        ArenaBuffer::from_vec(leaves),
        root_of(hdr),
    ))
}

/// View the arrays inside `map` without copying. `Ok(None)` when the
/// records are not aligned for direct use.
pub(crate) fn map<K: IpKey>(map: Arc<Mmap>, hdr: &FileHeader) -> Result<Option<RadixTree<K>>, Error> {
    let body = hdr
        .radix_body_len()
        .ok_or(Error::FileHeader("record counts overflow"))?;
    if map.len() < FILE_HEADER_LEN + body {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "radix dump shorter than its header claims",
        )));
    }
    if map.len() > FILE_HEADER_LEN + body {
        warn!("[MMAP] {} trailing bytes ignored", map.len() - FILE_HEADER_LEN - body);
    }
    let leaf_offset = FILE_HEADER_LEN + hdr.node_count as usize * size_of::<Node<K>>();
    let nodes = MappedRegion::<Node<K>>::new(Arc::clone(&map), FILE_HEADER_LEN, hdr.node_count as usize);
    let leaves = MappedRegion::<Leaf<K>>::new(map, leaf_offset, hdr.leaf_count as usize);
    match (nodes, leaves) {
        (Some(n), Some(l)) => finish(RadixTree::from_parts(
            ArenaBuffer::from_mapped(n),
            ArenaBuffer::from_mapped(l),
            root_of(hdr),
        ))
        .map(Some),
        _ => Ok(None),
    }
}

/// Dump a clean tree.
pub(crate) fn write<K: IpKey, W: Write>(tree: &RadixTree<K>, w: &mut W) -> Result<(), Error> {
    let nodes = tree.nodes.as_slice();
    let leaves = tree.leaves.as_slice();
    let (root_index, root_is_leaf) = match tree.root {
        None => (0, false),
        Some(ChildRef::Node(n)) => (n.get(), false),
        Some(ChildRef::Leaf(l)) => (l.get(), true),
    };
    let empty = tree.root.is_none();
    let hdr = FileHeader {
        children: NUM_CHILDREN as u32,
        leaf_count: if empty { 0 } else { leaves.len() as u32 },
        leaf_size: size_of::<Leaf<K>>() as u32,
        node_count: if empty { 0 } else { nodes.len() as u32 },
        node_size: size_of::<Node<K>>() as u32,
        root_index,
        root_is_leaf,
        ..FileHeader::plain(RecordVersion::RadixDump, K::FAMILY)
    };
    w.write_all(&hdr.encode())?;
    if empty {
        return Ok(());
    }
    write_records(nodes, w)?;
    write_records(leaves, w)?;
    debug!(
        "[WRITE] radix dump: {} nodes, {} leaves",
        nodes.len(),
        leaves.len()
    );
    Ok(())
}

fn write_records<T: Record, W: Write>(records: &[T], w: &mut W) -> Result<(), Error> {
    let mut buf = vec![0u8; size_of::<T>()];
    for rec in records {
        buf.fill(0);
        rec.encode(&mut buf);
        w.write_all(&buf)?;
    }
    Ok(())
}
