pub mod arena;
pub mod codec;
pub mod constants;
pub mod errors;
pub mod helpers;
pub mod iter;
pub mod options;
pub mod public_api;
pub mod radix;
pub mod telemetry;
pub mod types;

pub use errors::{Error, ErrorCode};
pub use iter::IpSetIter;
pub use options::{IpSetOptions, RecordVersion};
pub use radix::RadixTree;
pub use types::{IpCount, IpFamily, IpSet, Ipv6Policy};

use helpers::{canonical, covers_mapped, host_mask, mapped_to_v4, range_to_cidrs, v4_to_mapped};
use iter::to_addr;
use log::{debug, info, trace};
use metrics::counter;
use once_cell::sync::OnceCell;
use std::fs::File;
use std::io::{Read, Write};
use std::net::IpAddr;
use std::ops::ControlFlow;
use std::path::Path;
use types::{with_tree, Ipv4Key, Ipv6Key, Tree};

/// Where a caller's block lands in a set of a given family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Block(u128, u8),
    /// An IPv6 block holding all of IPv4 and more, against an IPv4 set.
    CoversV4,
    /// Not representable in an IPv4 set.
    Outside,
}

fn addr_bits(addr: IpAddr) -> (u128, u8) {
    match addr {
        IpAddr::V4(a) => (u32::from(a) as u128, 32),
        IpAddr::V6(a) => (u128::from(a), 128),
    }
}

/// Two-pointer pass over two ascending, disjoint block lists; `on_overlap`
/// receives the finer block of every overlapping pair and may stop early.
fn overlaps<F>(a: &[(u128, u8)], b: &[(u128, u8)], width: u8, mut on_overlap: F)
where
    F: FnMut(u128, u8) -> ControlFlow<()>,
{
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        let (a_ip, a_p) = a[i];
        let (b_ip, b_p) = b[j];
        let a_end = a_ip | host_mask(a_p, width);
        let b_end = b_ip | host_mask(b_p, width);
        if a_end < b_ip {
            i += 1;
        } else if b_end < a_ip {
            j += 1;
        } else if a_p >= b_p {
            if on_overlap(a_ip, a_p).is_break() {
                return;
            }
            i += 1;
        } else {
            if on_overlap(b_ip, b_p).is_break() {
                return;
            }
            j += 1;
        }
    }
}

impl IpSet {
    fn ensure_logging() {
        telemetry::init();
        static INIT: OnceCell<()> = OnceCell::new();
        INIT.get_or_init(|| {
            // Fallback: simple env_logger with RFC‑3339 ts off.
            let _ = env_logger::builder()
                .format_timestamp(None)
                .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
                .try_init();
        });
    }

    fn from_tree(tree: Tree, options: IpSetOptions) -> Self {
        IpSet {
            tree,
            auto_convert: false,
            options,
        }
    }

    /// Create an empty set of `family`.
    pub fn new(family: IpFamily) -> Self {
        Self::with_options(family, IpSetOptions::default())
    }

    pub fn new_v4() -> Self {
        Self::new(IpFamily::V4)
    }

    pub fn new_v6() -> Self {
        Self::new(IpFamily::V6)
    }

    pub fn with_options(family: IpFamily, options: IpSetOptions) -> Self {
        Self::ensure_logging();
        let tree = match family {
            IpFamily::V4 => Tree::V4(RadixTree::new()),
            IpFamily::V6 => Tree::V6(RadixTree::new()),
        };
        debug!("[CREATE] empty {:?} set", family);
        Self::from_tree(tree, options)
    }

    pub fn family(&self) -> IpFamily {
        match self.tree {
            Tree::V4(_) => IpFamily::V4,
            Tree::V6(_) => IpFamily::V6,
        }
    }

    pub fn is_v6(&self) -> bool {
        self.family() == IpFamily::V6
    }

    pub fn is_empty(&self) -> bool {
        with_tree!(&self.tree, t => t.is_empty())
    }

    /// Whether the set has been modified since it was last cleaned.
    pub fn is_dirty(&self) -> bool {
        with_tree!(&self.tree, t => t.is_dirty())
    }

    /// Whether the set is still backed by a memory-mapped file.
    pub fn is_mapped(&self) -> bool {
        with_tree!(&self.tree, t => t.is_mapped())
    }

    pub fn options(&self) -> &IpSetOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: IpSetOptions) {
        self.options = options;
    }

    pub fn auto_convert_enable(&mut self) {
        self.auto_convert = true;
    }

    pub fn auto_convert_disable(&mut self) {
        self.auto_convert = false;
    }

    pub fn auto_convert_is_enabled(&self) -> bool {
        self.auto_convert
    }

    /// Whether any address lies outside `::ffff:0:0/96`.
    pub fn contains_v6(&self) -> bool {
        match &self.tree {
            Tree::V4(_) => false,
            Tree::V6(t) => t.blocks().any(|(ip, p)| mapped_to_v4(ip, p).is_none()),
        }
    }

    /// Express `addr/prefix` in this set's family.
    fn target(&self, addr: IpAddr, prefix: u8) -> Result<Target, Error> {
        let (ip, width) = addr_bits(addr);
        if prefix > width {
            return Err(Error::Prefix { prefix, max: width });
        }
        let ip = canonical(ip, prefix, width);
        Ok(match (self.family(), width) {
            (IpFamily::V4, 32) | (IpFamily::V6, 128) => Target::Block(ip, prefix),
            (IpFamily::V6, _) => {
                let (ip, prefix) = v4_to_mapped(ip, prefix);
                Target::Block(ip, prefix)
            }
            (IpFamily::V4, _) => match mapped_to_v4(ip, prefix) {
                Some((ip, prefix)) => Target::Block(ip, prefix),
                None if covers_mapped(ip, prefix) => Target::CoversV4,
                None => Target::Outside,
            },
        })
    }

    /// Add the block `addr/prefix`.
    pub fn insert(&mut self, addr: IpAddr, prefix: u8) -> Result<(), Error> {
        counter!("ipset_inserts_total").increment(1);
        trace!("[INSERT] {}/{}", addr, prefix);
        match self.target(addr, prefix)? {
            Target::Block(ip, p) => with_tree!(&mut self.tree, t => t.insert(ip, p)),
            Target::CoversV4 | Target::Outside => {
                if !self.auto_convert {
                    return Err(Error::Ipv6);
                }
                debug!("[INSERT] {}/{} needs IPv6; converting set", addr, prefix);
                self.convert(IpFamily::V6)?;
                self.insert(addr, prefix)
            }
        }
    }

    pub fn insert_net(&mut self, net: &ipnet::IpNet) -> Result<(), Error> {
        self.insert(net.network(), net.prefix_len())
    }

    /// Add every address from `start` through `end` inclusive.
    pub fn insert_range(&mut self, start: IpAddr, end: IpAddr) -> Result<(), Error> {
        let (s, s_width) = addr_bits(start);
        let (e, e_width) = addr_bits(end);
        if s_width != e_width {
            return Err(Error::BadInput("range ends are of different families"));
        }
        if s > e {
            return Err(Error::BadInput("range start is above its end"));
        }
        for (ip, p) in range_to_cidrs(s, e, s_width) {
            self.insert(to_addr(family_of(s_width), ip), p)?;
        }
        Ok(())
    }

    /// Take the block `addr/prefix` out of the set.
    pub fn remove(&mut self, addr: IpAddr, prefix: u8) -> Result<(), Error> {
        counter!("ipset_removes_total").increment(1);
        trace!("[REMOVE] {}/{}", addr, prefix);
        match self.target(addr, prefix)? {
            Target::Block(ip, p) => with_tree!(&mut self.tree, t => t.remove(ip, p)),
            Target::CoversV4 => with_tree!(&mut self.tree, t => t.remove(0, 0)),
            Target::Outside => Ok(()),
        }
    }

    pub fn remove_net(&mut self, net: &ipnet::IpNet) -> Result<(), Error> {
        self.remove(net.network(), net.prefix_len())
    }

    /// Empty the set, keeping its family.
    pub fn remove_all(&mut self) {
        with_tree!(&mut self.tree, t => t.remove_all())
    }

    /// Whether `addr` is in the set.
    pub fn check(&self, addr: IpAddr) -> bool {
        let width = addr_bits(addr).1;
        match self.target(addr, width) {
            Ok(Target::Block(ip, _)) => with_tree!(&self.tree, t => t.contains(ip)),
            _ => false,
        }
    }

    /// Whether every address of `net` is in the set.
    pub fn check_net(&self, net: &ipnet::IpNet) -> bool {
        match self.target(net.network(), net.prefix_len()) {
            Ok(Target::Block(ip, p)) => with_tree!(&self.tree, t => t.contains_block(ip, p)),
            _ => false,
        }
    }

    fn blocks(&self) -> Vec<(u128, u8)> {
        with_tree!(&self.tree, t => t.blocks().collect())
    }

    /// `other`'s blocks expressed in this set's family, ascending. IPv6
    /// blocks an IPv4 set cannot hold are dropped.
    fn foreign_blocks(&self, other: &IpSet) -> Vec<(u128, u8)> {
        match (&self.tree, &other.tree) {
            (Tree::V4(_), Tree::V4(t)) => t.blocks().collect(),
            (Tree::V6(_), Tree::V6(t)) => t.blocks().collect(),
            (Tree::V6(_), Tree::V4(t)) => t.blocks().map(|(ip, p)| v4_to_mapped(ip, p)).collect(),
            (Tree::V4(_), Tree::V6(t)) => t
                .blocks()
                .filter_map(|(ip, p)| {
                    mapped_to_v4(ip, p).or(if covers_mapped(ip, p) { Some((0, 0)) } else { None })
                })
                .collect(),
        }
    }

    fn rebuild(&mut self, blocks: &[(u128, u8)]) -> Result<(), Error> {
        with_tree!(&mut self.tree, t => {
            t.clear();
            for &(ip, p) in blocks {
                t.insert(ip, p)?;
            }
            t.dirty = true;
            Ok(())
        })
    }

    /// Whether the two sets share at least one address.
    pub fn check_intersects(&self, other: &IpSet) -> bool {
        let mine = self.blocks();
        let theirs = self.foreign_blocks(other);
        let mut hit = false;
        overlaps(&mine, &theirs, self.family().bits(), |_, _| {
            hit = true;
            ControlFlow::Break(())
        });
        hit
    }

    /// Add every address of `other`.
    pub fn union(&mut self, other: &IpSet) -> Result<(), Error> {
        if self.family() == IpFamily::V4 && other.contains_v6() {
            debug!("[UNION] other set holds IPv6; converting");
            self.convert(IpFamily::V6)?;
        }
        for (ip, p) in self.foreign_blocks(other) {
            with_tree!(&mut self.tree, t => t.insert(ip, p))?;
        }
        Ok(())
    }

    /// Keep only the addresses also in `other`.
    pub fn intersect(&mut self, other: &IpSet) -> Result<(), Error> {
        let mine = self.blocks();
        let theirs = self.foreign_blocks(other);
        let mut kept = Vec::new();
        overlaps(&mine, &theirs, self.family().bits(), |ip, p| {
            kept.push((ip, p));
            ControlFlow::Continue(())
        });
        debug!("[INTERSECT] {} blocks kept", kept.len());
        self.rebuild(&kept)
    }

    /// Remove every address of `other`.
    pub fn subtract(&mut self, other: &IpSet) -> Result<(), Error> {
        for (ip, p) in self.foreign_blocks(other) {
            with_tree!(&mut self.tree, t => t.remove(ip, p))?;
        }
        Ok(())
    }

    /// Keep one address, the lowest, per occupied `prefix`-sized block.
    pub fn mask(&mut self, prefix: u8) -> Result<(), Error> {
        with_tree!(&mut self.tree, t => t.mask(prefix))
    }

    /// Fill every occupied `prefix`-sized block.
    pub fn mask_and_fill(&mut self, prefix: u8) -> Result<(), Error> {
        with_tree!(&mut self.tree, t => t.mask_and_fill(prefix))
    }

    /// Combine, compact and sort. A no-op on a set that is already clean.
    pub fn clean(&mut self) -> Result<(), Error> {
        if !self.is_dirty() {
            return Ok(());
        }
        with_tree!(&mut self.tree, t => t.clean())
    }

    pub fn count(&self) -> IpCount {
        with_tree!(&self.tree, t => {
            let (exact, overflow) = t.count_exact();
            IpCount {
                exact: if overflow { u64::MAX } else { u64::try_from(exact).unwrap_or(u64::MAX) },
                approx: t.count_approx(),
            }
        })
    }

    /// Exact address count in decimal.
    pub fn count_string(&self) -> String {
        let (exact, overflow) = with_tree!(&self.tree, t => t.count_exact());
        if overflow {
            // 2^128: all of IPv6
            "340282366920938463463374607431768211456".to_string()
        } else {
            exact.to_string()
        }
    }

    /// Change the set's family. Going to IPv4 fails with `Ipv6` when any
    /// address lies outside `::ffff:0:0/96`.
    pub fn convert(&mut self, family: IpFamily) -> Result<(), Error> {
        let tree = match (&self.tree, family) {
            (Tree::V4(_), IpFamily::V4) | (Tree::V6(_), IpFamily::V6) => return Ok(()),
            (Tree::V4(t), IpFamily::V6) => {
                let mut out = RadixTree::<Ipv6Key>::new();
                for (ip, p) in t.blocks() {
                    let (ip, p) = v4_to_mapped(ip, p);
                    out.insert(ip, p)?;
                }
                out.clean()?;
                Tree::V6(out)
            }
            (Tree::V6(t), IpFamily::V4) => {
                let mut out = RadixTree::<Ipv4Key>::new();
                for (ip, p) in t.blocks() {
                    let (ip, p) = mapped_to_v4(ip, p).ok_or(Error::Ipv6)?;
                    out.insert(ip, p)?;
                }
                out.clean()?;
                Tree::V4(out)
            }
        };
        info!("[CONVERT] {:?} -> {:?}", self.family(), family);
        self.tree = tree;
        Ok(())
    }

    /// Lowest and highest address held.
    pub fn range(&self) -> Result<(IpAddr, IpAddr), Error> {
        let family = self.family();
        let (lo, hi) = with_tree!(&self.tree, t => t.range()).ok_or(Error::Empty)?;
        Ok((to_addr(family, lo), to_addr(family, hi)))
    }

    /// Visit blocks (or single addresses) in order until `f` breaks. Works on
    /// a dirty set.
    pub fn walk<F>(&self, cidr_blocks: bool, policy: Ipv6Policy, mut f: F) -> ControlFlow<()>
    where
        F: FnMut(IpAddr, u8) -> ControlFlow<()>,
    {
        let blocks: Box<dyn Iterator<Item = (u128, u8)> + '_> =
            with_tree!(&self.tree, t => Box::new(t.blocks()));
        for (addr, prefix) in IpSetIter::new(blocks, self.family(), cidr_blocks, policy) {
            f(addr, prefix)?;
        }
        ControlFlow::Continue(())
    }

    /// Ordered iterator over a clean set.
    pub fn iter(&self, cidr_blocks: bool, policy: Ipv6Policy) -> Result<IpSetIter<'_>, Error> {
        if self.is_dirty() {
            return Err(Error::RequireClean);
        }
        let blocks: Box<dyn Iterator<Item = (u128, u8)> + '_> =
            with_tree!(&self.tree, t => Box::new(t.leaf_blocks()));
        Ok(IpSetIter::new(blocks, self.family(), cidr_blocks, policy))
    }

    /// Read a set from a stream; the result is owned and clean.
    pub fn read<R: Read>(r: &mut R) -> Result<IpSet, Error> {
        Self::ensure_logging();
        let tree = codec::read_tree(r)?;
        Ok(Self::from_tree(tree, IpSetOptions::default()))
    }

    /// Write with the set's own options, cleaning first when dirty.
    pub fn write<W: Write>(&mut self, w: &mut W) -> Result<(), Error> {
        let options = self.options.clone();
        self.write_with(w, &options)
    }

    pub fn write_with<W: Write>(&mut self, w: &mut W, options: &IpSetOptions) -> Result<(), Error> {
        self.clean()?;
        let ipv4_only = !self.contains_v6();
        let version = options.effective_version(ipv4_only);
        if version == RecordVersion::Legacy && !ipv4_only {
            return Err(Error::Ipv6);
        }
        debug!("[WRITE] {:?} set as {:?}", self.family(), version);
        codec::write_tree(&self.tree, version, w)
    }

    /// Open a set file, mapping it when it is a native radix dump.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<IpSet, Error> {
        Self::load_with(path, &IpSetOptions::default())
    }

    pub fn load_with<P: AsRef<Path>>(path: P, options: &IpSetOptions) -> Result<IpSet, Error> {
        Self::ensure_logging();
        let tree = codec::load_tree(path.as_ref(), options)?;
        Ok(Self::from_tree(tree, options.clone()))
    }

    /// Write the set to `path`, replacing any existing file.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        let mut file = File::create(path).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        self.write(&mut file)?;
        file.sync_all()?;
        info!("[WRITE] saved {}", path.display());
        Ok(())
    }
}

fn family_of(width: u8) -> IpFamily {
    if width == 32 {
        IpFamily::V4
    } else {
        IpFamily::V6
    }
}
