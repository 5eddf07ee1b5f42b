//! Ordered iteration over the blocks or addresses of a set.

use crate::helpers::{block_end, covers_mapped, mapped_to_v4, v4_to_mapped};
use crate::types::{IpFamily, Ipv6Policy};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Turn a raw value of `family` into an address.
pub(crate) fn to_addr(family: IpFamily, v: u128) -> IpAddr {
    match family {
        IpFamily::V4 => IpAddr::V4(Ipv4Addr::from(v as u32)),
        IpFamily::V6 => IpAddr::V6(Ipv6Addr::from(v)),
    }
}

/// How a block stored in a `family` set is presented under `policy`;
/// `None` when the policy hides it.
pub(crate) fn present(
    family: IpFamily,
    ip: u128,
    prefix: u8,
    policy: Ipv6Policy,
) -> Option<(IpFamily, u128, u8)> {
    match (family, policy) {
        (IpFamily::V4, Ipv6Policy::Only) => None,
        (IpFamily::V4, Ipv6Policy::Force) => {
            let (ip, prefix) = v4_to_mapped(ip, prefix);
            Some((IpFamily::V6, ip, prefix))
        }
        (IpFamily::V4, _) => Some((IpFamily::V4, ip, prefix)),
        (IpFamily::V6, Ipv6Policy::Ignore) => None,
        (IpFamily::V6, Ipv6Policy::AsV4) => match mapped_to_v4(ip, prefix) {
            Some((ip, prefix)) => Some((IpFamily::V4, ip, prefix)),
            None if covers_mapped(ip, prefix) => Some((IpFamily::V4, 0, 0)),
            None => None,
        },
        (IpFamily::V6, _) => Some((IpFamily::V6, ip, prefix)),
    }
}

/// Iterator returned by [`IpSet::iter`](crate::IpSet::iter).
pub struct IpSetIter<'a> {
    blocks: Box<dyn Iterator<Item = (u128, u8)> + 'a>,
    family: IpFamily,
    policy: Ipv6Policy,
    cidr_blocks: bool,
    /// Address run being expanded: family, next, last.
    run: Option<(IpFamily, u128, u128)>,
}

impl<'a> IpSetIter<'a> {
    pub(crate) fn new(
        blocks: Box<dyn Iterator<Item = (u128, u8)> + 'a>,
        family: IpFamily,
        cidr_blocks: bool,
        policy: Ipv6Policy,
    ) -> Self {
        IpSetIter {
            blocks,
            family,
            policy,
            cidr_blocks,
            run: None,
        }
    }
}

impl Iterator for IpSetIter<'_> {
    /// Address and prefix; the prefix is the full width for single addresses.
    type Item = (IpAddr, u8);

    fn next(&mut self) -> Option<(IpAddr, u8)> {
        loop {
            if let Some((family, cur, last)) = self.run {
                self.run = if cur == last {
                    None
                } else {
                    Some((family, cur + 1, last))
                };
                return Some((to_addr(family, cur), family.bits()));
            }
            let (ip, prefix) = self.blocks.next()?;
            let Some((family, ip, prefix)) = present(self.family, ip, prefix, self.policy) else {
                continue;
            };
            if self.cidr_blocks {
                return Some((to_addr(family, ip), prefix));
            }
            self.run = Some((family, ip, block_end(ip, prefix, family.bits())));
        }
    }
}
