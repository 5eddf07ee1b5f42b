use std::net::IpAddr;
use std::ops::ControlFlow;

use ipset_core::{Error, IpFamily, IpSet, Ipv6Policy};
use proptest::collection::vec as pvec;
use proptest::prelude::*;

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn set_of(blocks: &[(&str, u8)]) -> IpSet {
    let mut set = IpSet::new_v4();
    for &(a, p) in blocks {
        set.insert(ip(a), p).unwrap();
    }
    set
}

fn cidrs(set: &mut IpSet) -> Vec<(IpAddr, u8)> {
    set.clean().unwrap();
    set.iter(true, Ipv6Policy::Mix).unwrap().collect()
}

/// Sample set shared by the mask tests.
fn mask_sample() -> IpSet {
    set_of(&[
        ("10.0.0.23", 32),
        ("10.0.1.0", 24),
        ("10.7.1.0", 24),
        ("20.20.0.243", 32),
        ("32.32.0.0", 15),
    ])
}

#[test]
fn insert_check_remove() {
    let mut set = IpSet::new_v4();
    assert!(set.is_empty());
    set.insert(ip("192.168.0.1"), 32).unwrap();
    assert!(set.check(ip("192.168.0.1")));
    assert!(!set.check(ip("192.168.0.2")));
    set.remove(ip("192.168.0.1"), 32).unwrap();
    assert!(!set.check(ip("192.168.0.1")));
    assert!(set.is_empty());
}

#[test]
fn prefix_out_of_range_is_rejected() {
    let mut set = IpSet::new_v4();
    assert!(matches!(
        set.insert(ip("10.0.0.0"), 33),
        Err(Error::Prefix { prefix: 33, max: 32 })
    ));
    let mut set6 = IpSet::new_v6();
    assert!(matches!(
        set6.insert(ip("10.0.0.0"), 40),
        Err(Error::Prefix { .. })
    ));
    assert!(set6.insert(ip("2001:db8::"), 128).is_ok());
}

#[test]
fn host_bits_are_ignored_on_insert() {
    let mut set = set_of(&[("10.1.2.3", 8)]);
    assert_eq!(cidrs(&mut set), vec![(ip("10.0.0.0"), 8)]);
}

#[test]
fn counts_and_count_strings() {
    let mut set = set_of(&[("10.0.0.0", 24), ("10.0.1.0", 24)]);
    set.clean().unwrap();
    assert_eq!(set.count().exact, 512);
    assert_eq!(set.count().approx, 512.0);
    assert_eq!(set.count_string(), "512");

    let mut all6 = IpSet::new_v6();
    all6.insert(ip("::"), 0).unwrap();
    assert_eq!(all6.count().exact, u64::MAX);
    assert_eq!(all6.count_string(), "340282366920938463463374607431768211456");

    let mut half6 = IpSet::new_v6();
    half6.insert(ip("::"), 1).unwrap();
    assert_eq!(half6.count_string(), "170141183460469231731687303715884105728");
}

#[test]
fn range_of_empty_set_is_an_error() {
    let set = IpSet::new_v6();
    assert!(matches!(set.range(), Err(Error::Empty)));
    let set = set_of(&[("10.0.0.5", 32), ("172.16.0.0", 12)]);
    assert_eq!(
        set.range().unwrap(),
        (ip("10.0.0.5"), ip("172.31.255.255"))
    );
}

#[test]
fn insert_range_decomposes_into_cidrs() {
    let mut set = IpSet::new_v4();
    set.insert_range(ip("10.0.0.1"), ip("10.0.0.6")).unwrap();
    assert_eq!(set.count().exact, 6);
    assert_eq!(
        cidrs(&mut set),
        vec![
            (ip("10.0.0.1"), 32),
            (ip("10.0.0.2"), 31),
            (ip("10.0.0.4"), 31),
            (ip("10.0.0.6"), 32),
        ]
    );
    assert!(matches!(
        set.insert_range(ip("10.0.0.9"), ip("10.0.0.1")),
        Err(Error::BadInput(_))
    ));
    assert!(matches!(
        set.insert_range(ip("10.0.0.1"), ip("::1")),
        Err(Error::BadInput(_))
    ));
}

#[test]
fn ipnet_helpers() {
    let net: ipnet::IpNet = "10.8.0.0/13".parse().unwrap();
    let mut set = IpSet::new_v4();
    set.insert_net(&net).unwrap();
    assert!(set.check_net(&"10.9.0.0/16".parse().unwrap()));
    assert!(!set.check_net(&"10.0.0.0/8".parse().unwrap()));
    set.remove_net(&"10.9.0.0/16".parse().unwrap()).unwrap();
    assert!(!set.check(ip("10.9.1.1")));
    assert!(set.check(ip("10.10.1.1")));
}

#[test]
fn iteration_requires_a_clean_set() {
    let mut set = set_of(&[("10.0.0.0", 8)]);
    assert!(set.is_dirty());
    assert!(matches!(set.iter(true, Ipv6Policy::Mix), Err(Error::RequireClean)));
    // walk does not care
    let mut n = 0;
    let _ = set.walk(true, Ipv6Policy::Mix, |_, _| {
        n += 1;
        ControlFlow::Continue(())
    });
    assert_eq!(n, 1);
    set.clean().unwrap();
    assert!(set.iter(true, Ipv6Policy::Mix).is_ok());
}

#[test]
fn iteration_is_ordered_and_expands_addresses() {
    let mut set = set_of(&[("10.0.0.8", 30), ("9.255.255.255", 32), ("10.0.0.0", 31)]);
    set.clean().unwrap();
    let addrs: Vec<IpAddr> = set
        .iter(false, Ipv6Policy::Mix)
        .unwrap()
        .map(|(a, p)| {
            assert_eq!(p, 32);
            a
        })
        .collect();
    assert_eq!(
        addrs,
        ["9.255.255.255", "10.0.0.0", "10.0.0.1", "10.0.0.8", "10.0.0.9", "10.0.0.10", "10.0.0.11"]
            .iter()
            .map(|s| ip(s))
            .collect::<Vec<_>>()
    );
}

#[test]
fn ipv6_policies_on_a_mixed_set() {
    let mut set = IpSet::new_v6();
    set.insert(ip("10.0.0.0"), 8).unwrap();
    set.insert(ip("2001:db8::"), 32).unwrap();
    set.clean().unwrap();
    let with = |policy| set.iter(true, policy).unwrap().collect::<Vec<_>>();
    assert_eq!(
        with(Ipv6Policy::Mix),
        vec![(ip("::ffff:10.0.0.0"), 104), (ip("2001:db8::"), 32)]
    );
    assert_eq!(with(Ipv6Policy::AsV4), vec![(ip("10.0.0.0"), 8)]);
    assert!(with(Ipv6Policy::Ignore).is_empty());
    assert_eq!(with(Ipv6Policy::Only).len(), 2);

    let mut v4 = set_of(&[("10.0.0.0", 8)]);
    v4.clean().unwrap();
    assert_eq!(
        v4.iter(true, Ipv6Policy::Force).unwrap().collect::<Vec<_>>(),
        vec![(ip("::ffff:10.0.0.0"), 104)]
    );
    assert!(v4.iter(true, Ipv6Policy::Only).unwrap().next().is_none());
}

#[test]
fn conversion_round_trip() {
    let mut set = set_of(&[("10.0.0.0", 8), ("192.168.3.4", 32)]);
    let before = cidrs(&mut set);
    set.convert(IpFamily::V6).unwrap();
    assert!(set.is_v6());
    assert!(!set.contains_v6());
    assert!(set.check(ip("::ffff:192.168.3.4")));
    set.convert(IpFamily::V4).unwrap();
    assert_eq!(set.family(), IpFamily::V4);
    assert_eq!(cidrs(&mut set), before);
}

#[test]
fn conversion_to_ipv4_refuses_real_ipv6() {
    let mut set = IpSet::new_v6();
    set.insert(ip("10.0.0.0"), 8).unwrap();
    set.insert(ip("2001:db8::1"), 128).unwrap();
    assert!(set.contains_v6());
    assert!(matches!(set.convert(IpFamily::V4), Err(Error::Ipv6)));
    assert!(set.is_v6());
}

#[test]
fn auto_convert_upgrades_on_ipv6_insert() {
    let mut set = set_of(&[("10.0.0.0", 8)]);
    assert!(!set.auto_convert_is_enabled());
    assert!(matches!(set.insert(ip("2001:db8::"), 32), Err(Error::Ipv6)));
    set.auto_convert_enable();
    set.insert(ip("2001:db8::"), 32).unwrap();
    assert!(set.is_v6());
    assert!(set.check(ip("10.1.1.1")));
    set.auto_convert_disable();
    assert!(!set.auto_convert_is_enabled());
}

#[test]
fn union_intersect_subtract() {
    let mut a = set_of(&[("10.0.0.0", 16), ("192.168.0.0", 24)]);
    let b = set_of(&[("10.0.128.0", 17), ("10.1.0.0", 16), ("172.16.0.0", 12)]);

    let mut u = a.clone();
    u.union(&b).unwrap();
    assert_eq!(
        cidrs(&mut u),
        vec![
            (ip("10.0.0.0"), 15),
            (ip("172.16.0.0"), 12),
            (ip("192.168.0.0"), 24)
        ]
    );

    let mut i = a.clone();
    i.intersect(&b).unwrap();
    assert_eq!(cidrs(&mut i), vec![(ip("10.0.128.0"), 17)]);

    a.subtract(&b).unwrap();
    assert_eq!(
        cidrs(&mut a),
        vec![(ip("10.0.0.0"), 17), (ip("192.168.0.0"), 24)]
    );
}

#[test]
fn intersects_check() {
    let a = set_of(&[("10.0.0.0", 8)]);
    let b = set_of(&[("11.0.0.0", 8), ("10.200.3.4", 32)]);
    let c = set_of(&[("11.0.0.0", 8)]);
    assert!(a.check_intersects(&b));
    assert!(!a.check_intersects(&c));
    assert!(!a.check_intersects(&IpSet::new_v4()));
}

#[test]
fn self_algebra_laws() {
    let a = set_of(&[("10.0.0.0", 12), ("10.99.0.3", 32), ("200.0.0.0", 7)]);
    let mut a_clean = a.clone();
    let expected = cidrs(&mut a_clean);

    let mut i = a.clone();
    i.intersect(&a).unwrap();
    assert_eq!(cidrs(&mut i), expected);

    let mut s = a.clone();
    s.subtract(&a).unwrap();
    assert!(s.is_empty());
}

#[test]
fn mixed_family_algebra() {
    let mut v4 = set_of(&[("10.0.0.0", 8)]);
    let mut v6 = IpSet::new_v6();
    v6.insert(ip("10.1.0.0"), 16).unwrap();
    v6.insert(ip("2001:db8::"), 32).unwrap();

    // Only the mapped part can meet an IPv4 set.
    let mut i = v4.clone();
    i.intersect(&v6).unwrap();
    assert_eq!(i.family(), IpFamily::V4);
    assert_eq!(cidrs(&mut i), vec![(ip("10.1.0.0"), 16)]);

    let mut s = v4.clone();
    s.subtract(&v6).unwrap();
    assert!(!s.check(ip("10.1.2.3")));
    assert!(s.check(ip("10.2.0.0")));

    // A union with real IPv6 content upgrades the set.
    v4.union(&v6).unwrap();
    assert!(v4.is_v6());
    assert!(v4.check(ip("2001:db8::5")));
    assert!(v4.check(ip("10.250.0.1")));
}

#[test]
fn ipv6_sets_combine_with_each_other() {
    let mut a = IpSet::new_v6();
    a.insert(ip("2001:db8::"), 32).unwrap();
    a.insert(ip("fe80::"), 10).unwrap();
    let mut b = IpSet::new_v6();
    b.insert(ip("2001:db8:8000::"), 33).unwrap();
    b.insert(ip("2001:db9::"), 32).unwrap();

    let mut u = a.clone();
    u.union(&b).unwrap();
    assert_eq!(
        cidrs(&mut u),
        vec![(ip("2001:db8::"), 31), (ip("fe80::"), 10)]
    );

    let mut i = a.clone();
    i.intersect(&b).unwrap();
    assert!(i.is_v6());
    assert_eq!(cidrs(&mut i), vec![(ip("2001:db8:8000::"), 33)]);
    assert!(a.check_intersects(&b));

    a.subtract(&b).unwrap();
    assert_eq!(
        cidrs(&mut a),
        vec![(ip("2001:db8::"), 33), (ip("fe80::"), 10)]
    );
}

#[test]
fn mask_keeps_first_address_of_each_block() {
    let mut set = mask_sample();
    set.mask(16).unwrap();
    assert_eq!(
        cidrs(&mut set),
        vec![
            (ip("10.0.0.0"), 32),
            (ip("10.7.0.0"), 32),
            (ip("20.20.0.0"), 32),
            (ip("32.32.0.0"), 32),
            (ip("32.33.0.0"), 32),
        ]
    );
}

#[test]
fn mask_and_fill_populates_each_block() {
    let mut set = mask_sample();
    set.mask_and_fill(16).unwrap();
    assert_eq!(
        cidrs(&mut set),
        vec![
            (ip("10.0.0.0"), 16),
            (ip("10.7.0.0"), 16),
            (ip("20.20.0.0"), 16),
            (ip("32.32.0.0"), 15),
        ]
    );
}

#[test]
fn mask_rejects_bad_prefixes() {
    let mut set = mask_sample();
    assert!(matches!(set.mask(0), Err(Error::Prefix { .. })));
    assert!(matches!(set.mask_and_fill(33), Err(Error::Prefix { .. })));
}

#[test]
fn remove_all_keeps_family() {
    let mut set = IpSet::new_v6();
    set.insert(ip("2001:db8::"), 48).unwrap();
    set.remove_all();
    assert!(set.is_empty());
    assert!(set.is_v6());
}

fn v4_blocks() -> impl Strategy<Value = Vec<(u32, u8)>> {
    pvec((any::<u32>(), 4u8..=32), 0..12)
}

fn build(blocks: &[(u32, u8)]) -> IpSet {
    let mut set = IpSet::new_v4();
    for &(a, p) in blocks {
        set.insert(IpAddr::from(a.to_be_bytes()), p).unwrap();
    }
    set
}

fn sample_points(a: &[(u32, u8)], b: &[(u32, u8)]) -> Vec<IpAddr> {
    a.iter()
        .chain(b)
        .flat_map(|&(ip, p)| {
            let host = if p == 0 { u32::MAX } else { ((1u64 << (32 - p)) - 1) as u32 };
            let s = ip & !host;
            let e = s | host;
            [s, e, s.wrapping_sub(1), e.wrapping_add(1)]
        })
        .map(|x| IpAddr::from(x.to_be_bytes()))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn property_union_is_membership_or(a in v4_blocks(), b in v4_blocks()) {
        let (sa, sb) = (build(&a), build(&b));
        let mut u = sa.clone();
        u.union(&sb).unwrap();
        for x in sample_points(&a, &b) {
            prop_assert_eq!(u.check(x), sa.check(x) || sb.check(x));
        }
    }

    #[test]
    fn property_intersect_is_membership_and(a in v4_blocks(), b in v4_blocks()) {
        let (sa, sb) = (build(&a), build(&b));
        let mut i = sa.clone();
        i.intersect(&sb).unwrap();
        for x in sample_points(&a, &b) {
            prop_assert_eq!(i.check(x), sa.check(x) && sb.check(x));
        }
        prop_assert_eq!(sa.check_intersects(&sb), !i.is_empty());
    }

    #[test]
    fn property_subtract_is_membership_and_not(a in v4_blocks(), b in v4_blocks()) {
        let (sa, sb) = (build(&a), build(&b));
        let mut d = sa.clone();
        d.subtract(&sb).unwrap();
        for x in sample_points(&a, &b) {
            prop_assert_eq!(d.check(x), sa.check(x) && !sb.check(x));
        }
    }

    #[test]
    fn property_union_then_intersect_gives_b(a in v4_blocks(), b in v4_blocks()) {
        let (sa, sb) = (build(&a), build(&b));
        let mut u = sa.clone();
        u.union(&sb).unwrap();
        u.intersect(&sb).unwrap();
        let mut expect = sb.clone();
        prop_assert_eq!(cidrs(&mut u), cidrs(&mut expect));
    }

    #[test]
    fn property_mask_laws(a in v4_blocks(), p in 8u8..=28) {
        let set = build(&a);
        let before = set.count().exact;

        let mut masked = set.clone();
        masked.mask(p).unwrap();
        let mut filled = set.clone();
        filled.mask_and_fill(p).unwrap();

        prop_assert!(masked.count().exact <= before);
        prop_assert!(filled.count().exact >= before);
        // One masked address per occupied p-block, each of which is now full.
        let per_block = 1u64 << (32 - p);
        prop_assert_eq!(masked.count().exact * per_block, filled.count().exact);

        // Every occupied p-block is full after the fill.
        let mut f = filled.clone();
        for (addr, prefix) in cidrs(&mut f) {
            prop_assert!(prefix <= p, "{}/{} finer than /{}", addr, prefix, p);
        }
    }
}
