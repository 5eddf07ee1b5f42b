use crate::{
    errors::{map_error, set_last_error, ErrorCode},
    Error, IpFamily, IpSet,
};
use ipnet::IpNet;
use std::{
    ffi::CStr,
    net::IpAddr,
    os::raw::c_char,
};

/// Opaque handle – **always** treated as owned by the caller.
pub type IpSetHandle = *mut IpSet;

/// Address count returned by `ipset_count`.
#[repr(C)]
pub struct IpSetCountT {
    /// Exact count, saturating at `UINT64_MAX`.
    pub exact: u64,
    pub approx: f64,
}

// ─────────────────────────── helpers ─────────────────────────────────── //

#[inline]
fn cstr<'a>(p: *const c_char) -> Result<&'a str, ErrorCode> {
    if p.is_null() {
        return Err(ErrorCode::BadInput);
    }
    unsafe { CStr::from_ptr(p) }
        .to_str()
        .map_err(|_| ErrorCode::Utf8Error)
}

/// Accept "addr/prefix" OR a plain address.
#[inline]
fn parse_block(s: &str) -> Result<(IpAddr, u8), ErrorCode> {
    if let Ok(net) = s.parse::<IpNet>() {
        Ok((net.network(), net.prefix_len()))
    } else if let Ok(ip) = s.parse::<IpAddr>() {
        let width = if ip.is_ipv4() { 32 } else { 128 };
        Ok((ip, width))
    } else {
        Err(ErrorCode::BadInput)
    }
}

/// Record `code` as this thread's last error and hand it back.
#[inline]
fn finish(code: ErrorCode) -> ErrorCode {
    set_last_error(code);
    code
}

#[inline]
fn status(r: Result<(), Error>) -> ErrorCode {
    finish(match r {
        Ok(()) => ErrorCode::Success,
        Err(e) => map_error(&e),
    })
}

// ─── small helper to turn Result<T,ErrorCode> into early-return ──────────
macro_rules! try_c { ($expr:expr) => { match $expr {
    Ok(v)  => v,
    Err(e) => return finish(e),
}}}

macro_rules! handle {
    (mut $h:expr) => { match unsafe { $h.as_mut() } {
        Some(s) => s,
        None => return finish(ErrorCode::InvalidHandle),
    }};
    ($h:expr) => { match unsafe { $h.as_ref() } {
        Some(s) => s,
        None => return finish(ErrorCode::InvalidHandle),
    }};
}

fn store(out: *mut IpSetHandle, set: IpSet) -> ErrorCode {
    unsafe { *out = Box::into_raw(Box::new(set)) };
    finish(ErrorCode::Success)
}

// ───────────────────────── lifetime ──────────────────────────────────── //

/// Create an empty set (IPv6 when `ipv6` is true) and store it in `*out`.
#[no_mangle]
pub extern "C" fn ipset_create(ipv6: bool, out: *mut IpSetHandle) -> ErrorCode {
    if out.is_null() {
        return finish(ErrorCode::InvalidHandle);
    }
    let family = if ipv6 { IpFamily::V6 } else { IpFamily::V4 };
    store(out, IpSet::new(family))
}

#[no_mangle]
pub extern "C" fn ipset_destroy(h: IpSetHandle) {
    if !h.is_null() {
        unsafe { drop(Box::from_raw(h)) };
    }
}

/// Load a set file; radix dumps are mapped when possible.
#[no_mangle]
pub extern "C" fn ipset_load(path_utf8: *const c_char, out: *mut IpSetHandle) -> ErrorCode {
    if out.is_null() {
        return finish(ErrorCode::InvalidHandle);
    }
    let path = try_c!(cstr(path_utf8));
    match IpSet::load(path) {
        Ok(set) => store(out, set),
        Err(e) => finish(map_error(&e)),
    }
}

#[no_mangle]
pub extern "C" fn ipset_save(h: IpSetHandle, path_utf8: *const c_char) -> ErrorCode {
    let set = handle!(mut h);
    let path = try_c!(cstr(path_utf8));
    status(set.save(path))
}

// ───────────────────────── content ───────────────────────────────────── //

#[no_mangle]
pub extern "C" fn ipset_insert(h: IpSetHandle, cidr_utf8: *const c_char) -> ErrorCode {
    let set = handle!(mut h);
    let (addr, prefix) = try_c!(cstr(cidr_utf8).and_then(parse_block));
    status(set.insert(addr, prefix))
}

#[no_mangle]
pub extern "C" fn ipset_remove(h: IpSetHandle, cidr_utf8: *const c_char) -> ErrorCode {
    let set = handle!(mut h);
    let (addr, prefix) = try_c!(cstr(cidr_utf8).and_then(parse_block));
    status(set.remove(addr, prefix))
}

/// Store in `*out_found` whether the address is in the set.
#[no_mangle]
pub extern "C" fn ipset_check(
    h: IpSetHandle,
    addr_utf8: *const c_char,
    out_found: *mut bool,
) -> ErrorCode {
    if out_found.is_null() {
        return finish(ErrorCode::BadInput);
    }
    let set = handle!(h);
    let s = try_c!(cstr(addr_utf8));
    let addr: IpAddr = try_c!(s.parse().map_err(|_| ErrorCode::BadInput));
    unsafe { *out_found = set.check(addr) };
    finish(ErrorCode::Success)
}

#[no_mangle]
pub extern "C" fn ipset_clean(h: IpSetHandle) -> ErrorCode {
    let set = handle!(mut h);
    status(set.clean())
}

#[no_mangle]
pub extern "C" fn ipset_count(h: IpSetHandle, out: *mut IpSetCountT) -> ErrorCode {
    if out.is_null() {
        return finish(ErrorCode::BadInput);
    }
    let set = handle!(h);
    let count = set.count();
    unsafe {
        (*out).exact = count.exact;
        (*out).approx = count.approx;
    }
    finish(ErrorCode::Success)
}

// ───────────────────── set algebra ─────────────────────────────────── //

fn pair<'a>(dst: IpSetHandle, src: IpSetHandle) -> Result<(&'a mut IpSet, &'a IpSet), ErrorCode> {
    if dst.is_null() || src.is_null() || dst == src {
        return Err(ErrorCode::InvalidHandle);
    }
    unsafe { Ok((&mut *dst, &*src)) }
}

/// `dst = dst ∪ src`. The handles must differ.
#[no_mangle]
pub extern "C" fn ipset_union(dst: IpSetHandle, src: IpSetHandle) -> ErrorCode {
    let (d, s) = try_c!(pair(dst, src));
    status(d.union(s))
}

#[no_mangle]
pub extern "C" fn ipset_intersect(dst: IpSetHandle, src: IpSetHandle) -> ErrorCode {
    let (d, s) = try_c!(pair(dst, src));
    status(d.intersect(s))
}

#[no_mangle]
pub extern "C" fn ipset_subtract(dst: IpSetHandle, src: IpSetHandle) -> ErrorCode {
    let (d, s) = try_c!(pair(dst, src));
    status(d.subtract(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::get_last_error;
    use std::ffi::CString;
    use std::ptr;

    fn c(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    #[test]
    fn create_insert_check_destroy() {
        let mut h: IpSetHandle = ptr::null_mut();
        assert_eq!(ipset_create(false, &mut h), ErrorCode::Success);
        assert_eq!(ipset_insert(h, c("10.0.0.0/8").as_ptr()), ErrorCode::Success);

        let mut found = false;
        assert_eq!(ipset_check(h, c("10.9.9.9").as_ptr(), &mut found), ErrorCode::Success);
        assert!(found);
        assert_eq!(ipset_check(h, c("11.0.0.0").as_ptr(), &mut found), ErrorCode::Success);
        assert!(!found);

        let mut count = IpSetCountT { exact: 0, approx: 0.0 };
        assert_eq!(ipset_count(h, &mut count), ErrorCode::Success);
        assert_eq!(count.exact, 1 << 24);
        ipset_destroy(h);
    }

    #[test]
    fn errors_are_recorded_per_call() {
        let mut h: IpSetHandle = ptr::null_mut();
        ipset_create(false, &mut h);
        assert_eq!(ipset_insert(h, c("2001:db8::/32").as_ptr()), ErrorCode::Ipv6);
        assert_eq!(get_last_error(), ErrorCode::Ipv6);
        assert_eq!(ipset_insert(h, c("not an address").as_ptr()), ErrorCode::BadInput);
        assert_eq!(ipset_clean(ptr::null_mut()), ErrorCode::InvalidHandle);
        assert_eq!(ipset_clean(h), ErrorCode::Success);
        assert_eq!(get_last_error(), ErrorCode::Success);
        ipset_destroy(h);
    }

    #[test]
    fn algebra_rejects_aliased_handles() {
        let mut a: IpSetHandle = ptr::null_mut();
        let mut b: IpSetHandle = ptr::null_mut();
        ipset_create(false, &mut a);
        ipset_create(false, &mut b);
        ipset_insert(a, c("10.0.0.0/8").as_ptr());
        ipset_insert(b, c("10.1.0.0/16").as_ptr());
        assert_eq!(ipset_union(a, a), ErrorCode::InvalidHandle);
        assert_eq!(ipset_intersect(a, b), ErrorCode::Success);
        let mut count = IpSetCountT { exact: 0, approx: 0.0 };
        ipset_count(a, &mut count);
        assert_eq!(count.exact, 1 << 16);
        assert_eq!(ipset_subtract(a, b), ErrorCode::Success);
        ipset_count(a, &mut count);
        assert_eq!(count.exact, 0);
        ipset_destroy(a);
        ipset_destroy(b);
    }
}
