//! Error handling and C-ABI error codes for ipset

use std::cell::RefCell;
use std::os::raw::c_char;
use std::path::PathBuf;

/// Every way an IP set operation can fail.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to allocate memory")]
    Alloc,
    #[error("bad input: {0}")]
    BadInput(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("error opening {}: {source}", path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("stream does not contain an IP set")]
    FileType,
    #[error("IP set record version {0} is not supported")]
    FileVersion(u16),
    #[error("malformed IP set header: {0}")]
    FileHeader(&'static str),
    #[error("IP set data is corrupt: {0}")]
    Corrupt(&'static str),
    #[error("IP set is empty")]
    Empty,
    #[error("prefix {prefix} is out of range (maximum {max})")]
    Prefix { prefix: u8, max: u8 },
    #[error("IP set does not allow IPv6 addresses")]
    Ipv6,
    #[error("operation requires a clean IP set")]
    RequireClean,
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::Alloc
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    Alloc = 1,
    BadInput = 2,
    FileIo = 3,
    FileType = 4,
    FileHeader = 5,
    Empty = 6,
    Open = 7,
    Ipv6 = 8,
    FileVersion = 9,
    Prefix = 10,
    RequireClean = 12,
    Corrupt = 13,
    InvalidHandle = 20,
    Utf8Error = 21,
    Unknown = 255,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Success => "Success",
            ErrorCode::Alloc => "Unable to allocate memory",
            ErrorCode::BadInput => "Empty input value",
            ErrorCode::FileIo => "Error in read/write",
            ErrorCode::FileType => "Input is not an IPset",
            ErrorCode::FileHeader => "Error getting or setting the file header",
            ErrorCode::Empty => "IPset is empty",
            ErrorCode::Open => "Error opening file",
            ErrorCode::Ipv6 => "IPset does not allow IPv6 addresses",
            ErrorCode::FileVersion => "IPset version is not supported",
            ErrorCode::Prefix => "Prefix value is out of range",
            ErrorCode::RequireClean => "Operation requires a clean IPset",
            ErrorCode::Corrupt => "IPset data is corrupt",
            ErrorCode::InvalidHandle => "Invalid handle",
            ErrorCode::Utf8Error => "UTF-8 conversion error",
            ErrorCode::Unknown => "Unknown error",
        }
    }

    fn as_cstr(self) -> &'static [u8] {
        match self {
            ErrorCode::Success => b"Success\0",
            ErrorCode::Alloc => b"Unable to allocate memory\0",
            ErrorCode::BadInput => b"Empty input value\0",
            ErrorCode::FileIo => b"Error in read/write\0",
            ErrorCode::FileType => b"Input is not an IPset\0",
            ErrorCode::FileHeader => b"Error getting or setting the file header\0",
            ErrorCode::Empty => b"IPset is empty\0",
            ErrorCode::Open => b"Error opening file\0",
            ErrorCode::Ipv6 => b"IPset does not allow IPv6 addresses\0",
            ErrorCode::FileVersion => b"IPset version is not supported\0",
            ErrorCode::Prefix => b"Prefix value is out of range\0",
            ErrorCode::RequireClean => b"Operation requires a clean IPset\0",
            ErrorCode::Corrupt => b"IPset data is corrupt\0",
            ErrorCode::InvalidHandle => b"Invalid handle\0",
            ErrorCode::Utf8Error => b"UTF-8 conversion error\0",
            ErrorCode::Unknown => b"Unknown error\0",
        }
    }
}

// Thread-local last error for C-ABI
thread_local! {
    static LAST_ERROR: RefCell<ErrorCode> = const { RefCell::new(ErrorCode::Success) };
}

pub fn set_last_error(code: ErrorCode) {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = code);
}

pub fn get_last_error() -> ErrorCode {
    LAST_ERROR.with(|cell| *cell.borrow())
}

#[no_mangle]
pub extern "C" fn ipset_last_error() -> ErrorCode {
    get_last_error()
}

#[no_mangle]
pub extern "C" fn ipset_strerror(code: ErrorCode) -> *const c_char {
    code.as_cstr().as_ptr() as *const c_char
}

// Map internal Error to ErrorCode
pub fn map_error(e: &Error) -> ErrorCode {
    match e {
        Error::Alloc => ErrorCode::Alloc,
        Error::BadInput(_) => ErrorCode::BadInput,
        Error::Io(_) => ErrorCode::FileIo,
        Error::Open { .. } => ErrorCode::Open,
        Error::FileType => ErrorCode::FileType,
        Error::FileVersion(_) => ErrorCode::FileVersion,
        Error::FileHeader(_) => ErrorCode::FileHeader,
        Error::Corrupt(_) => ErrorCode::Corrupt,
        Error::Empty => ErrorCode::Empty,
        Error::Prefix { .. } => ErrorCode::Prefix,
        Error::Ipv6 => ErrorCode::Ipv6,
        Error::RequireClean => ErrorCode::RequireClean,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    #[test]
    fn strerror_is_nul_terminated() {
        let msg = unsafe { CStr::from_ptr(ipset_strerror(ErrorCode::Corrupt)) };
        assert_eq!(msg.to_str().unwrap(), ErrorCode::Corrupt.as_str());
    }

    #[test]
    fn last_error_is_per_thread() {
        set_last_error(ErrorCode::Ipv6);
        let other = std::thread::spawn(get_last_error).join().unwrap();
        assert_eq!(other, ErrorCode::Success);
        assert_eq!(get_last_error(), ErrorCode::Ipv6);
    }

    #[test]
    fn io_errors_map_to_file_io() {
        let e: Error = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short").into();
        assert_eq!(map_error(&e), ErrorCode::FileIo);
    }
}
