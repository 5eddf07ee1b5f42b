//! Format selection and loading options

use crate::errors::Error;

/// On-disk record layout of an IP set stream.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordVersion {
    /// Per-/24 base address plus 256-bit occupancy bitmap; IPv4 only.
    Legacy = 2,
    /// Node and leaf arrays exactly as held in memory; mappable.
    RadixDump = 3,
    /// Stream of CIDR records and 256-address bitmaps.
    CidrBitmap = 4,
}

impl TryFrom<u16> for RecordVersion {
    type Error = Error;

    fn try_from(v: u16) -> Result<Self, Error> {
        match v {
            2 => Ok(RecordVersion::Legacy),
            3 => Ok(RecordVersion::RadixDump),
            4 => Ok(RecordVersion::CidrBitmap),
            other => Err(Error::FileVersion(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpSetOptions {
    /// Format used by `write`; `None` picks one from the set's content.
    pub record_version: Option<RecordVersion>,
    /// Prefer the legacy layout for IPv4-only content when no version is forced.
    pub prefer_legacy_representation: bool,
    /// Allow `load` to memory-map radix dumps.
    pub allow_mmap: bool,
}

impl Default for IpSetOptions {
    fn default() -> Self {
        IpSetOptions {
            record_version: None,
            prefer_legacy_representation: false,
            allow_mmap: true,
        }
    }
}

impl IpSetOptions {
    pub fn with_record_version(mut self, v: RecordVersion) -> Self {
        self.record_version = Some(v);
        self
    }

    pub fn with_mmap(mut self, allow: bool) -> Self {
        self.allow_mmap = allow;
        self
    }

    /// Format a set is written in, given whether it holds only IPv4 content.
    pub fn effective_version(&self, ipv4_only: bool) -> RecordVersion {
        match self.record_version {
            Some(v) => v,
            None if self.prefer_legacy_representation && ipv4_only => RecordVersion::Legacy,
            None => RecordVersion::RadixDump,
        }
    }
}
