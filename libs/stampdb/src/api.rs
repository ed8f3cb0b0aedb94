use core::fmt;

// on the "#[allow(dead_code)]" directives: these constants define the on-flash
// format, and some are only referenced by one side of the codec (or only by
// tests). It's less confusing to keep the whole format description in one
// place than to scatter the constants to wherever they happen to be consumed.

/// Erase unit of the ring, and the size of one segment.
pub const SEG_BYTES: u32 = 4096;
/// Program unit of the flash, and the size of one block.
pub const PAGE_BYTES: u32 = 256;
pub const PAGES_PER_SEG: u32 = SEG_BYTES / PAGE_BYTES;
/// The last page of a segment is the footer, the rest carry blocks.
pub const DATA_PAGES_PER_SEG: u32 = PAGES_PER_SEG - 1;
/// Sample payload area of a block; the trailing 32 bytes are the header.
pub const PAYLOAD_BYTES: usize = 224;
pub const HEADER_BYTES: usize = 32;

/// 'BLK1', little-endian, at byte 224 of a published page.
pub(crate) const BLOCK_MAGIC: u32 = 0x424C_4B31;
/// 'SFG1', little-endian, at byte 0 of a sealed segment's footer page.
pub(crate) const FOOTER_MAGIC: u32 = 0x5346_4731;

/// Series identifiers are 0..255; one 256-bit presence bitmap per segment.
pub const MAX_SERIES: u16 = 256;
pub(crate) const SERIES_BITMAP_BYTES: usize = 32;

/// Reserved at the top of flash for the metadata sectors (snapshot A,
/// snapshot B, head hint; the remainder of the reservation is unused).
pub const META_RESERVED: u32 = 32768;
#[allow(dead_code)]
pub(crate) const LAYOUT_VERSION: u32 = 1;

/// A block holds at most 74 samples: 74 one-byte deltas plus 74 two-byte
/// quantized values is 222 bytes, the largest multiple that fits in 224.
pub const MAX_ROWS_PER_BLOCK: usize = 74;

/// Result codes shared with the wire protocol. The FIFO bridge on the
/// dual-core firmware forwards these as plain integers, so the discriminants
/// are part of the external interface (0 is implicit success).
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive, num_derive::ToPrimitive)]
pub enum Error {
    /// Bad argument: series out of range, workspace too small, inconsistent
    /// geometry, or a query against a series with no data.
    Inval = 1,
    /// The GC erase quota is exhausted and the engine is non-blocking.
    Busy = 2,
    /// The flash geometry cannot host a single segment.
    NoSpace = 3,
    /// A CRC mismatch was observed on read.
    Crc = 4,
    /// A flash primitive failed.
    Io = 5,
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Inval => write!(f, "invalid argument"),
            Error::Busy => write!(f, "erase quota exhausted"),
            Error::NoSpace => write!(f, "flash too small for one segment"),
            Error::Crc => write!(f, "crc mismatch"),
            Error::Io => write!(f, "flash i/o error"),
        }
    }
}
impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

/// Open-time configuration. All bulk state is carved from the caller's
/// workspace slice; nothing here changes the on-flash format.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Advisory sizing for readers; the iterator always buffers one block.
    pub read_batch_rows: u32,
    /// When non-zero, an open block is force-published once it has been
    /// accumulating for at least this long. 0 means size-only commits.
    pub commit_interval_ms: u32,
    /// When set, a write that would have to wait out the GC erase window
    /// returns [`Error::Busy`] instead of blocking.
    pub non_blocking: bool,
}
impl Default for Config {
    fn default() -> Self { Config { read_batch_rows: 256, commit_interval_ms: 0, non_blocking: false } }
}

/// Lightweight counters for tests and telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Sequence number of the segment currently accepting blocks.
    pub seg_seq_head: u32,
    /// Sequence number of the oldest retained segment.
    pub seg_seq_tail: u32,
    /// Blocks published since open.
    pub blocks_written: u32,
    /// Payload CRC mismatches observed by readers. Never decreases.
    pub crc_errors: u32,
    /// Writes that found less than 10% of the ring free.
    pub gc_warn_events: u32,
    /// Writes that found less than 5% free, or hit the erase quota.
    pub gc_busy_events: u32,
    /// Times recovery dropped a torn tail in the head segment.
    pub recovery_truncations: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::{FromPrimitive, ToPrimitive};

    #[test]
    fn error_codes_match_wire_numbers() {
        // the FIFO bridge depends on these exact values
        assert_eq!(Error::Inval.to_u32(), Some(1));
        assert_eq!(Error::Busy.to_u32(), Some(2));
        assert_eq!(Error::NoSpace.to_u32(), Some(3));
        assert_eq!(Error::Crc.to_u32(), Some(4));
        assert_eq!(Error::Io.to_u32(), Some(5));
        assert_eq!(Error::from_u32(4), Some(Error::Crc));
        assert_eq!(Error::from_u32(0), None);
        assert_eq!(Error::from_u32(6), None);
    }

    #[test]
    fn block_capacity_is_74() {
        // 74 is the largest n with n * (1 + 2) <= 224
        assert!(MAX_ROWS_PER_BLOCK * 3 <= PAYLOAD_BYTES);
        assert!((MAX_ROWS_PER_BLOCK + 1) * 3 > PAYLOAD_BYTES);
    }
}
