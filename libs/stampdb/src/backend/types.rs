use crate::api::{Error, Result, PAYLOAD_BYTES, SERIES_BITMAP_BYTES};
use crate::backend::{crc32c, unpack_header};

/// Modular ordering for u32 millisecond timestamps: `a <= b` iff the forward
/// distance from `a` to `b` is less than half the range. Timestamps wrap
/// roughly every 49.7 days, and every comparison in the engine goes through
/// these two helpers; plain integer comparison is wrong near the wrap point.
#[inline]
pub(crate) fn ts_le(a: u32, b: u32) -> bool { b.wrapping_sub(a) < 0x8000_0000 }

/// Closed-interval membership under modular ordering. A window with
/// `t0 > t1` wraps and contains `t >= t0 or t <= t1`.
pub(crate) fn ts_in_range(t: u32, t0: u32, t1: u32) -> bool {
    if ts_le(t0, t1) { ts_le(t0, t) && ts_le(t, t1) } else { ts_le(t0, t) || ts_le(t, t1) }
}

/// 256-bit series presence map, one bit per series id.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct SeriesBitmap(pub(crate) [u8; SERIES_BITMAP_BYTES]);
impl SeriesBitmap {
    pub(crate) const EMPTY: SeriesBitmap = SeriesBitmap([0u8; SERIES_BITMAP_BYTES]);

    pub(crate) fn set(&mut self, series: u16) { self.0[(series >> 3) as usize] |= 1 << (series & 7); }

    pub(crate) fn has(&self, series: u16) -> bool {
        self.0[(series >> 3) as usize] & (1 << (series & 7)) != 0
    }
}

/// Parsed block header. The on-page layout is fixed (see `codec`); this is
/// the in-RAM form used by the writer, the iterator and recovery.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct BlockHeader {
    pub series: u16,
    pub count: u16,
    pub t0_ms: u32,
    pub dt_bits: u8,
    pub bias: f32,
    pub scale: f32,
    pub payload_crc: u32,
}

/// Where the next page goes: absolute address, page slot within the current
/// segment, and the segment's sequence number.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RingHead {
    pub addr: u32,
    pub page_index: u32,
    pub seg_seqno: u32,
}

/// RAM-only summary of one segment, mirroring the footer fields. Rebuilt on
/// open from surviving footers (plus a page scan of the head segment) and
/// kept current by the publish path. Queries consult only this array to
/// decide which segments to read.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SegSummary {
    pub addr_first: u32,
    pub seg_seqno: u32,
    pub t_min: u32,
    pub t_max: u32,
    pub block_count: u32,
    pub series: SeriesBitmap,
    pub valid: bool,
}
impl SegSummary {
    pub(crate) const EMPTY: SegSummary = SegSummary {
        addr_first: 0,
        seg_seqno: 0,
        t_min: 0,
        t_max: 0,
        block_count: 0,
        series: SeriesBitmap::EMPTY,
        valid: false,
    };

    /// Fold one published block into the summary. `block_count == 0` doubles
    /// as the "no data yet" sentinel, so the first block seeds the window.
    pub(crate) fn note_block(&mut self, series: u16, t_first: u32, t_last: u32) {
        if self.block_count == 0 {
            self.t_min = t_first;
            self.t_max = t_last;
        } else {
            if ts_le(t_first, self.t_min) {
                self.t_min = t_first;
            }
            if ts_le(self.t_max, t_last) {
                self.t_max = t_last;
            }
        }
        self.block_count += 1;
        self.series.set(series);
    }
}

/// Classification of a raw page image. Computed, never stored: a page with a
/// CRC-clean header and matching payload CRC is a published block, an
/// all-0xFF page is erased, and anything else is a torn or corrupted write
/// that recovery and iteration must treat as "no block".
pub(crate) enum PageStatus {
    Empty,
    Valid(BlockHeader),
    Invalid,
}

pub(crate) fn classify_page(page: &[u8; 256]) -> PageStatus {
    if page.iter().all(|&b| b == 0xFF) {
        return PageStatus::Empty;
    }
    let (payload, header) = page.split_at(PAYLOAD_BYTES);
    match unpack_header(header.try_into().unwrap()) {
        Some(h) if crc32c(payload) == h.payload_crc => PageStatus::Valid(h),
        _ => PageStatus::Invalid,
    }
}

/// Bulk state carved out of the caller's workspace at open. The engine
/// allocates nothing after this; the zone map is sized to the segment count
/// and the staging arrays to the largest block.
pub(crate) struct Workspace<'ws> {
    pub segs: &'ws mut [SegSummary],
    pub deltas: &'ws mut [u32],
    pub qvals: &'ws mut [i16],
    pub vals: &'ws mut [f32],
}

/// Split a typed array off the front of the byte slice, aligning as needed
/// and writing `init` into every slot before the typed view exists.
fn take_array<'a, T: Copy>(rest: &mut &'a mut [u8], n: usize, init: T) -> Result<&'a mut [T]> {
    let buf = core::mem::take(rest);
    let off = buf.as_ptr().align_offset(core::mem::align_of::<T>());
    let need = off + n * core::mem::size_of::<T>();
    if buf.len() < need {
        return Err(Error::Inval);
    }
    let (chunk, remainder) = buf.split_at_mut(need);
    *rest = remainder;
    let ptr = unsafe { chunk.as_mut_ptr().add(off) }.cast::<T>();
    for i in 0..n {
        // safety: `chunk` is exclusively borrowed for 'a and large enough by
        // the check above; write() initializes each slot before the slice is
        // formed, so no invalid T is ever read
        unsafe { ptr.add(i).write(init) };
    }
    Ok(unsafe { core::slice::from_raw_parts_mut(ptr, n) })
}

pub(crate) fn carve_workspace(workspace: &mut [u8], seg_count: usize) -> Result<Workspace<'_>> {
    use crate::api::MAX_ROWS_PER_BLOCK;
    let mut rest = workspace;
    let segs = take_array(&mut rest, seg_count, SegSummary::EMPTY)?;
    let deltas = take_array(&mut rest, MAX_ROWS_PER_BLOCK, 0u32)?;
    let qvals = take_array(&mut rest, MAX_ROWS_PER_BLOCK, 0i16)?;
    let vals = take_array(&mut rest, MAX_ROWS_PER_BLOCK, 0f32)?;
    Ok(Workspace { segs, deltas, qvals, vals })
}
