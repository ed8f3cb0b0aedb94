use crate::api::{
    Error, Result, DATA_PAGES_PER_SEG, MAX_ROWS_PER_BLOCK, PAGE_BYTES, PAYLOAD_BYTES, SEG_BYTES,
};
use crate::backend::{
    align_down, crc32c, decode_payload, sum_deltas, ts_in_range, unpack_header, Platform, RingOs,
};

/// Streaming range query. One block's worth of rows is decoded at a time
/// into the iterator's own staging arrays, so memory use is constant no
/// matter how much of the ring matches. Dropping the iterator ends the
/// query; there is nothing else to release.
///
/// Integrity failures are local: a segment whose page fails its header or
/// payload check is abandoned and iteration continues with the next segment,
/// bumping the engine's `crc_errors` for payload mismatches on the queried
/// series.
pub struct RangeIter<'a, 'ws, P: Platform> {
    os: &'a mut RingOs<'ws, P>,
    series: u16,
    t0: u32,
    t1: u32,
    seg_idx: u32,
    page_in_seg: u32,
    row_idx: usize,
    count_in_block: usize,
    times: [u32; MAX_ROWS_PER_BLOCK],
    values: [f32; MAX_ROWS_PER_BLOCK],
    deltas: [u32; MAX_ROWS_PER_BLOCK],
    qvals: [i16; MAX_ROWS_PER_BLOCK],
}

impl<'a, 'ws, P: Platform> RangeIter<'a, 'ws, P> {
    pub(crate) fn new(os: &'a mut RingOs<'ws, P>, series: u16, t0: u32, t1: u32) -> Self {
        RangeIter {
            os,
            series,
            t0,
            t1,
            seg_idx: 0,
            page_in_seg: 0,
            row_idx: 0,
            count_in_block: 0,
            times: [0; MAX_ROWS_PER_BLOCK],
            values: [0.0; MAX_ROWS_PER_BLOCK],
            deltas: [0; MAX_ROWS_PER_BLOCK],
            qvals: [0; MAX_ROWS_PER_BLOCK],
        }
    }

    fn skip_to_next_seg(&mut self) {
        self.seg_idx += 1;
        self.page_in_seg = 0;
    }

    /// Advance to the next CRC-clean block of the queried series and decode
    /// it. Returns false when the ring is exhausted (or the defensive page
    /// budget ran out).
    fn load_next_block(&mut self, visited: &mut u64, budget: u64) -> bool {
        while self.seg_idx < self.os.seg_count {
            // zone-map skip: segment must exist, hold data, mention the
            // series, and overlap the query window under wrap ordering
            let sm = self.os.segs[self.seg_idx as usize];
            if !sm.valid || sm.block_count == 0 || !sm.series.has(self.series) {
                self.skip_to_next_seg();
                continue;
            }
            let overlap = ts_in_range(sm.t_min, self.t0, self.t1)
                || ts_in_range(sm.t_max, self.t0, self.t1)
                || ts_in_range(self.t0, sm.t_min, sm.t_max);
            if !overlap {
                self.skip_to_next_seg();
                continue;
            }

            while self.page_in_seg < DATA_PAGES_PER_SEG {
                *visited += 1;
                if *visited > budget {
                    log::warn!("query page budget exceeded, ending iteration");
                    return false;
                }
                let addr = sm.addr_first + self.page_in_seg * PAGE_BYTES;
                let page = match self.os.read_page(addr) {
                    Ok(p) => p,
                    Err(_) => break, // abandon this segment
                };
                let hdr: &[u8; 32] = page[PAYLOAD_BYTES..].try_into().unwrap();
                let h = match unpack_header(hdr) {
                    Some(h) => h,
                    None => break, // end of published pages in this segment
                };
                self.page_in_seg += 1;
                if h.series != self.series {
                    continue; // foreign series: skip without paying for the CRC
                }
                let payload: &[u8; PAYLOAD_BYTES] = page[..PAYLOAD_BYTES].try_into().unwrap();
                if crc32c(payload) != h.payload_crc {
                    self.os.crc_errors += 1;
                    log::warn!("payload crc mismatch at {:#x}, abandoning segment", addr);
                    break;
                }
                let count = h.count as usize;
                decode_payload(payload, h.dt_bits, &mut self.deltas, &mut self.qvals, count);
                let mut t = h.t0_ms;
                for i in 0..count {
                    t = t.wrapping_add(self.deltas[i]);
                    self.times[i] = t;
                    self.values[i] = h.bias + h.scale * self.qvals[i] as f32;
                }
                self.count_in_block = count;
                self.row_idx = 0;
                return true;
            }
            self.skip_to_next_seg();
        }
        false
    }
}

impl<P: Platform> Iterator for RangeIter<'_, '_, P> {
    type Item = (u32, f32);

    fn next(&mut self) -> Option<(u32, f32)> {
        // hard cap on pages touched per call, in case corruption produces a
        // zone map that keeps promising blocks that never verify
        let mut visited = 0u64;
        let budget = self.os.seg_count as u64 * DATA_PAGES_PER_SEG as u64 + 1;
        loop {
            if self.row_idx < self.count_in_block {
                let t = self.times[self.row_idx];
                let v = self.values[self.row_idx];
                self.row_idx += 1;
                if !ts_in_range(t, self.t0, self.t1) {
                    continue; // block straddles the window edge
                }
                return Some((t, v));
            }
            if !self.load_next_block(&mut visited, budget) {
                return None;
            }
        }
    }
}

impl<'ws, P: Platform> RingOs<'ws, P> {
    /// Newest row of a series. Segments are visited newest-first by walking
    /// the ring backwards from the head segment (ring position order is
    /// sequence order), pages newest-first within each; the first header
    /// that verifies and matches the series holds the answer.
    pub(crate) fn query_latest(&mut self, series: u16) -> Result<(u32, f32)> {
        let start = align_down(self.head.addr, SEG_BYTES) / SEG_BYTES;
        for back in 0..self.seg_count {
            let idx = ((start + self.seg_count - back) % self.seg_count) as usize;
            let sm = self.segs[idx];
            if !sm.valid || sm.block_count == 0 || !sm.series.has(series) {
                continue;
            }
            for p in (0..DATA_PAGES_PER_SEG).rev() {
                let addr = sm.addr_first + p * PAGE_BYTES;
                let page = match self.read_page(addr) {
                    Ok(page) => page,
                    Err(_) => continue,
                };
                let hdr: &[u8; 32] = page[PAYLOAD_BYTES..].try_into().unwrap();
                let h = match unpack_header(hdr) {
                    Some(h) => h,
                    None => continue,
                };
                if h.series != series {
                    continue;
                }
                let payload: &[u8; PAYLOAD_BYTES] = page[..PAYLOAD_BYTES].try_into().unwrap();
                let ts = h.t0_ms.wrapping_add(sum_deltas(payload, h.dt_bits, h.count));
                let lane = if h.dt_bits == 8 { h.count as usize } else { h.count as usize * 2 };
                let at = lane + (h.count as usize - 1) * 2;
                let q = i16::from_le_bytes([payload[at], payload[at + 1]]);
                return Ok((ts, h.bias + h.scale * q as f32));
            }
        }
        Err(Error::Inval)
    }
}
