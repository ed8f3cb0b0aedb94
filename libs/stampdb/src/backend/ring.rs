use crate::api::{
    Error, Result, DATA_PAGES_PER_SEG, FOOTER_MAGIC, HEADER_BYTES, PAGES_PER_SEG, PAGE_BYTES,
    PAYLOAD_BYTES, SEG_BYTES,
};
use crate::backend::{
    align_down, classify_page, crc32c, meta, pack_header, sum_deltas, BlockHeader, PageStatus,
    Platform, RingHead, SegSummary, SeriesBitmap, Snapshot,
};

/// How many segments the GC may erase per rolling one-second window. NOR
/// sector erases stall the part for tens of milliseconds; the quota keeps a
/// reclamation burst from starving the writer for a whole second.
const GC_MAX_ERASES_PER_WINDOW: u32 = 2;
const GC_WINDOW_MS: u64 = 1000;

/// Publish the head hint after this many blocks, or after this much time,
/// whichever comes first.
const HINT_BLOCK_CADENCE: u32 = 64;
const HINT_MS_CADENCE: u64 = 2000;

/// The storage layer: owns the platform, the zone map and the ring cursors.
/// Everything that touches flash goes through here; the facade in `lib.rs`
/// only stages samples and decides when a block is complete.
pub(crate) struct RingOs<'ws, P: Platform> {
    pf: P,
    pub(crate) segs: &'ws mut [SegSummary],
    pub(crate) seg_count: u32,
    pub(crate) head: RingHead,
    pub(crate) tail_seqno: u32,
    pub(crate) epoch_id: u32,
    pub(crate) blocks_written: u32,
    pub(crate) crc_errors: u32,
    pub(crate) gc_warn_events: u32,
    pub(crate) gc_busy_events: u32,
    pub(crate) recovery_truncations: u32,
    non_blocking: bool,
    last_hint_ms: u64,
    gc_window_start_ms: u64,
    gc_erased_in_window: u32,
}

impl<'ws, P: Platform> RingOs<'ws, P> {
    pub(crate) fn new(pf: P, segs: &'ws mut [SegSummary], seg_count: u32, non_blocking: bool) -> Self {
        debug_assert_eq!(segs.len(), seg_count as usize);
        RingOs {
            pf,
            segs,
            seg_count,
            head: RingHead { addr: 0, page_index: 0, seg_seqno: 1 },
            tail_seqno: 1,
            epoch_id: 0,
            blocks_written: 0,
            crc_errors: 0,
            gc_warn_events: 0,
            gc_busy_events: 0,
            recovery_truncations: 0,
            non_blocking,
            last_hint_ms: 0,
            gc_window_start_ms: 0,
            gc_erased_in_window: 0,
        }
    }

    pub(crate) fn millis(&self) -> u64 { self.pf.millis() }

    fn ring_bytes(&self) -> u32 { self.seg_count * SEG_BYTES }

    pub(crate) fn read_page(&mut self, addr: u32) -> Result<[u8; 256]> {
        let mut page = [0u8; PAGE_BYTES as usize];
        self.pf.flash_read(addr, &mut page)?;
        Ok(page)
    }

    // --- footer I/O ---------------------------------------------------------
    // Footer layout (LE): magic @0, seg_seqno @4, t_min @8, t_max @12,
    // block_count @16, series bitmap @20..52, crc over bytes 0..51 @52.

    fn read_footer(&mut self, seg_base: u32) -> Option<SegSummary> {
        let page = self.read_page(seg_base + (PAGES_PER_SEG - 1) * PAGE_BYTES).ok()?;
        let rd = |at: usize| u32::from_le_bytes(page[at..at + 4].try_into().unwrap());
        if rd(0) != FOOTER_MAGIC {
            return None;
        }
        if rd(52) != crc32c(&page[..52]) {
            return None;
        }
        Some(SegSummary {
            addr_first: seg_base,
            seg_seqno: rd(4),
            t_min: rd(8),
            t_max: rd(12),
            block_count: rd(16),
            series: SeriesBitmap(page[20..52].try_into().unwrap()),
            valid: true,
        })
    }

    fn write_footer(&mut self, seg_base: u32, sm: &SegSummary) -> Result<()> {
        let mut page = [0xFFu8; PAGE_BYTES as usize];
        page[0..4].copy_from_slice(&FOOTER_MAGIC.to_le_bytes());
        page[4..8].copy_from_slice(&sm.seg_seqno.to_le_bytes());
        page[8..12].copy_from_slice(&sm.t_min.to_le_bytes());
        page[12..16].copy_from_slice(&sm.t_max.to_le_bytes());
        page[16..20].copy_from_slice(&sm.block_count.to_le_bytes());
        page[20..52].copy_from_slice(&sm.series.0);
        let crc = crc32c(&page[..52]);
        page[52..56].copy_from_slice(&crc.to_le_bytes());
        self.pf.flash_program_256(seg_base + (PAGES_PER_SEG - 1) * PAGE_BYTES, &page)
    }

    // --- publish ------------------------------------------------------------

    /// Put one block on flash with the header-last ordering that makes the
    /// commit atomic under power cuts:
    ///   1) program the payload with the header area left erased
    ///   2) program the header with the payload area left erased (the NOR
    ///      AND overlay completes the page without disturbing the payload)
    ///   3) fold the block into the zone map
    /// A crash between or during the programs leaves a page whose header
    /// does not verify, which every reader treats as "no block".
    pub(crate) fn publish_block(&mut self, h: &BlockHeader, payload: &[u8; PAYLOAD_BYTES]) -> Result<()> {
        let page_addr = self.head.addr;
        let mut image = [0xFFu8; PAGE_BYTES as usize];
        image[..PAYLOAD_BYTES].copy_from_slice(payload);
        self.pf.flash_program_256(page_addr, &image)?;

        let mut hdr = [0u8; HEADER_BYTES];
        pack_header(&mut hdr, h);
        image = [0xFFu8; PAGE_BYTES as usize];
        image[PAYLOAD_BYTES..].copy_from_slice(&hdr);
        self.pf.flash_program_256(page_addr, &image)?;

        self.blocks_written += 1;
        self.head.page_index += 1;
        self.head.addr += PAGE_BYTES;

        let seg_idx = (page_addr / SEG_BYTES) as usize;
        let last_t = h.t0_ms.wrapping_add(sum_deltas(payload, h.dt_bits, h.count));
        let sm = &mut self.segs[seg_idx];
        if !sm.valid {
            *sm = SegSummary {
                addr_first: seg_idx as u32 * SEG_BYTES,
                seg_seqno: self.head.seg_seqno,
                valid: true,
                ..SegSummary::EMPTY
            };
        }
        sm.note_block(h.series, h.t0_ms, last_t);
        log::trace!(
            "published series {} count {} at {:#x} (seg seq {} page {})",
            h.series,
            h.count,
            page_addr,
            self.head.seg_seqno,
            self.head.page_index - 1
        );

        if self.head.page_index >= DATA_PAGES_PER_SEG {
            self.seal_and_rotate()?;
        }

        let now = self.pf.millis();
        if self.blocks_written % HINT_BLOCK_CADENCE == 0 || now - self.last_hint_ms >= HINT_MS_CADENCE {
            if let Err(e) = meta::save_head_hint(&mut self.pf, self.head.addr, self.head.seg_seqno) {
                log::warn!("head hint write failed: {}", e);
            }
            self.last_hint_ms = now;
        }
        Ok(())
    }

    /// Seal the current segment with an aggregated footer and move the head
    /// to the next segment, erasing it first. The aggregate is recomputed
    /// from the pages themselves so the footer describes exactly what a
    /// future reader will accept.
    fn seal_and_rotate(&mut self) -> Result<()> {
        let base = align_down(self.head.addr, SEG_BYTES);
        let mut agg = SegSummary {
            addr_first: base,
            seg_seqno: self.head.seg_seqno,
            valid: true,
            ..SegSummary::EMPTY
        };
        for p in 0..DATA_PAGES_PER_SEG {
            let page = self.read_page(base + p * PAGE_BYTES)?;
            match classify_page(&page) {
                PageStatus::Valid(h) => {
                    let payload: &[u8; PAYLOAD_BYTES] = page[..PAYLOAD_BYTES].try_into().unwrap();
                    let last_t = h.t0_ms.wrapping_add(sum_deltas(payload, h.dt_bits, h.count));
                    agg.note_block(h.series, h.t0_ms, last_t);
                }
                _ => break,
            }
        }
        self.write_footer(base, &agg)?;

        let next_base = (base + SEG_BYTES) % self.ring_bytes();
        self.pf.flash_erase_4k(next_base)?;
        self.head.seg_seqno += 1;
        self.head.addr = next_base;
        self.head.page_index = 0;
        let idx = (next_base / SEG_BYTES) as usize;
        self.segs[idx] = SegSummary {
            addr_first: next_base,
            seg_seqno: self.head.seg_seqno,
            valid: true,
            ..SegSummary::EMPTY
        };
        self.refresh_tail();
        log::debug!("sealed seg seq {} ({} blocks), head now at {:#x}", agg.seg_seqno, agg.block_count, next_base);
        Ok(())
    }

    fn refresh_tail(&mut self) {
        let mut oldest = None;
        for sm in self.segs.iter() {
            if sm.valid && sm.block_count > 0 {
                oldest = Some(match oldest {
                    Some(o) if o <= sm.seg_seqno => o,
                    _ => sm.seg_seqno,
                });
            }
        }
        self.tail_seqno = oldest.unwrap_or(self.head.seg_seqno);
    }

    // --- retention GC -------------------------------------------------------

    /// Reclaim the oldest segment when the ring runs low. Called on every
    /// write. Watermarks: below 10% free counts a warning (and reclaims),
    /// below 5% additionally counts a busy event. Erases are limited to
    /// [`GC_MAX_ERASES_PER_WINDOW`] per rolling second; when the quota is
    /// gone a non-blocking engine reports `Busy`, a blocking one waits out
    /// the window on the platform clock.
    pub(crate) fn gc_reclaim_if_needed(&mut self) -> Result<()> {
        let used = self.segs.iter().filter(|s| s.valid && s.block_count > 0).count() as u32;
        let free = self.seg_count - used;
        if free * 100 < 10 * self.seg_count {
            self.gc_warn_events += 1;
        }
        // one busy event per write, whether from the watermark or the quota
        let mut busy_counted = false;
        if free * 100 < 5 * self.seg_count {
            self.gc_busy_events += 1;
            busy_counted = true;
        }
        if free * 100 >= 10 * self.seg_count {
            return Ok(());
        }

        let now = self.pf.millis();
        if now - self.gc_window_start_ms >= GC_WINDOW_MS {
            self.gc_window_start_ms = now;
            self.gc_erased_in_window = 0;
        }
        if self.gc_erased_in_window >= GC_MAX_ERASES_PER_WINDOW {
            if self.non_blocking {
                if !busy_counted {
                    self.gc_busy_events += 1;
                }
                return Err(Error::Busy);
            }
            while self.pf.millis() - self.gc_window_start_ms < GC_WINDOW_MS {
                core::hint::spin_loop();
            }
            self.gc_window_start_ms = self.pf.millis();
            self.gc_erased_in_window = 0;
        }

        let mut oldest: Option<(usize, u32)> = None;
        for (i, sm) in self.segs.iter().enumerate() {
            if sm.valid && sm.block_count > 0 {
                match oldest {
                    Some((_, seq)) if seq <= sm.seg_seqno => {}
                    _ => oldest = Some((i, sm.seg_seqno)),
                }
            }
        }
        if let Some((idx, seq)) = oldest {
            let base = idx as u32 * SEG_BYTES;
            self.pf.flash_erase_4k(base)?;
            self.segs[idx] = SegSummary::EMPTY;
            self.gc_erased_in_window += 1;
            self.refresh_tail();
            log::debug!("gc: reclaimed seg seq {} at {:#x}, tail now {}", seq, base, self.tail_seqno);
        }
        Ok(())
    }

    // --- recovery -----------------------------------------------------------

    /// Rebuild the zone map and place the ring head after a restart.
    ///
    /// The footer scan is ground truth: a snapshot or head hint only
    /// short-circuits it when it claims a position at least as new as the
    /// newest sealed segment, so a stale metadata record can never park the
    /// head on top of sealed data. After placement the head segment is
    /// probed page by page; the head lands on the first page that does not
    /// verify, and an interrupted seal or rotation is completed on the spot.
    pub(crate) fn recover(&mut self, snap: Option<&Snapshot>) -> Result<()> {
        // 1. zone map from surviving footers
        let mut newest: Option<(usize, u32)> = None;
        let mut oldest_seq: Option<u32> = None;
        for i in 0..self.seg_count as usize {
            let base = i as u32 * SEG_BYTES;
            match self.read_footer(base) {
                Some(sm) => {
                    match newest {
                        Some((_, seq)) if seq >= sm.seg_seqno => {}
                        _ => newest = Some((i, sm.seg_seqno)),
                    }
                    match oldest_seq {
                        Some(seq) if seq <= sm.seg_seqno => {}
                        _ => oldest_seq = Some(sm.seg_seqno),
                    }
                    self.segs[i] = sm;
                }
                None => self.segs[i] = SegSummary::EMPTY,
            }
        }

        // 2. seed the head from the snapshot, or failing that the hint
        let mut seeded = false;
        if let Some(snap) = snap {
            if snap.head_addr < self.ring_bytes() {
                self.head = RingHead {
                    addr: snap.head_addr,
                    page_index: (snap.head_addr % SEG_BYTES) / PAGE_BYTES,
                    seg_seqno: snap.seg_seq_head,
                };
                self.tail_seqno = snap.seg_seq_tail;
                self.epoch_id = snap.epoch_id;
                seeded = true;
            } else {
                log::warn!("snapshot head {:#x} outside ring, ignoring", snap.head_addr);
            }
        }
        if !seeded {
            if let Some((addr, seq)) = meta::load_head_hint(&mut self.pf) {
                if addr < self.ring_bytes() {
                    self.head = RingHead {
                        addr,
                        page_index: (addr % SEG_BYTES) / PAGE_BYTES,
                        seg_seqno: seq,
                    };
                    self.tail_seqno = seq;
                    seeded = true;
                }
            }
        }

        // 3. footer scanning wins whenever it knows of a newer segment than
        //    the metadata record claimed: head goes to the first page after
        //    the newest sealed segment
        if let Some((idx, seq)) = newest {
            if !seeded || ts_seq_newer(seq.wrapping_add(1), self.head.seg_seqno) {
                let next_base = ((idx as u32 + 1) * SEG_BYTES) % self.ring_bytes();
                self.head = RingHead { addr: next_base, page_index: 0, seg_seqno: seq.wrapping_add(1) };
            }
            self.tail_seqno = oldest_seq.unwrap_or(seq);
        } else if !seeded {
            // fresh or fully torn device
            self.head = RingHead { addr: 0, page_index: 0, seg_seqno: 1 };
            self.tail_seqno = 1;
        }

        // 4. an interrupted rotation leaves the head segment holding a stale
        //    lap with its old footer; finish the erase it was owed
        let seg_base = align_down(self.head.addr, SEG_BYTES);
        let head_idx = (seg_base / SEG_BYTES) as usize;
        if self.segs[head_idx].valid && self.segs[head_idx].seg_seqno != self.head.seg_seqno {
            log::info!(
                "completing interrupted rotation: erasing stale seg seq {} at {:#x}",
                self.segs[head_idx].seg_seqno,
                seg_base
            );
            self.pf.flash_erase_4k(seg_base)?;
            self.segs[head_idx] = SegSummary::EMPTY;
            self.head.addr = seg_base;
            self.head.page_index = 0;
        }

        // 5. probe the head segment and truncate a torn tail. The zone-map
        //    entry is rebuilt from the pages that verify so unsealed blocks
        //    are queryable immediately.
        let mut rebuilt = SegSummary {
            addr_first: seg_base,
            seg_seqno: self.head.seg_seqno,
            valid: true,
            ..SegSummary::EMPTY
        };
        let mut first_free = DATA_PAGES_PER_SEG;
        let mut had_valid = false;
        let mut torn = false;
        for p in 0..DATA_PAGES_PER_SEG {
            let page = self.read_page(seg_base + p * PAGE_BYTES)?;
            match classify_page(&page) {
                PageStatus::Valid(h) => {
                    let payload: &[u8; PAYLOAD_BYTES] = page[..PAYLOAD_BYTES].try_into().unwrap();
                    let last_t = h.t0_ms.wrapping_add(sum_deltas(payload, h.dt_bits, h.count));
                    rebuilt.note_block(h.series, h.t0_ms, last_t);
                    had_valid = true;
                }
                PageStatus::Empty => {
                    first_free = p;
                    break;
                }
                PageStatus::Invalid => {
                    first_free = p;
                    torn = true;
                    break;
                }
            }
        }
        if torn && had_valid {
            self.recovery_truncations += 1;
            log::warn!("recovery: truncated torn tail at seg {:#x} page {}", seg_base, first_free);
        }
        self.head.page_index = first_free;
        self.head.addr = seg_base + first_free * PAGE_BYTES;
        self.segs[head_idx] = rebuilt;

        // Two cases close the segment out right away. A full segment whose
        // footer never landed finishes sealing. A torn tail also seals: the
        // torn page cannot be reprogrammed cleanly (its stray zero bits
        // would corrupt the next block's payload), so the segment ends at
        // the truncation point and writing resumes in a fresh segment.
        if torn || first_free == DATA_PAGES_PER_SEG {
            self.seal_and_rotate()?;
        }

        self.last_hint_ms = self.pf.millis();
        log::info!(
            "recovered: {} segments, head seq {} at {:#x} page {}, tail seq {}, epoch {}",
            self.seg_count,
            self.head.seg_seqno,
            self.head.addr,
            self.head.page_index,
            self.tail_seqno,
            self.epoch_id
        );
        Ok(())
    }

    // --- snapshots ----------------------------------------------------------

    /// Persist the ring cursors so the next open can trust them instead of
    /// depending on the hint. The tail is recomputed from the zone map so a
    /// snapshot taken after heavy GC stays accurate.
    pub(crate) fn snapshot_save(&mut self) -> Result<()> {
        self.refresh_tail();
        let snap = Snapshot {
            epoch_id: self.epoch_id,
            seg_seq_head: self.head.seg_seqno,
            seg_seq_tail: self.tail_seqno,
            head_addr: self.head.addr,
        };
        meta::save_snapshot(&mut self.pf, &snap).map_err(|_| Error::Io)
    }
}

/// Sequence numbers are monotonically increasing u32s; compare them the same
/// modular way as timestamps so a (decades-out) wrap stays ordered.
fn ts_seq_newer(a: u32, b: u32) -> bool { a != b && a.wrapping_sub(b) < 0x8000_0000 }
