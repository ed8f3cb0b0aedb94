//! StampDB: an embedded time-series store for NOR flash.
//!
//! The store appends `(series, timestamp_ms, f32)` samples, survives power
//! cuts, and serves range and latest queries on devices with kilobytes of
//! RAM and a few megabytes of flash (4 KiB erase sectors, 256 B program
//! pages, 1→0 programming).
//!
//! Storage is a ring of 4 KiB segments. Each segment carries fifteen 256 B
//! blocks and one footer page. A block packs up to 74 samples of one series:
//! timestamp deltas in uniform 8- or 16-bit lanes plus Fixed16-quantized
//! values, all CRC-32C protected. Blocks commit header-last — the payload is
//! programmed first with the header area erased, then the header is overlaid
//! — so a power cut at any instant leaves either a fully published block or
//! a page every reader ignores. Sealed segments get a footer summarizing
//! their time window and series set; the in-RAM zone map mirrors those
//! footers so queries skip segments without touching flash.
//!
//! Timestamps are u32 milliseconds and wrap about every 49.7 days; every
//! comparison in the engine is modular. An epoch counter tracks observed
//! wraps for the benefit of exporters.
//!
//! All bulk state lives in a workspace slice supplied to [`StampDb::open`];
//! the engine does not allocate. Flash and the clock come in through the
//! [`Platform`] trait; hosted builds and the test suite use [`EmuFlash`].
//!
//! ```no_run
//! use stampdb::{Config, EmuFlash, StampDb};
//!
//! let mut flash = EmuFlash::new(4 * 1024 * 1024);
//! let mut workspace = vec![0u8; 128 * 1024];
//! let mut db = StampDb::open(&mut flash, &mut workspace, Config::default()).unwrap();
//! db.write(1, 0, 20.5).unwrap();
//! db.write(1, 1000, 20.7).unwrap();
//! db.flush().unwrap();
//! let rows: Vec<(u32, f32)> = db.query(1, 0, 5000).unwrap().collect();
//! assert_eq!(rows.len(), 2);
//! ```

pub mod api;
pub use api::*;
mod backend;
pub use backend::{Platform, RangeIter};
#[cfg(not(target_os = "none"))]
pub use backend::EmuFlash;

use backend::{crc32c, encode_payload, load_snapshot, BlockHeader, RingOs};

#[cfg(test)]
mod tests;

/// One open database. Borrows the caller's workspace for its whole life;
/// dropping (or [`close`](StampDb::close)-ing) it leaves flash intact and
/// publishes any partially filled block on a best-effort basis.
///
/// All operations are `&mut self`: the engine is single-threaded
/// cooperative, and callers that need concurrency serialize commands in
/// front of it (the demonstration firmware funnels everything through one
/// FIFO for exactly this reason).
pub struct StampDb<'ws, P: Platform> {
    os: RingOs<'ws, P>,
    // block builder: staged rows for the currently accumulating series
    stg_deltas: &'ws mut [u32],
    stg_qvals: &'ws mut [i16],
    stg_vals: &'ws mut [f32],
    cur_series: u16,
    cur_t0: u32,
    cur_dt_bits: u8,
    cur_min: f32,
    cur_max: f32,
    cur_count: u16,
    last_ts: u32,
    last_ts_observed: Option<u32>,
    last_commit_ms: u64,
    cfg: Config,
}

impl<'ws, P: Platform> StampDb<'ws, P> {
    /// Open the store, recovering ring state from flash. The workspace must
    /// hold the zone map (one entry per segment) and the staging arrays;
    /// 4 KiB is the hard floor and a 4 MiB flash part wants around 64 KiB.
    ///
    /// Recovery reads every segment footer plus at most one segment of
    /// pages; a snapshot or head hint, when present and CRC-valid, seeds the
    /// cursors (see `snapshot_save`). Torn tails from a power cut are
    /// truncated, never propagated.
    pub fn open(mut platform: P, workspace: &'ws mut [u8], cfg: Config) -> Result<Self> {
        if workspace.len() < 4096 {
            return Err(Error::Inval);
        }
        let flash_bytes = platform.flash_size_bytes();
        if flash_bytes % SEG_BYTES != 0 {
            return Err(Error::Inval);
        }
        if flash_bytes < META_RESERVED + SEG_BYTES {
            return Err(Error::NoSpace);
        }
        let seg_count = (flash_bytes - META_RESERVED) / SEG_BYTES;
        let ws = backend::carve_workspace(workspace, seg_count as usize)?;
        let snapshot = load_snapshot(&mut platform);
        let mut os = RingOs::new(platform, ws.segs, seg_count, cfg.non_blocking);
        os.recover(snapshot.as_ref())?;
        let now = os.millis();
        Ok(StampDb {
            os,
            stg_deltas: ws.deltas,
            stg_qvals: ws.qvals,
            stg_vals: ws.vals,
            cur_series: 0,
            cur_t0: 0,
            cur_dt_bits: 8,
            cur_min: 0.0,
            cur_max: 0.0,
            cur_count: 0,
            last_ts: 0,
            last_ts_observed: None,
            last_commit_ms: now,
            cfg,
        })
    }

    /// Close the store, publishing any open block first. Storage remains
    /// intact either way; a plain drop performs the same flush without the
    /// error report.
    pub fn close(mut self) -> Result<()> { self.flush() }

    /// Append one sample. May block up to a second inside GC when the ring
    /// is nearly full (or return [`Error::Busy`] when configured
    /// non-blocking). A successful return does not mean the sample is on
    /// flash yet — durability arrives at the next block boundary or
    /// [`flush`](StampDb::flush).
    pub fn write(&mut self, series: u16, ts_ms: u32, value: f32) -> Result<()> {
        if series >= MAX_SERIES {
            return Err(Error::Inval);
        }
        self.os.gc_reclaim_if_needed()?;

        // epoch wrap tracking: a backward step of more than half the range
        // means the 32-bit clock lapped
        if let Some(prev) = self.last_ts_observed {
            if ts_ms < prev && prev - ts_ms > 0x8000_0000 {
                self.os.epoch_id += 1;
                log::debug!("timestamp wrap observed, epoch now {}", self.os.epoch_id);
            }
        }
        self.last_ts_observed = Some(ts_ms);

        self.push_sample(series, ts_ms, value)?;

        if self.cur_count as usize >= MAX_ROWS_PER_BLOCK {
            self.finalize_block()?;
        } else if self.cfg.commit_interval_ms > 0
            && self.cur_count > 0
            && self.os.millis().saturating_sub(self.last_commit_ms) >= self.cfg.commit_interval_ms as u64
        {
            self.finalize_block()?;
        }
        Ok(())
    }

    /// Force the open block onto flash. After this returns `Ok`, every
    /// previously written sample survives a restart.
    pub fn flush(&mut self) -> Result<()> { self.finalize_block() }

    /// Begin a range query over the closed window `[t0_ms, t1_ms]` (modular,
    /// so `t1 < t0` is a window that wraps). Rows stream in storage order.
    pub fn query(&mut self, series: u16, t0_ms: u32, t1_ms: u32) -> Result<RangeIter<'_, 'ws, P>> {
        if series >= MAX_SERIES {
            return Err(Error::Inval);
        }
        Ok(RangeIter::new(&mut self.os, series, t0_ms, t1_ms))
    }

    /// Newest `(ts_ms, value)` of a series; `Err(Inval)` when the series has
    /// no published rows.
    pub fn query_latest(&mut self, series: u16) -> Result<(u32, f32)> {
        if series >= MAX_SERIES {
            return Err(Error::Inval);
        }
        self.os.query_latest(series)
    }

    /// Persist the ring cursors to the A/B snapshot pair, bounding the next
    /// open's recovery work.
    pub fn snapshot_save(&mut self) -> Result<()> { self.os.snapshot_save() }

    /// Counters for tests and telemetry.
    pub fn info(&self) -> Stats {
        Stats {
            seg_seq_head: self.os.head.seg_seqno,
            seg_seq_tail: self.os.tail_seqno,
            blocks_written: self.os.blocks_written,
            crc_errors: self.os.crc_errors,
            gc_warn_events: self.os.gc_warn_events,
            gc_busy_events: self.os.gc_busy_events,
            recovery_truncations: self.os.recovery_truncations,
        }
    }

    fn begin_block(&mut self, series: u16, ts: u32, val: f32) {
        self.cur_series = series;
        self.cur_t0 = ts;
        self.last_ts = ts;
        self.cur_count = 0;
        self.cur_min = val;
        self.cur_max = val;
        self.cur_dt_bits = 8; // promoted on the first large delta
    }

    fn push_sample(&mut self, series: u16, ts: u32, val: f32) -> Result<()> {
        if self.cur_count > 0 && series != self.cur_series {
            self.finalize_block()?;
        }
        if self.cur_count == 0 {
            self.begin_block(series, ts, val);
        }

        let mut dt = if self.cur_count == 0 { 0 } else { ts.wrapping_sub(self.last_ts) };
        if dt > u16::MAX as u32 {
            // the delta lanes top out at 16 bits; a longer gap (or an
            // apparent backward step) starts a fresh block at this sample
            self.finalize_block()?;
            self.begin_block(series, ts, val);
            dt = 0;
        }

        let mut dt_bits = self.cur_dt_bits;
        if dt > 255 {
            dt_bits = 16;
        }
        let n = self.cur_count as usize + 1;
        if n * (dt_bits as usize / 8) + n * 2 > PAYLOAD_BYTES {
            self.finalize_block()?;
            self.begin_block(series, ts, val);
            dt = 0;
            dt_bits = 8;
        }
        // the promotion sticks for the rest of the block so the estimate
        // above can never undercount an already-seen wide delta
        self.cur_dt_bits = dt_bits;

        let i = self.cur_count as usize;
        self.stg_deltas[i] = dt;
        self.stg_vals[i] = val;
        if val < self.cur_min {
            self.cur_min = val;
        }
        if val > self.cur_max {
            self.cur_max = val;
        }
        self.cur_count += 1;
        self.last_ts = ts;
        Ok(())
    }

    /// Quantize, encode and publish the open block. No-op when empty.
    fn finalize_block(&mut self) -> Result<()> {
        if self.cur_count == 0 {
            return Ok(());
        }
        let count = self.cur_count as usize;
        let mut scale = (self.cur_max - self.cur_min) / 65535.0;
        if scale == 0.0 {
            scale = 1e-9;
        }
        let bias = 0.5 * (self.cur_max + self.cur_min);
        for i in 0..count {
            let q = ((self.stg_vals[i] - bias) / scale).round();
            self.stg_qvals[i] = q.clamp(-32768.0, 32767.0) as i16;
        }
        let max_dt = self.stg_deltas[..count].iter().copied().max().unwrap_or(0);
        let dt_bits: u8 = if max_dt <= 255 { 8 } else { 16 };

        let mut payload = [0xFFu8; PAYLOAD_BYTES];
        encode_payload(&mut payload, dt_bits, &self.stg_deltas[..count], &self.stg_qvals[..count], count);
        let h = BlockHeader {
            series: self.cur_series,
            count: self.cur_count,
            t0_ms: self.cur_t0,
            dt_bits,
            bias,
            scale,
            payload_crc: crc32c(&payload),
        };
        self.os.publish_block(&h, &payload)?;
        self.cur_count = 0;
        self.last_commit_ms = self.os.millis();
        Ok(())
    }
}

impl<P: Platform> Drop for StampDb<'_, P> {
    fn drop(&mut self) {
        // best-effort durability for whatever is still staged
        if self.finalize_block().is_err() {
            log::warn!("flush on drop failed; staged rows lost");
        }
    }
}
