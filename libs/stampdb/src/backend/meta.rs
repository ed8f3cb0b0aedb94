use crate::api::{Result, LAYOUT_VERSION, META_RESERVED, PAGE_BYTES, SEG_BYTES};
use crate::backend::{crc32c, Platform};

// The metadata region is the top 32 KiB of flash. Only the first three
// sectors are used, one 256 B record programmed at the base of each:
//   sector 0: snapshot copy A
//   sector 1: snapshot copy B
//   sector 2: head hint
// A record write is erase-then-program, so a crash leaves the sector either
// erased (all 0xFF, read back as "absent") or with a record whose CRC does
// not verify — both count as absent. The A/B pair is never erased in the
// same save: the save target is chosen by head-sequence parity, so the copy
// written one save ago survives any crash inside the current save.

/// Persisted ring cursors. `head_addr` points at the next free page; the
/// sequence numbers bound how far recovery has to look past the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Snapshot {
    pub epoch_id: u32,
    pub seg_seq_head: u32,
    pub seg_seq_tail: u32,
    pub head_addr: u32,
}

const SNAPSHOT_LEN: usize = 24;
const HINT_LEN: usize = 12;

fn meta_base<P: Platform>(pf: &P) -> u32 { pf.flash_size_bytes() - META_RESERVED }

/// Read the record page of a metadata sector; `None` when it is erased.
fn load_record<P: Platform>(pf: &mut P, sector_addr: u32) -> Option<[u8; 256]> {
    let mut page = [0u8; PAGE_BYTES as usize];
    pf.flash_read(sector_addr, &mut page).ok()?;
    if page.iter().all(|&b| b == 0xFF) { None } else { Some(page) }
}

/// Erase the sector and program the record, 0xFF-padded to a page.
fn save_record<P: Platform>(pf: &mut P, sector_addr: u32, rec: &[u8]) -> Result<()> {
    pf.flash_erase_4k(sector_addr)?;
    let mut page = [0xFFu8; PAGE_BYTES as usize];
    page[..rec.len()].copy_from_slice(rec);
    pf.flash_program_256(sector_addr, &page)
}

fn parse_snapshot(page: &[u8; 256]) -> Option<Snapshot> {
    let rd = |at: usize| u32::from_le_bytes(page[at..at + 4].try_into().unwrap());
    if rd(20) != crc32c(&page[..20]) {
        return None;
    }
    if rd(0) != LAYOUT_VERSION {
        return None;
    }
    Some(Snapshot { epoch_id: rd(4), seg_seq_head: rd(8), seg_seq_tail: rd(12), head_addr: rd(16) })
}

/// Load the newest CRC-valid snapshot copy; larger head sequence wins, A on
/// ties.
pub(crate) fn load_snapshot<P: Platform>(pf: &mut P) -> Option<Snapshot> {
    let base = meta_base(pf);
    let a = load_record(pf, base).as_ref().and_then(parse_snapshot);
    let b = load_record(pf, base + SEG_BYTES).as_ref().and_then(parse_snapshot);
    match (a, b) {
        (Some(a), Some(b)) => Some(if a.seg_seq_head >= b.seg_seq_head { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Persist a snapshot to the copy selected by head-sequence parity.
pub(crate) fn save_snapshot<P: Platform>(pf: &mut P, snap: &Snapshot) -> Result<()> {
    let mut rec = [0u8; SNAPSHOT_LEN];
    rec[0..4].copy_from_slice(&LAYOUT_VERSION.to_le_bytes());
    rec[4..8].copy_from_slice(&snap.epoch_id.to_le_bytes());
    rec[8..12].copy_from_slice(&snap.seg_seq_head.to_le_bytes());
    rec[12..16].copy_from_slice(&snap.seg_seq_tail.to_le_bytes());
    rec[16..20].copy_from_slice(&snap.head_addr.to_le_bytes());
    let crc = crc32c(&rec[..20]);
    rec[20..24].copy_from_slice(&crc.to_le_bytes());
    let base = meta_base(pf);
    let sector = if snap.seg_seq_head & 1 != 0 { base } else { base + SEG_BYTES };
    save_record(pf, sector, &rec)
}

/// Load the advisory head hint; `(head_addr, seg_seqno)` when present.
pub(crate) fn load_head_hint<P: Platform>(pf: &mut P) -> Option<(u32, u32)> {
    let page = load_record(pf, meta_base(pf) + 2 * SEG_BYTES)?;
    let rd = |at: usize| u32::from_le_bytes(page[at..at + 4].try_into().unwrap());
    if rd(8) != crc32c(&page[..8]) {
        return None;
    }
    Some((rd(0), rd(4)))
}

/// Persist the head hint. Failures are the caller's to ignore: the hint is
/// advisory and recovery never depends on it.
pub(crate) fn save_head_hint<P: Platform>(pf: &mut P, head_addr: u32, seg_seqno: u32) -> Result<()> {
    let mut rec = [0u8; HINT_LEN];
    rec[0..4].copy_from_slice(&head_addr.to_le_bytes());
    rec[4..8].copy_from_slice(&seg_seqno.to_le_bytes());
    let crc = crc32c(&rec[..8]);
    rec[8..12].copy_from_slice(&crc.to_le_bytes());
    save_record(pf, meta_base(pf) + 2 * SEG_BYTES, &rec)
}
