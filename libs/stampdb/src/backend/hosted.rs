use std::cell::Cell;

use crate::api::{Error, Result, PAGE_BYTES, SEG_BYTES};
use crate::backend::Platform;

/// Modeled operation costs for the virtual clock, loosely based on SPI NOR
/// datasheets. They only need to be plausible: the engine's quotas and
/// cadences are driven entirely through `millis`, so advancing time with the
/// operations (and with every clock query) makes timing-dependent behavior —
/// GC erase windows, hint cadence, blocking waits — deterministic and fast
/// instead of wall-clock-bound.
const ERASE_MS: u64 = 40;
const PROGRAM_MS: u64 = 1;
const CLOCK_QUERY_MS: u64 = 1;

/// Host-side NOR flash emulator. The image lives in RAM and obeys the same
/// rules as the real part: erase fills a 4 KiB sector with 0xFF, programming
/// a 256 B page can only clear bits. Tests reach around the engine with
/// `as_mut_slice` to model external corruption (torn headers, bit rot), and
/// `read_count` lets recovery-cost assertions count I/O instead of timing
/// wall-clock reopens.
pub struct EmuFlash {
    mem: Vec<u8>,
    now_ms: Cell<u64>,
    reads: u64,
}

impl EmuFlash {
    pub fn new(bytes: usize) -> Self {
        assert!(bytes % SEG_BYTES as usize == 0, "flash size must be a whole number of sectors");
        EmuFlash { mem: vec![0xFF; bytes], now_ms: Cell::new(0), reads: 0 }
    }

    pub fn len(&self) -> usize { self.mem.len() }

    pub fn is_empty(&self) -> bool { self.mem.is_empty() }

    pub fn as_slice(&self) -> &[u8] { &self.mem }

    /// Direct mutable view of the image, bypassing NOR semantics. For tests
    /// that model external interference; the engine itself never calls this.
    pub fn as_mut_slice(&mut self) -> &mut [u8] { &mut self.mem }

    /// Number of `flash_read` calls since the last reset.
    pub fn read_count(&self) -> u64 { self.reads }

    pub fn reset_read_count(&mut self) { self.reads = 0; }

    /// Current virtual time.
    pub fn now_ms(&self) -> u64 { self.now_ms.get() }

    fn tick(&self, ms: u64) { self.now_ms.set(self.now_ms.get() + ms); }
}

impl Platform for EmuFlash {
    fn millis(&self) -> u64 {
        // advancing on every query lets busy-wait loops terminate without
        // real sleeping
        self.tick(CLOCK_QUERY_MS);
        self.now_ms.get()
    }

    fn flash_read(&mut self, addr: u32, dst: &mut [u8]) -> Result<()> {
        self.reads += 1;
        let addr = addr as usize;
        if addr + dst.len() > self.mem.len() {
            return Err(Error::Io);
        }
        dst.copy_from_slice(&self.mem[addr..addr + dst.len()]);
        Ok(())
    }

    fn flash_erase_4k(&mut self, addr: u32) -> Result<()> {
        let addr = addr as usize;
        if addr % SEG_BYTES as usize != 0 || addr + SEG_BYTES as usize > self.mem.len() {
            return Err(Error::Io);
        }
        self.tick(ERASE_MS);
        self.mem[addr..addr + SEG_BYTES as usize].fill(0xFF);
        Ok(())
    }

    fn flash_program_256(&mut self, addr: u32, src: &[u8; 256]) -> Result<()> {
        let addr = addr as usize;
        if addr % PAGE_BYTES as usize != 0 || addr + PAGE_BYTES as usize > self.mem.len() {
            return Err(Error::Io);
        }
        self.tick(PROGRAM_MS);
        // NOR can only clear bits within an erased sector
        for (dst, &s) in self.mem[addr..addr + PAGE_BYTES as usize].iter_mut().zip(src.iter()) {
            *dst &= s;
        }
        Ok(())
    }

    fn flash_size_bytes(&self) -> u32 { self.mem.len() as u32 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn programming_only_clears_bits() {
        let mut flash = EmuFlash::new(8192);
        let mut page = [0xFFu8; 256];
        page[0] = 0xF0;
        flash.flash_program_256(0, &page).unwrap();
        // a second program cannot set bits back
        page[0] = 0x0F;
        flash.flash_program_256(0, &page).unwrap();
        assert_eq!(flash.as_slice()[0], 0x00);
        flash.flash_erase_4k(0).unwrap();
        assert_eq!(flash.as_slice()[0], 0xFF);
    }

    #[test]
    fn alignment_is_enforced() {
        let mut flash = EmuFlash::new(8192);
        assert_eq!(flash.flash_erase_4k(100), Err(Error::Io));
        assert_eq!(flash.flash_program_256(100, &[0u8; 256]), Err(Error::Io));
        let mut buf = [0u8; 16];
        assert_eq!(flash.flash_read(8192, &mut buf), Err(Error::Io));
    }

    #[test]
    fn virtual_clock_is_monotonic() {
        let mut flash = EmuFlash::new(8192);
        let t0 = flash.millis();
        flash.flash_erase_4k(0).unwrap();
        flash.flash_program_256(0, &[0u8; 256]).unwrap();
        let t1 = flash.millis();
        assert!(t1 >= t0 + ERASE_MS + PROGRAM_MS);
    }
}
