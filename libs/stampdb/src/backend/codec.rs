use crate::api::{BLOCK_MAGIC, HEADER_BYTES, PAYLOAD_BYTES};
use crate::backend::{crc32c, BlockHeader};

// Layout of a 256 B page:
//   [0..224)   `count` timestamp deltas (1 or 2 bytes LE each, per dt_bits),
//              then `count` i16 LE quantized values, then 0xFF fill
//   [224..256) header, see `pack_header`
// Erased NOR reads 0xFF, so the fill keeps unprogrammed bits untouched when
// the payload image is programmed before the header image.

#[inline]
fn rd16(p: &[u8]) -> u16 { u16::from_le_bytes([p[0], p[1]]) }
#[inline]
fn rd32(p: &[u8]) -> u32 { u32::from_le_bytes([p[0], p[1], p[2], p[3]]) }

/// Encode deltas then quantized values into the payload area; 0xFF-fills the
/// unused tail. `deltas` must all fit the selected lane width.
pub(crate) fn encode_payload(
    dst: &mut [u8; PAYLOAD_BYTES],
    dt_bits: u8,
    deltas: &[u32],
    qvals: &[i16],
    count: usize,
) -> usize {
    debug_assert!(dt_bits == 8 || dt_bits == 16);
    let mut at = 0;
    if dt_bits == 8 {
        for &d in &deltas[..count] {
            dst[at] = d as u8;
            at += 1;
        }
    } else {
        for &d in &deltas[..count] {
            dst[at..at + 2].copy_from_slice(&(d as u16).to_le_bytes());
            at += 2;
        }
    }
    for &q in &qvals[..count] {
        dst[at..at + 2].copy_from_slice(&q.to_le_bytes());
        at += 2;
    }
    for b in dst[at..].iter_mut() {
        *b = 0xFF;
    }
    at
}

/// Decode a payload back into the caller's delta and qval arrays.
pub(crate) fn decode_payload(
    src: &[u8; PAYLOAD_BYTES],
    dt_bits: u8,
    deltas: &mut [u32],
    qvals: &mut [i16],
    count: usize,
) -> usize {
    let mut at = 0;
    if dt_bits == 8 {
        for d in deltas[..count].iter_mut() {
            *d = src[at] as u32;
            at += 1;
        }
    } else {
        for d in deltas[..count].iter_mut() {
            *d = rd16(&src[at..]) as u32;
            at += 2;
        }
    }
    for q in qvals[..count].iter_mut() {
        *q = rd16(&src[at..]) as i16;
        at += 2;
    }
    at
}

/// Sum the delta lane of a payload with wrapping addition; adding the result
/// to `t0_ms` gives the timestamp of the block's last sample.
pub(crate) fn sum_deltas(payload: &[u8; PAYLOAD_BYTES], dt_bits: u8, count: u16) -> u32 {
    let mut acc = 0u32;
    if dt_bits == 8 {
        for &b in &payload[..count as usize] {
            acc = acc.wrapping_add(b as u32);
        }
    } else {
        for i in 0..count as usize {
            acc = acc.wrapping_add(rd16(&payload[i * 2..]) as u32);
        }
    }
    acc
}

/// Serialize the header into its fixed byte layout and stamp the header CRC
/// over bytes 0..27 into bytes 28..31. Reserved bytes stay 0xFF so they never
/// fight the NOR overlay.
pub(crate) fn pack_header(out: &mut [u8; HEADER_BYTES], h: &BlockHeader) {
    out.fill(0xFF);
    out[0..4].copy_from_slice(&BLOCK_MAGIC.to_le_bytes());
    out[4..6].copy_from_slice(&h.series.to_le_bytes());
    out[6..8].copy_from_slice(&h.count.to_le_bytes());
    out[8..12].copy_from_slice(&h.t0_ms.to_le_bytes());
    out[12] = h.dt_bits;
    out[16..20].copy_from_slice(&h.bias.to_le_bytes());
    out[20..24].copy_from_slice(&h.scale.to_le_bytes());
    out[24..28].copy_from_slice(&h.payload_crc.to_le_bytes());
    let hc = crc32c(&out[..28]);
    out[28..32].copy_from_slice(&hc.to_le_bytes());
}

/// Parse and verify a header. `None` means "not a block": wrong magic, a torn
/// write, or bit rot — the caller treats all three identically.
pub(crate) fn unpack_header(raw: &[u8; HEADER_BYTES]) -> Option<BlockHeader> {
    if rd32(&raw[0..]) != BLOCK_MAGIC {
        return None;
    }
    if rd32(&raw[28..]) != crc32c(&raw[..28]) {
        return None;
    }
    // field sanity: a header that passes its CRC but describes a block the
    // payload cannot hold (foreign layout revision, crafted image) is still
    // "not a block"
    let count = rd16(&raw[6..]) as usize;
    let dt_bits = raw[12];
    if !(dt_bits == 8 || dt_bits == 16) {
        return None;
    }
    if count == 0 || count * (dt_bits as usize / 8 + 2) > PAYLOAD_BYTES {
        return None;
    }
    Some(BlockHeader {
        series: rd16(&raw[4..]),
        count: rd16(&raw[6..]),
        t0_ms: rd32(&raw[8..]),
        dt_bits: raw[12],
        bias: f32::from_le_bytes([raw[16], raw[17], raw[18], raw[19]]),
        scale: f32::from_le_bytes([raw[20], raw[21], raw[22], raw[23]]),
        payload_crc: rd32(&raw[24..]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trip_8bit() {
        let deltas: Vec<u32> = (0..60u32).map(|i| (i % 5) + 1).collect();
        let qvals: Vec<i16> = (0..60).map(|i| i as i16 - 30).collect();
        let mut buf = [0u8; PAYLOAD_BYTES];
        let used = encode_payload(&mut buf, 8, &deltas, &qvals, 60);
        assert_eq!(used, 60 + 120);
        assert!(buf[used..].iter().all(|&b| b == 0xFF));
        let mut d2 = [0u32; 60];
        let mut q2 = [0i16; 60];
        decode_payload(&buf, 8, &mut d2, &mut q2, 60);
        assert_eq!(&d2[..], &deltas[..]);
        assert_eq!(&q2[..], &qvals[..]);
        assert_eq!(sum_deltas(&buf, 8, 60), deltas.iter().sum::<u32>());
    }

    #[test]
    fn payload_round_trip_16bit_at_capacity() {
        // 56 * (2 + 2) = 224 fills the payload exactly
        let deltas: Vec<u32> = (0..56u32).map(|i| 300 + i * 7).collect();
        let qvals: Vec<i16> = (0..56).map(|i| (i as i16) * -311).collect();
        let mut buf = [0u8; PAYLOAD_BYTES];
        let used = encode_payload(&mut buf, 16, &deltas, &qvals, 56);
        assert_eq!(used, PAYLOAD_BYTES);
        let mut d2 = [0u32; 56];
        let mut q2 = [0i16; 56];
        decode_payload(&buf, 16, &mut d2, &mut q2, 56);
        assert_eq!(&d2[..], &deltas[..]);
        assert_eq!(&q2[..], &qvals[..]);
    }

    #[test]
    fn header_round_trip() {
        let h = BlockHeader {
            series: 3,
            count: 60,
            t0_ms: 1234,
            dt_bits: 8,
            bias: 1.2,
            scale: 0.005,
            payload_crc: 0xDEAD_BEEF,
        };
        let mut raw = [0u8; HEADER_BYTES];
        pack_header(&mut raw, &h);
        assert_eq!(unpack_header(&raw), Some(h));
        // reserved alignment bytes must stay erased
        assert_eq!(&raw[13..16], &[0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn header_rejects_tampering() {
        let h = BlockHeader {
            series: 9,
            count: 1,
            t0_ms: 0,
            dt_bits: 16,
            bias: 0.0,
            scale: 1e-9,
            payload_crc: 1,
        };
        let mut raw = [0u8; HEADER_BYTES];
        pack_header(&mut raw, &h);
        let mut bad = raw;
        bad[6] ^= 1; // count
        assert!(unpack_header(&bad).is_none());
        let mut torn = raw;
        torn[28..32].copy_from_slice(&[0xFF; 4]); // header CRC never landed
        assert!(unpack_header(&torn).is_none());
        let mut wrong_magic = raw;
        wrong_magic[0] = b'X';
        assert!(unpack_header(&wrong_magic).is_none());
    }
}
