//! Low-level bit manipulation helpers.

/// Interprets the low `width` bits of `raw` as two's complement.
pub fn sign_extend(raw: u64, width: usize) -> i64 {
    match width {
        1..=63 => {
            let unused = 64 - width as u32;
            ((raw << unused) as i64) >> unused
        }
        _ => raw as i64,
    }
}

/// Mirrors the low `width` bits of `raw`; higher bits are dropped.
pub fn reverse_bits_n(raw: u64, width: usize) -> u64 {
    match width {
        0 => 0,
        1..=63 => raw.reverse_bits() >> (64 - width),
        _ => raw.reverse_bits(),
    }
}

/// Mask selecting the low `width` bits.
pub fn low_mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}
