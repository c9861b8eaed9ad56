//! Helpers for 64-bit snowflake post ids: 41 bits of milliseconds since a
//! custom epoch, 10 bits of machine id and 12 bits of sequence.

/// Custom epoch of the id scheme, in unix milliseconds.
pub const EPOCH_MS: i64 = 1_288_834_974_657;

const MACHINE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MACHINE_MASK: i64 = (1 << MACHINE_BITS) - 1;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;
const TIME_SHIFT: u32 = MACHINE_BITS + SEQUENCE_BITS;

/// Machine ids observed issuing public post ids.
pub const KNOWN_MACHINE_IDS: [i64; 20] = [
    375, 382, 361, 372, 364, 381, 376, 365, 363, 362, 350, 325, 335, 333, 342, 326, 327, 336, 347,
    332,
];

pub fn creation_time_ms(id: i64) -> i64 {
    (id >> TIME_SHIFT) + EPOCH_MS
}

pub fn machine_id(id: i64) -> i64 {
    (id >> SEQUENCE_BITS) & MACHINE_MASK
}

pub fn sequence_id(id: i64) -> i64 {
    id & SEQUENCE_MASK
}

pub fn compose(unix_ms: i64, machine: i64, sequence: i64) -> i64 {
    ((unix_ms - EPOCH_MS) << TIME_SHIFT)
        | ((machine & MACHINE_MASK) << SEQUENCE_BITS)
        | (sequence & SEQUENCE_MASK)
}

/// Candidate ids for every millisecond in `[begin_ms, end_ms)` and every
/// machine in `machines`, sequence zero, millisecond-major.
pub fn ids_in_range<'a>(
    begin_ms: i64,
    end_ms: i64,
    machines: &'a [i64],
) -> impl Iterator<Item = i64> + 'a {
    (begin_ms..end_ms).flat_map(move |ms| machines.iter().map(move |m| compose(ms, *m, 0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2020-01-01T00:00:00.003Z, machine 375, sequence 0.
    const SAMPLE_ID: i64 = 1_212_161_512_057_565_184;

    #[test]
    fn test_decompose_known_id() {
        assert_eq!(creation_time_ms(SAMPLE_ID), 1_577_836_800_003);
        assert_eq!(machine_id(SAMPLE_ID), 375);
        assert_eq!(sequence_id(SAMPLE_ID), 0);
    }

    #[test]
    fn test_compose_inverts_decompose() {
        let id = compose(1_600_000_000_123, 382, 17);
        assert_eq!(creation_time_ms(id), 1_600_000_000_123);
        assert_eq!(machine_id(id), 382);
        assert_eq!(sequence_id(id), 17);
    }

    #[test]
    fn test_ids_in_range_order() {
        let ids: Vec<i64> = ids_in_range(1_600_000_000_000, 1_600_000_000_002, &[375, 382]).collect();
        assert_eq!(ids.len(), 4);
        assert_eq!(creation_time_ms(ids[0]), 1_600_000_000_000);
        assert_eq!(machine_id(ids[1]), 382);
        assert_eq!(creation_time_ms(ids[2]), 1_600_000_000_001);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}
