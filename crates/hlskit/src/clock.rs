//! Conversions between clock rates.

pub(crate) const NANOS_PER_SECOND: u32 = 1_000_000_000;

pub(crate) fn rescale(value: i64, from: u32, to: u32) -> i64 {
    if from == to {
        return value;
    }
    (value as i128 * to as i128 / from as i128) as i64
}

/// Converts ticks of `clock_rate` into nanoseconds.
pub(crate) fn to_nanos(ticks: i64, clock_rate: u32) -> i64 {
    rescale(ticks, clock_rate, NANOS_PER_SECOND)
}

/// Converts nanoseconds into ticks of `clock_rate`.
pub(crate) fn from_nanos(nanos: i64, clock_rate: u32) -> i64 {
    rescale(nanos, NANOS_PER_SECOND, clock_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rescale() {
        assert_eq!(to_nanos(90000, 90000), 1_000_000_000);
        assert_eq!(to_nanos(-3003, 90000), -33_366_666);
        assert_eq!(from_nanos(20_000_000, 48000), 960);
        assert_eq!(rescale(1024, 44100, 90000), 2089);
    }
}
