//! Shared exponential back-off helper used by the OPC UA read retry, write
//! retry and verification-rewrite loops instead of three duplicated delay
//! calculations (§9 "duplicate code-path resolution" note, generalized to
//! retry delays as well as parsing).

use std::time::Duration;

/// Delay before retry attempt `n` (0-indexed): `base * 2^n`.
pub fn delay_for(attempt: u32, base: Duration) -> Duration {
    base.mul_f64(2f64.powi(attempt as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_each_attempt() {
        let base = Duration::from_millis(100);
        assert_eq!(delay_for(0, base), Duration::from_millis(100));
        assert_eq!(delay_for(1, base), Duration::from_millis(200));
        assert_eq!(delay_for(2, base), Duration::from_millis(400));
    }
}
