//! Advisory progress percentages.
//!
//! Progress is never used for control flow. Each phase owns a fixed band so
//! later phases always report above earlier ones.

pub const CONSTITUTION_DONE: u8 = 5;
pub const PLAN_DONE: u8 = 10;
/// Upper bound of the writing band (all sections canonical).
pub const WRITING_DONE: u8 = 96;
/// Reported on entering `finalize` and while a cover regenerates.
pub const FINALIZE_FLOOR: u8 = 97;
pub const FINALIZE_WAITING: u8 = 98;
pub const COMPLETE: u8 = 100;

/// Linear progress through the writing band.
pub fn writing_progress(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return PLAN_DONE;
    }
    let band = (WRITING_DONE - PLAN_DONE) as usize;
    let done = completed.min(total);
    PLAN_DONE + (band * done / total) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn writing_band_endpoints() {
        assert_eq!(writing_progress(0, 4), PLAN_DONE);
        assert_eq!(writing_progress(4, 4), WRITING_DONE);
        assert_eq!(writing_progress(2, 4), 53);
        assert_eq!(writing_progress(0, 0), PLAN_DONE);
    }

    proptest! {
        #[test]
        fn writing_progress_is_monotonic_and_below_finalize(total in 1usize..500, a in 0usize..500, b in 0usize..500) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let p_lo = writing_progress(lo, total);
            let p_hi = writing_progress(hi, total);
            prop_assert!(p_lo <= p_hi);
            prop_assert!(p_hi < FINALIZE_FLOOR);
            prop_assert!(p_lo >= PLAN_DONE);
        }
    }
}
