//! Numeric helpers for the sample processing stages.

/// Unity gain in dB.
pub const ZERO_DB: f32 = 0.0;

/// Converts a linear amplitude ratio to dB.
#[must_use]
#[inline]
pub fn ratio_to_db(ratio: f32) -> f32 {
    ratio.log10() * 20.0
}

/// Converts dB to a linear amplitude ratio.
#[must_use]
#[inline]
pub fn db_to_ratio(db: f32) -> f32 {
    f32::powf(10.0, db / 20.0)
}

/// Lossy conversion into `f32` for values whose magnitude fits but whose
/// precision may not.
pub trait ToF32 {
    fn to_f32_lossy(self) -> f32;
}

impl ToF32 for u32 {
    #[expect(clippy::cast_precision_loss)]
    #[inline]
    fn to_f32_lossy(self) -> f32 {
        self as f32
    }
}

impl ToF32 for u64 {
    #[expect(clippy::cast_precision_loss)]
    #[inline]
    fn to_f32_lossy(self) -> f32 {
        self as f32
    }
}

impl ToF32 for usize {
    #[expect(clippy::cast_precision_loss)]
    #[inline]
    fn to_f32_lossy(self) -> f32 {
        self as f32
    }
}

impl ToF32 for f64 {
    #[expect(clippy::cast_possible_truncation)]
    #[inline]
    fn to_f32_lossy(self) -> f32 {
        self as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_conversions_are_inverse() {
        assert_eq!(db_to_ratio(ZERO_DB), 1.0);
        assert!((ratio_to_db(0.5) + 6.0206).abs() < 1e-3);
        assert!((db_to_ratio(ratio_to_db(0.25)) - 0.25).abs() < 1e-6);
    }
}
