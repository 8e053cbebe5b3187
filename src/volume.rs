//! Volume scale conversions.
//!
//! The playback core works with linear gain. User interfaces usually show a
//! cubic scale, which tracks perceived loudness more closely.

/// Converts a cubic slider position in `[0.0, 1.0]` to linear gain.
#[must_use]
pub fn cubic_to_linear(cubic: f32) -> f32 {
    clamp_unit(cubic).powi(3)
}

/// Converts linear gain in `[0.0, 1.0]` to a cubic slider position.
#[must_use]
pub fn linear_to_cubic(linear: f32) -> f32 {
    clamp_unit(linear).cbrt()
}

fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halfway_slider_is_an_eighth_of_the_gain() {
        assert!((cubic_to_linear(0.5) - 0.125).abs() < f32::EPSILON);
        assert!((linear_to_cubic(0.125) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn endpoints_and_out_of_range() {
        assert_eq!(cubic_to_linear(0.0), 0.0);
        assert_eq!(cubic_to_linear(1.0), 1.0);
        assert_eq!(cubic_to_linear(2.0), 1.0);
        assert_eq!(linear_to_cubic(-1.0), 0.0);
        assert_eq!(linear_to_cubic(f32::NAN), 0.0);
    }
}
