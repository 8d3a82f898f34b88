//! Minimal complex arithmetic for the frequency-domain throughput analysis.
//!
//! The hill-climbing controller only needs addition, subtraction,
//! multiplication, division, real scaling and magnitude, so we keep a small
//! dedicated type rather than pulling in a numerics crate. The numeric
//! contract stays explicit and portable.

use std::ops::{Add, Div, Mul, Sub};

/// A complex number as a real/imaginary pair of `f64`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Complex {
    pub re: f64,
    pub im: f64,
}

impl Complex {
    pub const ZERO: Complex = Complex { re: 0.0, im: 0.0 };

    pub fn new(re: f64, im: f64) -> Self {
        Complex { re, im }
    }

    /// Magnitude (absolute value) of the complex number.
    pub fn abs(self) -> f64 {
        (self.re * self.re + self.im * self.im).sqrt()
    }

    /// Scales both components by a real factor.
    pub fn scale(self, factor: f64) -> Self {
        Complex::new(self.re * factor, self.im * factor)
    }
}

impl Add for Complex {
    type Output = Complex;

    fn add(self, rhs: Complex) -> Complex {
        Complex::new(self.re + rhs.re, self.im + rhs.im)
    }
}

impl Sub for Complex {
    type Output = Complex;

    fn sub(self, rhs: Complex) -> Complex {
        Complex::new(self.re - rhs.re, self.im - rhs.im)
    }
}

impl Mul for Complex {
    type Output = Complex;

    fn mul(self, rhs: Complex) -> Complex {
        Complex::new(
            self.re * rhs.re - self.im * rhs.im,
            self.re * rhs.im + self.im * rhs.re,
        )
    }
}

impl Div for Complex {
    type Output = Complex;

    fn div(self, rhs: Complex) -> Complex {
        let denom = rhs.re * rhs.re + rhs.im * rhs.im;
        if denom == 0.0 {
            // Division by zero collapses to zero rather than NaN; callers
            // guard on |rhs| > 0 before trusting the ratio.
            return Complex::ZERO;
        }
        Complex::new(
            (self.re * rhs.re + self.im * rhs.im) / denom,
            (self.im * rhs.re - self.re * rhs.im) / denom,
        )
    }
}

impl Div<f64> for Complex {
    type Output = Complex;

    fn div(self, rhs: f64) -> Complex {
        Complex::new(self.re / rhs, self.im / rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_sub() {
        let a = Complex::new(1.0, 2.0);
        let b = Complex::new(3.0, -1.0);
        assert_eq!(a + b, Complex::new(4.0, 1.0));
        assert_eq!(a - b, Complex::new(-2.0, 3.0));
    }

    #[test]
    fn test_mul_div_roundtrip() {
        let a = Complex::new(2.0, 3.0);
        let b = Complex::new(-1.0, 4.0);
        let c = (a * b) / b;
        assert!((c.re - a.re).abs() < 1e-12);
        assert!((c.im - a.im).abs() < 1e-12);
    }

    #[test]
    fn test_abs() {
        assert_eq!(Complex::new(3.0, 4.0).abs(), 5.0);
        assert_eq!(Complex::ZERO.abs(), 0.0);
    }

    #[test]
    fn test_div_by_zero_is_zero() {
        let a = Complex::new(1.0, 1.0);
        assert_eq!(a / Complex::ZERO, Complex::ZERO);
    }

    #[test]
    fn test_scale() {
        assert_eq!(Complex::new(1.5, -2.0).scale(2.0), Complex::new(3.0, -4.0));
    }
}
