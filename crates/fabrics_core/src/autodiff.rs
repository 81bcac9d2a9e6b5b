use num_traits::{Float, FromPrimitive, Num, NumCast, One, ToPrimitive, Zero};
use std::f64::consts::{LN_10, LN_2};
use std::num::FpCategory;
use std::ops::{
    Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Rem, RemAssign, Sub, SubAssign,
};

/// Forward-mode dual number `value + tangent * eps`, `eps^2 = 0`.
///
/// Running a compiled program on duals yields every output together with its
/// directional derivative along the input tangents.
///
/// Ordering compares `value` only, so branches taken on a dual input
/// (`sign`, `abs`, `max`) match the ones taken on the plain value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dual {
    pub value: f64,
    pub tangent: f64,
}

impl Dual {
    pub fn new(value: f64, tangent: f64) -> Self {
        Self { value, tangent }
    }

    pub fn constant(value: f64) -> Self {
        Self::new(value, 0.0)
    }

    /// `f(self)` given `f(value)` and `f'(value)`.
    fn chain(self, image: f64, slope: f64) -> Self {
        Self::new(image, slope * self.tangent)
    }
}

impl PartialOrd for Dual {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.value.partial_cmp(&other.value)
    }
}

impl Zero for Dual {
    fn zero() -> Self {
        Self::constant(0.0)
    }

    fn is_zero(&self) -> bool {
        self.value == 0.0 && self.tangent == 0.0
    }
}

impl One for Dual {
    fn one() -> Self {
        Self::constant(1.0)
    }
}

impl Add for Dual {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.value + rhs.value, self.tangent + rhs.tangent)
    }
}

impl Sub for Dual {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.value - rhs.value, self.tangent - rhs.tangent)
    }
}

impl Mul for Dual {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.value * rhs.value,
            self.value * rhs.tangent + self.tangent * rhs.value,
        )
    }
}

impl Div for Dual {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        let quotient = self.value / rhs.value;
        Self::new(quotient, (self.tangent - quotient * rhs.tangent) / rhs.value)
    }
}

impl Neg for Dual {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.value, -self.tangent)
    }
}

impl Rem for Dual {
    type Output = Self;
    /// `a - trunc(a / b) * b`, with the quotient held constant.
    fn rem(self, rhs: Self) -> Self {
        let quotient = (self.value / rhs.value).trunc();
        Self::new(self.value % rhs.value, self.tangent - quotient * rhs.tangent)
    }
}

macro_rules! assign_ops {
    ($($trait:ident, $method:ident, $op:tt;)*) => {
        $(impl $trait for Dual {
            fn $method(&mut self, rhs: Self) {
                *self = *self $op rhs;
            }
        })*
    };
}

assign_ops! {
    AddAssign, add_assign, +;
    SubAssign, sub_assign, -;
    MulAssign, mul_assign, *;
    DivAssign, div_assign, /;
    RemAssign, rem_assign, %;
}

impl Num for Dual {
    type FromStrRadixErr = num_traits::ParseFloatError;

    fn from_str_radix(s: &str, radix: u32) -> Result<Self, Self::FromStrRadixErr> {
        f64::from_str_radix(s, radix).map(Self::constant)
    }
}

impl ToPrimitive for Dual {
    fn to_i64(&self) -> Option<i64> {
        self.value.to_i64()
    }

    fn to_u64(&self) -> Option<u64> {
        self.value.to_u64()
    }

    fn to_f64(&self) -> Option<f64> {
        Some(self.value)
    }
}

impl FromPrimitive for Dual {
    fn from_i64(n: i64) -> Option<Self> {
        f64::from_i64(n).map(Self::constant)
    }

    fn from_u64(n: u64) -> Option<Self> {
        f64::from_u64(n).map(Self::constant)
    }

    fn from_f64(n: f64) -> Option<Self> {
        Some(Self::constant(n))
    }
}

impl NumCast for Dual {
    fn from<T: ToPrimitive>(n: T) -> Option<Self> {
        n.to_f64().map(Self::constant)
    }
}

/// Constants of `f64` lifted with a zero tangent.
macro_rules! lifted_constants {
    ($($name:ident = $value:expr;)*) => {
        $(fn $name() -> Self {
            Self::constant($value)
        })*
    };
}

/// Queries answered by the value alone.
macro_rules! value_queries {
    ($($name:ident -> $ret:ty;)*) => {
        $(fn $name(self) -> $ret {
            self.value.$name()
        })*
    };
}

/// Piecewise-constant functions: zero derivative almost everywhere.
macro_rules! flat {
    ($($name:ident),* $(,)?) => {
        $(fn $name(self) -> Self {
            Self::constant(self.value.$name())
        })*
    };
}

/// Smooth unary functions; `|v, f| slope` gives `f'(v)` where `f = f(v)`.
macro_rules! chain_rule {
    ($($name:ident => |$v:ident, $f:ident| $slope:expr;)*) => {
        $(#[allow(unused_variables)]
        fn $name(self) -> Self {
            let $v = self.value;
            let $f = $v.$name();
            self.chain($f, $slope)
        })*
    };
}

impl Float for Dual {
    lifted_constants! {
        nan = f64::NAN;
        infinity = f64::INFINITY;
        neg_infinity = f64::NEG_INFINITY;
        neg_zero = -0.0;
        min_value = f64::MIN;
        min_positive_value = f64::MIN_POSITIVE;
        max_value = f64::MAX;
    }

    value_queries! {
        is_nan -> bool;
        is_infinite -> bool;
        is_finite -> bool;
        is_normal -> bool;
        is_sign_positive -> bool;
        is_sign_negative -> bool;
        classify -> FpCategory;
        integer_decode -> (u64, i16, i8);
    }

    flat!(floor, ceil, round, trunc, signum);

    chain_rule! {
        sqrt => |v, f| 0.5 / f;
        cbrt => |v, f| 1.0 / (3.0 * f * f);
        exp => |v, f| f;
        exp2 => |v, f| f * LN_2;
        exp_m1 => |v, f| f + 1.0;
        ln => |v, f| 1.0 / v;
        ln_1p => |v, f| 1.0 / (1.0 + v);
        log2 => |v, f| 1.0 / (v * LN_2);
        log10 => |v, f| 1.0 / (v * LN_10);
        sin => |v, f| v.cos();
        cos => |v, f| -v.sin();
        tan => |v, f| 1.0 + f * f;
        asin => |v, f| 1.0 / (1.0 - v * v).sqrt();
        acos => |v, f| -1.0 / (1.0 - v * v).sqrt();
        atan => |v, f| 1.0 / (1.0 + v * v);
        sinh => |v, f| v.cosh();
        cosh => |v, f| v.sinh();
        tanh => |v, f| 1.0 - f * f;
        asinh => |v, f| 1.0 / (v * v + 1.0).sqrt();
        acosh => |v, f| 1.0 / (v * v - 1.0).sqrt();
        atanh => |v, f| 1.0 / (1.0 - v * v);
    }

    fn fract(self) -> Self {
        Self::new(self.value.fract(), self.tangent)
    }

    fn abs(self) -> Self {
        if self.value < 0.0 {
            -self
        } else {
            self
        }
    }

    fn mul_add(self, a: Self, b: Self) -> Self {
        self * a + b
    }

    fn recip(self) -> Self {
        Self::one() / self
    }

    fn powi(self, n: i32) -> Self {
        self.chain(self.value.powi(n), (n as f64) * self.value.powi(n - 1))
    }

    fn powf(self, n: Self) -> Self {
        let image = self.value.powf(n.value);
        // A constant exponent must not take ln of a negative base.
        let base_slope = n.value * self.value.powf(n.value - 1.0);
        if n.tangent == 0.0 {
            return self.chain(image, base_slope);
        }
        Self::new(
            image,
            base_slope * self.tangent + image * self.value.ln() * n.tangent,
        )
    }

    fn log(self, base: Self) -> Self {
        self.ln() / base.ln()
    }

    fn max(self, other: Self) -> Self {
        if other.value > self.value {
            other
        } else {
            self
        }
    }

    fn min(self, other: Self) -> Self {
        if other.value < self.value {
            other
        } else {
            self
        }
    }

    fn abs_sub(self, other: Self) -> Self {
        (self - other).max(Self::zero())
    }

    fn hypot(self, other: Self) -> Self {
        (self * self + other * other).sqrt()
    }

    fn atan2(self, other: Self) -> Self {
        let r2 = self.value * self.value + other.value * other.value;
        Self::new(
            self.value.atan2(other.value),
            (other.value * self.tangent - self.value * other.tangent) / r2,
        )
    }

    fn sin_cos(self) -> (Self, Self) {
        (self.sin(), self.cos())
    }
}
