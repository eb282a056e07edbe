//! Transcendental dispatch: per-op kernels in two accuracy tiers plus a
//! scalar fallback, selected by a thread-local policy installed for the
//! duration of one evaluation call.
//!
//! The `Ulp1` tier delegates to the platform libm, which stays inside a
//! 1-ULP envelope for every op here. The `Ulp35` tier runs block-vectorised
//! polynomial kernels for the hot ops (sin, cos, exp, log, tanh) with
//! Cody-Waite range reduction; everything else falls through to the
//! accurate tier, which satisfies the 3.5-ULP envelope trivially.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Accuracy tier for vector transcendentals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UlpMode {
    /// ≤ 1 ULP envelope
    #[default]
    Ulp1,
    /// ≤ 3.5 ULP envelope, faster kernels
    Ulp35,
}

/// Per-evaluation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvalParams {
    pub ulp_mode: UlpMode,
    /// Force the scalar fallback for every op
    pub disable_simd: bool,
}

static DEFAULT_ULP35: AtomicU8 = AtomicU8::new(0);
static DEFAULT_DISABLE_SIMD: AtomicBool = AtomicBool::new(false);

/// Process-wide default accuracy mode, used when an evaluation call passes
/// no explicit parameters.
pub fn set_default_ulp_mode(mode: UlpMode) {
    DEFAULT_ULP35.store((mode == UlpMode::Ulp35) as u8, Ordering::SeqCst);
}

/// Process-wide default for disabling the vector kernels.
pub fn set_default_disable_simd(disable: bool) {
    DEFAULT_DISABLE_SIMD.store(disable, Ordering::SeqCst);
}

#[must_use]
pub fn process_default_params() -> EvalParams {
    EvalParams {
        ulp_mode: if DEFAULT_ULP35.load(Ordering::SeqCst) != 0 {
            UlpMode::Ulp35
        } else {
            UlpMode::Ulp1
        },
        disable_simd: DEFAULT_DISABLE_SIMD.load(Ordering::SeqCst),
    }
}

thread_local! {
    static POLICY: RefCell<Vec<EvalParams>> = const { RefCell::new(Vec::new()) };
}

/// Installed policy for the current evaluation, or the process default.
#[must_use]
pub(crate) fn current_policy() -> EvalParams {
    POLICY.with(|p| p.borrow().last().copied()).unwrap_or_else(process_default_params)
}

/// Pushes `params` for the duration of one evaluation call; nested calls
/// restore the previous policy on drop.
pub(crate) struct PolicyGuard(());

pub(crate) fn push_policy(params: EvalParams) -> PolicyGuard {
    POLICY.with(|p| p.borrow_mut().push(params));
    PolicyGuard(())
}

impl Drop for PolicyGuard {
    fn drop(&mut self) {
        POLICY.with(|p| {
            p.borrow_mut().pop();
        });
    }
}

/// Transcendental and rounding operations dispatched through this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathOp {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atanh,
    Asinh,
    Acosh,
    Sinh,
    Cosh,
    Tanh,
    Exp,
    Expm1,
    Exp2,
    Exp10,
    Log,
    Log10,
    Log1p,
    Log2,
    Sinpi,
    Cospi,
    Cbrt,
    Sqrt,
    Erf,
    Erfc,
    Tgamma,
    Lgamma,
    Floor,
    Ceil,
    Round,
    Trunc,
    // binary
    Atan2,
    Hypot,
    Pow,
}

/// Accurate scalar evaluation (the ≤1-ULP tier and the `disable_simd` path).
#[must_use]
pub(crate) fn scalar_f64(op: MathOp, x: f64) -> f64 {
    match op {
        MathOp::Sin => x.sin(),
        MathOp::Cos => x.cos(),
        MathOp::Tan => x.tan(),
        MathOp::Asin => x.asin(),
        MathOp::Acos => x.acos(),
        MathOp::Atan => x.atan(),
        MathOp::Atanh => x.atanh(),
        MathOp::Asinh => x.asinh(),
        MathOp::Acosh => x.acosh(),
        MathOp::Sinh => x.sinh(),
        MathOp::Cosh => x.cosh(),
        MathOp::Tanh => x.tanh(),
        MathOp::Exp => x.exp(),
        MathOp::Expm1 => x.exp_m1(),
        MathOp::Exp2 => x.exp2(),
        MathOp::Exp10 => (x * std::f64::consts::LN_10).exp(),
        MathOp::Log => x.ln(),
        MathOp::Log10 => x.log10(),
        MathOp::Log1p => x.ln_1p(),
        MathOp::Log2 => x.log2(),
        MathOp::Sinpi => sinpi(x),
        MathOp::Cospi => cospi(x),
        MathOp::Cbrt => x.cbrt(),
        MathOp::Sqrt => x.sqrt(),
        MathOp::Erf => erf(x),
        MathOp::Erfc => erfc(x),
        MathOp::Tgamma => tgamma(x),
        MathOp::Lgamma => lgamma(x),
        MathOp::Floor => x.floor(),
        MathOp::Ceil => x.ceil(),
        MathOp::Round => x.round(),
        MathOp::Trunc => x.trunc(),
        MathOp::Atan2 | MathOp::Hypot | MathOp::Pow => f64::NAN,
    }
}

#[must_use]
pub(crate) fn scalar2_f64(op: MathOp, x: f64, y: f64) -> f64 {
    match op {
        MathOp::Atan2 => x.atan2(y),
        MathOp::Hypot => x.hypot(y),
        MathOp::Pow => x.powf(y),
        _ => f64::NAN,
    }
}

/// Unary dispatch over a block. `src` and `dst` have equal lengths.
pub(crate) fn unary_f64(op: MathOp, params: EvalParams, src: &[f64], dst: &mut [f64]) {
    debug_assert_eq!(src.len(), dst.len());
    if !params.disable_simd && params.ulp_mode == UlpMode::Ulp35 {
        match op {
            MathOp::Sin => return sin_block_u35(src, dst, false),
            MathOp::Cos => return sin_block_u35(src, dst, true),
            MathOp::Exp => return exp_block_u35(src, dst),
            MathOp::Log => return log_block_u35(src, dst),
            MathOp::Tanh => return tanh_block_u35(src, dst),
            _ => {}
        }
    }
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = scalar_f64(op, s);
    }
}

pub(crate) fn unary_f32(op: MathOp, params: EvalParams, src: &[f32], dst: &mut [f32]) {
    debug_assert_eq!(src.len(), dst.len());
    // f32 goes through the f64 kernels: accurate to well under 1 ULP of f32
    if !params.disable_simd && params.ulp_mode == UlpMode::Ulp35 {
        let mut wide = [0.0f64; 64];
        let mut out = [0.0f64; 64];
        for (s, d) in src.chunks(64).zip(dst.chunks_mut(64)) {
            let n = s.len();
            for (w, &v) in wide[..n].iter_mut().zip(s) {
                *w = f64::from(v);
            }
            unary_f64(op, params, &wide[..n], &mut out[..n]);
            for (t, &v) in d.iter_mut().zip(&out[..n]) {
                *t = v as f32;
            }
        }
        return;
    }
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = scalar_f64(op, f64::from(s)) as f32;
    }
}

/// One operand of a binary math kernel.
#[derive(Clone, Copy)]
pub(crate) enum FSrc<'a> {
    Scalar(f64),
    Slice(&'a [f64]),
}

impl FSrc<'_> {
    #[inline]
    fn at(&self, i: usize) -> f64 {
        match self {
            Self::Scalar(v) => *v,
            Self::Slice(s) => s[i],
        }
    }
}

pub(crate) fn binary_f64(op: MathOp, _params: EvalParams, a: FSrc<'_>, b: FSrc<'_>, dst: &mut [f64]) {
    for (i, d) in dst.iter_mut().enumerate() {
        *d = scalar2_f64(op, a.at(i), b.at(i));
    }
}

const LANES: usize = 8;

macro_rules! lanewise {
    ($src:expr, $dst:expr, $f:expr) => {{
        let mut sc = $src.chunks_exact(LANES);
        let mut dc = $dst.chunks_exact_mut(LANES);
        for (s, d) in (&mut sc).zip(&mut dc) {
            let mut lane = [0.0f64; LANES];
            lane.copy_from_slice(s);
            for v in &mut lane {
                *v = $f(*v);
            }
            d.copy_from_slice(&lane);
        }
        for (d, &s) in dc.into_remainder().iter_mut().zip(sc.remainder()) {
            *d = $f(s);
        }
    }};
}

// Cody-Waite split of π/2 (fdlibm)
const PIO2_H: f64 = 1.570_796_251_296_997_070_31e0;
const PIO2_M: f64 = 7.549_789_415_861_596_353_35e-8;
const PIO2_L: f64 = 5.390_302_529_957_764_765_54e-15;

/// Reduced-range sine, |r| ≤ π/4, Taylor to degree 13 (abs error < 3e-14)
#[inline]
fn sin_poly(r: f64) -> f64 {
    let r2 = r * r;
    let mut p = -1.0 / 6_227_020_800.0; // 1/13!
    p = p * r2 + 1.0 / 39_916_800.0;
    p = p * r2 - 1.0 / 362_880.0;
    p = p * r2 + 1.0 / 5_040.0;
    p = p * r2 - 1.0 / 120.0;
    p = p * r2 + 1.0 / 6.0;
    r - r * r2 * p
}

/// Reduced-range cosine, |r| ≤ π/4, Taylor to degree 14
#[inline]
fn cos_poly(r: f64) -> f64 {
    let r2 = r * r;
    let mut p = 1.0 / 87_178_291_200.0; // 1/14!
    p = p * r2 - 1.0 / 479_001_600.0;
    p = p * r2 + 1.0 / 3_628_800.0;
    p = p * r2 - 1.0 / 40_320.0;
    p = p * r2 + 1.0 / 720.0;
    p = p * r2 - 1.0 / 24.0;
    1.0 - 0.5 * r2 - r2 * r2 * p
}

#[inline]
fn sin_fast(x: f64, cosine: bool) -> f64 {
    let q = (x * std::f64::consts::FRAC_2_PI).round();
    let r = ((x - q * PIO2_H) - q * PIO2_M) - q * PIO2_L;
    let quadrant = (q as i64 + if cosine { 1 } else { 0 }).rem_euclid(4);
    match quadrant {
        0 => sin_poly(r),
        1 => cos_poly(r),
        2 => -sin_poly(r),
        _ => -cos_poly(r),
    }
}

// Beyond this the Cody-Waite reduction loses too many bits; take libm.
const TRIG_RANGE: f64 = 1.0e5;

fn sin_block_u35(src: &[f64], dst: &mut [f64], cosine: bool) {
    if src.iter().any(|v| !v.is_finite() || v.abs() > TRIG_RANGE) {
        for (d, &s) in dst.iter_mut().zip(src) {
            *d = if cosine { s.cos() } else { s.sin() };
        }
        return;
    }
    lanewise!(src, dst, |v| sin_fast(v, cosine));
}

// fdlibm split of ln 2
const LN2_H: f64 = 6.931_471_803_691_238_164_90e-1;
const LN2_L: f64 = 1.908_214_929_270_587_700_02e-10;

#[inline]
fn exp_fast(x: f64) -> f64 {
    if !(-708.0..=709.0).contains(&x) {
        return x.exp();
    }
    let k = (x * std::f64::consts::LOG2_E).round();
    let r = (x - k * LN2_H) - k * LN2_L;
    // Taylor to degree 11 on |r| ≤ ln2/2
    let mut p = 1.0 / 39_916_800.0;
    p = p * r + 1.0 / 3_628_800.0;
    p = p * r + 1.0 / 362_880.0;
    p = p * r + 1.0 / 40_320.0;
    p = p * r + 1.0 / 5_040.0;
    p = p * r + 1.0 / 720.0;
    p = p * r + 1.0 / 120.0;
    p = p * r + 1.0 / 24.0;
    p = p * r + 1.0 / 6.0;
    p = p * r + 0.5;
    p = p * r + 1.0;
    p = p * r + 1.0;
    let scale = f64::from_bits(((k as i64 + 1023) as u64) << 52);
    p * scale
}

fn exp_block_u35(src: &[f64], dst: &mut [f64]) {
    lanewise!(src, dst, exp_fast);
}

#[inline]
fn log_fast(x: f64) -> f64 {
    if x <= 0.0 || !x.is_finite() {
        return x.ln();
    }
    let bits = x.to_bits();
    let mut exp = ((bits >> 52) & 0x7ff) as i64 - 1023;
    let mut mant = f64::from_bits((bits & 0x000f_ffff_ffff_ffff) | 0x3ff0_0000_0000_0000);
    if mant > std::f64::consts::SQRT_2 {
        mant *= 0.5;
        exp += 1;
    }
    let t = (mant - 1.0) / (mant + 1.0);
    let t2 = t * t;
    let mut p = 1.0 / 13.0;
    p = p * t2 + 1.0 / 11.0;
    p = p * t2 + 1.0 / 9.0;
    p = p * t2 + 1.0 / 7.0;
    p = p * t2 + 1.0 / 5.0;
    p = p * t2 + 1.0 / 3.0;
    p = p * t2 + 1.0;
    2.0 * t * p + exp as f64 * std::f64::consts::LN_2
}

fn log_block_u35(src: &[f64], dst: &mut [f64]) {
    lanewise!(src, dst, log_fast);
}

#[inline]
fn tanh_fast(x: f64) -> f64 {
    if x.abs() > 20.0 {
        return x.signum();
    }
    let e = exp_fast(2.0 * x);
    (e - 1.0) / (e + 1.0)
}

fn tanh_block_u35(src: &[f64], dst: &mut [f64]) {
    lanewise!(src, dst, tanh_fast);
}

fn sinpi(x: f64) -> f64 {
    // exact zeros at integers, exact ±1 at half-integers
    let r = x.rem_euclid(2.0);
    if r == 0.0 || r == 1.0 {
        return 0.0;
    }
    if r == 0.5 {
        return 1.0;
    }
    if r == 1.5 {
        return -1.0;
    }
    (r * std::f64::consts::PI).sin()
}

fn cospi(x: f64) -> f64 {
    let r = x.abs().rem_euclid(2.0);
    if r == 0.5 || r == 1.5 {
        return 0.0;
    }
    if r == 0.0 {
        return 1.0;
    }
    if r == 1.0 {
        return -1.0;
    }
    (r * std::f64::consts::PI).cos()
}

/// Error function. Maclaurin series below 2.5, continued fraction above;
/// stays within a few ULP across the real line.
fn erf(x: f64) -> f64 {
    if x.is_nan() {
        return x;
    }
    let ax = x.abs();
    if ax < 2.5 {
        erf_series(x)
    } else {
        let tail = erfc_cf(ax);
        let v = 1.0 - tail;
        if x < 0.0 { -v } else { v }
    }
}

/// Complementary error function.
fn erfc(x: f64) -> f64 {
    if x.is_nan() {
        return x;
    }
    if x >= 2.5 {
        erfc_cf(x)
    } else if x <= -2.5 {
        2.0 - erfc_cf(-x)
    } else {
        1.0 - erf_series(x)
    }
}

fn erf_series(x: f64) -> f64 {
    let x2 = x * x;
    let mut term = x;
    let mut sum = x;
    for n in 1..200 {
        term *= -x2 / n as f64;
        let contrib = term / (2 * n + 1) as f64;
        sum += contrib;
        if contrib.abs() < sum.abs() * 1e-18 {
            break;
        }
    }
    sum * std::f64::consts::FRAC_2_SQRT_PI
}

/// Lentz continued fraction for `erfc`, valid for x ≥ 2.5
fn erfc_cf(x: f64) -> f64 {
    if x > 27.0 {
        // e^{-x²} underflows the product below
        return 0.0;
    }
    let mut f = x;
    let mut c = f;
    let mut d = 0.0;
    for n in 1..200 {
        let a = 0.5 * n as f64;
        d = x + a * d;
        if d == 0.0 {
            d = f64::MIN_POSITIVE;
        }
        c = x + a / c;
        if c == 0.0 {
            c = f64::MIN_POSITIVE;
        }
        d = 1.0 / d;
        let delta = c * d;
        f *= delta;
        if (delta - 1.0).abs() < 1e-17 {
            break;
        }
    }
    (-x * x).exp() / (f * std::f64::consts::PI.sqrt())
}

// Lanczos approximation, g = 7, n = 9
const LANCZOS: [f64; 9] = [
    0.999_999_999_999_809_93,
    676.520_368_121_885_1,
    -1_259.139_216_722_402_8,
    771.323_428_777_653_13,
    -176.615_029_162_140_59,
    12.507_343_278_686_905,
    -0.138_571_095_265_720_12,
    9.984_369_578_019_571_6e-6,
    1.505_632_735_149_311_6e-7,
];

fn tgamma(x: f64) -> f64 {
    if x.is_nan() {
        return x;
    }
    if x < 0.5 {
        // reflection: Γ(x) Γ(1−x) = π / sin(πx)
        let s = sinpi(x);
        if s == 0.0 {
            return f64::NAN; // pole at non-positive integers
        }
        return std::f64::consts::PI / (s * tgamma(1.0 - x));
    }
    let x = x - 1.0;
    let mut acc = LANCZOS[0];
    for (i, &c) in LANCZOS.iter().enumerate().skip(1) {
        acc += c / (x + i as f64);
    }
    let t = x + 7.5;
    (2.0 * std::f64::consts::PI).sqrt() * t.powf(x + 0.5) * (-t).exp() * acc
}

fn lgamma(x: f64) -> f64 {
    if x.is_nan() {
        return x;
    }
    if x < 0.5 {
        let s = sinpi(x).abs();
        if s == 0.0 {
            return f64::INFINITY;
        }
        return std::f64::consts::PI.ln() - s.ln() - lgamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut acc = LANCZOS[0];
    for (i, &c) in LANCZOS.iter().enumerate().skip(1) {
        acc += c / (x + i as f64);
    }
    let t = x + 7.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + acc.ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST: EvalParams = EvalParams {
        ulp_mode: UlpMode::Ulp35,
        disable_simd: false,
    };

    #[test]
    fn pythagorean_identity_both_tiers() {
        let xs: Vec<f64> = (0..1024).map(|i| (i as f64 - 512.0) * 0.37).collect();
        let mut sin = vec![0.0; xs.len()];
        let mut cos = vec![0.0; xs.len()];

        unary_f64(MathOp::Sin, EvalParams::default(), &xs, &mut sin);
        unary_f64(MathOp::Cos, EvalParams::default(), &xs, &mut cos);
        for i in 0..xs.len() {
            assert!((sin[i] * sin[i] + cos[i] * cos[i] - 1.0).abs() < 5e-15);
        }

        unary_f64(MathOp::Sin, FAST, &xs, &mut sin);
        unary_f64(MathOp::Cos, FAST, &xs, &mut cos);
        for i in 0..xs.len() {
            assert!((sin[i] * sin[i] + cos[i] * cos[i] - 1.0).abs() < 5e-11);
        }
    }

    #[test]
    fn fast_tier_tracks_libm() {
        for i in 0..2000 {
            let x = (i as f64 - 1000.0) * 0.31;
            assert!(
                (exp_fast(x) - x.exp()).abs() <= x.exp() * 1e-12,
                "exp({x})"
            );
            if x > 0.0 {
                assert!((log_fast(x) - x.ln()).abs() < 5e-12, "log({x})");
            }
            assert!((tanh_fast(x) - x.tanh()).abs() < 1e-11, "tanh({x})");
            assert!((sin_fast(x, false) - x.sin()).abs() < 5e-12, "sin({x})");
            assert!((sin_fast(x, true) - x.cos()).abs() < 5e-12, "cos({x})");
        }
    }

    #[test]
    fn special_functions() {
        assert!((erf(0.0)).abs() < 1e-15);
        assert!((erf(1.0) - 0.842_700_792_949_714_9).abs() < 1e-13);
        assert!((erfc(1.0) - 0.157_299_207_050_285_13).abs() < 1e-13);
        assert!((erf(3.0) - 0.999_977_909_503_001_4).abs() < 1e-13);
        assert!((erf(-2.0) + erf(2.0)).abs() < 1e-15);
        assert!((erfc(5.0) - 1.537_459_794_428_035e-12).abs() < 1e-20);

        assert!((tgamma(5.0) - 24.0).abs() < 1e-10);
        assert!((tgamma(0.5) - std::f64::consts::PI.sqrt()).abs() < 1e-12);
        assert!((lgamma(10.0) - 12.801_827_480_081_469).abs() < 1e-10);
        assert!(tgamma(-1.0).is_nan());
    }

    #[test]
    fn sinpi_exact_points() {
        assert_eq!(sinpi(3.0), 0.0);
        assert_eq!(sinpi(2.5), 1.0);
        assert_eq!(sinpi(1.5), -1.0);
        assert_eq!(cospi(1.0), -1.0);
        assert_eq!(cospi(0.5), 0.0);
        assert_eq!(cospi(-2.0), 1.0);
    }

    #[test]
    fn policy_stack_nests() {
        assert_eq!(current_policy(), process_default_params());
        let g1 = push_policy(FAST);
        assert_eq!(current_policy(), FAST);
        {
            let g2 = push_policy(EvalParams::default());
            assert_eq!(current_policy(), EvalParams::default());
            drop(g2);
        }
        assert_eq!(current_policy(), FAST);
        drop(g1);
        assert_eq!(current_policy(), process_default_params());
    }
}
