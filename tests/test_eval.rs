use std::sync::Arc;

use num::complex::Complex64;

use miniexpr::{
    BufferMut, BufferRef, CompileErrorKind, Dtype, EvalParams, Expression, UlpMode, VarDecl,
};

fn f64_var(name: &str) -> VarDecl {
    VarDecl::new(name, Dtype::F64)
}

#[test]
fn add_two_f64_vectors() {
    let e = Expression::compile("a + b", &[f64_var("a"), f64_var("b")], None).unwrap();
    assert_eq!(e.dtype(), Dtype::F64);
    let a = [1.0, 2.0, 3.0];
    let b = [10.0, 20.0, 30.0];
    let mut out = [0.0f64; 3];
    e.eval(
        &[a.as_slice().into(), b.as_slice().into()],
        &mut out.as_mut_slice().into(),
        3,
        None,
    )
    .unwrap();
    assert_eq!(out, [11.0, 22.0, 33.0]);
}

#[test]
fn mixed_int_float_promotes_to_f64() {
    let e = Expression::compile(
        "a + b",
        &[VarDecl::new("a", Dtype::I32), f64_var("b")],
        None,
    )
    .unwrap();
    assert_eq!(e.dtype(), Dtype::F64);
    let a = [1i32, 2, 3];
    let b = [0.1f64, 0.2, 0.3];
    let mut out = [0.0f64; 3];
    e.eval(
        &[a.as_slice().into(), b.as_slice().into()],
        &mut out.as_mut_slice().into(),
        3,
        None,
    )
    .unwrap();
    for (got, want) in out.iter().zip([1.1, 2.2, 3.3]) {
        assert!((got - want).abs() < 1e-12);
    }
}

#[test]
fn count_nonzero_reduction() {
    let e = Expression::compile("sum(x != 0)", &[VarDecl::new("x", Dtype::I32)], Some(Dtype::I64))
        .unwrap();
    assert_eq!(e.dtype(), Dtype::I64);
    let x = [0i32, 1, 2, 0, 3, 0, 4, 5];
    let mut out = [0i64; 1];
    e.eval(
        &[x.as_slice().into()],
        &mut out.as_mut_slice().into(),
        8,
        None,
    )
    .unwrap();
    assert_eq!(out[0], 5);
}

#[test]
fn pythagorean_identity_under_both_ulp_modes() {
    let e = Expression::compile("sin(a)*sin(a) + cos(a)*cos(a)", &[f64_var("a")], None).unwrap();
    let a: Vec<f64> = (0..1024).map(|i| (i as f64 - 512.0) * 0.11).collect();
    let mut out = vec![0.0f64; 1024];

    e.eval(
        &[a.as_slice().into()],
        &mut out.as_mut_slice().into(),
        1024,
        Some(EvalParams {
            ulp_mode: UlpMode::Ulp1,
            disable_simd: false,
        }),
    )
    .unwrap();
    for v in &out {
        assert!((v - 1.0).abs() < 5e-15);
    }

    e.eval(
        &[a.as_slice().into()],
        &mut out.as_mut_slice().into(),
        1024,
        Some(EvalParams {
            ulp_mode: UlpMode::Ulp35,
            disable_simd: false,
        }),
    )
    .unwrap();
    for v in &out {
        assert!((v - 1.0).abs() < 5e-11);
    }
}

#[test]
fn chunked_evaluation_is_transparent() {
    let e = Expression::compile(
        "sin(a) * b + 1.5",
        &[f64_var("a"), f64_var("b")],
        None,
    )
    .unwrap();
    let n = 2500;
    let a: Vec<f64> = (0..n).map(|i| i as f64 * 0.01).collect();
    let b: Vec<f64> = (0..n).map(|i| 1.0 + (i % 7) as f64).collect();

    let mut whole = vec![0.0f64; n];
    e.eval(
        &[a.as_slice().into(), b.as_slice().into()],
        &mut whole.as_mut_slice().into(),
        n,
        None,
    )
    .unwrap();

    // the same inputs presented as unaligned contiguous partitions
    let mut pieces = vec![0.0f64; n];
    for (start, end) in [(0usize, 700usize), (700, 1803), (1803, n)] {
        let mut out_part = vec![0.0f64; end - start];
        e.eval(
            &[a[start..end].into(), b[start..end].into()],
            &mut out_part.as_mut_slice().into(),
            end - start,
            None,
        )
        .unwrap();
        pieces[start..end].copy_from_slice(&out_part);
    }
    assert_eq!(whole, pieces);
}

#[test]
fn scalar_inputs_broadcast() {
    let e = Expression::compile("a * b + a", &[f64_var("a"), f64_var("b")], None).unwrap();
    let a = [2.0f64];
    let b = [1.0f64, 2.0, 3.0, 4.0];
    let mut out = [0.0f64; 4];
    e.eval(
        &[a.as_slice().into(), b.as_slice().into()],
        &mut out.as_mut_slice().into(),
        4,
        None,
    )
    .unwrap();
    assert_eq!(out, [4.0, 6.0, 8.0, 10.0]);
}

#[test]
fn constant_expression_fills_output() {
    let e = Expression::compile("2 + 3", &[], Some(Dtype::I32)).unwrap();
    let mut out = [0i32; 5];
    e.eval(&[], &mut out.as_mut_slice().into(), 5, None).unwrap();
    assert_eq!(out, [5; 5]);
}

#[test]
fn integer_semantics() {
    // xor, shifts, wrapping division rules
    let e = Expression::compile("(a ^ 3) + (a << 1) + b / (a - a)", &[
        VarDecl::new("a", Dtype::I32),
        VarDecl::new("b", Dtype::I32),
    ], None)
    .unwrap();
    assert_eq!(e.dtype(), Dtype::I32);
    let a = [1i32, 2, 3];
    let b = [100i32, 200, 300];
    let mut out = [0i32; 3];
    e.eval(
        &[a.as_slice().into(), b.as_slice().into()],
        &mut out.as_mut_slice().into(),
        3,
        None,
    )
    .unwrap();
    // division by zero contributes zero
    assert_eq!(out, [(1 ^ 3) + 2, (2 ^ 3) + 4, (3 ^ 3) + 6]);
}

#[test]
fn power_operator_is_star_star() {
    let e = Expression::compile("a ** 2 + a ** 0.5", &[f64_var("a")], None).unwrap();
    let a = [4.0f64, 9.0];
    let mut out = [0.0f64; 2];
    e.eval(&[a.as_slice().into()], &mut out.as_mut_slice().into(), 2, None)
        .unwrap();
    assert!((out[0] - 18.0).abs() < 1e-12);
    assert!((out[1] - 84.0).abs() < 1e-12);
}

#[test]
fn f32_pipeline_stays_f32() {
    let e = Expression::compile("a * 2.5 + 0.5", &[VarDecl::new("a", Dtype::F32)], None).unwrap();
    assert_eq!(e.dtype(), Dtype::F32);
    let a = [1.0f32, 2.0];
    let mut out = [0.0f32; 2];
    e.eval(&[a.as_slice().into()], &mut out.as_mut_slice().into(), 2, None)
        .unwrap();
    assert_eq!(out, [3.0, 5.5]);
}

#[test]
fn where_and_comparison() {
    let e = Expression::compile(
        "where(a > b, a, b)",
        &[f64_var("a"), f64_var("b")],
        None,
    )
    .unwrap();
    let a = [1.0f64, 5.0, 2.0];
    let b = [3.0f64, 4.0, 2.0];
    let mut out = [0.0f64; 3];
    e.eval(
        &[a.as_slice().into(), b.as_slice().into()],
        &mut out.as_mut_slice().into(),
        3,
        None,
    )
    .unwrap();
    assert_eq!(out, [3.0, 5.0, 2.0]);
}

#[test]
fn min_max_prod_reductions() {
    let vars = [VarDecl::new("x", Dtype::I16)];
    let x = [3i16, -2, 7, 5];

    let e = Expression::compile("min(x)", &vars, None).unwrap();
    assert_eq!(e.dtype(), Dtype::I16);
    let mut out = [0i16; 1];
    e.eval(&[x.as_slice().into()], &mut out.as_mut_slice().into(), 4, None)
        .unwrap();
    assert_eq!(out[0], -2);

    let e = Expression::compile("prod(x)", &vars, None).unwrap();
    assert_eq!(e.dtype(), Dtype::I64);
    let mut out = [0i64; 1];
    e.eval(&[x.as_slice().into()], &mut out.as_mut_slice().into(), 4, None)
        .unwrap();
    assert_eq!(out[0], -210);

    let e = Expression::compile("all(x != 0)", &vars, None).unwrap();
    let mut out = [false; 1];
    e.eval(&[x.as_slice().into()], &mut out.as_mut_slice().into(), 4, None)
        .unwrap();
    assert!(out[0]);
}

#[test]
fn reduction_feeds_elementwise_expression() {
    // whole-call reduction broadcast back into a vector expression
    let e = Expression::compile("x - min(x)", &[VarDecl::new("x", Dtype::F64)], None).unwrap();
    let x = [5.0f64, 3.0, 9.0, 3.5];
    let mut out = [0.0f64; 4];
    e.eval(&[x.as_slice().into()], &mut out.as_mut_slice().into(), 4, None)
        .unwrap();
    assert_eq!(out, [2.0, 0.0, 6.0, 0.5]);
}

#[test]
fn complex_arithmetic() {
    let e = Expression::compile("real(a * conj(a))", &[VarDecl::new("a", Dtype::C128)], None)
        .unwrap();
    assert_eq!(e.dtype(), Dtype::F64);
    let a = [Complex64::new(3.0, 4.0), Complex64::new(0.0, 2.0)];
    let mut out = [0.0f64; 2];
    e.eval(&[a.as_slice().into()], &mut out.as_mut_slice().into(), 2, None)
        .unwrap();
    assert!((out[0] - 25.0).abs() < 1e-12);
    assert!((out[1] - 4.0).abs() < 1e-12);
}

#[test]
fn string_predicates() {
    // two items of up to 4 code points each
    let data: Vec<u32> = "abcd\0\0\0\0".chars().map(u32::from).collect();
    let s = BufferRef::Str {
        data: &data,
        itemsize: 16,
    };
    let vars = [VarDecl::string("s", 16)];

    let e = Expression::compile("s == \"abcd\"", &vars, None).unwrap();
    assert_eq!(e.dtype(), Dtype::Bool);
    let mut out = [false; 2];
    e.eval(&[s], &mut out.as_mut_slice().into(), 2, None).unwrap();
    assert_eq!(out, [true, false]);

    let e = Expression::compile("startswith(s, \"ab\")", &vars, None).unwrap();
    e.eval(&[s], &mut out.as_mut_slice().into(), 2, None).unwrap();
    assert_eq!(out, [true, false]);

    let e = Expression::compile("contains(s, \"bc\")", &vars, None).unwrap();
    e.eval(&[s], &mut out.as_mut_slice().into(), 2, None).unwrap();
    assert_eq!(out, [true, false]);
}

#[test]
fn user_functions_and_closures() {
    let clip = VarDecl::function("clip01", 1, Arc::new(|args: &[f64]| args[0].clamp(0.0, 1.0)));
    let e = Expression::compile("clip01(a) * 10.0", &[f64_var("a"), clip], None).unwrap();
    let a = [-0.5f64, 0.25, 2.0];
    let mut out = [0.0f64; 3];
    e.eval(&[a.as_slice().into()], &mut out.as_mut_slice().into(), 3, None)
        .unwrap();
    assert_eq!(out, [0.0, 2.5, 10.0]);

    let offset = 7.5f64;
    let shift = VarDecl::closure("shift", 2, Arc::new(move |args: &[f64]| args[0] + args[1] + offset));
    let e = Expression::compile("shift(a, 1.0)", &[f64_var("a"), shift], None).unwrap();
    e.eval(&[a.as_slice().into()], &mut out.as_mut_slice().into(), 3, None)
        .unwrap();
    assert_eq!(out, [8.0, 8.75, 10.5]);
}

#[test]
fn compile_errors_carry_offsets() {
    let err = Expression::compile("a + nope", &[f64_var("a")], None).unwrap_err();
    assert_eq!(err.kind, CompileErrorKind::UnresolvedName);
    assert_eq!(err.offset, 4);

    let err = Expression::compile("atan2(a)", &[f64_var("a")], None).unwrap_err();
    assert_eq!(err.kind, CompileErrorKind::Arity);

    let err = Expression::compile("a + 'oops", &[f64_var("a")], None).unwrap_err();
    assert_eq!(err.kind, CompileErrorKind::Lex);
    assert_eq!(err.offset, 9);

    let err = Expression::compile("a + (b", &[f64_var("a"), f64_var("b")], None).unwrap_err();
    assert_eq!(err.kind, CompileErrorKind::Syntax);

    let vars = [VarDecl::string("s", 8), f64_var("a")];
    let err = Expression::compile("s + a", &vars, None).unwrap_err();
    assert_eq!(err.kind, CompileErrorKind::TypeMismatch);

    let err =
        Expression::compile("a", &[VarDecl::new("a", Dtype::C64)], Some(Dtype::F64)).unwrap_err();
    assert_eq!(err.kind, CompileErrorKind::TypeUnrepresentable);
}

#[test]
fn eval_shape_errors() {
    let e = Expression::compile("a + b", &[f64_var("a"), f64_var("b")], None).unwrap();
    let a = [1.0f64, 2.0];
    let b = [1.0f64, 2.0];
    let mut out = [0.0f64; 2];

    // missing input
    assert!(
        e.eval(&[a.as_slice().into()], &mut out.as_mut_slice().into(), 2, None)
            .is_err()
    );
    // wrong input dtype
    let bad = [1i32, 2];
    assert!(
        e.eval(
            &[a.as_slice().into(), bad.as_slice().into()],
            &mut out.as_mut_slice().into(),
            2,
            None
        )
        .is_err()
    );
    // wrong output dtype
    let mut bad_out = [0i32; 2];
    assert!(
        e.eval(
            &[a.as_slice().into(), b.as_slice().into()],
            &mut BufferMut::from(bad_out.as_mut_slice()),
            2,
            None
        )
        .is_err()
    );
    // short output buffer
    let mut short = [0.0f64; 1];
    assert!(
        e.eval(
            &[a.as_slice().into(), b.as_slice().into()],
            &mut short.as_mut_slice().into(),
            2,
            None
        )
        .is_err()
    );
}

#[test]
fn optimizer_keeps_results_identical() {
    // identities the optimizer removes must not change values
    let e = Expression::compile(
        "(a + 0) * 1 + (a - 0) / 1 + a ** 1 + 0 * 0",
        &[f64_var("a")],
        None,
    )
    .unwrap();
    let a = [1.5f64, -2.5];
    let mut out = [0.0f64; 2];
    e.eval(&[a.as_slice().into()], &mut out.as_mut_slice().into(), 2, None)
        .unwrap();
    assert_eq!(out, [4.5, -7.5]);
}

#[test]
fn printed_form_reparses_to_an_equivalent_expression() {
    let vars = [f64_var("a"), f64_var("b")];
    for src in [
        "a + b * a",
        "(a + b) * a",
        "-a ** 2 + b",
        "sqrt(a * a + b * b)",
        "where(a > b, a - b, b - a)",
        "sum(a * b) - a",
        "a / (b + 1.5) ** 2",
    ] {
        let first = Expression::compile(src, &vars, None).unwrap();
        let printed = first.to_string();
        let second = Expression::compile(&printed, &vars, None).unwrap();
        assert_eq!(printed, second.to_string(), "printing `{src}` is not stable");
        assert_eq!(first.dtype(), second.dtype());

        let a: Vec<f64> = (0..64).map(|i| 0.25 * i as f64 - 4.0).collect();
        let b: Vec<f64> = (0..64).map(|i| 0.5 * (i % 9) as f64 + 0.5).collect();
        let mut out1 = vec![0.0f64; 64];
        let mut out2 = vec![0.0f64; 64];
        first
            .eval(
                &[a.as_slice().into(), b.as_slice().into()],
                &mut out1.as_mut_slice().into(),
                64,
                None,
            )
            .unwrap();
        second
            .eval(
                &[a.as_slice().into(), b.as_slice().into()],
                &mut out2.as_mut_slice().into(),
                64,
                None,
            )
            .unwrap();
        assert_eq!(out1, out2, "`{src}` changed after a print/parse cycle");
    }
}

#[test]
fn never_writes_past_nitems() {
    let e = Expression::compile("a * 2.0", &[f64_var("a")], None).unwrap();
    let a = [1.0f64, 2.0, 3.0, 4.0];
    let mut out = [7.0f64; 6];
    e.eval(&[a.as_slice().into()], &mut out.as_mut_slice().into(), 4, None)
        .unwrap();
    assert_eq!(out, [2.0, 4.0, 6.0, 8.0, 7.0, 7.0]);
}

#[test]
fn output_cast_applies_on_store() {
    let e = Expression::compile("a * 2.0 + 0.75", &[f64_var("a")], Some(Dtype::I32)).unwrap();
    assert_eq!(e.dtype(), Dtype::I32);
    let a = [1.0f64, 2.0, 3.0];
    let mut out = [0i32; 3];
    e.eval(&[a.as_slice().into()], &mut out.as_mut_slice().into(), 3, None)
        .unwrap();
    assert_eq!(out, [2, 4, 6]);
}

#[test]
fn disable_simd_matches_vector_path() {
    let e = Expression::compile("exp(a) + log(a + 2.0)", &[f64_var("a")], None).unwrap();
    let a: Vec<f64> = (0..512).map(|i| i as f64 * 0.01 - 1.0).collect();
    let mut fast = vec![0.0f64; 512];
    let mut scalar = vec![0.0f64; 512];
    e.eval(
        &[a.as_slice().into()],
        &mut fast.as_mut_slice().into(),
        512,
        Some(EvalParams {
            ulp_mode: UlpMode::Ulp35,
            disable_simd: false,
        }),
    )
    .unwrap();
    e.eval(
        &[a.as_slice().into()],
        &mut scalar.as_mut_slice().into(),
        512,
        Some(EvalParams {
            ulp_mode: UlpMode::Ulp35,
            disable_simd: true,
        }),
    )
    .unwrap();
    for (x, y) in fast.iter().zip(&scalar) {
        assert!((x - y).abs() <= x.abs() * 1e-11 + 1e-12);
    }
}
