use miniexpr::{CompileErrorKind, Dtype, Expression, VarDecl};

fn eval_f64(e: &Expression, x: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0f64; x.len()];
    e.eval(&[x.into()], &mut out.as_mut_slice().into(), x.len(), None)
        .unwrap();
    out
}

#[test]
fn straight_line_kernel() {
    let e = Expression::compile(
        "def kernel(x):\n    t = x * x\n    return t + 1.0\n",
        &[VarDecl::new("x", Dtype::F64)],
        None,
    )
    .unwrap();
    assert_eq!(e.dtype(), Dtype::F64);
    assert_eq!(eval_f64(&e, &[1.0, 2.0, 3.0]), vec![2.0, 5.0, 10.0]);
}

#[test]
fn masked_if_in_vector_dialect() {
    let e = Expression::compile(
        "def kernel(x):\n    y = x\n    if x > 2.0:\n        y = x * 10.0\n    return y\n",
        &[VarDecl::new("x", Dtype::F64)],
        None,
    )
    .unwrap();
    assert_eq!(
        eval_f64(&e, &[1.0, 2.0, 3.0, 4.0]),
        vec![1.0, 2.0, 30.0, 40.0]
    );
}

#[test]
fn if_elif_else_chain() {
    let src = "def kernel(x):\n    if x > 1.0:\n        return 2.0\n    elif x > 0.0:\n        return 1.0\n    else:\n        return 0.0\n";
    let e = Expression::compile(src, &[VarDecl::new("x", Dtype::F64)], None).unwrap();
    assert_eq!(
        eval_f64(&e, &[-1.0, 0.5, 5.0, 0.0]),
        vec![0.0, 1.0, 2.0, 0.0]
    );
}

#[test]
fn dialects_agree_on_lane_independent_programs() {
    let body = "def kernel(x):\n    acc = 0.0\n    for i in range(5):\n        acc += x\n        if acc > 3.0:\n            break\n    return acc\n";
    let vector = Expression::compile(body, &[VarDecl::new("x", Dtype::F64)], None).unwrap();
    let element_src = format!("# me:dialect=element\n{body}");
    let element =
        Expression::compile(&element_src, &[VarDecl::new("x", Dtype::F64)], None).unwrap();
    let x = [1.0, 0.1, 2.0, -0.5, 0.0];
    assert_eq!(eval_f64(&vector, &x), eval_f64(&element, &x));
    assert_eq!(eval_f64(&vector, &x), vec![4.0, 0.5, 4.0, -2.5, 0.0]);
}

#[test]
fn continue_skips_an_iteration() {
    let src = "def kernel(x):\n    acc = 0.0\n    for i in range(4):\n        if i == 1:\n            continue\n        acc += x\n    return acc\n";
    let e = Expression::compile(src, &[VarDecl::new("x", Dtype::F64)], None).unwrap();
    assert_eq!(eval_f64(&e, &[1.0, 2.0]), vec![3.0, 6.0]);
}

#[test]
fn where_select_inside_kernel() {
    let src = "def kernel(a, b):\n    return where(a > b, a, b)\n";
    let e = Expression::compile(
        src,
        &[VarDecl::new("a", Dtype::F64), VarDecl::new("b", Dtype::F64)],
        None,
    )
    .unwrap();
    let a = [1.0f64, 9.0, 4.0];
    let b = [2.0f64, 3.0, 4.0];
    let mut out = [0.0f64; 3];
    e.eval(
        &[a.as_slice().into(), b.as_slice().into()],
        &mut out.as_mut_slice().into(),
        3,
        None,
    )
    .unwrap();
    assert_eq!(out, [2.0, 9.0, 4.0]);
}

#[test]
fn any_reduces_across_the_block() {
    // `any` sees every lane of the block at once in the vector dialect
    let src = "def kernel(x):\n    if any(x > 100.0):\n        return x + 1.0\n    return x\n";
    let e = Expression::compile(src, &[VarDecl::new("x", Dtype::F64)], None).unwrap();
    // no lane above 100: the `if` body never runs
    assert_eq!(eval_f64(&e, &[1.0, 2.0]), vec![1.0, 2.0]);
    // one lane above 100 makes the reduced condition true; the body runs
    // under the full mask conjunction, which every lane passes
    let got = eval_f64(&e, &[1.0, 200.0]);
    assert_eq!(got, vec![2.0, 201.0]);
}

#[test]
fn integer_kernels_keep_integer_dtypes() {
    let src = "def kernel(n):\n    t = n * n\n    return t + n\n";
    let e = Expression::compile(src, &[VarDecl::new("n", Dtype::I32)], None).unwrap();
    assert_eq!(e.dtype(), Dtype::I32);
    let n = [1i32, 2, 3, 4];
    let mut out = [0i32; 4];
    e.eval(&[n.as_slice().into()], &mut out.as_mut_slice().into(), 4, None)
        .unwrap();
    assert_eq!(out, [2, 6, 12, 20]);
}

#[test]
fn augmented_assignment_reads_the_parameter() {
    let src = "def kernel(x):\n    x += 1.0\n    x *= 2.0\n    return x\n";
    let e = Expression::compile(src, &[VarDecl::new("x", Dtype::F64)], None).unwrap();
    assert_eq!(eval_f64(&e, &[0.0, 1.5]), vec![2.0, 5.0]);
}

#[test]
fn nested_loops() {
    let src = "# me:dialect=element\ndef kernel(x):\n    acc = 0.0\n    for i in range(3):\n        for j in range(3):\n            if j > i:\n                break\n            acc += x\n    return acc\n";
    let e = Expression::compile(src, &[VarDecl::new("x", Dtype::F64)], None).unwrap();
    // inner loop contributes 1 + 2 + 3 iterations
    assert_eq!(eval_f64(&e, &[1.0, 0.5]), vec![6.0, 3.0]);
}

#[test]
fn lanes_without_return_yield_zero() {
    let src = "def kernel(x):\n    if x > 0.0:\n        return x\n    t = x\n    return t * -1.0\n";
    let e = Expression::compile(src, &[VarDecl::new("x", Dtype::F64)], None).unwrap();
    assert_eq!(eval_f64(&e, &[3.0, -4.0, 0.0]), vec![3.0, 4.0, 0.0]);
}

#[test]
fn kernel_output_cast() {
    let src = "def kernel(x):\n    return x * 2.5\n";
    let e = Expression::compile(src, &[VarDecl::new("x", Dtype::F64)], Some(Dtype::I32)).unwrap();
    assert_eq!(e.dtype(), Dtype::I32);
    let x = [1.0f64, 2.0];
    let mut out = [0i32; 2];
    e.eval(&[x.as_slice().into()], &mut out.as_mut_slice().into(), 2, None)
        .unwrap();
    assert_eq!(out, [2, 5]);
}

#[test]
fn kernel_errors() {
    let vars = [VarDecl::new("x", Dtype::F64)];
    // missing return
    let err = Expression::compile("def kernel(x):\n    y = x\n", &vars, None).unwrap_err();
    assert_eq!(err.kind, CompileErrorKind::Syntax);
    // bad indentation
    let err = Expression::compile("def kernel(x):\nreturn x\n", &vars, None).unwrap_err();
    assert_eq!(err.kind, CompileErrorKind::Syntax);
    // unknown parameter
    let err = Expression::compile("def kernel(q):\n    return q\n", &vars, None).unwrap_err();
    assert_eq!(err.kind, CompileErrorKind::UnresolvedName);
    // narrowing reassignment
    let err = Expression::compile(
        "def kernel(x):\n    t = 1\n    t = x\n    return t\n",
        &vars,
        None,
    )
    .unwrap_err();
    assert_eq!(err.kind, CompileErrorKind::TypeMismatch);
}

#[test]
fn kernel_over_multiple_blocks() {
    // spans several interpreter blocks; lane behaviour must not change
    let src = "def kernel(x):\n    y = x * 2.0\n    if x > 1000.0:\n        y = 0.0 - y\n    return y\n";
    let e = Expression::compile(src, &[VarDecl::new("x", Dtype::F64)], None).unwrap();
    let n = 3000;
    let x: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let out = eval_f64(&e, &x);
    for (i, v) in out.iter().enumerate() {
        let expect = if i as f64 > 1000.0 {
            -2.0 * i as f64
        } else {
            2.0 * i as f64
        };
        assert_eq!(*v, expect, "lane {i}");
    }
}
