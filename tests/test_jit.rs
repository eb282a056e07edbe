use std::process::Command;

use miniexpr::{Dtype, Expression, NdLayout, VarDecl};

fn cc_available() -> bool {
    Command::new("cc")
        .arg("--version")
        .output()
        .is_ok_and(|out| out.status.success())
}

/// One test drives the whole JIT path: the master gate is an environment
/// variable, so everything sharing this process runs in a fixed order.
#[test]
fn jit_matches_interpreter() {
    // SAFETY: single-threaded at this point; this test owns the process.
    unsafe { std::env::remove_var("DSL_JIT") };
    // interpreter-only compile first, before the gate opens
    let vars = [VarDecl::new("x", Dtype::F64), VarDecl::new("y", Dtype::F64)];
    let src = "def kernel(x, y):\n    t = x * y + 0.5\n    return sqrt(t * t + 1.0)\n";
    let plain = Expression::compile(src, &vars, None).unwrap();
    assert!(!plain.has_jit_kernel());

    if !cc_available() {
        return;
    }
    // SAFETY: single-threaded at this point; this test owns the process.
    unsafe { std::env::set_var("DSL_JIT", "1") };

    let jitted = Expression::compile(src, &vars, None).unwrap();
    let n = 2048;
    let x: Vec<f64> = (0..n).map(|i| i as f64 * 0.01 - 5.0).collect();
    let y: Vec<f64> = (0..n).map(|i| ((i * 7) % 13) as f64 * 0.25).collect();
    let mut out_interp = vec![0.0f64; n];
    let mut out_jit = vec![0.0f64; n];
    plain
        .eval(
            &[x.as_slice().into(), y.as_slice().into()],
            &mut out_interp.as_mut_slice().into(),
            n,
            None,
        )
        .unwrap();
    jitted
        .eval(
            &[x.as_slice().into(), y.as_slice().into()],
            &mut out_jit.as_mut_slice().into(),
            n,
            None,
        )
        .unwrap();
    if jitted.has_jit_kernel() {
        for (a, b) in out_interp.iter().zip(&out_jit) {
            assert!((a - b).abs() < 1e-12, "jit diverged: {a} vs {b}");
        }
    } else {
        // backend unavailable at compile time: the interpreter answered
        assert_eq!(out_interp, out_jit);
    }

    // element-dialect control flow through the native path
    let src = "# me:dialect=element\ndef kernel(x, y):\n    acc = 0.0\n    for i in range(6):\n        acc += x\n        if acc > y:\n            break\n    return acc\n";
    let jitted = Expression::compile(src, &vars, None).unwrap();
    let plain_out = {
        // compare against a second compile with the gate closed
        unsafe { std::env::set_var("DSL_JIT", "0") };
        let plain = Expression::compile(src, &vars, None).unwrap();
        assert!(!plain.has_jit_kernel());
        unsafe { std::env::set_var("DSL_JIT", "1") };
        let mut out = vec![0.0f64; n];
        plain
            .eval(
                &[x.as_slice().into(), y.as_slice().into()],
                &mut out.as_mut_slice().into(),
                n,
                None,
            )
            .unwrap();
        out
    };
    let mut out_jit = vec![0.0f64; n];
    jitted
        .eval(
            &[x.as_slice().into(), y.as_slice().into()],
            &mut out_jit.as_mut_slice().into(),
            n,
            None,
        )
        .unwrap();
    for (a, b) in plain_out.iter().zip(&out_jit) {
        assert!((a - b).abs() < 1e-12, "jit control flow diverged: {a} vs {b}");
    }

    // index-variable kernels over an N-D layout agree too
    let layout = NdLayout::new(&[9, 6], &[9, 6], &[3, 6]).unwrap();
    let ivars = [VarDecl::new("x", Dtype::I64)];
    let isrc = "def kernel(x):\n    return _flat_idx + x\n";
    let jitted =
        Expression::compile_nd(isrc, &ivars, None, layout.clone()).unwrap();
    let xi = [5i64; 18];
    let mut out = [0i64; 18];
    jitted
        .eval_nd(&[xi.as_slice().into()], &mut out.as_mut_slice().into(), 0, 1, None)
        .unwrap();
    for i0 in 0..3usize {
        for i1 in 0..6usize {
            assert_eq!(out[i0 * 6 + i1], ((3 + i0) * 6 + i1) as i64 + 5);
        }
    }

    // a second compile of the same kernel is served from the disk cache
    let again = Expression::compile_nd(isrc, &ivars, None, layout).unwrap();
    assert_eq!(again.has_jit_kernel(), jitted.has_jit_kernel());

    unsafe { std::env::remove_var("DSL_JIT") };
}
