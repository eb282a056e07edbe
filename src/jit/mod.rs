//! Native compilation of DSL kernels through an external C compiler. Every
//! failure in here is swallowed: the engine logs a debug event and runs the
//! interpreter instead. Nothing is ever printed to stdout.

pub(crate) mod cache;

use std::collections::HashSet;
use std::ffi::c_void;
use std::os::raw::c_long;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use tempfile::TempPath;
use tracing::debug;

use crate::dsl::{DslProgram, lower};
use crate::dtype::Dtype;
use crate::eval::IndexBlock;
use crate::nd::NdLayout;
use crate::simd;
use crate::var::Binding;

type Entry = unsafe extern "C" fn(*const *const c_void, *mut c_void, c_long, *const c_long);

/// A loaded native kernel. The library (and the backing file) stay alive
/// for as long as any expression holds a reference.
pub(crate) struct JitKernel {
    entry: Entry,
    _lib: libloading::Library,
    _so: TempPath,
    /// The generated kernel expects the reserved-index buffer
    pub uses_index_vars: bool,
    pub synth_index: bool,
}

impl JitKernel {
    /// # Safety
    /// `inputs` must hold one valid pointer per data binding, each covering
    /// `nitems` elements of the declared dtype; `output` must cover
    /// `nitems` elements of the output dtype; `indices` must follow the
    /// layout produced by [`build_indices`] (null when unused).
    pub(crate) unsafe fn call(
        &self,
        inputs: &[*const c_void],
        output: *mut c_void,
        nitems: usize,
        indices: *const c_long,
    ) {
        unsafe { (self.entry)(inputs.as_ptr(), output, nitems as c_long, indices) }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => v == "1",
        Err(_) => default,
    }
}

pub(crate) fn jit_enabled() -> bool {
    env_flag("DSL_JIT", false)
}

fn compiler_backend() -> &'static str {
    static BACKEND: Lazy<String> =
        Lazy::new(|| std::env::var("BENCH_COMPILER").unwrap_or_else(|_| "cc".into()));
    match BACKEND.as_str() {
        "tcc" => "tcc",
        _ => "cc",
    }
}

static FAILED: Lazy<Mutex<HashSet<[u8; 32]>>> = Lazy::new(|| Mutex::new(HashSet::new()));

const COMPILE_TIMEOUT: Duration = Duration::from_secs(20);

/// Attempts to produce a native kernel for `prog`. Any gate, compile
/// failure, timeout or load failure returns `None` and memoises the
/// fingerprint so the same kernel is not recompiled in this process.
pub(crate) fn try_compile(
    source: &str,
    prog: &DslProgram,
    bindings: &[Binding],
    out_dtype: Dtype,
    layout: Option<&NdLayout>,
) -> Option<Arc<JitKernel>> {
    if !jit_enabled() {
        return None;
    }
    if prog.uses_index_vars && !env_flag("DSL_JIT_INDEX_VARS", true) {
        debug!("jit disabled: kernel uses reserved index variables");
        return None;
    }
    let synth = env_flag("DSL_JIT_INDEX_VARS_SYNTH", false);
    let lowered = match lower::lower(prog, bindings, out_dtype, synth) {
        Some(l) => l,
        None => {
            debug!("jit disabled: kernel uses constructs the backend cannot express");
            return None;
        }
    };
    let compiler = compiler_backend();
    let param_dtypes: Vec<Dtype> = bindings
        .iter()
        .filter(|b| !b.is_function())
        .map(|b| b.dtype)
        .collect();
    let fp = cache::fingerprint(
        source,
        &param_dtypes,
        out_dtype,
        layout,
        compiler,
        prog.dialect,
        simd::process_default_params().ulp_mode,
    );
    if FAILED.lock().is_ok_and(|set| set.contains(&fp)) {
        return None;
    }
    match build_kernel(&fp, &lowered, &param_dtypes, compiler) {
        Some(kernel) => Some(Arc::new(kernel)),
        None => {
            if let Ok(mut set) = FAILED.lock() {
                set.insert(fp);
            }
            None
        }
    }
}

fn build_kernel(
    fp: &[u8; 32],
    lowered: &lower::Lowered,
    param_dtypes: &[Dtype],
    compiler: &str,
) -> Option<JitKernel> {
    let dir = cache::cache_dir();
    if std::fs::create_dir_all(&dir).is_err() {
        debug!(dir = %dir.display(), "jit cache directory is not writable");
        return None;
    }
    let header = cache::Header::current(param_dtypes, compiler);
    let entry_path = cache::entry_path(&dir, fp);
    let so_bytes = match cache::read_entry(&entry_path, &header) {
        Some(bytes) => bytes,
        None => {
            let bytes = compile_c(&lowered.c_source, compiler)?;
            if let Err(err) = cache::write_entry(&dir, &entry_path, &header, &bytes) {
                debug!(error = %err, "failed to publish jit cache entry");
            }
            bytes
        }
    };
    load_object(&so_bytes, lowered)
}

/// Runs the external compiler on a scratch file with a wall-clock bound.
fn compile_c(c_source: &str, compiler: &str) -> Option<Vec<u8>> {
    let dir = tempfile::tempdir().ok()?;
    let c_path = dir.path().join("kernel.c");
    let so_path = dir.path().join("kernel.so");
    std::fs::write(&c_path, c_source).ok()?;
    let mut child = Command::new(compiler)
        .arg("-shared")
        .arg("-fPIC")
        .arg("-O2")
        .arg("-o")
        .arg(&so_path)
        .arg(&c_path)
        .arg("-lm")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| debug!(compiler, error = %err, "jit backend unavailable"))
        .ok()?;
    let start = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if start.elapsed() > COMPILE_TIMEOUT {
                    let _ = child.kill();
                    let _ = child.wait();
                    debug!(compiler, "jit compile timed out");
                    return None;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(_) => return None,
        }
    };
    if !status.success() {
        debug!(compiler, code = ?status.code(), "jit compile failed");
        return None;
    }
    std::fs::read(&so_path).ok()
}

/// Writes the object bytes back to disk and loads the entry symbol. The
/// file must outlive the library handle.
fn load_object(so_bytes: &[u8], lowered: &lower::Lowered) -> Option<JitKernel> {
    let mut tmp = tempfile::Builder::new()
        .prefix("miniexpr-kernel-")
        .suffix(".so")
        .tempfile()
        .ok()?;
    std::io::Write::write_all(&mut tmp, so_bytes).ok()?;
    let so: TempPath = tmp.into_temp_path();
    let so_path: PathBuf = so.to_path_buf();
    unsafe {
        let lib = libloading::Library::new(&so_path)
            .map_err(|err| debug!(error = %err, "jit object failed to load"))
            .ok()?;
        let entry = {
            let sym: libloading::Symbol<'_, Entry> = lib
                .get(b"kernel_block\0")
                .map_err(|err| debug!(error = %err, "jit object lacks kernel_block"))
                .ok()?;
            *sym
        };
        Some(JitKernel {
            entry,
            _lib: lib,
            _so: so,
            uses_index_vars: lowered.uses_index_vars,
            synth_index: lowered.synth_index,
        })
    }
}

/// Serialises the reserved-index data for one call:
/// `[rank, shape[r], block[r], gstart[r]]` followed (in read mode) by the
/// per-dimension block-local columns and the flat column.
pub(crate) fn build_indices(
    idx: &IndexBlock,
    block_dims: &[usize],
    global_start: &[usize],
    nitems: usize,
    synth: bool,
) -> Vec<c_long> {
    let rank = idx.rank;
    let mut out: Vec<c_long> = Vec::with_capacity(1 + 3 * rank + (rank + 1) * nitems);
    out.push(rank as c_long);
    out.extend(idx.shape.iter().map(|&s| s as c_long));
    out.extend(block_dims.iter().map(|&b| b as c_long));
    out.extend(global_start.iter().map(|&g| g as c_long));
    if !synth {
        for col in &idx.dims {
            out.extend(col.iter().map(|&v| v as c_long));
        }
        out.extend(idx.flat.iter().map(|&v| v as c_long));
    }
    out
}
