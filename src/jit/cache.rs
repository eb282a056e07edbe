//! On-disk cache of compiled kernels, one file per fingerprint under
//! `$TMPDIR/miniexpr-jit/`. Entries are a fixed-width little-endian header
//! followed by the shared-object bytes; they are published by writing to a
//! temporary and renaming, so readers never observe a torn entry. A header
//! mismatch of any kind is a miss and the entry is overwritten.

use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::dtype::Dtype;
use crate::dsl::Dialect;
use crate::nd::NdLayout;
use crate::simd::UlpMode;

pub(crate) const MAGIC: u32 = 0x314A_454D; // "MEJ1"
pub(crate) const VERSION: u32 = 1;
pub(crate) const HEADER_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub magic: u32,
    pub version: u32,
    pub dtype_sig: u64,
    pub arch_tag: u64,
    pub compiler_tag: u64,
}

impl Header {
    pub(crate) fn current(dtypes: &[Dtype], compiler: &str) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            dtype_sig: dtype_signature(dtypes),
            arch_tag: tag64(&format!(
                "{}-{}",
                std::env::consts::ARCH,
                std::env::consts::OS
            )),
            compiler_tag: tag64(compiler),
        }
    }

    pub(crate) fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..16].copy_from_slice(&self.dtype_sig.to_le_bytes());
        out[16..24].copy_from_slice(&self.arch_tag.to_le_bytes());
        out[24..32].copy_from_slice(&self.compiler_tag.to_le_bytes());
        out
    }

    pub(crate) fn from_bytes(data: &[u8]) -> Option<Self> {
        let data: &[u8; HEADER_LEN] = data.get(..HEADER_LEN)?.try_into().ok()?;
        Some(Self {
            magic: u32::from_le_bytes(data[0..4].try_into().ok()?),
            version: u32::from_le_bytes(data[4..8].try_into().ok()?),
            dtype_sig: u64::from_le_bytes(data[8..16].try_into().ok()?),
            arch_tag: u64::from_le_bytes(data[16..24].try_into().ok()?),
            compiler_tag: u64::from_le_bytes(data[24..32].try_into().ok()?),
        })
    }
}

fn tag64(text: &str) -> u64 {
    let digest = Sha256::digest(text.as_bytes());
    u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

fn dtype_signature(dtypes: &[Dtype]) -> u64 {
    let codes: Vec<u8> = dtypes.iter().map(|&d| u8::from(d)).collect();
    let digest = Sha256::digest(&codes);
    u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Deterministic identity of a generated kernel: source text, parameter
/// dtypes, layout, engine version, compiler, dialect and accuracy mode.
pub(crate) fn fingerprint(
    source: &str,
    dtypes: &[Dtype],
    out_dtype: Dtype,
    layout: Option<&NdLayout>,
    compiler: &str,
    dialect: Dialect,
    ulp_mode: UlpMode,
) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(source.as_bytes());
    h.update([0xff]);
    h.update(dtypes.iter().map(|&d| u8::from(d)).collect::<Vec<_>>());
    h.update([u8::from(out_dtype)]);
    if let Some(layout) = layout {
        for dims in [layout.shape(), layout.chunk_shape(), layout.block_shape()] {
            for &d in dims {
                h.update((d as u64).to_le_bytes());
            }
            h.update([0xfe]);
        }
    }
    h.update(VERSION.to_le_bytes());
    h.update(compiler.as_bytes());
    h.update([matches!(dialect, Dialect::Element) as u8]);
    h.update([matches!(ulp_mode, UlpMode::Ulp35) as u8]);
    h.finalize().into()
}

pub(crate) fn cache_dir() -> PathBuf {
    std::env::temp_dir().join("miniexpr-jit")
}

pub(crate) fn entry_path(dir: &Path, fp: &[u8; 32]) -> PathBuf {
    let mut name = String::with_capacity(64);
    for b in fp {
        name.push_str(&format!("{b:02x}"));
    }
    dir.join(name)
}

/// Reads an entry's shared-object bytes. A short file or any header field
/// mismatch is a miss; the read is retried once to tolerate racing with a
/// concurrent writer mid-rename.
pub(crate) fn read_entry(path: &Path, expect: &Header) -> Option<Vec<u8>> {
    for _ in 0..2 {
        if let Some(bytes) = read_once(path, expect) {
            return Some(bytes);
        }
    }
    None
}

fn read_once(path: &Path, expect: &Header) -> Option<Vec<u8>> {
    let data = std::fs::read(path).ok()?;
    let header = Header::from_bytes(&data)?;
    (header == *expect).then(|| data[HEADER_LEN..].to_vec())
}

/// Publishes an entry atomically: write to a temporary in the same
/// directory, then rename over the destination.
pub(crate) fn write_entry(
    dir: &Path,
    path: &Path,
    header: &Header,
    so_bytes: &[u8],
) -> std::io::Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&header.to_bytes())?;
    tmp.write_all(so_bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let h = Header::current(&[Dtype::F64, Dtype::I32], "cc");
        assert_eq!(Header::from_bytes(&h.to_bytes()), Some(h));
        assert_eq!(h.magic, MAGIC);

        let other = Header::current(&[Dtype::F64, Dtype::I32], "tcc");
        assert_ne!(h.compiler_tag, other.compiler_tag);
        assert_eq!(h.arch_tag, other.arch_tag);
    }

    #[test]
    fn fingerprint_is_sensitive() {
        let a = fingerprint("return x\n", &[Dtype::F64], Dtype::F64, None, "cc", Dialect::Vector, UlpMode::Ulp1);
        let b = fingerprint("return x\n", &[Dtype::F32], Dtype::F64, None, "cc", Dialect::Vector, UlpMode::Ulp1);
        let c = fingerprint("return x\n", &[Dtype::F64], Dtype::F64, None, "cc", Dialect::Element, UlpMode::Ulp1);
        let d = fingerprint("return x\n", &[Dtype::F64], Dtype::F64, None, "cc", Dialect::Vector, UlpMode::Ulp1);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, d);
    }

    #[test]
    fn entry_round_trip_and_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let h = Header::current(&[Dtype::F64], "cc");
        let fp = [7u8; 32];
        let path = entry_path(dir.path(), &fp);
        write_entry(dir.path(), &path, &h, b"not really elf").unwrap();
        assert_eq!(read_entry(&path, &h).unwrap(), b"not really elf");

        // a different expectation is a miss
        let other = Header::current(&[Dtype::I8], "cc");
        assert!(read_entry(&path, &other).is_none());

        // truncated file is a miss, not an error
        std::fs::write(&path, [0u8; 7]).unwrap();
        assert!(read_entry(&path, &h).is_none());
    }
}
