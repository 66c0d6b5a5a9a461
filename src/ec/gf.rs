//! GF(2^8) Matrix Primitives
//!
//! Matrix generation, inversion and table-driven vector multiply over the
//! Galois field exposed by the `reed-solomon-erasure` crate. Matrices are
//! stored row-major in flat byte vectors.

use reed_solomon_erasure::galois_8::Field as Gf8;
use reed_solomon_erasure::Field;

use crate::error::{try_alloc, Error, Result};

// =============================================================================
// Matrix Operations
// =============================================================================

/// Generate a systematic `(k + p) x k` encode matrix
///
/// The top `k` rows form the identity so data cells pass through unchanged.
/// Built from a Vandermonde matrix multiplied by the inverse of its top
/// square, which keeps every `k`-row subset invertible.
pub fn gen_encode_matrix(k: usize, p: usize) -> Result<Vec<u8>> {
    if k == 0 {
        return Err(Error::InvalidEcConfig("k must be > 0".into()));
    }
    let n = k + p;
    if n > Gf8::ORDER {
        return Err(Error::InvalidEcConfig(format!(
            "{} targets exceed GF(2^8) order",
            n
        )));
    }

    let mut vander = vec![0u8; n * k];
    for r in 0..n {
        for c in 0..k {
            vander[r * k + c] = Gf8::exp(Gf8::nth(r), c);
        }
    }

    let top_inv = invert_matrix(&vander[..k * k], k)?;
    mul_matrix(&vander, &top_inv, n, k, k)
}

/// Multiply `a` (`rows x inner`) by `b` (`inner x cols`)
pub fn mul_matrix(a: &[u8], b: &[u8], rows: usize, inner: usize, cols: usize) -> Result<Vec<u8>> {
    if a.len() != rows * inner || b.len() != inner * cols {
        return Err(Error::MatrixError(format!(
            "cannot multiply {}x{} by {}x{} with buffers of {} and {} bytes",
            rows,
            inner,
            inner,
            cols,
            a.len(),
            b.len()
        )));
    }

    let mut out = vec![0u8; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            let mut acc = Gf8::zero();
            for x in 0..inner {
                acc = Gf8::add(acc, Gf8::mul(a[r * inner + x], b[x * cols + c]));
            }
            out[r * cols + c] = acc;
        }
    }
    Ok(out)
}

/// Invert an `n x n` matrix with Gauss-Jordan elimination
pub fn invert_matrix(matrix: &[u8], n: usize) -> Result<Vec<u8>> {
    if matrix.len() != n * n {
        return Err(Error::MatrixError(format!(
            "expected {}x{} matrix, got {} bytes",
            n,
            n,
            matrix.len()
        )));
    }

    let mut work = matrix.to_vec();
    let mut inv = vec![0u8; n * n];
    for i in 0..n {
        inv[i * n + i] = Gf8::one();
    }

    for col in 0..n {
        let pivot = (col..n)
            .find(|&r| work[r * n + col] != 0)
            .ok_or_else(|| Error::MatrixError("matrix is singular".into()))?;
        if pivot != col {
            swap_rows(&mut work, n, pivot, col);
            swap_rows(&mut inv, n, pivot, col);
        }

        let scale = Gf8::div(Gf8::one(), work[col * n + col]);
        for c in 0..n {
            work[col * n + c] = Gf8::mul(work[col * n + c], scale);
            inv[col * n + c] = Gf8::mul(inv[col * n + c], scale);
        }

        for r in 0..n {
            if r == col {
                continue;
            }
            let factor = work[r * n + col];
            if factor == 0 {
                continue;
            }
            for c in 0..n {
                work[r * n + c] = Gf8::add(work[r * n + c], Gf8::mul(factor, work[col * n + c]));
                inv[r * n + c] = Gf8::add(inv[r * n + c], Gf8::mul(factor, inv[col * n + c]));
            }
        }
    }

    Ok(inv)
}

fn swap_rows(m: &mut [u8], n: usize, a: usize, b: usize) {
    for c in 0..n {
        m.swap(a * n + c, b * n + c);
    }
}

// =============================================================================
// Expanded Tables
// =============================================================================

/// Coefficient matrix expanded into full multiplication tables
///
/// One 256-entry table per coefficient, so applying the matrix to a byte is
/// a single lookup per source.
#[derive(Clone)]
pub struct GfTables {
    rows: usize,
    cols: usize,
    tables: Vec<[u8; 256]>,
}

impl std::fmt::Debug for GfTables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GfTables")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .finish()
    }
}

impl GfTables {
    /// Expand a `rows x cols` coefficient matrix
    pub fn expand(coefs: &[u8], rows: usize, cols: usize) -> Result<Self> {
        if coefs.len() != rows * cols {
            return Err(Error::MatrixError(format!(
                "expected {}x{} coefficients, got {}",
                rows,
                cols,
                coefs.len()
            )));
        }

        let mut tables = try_alloc(coefs.len(), "gf tables")?;
        for &coef in coefs {
            let mut table = [0u8; 256];
            for (x, slot) in table.iter_mut().enumerate() {
                *slot = Gf8::mul(coef, x as u8);
            }
            tables.push(table);
        }

        Ok(Self { rows, cols, tables })
    }

    /// Number of output vectors
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of input vectors
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Compute `dsts[r] = sum_c coef[r][c] * srcs[c]` over the first `len` bytes
    pub fn vector_multiply(&self, len: usize, srcs: &[&[u8]], dsts: &mut [&mut [u8]]) -> Result<()> {
        if srcs.len() != self.cols || dsts.len() != self.rows {
            return Err(Error::MatrixError(format!(
                "expected {} sources and {} destinations, got {} and {}",
                self.cols,
                self.rows,
                srcs.len(),
                dsts.len()
            )));
        }
        if srcs.iter().any(|s| s.len() < len) || dsts.iter().any(|d| d.len() < len) {
            return Err(Error::MatrixError(format!(
                "vectors shorter than {} bytes",
                len
            )));
        }

        for (r, dst) in dsts.iter_mut().enumerate() {
            let dst = &mut dst[..len];
            dst.fill(0);
            for (c, src) in srcs.iter().enumerate() {
                let table = &self.tables[r * self.cols + c];
                for (d, s) in dst.iter_mut().zip(&src[..len]) {
                    *d ^= table[*s as usize];
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
