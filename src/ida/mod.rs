//! Information dispersal codec over GF(p).
//!
//! A value is split into `n` fragments of which any `m` reconstruct it.
//! Encoding multiplies the byte segments by an `n x m` Vandermonde matrix;
//! decoding inverts the `m x m` submatrix picked out by the surviving
//! fragment indices, in closed form via elementary symmetric polynomials.

use crate::error::Error;
use crate::error::Result;

pub mod fragment;

pub use fragment::Fragment;

type Vector = Vec<i64>;
type Matrix = Vec<Vec<i64>>;

fn modulo(lhs: i64, rhs: i64) -> i64 {
    (lhs % rhs + rhs) % rhs
}

fn inner_product(lhs: &[i64], rhs: &[i64], p: i64) -> i64 {
    lhs.iter()
        .zip(rhs.iter())
        .fold(0, |sum, (a, b)| modulo(sum + a * b, p))
}

fn matrix_product(lhs: &Matrix, rhs: &Matrix, p: i64) -> Matrix {
    let rhs_cols = rhs[0].len();
    let mut result = Vec::with_capacity(lhs.len());
    for row in lhs {
        let mut out_row = Vec::with_capacity(rhs_cols);
        for j in 0..rhs_cols {
            let mut cell = 0;
            for (k, value) in row.iter().enumerate() {
                cell = modulo(cell + value * rhs[k][j], p);
            }
            out_row.push(cell);
        }
        result.push(out_row);
    }
    result
}

fn transpose(m: &Matrix) -> Matrix {
    let mut result = vec![vec![0; m.len()]; m.len()];
    for (i, row) in result.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = m[j][i];
        }
    }
    result
}

fn mod_inverse(n: i64, p: i64) -> Result<i64> {
    let (mut t, mut new_t) = (0i64, 1i64);
    let (mut r, mut new_r) = (p, modulo(n, p));

    while new_r != 0 {
        let quotient = r / new_r;
        (t, new_t) = (new_t, t - quotient * new_t);
        (r, new_r) = (new_r, r - quotient * new_r);
    }

    if r > 1 {
        return Err(Error::Codec(format!("{} is not invertible mod {}", n, p)));
    }
    if t < 0 {
        t += p;
    }
    Ok(t)
}

/// Row `a` (1-based) is `[1, a, a^2, ..., a^(m-1)] mod p`.
fn encoding_matrix(m: usize, n: usize, p: i64) -> Matrix {
    let mut matrix = Vec::with_capacity(n);
    for a in 1..=n as i64 {
        let mut row = Vec::with_capacity(m);
        let mut elt = 1i64;
        for _ in 0..m {
            row.push(elt);
            elt = modulo(elt * a, p);
        }
        matrix.push(row);
    }
    matrix
}

/// `result[i]` is the i-th elementary symmetric polynomial of `v`, mod `p`.
fn elementary_symmetric(v: &[i64], m: usize, p: i64) -> Vector {
    let mut el = vec![vec![0i64; v.len() + 1]; m + 1];
    for i in 1..=v.len() {
        el[1][i] = modulo(el[1][i - 1] + v[i - 1], p);
    }
    for i in 2..=m {
        for j in i..=v.len() {
            el[i][j] = modulo(el[i - 1][j - 1] * v[j - 1] + el[i][j - 1], p);
        }
    }

    el.iter().map(|row| *row.last().unwrap_or(&0)).collect()
}

/// Closed-form inverse of the Vandermonde submatrix whose rows are indexed
/// by `basis`.
fn vandermonde_inverse(basis: &[i64], p: i64) -> Result<Matrix> {
    let m = basis.len();
    let el = elementary_symmetric(basis, m, p);

    let mut denominators = Vec::with_capacity(m);
    for i in 0..m {
        let mut prod = 1i64;
        for j in 0..m {
            if j != i {
                prod = modulo(prod * (basis[i] - basis[j]), p);
            }
        }
        denominators.push(prod);
    }

    let mut numerators = Vec::with_capacity(m);
    for &elt in basis.iter() {
        let mut row = vec![1i64];
        let mut sign = -1i64;
        for j in 1..m {
            let cell = modulo(modulo(row[row.len() - 1] * elt, p) + sign * el[j], p);
            row.push(cell);
            sign = -sign;
        }
        row.reverse();
        numerators.push(row);
    }

    let mut result = Vec::with_capacity(m);
    for i in 0..m {
        let inv = mod_inverse(denominators[i], p)?;
        let row = numerators[i]
            .iter()
            .map(|&num| modulo(num * inv, p))
            .collect();
        result.push(row);
    }

    Ok(transpose(&result))
}

/// Information dispersal codec with fixed `(n, m, p)` parameters.
#[derive(Debug, Clone)]
pub struct Ida {
    n: usize,
    m: usize,
    p: i64,
    encoding: Matrix,
}

impl Ida {
    /// Build a codec producing `n` fragments, any `m` of which reconstruct
    /// the value, over GF(`p`). Requires `n > m` and `p > n`.
    pub fn new(n: usize, m: usize, p: i64) -> Result<Self> {
        if n <= m || p <= n as i64 {
            return Err(Error::Codec(format!(
                "invalid parameters (n={}, m={}, p={}): need n > m and p > n",
                n, m, p
            )));
        }
        Ok(Self {
            n,
            m,
            p,
            encoding: encoding_matrix(m, n, p),
        })
    }

    /// Number of fragments produced per value.
    pub fn n(&self) -> usize {
        self.n
    }

    /// Number of fragments required to reconstruct a value.
    pub fn m(&self) -> usize {
        self.m
    }

    /// Split `data` into rows of length `m`, zero-padding the tail.
    fn split_to_segments(&self, data: &[i64]) -> Matrix {
        let mut segments = Vec::with_capacity(data.len().div_ceil(self.m));
        for chunk in data.chunks(self.m) {
            let mut segment = vec![0i64; self.m];
            segment[..chunk.len()].copy_from_slice(chunk);
            segments.push(segment);
        }
        segments
    }

    /// Encode a file and write one fragment file per share.
    pub fn encode_to_files(&self, input: &std::path::Path, outputs: &[std::path::PathBuf]) -> Result<()> {
        if outputs.len() != self.n {
            return Err(Error::Codec(format!(
                "expected {} output files, got {}",
                self.n,
                outputs.len()
            )));
        }

        let data = std::fs::read(input)?;
        for (fragment, path) in self.encode_bytes(&data).iter().zip(outputs) {
            fragment.write_to_file(path)?;
        }
        Ok(())
    }

    /// Reconstruct a file's contents from any `m` fragment files.
    pub fn decode_files(&self, inputs: &[std::path::PathBuf]) -> Result<Vec<u8>> {
        let fragments: Vec<Fragment> = inputs
            .iter()
            .map(Fragment::from_file)
            .collect::<Result<_>>()?;
        self.decode(&fragments)
    }

    /// Disperse a byte buffer into `n` fragments.
    pub fn encode_bytes(&self, data: &[u8]) -> Vec<Fragment> {
        let values: Vector = data.iter().map(|&b| b as i64).collect();
        let segments = self.split_to_segments(&values);

        let mut fragments = Vec::with_capacity(self.n);
        for (i, row) in self.encoding.iter().enumerate() {
            let values: Vector = segments
                .iter()
                .map(|segment| inner_product(row, segment, self.p))
                .collect();
            fragments.push(Fragment {
                index: i + 1,
                values,
                n: self.n,
                m: self.m,
                p: self.p,
            });
        }
        fragments
    }

    /// Reconstruct the original bytes from any `m` distinct fragments.
    /// Trailing zero segments introduced by padding are stripped.
    pub fn decode(&self, fragments: &[Fragment]) -> Result<Vec<u8>> {
        if fragments.len() < self.m {
            return Err(Error::Codec(format!(
                "{} fragments are required to decode, got {}",
                self.m,
                fragments.len()
            )));
        }

        let mut fragments: Vec<&Fragment> = fragments.iter().collect();
        fragments.sort();
        fragments.truncate(self.m);

        let basis: Vector = fragments.iter().map(|f| f.index as i64).collect();
        let encoded: Matrix = fragments.iter().map(|f| f.values.clone()).collect();

        if encoded[0].is_empty() {
            return Ok(Vec::new());
        }

        let inverse = vandermonde_inverse(&basis, self.p)?;
        let output = matrix_product(&inverse, &encoded, self.p);

        // The output matrix holds the original segments as columns.
        let mut segments: Matrix = Vec::with_capacity(output[0].len());
        for col in 0..output[0].len() {
            segments.push(output.iter().map(|row| row[col]).collect());
        }

        // Strip all-zero tail segments, then trailing zeros of the last
        // segment; both come from padding.
        while segments
            .last()
            .map_or(false, |s| s.iter().all(|&v| v == 0))
        {
            segments.pop();
        }
        if let Some(last) = segments.last_mut() {
            while last.last() == Some(&0) {
                last.pop();
            }
        }

        let mut bytes = Vec::new();
        for value in segments.into_iter().flatten() {
            if !(0..=255).contains(&value) {
                return Err(Error::Codec(format!(
                    "decoded value {} is not a byte",
                    value
                )));
            }
            bytes.push(value as u8);
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_validation() {
        assert!(Ida::new(14, 10, 257).is_ok());
        // n must exceed m.
        assert!(Ida::new(10, 10, 257).is_err());
        assert!(Ida::new(9, 10, 257).is_err());
        // p must exceed n.
        assert!(Ida::new(14, 10, 14).is_err());
        assert!(Ida::new(14, 10, 13).is_err());
    }

    #[test]
    fn test_mod_inverse() {
        for n in 1..257 {
            let inv = mod_inverse(n, 257).unwrap();
            assert_eq!(modulo(n * inv, 257), 1, "inverse of {}", n);
        }
        assert!(mod_inverse(5, 10).is_err());
    }

    #[test]
    fn test_encoding_matrix_is_vandermonde() {
        let matrix = encoding_matrix(3, 5, 7);
        assert_eq!(matrix.len(), 5);
        // Row a is [1, a, a^2] mod 7.
        assert_eq!(matrix[0], vec![1, 1, 1]);
        assert_eq!(matrix[2], vec![1, 3, 2]);
        assert_eq!(matrix[4], vec![1, 5, 4]);
    }

    #[test]
    fn test_vandermonde_inverse() {
        let p = 257;
        let basis = vec![2i64, 5, 9, 11];
        let inverse = vandermonde_inverse(&basis, p).unwrap();

        // Vandermonde rows for the basis, times the inverse, must give I.
        let vandermonde: Matrix = basis
            .iter()
            .map(|&a| {
                let mut row = Vec::new();
                let mut elt = 1i64;
                for _ in 0..basis.len() {
                    row.push(elt);
                    elt = modulo(elt * a, p);
                }
                row
            })
            .collect();

        let product = matrix_product(&inverse, &vandermonde, p);
        for (i, row) in product.iter().enumerate() {
            for (j, &cell) in row.iter().enumerate() {
                assert_eq!(cell, i64::from(i == j), "cell ({}, {})", i, j);
            }
        }
    }

    #[test]
    fn test_round_trip_with_reference_parameters() {
        let ida = Ida::new(14, 10, 257).unwrap();
        let data = b"the quick brown fox jumps over the lazy dog";
        let fragments = ida.encode_bytes(data);
        assert_eq!(fragments.len(), 14);

        // All fragments decode.
        assert_eq!(ida.decode(&fragments).unwrap(), data);

        // Exactly m arbitrary fragments decode.
        let subset: Vec<Fragment> = fragments[4..14].to_vec();
        assert_eq!(ida.decode(&subset).unwrap(), data);
        let scattered: Vec<Fragment> = [0, 2, 3, 5, 7, 8, 10, 11, 12, 13]
            .iter()
            .map(|&i| fragments[i].clone())
            .collect();
        assert_eq!(ida.decode(&scattered).unwrap(), data);

        // Fewer than m do not.
        assert!(ida.decode(&fragments[..9]).is_err());
    }

    #[test]
    fn test_round_trip_every_subset() {
        // Small enough parameters to try every m-subset of the fragments.
        let ida = Ida::new(5, 3, 11).unwrap();
        let data = &[1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        let fragments = ida.encode_bytes(data);

        for a in 0..5 {
            for b in (a + 1)..5 {
                for c in (b + 1)..5 {
                    let subset = vec![
                        fragments[a].clone(),
                        fragments[b].clone(),
                        fragments[c].clone(),
                    ];
                    assert_eq!(
                        ida.decode(&subset).unwrap(),
                        data,
                        "subset ({}, {}, {})",
                        a,
                        b,
                        c
                    );
                }
            }
        }
    }

    #[test]
    fn test_padding_is_stripped() {
        let ida = Ida::new(6, 4, 11).unwrap();

        // Lengths that do and do not divide m.
        for len in [1usize, 3, 4, 5, 8, 9] {
            let data: Vec<u8> = (1..=len as u8).collect();
            let fragments = ida.encode_bytes(&data);
            assert_eq!(ida.decode(&fragments).unwrap(), data, "length {}", len);
        }
    }

    #[test]
    fn test_interior_zeros_survive() {
        let ida = Ida::new(5, 3, 257).unwrap();
        let data = &[7u8, 0, 0, 9, 0, 3];
        let fragments = ida.encode_bytes(data);
        assert_eq!(ida.decode(&fragments).unwrap(), data);
    }

    #[test]
    fn test_file_dispersal_round_trip() {
        let ida = Ida::new(4, 2, 257).unwrap();
        let dir = std::env::temp_dir();
        let input = dir.join("ringstore-ida-input.bin");
        std::fs::write(&input, b"file to disperse").unwrap();

        let outputs: Vec<std::path::PathBuf> = (0..4)
            .map(|i| dir.join(format!("ringstore-ida-frag-{}.json", i)))
            .collect();

        // The output count must match n.
        assert!(ida.encode_to_files(&input, &outputs[..3]).is_err());

        ida.encode_to_files(&input, &outputs).unwrap();
        // Any m of the fragment files reconstruct the contents.
        let restored = ida.decode_files(&outputs[1..3]).unwrap();
        assert_eq!(restored, b"file to disperse");

        std::fs::remove_file(&input).ok();
        for path in &outputs {
            std::fs::remove_file(path).ok();
        }
    }

    #[test]
    fn test_empty_input() {
        let ida = Ida::new(5, 3, 257).unwrap();
        let fragments = ida.encode_bytes(&[]);
        assert_eq!(fragments.len(), 5);
        assert_eq!(ida.decode(&fragments).unwrap(), Vec::<u8>::new());
    }
}
