use std::fs;
use std::path::Path;

use crate::error::PrepError;

/// One nonzero entry of a coordinate-list matrix. Indices are 1-based as on
/// disk; the value is kept as its original token so that untouched files
/// round-trip byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtxEntry {
    pub row: u64,
    pub col: u64,
    pub value: String,
}

/// A sparse matrix in the coordinate-list triple-file format: a `%` comment
/// header, a `(rows cols nnz)` dimensions line, then one line per nonzero
/// entry.
#[derive(Debug, Clone)]
pub struct Mtx {
    header: String,
    rows: u64,
    cols: u64,
    nnz: u64,
    entries: Vec<MtxEntry>,
}

impl Mtx {
    pub fn load(path: &Path) -> Result<Self, PrepError> {
        let content = fs::read_to_string(path)
            .map_err(|err| PrepError::Filesystem(format!("read {}: {err}", path.display())))?;
        let mut lines = content.lines();

        let header = lines
            .next()
            .ok_or_else(|| PrepError::Format(format!("empty matrix file {}", path.display())))?;
        if !header.starts_with('%') {
            return Err(PrepError::Format(format!(
                "matrix file {} does not start with a % header",
                path.display()
            )));
        }

        // Additional comment lines may precede the dimensions line.
        let dims_line = lines
            .by_ref()
            .find(|line| !line.starts_with('%'))
            .ok_or_else(|| {
                PrepError::Format(format!("matrix file {} has no dimensions line", path.display()))
            })?;
        let dims = dims_line
            .split_whitespace()
            .map(parse_dim)
            .collect::<Result<Vec<_>, _>>()?;
        let [rows, cols, nnz] = dims[..] else {
            return Err(PrepError::Format(format!(
                "expected 3 dimensions, got {}: {dims_line:?}",
                dims.len()
            )));
        };

        let entries = lines
            .filter(|line| !line.is_empty())
            .map(parse_entry)
            .collect::<Result<Vec<_>, _>>()?;
        if entries.len() as u64 != nnz {
            return Err(PrepError::Format(format!(
                "matrix file {} declares {nnz} entries but holds {}",
                path.display(),
                entries.len()
            )));
        }

        Ok(Self {
            header: header.to_string(),
            rows,
            cols,
            nnz,
            entries,
        })
    }

    /// Declared nonzero-entry count.
    pub fn len(&self) -> usize {
        self.nnz as usize
    }

    pub fn is_empty(&self) -> bool {
        self.nnz == 0
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn cols(&self) -> u64 {
        self.cols
    }

    pub fn entries(&self) -> &[MtxEntry] {
        &self.entries
    }

    /// Round any floating-point artifacts in the value column to the nearest
    /// integer. Returns whether the file needs rewriting.
    ///
    /// Counts should already be integral, but upstream producers sometimes
    /// emit a needless decimal point (`5.0`), and in the past this pipeline
    /// has been pointed at non-count expression metrics.
    pub fn coerce_integral(&mut self) -> Result<bool, PrepError> {
        let integral = self
            .entries
            .iter()
            .all(|entry| entry.value.parse::<i64>().is_ok());
        if integral {
            return Ok(false);
        }
        for entry in &mut self.entries {
            let value: f64 = entry.value.parse().map_err(|_| {
                PrepError::Format(format!("non-numeric matrix value: {:?}", entry.value))
            })?;
            entry.value = format!("{}", value.round() as i64);
        }
        Ok(true)
    }

    /// Retain only the entries matching the predicate, preserving relative
    /// order. Downstream label lookups rely on entry order matching the
    /// original annotation ordering by position.
    pub fn retain_where(&mut self, mut predicate: impl FnMut(&MtxEntry) -> bool) {
        self.entries.retain(|entry| predicate(entry));
        self.nnz = self.entries.len() as u64;
    }

    /// Retain only the entries at the given 0-based indices. Indices must be
    /// sorted ascending; relative order is preserved.
    pub fn retain_indices(&mut self, indices: &[usize]) {
        let mut keep = indices.iter().copied().peekable();
        let mut position = 0usize;
        self.entries.retain(|_| {
            let retained = keep.peek() == Some(&position);
            if retained {
                keep.next();
            }
            position += 1;
            retained
        });
        self.nnz = self.entries.len() as u64;
    }

    pub fn save(&self, path: &Path) -> Result<(), PrepError> {
        let mut out = String::with_capacity(self.entries.len() * 16 + 64);
        out.push_str(&self.header);
        out.push('\n');
        out.push_str(&format!("{} {} {}\n", self.rows, self.cols, self.nnz));
        for entry in &self.entries {
            out.push_str(&format!("{} {} {}\n", entry.row, entry.col, entry.value));
        }
        fs::write(path, out)
            .map_err(|err| PrepError::Filesystem(format!("write {}: {err}", path.display())))
    }
}

fn parse_dim(token: &str) -> Result<u64, PrepError> {
    // Dimension tokens occasionally arrive as floats ("100.0").
    token
        .parse::<u64>()
        .or_else(|_| token.parse::<f64>().map(|value| value as u64))
        .map_err(|_| PrepError::Format(format!("invalid dimension token: {token:?}")))
}

fn parse_entry(line: &str) -> Result<MtxEntry, PrepError> {
    let mut tokens = line.split_whitespace();
    let (Some(row), Some(col), Some(value), None) =
        (tokens.next(), tokens.next(), tokens.next(), tokens.next())
    else {
        return Err(PrepError::Format(format!("invalid matrix entry: {line:?}")));
    };
    Ok(MtxEntry {
        row: row
            .parse()
            .map_err(|_| PrepError::Format(format!("invalid row index: {row:?}")))?,
        col: col
            .parse()
            .map_err(|_| PrepError::Format(format!("invalid column index: {col:?}")))?,
        value: value.to_string(),
    })
}
