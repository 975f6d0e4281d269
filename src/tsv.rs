use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::PrepError;

/// Header token naming the protocol-label column in barcode annotations.
pub const LCA_COLUMN: &str =
    "library_preparation_protocol.library_construction_method.ontology_label";

/// A tab-separated annotation file (genes or barcodes) with an optional
/// header row. The header, once detected, is split off and never re-emitted.
#[derive(Debug, Clone)]
pub struct Tsv {
    header: Option<Vec<String>>,
    rows: Vec<Vec<String>>,
}

impl Tsv {
    pub fn load(path: &Path) -> Result<Self, PrepError> {
        let content = fs::read_to_string(path)
            .map_err(|err| PrepError::Filesystem(format!("read {}: {err}", path.display())))?;
        let rows = content
            .lines()
            .map(|line| line.split('\t').map(str::to_string).collect())
            .collect();
        Ok(Self { header: None, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn ncols(&self) -> usize {
        self.rows.first().map(Vec::len).unwrap_or(0)
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn header(&self) -> Option<&[String]> {
        self.header.as_deref()
    }

    /// Reconcile the file against the matrix dimension it annotates. Exactly
    /// `expected` rows means no header; `expected + 1` means the first row is
    /// a header and is split off. Any other count cannot be reconciled.
    pub fn detect_header(&mut self, expected: usize) -> Result<bool, PrepError> {
        if self.rows.len() == expected {
            Ok(false)
        } else if self.rows.len() == expected + 1 {
            self.header = Some(self.rows.remove(0));
            Ok(true)
        } else {
            Err(PrepError::Format(format!(
                "could not reconcile tsv file with {} entries with expected size {expected}",
                self.rows.len()
            )))
        }
    }

    /// Duplicate a lone column. Downstream readers require both an id and a
    /// symbol column even when only one is meaningful.
    pub fn duplicate_single_column(&mut self) -> bool {
        if self.ncols() != 1 {
            return false;
        }
        debug!("duplicating single annotation column");
        for row in &mut self.rows {
            let cell = row[0].clone();
            row.push(cell);
        }
        true
    }

    /// Keep the identifier column plus the protocol-label column when the
    /// header identifies one, otherwise the identifier column alone. Bounds
    /// memory for downstream consumers.
    pub fn strip_to_id_and_label(&mut self) -> bool {
        if self.ncols() <= 1 {
            return false;
        }
        let label_index = match &self.header {
            None => {
                debug!("no barcodes header, ignoring protocol label column");
                None
            }
            Some(header) => {
                let found = header.iter().position(|name| name == LCA_COLUMN);
                if found.is_none() {
                    debug!("protocol label column not named in barcodes header, ignoring");
                }
                found
            }
        };
        for row in &mut self.rows {
            let label = label_index.and_then(|index| row.get(index).cloned());
            row.truncate(1);
            if let Some(label) = label {
                row.push(label);
            }
        }
        true
    }

    /// Remove and return the second column, if any. Used to pull the
    /// protocol-label values out of a barcodes file before partitioning.
    pub fn take_label_column(&mut self) -> Option<Vec<String>> {
        if self.ncols() < 2 {
            return None;
        }
        let labels = self
            .rows
            .iter_mut()
            .map(|row| row.remove(1))
            .collect();
        if let Some(header) = &mut self.header {
            if header.len() > 1 {
                header.remove(1);
            }
        }
        Some(labels)
    }

    /// Write the data rows, tab-joined. The header is intentionally dropped.
    pub fn save(&self, path: &Path) -> Result<(), PrepError> {
        let mut out = String::new();
        for row in &self.rows {
            out.push_str(&row.join("\t"));
            out.push('\n');
        }
        fs::write(path, out)
            .map_err(|err| PrepError::Filesystem(format!("write {}: {err}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn write_tsv(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn detect_header_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tsv(dir.path(), "genes.tsv", "g1\ng2\ng3\n");
        let mut tsv = Tsv::load(&path).unwrap();
        assert!(!tsv.detect_header(3).unwrap());
        assert_eq!(tsv.len(), 3);
        assert!(tsv.header().is_none());
    }

    #[test]
    fn detect_header_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tsv(dir.path(), "genes.tsv", "gene_id\ng1\ng2\ng3\n");
        let mut tsv = Tsv::load(&path).unwrap();
        assert!(tsv.detect_header(3).unwrap());
        assert_eq!(tsv.len(), 3);
        assert_eq!(tsv.header().unwrap(), ["gene_id".to_string()]);
    }

    #[test]
    fn detect_header_unreconcilable() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tsv(dir.path(), "genes.tsv", "g1\ng2\n");
        let mut tsv = Tsv::load(&path).unwrap();
        let err = tsv.detect_header(4).unwrap_err();
        assert_matches!(err, PrepError::Format(_));
    }

    #[test]
    fn single_column_is_duplicated() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tsv(dir.path(), "genes.tsv", "g1\ng2\n");
        let mut tsv = Tsv::load(&path).unwrap();
        assert!(tsv.duplicate_single_column());
        assert_eq!(tsv.rows()[0], vec!["g1".to_string(), "g1".to_string()]);
        assert!(!tsv.duplicate_single_column() || tsv.ncols() == 1);
    }

    #[test]
    fn strip_keeps_label_column_named_by_header() {
        let dir = tempfile::tempdir().unwrap();
        let content = format!("barcode\tbatch\t{LCA_COLUMN}\nb1\tx\tSmart-seq2\nb2\ty\t10X v2\n");
        let path = write_tsv(dir.path(), "barcodes.tsv", &content);
        let mut tsv = Tsv::load(&path).unwrap();
        assert!(tsv.detect_header(2).unwrap());
        assert!(tsv.strip_to_id_and_label());
        assert_eq!(
            tsv.rows()[0],
            vec!["b1".to_string(), "Smart-seq2".to_string()]
        );
        assert_eq!(tsv.rows()[1], vec!["b2".to_string(), "10X v2".to_string()]);
    }

    #[test]
    fn strip_drops_extras_without_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tsv(dir.path(), "barcodes.tsv", "b1\tx\ty\nb2\tx\ty\n");
        let mut tsv = Tsv::load(&path).unwrap();
        assert!(!tsv.detect_header(2).unwrap());
        assert!(tsv.strip_to_id_and_label());
        assert_eq!(tsv.ncols(), 1);
    }

    #[test]
    fn take_label_column_removes_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tsv(dir.path(), "barcodes.tsv", "b1\tSS2\nb2\t10X\n");
        let mut tsv = Tsv::load(&path).unwrap();
        let labels = tsv.take_label_column().unwrap();
        assert_eq!(labels, vec!["SS2".to_string(), "10X".to_string()]);
        assert_eq!(tsv.ncols(), 1);
        assert!(tsv.take_label_column().is_none());
    }

    #[test]
    fn save_drops_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tsv(dir.path(), "genes.tsv", "gene_id\ng1\ng2\n");
        let mut tsv = Tsv::load(&path).unwrap();
        tsv.detect_header(2).unwrap();
        tsv.save(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "g1\ng2\n");
    }
}
