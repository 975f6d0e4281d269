use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use rand::Rng;
use rand::seq::index::sample;
use tracing::{debug, info, warn};

use crate::domain::{Lca, MatrixSource};
use crate::error::PrepError;
use crate::fs_util::{create_zip, extract_zip, gunzip, gzip_file, link_relative, traverse_dirs};
use crate::mtx::Mtx;
use crate::tsv::Tsv;

pub const MATRIX_FILE: &str = "matrix.mtx";
pub const GENES_FILE: &str = "genes.tsv";
pub const BARCODES_FILE: &str = "barcodes.tsv";

/// Legacy name some producers use for the barcode annotation archive member.
const LEGACY_BARCODES_GZ: &str = "cells.tsv.gz";

/// Per-matrix transformation: unpack archive, normalize annotation files,
/// downsample, partition by protocol label, repack.
///
/// Each step takes the matrix through one transition of
/// `Archived -> Unpacked -> Normalized -> Partitioned -> (Repacked)`.
/// Steps return fresh descriptors instead of mutating the input one.
pub struct MatrixPreparer {
    info: MatrixSource,
}

impl MatrixPreparer {
    pub fn new(info: MatrixSource) -> Self {
        Self { info }
    }

    pub fn info(&self) -> &MatrixSource {
        &self.info
    }

    /// Extract the archive into the working directory and decompress every
    /// matrix found in it. A single archive may hold zero, one, or many
    /// matrix directories; directories without a matrix file are skipped.
    pub fn unpack(&self, remove_archive: bool) -> Result<Vec<MatrixSource>, PrepError> {
        let archive = self.info.archive_path.as_ref().ok_or_else(|| {
            PrepError::Filesystem(format!(
                "matrix {} has no archive to unpack",
                self.info.project_id
            ))
        })?;
        extract_zip(archive.as_std_path(), self.info.working_path.as_std_path())?;
        if remove_archive {
            fs::remove_file(archive.as_std_path())
                .map_err(|err| PrepError::Filesystem(err.to_string()))?;
        }

        let mut discovered = Vec::new();
        for dir in traverse_dirs(self.info.working_path.as_std_path())? {
            if !Self::decompress_matrix_dir(&dir)? {
                continue;
            }
            let dir = Utf8PathBuf::from_path_buf(dir)
                .map_err(|path| PrepError::Filesystem(format!("non-UTF8 path {path:?}")))?;
            discovered.push(MatrixSource {
                kind: self.info.kind,
                archive_path: None,
                working_path: dir,
                project_id: self.info.project_id.clone(),
                labels: self.info.labels.clone(),
            });
        }
        Ok(discovered)
    }

    /// Decompress the triple-file set in `dir` if it holds a matrix,
    /// renaming the legacy barcode file name to the canonical one first.
    fn decompress_matrix_dir(dir: &Path) -> Result<bool, PrepError> {
        let matrix_gz = dir.join(format!("{MATRIX_FILE}.gz"));
        if !matrix_gz.exists() {
            return Ok(false);
        }
        gunzip(&matrix_gz)?;
        gunzip(&dir.join(format!("{GENES_FILE}.gz")))?;
        let legacy = dir.join(LEGACY_BARCODES_GZ);
        let barcodes_gz = dir.join(format!("{BARCODES_FILE}.gz"));
        if legacy.exists() {
            fs::rename(&legacy, &barcodes_gz)
                .map_err(|err| PrepError::Filesystem(err.to_string()))?;
        }
        gunzip(&barcodes_gz)?;
        Ok(true)
    }

    /// Repair the triple-file set in place: integral counts in the matrix,
    /// headers stripped and columns normalized in both annotation files.
    /// Only files that actually changed are rewritten.
    pub fn normalize(&self) -> Result<(), PrepError> {
        let dir = &self.info.working_path;

        let mtx_path = dir.join(MATRIX_FILE);
        let mut mtx = Mtx::load(mtx_path.as_std_path())?;
        if mtx.coerce_integral()? {
            mtx.save(mtx_path.as_std_path())?;
        }
        let genes_expected = mtx.rows() as usize;
        let barcodes_expected = mtx.cols() as usize;
        drop(mtx);

        let genes_path = dir.join(GENES_FILE);
        let mut genes = Tsv::load(genes_path.as_std_path())?;
        let had_header = genes.detect_header(genes_expected)?;
        if had_header | genes.duplicate_single_column() {
            genes.save(genes_path.as_std_path())?;
        }

        let barcodes_path = dir.join(BARCODES_FILE);
        let mut barcodes = Tsv::load(barcodes_path.as_std_path())?;
        let had_header = barcodes.detect_header(barcodes_expected)?;
        if had_header | barcodes.strip_to_id_and_label() {
            barcodes.save(barcodes_path.as_std_path())?;
        }

        Ok(())
    }

    /// Shrink the matrix by discarding entries at random, keeping
    /// `round(keep_fraction * nnz)` of them. Destructive and one-way; the
    /// annotation files are untouched. The RNG is caller-supplied so tests
    /// can seed it.
    pub fn downsample<R: Rng>(&self, keep_fraction: f64, rng: &mut R) -> Result<(), PrepError> {
        if !(keep_fraction > 0.0 && keep_fraction <= 1.0) {
            return Err(PrepError::InvalidFraction(keep_fraction));
        }
        let mtx_path = self.info.working_path.join(MATRIX_FILE);
        let mut mtx = Mtx::load(mtx_path.as_std_path())?;
        let amount = (keep_fraction * mtx.len() as f64).round() as usize;
        let mut indices = sample(rng, mtx.len(), amount).into_vec();
        indices.sort_unstable();
        mtx.retain_indices(&indices);
        mtx.save(mtx_path.as_std_path())
    }

    /// Split the matrix into independent entities by protocol label.
    ///
    /// With a homogeneous label column the directory layout is left alone
    /// and a single descriptor is returned. Otherwise one subdirectory per
    /// observed label is populated with the matching subset of the matrix,
    /// with links back to the shared annotation files in the parent.
    pub fn partition(&self) -> Result<Vec<MatrixSource>, PrepError> {
        let dir = &self.info.working_path;
        let barcodes_path = dir.join(BARCODES_FILE);
        let mut barcodes = Tsv::load(barcodes_path.as_std_path())?;

        let Some(raw_labels) = barcodes.take_label_column() else {
            info!("no protocol label data for matrix; skipping partition");
            return Ok(vec![self.info.clone()]);
        };
        // label column removed to bound memory during downstream analysis
        barcodes.save(barcodes_path.as_std_path())?;

        let row_labels = raw_labels
            .iter()
            .map(|label| Lca::classify(label))
            .collect::<Result<Vec<_>, _>>()?;
        let found: BTreeSet<Lca> = row_labels.iter().copied().collect();
        if found.is_empty() {
            return Err(PrepError::Format(
                "barcode annotation has no label values".to_string(),
            ));
        }

        self.reconcile_labels(&found)?;

        if found.len() == 1 {
            let label = *found.iter().next().unwrap();
            debug!(%label, "homogeneous protocol label");
            return Ok(vec![self.info.clone().with_labels(found)]);
        }

        let mtx = Mtx::load(dir.join(MATRIX_FILE).as_std_path())?;
        for label in &found {
            debug!(%label, "consolidating cells");
            let label_dir = dir.join(label.as_str());
            fs::create_dir(label_dir.as_std_path())
                .map_err(|err| PrepError::Filesystem(err.to_string()))?;

            let mut subset = mtx.clone();
            let mut bad_col = None;
            subset.retain_where(|entry| {
                // column indices are 1-based on disk; 0 is as malformed as
                // one past the end
                let position = entry
                    .col
                    .checked_sub(1)
                    .and_then(|index| row_labels.get(index as usize));
                match position {
                    Some(entry_label) => *entry_label == *label,
                    None => {
                        bad_col = Some(entry.col);
                        false
                    }
                }
            });
            if let Some(col) = bad_col {
                return Err(PrepError::Format(format!(
                    "matrix column index {col} outside barcode annotation range 1..={}",
                    row_labels.len()
                )));
            }
            subset.save(label_dir.join(MATRIX_FILE).as_std_path())?;

            // annotation files stay in the parent and are only referenced
            for filename in [GENES_FILE, BARCODES_FILE] {
                link_relative(
                    Path::new(&format!("../{filename}")),
                    label_dir.join(filename).as_std_path(),
                )?;
            }
        }

        Ok(found
            .iter()
            .map(|label| MatrixSource {
                kind: self.info.kind,
                archive_path: None,
                working_path: dir.join(label.as_str()),
                project_id: self.info.project_id.clone(),
                labels: BTreeSet::from([*label]),
            })
            .collect())
    }

    fn reconcile_labels(&self, found: &BTreeSet<Lca>) -> Result<(), PrepError> {
        let expected = &self.info.labels;
        if expected.is_empty() {
            debug!("filling empty label set from annotation file");
            Ok(())
        } else if found == expected {
            debug!("all expected protocol labels accounted for");
            Ok(())
        } else if found.is_subset(expected) {
            warn!("not all expected protocol labels were found");
            Ok(())
        } else {
            Err(PrepError::InconsistentLabels {
                found: label_set(found),
                expected: label_set(expected),
            })
        }
    }

    /// Inverse of `unpack` for a single matrix: recompress the three
    /// canonical files and bundle them into a fresh archive.
    pub fn repack(
        &self,
        zip_path: &Utf8Path,
        remove_dir: bool,
    ) -> Result<MatrixSource, PrepError> {
        let dir = &self.info.working_path;
        let mut members = Vec::new();
        for filename in [MATRIX_FILE, GENES_FILE, BARCODES_FILE] {
            members.push(gzip_file(dir.join(filename).as_std_path())?);
        }
        create_zip(zip_path.as_std_path(), &members)?;
        if remove_dir {
            fs::remove_dir_all(dir.as_std_path())
                .map_err(|err| PrepError::Filesystem(err.to_string()))?;
        }
        let mut info = self.info.clone();
        info.archive_path = Some(zip_path.to_owned());
        Ok(info)
    }
}

fn label_set(labels: &BTreeSet<Lca>) -> String {
    labels
        .iter()
        .map(Lca::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
