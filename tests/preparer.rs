use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::Path;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use flate2::Compression;
use flate2::write::GzEncoder;
use matrix_prep::domain::{Lca, MatrixSource, ProjectId, SourceKind};
use matrix_prep::error::PrepError;
use matrix_prep::mtx::Mtx;
use matrix_prep::preparer::{BARCODES_FILE, GENES_FILE, MATRIX_FILE, MatrixPreparer};
use rand::SeedableRng;
use rand::rngs::StdRng;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

const LCA_COLUMN: &str =
    "library_preparation_protocol.library_construction_method.ontology_label";

const HOM_MTX: &str = "\
%%MatrixMarket matrix coordinate integer general
4 3 5
1 1 5
2 1 3
3 2 7
4 3 2
1 3 1
";

const MIX_MTX: &str = "\
%%MatrixMarket matrix coordinate integer general
3 4 6
1 1 2
2 2 4
3 2 1
1 3 9
2 4 2
3 4 5
";

fn gz(data: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

/// Build an archive holding two matrix directories: `hom` is homogeneous
/// (every barcode Smart-seq2, barcodes under the legacy `cells` name) and
/// `mix` carries two protocols. A third directory holds no matrix at all.
fn mock_archive(dir: &Path) -> Utf8PathBuf {
    let zip_path = dir.join("bundle.mtx.zip");
    let file = fs::File::create(&zip_path).unwrap();
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default();

    let hom_barcodes = format!(
        "barcode\t{LCA_COLUMN}\nb1\tSmart-seq2\nb2\tSmart-seq2\nb3\tSmart-seq2\n"
    );
    let mix_barcodes = format!(
        "barcode\t{LCA_COLUMN}\nb1\tSmart-seq2\nb2\tSmart-seq2\nb3\t10X v2\nb4\t10x 3' v3\n"
    );

    let members: [(&str, Vec<u8>); 7] = [
        ("hom/matrix.mtx.gz", gz(HOM_MTX)),
        ("hom/genes.tsv.gz", gz("g1\ng2\ng3\ng4\n")),
        ("hom/cells.tsv.gz", gz(&hom_barcodes)),
        ("mix/matrix.mtx.gz", gz(MIX_MTX)),
        ("mix/genes.tsv.gz", gz("g1\tG1\ng2\tG2\ng3\tG3\n")),
        ("mix/barcodes.tsv.gz", gz(&mix_barcodes)),
        ("empty/readme.txt", b"no matrix here\n".to_vec()),
    ];
    for (name, data) in members {
        writer.start_file(name, options).unwrap();
        writer.write_all(&data).unwrap();
    }
    writer.finish().unwrap();
    Utf8PathBuf::from_path_buf(zip_path).unwrap()
}

fn archived_source(dir: &Path) -> MatrixSource {
    let zip_path = mock_archive(dir);
    MatrixSource::new(
        SourceKind::Mock,
        Some(zip_path),
        Utf8PathBuf::from_path_buf(dir.join("bundle.mtx")).unwrap(),
        ProjectId::new("mock-project"),
    )
}

/// Unpack the fixture and return (homogeneous, mixed) sources.
fn unpacked(dir: &Path) -> (MatrixSource, MatrixSource) {
    let mut sources = MatrixPreparer::new(archived_source(dir)).unpack(false).unwrap();
    sources.sort_by(|a, b| a.working_path.cmp(&b.working_path));
    assert_eq!(sources.len(), 2);
    let mix = sources.pop().unwrap();
    let hom = sources.pop().unwrap();
    assert!(hom.working_path.ends_with("hom"));
    assert!(mix.working_path.ends_with("mix"));
    (hom, mix)
}

#[test]
fn unpack_discovers_nested_matrices() {
    let dir = tempfile::tempdir().unwrap();
    let (hom, mix) = unpacked(dir.path());

    for source in [&hom, &mix] {
        for filename in [MATRIX_FILE, GENES_FILE, BARCODES_FILE] {
            let path = source.working_path.join(filename);
            assert!(path.as_std_path().exists(), "missing {path}");
        }
        assert!(!source.working_path.join("matrix.mtx.gz").as_std_path().exists());
    }
    // legacy cells file was renamed before decompression
    assert!(!hom.working_path.join("cells.tsv.gz").as_std_path().exists());
    assert!(!hom.working_path.join("cells.tsv").as_std_path().exists());
}

#[test]
fn normalize_repairs_annotation_files() {
    let dir = tempfile::tempdir().unwrap();
    let (hom, mix) = unpacked(dir.path());

    for source in [&hom, &mix] {
        MatrixPreparer::new(source.clone()).normalize().unwrap();
    }

    // single gene column was duplicated, header stripped from barcodes
    let genes = fs::read_to_string(hom.working_path.join(GENES_FILE).as_std_path()).unwrap();
    assert_eq!(genes.lines().next().unwrap(), "g1\tg1");
    assert_eq!(genes.lines().count(), 4);

    let barcodes =
        fs::read_to_string(hom.working_path.join(BARCODES_FILE).as_std_path()).unwrap();
    assert_eq!(barcodes.lines().count(), 3);
    assert_eq!(barcodes.lines().next().unwrap(), "b1\tSmart-seq2");
}

#[test]
fn partition_homogeneous_leaves_matrix_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let (hom, _) = unpacked(dir.path());
    let preparer = MatrixPreparer::new(hom.clone());
    preparer.normalize().unwrap();

    let results = preparer.partition().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].working_path, hom.working_path);
    assert_eq!(results[0].labels, BTreeSet::from([Lca::Ss2]));

    // label column was removed in place
    let barcodes =
        fs::read_to_string(hom.working_path.join(BARCODES_FILE).as_std_path()).unwrap();
    assert_eq!(barcodes, "b1\nb2\nb3\n");
}

#[test]
fn partition_heterogeneous_splits_by_label() {
    let dir = tempfile::tempdir().unwrap();
    let (_, mix) = unpacked(dir.path());
    let preparer = MatrixPreparer::new(mix.clone());
    preparer.normalize().unwrap();

    let original = Mtx::load(mix.working_path.join(MATRIX_FILE).as_std_path()).unwrap();
    let mut results = preparer.partition().unwrap();
    results.sort_by_key(|source| source.sole_label().unwrap());
    assert_eq!(results.len(), 2);

    let mut split_total = 0;
    for result in &results {
        let label = result.sole_label().unwrap();
        assert_eq!(result.working_path, mix.working_path.join(label.as_str()));

        let subset = Mtx::load(result.working_path.join(MATRIX_FILE).as_std_path()).unwrap();
        split_total += subset.len();
        for entry in subset.entries() {
            assert!(original.entries().contains(entry));
        }

        // annotation files are linked back to the parent, never copied
        for filename in [GENES_FILE, BARCODES_FILE] {
            let path = result.working_path.join(filename);
            assert!(path.as_std_path().exists());
            assert!(path.as_std_path().is_symlink());
        }
        assert!(!result.working_path.join(MATRIX_FILE).as_std_path().is_symlink());
    }
    assert_eq!(split_total, original.len());

    // SS2 cells sit in columns 1-2, 10X cells in columns 3-4
    let ss2 = Mtx::load(
        mix.working_path
            .join(Lca::Ss2.as_str())
            .join(MATRIX_FILE)
            .as_std_path(),
    )
    .unwrap();
    assert!(ss2.entries().iter().all(|entry| entry.col <= 2));
    assert_eq!(ss2.len(), 3);
}

#[test]
fn partition_without_label_column_is_identity() {
    let dir = tempfile::tempdir().unwrap();
    let (hom, _) = unpacked(dir.path());
    let preparer = MatrixPreparer::new(hom.clone());
    preparer.normalize().unwrap();

    // drop the label column up front
    let barcodes_path = hom.working_path.join(BARCODES_FILE);
    fs::write(barcodes_path.as_std_path(), "b1\nb2\nb3\n").unwrap();

    let results = preparer.partition().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0], hom);
}

#[test]
fn partition_rejects_conflicting_upstream_labels() {
    let dir = tempfile::tempdir().unwrap();
    let (hom, _) = unpacked(dir.path());
    // upstream metadata expects 10X only, but the file holds SS2 cells
    let info = hom.clone().with_labels(BTreeSet::from([Lca::TenX]));
    let preparer = MatrixPreparer::new(info);
    preparer.normalize().unwrap();

    let err = preparer.partition().unwrap_err();
    assert_matches!(err, PrepError::InconsistentLabels { .. });
}

#[test]
fn partition_rejects_out_of_range_column_indices() {
    let dir = tempfile::tempdir().unwrap();
    // second entry addresses column 0; indices on disk are 1-based
    fs::write(
        dir.path().join(MATRIX_FILE),
        "%%MatrixMarket matrix coordinate integer general\n2 2 3\n1 1 2\n1 0 7\n2 2 4\n",
    )
    .unwrap();
    fs::write(
        dir.path().join(BARCODES_FILE),
        "b1\tSmart-seq2\nb2\t10X v2\n",
    )
    .unwrap();

    let info = MatrixSource::new(
        SourceKind::Mock,
        None,
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
        ProjectId::new("broken"),
    );
    let err = MatrixPreparer::new(info).partition().unwrap_err();
    assert_matches!(err, PrepError::Format(_));
}

#[test]
fn downsample_keeps_requested_fraction() {
    let dir = tempfile::tempdir().unwrap();
    let (_, mix) = unpacked(dir.path());
    let preparer = MatrixPreparer::new(mix.clone());
    preparer.normalize().unwrap();

    let mtx_path = mix.working_path.join(MATRIX_FILE);
    let original = Mtx::load(mtx_path.as_std_path()).unwrap();

    let mut rng = StdRng::seed_from_u64(7);
    preparer.downsample(0.5, &mut rng).unwrap();

    let pruned = Mtx::load(mtx_path.as_std_path()).unwrap();
    assert_eq!(pruned.len(), 3);
    for entry in pruned.entries() {
        assert!(original.entries().contains(entry));
    }
}

#[test]
fn downsample_is_deterministic_under_a_seed() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let mut outputs = Vec::new();
    for dir in [dir_a.path(), dir_b.path()] {
        let (_, mix) = unpacked(dir);
        let preparer = MatrixPreparer::new(mix.clone());
        preparer.normalize().unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        preparer.downsample(0.5, &mut rng).unwrap();
        outputs
            .push(fs::read(mix.working_path.join(MATRIX_FILE).as_std_path()).unwrap());
    }
    assert_eq!(outputs[0], outputs[1]);
}

#[test]
fn downsample_validates_fraction() {
    let dir = tempfile::tempdir().unwrap();
    let (hom, _) = unpacked(dir.path());
    let preparer = MatrixPreparer::new(hom);
    let mut rng = StdRng::seed_from_u64(0);

    for fraction in [0.0, -0.5, 1.01] {
        let err = preparer.downsample(fraction, &mut rng).unwrap_err();
        assert_matches!(err, PrepError::InvalidFraction(_));
    }
    assert!(preparer.downsample(1.0, &mut rng).is_ok());
}

#[test]
fn repack_is_the_inverse_of_unpack() {
    let dir = tempfile::tempdir().unwrap();
    let (hom, _) = unpacked(dir.path());
    MatrixPreparer::new(hom.clone()).normalize().unwrap();

    let zip_path = Utf8PathBuf::from_path_buf(dir.path().join("repacked.mtx.zip")).unwrap();
    let repacked = MatrixPreparer::new(hom.clone())
        .repack(&zip_path, true)
        .unwrap();
    assert_eq!(repacked.archive_path.as_deref(), Some(zip_path.as_path()));
    assert!(!hom.working_path.as_std_path().exists());

    let reextracted = MatrixSource::new(
        SourceKind::Mock,
        Some(zip_path),
        Utf8PathBuf::from_path_buf(dir.path().join("again")).unwrap(),
        ProjectId::new("mock-project"),
    );
    let sources = MatrixPreparer::new(reextracted).unpack(false).unwrap();
    assert_eq!(sources.len(), 1);
    let mtx = Mtx::load(sources[0].working_path.join(MATRIX_FILE).as_std_path()).unwrap();
    assert_eq!(mtx.len(), 5);
}
