use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use zip::ZipArchive;
use zip::write::{SimpleFileOptions, ZipWriter};

use crate::error::PrepError;

pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<(), PrepError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| PrepError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| PrepError::Filesystem(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| PrepError::Filesystem(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(PrepError::Filesystem(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| PrepError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| PrepError::Filesystem(err.to_string()))?;
        }
        let mut outfile =
            fs::File::create(&entry_path).map_err(|err| PrepError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile).map_err(|err| PrepError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

/// Write the given files into a fresh zip archive, storing each under its
/// file name only.
pub fn create_zip(zip_path: &Path, files: &[PathBuf]) -> Result<(), PrepError> {
    let file = fs::File::create(zip_path)
        .map_err(|err| PrepError::Filesystem(format!("create zip {}: {err}", zip_path.display())))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    for path in files {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| PrepError::Filesystem(format!("invalid path {}", path.display())))?;
        writer
            .start_file(name, options)
            .map_err(|err| PrepError::Filesystem(err.to_string()))?;
        let mut infile =
            fs::File::open(path).map_err(|err| PrepError::Filesystem(err.to_string()))?;
        io::copy(&mut infile, &mut writer)
            .map_err(|err| PrepError::Filesystem(err.to_string()))?;
    }
    writer
        .finish()
        .map_err(|err| PrepError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Decompress `<name>.gz` next to itself as `<name>` and remove the `.gz`.
pub fn gunzip(gz_path: &Path) -> Result<PathBuf, PrepError> {
    let out_path = strip_gz_ext(gz_path)?;
    let gz_file = fs::File::open(gz_path)
        .map_err(|err| PrepError::Filesystem(format!("open {}: {err}", gz_path.display())))?;
    let mut decoder = GzDecoder::new(gz_file);
    let mut out_file =
        fs::File::create(&out_path).map_err(|err| PrepError::Filesystem(err.to_string()))?;
    io::copy(&mut decoder, &mut out_file)
        .map_err(|err| PrepError::Filesystem(err.to_string()))?;
    fs::remove_file(gz_path).map_err(|err| PrepError::Filesystem(err.to_string()))?;
    Ok(out_path)
}

/// Compress a file as `<name>.gz` next to itself and remove the original.
pub fn gzip_file(path: &Path) -> Result<PathBuf, PrepError> {
    let gz_path = {
        let mut os = path.as_os_str().to_owned();
        os.push(".gz");
        PathBuf::from(os)
    };
    let mut infile = fs::File::open(path)
        .map_err(|err| PrepError::Filesystem(format!("open {}: {err}", path.display())))?;
    let out_file =
        fs::File::create(&gz_path).map_err(|err| PrepError::Filesystem(err.to_string()))?;
    let mut encoder = GzEncoder::new(out_file, Compression::default());
    io::copy(&mut infile, &mut encoder)
        .map_err(|err| PrepError::Filesystem(err.to_string()))?;
    encoder
        .finish()
        .map_err(|err| PrepError::Filesystem(err.to_string()))?;
    fs::remove_file(path).map_err(|err| PrepError::Filesystem(err.to_string()))?;
    Ok(gz_path)
}

fn strip_gz_ext(path: &Path) -> Result<PathBuf, PrepError> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| PrepError::Filesystem(format!("invalid path {}", path.display())))?;
    let stripped = name
        .strip_suffix(".gz")
        .ok_or_else(|| PrepError::Filesystem(format!("not a .gz file: {name}")))?;
    Ok(path.with_file_name(stripped))
}

/// Depth-first walk of a directory tree, yielding the root and every
/// subdirectory. Symlinked directories are not followed.
pub fn traverse_dirs(root: &Path) -> Result<Vec<PathBuf>, PrepError> {
    let mut dirs = vec![root.to_path_buf()];
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries =
            fs::read_dir(&dir).map_err(|err| PrepError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| PrepError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() && !path.is_symlink() {
                dirs.push(path.clone());
                stack.push(path);
            }
        }
    }
    Ok(dirs)
}

/// Create `link` pointing at `target` without copying. Symbolic on unix,
/// hard link elsewhere.
pub fn link_relative(target: &Path, link: &Path) -> Result<(), PrepError> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link)
            .map_err(|err| PrepError::Filesystem(err.to_string()))
    }
    #[cfg(not(unix))]
    {
        let resolved = link
            .parent()
            .map(|parent| parent.join(target))
            .unwrap_or_else(|| target.to_path_buf());
        fs::hard_link(resolved, link).map_err(|err| PrepError::Filesystem(err.to_string()))
    }
}

/// Human-readable byte count for fetch logging.
pub fn format_size(size_bytes: u64) -> String {
    const UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];
    if size_bytes == 0 {
        return "0 B".to_string();
    }
    let magnitude = (size_bytes as f64).log(1024.0).floor() as usize;
    let magnitude = magnitude.min(UNITS.len() - 1);
    let scaled = size_bytes as f64 / 1024f64.powi(magnitude as i32);
    format!("{} {}", (scaled * 100.0).round() / 100.0, UNITS[magnitude])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        fs::write(&path, b"matrix payload").unwrap();

        let gz_path = gzip_file(&path).unwrap();
        assert!(gz_path.ends_with("data.txt.gz"));
        assert!(!path.exists());

        let restored = gunzip(&gz_path).unwrap();
        assert_eq!(restored, path);
        assert!(!gz_path.exists());
        assert_eq!(fs::read(&path).unwrap(), b"matrix payload");
    }

    #[test]
    fn zip_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, b"alpha").unwrap();
        fs::write(&b, b"beta").unwrap();

        let zip_path = dir.path().join("bundle.zip");
        create_zip(&zip_path, &[a, b]).unwrap();

        let out = dir.path().join("out");
        extract_zip(&zip_path, &out).unwrap();
        assert_eq!(fs::read(out.join("a.txt")).unwrap(), b"alpha");
        assert_eq!(fs::read(out.join("b.txt")).unwrap(), b"beta");
    }

    #[test]
    fn traverse_yields_root_and_nested() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::create_dir_all(dir.path().join("c")).unwrap();
        let dirs = traverse_dirs(dir.path()).unwrap();
        assert_eq!(dirs.len(), 4);
        assert_eq!(dirs[0], dir.path());
    }

    #[test]
    fn size_formatting() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5 MB");
    }
}
