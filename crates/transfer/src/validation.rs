use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use crate::TransferError;

/// Suffix of the chunk-assembly file next to the destination.
const TEMP_SUFFIX: &str = ".tmp";

/// Upper bound on collision counters tried before giving up.
const MAX_COLLISION_SUFFIX: u32 = 10_000;

/// Validates that a relative file path does not escape its base directory.
///
/// Rejects:
/// - Empty paths
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_upload_path(file_path: &str) -> Result<(), TransferError> {
    if file_path.is_empty() {
        return Err(TransferError::InvalidPath("empty path".into()));
    }

    let path = Path::new(file_path);

    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {file_path}"
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {file_path}"
                )));
            }
            Component::Prefix(_) => {
                return Err(TransferError::InvalidPath(format!(
                    "path prefix not allowed: {file_path}"
                )));
            }
            Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {file_path}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}

/// Normalizes a peer-supplied file name into a safe relative path.
///
/// Backslashes become separators, characters that are invalid on common
/// filesystems become `_`, and each component is trimmed of surrounding
/// whitespace and trailing dots. Drive letters and UNC prefixes are rejected
/// rather than rewritten.
pub fn sanitize_file_name(name: &str) -> Result<String, TransferError> {
    let unified = name.replace('\\', "/");
    let bytes = unified.as_bytes();
    let drive_letter = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    if unified.starts_with("//") || drive_letter {
        return Err(TransferError::InvalidPath(format!(
            "drive or network prefix not allowed: {name}"
        )));
    }
    if unified.starts_with('/') {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {name}"
        )));
    }

    let mut parts = Vec::new();
    for raw in unified.split('/') {
        let cleaned: String = raw
            .chars()
            .map(|c| match c {
                '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
                c if c.is_control() => '_',
                c => c,
            })
            .collect();
        let trimmed = cleaned.trim().trim_end_matches('.').trim_end();
        match trimmed {
            "" if raw.trim() == "." || raw.is_empty() => continue,
            "" if raw.trim() == ".." => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {name}"
                )));
            }
            "" => continue,
            t => parts.push(t.to_string()),
        }
    }

    if parts.is_empty() {
        return Err(TransferError::InvalidPath(format!(
            "no usable file name in {name:?}"
        )));
    }
    let joined = parts.join("/");
    validate_upload_path(&joined)?;
    Ok(joined)
}

/// Resolves a peer-supplied file name to a path inside `base_dir`.
pub fn resolve_destination(base_dir: &Path, file_name: &str) -> Result<PathBuf, TransferError> {
    let relative = sanitize_file_name(file_name)?;
    let dest = base_dir.join(&relative);

    // Lexical containment check on top of the component validation above.
    let contained = dest
        .strip_prefix(base_dir)
        .map(|rest| rest.components().all(|c| matches!(c, Component::Normal(_))))
        .unwrap_or(false);
    if !contained {
        return Err(TransferError::InvalidPath(format!(
            "{file_name} escapes the download directory"
        )));
    }
    Ok(dest)
}

/// Returns `<path>.tmp`.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_owned();
    os.push(TEMP_SUFFIX);
    PathBuf::from(os)
}

/// Returns `path` if free, otherwise the first `"name (n).ext"` that is.
pub fn resolve_collision(path: &Path) -> Result<PathBuf, TransferError> {
    if !path.exists() {
        return Ok(path.to_path_buf());
    }

    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    for n in 1..=MAX_COLLISION_SUFFIX {
        let candidate = parent.join(format!("{stem} ({n}){ext}"));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(TransferError::InvalidPath(format!(
        "no free name for {}",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn rejects_empty_path() {
        assert!(validate_upload_path("").is_err());
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        assert!(validate_upload_path("../../../etc/passwd").is_err());
        assert!(validate_upload_path("sub/../../../escape").is_err());
        assert!(validate_upload_path("..").is_err());
    }

    #[test]
    fn rejects_absolute_unix_path() {
        assert!(validate_upload_path("/tmp/malicious").is_err());
    }

    #[test]
    fn accepts_relative_paths() {
        assert!(validate_upload_path("photo.jpg").is_ok());
        assert!(validate_upload_path("sub/dir/file.txt").is_ok());
        assert!(validate_upload_path("./photo.jpg").is_ok());
        assert!(validate_upload_path(".config/settings.json").is_ok());
    }

    #[test]
    fn sanitize_replaces_reserved_characters() {
        assert_eq!(sanitize_file_name("a<b>c:d.txt").unwrap(), "a_b_c_d.txt");
        assert_eq!(sanitize_file_name("what?*.png").unwrap(), "what__.png");
        assert_eq!(sanitize_file_name("tab\there.txt").unwrap(), "tab_here.txt");
        assert_eq!(sanitize_file_name("  spaced.txt  ").unwrap(), "spaced.txt");
        assert_eq!(sanitize_file_name("trailing.").unwrap(), "trailing");
    }

    #[test]
    fn sanitize_normalizes_separators() {
        assert_eq!(sanitize_file_name("dir\\file.txt").unwrap(), "dir/file.txt");
        assert_eq!(sanitize_file_name("./a//b.txt").unwrap(), "a/b.txt");
    }

    #[test]
    fn sanitize_rejects_escapes() {
        assert!(sanitize_file_name("../secret").is_err());
        assert!(sanitize_file_name("a/../../etc/passwd").is_err());
        assert!(sanitize_file_name("..\\..\\windows").is_err());
        assert!(sanitize_file_name("/etc/passwd").is_err());
        assert!(sanitize_file_name("C:\\Windows\\evil.dll").is_err());
        assert!(sanitize_file_name("\\\\server\\share\\x").is_err());
        assert!(sanitize_file_name("").is_err());
        assert!(sanitize_file_name("   ").is_err());
        assert!(sanitize_file_name("./.").is_err());
    }

    #[test]
    fn resolve_destination_stays_inside() {
        let dir = TempDir::new().unwrap();
        let dest = resolve_destination(dir.path(), "report.pdf").unwrap();
        assert_eq!(dest, dir.path().join("report.pdf"));

        let nested = resolve_destination(dir.path(), "photos/2024/a.jpg").unwrap();
        assert!(nested.starts_with(dir.path()));

        assert!(matches!(
            resolve_destination(dir.path(), "../outside.txt"),
            Err(TransferError::InvalidPath(_))
        ));
    }

    #[test]
    fn temp_path_appends_suffix() {
        assert_eq!(
            temp_path_for(Path::new("/dl/movie.mkv")),
            PathBuf::from("/dl/movie.mkv.tmp")
        );
    }

    #[test]
    fn collision_appends_counter_before_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("photo.jpg");
        assert_eq!(resolve_collision(&path).unwrap(), path);

        std::fs::write(&path, b"1").unwrap();
        let first = resolve_collision(&path).unwrap();
        assert_eq!(first, dir.path().join("photo (1).jpg"));

        std::fs::write(&first, b"2").unwrap();
        assert_eq!(
            resolve_collision(&path).unwrap(),
            dir.path().join("photo (2).jpg")
        );
    }

    #[test]
    fn collision_without_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("README");
        std::fs::write(&path, b"x").unwrap();
        assert_eq!(
            resolve_collision(&path).unwrap(),
            dir.path().join("README (1)")
        );
    }
}
