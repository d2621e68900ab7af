//! Model keys and model directory listing.

use std::path::Path;

use crate::error::{Error, Result};

/// Turn a caller-supplied model name into a key that names a file directly
/// inside the model directory.
///
/// Separators (`/` and `\`) split the input into segments; empty, `.` and
/// `..` segments are dropped and the rest are joined with `_`, so the key
/// never contains a separator or a traversal segment.
pub fn sanitize_model_key(raw: &str) -> Result<String> {
    let key = raw
        .split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .collect::<Vec<_>>()
        .join("_");

    if key.is_empty() || key.contains('\0') {
        return Err(Error::InvalidModelKey(raw.to_string()));
    }
    Ok(key)
}

/// Whether `file_name` has one of `extensions` (case-insensitive).
pub(crate) fn has_model_extension(file_name: &str, extensions: &[String]) -> bool {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
}

/// Model files directly inside `model_dir` as `(key, size_bytes)`, sorted by key.
/// A missing directory lists nothing.
pub(crate) fn scan_model_dir(model_dir: &Path, extensions: &[String]) -> Vec<(String, u64)> {
    let entries = match std::fs::read_dir(model_dir) {
        Ok(e) => e,
        Err(e) => {
            tracing::debug!("Cannot read model directory {}: {}", model_dir.display(), e);
            return Vec::new();
        }
    };

    let mut models: Vec<(String, u64)> = entries
        .flatten()
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            if !metadata.is_file() {
                return None;
            }
            let file_name = entry.file_name().into_string().ok()?;
            // Only names that are already valid keys can be resolved
            let is_key = sanitize_model_key(&file_name).ok()? == file_name;
            (is_key && has_model_extension(&file_name, extensions))
                .then_some((file_name, metadata.len()))
        })
        .collect();

    models.sort_by(|a, b| a.0.cmp(&b.0));
    models
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_sanitize_plain_name_unchanged() {
        assert_eq!(
            sanitize_model_key("WizardLM-7B.ggmlv3.q4_0.bin").unwrap(),
            "WizardLM-7B.ggmlv3.q4_0.bin"
        );
    }

    #[test]
    fn test_sanitize_traversal() {
        let key = sanitize_model_key("../../etc/passwd").unwrap();
        assert_eq!(key, "etc_passwd");
        assert!(!key.contains('/'));
        assert!(!key.split('_').any(|s| s == ".."));

        let model_dir = PathBuf::from("/srv/models");
        let resolved = model_dir.join(&key);
        assert_eq!(resolved.parent(), Some(model_dir.as_path()));
    }

    #[test]
    fn test_sanitize_windows_separators() {
        assert_eq!(
            sanitize_model_key("..\\..\\Windows\\win.ini").unwrap(),
            "Windows_win.ini"
        );
    }

    #[test]
    fn test_sanitize_rejects_empty_and_dots() {
        for raw in ["", "..", ".", "../..", "/", "./../"] {
            assert!(
                matches!(sanitize_model_key(raw), Err(Error::InvalidModelKey(_))),
                "{:?} should be rejected",
                raw
            );
        }
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let once = sanitize_model_key("a/../b/./c.bin").unwrap();
        assert_eq!(once, "a_b_c.bin");
        assert_eq!(sanitize_model_key(&once).unwrap(), once);
    }

    #[test]
    fn test_has_model_extension() {
        let exts = vec!["bin".to_string(), "gguf".to_string()];
        assert!(has_model_extension("llama.bin", &exts));
        assert!(has_model_extension("MODEL.GGUF", &exts));
        assert!(!has_model_extension("notes.txt", &exts));
        assert!(!has_model_extension("bin", &exts));
    }

    #[test]
    fn test_scan_model_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.bin"), b"12345").unwrap();
        std::fs::write(dir.path().join("a.gguf"), b"1").unwrap();
        std::fs::write(dir.path().join("readme.md"), b"hi").unwrap();
        std::fs::create_dir(dir.path().join("sub.bin")).unwrap();

        let exts = vec!["bin".to_string(), "gguf".to_string()];
        let models = scan_model_dir(dir.path(), &exts);
        assert_eq!(
            models,
            vec![("a.gguf".to_string(), 1), ("b.bin".to_string(), 5)]
        );
    }

    #[test]
    fn test_scan_missing_dir() {
        let models = scan_model_dir(Path::new("/nonexistent/models"), &["bin".to_string()]);
        assert!(models.is_empty());
    }
}
