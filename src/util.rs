use std::fs;
use std::path::Path;

const MAX_ERROR_BODY_LEN: usize = 200;

pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Trim a host error body for logs and user-facing messages, redacting it
/// entirely when it looks like it carries credentials.
pub fn sanitize_error_body(body: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "token",
        "secret",
        "password",
        "credential",
        "auth",
        "bearer",
        "ghp_",
        "gho_",
        "ghu_",
        "github_pat_",
    ];

    let truncated = if body.chars().count() > MAX_ERROR_BODY_LEN {
        let head: String = body.chars().take(MAX_ERROR_BODY_LEN).collect();
        format!("{}... (truncated)", head)
    } else {
        body.to_string()
    };

    let lower = truncated.to_lowercase();
    if SECRET_PATTERNS.iter().any(|p| lower.contains(p)) {
        return "(error details redacted - may contain sensitive data)".to_string();
    }

    truncated
}

/// Write `content` next to `path` and rename it into place, owner-only on Unix.
pub fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600));
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_unicode_safe() {
        let input = "ééééé";
        assert_eq!(truncate(input, 4), "é...");
    }

    #[test]
    fn test_truncate_small_max() {
        let input = "こんにちは";
        assert_eq!(truncate(input, 3), "こんに");
        assert_eq!(truncate(input, 0), "");
    }

    #[test]
    fn test_sanitize_error_body_redacts_secrets() {
        assert_eq!(
            sanitize_error_body("Bad credentials for ghp_abc"),
            "(error details redacted - may contain sensitive data)"
        );
        assert_eq!(sanitize_error_body("Not Found"), "Not Found");
    }

    #[test]
    fn test_sanitize_error_body_truncates_long_bodies() {
        let body = "x".repeat(500);
        let sanitized = sanitize_error_body(&body);
        assert!(sanitized.ends_with("... (truncated)"));
        assert_eq!(sanitized.len(), MAX_ERROR_BODY_LEN + "... (truncated)".len());
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        write_atomic(&path, "one").unwrap();
        write_atomic(&path, "two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        assert!(!path.with_extension("tmp").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
