//! Writes the entrypoint's environment to `/.runqenv` (spec §4.4.1 step 4).

use runq_core::{Result, RunqError};
use std::path::Path;

/// Quotes one `NAME=value` pair per the spec's rules: empty value -> `""`;
/// a value already wrapped in matching `'...'` or `"..."` is left as-is;
/// anything else is wrapped in double quotes.
pub fn quote_line(name: &str, value: &str) -> String {
    let quoted = if value.is_empty() {
        "\"\"".to_string()
    } else if already_quoted(value) {
        value.to_string()
    } else {
        format!("\"{value}\"")
    };
    format!("{name}={quoted}\n")
}

fn already_quoted(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.len() < 2 {
        return false;
    }
    (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'')
        || (bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
}

/// Splits a `NAME=value` entrypoint env entry.
fn split_env(entry: &str) -> Option<(&str, &str)> {
    entry.split_once('=')
}

/// Writes every entrypoint env var to `path`, chmod 0400, chown to
/// `uid:gid`.
pub fn write(path: &Path, env: &[String], uid: u32, gid: u32) -> Result<()> {
    let mut contents = String::new();
    for entry in env {
        let Some((name, value)) = split_env(entry) else {
            continue;
        };
        contents.push_str(&quote_line(name, value));
    }
    std::fs::write(path, contents).map_err(|e| RunqError::Boot(format!("write {path:?} failed: {e}")))?;

    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o400))
        .map_err(|e| RunqError::Boot(format!("chmod {path:?} failed: {e}")))?;
    nix::unistd::chown(path, Some(nix::unistd::Uid::from_raw(uid)), Some(nix::unistd::Gid::from_raw(gid)))
        .map_err(|e| RunqError::Boot(format!("chown {path:?} failed: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_line_empty_value() {
        assert_eq!(quote_line("FOO", ""), "FOO=\"\"\n");
    }

    #[test]
    fn test_quote_line_wraps_unquoted() {
        assert_eq!(quote_line("PATH", "/usr/bin"), "PATH=\"/usr/bin\"\n");
    }

    #[test]
    fn test_quote_line_leaves_already_double_quoted() {
        assert_eq!(quote_line("FOO", "\"bar\""), "FOO=\"bar\"\n");
    }

    #[test]
    fn test_quote_line_leaves_already_single_quoted() {
        assert_eq!(quote_line("FOO", "'bar'"), "FOO='bar'\n");
    }

    #[test]
    fn test_quote_line_mismatched_quotes_are_wrapped() {
        assert_eq!(quote_line("FOO", "'bar\""), "FOO=\"'bar\"\"\n");
    }
}
