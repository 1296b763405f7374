use anyhow::{Context, Result};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

/// Translate a shell wildcard (`*`, `?`, `[...]`) into an anchored regex.
pub fn wildcard_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '[' => {
                re.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    re.push('^');
                }
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    if c == '\\' || c == '^' {
                        re.push('\\');
                    }
                    re.push(c);
                }
                re.push(']');
            }
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).with_context(|| format!("Invalid file pattern: {}", pattern))
}

fn has_wildcard(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/// Files in `dir` whose names match `pattern`, sorted by name. Only the
/// file name may contain wildcards; a directory part is joined onto `dir`.
pub fn glob_in(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full = dir.join(pattern);
    let name = full
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = full.parent().unwrap_or(dir).to_path_buf();

    if !has_wildcard(&name) {
        return Ok(if full.exists() { vec![full] } else { Vec::new() });
    }

    let re = wildcard_regex(&name)?;
    let entries = match fs::read_dir(&parent) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::trace!("⚠️  Cannot read directory {:?}: {}", parent, e);
            return Ok(Vec::new());
        }
    };

    let mut found = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::trace!("⚠️  Error reading entry in {:?}: {}", parent, e);
                continue;
            }
        };
        let path = entry.path();
        if path.is_dir() {
            continue;
        }
        if let Some(filename) = path.file_name().and_then(|n| n.to_str()) {
            if re.is_match(filename) {
                found.push(path);
            }
        }
    }
    found.sort();
    tracing::trace!("{} matched {} files", pattern, found.len());
    Ok(found)
}

/// First match of `pattern` in `dir`, if any.
pub fn first_match(dir: &Path, pattern: &str) -> Result<Option<PathBuf>> {
    Ok(glob_in(dir, pattern)?.into_iter().next())
}

/// Delete every file in `dir` matching `pattern`. Returns how many went.
pub fn remove_matching(dir: &Path, pattern: &str) -> Result<usize> {
    let files = glob_in(dir, pattern)?;
    for file in &files {
        fs::remove_file(file).with_context(|| format!("Failed to remove {}", file.display()))?;
        tracing::trace!("🗑️  Removed {}", file.display());
    }
    Ok(files.len())
}

/// Remove `path` if it exists.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()))?;
        return Ok(true);
    }
    Ok(false)
}

/// File name of `path` with `suffix` removed, e.g. `x_drz.fits` -> `x`.
pub fn stem_before(path: &Path, suffix: &str) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    name.strip_suffix(suffix).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_wildcard_regex() -> Result<()> {
        let re = wildcard_regex("ib*050_asn.json")?;
        assert!(re.is_match("ib3728050_asn.json"));
        assert!(!re.is_match("ib3728060_asn.json"));

        let re = wildcard_regex("MARSHALL[135]-G_asn.json")?;
        assert!(re.is_match("MARSHALL3-G_asn.json"));
        assert!(!re.is_match("MARSHALL2-G_asn.json"));

        let re = wildcard_regex("GEORGE-?-G_asn.json")?;
        assert!(re.is_match("GEORGE-1-G_asn.json"));
        assert!(!re.is_match("GEORGE-12-G_asn.json"));

        let re = wildcard_regex("a.b[!x]")?;
        assert!(re.is_match("a.by"));
        assert!(!re.is_match("aXbx"));
        Ok(())
    }

    #[test]
    fn test_glob_and_remove() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::create_dir_all(root.join("sub"))?;
        fs::write(root.join("a.BLOT.SCI.fits"), "x")?;
        fs::write(root.join("b.BLOT.WHT.fits"), "x")?;
        fs::write(root.join("b_flt.fits"), "x")?;
        fs::write(root.join("sub/c_drz.fits"), "x")?;

        let blots = glob_in(root, "*BLOT*")?;
        assert_eq!(blots.len(), 2);
        assert!(blots[0].ends_with("a.BLOT.SCI.fits"));

        assert_eq!(glob_in(root, "sub/*_drz.fits")?.len(), 1);
        assert_eq!(glob_in(root, "b_flt.fits")?.len(), 1);
        assert!(glob_in(root, "missing/*.fits")?.is_empty());

        assert_eq!(remove_matching(root, "*BLOT*")?, 2);
        assert!(glob_in(root, "*BLOT*")?.is_empty());
        assert!(root.join("b_flt.fits").exists());
        Ok(())
    }

    #[test]
    fn test_stem_before() {
        assert_eq!(
            stem_before(Path::new("x/GOODS-N-43-D_drz.fits"), "_drz.fits"),
            Some("GOODS-N-43-D".to_string())
        );
        assert_eq!(stem_before(Path::new("y.fits"), "_drz.fits"), None);
    }
}
