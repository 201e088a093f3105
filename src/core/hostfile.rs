use crate::error::{Error, Result};
use crate::local_files::{self, FileSystem};
use regex::Regex;
use std::path::Path;

/// An ordered sequence of hostnames. Duplicates are permitted and order is
/// significant: it defines rank/placement order for multi-host launch.
///
/// Hostfiles are independent of the resource graph; they may name hosts the
/// graph has never seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hostfile {
    pub hosts: Vec<String>,
}

impl Hostfile {
    pub fn new(hosts: Vec<String>) -> Self {
        Self { hosts }
    }

    pub fn localhost() -> Self {
        Self {
            hosts: vec!["localhost".to_string()],
        }
    }

    /// Parse hostfile text: one pattern per line, blank lines skipped,
    /// bracket ranges expanded (`node-[01-03]`, `node-[1,3-4]-ib`).
    pub fn parse(text: &str) -> Result<Self> {
        let mut hosts = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            hosts.extend(expand_host_pattern(line)?);
        }
        Ok(Self { hosts })
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::hostfile_not_found(path.display().to_string()));
        }
        let text = local_files::local().read(path)?;
        Self::parse(&text)
    }

    /// Persist one host per line, expanded, order preserved.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut text = self.hosts.join("\n");
        text.push('\n');
        local_files::local().write(path, &text)
    }

    /// Load a named hostfile from the config root.
    pub fn load_named(name: &str) -> Result<Self> {
        Self::load(&crate::paths::hostfile(name)?)
    }

    /// Store under a name in the config root for pipelines to reference.
    pub fn save_named(&self, name: &str) -> Result<()> {
        crate::store::validate_name(name, "hostfile")?;
        local_files::ensure_app_dirs()?;
        self.save(&crate::paths::hostfile(name)?)
    }

    pub fn list() -> Result<Vec<String>> {
        let dir = crate::paths::hostfiles()?;
        let entries = local_files::local().list(&dir)?;
        let mut names: Vec<String> = entries
            .into_iter()
            .filter(|e| !e.is_dir)
            .filter_map(|e| e.path.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }
}

/// Expand one hostfile pattern into concrete hostnames.
///
/// `node-[02-04]` -> node-02, node-03, node-04 (zero padding preserved);
/// `node-[1,5-6]-40g` -> node-1-40g, node-5-40g, node-6-40g. A line without
/// brackets passes through untouched.
fn expand_host_pattern(pattern: &str) -> Result<Vec<String>> {
    let bracket = Regex::new(r"\[([^\]]+)\]")
        .map_err(|e| Error::internal_unexpected(format!("hostfile regex: {}", e)))?;

    let Some(m) = bracket.find(pattern) else {
        return Ok(vec![pattern.to_string()]);
    };

    let prefix = &pattern[..m.start()];
    let suffix = &pattern[m.end()..];
    let content = &pattern[m.start() + 1..m.end() - 1];

    let mut parts = Vec::new();
    for piece in content.split(',') {
        let piece = piece.trim();
        match piece.split_once('-') {
            Some((start, end)) if !start.is_empty() => {
                expand_range_piece(start, end, piece, &mut parts);
            }
            _ => parts.push(piece.to_string()),
        }
    }

    // Nested brackets expand recursively (e.g. rack-[1-2]-node-[01-02])
    let mut hosts = Vec::new();
    for part in parts {
        let candidate = format!("{}{}{}", prefix, part, suffix);
        hosts.extend(expand_host_pattern(&candidate)?);
    }
    Ok(hosts)
}

/// Expand one `start-end` piece: numeric range (zero padding preserved),
/// then single-char alphabetic range, then the piece passed through as a
/// literal hostname fragment. A reversed range produces nothing.
fn expand_range_piece(start: &str, end: &str, piece: &str, parts: &mut Vec<String>) {
    if let (Ok(start_num), Ok(end_num)) = (start.parse::<u64>(), end.parse::<u64>()) {
        let width = start.len().max(end.len());
        for i in start_num..=end_num {
            parts.push(format!("{:0width$}", i, width = width));
        }
        return;
    }

    let chars: (Vec<char>, Vec<char>) = (start.chars().collect(), end.chars().collect());
    if let ([s], [e]) = (chars.0.as_slice(), chars.1.as_slice()) {
        if s.is_ascii_alphabetic() && e.is_ascii_alphabetic() {
            let lower = s.is_ascii_lowercase();
            for c in s.to_ascii_lowercase()..=e.to_ascii_lowercase() {
                parts.push(if lower { c } else { c.to_ascii_uppercase() }.to_string());
            }
            return;
        }
    }

    parts.push(piece.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn plain_lines_pass_through_in_order() {
        let hf = Hostfile::parse("alpha\nbeta\nalpha\n").unwrap();
        assert_eq!(hf.hosts, vec!["alpha", "beta", "alpha"]);
    }

    #[test]
    fn ranges_expand_with_zero_padding() {
        let hf = Hostfile::parse("node-[02-04]\n").unwrap();
        assert_eq!(hf.hosts, vec!["node-02", "node-03", "node-04"]);
    }

    #[test]
    fn comma_lists_and_suffixes_expand() {
        let hf = Hostfile::parse("node-[1,3-4]-ib\n").unwrap();
        assert_eq!(hf.hosts, vec!["node-1-ib", "node-3-ib", "node-4-ib"]);
    }

    #[test]
    fn nested_brackets_expand_left_to_right() {
        let hf = Hostfile::parse("rack-[1-2]-node-[01-02]\n").unwrap();
        assert_eq!(
            hf.hosts,
            vec![
                "rack-1-node-01",
                "rack-1-node-02",
                "rack-2-node-01",
                "rack-2-node-02"
            ]
        );
    }

    #[test]
    fn alphabetic_ranges_expand_single_chars() {
        let hf = Hostfile::parse("node-[a-c]\n").unwrap();
        assert_eq!(hf.hosts, vec!["node-a", "node-b", "node-c"]);
    }

    #[test]
    fn alphabetic_ranges_keep_the_start_case() {
        let hf = Hostfile::parse("node-[A-C]\n").unwrap();
        assert_eq!(hf.hosts, vec!["node-A", "node-B", "node-C"]);
    }

    #[test]
    fn unparseable_range_piece_is_kept_literally() {
        let hf = Hostfile::parse("node-[ib-40g,1-2]\n").unwrap();
        assert_eq!(hf.hosts, vec!["node-ib-40g", "node-1", "node-2"]);
    }

    #[test]
    fn reversed_range_expands_to_nothing() {
        let hf = Hostfile::parse("node-[04-02]\n").unwrap();
        assert!(hf.hosts.is_empty());
    }

    #[test]
    fn save_load_round_trip_preserves_order_and_duplicates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hosts");
        let hf = Hostfile::new(vec![
            "b".to_string(),
            "a".to_string(),
            "b".to_string(),
        ]);
        hf.save(&path).unwrap();
        assert_eq!(Hostfile::load(&path).unwrap(), hf);
    }

    #[test]
    fn missing_hostfile_is_not_found() {
        let err = Hostfile::load(Path::new("/nonexistent/hosts")).unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::HostfileNotFound);
    }
}
