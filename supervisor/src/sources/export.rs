//! Code blocks recovered from a chat export.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use super::RawCandidate;
use crate::candidate::payload_digest;

/// Split `text` on blank lines and keep chunks that start like code.
///
/// Blocks are numbered from 1 in document order; later duplicates of an
/// earlier block are dropped.
pub fn extract_blocks(text: &str, prefixes: &[String]) -> Vec<RawCandidate> {
    let normalized = text.replace("\r\n", "\n");
    let mut seen = HashSet::new();
    let mut blocks = Vec::new();
    for chunk in normalized.split("\n\n") {
        let block = chunk.trim();
        if block.is_empty() || !prefixes.iter().any(|prefix| block.starts_with(prefix.as_str())) {
            continue;
        }
        if !seen.insert(payload_digest(block.as_bytes())) {
            continue;
        }
        let number = blocks.len() + 1;
        blocks.push(RawCandidate::new(
            format!("{block}\n"),
            format!("export block {number}"),
        ));
    }
    blocks
}

/// Read the export at `path` and extract its code blocks.
pub fn scan_export(path: &Path, prefixes: &[String]) -> Result<Vec<RawCandidate>> {
    let text = fs::read_to_string(path).with_context(|| format!("read export {}", path.display()))?;
    let blocks = extract_blocks(&text, prefixes);
    info!(path = %path.display(), blocks = blocks.len(), "scanned chat export");
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefixes() -> Vec<String> {
        vec!["import ".to_string(), "def ".to_string(), "class ".to_string()]
    }

    #[test]
    fn keeps_only_code_like_chunks() {
        let export = "User: can you fix it?\n\nimport os\nprint(os.name)\n\nSure, here you go.\n\ndef main():\n    return 1\n";

        let blocks = extract_blocks(export, &prefixes());

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].bytes, b"import os\nprint(os.name)\n");
        assert_eq!(blocks[0].provenance, "export block 1");
        assert_eq!(blocks[1].bytes, b"def main():\n    return 1\n");
        assert_eq!(blocks[1].provenance, "export block 2");
    }

    #[test]
    fn duplicates_are_dropped_and_numbering_stays_dense() {
        let export = "class A: pass\n\nclass A: pass\n\nimport sys\n";
        let blocks = extract_blocks(export, &prefixes());

        let labels: Vec<&str> = blocks.iter().map(|b| b.provenance.as_str()).collect();
        assert_eq!(labels, vec!["export block 1", "export block 2"]);
    }

    #[test]
    fn crlf_exports_split_like_lf() {
        let export = "hello\r\n\r\nimport json\r\nprint(1)\r\n";
        let blocks = extract_blocks(export, &prefixes());
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].bytes, b"import json\nprint(1)\n");
    }

    #[test]
    fn scan_missing_export_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = scan_export(&temp.path().join("chat.txt"), &prefixes()).unwrap_err();
        assert!(err.to_string().contains("read export"));
    }
}
