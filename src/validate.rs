//! Pre-submission validation: size/type checks, content-signature sniffing,
//! and duplicate detection via content hash.
//!
//! Per-file checks are independent; one file's failure never aborts the
//! rest of the batch.

use crate::hashing::sha256_bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::task::JoinSet;

/// Sniffed types treated as an error rather than a warning.
pub const DANGEROUS_TYPES: &[&str] = &["application/x-msdownload", "application/x-elf"];

/// What a candidate file claims to be, before any transfer happens.
#[derive(Debug, Clone)]
pub struct FileCandidate {
    pub name: String,
    pub size: u64,
    /// Declared MIME type; empty string when the host doesn't know.
    pub declared_type: String,
    /// Leading content bytes for signature sniffing and duplicate hashing.
    pub head: Vec<u8>,
}

/// Validation policy applied to each candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationPolicy {
    pub max_file_size: u64,
    /// Allowed type patterns: exact (`image/png`), wildcard prefix
    /// (`image/*`), or extension (`.png`). Empty = allow everything.
    pub allowed_types: Vec<String>,
    pub sniff_content: bool,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            max_file_size: 1024 * 1024 * 1024,
            allowed_types: Vec::new(),
            sniff_content: true,
        }
    }
}

/// Outcome of validating one candidate.
#[derive(Debug, Clone)]
pub struct FileReport {
    pub name: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Content hash of the available bytes, for duplicate detection.
    pub content_hash: Option<String>,
}

impl FileReport {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Sniff a MIME type from leading magic bytes. Returns None when no known
/// signature matches.
pub fn sniff_type(head: &[u8]) -> Option<&'static str> {
    if head.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("image/png")
    } else if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if head.starts_with(b"GIF8") {
        Some("image/gif")
    } else if head.starts_with(b"%PDF") {
        Some("application/pdf")
    } else if head.starts_with(&[b'P', b'K', 0x03, 0x04]) {
        Some("application/zip")
    } else if head.starts_with(b"MZ") {
        Some("application/x-msdownload")
    } else if head.starts_with(&[0x7F, b'E', b'L', b'F']) {
        Some("application/x-elf")
    } else {
        None
    }
}

/// Whether `declared` (or the file's extension) matches the allow-list.
pub fn type_allowed(declared: &str, name: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    allowed.iter().any(|pattern| {
        if let Some(prefix) = pattern.strip_suffix("/*") {
            declared
                .split('/')
                .next()
                .is_some_and(|major| major == prefix)
        } else if pattern.starts_with('.') {
            name.to_ascii_lowercase()
                .ends_with(&pattern.to_ascii_lowercase())
        } else {
            declared == pattern
        }
    })
}

impl ValidationPolicy {
    pub fn validate(&self, candidate: &FileCandidate) -> FileReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if candidate.size == 0 {
            errors.push("file is empty".to_string());
        } else if candidate.size > self.max_file_size {
            errors.push(format!(
                "size {} exceeds maximum {}",
                candidate.size, self.max_file_size
            ));
        }

        if !type_allowed(&candidate.declared_type, &candidate.name, &self.allowed_types) {
            errors.push(format!(
                "type {:?} not in the allow-list",
                candidate.declared_type
            ));
        }

        if self.sniff_content {
            if let Some(sniffed) = sniff_type(&candidate.head) {
                if DANGEROUS_TYPES.contains(&sniffed) {
                    errors.push(format!("content signature is {}", sniffed));
                } else if !candidate.declared_type.is_empty()
                    && sniffed != candidate.declared_type
                {
                    warnings.push(format!(
                        "declared type {} but content looks like {}",
                        candidate.declared_type, sniffed
                    ));
                }
            }
        }

        let content_hash = if candidate.head.is_empty() {
            None
        } else {
            Some(sha256_bytes(&candidate.head))
        };

        FileReport {
            name: candidate.name.clone(),
            errors,
            warnings,
            content_hash,
        }
    }

    /// Validate a batch concurrently, preserving input order. A panicking or
    /// failing check only affects its own file.
    pub async fn validate_all(&self, candidates: Vec<FileCandidate>) -> Vec<FileReport> {
        let names: Vec<String> = candidates.iter().map(|c| c.name.clone()).collect();
        let mut join_set = JoinSet::new();
        for (index, candidate) in candidates.into_iter().enumerate() {
            let policy = self.clone();
            join_set.spawn(async move { (index, policy.validate(&candidate)) });
        }

        let mut slots: Vec<Option<FileReport>> = names.iter().map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, report)) => slots[index] = Some(report),
                Err(e) => tracing::warn!("validation task failed: {}", e),
            }
        }
        // A lost task still yields a (failing) report so the output always
        // lines up with the input by index.
        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| FileReport {
                    name: names[index].clone(),
                    errors: vec!["validation task failed".to_string()],
                    warnings: Vec::new(),
                    content_hash: None,
                })
            })
            .collect()
    }
}

/// Groups of report indices sharing a content hash (only groups of 2+).
pub fn duplicate_groups(reports: &[FileReport]) -> Vec<Vec<usize>> {
    let mut by_hash: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, report) in reports.iter().enumerate() {
        if let Some(hash) = report.content_hash.as_deref() {
            by_hash.entry(hash).or_default().push(i);
        }
    }
    let mut groups: Vec<Vec<usize>> = by_hash
        .into_values()
        .filter(|group| group.len() >= 2)
        .collect();
    groups.sort_by_key(|g| g[0]);
    groups
}

/// Indices to keep when dropping all but the first of each duplicate group.
pub fn dedup_first(reports: &[FileReport]) -> Vec<usize> {
    let mut drop = std::collections::HashSet::new();
    for group in duplicate_groups(reports) {
        for &i in &group[1..] {
            drop.insert(i);
        }
    }
    (0..reports.len()).filter(|i| !drop.contains(i)).collect()
}
