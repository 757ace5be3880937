use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;

use crate::admin::options::AdminOpenOptions;
use crate::admin::util::open_repository;
use crate::admin::Result;
use crate::storage::{IndexFlags, Repository};
use crate::types::ChunkId;

const MAX_FINDINGS: usize = 32;

/// Specifies the depth of verification checks to perform.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyLevel {
    /// Header and transaction log only.
    Fast,
    /// Every chunk re-hashed, every node and link re-read.
    Full,
}

/// Indicates the severity level of a verification finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySeverity {
    /// Informational message about the verification process.
    Info,
    /// Non-critical issue that may indicate a problem.
    Warning,
    /// Critical issue indicating data corruption or integrity failure.
    Error,
}

/// Represents a single issue discovered during verification.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyFinding {
    /// The severity level of this finding.
    pub severity: VerifySeverity,
    /// Human-readable description of the issue.
    pub message: String,
}

/// Statistics collected during the verification process.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyCounts {
    /// Live nodes read back.
    pub nodes_checked: u64,
    /// Live links read back.
    pub links_checked: u64,
    /// Chunks whose bytes were re-hashed.
    pub chunks_checked: u64,
    /// Links whose source or target no longer exists.
    pub dangling_links: u64,
    /// Transactions still pending after open.
    pub pending_transactions: u64,
}

/// Complete report of a verification operation.
#[derive(Clone, Debug, Serialize)]
pub struct VerifyReport {
    /// The verification level that was performed.
    pub level: VerifyLevel,
    /// Whether verification found no errors.
    pub success: bool,
    /// List of issues discovered during verification.
    pub findings: Vec<VerifyFinding>,
    /// Statistics about the data structures examined.
    pub counts: VerifyCounts,
}

#[derive(Default)]
struct Findings {
    items: Vec<VerifyFinding>,
    errors: usize,
}

impl Findings {
    fn push(&mut self, severity: VerifySeverity, message: impl Into<String>) {
        if severity == VerifySeverity::Error {
            self.errors += 1;
        }
        if self.items.len() < MAX_FINDINGS {
            self.items.push(VerifyFinding {
                severity,
                message: message.into(),
            });
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        self.push(VerifySeverity::Error, message);
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.push(VerifySeverity::Warning, message);
    }
}

/// Verifies the integrity of a repository.
///
/// Opening the repository runs recovery if the previous session did not
/// close cleanly; that pass is reported as an informational finding.
///
/// - `VerifyLevel::Fast`: header bounds and transaction log state
/// - `VerifyLevel::Full`: additionally re-reads every chunk, node and link,
///   checks chunk reference counts, and reports dangling links
///
/// # Errors
///
/// Returns an error if the repository cannot be opened. Corruption found
/// while scanning is reported as findings, not errors.
pub fn verify(
    path: impl AsRef<Path>,
    opts: &AdminOpenOptions,
    level: VerifyLevel,
) -> Result<VerifyReport> {
    let repo = open_repository(path.as_ref(), opts)?;
    let mut findings = Findings::default();
    let mut counts = VerifyCounts::default();

    if let Some(report) = repo.recovery_report() {
        findings.push(
            VerifySeverity::Info,
            format!(
                "recovered from unclean shutdown: {} rolled back, {} re-applied, {} failed",
                report.rolled_back, report.reapplied, report.failed
            ),
        );
        if report.failed > 0 {
            findings.warning(format!("{} transactions failed to replay", report.failed));
        }
    }
    check_header(&repo, &mut findings)?;
    counts.pending_transactions = repo
        .transactions()
        .iter()
        .filter(|tx| !tx.status.is_terminal())
        .count() as u64;

    if matches!(level, VerifyLevel::Full) {
        check_chunks(&repo, &mut findings, &mut counts);
        check_nodes(&repo, &mut findings, &mut counts);
        check_links(&repo, &mut findings, &mut counts);
    }
    repo.close()?;

    Ok(VerifyReport {
        level,
        success: findings.errors == 0,
        findings: findings.items,
        counts,
    })
}

fn check_header(repo: &Repository, findings: &mut Findings) -> Result<()> {
    let header = repo.header();
    let len = repo.file_len()?;
    if header.data_end > len {
        findings.error(format!(
            "header data_end {} is past end of file {len}",
            header.data_end
        ));
    }
    for (what, offset) in [
        ("chunk", header.chunk_index_offset),
        ("node", header.node_index_offset),
        ("edge", header.edge_index_offset),
    ] {
        if offset >= header.data_end && offset != 0 {
            findings.error(format!("{what} index offset {offset} is past data_end"));
        }
    }
    if header.modified < header.created {
        findings.warning("header modified time precedes creation time");
    }
    Ok(())
}

fn check_chunks(repo: &Repository, findings: &mut Findings, counts: &mut VerifyCounts) {
    for id in repo.chunk_store().ids() {
        counts.chunks_checked += 1;
        match repo.verify_chunk(&id) {
            Ok(true) => {}
            Ok(false) => findings.error(format!("chunk {id} failed hash or checksum verification")),
            Err(err) => findings.error(format!("chunk {id} unreadable: {err}")),
        }
    }
}

fn check_nodes(repo: &Repository, findings: &mut Findings, counts: &mut VerifyCounts) {
    let chunks = repo.chunk_store();
    let mut expected: HashMap<ChunkId, u32> = HashMap::new();
    for entry in repo.node_store().entries() {
        if entry.flags.contains(IndexFlags::DELETED) {
            continue;
        }
        let record = match repo.node_store().read_entry(&entry) {
            Ok(record) => record,
            Err(err) => {
                findings.error(format!("node at offset {} unreadable: {err}", entry.offset));
                continue;
            }
        };
        counts.nodes_checked += 1;
        if entry.flags.contains(IndexFlags::TEMPORARY) {
            findings.warning(format!("node {} is still flagged temporary", record.id));
        }
        for chunk in &record.chunks {
            if !chunks.contains(chunk) {
                findings.error(format!("node {} references missing chunk {chunk}", record.id));
            }
            *expected.entry(*chunk).or_insert(0) += 1;
        }
    }
    for id in chunks.ids() {
        let want = expected.get(&id).copied().unwrap_or(0);
        let have = chunks.ref_count(&id);
        if want != have {
            findings.warning(format!(
                "chunk {id} has reference count {have}, nodes reference it {want} times"
            ));
        }
    }
}

fn check_links(repo: &Repository, findings: &mut Findings, counts: &mut VerifyCounts) {
    for entry in repo.link_store().entries() {
        if entry.flags.contains(IndexFlags::DELETED) {
            continue;
        }
        let link = match repo.link_store().read_entry(&entry) {
            Ok(link) => link,
            Err(err) => {
                findings.error(format!("link at offset {} unreadable: {err}", entry.offset));
                continue;
            }
        };
        counts.links_checked += 1;
        if entry.flags.contains(IndexFlags::TEMPORARY) {
            findings.warning(format!("link {} is still flagged temporary", link.composite_key()));
        }
        for end in [&link.source, &link.target] {
            if !repo.contains_node(end) {
                counts.dangling_links += 1;
                findings.warning(format!(
                    "link {} points at missing node {end}",
                    link.composite_key()
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Metadata, NodeId};
    use tempfile::tempdir;

    #[test]
    fn clean_repository_verifies() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kg.cairn");
        let repo = Repository::create(&path).unwrap();
        let a = repo.add_node(b"shared", "note", &Metadata::new()).unwrap();
        let b = repo
            .add_node(b"shared", "note", &Metadata::new().with("n", 2i64))
            .unwrap();
        repo.add_link(&a, &b, "ref", &Metadata::new()).unwrap();
        repo.close().unwrap();

        let report = verify(&path, &AdminOpenOptions::default(), VerifyLevel::Full).unwrap();
        assert!(report.success, "{:?}", report.findings);
        assert!(report.findings.is_empty());
        assert_eq!(report.counts.nodes_checked, 2);
        assert_eq!(report.counts.chunks_checked, 1);
    }

    #[test]
    fn dangling_link_is_a_warning() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kg.cairn");
        let repo = Repository::create(&path).unwrap();
        let a = NodeId::new("a").unwrap();
        let b = NodeId::new("b").unwrap();
        repo.add_node_with_id(&a, b"a", "note", &Metadata::new()).unwrap();
        repo.add_node_with_id(&b, b"b", "note", &Metadata::new()).unwrap();
        repo.add_link(&a, &b, "ref", &Metadata::new()).unwrap();
        repo.delete_node(&b).unwrap();
        repo.close().unwrap();

        let report = verify(&path, &AdminOpenOptions::default(), VerifyLevel::Full).unwrap();
        assert!(report.success);
        assert_eq!(report.counts.dangling_links, 1);
        assert_eq!(report.findings[0].severity, VerifySeverity::Warning);
    }

    #[test]
    fn missing_repository_is_reported() {
        let dir = tempdir().unwrap();
        let err = verify(
            dir.path().join("absent.cairn"),
            &AdminOpenOptions::default(),
            VerifyLevel::Fast,
        )
        .unwrap_err();
        assert!(matches!(err, crate::admin::AdminError::MissingRepository(_)));
    }
}
