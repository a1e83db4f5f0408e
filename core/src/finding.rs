//! The finding model shared by every stage of the pipeline.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Severity of a finding. The derived ordering follows declaration order, so
/// `Critical` compares greatest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// Closed vocabulary of vulnerability classes.
///
/// Serde rejects unknown tags, which is the ingress filter: nothing untyped
/// makes it past deserialization into the aggregator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum VulnClass {
    // Solana / Anchor specific.
    MissingSignerCheck,
    MissingOwnerCheck,
    ArbitraryCpi,
    NonCanonicalBump,
    AccountReinit,
    DuplicateMutableAccounts,
    TypeCosplay,
    IntegerOverflow,
    MissingFreezeAuthorityCheck,
    OracleStaleness,
    // General purpose.
    SqlInjection,
    CommandInjection,
    PathTraversal,
    HardcodedSecret,
    UnvalidatedInput,
    Other,
}

impl VulnClass {
    /// The wire tag, e.g. `missing_signer_check`.
    pub fn as_tag(&self) -> &'static str {
        match self {
            VulnClass::MissingSignerCheck => "missing_signer_check",
            VulnClass::MissingOwnerCheck => "missing_owner_check",
            VulnClass::ArbitraryCpi => "arbitrary_cpi",
            VulnClass::NonCanonicalBump => "non_canonical_bump",
            VulnClass::AccountReinit => "account_reinit",
            VulnClass::DuplicateMutableAccounts => "duplicate_mutable_accounts",
            VulnClass::TypeCosplay => "type_cosplay",
            VulnClass::IntegerOverflow => "integer_overflow",
            VulnClass::MissingFreezeAuthorityCheck => "missing_freeze_authority_check",
            VulnClass::OracleStaleness => "oracle_staleness",
            VulnClass::SqlInjection => "sql_injection",
            VulnClass::CommandInjection => "command_injection",
            VulnClass::PathTraversal => "path_traversal",
            VulnClass::HardcodedSecret => "hardcoded_secret",
            VulnClass::UnvalidatedInput => "unvalidated_input",
            VulnClass::Other => "other",
        }
    }

    /// Parse a wire tag. Unknown tags are rejected, not coerced to `Other`.
    pub fn parse_tag(tag: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(tag.to_string())).ok()
    }
}

impl fmt::Display for VulnClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// A coordinate-addressed vulnerability report. Immutable once it leaves the
/// aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Stable hash of `scanner_id | vuln_class | file | line`.
    pub id: String,
    /// Producing scanner, or a ` + `-joined union after corroboration.
    pub scanner_id: String,
    pub vuln_class: VulnClass,
    pub severity: Severity,
    /// 0..=100.
    pub confidence: u8,
    /// Absolute path of the offending file.
    pub file: PathBuf,
    /// 1-based line number.
    pub line: usize,
    pub title: String,
    pub description: String,
    pub evidence: String,
}

impl Finding {
    /// Deterministic id for a `(scanner, class, file, line)` coordinate.
    pub fn compute_id(scanner_id: &str, vuln_class: VulnClass, file: &Path, line: usize) -> String {
        let mut hasher = Sha256::new();
        hasher.update(scanner_id.as_bytes());
        hasher.update(b"|");
        hasher.update(vuln_class.as_tag().as_bytes());
        hasher.update(b"|");
        hasher.update(file.to_string_lossy().as_bytes());
        hasher.update(b"|");
        hasher.update(line.to_string().as_bytes());
        hex::encode(&hasher.finalize()[..6])
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scanner_id: &str,
        vuln_class: VulnClass,
        severity: Severity,
        confidence: u8,
        file: PathBuf,
        line: usize,
        title: impl Into<String>,
        description: impl Into<String>,
        evidence: impl Into<String>,
    ) -> Self {
        Self {
            id: Self::compute_id(scanner_id, vuln_class, &file, line),
            scanner_id: scanner_id.to_string(),
            vuln_class,
            severity,
            confidence: confidence.min(100),
            file,
            line: line.max(1),
            title: title.into(),
            description: description.into(),
            evidence: evidence.into(),
        }
    }

    /// The set of distinct scanners that contributed, split on the ` + `
    /// union separator.
    pub fn contributing_scanners(&self) -> Vec<&str> {
        self.scanner_id.split(" + ").collect()
    }

    /// Two findings describe the same location iff class, file, and line match.
    pub fn same_location(&self, other: &Finding) -> bool {
        self.vuln_class == other.vuln_class && self.file == other.file && self.line == other.line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn severity_order_is_total() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn vuln_class_round_trips_wire_tags() {
        assert_eq!(
            VulnClass::parse_tag("missing_signer_check"),
            Some(VulnClass::MissingSignerCheck)
        );
        assert_eq!(VulnClass::MissingSignerCheck.as_tag(), "missing_signer_check");
        assert_eq!(VulnClass::parse_tag("definitely_not_a_class"), None);
    }

    #[test]
    fn unknown_tag_is_a_deser_error() {
        let raw = r#"{"id":"x","scanner_id":"s","vuln_class":"made_up","severity":"high",
            "confidence":50,"file":"/a","line":1,"title":"t","description":"d","evidence":"e"}"#;
        assert!(serde_json::from_str::<Finding>(raw).is_err());
    }

    #[test]
    fn id_depends_only_on_coordinates() {
        let a = Finding::compute_id(
            "acct",
            VulnClass::MissingSignerCheck,
            Path::new("/repo/src/lib.rs"),
            42,
        );
        let b = Finding::compute_id(
            "acct",
            VulnClass::MissingSignerCheck,
            Path::new("/repo/src/lib.rs"),
            42,
        );
        let c = Finding::compute_id(
            "acct",
            VulnClass::MissingSignerCheck,
            Path::new("/repo/src/lib.rs"),
            43,
        );
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 12);
    }

    #[test]
    fn contributing_scanners_splits_unions() {
        let f = Finding::new(
            "a + b",
            VulnClass::ArbitraryCpi,
            Severity::High,
            80,
            PathBuf::from("/repo/x.rs"),
            1,
            "t",
            "d",
            "e",
        );
        assert_eq!(f.contributing_scanners(), vec!["a", "b"]);
    }
}
