//! PDA seed and bump canonicality detector.

use std::path::Path;

use crate::finding::{Finding, Severity, VulnClass};

use super::{Scanner, marker_findings};

const CLASSES: &[VulnClass] = &[VulnClass::NonCanonicalBump];

pub struct PdaSeedsScanner;

impl Scanner for PdaSeedsScanner {
    fn id(&self) -> &'static str {
        "pda_seeds"
    }

    fn scan_file(&self, path: &Path, source: &str) -> Vec<Finding> {
        let mut findings = marker_findings(self.id(), CLASSES, path, source);
        if path.extension().and_then(|e| e.to_str()) != Some("rs") {
            return findings;
        }

        for (idx, line) in source.lines().enumerate() {
            let trimmed = line.trim();
            // create_program_address accepts any bump the caller supplies;
            // canonical derivation goes through find_program_address.
            if trimmed.contains("create_program_address")
                && !trimmed.contains("find_program_address")
            {
                findings.push(Finding::new(
                    self.id(),
                    VulnClass::NonCanonicalBump,
                    Severity::Medium,
                    60,
                    path.to_path_buf(),
                    idx + 1,
                    "pda derived from caller-supplied bump",
                    "create_program_address is used directly, so a non-canonical bump \
                     can produce an aliased pda",
                    trimmed.to_string(),
                ));
            }
        }

        findings
    }
}
