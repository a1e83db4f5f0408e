//! Account-validation detector for Anchor programs.
//!
//! Claims the account-integrity class partition: signer checks, owner
//! checks, re-initialization, duplicate mutable accounts, and type cosplay.

use std::path::Path;

use crate::finding::{Finding, Severity, VulnClass};

use super::{Scanner, marker_findings};

const CLASSES: &[VulnClass] = &[
    VulnClass::MissingSignerCheck,
    VulnClass::MissingOwnerCheck,
    VulnClass::AccountReinit,
    VulnClass::DuplicateMutableAccounts,
    VulnClass::TypeCosplay,
];

pub struct AccountValidationScanner;

impl Scanner for AccountValidationScanner {
    fn id(&self) -> &'static str {
        "account_validation"
    }

    fn scan_file(&self, path: &Path, source: &str) -> Vec<Finding> {
        let mut findings = marker_findings(self.id(), CLASSES, path, source);
        if path.extension().and_then(|e| e.to_str()) != Some("rs") {
            return findings;
        }

        // A raw AccountInfo named like an authority, in a tree that never
        // consults is_signer, is the classic unchecked-authority shape.
        let checks_signer = source.contains("is_signer") || source.contains("Signer<");
        if !checks_signer {
            for (idx, line) in source.lines().enumerate() {
                let trimmed = line.trim();
                if trimmed.contains("AccountInfo")
                    && (trimmed.contains("authority") || trimmed.contains("admin"))
                {
                    findings.push(Finding::new(
                        self.id(),
                        VulnClass::MissingSignerCheck,
                        Severity::Medium,
                        55,
                        path.to_path_buf(),
                        idx + 1,
                        "authority account without signer check",
                        "an authority-like account is declared as raw AccountInfo and \
                         is_signer is never consulted in this file",
                        trimmed.to_string(),
                    ));
                }
            }
        }

        // UncheckedAccount fields bypass Anchor's owner validation entirely.
        for (idx, line) in source.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.contains("UncheckedAccount<") && !source.contains("owner ==") {
                findings.push(Finding::new(
                    self.id(),
                    VulnClass::MissingOwnerCheck,
                    Severity::Medium,
                    50,
                    path.to_path_buf(),
                    idx + 1,
                    "unchecked account without owner validation",
                    "UncheckedAccount skips owner checks and no manual owner comparison \
                     appears in this file",
                    trimmed.to_string(),
                ));
            }
        }

        findings
    }
}
