//! Cross-program-invocation safety detector.

use std::path::Path;

use crate::finding::{Finding, Severity, VulnClass};

use super::{Scanner, marker_findings};

const CLASSES: &[VulnClass] = &[
    VulnClass::ArbitraryCpi,
    VulnClass::MissingFreezeAuthorityCheck,
    VulnClass::OracleStaleness,
];

pub struct CpiSafetyScanner;

impl Scanner for CpiSafetyScanner {
    fn id(&self) -> &'static str {
        "cpi_safety"
    }

    fn scan_file(&self, path: &Path, source: &str) -> Vec<Finding> {
        let mut findings = marker_findings(self.id(), CLASSES, path, source);
        if path.extension().and_then(|e| e.to_str()) != Some("rs") {
            return findings;
        }

        // invoke()/invoke_signed() against a program id taken from an
        // account is only safe with an address constraint somewhere in scope.
        let pins_program = source.contains("address =") || source.contains("::ID");
        if !pins_program {
            for (idx, line) in source.lines().enumerate() {
                let trimmed = line.trim();
                if (trimmed.contains("invoke(") || trimmed.contains("invoke_signed("))
                    && source.contains("AccountInfo")
                {
                    findings.push(Finding::new(
                        self.id(),
                        VulnClass::ArbitraryCpi,
                        Severity::Medium,
                        55,
                        path.to_path_buf(),
                        idx + 1,
                        "cpi target program is not pinned",
                        "invoke is called while the target program id flows from an \
                         account and no address constraint pins it",
                        trimmed.to_string(),
                    ));
                }
            }
        }

        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn flags_arbitrary_cpi_marker() {
        let source = "// HYDRA_VULN:arbitrary_cpi\npub fn insecure_cpi() {}\n";
        let found = CpiSafetyScanner.scan_file(Path::new("/r/lib.rs"), source);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].vuln_class, VulnClass::ArbitraryCpi);
        assert_eq!(found[0].line, 1);
    }

    #[test]
    fn flags_unpinned_invoke() {
        let source = "\
pub fn forward(target: AccountInfo) {
    invoke(&ix, &[target])?;
}
";
        let found = CpiSafetyScanner.scan_file(Path::new("/r/lib.rs"), source);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].vuln_class, VulnClass::ArbitraryCpi);
    }

    #[test]
    fn address_constraint_suppresses_the_heuristic() {
        let source = "\
// #[account(address = token::ID)]
pub fn forward(target: AccountInfo) {
    invoke(&ix, &[target])?;
}
";
        let found = CpiSafetyScanner.scan_file(Path::new("/r/lib.rs"), source);
        assert!(found.is_empty());
    }
}
