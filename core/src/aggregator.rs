//! Deduplication, corroboration, and gating of raw scanner findings.
//!
//! Findings are grouped by `(vuln_class, file, line)`. Within a group the
//! highest-severity finding wins (first seen on ties), scanner ids are
//! unioned, and agreement between distinct scanners earns a confidence
//! boost. The whole pass is a pure function of its input.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::finding::{Finding, VulnClass};

const CORROBORATION_BONUS: u8 = 5;
const CONFIDENCE_CEILING: u8 = 99;
const CORROBORATED_MARKER: &str = "(corroborated)";

type Coordinate = (VulnClass, PathBuf, usize);

struct GroupAcc {
    winner: Finding,
    scanners: Vec<String>,
    confidence: u8,
    descriptions: Vec<String>,
    evidences: Vec<String>,
}

impl GroupAcc {
    fn new(finding: Finding) -> Self {
        let scanners = finding
            .contributing_scanners()
            .iter()
            .map(|s| s.to_string())
            .collect();
        Self {
            confidence: finding.confidence,
            descriptions: vec![finding.description.clone()],
            evidences: vec![finding.evidence.clone()],
            scanners,
            winner: finding,
        }
    }

    fn merge(&mut self, incoming: Finding) {
        for scanner in incoming.contributing_scanners() {
            if !self.scanners.iter().any(|s| s == scanner) {
                self.scanners.push(scanner.to_string());
            }
        }

        let corroborated = self.scanners.len() >= 2;
        let base = self.confidence.max(incoming.confidence);
        let bonus = if corroborated { CORROBORATION_BONUS } else { 0 };
        self.confidence = base.saturating_add(bonus).min(CONFIDENCE_CEILING);

        if !self.descriptions.contains(&incoming.description) {
            self.descriptions.push(incoming.description.clone());
        }
        if !incoming.evidence.is_empty() && !self.evidences.contains(&incoming.evidence) {
            self.evidences.push(incoming.evidence.clone());
        }

        // Strictly greater: ties keep the incumbent winner.
        if incoming.severity > self.winner.severity {
            self.winner = incoming;
        }
    }

    fn emit(self) -> Finding {
        let corroborated = self.scanners.len() >= 2;
        let scanner_id = self.scanners.join(" + ");
        let mut title = self.winner.title.clone();
        if corroborated && !title.contains(CORROBORATED_MARKER) {
            title.push_str(" ");
            title.push_str(CORROBORATED_MARKER);
        }

        Finding {
            id: Finding::compute_id(
                &scanner_id,
                self.winner.vuln_class,
                &self.winner.file,
                self.winner.line,
            ),
            scanner_id,
            vuln_class: self.winner.vuln_class,
            severity: self.winner.severity,
            confidence: self.confidence,
            file: self.winner.file,
            line: self.winner.line,
            title,
            description: self.descriptions.join(" | "),
            evidence: self.evidences.join("\n"),
        }
    }
}

/// Fuse raw findings and gate the result: a finding is emitted iff it is
/// corroborated by at least two distinct scanners or its confidence clears
/// `min_uncorroborated_confidence`. Output is sorted by severity descending,
/// then confidence descending.
pub fn aggregate(findings: Vec<Finding>, min_uncorroborated_confidence: u8) -> Vec<Finding> {
    let mut groups: Vec<GroupAcc> = Vec::new();
    let mut index: HashMap<Coordinate, usize> = HashMap::new();

    for finding in findings {
        let key = (finding.vuln_class, finding.file.clone(), finding.line);
        match index.get(&key) {
            Some(&at) => groups[at].merge(finding),
            None => {
                index.insert(key, groups.len());
                groups.push(GroupAcc::new(finding));
            }
        }
    }

    let mut emitted: Vec<Finding> = groups
        .into_iter()
        .map(GroupAcc::emit)
        .filter(|finding| {
            finding.contributing_scanners().len() >= 2
                || finding.confidence >= min_uncorroborated_confidence
        })
        .collect();

    emitted.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then(b.confidence.cmp(&a.confidence))
    });
    emitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finding::Severity;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn finding(
        scanner: &str,
        class: VulnClass,
        severity: Severity,
        confidence: u8,
        file: &str,
        line: usize,
    ) -> Finding {
        Finding::new(
            scanner,
            class,
            severity,
            confidence,
            PathBuf::from(file),
            line,
            format!("{class} at {file}:{line}"),
            format!("{scanner} description"),
            format!("{scanner} evidence"),
        )
    }

    #[test]
    fn corroboration_fuses_scanners_and_boosts_confidence() {
        let a = finding("A", VulnClass::MissingSignerCheck, Severity::High, 70, "/r/l.rs", 10);
        let b = finding("B", VulnClass::MissingSignerCheck, Severity::High, 68, "/r/l.rs", 10);

        let out = aggregate(vec![a, b], 80);
        assert_eq!(out.len(), 1);
        let merged = &out[0];
        assert_eq!(merged.scanner_id, "A + B");
        assert_eq!(merged.confidence, 75);
        assert!(merged.title.ends_with("(corroborated)"));
        assert_eq!(merged.description, "A description | B description");
        assert_eq!(merged.evidence, "A evidence\nB evidence");
    }

    #[test]
    fn gate_drops_low_confidence_singletons() {
        let weak = finding("A", VulnClass::SqlInjection, Severity::High, 79, "/r/a.rs", 1);
        let strong = finding("A", VulnClass::SqlInjection, Severity::High, 80, "/r/b.rs", 1);
        let out = aggregate(vec![weak, strong], 80);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].file, Path::new("/r/b.rs"));
    }

    #[test]
    fn corroborated_findings_bypass_the_gate() {
        let a = finding("A", VulnClass::ArbitraryCpi, Severity::Medium, 40, "/r/a.rs", 5);
        let b = finding("B", VulnClass::ArbitraryCpi, Severity::Medium, 35, "/r/a.rs", 5);
        let out = aggregate(vec![a, b], 80);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, 45);
    }

    #[test]
    fn winner_keeps_highest_severity_and_ties_keep_incumbent() {
        let medium = finding("A", VulnClass::AccountReinit, Severity::Medium, 90, "/r/a.rs", 2);
        let critical = finding("B", VulnClass::AccountReinit, Severity::Critical, 50, "/r/a.rs", 2);
        let out = aggregate(vec![medium.clone(), critical], 80);
        assert_eq!(out[0].severity, Severity::Critical);
        assert!(out[0].title.starts_with("account_reinit"));

        let first = finding("A", VulnClass::AccountReinit, Severity::High, 90, "/r/a.rs", 2);
        let mut second = finding("B", VulnClass::AccountReinit, Severity::High, 90, "/r/a.rs", 2);
        second.title = "challenger title".to_string();
        let out = aggregate(vec![first.clone(), second], 80);
        assert!(out[0].title.starts_with(&first.title));
    }

    #[test]
    fn duplicate_reports_from_one_scanner_earn_no_bonus() {
        let a1 = finding("A", VulnClass::TypeCosplay, Severity::Low, 85, "/r/a.rs", 3);
        let a2 = finding("A", VulnClass::TypeCosplay, Severity::Low, 82, "/r/a.rs", 3);
        let out = aggregate(vec![a1, a2], 80);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, 85);
        assert_eq!(out[0].scanner_id, "A");
        assert!(!out[0].title.contains("(corroborated)"));
    }

    #[test]
    fn aggregation_is_idempotent() {
        let inputs = vec![
            finding("A", VulnClass::MissingSignerCheck, Severity::High, 70, "/r/l.rs", 10),
            finding("B", VulnClass::MissingSignerCheck, Severity::High, 68, "/r/l.rs", 10),
            finding("C", VulnClass::SqlInjection, Severity::Critical, 95, "/r/q.rs", 4),
        ];
        let once = aggregate(inputs, 80);
        let twice = aggregate(once.clone(), 80);
        assert_eq!(once, twice);
    }

    #[test]
    fn adding_a_scanner_never_weakens_an_existing_coordinate() {
        let base = vec![finding(
            "A",
            VulnClass::CommandInjection,
            Severity::High,
            85,
            "/r/x.rs",
            7,
        )];
        let before = aggregate(base.clone(), 80);

        let mut extended = base;
        extended.push(finding(
            "B",
            VulnClass::CommandInjection,
            Severity::Medium,
            30,
            "/r/x.rs",
            7,
        ));
        let after = aggregate(extended, 80);

        assert!(after[0].confidence >= before[0].confidence);
        assert!(after[0].severity >= before[0].severity);
    }

    #[test]
    fn output_sorted_by_severity_then_confidence() {
        let out = aggregate(
            vec![
                finding("A", VulnClass::SqlInjection, Severity::Medium, 95, "/r/1.rs", 1),
                finding("A", VulnClass::SqlInjection, Severity::Critical, 81, "/r/2.rs", 1),
                finding("A", VulnClass::SqlInjection, Severity::Critical, 92, "/r/3.rs", 1),
            ],
            80,
        );
        let order: Vec<(Severity, u8)> = out.iter().map(|f| (f.severity, f.confidence)).collect();
        assert_eq!(
            order,
            vec![
                (Severity::Critical, 92),
                (Severity::Critical, 81),
                (Severity::Medium, 95),
            ]
        );
    }
}
