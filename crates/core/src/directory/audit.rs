//! Consistency audit of baselines.
//!
//! For single-valued attributes every message number appears twice on
//! disk: in the numbers of its value and in the reverse map. The auditor
//! checks both directions agree. Unreadable fragments (catalog, extents,
//! reverse map) count as problems and are skipped; the audit itself never
//! fails.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::warn;

use super::{read_catalog, read_numbers, read_reverse, Catalog, Directory, Reverse};
use crate::numbers::Numbers;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AuditReport {
    pub problems: Vec<String>,
}

impl AuditReport {
    pub fn count(&self) -> usize {
        self.problems.len()
    }

    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }

    fn problem(&mut self, text: String) {
        self.problems.push(text);
    }
}

pub struct ReversiveAuditor;

impl ReversiveAuditor {
    /// Audits the current baseline of every attribute.
    pub fn audit(directory: &Directory) -> AuditReport {
        let mut report = AuditReport::default();
        let names = match directory.attributes() {
            Ok(names) => names,
            Err(e) => {
                report.problem(format!("attributes are unreadable: {e}"));
                return report;
            }
        };
        for name in names {
            match directory.baseline_folder(&name) {
                Ok(Some(folder)) => Self::audit_folder(&name, &folder, &mut report),
                Ok(None) => {}
                Err(e) => report.problem(format!("baseline of '{name}' is unreadable: {e}")),
            }
        }
        if !report.is_clean() {
            warn!(problems = report.count(), "audit found problems");
        }
        report
    }

    /// Audits one baseline folder of `attribute`, appending to `report`.
    pub(crate) fn audit_folder(attribute: &str, folder: &Path, report: &mut AuditReport) {
        let catalog = read_catalog(folder).unwrap_or_else(|e| {
            report.problem(format!("catalog of '{attribute}' is unreadable: {e}"));
            Catalog::default()
        });
        let mut forward: BTreeMap<&str, Numbers> = BTreeMap::new();
        for (value, extent) in &catalog.values {
            let numbers = Numbers::new();
            match read_numbers(folder, *extent, &numbers) {
                Ok(()) => {
                    forward.insert(value.as_str(), numbers);
                }
                Err(e) => report.problem(format!(
                    "numbers of '{value}' in '{attribute}' are unreadable: {e}"
                )),
            }
        }
        let reverse = Reverse::new();
        if let Err(e) = read_reverse(folder, &reverse) {
            report.problem(format!("reverse of '{attribute}' is unreadable: {e}"));
            return;
        }
        if reverse.is_empty() {
            return;
        }
        for (value, numbers) in &forward {
            for id in numbers.iter() {
                match reverse.get(id) {
                    None => report.problem(format!(
                        "msg #{id} doesn't have a value in '{attribute}', while '{value}' expected"
                    )),
                    Some(found) if found != *value => report.problem(format!(
                        "msg #{id} has value '{found}' in '{attribute}', while '{value}' expected"
                    )),
                    Some(_) => {}
                }
            }
        }
        for (id, value) in reverse.entries() {
            let listed = forward
                .get(value.as_str())
                .is_some_and(|numbers| numbers.contains(id));
            if !listed {
                report.problem(format!(
                    "msg #{id} maps to '{value}' in the reverse of '{attribute}' but is missing from its numbers"
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{CATALOG, DATA};
    use std::fs;

    fn populated() -> (Directory, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Directory::open(tmp.path().join("index")).unwrap();
        let reverse = Reverse::new();
        for (id, author) in [(1u64, "urn:test:john"), (2, "urn:test:john"), (3, "urn:test:mary")] {
            reverse.put(id, author).unwrap();
        }
        dir.save_numbers("author.name", "urn:test:john", &[1u64, 2].into_iter().collect())
            .unwrap();
        dir.save_numbers("author.name", "urn:test:mary", &[3u64].into_iter().collect())
            .unwrap();
        dir.save_reverse("author.name", &reverse).unwrap();
        dir.save_numbers("text.words", "hello", &[1u64, 3].into_iter().collect())
            .unwrap();
        dir.baseline().unwrap();
        (dir, tmp)
    }

    #[test]
    fn clean_baseline_passes_twice() {
        let (dir, _tmp) = populated();
        let first = ReversiveAuditor::audit(&dir);
        let second = ReversiveAuditor::audit(&dir);
        assert!(first.is_clean(), "{:?}", first.problems);
        assert_eq!(first, second, "audit must be idempotent");
    }

    #[test]
    fn corrupted_catalog_is_reported_not_raised() {
        let (dir, _tmp) = populated();
        let folder = dir.baseline_folder("author.name").unwrap().unwrap();
        fs::write(folder.join(CATALOG), b"{ not json").unwrap();

        let report = dir.audit();
        assert!(!report.is_clean());
        assert!(report.problems[0].contains("catalog"), "{:?}", report.problems);
        assert!(dir.values("author.name").unwrap().is_empty());
    }

    #[test]
    fn truncated_data_is_reported() {
        let (dir, _tmp) = populated();
        let folder = dir.baseline_folder("text.words").unwrap().unwrap();
        fs::write(folder.join(DATA), b"NUM").unwrap();
        let report = dir.audit();
        assert_eq!(report.count(), 1, "{:?}", report.problems);
    }

    #[test]
    fn disagreement_between_reverse_and_numbers_is_counted() {
        let tmp = tempfile::tempdir().unwrap();
        let folder = tmp.path();
        let mut data = Vec::new();
        let numbers: Numbers = [1u64, 2].into_iter().collect();
        numbers.save(&mut data).unwrap();
        let mut catalog = Catalog::default();
        catalog.values.insert(
            "a".into(),
            super::super::Extent {
                offset: 0,
                length: data.len() as u64,
            },
        );
        fs::write(folder.join(DATA), &data).unwrap();
        fs::write(folder.join(CATALOG), serde_json::to_vec(&catalog).unwrap()).unwrap();
        let reverse = Reverse::new();
        reverse.put(1, "b").unwrap();
        reverse.put(9, "a").unwrap();
        let mut bytes = Vec::new();
        reverse.save(&mut bytes).unwrap();
        fs::write(folder.join(super::super::REVERSE), bytes).unwrap();

        let mut report = AuditReport::default();
        ReversiveAuditor::audit_folder("author.name", folder, &mut report);
        // #1 has the wrong value, #2 has none, #9 and #1 are missing from numbers
        assert_eq!(report.count(), 4, "{:?}", report.problems);
    }
}
