//! Name-keyed, append-only merge of roster instructors into the bios record.

use std::collections::HashSet;

use staffsync_core::{normalize_name, BioEntry, BiosRecord, Person};

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub record: BiosRecord,
    /// Roster names that received a placeholder entry, in roster order.
    pub appended: Vec<String>,
}

impl Reconciliation {
    pub fn appended_count(&self) -> usize {
        self.appended.len()
    }

    pub fn changed(&self) -> bool {
        !self.appended.is_empty()
    }
}

/// Appends a placeholder entry for every instructor whose normalized name has
/// no entry yet. Existing entries are neither reordered nor touched.
pub fn reconcile_bios(instructors: &[Person], prior: BiosRecord) -> Reconciliation {
    let mut known: HashSet<String> = prior
        .entries
        .iter()
        .map(|entry| normalize_name(entry.name()))
        .collect();

    let mut record = prior;
    let mut appended = Vec::new();
    for instructor in instructors {
        if known.insert(normalize_name(&instructor.name)) {
            record
                .entries
                .push(BioEntry::placeholder(instructor.name.clone()));
            appended.push(instructor.name.clone());
        }
    }

    Reconciliation { record, appended }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use staffsync_core::FALLBACK_BIO;

    fn roster(names: &[&str]) -> Vec<Person> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| Person::new(*name, "", (i + 1).to_string()))
            .collect()
    }

    fn ada_curated() -> BiosRecord {
        serde_json::from_value(json!({
            "instructor_bios": [
                { "name": "Ada Lovelace", "title": "Professor", "bio": "Custom bio" }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn empty_record_gets_fallback_entries_in_roster_order() {
        let result = reconcile_bios(&roster(&["Ada Lovelace", "Alan Turing"]), BiosRecord::default());

        assert_eq!(result.appended, vec!["Ada Lovelace", "Alan Turing"]);
        assert_eq!(
            result.record.entries,
            vec![
                BioEntry::placeholder("Ada Lovelace"),
                BioEntry::placeholder("Alan Turing")
            ]
        );
        for entry in &result.record.entries {
            assert_eq!(entry.bio(), Some(FALLBACK_BIO));
            assert_eq!(entry.title(), None);
        }
    }

    #[test]
    fn curated_entry_is_kept_and_newcomer_appended() {
        let result = reconcile_bios(&roster(&["Ada Lovelace", "Alan Turing"]), ada_curated());

        assert_eq!(result.appended_count(), 1);
        assert_eq!(result.record.entries.len(), 2);
        assert_eq!(result.record.entries[0], ada_curated().entries[0]);
        assert_eq!(result.record.entries[1], BioEntry::placeholder("Alan Turing"));
    }

    #[test]
    fn second_pass_is_a_no_op() {
        let instructors = roster(&["Ada Lovelace", "Alan Turing"]);
        let first = reconcile_bios(&instructors, ada_curated());
        let second = reconcile_bios(&instructors, first.record.clone());

        assert!(!second.changed());
        assert_eq!(second.record, first.record);
    }

    #[test]
    fn case_and_whitespace_variants_match_existing_entries() {
        let prior: BiosRecord = serde_json::from_value(json!({
            "instructor_bios": [{ "name": "Jane Doe", "bio": "Hand written" }]
        }))
        .unwrap();
        let result = reconcile_bios(&roster(&["  Jane Doe ", "JANE DOE"]), prior.clone());

        assert!(!result.changed());
        assert_eq!(result.record, prior);
        assert_eq!(result.record.entries[0].name(), "Jane Doe");
    }

    #[test]
    fn duplicate_roster_names_append_once_with_verbatim_name() {
        let result = reconcile_bios(&roster(&[" Alan Turing", "alan turing"]), BiosRecord::default());
        assert_eq!(result.appended, vec![" Alan Turing"]);
        assert_eq!(result.record.entries[0].name(), " Alan Turing");
    }

    #[test]
    fn existing_entries_keep_fields_order_and_extra_keys() {
        let prior: BiosRecord = serde_json::from_value(json!({
            "instructor_bios": [
                { "name": "zed  ", "bio": "" , "image": "/zed.png" },
                { "name": "Ada Lovelace", "title": "Professor", "bio": "Custom bio" },
                { "name": "ada lovelace", "title": "Duplicate" }
            ]
        }))
        .unwrap();

        let result = reconcile_bios(&roster(&["Zed", "Ada Lovelace", "Grace Hopper"]), prior.clone());

        assert_eq!(result.appended, vec!["Grace Hopper"]);
        assert_eq!(&result.record.entries[..3], &prior.entries[..]);
        assert_eq!(result.record.entries[0].fields()["image"], "/zed.png");
    }

    #[test]
    fn every_instructor_is_covered_afterwards() {
        let instructors = roster(&["Ada Lovelace", "Alan Turing", "Grace Hopper"]);
        let result = reconcile_bios(&instructors, ada_curated());
        for person in &instructors {
            assert!(result.record.contains(&person.name), "{}", person.name);
        }
    }

    #[test]
    fn empty_roster_changes_nothing() {
        let result = reconcile_bios(&[], ada_curated());
        assert!(!result.changed());
        assert_eq!(result.record, ada_curated());
    }
}
