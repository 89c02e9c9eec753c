//! Core roster and bios model for staffsync.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "staffsync-core";

/// Placeholder bio written for instructors nobody has described yet.
///
/// The site renders the same text when an entry's bio is empty, so the two
/// must stay in sync.
pub const FALLBACK_BIO: &str = "Bio not available for this instructor.";

/// Join key used everywhere a roster name meets a bios entry.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Staff bucket a roster member is filed under.
///
/// Variants are ordered by precedence: a person holding several roles is kept
/// under the greatest one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaffRole {
    Tutor,
    Ta,
    Instructor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: String,
    /// Free-text section label; only TAs carry one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sections: Option<String>,
}

impl Person {
    pub fn new(name: impl Into<String>, email: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            id: id.into(),
            sections: None,
        }
    }
}

/// Course staff as last reported by the LMS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RosterSnapshotRepr")]
pub struct RosterSnapshot {
    pub course_name: String,
    pub instructors: Vec<Person>,
    pub tas: Vec<Person>,
    pub tutors: Vec<Person>,
}

impl RosterSnapshot {
    pub fn new(course_name: impl Into<String>) -> Self {
        Self {
            course_name: course_name.into(),
            ..Self::default()
        }
    }

    pub fn push(&mut self, role: StaffRole, person: Person) {
        match role {
            StaffRole::Instructor => self.instructors.push(person),
            StaffRole::Ta => self.tas.push(person),
            StaffRole::Tutor => self.tutors.push(person),
        }
    }

    pub fn people(&self, role: StaffRole) -> &[Person] {
        match role {
            StaffRole::Instructor => &self.instructors,
            StaffRole::Ta => &self.tas,
            StaffRole::Tutor => &self.tutors,
        }
    }

    pub fn people_mut(&mut self, role: StaffRole) -> &mut Vec<Person> {
        match role {
            StaffRole::Instructor => &mut self.instructors,
            StaffRole::Ta => &mut self.tas,
            StaffRole::Tutor => &mut self.tutors,
        }
    }

    pub fn staff_count(&self) -> usize {
        self.instructors.len() + self.tas.len() + self.tutors.len()
    }
}

// Roster files written by earlier fetch steps stored the instructor as a
// single object, an array, or not at all, under either key. Reading resolves
// all of them to a plain list.
#[derive(Deserialize)]
struct RosterSnapshotRepr {
    #[serde(default)]
    course_name: String,
    #[serde(default)]
    instructors: Option<OneOrMany<Person>>,
    #[serde(default)]
    instructor: Option<OneOrMany<Person>>,
    #[serde(default)]
    tas: Vec<Person>,
    #[serde(default)]
    tutors: Vec<Person>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> From<OneOrMany<T>> for Vec<T> {
    fn from(value: OneOrMany<T>) -> Self {
        match value {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

impl From<RosterSnapshotRepr> for RosterSnapshot {
    fn from(repr: RosterSnapshotRepr) -> Self {
        let instructors = repr
            .instructors
            .or(repr.instructor)
            .map(Vec::from)
            .unwrap_or_default();
        Self {
            course_name: repr.course_name,
            instructors,
            tas: repr.tas,
            tutors: repr.tutors,
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => Ok(s),
        JsonValue::Number(n) => Ok(n.to_string()),
        JsonValue::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, found {other}"
        ))),
    }
}

/// One hand-curated bios entry, held as the JSON object it was read from.
///
/// Only a string `name` is interpreted for matching. Every other key, whatever
/// its type, is written back exactly as read, in file order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BioEntry {
    fields: Map<String, JsonValue>,
}

impl BioEntry {
    pub fn from_fields(fields: Map<String, JsonValue>) -> Self {
        Self { fields }
    }

    /// Entry appended for an instructor with no curated bio: no title, fallback text.
    pub fn placeholder(name: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("name".to_string(), JsonValue::String(name.into()));
        fields.insert("bio".to_string(), JsonValue::String(FALLBACK_BIO.to_string()));
        Self::from_fields(fields)
    }

    pub fn fields(&self) -> &Map<String, JsonValue> {
        &self.fields
    }

    /// The entry's name; empty when absent or not a string.
    pub fn name(&self) -> &str {
        self.string_field("name").unwrap_or_default()
    }

    pub fn title(&self) -> Option<&str> {
        self.string_field("title")
    }

    pub fn bio(&self) -> Option<&str> {
        self.string_field("bio")
    }

    fn string_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(JsonValue::as_str)
    }

    pub fn matches(&self, normalized_name: &str) -> bool {
        normalize_name(self.name()) == normalized_name
    }

    /// Bio text to render; empty, missing or non-text bios fall back.
    pub fn display_bio(&self) -> &str {
        match self.bio() {
            Some(bio) if !bio.trim().is_empty() => bio,
            _ => FALLBACK_BIO,
        }
    }

    pub fn display_title(&self) -> Option<&str> {
        self.title().filter(|t| !t.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BiosRecord {
    #[serde(rename = "instructor_bios", alias = "entries", default)]
    pub entries: Vec<BioEntry>,
}

impl BiosRecord {
    pub fn new(entries: Vec<BioEntry>) -> Self {
        Self { entries }
    }

    /// First entry in file order whose normalized name equals `name`'s.
    pub fn lookup(&self, name: &str) -> Option<&BioEntry> {
        let key = normalize_name(name);
        self.entries.iter().find(|entry| entry.matches(&key))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Pairs a roster member with what the site will show for them.
    pub fn profile_for(&self, person: &Person) -> StaffProfile {
        let entry = self.lookup(&person.name);
        StaffProfile {
            name: person.name.clone(),
            email: person.email.clone(),
            title: entry.and_then(BioEntry::display_title).map(str::to_string),
            bio: entry
                .map(BioEntry::display_bio)
                .unwrap_or(FALLBACK_BIO)
                .to_string(),
            has_entry: entry.is_some(),
        }
    }
}

/// Render-time view of an instructor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaffProfile {
    pub name: String,
    pub email: String,
    pub title: Option<String>,
    pub bio: String,
    pub has_entry: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalization_trims_and_folds_case() {
        assert_eq!(normalize_name("  Jane Doe "), "jane doe");
        assert_eq!(normalize_name("JANE DOE"), normalize_name("jane doe"));
        assert_ne!(normalize_name("Jane  Doe"), normalize_name("Jane Doe"));
    }

    #[test]
    fn role_precedence_prefers_instructor() {
        assert!(StaffRole::Instructor > StaffRole::Ta);
        assert!(StaffRole::Ta > StaffRole::Tutor);
        assert_eq!(
            [StaffRole::Tutor, StaffRole::Instructor, StaffRole::Ta]
                .into_iter()
                .max(),
            Some(StaffRole::Instructor)
        );
    }

    #[test]
    fn placeholder_serializes_without_title() {
        let value = serde_json::to_value(BioEntry::placeholder("Alan Turing")).unwrap();
        assert_eq!(
            value,
            json!({ "name": "Alan Turing", "bio": FALLBACK_BIO })
        );
    }

    #[test]
    fn entries_are_written_back_exactly_as_read() {
        let text = r#"{"instructor_bios":[{"bio":"Custom bio","name":"Ada Lovelace","title":null,"image":"/ada.png"}]}"#;
        let record: BiosRecord = serde_json::from_str(text).unwrap();
        assert_eq!(
            record.entries[0].fields().keys().collect::<Vec<_>>(),
            vec!["bio", "name", "title", "image"]
        );
        assert_eq!(serde_json::to_string(&record).unwrap(), text);
    }

    #[test]
    fn off_schema_values_are_kept_and_only_string_name_is_read() {
        let text = r#"{"instructor_bios":[{"name":"Ada Lovelace","title":5,"bio":["para one","para two"]},{"name":null,"bio":"orphan"}]}"#;
        let record: BiosRecord = serde_json::from_str(text).unwrap();

        let ada = &record.entries[0];
        assert_eq!(ada.name(), "Ada Lovelace");
        assert_eq!(ada.title(), None);
        assert_eq!(ada.display_bio(), FALLBACK_BIO);
        assert_eq!(record.entries[1].name(), "");
        assert!(record.contains("ada lovelace"));
        assert_eq!(serde_json::to_string(&record).unwrap(), text);
    }

    #[test]
    fn non_object_entries_are_rejected() {
        assert!(serde_json::from_str::<BiosRecord>(r#"{"instructor_bios":["Ada"]}"#).is_err());
        assert!(serde_json::from_str::<BiosRecord>(r#"{"instructor_bios":{"name":"Ada"}}"#).is_err());
    }

    #[test]
    fn entries_key_is_accepted_on_read() {
        let record: BiosRecord =
            serde_json::from_value(json!({ "entries": [{ "name": "Ada", "bio": "x" }] })).unwrap();
        assert_eq!(record.entries.len(), 1);
    }

    fn entry(value: JsonValue) -> BioEntry {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn lookup_is_first_match_under_normalization() {
        let record = BiosRecord::new(vec![
            entry(json!({ "name": "Jane Doe", "title": "Lecturer", "bio": "first" })),
            entry(json!({ "name": "jane doe", "bio": "second" })),
        ]);
        let found = record.lookup("  JANE DOE ").unwrap();
        assert_eq!(found.bio(), Some("first"));
        assert!(record.lookup("John Doe").is_none());
    }

    #[test]
    fn profile_falls_back_when_missing_or_empty() {
        let record = BiosRecord::new(vec![entry(
            json!({ "name": "Ada Lovelace", "title": "  ", "bio": "" }),
        )]);

        let ada = record.profile_for(&Person::new("Ada Lovelace", "ada@example.edu", "1"));
        assert!(ada.has_entry);
        assert_eq!(ada.title, None);
        assert_eq!(ada.bio, FALLBACK_BIO);

        let alan = record.profile_for(&Person::new("Alan Turing", "", "2"));
        assert!(!alan.has_entry);
        assert_eq!(alan.bio, FALLBACK_BIO);
    }

    #[test]
    fn legacy_single_instructor_object_is_normalized() {
        let roster: RosterSnapshot = serde_json::from_value(json!({
            "course_name": "CSE 140",
            "instructor": { "name": "Ada Lovelace", "email": "ada@example.edu", "id": 17 },
            "tas": [{ "name": "Grace Hopper", "email": "", "id": "22", "sections": "" }]
        }))
        .unwrap();
        assert_eq!(roster.instructors.len(), 1);
        assert_eq!(roster.instructors[0].id, "17");
        assert_eq!(roster.tas[0].sections.as_deref(), Some(""));
        assert!(roster.tutors.is_empty());
    }

    #[test]
    fn absent_or_null_instructors_become_empty() {
        let absent: RosterSnapshot =
            serde_json::from_value(json!({ "course_name": "CSE 140" })).unwrap();
        assert!(absent.instructors.is_empty());

        let null: RosterSnapshot =
            serde_json::from_value(json!({ "course_name": "CSE 140", "instructors": null }))
                .unwrap();
        assert!(null.instructors.is_empty());
    }

    #[test]
    fn snapshot_serializes_in_site_shape() {
        let mut roster = RosterSnapshot::new("CSE 140");
        roster.push(StaffRole::Instructor, Person::new("Ada", "ada@example.edu", "1"));
        let mut ta = Person::new("Grace", "", "2");
        ta.sections = Some("A01".into());
        roster.push(StaffRole::Ta, ta);

        let value = serde_json::to_value(&roster).unwrap();
        assert_eq!(
            value,
            json!({
                "course_name": "CSE 140",
                "instructors": [{ "name": "Ada", "email": "ada@example.edu", "id": "1" }],
                "tas": [{ "name": "Grace", "email": "", "id": "2", "sections": "A01" }],
                "tutors": []
            })
        );
        assert_eq!(roster.staff_count(), 2);
        assert_eq!(roster.people(StaffRole::Ta).len(), 1);
    }
}
