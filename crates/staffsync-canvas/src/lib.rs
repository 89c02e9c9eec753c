//! Roster source contract + the Canvas LMS implementation.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use staffsync_core::{Person, RosterSnapshot, StaffRole};
use staffsync_storage::{FetchError, HttpFetcher};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "staffsync-canvas";

pub const EMAIL_LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_EMAIL_CONCURRENCY: usize = 4;

const UNKNOWN_NAME: &str = "Unknown";
const DESIGNER_ROLE: &str = "DesignerEnrollment";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
}

#[async_trait]
pub trait RosterSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Full snapshot or an error; never a partial roster.
    async fn fetch_roster(&self, ctx: &FetchContext) -> Result<RosterSnapshot, FetchError>;
}

/// How the configured course is located.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CourseQuery {
    Id(u64),
    Name(String),
}

impl CourseQuery {
    /// Accepts a numeric id, a course URL ending in `/courses/<id>`, or a
    /// course name / code. Blank input yields `None`.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }
        if let Ok(id) = input.parse::<u64>() {
            return Some(CourseQuery::Id(id));
        }
        if let Some((_, rest)) = input.split_once("/courses/") {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(id) = digits.parse::<u64>() {
                return Some(CourseQuery::Id(id));
            }
        }
        Some(CourseQuery::Name(input.to_string()))
    }
}

impl fmt::Display for CourseQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CourseQuery::Id(id) => write!(f, "{id}"),
            CourseQuery::Name(name) => f.write_str(name),
        }
    }
}

/// Fixed mapping from Canvas enrollment roles to staff buckets. Anything not
/// listed (students, observers, designers) is not staff.
pub fn classify_role(raw_role: &str) -> Option<StaffRole> {
    match raw_role {
        "TeacherEnrollment" => Some(StaffRole::Instructor),
        "TaEnrollment" => Some(StaffRole::Ta),
        "TutorEnrollment" | "ReaderEnrollment" | "Tutor" | "Reader" => Some(StaffRole::Tutor),
        _ => None,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CanvasCourse {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub course_code: Option<String>,
}

impl CanvasCourse {
    pub fn display_name(&self) -> String {
        non_empty(self.name.as_deref())
            .or_else(|| non_empty(self.course_code.as_deref()))
            .map(str::to_string)
            .unwrap_or_else(|| format!("Course {}", self.id))
    }

    fn matches_name(&self, query: &str) -> bool {
        let query = query.trim();
        [self.name.as_deref(), self.course_code.as_deref()]
            .into_iter()
            .flatten()
            .any(|candidate| candidate.trim().eq_ignore_ascii_case(query))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CanvasEnrollment {
    #[serde(rename = "type")]
    pub enrollment_type: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub course_section_id: Option<u64>,
}

impl CanvasEnrollment {
    /// Custom role names (e.g. "Reader") win over the base enrollment type.
    pub fn staff_role(&self) -> Option<StaffRole> {
        self.role
            .as_deref()
            .and_then(classify_role)
            .or_else(|| classify_role(&self.enrollment_type))
    }

    fn is_designer(&self) -> bool {
        self.enrollment_type == DESIGNER_ROLE || self.role.as_deref() == Some(DESIGNER_ROLE)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CanvasUser {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub enrollments: Vec<CanvasEnrollment>,
}

impl CanvasUser {
    pub fn staff_role(&self) -> Option<StaffRole> {
        self.enrollments
            .iter()
            .filter_map(CanvasEnrollment::staff_role)
            .max()
    }

    fn to_person(&self) -> Person {
        Person::new(
            non_empty(self.name.as_deref()).unwrap_or(UNKNOWN_NAME),
            non_empty(self.email.as_deref()).unwrap_or_default(),
            self.id.to_string(),
        )
    }

    fn section_label(&self, sections: &HashMap<u64, String>) -> String {
        let mut names: Vec<&str> = Vec::new();
        for enrollment in &self.enrollments {
            if enrollment.staff_role() != Some(StaffRole::Ta) {
                continue;
            }
            let Some(name) = enrollment
                .course_section_id
                .and_then(|id| sections.get(&id))
            else {
                continue;
            };
            if !names.contains(&name.as_str()) {
                names.push(name);
            }
        }
        names.join(", ")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CanvasSection {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CanvasContact {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    login_id: Option<String>,
    #[serde(default)]
    primary_email: Option<String>,
}

impl CanvasContact {
    fn best_email(&self) -> Option<&str> {
        non_empty(self.email.as_deref())
            .or_else(|| non_empty(self.login_id.as_deref()))
            .or_else(|| non_empty(self.primary_email.as_deref()))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Files course users into staff buckets, in listing order.
///
/// If nobody classifies as an instructor, the first course designer stands in
/// so the site always has someone to show.
pub fn classify_users(
    course_name: &str,
    users: &[CanvasUser],
    sections: &HashMap<u64, String>,
) -> RosterSnapshot {
    let mut roster = RosterSnapshot::new(course_name);

    for user in users {
        let Some(role) = user.staff_role() else {
            continue;
        };
        let mut person = user.to_person();
        if role == StaffRole::Ta {
            person.sections = Some(user.section_label(sections));
        }
        debug!(name = %person.name, id = %person.id, ?role, "classified course user");
        roster.push(role, person);
    }

    if roster.instructors.is_empty() {
        if let Some(designer) = users
            .iter()
            .find(|u| u.enrollments.iter().any(CanvasEnrollment::is_designer))
        {
            info!(name = ?designer.name, "no teacher enrollment; using course designer as instructor");
            roster.push(StaffRole::Instructor, designer.to_person());
        }
    }

    roster
}

#[derive(Debug, Clone)]
pub struct CanvasSettings {
    pub base_url: Url,
    pub course: CourseQuery,
    pub skip_email: bool,
    pub email_concurrency: usize,
}

pub struct CanvasRosterSource {
    http: HttpFetcher,
    settings: CanvasSettings,
}

impl CanvasRosterSource {
    pub fn new(http: HttpFetcher, settings: CanvasSettings) -> Self {
        Self { http, settings }
    }

    fn api_url(&self, path_and_query: &str) -> String {
        format!(
            "{}/api/v1/{}",
            self.settings.base_url.as_str().trim_end_matches('/'),
            path_and_query
        )
    }

    async fn resolve_course(&self, ctx: &FetchContext) -> Result<CanvasCourse, FetchError> {
        let query = &self.settings.course;
        match query {
            CourseQuery::Id(id) => {
                match self
                    .http
                    .fetch_json(ctx.run_id, &self.api_url(&format!("courses/{id}")))
                    .await
                {
                    Err(FetchError::HttpStatus { status: 404, .. }) => {
                        Err(FetchError::CourseNotFound {
                            query: query.to_string(),
                        })
                    }
                    other => other,
                }
            }
            CourseQuery::Name(name) => {
                let courses: Vec<CanvasCourse> = self
                    .http
                    .fetch_all_pages(ctx.run_id, &self.api_url("courses?per_page=100"))
                    .await?;
                let mut matches: Vec<CanvasCourse> =
                    courses.into_iter().filter(|c| c.matches_name(name)).collect();
                match matches.len() {
                    0 => Err(FetchError::CourseNotFound {
                        query: query.to_string(),
                    }),
                    1 => Ok(matches.remove(0)),
                    _ => Err(FetchError::AmbiguousCourse {
                        query: query.to_string(),
                        candidates: matches
                            .iter()
                            .map(|c| format!("{} ({})", c.display_name(), c.id))
                            .collect(),
                    }),
                }
            }
        }
    }

    async fn section_names(&self, ctx: &FetchContext, course_id: u64) -> HashMap<u64, String> {
        let url = self.api_url(&format!("courses/{course_id}/sections?per_page=100"));
        match self.http.fetch_all_pages::<CanvasSection>(ctx.run_id, &url).await {
            Ok(sections) => sections
                .into_iter()
                .filter_map(|s| s.name.map(|name| (s.id, name)))
                .collect(),
            Err(err) => {
                warn!(error = %err, "section lookup failed; TA section labels left empty");
                HashMap::new()
            }
        }
    }

    /// Best-effort contact lookup; every failure degrades to an empty email.
    async fn lookup_email(&self, user_id: &str) -> String {
        let user_url = self.api_url(&format!("users/{user_id}"));
        match self.http.probe(&user_url, EMAIL_LOOKUP_TIMEOUT).await {
            Ok(resp) => {
                if resp.status.is_success() {
                    if let Some(email) = contact_email(&resp.body) {
                        return email;
                    }
                }
                if resp.status == StatusCode::FORBIDDEN {
                    return String::new();
                }
            }
            Err(err) => {
                debug!(user_id, error = %err, "user email lookup failed");
                return String::new();
            }
        }

        let profile_url = self.api_url(&format!("users/{user_id}/profile"));
        match self.http.probe(&profile_url, EMAIL_LOOKUP_TIMEOUT).await {
            Ok(resp) if resp.status.is_success() => contact_email(&resp.body).unwrap_or_default(),
            Ok(_) => String::new(),
            Err(err) => {
                debug!(user_id, error = %err, "profile email lookup failed");
                String::new()
            }
        }
    }

    async fn fill_missing_emails(&self, roster: &mut RosterSnapshot) {
        let missing: Vec<(StaffRole, usize, String)> =
            [StaffRole::Instructor, StaffRole::Ta, StaffRole::Tutor]
                .into_iter()
                .flat_map(|role| {
                    roster
                        .people(role)
                        .iter()
                        .enumerate()
                        .filter(|(_, p)| p.email.trim().is_empty())
                        .map(move |(idx, p)| (role, idx, p.id.clone()))
                        .collect::<Vec<_>>()
                })
                .collect();

        if missing.is_empty() {
            debug!("all staff members already have email addresses");
            return;
        }
        if self.settings.skip_email {
            info!(missing = missing.len(), "skipping email lookups");
            return;
        }

        info!(missing = missing.len(), "looking up staff email addresses");
        let found: Vec<(StaffRole, usize, String)> = stream::iter(missing)
            .map(move |(role, idx, id)| async move {
                let email = self.lookup_email(&id).await;
                (role, idx, email)
            })
            .buffered(self.settings.email_concurrency.max(1))
            .collect()
            .await;

        let mut resolved = 0usize;
        for (role, idx, email) in found {
            if email.is_empty() {
                continue;
            }
            if let Some(person) = roster.people_mut(role).get_mut(idx) {
                person.email = email;
                resolved += 1;
            }
        }
        info!(resolved, "email lookups finished");
    }
}

fn contact_email(body: &[u8]) -> Option<String> {
    let contact: CanvasContact = serde_json::from_slice(body).ok()?;
    contact.best_email().map(str::to_string)
}

#[async_trait]
impl RosterSource for CanvasRosterSource {
    fn source_id(&self) -> &'static str {
        "canvas"
    }

    async fn fetch_roster(&self, ctx: &FetchContext) -> Result<RosterSnapshot, FetchError> {
        info!(server = %self.settings.base_url, course = %self.settings.course, "fetching canvas roster");
        let course = self.resolve_course(ctx).await?;
        let course_name = course.display_name();
        info!(course_id = course.id, course = %course_name, "resolved course");

        let users_url = self.api_url(&format!(
            "courses/{}/users?include[]=enrollments&include[]=email&per_page=100",
            course.id
        ));
        let users: Vec<CanvasUser> = self.http.fetch_all_pages(ctx.run_id, &users_url).await?;
        info!(users = users.len(), "fetched course users");

        let sections = self.section_names(ctx, course.id).await;
        let mut roster = classify_users(&course_name, &users, &sections);
        self.fill_missing_emails(&mut roster).await;

        info!(
            instructors = roster.instructors.len(),
            tas = roster.tas.len(),
            tutors = roster.tutors.len(),
            "roster ready"
        );
        Ok(roster)
    }
}
