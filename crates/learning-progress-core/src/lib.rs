//! Domain model and write rules for learner progress, achievements and
//! course certificates.
//!
//! Nothing in this crate touches storage. The rules here decide what a row
//! looks like after a write; the sqlite store persists the result.

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use ulid::Ulid;

const SECONDS_PER_HOUR: f64 = 3_600.0;
const FULL_COMPLETION: f64 = 100.0;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LearningError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("timestamp error: {0}")]
    Timestamp(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    NotStarted,
    InProgress,
    Completed,
    Abandoned,
}

impl ProgressStatus {
    pub const ALL: [Self; 4] = [
        Self::NotStarted,
        Self::InProgress,
        Self::Completed,
        Self::Abandoned,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_started" => Some(Self::NotStarted),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Progress {
    pub id: i64,
    pub user_id: i64,
    pub course_id: i64,
    pub status: ProgressStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_accessed_at: OffsetDateTime,
    pub completion_percentage: f64,
    pub total_time_spent: i64,
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// A progress row that has not been inserted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewProgress {
    pub user_id: i64,
    pub course_id: i64,
    pub status: ProgressStatus,
    pub started_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub last_accessed_at: OffsetDateTime,
    pub completion_percentage: f64,
    pub total_time_spent: i64,
    pub notes: Option<String>,
}

/// Caller-supplied changes for one (user, course) progress row.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProgressUpdate {
    pub course_id: i64,
    pub status: Option<ProgressStatus>,
    pub completion_percentage: Option<f64>,
    pub time_spent_seconds: Option<i64>,
    pub notes: Option<String>,
}

impl ProgressUpdate {
    #[must_use]
    pub fn for_course(course_id: i64) -> Self {
        Self {
            course_id,
            ..Self::default()
        }
    }

    /// Seconds to add to the stored total. Negative increments are dropped so
    /// the counter never goes backwards.
    #[must_use]
    pub fn time_increment(&self) -> i64 {
        self.time_spent_seconds.unwrap_or(0).max(0)
    }
}

/// Builds the first row for a (user, course) pair.
#[must_use]
pub fn seed_progress(user_id: i64, update: &ProgressUpdate, now: OffsetDateTime) -> NewProgress {
    let status = update.status.unwrap_or(ProgressStatus::NotStarted);
    let mut completion_percentage = update.completion_percentage.unwrap_or(0.0);
    let mut completed_at = None;
    if status == ProgressStatus::Completed {
        completion_percentage = FULL_COMPLETION;
        completed_at = Some(now);
    }

    NewProgress {
        user_id,
        course_id: update.course_id,
        status,
        started_at: (status != ProgressStatus::NotStarted).then_some(now),
        completed_at,
        last_accessed_at: now,
        completion_percentage,
        total_time_spent: update.time_increment(),
        notes: update.notes.clone(),
    }
}

/// Applies an update to an existing row in place.
///
/// The supplied percentage is applied before the status so that a completed
/// row always ends at 100 regardless of what the caller sent alongside it.
pub fn apply_progress_update(progress: &mut Progress, update: &ProgressUpdate, now: OffsetDateTime) {
    if let Some(percentage) = update.completion_percentage {
        progress.completion_percentage = percentage;
    }

    if let Some(status) = update.status {
        progress.status = status;
        if status != ProgressStatus::NotStarted && progress.started_at.is_none() {
            progress.started_at = Some(now);
        }
        if status == ProgressStatus::Completed {
            progress.completed_at = Some(now);
        }
    }

    if progress.status == ProgressStatus::Completed {
        progress.completion_percentage = FULL_COMPLETION;
    }

    progress.total_time_spent = progress
        .total_time_spent
        .saturating_add(update.time_increment());

    if let Some(notes) = &update.notes {
        progress.notes = Some(notes.clone());
    }

    progress.last_accessed_at = now;
    progress.updated_at = now;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Achievement {
    pub id: i64,
    pub user_id: i64,
    pub achievement_type: String,
    pub achievement_name: String,
    pub description: Option<String>,
    pub metadata: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub earned_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewAchievement {
    pub achievement_type: String,
    pub achievement_name: String,
    pub description: Option<String>,
    /// Free-form extra data, usually a JSON document.
    pub metadata: Option<String>,
}

impl NewAchievement {
    /// Checks that the required fields carry a value.
    ///
    /// # Errors
    /// Returns [`LearningError::Validation`] when the type or the name is blank.
    pub fn validate(&self) -> Result<(), LearningError> {
        if self.achievement_type.trim().is_empty() {
            return Err(LearningError::Validation(
                "achievement_type MUST be provided".to_string(),
            ));
        }

        if self.achievement_name.trim().is_empty() {
            return Err(LearningError::Validation(
                "achievement_name MUST be provided".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CourseCertificate {
    pub id: i64,
    pub certificate_id: String,
    pub user_id: i64,
    pub course_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub earned_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub final_score: Option<f64>,
    pub grade: Option<String>,
    /// Hours spent on the course when the certificate was issued.
    pub completion_time: f64,
    pub digital_signature: String,
    pub pdf_url: Option<String>,
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewCertificate {
    pub course_id: i64,
    pub final_score: Option<f64>,
    pub grade: Option<String>,
    pub completion_time: Option<f64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub pdf_url: Option<String>,
    pub notes: Option<String>,
}

impl NewCertificate {
    #[must_use]
    pub fn for_course(course_id: i64) -> Self {
        Self {
            course_id,
            ..Self::default()
        }
    }
}

/// A certificate row ready for insert, tokens already minted.
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateDraft {
    pub certificate_id: String,
    pub user_id: i64,
    pub course_id: i64,
    pub earned_at: OffsetDateTime,
    pub expires_at: Option<OffsetDateTime>,
    pub final_score: Option<f64>,
    pub grade: Option<String>,
    pub completion_time: f64,
    pub digital_signature: String,
    pub pdf_url: Option<String>,
    pub notes: Option<String>,
}

/// Prepares a new certificate. `tracked_seconds` is the stored time spent on
/// the course, if the learner has a progress row for it.
#[must_use]
pub fn draft_certificate(
    user_id: i64,
    request: &NewCertificate,
    tracked_seconds: Option<i64>,
    now: OffsetDateTime,
) -> CertificateDraft {
    let completion_time = request
        .completion_time
        .unwrap_or_else(|| tracked_seconds.map_or(0.0, completion_time_hours));

    CertificateDraft {
        certificate_id: new_opaque_token(),
        user_id,
        course_id: request.course_id,
        earned_at: now,
        expires_at: request.expires_at,
        final_score: request.final_score,
        grade: request.grade.clone(),
        completion_time,
        digital_signature: new_opaque_token(),
        pdf_url: request.pdf_url.clone(),
        notes: request.notes.clone(),
    }
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn completion_time_hours(total_seconds: i64) -> f64 {
    total_seconds as f64 / SECONDS_PER_HOUR
}

#[must_use]
pub fn new_opaque_token() -> String {
    Ulid::new().to_string()
}

/// Per-course summary used to decide certificate eligibility.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CourseStats {
    pub status: ProgressStatus,
    pub completion_percentage: f64,
    pub total_time_spent: i64,
}

impl CourseStats {
    #[must_use]
    pub fn from_progress(progress: Option<&Progress>) -> Self {
        match progress {
            Some(row) => Self {
                status: row.status,
                completion_percentage: row.completion_percentage,
                total_time_spent: row.total_time_spent,
            },
            None => Self {
                status: ProgressStatus::NotStarted,
                completion_percentage: 0.0,
                total_time_spent: 0,
            },
        }
    }

    #[must_use]
    pub fn is_certificate_eligible(&self) -> bool {
        self.status == ProgressStatus::Completed || self.completion_percentage >= FULL_COMPLETION
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LearningStatistics {
    pub user_id: i64,
    pub total_completed_courses: i64,
    pub total_courses_in_progress: i64,
    pub total_courses: i64,
    pub total_certificates: i64,
    pub total_achievements: i64,
    pub total_time_spent_seconds: i64,
    pub average_completion_percentage: f64,
}

impl LearningStatistics {
    #[must_use]
    pub fn empty(user_id: i64) -> Self {
        Self {
            user_id,
            total_completed_courses: 0,
            total_courses_in_progress: 0,
            total_courses: 0,
            total_certificates: 0,
            total_achievements: 0,
            total_time_spent_seconds: 0,
            average_completion_percentage: 0.0,
        }
    }
}

/// Current time in UTC, truncated to the microsecond precision kept in storage.
#[must_use]
pub fn now_utc() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc().to_offset(UtcOffset::UTC);
    let micros = now.nanosecond() / 1_000;
    now.replace_nanosecond(micros * 1_000).unwrap_or(now)
}

/// Parses an RFC3339 timestamp that must carry the `Z` offset.
///
/// # Errors
/// Returns [`LearningError::Timestamp`] when parsing fails or the offset is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LearningError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LearningError::Timestamp(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LearningError::Timestamp(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LearningError::Timestamp`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LearningError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| LearningError::Timestamp(format!("failed to format RFC3339 timestamp: {err}")))
}

/// Fixed-width UTC form used for stored timestamps, so that text ordering in
/// sqlite matches chronological ordering.
///
/// # Errors
/// Returns [`LearningError::Timestamp`] when formatting fails.
pub fn format_storage_timestamp(value: OffsetDateTime) -> Result<String, LearningError> {
    let format =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z");
    value
        .to_offset(UtcOffset::UTC)
        .format(&format)
        .map_err(|err| LearningError::Timestamp(format!("failed to format stored timestamp: {err}")))
}

/// Inverse of [`format_storage_timestamp`].
///
/// # Errors
/// Returns [`LearningError::Timestamp`] when the value is not in stored form.
pub fn parse_storage_timestamp(value: &str) -> Result<OffsetDateTime, LearningError> {
    let format =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z");
    PrimitiveDateTime::parse(value, &format)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|err| LearningError::Timestamp(format!("invalid stored timestamp {value}: {err}")))
}
