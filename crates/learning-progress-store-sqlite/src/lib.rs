#![allow(clippy::missing_errors_doc)]

//! `SQLite` persistence for learner progress, achievements and certificates.
//!
//! All reads and writes go through a [`UnitOfWork`], which owns the
//! connection for the duration of one transaction. Dropping a unit of work
//! without calling [`UnitOfWork::commit`] rolls the transaction back.

mod dal;

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use learning_progress_core::{
    apply_progress_update, draft_certificate, now_utc, seed_progress, Achievement,
    CourseCertificate, CourseStats, LearningStatistics, NewAchievement, NewCertificate, Progress,
    ProgressUpdate,
};
use rusqlite::{params, Connection, OptionalExtension};

pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS progresses (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  course_id INTEGER NOT NULL,
  status TEXT NOT NULL DEFAULT 'not_started' CHECK (
    status IN ('not_started', 'in_progress', 'completed', 'abandoned')
  ),
  started_at TEXT,
  completed_at TEXT,
  last_accessed_at TEXT NOT NULL,
  completion_percentage REAL NOT NULL DEFAULT 0.0,
  total_time_spent INTEGER NOT NULL DEFAULT 0,
  notes TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_user_course_progress
  ON progresses(user_id, course_id);
CREATE INDEX IF NOT EXISTS idx_progresses_user_accessed
  ON progresses(user_id, last_accessed_at DESC);
CREATE INDEX IF NOT EXISTS idx_progresses_user_status
  ON progresses(user_id, status);

CREATE TABLE IF NOT EXISTS achievements (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  achievement_type TEXT NOT NULL,
  achievement_name TEXT NOT NULL,
  description TEXT,
  metadata TEXT,
  earned_at TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_achievements_no_update
BEFORE UPDATE ON achievements
BEGIN
  SELECT RAISE(FAIL, 'achievements is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_achievements_no_delete
BEFORE DELETE ON achievements
BEGIN
  SELECT RAISE(FAIL, 'achievements is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_achievements_user_earned
  ON achievements(user_id, earned_at DESC);

CREATE TABLE IF NOT EXISTS course_certificates (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  certificate_id TEXT NOT NULL UNIQUE,
  user_id INTEGER NOT NULL,
  course_id INTEGER NOT NULL,
  earned_at TEXT NOT NULL,
  expires_at TEXT,
  final_score REAL,
  grade TEXT,
  completion_time REAL NOT NULL DEFAULT 0.0,
  digital_signature TEXT NOT NULL,
  pdf_url TEXT,
  notes TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_user_course_cert
  ON course_certificates(user_id, course_id);
CREATE INDEX IF NOT EXISTS idx_course_certificates_user_earned
  ON course_certificates(user_id, earned_at DESC);
";

pub struct SqliteProgressStore {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: Option<i64>,
    pub target_version: i64,
    pub ready: bool,
}

/// Outcome of an idempotent certificate request.
#[derive(Debug, Clone, PartialEq)]
pub enum Issued {
    Created(CourseCertificate),
    Existing(CourseCertificate),
}

impl Issued {
    #[must_use]
    pub fn into_certificate(self) -> CourseCertificate {
        match self {
            Self::Created(certificate) | Self::Existing(certificate) => certificate,
        }
    }

    #[must_use]
    pub fn was_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

impl SqliteProgressStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply learning progress schema")?;

        let now = learning_progress_core::format_rfc3339(now_utc())?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, now],
            )
            .context("failed to register schema migration")?;

        if inserted > 0 {
            tracing::info!(version = SCHEMA_VERSION, "applied learning progress schema");
        }
        Ok(())
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let current_version = if table_exists(&self.conn, "schema_migrations")? {
            self.conn
                .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                    row.get::<_, Option<i64>>(0)
                })
                .context("failed to read schema version")?
        } else {
            None
        };

        Ok(SchemaStatus {
            current_version,
            target_version: SCHEMA_VERSION,
            ready: current_version == Some(SCHEMA_VERSION),
        })
    }

    /// Opens a write transaction and hands the connection to a [`UnitOfWork`].
    /// The write lock is taken up front, so concurrent writers queue behind
    /// `busy_timeout` instead of failing to promote a read snapshot.
    pub fn begin(self) -> Result<UnitOfWork> {
        self.start("BEGIN IMMEDIATE")
    }

    /// Opens a read-only snapshot. Writes through the returned unit are not
    /// guaranteed to succeed under concurrency.
    pub fn begin_read(self) -> Result<UnitOfWork> {
        self.start("BEGIN DEFERRED")
    }

    fn start(self, statement: &str) -> Result<UnitOfWork> {
        self.conn
            .execute_batch(statement)
            .with_context(|| format!("failed to start unit of work ({statement})"))?;
        Ok(UnitOfWork {
            conn: Some(self.conn),
        })
    }
}

/// One transaction over the store. Commit explicitly; any other exit path,
/// including an unwinding panic, rolls back when the value is dropped.
pub struct UnitOfWork {
    conn: Option<Connection>,
}

impl UnitOfWork {
    /// Commits and returns the store so the connection can be reused.
    pub fn commit(mut self) -> Result<SqliteProgressStore> {
        let conn = self.take_connection()?;
        if let Err(err) = conn.execute_batch("COMMIT") {
            rollback_quietly(&conn);
            return Err(err).context("failed to commit unit of work");
        }
        Ok(SqliteProgressStore { conn })
    }

    pub fn rollback(mut self) -> Result<SqliteProgressStore> {
        let conn = self.take_connection()?;
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK")
                .context("failed to roll back unit of work")?;
        }
        Ok(SqliteProgressStore { conn })
    }

    /// Creates or updates the (user, course) progress row and returns it as
    /// stored.
    pub fn upsert_progress(&self, user_id: i64, update: &ProgressUpdate) -> Result<Progress> {
        let conn = self.connection()?;
        let now = now_utc();

        let Some(mut progress) = dal::find_progress(conn, user_id, update.course_id)? else {
            let seeded = seed_progress(user_id, update, now);
            let id = dal::insert_progress(conn, &seeded, now)?;
            tracing::debug!(
                user_id,
                course_id = update.course_id,
                status = seeded.status.as_str(),
                "progress row created"
            );
            return dal::get_progress(conn, id);
        };

        let previous_status = progress.status;
        apply_progress_update(&mut progress, update, now);
        dal::update_progress(conn, &progress)?;
        tracing::debug!(
            user_id,
            course_id = update.course_id,
            from = previous_status.as_str(),
            to = progress.status.as_str(),
            total_time_spent = progress.total_time_spent,
            "progress row updated"
        );
        dal::get_progress(conn, progress.id)
    }

    pub fn record_achievement(
        &self,
        user_id: i64,
        achievement: &NewAchievement,
    ) -> Result<Achievement> {
        achievement.validate()?;

        let conn = self.connection()?;
        let id = dal::insert_achievement(conn, user_id, achievement, now_utc())?;
        tracing::debug!(
            user_id,
            achievement_type = achievement.achievement_type.as_str(),
            "achievement recorded"
        );
        dal::get_achievement(conn, id)
    }

    /// Returns the existing certificate for (user, course) untouched, or issues
    /// a new one from the request.
    pub fn issue_certificate(&self, user_id: i64, request: &NewCertificate) -> Result<Issued> {
        let conn = self.connection()?;

        if let Some(existing) = dal::find_certificate(conn, user_id, request.course_id)? {
            tracing::debug!(
                user_id,
                course_id = request.course_id,
                certificate_id = existing.certificate_id.as_str(),
                "certificate already issued"
            );
            return Ok(Issued::Existing(existing));
        }

        let tracked_seconds = dal::find_progress(conn, user_id, request.course_id)?
            .map(|progress| progress.total_time_spent);
        let now = now_utc();
        let draft = draft_certificate(user_id, request, tracked_seconds, now);
        let id = dal::insert_certificate(conn, &draft, now)?;
        tracing::info!(
            user_id,
            course_id = request.course_id,
            certificate_id = draft.certificate_id.as_str(),
            "certificate issued"
        );
        Ok(Issued::Created(dal::get_certificate(conn, id)?))
    }

    /// Issues a certificate only when the course is finished. An existing
    /// certificate is returned whatever the current progress says.
    pub fn generate_certificate_if_eligible(
        &self,
        user_id: i64,
        course_id: i64,
    ) -> Result<Option<CourseCertificate>> {
        let conn = self.connection()?;
        if let Some(existing) = dal::find_certificate(conn, user_id, course_id)? {
            return Ok(Some(existing));
        }

        let stats = self.course_stats(user_id, course_id)?;
        if !stats.is_certificate_eligible() {
            tracing::debug!(user_id, course_id, "course not finished, no certificate");
            return Ok(None);
        }

        self.issue_certificate(user_id, &NewCertificate::for_course(course_id))
            .map(|issued| Some(issued.into_certificate()))
    }

    pub fn progress(&self, user_id: i64, course_id: i64) -> Result<Option<Progress>> {
        dal::find_progress(self.connection()?, user_id, course_id)
    }

    pub fn progress_for_user(&self, user_id: i64, course_id: Option<i64>) -> Result<Vec<Progress>> {
        dal::list_progress(self.connection()?, user_id, course_id)
    }

    pub fn completed_course_ids(&self, user_id: i64) -> Result<Vec<i64>> {
        dal::completed_course_ids(self.connection()?, user_id)
    }

    pub fn course_stats(&self, user_id: i64, course_id: i64) -> Result<CourseStats> {
        let progress = dal::find_progress(self.connection()?, user_id, course_id)?;
        Ok(CourseStats::from_progress(progress.as_ref()))
    }

    pub fn achievements(
        &self,
        user_id: i64,
        achievement_type: Option<&str>,
    ) -> Result<Vec<Achievement>> {
        dal::list_achievements(self.connection()?, user_id, achievement_type)
    }

    pub fn certificate(&self, user_id: i64, course_id: i64) -> Result<Option<CourseCertificate>> {
        dal::find_certificate(self.connection()?, user_id, course_id)
    }

    pub fn certificates(
        &self,
        user_id: i64,
        course_id: Option<i64>,
    ) -> Result<Vec<CourseCertificate>> {
        dal::list_certificates(self.connection()?, user_id, course_id)
    }

    pub fn statistics(&self, user_id: i64) -> Result<LearningStatistics> {
        dal::statistics(self.connection()?, user_id)
    }

    fn connection(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| anyhow!("unit of work is already closed"))
    }

    fn take_connection(&mut self) -> Result<Connection> {
        self.conn
            .take()
            .ok_or_else(|| anyhow!("unit of work is already closed"))
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            rollback_quietly(&conn);
            tracing::debug!("unit of work dropped without commit, rolled back");
        }
    }
}

fn rollback_quietly(conn: &Connection) {
    if conn.is_autocommit() {
        return;
    }
    if let Err(err) = conn.execute_batch("ROLLBACK") {
        tracing::warn!(error = %err, "rollback failed");
    }
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

/// True when the error chain holds a sqlite constraint violation, such as a
/// second row for a unique (user, course) key.
#[must_use]
pub fn is_constraint_violation(err: &anyhow::Error) -> bool {
    has_sqlite_code(err, &[rusqlite::ErrorCode::ConstraintViolation])
}

/// True when the write lost to another writer: a constraint violation or a
/// lock that was not released within `busy_timeout`.
#[must_use]
pub fn is_write_conflict(err: &anyhow::Error) -> bool {
    has_sqlite_code(
        err,
        &[
            rusqlite::ErrorCode::ConstraintViolation,
            rusqlite::ErrorCode::DatabaseBusy,
            rusqlite::ErrorCode::DatabaseLocked,
        ],
    )
}

fn has_sqlite_code(err: &anyhow::Error, codes: &[rusqlite::ErrorCode]) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(inner, _)) if codes.contains(&inner.code)
        )
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp, clippy::too_many_lines)]

    use super::*;
    use learning_progress_core::ProgressStatus;
    use proptest::prelude::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn fixture_unit() -> UnitOfWork {
        let store = must(SqliteProgressStore::open(Path::new(":memory:")));
        must(store.migrate());
        must(store.begin())
    }

    fn temp_db_path(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("learning-progress-{label}-{}.sqlite3", Ulid::new()))
    }

    fn update(course_id: i64) -> ProgressUpdate {
        ProgressUpdate::for_course(course_id)
    }

    fn with_status(course_id: i64, status: ProgressStatus) -> ProgressUpdate {
        let mut value = update(course_id);
        value.status = Some(status);
        value
    }

    fn with_time(course_id: i64, seconds: i64) -> ProgressUpdate {
        let mut value = update(course_id);
        value.time_spent_seconds = Some(seconds);
        value
    }

    fn achievement(kind: &str) -> NewAchievement {
        NewAchievement {
            achievement_type: kind.to_string(),
            achievement_name: format!("{kind} badge"),
            description: None,
            metadata: None,
        }
    }

    #[test]
    fn start_then_complete_keeps_started_at() {
        let unit = fixture_unit();

        let started = must(unit.upsert_progress(1, &with_status(10, ProgressStatus::InProgress)));
        assert_eq!(started.status, ProgressStatus::InProgress);
        assert!(started.started_at.is_some());
        assert_eq!(started.completed_at, None);
        assert_eq!(started.completion_percentage, 0.0);

        let finished = must(unit.upsert_progress(1, &with_status(10, ProgressStatus::Completed)));
        assert_eq!(finished.id, started.id);
        assert_eq!(finished.completion_percentage, 100.0);
        assert!(finished.completed_at.is_some());
        assert_eq!(finished.started_at, started.started_at);
        assert!(finished.updated_at >= started.updated_at);
        assert_eq!(finished.created_at, started.created_at);
    }

    #[test]
    fn time_spent_accumulates_from_first_write() {
        let unit = fixture_unit();
        must(unit.upsert_progress(1, &with_time(10, 30)));
        let row = must(unit.upsert_progress(1, &with_time(10, 45)));
        assert_eq!(row.total_time_spent, 75);
    }

    #[test]
    fn progress_listing_orders_by_last_access() {
        let unit = fixture_unit();
        must(unit.upsert_progress(1, &update(10)));
        must(unit.upsert_progress(1, &update(11)));
        must(unit.upsert_progress(1, &update(12)));
        std::thread::sleep(std::time::Duration::from_millis(2));
        must(unit.upsert_progress(1, &with_time(10, 5)));
        must(unit.upsert_progress(2, &update(10)));

        let rows = must(unit.progress_for_user(1, None));
        let courses: Vec<i64> = rows.iter().map(|row| row.course_id).collect();
        assert_eq!(courses, vec![10, 12, 11]);

        let filtered = must(unit.progress_for_user(1, Some(11)));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].course_id, 11);

        assert!(must(unit.progress(1, 99)).is_none());
    }

    #[test]
    fn completed_courses_are_distinct_per_user() {
        let unit = fixture_unit();
        must(unit.upsert_progress(1, &with_status(10, ProgressStatus::Completed)));
        must(unit.upsert_progress(1, &with_status(11, ProgressStatus::InProgress)));
        must(unit.upsert_progress(1, &with_status(12, ProgressStatus::Completed)));
        must(unit.upsert_progress(2, &with_status(13, ProgressStatus::Completed)));

        assert_eq!(must(unit.completed_course_ids(1)), vec![10, 12]);
    }

    #[test]
    fn duplicate_progress_insert_hits_unique_index() {
        let unit = fixture_unit();
        must(unit.upsert_progress(1, &update(10)));

        let conn = must(unit.connection());
        let seeded = seed_progress(1, &update(10), now_utc());
        let result = dal::insert_progress(conn, &seeded, now_utc());
        match result {
            Ok(_) => panic!("expected unique index violation"),
            Err(err) => assert!(is_constraint_violation(&err)),
        }
    }

    #[test]
    fn achievements_append_and_filter_by_type() {
        let unit = fixture_unit();
        let first = must(unit.record_achievement(1, &achievement("streak_7_days")));
        let second = must(unit.record_achievement(1, &achievement("streak_7_days")));
        must(unit.record_achievement(1, &achievement("first_lesson")));

        assert_ne!(first.id, second.id);

        let all = must(unit.achievements(1, None));
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|pair| pair[0].earned_at >= pair[1].earned_at));

        let streaks = must(unit.achievements(1, Some("streak_7_days")));
        assert_eq!(streaks.len(), 2);
        assert_eq!(streaks[0].id, second.id);
    }

    #[test]
    fn achievements_reject_blank_fields() {
        let unit = fixture_unit();
        let mut input = achievement("first_lesson");
        input.achievement_type = String::new();
        assert!(unit.record_achievement(1, &input).is_err());
        assert!(must(unit.achievements(1, None)).is_empty());
    }

    #[test]
    fn achievements_are_append_only() {
        let unit = fixture_unit();
        let stored = must(unit.record_achievement(1, &achievement("first_lesson")));

        let conn = must(unit.connection());
        let update_result = conn.execute(
            "UPDATE achievements SET achievement_name = 'mutated' WHERE id = ?1",
            params![stored.id],
        );
        assert!(update_result.is_err());

        let delete_result = conn.execute("DELETE FROM achievements WHERE id = ?1", params![stored.id]);
        assert!(delete_result.is_err());
    }

    #[test]
    fn certificate_issue_is_idempotent() {
        let unit = fixture_unit();
        let mut request = NewCertificate::for_course(10);
        request.grade = Some("A".to_string());
        request.final_score = Some(93.5);

        let first = must(unit.issue_certificate(1, &request));
        assert!(first.was_created());
        let first = first.into_certificate();

        let mut second_request = NewCertificate::for_course(10);
        second_request.grade = Some("F".to_string());
        let second = must(unit.issue_certificate(1, &second_request));
        assert!(!second.was_created());
        let second = second.into_certificate();

        assert_eq!(first.certificate_id, second.certificate_id);
        assert_eq!(second.grade.as_deref(), Some("A"));
        assert_eq!(must(unit.certificates(1, None)).len(), 1);
    }

    #[test]
    fn certificate_completion_time_comes_from_progress() {
        let unit = fixture_unit();
        must(unit.upsert_progress(1, &with_time(10, 7_200)));

        let tracked = must(unit.issue_certificate(1, &NewCertificate::for_course(10)));
        assert_eq!(tracked.into_certificate().completion_time, 2.0);

        let untracked = must(unit.issue_certificate(1, &NewCertificate::for_course(11)));
        assert_eq!(untracked.into_certificate().completion_time, 0.0);
    }

    #[test]
    fn certificate_listing_filters_by_course() {
        let unit = fixture_unit();
        must(unit.issue_certificate(1, &NewCertificate::for_course(10)));
        must(unit.issue_certificate(1, &NewCertificate::for_course(11)));
        must(unit.issue_certificate(2, &NewCertificate::for_course(10)));

        let all = must(unit.certificates(1, None));
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].course_id, 11);

        let one = must(unit.certificates(1, Some(10)));
        assert_eq!(one.len(), 1);
        assert_eq!(
            must_some(must(unit.certificate(1, 10))).certificate_id,
            one[0].certificate_id
        );
        assert!(must(unit.certificate(3, 10)).is_none());
    }

    #[test]
    fn eligibility_gates_certificate_generation() {
        let unit = fixture_unit();
        must(unit.upsert_progress(1, &with_status(10, ProgressStatus::InProgress)));
        assert!(must(unit.generate_certificate_if_eligible(1, 10)).is_none());
        assert!(must(unit.generate_certificate_if_eligible(1, 99)).is_none());

        let mut nearly = update(10);
        nearly.completion_percentage = Some(100.0);
        must(unit.upsert_progress(1, &nearly));
        let issued = must_some(must(unit.generate_certificate_if_eligible(1, 10)));

        let again = must_some(must(unit.generate_certificate_if_eligible(1, 10)));
        assert_eq!(issued.certificate_id, again.certificate_id);
    }

    #[test]
    fn course_stats_default_to_not_started() {
        let unit = fixture_unit();
        let stats = must(unit.course_stats(1, 10));
        assert_eq!(stats.status, ProgressStatus::NotStarted);
        assert_eq!(stats.completion_percentage, 0.0);
        assert_eq!(stats.total_time_spent, 0);
    }

    #[test]
    fn statistics_for_unknown_user_are_zero() {
        let unit = fixture_unit();
        assert_eq!(must(unit.statistics(42)), LearningStatistics::empty(42));
    }

    #[test]
    fn statistics_aggregate_across_tables() {
        let unit = fixture_unit();
        let mut done = with_status(10, ProgressStatus::Completed);
        done.time_spent_seconds = Some(100);
        must(unit.upsert_progress(1, &done));

        let mut halfway = with_status(11, ProgressStatus::InProgress);
        halfway.completion_percentage = Some(50.0);
        halfway.time_spent_seconds = Some(20);
        must(unit.upsert_progress(1, &halfway));

        must(unit.upsert_progress(1, &with_status(12, ProgressStatus::Abandoned)));
        must(unit.issue_certificate(1, &NewCertificate::for_course(10)));
        must(unit.record_achievement(1, &achievement("course_complete")));
        must(unit.upsert_progress(2, &with_time(10, 999)));

        let stats = must(unit.statistics(1));
        assert_eq!(stats.total_completed_courses, 1);
        assert_eq!(stats.total_courses_in_progress, 1);
        assert_eq!(stats.total_courses, 3);
        assert_eq!(stats.total_certificates, 1);
        assert_eq!(stats.total_achievements, 1);
        assert_eq!(stats.total_time_spent_seconds, 120);
        assert_eq!(stats.average_completion_percentage, 50.0);
    }

    #[test]
    fn statistics_saturate_huge_time_totals() {
        let unit = fixture_unit();
        let half = i64::MAX / 2 + 1;
        must(unit.upsert_progress(1, &with_time(10, half)));
        must(unit.upsert_progress(1, &with_time(11, half)));

        let stats = must(unit.statistics(1));
        assert_eq!(stats.total_time_spent_seconds, i64::MAX);
        assert_eq!(stats.total_courses, 2);
    }

    #[test]
    fn commit_hands_back_a_reusable_store() {
        let unit = fixture_unit();
        must(unit.upsert_progress(1, &with_time(10, 30)));
        let store = must(unit.commit());

        let unit = must(store.begin());
        let row = must_some(must(unit.progress(1, 10)));
        assert_eq!(row.total_time_spent, 30);
    }

    #[test]
    fn dropped_unit_rolls_back() {
        let path = temp_db_path("drop");
        {
            let store = must(SqliteProgressStore::open(&path));
            must(store.migrate());
            let unit = must(store.begin());
            must(unit.upsert_progress(1, &update(10)));
        }

        let unit = must(must(SqliteProgressStore::open(&path)).begin());
        assert!(must(unit.progress(1, 10)).is_none());
        drop(unit);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn panicking_handler_rolls_back() {
        let path = temp_db_path("panic");
        let store = must(SqliteProgressStore::open(&path));
        must(store.migrate());

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let unit = must(store.begin());
            must(unit.record_achievement(1, &achievement("first_lesson")));
            panic!("handler failure");
        }));
        assert!(outcome.is_err());

        let unit = must(must(SqliteProgressStore::open(&path)).begin());
        assert!(must(unit.achievements(1, None)).is_empty());
        drop(unit);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn writer_waits_for_lock_held_by_earlier_reader() {
        let path = temp_db_path("writers");
        let store = must(SqliteProgressStore::open(&path));
        must(store.migrate());

        let first = must(store.begin());
        assert!(must(first.progress(2, 20)).is_none());

        let second_path = path.clone();
        let second = std::thread::spawn(move || -> Result<()> {
            let unit = SqliteProgressStore::open(&second_path)?.begin()?;
            unit.upsert_progress(1, &update(10))?;
            unit.commit().map(drop)
        });

        std::thread::sleep(std::time::Duration::from_millis(150));
        must(first.upsert_progress(2, &update(20)));
        must(first.commit());

        match second.join() {
            Ok(result) => must(result),
            Err(_) => panic!("second writer panicked"),
        }

        let unit = must(must(SqliteProgressStore::open(&path)).begin_read());
        assert!(must(unit.progress(1, 10)).is_some());
        assert!(must(unit.progress(2, 20)).is_some());
        drop(unit);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn busy_lock_counts_as_write_conflict() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        let err = anyhow::Error::new(busy).context("failed to start unit of work");
        assert!(is_write_conflict(&err));
        assert!(!is_constraint_violation(&err));
        assert!(!is_write_conflict(&anyhow!("course 9 not found")));
    }

    #[test]
    fn explicit_rollback_discards_writes() {
        let unit = fixture_unit();
        must(unit.issue_certificate(1, &NewCertificate::for_course(10)));
        let store = must(unit.rollback());

        let unit = must(store.begin());
        assert!(must(unit.certificates(1, None)).is_empty());
    }

    #[test]
    fn schema_status_tracks_migration() {
        let store = must(SqliteProgressStore::open(Path::new(":memory:")));
        let before = must(store.schema_status());
        assert_eq!(before.current_version, None);
        assert!(!before.ready);

        must(store.migrate());
        must(store.migrate());
        let after = must(store.schema_status());
        assert_eq!(after.current_version, Some(SCHEMA_VERSION));
        assert!(after.ready);
    }

    fn status_from_code(code: u8) -> Option<ProgressStatus> {
        match code % 5 {
            0 => None,
            1 => Some(ProgressStatus::NotStarted),
            2 => Some(ProgressStatus::InProgress),
            3 => Some(ProgressStatus::Completed),
            _ => Some(ProgressStatus::Abandoned),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_upserts_keep_row_invariants(
            writes in prop::collection::vec((0u8..5, 0i64..3_600, prop::option::of(0.0f64..100.0)), 1..40)
        ) {
            let unit = fixture_unit();
            let mut expected_time = 0_i64;
            let mut started_at = None;

            for (code, seconds, percentage) in writes {
                let mut input = update(10);
                input.status = status_from_code(code);
                input.time_spent_seconds = Some(seconds);
                input.completion_percentage = percentage;
                expected_time += seconds;

                let row = must(unit.upsert_progress(7, &input));
                prop_assert_eq!(row.total_time_spent, expected_time);
                if row.status == ProgressStatus::Completed {
                    prop_assert_eq!(row.completion_percentage, 100.0);
                    prop_assert!(row.completed_at.is_some());
                }
                if started_at.is_some() {
                    prop_assert_eq!(row.started_at, started_at);
                } else {
                    started_at = row.started_at;
                }
            }

            prop_assert_eq!(must(unit.progress_for_user(7, None)).len(), 1);
        }

        #[test]
        fn prop_certificates_stay_unique_per_course(courses in prop::collection::vec(0i64..6, 1..30)) {
            let unit = fixture_unit();
            for course_id in &courses {
                must(unit.issue_certificate(3, &NewCertificate::for_course(*course_id)));
            }

            let distinct: std::collections::BTreeSet<i64> = courses.iter().copied().collect();
            prop_assert_eq!(must(unit.certificates(3, None)).len(), distinct.len());
        }
    }
}
