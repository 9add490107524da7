//! Row-level reads and writes. Every function takes the connection owned by
//! the active unit of work and performs no business logic.

use anyhow::{anyhow, Context, Result};
use learning_progress_core::{
    format_storage_timestamp, parse_storage_timestamp, Achievement, CertificateDraft,
    CourseCertificate, LearningError, LearningStatistics, NewAchievement, NewProgress, Progress,
    ProgressStatus,
};
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;

const PROGRESS_COLUMNS: &str = "id, user_id, course_id, status, started_at, completed_at,
    last_accessed_at, completion_percentage, total_time_spent, notes, created_at, updated_at";

const ACHIEVEMENT_COLUMNS: &str = "id, user_id, achievement_type, achievement_name, description,
    metadata, earned_at, created_at, updated_at";

const CERTIFICATE_COLUMNS: &str = "id, certificate_id, user_id, course_id, earned_at, expires_at,
    final_score, grade, completion_time, digital_signature, pdf_url, notes, created_at, updated_at";

pub(crate) fn find_progress(
    conn: &Connection,
    user_id: i64,
    course_id: i64,
) -> Result<Option<Progress>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {PROGRESS_COLUMNS} FROM progresses WHERE user_id = ?1 AND course_id = ?2"
            ),
            params![user_id, course_id],
            parse_progress_row,
        )
        .optional()
        .with_context(|| format!("failed to load progress for user {user_id} course {course_id}"))?;
    Ok(row)
}

pub(crate) fn get_progress(conn: &Connection, id: i64) -> Result<Progress> {
    conn.query_row(
        &format!("SELECT {PROGRESS_COLUMNS} FROM progresses WHERE id = ?1"),
        params![id],
        parse_progress_row,
    )
    .with_context(|| format!("failed to reload progress row {id}"))
}

pub(crate) fn list_progress(
    conn: &Connection,
    user_id: i64,
    course_id: Option<i64>,
) -> Result<Vec<Progress>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROGRESS_COLUMNS}
         FROM progresses
         WHERE user_id = ?1 AND (?2 IS NULL OR course_id = ?2)
         ORDER BY last_accessed_at DESC, id DESC"
    ))?;
    let rows = stmt.query_map(params![user_id, course_id], parse_progress_row)?;
    collect_rows(rows).with_context(|| format!("failed to list progress for user {user_id}"))
}

pub(crate) fn completed_course_ids(conn: &Connection, user_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT course_id
         FROM progresses
         WHERE user_id = ?1 AND status = ?2
         ORDER BY course_id ASC",
    )?;
    let rows = stmt.query_map(params![user_id, ProgressStatus::Completed.as_str()], |row| {
        row.get::<_, i64>(0)
    })?;
    collect_rows(rows).with_context(|| format!("failed to list completed courses for user {user_id}"))
}

pub(crate) fn insert_progress(
    conn: &Connection,
    progress: &NewProgress,
    now: OffsetDateTime,
) -> Result<i64> {
    let stamped = storage_text(now)?;
    conn.execute(
        "INSERT INTO progresses(
            user_id, course_id, status, started_at, completed_at,
            last_accessed_at, completion_percentage, total_time_spent, notes,
            created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            progress.user_id,
            progress.course_id,
            progress.status.as_str(),
            optional_storage_text(progress.started_at)?,
            optional_storage_text(progress.completed_at)?,
            storage_text(progress.last_accessed_at)?,
            progress.completion_percentage,
            progress.total_time_spent,
            progress.notes,
            stamped,
            stamped,
        ],
    )
    .with_context(|| {
        format!(
            "failed to insert progress for user {} course {}",
            progress.user_id, progress.course_id
        )
    })?;

    Ok(conn.last_insert_rowid())
}

pub(crate) fn update_progress(conn: &Connection, progress: &Progress) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE progresses SET
                status = ?2,
                started_at = ?3,
                completed_at = ?4,
                last_accessed_at = ?5,
                completion_percentage = ?6,
                total_time_spent = ?7,
                notes = ?8,
                updated_at = ?9
             WHERE id = ?1",
            params![
                progress.id,
                progress.status.as_str(),
                optional_storage_text(progress.started_at)?,
                optional_storage_text(progress.completed_at)?,
                storage_text(progress.last_accessed_at)?,
                progress.completion_percentage,
                progress.total_time_spent,
                progress.notes,
                storage_text(progress.updated_at)?,
            ],
        )
        .with_context(|| format!("failed to update progress row {}", progress.id))?;

    if changed != 1 {
        return Err(anyhow!("progress row {} disappeared during update", progress.id));
    }
    Ok(())
}

pub(crate) fn insert_achievement(
    conn: &Connection,
    user_id: i64,
    achievement: &NewAchievement,
    now: OffsetDateTime,
) -> Result<i64> {
    let stamped = storage_text(now)?;
    conn.execute(
        "INSERT INTO achievements(
            user_id, achievement_type, achievement_name, description, metadata,
            earned_at, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            user_id,
            achievement.achievement_type,
            achievement.achievement_name,
            achievement.description,
            achievement.metadata,
            stamped,
            stamped,
            stamped,
        ],
    )
    .with_context(|| format!("failed to insert achievement for user {user_id}"))?;

    Ok(conn.last_insert_rowid())
}

pub(crate) fn get_achievement(conn: &Connection, id: i64) -> Result<Achievement> {
    conn.query_row(
        &format!("SELECT {ACHIEVEMENT_COLUMNS} FROM achievements WHERE id = ?1"),
        params![id],
        parse_achievement_row,
    )
    .with_context(|| format!("failed to reload achievement row {id}"))
}

pub(crate) fn list_achievements(
    conn: &Connection,
    user_id: i64,
    achievement_type: Option<&str>,
) -> Result<Vec<Achievement>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ACHIEVEMENT_COLUMNS}
         FROM achievements
         WHERE user_id = ?1 AND (?2 IS NULL OR achievement_type = ?2)
         ORDER BY earned_at DESC, id DESC"
    ))?;
    let rows = stmt.query_map(params![user_id, achievement_type], parse_achievement_row)?;
    collect_rows(rows).with_context(|| format!("failed to list achievements for user {user_id}"))
}

pub(crate) fn find_certificate(
    conn: &Connection,
    user_id: i64,
    course_id: i64,
) -> Result<Option<CourseCertificate>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {CERTIFICATE_COLUMNS}
                 FROM course_certificates
                 WHERE user_id = ?1 AND course_id = ?2"
            ),
            params![user_id, course_id],
            parse_certificate_row,
        )
        .optional()
        .with_context(|| {
            format!("failed to load certificate for user {user_id} course {course_id}")
        })?;
    Ok(row)
}

pub(crate) fn get_certificate(conn: &Connection, id: i64) -> Result<CourseCertificate> {
    conn.query_row(
        &format!("SELECT {CERTIFICATE_COLUMNS} FROM course_certificates WHERE id = ?1"),
        params![id],
        parse_certificate_row,
    )
    .with_context(|| format!("failed to reload certificate row {id}"))
}

pub(crate) fn list_certificates(
    conn: &Connection,
    user_id: i64,
    course_id: Option<i64>,
) -> Result<Vec<CourseCertificate>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CERTIFICATE_COLUMNS}
         FROM course_certificates
         WHERE user_id = ?1 AND (?2 IS NULL OR course_id = ?2)
         ORDER BY earned_at DESC, id DESC"
    ))?;
    let rows = stmt.query_map(params![user_id, course_id], parse_certificate_row)?;
    collect_rows(rows).with_context(|| format!("failed to list certificates for user {user_id}"))
}

pub(crate) fn insert_certificate(
    conn: &Connection,
    draft: &CertificateDraft,
    now: OffsetDateTime,
) -> Result<i64> {
    let stamped = storage_text(now)?;
    conn.execute(
        "INSERT INTO course_certificates(
            certificate_id, user_id, course_id, earned_at, expires_at,
            final_score, grade, completion_time, digital_signature, pdf_url, notes,
            created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            draft.certificate_id,
            draft.user_id,
            draft.course_id,
            storage_text(draft.earned_at)?,
            optional_storage_text(draft.expires_at)?,
            draft.final_score,
            draft.grade,
            draft.completion_time,
            draft.digital_signature,
            draft.pdf_url,
            draft.notes,
            stamped,
            stamped,
        ],
    )
    .with_context(|| {
        format!(
            "failed to insert certificate for user {} course {}",
            draft.user_id, draft.course_id
        )
    })?;

    Ok(conn.last_insert_rowid())
}

pub(crate) fn statistics(conn: &Connection, user_id: i64) -> Result<LearningStatistics> {
    let total_time_spent_seconds = total_time_spent(conn, user_id)?;
    conn.query_row(
        "SELECT
            (SELECT COUNT(*) FROM progresses WHERE user_id = ?1 AND status = ?2),
            (SELECT COUNT(*) FROM progresses WHERE user_id = ?1 AND status = ?3),
            (SELECT COUNT(*) FROM progresses WHERE user_id = ?1),
            (SELECT COUNT(*) FROM course_certificates WHERE user_id = ?1),
            (SELECT COUNT(*) FROM achievements WHERE user_id = ?1),
            (SELECT COALESCE(AVG(completion_percentage), 0.0) FROM progresses WHERE user_id = ?1)",
        params![
            user_id,
            ProgressStatus::Completed.as_str(),
            ProgressStatus::InProgress.as_str(),
        ],
        |row| {
            Ok(LearningStatistics {
                user_id,
                total_completed_courses: row.get(0)?,
                total_courses_in_progress: row.get(1)?,
                total_courses: row.get(2)?,
                total_certificates: row.get(3)?,
                total_achievements: row.get(4)?,
                total_time_spent_seconds,
                average_completion_percentage: row.get(5)?,
            })
        },
    )
    .with_context(|| format!("failed to aggregate statistics for user {user_id}"))
}

/// SQL `SUM` raises on i64 overflow; saturate instead.
fn total_time_spent(conn: &Connection, user_id: i64) -> Result<i64> {
    let mut stmt = conn
        .prepare("SELECT total_time_spent FROM progresses WHERE user_id = ?1")
        .context("failed to prepare time spent query")?;
    let rows = stmt.query_map(params![user_id], |row| row.get::<_, i64>(0))?;
    let mut total = 0_i64;
    for seconds in rows {
        total = total.saturating_add(seconds?);
    }
    Ok(total)
}

fn parse_progress_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Progress> {
    let status_raw: String = row.get(3)?;
    let status = ProgressStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid progress status: {status_raw}"),
            )),
        )
    })?;

    Ok(Progress {
        id: row.get(0)?,
        user_id: row.get(1)?,
        course_id: row.get(2)?,
        status,
        started_at: optional_timestamp(row, 4)?,
        completed_at: optional_timestamp(row, 5)?,
        last_accessed_at: timestamp(row, 6)?,
        completion_percentage: row.get(7)?,
        total_time_spent: row.get(8)?,
        notes: row.get(9)?,
        created_at: timestamp(row, 10)?,
        updated_at: timestamp(row, 11)?,
    })
}

fn parse_achievement_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Achievement> {
    Ok(Achievement {
        id: row.get(0)?,
        user_id: row.get(1)?,
        achievement_type: row.get(2)?,
        achievement_name: row.get(3)?,
        description: row.get(4)?,
        metadata: row.get(5)?,
        earned_at: timestamp(row, 6)?,
        created_at: timestamp(row, 7)?,
        updated_at: timestamp(row, 8)?,
    })
}

fn parse_certificate_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CourseCertificate> {
    Ok(CourseCertificate {
        id: row.get(0)?,
        certificate_id: row.get(1)?,
        user_id: row.get(2)?,
        course_id: row.get(3)?,
        earned_at: timestamp(row, 4)?,
        expires_at: optional_timestamp(row, 5)?,
        final_score: row.get(6)?,
        grade: row.get(7)?,
        completion_time: row.get(8)?,
        digital_signature: row.get(9)?,
        pdf_url: row.get(10)?,
        notes: row.get(11)?,
        created_at: timestamp(row, 12)?,
        updated_at: timestamp(row, 13)?,
    })
}

fn timestamp(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(index)?;
    parse_storage_timestamp(&raw).map_err(|err| to_sql_error(index, &err))
}

fn optional_timestamp(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    row.get::<_, Option<String>>(index)?
        .as_deref()
        .map(|raw| parse_storage_timestamp(raw).map_err(|err| to_sql_error(index, &err)))
        .transpose()
}

fn storage_text(value: OffsetDateTime) -> Result<String> {
    format_storage_timestamp(value).map_err(|err| anyhow!(err.to_string()))
}

fn optional_storage_text(value: Option<OffsetDateTime>) -> Result<Option<String>> {
    value.map(storage_text).transpose()
}

fn to_sql_error(index: usize, err: &LearningError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
