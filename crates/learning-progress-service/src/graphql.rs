//! GraphQL schema: projections of the domain rows plus the query and mutation
//! roots. Every resolver runs through the request's [`RequestSession`].

use async_graphql::{
    Context, EmptySubscription, Enum, ErrorExtensions, InputObject, Object, Schema, SimpleObject,
};
use learning_progress_core::{
    Achievement, CourseCertificate, CourseStats, LearningError, LearningStatistics,
    NewAchievement, NewCertificate, Progress, ProgressStatus, ProgressUpdate,
};
use learning_progress_store_sqlite::is_write_conflict;
use time::OffsetDateTime;

use crate::session::{RequestSession, SessionError};

pub type ProgressSchema = Schema<QueryRoot, MutationRoot, EmptySubscription>;

pub fn build_schema() -> ProgressSchema {
    Schema::build(QueryRoot, MutationRoot, EmptySubscription).finish()
}

#[derive(Enum, Copy, Clone, Eq, PartialEq, Debug)]
#[graphql(name = "ProgressStatus")]
pub enum ProgressStatusValue {
    NotStarted,
    InProgress,
    Completed,
    Abandoned,
}

impl From<ProgressStatus> for ProgressStatusValue {
    fn from(value: ProgressStatus) -> Self {
        match value {
            ProgressStatus::NotStarted => Self::NotStarted,
            ProgressStatus::InProgress => Self::InProgress,
            ProgressStatus::Completed => Self::Completed,
            ProgressStatus::Abandoned => Self::Abandoned,
        }
    }
}

impl From<ProgressStatusValue> for ProgressStatus {
    fn from(value: ProgressStatusValue) -> Self {
        match value {
            ProgressStatusValue::NotStarted => Self::NotStarted,
            ProgressStatusValue::InProgress => Self::InProgress,
            ProgressStatusValue::Completed => Self::Completed,
            ProgressStatusValue::Abandoned => Self::Abandoned,
        }
    }
}

#[derive(SimpleObject)]
#[graphql(name = "Progress")]
pub struct ProgressObject {
    id: i64,
    user_id: i64,
    course_id: i64,
    status: ProgressStatusValue,
    started_at: Option<OffsetDateTime>,
    completed_at: Option<OffsetDateTime>,
    last_accessed_at: OffsetDateTime,
    completion_percentage: f64,
    total_time_spent: i64,
    notes: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<Progress> for ProgressObject {
    fn from(row: Progress) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            course_id: row.course_id,
            status: row.status.into(),
            started_at: row.started_at,
            completed_at: row.completed_at,
            last_accessed_at: row.last_accessed_at,
            completion_percentage: row.completion_percentage,
            total_time_spent: row.total_time_spent,
            notes: row.notes,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(SimpleObject)]
#[graphql(name = "Achievement")]
pub struct AchievementObject {
    id: i64,
    user_id: i64,
    achievement_type: String,
    achievement_name: String,
    description: Option<String>,
    metadata: Option<String>,
    earned_at: OffsetDateTime,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<Achievement> for AchievementObject {
    fn from(row: Achievement) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            achievement_type: row.achievement_type,
            achievement_name: row.achievement_name,
            description: row.description,
            metadata: row.metadata,
            earned_at: row.earned_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(SimpleObject)]
#[graphql(name = "CourseCertificate")]
pub struct CertificateObject {
    id: i64,
    certificate_id: String,
    user_id: i64,
    course_id: i64,
    earned_at: OffsetDateTime,
    expires_at: Option<OffsetDateTime>,
    final_score: Option<f64>,
    grade: Option<String>,
    /// Hours.
    completion_time: f64,
    digital_signature: String,
    pdf_url: Option<String>,
    notes: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<CourseCertificate> for CertificateObject {
    fn from(row: CourseCertificate) -> Self {
        Self {
            id: row.id,
            certificate_id: row.certificate_id,
            user_id: row.user_id,
            course_id: row.course_id,
            earned_at: row.earned_at,
            expires_at: row.expires_at,
            final_score: row.final_score,
            grade: row.grade,
            completion_time: row.completion_time,
            digital_signature: row.digital_signature,
            pdf_url: row.pdf_url,
            notes: row.notes,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(SimpleObject)]
#[graphql(name = "LearningStatistics")]
pub struct StatisticsObject {
    user_id: i64,
    total_completed_courses: i64,
    total_courses_in_progress: i64,
    total_courses: i64,
    total_certificates: i64,
    total_achievements: i64,
    total_time_spent_seconds: i64,
    average_completion_percentage: f64,
}

impl From<LearningStatistics> for StatisticsObject {
    fn from(stats: LearningStatistics) -> Self {
        Self {
            user_id: stats.user_id,
            total_completed_courses: stats.total_completed_courses,
            total_courses_in_progress: stats.total_courses_in_progress,
            total_courses: stats.total_courses,
            total_certificates: stats.total_certificates,
            total_achievements: stats.total_achievements,
            total_time_spent_seconds: stats.total_time_spent_seconds,
            average_completion_percentage: stats.average_completion_percentage,
        }
    }
}

#[derive(SimpleObject)]
#[graphql(name = "CourseStats")]
pub struct CourseStatsObject {
    status: ProgressStatusValue,
    completion_percentage: f64,
    total_time_spent: i64,
}

impl From<CourseStats> for CourseStatsObject {
    fn from(stats: CourseStats) -> Self {
        Self {
            status: stats.status.into(),
            completion_percentage: stats.completion_percentage,
            total_time_spent: stats.total_time_spent,
        }
    }
}

#[derive(InputObject)]
pub struct UpdateProgressInput {
    course_id: i64,
    status: Option<ProgressStatusValue>,
    completion_percentage: Option<f64>,
    time_spent_seconds: Option<i64>,
    notes: Option<String>,
}

impl From<UpdateProgressInput> for ProgressUpdate {
    fn from(input: UpdateProgressInput) -> Self {
        Self {
            course_id: input.course_id,
            status: input.status.map(Into::into),
            completion_percentage: input.completion_percentage,
            time_spent_seconds: input.time_spent_seconds,
            notes: input.notes,
        }
    }
}

#[derive(InputObject)]
pub struct CreateAchievementInput {
    achievement_type: String,
    achievement_name: String,
    description: Option<String>,
    metadata: Option<String>,
}

impl From<CreateAchievementInput> for NewAchievement {
    fn from(input: CreateAchievementInput) -> Self {
        Self {
            achievement_type: input.achievement_type,
            achievement_name: input.achievement_name,
            description: input.description,
            metadata: input.metadata,
        }
    }
}

#[derive(InputObject)]
pub struct CreateCertificateInput {
    course_id: i64,
    final_score: Option<f64>,
    grade: Option<String>,
    completion_time: Option<f64>,
    expires_at: Option<OffsetDateTime>,
    pdf_url: Option<String>,
    notes: Option<String>,
}

impl From<CreateCertificateInput> for NewCertificate {
    fn from(input: CreateCertificateInput) -> Self {
        Self {
            course_id: input.course_id,
            final_score: input.final_score,
            grade: input.grade,
            completion_time: input.completion_time,
            expires_at: input.expires_at,
            pdf_url: input.pdf_url,
            notes: input.notes,
        }
    }
}

/// Machine-readable code placed under `extensions.code` of a resolver error.
pub fn error_code(err: &anyhow::Error) -> &'static str {
    for cause in err.chain() {
        if let Some(session_err) = cause.downcast_ref::<SessionError>() {
            return match session_err {
                SessionError::Timeout { .. } => "timeout",
                _ => "internal_error",
            };
        }
        if let Some(LearningError::Validation(_)) = cause.downcast_ref::<LearningError>() {
            return "validation_error";
        }
    }

    if is_write_conflict(err) {
        return "write_conflict";
    }

    let normalized = format!("{err:#}").to_ascii_lowercase();
    if normalized.contains("unique constraint failed") {
        return "write_conflict";
    }
    if normalized.contains("must be provided") || normalized.contains("validation") {
        return "validation_error";
    }

    "internal_error"
}

fn resolver_error(err: &anyhow::Error) -> async_graphql::Error {
    let code = error_code(err);
    if code == "internal_error" {
        tracing::error!(error = %format!("{err:#}"), "resolver failed");
    }
    async_graphql::Error::new(err.to_string()).extend_with(|_, extensions| {
        extensions.set("code", code);
    })
}

async fn run<T, F>(ctx: &Context<'_>, label: &'static str, op: F) -> async_graphql::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&learning_progress_store_sqlite::UnitOfWork) -> anyhow::Result<T> + Send + 'static,
{
    let session = ctx.data::<RequestSession>()?;
    session.run(label, op).await.map_err(|err| resolver_error(&err))
}

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    /// Progress rows for a user, most recently accessed first.
    async fn get_user_progress(
        &self,
        ctx: &Context<'_>,
        user_id: i64,
        course_id: Option<i64>,
    ) -> async_graphql::Result<Vec<ProgressObject>> {
        let rows = run(ctx, "get_user_progress", move |unit| {
            unit.progress_for_user(user_id, course_id)
        })
        .await?;
        Ok(rows.into_iter().map(ProgressObject::from).collect())
    }

    async fn get_progress(
        &self,
        ctx: &Context<'_>,
        user_id: i64,
        course_id: i64,
    ) -> async_graphql::Result<Option<ProgressObject>> {
        let row = run(ctx, "get_progress", move |unit| unit.progress(user_id, course_id)).await?;
        Ok(row.map(ProgressObject::from))
    }

    /// Distinct ids of courses the user has completed.
    async fn get_completed_courses(
        &self,
        ctx: &Context<'_>,
        user_id: i64,
    ) -> async_graphql::Result<Vec<i64>> {
        run(ctx, "get_completed_courses", move |unit| {
            unit.completed_course_ids(user_id)
        })
        .await
    }

    async fn get_user_achievements(
        &self,
        ctx: &Context<'_>,
        user_id: i64,
        achievement_type: Option<String>,
    ) -> async_graphql::Result<Vec<AchievementObject>> {
        let rows = run(ctx, "get_user_achievements", move |unit| {
            unit.achievements(user_id, achievement_type.as_deref())
        })
        .await?;
        Ok(rows.into_iter().map(AchievementObject::from).collect())
    }

    async fn get_user_certificates(
        &self,
        ctx: &Context<'_>,
        user_id: i64,
        course_id: Option<i64>,
    ) -> async_graphql::Result<Vec<CertificateObject>> {
        let rows = run(ctx, "get_user_certificates", move |unit| {
            unit.certificates(user_id, course_id)
        })
        .await?;
        Ok(rows.into_iter().map(CertificateObject::from).collect())
    }

    async fn get_certificate(
        &self,
        ctx: &Context<'_>,
        user_id: i64,
        course_id: i64,
    ) -> async_graphql::Result<Option<CertificateObject>> {
        let row = run(ctx, "get_certificate", move |unit| {
            unit.certificate(user_id, course_id)
        })
        .await?;
        Ok(row.map(CertificateObject::from))
    }

    async fn get_user_statistics(
        &self,
        ctx: &Context<'_>,
        user_id: i64,
    ) -> async_graphql::Result<StatisticsObject> {
        let stats = run(ctx, "get_user_statistics", move |unit| unit.statistics(user_id)).await?;
        Ok(stats.into())
    }

    /// Defaults to not started with zero progress when no row exists.
    async fn get_course_stats(
        &self,
        ctx: &Context<'_>,
        user_id: i64,
        course_id: i64,
    ) -> async_graphql::Result<CourseStatsObject> {
        let stats = run(ctx, "get_course_stats", move |unit| {
            unit.course_stats(user_id, course_id)
        })
        .await?;
        Ok(stats.into())
    }
}

pub struct MutationRoot;

#[Object]
impl MutationRoot {
    /// Creates the (user, course) row on first write; later writes accumulate
    /// time spent and move the status.
    async fn update_user_progress(
        &self,
        ctx: &Context<'_>,
        user_id: i64,
        input: UpdateProgressInput,
    ) -> async_graphql::Result<ProgressObject> {
        let update = ProgressUpdate::from(input);
        let row = run(ctx, "update_user_progress", move |unit| {
            unit.upsert_progress(user_id, &update)
        })
        .await?;
        Ok(row.into())
    }

    async fn create_achievement(
        &self,
        ctx: &Context<'_>,
        user_id: i64,
        input: CreateAchievementInput,
    ) -> async_graphql::Result<AchievementObject> {
        let achievement = NewAchievement::from(input);
        let row = run(ctx, "create_achievement", move |unit| {
            unit.record_achievement(user_id, &achievement)
        })
        .await?;
        Ok(row.into())
    }

    /// Returns the existing certificate unchanged when one was already issued
    /// for the course.
    async fn create_certificate(
        &self,
        ctx: &Context<'_>,
        user_id: i64,
        input: CreateCertificateInput,
    ) -> async_graphql::Result<CertificateObject> {
        let request = NewCertificate::from(input);
        let issued = run(ctx, "create_certificate", move |unit| {
            unit.issue_certificate(user_id, &request)
        })
        .await?;
        Ok(issued.into_certificate().into())
    }

    async fn generate_certificate_if_eligible(
        &self,
        ctx: &Context<'_>,
        user_id: i64,
        course_id: i64,
    ) -> async_graphql::Result<Option<CertificateObject>> {
        let issued = run(ctx, "generate_certificate_if_eligible", move |unit| {
            unit.generate_certificate_if_eligible(user_id, course_id)
        })
        .await?;
        Ok(issued.map(CertificateObject::from))
    }
}
