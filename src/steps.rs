// src/steps.rs
use crate::adapters::StepStore;
use crate::coin::CoinService;
use crate::entry::{EntryKind, Reference};
use crate::error::CoinError;
use crate::settings::SettingsService;
use chrono::{DateTime, NaiveDate, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

/// Hard ceiling on a single day's submission.
pub const MAX_STEPS_PER_DAY: i64 = 100_000;
/// Plausible human stride, meters per step.
pub const MIN_METERS_PER_STEP: f64 = 0.5;
pub const MAX_METERS_PER_STEP: f64 = 2.0;
/// One coin per hundred steps, at most a hundred coins per submission.
pub const STEPS_PER_COIN: u64 = 100;
pub const MAX_COINS_PER_SUBMISSION: u64 = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepSource {
    Manual,
    Device,
    Wearable,
    Import,
}

impl StepSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepSource::Manual => "manual",
            StepSource::Device => "device",
            StepSource::Wearable => "wearable",
            StepSource::Import => "import",
        }
    }

    pub fn parse(value: &str) -> Option<StepSource> {
        match value {
            "manual" => Some(StepSource::Manual),
            "device" => Some(StepSource::Device),
            "wearable" => Some(StepSource::Wearable),
            "import" => Some(StepSource::Import),
            _ => None,
        }
    }

    /// Trusted sources carry their own integrity guarantees and skip the
    /// anomaly heuristics. Only hand-typed submissions get scored.
    pub fn is_trusted(&self) -> bool {
        !matches!(self, StepSource::Manual)
    }
}

/// One submission attempt, before any persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSubmission {
    pub user_id: Uuid,
    pub steps: i64,
    /// Total distance in meters, when the client reports one.
    pub distance: Option<f64>,
    pub source: StepSource,
    pub recorded_date: NaiveDate,
}

impl StepSubmission {
    /// Hard validity bounds. Runs before anything is persisted; failures
    /// here leave no trace in storage.
    pub fn validate(&self) -> Result<(), CoinError> {
        if self.steps < 0 {
            return Err(CoinError::Validation(
                "step count cannot be negative".to_string(),
            ));
        }
        if self.steps > MAX_STEPS_PER_DAY {
            return Err(CoinError::Validation(format!(
                "step count exceeds the daily maximum of {}",
                MAX_STEPS_PER_DAY
            )));
        }
        if let Some(distance) = self.distance {
            // A zero step count yields an infinite stride, which the range
            // check rejects like any other implausible one
            let per_step = distance / self.steps as f64;
            if per_step < MIN_METERS_PER_STEP || per_step > MAX_METERS_PER_STEP {
                return Err(CoinError::Validation(format!(
                    "implausible distance: {:.2} meters per step",
                    per_step
                )));
            }
        }
        Ok(())
    }
}

/// Coins awarded for a submission: floor(steps / 100), capped at 100.
pub fn coin_reward(steps: i64) -> u64 {
    if steps <= 0 {
        return 0;
    }
    (steps as u64 / STEPS_PER_COIN).min(MAX_COINS_PER_SUBMISSION)
}

/// Ratio check against the user's lifetime average. Returns the anomaly
/// score and a human-readable reason when the submission trips the limit.
///
/// A zero average means no history yet; first submissions are accepted
/// unconditionally. The score lands at the review threshold (70) right at
/// the limit and climbs to 100 as the ratio reaches twice the limit, so
/// every flagged submission clears the default queue cutoff.
pub fn anomaly_check(steps: i64, average: f64, ratio_limit: f64) -> Option<(f64, String)> {
    if average <= 0.0 {
        return None;
    }
    let ratio = steps as f64 / average;
    if ratio <= ratio_limit {
        return None;
    }
    let score = (70.0 + 30.0 * (ratio - ratio_limit) / ratio_limit).min(100.0);
    let reason = format!(
        "{} steps is {:.2}x the user's average of {:.0}",
        steps, ratio, average
    );
    Some((score, reason))
}

/// Persisted submission. At most one per (user, recorded_date, source).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub steps: i64,
    pub distance: Option<f64>,
    pub source: StepSource,
    pub recorded_date: NaiveDate,
    /// False while a flagged submission waits for review.
    pub verified: bool,
    pub coins_awarded: u64,
    pub created_at: DateTime<Utc>,
}

impl StepRecord {
    pub fn from_submission(submission: &StepSubmission, verified: bool, coins_awarded: u64) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id: submission.user_id,
            steps: submission.steps,
            distance: submission.distance,
            source: submission.source,
            recorded_date: submission.recorded_date,
            verified,
            coins_awarded,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<ReviewStatus> {
        match value {
            "pending" => Some(ReviewStatus::Pending),
            "approved" => Some(ReviewStatus::Approved),
            "rejected" => Some(ReviewStatus::Rejected),
            _ => None,
        }
    }
}

/// Review item written 1:1 with a flagged submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub id: Uuid,
    pub record_id: Uuid,
    pub user_id: Uuid,
    /// 0 to 100, higher is more suspicious.
    pub anomaly_score: f64,
    pub reason: String,
    pub status: ReviewStatus,
    pub reviewed_by: Option<Uuid>,
    pub review_comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

impl ValidationOutcome {
    pub fn new(record_id: Uuid, user_id: Uuid, anomaly_score: f64, reason: String) -> Self {
        Self {
            id: Uuid::now_v7(),
            record_id,
            user_id,
            anomaly_score,
            reason,
            status: ReviewStatus::Pending,
            reviewed_by: None,
            review_comment: None,
            created_at: Utc::now(),
            reviewed_at: None,
        }
    }
}

/// Step submission pipeline: validate, score, persist, reward.
#[derive(Clone)]
pub struct StepService {
    steps: Arc<dyn StepStore>,
    coins: CoinService,
    settings: SettingsService,
}

impl StepService {
    pub fn new(steps: Arc<dyn StepStore>, coins: CoinService, settings: SettingsService) -> Self {
        Self {
            steps,
            coins,
            settings,
        }
    }

    /// Record a submission and grant its reward.
    ///
    /// Ordering law: the record is persisted first, the grant runs second,
    /// and the `coins_awarded` stamp is written last, only once the grant
    /// has landed. A failed grant is logged and counted; the record stays
    /// at zero coins and is never rolled back.
    ///
    /// Flagged manual submissions are persisted unverified together with a
    /// pending review outcome, then surfaced to the caller as
    /// [`CoinError::SuspiciousActivity`]. The per-day uniqueness rule then
    /// blocks resubmission until an admin decides.
    pub async fn record(&self, submission: StepSubmission) -> Result<StepRecord, CoinError> {
        if let Err(err) = submission.validate() {
            counter!("steps.submissions.total", "status" => "rejected").increment(1);
            return Err(err);
        }

        let user = submission.user_id;

        if !submission.source.is_trusted() {
            // Baseline from history before this submission lands
            let average = self.steps.average_steps(user).await?;
            let ratio_limit = self.settings.suspicious_ratio().await?;
            if let Some((score, reason)) = anomaly_check(submission.steps, average, ratio_limit) {
                return self.flag(submission, score, reason).await;
            }
        }

        let reward = coin_reward(submission.steps);
        let mut record = StepRecord::from_submission(&submission, true, 0);
        self.steps.insert_record(record.clone()).await?;
        counter!("steps.submissions.total", "status" => "accepted").increment(1);

        if reward > 0 && self.grant_reward(&record, reward).await {
            record = self.steps.mark_verified(record.id, reward).await?;
        }

        Ok(record)
    }

    async fn flag(
        &self,
        submission: StepSubmission,
        score: f64,
        reason: String,
    ) -> Result<StepRecord, CoinError> {
        let record = StepRecord::from_submission(&submission, false, 0);
        // A duplicate (user, date, source) beats the suspicious verdict:
        // Conflict propagates before any outcome is written
        self.steps.insert_record(record.clone()).await?;

        let outcome = ValidationOutcome::new(record.id, submission.user_id, score, reason.clone());
        self.steps.insert_outcome(outcome).await?;

        counter!("steps.submissions.total", "status" => "flagged").increment(1);
        warn!(
            user = %submission.user_id,
            record = %record.id,
            score,
            "manual step submission flagged for review"
        );

        Err(CoinError::SuspiciousActivity(reason))
    }

    /// Grant the reward for a record, reporting whether it landed. The
    /// caller stamps `coins_awarded` only on success.
    async fn grant_reward(&self, record: &StepRecord, reward: u64) -> bool {
        let result = self
            .coins
            .grant(
                record.user_id,
                reward,
                EntryKind::Earned,
                Reference::step_record(record.id),
            )
            .await;

        match result {
            Ok(_) => true,
            Err(err) => {
                counter!("steps.rewards.failed").increment(1);
                error!(
                    user = %record.user_id,
                    record = %record.id,
                    reward,
                    error = %err,
                    "step reward grant failed, record keeps a zero coin stamp"
                );
                false
            }
        }
    }

    /// Pending review items at or above the configured score threshold,
    /// most suspicious first.
    pub async fn review_queue(&self, limit: u32) -> Result<Vec<ValidationOutcome>, CoinError> {
        let threshold = self.settings.review_threshold().await?;
        self.steps.pending_outcomes(threshold, limit).await
    }

    /// Approve a flagged submission: the record becomes verified and the
    /// normal reward pipeline runs exactly once. A second decision on the
    /// same outcome fails with [`CoinError::Conflict`].
    pub async fn approve(&self, outcome_id: Uuid, admin: Uuid) -> Result<StepRecord, CoinError> {
        let outcome = self
            .steps
            .resolve_outcome(outcome_id, ReviewStatus::Approved, admin, None)
            .await?;

        let record = self.steps.get_record(outcome.record_id).await?;
        let reward = coin_reward(record.steps);
        let granted = reward > 0 && self.grant_reward(&record, reward).await;

        let record = self
            .steps
            .mark_verified(record.id, if granted { reward } else { 0 })
            .await?;

        counter!("steps.reviews.total", "decision" => "approved").increment(1);
        Ok(record)
    }

    /// Reject a flagged submission with a reason for the audit trail.
    /// No coins were granted at flag time, so there is nothing to claw
    /// back; confirmed abuse is handled separately via a penalty.
    pub async fn reject(
        &self,
        outcome_id: Uuid,
        admin: Uuid,
        reason: impl Into<String>,
    ) -> Result<ValidationOutcome, CoinError> {
        let reason = reason.into();
        if reason.trim().len() < 5 {
            return Err(CoinError::Validation(
                "rejection reason must be at least 5 characters".to_string(),
            ));
        }

        let outcome = self
            .steps
            .resolve_outcome(outcome_id, ReviewStatus::Rejected, admin, Some(reason))
            .await?;

        counter!("steps.reviews.total", "decision" => "rejected").increment(1);
        Ok(outcome)
    }

    /// Newest-first page of the user's step records.
    pub async fn history(
        &self,
        user: Uuid,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StepRecord>, CoinError> {
        self.steps.records_for_user(user, limit, offset).await
    }

    pub async fn total_steps(&self, user: Uuid) -> Result<i64, CoinError> {
        self.steps.total_steps(user).await
    }

    /// The validator baseline, exposed for display.
    pub async fn average_daily_steps(&self, user: Uuid) -> Result<f64, CoinError> {
        self.steps.average_steps(user).await
    }
}
