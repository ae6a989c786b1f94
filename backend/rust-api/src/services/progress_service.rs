use std::sync::Arc;

use serde::Serialize;

use crate::error::StoreError;
use crate::models::badge::{BadgeDefinition, BadgeType, EarnedBadgeView};
use crate::models::progress::{Progress, ProgressView};
use crate::services::badge_engine::BadgeEngine;
use crate::services::difficulty::apply_result;
use crate::services::store::{get_or_create_progress, RecordStore};

/// Optimistic write attempts before a progress update gives up.
const MAX_CAS_ATTEMPTS: usize = 8;

#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub progress: Progress,
    pub new_badges: Vec<BadgeType>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSummary {
    pub progress: ProgressView,
    pub badges: Vec<EarnedBadgeView>,
    pub catalog: Vec<BadgeDefinition>,
}

pub struct ProgressService {
    store: Arc<dyn RecordStore>,
    badges: BadgeEngine,
}

impl ProgressService {
    pub fn new(store: Arc<dyn RecordStore>, badges: BadgeEngine) -> Self {
        Self { store, badges }
    }

    /// Applies the graded result of `submission_id` and then evaluates badges
    /// against the resulting progress.
    ///
    /// Safe to call again for the same submission: the result is counted
    /// once, and badges are re-evaluated so an award lost to an earlier error
    /// is still made.
    pub async fn record_result(
        &self,
        user_id: &str,
        submission_id: &str,
        is_correct: bool,
    ) -> Result<ProgressUpdate, StoreError> {
        let progress = self.apply_with_retry(user_id, submission_id, is_correct).await?;
        let new_badges = self.badges.evaluate(self.store.as_ref(), &progress).await?;
        Ok(ProgressUpdate {
            progress,
            new_badges,
        })
    }

    async fn apply_with_retry(
        &self,
        user_id: &str,
        submission_id: &str,
        is_correct: bool,
    ) -> Result<Progress, StoreError> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = get_or_create_progress(self.store.as_ref(), user_id).await?;
            if current.has_applied(submission_id) {
                tracing::debug!(user_id, submission_id, "Result already counted");
                return Ok(current);
            }

            let mut next = apply_result(&current, is_correct);
            next.remember_applied(submission_id);
            if self
                .store
                .compare_and_swap_progress(Some(current.version), &next)
                .await?
            {
                tracing::debug!(
                    user_id,
                    submission_id,
                    difficulty = next.current_difficulty.as_str(),
                    streak = next.current_streak,
                    "Progress updated"
                );
                return Ok(next);
            }
            tracing::debug!(user_id, attempt, "Progress write lost a race, retrying");
        }

        Err(StoreError::Conflict {
            entity: "progress",
            id: user_id.to_string(),
        })
    }

    pub async fn summary(&self, user_id: &str) -> Result<ProgressSummary, StoreError> {
        let progress = match self.store.get_progress(user_id).await? {
            Some(progress) => progress,
            None => Progress::new(user_id),
        };
        let badges = self.store.list_badges(user_id).await?;

        Ok(ProgressSummary {
            progress: ProgressView::from(&progress),
            badges: badges.iter().map(EarnedBadgeView::from).collect(),
            catalog: BadgeType::ALL.iter().map(|b| b.definition()).collect(),
        })
    }
}
