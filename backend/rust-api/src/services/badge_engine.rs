use std::collections::HashSet;

use crate::error::StoreError;
use crate::metrics::BADGES_AWARDED_TOTAL;
use crate::models::badge::{BadgeRule, BadgeType, UserBadge};
use crate::models::progress::Progress;
use crate::services::store::RecordStore;

/// Threshold rules evaluated after every progress update.
#[derive(Debug, Clone)]
pub struct BadgeEngine {
    rules: Vec<BadgeRule>,
}

impl Default for BadgeEngine {
    fn default() -> Self {
        Self::new(BadgeRule::default_rules())
    }
}

impl BadgeEngine {
    pub fn new(rules: Vec<BadgeRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[BadgeRule] {
        &self.rules
    }

    /// Badges whose rule is met by `progress` and which the user does not hold.
    pub fn due_badges(&self, progress: &Progress, held: &HashSet<BadgeType>) -> Vec<BadgeType> {
        let mut due = Vec::new();
        for rule in &self.rules {
            if rule.is_met(progress) && !held.contains(&rule.badge) && !due.contains(&rule.badge) {
                due.push(rule.badge);
            }
        }
        due
    }

    /// Awards every newly met badge and returns the ones this call created.
    ///
    /// Concurrent calls for the same user race on the store's unique award
    /// key, so each badge is created once no matter who wins.
    pub async fn evaluate(
        &self,
        store: &dyn RecordStore,
        progress: &Progress,
    ) -> Result<Vec<BadgeType>, StoreError> {
        let held: HashSet<BadgeType> = store
            .list_badges(&progress.user_id)
            .await?
            .into_iter()
            .map(|award| award.badge_type)
            .collect();

        let mut awarded = Vec::new();
        for badge in self.due_badges(progress, &held) {
            if store
                .insert_badge(&UserBadge::new(&progress.user_id, badge))
                .await?
            {
                BADGES_AWARDED_TOTAL
                    .with_label_values(&[badge.as_str()])
                    .inc();
                tracing::info!(user_id = %progress.user_id, badge = badge.as_str(), "Badge awarded");
                awarded.push(badge);
            }
        }
        Ok(awarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::models::badge::ProgressMetric;
    use crate::services::store::MemoryRecordStore;

    #[test]
    fn streak_master_is_due_at_five() {
        let engine = BadgeEngine::default();
        let mut progress = Progress::new("u1");
        progress.current_streak = 4;
        assert!(engine.due_badges(&progress, &HashSet::new()).is_empty());
        progress.current_streak = 5;
        progress.total_problems = 5;
        assert_eq!(
            engine.due_badges(&progress, &HashSet::new()),
            vec![BadgeType::StreakMaster]
        );
    }

    #[test]
    fn held_badges_are_skipped() {
        let engine = BadgeEngine::default();
        let mut progress = Progress::new("u1");
        progress.total_problems = 50;
        let held = HashSet::from([BadgeType::Persistence]);
        assert_eq!(
            engine.due_badges(&progress, &held),
            vec![BadgeType::MathGenius]
        );
    }

    #[test]
    fn configured_rule_enables_unevaluated_badge() {
        let mut rules = BadgeRule::default_rules();
        rules.push(BadgeRule {
            badge: BadgeType::Perfectionist,
            metric: ProgressMetric::CorrectProblems,
            threshold: 10,
        });
        let engine = BadgeEngine::new(rules);
        let mut progress = Progress::new("u1");
        progress.total_problems = 10;
        progress.correct_problems = 10;
        let due = engine.due_badges(&progress, &HashSet::new());
        assert!(due.contains(&BadgeType::Perfectionist));
        assert!(due.contains(&BadgeType::Persistence));
    }

    #[tokio::test]
    async fn evaluate_awards_once() {
        let store = MemoryRecordStore::new();
        let engine = BadgeEngine::default();
        let mut progress = Progress::new("u1");
        progress.total_problems = 10;

        let first = engine.evaluate(&store, &progress).await.unwrap();
        assert_eq!(first, vec![BadgeType::Persistence]);

        progress.total_problems = 11;
        let second = engine.evaluate(&store, &progress).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(store.list_badges("u1").await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_evaluations_award_a_badge_once() {
        let store = Arc::new(MemoryRecordStore::new());
        let engine = Arc::new(BadgeEngine::default());
        let mut progress = Progress::new("u1");
        progress.total_problems = 10;
        let progress = Arc::new(progress);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                let engine = engine.clone();
                let progress = progress.clone();
                tokio::spawn(async move { engine.evaluate(store.as_ref(), &progress).await })
            })
            .collect();
        let results = futures::future::join_all(tasks).await;

        let winners = results
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .filter(|awarded| awarded.contains(&BadgeType::Persistence))
            .count();
        assert_eq!(winners, 1);

        let badges = store.list_badges("u1").await.unwrap();
        assert_eq!(badges.len(), 1);
        assert_eq!(badges[0].badge_type, BadgeType::Persistence);
    }
}
