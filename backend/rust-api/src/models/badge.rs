use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::progress::Progress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BadgeType {
    StreakMaster,
    Persistence,
    Perfectionist,
    QuickSolver,
    MathGenius,
}

impl BadgeType {
    pub const ALL: [BadgeType; 5] = [
        BadgeType::StreakMaster,
        BadgeType::Persistence,
        BadgeType::Perfectionist,
        BadgeType::QuickSolver,
        BadgeType::MathGenius,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BadgeType::StreakMaster => "STREAK_MASTER",
            BadgeType::Persistence => "PERSISTENCE",
            BadgeType::Perfectionist => "PERFECTIONIST",
            BadgeType::QuickSolver => "QUICK_SOLVER",
            BadgeType::MathGenius => "MATH_GENIUS",
        }
    }

    pub fn definition(&self) -> BadgeDefinition {
        let (name, description, icon) = match self {
            BadgeType::StreakMaster => (
                "Streak Master",
                "Earned by solving 5 problems correctly in a row!",
                "🔥",
            ),
            BadgeType::Persistence => ("Persistence", "Earned by completing 10 problems!", "💪"),
            BadgeType::Perfectionist => (
                "Perfectionist",
                "Earned by solving 10 problems with 100% accuracy!",
                "⭐",
            ),
            BadgeType::QuickSolver => (
                "Quick Solver",
                "Earned by solving 5 problems in under 10 minutes!",
                "⚡",
            ),
            BadgeType::MathGenius => ("Math Genius", "Earned by solving 50 problems total!", "🎓"),
        };
        BadgeDefinition {
            badge_type: *self,
            name,
            description,
            icon,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BadgeDefinition {
    pub badge_type: BadgeType,
    pub name: &'static str,
    pub description: &'static str,
    pub icon: &'static str,
}

/// Append-only award record; at most one per (user, badge type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBadge {
    #[serde(rename = "_id")]
    pub id: String,
    pub user_id: String,
    pub badge_type: BadgeType,
    pub earned_at: DateTime<Utc>,
}

impl UserBadge {
    pub fn new(user_id: &str, badge_type: BadgeType) -> Self {
        Self {
            id: Self::key(user_id, badge_type),
            user_id: user_id.to_string(),
            badge_type,
            earned_at: Utc::now(),
        }
    }

    /// Deterministic record key, so a duplicate award collides in the store.
    pub fn key(user_id: &str, badge_type: BadgeType) -> String {
        format!("{}:{}", user_id, badge_type.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressMetric {
    CurrentStreak,
    TotalProblems,
    CorrectProblems,
}

impl ProgressMetric {
    pub fn read(&self, progress: &Progress) -> u32 {
        match self {
            ProgressMetric::CurrentStreak => progress.current_streak,
            ProgressMetric::TotalProblems => progress.total_problems,
            ProgressMetric::CorrectProblems => progress.correct_problems,
        }
    }
}

/// Threshold rule: `badge` is earned once `metric >= threshold`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeRule {
    pub badge: BadgeType,
    pub metric: ProgressMetric,
    pub threshold: u32,
}

impl BadgeRule {
    pub fn is_met(&self, progress: &Progress) -> bool {
        self.metric.read(progress) >= self.threshold
    }

    /// STREAK_MASTER, PERSISTENCE and MATH_GENIUS. PERFECTIONIST and
    /// QUICK_SOLVER have no rule until one is configured.
    pub fn default_rules() -> Vec<BadgeRule> {
        vec![
            BadgeRule {
                badge: BadgeType::StreakMaster,
                metric: ProgressMetric::CurrentStreak,
                threshold: 5,
            },
            BadgeRule {
                badge: BadgeType::Persistence,
                metric: ProgressMetric::TotalProblems,
                threshold: 10,
            },
            BadgeRule {
                badge: BadgeType::MathGenius,
                metric: ProgressMetric::TotalProblems,
                threshold: 50,
            },
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EarnedBadgeView {
    pub badge_type: BadgeType,
    pub name: String,
    pub description: String,
    pub icon: String,
    pub earned_at: DateTime<Utc>,
}

impl From<&UserBadge> for EarnedBadgeView {
    fn from(award: &UserBadge) -> Self {
        let definition = award.badge_type.definition();
        Self {
            badge_type: award.badge_type,
            name: definition.name.to_string(),
            description: definition.description.to_string(),
            icon: definition.icon.to_string(),
            earned_at: award.earned_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rules_skip_unspecified_badges() {
        let rules = BadgeRule::default_rules();
        assert_eq!(rules.len(), 3);
        assert!(rules
            .iter()
            .all(|r| r.badge != BadgeType::Perfectionist && r.badge != BadgeType::QuickSolver));
    }

    #[test]
    fn rule_parses_from_config_shape() {
        let rule: BadgeRule = serde_json::from_str(
            r#"{"badge":"PERFECTIONIST","metric":"correct_problems","threshold":10}"#,
        )
        .unwrap();
        assert_eq!(rule.badge, BadgeType::Perfectionist);
        assert_eq!(rule.metric, ProgressMetric::CorrectProblems);
    }

    #[test]
    fn award_key_is_stable_per_user_and_type() {
        assert_eq!(
            UserBadge::key("u1", BadgeType::StreakMaster),
            "u1:STREAK_MASTER"
        );
        assert_eq!(
            UserBadge::new("u1", BadgeType::StreakMaster).id,
            UserBadge::key("u1", BadgeType::StreakMaster)
        );
    }
}
