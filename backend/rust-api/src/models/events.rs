//! Notification hub wire types.
//!
//! Server events are serialized as `{"event": "...", "payload": {...}}`;
//! client commands as `{"type": "join:student", ...}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::badge::BadgeType;
use super::job::{QueueCounts, QueueName};
use super::session::Difficulty;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemGenerated {
    pub session_id: String,
    pub problem_text: String,
    pub difficulty_level: Difficulty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackReady {
    pub submission_id: String,
    pub session_id: String,
    pub feedback: String,
    pub is_correct: bool,
    #[serde(default)]
    pub new_badges: Vec<BadgeType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    GeneratedProblem,
    SubmittedAnswer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentActivity {
    pub user_id: String,
    pub user_name: String,
    pub action: ActivityKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_correct: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueUpdate {
    pub queue_name: QueueName,
    #[serde(flatten)]
    pub counts: QueueCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum HubEvent {
    #[serde(rename = "problem:generated")]
    ProblemGenerated(ProblemGenerated),
    #[serde(rename = "feedback:ready")]
    FeedbackReady(FeedbackReady),
    #[serde(rename = "student:activity")]
    StudentActivity(StudentActivity),
    #[serde(rename = "queue:update")]
    QueueUpdate(QueueUpdate),
    #[serde(rename = "room:joined")]
    RoomJoined { room: String },
    #[serde(rename = "room:rejected")]
    RoomRejected { room: String, reason: String },
    #[serde(rename = "room:left")]
    RoomLeft { room: String },
}

impl HubEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            HubEvent::ProblemGenerated(_) => "problem:generated",
            HubEvent::FeedbackReady(_) => "feedback:ready",
            HubEvent::StudentActivity(_) => "student:activity",
            HubEvent::QueueUpdate(_) => "queue:update",
            HubEvent::RoomJoined { .. } => "room:joined",
            HubEvent::RoomRejected { .. } => "room:rejected",
            HubEvent::RoomLeft { .. } => "room:left",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientCommand {
    #[serde(rename = "join:student", rename_all = "camelCase")]
    JoinStudent { user_id: String },
    #[serde(rename = "join:teacher")]
    JoinTeacher,
    #[serde(rename = "join:admin")]
    JoinAdmin,
    #[serde(rename = "leave:room")]
    LeaveRoom { room: String },
}
