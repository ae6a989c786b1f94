use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, to_bson, Bson},
    error::{ErrorKind, WriteFailure},
    options::ReturnDocument,
    Collection, Database, IndexModel,
};

use super::RecordStore;
use crate::error::StoreError;
use crate::models::badge::UserBadge;
use crate::models::progress::Progress;
use crate::models::session::{Session, SessionTransition, TransitionError};
use crate::models::submission::{FeedbackStatus, Submission};

const SESSIONS: &str = "sessions";
const SUBMISSIONS: &str = "submissions";
const PROGRESS: &str = "progress";
const USER_BADGES: &str = "user_badges";

pub struct MongoRecordStore {
    mongo: Database,
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        *err.kind,
        ErrorKind::Write(WriteFailure::WriteError(ref we)) if we.code == 11000
    )
}

impl MongoRecordStore {
    pub fn new(mongo: Database) -> Self {
        Self { mongo }
    }

    /// Secondary indexes used by the read paths; safe to run on every start.
    pub async fn ensure_indexes(&self) -> Result<(), StoreError> {
        self.submissions()
            .create_index(IndexModel::builder().keys(doc! { "session_id": 1 }).build())
            .await?;
        self.badges()
            .create_index(IndexModel::builder().keys(doc! { "user_id": 1 }).build())
            .await?;
        Ok(())
    }

    fn sessions(&self) -> Collection<Session> {
        self.mongo.collection(SESSIONS)
    }

    fn submissions(&self) -> Collection<Submission> {
        self.mongo.collection(SUBMISSIONS)
    }

    fn progress(&self) -> Collection<Progress> {
        self.mongo.collection(PROGRESS)
    }

    fn badges(&self) -> Collection<UserBadge> {
        self.mongo.collection(USER_BADGES)
    }

    async fn submission_exists(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self
            .submissions()
            .count_documents(doc! { "_id": id })
            .await?
            > 0)
    }
}

#[async_trait]
impl RecordStore for MongoRecordStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.mongo.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        match self.sessions().insert_one(session).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(StoreError::Duplicate {
                entity: "session",
                id: session.id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions().find_one(doc! { "_id": id }).await?)
    }

    async fn set_session_job(&self, id: &str, job_id: &str) -> Result<(), StoreError> {
        let result = self
            .sessions()
            .update_one(doc! { "_id": id }, doc! { "$set": { "job_id": job_id } })
            .await?;
        if result.matched_count == 0 {
            return Err(StoreError::NotFound {
                entity: "session",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn transition_session(
        &self,
        id: &str,
        transition: &SessionTransition,
    ) -> Result<Session, StoreError> {
        let target = transition.target();
        let sources: Vec<Bson> = target
            .allowed_sources()
            .iter()
            .map(|s| Bson::String(s.as_str().to_string()))
            .collect();

        let mut set = doc! {
            "job_status": target.as_str(),
            "updated_at": to_bson(&Utc::now())?,
        };
        if let SessionTransition::Completed {
            problem_text,
            correct_answer,
        } = transition
        {
            set.insert("problem_text", problem_text.as_str());
            set.insert("correct_answer", *correct_answer);
        }

        let updated = self
            .sessions()
            .find_one_and_update(
                doc! { "_id": id, "job_status": { "$in": sources } },
                doc! { "$set": set },
            )
            .return_document(ReturnDocument::After)
            .await?;

        if let Some(session) = updated {
            return Ok(session);
        }

        match self.get_session(id).await? {
            None => Err(StoreError::NotFound {
                entity: "session",
                id: id.to_string(),
            }),
            Some(current) if target.allowed_sources().contains(&current.job_status) => {
                // Moved between our filter and this read
                Err(StoreError::Conflict {
                    entity: "session",
                    id: id.to_string(),
                })
            }
            Some(current) => Err(TransitionError {
                from: current.job_status,
                to: target,
            }
            .into()),
        }
    }

    async fn insert_submission(&self, submission: &Submission) -> Result<(), StoreError> {
        match self.submissions().insert_one(submission).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(StoreError::Duplicate {
                entity: "submission",
                id: submission.id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_submission(&self, id: &str) -> Result<Option<Submission>, StoreError> {
        Ok(self.submissions().find_one(doc! { "_id": id }).await?)
    }

    async fn count_submissions(&self, session_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .submissions()
            .count_documents(doc! { "session_id": session_id })
            .await?)
    }

    async fn complete_feedback(
        &self,
        submission_id: &str,
        feedback_text: &str,
    ) -> Result<Submission, StoreError> {
        let updated = self
            .submissions()
            .find_one_and_update(
                doc! { "_id": submission_id, "feedback_status": FeedbackStatus::Pending.as_str() },
                doc! { "$set": {
                    "feedback_text": feedback_text,
                    "feedback_status": FeedbackStatus::Ready.as_str(),
                } },
            )
            .return_document(ReturnDocument::After)
            .await?;

        if let Some(submission) = updated {
            return Ok(submission);
        }
        if self.submission_exists(submission_id).await? {
            Err(StoreError::Conflict {
                entity: "submission",
                id: submission_id.to_string(),
            })
        } else {
            Err(StoreError::NotFound {
                entity: "submission",
                id: submission_id.to_string(),
            })
        }
    }

    async fn fail_feedback(&self, submission_id: &str) -> Result<bool, StoreError> {
        let result = self
            .submissions()
            .update_one(
                doc! { "_id": submission_id, "feedback_status": FeedbackStatus::Pending.as_str() },
                doc! { "$set": { "feedback_status": FeedbackStatus::Failed.as_str() } },
            )
            .await?;
        if result.matched_count == 0 && !self.submission_exists(submission_id).await? {
            return Err(StoreError::NotFound {
                entity: "submission",
                id: submission_id.to_string(),
            });
        }
        Ok(result.matched_count == 1)
    }

    async fn mark_progress_applied(&self, submission_id: &str) -> Result<bool, StoreError> {
        let result = self
            .submissions()
            .update_one(
                doc! { "_id": submission_id, "progress_applied": { "$ne": true } },
                doc! { "$set": { "progress_applied": true } },
            )
            .await?;
        Ok(result.modified_count == 1)
    }

    async fn get_progress(&self, user_id: &str) -> Result<Option<Progress>, StoreError> {
        Ok(self.progress().find_one(doc! { "_id": user_id }).await?)
    }

    async fn compare_and_swap_progress(
        &self,
        expected_version: Option<u64>,
        next: &Progress,
    ) -> Result<bool, StoreError> {
        let Some(expected) = expected_version else {
            return match self.progress().insert_one(next).await {
                Ok(_) => Ok(true),
                Err(e) if is_duplicate_key(&e) => Ok(false),
                Err(e) => Err(e.into()),
            };
        };

        let result = self
            .progress()
            .replace_one(
                doc! { "_id": next.user_id.as_str(), "version": (expected as i64) },
                next,
            )
            .await?;
        Ok(result.matched_count == 1)
    }

    async fn insert_badge(&self, badge: &UserBadge) -> Result<bool, StoreError> {
        match self.badges().insert_one(badge).await {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_badges(&self, user_id: &str) -> Result<Vec<UserBadge>, StoreError> {
        let cursor = self
            .badges()
            .find(doc! { "user_id": user_id })
            .sort(doc! { "earned_at": 1 })
            .await?;
        Ok(cursor.try_collect().await?)
    }
}
