use std::sync::atomic::Ordering;
use std::time::Duration;

use mathquest_api::{
    models::{
        badge::BadgeType,
        events::{ActivityKind, HubEvent},
        job::QueueName,
        session::{Difficulty, GenerationStatus, PROBLEM_PLACEHOLDER},
        submission::{FeedbackStatus, SubmitAnswerRequest},
    },
    services::{
        notification_hub::Room,
        status_poller::{
            poll_until_terminal, PollConfig, PollOutcome, StoreSessionSource,
            StoreSubmissionSource,
        },
    },
};

mod common;

use common::{admin, eventually, student, teacher, ScriptedGenerator, TestApp, ANSWER};

async fn generate_and_wait(app: &TestApp, user_id: &str) -> String {
    let response = app.state.problems.generate(&student(user_id)).await.unwrap();
    let report = poll_until_terminal(
        &StoreSessionSource(app.state.store.clone()),
        &response.session_id,
        &app.poll_config(),
    )
    .await
    .unwrap();
    assert_eq!(report.outcome, PollOutcome::Succeeded);
    response.session_id
}

async fn answer_and_wait(app: &TestApp, user_id: &str, session_id: &str, answer: f64) -> String {
    let response = app
        .state
        .submissions
        .submit(
            &student(user_id),
            SubmitAnswerRequest {
                session_id: session_id.to_string(),
                user_answer: answer,
                time_taken: Some(30),
            },
        )
        .await
        .unwrap();
    let report = poll_until_terminal(
        &StoreSubmissionSource(app.state.store.clone()),
        &response.submission_id,
        &app.poll_config(),
    )
    .await
    .unwrap();
    assert_eq!(report.outcome, PollOutcome::Succeeded);
    response.submission_id
}

#[tokio::test]
async fn test_problem_and_feedback_round_trip() {
    let app = TestApp::new(common::test_config(), ScriptedGenerator::reliable());
    let workers = app.start_workers();
    assert_eq!(workers.worker_count(), 4);

    let session_id = generate_and_wait(&app, "u1").await;
    let session = app.store_session(&session_id).await;
    assert_eq!(session.job_status, GenerationStatus::Completed);
    assert_ne!(session.problem_text, PROBLEM_PLACEHOLDER);
    assert_eq!(session.correct_answer, ANSWER);
    assert_eq!(session.difficulty_level, Difficulty::Medium);

    let submission_id = answer_and_wait(&app, "u1", &session_id, ANSWER).await;
    let submission = app
        .state
        .store
        .get_submission(&submission_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(submission.feedback_status, FeedbackStatus::Ready);
    assert!(submission.is_correct);
    assert!(submission.progress_applied);

    let summary = app.state.progress.summary("u1").await.unwrap();
    assert_eq!(summary.progress.total_problems, 1);
    assert_eq!(summary.progress.correct_problems, 1);
    assert_eq!(summary.progress.current_streak, 1);

    workers.shutdown().await;
    let counts = app.state.queue.counts(QueueName::ProblemGeneration).await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.failed, 0);
}

#[tokio::test]
async fn test_transient_generator_failure_is_retried() {
    let app = TestApp::new(common::test_config(), ScriptedGenerator::failing_problems(2));
    let workers = app.start_workers();

    let response = app.state.problems.generate(&student("u1")).await.unwrap();
    // Failed attempts are visible in between, so wait on the stored status.
    let (app_ref, session_id) = (&app, &response.session_id);
    let completed = eventually(|| async move {
        app_ref.store_session(session_id).await.job_status == GenerationStatus::Completed
    })
    .await;
    assert!(completed);
    assert_eq!(app.generator.problem_calls.load(Ordering::SeqCst), 3);

    workers.shutdown().await;
}

#[tokio::test]
async fn test_first_failed_attempt_is_seen_by_poller() {
    // Production ratio: 2 s backoff against a 3 s poll, scaled down 20x.
    let mut config = common::test_config();
    config.queue.backoff_base_ms = 100;
    config.queue.lease_poll_ms = 12;
    config.poll.interval_ms = 150;
    config.poll.max_attempts = 20;
    let app = TestApp::new(config, ScriptedGenerator::failing_problems(usize::MAX));
    let workers = app.start_workers();

    let response = app.state.problems.generate(&student("u1")).await.unwrap();
    let report = poll_until_terminal(
        &StoreSessionSource(app.state.store.clone()),
        &response.session_id,
        &app.poll_config(),
    )
    .await
    .unwrap();

    assert_eq!(report.outcome, PollOutcome::Failed);
    assert!(report.checks <= 3, "failure seen on check {}", report.checks);
    assert_eq!(
        report.last.map(|s| s.job_status),
        Some(GenerationStatus::Failed)
    );

    // The remaining attempts still run and the session ends failed.
    let queue = &app.state.queue;
    let exhausted = eventually(|| async move {
        let counts = queue.counts(QueueName::ProblemGeneration).await.unwrap();
        counts.failed == 1
    })
    .await;
    assert!(exhausted);
    workers.shutdown().await;

    assert_eq!(app.generator.problem_calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        app.store_session(&response.session_id).await.job_status,
        GenerationStatus::Failed
    );
}

#[tokio::test]
async fn test_poller_times_out_without_workers() {
    let mut config = common::test_config();
    config.poll.interval_ms = 5;
    config.poll.max_attempts = 4;
    let app = TestApp::new(config, ScriptedGenerator::reliable());

    let response = app.state.problems.generate(&student("u1")).await.unwrap();
    let report = poll_until_terminal(
        &StoreSessionSource(app.state.store.clone()),
        &response.session_id,
        &PollConfig::from(&app.state.config.poll),
    )
    .await
    .unwrap();

    assert_eq!(report.outcome, PollOutcome::TimedOut);
    assert_eq!(report.checks, 4);
}

#[tokio::test]
async fn test_exhausted_feedback_leaves_progress_untouched() {
    let app = TestApp::new(
        common::test_config(),
        ScriptedGenerator::failing_feedback(usize::MAX),
    );
    let workers = app.start_workers();

    let session_id = generate_and_wait(&app, "u1").await;
    let response = app
        .state
        .submissions
        .submit(
            &student("u1"),
            SubmitAnswerRequest {
                session_id,
                user_answer: ANSWER,
                time_taken: None,
            },
        )
        .await
        .unwrap();

    let report = poll_until_terminal(
        &StoreSubmissionSource(app.state.store.clone()),
        &response.submission_id,
        &app.poll_config(),
    )
    .await
    .unwrap();
    assert_eq!(report.outcome, PollOutcome::Failed);

    workers.shutdown().await;
    let progress = app.state.store.get_progress("u1").await.unwrap().unwrap();
    assert_eq!(progress.total_problems, 0);
}

#[tokio::test]
async fn test_strong_window_raises_next_problem_to_hard() {
    let app = TestApp::new(common::test_config(), ScriptedGenerator::reliable());
    // One more incorrect answer slides this to [T, T, T, T, F].
    app.seed_progress("u1", Difficulty::Medium, 5, &[false, true, true, true, true])
        .await;
    let workers = app.start_workers();

    let session_id = generate_and_wait(&app, "u1").await;
    answer_and_wait(&app, "u1", &session_id, ANSWER + 1.0).await;

    let next = generate_and_wait(&app, "u1").await;
    assert_eq!(
        app.store_session(&next).await.difficulty_level,
        Difficulty::Hard
    );

    workers.shutdown().await;
}

#[tokio::test]
async fn test_weak_window_lowers_next_problem_to_easy() {
    let app = TestApp::new(common::test_config(), ScriptedGenerator::reliable());
    // An incorrect answer slides this to [F, F, F, T, F].
    app.seed_progress("u1", Difficulty::Medium, 5, &[true, false, false, false, true])
        .await;
    let workers = app.start_workers();

    let session_id = generate_and_wait(&app, "u1").await;
    answer_and_wait(&app, "u1", &session_id, 0.0).await;

    let next = generate_and_wait(&app, "u1").await;
    assert_eq!(
        app.store_session(&next).await.difficulty_level,
        Difficulty::Easy
    );

    workers.shutdown().await;
}

#[tokio::test]
async fn test_tenth_problem_awards_persistence_once_with_feedback_event() {
    let app = TestApp::new(common::test_config(), ScriptedGenerator::reliable());
    app.seed_progress("u1", Difficulty::Medium, 9, &[true, false, true, false, true])
        .await;
    let workers = app.start_workers();

    let (conn, mut events) = app.state.hub.connect(student("u1")).await.unwrap();
    app.state
        .hub
        .join(conn, Room::Student("u1".into()))
        .await
        .unwrap();

    let session_id = generate_and_wait(&app, "u1").await;
    let submission_id = answer_and_wait(&app, "u1", &session_id, ANSWER).await;

    let mut awarded = None;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_secs(2), events.recv()).await
    {
        if let HubEvent::FeedbackReady(ready) = event {
            assert_eq!(ready.submission_id, submission_id);
            awarded = Some(ready.new_badges);
            break;
        }
    }
    assert_eq!(awarded, Some(vec![BadgeType::Persistence]));

    let session_id = generate_and_wait(&app, "u1").await;
    answer_and_wait(&app, "u1", &session_id, ANSWER).await;

    workers.shutdown().await;
    let badges = app.state.store.list_badges("u1").await.unwrap();
    assert_eq!(
        badges
            .iter()
            .filter(|b| b.badge_type == BadgeType::Persistence)
            .count(),
        1
    );
    let progress = app.state.store.get_progress("u1").await.unwrap().unwrap();
    assert_eq!(progress.total_problems, 11);
}

#[tokio::test]
async fn test_rooms_receive_only_their_events() {
    let app = TestApp::new(common::test_config(), ScriptedGenerator::reliable());
    let hub = app.state.hub.clone();

    let (own, mut own_rx) = hub.connect(student("u1")).await.unwrap();
    hub.join(own, Room::Student("u1".into())).await.unwrap();
    let (other, mut other_rx) = hub.connect(student("u2")).await.unwrap();
    hub.join(other, Room::Student("u2".into())).await.unwrap();
    let (staff, mut staff_rx) = hub.connect(teacher()).await.unwrap();
    hub.join(staff, Room::Teachers).await.unwrap();
    let (ops, mut ops_rx) = hub.connect(admin()).await.unwrap();
    hub.join(ops, Room::Admins).await.unwrap();

    let workers = app.start_workers();
    generate_and_wait(&app, "u1").await;

    let got_problem = eventually(|| {
        let event = own_rx.try_recv();
        async move { matches!(event, Ok(HubEvent::ProblemGenerated(_))) }
    })
    .await;
    assert!(got_problem);

    match staff_rx.try_recv() {
        Ok(HubEvent::StudentActivity(activity)) => {
            assert_eq!(activity.user_id, "u1");
            assert_eq!(activity.action, ActivityKind::GeneratedProblem);
            assert!(activity.is_correct.is_none());
        }
        other => panic!("teacher expected activity, got {other:?}"),
    }

    let mut admin_events = Vec::new();
    assert!(
        eventually(|| {
            while let Ok(event) = ops_rx.try_recv() {
                admin_events.push(event.event_name());
            }
            let seen = admin_events.contains(&"student:activity")
                && admin_events.contains(&"queue:update");
            async move { seen }
        })
        .await
    );

    assert!(other_rx.try_recv().is_err());
    workers.shutdown().await;
}

#[tokio::test]
async fn test_hub_shutdown_closes_connections() {
    let app = TestApp::new(common::test_config(), ScriptedGenerator::reliable());
    let (_, mut rx) = app.state.hub.connect(student("u1")).await.unwrap();

    app.state.hub.shutdown().await;

    assert!(rx.recv().await.is_none());
    assert!(app.state.hub.connect(student("u1")).await.is_none());
}
