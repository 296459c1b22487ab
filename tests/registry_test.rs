mod common;

use std::time::{Duration, Instant};

use common::{FakeBrowser, ScriptedModel, registry, wait_until};
use webpilot::error::AgentError;
use webpilot::session::{FailureReason, SessionEvent, SessionId, SessionOptions, SessionState};

const SCROLL: &str = r#"{"type":"scroll","direction":"down","amount":400}"#;
const DONE: &str = r#"{"type":"done","text":"done","success":true}"#;

#[tokio::test]
async fn test_create_defaults_and_listing() {
    let browser = FakeBrowser::new();
    let registry = registry(browser.clone(), ScriptedModel::new(&[]));

    let first = registry.create(SessionOptions::default()).await.unwrap();
    assert_eq!(first.state, SessionState::Created);
    assert_eq!(first.name, format!("Session {}", &first.id.0[..8]));
    assert_eq!(first.steps_recorded, 0);

    let second = registry
        .create(SessionOptions {
            name: Some("checkout flow".into()),
            start_url: Some("https://shop.example/".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(second.name, "checkout flow");
    assert!(browser.calls().contains(&"navigate https://shop.example/".to_string()));

    let ids: Vec<SessionId> = registry.list().into_iter().map(|s| s.id).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&first.id) && ids.contains(&second.id));
    assert_eq!(browser.open_sessions(), 2);
}

#[tokio::test]
async fn test_create_rejects_bad_options_without_opening_browser() {
    let browser = FakeBrowser::new();
    let registry = registry(browser.clone(), ScriptedModel::new(&[]));

    let bad_url = registry
        .create(SessionOptions {
            start_url: Some("not a url".into()),
            ..Default::default()
        })
        .await;
    assert!(matches!(bad_url, Err(AgentError::InvalidTask(_))));

    let bad_limit = registry
        .create(SessionOptions {
            max_steps: Some(0),
            ..Default::default()
        })
        .await;
    assert!(matches!(bad_limit, Err(AgentError::InvalidTask(_))));

    assert_eq!(browser.open_sessions(), 0);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_failed_start_navigation_releases_browser_session() {
    let browser = FakeBrowser::new();
    let registry = registry(browser.clone(), ScriptedModel::new(&[]));

    let result = registry
        .create(SessionOptions {
            start_url: Some("https://unreachable.invalid/".into()),
            ..Default::default()
        })
        .await;
    assert!(matches!(result, Err(AgentError::Browser(_))));
    assert_eq!(browser.closed().len(), 1);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_second_run_while_running_is_busy() {
    let browser = FakeBrowser::new();
    let (model, gate) = ScriptedModel::gated(&[DONE]);
    let registry = registry(browser, model.clone());
    let session = registry.create(SessionOptions::default()).await.unwrap();

    let first = registry.spawn_run(&session.id, "first task").unwrap();
    wait_until(|| model.calls() == 1).await;

    let second = registry.run(&session.id, "second task").await;
    assert!(matches!(second, Err(AgentError::SessionBusy(ref id)) if *id == session.id));
    let info = registry.get(&session.id).unwrap();
    assert_eq!(info.state, SessionState::Running);
    assert_eq!(info.task.as_deref(), Some("first task"));

    gate.notify_one();
    let outcome = first.await.unwrap();
    assert_eq!(outcome.state, SessionState::Completed);
    assert_eq!(model.calls(), 1);
}

#[tokio::test]
async fn test_pause_holds_loop_until_resume() {
    let browser = FakeBrowser::new();
    let (model, gate) = ScriptedModel::gated(&[SCROLL, DONE]);
    let registry = registry(browser, model.clone());
    let session = registry.create(SessionOptions::default()).await.unwrap();

    let mut run = registry.spawn_run(&session.id, "scroll then stop").unwrap();
    wait_until(|| model.calls() == 1).await;

    let paused = registry.pause(&session.id).unwrap();
    assert_eq!(paused.state, SessionState::Paused);
    gate.notify_one();

    // The scroll step finishes, then the loop waits at the step boundary.
    wait_until(|| registry.history(&session.id).unwrap().len() == 1).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(200), &mut run)
            .await
            .is_err()
    );
    assert_eq!(model.calls(), 1);
    assert!(matches!(
        registry.run(&session.id, "another").await,
        Err(AgentError::SessionBusy(_))
    ));

    let resumed = registry.resume(&session.id).unwrap();
    assert_eq!(resumed.state, SessionState::Running);
    gate.notify_one();

    let outcome = run.await.unwrap();
    assert_eq!(outcome.state, SessionState::Completed);
    assert_eq!(outcome.steps, 2);
}

#[tokio::test]
async fn test_pause_and_resume_require_matching_state() {
    let browser = FakeBrowser::new();
    let registry = registry(browser, ScriptedModel::new(&[]));
    let session = registry.create(SessionOptions::default()).await.unwrap();

    assert!(matches!(
        registry.pause(&session.id),
        Err(AgentError::InvalidTransition {
            from: SessionState::Created,
            to: SessionState::Paused
        })
    ));
    assert!(matches!(
        registry.resume(&session.id),
        Err(AgentError::InvalidTransition { .. })
    ));
    assert!(matches!(
        registry.pause(&SessionId::from("nope")),
        Err(AgentError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_terminate_closes_browser_session() {
    let browser = FakeBrowser::new();
    let registry = registry(browser.clone(), ScriptedModel::new(&[]));
    let session = registry.create(SessionOptions::default()).await.unwrap();
    let handle = browser.handles().pop().unwrap();

    registry.terminate(&session.id).await.unwrap();
    assert_eq!(browser.closed(), vec![handle]);
    assert!(matches!(
        registry.get(&session.id),
        Err(AgentError::SessionNotFound(_))
    ));
    assert!(matches!(
        registry.terminate(&session.id).await,
        Err(AgentError::SessionNotFound(_))
    ));
    assert_eq!(browser.closed().len(), 1);
}

#[tokio::test]
async fn test_terminate_cancels_running_task() {
    let browser = FakeBrowser::new();
    let (model, _gate) = ScriptedModel::gated(&[DONE]);
    let registry = registry(browser.clone(), model.clone());
    let session = registry.create(SessionOptions::default()).await.unwrap();

    let run = registry.spawn_run(&session.id, "never finishes").unwrap();
    wait_until(|| model.calls() == 1).await;

    registry.terminate(&session.id).await.unwrap();
    let outcome = run.await.unwrap();
    assert_eq!(outcome.state, SessionState::Cancelled);
    assert_eq!(outcome.steps, 1);
    assert_eq!(browser.closed().len(), 1);
    assert!(registry.history(&session.id).is_err());
}

#[tokio::test]
async fn test_idle_eviction_is_idempotent() {
    let browser = FakeBrowser::new();
    let registry = registry(browser.clone(), ScriptedModel::new(&[]));
    let a = registry.create(SessionOptions::default()).await.unwrap();
    let b = registry.create(SessionOptions::default()).await.unwrap();

    assert!(registry.evict_idle(Instant::now()).await.is_empty());

    let later = Instant::now() + Duration::from_secs(31 * 60);
    let mut evicted = registry.evict_idle(later).await;
    evicted.sort_by(|x, y| x.0.cmp(&y.0));
    let mut expected = vec![a.id, b.id];
    expected.sort_by(|x, y| x.0.cmp(&y.0));
    assert_eq!(evicted, expected);
    assert_eq!(browser.closed().len(), 2);

    assert!(registry.evict_idle(later).await.is_empty());
    assert_eq!(browser.closed().len(), 2);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_running_sessions_are_not_evicted() {
    let browser = FakeBrowser::new();
    let (model, gate) = ScriptedModel::gated(&[DONE]);
    let registry = registry(browser.clone(), model.clone());
    let session = registry.create(SessionOptions::default()).await.unwrap();

    let run = registry.spawn_run(&session.id, "slow model").unwrap();
    wait_until(|| model.calls() == 1).await;

    let later = Instant::now() + Duration::from_secs(24 * 60 * 60);
    assert!(registry.evict_idle(later).await.is_empty());
    assert!(registry.get(&session.id).is_ok());

    gate.notify_one();
    assert_eq!(run.await.unwrap().state, SessionState::Completed);
    assert_eq!(registry.evict_idle(later).await, vec![session.id]);
}

#[tokio::test]
async fn test_invalid_task_leaves_session_untouched() {
    let browser = FakeBrowser::new();
    let model = ScriptedModel::new(&[]);
    let registry = registry(browser, model.clone());
    let session = registry.create(SessionOptions::default()).await.unwrap();

    let too_long = "x".repeat(2001);
    for task in ["", "   ", too_long.as_str()] {
        assert!(matches!(
            registry.run(&session.id, task).await,
            Err(AgentError::InvalidTask(_))
        ));
    }
    assert!(matches!(
        registry.run(&SessionId::from("missing"), "task").await,
        Err(AgentError::SessionNotFound(_))
    ));
    assert_eq!(registry.get(&session.id).unwrap().state, SessionState::Created);
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn test_screenshot() {
    let browser = FakeBrowser::new();
    let registry = registry(browser.clone(), ScriptedModel::new(&[]));
    let session = registry.create(SessionOptions::default()).await.unwrap();

    let png = registry.screenshot(&session.id).await.unwrap();
    assert!(png.starts_with(b"\x89PNG"));
    assert!(matches!(
        registry.screenshot(&SessionId::from("missing")).await,
        Err(AgentError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_events_follow_the_run() {
    let browser = FakeBrowser::new();
    let model = ScriptedModel::new(&[SCROLL, DONE]);
    let registry = registry(browser, model);
    let mut events = registry.subscribe();
    let session = registry.create(SessionOptions::default()).await.unwrap();

    registry.run(&session.id, "scroll once").await.unwrap();
    registry.terminate(&session.id).await.unwrap();

    let mut names = Vec::new();
    let mut finished = None;
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
        if let SessionEvent::RunFinished { outcome, .. } = event {
            finished = Some(outcome);
        }
    }
    assert_eq!(names.first(), Some(&"state_changed"));
    assert_eq!(names.iter().filter(|n| **n == "step_started").count(), 2);
    assert_eq!(names.iter().filter(|n| **n == "action_recorded").count(), 2);
    assert_eq!(names.last(), Some(&"session_closed"));
    assert_eq!(finished.unwrap().state, SessionState::Completed);
}

#[tokio::test]
async fn test_new_run_after_failure() {
    let browser = FakeBrowser::new();
    let model = ScriptedModel::new(&["no plan here", DONE]);
    let registry = registry(browser, model);
    let session = registry.create(SessionOptions::default()).await.unwrap();

    let failed = registry.run(&session.id, "first").await.unwrap();
    assert!(matches!(
        failed.reason,
        Some(FailureReason::PlanRejected { .. })
    ));
    assert_eq!(registry.get(&session.id).unwrap().state, SessionState::Failed);

    let outcome = registry.run(&session.id, "second").await.unwrap();
    assert_eq!(outcome.state, SessionState::Completed);
    let info = registry.get(&session.id).unwrap();
    assert_eq!(info.task.as_deref(), Some("second"));
    assert_eq!(info.last_outcome, Some(outcome));
}
