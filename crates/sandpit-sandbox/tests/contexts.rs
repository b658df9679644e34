//! Integration tests for isolated contexts, the relay and the preview slot.

use std::sync::Arc;
use std::time::Duration;

use sandpit_sandbox::relay::ConsoleLevel;
use sandpit_sandbox::{
    Capabilities, ConsoleAggregator, ContextConfig, ContextManager, DocumentBuilder,
    ExecutionMode, Preview, RelayEventKind, RelayMessage, RelaySubscription, SandboxError,
    SessionId, SessionStatus, SourceBundle,
};

fn manager() -> Arc<ContextManager> {
    Arc::new(ContextManager::new(ContextConfig::default()))
}

/// Collects console messages until the document announces it has loaded.
async fn console_until_ready(relay: &mut RelaySubscription) -> Vec<(ConsoleLevel, String)> {
    let mut lines = Vec::new();
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), relay.recv())
            .await
            .expect("document never became ready")
            .expect("relay closed before ready");
        match message {
            RelayMessage::Ready => return lines,
            RelayMessage::Console { level, message, .. } => lines.push((level, message)),
            _ => {}
        }
    }
}

async fn wait_for_events(log: &ConsoleAggregator, session: SessionId, count: usize) {
    for _ in 0..250 {
        if log.for_session(session).len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {count} events, got {:?}", log.entries());
}

#[tokio::test]
async fn globals_do_not_leak_between_contexts() {
    let contexts = manager();
    let builder = DocumentBuilder::default();

    let first = builder
        .build(
            &SourceBundle::script(ExecutionMode::VanillaDom, "window.leaked = 42; console.log(typeof leaked);"),
            Capabilities::live_preview(),
        )
        .unwrap();
    let (mut handle, mut relay) = contexts.launch(&first).await.unwrap();
    let lines = console_until_ready(&mut relay).await;
    assert_eq!(lines, [(ConsoleLevel::Log, "number".to_string())]);
    handle.dispose();

    let second = builder
        .build(
            &SourceBundle::script(ExecutionMode::VanillaDom, "console.log(typeof leaked);"),
            Capabilities::live_preview(),
        )
        .unwrap();
    let (_handle, mut relay) = contexts.launch(&second).await.unwrap();
    let lines = console_until_ready(&mut relay).await;
    assert_eq!(lines, [(ConsoleLevel::Log, "undefined".to_string())]);
}

#[tokio::test]
async fn console_messages_keep_emission_order() {
    let contexts = manager();
    let document = DocumentBuilder::default()
        .build(
            &SourceBundle::script(
                ExecutionMode::VanillaDom,
                "console.log('a'); console.warn('b'); console.error('c');",
            ),
            Capabilities::live_preview(),
        )
        .unwrap();
    let (_handle, mut relay) = contexts.launch(&document).await.unwrap();
    let lines = console_until_ready(&mut relay).await;
    assert_eq!(
        lines,
        [
            (ConsoleLevel::Log, "a".to_string()),
            (ConsoleLevel::Warn, "b".to_string()),
            (ConsoleLevel::Error, "c".to_string()),
        ]
    );
}

#[tokio::test]
async fn uncaught_errors_reach_the_host() {
    let contexts = manager();
    let document = DocumentBuilder::default()
        .build(
            &SourceBundle::script(ExecutionMode::VanillaDom, "console.log('before'); undefinedCall();"),
            Capabilities::live_preview(),
        )
        .unwrap();
    let (_handle, mut relay) = contexts.launch(&document).await.unwrap();
    let lines = console_until_ready(&mut relay).await;
    assert_eq!(lines[0], (ConsoleLevel::Log, "before".to_string()));
    assert!(
        lines[1..]
            .iter()
            .any(|(level, text)| *level == ConsoleLevel::Error && text.contains("undefinedCall")),
        "{lines:?}"
    );
}

#[tokio::test]
async fn timers_run_after_load() {
    let contexts = manager();
    let document = DocumentBuilder::default()
        .build(
            &SourceBundle::script(
                ExecutionMode::VanillaDom,
                "setTimeout(() => console.log('later'), 10); console.log('now');",
            ),
            Capabilities::live_preview(),
        )
        .unwrap();
    let (_handle, mut relay) = contexts.launch(&document).await.unwrap();
    assert_eq!(console_until_ready(&mut relay).await, [(ConsoleLevel::Log, "now".to_string())]);

    let next = tokio::time::timeout(Duration::from_secs(5), relay.recv()).await.unwrap();
    assert!(
        matches!(next, Some(RelayMessage::Console { ref message, .. }) if message == "later"),
        "{next:?}"
    );
}

#[tokio::test]
async fn dispose_is_idempotent() {
    let contexts = manager();
    let document = DocumentBuilder::default()
        .build(
            &SourceBundle::script(ExecutionMode::VanillaDom, "setInterval(() => console.log('tick'), 5);"),
            Capabilities::live_preview(),
        )
        .unwrap();
    let (mut handle, mut relay) = contexts.launch(&document).await.unwrap();
    assert_eq!(contexts.live_contexts(), 1);

    handle.dispose();
    handle.dispose();
    assert!(handle.is_disposed());
    assert_eq!(contexts.live_contexts(), 0);
    assert!(relay.is_detached());
    assert!(relay.recv().await.is_none());
    assert!(matches!(
        handle.invoke_test(&serde_json::json!(1)),
        Err(SandboxError::ContextClosed)
    ));

    drop(handle);
    assert_eq!(contexts.live_contexts(), 0);
}

#[tokio::test]
async fn live_context_limit_is_enforced() {
    let contexts = Arc::new(ContextManager::new(ContextConfig {
        max_live_contexts: 1,
        ..Default::default()
    }));
    let document = DocumentBuilder::default()
        .build(
            &SourceBundle::script(ExecutionMode::VanillaDom, "1;"),
            Capabilities::live_preview(),
        )
        .unwrap();

    let (mut first, _relay) = contexts.launch(&document).await.unwrap();
    let err = contexts.launch(&document).await.unwrap_err();
    assert!(matches!(err, SandboxError::ConcurrencyLimit { max: 1 }));

    first.dispose();
    assert!(contexts.launch(&document).await.is_ok());
}

#[tokio::test]
async fn preview_keeps_at_most_one_live_context() {
    let contexts = manager();
    let log = Arc::new(ConsoleAggregator::new());
    let mut preview = Preview::new(DocumentBuilder::default(), contexts.clone(), log.clone());

    let first = preview
        .render(&SourceBundle::script(ExecutionMode::VanillaDom, "console.log('first');"))
        .await;
    assert_eq!(contexts.live_contexts(), 1);

    let second = preview
        .render(&SourceBundle::script(ExecutionMode::VanillaDom, "console.log('second');"))
        .await;
    assert_eq!(contexts.live_contexts(), 1);
    assert_ne!(first, second);

    wait_for_events(&log, second, 1).await;
    let messages: Vec<_> = log
        .for_session(second)
        .into_iter()
        .filter_map(|event| match event.kind {
            RelayEventKind::Log { message } => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(messages, ["second"]);

    preview.dispose();
    assert_eq!(contexts.live_contexts(), 0);
    assert_eq!(preview.session().map(|s| s.status()), Some(SessionStatus::Completed));

    drop(preview);
    assert_eq!(contexts.live_contexts(), 0);
}

#[tokio::test]
async fn superseded_preview_stops_reporting() {
    let log = Arc::new(ConsoleAggregator::new());
    let mut preview = Preview::new(DocumentBuilder::default(), manager(), log.clone());

    let first = preview
        .render(&SourceBundle::script(
            ExecutionMode::VanillaDom,
            "setInterval(() => console.log('first'), 5);",
        ))
        .await;
    wait_for_events(&log, first, 3).await;

    let reported_before = log.for_session(first).len();
    let second = preview
        .render(&SourceBundle::script(
            ExecutionMode::VanillaDom,
            "setInterval(() => console.log('second'), 5);",
        ))
        .await;
    wait_for_events(&log, second, 3).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(log.for_session(first).len(), reported_before);
    let entries = log.entries();
    let switch = entries
        .iter()
        .position(|entry| entry.session_id == second)
        .expect("second session reported");
    assert!(entries[switch..].iter().all(|entry| entry.session_id != first));
}

#[tokio::test]
async fn reserve_waits_for_a_free_slot() {
    let contexts = Arc::new(ContextManager::new(ContextConfig {
        max_live_contexts: 1,
        ..Default::default()
    }));
    let document = DocumentBuilder::default()
        .build(
            &SourceBundle::script(ExecutionMode::VanillaDom, "1;"),
            Capabilities::live_preview(),
        )
        .unwrap();
    let (mut first, _relay) = contexts.launch(&document).await.unwrap();

    let waiting = {
        let contexts = contexts.clone();
        tokio::spawn(async move { contexts.reserve().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiting.is_finished());

    first.dispose();
    let slot = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let (_second, _relay) = contexts.launch_reserved(slot, &document).await.unwrap();
    assert_eq!(contexts.live_contexts(), 1);
}

#[tokio::test]
async fn preview_relays_in_order() {
    let log = Arc::new(ConsoleAggregator::new());
    let mut preview = Preview::new(DocumentBuilder::default(), manager(), log.clone());
    let session = preview
        .render(&SourceBundle::script(ExecutionMode::VanillaDom, "console.log('a'); console.log('b');"))
        .await;

    wait_for_events(&log, session, 2).await;
    let messages: Vec<_> = log
        .for_session(session)
        .into_iter()
        .filter_map(|event| match event.kind {
            RelayEventKind::Log { message } => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(messages, ["a", "b"]);

    for _ in 0..250 {
        if preview.session().map(|s| s.status()) == Some(SessionStatus::Running) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session never reported ready");
}

#[tokio::test]
async fn pure_logic_source_survives_embedding() {
    let log = Arc::new(ConsoleAggregator::new());
    let mut preview = Preview::new(DocumentBuilder::default(), manager(), log.clone());
    let text = r#"quote " apostrophe ' backtick ` slash \ close </script> line
break"#;
    let script = format!("console.log({});", serde_json::to_string(text).unwrap());
    let session = preview
        .render(&SourceBundle::script(ExecutionMode::PureLogic, script))
        .await;

    wait_for_events(&log, session, 1).await;
    let events = log.for_session(session);
    assert!(
        matches!(&events[0].kind, RelayEventKind::Log { message } if message == text),
        "{events:?}"
    );
}

#[tokio::test]
async fn proctoring_reports_arrive_as_violations() {
    let log = Arc::new(ConsoleAggregator::new());
    let mut preview =
        Preview::new(DocumentBuilder::default(), manager(), log.clone()).with_proctoring();
    let session = preview
        .render(&SourceBundle::script(
            ExecutionMode::VanillaDom,
            "window.proctoring.report('copy-paste', 'high', 'pasted 200 lines');",
        ))
        .await;

    wait_for_events(&log, session, 1).await;
    let events = log.for_session(session);
    assert!(
        matches!(
            &events[0].kind,
            RelayEventKind::Violation { violation_type, severity, .. }
                if violation_type == "copy-paste" && severity == "high"
        ),
        "{events:?}"
    );
}
