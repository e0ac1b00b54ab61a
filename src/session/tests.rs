use super::*;
use crate::backend::mock::{ExecStyle, MockBackend, MockTransport};
use crate::backend::BackendKind;
use std::sync::Mutex;

fn recorder() -> (StreamCallback, Arc<Mutex<Vec<String>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let inner = log.clone();
    (
        StreamCallback::new(move |chunk| inner.lock().unwrap().push(chunk.to_string())),
        log,
    )
}

async fn session(backend: &MockBackend, config: SessionConfig) -> SandboxSession {
    SandboxSession::builder()
        .backend(Arc::new(backend.clone()))
        .config(config)
        .container("box")
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_empty_batch_rejected() {
    let backend = MockBackend::new();
    let session = session(&backend, SessionConfig::default()).await;

    let err = session
        .run(Vec::<&str>::new(), None, None)
        .await
        .unwrap_err();

    assert!(matches!(err, ExecError::InvalidArgument(_)));
    assert!(backend.resolve_calls().is_empty());
}

#[tokio::test]
async fn test_blank_command_rejected_before_any_execution() {
    let backend = MockBackend::new();
    backend.expect_command("echo ok").finish();
    let session = session(&backend, SessionConfig::default()).await;

    let err = session
        .run(vec!["echo ok", "   "], None, None)
        .await
        .unwrap_err();

    assert!(matches!(err, ExecError::InvalidArgument(ref msg) if msg.contains("command 1")));
    assert!(backend.get_call_history().is_empty());
}

#[tokio::test]
async fn test_commands_run_in_order() {
    let backend = MockBackend::new();
    backend
        .expect_command("first")
        .returns_stdout("1\n")
        .finish();
    backend
        .expect_command("second")
        .returns_stdout("2\n")
        .returns_exit_code(3)
        .finish();
    let session = session(&backend, SessionConfig::default()).await;

    let results = session.run(["first", "second"], None, None).await.unwrap();

    assert_eq!(
        results,
        vec![
            CommandResult::new(0, "1\n", ""),
            CommandResult::new(3, "2\n", ""),
        ]
    );
    let commands: Vec<_> = backend
        .get_call_history()
        .into_iter()
        .map(|call| call.command)
        .collect();
    assert_eq!(commands, vec!["first", "second"]);
}

#[tokio::test]
async fn test_stop_on_error_ends_batch() {
    let backend = MockBackend::new();
    backend.expect_command("fail").returns_exit_code(1).finish();
    backend.expect_command("after").finish();
    let config = SessionConfig {
        stop_on_error: true,
        ..Default::default()
    };
    let session = session(&backend, config).await;

    let results = session.run(["fail", "after"], None, None).await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].exit_code, 1);
    assert!(backend.verify_called("after", 0));
}

#[tokio::test]
async fn test_without_stop_on_error_all_commands_run() {
    let backend = MockBackend::new();
    backend.expect_command("fail").returns_exit_code(1).finish();
    backend.expect_command("after").finish();
    let session = session(&backend, SessionConfig::default()).await;

    let results = session.run(["fail", "after"], None, None).await.unwrap();

    assert_eq!(results.len(), 2);
    assert!(!results[0].success());
    assert!(results[1].success());
}

#[tokio::test]
async fn test_container_resolved_once_per_session() {
    let backend = MockBackend::new();
    backend.expect_command("true").finish();
    let session = session(&backend, SessionConfig::default()).await;

    session.run(["true", "true"], None, None).await.unwrap();
    session.run(["true"], None, None).await.unwrap();

    assert_eq!(backend.resolve_calls(), vec!["box"]);
    assert_eq!(session.handle().await.unwrap().id, "mock-box");
}

#[tokio::test]
async fn test_missing_container_is_error() {
    let backend = MockBackend::new().with_missing_container("box");
    let session = session(&backend, SessionConfig::default()).await;

    let err = session.run(["true"], None, None).await.unwrap_err();
    assert!(matches!(err, ExecError::ContainerNotFound(ref name) if name == "box"));
}

#[tokio::test]
async fn test_same_callbacks_receive_every_command() {
    let backend = MockBackend::new();
    backend
        .expect_command("a")
        .returns_stdout("from a\n")
        .finish();
    backend
        .expect_command("b")
        .returns_stderr("err b\n")
        .returns_stdout("from b\n")
        .finish();
    let session = session(&backend, SessionConfig::default()).await;
    let (on_stdout, out_log) = recorder();
    let (on_stderr, err_log) = recorder();

    session
        .run(["a", "b"], Some(on_stdout), Some(on_stderr))
        .await
        .unwrap();

    assert_eq!(*out_log.lock().unwrap(), vec!["from a\n", "from b\n"]);
    assert_eq!(*err_log.lock().unwrap(), vec!["err b\n"]);
}

#[tokio::test]
async fn test_callback_forces_streaming_without_changing_config() {
    let backend = MockBackend::new();
    backend.expect_command("ls").returns_stdout("x\n").finish();
    let session = session(&backend, SessionConfig::default()).await;
    let (on_stdout, _log) = recorder();

    session.run(["ls"], Some(on_stdout), None).await.unwrap();

    assert_eq!(backend.calls(ExecStyle::Streaming), 1);
    assert_eq!(backend.calls(ExecStyle::Buffered), 0);
    assert!(!session.config().stream);

    session.run(["ls"], None, None).await.unwrap();
    assert_eq!(backend.calls(ExecStyle::Buffered), 1);
}

#[tokio::test]
async fn test_stream_default_without_callbacks() {
    let backend = MockBackend::new();
    backend.expect_command("ls").returns_stdout("x\n").finish();
    let config = SessionConfig {
        stream: true,
        ..Default::default()
    };
    let session = session(&backend, config).await;

    let results = session.run(["ls"], None, None).await.unwrap();

    assert_eq!(results[0].stdout, "x\n");
    assert_eq!(backend.calls(ExecStyle::Streaming), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_becomes_failed_result_and_batch_continues() {
    let backend = MockBackend::new();
    backend
        .expect_command("slow")
        .returns_stdout("started\n")
        .hangs()
        .finish();
    backend.expect_command("next").returns_stdout("ok\n").finish();
    let config = SessionConfig {
        execution_timeout: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    let session = session(&backend, config).await;
    let (on_stdout, log) = recorder();

    let results = session
        .run(["slow", "next"], Some(on_stdout), None)
        .await
        .unwrap();

    assert_eq!(
        results[0],
        CommandResult::new(TIMEOUT_EXIT_CODE, "started\n", "")
    );
    assert_eq!(results[1], CommandResult::new(0, "ok\n", ""));
    assert_eq!(*log.lock().unwrap(), vec!["started\n", "ok\n"]);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_with_stop_on_error_ends_batch() {
    let backend = MockBackend::new();
    backend
        .expect_command("slow")
        .via(MockTransport::Pollable)
        .hangs()
        .finish();
    backend.expect_command("next").finish();
    let config = SessionConfig {
        execution_timeout: Some(Duration::from_millis(300)),
        stop_on_error: true,
        stream: true,
        ..Default::default()
    };
    let session = session(&backend, config).await;

    let results = session.run(["slow", "next"], None, None).await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].exit_code, TIMEOUT_EXIT_CODE);
    assert!(backend.verify_called("next", 0));
}

#[tokio::test]
async fn test_transport_error_propagates() {
    let backend = MockBackend::new();
    backend
        .expect_command("broken")
        .returns_stdout("partial")
        .fails_with("connection reset")
        .finish();
    let session = session(&backend, SessionConfig::default()).await;
    let (on_stdout, log) = recorder();

    let err = session
        .run(["broken"], Some(on_stdout), None)
        .await
        .unwrap_err();

    assert!(matches!(err, ExecError::Transport { .. }));
    assert_eq!(err.partial_output().unwrap().stdout, "partial");
    assert_eq!(*log.lock().unwrap(), vec!["partial"]);
}

#[tokio::test]
async fn test_workdir_from_command_then_config() {
    let backend = MockBackend::new();
    backend.expect_command("pwd").finish();
    let config = SessionConfig {
        workdir: Some("/default".into()),
        ..Default::default()
    };
    let session = session(&backend, config).await;

    session
        .run(vec![CommandSpec::from(("pwd", "/explicit")), "pwd".into()], None, None)
        .await
        .unwrap();

    let workdirs: Vec<_> = backend
        .get_call_history()
        .into_iter()
        .map(|call| call.workdir)
        .collect();
    assert_eq!(
        workdirs,
        vec![Some("/explicit".to_string()), Some("/default".to_string())]
    );
}

#[tokio::test]
async fn test_execute_command_surfaces_timeout() {
    let backend = MockBackend::new();
    backend.expect_command("slow").hangs().finish();
    let config = SessionConfig {
        execution_timeout: Some(Duration::from_millis(20)),
        ..Default::default()
    };
    let session = session(&backend, config).await;

    let err = session
        .execute_command("slow", None, None)
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn test_builder_requires_container_for_remote_backends() {
    let backend = MockBackend::new();
    let result = SandboxSession::builder()
        .backend(Arc::new(backend))
        .build()
        .await;
    assert!(matches!(result, Err(ExecError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_builder_defaults_to_local_backend() {
    let session = SandboxSession::builder()
        .stream(true)
        .stop_on_error(true)
        .build()
        .await
        .unwrap();

    assert_eq!(session.container(), LOCAL_CONTAINER);
    assert!(session.config().stream);
    assert!(session.config().stop_on_error);
    assert_eq!(
        session.handle().await.unwrap().backend,
        BackendKind::Local
    );
}

#[tokio::test]
async fn test_builder_rejects_zero_poll_interval() {
    let result = SandboxSession::builder()
        .backend(Arc::new(MockBackend::new()))
        .container("box")
        .config(SessionConfig {
            poll_interval: Duration::ZERO,
            container: Some("box".into()),
            ..Default::default()
        })
        .build()
        .await;
    assert!(matches!(result, Err(ExecError::Config(_))));
}
