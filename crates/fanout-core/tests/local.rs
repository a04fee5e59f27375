//! End-to-end runs through the local transport

use std::path::{Path, PathBuf};

use serde_json::json;

use fanout_core::{ActionOptions, Executor, ExecutorConfig, TaskSpec};
use fanout_exec::{Connection, LocalConnection, Target, TransportKind};

fn scratch() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("fanout-e2e-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write(path: &Path, contents: &str) -> PathBuf {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
    path.to_path_buf()
}

fn executor(concurrency: usize, tmpdir: &Path) -> Executor {
    Executor::new(ExecutorConfig {
        concurrency,
        tmpdir: Some(tmpdir.display().to_string()),
        ..ExecutorConfig::default()
    })
}

fn local(names: &[&str]) -> Vec<Target> {
    names
        .iter()
        .map(|name| Target::new(*name, TransportKind::Local))
        .collect()
}

fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path).unwrap().next().is_none()
}

#[tokio::test]
async fn test_local_command() {
    let base = scratch();
    let exec = executor(2, &base);

    let results = exec
        .run_command(&local(&["l1", "l2", "l3"]), "echo hello", ActionOptions::default())
        .await
        .unwrap();

    assert!(results.ok());
    assert_eq!(results.names(), vec!["l1", "l2", "l3"]);
    for result in &results {
        assert_eq!(result.stdout(), "hello\n");
        assert_eq!(result.exit_code(), Some(0));
    }
}

#[tokio::test]
async fn test_local_command_failure() {
    let base = scratch();
    let exec = executor(2, &base);

    let results = exec
        .run_command(&local(&["l1"]), "echo broken >&2; exit 4", ActionOptions::default())
        .await
        .unwrap();

    let result = &results[0];
    assert_eq!(result.exit_code(), Some(4));
    assert_eq!(result.stderr(), "broken\n");
    assert_eq!(result.error().unwrap().issue_code, "COMMAND_ERROR");
}

#[tokio::test]
async fn test_local_command_with_background_child() {
    let base = scratch();
    let exec = executor(2, &base);
    let started = std::time::Instant::now();

    let results = exec
        .run_command(&local(&["l1"]), "sleep 5 & echo started", ActionOptions::default())
        .await
        .unwrap();

    assert!(started.elapsed() < std::time::Duration::from_secs(3));
    assert!(results.ok());
    assert_eq!(results[0].stdout(), "started\n");
}

#[tokio::test]
async fn test_local_task_error_with_zero_exit() {
    let base = scratch();
    let exec = executor(2, &base);
    let exe = write(
        &scratch().join("soft.sh"),
        "#!/bin/sh\necho '{\"_error\": {\"kind\": \"demo/soft\", \"msg\": \"declined\"}}'\n",
    );

    let results = exec
        .run_task(
            &local(&["l1"]),
            TaskSpec::new("demo::soft", &exe),
            serde_json::Map::new(),
            ActionOptions::default(),
        )
        .await
        .unwrap();

    assert!(!results.ok());
    assert_eq!(results[0].error().unwrap().kind, "demo/soft");
}

#[tokio::test]
async fn test_local_command_environment() {
    let base = scratch();
    let exec = executor(2, &base);
    let mut options = ActionOptions::default();
    options.env.insert("GREETING".to_string(), "hi there".to_string());

    let results = exec
        .run_command(&local(&["l1"]), "printenv GREETING", options)
        .await
        .unwrap();

    assert_eq!(results[0].stdout(), "hi there\n");
}

#[tokio::test]
async fn test_local_script_with_arguments() {
    let base = scratch();
    let exec = executor(2, &base);
    let script = write(
        &scratch().join("args.sh"),
        "#!/bin/sh\necho \"$#:$1:$2\"\n",
    );

    let results = exec
        .run_script(
            &local(&["l1", "l2"]),
            &script,
            vec!["one".to_string(), "two words".to_string()],
            ActionOptions::default(),
        )
        .await
        .unwrap();

    assert!(results.ok(), "{:?}", results.error_set().first().map(|r| r.error()));
    for result in &results {
        assert_eq!(result.stdout(), "2:one:two words\n");
    }
    assert!(is_empty_dir(&base));
}

#[tokio::test]
async fn test_local_task_parameters() {
    let base = scratch();
    let exec = executor(2, &base);
    let exe = write(
        &scratch().join("greet.sh"),
        "#!/bin/sh\nread -r input\nprintf '{\"env\": \"%s\", \"stdin\": %s}\\n' \"$PT_name\" \"$input\"\n",
    );
    let arguments = json!({"name": "web"});

    let results = exec
        .run_task(
            &local(&["l1"]),
            TaskSpec::new("demo::greet", &exe),
            arguments.as_object().unwrap().clone(),
            ActionOptions::default(),
        )
        .await
        .unwrap();

    assert!(results.ok(), "{:?}", results[0].error());
    let value = results[0].value();
    assert_eq!(value["env"], json!("web"));
    assert_eq!(value["stdin"], json!({"name": "web"}));
    assert!(is_empty_dir(&base));
}

#[tokio::test]
async fn test_local_task_reports_error() {
    let base = scratch();
    let exec = executor(2, &base);
    let exe = write(
        &scratch().join("fail.sh"),
        "#!/bin/sh\necho '{\"_error\": {\"kind\": \"demo/oops\", \"msg\": \"nope\"}}'\nexit 1\n",
    );

    let results = exec
        .run_task(
            &local(&["l1"]),
            TaskSpec::new("demo::fail", &exe),
            serde_json::Map::new(),
            ActionOptions::default(),
        )
        .await
        .unwrap();

    let error = results[0].error().unwrap();
    assert_eq!(error.kind, "demo/oops");
    assert_eq!(error.msg, "nope");
}

#[tokio::test]
async fn test_local_upload_and_download() {
    let base = scratch();
    let exec = executor(2, &base);
    let work = scratch();
    let source = write(&work.join("app.conf"), "port = 80\n");
    let remote = work.join("installed.conf");

    let results = exec
        .upload_file(
            &local(&["l1"]),
            &source,
            remote.display().to_string(),
            ActionOptions::default(),
        )
        .await
        .unwrap();
    assert!(results.ok(), "{:?}", results[0].error());
    assert_eq!(std::fs::read_to_string(&remote).unwrap(), "port = 80\n");
    assert!(is_empty_dir(&base));

    let out = work.join("out");
    let results = exec
        .download_file(
            &local(&["l1", "l 2"]),
            remote.display().to_string(),
            &out,
            ActionOptions::default(),
        )
        .await
        .unwrap();
    assert!(results.ok(), "{:?}", results.error_set().first().map(|r| r.error()));
    assert_eq!(
        std::fs::read_to_string(out.join("l1/installed.conf")).unwrap(),
        "port = 80\n"
    );
    assert_eq!(
        std::fs::read_to_string(out.join("l_2/installed.conf")).unwrap(),
        "port = 80\n"
    );
}

#[tokio::test]
async fn test_local_cleanup_disabled_keeps_tempdir() {
    let base = scratch();
    let exec = Executor::new(ExecutorConfig {
        tmpdir: Some(base.display().to_string()),
        cleanup: Some(false),
        ..ExecutorConfig::default()
    });
    let script = write(&scratch().join("noop.sh"), "#!/bin/sh\ntrue\n");

    let results = exec
        .run_script(&local(&["l1"]), &script, vec![], ActionOptions::default())
        .await
        .unwrap();

    assert!(results.ok());
    assert!(!is_empty_dir(&base));
}

#[tokio::test]
async fn test_local_reconnect_after_disconnect() {
    let mut conn = LocalConnection::new(Target::new("l1", TransportKind::Local));
    conn.connect().await.unwrap();
    conn.disconnect().await.unwrap();
    conn.disconnect().await.unwrap();

    let mut fresh = LocalConnection::new(Target::new("l1", TransportKind::Local));
    fresh.connect().await.unwrap();
    let output = fresh.execute("echo again", None).await.unwrap();
    assert_eq!(output.stdout, b"again\n");
}
