//! ビルドしたバイナリを `-c` で起動して、外から見える振る舞いを確かめる。

use std::process::{Command, Output};

fn kesh(script: &str) -> Output {
    Command::new(env!("CARGO_BIN_EXE_kesh"))
        .arg("-c")
        .arg(script)
        .env_remove("ENV")
        .env("PATH", "/usr/bin:/bin")
        .output()
        .expect("failed to run kesh")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

// ── ステータス ──

#[test]
fn status_of_previous_command() {
    let out = kesh("false; echo $?; true; echo $?");
    assert_eq!(stdout(&out), "1\n0\n");
    assert_eq!(out.status.code(), Some(0));
}

#[test]
fn pipeline_status_is_last_stage() {
    let out = kesh("false | true; echo $?; true | false; echo $?");
    assert_eq!(stdout(&out), "0\n1\n");
}

#[test]
fn pipeline_passes_data_between_stages() {
    let out = kesh("printf 'b\\na\\nc\\n' | sort | head -n 2");
    assert_eq!(stdout(&out), "a\nb\n");
}

#[test]
fn exit_status_reaches_caller() {
    assert_eq!(kesh("exit 7").status.code(), Some(7));
    assert_eq!(kesh("(exit 3); echo $?").status.code(), Some(0));
    assert_eq!(stdout(&kesh("(exit 3); echo $?")), "3\n");
}

#[test]
fn command_not_found_is_127() {
    let out = kesh("no_such_command_for_kesh; echo $?");
    assert_eq!(stdout(&out), "127\n");
    assert!(stderr(&out).contains("no_such_command_for_kesh: not found"));
}

#[test]
fn syntax_error_exits_with_2() {
    let out = kesh("echo before; if then fi");
    assert_eq!(out.status.code(), Some(2));
    assert!(stderr(&out).starts_with("kesh: "));
}

// ── リダイレクト ──

#[test]
fn failed_redirection_reports_and_continues() {
    let out = kesh("echo hi > /nonexistent-kesh-dir/out; echo status $?; echo after");
    assert_eq!(stdout(&out), "status 1\nafter\n");
    let err = stderr(&out);
    assert!(err.starts_with("kesh: "), "{err}");
    assert!(err.contains("/nonexistent-kesh-dir/out"), "{err}");
}

#[test]
fn redirection_is_undone_after_command() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("out.txt");
    let script = format!("echo one > {0}; echo two; cat {0}", file.display());
    let out = kesh(&script);
    assert_eq!(stdout(&out), "two\none\n");
}

#[test]
fn here_document_is_expanded() {
    let out = kesh("X=world\ncat <<EOF\nhello $X\nEOF\necho end");
    assert_eq!(stdout(&out), "hello world\nend\n");
}

#[test]
fn middle_stage_failure_does_not_leak() {
    assert_eq!(stdout(&kesh("true | false | true; echo $?")), "0\n");
    assert_eq!(stdout(&kesh("true | true | false; echo $?")), "1\n");
}

#[test]
fn pipeline_status_ignores_finish_order() {
    // 先に終わった段ではなく、最後の段のステータス
    assert_eq!(stdout(&kesh("(sleep 0.2; exit 3) | true; echo $?")), "0\n");
    assert_eq!(stdout(&kesh("true | (sleep 0.2; exit 3); echo $?")), "3\n");
}

#[test]
fn redirection_leaves_fd_table_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let ok = dir.path().join("ok");
    let bad = dir.path().join("bad");
    let script = format!(
        "ls /proc/self/fd; echo --; true 3>{}; ls /proc/self/fd; echo --; \
         true 3>{} >/nonexistent-kesh-dir/x; ls /proc/self/fd",
        ok.display(),
        bad.display(),
    );
    let out = kesh(&script);
    let text = stdout(&out);
    let tables: Vec<&str> = text.split("--\n").collect();
    assert_eq!(tables.len(), 3, "{text}");
    assert_eq!(tables[0], tables[1], "{text}");
    assert_eq!(tables[0], tables[2], "{text}");
    assert!(ok.exists());
}

// ── 展開・制御構造 ──

#[test]
fn command_substitution_strips_trailing_newlines() {
    let out = kesh("x=$(echo a; echo b); echo \"[$x]\"");
    assert_eq!(stdout(&out), "[a\nb]\n");
}

#[test]
fn functions_loops_and_return() {
    let out = kesh(
        "f() { for i in 1 2 3; do case $i in 2) continue;; esac; echo $i; done; return 5; }\n\
         f; echo $?",
    );
    assert_eq!(stdout(&out), "1\n3\n5\n");
}

#[test]
fn errexit_stops_on_failure() {
    let out = kesh("set -e; false || echo handled; false; echo unreachable");
    assert_eq!(stdout(&out), "handled\n");
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn read_splits_fields() {
    let out = kesh("echo 'a b c' | { read x y; echo \"$y/$x\"; }");
    assert_eq!(stdout(&out), "b c/a\n");
}

// ── ジョブ ──

#[test]
fn background_job_has_one_running_process() {
    let out = kesh("sleep 5 & jobs -l; kill %1");
    let text = stdout(&out);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 1, "{text}");
    assert!(lines[0].starts_with("[1]"), "{text}");
    assert!(lines[0].contains("Running"), "{text}");
    assert!(lines[0].contains("sleep 5"), "{text}");
}

#[test]
fn wait_returns_job_status() {
    let out = kesh("(exit 4) & wait $!; echo $?; wait; echo $?");
    assert_eq!(stdout(&out), "4\n0\n");
}

#[test]
fn wait_for_unknown_pid_is_127() {
    let out = kesh("wait 999999; echo $?");
    assert_eq!(stdout(&out), "127\n");
}

#[test]
fn stopped_job_is_reported_under_monitor() {
    let out = kesh("set -m; sleep 5 & kill -STOP %1; sleep 0.3; jobs; kill -KILL %1");
    let text = stdout(&out);
    assert!(text.contains("Stopped"), "{text}");
    assert!(text.contains("sleep 5"), "{text}");
}

#[test]
fn fg_requires_job_control() {
    let out = kesh("sleep 1 & fg; echo $?; kill %1");
    assert_eq!(stdout(&out), "1\n");
    assert!(stderr(&out).contains("job control not enabled"));
}

#[test]
fn coprocess_round_trip() {
    let out = kesh("cat |& print -p hello; read -p line; echo \"got $line\"; kill %1");
    assert_eq!(stdout(&out), "got hello\n");
}

#[test]
fn stopped_foreground_job_is_resumed_by_fg() {
    let out = kesh("set -m; /bin/sh -c 'kill -STOP $$; echo resumed'; echo $?; fg; echo $?");
    let text = stdout(&out);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.first(), Some(&"147"), "{text}");
    assert!(lines.contains(&"resumed"), "{text}");
    assert_eq!(lines.last(), Some(&"0"), "{text}");
}

#[test]
fn job_listing_shows_source_text() {
    let out = kesh("set -m; /bin/sh -c 'kill -STOP $$'; jobs; kill -KILL %1");
    let text = stdout(&out);
    assert!(text.contains("Stopped"), "{text}");
    assert!(text.contains("/bin/sh -c 'kill -STOP $$'"), "{text}");
}
