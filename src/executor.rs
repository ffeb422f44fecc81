//! コマンド実行: コマンドツリーのディスパッチ、ジョブの起動と待機、コマンド置換。
//!
//! | ノード | 実行方法 |
//! |--------|----------|
//! | 単純コマンド | 特殊ビルトイン → 関数 → 通常ビルトイン → `PATH` 検索の順に解決 |
//! | パイプライン | 段ごとに fork、N−1 本のパイプで接続、最終段のステータス |
//! | `( )` | 1 段のジョブとして fork（既に子なら fork しない） |
//! | `&` / `\|&` | バックグラウンドジョブ / コプロセス |
//! | その他の複合コマンド | シェル内で実行。ノードのリダイレクトはスコープ中だけ有効 |
//!
//! 外部コマンドは [`ExecFlags::exec`] が立っていれば（既に子プロセスの中なら）
//! fork せずにその場で exec する。それ以外はジョブとして起動して
//! フォアグラウンドで待つ。

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::time::Instant;

use libc::pid_t;

use crate::ast::{CaseArm, Command, CommandKind, Connector, Redirect, SimpleCommand};
use crate::builtins::{self, Builtin};
use crate::error::{Divert, Flow, ShellError};
use crate::expand;
use crate::fd::{self, Pipe, SavedFds};
use crate::glob;
use crate::job::{self, JobFlags};
use crate::launch::{self, ChildSetup, Forked};
use crate::parser;
use crate::redir;
use crate::shell::Shell;

/// ノードの実行文脈。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecFlags {
    /// 既に子プロセスの中。外部コマンドは fork せずに exec する。
    pub exec: bool,
    /// 条件として実行中。`set -e` で終了しない。
    pub errok: bool,
}

impl ExecFlags {
    const CHILD: ExecFlags = ExecFlags {
        exec: true,
        errok: false,
    };
    const COND: ExecFlags = ExecFlags {
        exec: false,
        errok: true,
    };
}

/// ノードを実行する。
pub fn execute(shell: &mut Shell, node: &Command, flags: ExecFlags) -> Flow {
    if shell.opts.notify && shell.opts.interactive {
        shell.notify_jobs();
    } else {
        shell.reap_jobs();
    }

    let status = match &node.kind {
        CommandKind::Simple(sc) => simple(shell, node, sc, flags)?,
        CommandKind::Pipeline(stages) => pipeline(shell, node, stages)?,
        CommandKind::Subshell(body) => subshell(shell, node, body, flags)?,
        CommandKind::Background(inner) => background(shell, node, inner)?,
        CommandKind::Coprocess(inner) => coprocess(shell, inner)?,
        _ => scoped(shell, &node.redirects, |sh| compound(sh, node, flags))?,
    };
    shell.last_status = status;

    let checked = matches!(
        node.kind,
        CommandKind::Simple(_) | CommandKind::Pipeline(_) | CommandKind::Subshell(_)
    );
    if checked && status != 0 && shell.opts.errexit && !flags.errok {
        tracing::debug!(status, "errexit");
        return Err(Divert::Exit(status));
    }
    Ok(status)
}

/// 実行結果を終了ステータスにする（子プロセスの終了、トップレベル）。
pub fn status_of(shell: &Shell, flow: Flow) -> i32 {
    match flow {
        Ok(status) | Err(Divert::Exit(status)) | Err(Divert::Return(status)) => status,
        Err(Divert::Break(_)) | Err(Divert::Continue(_)) => shell.last_status,
        Err(Divert::Abort(msg)) => {
            eprintln!("kesh: {}", msg);
            70
        }
    }
}

/// スクリプト文字列を 1 行分ずつパースして実行する（`.`、`eval`、`-c`、スクリプトファイル）。
///
/// 構文エラーは診断を出してステータス 2。非対話シェルならそこで終了する。
pub fn run_source(shell: &mut Shell, text: &str) -> Flow {
    let mut parser = parser::Parser::new(text);
    let mut status = 0;
    loop {
        if !shell.opts.interactive {
            shell.notify_jobs();
        }
        match parser.next_complete() {
            Ok(Some(node)) => status = execute(shell, &node, ExecFlags::default())?,
            Ok(None) => return Ok(status),
            Err(e) => {
                eprintln!("kesh: {}", e);
                shell.last_status = 2;
                return if shell.opts.interactive {
                    Ok(2)
                } else {
                    Err(Divert::Exit(2))
                };
            }
        }
    }
}

// ── エラー処理 ───────────────────────────────────────────────────────

/// 内部エラーなら中断に変換する。
fn check_internal(e: ShellError) -> Result<ShellError, Divert> {
    match e {
        ShellError::Job(je) if je.is_internal() => Err(je.into()),
        e => Ok(e),
    }
}

/// 診断を出してエラーのステータスを返す。非対話シェルの fork 失敗は致命的。
fn fail(shell: &Shell, e: ShellError) -> Flow {
    let e = check_internal(e)?;
    eprintln!("kesh: {}", e);
    let status = e.exit_status();
    if matches!(e, ShellError::Fork(_)) && !shell.opts.interactive {
        return Err(Divert::Exit(status));
    }
    Ok(status)
}

/// 展開エラー。非対話シェルは終了する。
fn expansion_failed(shell: &Shell, e: ShellError) -> Flow {
    let e = check_internal(e)?;
    eprintln!("kesh: {}", e);
    if shell.opts.interactive {
        Ok(1)
    } else {
        Err(Divert::Exit(1))
    }
}

// ── リダイレクトのスコープ ───────────────────────────────────────────

/// `redirs` を適用して `f` を実行し、元の fd に戻す。適用に失敗したらステータス 1。
fn scoped(shell: &mut Shell, redirs: &[Redirect], f: impl FnOnce(&mut Shell) -> Flow) -> Flow {
    if redirs.is_empty() {
        return f(shell);
    }
    let _ = io::stdout().flush();
    let mut saved = SavedFds::new();
    if let Err(e) = redir::apply(shell, redirs, &mut saved) {
        let e = check_internal(e)?;
        eprintln!("kesh: {}", e);
        return Ok(1);
    }
    let result = f(shell);
    let _ = io::stdout().flush();
    drop(saved);
    result
}

// ── 単純コマンド ─────────────────────────────────────────────────────

fn simple(shell: &mut Shell, node: &Command, sc: &SimpleCommand, flags: ExecFlags) -> Flow {
    let redirs = &node.redirects[..];
    shell.subst_status = None;
    let argv = match expand::expand_words(shell, &sc.words) {
        Ok(argv) => argv,
        Err(e) => return expansion_failed(shell, e),
    };
    let mut assigns = Vec::with_capacity(sc.assignments.len());
    for a in &sc.assignments {
        match expand::expand_word(shell, &a.value) {
            Ok(v) => assigns.push((a.name.clone(), v)),
            Err(e) => return expansion_failed(shell, e),
        }
    }
    if shell.opts.xtrace {
        xtrace(shell, &assigns, &argv);
    }

    let Some(name) = argv.first() else {
        for (k, v) in &assigns {
            if let Err(e) = shell.assign(k, v) {
                return expansion_failed(shell, e);
            }
        }
        let status = shell.subst_status.unwrap_or(0);
        return scoped(shell, redirs, |_| Ok(status));
    };

    if let Some(builtin) = builtins::special(name) {
        return special(shell, builtin, &argv, &assigns, redirs);
    }
    if let Some(body) = shell.functions.get(name).cloned() {
        return with_temp(shell, &assigns, redirs, |sh| call_function(sh, &body, &argv));
    }
    if let Some(builtin) = builtins::regular(name) {
        return with_temp(shell, &assigns, redirs, |sh| builtin(sh, &argv));
    }
    external(shell, node, &argv, &assigns, flags)
}

fn xtrace(shell: &Shell, assigns: &[(String, String)], argv: &[String]) {
    let ps4 = shell.vars.get("PS4").unwrap_or("+ ");
    let words: Vec<String> = assigns
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .chain(argv.iter().cloned())
        .collect();
    eprintln!("{}{}", ps4, words.join(" "));
}

/// 特殊ビルトイン: 代入は恒久的。非対話シェルではリダイレクト失敗で終了する。
fn special(
    shell: &mut Shell,
    builtin: Builtin,
    argv: &[String],
    assigns: &[(String, String)],
    redirs: &[Redirect],
) -> Flow {
    for (k, v) in assigns {
        if let Err(e) = shell.assign(k, v) {
            return expansion_failed(shell, e);
        }
    }
    let _ = io::stdout().flush();
    let mut saved = SavedFds::new();
    if let Err(e) = redir::apply(shell, redirs, &mut saved) {
        let e = check_internal(e)?;
        eprintln!("kesh: {}", e);
        if !shell.opts.interactive {
            return Err(Divert::Exit(1));
        }
        return Ok(1);
    }

    if argv.len() == 1 && argv[0] == "exec" {
        saved.forget();
        for r in redirs.iter().filter(|r| r.fd > 2) {
            if let Err(e) = fd::set_cloexec(r.fd, true) {
                tracing::debug!(fd = r.fd, error = %e, "exec: cloexec failed");
            }
        }
        return Ok(0);
    }

    let result = builtin(shell, argv);
    let _ = io::stdout().flush();
    drop(saved);
    result
}

/// 関数・通常ビルトイン: 前置代入は実行中だけ有効。
fn with_temp(
    shell: &mut Shell,
    assigns: &[(String, String)],
    redirs: &[Redirect],
    f: impl FnOnce(&mut Shell) -> Flow,
) -> Flow {
    let scope = match shell.vars.push_temp(assigns, false) {
        Ok(scope) => scope,
        Err(e) => return expansion_failed(shell, e),
    };
    let result = scoped(shell, redirs, f);
    shell.vars.pop_temp(scope);
    result
}

/// 関数呼び出し。位置パラメータとループの入れ子を退避し、`return` をステータスにする。
fn call_function(shell: &mut Shell, body: &Command, argv: &[String]) -> Flow {
    let params = std::mem::replace(&mut shell.vars.positional, argv[1..].to_vec());
    let loops = std::mem::replace(&mut shell.loop_depth, 0);
    shell.func_depth += 1;
    let result = execute(shell, body, ExecFlags::default());
    shell.func_depth -= 1;
    shell.loop_depth = loops;
    shell.vars.positional = params;
    match result {
        Err(Divert::Return(status)) => Ok(status),
        other => other,
    }
}

/// 外部コマンド。
fn external(
    shell: &mut Shell,
    node: &Command,
    argv: &[String],
    assigns: &[(String, String)],
    flags: ExecFlags,
) -> Flow {
    let redirs = &node.redirects[..];
    let search = assigns
        .iter()
        .rev()
        .find(|(k, _)| k == "PATH")
        .map(|(_, v)| v.clone())
        .unwrap_or_else(|| shell.path());
    let Some(path) = shell.path_cache.lookup(&argv[0], &search) else {
        let err = ShellError::NotFound(argv[0].clone());
        return scoped(shell, redirs, |_| {
            eprintln!("kesh: {}", err);
            Ok(err.exit_status())
        });
    };

    if flags.exec {
        return Ok(exec_in_place(shell, &path, argv, assigns, redirs));
    }
    // ジョブ表示は展開前のソース表記
    let text = node.to_string();
    let spec = JobSpec::new(Mode::Foreground, text.clone(), vec![text]);
    match start_job(shell, spec, |sh, _| exec_in_place(sh, &path, argv, assigns, redirs)) {
        Ok(n) => wait_job(shell, n),
        Err(e) => fail(shell, e),
    }
}

/// 子プロセスの中でリダイレクトと前置代入を適用し、exec する。失敗したらそのステータス。
fn exec_in_place(
    shell: &mut Shell,
    path: &Path,
    argv: &[String],
    assigns: &[(String, String)],
    redirs: &[Redirect],
) -> i32 {
    let _ = io::stdout().flush();
    let mut saved = SavedFds::new();
    if let Err(e) = redir::apply(shell, redirs, &mut saved) {
        eprintln!("kesh: {}", e);
        return 1;
    }
    saved.forget();
    if let Err(e) = shell.vars.push_temp(assigns, true) {
        eprintln!("kesh: {}", e);
        return 1;
    }
    let err = launch::exec(shell, path, argv);
    eprintln!("kesh: {}", err);
    err.exit_status()
}

// ── 複合コマンド ─────────────────────────────────────────────────────

fn compound(shell: &mut Shell, node: &Command, flags: ExecFlags) -> Flow {
    match &node.kind {
        CommandKind::List(items) => {
            let mut status = 0;
            for (i, item) in items.iter().enumerate() {
                let item_flags = ExecFlags {
                    exec: flags.exec && i + 1 == items.len(),
                    errok: flags.errok,
                };
                status = execute(shell, item, item_flags)?;
            }
            Ok(status)
        }
        CommandKind::AndOr(left, connector, right) => {
            let status = execute(shell, left, ExecFlags::COND)?;
            let go = match connector {
                Connector::And => status == 0,
                Connector::Or => status != 0,
            };
            if go {
                execute(shell, right, flags)
            } else {
                Ok(status)
            }
        }
        CommandKind::Not(inner) => {
            let status = execute(shell, inner, ExecFlags::COND)?;
            Ok(if status == 0 { 1 } else { 0 })
        }
        CommandKind::For { var, words, body } => {
            let items = match loop_words(shell, words.as_deref()) {
                Ok(items) => items,
                Err(e) => return expansion_failed(shell, e),
            };
            in_loop(shell, |sh| for_items(sh, var, &items, body))
        }
        CommandKind::Select { var, words, body } => {
            let items = match loop_words(shell, words.as_deref()) {
                Ok(items) => items,
                Err(e) => return expansion_failed(shell, e),
            };
            if items.is_empty() {
                return Ok(0);
            }
            in_loop(shell, |sh| select_items(sh, var, &items, body))
        }
        CommandKind::While { until, cond, body } => {
            in_loop(shell, |sh| while_body(sh, *until, cond, body))
        }
        CommandKind::If {
            cond,
            then_part,
            else_part,
        } => {
            if execute(shell, cond, ExecFlags::COND)? == 0 {
                execute(shell, then_part, flags)
            } else if let Some(else_part) = else_part {
                execute(shell, else_part, flags)
            } else {
                Ok(0)
            }
        }
        CommandKind::Case { word, arms } => case(shell, word, arms, flags),
        CommandKind::Brace(body) => execute(shell, body, flags),
        CommandKind::FunctionDef { name, body } => {
            tracing::debug!(name = %name, "function defined");
            shell.functions.insert(name.clone(), body.clone());
            Ok(0)
        }
        CommandKind::Time(inner) => time(shell, inner.as_deref()),
        CommandKind::Simple(_)
        | CommandKind::Pipeline(_)
        | CommandKind::Subshell(_)
        | CommandKind::Background(_)
        | CommandKind::Coprocess(_) => execute(shell, node, flags),
    }
}

fn case(shell: &mut Shell, word: &str, arms: &[CaseArm], flags: ExecFlags) -> Flow {
    let subject = match expand::expand_word(shell, word) {
        Ok(s) => s,
        Err(e) => return expansion_failed(shell, e),
    };
    for arm in arms {
        for pattern in &arm.patterns {
            let pattern = match expand::expand_pattern(shell, pattern) {
                Ok(p) => p,
                Err(e) => return expansion_failed(shell, e),
            };
            if glob::matches_pattern(&pattern, &subject) {
                return match &arm.body {
                    Some(body) => execute(shell, body, flags),
                    None => Ok(0),
                };
            }
        }
    }
    Ok(0)
}

// ── ループ ───────────────────────────────────────────────────────────

/// ループ本体 1 回分の結果。
enum Step {
    Next(i32),
    Stop,
}

/// `for` / `select` の対象。`in` がなければ位置パラメータ。
fn loop_words(shell: &mut Shell, words: Option<&[String]>) -> Result<Vec<String>, ShellError> {
    match words {
        Some(words) => expand::expand_words(shell, words),
        None => Ok(shell.vars.positional.clone()),
    }
}

fn in_loop(shell: &mut Shell, f: impl FnOnce(&mut Shell) -> Flow) -> Flow {
    shell.loop_depth += 1;
    let result = f(shell);
    shell.loop_depth -= 1;
    result
}

/// ループ内で 1 ノードを実行し、`break` / `continue` を 1 段分消費する。
/// 対話シェルで SIGINT を受けていたら全ループを抜ける。
fn loop_step(shell: &mut Shell, node: &Command, flags: ExecFlags) -> Result<Step, Divert> {
    let flow = if shell.opts.interactive && shell.reaper.take_interrupt() {
        Err(Divert::Break(shell.loop_depth.max(1)))
    } else {
        execute(shell, node, flags)
    };
    match flow {
        Ok(status) => Ok(Step::Next(status)),
        Err(Divert::Break(n)) if n <= 1 => Ok(Step::Stop),
        Err(Divert::Break(n)) => Err(Divert::Break(n - 1)),
        Err(Divert::Continue(n)) if n <= 1 => Ok(Step::Next(0)),
        Err(Divert::Continue(n)) => Err(Divert::Continue(n - 1)),
        Err(d) => Err(d),
    }
}

fn for_items(shell: &mut Shell, var: &str, items: &[String], body: &Command) -> Flow {
    let mut status = 0;
    for item in items {
        if let Err(e) = shell.assign(var, item) {
            return expansion_failed(shell, e);
        }
        match loop_step(shell, body, ExecFlags::default())? {
            Step::Next(s) => status = s,
            Step::Stop => return Ok(0),
        }
    }
    Ok(status)
}

fn while_body(shell: &mut Shell, until: bool, cond: &Command, body: &Command) -> Flow {
    let mut status = 0;
    loop {
        let c = match loop_step(shell, cond, ExecFlags::COND)? {
            Step::Next(c) => c,
            Step::Stop => return Ok(0),
        };
        if (c == 0) == until {
            return Ok(status);
        }
        match loop_step(shell, body, ExecFlags::default())? {
            Step::Next(s) => status = s,
            Step::Stop => return Ok(0),
        }
    }
}

/// `select` のメニュー（番号付き、1 行 1 項目）。
fn select_menu(items: &[String]) -> String {
    let width = items.len().to_string().len();
    items
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{:>width$}) {}\n", i + 1, item, width = width))
        .collect()
}

fn select_items(shell: &mut Shell, var: &str, items: &[String], body: &Command) -> Flow {
    let mut status = 0;
    let mut show_menu = true;
    loop {
        if show_menu {
            eprint!("{}", select_menu(items));
        }
        eprint!("{}", shell.vars.get("PS3").unwrap_or("#? "));
        let line = match builtins::read_line(0) {
            Ok(Some(line)) => line,
            Ok(None) => {
                eprintln!();
                return Ok(status);
            }
            Err(e) => {
                eprintln!("kesh: select: {}", e);
                return Ok(1);
            }
        };
        if let Err(e) = shell.assign("REPLY", &line) {
            return expansion_failed(shell, e);
        }
        let reply = line.trim();
        if reply.is_empty() {
            show_menu = true;
            continue;
        }
        show_menu = false;
        let choice = reply
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| items.get(i))
            .map(String::as_str)
            .unwrap_or("");
        if let Err(e) = shell.assign(var, choice) {
            return expansion_failed(shell, e);
        }
        match loop_step(shell, body, ExecFlags::default())? {
            Step::Next(s) => status = s,
            Step::Stop => return Ok(0),
        }
    }
}

// ── time ─────────────────────────────────────────────────────────────

fn time(shell: &mut Shell, inner: Option<&Command>) -> Flow {
    let Some(inner) = inner else {
        eprint!("{}", builtins::times_report());
        return Ok(0);
    };
    let start = Instant::now();
    let (su0, ss0) = job::resource_usage(libc::RUSAGE_SELF);
    let (cu0, cs0) = job::resource_usage(libc::RUSAGE_CHILDREN);
    let result = execute(shell, inner, ExecFlags::default());
    let real = start.elapsed();
    let (su1, ss1) = job::resource_usage(libc::RUSAGE_SELF);
    let (cu1, cs1) = job::resource_usage(libc::RUSAGE_CHILDREN);
    let user = su1.saturating_sub(su0) + cu1.saturating_sub(cu0);
    let sys = ss1.saturating_sub(ss0) + cs1.saturating_sub(cs0);
    eprintln!(
        "\nreal\t{}\nuser\t{}\nsys\t{}",
        builtins::format_minutes(real),
        builtins::format_minutes(user),
        builtins::format_minutes(sys)
    );
    result
}

// ── ジョブの起動 ─────────────────────────────────────────────────────

/// ジョブの種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Foreground,
    Background,
    Coprocess,
    /// コマンド置換。プロセスグループを作らず、端末も渡さない。
    Substitution,
}

/// 起動するジョブの内容。
#[derive(Debug)]
struct JobSpec {
    mode: Mode,
    display: String,
    /// 段ごとの表示名。段数 = 要素数。
    names: Vec<String>,
    /// 先頭段の stdin。
    stdin: Option<RawFd>,
    /// 最終段の stdout。
    stdout: Option<RawFd>,
    /// 全ての子で閉じる fd。
    close: Vec<RawFd>,
}

impl JobSpec {
    fn new(mode: Mode, display: String, names: Vec<String>) -> Self {
        Self {
            mode,
            display,
            names,
            stdin: None,
            stdout: None,
            close: Vec::new(),
        }
    }
}

/// ジョブを登録し、全段を fork してから started にする。ジョブ番号を返す。
///
/// `child` は子プロセスの中で段番号を受け取って実行し、終了ステータスを返す。
fn start_job<F>(shell: &mut Shell, spec: JobSpec, mut child: F) -> Result<usize, ShellError>
where
    F: FnMut(&mut Shell, usize) -> i32,
{
    let monitor = shell.opts.monitor && spec.mode != Mode::Substitution;
    let foreground = matches!(spec.mode, Mode::Foreground | Mode::Substitution);
    let stty = spec.names.len() == 1
        && spec.names[0].split_whitespace().next() == Some("stty");
    let flags = JobFlags {
        foreground,
        use_tty_mode: foreground && stty,
        ..JobFlags::default()
    };
    let n = shell.jobs.launch(spec.display, shell.pid, flags);

    let count = spec.names.len();
    let mut input: Option<OwnedFd> = None;
    let mut pgid: pid_t = 0;
    for (i, name) in spec.names.into_iter().enumerate() {
        let last = i + 1 == count;
        let pipe = if last {
            None
        } else {
            match Pipe::new() {
                Ok(p) => Some(p),
                Err(e) => {
                    abandon(shell, n, monitor);
                    return Err(ShellError::Pipe(e));
                }
            }
        };

        let mut close = spec.close.clone();
        close.extend(input.as_ref().map(|f| f.as_raw_fd()));
        if let Some(p) = &pipe {
            close.push(p.read.as_raw_fd());
            close.push(p.write.as_raw_fd());
        }
        let first_in = if i == 0 { spec.stdin } else { None };
        let last_out = if last { spec.stdout } else { None };
        let setup = ChildSetup {
            pgid: monitor.then_some(pgid),
            foreground: monitor && foreground,
            async_no_monitor: !shell.opts.monitor
                && matches!(spec.mode, Mode::Background | Mode::Coprocess),
            stdin: input.as_ref().map(|f| f.as_raw_fd()).or(first_in),
            stdout: pipe.as_ref().map(|p| p.write.as_raw_fd()).or(last_out),
            close,
        };

        match launch::fork(shell, &setup) {
            Ok(Forked::Child) => {
                let status = child(shell, i);
                launch::exit_child(status);
            }
            Ok(Forked::Parent(pid)) => {
                let pg = shell.jobs.add_process(n, pid, name, monitor)?;
                if monitor {
                    pgid = pg;
                }
            }
            Err(e) => {
                abandon(shell, n, monitor);
                return Err(e);
            }
        }
        // 親は使い終わったパイプ端を閉じる
        input = pipe.map(|p| p.read);
    }
    drop(input);

    shell.reaper.mark_started(&mut shell.jobs, n)?;
    tracing::debug!(job = n, stages = count, mode = ?spec.mode, "job started");
    Ok(n)
}

/// 起動途中で失敗したジョブを片付ける。起動済みの段は通常の回収に任せる。
fn abandon(shell: &mut Shell, n: usize, monitor: bool) {
    if monitor {
        shell.terminal.reclaim();
    }
    if shell.jobs.get(n).map_or(true, |j| j.processes.is_empty()) {
        shell.jobs.remove(n);
        return;
    }
    if let Some(job) = shell.jobs.get_mut(n) {
        job.flags.foreground = false;
        job.flags.notify = false;
    }
    if let Err(e) = shell.reaper.mark_started(&mut shell.jobs, n) {
        tracing::debug!(job = n, error = %e, "abandon");
    }
}

/// フォアグラウンドジョブを待つ。
fn wait_job(shell: &mut Shell, n: usize) -> Flow {
    let (monitor, interactive) = (shell.opts.monitor, shell.opts.interactive);
    let status =
        shell
            .reaper
            .wait_foreground(&mut shell.jobs, &mut shell.terminal, n, monitor, interactive)?;
    if interactive && status == 128 + libc::SIGINT {
        shell.reaper.raise_interrupt();
    }
    shell.check_coprocess();
    Ok(status)
}

fn pipeline(shell: &mut Shell, node: &Command, stages: &[Command]) -> Flow {
    let names = stages.iter().map(|c| c.to_string()).collect();
    let spec = JobSpec::new(Mode::Foreground, node.to_string(), names);
    let started = start_job(shell, spec, |sh, i| {
        let flow = execute(sh, &stages[i], ExecFlags::CHILD);
        status_of(sh, flow)
    });
    match started {
        Ok(n) => wait_job(shell, n),
        Err(e) => fail(shell, e),
    }
}

fn subshell(shell: &mut Shell, node: &Command, body: &Command, flags: ExecFlags) -> Flow {
    if flags.exec {
        return scoped(shell, &node.redirects, |sh| execute(sh, body, flags));
    }
    let text = node.to_string();
    let spec = JobSpec::new(Mode::Foreground, text.clone(), vec![text]);
    let started = start_job(shell, spec, |sh, _| {
        let child_flags = ExecFlags {
            exec: true,
            errok: flags.errok,
        };
        let flow = execute(sh, node, child_flags);
        status_of(sh, flow)
    });
    match started {
        Ok(n) => wait_job(shell, n),
        Err(e) => fail(shell, e),
    }
}

/// 非同期ジョブの共通処理: `$!` を設定し、対話シェルなら `[n] pid` を出す。
fn announce(shell: &mut Shell, n: usize) {
    let pid = shell.jobs.get(n).and_then(|j| j.last_pid());
    shell.last_bg_pid = pid;
    if shell.opts.interactive {
        if let Some(job) = shell.jobs.get_mut(n) {
            job.flags.notify = true;
        }
        if let Some(pid) = pid {
            eprintln!("[{}] {}", n, pid);
        }
    }
}

fn background(shell: &mut Shell, node: &Command, inner: &Command) -> Flow {
    let stages = inner.stages();
    let names = stages.iter().map(|c| c.to_string()).collect();
    let spec = JobSpec::new(Mode::Background, inner.to_string(), names);
    let started = start_job(shell, spec, |sh, i| {
        let flow = scoped(sh, &node.redirects, |sh| {
            execute(sh, stages[i], ExecFlags::CHILD)
        });
        status_of(sh, flow)
    });
    match started {
        Ok(n) => {
            announce(shell, n);
            Ok(0)
        }
        Err(e) => fail(shell, e),
    }
}

fn coprocess(shell: &mut Shell, inner: &Command) -> Flow {
    shell.reap_jobs();
    if shell.coproc.job.is_some() {
        return fail(shell, ShellError::CoprocessExists);
    }
    let (to_co, from_co) = match (Pipe::new(), Pipe::new()) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(e), _) | (_, Err(e)) => return fail(shell, ShellError::Pipe(e)),
    };
    let stages = inner.stages();
    let names = stages.iter().map(|c| c.to_string()).collect();
    let mut spec = JobSpec::new(Mode::Coprocess, inner.to_string(), names);
    spec.stdin = Some(to_co.read.as_raw_fd());
    spec.stdout = Some(from_co.write.as_raw_fd());
    spec.close = vec![
        to_co.read.as_raw_fd(),
        to_co.write.as_raw_fd(),
        from_co.read.as_raw_fd(),
        from_co.write.as_raw_fd(),
    ];
    let started = start_job(shell, spec, |sh, i| {
        let flow = execute(sh, stages[i], ExecFlags::CHILD);
        status_of(sh, flow)
    });
    match started {
        Ok(n) => {
            shell.coproc.write = Some(to_co.write);
            shell.coproc.read = Some(from_co.read);
            shell.coproc.job = Some(n);
            tracing::debug!(job = n, "coprocess started");
            announce(shell, n);
            Ok(0)
        }
        Err(e) => fail(shell, e),
    }
}

// ── コマンド置換 ─────────────────────────────────────────────────────

/// `$(...)` / `` `...` `` を実行し、標準出力（末尾の改行を除く）を返す。
///
/// 子はジョブとして登録して reaper 経由で待つ。終了ステータスは
/// [`Shell::subst_status`] に残る。
pub fn command_subst(shell: &mut Shell, text: &str) -> Result<String, ShellError> {
    let node = match parser::parse(text) {
        Ok(Some(node)) => node,
        Ok(None) => {
            shell.subst_status = Some(0);
            return Ok(String::new());
        }
        Err(e) => return Err(ShellError::Expansion(e.to_string())),
    };
    let pipe = Pipe::new().map_err(ShellError::Pipe)?;
    let display = text.trim().to_string();
    let mut spec = JobSpec::new(Mode::Substitution, display.clone(), vec![display]);
    spec.stdout = Some(pipe.write.as_raw_fd());
    spec.close = vec![pipe.read.as_raw_fd(), pipe.write.as_raw_fd()];
    let n = start_job(shell, spec, |sh, _| {
        let flow = execute(sh, &node, ExecFlags::CHILD);
        status_of(sh, flow)
    })?;

    let Pipe { read, write } = pipe;
    drop(write);
    let mut out = Vec::new();
    let read_result = File::from(read).read_to_end(&mut out);
    let outcome = shell.reaper.wait(&mut shell.jobs, n, false, false)?;
    shell.jobs.remove(n);
    shell.subst_status = Some(outcome.status());
    read_result?;

    let mut s = String::from_utf8_lossy(&out).into_owned();
    while s.ends_with('\n') {
        s.pop();
    }
    Ok(s)
}
