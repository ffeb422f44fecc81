//! ビルトインコマンドの実装。
//!
//! ビルトインは fork/exec を経由せずプロセス内で直接実行される。
//! 解決順は特殊ビルトイン → 関数 → 通常ビルトイン → 外部コマンド。
//!
//! | 種類 | コマンド |
//! |------|----------|
//! | 特殊 | `:` `.` `break` `continue` `eval` `exec` `exit` `export` `readonly` `return` `set` `shift` `times` `unset` |
//! | 通常 | `bg` `cd` `echo` `false` `fg` `hash` `jobs` `kill` `print` `pwd` `read` `true` `type` `wait` |
//!
//! 特殊ビルトインの前置代入は恒久的で、非対話シェルではリダイレクトの失敗で
//! シェルが終了する（[`executor`](crate::executor) 側で処理）。

use std::env;
use std::fmt::Display;
use std::fs;
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Divert, Flow, JobError, ShellError};
use crate::executor;
use crate::job::{self, JobFormat};
use crate::launch;
use crate::shell::Options;
use crate::shell::Shell;
use crate::signal;

/// ビルトインの関数。`argv[0]` はコマンド名。
pub type Builtin = fn(&mut Shell, &[String]) -> Flow;

const SPECIAL: &[(&str, Builtin)] = &[
    (":", builtin_colon),
    (".", builtin_dot),
    ("break", builtin_break),
    ("continue", builtin_continue),
    ("eval", builtin_eval),
    ("exec", builtin_exec),
    ("exit", builtin_exit),
    ("export", builtin_export),
    ("readonly", builtin_readonly),
    ("return", builtin_return),
    ("set", builtin_set),
    ("shift", builtin_shift),
    ("times", builtin_times),
    ("unset", builtin_unset),
];

const REGULAR: &[(&str, Builtin)] = &[
    ("bg", builtin_bg),
    ("cd", builtin_cd),
    ("echo", builtin_echo),
    ("false", builtin_false),
    ("fg", builtin_fg),
    ("hash", builtin_hash),
    ("jobs", builtin_jobs),
    ("kill", builtin_kill),
    ("print", builtin_print),
    ("pwd", builtin_pwd),
    ("read", builtin_read),
    ("true", builtin_true),
    ("type", builtin_type),
    ("wait", builtin_wait),
];

/// 特殊ビルトインを探す。
pub fn special(name: &str) -> Option<Builtin> {
    SPECIAL.iter().find(|(n, _)| *n == name).map(|(_, f)| *f)
}

/// 通常ビルトインを探す。
pub fn regular(name: &str) -> Option<Builtin> {
    REGULAR.iter().find(|(n, _)| *n == name).map(|(_, f)| *f)
}

// ── 共通処理 ─────────────────────────────────────────────────────────

fn complain(name: &str, msg: impl Display) -> Flow {
    eprintln!("kesh: {}: {}", name, msg);
    Ok(1)
}

/// 標準出力へ書き出す。書き込みに失敗（閉じたパイプなど）したらステータス 1。
fn emit(text: &str) -> Flow {
    let mut out = io::stdout().lock();
    match out.write_all(text.as_bytes()).and_then(|_| out.flush()) {
        Ok(()) => Ok(0),
        Err(e) => complain("write error", e),
    }
}

/// ジョブ操作のエラー。内部エラーは中断に変換する。
fn job_failed(name: &str, e: ShellError) -> Flow {
    match e {
        ShellError::Job(je) if je.is_internal() => Err(je.into()),
        e => complain(name, e),
    }
}

/// `fd` から 1 行読む（改行は含まない）。何も読まずに EOF なら `None`。
///
/// 1 バイトずつ読むので、後続のコマンドが同じ入力の続きを読める。
pub fn read_line(fd: RawFd) -> io::Result<Option<String>> {
    let mut buf = Vec::new();
    loop {
        let mut byte = 0u8;
        let n = unsafe { libc::read(fd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            break;
        }
        if byte == b'\n' {
            break;
        }
        buf.push(byte);
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

fn write_fd(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

fn parse_count(name: &str, arg: Option<&String>) -> Result<usize, Flow> {
    match arg {
        None => Ok(1),
        Some(a) => a
            .parse::<usize>()
            .map_err(|_| complain(name, format!("{}: bad number", a))),
    }
}

/// `0m1.50s` 形式。
pub fn format_minutes(d: Duration) -> String {
    let secs = d.as_secs_f64();
    let mins = (secs / 60.0).floor();
    format!("{}m{:.2}s", mins as u64, secs - mins * 60.0)
}

/// シェル自身と子プロセスの累積 CPU 時間（`times`、引数なしの `time`）。
pub fn times_report() -> String {
    let (su, ss) = job::resource_usage(libc::RUSAGE_SELF);
    let (cu, cs) = job::resource_usage(libc::RUSAGE_CHILDREN);
    format!(
        "{} {}\n{} {}\n",
        format_minutes(su),
        format_minutes(ss),
        format_minutes(cu),
        format_minutes(cs)
    )
}

/// シングルクォートで囲む（`export -p` / `set` の一覧）。
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

// ── 特殊ビルトイン ───────────────────────────────────────────────────

fn builtin_colon(_shell: &mut Shell, _argv: &[String]) -> Flow {
    Ok(0)
}

/// `. file [args]` — ファイルを現在のシェルで実行する。
fn builtin_dot(shell: &mut Shell, argv: &[String]) -> Flow {
    let Some(name) = argv.get(1) else {
        return complain(".", "filename argument required");
    };
    let path = find_script(name, &shell.path());
    let text = match fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) => return complain(".", format!("{}: {}", name, e)),
    };

    let params = (argv.len() > 2)
        .then(|| std::mem::replace(&mut shell.vars.positional, argv[2..].to_vec()));
    shell.func_depth += 1;
    let result = executor::run_source(shell, &text);
    shell.func_depth -= 1;
    if let Some(params) = params {
        shell.vars.positional = params;
    }
    match result {
        Err(Divert::Return(status)) => Ok(status),
        other => other,
    }
}

/// `/` を含まない名前は `PATH` から読めるファイルを探す。
fn find_script(name: &str, path: &str) -> PathBuf {
    if name.contains('/') {
        return PathBuf::from(name);
    }
    path.split(':')
        .map(|d| Path::new(if d.is_empty() { "." } else { d }).join(name))
        .find(|p| p.is_file())
        .unwrap_or_else(|| PathBuf::from(name))
}

fn loop_control(shell: &mut Shell, argv: &[String], divert: fn(usize) -> Divert) -> Flow {
    let name = argv[0].as_str();
    let n = match parse_count(name, argv.get(1)) {
        Ok(n) if n >= 1 => n,
        Ok(_) => return complain(name, "0: bad number"),
        Err(flow) => return flow,
    };
    if shell.loop_depth == 0 {
        eprintln!("kesh: {0}: cannot {0}", name);
        return Ok(0);
    }
    let n = if n > shell.loop_depth {
        eprintln!(
            "kesh: {0}: can only {0} {1} level(s)",
            name, shell.loop_depth
        );
        shell.loop_depth
    } else {
        n
    };
    Err(divert(n))
}

fn builtin_break(shell: &mut Shell, argv: &[String]) -> Flow {
    loop_control(shell, argv, Divert::Break)
}

fn builtin_continue(shell: &mut Shell, argv: &[String]) -> Flow {
    loop_control(shell, argv, Divert::Continue)
}

fn builtin_eval(shell: &mut Shell, argv: &[String]) -> Flow {
    let text = argv[1..].join(" ");
    executor::run_source(shell, &text)
}

/// `exec cmd args` — シェルをコマンドで置き換える。
///
/// リダイレクトだけの `exec` は executor 側で恒久化される。
fn builtin_exec(shell: &mut Shell, argv: &[String]) -> Flow {
    let args = &argv[1..];
    if args.is_empty() {
        return Ok(0);
    }
    let search = shell.path();
    let Some(path) = shell.path_cache.lookup(&args[0], &search) else {
        let err = ShellError::NotFound(args[0].clone());
        eprintln!("kesh: {}", err);
        return if shell.opts.interactive {
            Ok(err.exit_status())
        } else {
            Err(Divert::Exit(err.exit_status()))
        };
    };
    if shell.opts.monitor {
        shell.terminal.release();
    }
    // 捕捉中のシグナルは execve で既定に戻る。無視中のものだけ戻す
    let ignored = [
        libc::SIGPIPE,
        libc::SIGQUIT,
        libc::SIGTERM,
        libc::SIGTSTP,
        libc::SIGTTIN,
        libc::SIGTTOU,
    ];
    let previous: Vec<_> = ignored
        .iter()
        .map(|&sig| (sig, unsafe { libc::signal(sig, libc::SIG_DFL) }))
        .collect();
    let err = launch::exec(shell, &path, args);
    for (sig, handler) in previous {
        unsafe {
            libc::signal(sig, handler);
        }
    }
    if shell.opts.monitor {
        if let Err(e) = shell.terminal.take_control() {
            tracing::debug!(error = %e, "terminal not reclaimed after failed exec");
        }
    }
    eprintln!("kesh: {}", err);
    if shell.opts.interactive {
        Ok(err.exit_status())
    } else {
        Err(Divert::Exit(err.exit_status()))
    }
}

/// `exit [N]` — シェルを終了する。N 省略時は直前のステータス。
///
/// 対話シェルで停止中のジョブがあれば 1 度だけ警告して終了しない。
fn builtin_exit(shell: &mut Shell, argv: &[String]) -> Flow {
    if shell.opts.interactive && !shell.warned_stopped && shell.jobs.stopped_count() > 0 {
        shell.warned_stopped = true;
        eprintln!("kesh: You have stopped jobs");
        return Ok(1);
    }
    let status = match argv.get(1) {
        None => shell.last_status,
        Some(a) => match a.parse::<i32>() {
            Ok(n) => n & 0xff,
            Err(_) => {
                eprintln!("kesh: exit: {}: numeric argument required", a);
                2
            }
        },
    };
    Err(Divert::Exit(status))
}

/// `export` / `readonly` 共通。引数なし・`-p` なら一覧。
fn attribute(shell: &mut Shell, argv: &[String], exporting: bool) -> Flow {
    let name = argv[0].as_str();
    let args: Vec<&String> = argv[1..].iter().filter(|a| a.as_str() != "-p").collect();
    if args.is_empty() {
        let mut out = String::new();
        for (k, v) in shell.vars.iter_sorted() {
            if (exporting && !v.exported) || (!exporting && !v.readonly) {
                continue;
            }
            match &v.value {
                Some(val) => out.push_str(&format!("{} {}={}\n", name, k, quote(val))),
                None => out.push_str(&format!("{} {}\n", name, k)),
            }
        }
        return emit(&out);
    }

    let mut status = 0;
    for arg in args {
        let (k, v) = match arg.split_once('=') {
            Some((k, v)) => (k, Some(v.to_string())),
            None => (arg.as_str(), None),
        };
        let result = if exporting {
            shell.vars.export(k, v)
        } else {
            shell.vars.set_readonly(k, v)
        };
        if k == "PATH" {
            shell.path_cache.clear();
        }
        if let Err(e) = result {
            eprintln!("kesh: {}: {}", name, e);
            status = 1;
        }
    }
    Ok(status)
}

fn builtin_export(shell: &mut Shell, argv: &[String]) -> Flow {
    attribute(shell, argv, true)
}

fn builtin_readonly(shell: &mut Shell, argv: &[String]) -> Flow {
    attribute(shell, argv, false)
}

fn builtin_return(shell: &mut Shell, argv: &[String]) -> Flow {
    if shell.func_depth == 0 {
        return complain("return", "can only `return' from a function or dot script");
    }
    let status = match argv.get(1) {
        None => shell.last_status,
        Some(a) => match a.parse::<i32>() {
            Ok(n) => n & 0xff,
            Err(_) => return complain("return", format!("{}: bad number", a)),
        },
    };
    Err(Divert::Return(status))
}

/// `set [±flags] [±o name] [--] [args]`
fn builtin_set(shell: &mut Shell, argv: &[String]) -> Flow {
    let args = &argv[1..];
    if args.is_empty() {
        let out: String = shell
            .vars
            .iter_sorted()
            .into_iter()
            .filter_map(|(k, v)| v.value.as_ref().map(|val| format!("{}={}\n", k, quote(val))))
            .collect();
        return emit(&out);
    }

    let mut monitor = None;
    let mut set_params = false;
    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        if arg == "--" || arg == "-" {
            set_params = true;
            i += 1;
            break;
        }
        if arg == "-o" || arg == "+o" {
            let on = arg == "-o";
            match args.get(i + 1) {
                None => {
                    let status = emit(&option_listing(&shell.opts, on))?;
                    if status != 0 {
                        return Ok(status);
                    }
                    i += 1;
                }
                Some(name) => {
                    if let Err(flow) = set_option(shell, name, on, &mut monitor) {
                        return flow;
                    }
                    i += 2;
                }
            }
            continue;
        }
        let (on, letters) = match (arg.strip_prefix('-'), arg.strip_prefix('+')) {
            (Some(l), _) => (true, l),
            (_, Some(l)) => (false, l),
            _ => break,
        };
        for c in letters.chars() {
            let Some(name) = Options::name_of(c) else {
                return complain("set", format!("-{}: unknown option", c));
            };
            if let Err(flow) = set_option(shell, name, on, &mut monitor) {
                return flow;
            }
        }
        i += 1;
    }

    if let Some(on) = monitor {
        if on != shell.opts.monitor {
            shell.set_monitor(on);
        }
    }
    if set_params || i < args.len() {
        shell.vars.positional = args[i..].to_vec();
    }
    Ok(0)
}

fn set_option(
    shell: &mut Shell,
    name: &str,
    on: bool,
    monitor: &mut Option<bool>,
) -> Result<(), Flow> {
    match name {
        "monitor" => *monitor = Some(on),
        "interactive" => return Err(complain("set", "interactive: cannot be changed")),
        _ => {
            if !shell.opts.set(name, on) {
                return Err(complain("set", format!("{}: bad option", name)));
            }
        }
    }
    Ok(())
}

/// `set -o`（名前と状態）/ `set +o`（再入力できる形）の一覧。
fn option_listing(opts: &Options, human: bool) -> String {
    opts.list()
        .into_iter()
        .map(|(name, on)| {
            if human {
                format!("{:<12}{}\n", name, if on { "on" } else { "off" })
            } else {
                format!("set {}o {}\n", if on { '-' } else { '+' }, name)
            }
        })
        .collect()
}

fn builtin_shift(shell: &mut Shell, argv: &[String]) -> Flow {
    let n = match parse_count("shift", argv.get(1)) {
        Ok(n) => n,
        Err(flow) => return flow,
    };
    if n > shell.vars.positional.len() {
        return complain("shift", format!("{}: bad number", n));
    }
    shell.vars.positional.drain(..n);
    Ok(0)
}

fn builtin_times(_shell: &mut Shell, _argv: &[String]) -> Flow {
    emit(&times_report())
}

/// `unset [-f|-v] name...`
fn builtin_unset(shell: &mut Shell, argv: &[String]) -> Flow {
    let mut functions = false;
    let mut names = &argv[1..];
    while let Some(opt) = names.first().and_then(|a| a.strip_prefix('-')) {
        match opt {
            "f" => functions = true,
            "v" => functions = false,
            _ => return complain("unset", format!("-{}: unknown option", opt)),
        }
        names = &names[1..];
    }
    let mut status = 0;
    for name in names {
        if functions {
            shell.functions.remove(name);
            continue;
        }
        match shell.vars.unset(name) {
            Ok(()) if name == "PATH" => shell.path_cache.clear(),
            Ok(()) => {}
            Err(e) => {
                eprintln!("kesh: unset: {}", e);
                status = 1;
            }
        }
    }
    Ok(status)
}

// ── ジョブ制御 ───────────────────────────────────────────────────────

/// `bg [job...]` — 停止中のジョブをバックグラウンドで再開する。
fn builtin_bg(shell: &mut Shell, argv: &[String]) -> Flow {
    let default = ["%+".to_string()];
    let selectors = if argv.len() > 1 { &argv[1..] } else { &default[..] };
    let mut status = 0;
    for sel in selectors {
        if let Err(e) = shell.job_resume(sel, true) {
            status = job_failed("bg", e)?;
        }
    }
    Ok(status)
}

/// `fg [job]` — ジョブをフォアグラウンドで再開し、終了か停止まで待つ。
fn builtin_fg(shell: &mut Shell, argv: &[String]) -> Flow {
    let sel = argv.get(1).map(String::as_str).unwrap_or("%+");
    match shell.job_resume(sel, false) {
        Ok(status) => Ok(status),
        Err(e) => job_failed("fg", e),
    }
}

/// `jobs [-lpn] [job...]`
fn builtin_jobs(shell: &mut Shell, argv: &[String]) -> Flow {
    let mut format = JobFormat::Medium;
    let mut changed_only = false;
    let mut selectors = Vec::new();
    for arg in &argv[1..] {
        match arg.strip_prefix('-') {
            Some(opts) if !opts.is_empty() && selectors.is_empty() => {
                for c in opts.chars() {
                    match c {
                        'l' => format = JobFormat::Long,
                        'p' => format = JobFormat::Pgrp,
                        'n' => changed_only = true,
                        _ => return complain("jobs", format!("-{}: unknown option", c)),
                    }
                }
            }
            _ => selectors.push(arg.clone()),
        }
    }
    match shell.job_list(&selectors, format, changed_only) {
        Ok(report) => emit(&report),
        Err(e) => job_failed("jobs", e.into()),
    }
}

/// `kill [-s name | -n num | -name] target...` / `kill -l [status...]`
fn builtin_kill(shell: &mut Shell, argv: &[String]) -> Flow {
    let args = &argv[1..];
    let Some(first) = args.first() else {
        return complain("kill", "usage: kill [-s signame | -signum | -signame] {pid|job}...");
    };

    if first == "-l" {
        if args.len() == 1 {
            return emit(&format!("{}\n", signal::names().join(" ")));
        }
        let mut out = String::new();
        for a in &args[1..] {
            match a.parse::<i32>() {
                Ok(n) => {
                    let sig = if n > 128 { n - 128 } else { n };
                    match signal::name(sig) {
                        Some(name) => out.push_str(&format!("{}\n", name)),
                        None => return complain("kill", format!("{}: unknown signal", a)),
                    }
                }
                Err(_) => match signal::from_name(a) {
                    Some(sig) => out.push_str(&format!("{}\n", sig)),
                    None => return complain("kill", format!("{}: unknown signal", a)),
                },
            }
        }
        return emit(&out);
    }

    let (spec, targets) = if first == "-s" || first == "-n" {
        match args.get(1) {
            Some(s) => (Some(s.as_str()), &args[2..]),
            None => return complain("kill", format!("{}: argument expected", first)),
        }
    } else if first == "--" {
        (None, &args[1..])
    } else if let Some(s) = first.strip_prefix('-') {
        (Some(s), &args[1..])
    } else {
        (None, args)
    };
    let sig = match spec {
        None => libc::SIGTERM,
        Some(s) => match signal::from_name(s) {
            Some(sig) => sig,
            None => return complain("kill", format!("{}: unknown signal", s)),
        },
    };

    let mut status = 0;
    for target in targets {
        if target.starts_with('%') {
            if let Err(e) = shell.job_kill(target, sig) {
                status = job_failed("kill", e)?;
            }
            continue;
        }
        let Ok(pid) = target.parse::<libc::pid_t>() else {
            status = complain("kill", JobError::BadSelector(target.clone()))?;
            continue;
        };
        if unsafe { libc::kill(pid, sig) } < 0 {
            status = complain("kill", format!("{}: {}", target, io::Error::last_os_error()))?;
        }
    }
    Ok(status)
}

/// `wait [job|pid...]`
///
/// 引数なしなら全ジョブの終了を待って 0。pid に該当するジョブがなければ 127。
/// SIGINT で中断したら 128+SIGINT。
fn builtin_wait(shell: &mut Shell, argv: &[String]) -> Flow {
    let interrupted = 128 + libc::SIGINT;
    if argv.len() == 1 {
        loop {
            shell.reap_jobs();
            let monitor = shell.opts.monitor;
            let pending = shell
                .jobs
                .iter()
                .find(|j| !j.is_terminal() && !j.flags.zombie && !(monitor && j.is_stopped()))
                .map(|j| j.number);
            let Some(n) = pending else {
                return Ok(0);
            };
            match shell.job_wait(&format!("%{}", n)) {
                Ok((-1, _)) => return Ok(interrupted),
                Ok(_) => {}
                Err(e) => return job_failed("wait", e.into()),
            }
        }
    }

    let mut status = 0;
    for sel in &argv[1..] {
        match shell.job_wait(sel) {
            Ok((-1, _)) => return Ok(interrupted),
            Ok((s, _)) => status = s,
            Err(e) if e.is_internal() => return Err(e.into()),
            Err(JobError::NoSuchJob(_)) if !sel.starts_with('%') => status = 127,
            Err(e) => {
                eprintln!("kesh: wait: {}", e);
                status = 127;
            }
        }
    }
    Ok(status)
}

// ── 通常ビルトイン ───────────────────────────────────────────────────

/// `cd [dir | -]` — カレントディレクトリを変更し、`PWD` / `OLDPWD` を更新する。
fn builtin_cd(shell: &mut Shell, argv: &[String]) -> Flow {
    let (target, show) = match argv.get(1).map(String::as_str) {
        None => match shell.vars.get("HOME") {
            Some(home) => (home.to_string(), false),
            None => return complain("cd", "HOME not set"),
        },
        Some("-") => match shell.vars.get("OLDPWD") {
            Some(old) => (old.to_string(), true),
            None => return complain("cd", "OLDPWD not set"),
        },
        Some(dir) => (dir.to_string(), false),
    };

    if let Err(e) = env::set_current_dir(Path::new(&target)) {
        return complain("cd", format!("{}: {}", target, e));
    }
    let old = shell.vars.get("PWD").map(str::to_string);
    let new = env::current_dir()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or(target);
    if let Some(old) = old {
        if let Err(e) = shell.vars.export("OLDPWD", Some(old)) {
            return complain("cd", e);
        }
    }
    if let Err(e) = shell.vars.export("PWD", Some(new.clone())) {
        return complain("cd", e);
    }
    if show {
        return emit(&format!("{}\n", new));
    }
    Ok(0)
}

fn builtin_echo(_shell: &mut Shell, argv: &[String]) -> Flow {
    let (newline, args) = match argv.get(1).map(String::as_str) {
        Some("-n") => (false, &argv[2..]),
        _ => (true, &argv[1..]),
    };
    let mut text = args.join(" ");
    if newline {
        text.push('\n');
    }
    emit(&text)
}

fn builtin_false(_shell: &mut Shell, _argv: &[String]) -> Flow {
    Ok(1)
}

fn builtin_true(_shell: &mut Shell, _argv: &[String]) -> Flow {
    Ok(0)
}

/// `hash [-r] [name...]`
fn builtin_hash(shell: &mut Shell, argv: &[String]) -> Flow {
    let mut names = &argv[1..];
    let mut cleared = false;
    if names.first().map(String::as_str) == Some("-r") {
        shell.path_cache.clear();
        cleared = true;
        names = &names[1..];
    }
    if names.is_empty() {
        if cleared {
            return Ok(0);
        }
        let mut entries = shell.path_cache.entries();
        entries.sort();
        let out: String = entries
            .iter()
            .map(|(name, path)| format!("{}={}\n", name, path.display()))
            .collect();
        return emit(&out);
    }
    let search = shell.path();
    let mut status = 0;
    for name in names {
        if shell.path_cache.lookup(name, &search).is_none() {
            status = complain("hash", format!("{}: not found", name))?;
        }
    }
    Ok(status)
}

/// `print [-nrp] [--] args` — `-p` でコプロセスへ書く。
fn builtin_print(shell: &mut Shell, argv: &[String]) -> Flow {
    let mut newline = true;
    let mut raw = false;
    let mut coprocess = false;
    let mut i = 1;
    while let Some(arg) = argv.get(i) {
        if arg == "--" || arg == "-" {
            i += 1;
            break;
        }
        let Some(opts) = arg.strip_prefix('-') else {
            break;
        };
        if opts.is_empty() || !opts.chars().all(|c| "nrRp".contains(c)) {
            break;
        }
        for c in opts.chars() {
            match c {
                'n' => newline = false,
                'p' => coprocess = true,
                _ => raw = true,
            }
        }
        i += 1;
    }

    let joined = argv[i..].join(" ");
    let mut text = if raw {
        joined
    } else {
        let (text, stop) = print_escapes(&joined);
        if stop {
            newline = false;
        }
        text
    };
    if newline {
        text.push('\n');
    }

    if coprocess {
        let Some(fd) = shell.coproc.write.as_ref().map(|f| f.as_raw_fd()) else {
            return complain("print", ShellError::NoCoprocess);
        };
        return match write_fd(fd, text.as_bytes()) {
            Ok(()) => Ok(0),
            Err(e) => complain("print", e),
        };
    }
    emit(&text)
}

/// `print` のエスケープを解釈する。`\c` 以降は捨て、真を返す。
fn print_escapes(s: &str) -> (String, bool) {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('a') => out.push('\x07'),
            Some('b') => out.push('\x08'),
            Some('f') => out.push('\x0c'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('v') => out.push('\x0b'),
            Some('\\') => out.push('\\'),
            Some('c') => return (out, true),
            Some('0') => {
                let mut value = 0u32;
                for _ in 0..3 {
                    match chars.peek().and_then(|d| d.to_digit(8)) {
                        Some(d) => {
                            value = value * 8 + d;
                            chars.next();
                        }
                        None => break,
                    }
                }
                out.extend(char::from_u32(value));
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    (out, false)
}

fn builtin_pwd(_shell: &mut Shell, _argv: &[String]) -> Flow {
    match env::current_dir() {
        Ok(dir) => emit(&format!("{}\n", dir.display())),
        Err(e) => complain("pwd", e),
    }
}

/// `read [-r] [-p] [name?prompt] [name...]` — 1 行読んで IFS で分割し、変数に代入する。
///
/// 名前がなければ `REPLY`。最後の変数は残り全体を受け取る。EOF なら 1。
fn builtin_read(shell: &mut Shell, argv: &[String]) -> Flow {
    let mut raw = false;
    let mut coprocess = false;
    let mut i = 1;
    while let Some(opts) = argv.get(i).and_then(|a| a.strip_prefix('-')) {
        if opts.is_empty() || !opts.chars().all(|c| c == 'r' || c == 'p') {
            break;
        }
        raw |= opts.contains('r');
        coprocess |= opts.contains('p');
        i += 1;
    }
    let mut names: Vec<String> = argv[i..].to_vec();
    let split = names
        .first()
        .and_then(|n| n.split_once('?'))
        .map(|(name, prompt)| (name.to_string(), prompt.to_string()));
    if let Some((name, prompt)) = split {
        if shell.opts.interactive {
            eprint!("{}", prompt);
        }
        names[0] = name;
    }
    if names.is_empty() {
        names.push("REPLY".to_string());
    }

    let fd = if coprocess {
        match shell.coproc.read.as_ref() {
            Some(f) => f.as_raw_fd(),
            None => return complain("read", ShellError::NoCoprocess),
        }
    } else {
        0
    };

    let mut line = String::new();
    let mut eof = false;
    loop {
        match read_line(fd) {
            Ok(Some(part)) => {
                if !raw && part.ends_with('\\') {
                    line.push_str(&part[..part.len() - 1]);
                    continue;
                }
                line.push_str(&part);
                break;
            }
            Ok(None) => {
                eof = true;
                break;
            }
            Err(e) => return complain("read", e),
        }
    }
    if !raw {
        line = remove_backslashes(&line);
    }

    let ifs = shell.vars.get("IFS").unwrap_or(" \t\n").to_string();
    let fields = split_read(&line, &ifs, names.len());
    for (k, name) in names.iter().enumerate() {
        let value = fields.get(k).map(String::as_str).unwrap_or("");
        if let Err(e) = shell.assign(name, value) {
            return complain("read", e);
        }
    }
    Ok(if eof && line.is_empty() { 1 } else { 0 })
}

fn remove_backslashes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            out.extend(chars.next());
        } else {
            out.push(c);
        }
    }
    out
}

/// `read` のフィールド分割。最大 `count` 個で、最後のフィールドは残り全体。
fn split_read(line: &str, ifs: &str, count: usize) -> Vec<String> {
    let white = |c: char| ifs.contains(c) && c.is_whitespace();
    let sep = |c: char| ifs.contains(c);
    let mut fields = Vec::new();
    let mut rest = line.trim_start_matches(white);
    while fields.len() + 1 < count && !rest.is_empty() {
        match rest.find(sep) {
            Some(pos) => {
                fields.push(rest[..pos].to_string());
                let width = rest[pos..].chars().next().map_or(1, char::len_utf8);
                rest = rest[pos + width..].trim_start_matches(white);
            }
            None => {
                fields.push(rest.to_string());
                rest = "";
            }
        }
    }
    if !rest.is_empty() {
        fields.push(rest.trim_end_matches(white).to_string());
    }
    fields
}

/// `type name...` — コマンドの解決結果を表示する。
fn builtin_type(shell: &mut Shell, argv: &[String]) -> Flow {
    let search = shell.path();
    let mut out = String::new();
    let mut status = 0;
    for name in &argv[1..] {
        if special(name).is_some() {
            out.push_str(&format!("{} is a special shell builtin\n", name));
        } else if shell.functions.contains_key(name) {
            out.push_str(&format!("{} is a function\n", name));
        } else if regular(name).is_some() {
            out.push_str(&format!("{} is a shell builtin\n", name));
        } else if let Some(path) = shell.path_cache.lookup(name, &search) {
            out.push_str(&format!("{} is {}\n", name, path.display()));
        } else {
            eprintln!("kesh: type: {}: not found", name);
            status = 1;
        }
    }
    let written = emit(&out)?;
    Ok(status.max(written))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobFlags;

    fn shell() -> Shell {
        Shell::new(Options::default()).unwrap()
    }

    fn args(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn lookup_tables() {
        assert!(special("export").is_some());
        assert!(special("cd").is_none());
        assert!(regular("cd").is_some());
        assert!(regular("exit").is_none());
    }

    #[test]
    fn exit_status_argument() {
        let mut sh = shell();
        sh.last_status = 4;
        assert_eq!(builtin_exit(&mut sh, &args(&["exit"])), Err(Divert::Exit(4)));
        assert_eq!(builtin_exit(&mut sh, &args(&["exit", "258"])), Err(Divert::Exit(2)));
        assert_eq!(builtin_exit(&mut sh, &args(&["exit", "x"])), Err(Divert::Exit(2)));
    }

    #[test]
    fn exit_warns_once_about_stopped_jobs() {
        let mut sh = shell();
        sh.opts.interactive = true;
        let n = sh.jobs.launch("vi".into(), sh.pid, JobFlags::default());
        sh.jobs.add_process(n, 999_999, "vi".into(), false).unwrap();
        sh.jobs.mark_started(n).unwrap();
        sh.jobs.update(999_999, (libc::SIGTSTP << 8) | 0x7f, None);
        assert!(sh.jobs.get(n).unwrap().is_stopped());

        assert_eq!(builtin_exit(&mut sh, &args(&["exit"])), Ok(1));
        assert_eq!(builtin_exit(&mut sh, &args(&["exit", "0"])), Err(Divert::Exit(0)));
    }

    #[test]
    fn break_outside_loop_and_clamping() {
        let mut sh = shell();
        assert_eq!(builtin_break(&mut sh, &args(&["break"])), Ok(0));
        sh.loop_depth = 1;
        assert_eq!(builtin_break(&mut sh, &args(&["break", "3"])), Err(Divert::Break(1)));
        assert_eq!(
            builtin_continue(&mut sh, &args(&["continue"])),
            Err(Divert::Continue(1))
        );
        assert_eq!(builtin_break(&mut sh, &args(&["break", "x"])), Ok(1));
    }

    #[test]
    fn return_only_inside_function() {
        let mut sh = shell();
        assert_eq!(builtin_return(&mut sh, &args(&["return", "3"])), Ok(1));
        sh.func_depth = 1;
        assert_eq!(builtin_return(&mut sh, &args(&["return", "3"])), Err(Divert::Return(3)));
    }

    #[test]
    fn set_flags_and_positional() {
        let mut sh = shell();
        assert_eq!(builtin_set(&mut sh, &args(&["set", "-eu", "-o", "noclobber", "a", "b"])), Ok(0));
        assert!(sh.opts.errexit && sh.opts.nounset && sh.opts.noclobber);
        assert_eq!(sh.vars.positional, args(&["a", "b"]));
        assert_eq!(builtin_set(&mut sh, &args(&["set", "+e", "--"])), Ok(0));
        assert!(!sh.opts.errexit);
        assert!(sh.vars.positional.is_empty());
        assert_eq!(builtin_set(&mut sh, &args(&["set", "-Z"])), Ok(1));
        assert_eq!(builtin_set(&mut sh, &args(&["set", "-o", "pipefail"])), Ok(1));
    }

    #[test]
    fn option_listing_forms() {
        let opts = Options {
            xtrace: true,
            ..Options::default()
        };
        let human = option_listing(&opts, true);
        assert!(human.contains("xtrace      on\n"));
        let script = option_listing(&opts, false);
        assert!(script.contains("set -o xtrace\n"));
        assert!(script.contains("set +o errexit\n"));
    }

    #[test]
    fn shift_checks_count() {
        let mut sh = shell();
        sh.vars.positional = args(&["a", "b", "c"]);
        assert_eq!(builtin_shift(&mut sh, &args(&["shift", "2"])), Ok(0));
        assert_eq!(sh.vars.positional, args(&["c"]));
        assert_eq!(builtin_shift(&mut sh, &args(&["shift", "2"])), Ok(1));
        assert_eq!(sh.vars.positional, args(&["c"]));
    }

    #[test]
    fn export_and_unset() {
        let mut sh = shell();
        assert_eq!(builtin_export(&mut sh, &args(&["export", "KESH_T=1"])), Ok(0));
        assert!(sh.vars.environ().contains(&"KESH_T=1".to_string()));
        assert_eq!(builtin_readonly(&mut sh, &args(&["readonly", "KESH_T"])), Ok(0));
        assert_eq!(builtin_unset(&mut sh, &args(&["unset", "KESH_T"])), Ok(1));
        assert_eq!(builtin_export(&mut sh, &args(&["export", "1bad=x"])), Ok(1));
    }

    #[test]
    fn unset_function() {
        let mut sh = shell();
        sh.functions
            .insert("f".into(), std::rc::Rc::new(crate::ast::Command::simple([":"])));
        assert_eq!(builtin_unset(&mut sh, &args(&["unset", "-f", "f"])), Ok(0));
        assert!(sh.functions.is_empty());
    }

    #[test]
    fn quoting_for_listings() {
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn print_escape_sequences() {
        assert_eq!(print_escapes("a\\tb\\n"), ("a\tb\n".to_string(), false));
        assert_eq!(print_escapes("x\\cignored"), ("x".to_string(), true));
        assert_eq!(print_escapes("\\0101"), ("A".to_string(), false));
        assert_eq!(print_escapes("\\q"), ("\\q".to_string(), false));
    }

    #[test]
    fn read_field_splitting() {
        assert_eq!(split_read("  a  b c  ", " \t\n", 2), args(&["a", "b c"]));
        assert_eq!(split_read("a:b:c", ":", 3), args(&["a", "b", "c"]));
        assert_eq!(split_read("a::c", ":", 3), args(&["a", "", "c"]));
        assert_eq!(split_read("one", " ", 3), args(&["one"]));
        assert!(split_read("", " ", 1).is_empty());
    }

    #[test]
    fn read_line_from_pipe() {
        let pipe = crate::fd::Pipe::new().unwrap();
        write_fd(pipe.write.as_raw_fd(), b"first\nsecond").unwrap();
        drop(pipe.write);
        let r = pipe.read.as_raw_fd();
        assert_eq!(read_line(r).unwrap().as_deref(), Some("first"));
        assert_eq!(read_line(r).unwrap().as_deref(), Some("second"));
        assert_eq!(read_line(r).unwrap(), None);
    }

    #[test]
    fn backslashes_are_removed() {
        assert_eq!(remove_backslashes("a\\ b\\\\c"), "a b\\c");
    }

    #[test]
    fn minutes_format() {
        assert_eq!(format_minutes(Duration::from_millis(61_500)), "1m1.50s");
        assert_eq!(format_minutes(Duration::ZERO), "0m0.00s");
    }

    #[test]
    fn job_builtins_report_selector_errors() {
        let mut sh = shell();
        assert_eq!(builtin_fg(&mut sh, &args(&["fg"])), Ok(1));
        assert_eq!(builtin_jobs(&mut sh, &args(&["jobs", "%4"])), Ok(1));
        assert_eq!(builtin_wait(&mut sh, &args(&["wait", "999999"])), Ok(127));
        assert_eq!(builtin_wait(&mut sh, &args(&["wait"])), Ok(0));
        assert_eq!(builtin_kill(&mut sh, &args(&["kill", "-NOPE", "1"])), Ok(1));
    }

    #[test]
    fn find_script_prefers_path_hits() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.sh"), "x=1\n").unwrap();
        let path = dir.path().to_str().unwrap();
        assert_eq!(find_script("lib.sh", path), dir.path().join("lib.sh"));
        assert_eq!(find_script("./other", path), PathBuf::from("./other"));
    }
}
