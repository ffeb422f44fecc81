//! kesh — Korn 系シェルの実行コア
//!
//! 起動の流れ: 引数解析 → ログ初期化 → [`Shell`] 構築 → rc ファイル → 入力源ごとの実行 → 後始末
//!
//! | 入力源 | 条件 | 構文エラー時 |
//! |--------|------|--------------|
//! | `-c 文字列` | `-c` 指定 | 終了（ステータス 2） |
//! | スクリプトファイル | 最初の非オプション引数 | 終了（ステータス 2） |
//! | 標準入力（対話） | 上記なしで stdin が端末、または `-i` | ステータス 2 で次のプロンプト |
//! | 標準入力（非対話） | 上記なしで stdin が端末でない | 終了（ステータス 2） |
//!
//! ログは `KESH_LOG` 環境変数（`tracing_subscriber::EnvFilter` 書式）で制御し、
//! 標準エラーへ出す。既定は `warn`。

use std::fs;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use kesh::builtins;
use kesh::error::{Divert, Flow};
use kesh::executor::{self, ExecFlags};
use kesh::parser;
use kesh::shell::{Options, Shell};

/// kesh - job-controlling command interpreter
#[derive(Parser, Debug)]
#[command(name = "kesh", version)]
#[command(about = "Korn-style shell with job control")]
struct Args {
    /// Read commands from the given string
    #[arg(short = 'c')]
    command: Option<String>,

    /// Force an interactive shell
    #[arg(short = 'i')]
    interactive: bool,

    /// Enable job control (monitor mode)
    #[arg(short = 'm')]
    monitor: bool,

    /// Exit when a command fails (errexit)
    #[arg(short = 'e')]
    errexit: bool,

    /// Trace commands before executing them (xtrace)
    #[arg(short = 'x')]
    xtrace: bool,

    /// Treat unset parameters as errors (nounset)
    #[arg(short = 'u')]
    nounset: bool,

    /// Do not overwrite existing files with `>` (noclobber)
    #[arg(short = 'C')]
    noclobber: bool,

    /// Disable pathname expansion (noglob)
    #[arg(short = 'f')]
    noglob: bool,

    /// Report background job completion immediately (notify)
    #[arg(short = 'b')]
    notify: bool,

    /// Script file, or `$0` when `-c` is given
    script: Option<String>,

    /// Positional parameters
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl Args {
    fn options(&self) -> Options {
        let tty = unsafe { libc::isatty(0) == 1 && libc::isatty(2) == 1 };
        let interactive =
            self.interactive || (self.command.is_none() && self.script.is_none() && tty);
        Options {
            interactive,
            monitor: self.monitor || interactive,
            errexit: self.errexit,
            xtrace: self.xtrace,
            nounset: self.nounset,
            noclobber: self.noclobber,
            noglob: self.noglob,
            notify: self.notify,
        }
    }
}

/// `$ENV`（なければ `~/.keshrc`）を読み込んで実行する。ファイルが存在しなければサイレントスキップ。
fn load_rc(shell: &mut Shell) -> Flow {
    let path = match shell.vars.get("ENV") {
        Some(env) if !env.is_empty() => PathBuf::from(env),
        _ => match shell.vars.get("HOME") {
            Some(home) => PathBuf::from(home).join(".keshrc"),
            None => return Ok(0),
        },
    };
    match fs::read_to_string(&path) {
        Ok(text) => executor::run_source(shell, &text),
        Err(_) => Ok(0),
    }
}

/// プロンプト。直前のステータスが非ゼロなら接頭辞に付ける。
fn prompt(shell: &Shell) -> String {
    if shell.last_status == 0 {
        "kesh$ ".to_string()
    } else {
        format!("[{}] kesh$ ", shell.last_status)
    }
}

/// 標準入力から 1 コマンドずつ読んで実行する。
///
/// 不完全な入力（閉じていないクォート、`if` の途中など）は次の行を読んで連結する。
fn interact(shell: &mut Shell) -> Flow {
    let interactive = shell.opts.interactive;
    let mut buffer = String::new();
    loop {
        shell.notify_jobs();
        if interactive {
            if buffer.is_empty() {
                eprint!("{}", prompt(shell));
            } else {
                eprint!("> ");
            }
        }

        let line = match builtins::read_line(0) {
            Ok(Some(line)) => line,
            Ok(None) => {
                if interactive {
                    eprintln!();
                }
                if buffer.is_empty() {
                    return Ok(shell.last_status);
                }
                eprintln!("kesh: {}", parser::ParseError::Incomplete);
                return Err(Divert::Exit(2));
            }
            Err(e) => {
                eprintln!("kesh: read error: {}", e);
                return Err(Divert::Exit(1));
            }
        };
        buffer.push_str(&line);
        buffer.push('\n');

        let node = match parser::parse(&buffer) {
            Err(e) if e.is_incomplete() => continue,
            Err(e) => {
                eprintln!("kesh: {}", e);
                shell.last_status = 2;
                buffer.clear();
                if !interactive {
                    return Err(Divert::Exit(2));
                }
                continue;
            }
            Ok(node) => node,
        };
        buffer.clear();
        let Some(node) = node else {
            continue;
        };

        // プロンプト中の ^C は捨てる
        shell.reaper.take_interrupt();
        match executor::execute(shell, &node, ExecFlags::default()) {
            Ok(_) => {}
            Err(d @ (Divert::Exit(_) | Divert::Abort(_))) => return Err(d),
            Err(d) => tracing::debug!(divert = ?d, "stray divert at top level"),
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_env("KESH_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let opts = args.options();
    let mut shell = match Shell::new(opts) {
        Ok(shell) => shell,
        Err(e) => {
            eprintln!("kesh: cannot initialize: {}", e);
            process::exit(1);
        }
    };
    tracing::debug!(flags = %shell.opts.flag_string(), pid = shell.pid, "kesh starting");

    let flow = run(&mut shell, args);
    let status = executor::status_of(&shell, flow);
    shell.hangup();
    process::exit(status);
}

fn run(shell: &mut Shell, args: Args) -> Flow {
    if shell.opts.interactive {
        load_rc(shell)?;
    }

    if let Some(command) = args.command {
        if let Some(arg0) = args.script {
            shell.vars.arg0 = arg0;
        }
        shell.vars.positional = args.args;
        return executor::run_source(shell, &command);
    }

    if let Some(script) = args.script {
        let text = match fs::read_to_string(&script) {
            Ok(text) => text,
            Err(e) => {
                eprintln!("kesh: {}: {}", script, e);
                return Err(Divert::Exit(127));
            }
        };
        shell.vars.arg0 = script;
        shell.vars.positional = args.args;
        return executor::run_source(shell, &text);
    }

    shell.vars.positional = args.args;
    interact(shell)
}
