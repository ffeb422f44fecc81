//! シェルのセッション状態と、ジョブ制御の公開 API。
//!
//! 変数テーブル（[`Vars`]）、関数、ジョブテーブル（[`JobTable`]）、
//! reaper（[`Reaper`]）、端末（[`Terminal`]）、`$PATH` キャッシュ（[`PathCache`]）、
//! コプロセスの fd を保持する。fork した子はこの構造体の複製を持ち、
//! [`Shell::enter_child`] で非対話・ジョブ制御なしに切り替わる。

use std::collections::HashMap;
use std::io;
use std::os::unix::io::OwnedFd;
use std::rc::Rc;

use libc::{c_int, pid_t};

use crate::ast::Command;
use crate::error::{JobError, ShellError};
use crate::executor::{self, ExecFlags};
use crate::job::{self, JobFormat, JobTable};
use crate::path::PathCache;
use crate::reap::{Reaper, WaitOutcome};
use crate::tty::Terminal;
use crate::vars::Vars;

/// `PATH` が未設定のときの検索パス。
pub const DEFAULT_PATH: &str = "/usr/bin:/bin";

// ── オプション ───────────────────────────────────────────────────────

/// `set -o` で切り替えるシェルオプション。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    pub interactive: bool,
    /// ジョブ制御（`-m`）。
    pub monitor: bool,
    pub errexit: bool,
    pub xtrace: bool,
    pub nounset: bool,
    /// `-C`: `>` で既存ファイルを上書きしない。
    pub noclobber: bool,
    /// `-f`: パス名展開をしない。
    pub noglob: bool,
    /// `-b`: バックグラウンドジョブの状態変化をすぐに報告する。
    pub notify: bool,
}

/// オプション名と 1 文字フラグ。`$-` はこの順で並ぶ。
const OPTION_TABLE: &[(&str, char)] = &[
    ("notify", 'b'),
    ("noclobber", 'C'),
    ("errexit", 'e'),
    ("noglob", 'f'),
    ("interactive", 'i'),
    ("monitor", 'm'),
    ("nounset", 'u'),
    ("xtrace", 'x'),
];

impl Options {
    fn slot(&mut self, name: &str) -> Option<&mut bool> {
        Some(match name {
            "notify" => &mut self.notify,
            "noclobber" => &mut self.noclobber,
            "errexit" => &mut self.errexit,
            "noglob" => &mut self.noglob,
            "interactive" => &mut self.interactive,
            "monitor" => &mut self.monitor,
            "nounset" => &mut self.nounset,
            "xtrace" => &mut self.xtrace,
            _ => return None,
        })
    }

    pub fn get(&self, name: &str) -> Option<bool> {
        let mut copy = *self;
        copy.slot(name).map(|b| *b)
    }

    /// 1 文字フラグの正式名。
    pub fn name_of(letter: char) -> Option<&'static str> {
        OPTION_TABLE
            .iter()
            .find(|(_, l)| *l == letter)
            .map(|(n, _)| *n)
    }

    /// 名前でオプションを設定する。未知の名前なら `false`。
    pub fn set(&mut self, name: &str, on: bool) -> bool {
        match self.slot(name) {
            Some(b) => {
                *b = on;
                true
            }
            None => false,
        }
    }

    /// `$-` の値。
    pub fn flag_string(&self) -> String {
        OPTION_TABLE
            .iter()
            .filter(|(name, _)| self.get(name) == Some(true))
            .map(|(_, l)| *l)
            .collect()
    }

    /// 全オプションの (名前, 値)。`set -o` の一覧用。
    pub fn list(&self) -> Vec<(&'static str, bool)> {
        OPTION_TABLE
            .iter()
            .map(|(name, _)| (*name, self.get(name).unwrap_or(false)))
            .collect()
    }
}

// ── コプロセス ───────────────────────────────────────────────────────

/// シェル側が保持するコプロセスのパイプ端。
#[derive(Debug, Default)]
pub struct Coproc {
    /// コプロセスの出力を読む端（`<&p`, `read -p`）。
    pub read: Option<OwnedFd>,
    /// コプロセスの入力へ書く端（`>&p`, `print -p`）。
    pub write: Option<OwnedFd>,
    pub job: Option<usize>,
}

impl Coproc {
    pub fn close(&mut self) {
        self.read = None;
        self.write = None;
        self.job = None;
    }
}

// ── Shell ────────────────────────────────────────────────────────────

/// シェルの実行状態。REPL ループ全体で共有される。
#[derive(Debug)]
pub struct Shell {
    pub opts: Options,
    pub vars: Vars,
    pub functions: HashMap<String, Rc<Command>>,
    pub jobs: JobTable,
    pub reaper: Reaper,
    pub terminal: Terminal,
    pub path_cache: PathCache,
    pub coproc: Coproc,
    /// `$?`。
    pub last_status: i32,
    /// `$$`。サブシェルでも起動したシェルの pid のまま。
    pub pid: pid_t,
    /// `$!`。
    pub last_bg_pid: Option<pid_t>,
    /// 直近のコマンド置換の終了ステータス（代入だけのコマンドのステータス）。
    pub subst_status: Option<i32>,
    /// 実行中のループの入れ子。関数呼び出しで 0 に戻る。
    pub loop_depth: usize,
    /// 関数・ドットスクリプトの入れ子（`return` の可否）。
    pub func_depth: usize,
    /// 停止中ジョブがある状態の `exit` を 1 度警告した。
    pub warned_stopped: bool,
}

impl Shell {
    /// シェルを作る。対話シェルなら端末を開き、シグナルの扱いを設定する。
    pub fn new(opts: Options) -> io::Result<Self> {
        let reaper = Reaper::install(opts.interactive)?;
        let terminal = if opts.interactive {
            Terminal::open()
        } else {
            Terminal::none()
        };
        let mut vars = Vars::from_env();
        let pid = unsafe { libc::getpid() };
        let ppid = unsafe { libc::getppid() };
        let _ = vars.set("PPID", ppid.to_string());
        if let Ok(cwd) = std::env::current_dir() {
            let _ = vars.export("PWD", Some(cwd.to_string_lossy().into_owned()));
        }

        let mut shell = Self {
            opts: Options {
                monitor: false,
                ..opts
            },
            vars,
            functions: HashMap::new(),
            jobs: JobTable::new(),
            reaper,
            terminal,
            path_cache: PathCache::new(),
            coproc: Coproc::default(),
            last_status: 0,
            pid,
            last_bg_pid: None,
            subst_status: None,
            loop_depth: 0,
            func_depth: 0,
            warned_stopped: false,
        };
        if opts.interactive {
            unsafe {
                libc::signal(libc::SIGQUIT, libc::SIG_IGN);
                libc::signal(libc::SIGTERM, libc::SIG_IGN);
            }
        }
        if opts.monitor {
            shell.set_monitor(true);
        }
        tracing::debug!(pid, interactive = opts.interactive, monitor = shell.opts.monitor, "shell started");
        Ok(shell)
    }

    /// ジョブ制御の有効・無効を切り替える。
    ///
    /// 有効中はシェル自身が端末からの停止シグナルを無視する。端末があれば
    /// シェルのプロセスグループを作って端末を取る。
    pub fn set_monitor(&mut self, on: bool) {
        let disposition = if on { libc::SIG_IGN } else { libc::SIG_DFL };
        unsafe {
            libc::signal(libc::SIGTSTP, disposition);
            libc::signal(libc::SIGTTIN, disposition);
            libc::signal(libc::SIGTTOU, disposition);
        }
        if on && self.terminal.is_present() {
            if let Err(e) = self.terminal.take_control() {
                eprintln!("kesh: cannot access tty; job control turned off: {}", e);
                self.opts.monitor = false;
                return;
            }
        }
        self.opts.monitor = on;
    }

    /// fork 直後の子で呼ぶ。
    pub fn enter_child(&mut self) {
        self.opts.interactive = false;
        self.opts.monitor = false;
        self.warned_stopped = false;
    }

    /// 変数に代入する。`PATH` の変更でコマンド検索キャッシュを捨てる。
    pub fn assign(&mut self, name: &str, value: &str) -> Result<(), ShellError> {
        self.vars.set(name, value)?;
        if name == "PATH" {
            self.path_cache.clear();
        }
        Ok(())
    }

    pub fn path(&self) -> String {
        self.vars.get("PATH").unwrap_or(DEFAULT_PATH).to_string()
    }

    /// コマンドツリーを実行して終了ステータスを返す。
    ///
    /// 脱出（`exit`, 内部エラーによる中断）もステータスに変換する。
    pub fn run(&mut self, node: &Command) -> i32 {
        let flow = executor::execute(self, node, ExecFlags::default());
        executor::status_of(self, flow)
    }

    // ── ジョブ ───────────────────────────────────────────────────────

    /// 届いている子プロセスの報告を反映する。
    pub fn reap_jobs(&mut self) {
        self.reaper.reap(&mut self.jobs);
        self.check_coprocess();
    }

    /// コプロセスが終わっていれば書き込み端を閉じる。読み込み端は残りを読めるように残す。
    pub fn check_coprocess(&mut self) {
        if let Some(n) = self.coproc.job {
            let done = self.jobs.get(n).map_or(true, |j| j.is_terminal());
            if done {
                tracing::debug!(job = n, "coprocess finished");
                self.coproc.write = None;
                self.coproc.job = None;
            }
        }
    }

    /// 終了したバックグラウンドジョブを片付ける。対話シェルでは報告を出す。
    pub fn notify_jobs(&mut self) {
        self.reap_jobs();
        for line in self.jobs.collect_finished(self.opts.interactive) {
            eprint!("{}", line);
        }
        self.check_coprocess();
    }

    /// `jobs` の一覧。`selectors` が空なら全ジョブ。
    pub fn job_list(
        &mut self,
        selectors: &[String],
        format: JobFormat,
        changed_only: bool,
    ) -> Result<String, JobError> {
        self.reap_jobs();
        let numbers = selectors
            .iter()
            .map(|s| self.jobs.select(s))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.jobs.report(&numbers, format, changed_only))
    }

    /// ジョブの終了（ジョブ制御中は停止も）を待つ。
    ///
    /// 戻り値は (ステータス, 原因シグナル)。対話シェルで SIGINT により中断したら
    /// ステータスは -1。終了したジョブはテーブルから取り除く。
    pub fn job_wait(&mut self, selector: &str) -> Result<(i32, Option<c_int>), JobError> {
        self.reap_jobs();
        let n = self.jobs.select(selector)?;
        let monitor = self.opts.monitor;
        let interruptible = self.reaper.catches_interrupt();
        let outcome = self.reaper.wait(&mut self.jobs, n, monitor, interruptible)?;
        let signal = self.jobs.get(n).and_then(|j| j.signal());
        match outcome {
            WaitOutcome::Interrupted => Ok((-1, Some(libc::SIGINT))),
            WaitOutcome::Stopped(status) => Ok((status, signal)),
            WaitOutcome::Done(status) => {
                self.jobs.remove(n);
                self.check_coprocess();
                Ok((status, signal))
            }
        }
    }

    /// ジョブにシグナルを送る。
    pub fn job_kill(&mut self, selector: &str, sig: c_int) -> Result<(), ShellError> {
        self.reap_jobs();
        let n = self.jobs.select(selector)?;
        let job = self
            .jobs
            .get(n)
            .ok_or_else(|| JobError::NoSuchJob(selector.to_string()))?;
        job::kill_job(job, sig)?;
        Ok(())
    }

    /// ジョブを再開する（`fg` / `bg`）。
    pub fn job_resume(&mut self, selector: &str, background: bool) -> Result<i32, ShellError> {
        self.reap_jobs();
        if !self.opts.monitor {
            return Err(JobError::NoJobControl.into());
        }
        let n = self.jobs.select(selector)?;
        let (monitor, interactive) = (self.opts.monitor, self.opts.interactive);
        self.reaper.resume(
            &mut self.jobs,
            &mut self.terminal,
            n,
            background,
            monitor,
            interactive,
        )
    }

    /// シェル終了時の後始末。停止中のジョブに SIGHUP（と SIGCONT）を送り、端末を返す。
    pub fn hangup(&mut self) {
        if self.opts.interactive {
            for job in self.jobs.iter().filter(|j| j.is_stopped()) {
                if let Err(e) = job::kill_job(job, libc::SIGHUP) {
                    tracing::debug!(job = job.number, error = %e, "hangup failed");
                }
            }
        }
        self.terminal.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_string_follows_table_order() {
        let opts = Options {
            xtrace: true,
            errexit: true,
            noclobber: true,
            ..Options::default()
        };
        assert_eq!(opts.flag_string(), "Cex");
    }

    #[test]
    fn options_by_name() {
        let mut opts = Options::default();
        assert!(opts.set("nounset", true));
        assert!(opts.nounset);
        assert!(!opts.set("pipefail", true));
        assert_eq!(Options::name_of('f'), Some("noglob"));
        assert_eq!(opts.get("nounset"), Some(true));
    }

    #[test]
    fn assigning_path_clears_cache() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("tool");
        std::fs::write(&exe, "#!/bin/sh\n").unwrap();
        let mut perms = std::fs::metadata(&exe).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&exe, perms).unwrap();

        let mut sh = Shell::new(Options::default()).unwrap();
        let path = dir.path().to_str().unwrap().to_string();
        sh.assign("PATH", &path).unwrap();
        assert!(sh.path_cache.lookup("tool", &sh.path()).is_some());
        assert_eq!(sh.path_cache.entries().len(), 1);
        sh.assign("PATH", "/nonexistent").unwrap();
        assert!(sh.path_cache.entries().is_empty());
    }

    #[test]
    fn job_api_reports_selector_errors() {
        let mut sh = Shell::new(Options::default()).unwrap();
        assert_eq!(sh.job_wait("%3"), Err(JobError::NoSuchJob("%3".into())));
        assert!(matches!(
            sh.job_resume("%1", false),
            Err(ShellError::Job(JobError::NoJobControl))
        ));
        assert_eq!(sh.job_list(&[], JobFormat::Medium, false).unwrap(), "");
    }

    #[test]
    fn run_converts_exit_divert() {
        let mut sh = Shell::new(Options::default()).unwrap();
        let cmd = Command::simple(["exit", "4"]);
        assert_eq!(sh.run(&cmd), 4);
    }
}
