//! シグナル駆動の reaper。
//!
//! SIGCHLD ハンドラはフラグを立てるだけ（`signal_hook::flag`）。実際の回収は
//! メインの制御フロー上で [`Reaper::reap`] が `wait4(-1, WNOHANG|WUNTRACED|WCONTINUED)`
//! を繰り返して行い、結果をジョブテーブルに反映する。
//!
//! 起動途中（started でない）のジョブがある間は回収を保留する。パイプラインの
//! 前段が、後段の登録前に終了してしまう競合を避けるため。保留した場合は
//! [`Reaper::mark_started`] が回収をやり直す。
//!
//! ブロッキング待機（[`Reaper::wait`]）は SIGCHLD をマスクした状態で状態を確認し、
//! `sigsuspend` でマスクを外して次の報告を待つ。確認と待機の間に報告を取りこぼさない。

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use libc::c_int;

use crate::error::{JobError, ShellError};
use crate::job::{self, JobFormat, JobTable, ProcState};
use crate::tty::Terminal;

/// 待機の結果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// 終了した。ステータス（0〜255 / 128+N）。
    Done(i32),
    /// 停止した（ジョブ制御が有効なときのみ）。128+停止シグナル。
    Stopped(i32),
    /// SIGINT で待機を中断した。ジョブはそのまま。
    Interrupted,
}

impl WaitOutcome {
    /// 終了ステータスとしての値。中断は 128+SIGINT。
    pub fn status(self) -> i32 {
        match self {
            WaitOutcome::Done(s) | WaitOutcome::Stopped(s) => s,
            WaitOutcome::Interrupted => 128 + libc::SIGINT,
        }
    }
}

/// シグナルフラグと保留状態。
#[derive(Debug)]
pub struct Reaper {
    sigchld: Arc<AtomicBool>,
    sigint: Arc<AtomicBool>,
    /// 起動途中のジョブがあって回収を見送った。
    held: bool,
    catching_int: bool,
}

// ── シグナルマスク ───────────────────────────────────────────────────

/// スコープ中だけシグナルをブロックする。
struct BlockGuard {
    old: libc::sigset_t,
}

impl BlockGuard {
    fn block(signals: &[c_int]) -> Self {
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            let mut old: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            for &s in signals {
                libc::sigaddset(&mut set, s);
            }
            libc::sigprocmask(libc::SIG_BLOCK, &set, &mut old);
            Self { old }
        }
    }

    /// ブロック前のマスクから `signals` を外したマスクで 1 回シグナルを待つ。
    fn suspend(&self, signals: &[c_int]) {
        unsafe {
            let mut mask = self.old;
            for &s in signals {
                libc::sigdelset(&mut mask, s);
            }
            libc::sigsuspend(&mask);
        }
    }
}

impl Drop for BlockGuard {
    fn drop(&mut self) {
        unsafe {
            libc::sigprocmask(libc::SIG_SETMASK, &self.old, std::ptr::null_mut());
        }
    }
}

impl Reaper {
    /// SIGCHLD（と `catch_int` なら SIGINT）のフラグハンドラを登録する。
    pub fn install(catch_int: bool) -> io::Result<Self> {
        let sigchld = Arc::new(AtomicBool::new(false));
        let sigint = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(libc::SIGCHLD, Arc::clone(&sigchld))?;
        if catch_int {
            signal_hook::flag::register(libc::SIGINT, Arc::clone(&sigint))?;
        }
        Ok(Self {
            sigchld,
            sigint,
            held: false,
            catching_int: catch_int,
        })
    }

    /// 保留中の SIGINT を取り出す。
    pub fn take_interrupt(&self) -> bool {
        self.sigint.swap(false, Ordering::SeqCst)
    }

    /// フォアグラウンドジョブが SIGINT で終わったときに、シェル自身が受けたのと同じ扱いにする。
    pub fn raise_interrupt(&self) {
        if self.catching_int {
            self.sigint.store(true, Ordering::SeqCst);
        }
    }

    pub fn catches_interrupt(&self) -> bool {
        self.catching_int
    }

    /// SIGCHLD が届いていれば子プロセスを回収する。状態の変わったジョブ番号を返す。
    pub fn reap(&mut self, jobs: &mut JobTable) -> Vec<usize> {
        if !self.sigchld.load(Ordering::SeqCst) {
            return Vec::new();
        }
        if jobs.any_unstarted() {
            tracing::trace!("reap held: job not started");
            self.held = true;
            return Vec::new();
        }
        self.sigchld.store(false, Ordering::SeqCst);

        let mut changed = Vec::new();
        loop {
            let mut status: c_int = 0;
            let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
            let flags = libc::WNOHANG | libc::WUNTRACED | libc::WCONTINUED;
            let pid = unsafe { libc::wait4(-1, &mut status, flags, &mut usage) };
            if pid == 0 {
                break;
            }
            if pid < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                break;
            }
            match jobs.update(pid, status, Some(&usage)) {
                Some(n) => {
                    tracing::trace!(pid, status, job = n, "reaped");
                    if !changed.contains(&n) {
                        changed.push(n);
                    }
                }
                None => tracing::debug!(pid, status, "reaped unknown child"),
            }
        }
        changed
    }

    /// ジョブの起動完了を記録し、保留していた回収があればやり直す。
    pub fn mark_started(&mut self, jobs: &mut JobTable, number: usize) -> Result<(), JobError> {
        jobs.mark_started(number)?;
        if self.held && !jobs.any_unstarted() {
            self.held = false;
            self.reap(jobs);
        }
        Ok(())
    }

    /// ジョブが終了するまで（`monitor` なら停止するまで）待つ。
    ///
    /// `interruptible` なら SIGINT で [`WaitOutcome::Interrupted`] を返す。
    /// 起動していないジョブ・存在しないジョブを待つのは内部エラー。
    pub fn wait(
        &mut self,
        jobs: &mut JobTable,
        number: usize,
        monitor: bool,
        interruptible: bool,
    ) -> Result<WaitOutcome, JobError> {
        match jobs.get_mut(number) {
            Some(job) if job.flags.started => job.flags.waiting = true,
            Some(_) => {
                return Err(JobError::Internal(format!(
                    "waiting on job {} that was never started",
                    number
                )))
            }
            None => return Err(JobError::Internal(format!("waiting on unknown job {}", number))),
        }

        let interruptible = interruptible && self.catching_int;
        let signals: &[c_int] = if interruptible {
            &[libc::SIGCHLD, libc::SIGINT]
        } else {
            &[libc::SIGCHLD]
        };
        let guard = BlockGuard::block(signals);
        let outcome = loop {
            self.reap(jobs);
            let Some(job) = jobs.get(number) else {
                break Err(JobError::Internal(format!("job {} vanished while waited on", number)));
            };
            if job.is_terminal() {
                break Ok(WaitOutcome::Done(job.status));
            }
            if monitor && job.is_stopped() {
                break Ok(WaitOutcome::Stopped(job.status));
            }
            if interruptible && self.take_interrupt() {
                break Ok(WaitOutcome::Interrupted);
            }
            guard.suspend(signals);
        };
        drop(guard);

        if let Some(job) = jobs.get_mut(number) {
            job.flags.waiting = false;
        }
        outcome
    }

    /// フォアグラウンドジョブを待ち、端末をシェルに戻す。
    ///
    /// 停止したらジョブの端末モードを保存してテーブルに残す（対話シェルでは報告を出す）。
    /// 終了したらシグナル終了の説明を出してテーブルから取り除く。
    pub fn wait_foreground(
        &mut self,
        jobs: &mut JobTable,
        term: &mut Terminal,
        number: usize,
        monitor: bool,
        interactive: bool,
    ) -> Result<i32, JobError> {
        let outcome = self.wait(jobs, number, monitor, false)?;
        let job = jobs
            .get_mut(number)
            .ok_or_else(|| JobError::Internal(format!("foreground job {} lost", number)))?;

        if monitor && term.is_present() {
            if job.is_stopped() {
                job.tty_modes = term.get_modes();
            }
            term.reclaim();
            if job.flags.use_tty_mode && job.state == ProcState::Exited(0) {
                term.save_modes();
            } else {
                term.restore_shell_modes();
            }
        }

        match outcome {
            WaitOutcome::Stopped(status) => {
                job.flags.foreground = false;
                job.flags.notify = interactive;
                job.flags.changed = false;
                if interactive {
                    let (current, previous) = jobs.current_pair();
                    let marker = if current == Some(number) {
                        '+'
                    } else if previous == Some(number) {
                        '-'
                    } else {
                        ' '
                    };
                    if let Some(job) = jobs.get(number) {
                        eprint!("\n{}", job::format_job(job, JobFormat::Medium, marker));
                    }
                }
                Ok(status)
            }
            WaitOutcome::Done(status) => {
                let short = job::format_job(job, JobFormat::Short, ' ');
                if !short.is_empty() {
                    eprint!("{}", short);
                }
                jobs.remove(number);
                Ok(status)
            }
            WaitOutcome::Interrupted => Ok(128 + libc::SIGINT),
        }
    }

    /// 停止中（または実行中）のジョブを再開する（`fg` / `bg`）。
    ///
    /// `fg` はジョブのコマンドを表示し、端末を渡して保存済みの端末モードを戻してから
    /// SIGCONT を送り、終了か停止まで待つ。`bg` は `[n] command` を表示して 0 を返す。
    pub fn resume(
        &mut self,
        jobs: &mut JobTable,
        term: &mut Terminal,
        number: usize,
        background: bool,
        monitor: bool,
        interactive: bool,
    ) -> Result<i32, ShellError> {
        if !monitor {
            return Err(JobError::NoJobControl.into());
        }
        let job = jobs
            .get_mut(number)
            .ok_or_else(|| JobError::NoSuchJob(format!("%{}", number)))?;
        if job.is_terminal() {
            return Err(JobError::Finished(format!("%{}", number)).into());
        }

        if background {
            println!("[{}] {}", job.number, job.command);
            job.flags.foreground = false;
            job.flags.notify = interactive;
        } else {
            println!("{}", job.command);
            job.flags.foreground = true;
            if job.pgid > 0 {
                term.give_to(job.pgid);
            }
            if let Some(modes) = &job.tty_modes {
                term.set_modes(modes);
            }
            jobs.move_to_front(number);
        }

        jobs.set_running(number);
        let Some(job) = jobs.get(number) else {
            return Err(JobError::Internal(format!("job {} lost during resume", number)).into());
        };
        if let Err(e) = job::kill_job(job, libc::SIGCONT) {
            if !background {
                term.reclaim();
            }
            return Err(e.into());
        }

        if background {
            Ok(0)
        } else {
            Ok(self.wait_foreground(jobs, term, number, monitor, interactive)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobFlags;

    #[test]
    fn waiting_on_unstarted_job_is_internal() {
        let mut reaper = Reaper {
            sigchld: Arc::new(AtomicBool::new(false)),
            sigint: Arc::new(AtomicBool::new(false)),
            held: false,
            catching_int: false,
        };
        let mut jobs = JobTable::new();
        let n = jobs.launch("x".into(), 1, JobFlags::default());
        let err = reaper.wait(&mut jobs, n, false, false).unwrap_err();
        assert!(err.is_internal());
        let err = reaper.wait(&mut jobs, 42, false, false).unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn reap_is_held_while_a_job_is_unstarted() {
        let mut reaper = Reaper {
            sigchld: Arc::new(AtomicBool::new(true)),
            sigint: Arc::new(AtomicBool::new(false)),
            held: false,
            catching_int: false,
        };
        let mut jobs = JobTable::new();
        let n = jobs.launch("x".into(), 1, JobFlags::default());
        assert!(reaper.reap(&mut jobs).is_empty());
        assert!(reaper.held);
        // フラグは保留中も残る
        assert!(reaper.sigchld.load(Ordering::SeqCst));
        jobs.mark_started(n).unwrap();
        assert!(jobs.get(n).unwrap().flags.started);
    }

    #[test]
    fn finished_job_is_returned_without_blocking() {
        let mut reaper = Reaper {
            sigchld: Arc::new(AtomicBool::new(false)),
            sigint: Arc::new(AtomicBool::new(false)),
            held: false,
            catching_int: false,
        };
        let mut jobs = JobTable::new();
        let n = jobs.launch("x".into(), 1, JobFlags::default());
        // 実在しない pid を使い、wait4 の報告を直接与える
        jobs.add_process(n, 999_999, "x".into(), false).unwrap();
        jobs.mark_started(n).unwrap();
        jobs.update(999_999, 3 << 8, None);
        let outcome = reaper.wait(&mut jobs, n, false, false).unwrap();
        assert_eq!(outcome, WaitOutcome::Done(3));
        assert!(!jobs.get(n).unwrap().flags.waiting);
        assert_eq!(outcome.status(), 3);
    }

    #[test]
    fn resume_requires_job_control() {
        let mut reaper = Reaper {
            sigchld: Arc::new(AtomicBool::new(false)),
            sigint: Arc::new(AtomicBool::new(false)),
            held: false,
            catching_int: false,
        };
        let mut jobs = JobTable::new();
        let mut term = Terminal::none();
        let err = reaper
            .resume(&mut jobs, &mut term, 1, true, false, false)
            .unwrap_err();
        assert!(matches!(err, ShellError::Job(JobError::NoJobControl)));
    }
}
