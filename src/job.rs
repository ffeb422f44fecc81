//! ジョブテーブル。
//!
//! ジョブ（パイプライン 1 本 = 1 ジョブ）とその構成プロセスの状態を保持する。
//! プロセスの状態は [`reap`](crate::reap) が `wait4` の結果を [`JobTable::update`]
//! に渡したときだけ変化する（例外は `fg`/`bg` による再開）。
//!
//! ## 状態遷移（プロセス単位）
//!
//! | 遷移 | 契機 |
//! |------|------|
//! | Running → Exited / Signaled / Stopped | wait の報告 |
//! | Stopped → Running | `WIFCONTINUED` の報告、または再開 |
//!
//! ジョブの集約状態は、Running のプロセスが 1 つでもあれば Running、
//! なければ最も重い状態（Exited < Signaled < Stopped）。
//!
//! ## カレントジョブの順序
//!
//! `jobs` ベクタ自体がカレント順（先頭 = `%+`）。停止したジョブ・フォアグラウンドへ
//! 再開したジョブは先頭に移り、新しいジョブは停止中のジョブの後ろに入る。
//!
//! ## ゾンビ
//!
//! `$!` で pid を参照された（known）ジョブは終了後も [`ZOMBIE_MAX`] 個まで保持し、
//! `wait $!` で状態を回収できるようにする。上限を超えたら古いものから捨てる。

use std::time::Duration;

use libc::{c_int, pid_t};

use crate::error::JobError;
use crate::signal;

/// 参照済み終了ジョブの保持上限。
pub const ZOMBIE_MAX: usize = 25;

// ── プロセス ─────────────────────────────────────────────────────────

/// プロセス（およびジョブ）の状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Running,
    Exited(i32),
    Signaled { signal: c_int, core_dumped: bool },
    Stopped(c_int),
}

impl ProcState {
    /// `wait4` の raw status を解釈する。
    pub fn from_wait_status(raw: c_int) -> Self {
        if libc::WIFEXITED(raw) {
            ProcState::Exited(libc::WEXITSTATUS(raw))
        } else if libc::WIFSIGNALED(raw) {
            ProcState::Signaled {
                signal: libc::WTERMSIG(raw),
                core_dumped: libc::WCOREDUMP(raw),
            }
        } else if libc::WIFSTOPPED(raw) {
            ProcState::Stopped(libc::WSTOPSIG(raw))
        } else {
            // WIFCONTINUED
            ProcState::Running
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcState::Exited(_) | ProcState::Signaled { .. })
    }

    /// 集約時の重さ。
    fn severity(&self) -> u8 {
        match self {
            ProcState::Running => 0,
            ProcState::Exited(_) => 1,
            ProcState::Signaled { .. } => 2,
            ProcState::Stopped(_) => 3,
        }
    }

    /// 終了ステータス表現（0〜255 / 128+N）。Running は 0。
    pub fn status(&self) -> i32 {
        match *self {
            ProcState::Running => 0,
            ProcState::Exited(code) => code,
            ProcState::Signaled { signal, .. } => 128 + signal,
            ProcState::Stopped(sig) => 128 + sig,
        }
    }
}

/// ジョブ内の個別プロセス。パイプライン中の各コマンドに対応する。
#[derive(Debug, Clone)]
pub struct Process {
    pub pid: pid_t,
    pub state: ProcState,
    /// `wait4` が返した raw status。
    pub raw_status: c_int,
    /// 表示用コマンド文字列。
    pub command: String,
}

// ── ジョブ ───────────────────────────────────────────────────────────

/// ジョブのフラグ。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFlags {
    /// 全プロセスを起動し終えた。これが立つまで reap を保留する。
    pub started: bool,
    /// 誰かが [`wait`](crate::reap::Reaper::wait) 中。終了しても削除しない。
    pub waiting: bool,
    /// 状態変化を非同期に通知する（対話シェルのバックグラウンドジョブ）。
    pub notify: bool,
    pub foreground: bool,
    /// `stty` ジョブ。正常終了したら端末モードをシェルのモードとして採用する。
    pub use_tty_mode: bool,
    /// 最後の報告以降に状態が変化した。
    pub changed: bool,
    /// `$!` で pid が参照された。
    pub known: bool,
    /// 終了済みで回収待ち。
    pub zombie: bool,
}

/// ジョブ。
#[derive(Debug, Clone)]
pub struct Job {
    /// `[N]` 形式で表示されるジョブ番号。最小未使用番号を再利用する。
    pub number: usize,
    pub processes: Vec<Process>,
    /// プロセスグループ ID。0 = 未割り当て。一度決まったら変わらない。
    pub pgid: pid_t,
    /// ジョブを作ったシェルの pid。
    pub shell_pid: pid_t,
    pub state: ProcState,
    /// 最後のプロセスの終了ステータス（停止中なら 128+停止シグナル）。
    pub status: i32,
    pub user_time: Duration,
    pub sys_time: Duration,
    pub flags: JobFlags,
    /// 停止時に保存した端末モード。
    pub tty_modes: Option<libc::termios>,
    /// 表示用コマンド文字列（ジョブ全体）。
    pub command: String,
    zombie_seq: u64,
}

impl Job {
    fn recompute(&mut self) {
        let state = if self.processes.iter().any(|p| p.state == ProcState::Running) {
            ProcState::Running
        } else {
            self.processes
                .iter()
                .map(|p| p.state)
                .fold(None, |acc: Option<ProcState>, s| match acc {
                    Some(a) if a.severity() >= s.severity() => Some(a),
                    _ => Some(s),
                })
                .unwrap_or(ProcState::Running)
        };
        self.state = state;
        match state {
            ProcState::Stopped(sig) => self.status = 128 + sig,
            s if s.is_terminal() => {
                if let Some(last) = self.processes.last() {
                    self.status = last.state.status();
                }
            }
            _ => {}
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.state, ProcState::Stopped(_))
    }

    /// 最後のプロセスの pid（`$!` の値）。
    pub fn last_pid(&self) -> Option<pid_t> {
        self.processes.last().map(|p| p.pid)
    }

    /// 終了・停止の原因シグナル。
    pub fn signal(&self) -> Option<c_int> {
        match self.state {
            ProcState::Signaled { signal, .. } => Some(signal),
            ProcState::Stopped(sig) => Some(sig),
            _ => None,
        }
    }
}

// ── 表示 ─────────────────────────────────────────────────────────────

/// `jobs` の出力形式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFormat {
    /// フォアグラウンドジョブの異常終了の報告。シグナル説明のみ。
    Short,
    /// `[n] + State  command`
    Medium,
    /// medium + プロセスごとの pid（`jobs -l`）。
    Long,
    /// プロセスグループ ID のみ（`jobs -p`）。
    Pgrp,
}

/// 状態の表示文字列。`short` では正常終了と SIGINT/SIGPIPE は空文字。
fn state_text(state: ProcState, short: bool) -> String {
    match state {
        ProcState::Running => "Running".to_string(),
        ProcState::Stopped(sig) => signal::message(sig),
        ProcState::Exited(_) if short => String::new(),
        ProcState::Exited(0) => "Done".to_string(),
        ProcState::Exited(code) => format!("Done ({})", code),
        ProcState::Signaled { signal: sig, .. }
            if short && (sig == libc::SIGINT || sig == libc::SIGPIPE) =>
        {
            String::new()
        }
        ProcState::Signaled { signal: sig, .. } => signal::message(sig),
    }
}

fn core_text(state: ProcState) -> &'static str {
    match state {
        ProcState::Signaled {
            core_dumped: true, ..
        } => " (core dumped)",
        _ => "",
    }
}

/// ジョブを 1 件整形する。`marker` は `+` / `-` / 空白。
/// 戻り値は末尾改行付き。short で表示すべき内容がなければ空文字。
pub fn format_job(job: &Job, format: JobFormat, marker: char) -> String {
    match format {
        JobFormat::Pgrp => {
            let pgid = if job.pgid > 0 {
                job.pgid
            } else {
                job.processes.first().map(|p| p.pid).unwrap_or(0)
            };
            format!("{}\n", pgid)
        }
        JobFormat::Short => {
            let mut out = String::new();
            for p in &job.processes {
                let text = state_text(p.state, true);
                if !text.is_empty() && !out.contains(&text) {
                    if !out.is_empty() {
                        out.push(' ');
                    }
                    out.push_str(&text);
                    out.push_str(core_text(p.state));
                }
            }
            if out.is_empty() {
                out
            } else {
                out + "\n"
            }
        }
        JobFormat::Medium => {
            // 状態が等しい連続プロセスを 1 行にまとめる
            let mut out = String::new();
            let mut i = 0;
            while i < job.processes.len() {
                let state = job.processes[i].state;
                let mut j = i;
                let mut cmds = Vec::new();
                while j < job.processes.len() && job.processes[j].state == state {
                    cmds.push(job.processes[j].command.as_str());
                    j += 1;
                }
                let head = if i == 0 {
                    format!("[{}] {}", job.number, marker)
                } else {
                    String::new()
                };
                let pipe = if i == 0 { "" } else { "| " };
                let text = format!("{}{}", state_text(state, false), core_text(state));
                out.push_str(&format!("{:<6} {:<20} {}{}\n", head, text, pipe, cmds.join(" | ")));
                i = j;
            }
            if job.processes.is_empty() {
                out.push_str(&format!(
                    "[{}] {} {:<20} {}\n",
                    job.number,
                    marker,
                    state_text(job.state, false),
                    job.command
                ));
            }
            out
        }
        JobFormat::Long => {
            let mut out = String::new();
            for (i, p) in job.processes.iter().enumerate() {
                let head = if i == 0 {
                    format!("[{}] {}", job.number, marker)
                } else {
                    String::new()
                };
                let pipe = if i == 0 { "" } else { "| " };
                let text = format!("{}{}", state_text(p.state, false), core_text(p.state));
                out.push_str(&format!(
                    "{:<6} {:>5} {:<20} {}{}\n",
                    head, p.pid, text, pipe, p.command
                ));
            }
            out
        }
    }
}

// ── JobTable ─────────────────────────────────────────────────────────

/// ジョブテーブル。[`Shell`](crate::shell::Shell) が所有する。
#[derive(Debug, Default)]
pub struct JobTable {
    /// カレント順（先頭 = `%+`）。
    jobs: Vec<Job>,
    zombie_counter: u64,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新しいジョブを登録し、ジョブ番号を返す。最小未使用番号を再利用する。
    pub fn launch(&mut self, command: String, shell_pid: pid_t, flags: JobFlags) -> usize {
        let mut number = 1;
        while self.jobs.iter().any(|j| j.number == number) {
            number += 1;
        }
        let job = Job {
            number,
            processes: Vec::new(),
            pgid: 0,
            shell_pid,
            state: ProcState::Running,
            status: 0,
            user_time: Duration::ZERO,
            sys_time: Duration::ZERO,
            flags: JobFlags {
                started: false,
                ..flags
            },
            tty_modes: None,
            command,
            zombie_seq: 0,
        };
        // 停止中のジョブの後ろに入れる
        let pos = self
            .jobs
            .iter()
            .position(|j| !j.is_stopped())
            .unwrap_or(self.jobs.len());
        self.jobs.insert(pos, job);
        tracing::debug!(job = number, "job launched");
        number
    }

    /// ジョブにプロセスを追加する。
    ///
    /// `leader` が真でプロセスグループが未割り当てなら、この pid をグループ ID にする。
    /// 戻り値はジョブのプロセスグループ ID（未割り当てなら 0）。
    pub fn add_process(
        &mut self,
        number: usize,
        pid: pid_t,
        command: String,
        leader: bool,
    ) -> Result<pid_t, JobError> {
        let job = self
            .get_mut(number)
            .ok_or_else(|| {
                JobError::Internal(format!("add process {} to unknown job {}", pid, number))
            })?;
        if leader && job.pgid == 0 {
            job.pgid = pid;
        }
        job.processes.push(Process {
            pid,
            state: ProcState::Running,
            raw_status: 0,
            command,
        });
        job.recompute();
        tracing::debug!(job = number, pid, pgid = job.pgid, "process added");
        Ok(job.pgid)
    }

    /// 全プロセスの起動完了を記録する。
    pub fn mark_started(&mut self, number: usize) -> Result<(), JobError> {
        let job = self
            .get_mut(number)
            .ok_or_else(|| JobError::Internal(format!("mark_started on unknown job {}", number)))?;
        job.flags.started = true;
        Ok(())
    }

    /// 起動途中のジョブがあるか（あれば reap を保留する）。
    pub fn any_unstarted(&self) -> bool {
        self.jobs.iter().any(|j| !j.flags.started)
    }

    /// `wait4` の報告を反映する。状態が変化したジョブの番号を返す。
    pub fn update(
        &mut self,
        pid: pid_t,
        raw_status: c_int,
        usage: Option<&libc::rusage>,
    ) -> Option<usize> {
        let idx = self
            .jobs
            .iter()
            .position(|j| j.processes.iter().any(|p| p.pid == pid))?;
        let job = &mut self.jobs[idx];
        let new_state = ProcState::from_wait_status(raw_status);
        if let Some(p) = job.processes.iter_mut().find(|p| p.pid == pid) {
            p.state = new_state;
            p.raw_status = raw_status;
        }
        if let (Some(ru), true) = (usage, new_state.is_terminal()) {
            job.user_time += timeval_to_duration(&ru.ru_utime);
            job.sys_time += timeval_to_duration(&ru.ru_stime);
        }
        let before = job.state;
        job.recompute();
        let number = job.number;
        if job.state != before {
            job.flags.changed = true;
            tracing::debug!(job = number, pid, state = ?job.state, "job state changed");
            if job.is_stopped() {
                self.move_to_front(number);
            }
        }
        Some(number)
    }

    /// 停止中のプロセスを Running に戻す（`fg` / `bg`）。
    pub fn set_running(&mut self, number: usize) {
        if let Some(job) = self.get_mut(number) {
            for p in &mut job.processes {
                if matches!(p.state, ProcState::Stopped(_)) {
                    p.state = ProcState::Running;
                }
            }
            job.recompute();
        }
    }

    /// カレント順の先頭に移す。
    pub fn move_to_front(&mut self, number: usize) {
        if let Some(pos) = self.jobs.iter().position(|j| j.number == number) {
            let job = self.jobs.remove(pos);
            self.jobs.insert(0, job);
        }
    }

    pub fn get(&self, number: usize) -> Option<&Job> {
        self.jobs.iter().find(|j| j.number == number)
    }

    pub fn get_mut(&mut self, number: usize) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.number == number)
    }

    /// pid を含むジョブの番号。
    pub fn find_by_pid(&self, pid: pid_t) -> Option<usize> {
        self.jobs
            .iter()
            .find(|j| j.processes.iter().any(|p| p.pid == pid))
            .map(|j| j.number)
    }

    /// ジョブを削除する。
    pub fn remove(&mut self, number: usize) -> Option<Job> {
        let pos = self.jobs.iter().position(|j| j.number == number)?;
        tracing::debug!(job = number, "job removed");
        Some(self.jobs.remove(pos))
    }

    /// 終了したジョブを片付ける: 参照済みならゾンビとして保持、それ以外は削除。
    pub fn retire(&mut self, number: usize) {
        let Some(flags) = self.get(number).map(|j| j.flags) else {
            return;
        };
        if !flags.known {
            self.remove(number);
        } else if !flags.zombie {
            self.zombie_counter += 1;
            let seq = self.zombie_counter;
            if let Some(job) = self.get_mut(number) {
                job.flags.zombie = true;
                job.zombie_seq = seq;
            }
            self.evict_zombies();
        }
    }

    fn evict_zombies(&mut self) {
        while self.jobs.iter().filter(|j| j.flags.zombie).count() > ZOMBIE_MAX {
            let oldest = self
                .jobs
                .iter()
                .filter(|j| j.flags.zombie)
                .min_by_key(|j| j.zombie_seq)
                .map(|j| j.number);
            match oldest {
                Some(n) => {
                    tracing::debug!(job = n, "zombie evicted");
                    self.remove(n);
                }
                None => break,
            }
        }
    }

    /// 終了済みで待たれていないバックグラウンドジョブを片付ける。
    ///
    /// `interactive` なら通知対象（notify かつ変化あり）の medium 形式の報告を返す。
    /// 停止したバックグラウンドジョブも報告するが、削除はしない。
    pub fn collect_finished(&mut self, interactive: bool) -> Vec<String> {
        let mut reports = Vec::new();
        let mut finished = Vec::new();
        let (current, previous) = self.current_pair();
        for job in &mut self.jobs {
            if job.flags.waiting || job.flags.foreground || job.flags.zombie || !job.flags.started {
                continue;
            }
            let report = interactive
                && job.flags.notify
                && job.flags.changed
                && job.state != ProcState::Running;
            if report {
                let marker = marker_for(job.number, current, previous);
                reports.push(format_job(job, JobFormat::Medium, marker));
                job.flags.changed = false;
            }
            if job.is_terminal() {
                finished.push(job.number);
            }
        }
        for n in finished {
            self.retire(n);
        }
        reports
    }

    /// `%+` と `%-` のジョブ番号（未終了・非ゾンビのジョブのカレント順）。
    pub fn current_pair(&self) -> (Option<usize>, Option<usize>) {
        let mut live = self
            .jobs
            .iter()
            .filter(|j| !j.flags.zombie && !j.is_terminal())
            .map(|j| j.number);
        (live.next(), live.next())
    }

    /// ジョブ指定を解決する。
    ///
    /// `%%` `%+` `%` → カレント、`%-` → 1 つ前、`%N` → 番号、`%str` → コマンド前方一致、
    /// `%?str` → コマンド部分一致、`%` なしの数字 → その pid を含むジョブ。
    pub fn select(&self, selector: &str) -> Result<usize, JobError> {
        let Some(rest) = selector.strip_prefix('%') else {
            let pid: pid_t = selector
                .parse()
                .map_err(|_| JobError::BadSelector(selector.to_string()))?;
            return self
                .find_by_pid(pid)
                .ok_or_else(|| JobError::NoSuchJob(selector.to_string()));
        };
        let (current, previous) = self.current_pair();
        match rest {
            "" | "%" | "+" => current.ok_or(JobError::NoCurrentJob),
            "-" => previous.ok_or_else(|| JobError::NoSuchJob(selector.to_string())),
            _ if rest.bytes().all(|b| b.is_ascii_digit()) => {
                let n: usize = rest
                    .parse()
                    .map_err(|_| JobError::BadSelector(selector.to_string()))?;
                self.get(n)
                    .map(|j| j.number)
                    .ok_or_else(|| JobError::NoSuchJob(selector.to_string()))
            }
            _ => {
                let matches: Vec<usize> = match rest.strip_prefix('?') {
                    Some(sub) => self
                        .jobs
                        .iter()
                        .filter(|j| !j.flags.zombie && j.command.contains(sub))
                        .map(|j| j.number)
                        .collect(),
                    None => self
                        .jobs
                        .iter()
                        .filter(|j| !j.flags.zombie && j.command.starts_with(rest))
                        .map(|j| j.number)
                        .collect(),
                };
                match matches.as_slice() {
                    [] => Err(JobError::NoSuchJob(selector.to_string())),
                    [n] => Ok(*n),
                    _ => Err(JobError::Ambiguous(selector.to_string())),
                }
            }
        }
    }

    /// 表示対象のジョブ（ゾンビを除く）の番号を番号順で返す。
    pub fn numbers(&self) -> Vec<usize> {
        let mut all: Vec<usize> = self
            .jobs
            .iter()
            .filter(|j| !j.flags.zombie)
            .map(|j| j.number)
            .collect();
        all.sort_unstable();
        all
    }

    /// `jobs` の報告を作る。
    ///
    /// `numbers` が空なら全ジョブ。`changed_only` なら変化のあったジョブだけ。
    /// 報告したジョブの changed フラグを下ろす。
    pub fn report(&mut self, numbers: &[usize], format: JobFormat, changed_only: bool) -> String {
        let targets = if numbers.is_empty() {
            self.numbers()
        } else {
            numbers.to_vec()
        };
        let (current, previous) = self.current_pair();
        let mut out = String::new();
        for n in targets {
            let Some(job) = self.get_mut(n) else {
                continue;
            };
            if changed_only && !job.flags.changed {
                continue;
            }
            let marker = marker_for(n, current, previous);
            out.push_str(&format_job(job, format, marker));
            job.flags.changed = false;
        }
        out
    }

    pub fn stopped_count(&self) -> usize {
        self.jobs.iter().filter(|j| j.is_stopped()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// 全ジョブを捨てる（fork 直後の子）。
    pub fn clear(&mut self) {
        self.jobs.clear();
    }
}

fn marker_for(number: usize, current: Option<usize>, previous: Option<usize>) -> char {
    if current == Some(number) {
        '+'
    } else if previous == Some(number) {
        '-'
    } else {
        ' '
    }
}

fn timeval_to_duration(tv: &libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

/// `getrusage(who)` のユーザー時間とシステム時間。`RUSAGE_SELF` / `RUSAGE_CHILDREN`。
pub fn resource_usage(who: c_int) -> (Duration, Duration) {
    let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrusage(who, &mut ru) } != 0 {
        return (Duration::ZERO, Duration::ZERO);
    }
    (timeval_to_duration(&ru.ru_utime), timeval_to_duration(&ru.ru_stime))
}

/// ジョブにシグナルを送る。プロセスグループがあればグループへ、なければ生きている各プロセスへ。
/// 停止中のジョブへの SIGHUP / SIGTERM の後には SIGCONT も送る。
pub fn kill_job(job: &Job, sig: c_int) -> std::io::Result<()> {
    let send = |sig: c_int| -> std::io::Result<()> {
        if job.pgid > 0 {
            if unsafe { libc::killpg(job.pgid, sig) } < 0 {
                return Err(std::io::Error::last_os_error());
            }
        } else {
            let mut result = Ok(());
            for p in job.processes.iter().filter(|p| !p.state.is_terminal()) {
                if unsafe { libc::kill(p.pid, sig) } < 0 && result.is_ok() {
                    result = Err(std::io::Error::last_os_error());
                }
            }
            result?;
        }
        Ok(())
    };
    tracing::debug!(job = job.number, sig, pgid = job.pgid, "signalling job");
    send(sig)?;
    if job.is_stopped() && (sig == libc::SIGHUP || sig == libc::SIGTERM) {
        send(libc::SIGCONT)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// raw wait status を組み立てる（Linux のエンコーディング）。
    fn exited(code: i32) -> c_int {
        (code & 0xff) << 8
    }
    fn signaled(sig: c_int) -> c_int {
        sig & 0x7f
    }
    fn stopped(sig: c_int) -> c_int {
        ((sig & 0xff) << 8) | 0x7f
    }

    fn bg() -> JobFlags {
        JobFlags {
            notify: true,
            ..JobFlags::default()
        }
    }

    fn started_job(t: &mut JobTable, cmd: &str, pids: &[pid_t]) -> usize {
        let n = t.launch(cmd.to_string(), 1, bg());
        for (i, &pid) in pids.iter().enumerate() {
            t.add_process(n, pid, format!("{}{}", cmd, i), i == 0).unwrap();
        }
        t.mark_started(n).unwrap();
        n
    }

    #[test]
    fn decode_wait_status() {
        assert_eq!(ProcState::from_wait_status(exited(3)), ProcState::Exited(3));
        assert_eq!(
            ProcState::from_wait_status(signaled(libc::SIGTERM)),
            ProcState::Signaled {
                signal: libc::SIGTERM,
                core_dumped: false
            }
        );
        assert_eq!(
            ProcState::from_wait_status(stopped(libc::SIGTSTP)),
            ProcState::Stopped(libc::SIGTSTP)
        );
    }

    #[test]
    fn numbers_reuse_smallest_free() {
        let mut t = JobTable::new();
        let a = started_job(&mut t, "a", &[100]);
        let b = started_job(&mut t, "b", &[200]);
        assert_eq!((a, b), (1, 2));
        t.remove(1);
        assert_eq!(started_job(&mut t, "c", &[300]), 1);
        assert_eq!(started_job(&mut t, "d", &[400]), 3);
    }

    #[test]
    fn status_comes_from_last_process() {
        let mut t = JobTable::new();
        let n = started_job(&mut t, "p", &[10, 11, 12]);
        // 最後の段が先に終わっても、全段が終わるまで Running
        assert_eq!(t.update(12, exited(7), None), Some(n));
        assert_eq!(t.get(n).unwrap().state, ProcState::Running);
        t.update(10, exited(1), None);
        t.update(11, signaled(libc::SIGPIPE), None);
        let job = t.get(n).unwrap();
        assert!(job.is_terminal());
        // 集約状態は最も重いもの、ステータスは最後の段
        assert!(matches!(job.state, ProcState::Signaled { .. }));
        assert_eq!(job.status, 7);
    }

    #[test]
    fn stop_and_continue() {
        let mut t = JobTable::new();
        let a = started_job(&mut t, "a", &[10]);
        let b = started_job(&mut t, "b", &[20]);
        assert_eq!(t.current_pair(), (Some(b), Some(a)));
        t.update(10, stopped(libc::SIGSTOP), None);
        let job = t.get(a).unwrap();
        assert!(job.is_stopped());
        assert_eq!(job.status, 128 + libc::SIGSTOP);
        // 停止したジョブがカレントになる
        assert_eq!(t.select("%+"), Ok(a));
        assert_eq!(t.select("%-"), Ok(b));
        // 新しいジョブは停止中のジョブの後ろ
        let c = started_job(&mut t, "c", &[30]);
        assert_eq!(t.select("%%"), Ok(a));
        assert_eq!(t.select("%-"), Ok(c));
        t.set_running(a);
        assert_eq!(t.get(a).unwrap().state, ProcState::Running);
    }

    #[test]
    fn unknown_pid_is_ignored() {
        let mut t = JobTable::new();
        started_job(&mut t, "a", &[10]);
        assert_eq!(t.update(999, exited(0), None), None);
    }

    #[test]
    fn add_process_to_unknown_job_is_internal() {
        let mut t = JobTable::new();
        let err = t.add_process(9, 1, "x".into(), true).unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn pgid_is_fixed_once_set() {
        let mut t = JobTable::new();
        let n = t.launch("p".into(), 1, bg());
        assert_eq!(t.add_process(n, 50, "a".into(), true), Ok(50));
        assert_eq!(t.add_process(n, 51, "b".into(), true), Ok(50));
    }

    #[test]
    fn selectors() {
        let mut t = JobTable::new();
        started_job(&mut t, "sleep 10", &[10]);
        started_job(&mut t, "sleep 20", &[20]);
        started_job(&mut t, "vi notes", &[30, 31]);
        assert_eq!(t.select("%2"), Ok(2));
        assert_eq!(t.select("%vi"), Ok(3));
        assert_eq!(t.select("%?notes"), Ok(3));
        assert_eq!(t.select("%sleep"), Err(JobError::Ambiguous("%sleep".into())));
        assert_eq!(t.select("%emacs"), Err(JobError::NoSuchJob("%emacs".into())));
        assert_eq!(t.select("31"), Ok(3));
        assert_eq!(t.select("abc"), Err(JobError::BadSelector("abc".into())));
        assert_eq!(t.select("%7"), Err(JobError::NoSuchJob("%7".into())));
        assert_eq!(JobTable::new().select("%+"), Err(JobError::NoCurrentJob));
    }

    #[test]
    fn medium_and_long_reports() {
        let mut t = JobTable::new();
        let n = started_job(&mut t, "sleep", &[4242]);
        let medium = t.report(&[n], JobFormat::Medium, false);
        assert!(medium.starts_with("[1] +"), "{medium}");
        assert!(medium.contains("Running"));
        assert!(medium.contains("sleep0"));
        let long = t.report(&[n], JobFormat::Long, false);
        assert!(long.contains("4242"));
        assert_eq!(t.report(&[n], JobFormat::Pgrp, false), "4242\n");
    }

    #[test]
    fn report_states() {
        let mut t = JobTable::new();
        let a = started_job(&mut t, "a", &[1]);
        t.update(1, exited(0), None);
        let b = started_job(&mut t, "b", &[2]);
        t.update(2, exited(3), None);
        let c = started_job(&mut t, "c", &[3]);
        t.update(3, stopped(libc::SIGTTIN), None);
        let d = started_job(&mut t, "d", &[4]);
        t.update(4, signaled(libc::SIGKILL) | 0x80, None);
        let out = t.report(&[a, b, c, d], JobFormat::Medium, false);
        assert!(out.contains("Done "));
        assert!(out.contains("Done (3)"));
        assert!(out.contains("Stopped (tty input)"));
        assert!(out.contains("Killed (core dumped)"));
    }

    #[test]
    fn short_report_hides_interrupt() {
        let mut t = JobTable::new();
        let a = started_job(&mut t, "a", &[1]);
        t.update(1, signaled(libc::SIGINT), None);
        assert_eq!(format_job(t.get(a).unwrap(), JobFormat::Short, ' '), "");
        let b = started_job(&mut t, "b", &[2]);
        t.update(2, signaled(libc::SIGTERM), None);
        assert_eq!(format_job(t.get(b).unwrap(), JobFormat::Short, ' '), "Terminated\n");
    }

    #[test]
    fn changed_only_report_clears_flag() {
        let mut t = JobTable::new();
        let a = started_job(&mut t, "a", &[1]);
        t.update(1, stopped(libc::SIGTSTP), None);
        assert!(!t.report(&[], JobFormat::Medium, true).is_empty());
        assert!(t.report(&[], JobFormat::Medium, true).is_empty());
        assert!(!t.get(a).unwrap().flags.changed);
    }

    #[test]
    fn finished_jobs_are_removed_unless_known() {
        let mut t = JobTable::new();
        let a = started_job(&mut t, "a", &[1]);
        let b = started_job(&mut t, "b", &[2]);
        t.get_mut(b).unwrap().flags.known = true;
        t.update(1, exited(0), None);
        t.update(2, exited(5), None);
        assert!(t.collect_finished(false).is_empty());
        assert!(t.get(a).is_none());
        let zombie = t.get(b).unwrap();
        assert!(zombie.flags.zombie);
        assert_eq!(zombie.status, 5);
        assert_eq!(t.numbers(), Vec::<usize>::new());
    }

    #[test]
    fn interactive_notification() {
        let mut t = JobTable::new();
        started_job(&mut t, "sleep", &[1]);
        t.update(1, exited(0), None);
        let reports = t.collect_finished(true);
        assert_eq!(reports.len(), 1);
        assert!(reports[0].contains("Done"));
        assert!(t.is_empty());
    }

    #[test]
    fn unstarted_job_is_not_collected() {
        let mut t = JobTable::new();
        let n = t.launch("p".into(), 1, bg());
        t.add_process(n, 1, "a".into(), true).unwrap();
        assert!(t.any_unstarted());
        t.update(1, exited(0), None);
        t.collect_finished(false);
        assert!(t.get(n).is_some());
    }

    #[test]
    fn waiting_job_survives_collection() {
        let mut t = JobTable::new();
        let n = started_job(&mut t, "a", &[1]);
        t.get_mut(n).unwrap().flags.waiting = true;
        t.update(1, exited(0), None);
        t.collect_finished(false);
        assert!(t.get(n).is_some());
    }

    proptest! {
        #[test]
        fn zombie_cache_is_bounded(count in 0usize..60) {
            let mut t = JobTable::new();
            for i in 0..count {
                let pid = 1000 + i as pid_t;
                let n = started_job(&mut t, "z", &[pid]);
                t.get_mut(n).unwrap().flags.known = true;
                t.update(pid, exited(0), None);
                t.collect_finished(false);
            }
            let zombies = t.iter().filter(|j| j.flags.zombie).count();
            prop_assert_eq!(zombies, count.min(ZOMBIE_MAX));
            // 残っているのは新しい方
            if count > ZOMBIE_MAX {
                let oldest_kept = 1000 + (count - ZOMBIE_MAX) as pid_t;
                prop_assert!(t.find_by_pid(oldest_kept).is_some());
                prop_assert!(t.find_by_pid(oldest_kept - 1).is_none());
            }
        }

        #[test]
        fn running_iff_any_process_running(states in proptest::collection::vec(0u8..4, 1..6)) {
            let mut t = JobTable::new();
            let pids: Vec<pid_t> = (1..=states.len() as pid_t).collect();
            let n = started_job(&mut t, "p", &pids);
            for (pid, s) in pids.iter().zip(&states) {
                let raw = match s {
                    0 => continue,
                    1 => exited(0),
                    2 => signaled(libc::SIGTERM),
                    _ => stopped(libc::SIGTSTP),
                };
                t.update(*pid, raw, None);
            }
            let job = t.get(n).unwrap();
            let any_running = states.iter().any(|&s| s == 0);
            prop_assert_eq!(job.state == ProcState::Running, any_running);
            if !any_running {
                let max = states.iter().copied().max().unwrap_or(0);
                let expect = match max {
                    1 => matches!(job.state, ProcState::Exited(_)),
                    2 => matches!(job.state, ProcState::Signaled { .. }),
                    _ => matches!(job.state, ProcState::Stopped(_)),
                };
                prop_assert!(expect);
            }
        }

        #[test]
        fn report_is_idempotent(n in 1usize..6) {
            let mut t = JobTable::new();
            for i in 0..n {
                started_job(&mut t, "job", &[100 + i as pid_t]);
            }
            let first = t.report(&[], JobFormat::Long, false);
            let second = t.report(&[], JobFormat::Long, false);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn current_is_most_recent(n in 1usize..8) {
            let mut t = JobTable::new();
            let mut last = 0;
            let mut prev = None;
            for i in 0..n {
                prev = if i > 0 { Some(last) } else { None };
                last = started_job(&mut t, "j", &[10 + i as pid_t]);
            }
            prop_assert_eq!(t.select("%+"), Ok(last));
            match prev {
                Some(p) => prop_assert_eq!(t.select("%-"), Ok(p)),
                None => prop_assert!(t.select("%-").is_err()),
            }
        }
    }
}
