//! 端末コントローラ。
//!
//! 制御端末の fd（高位・close-on-exec）、シェル自身のプロセスグループ、
//! シェルの端末モード（termios）を保持する。ジョブ制御の操作は全てこの
//! オブジェクト経由で端末の所有権を移す。端末がなければ全操作は何もしない。

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use libc::pid_t;

use crate::fd;

/// 制御端末。
#[derive(Debug)]
pub struct Terminal {
    fd: Option<OwnedFd>,
    /// シェル自身のプロセスグループ。
    shell_pgid: pid_t,
    /// 起動時に端末を持っていたプロセスグループ（終了時に返す）。
    original_pgid: pid_t,
    /// シェルの端末モード。
    modes: Option<libc::termios>,
}

impl Terminal {
    /// 端末なし。
    pub fn none() -> Self {
        Self {
            fd: None,
            shell_pgid: unsafe { libc::getpgrp() },
            original_pgid: 0,
            modes: None,
        }
    }

    /// `/dev/tty` を開く。開けなければ端末である標準入力を複製する。
    pub fn open() -> Self {
        let mut term = Self::none();
        let path = b"/dev/tty\0".as_ptr() as *const libc::c_char;
        let raw = unsafe { libc::open(path, libc::O_RDWR | libc::O_CLOEXEC) };
        let owned = if raw >= 0 {
            Some(unsafe { OwnedFd::from_raw_fd(raw) })
        } else if unsafe { libc::isatty(0) } == 1 {
            fd::dup_high(0).ok()
        } else {
            None
        };
        // 番号をユーザー用の 0〜9 から外す
        term.fd = owned.and_then(|o| {
            if o.as_raw_fd() >= fd::FD_HIGH {
                Some(o)
            } else {
                fd::dup_high(o.as_raw_fd()).ok()
            }
        });
        if let Some(f) = &term.fd {
            tracing::debug!(fd = f.as_raw_fd(), "opened controlling terminal");
        }
        term
    }

    pub fn is_present(&self) -> bool {
        self.fd.is_some()
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|f| f.as_raw_fd())
    }

    /// 端末のフォアグラウンドになるまで待ち、自身のプロセスグループを作って端末を取る。
    ///
    /// ジョブ制御（`set -m`）を有効にするときに呼ぶ。呼び出し前に SIGTTOU/SIGTTIN/SIGTSTP
    /// は無視されていないこと（バックグラウンドなら SIGTTIN で停止して待つため）。
    pub fn take_control(&mut self) -> io::Result<()> {
        let Some(tfd) = self.raw_fd() else {
            return Ok(());
        };
        loop {
            let fg = unsafe { libc::tcgetpgrp(tfd) };
            if fg < 0 {
                return Err(io::Error::last_os_error());
            }
            let own = unsafe { libc::getpgrp() };
            if fg == own {
                self.original_pgid = fg;
                break;
            }
            // バックグラウンドで起動された → フォアグラウンドに戻されるまで停止
            unsafe {
                libc::kill(-own, libc::SIGTTIN);
            }
        }
        let pid = unsafe { libc::getpid() };
        if unsafe { libc::getpgrp() } != pid && unsafe { libc::setpgid(0, pid) } < 0 {
            return Err(io::Error::last_os_error());
        }
        self.shell_pgid = pid;
        self.give_to(pid);
        self.save_modes();
        tracing::debug!(pgid = pid, original = self.original_pgid, "took terminal");
        Ok(())
    }

    /// 端末のフォアグラウンドプロセスグループを `pgid` にする。
    pub fn give_to(&self, pgid: pid_t) {
        if let Some(tfd) = self.raw_fd() {
            if unsafe { libc::tcsetpgrp(tfd, pgid) } < 0 {
                tracing::debug!(pgid, error = %io::Error::last_os_error(), "tcsetpgrp failed");
            }
        }
    }

    /// 端末をシェルに戻す。
    pub fn reclaim(&self) {
        self.give_to(self.shell_pgid);
    }

    /// 終了時: 起動時のプロセスグループへ端末を返す。
    pub fn release(&self) {
        if self.original_pgid > 0 && self.original_pgid != self.shell_pgid {
            if unsafe { libc::setpgid(0, self.original_pgid) } == 0 {
                self.give_to(self.original_pgid);
            }
        }
    }

    /// 現在の端末モードを取得する。
    pub fn get_modes(&self) -> Option<libc::termios> {
        let tfd = self.raw_fd()?;
        let mut t: libc::termios = unsafe { std::mem::zeroed() };
        (unsafe { libc::tcgetattr(tfd, &mut t) } == 0).then_some(t)
    }

    /// 端末モードを設定する。
    pub fn set_modes(&self, modes: &libc::termios) {
        if let Some(tfd) = self.raw_fd() {
            unsafe {
                libc::tcsetattr(tfd, libc::TCSADRAIN, modes);
            }
        }
    }

    /// 現在のモードをシェルのモードとして記録する（起動時と `stty` 成功後）。
    pub fn save_modes(&mut self) {
        if let Some(m) = self.get_modes() {
            self.modes = Some(m);
        }
    }

    /// シェルのモードを端末に書き戻す。
    pub fn restore_shell_modes(&self) {
        if let Some(m) = &self.modes {
            self.set_modes(m);
        }
    }
}
