//! プロセスの起動。
//!
//! `fork` の前に出力バッファを吐き出し、`EAGAIN` なら待ち時間を倍にしながら
//! 再試行する。子プロセス側では次の順に準備してから呼び出し元に戻る:
//!
//! 1. 親の退避 fd コピーを閉じる（[`fd::detach_saved`]）
//! 2. シグナルの扱いをジョブ制御モードに合わせて戻す
//! 3. ジョブテーブルを空にし、非対話・ジョブ制御なしにする
//! 4. パイプの接続と不要な端のクローズ
//! 5. プロセスグループの設定（フォアグラウンドなら端末も取る）
//!
//! 外部コマンドは [`exec`] で `execve` する。シェルの処理を続ける子は
//! 最後に [`exit_child`] で終わる。

use std::ffi::CString;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::Duration;

use libc::pid_t;

use crate::error::ShellError;
use crate::fd;
use crate::shell::Shell;

/// `fork` の最大試行回数。
const FORK_TRIES: u32 = 5;
/// 最初の再試行までの待ち時間。以降は倍々。
const FORK_SLEEP: Duration = Duration::from_secs(1);

/// 子プロセスの準備内容。
#[derive(Debug, Default, Clone)]
pub struct ChildSetup {
    /// `Some(0)` なら自分がグループリーダー、`Some(pg)` なら既存グループへ参加。
    /// `None` ならプロセスグループを変えない（ジョブ制御なし）。
    pub pgid: Option<pid_t>,
    /// 端末のフォアグラウンドを取る。
    pub foreground: bool,
    /// ジョブ制御なしのバックグラウンド。SIGINT/SIGQUIT を無視し、stdin を `/dev/null` にする。
    pub async_no_monitor: bool,
    pub stdin: Option<RawFd>,
    pub stdout: Option<RawFd>,
    /// 子で閉じる fd（パイプの未使用端）。
    pub close: Vec<RawFd>,
}

/// [`fork`] の結果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forked {
    Parent(pid_t),
    Child,
}

// ── fork ─────────────────────────────────────────────────────────────

fn raw_fork() -> io::Result<pid_t> {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
    let mut sleep = FORK_SLEEP;
    let mut attempt = 1;
    loop {
        let pid = unsafe { libc::fork() };
        if pid >= 0 {
            return Ok(pid);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EAGAIN) || attempt >= FORK_TRIES {
            return Err(err);
        }
        tracing::warn!(attempt, ?sleep, "fork: EAGAIN, retrying");
        std::thread::sleep(sleep);
        sleep *= 2;
        attempt += 1;
    }
}

/// プロセスを作る。子では [`ChildSetup`] に従って準備してから [`Forked::Child`] を返す。
pub fn fork(shell: &mut Shell, setup: &ChildSetup) -> Result<Forked, ShellError> {
    let pid = raw_fork().map_err(ShellError::Fork)?;
    if pid > 0 {
        // 子と親の両方で setpgid する（どちらが先に走っても同じ結果になる）
        if let Some(pg) = setup.pgid {
            let pg = if pg == 0 { pid } else { pg };
            unsafe {
                libc::setpgid(pid, pg);
            }
        }
        tracing::debug!(pid, pgid = ?setup.pgid, fg = setup.foreground, "forked");
        return Ok(Forked::Parent(pid));
    }

    child_setup(shell, setup);
    Ok(Forked::Child)
}

fn child_setup(shell: &mut Shell, setup: &ChildSetup) {
    fd::detach_saved();

    // 端末の受け渡しは SIGTTOU を無視しているうちに済ませる
    if let Some(pg) = setup.pgid {
        let me = unsafe { libc::getpid() };
        let pg = if pg == 0 { me } else { pg };
        unsafe {
            libc::setpgid(0, pg);
        }
        if setup.foreground {
            shell.terminal.give_to(pg);
        }
    }

    let monitor = shell.opts.monitor;
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        if monitor {
            libc::signal(libc::SIGTSTP, libc::SIG_DFL);
            libc::signal(libc::SIGTTIN, libc::SIG_DFL);
            libc::signal(libc::SIGTTOU, libc::SIG_DFL);
        }
        if setup.async_no_monitor {
            libc::signal(libc::SIGINT, libc::SIG_IGN);
            libc::signal(libc::SIGQUIT, libc::SIG_IGN);
        } else {
            libc::signal(libc::SIGINT, libc::SIG_DFL);
            libc::signal(libc::SIGQUIT, libc::SIG_DFL);
        }
    }

    shell.jobs.clear();
    shell.coproc.close();
    shell.enter_child();

    if let Some(r) = setup.stdin {
        let _ = fd::dup2(r, 0);
    } else if setup.async_no_monitor {
        // リダイレクトされていなければ /dev/null から読む
        let null = b"/dev/null\0".as_ptr() as *const libc::c_char;
        let nfd = unsafe { libc::open(null, libc::O_RDONLY) };
        if nfd >= 0 && nfd != 0 {
            let _ = fd::dup2(nfd, 0);
            fd::close(nfd);
        }
    }
    if let Some(w) = setup.stdout {
        let _ = fd::dup2(w, 1);
    }
    for &c in &setup.close {
        fd::close(c);
    }

}

/// 子プロセスを終える。出力バッファを吐き出して `_exit` する。
pub fn exit_child(status: i32) -> ! {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
    unsafe { libc::_exit(status & 0xff) }
}

// ── exec ─────────────────────────────────────────────────────────────

/// argv/envp 用の CString ベクタ。NULL 終端のポインタ配列を構築する。
struct CStringVec {
    _strings: Vec<CString>,
    ptrs: Vec<*const libc::c_char>,
}

impl CStringVec {
    fn new<S: AsRef<[u8]>>(items: &[S]) -> Self {
        let strings: Vec<CString> = items
            .iter()
            .map(|s| {
                let bytes: Vec<u8> = s.as_ref().iter().copied().filter(|&b| b != 0).collect();
                CString::new(bytes).unwrap_or_default()
            })
            .collect();
        let mut ptrs: Vec<*const libc::c_char> = strings.iter().map(|s| s.as_ptr()).collect();
        ptrs.push(std::ptr::null()); // NULL 終端
        Self {
            _strings: strings,
            ptrs,
        }
    }

    fn as_ptr(&self) -> *const *const libc::c_char {
        self.ptrs.as_ptr()
    }
}

/// `path` を `argv` と exported な環境で実行する。戻ってきたら失敗。
///
/// `#!` のないスクリプト（`ENOEXEC`）はこのシェル自身に読ませる。
pub fn exec(shell: &Shell, path: &Path, argv: &[String]) -> ShellError {
    let name = argv.first().cloned().unwrap_or_default();
    let env = CStringVec::new(&shell.vars.environ());
    let c_path = match CString::new(path.as_os_str().as_bytes()) {
        Ok(p) => p,
        Err(_) => return ShellError::NotFound(name),
    };
    let args = CStringVec::new(argv);
    unsafe {
        libc::execve(c_path.as_ptr(), args.as_ptr(), env.as_ptr());
    }
    let err = io::Error::last_os_error();

    if err.raw_os_error() == Some(libc::ENOEXEC) {
        if let Ok(me) = std::env::current_exe() {
            let mut script_argv: Vec<Vec<u8>> = vec![
                me.as_os_str().as_bytes().to_vec(),
                path.as_os_str().as_bytes().to_vec(),
            ];
            script_argv.extend(argv.iter().skip(1).map(|a| a.as_bytes().to_vec()));
            let script_args = CStringVec::new(&script_argv);
            if let Ok(c_me) = CString::new(me.as_os_str().as_bytes()) {
                unsafe {
                    libc::execve(c_me.as_ptr(), script_args.as_ptr(), env.as_ptr());
                }
            }
        }
    }
    exec_error(name, err)
}

/// `execve` の失敗を分類する。ENOENT は「見つからない」(127)、それ以外は「実行できない」(126)。
pub fn exec_error(name: String, err: io::Error) -> ShellError {
    match err.raw_os_error() {
        Some(libc::ENOENT) | Some(libc::ENOTDIR) => ShellError::NotFound(name),
        _ => ShellError::NotExecutable { name, source: err },
    }
}
