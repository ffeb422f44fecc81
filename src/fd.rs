//! ファイルディスクリプタのスコープ管理。
//!
//! リダイレクトやパイプ接続で fd を付け替える前に、元の fd を
//! [`FD_HIGH`] 以上の close-on-exec スロットへ退避し、スコープ終了時に戻す。
//!
//! | 型 / 関数 | 役割 |
//! |-----------|------|
//! | [`save`] / [`restore`] | 単一 fd の退避と復元（[`SavedFd`] ハンドル） |
//! | [`SavedFds`] | スコープ単位の退避セット。Drop で逆順に全復元（エラー巻き戻しでも実行される） |
//! | [`Pipe`] | 両端を高位 close-on-exec fd に移したパイプ |
//! | [`detach_saved`] | fork 後の子で、親の退避コピーをまとめて閉じる |

use std::cell::RefCell;
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// 退避コピーや内部用 fd を置く最小番号。ユーザーが `N>` で使う 0〜9 と衝突させない。
pub const FD_HIGH: RawFd = 10;

thread_local! {
    /// 生存中の退避コピー（プロセス単位）。子プロセスが親のコピーを閉じるために使う。
    static LIVE_SAVES: RefCell<Vec<RawFd>> = const { RefCell::new(Vec::new()) };
}

// ── 低レベルヘルパー ─────────────────────────────────────────────────

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// `fd` を [`FD_HIGH`] 以上の close-on-exec スロットに複製する。
pub fn dup_high(fd: RawFd) -> io::Result<OwnedFd> {
    let new = cvt(unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, FD_HIGH) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(new) })
}

/// `dup2(src, dst)`。EINTR は再試行する。`dst` の close-on-exec は解除される。
pub fn dup2(src: RawFd, dst: RawFd) -> io::Result<()> {
    loop {
        match cvt(unsafe { libc::dup2(src, dst) }) {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// fd を閉じる。エラーは無視する（既に閉じている fd の close は無害）。
pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// fd が開いているか。
pub fn is_open(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) >= 0 }
}

/// close-on-exec フラグを設定/解除する。
pub fn set_cloexec(fd: RawFd, on: bool) -> io::Result<()> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    let new = if on {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, new) })?;
    Ok(())
}

/// fd 1/2 を付け替える前に Rust 側の出力バッファを吐き出す。
fn flush_std(fd: RawFd) {
    match fd {
        1 => {
            let _ = io::stdout().flush();
        }
        2 => {
            let _ = io::stderr().flush();
        }
        _ => {}
    }
}

// ── 単一 fd の退避 ───────────────────────────────────────────────────

/// [`save`] が返す退避ハンドル。
#[derive(Debug)]
pub enum SavedFd {
    /// 元の fd の複製（高位・close-on-exec）。
    Dup(OwnedFd),
    /// 退避時点で fd は閉じていた。復元時は閉じる。
    Closed,
}

/// `fd` を高位スロットへ複製して退避する。
pub fn save(fd: RawFd) -> io::Result<SavedFd> {
    flush_std(fd);
    match dup_high(fd) {
        Ok(copy) => {
            LIVE_SAVES.with(|l| l.borrow_mut().push(copy.as_raw_fd()));
            tracing::trace!(fd, copy = copy.as_raw_fd(), "saved fd");
            Ok(SavedFd::Dup(copy))
        }
        Err(e) if e.raw_os_error() == Some(libc::EBADF) => Ok(SavedFd::Closed),
        Err(e) => Err(e),
    }
}

/// 退避ハンドルを `fd` に書き戻し、ハンドルを解放する。
pub fn restore(fd: RawFd, saved: SavedFd) {
    flush_std(fd);
    match saved {
        SavedFd::Dup(copy) => {
            let raw = copy.as_raw_fd();
            if let Err(e) = dup2(raw, fd) {
                tracing::warn!(fd, error = %e, "failed to restore fd");
            }
            LIVE_SAVES.with(|l| l.borrow_mut().retain(|&c| c != raw));
            drop(copy);
        }
        SavedFd::Closed => close(fd),
    }
    tracing::trace!(fd, "restored fd");
}

/// fork 直後の子で呼ぶ。親のスコープが保持している退避コピーを全て閉じる。
///
/// 子は親のスタックフレームに戻らない（`_exit` で終わる）ため、
/// それらの [`SavedFds`] の Drop は子では実行されない。
pub fn detach_saved() {
    LIVE_SAVES.with(|l| {
        for fd in l.borrow_mut().drain(..) {
            close(fd);
        }
    });
}

// ── SavedFds ─────────────────────────────────────────────────────────

/// 実行スコープの fd 退避セット。
///
/// 同じ fd の 2 回目以降の [`save`](SavedFds::save) は最初の退避を再利用する。
/// Drop で退避した全 fd を逆順に復元する。
#[derive(Debug, Default)]
pub struct SavedFds {
    saved: Vec<(RawFd, SavedFd)>,
}

impl SavedFds {
    pub fn new() -> Self {
        Self { saved: Vec::new() }
    }

    /// `fd` を退避する。既にこのスコープで退避済みなら何もしない。
    pub fn save(&mut self, fd: RawFd) -> io::Result<()> {
        if self.is_saved(fd) {
            return Ok(());
        }
        let handle = save(fd)?;
        self.saved.push((fd, handle));
        Ok(())
    }

    pub fn is_saved(&self, fd: RawFd) -> bool {
        self.saved.iter().any(|(f, _)| *f == fd)
    }

    /// 全ての退避を逆順に復元する。
    pub fn restore_all(&mut self) {
        while let Some((fd, handle)) = self.saved.pop() {
            restore(fd, handle);
        }
    }

    /// 復元せずに退避コピーを破棄する（`exec` のリダイレクトを恒久化する）。
    pub fn forget(&mut self) {
        for (_, handle) in self.saved.drain(..) {
            if let SavedFd::Dup(copy) = handle {
                let raw = copy.as_raw_fd();
                LIVE_SAVES.with(|l| l.borrow_mut().retain(|&c| c != raw));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.saved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.saved.is_empty()
    }
}

impl Drop for SavedFds {
    fn drop(&mut self) {
        self.restore_all();
    }
}

// ── Pipe ─────────────────────────────────────────────────────────────

/// パイプ。両端とも [`FD_HIGH`] 以上の close-on-exec fd。
#[derive(Debug)]
pub struct Pipe {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

impl Pipe {
    pub fn new() -> io::Result<Self> {
        let mut fds = [-1i32; 2];
        cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
        let (r, w) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        // 低位番号のままだと後続のリダイレクトと衝突するため移動する
        let read = dup_high(r.as_raw_fd())?;
        let write = dup_high(w.as_raw_fd())?;
        Ok(Self { read, write })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom};

    fn same_file(a: RawFd, b: RawFd) -> bool {
        let mut sa: libc::stat = unsafe { std::mem::zeroed() };
        let mut sb: libc::stat = unsafe { std::mem::zeroed() };
        unsafe {
            libc::fstat(a, &mut sa) == 0
                && libc::fstat(b, &mut sb) == 0
                && sa.st_ino == sb.st_ino
                && sa.st_dev == sb.st_dev
        }
    }

    #[test]
    fn save_restore_roundtrip_is_noop() {
        let target = tempfile::tempfile().unwrap();
        let fd = target.as_raw_fd();
        let probe = tempfile::tempfile().unwrap();
        let h = save(fd).unwrap();
        dup2(probe.as_raw_fd(), fd).unwrap();
        assert!(same_file(fd, probe.as_raw_fd()));
        restore(fd, h);
        assert!(!same_file(fd, probe.as_raw_fd()));
        assert!(is_open(fd));
    }

    #[test]
    fn saved_fds_restores_on_drop_in_reverse() {
        let mut a = tempfile::tempfile().unwrap();
        let b = tempfile::tempfile().unwrap();
        let fd = a.as_raw_fd();
        {
            let mut scope = SavedFds::new();
            scope.save(fd).unwrap();
            scope.save(fd).unwrap();
            assert_eq!(scope.len(), 1);
            dup2(b.as_raw_fd(), fd).unwrap();
        }
        // 元のファイルに戻っていること
        unsafe {
            libc::write(fd, b"x".as_ptr() as *const libc::c_void, 1);
        }
        a.seek(SeekFrom::Start(0)).unwrap();
        let mut s = String::new();
        a.read_to_string(&mut s).unwrap();
        assert_eq!(s, "x");
    }

    #[test]
    fn saving_closed_fd_closes_on_restore() {
        // 並列テストが番号を再利用しないよう、十分高い番号を使う
        let fd: RawFd = 250;
        assert!(!is_open(fd));
        let other = tempfile::tempfile().unwrap();
        {
            let mut scope = SavedFds::new();
            scope.save(fd).unwrap();
            dup2(other.as_raw_fd(), fd).unwrap();
            assert!(is_open(fd));
        }
        assert!(!is_open(fd));
    }

    #[test]
    fn scope_restores_on_error_path() {
        fn failing(fd: RawFd, other: &File) -> io::Result<()> {
            let mut scope = SavedFds::new();
            scope.save(fd)?;
            dup2(other.as_raw_fd(), fd)?;
            Err(io::Error::new(io::ErrorKind::Other, "boom"))
        }
        let base = tempfile::tempfile().unwrap();
        let other = tempfile::tempfile().unwrap();
        let fd = base.as_raw_fd();
        assert!(failing(fd, &other).is_err());
        assert!(!same_file(fd, other.as_raw_fd()));
    }

    #[test]
    fn pipe_ends_are_high_and_cloexec() {
        let p = Pipe::new().unwrap();
        for fd in [p.read.as_raw_fd(), p.write.as_raw_fd()] {
            assert!(fd >= FD_HIGH);
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert!(flags & libc::FD_CLOEXEC != 0);
        }
    }

    #[test]
    fn forget_keeps_redirection() {
        let base = tempfile::tempfile().unwrap();
        let other = tempfile::tempfile().unwrap();
        let fd = base.as_raw_fd();
        {
            let mut scope = SavedFds::new();
            scope.save(fd).unwrap();
            dup2(other.as_raw_fd(), fd).unwrap();
            scope.forget();
        }
        assert!(same_file(fd, other.as_raw_fd()));
    }
}
