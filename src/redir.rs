//! リダイレクトの適用。
//!
//! 各リダイレクトについて、付け替え先の fd を呼び出し側の [`SavedFds`] に退避してから
//! `dup2` する。途中で失敗したら `Err` を返すだけでよい。それまでに付け替えた fd は
//! 呼び出し側のスコープ終了時に元へ戻る。
//!
//! | 演算子 | 動作 |
//! |--------|------|
//! | `<` | 読み込みで開く |
//! | `>` | 切り詰めて書き込み（`set -C` なら既存の通常ファイルを拒否） |
//! | `>\|` | noclobber を無視して切り詰め |
//! | `>>` | 追記 |
//! | `<>` | 読み書き |
//! | `n>&m` / `n<&m` | 複製（`m` が開いていること） |
//! | `n>&-` | 閉じる |
//! | `>&p` / `<&p` | コプロセスの入力端 / 出力端 |
//! | `<<` / `<<-` | ヒアドキュメント（削除済み一時ファイル） |

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

use crate::ast::{RedirOp, Redirect};
use crate::error::ShellError;
use crate::expand;
use crate::fd::{self, SavedFds};
use crate::shell::Shell;

/// リダイレクト列を順に適用する。
pub fn apply(
    shell: &mut Shell,
    redirs: &[Redirect],
    saved: &mut SavedFds,
) -> Result<(), ShellError> {
    for r in redirs {
        apply_one(shell, r, saved)?;
    }
    Ok(())
}

fn apply_one(shell: &mut Shell, r: &Redirect, saved: &mut SavedFds) -> Result<(), ShellError> {
    let fd = r.fd;
    match &r.op {
        RedirOp::HereDoc { body, expand } => {
            let text = if *expand {
                expand::expand_heredoc(shell, body)?
            } else {
                body.clone()
            };
            save(fd, saved, "here document")?;
            let file = heredoc_file(&text)
                .map_err(|e| ShellError::redirect("here document", "create", e))?;
            install_file(fd, file, saved, "here document")
        }
        RedirOp::DupInput | RedirOp::DupOutput => {
            let target = expand::expand_word(shell, &r.target)?;
            match target.as_str() {
                "-" => {
                    save(fd, saved, &target)?;
                    fd::close(fd);
                    tracing::debug!(fd, "redirect: closed");
                    Ok(())
                }
                "p" => {
                    let end = if r.op == RedirOp::DupOutput {
                        shell.coproc.write.as_ref()
                    } else {
                        shell.coproc.read.as_ref()
                    };
                    let src = end.map(|f| f.as_raw_fd()).ok_or(ShellError::NoCoprocess)?;
                    install(fd, src, saved, &target)
                }
                _ => {
                    let src: RawFd = target
                        .parse()
                        .map_err(|_| ShellError::BadFd(target.clone()))?;
                    if !fd::is_open(src) {
                        return Err(ShellError::BadFd(target));
                    }
                    if src == fd {
                        return Ok(());
                    }
                    install(fd, src, saved, &target)
                }
            }
        }
        op => {
            let target = expand::expand_word(shell, &r.target)?;
            if target.is_empty() {
                return Err(ShellError::AmbiguousRedirect(r.target.clone()));
            }
            save(fd, saved, &target)?;
            let file = open_target(op, &target, shell.opts.noclobber)?;
            install_file(fd, file, saved, &target)
        }
    }
}

fn save(fd: RawFd, saved: &mut SavedFds, target: &str) -> Result<(), ShellError> {
    saved
        .save(fd)
        .map_err(|e| ShellError::redirect(target, "save fd", e))
}

/// `fd` を退避してから `src` の複製にする。
fn install(fd: RawFd, src: RawFd, saved: &mut SavedFds, target: &str) -> Result<(), ShellError> {
    save(fd, saved, target)?;
    fd::dup2(src, fd).map_err(|e| ShellError::redirect(target, "dup", e))?;
    tracing::debug!(fd, src, target, "redirect");
    Ok(())
}

/// 開いたファイルを `fd` に据える。`fd` は呼び出し前に退避しておくこと。
///
/// `fd` が閉じていた場合はファイル自体がその番号で開かれるので、
/// 複製せずにそのまま残す（close-on-exec は外す）。
fn install_file(fd: RawFd, file: File, saved: &mut SavedFds, target: &str) -> Result<(), ShellError> {
    if file.as_raw_fd() != fd {
        return install(fd, file.as_raw_fd(), saved, target);
    }
    let raw = file.into_raw_fd();
    fd::set_cloexec(raw, false).map_err(|e| ShellError::redirect(target, "dup", e))?;
    tracing::debug!(fd, target, "redirect: opened in place");
    Ok(())
}

/// ファイル系リダイレクトのターゲットを開く。
pub fn open_target(op: &RedirOp, path: &str, noclobber: bool) -> Result<File, ShellError> {
    let mut opts = OpenOptions::new();
    opts.mode(0o666);
    let action = match op {
        RedirOp::Input => {
            opts.read(true);
            "open"
        }
        RedirOp::Output | RedirOp::Clobber => {
            if noclobber && *op == RedirOp::Output {
                if let Ok(meta) = std::fs::metadata(path) {
                    if meta.is_file() {
                        return Err(ShellError::Clobber(path.to_string()));
                    }
                }
            }
            opts.write(true).create(true).truncate(true);
            "create"
        }
        RedirOp::Append => {
            opts.append(true).create(true);
            "create"
        }
        RedirOp::ReadWrite => {
            opts.read(true).write(true).create(true);
            "open"
        }
        RedirOp::DupInput | RedirOp::DupOutput | RedirOp::HereDoc { .. } => {
            return Err(ShellError::BadFd(path.to_string()));
        }
    };
    opts.open(path)
        .map_err(|e| ShellError::redirect(path, action, e))
}

/// 本文を書き込んで先頭に巻き戻した、削除済みの一時ファイル。
fn heredoc_file(body: &str) -> io::Result<File> {
    let mut file = tempfile::tempfile()?;
    file.write_all(body.as_bytes())?;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn noclobber_rejects_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, "keep").unwrap();
        let p = path.to_str().unwrap();
        let err = open_target(&RedirOp::Output, p, true).unwrap_err();
        assert!(matches!(err, ShellError::Clobber(_)));
        assert!(open_target(&RedirOp::Clobber, p, true).is_ok());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn missing_directory_is_reported() {
        let err = open_target(&RedirOp::Output, "/nonexistent/path", false).unwrap_err();
        assert!(err.to_string().starts_with("/nonexistent/path: cannot create"));
        assert_eq!(err.exit_status(), 1);
    }

    #[test]
    fn append_keeps_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "a").unwrap();
        let mut f = open_target(&RedirOp::Append, path.to_str().unwrap(), true).unwrap();
        f.write_all(b"b").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "ab");
    }

    #[test]
    fn heredoc_file_reads_back() {
        let mut f = heredoc_file("line\n").unwrap();
        let mut s = String::new();
        f.read_to_string(&mut s).unwrap();
        assert_eq!(s, "line\n");
    }

    #[test]
    fn install_is_undone_by_scope() {
        let base = tempfile::tempfile().unwrap();
        let mut other = tempfile::tempfile().unwrap();
        let fd = base.as_raw_fd();
        {
            let mut saved = SavedFds::new();
            install(fd, other.as_raw_fd(), &mut saved, "t").unwrap();
            unsafe {
                libc::write(fd, b"z".as_ptr() as *const libc::c_void, 1);
            }
        }
        let mut s = String::new();
        other.seek(SeekFrom::Start(0)).unwrap();
        other.read_to_string(&mut s).unwrap();
        assert_eq!(s, "z");
        // 元のファイルに戻っている
        unsafe {
            libc::write(fd, b"y".as_ptr() as *const libc::c_void, 1);
        }
        other.seek(SeekFrom::Start(0)).unwrap();
        s.clear();
        other.read_to_string(&mut s).unwrap();
        assert_eq!(s, "z");
    }

    #[test]
    fn file_opened_on_closed_fd_is_closed_again() {
        use std::os::unix::io::FromRawFd;

        let n = 300;
        assert!(!fd::is_open(n));
        let tmp = tempfile::tempfile().unwrap();
        {
            let mut saved = SavedFds::new();
            save(n, &mut saved, "t").unwrap();
            // open がちょうど閉じていた番号を返した状況
            fd::dup2(tmp.as_raw_fd(), n).unwrap();
            fd::set_cloexec(n, true).unwrap();
            let file = unsafe { File::from_raw_fd(n) };
            install_file(n, file, &mut saved, "t").unwrap();
            assert!(fd::is_open(n));
            let flags = unsafe { libc::fcntl(n, libc::F_GETFD) };
            assert_eq!(flags & libc::FD_CLOEXEC, 0);
        }
        assert!(!fd::is_open(n));
    }
}
