//! エラー型と制御フローの脱出（[`Divert`]）。
//!
//! ユーザー向けのエラー（リダイレクト失敗、コマンド未発見、ジョブ指定の誤りなど）は
//! 診断メッセージ + 非ゼロ終了ステータスに変換され、実行は継続する。
//! 内部不変条件の破れ（[`JobError::Internal`]）だけは [`Divert::Abort`] に変換され、
//! トップレベルまで巻き戻してシェル全体を終了させる。

use std::io;

use thiserror::Error;

/// 実行系で発生するエラー。
#[derive(Debug, Error)]
pub enum ShellError {
    /// リダイレクト先のオープン・複製に失敗した。
    #[error("{target}: cannot {action}: {source}")]
    Redirect {
        target: String,
        action: &'static str,
        #[source]
        source: io::Error,
    },
    /// `N>&M` の M が開かれていない、または数値でない。
    #[error("{0}: bad file descriptor")]
    BadFd(String),
    /// `set -C` (noclobber) で既存ファイルへの `>` を拒否した。
    #[error("{0}: cannot create: file already exists")]
    Clobber(String),
    /// リダイレクト先の展開結果が 1 語にならなかった。
    #[error("{0}: ambiguous redirect")]
    AmbiguousRedirect(String),
    /// `>&p` / `<&p` でコプロセスが存在しない。
    #[error("no coprocess")]
    NoCoprocess,
    /// コプロセスが既に動作中。
    #[error("coprocess already exists")]
    CoprocessExists,
    /// コマンドが見つからない（終了ステータス 127）。
    #[error("{0}: not found")]
    NotFound(String),
    /// コマンドは見つかったが実行できない（終了ステータス 126）。
    #[error("{name}: cannot execute: {source}")]
    NotExecutable {
        name: String,
        #[source]
        source: io::Error,
    },
    /// バックオフ付きリトライ後も fork できなかった。
    #[error("cannot fork - try again: {0}")]
    Fork(#[source] io::Error),
    /// パイプ作成失敗。
    #[error("cannot create pipe: {0}")]
    Pipe(#[source] io::Error),
    /// 読み取り専用変数への代入。
    #[error("{0}: is read only")]
    ReadOnly(String),
    /// 変数名として不正。
    #[error("{0}: is not an identifier")]
    BadName(String),
    /// 展開エラー（`set -u` 下の未定義パラメータなど）。
    #[error("{0}")]
    Expansion(String),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ShellError {
    /// エラーに対応する終了ステータスを返す。
    /// 127 = command not found, 126 = 実行不可, 1 = その他。
    pub fn exit_status(&self) -> i32 {
        match self {
            Self::NotFound(_) => 127,
            Self::NotExecutable { .. } => 126,
            _ => 1,
        }
    }

    /// `io::Error` をリダイレクトエラーに包む。
    pub fn redirect(target: &str, action: &'static str, source: io::Error) -> Self {
        Self::Redirect {
            target: target.to_string(),
            action,
            source,
        }
    }
}

/// ジョブ指定・ジョブ制御のエラー。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("{0}: no such job")]
    NoSuchJob(String),
    #[error("{0}: ambiguous")]
    Ambiguous(String),
    #[error("{0}: argument must be %job or process id")]
    BadSelector(String),
    #[error("no current job")]
    NoCurrentJob,
    #[error("job control not enabled")]
    NoJobControl,
    /// `fg` / `bg` の対象が既に終了している。
    #[error("{0}: job has finished")]
    Finished(String),
    /// 内部不変条件の破れ。回復不能。
    #[error("internal error: {0}")]
    Internal(String),
}

/// 通常の終了ステータス以外でコマンド実行を抜ける理由。
///
/// `break N` / `continue N` はループの入れ子を N 段巻き戻し、
/// `return` は関数呼び出しまで、`exit` / `Abort` はトップレベルまで巻き戻す。
#[derive(Debug, PartialEq, Eq)]
pub enum Divert {
    /// `break N`。残り段数。
    Break(usize),
    /// `continue N`。残り段数。
    Continue(usize),
    /// `return [N]`。
    Return(i32),
    /// `exit [N]`、または非対話シェルの致命的エラー。
    Exit(i32),
    /// 内部不変条件の破れ。診断メッセージを持つ。
    Abort(String),
}

/// コマンド実行結果: `Ok(終了ステータス)` または脱出。
pub type Flow = Result<i32, Divert>;

impl JobError {
    /// 内部不変条件の破れか。
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

impl From<JobError> for Divert {
    /// ジョブテーブル内部の失敗をシェル全体の中断に変換する。
    /// 利用者向けのジョブ指定エラーはビルトイン側でステータスに変換するため、ここには来ない。
    fn from(e: JobError) -> Self {
        Divert::Abort(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_mapping() {
        assert_eq!(ShellError::NotFound("x".into()).exit_status(), 127);
        let e = ShellError::NotExecutable {
            name: "x".into(),
            source: io::Error::from_raw_os_error(libc::EACCES),
        };
        assert_eq!(e.exit_status(), 126);
        assert_eq!(ShellError::BadFd("9".into()).exit_status(), 1);
    }

    #[test]
    fn redirect_message_names_target() {
        let e = ShellError::redirect(
            "/nonexistent/path",
            "create",
            io::Error::from_raw_os_error(libc::ENOENT),
        );
        let msg = e.to_string();
        assert!(msg.starts_with("/nonexistent/path: cannot create: "), "{msg}");
    }

    #[test]
    fn internal_job_error_aborts() {
        let e = JobError::Internal("job 3 never started".into());
        assert!(e.is_internal());
        let d: Divert = e.into();
        assert_eq!(d, Divert::Abort("internal error: job 3 never started".into()));
    }
}
