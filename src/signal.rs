//! シグナル名・番号・表示メッセージの対応表。
//!
//! `kill -l` / `kill -s NAME` の名前解決と、`jobs` 表示の状態文字列
//! （`Stopped (tty input)`, `Terminated` 等）に使う。

use libc::c_int;

/// 1 シグナル分のエントリ。
struct SigInfo {
    number: c_int,
    name: &'static str,
    message: &'static str,
}

const SIGNALS: &[SigInfo] = &[
    SigInfo { number: libc::SIGHUP, name: "HUP", message: "Hangup" },
    SigInfo { number: libc::SIGINT, name: "INT", message: "Interrupt" },
    SigInfo { number: libc::SIGQUIT, name: "QUIT", message: "Quit" },
    SigInfo { number: libc::SIGILL, name: "ILL", message: "Illegal instruction" },
    SigInfo { number: libc::SIGTRAP, name: "TRAP", message: "Trace trap" },
    SigInfo { number: libc::SIGABRT, name: "ABRT", message: "Abort" },
    SigInfo { number: libc::SIGBUS, name: "BUS", message: "Bus error" },
    SigInfo { number: libc::SIGFPE, name: "FPE", message: "Floating point exception" },
    SigInfo { number: libc::SIGKILL, name: "KILL", message: "Killed" },
    SigInfo { number: libc::SIGUSR1, name: "USR1", message: "User defined signal 1" },
    SigInfo { number: libc::SIGSEGV, name: "SEGV", message: "Memory fault" },
    SigInfo { number: libc::SIGUSR2, name: "USR2", message: "User defined signal 2" },
    SigInfo { number: libc::SIGPIPE, name: "PIPE", message: "Broken pipe" },
    SigInfo { number: libc::SIGALRM, name: "ALRM", message: "Alarm clock" },
    SigInfo { number: libc::SIGTERM, name: "TERM", message: "Terminated" },
    SigInfo { number: libc::SIGCHLD, name: "CHLD", message: "Child exited" },
    SigInfo { number: libc::SIGCONT, name: "CONT", message: "Continued" },
    SigInfo { number: libc::SIGSTOP, name: "STOP", message: "Stopped (signal)" },
    SigInfo { number: libc::SIGTSTP, name: "TSTP", message: "Stopped" },
    SigInfo { number: libc::SIGTTIN, name: "TTIN", message: "Stopped (tty input)" },
    SigInfo { number: libc::SIGTTOU, name: "TTOU", message: "Stopped (tty output)" },
    SigInfo { number: libc::SIGURG, name: "URG", message: "Urgent I/O condition" },
    SigInfo { number: libc::SIGXCPU, name: "XCPU", message: "CPU time limit exceeded" },
    SigInfo { number: libc::SIGXFSZ, name: "XFSZ", message: "File size limit exceeded" },
    SigInfo { number: libc::SIGVTALRM, name: "VTALRM", message: "Virtual timer expired" },
    SigInfo { number: libc::SIGPROF, name: "PROF", message: "Profiling timer expired" },
    SigInfo { number: libc::SIGWINCH, name: "WINCH", message: "Window size change" },
    SigInfo { number: libc::SIGIO, name: "IO", message: "I/O possible" },
    SigInfo { number: libc::SIGSYS, name: "SYS", message: "Bad system call" },
];

/// シグナル名（`TERM`, `SIGTERM`, 大文字小文字は区別しない）または番号を解決する。
pub fn from_name(s: &str) -> Option<c_int> {
    if let Ok(n) = s.parse::<c_int>() {
        return (n == 0 || SIGNALS.iter().any(|i| i.number == n)).then_some(n);
    }
    let upper = s.to_ascii_uppercase();
    let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
    SIGNALS.iter().find(|i| i.name == bare).map(|i| i.number)
}

/// シグナル番号から名前（`SIG` なし）を返す。
pub fn name(sig: c_int) -> Option<&'static str> {
    SIGNALS.iter().find(|i| i.number == sig).map(|i| i.name)
}

/// `jobs` 表示用のメッセージ。未知の番号は `Signal N`。
pub fn message(sig: c_int) -> String {
    match SIGNALS.iter().find(|i| i.number == sig) {
        Some(i) => i.message.to_string(),
        None => format!("Signal {}", sig),
    }
}

/// 既知のシグナル名を番号順で返す（`kill -l`）。
pub fn names() -> Vec<&'static str> {
    let mut all: Vec<&SigInfo> = SIGNALS.iter().collect();
    all.sort_by_key(|i| i.number);
    all.into_iter().map(|i| i.name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_names() {
        assert_eq!(from_name("TERM"), Some(libc::SIGTERM));
        assert_eq!(from_name("sigkill"), Some(libc::SIGKILL));
        assert_eq!(from_name("9"), Some(9));
        assert_eq!(from_name("0"), Some(0));
        assert_eq!(from_name("NOPE"), None);
    }

    #[test]
    fn stop_messages() {
        assert_eq!(message(libc::SIGTSTP), "Stopped");
        assert_eq!(message(libc::SIGTTIN), "Stopped (tty input)");
        assert_eq!(message(200), "Signal 200");
    }

    #[test]
    fn names_are_sorted_by_number() {
        let all = names();
        assert_eq!(all[0], "HUP");
        assert!(all.contains(&"CHLD"));
    }
}
