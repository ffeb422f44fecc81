//! 擬似端末の上で対話シェルを動かし、フォアグラウンドの受け渡しを確かめる。

use std::ffi::CStr;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::FromRawFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// マスター側と、スレーブのパス名。
fn open_pty() -> (File, String) {
    unsafe {
        let master = libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY);
        assert!(master >= 0, "posix_openpt failed");
        assert_eq!(libc::grantpt(master), 0);
        assert_eq!(libc::unlockpt(master), 0);
        let mut name = [0 as libc::c_char; 128];
        assert_eq!(libc::ptsname_r(master, name.as_mut_ptr(), name.len()), 0);
        let name = CStr::from_ptr(name.as_ptr()).to_string_lossy().into_owned();
        (File::from_raw_fd(master), name)
    }
}

/// `until` が真になるか期限が来るまで、受け取った出力を貯める。
fn collect(rx: &mpsc::Receiver<Vec<u8>>, text: &mut String, until: impl Fn(&str) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !until(text) {
        let Some(left) = deadline.checked_duration_since(Instant::now()) else {
            return;
        };
        match rx.recv_timeout(left) {
            Ok(chunk) => text.push_str(&String::from_utf8_lossy(&chunk)),
            Err(_) => return,
        }
    }
}

#[test]
fn foreground_command_runs_on_terminal() {
    let (mut master, slave_path) = open_pty();
    let slave = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(&slave_path)
        .unwrap();
    let home = tempfile::tempdir().unwrap();

    let mut cmd = Command::new(env!("CARGO_BIN_EXE_kesh"));
    cmd.arg("-i")
        .env_remove("ENV")
        .env("HOME", home.path())
        .env("PATH", "/usr/bin:/bin")
        .stdin(Stdio::from(slave.try_clone().unwrap()))
        .stdout(Stdio::from(slave.try_clone().unwrap()))
        .stderr(Stdio::from(slave));
    unsafe {
        cmd.pre_exec(|| {
            // 新しいセッションを作り、スレーブを制御端末にする
            if libc::setsid() < 0 || libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let mut child = cmd.spawn().unwrap();
    drop(cmd);

    let mut reader = master.try_clone().unwrap();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = [0u8; 1024];
        while let Ok(n) = reader.read(&mut buf) {
            if n == 0 || tx.send(buf[..n].to_vec()).is_err() {
                break;
            }
        }
    });

    let mut text = String::new();
    collect(&rx, &mut text, |t| t.contains("kesh$ "));
    master
        .write_all(b"/bin/echo hello-from-child; echo status=$?\n")
        .unwrap();
    collect(&rx, &mut text, |t| {
        t.split("\nstatus=").nth(1).is_some_and(|rest| rest.contains('\n'))
    });
    let _ = master.write_all(b"exit\n");
    let _ = child.kill();
    let _ = child.wait();

    // 端末は入力もエコーするので、行頭から始まる出力だけを見る
    assert!(text.contains("\nhello-from-child\r"), "{text:?}");
    assert!(text.contains("\nstatus=0\r"), "{text:?}");
}
