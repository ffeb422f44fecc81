//! コマンドの `PATH` 検索とキャッシュ（`hash`）。
//!
//! 一度見つけた実行ファイルの位置を名前ごとに記憶する。
//! `PATH` が代入されたら [`PathCache::clear`] で全て捨てる。
//! 念のため検索時にも `PATH` 文字列の変化を検出して再構築する。

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// 名前 → 実行ファイルのパス。
#[derive(Debug, Default)]
pub struct PathCache {
    entries: HashMap<String, PathBuf>,
    /// キャッシュ構築時の `$PATH` 値。変更検出に使う。
    path_str: String,
}

impl PathCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `name` を `path` (`$PATH` の値) から探す。
    ///
    /// `/` を含む名前は検索せずそのまま返す。実行可能なファイルが無く、
    /// 実行権のない同名ファイルだけがあればそれを返す（exec 時に 126 になる）。
    pub fn lookup(&mut self, name: &str, path: &str) -> Option<PathBuf> {
        if name.contains('/') {
            return Some(PathBuf::from(name));
        }
        if path != self.path_str {
            self.entries.clear();
            self.path_str = path.to_string();
        }
        if let Some(p) = self.entries.get(name) {
            if is_executable(p) {
                return Some(p.clone());
            }
            self.entries.remove(name);
        }

        let mut fallback = None;
        for dir in path.split(':') {
            let dir = if dir.is_empty() { "." } else { dir };
            let candidate = Path::new(dir).join(name);
            if is_executable(&candidate) {
                tracing::trace!(name, path = %candidate.display(), "hashed command");
                self.entries.insert(name.to_string(), candidate.clone());
                return Some(candidate);
            }
            if fallback.is_none() && candidate.is_file() {
                fallback = Some(candidate);
            }
        }
        fallback
    }

    /// キャッシュを全て破棄する（`PATH` 代入時、`hash -r`）。
    pub fn clear(&mut self) {
        tracing::debug!(entries = self.entries.len(), "path cache cleared");
        self.entries.clear();
    }

    /// キャッシュ内容を名前順で返す（`hash` の一覧表示）。
    pub fn entries(&self) -> Vec<(&str, &Path)> {
        let mut all: Vec<(&str, &Path)> = self
            .entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_path()))
            .collect();
        all.sort();
        all
    }
}

/// ファイルが実行可能か判定する（Unix パーミッションビット `0o111`）。
pub fn is_executable(path: &Path) -> bool {
    if let Ok(meta) = path.metadata() {
        if meta.is_file() {
            return meta.permissions().mode() & 0o111 != 0;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_file(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let p = dir.join(name);
        fs::write(&p, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&p, fs::Permissions::from_mode(mode)).unwrap();
        p
    }

    #[test]
    fn finds_first_executable_in_path_order() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        make_file(a.path(), "tool", 0o644);
        let exe = make_file(b.path(), "tool", 0o755);
        let path = format!("{}:{}", a.path().display(), b.path().display());
        let mut cache = PathCache::new();
        assert_eq!(cache.lookup("tool", &path), Some(exe.clone()));
        assert_eq!(cache.entries(), vec![("tool", exe.as_path())]);
    }

    #[test]
    fn non_executable_is_returned_as_fallback() {
        let a = tempfile::tempdir().unwrap();
        let plain = make_file(a.path(), "data", 0o644);
        let mut cache = PathCache::new();
        assert_eq!(cache.lookup("data", &a.path().display().to_string()), Some(plain));
        assert!(cache.entries().is_empty());
    }

    #[test]
    fn path_change_invalidates() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        make_file(a.path(), "x", 0o755);
        let mut cache = PathCache::new();
        assert!(cache.lookup("x", &a.path().display().to_string()).is_some());
        assert!(cache.lookup("x", &b.path().display().to_string()).is_none());
    }

    #[test]
    fn slash_names_bypass_search() {
        let mut cache = PathCache::new();
        assert_eq!(cache.lookup("./run", ""), Some(PathBuf::from("./run")));
    }
}
