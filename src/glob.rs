//! パターン照合とパス名展開（glob）。
//!
//! ## 対応パターン
//!
//! - `*` — 0 文字以上の任意の文字にマッチ
//! - `?` — 任意の 1 文字にマッチ
//! - `[abc]` — 文字クラス（列挙された任意の 1 文字にマッチ）
//! - `[a-z]` — 範囲指定
//! - `[!...]` / `[^...]` — 否定文字クラス
//! - `\X` — `X` をリテラルとして扱う
//!
//! [`expand`](crate::expand) はクォートされたメタ文字を `\` でエスケープしたパターンを渡す。
//! `case` の照合（[`matches_pattern`]）も同じ規則に従う。
//! `.` で始まるファイルはパターンが `.` で始まる場合のみマッチ。

use std::fs;
use std::path::Path;

/// パターンにエスケープされていないグロブ文字が含まれるか判定する。
pub fn has_glob_chars(s: &str) -> bool {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'*' | b'?' | b'[' => return true,
            _ => i += 1,
        }
    }
    false
}

/// エスケープ `\X` を取り除いてリテラル文字列に戻す。
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(n) = chars.next() {
                out.push(n);
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// パターンを展開し、マッチするファイルパスをソート済みで返す。
/// マッチなし → エスケープを除いた元のパターン 1 要素を返す。
pub fn expand(pattern: &str) -> Vec<String> {
    let mut found = walk(pattern);
    if found.is_empty() {
        return vec![unescape(pattern)];
    }
    found.sort();
    found
}

/// `/` 区切りの要素ごとに候補を絞り込む。グロブ文字のない要素は存在確認だけ。
fn walk(pattern: &str) -> Vec<String> {
    let (mut prefixes, rest) = match pattern.strip_prefix('/') {
        Some(rest) => (vec!["/".to_string()], rest),
        None => (vec![String::new()], pattern),
    };
    let components: Vec<&str> = rest.split('/').collect();
    for (i, component) in components.iter().enumerate() {
        let last = i + 1 == components.len();
        let mut next = Vec::new();
        for prefix in &prefixes {
            if component.is_empty() {
                // `a//b` や末尾の `/`
                next.push(format!("{}/", prefix.trim_end_matches('/')));
                continue;
            }
            if !has_glob_chars(component) {
                let path = join(prefix, &unescape(component));
                let exists = if last {
                    fs::symlink_metadata(&path).is_ok()
                } else {
                    fs::metadata(&path).map(|m| m.is_dir()).unwrap_or(false)
                };
                if exists {
                    next.push(path);
                }
                continue;
            }
            next.extend(
                entries_matching(prefix, component)
                    .into_iter()
                    .map(|name| join(prefix, &name))
                    .filter(|path| last || Path::new(path).is_dir()),
            );
        }
        if next.is_empty() {
            return next;
        }
        prefixes = next;
    }
    prefixes
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else if prefix.ends_with('/') {
        format!("{}{}", prefix, name)
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// ディレクトリ内でパターンにマッチする名前。`.` で始まる名前は明示したときだけ。
fn entries_matching(dir: &str, component: &str) -> Vec<String> {
    let dir = if dir.is_empty() { "." } else { dir };
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let dot_ok = component.starts_with('.');
    entries
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| dot_ok || !name.starts_with('.'))
        .filter(|name| matches_pattern(component, name))
        .collect()
}

/// パターン文字列と名前を照合する。
pub fn matches_pattern(pattern: &str, name: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let nam: Vec<char> = name.chars().collect();
    matches_recursive(&pat, 0, &nam, 0)
}

fn matches_recursive(pat: &[char], pi: usize, nam: &[char], ni: usize) -> bool {
    let plen = pat.len();
    let nlen = nam.len();

    let mut pi = pi;
    let mut ni = ni;

    while pi < plen {
        match pat[pi] {
            '*' => {
                while pi < plen && pat[pi] == '*' {
                    pi += 1;
                }
                if pi == plen {
                    return true;
                }
                for start in ni..=nlen {
                    if matches_recursive(pat, pi, nam, start) {
                        return true;
                    }
                }
                return false;
            }
            '?' => {
                if ni >= nlen {
                    return false;
                }
                pi += 1;
                ni += 1;
            }
            '[' => {
                if ni >= nlen {
                    return false;
                }
                match match_class(pat, pi + 1, nam[ni]) {
                    Some((matched, next)) => {
                        if !matched {
                            return false;
                        }
                        pi = next;
                        ni += 1;
                    }
                    None => {
                        // 閉じ括弧がない → `[` をリテラルとして扱う
                        if nam[ni] != '[' {
                            return false;
                        }
                        pi += 1;
                        ni += 1;
                    }
                }
            }
            '\\' if pi + 1 < plen => {
                if ni >= nlen || nam[ni] != pat[pi + 1] {
                    return false;
                }
                pi += 2;
                ni += 1;
            }
            ch => {
                if ni >= nlen || nam[ni] != ch {
                    return false;
                }
                pi += 1;
                ni += 1;
            }
        }
    }

    ni == nlen
}

/// `[` の直後（`start`）から文字クラスを評価する。
/// 戻り値: `Some((マッチしたか, ']' の次の位置))`。閉じ括弧がなければ `None`。
fn match_class(pat: &[char], start: usize, ch: char) -> Option<(bool, usize)> {
    let plen = pat.len();
    let mut pi = start;
    let negate = pi < plen && (pat[pi] == '!' || pat[pi] == '^');
    if negate {
        pi += 1;
    }
    let mut matched = false;
    // `]` をクラスの最初に置ける
    let mut first = true;
    while pi < plen && (pat[pi] != ']' || first) {
        first = false;
        let lo = if pat[pi] == '\\' && pi + 1 < plen {
            pi += 1;
            pat[pi]
        } else {
            pat[pi]
        };
        if pi + 2 < plen && pat[pi + 1] == '-' && pat[pi + 2] != ']' {
            let hi = pat[pi + 2];
            if (lo <= ch && ch <= hi) || (hi <= ch && ch <= lo) {
                matched = true;
            }
            pi += 3;
        } else {
            if lo == ch {
                matched = true;
            }
            pi += 1;
        }
    }
    if pi >= plen {
        return None;
    }
    Some((matched != negate, pi + 1))
}
