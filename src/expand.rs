//! ワード展開。
//!
//! パーサーはワードをクォート付きの生テキストのまま残す。ここで実行時に
//! パラメータ展開・コマンド置換・チルダ展開・フィールド分割・パス名展開・
//! クォート除去を行う。
//!
//! 展開途中の文字は由来ごとに区別する:
//!
//! | 種別 | 由来 | 分割 | glob |
//! |------|------|------|------|
//! | `Lit` | クォートなしのワード本文 | しない | する |
//! | `Quoted` | クォート・エスケープ内、チルダ展開結果 | しない | しない |
//! | `Split` | クォートなしの展開結果 | IFS で分割 | する |

use crate::error::ShellError;
use crate::executor;
use crate::glob;
use crate::shell::Shell;
use crate::vars::is_valid_name;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Lit,
    Quoted,
    Split,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Ch(char, Kind),
    /// フィールドの強制区切り（`"$@"` の要素間）。
    Break,
    /// 空でもフィールドを残す（`""` など）。
    Keep,
}

/// どの文脈の文字列を走査しているか。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ctx {
    Bare,
    Double,
    HereDoc,
}

struct Expander<'s> {
    shell: &'s mut Shell,
    units: Vec<Unit>,
}

// ── 公開関数 ─────────────────────────────────────────────────────────

/// コマンドのワード列を展開して引数リストにする（分割・glob あり）。
pub fn expand_words(shell: &mut Shell, words: &[String]) -> Result<Vec<String>, ShellError> {
    let mut out = Vec::new();
    for w in words {
        let mut ex = Expander::new(shell);
        ex.scan(&chars_of(w), Ctx::Bare, true)?;
        let noglob = ex.shell.opts.noglob;
        let ifs = ex.ifs();
        for field in split_fields(&ex.units, &ifs) {
            out.extend(glob_field(&field, noglob));
        }
    }
    Ok(out)
}

/// 1 ワードを分割・glob なしで展開する（代入値、リダイレクト先、`case` の対象）。
pub fn expand_word(shell: &mut Shell, word: &str) -> Result<String, ShellError> {
    let mut ex = Expander::new(shell);
    ex.scan(&chars_of(word), Ctx::Bare, true)?;
    Ok(join_units(&ex.units, false))
}

/// `case` のパターンを展開する。クォートされたメタ文字は `\` でエスケープして返す。
pub fn expand_pattern(shell: &mut Shell, word: &str) -> Result<String, ShellError> {
    let mut ex = Expander::new(shell);
    ex.scan(&chars_of(word), Ctx::Bare, true)?;
    Ok(join_units(&ex.units, true))
}

/// ヒアドキュメント本文を展開する（`$`、コマンド置換、`\$` `\\` `` \` `` のみ解釈）。
pub fn expand_heredoc(shell: &mut Shell, body: &str) -> Result<String, ShellError> {
    let mut ex = Expander::new(shell);
    ex.scan(&chars_of(body), Ctx::HereDoc, false)?;
    Ok(join_units(&ex.units, false))
}

/// チルダ展開: `~` → `$HOME`、`~user` → そのユーザーのホーム。解決できなければ `None`。
pub fn tilde(user: &str, home: Option<&str>) -> Option<String> {
    if user.is_empty() {
        return home.map(str::to_string);
    }
    let c_user = std::ffi::CString::new(user).ok()?;
    let pw = unsafe { libc::getpwnam(c_user.as_ptr()) };
    if pw.is_null() {
        return None;
    }
    let dir = unsafe { std::ffi::CStr::from_ptr((*pw).pw_dir) };
    dir.to_str().ok().map(str::to_string)
}

fn chars_of(s: &str) -> Vec<char> {
    s.chars().collect()
}

// ── 後処理 ───────────────────────────────────────────────────────────

/// 分割後の 1 フィールド。
#[derive(Debug, Default)]
struct Field {
    chars: Vec<(char, Kind)>,
    keep: bool,
}

fn split_fields(units: &[Unit], ifs: &str) -> Vec<Field> {
    let mut fields = Vec::new();
    let mut cur = Field::default();
    for u in units {
        match *u {
            Unit::Keep => cur.keep = true,
            Unit::Break => {
                if !cur.chars.is_empty() || cur.keep {
                    fields.push(std::mem::take(&mut cur));
                }
            }
            Unit::Ch(c, Kind::Split) if ifs.contains(c) => {
                if !cur.chars.is_empty() || cur.keep {
                    fields.push(std::mem::take(&mut cur));
                }
            }
            Unit::Ch(c, k) => cur.chars.push((c, k)),
        }
    }
    if !cur.chars.is_empty() || cur.keep {
        fields.push(cur);
    }
    fields
}

fn glob_field(field: &Field, noglob: bool) -> Vec<String> {
    let literal: String = field.chars.iter().map(|(c, _)| *c).collect();
    if noglob {
        return vec![literal];
    }
    let mut pattern = String::with_capacity(literal.len());
    for &(c, k) in &field.chars {
        push_pattern_char(&mut pattern, c, k);
    }
    if glob::has_glob_chars(&pattern) {
        glob::expand(&pattern)
    } else {
        vec![literal]
    }
}

fn push_pattern_char(out: &mut String, c: char, k: Kind) {
    let special = matches!(c, '*' | '?' | '[' | ']' | '\\');
    if special && (k == Kind::Quoted || c == '\\') {
        out.push('\\');
    }
    out.push(c);
}

fn join_units(units: &[Unit], as_pattern: bool) -> String {
    let mut out = String::new();
    for u in units {
        match *u {
            Unit::Ch(c, k) if as_pattern => push_pattern_char(&mut out, c, k),
            Unit::Ch(c, _) => out.push(c),
            Unit::Break => out.push(' '),
            Unit::Keep => {}
        }
    }
    out
}

/// `open` の位置から対応する `close` を探す。クォートと入れ子を考慮する。
fn find_close(chars: &[char], start: usize, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = start;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 1,
            '\'' if open == '(' => {
                i += 1;
                while i < chars.len() && chars[i] != '\'' {
                    i += 1;
                }
            }
            '"' => {
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    if chars[i] == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

// ── 走査 ─────────────────────────────────────────────────────────────

impl<'s> Expander<'s> {
    fn new(shell: &'s mut Shell) -> Self {
        Self {
            shell,
            units: Vec::new(),
        }
    }

    fn ifs(&self) -> String {
        self.shell
            .vars
            .get("IFS")
            .unwrap_or(" \t\n")
            .to_string()
    }

    fn push_str(&mut self, s: &str, kind: Kind) {
        self.units.extend(s.chars().map(|c| Unit::Ch(c, kind)));
    }

    /// 展開結果を積む。ダブルクォート内なら分割対象外。
    fn push_value(&mut self, s: &str, ctx: Ctx) {
        let kind = if ctx == Ctx::Bare {
            Kind::Split
        } else {
            Kind::Quoted
        };
        self.push_str(s, kind);
    }

    fn scan(&mut self, chars: &[char], ctx: Ctx, tilde_ok: bool) -> Result<(), ShellError> {
        let n = chars.len();
        let mut i = 0;
        if tilde_ok && ctx == Ctx::Bare && chars.first() == Some(&'~') {
            i = self.tilde_prefix(chars);
        }
        while i < n {
            let c = chars[i];
            match c {
                '\\' => {
                    let next = chars.get(i + 1).copied();
                    match (ctx, next) {
                        (_, Some('\n')) => {}
                        (Ctx::Bare, Some(nc)) => self.units.push(Unit::Ch(nc, Kind::Quoted)),
                        (Ctx::Double, Some(nc)) if matches!(nc, '$' | '`' | '"' | '\\') => {
                            self.units.push(Unit::Ch(nc, Kind::Quoted))
                        }
                        (Ctx::HereDoc, Some(nc)) if matches!(nc, '$' | '`' | '\\') => {
                            self.units.push(Unit::Ch(nc, Kind::Quoted))
                        }
                        (_, Some(_)) => {
                            self.units.push(Unit::Ch('\\', Kind::Quoted));
                            i += 1;
                            continue;
                        }
                        (_, None) => self.units.push(Unit::Ch('\\', Kind::Quoted)),
                    }
                    i += 2;
                }
                '\'' if ctx == Ctx::Bare => {
                    let end = (i + 1..n).find(|&j| chars[j] == '\'').unwrap_or(n);
                    self.units.push(Unit::Keep);
                    for &qc in &chars[i + 1..end] {
                        self.units.push(Unit::Ch(qc, Kind::Quoted));
                    }
                    i = end + 1;
                }
                '"' if ctx == Ctx::Bare => {
                    let mut end = i + 1;
                    while end < n && chars[end] != '"' {
                        if chars[end] == '\\' {
                            end += 1;
                        }
                        end += 1;
                    }
                    let inner = &chars[i + 1..end.min(n)];
                    let inner_str: String = inner.iter().collect();
                    let empty_at = (inner_str == "$@" || inner_str == "${@}")
                        && self.shell.vars.positional.is_empty();
                    if !empty_at {
                        self.units.push(Unit::Keep);
                        self.scan(inner, Ctx::Double, false)?;
                    }
                    i = end + 1;
                }
                '$' => i = self.dollar(chars, i + 1, ctx)?,
                '`' => {
                    let mut end = i + 1;
                    let mut cmd = String::new();
                    while end < n && chars[end] != '`' {
                        if chars[end] == '\\'
                            && end + 1 < n
                            && matches!(chars[end + 1], '$' | '`' | '\\')
                        {
                            end += 1;
                        }
                        cmd.push(chars[end]);
                        end += 1;
                    }
                    let out = executor::command_subst(self.shell, &cmd)?;
                    self.push_value(&out, ctx);
                    i = end + 1;
                }
                _ => {
                    let kind = if ctx == Ctx::Bare {
                        Kind::Lit
                    } else {
                        Kind::Quoted
                    };
                    self.units.push(Unit::Ch(c, kind));
                    i += 1;
                }
            }
        }
        Ok(())
    }

    /// 先頭の `~user` を展開し、次に読む位置を返す。展開できなければ 0。
    fn tilde_prefix(&mut self, chars: &[char]) -> usize {
        let end = chars.iter().position(|&c| c == '/').unwrap_or(chars.len());
        let user: String = chars[1..end].iter().collect();
        if user.chars().any(|c| matches!(c, '\'' | '"' | '\\' | '$' | '`')) {
            return 0;
        }
        let home = self.shell.vars.get("HOME").map(str::to_string);
        match tilde(&user, home.as_deref()) {
            Some(dir) => {
                self.push_str(&dir, Kind::Quoted);
                end
            }
            None => 0,
        }
    }

    /// `$` の直後（`i`）から展開し、次に読む位置を返す。
    fn dollar(&mut self, chars: &[char], i: usize, ctx: Ctx) -> Result<usize, ShellError> {
        let lit_kind = if ctx == Ctx::Bare {
            Kind::Lit
        } else {
            Kind::Quoted
        };
        let Some(&c) = chars.get(i) else {
            self.units.push(Unit::Ch('$', lit_kind));
            return Ok(i);
        };
        match c {
            '(' => {
                if chars.get(i + 1) == Some(&'(') {
                    return Err(ShellError::Expansion(
                        "arithmetic expansion not supported".to_string(),
                    ));
                }
                let end = find_close(chars, i, '(', ')')
                    .ok_or_else(|| ShellError::Expansion("missing )".to_string()))?;
                let cmd: String = chars[i + 1..end].iter().collect();
                let out = executor::command_subst(self.shell, &cmd)?;
                self.push_value(&out, ctx);
                Ok(end + 1)
            }
            '{' => {
                let end = find_close(chars, i, '{', '}')
                    .ok_or_else(|| ShellError::Expansion("${: bad substitution".to_string()))?;
                let inner: Vec<char> = chars[i + 1..end].to_vec();
                self.brace(&inner, ctx)?;
                Ok(end + 1)
            }
            '@' | '*' => {
                self.positional(c == '*', ctx);
                Ok(i + 1)
            }
            '?' | '$' | '!' | '#' | '-' | '0'..='9' => {
                let name = c.to_string();
                let value = self.lookup(&name)?;
                self.push_value(&value.unwrap_or_default(), ctx);
                Ok(i + 1)
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = i;
                while end < chars.len()
                    && (chars[end].is_ascii_alphanumeric() || chars[end] == '_')
                {
                    end += 1;
                }
                let name: String = chars[i..end].iter().collect();
                let value = self.lookup(&name)?;
                self.push_value(&value.unwrap_or_default(), ctx);
                Ok(end)
            }
            _ => {
                self.units.push(Unit::Ch('$', lit_kind));
                Ok(i)
            }
        }
    }

    /// `$@` / `$*`。
    fn positional(&mut self, star: bool, ctx: Ctx) {
        let params = self.shell.vars.positional.clone();
        if ctx != Ctx::Bare && star {
            let sep = self.ifs().chars().next().map(String::from).unwrap_or_default();
            self.push_str(&params.join(&sep), Kind::Quoted);
            return;
        }
        for (k, p) in params.iter().enumerate() {
            if k > 0 {
                self.units.push(Unit::Break);
            }
            if ctx == Ctx::Bare {
                self.push_str(p, Kind::Split);
            } else {
                self.units.push(Unit::Keep);
                self.push_str(p, Kind::Quoted);
            }
        }
    }

    /// パラメータの値。未定義なら `None`（`set -u` なら特殊パラメータ以外はエラー）。
    fn lookup(&mut self, name: &str) -> Result<Option<String>, ShellError> {
        let sh = &mut *self.shell;
        let value = match name {
            "?" => Some(sh.last_status.to_string()),
            "$" => Some(sh.pid.to_string()),
            "#" => Some(sh.vars.positional.len().to_string()),
            "-" => Some(sh.opts.flag_string()),
            "!" => {
                if let Some(pid) = sh.last_bg_pid {
                    if let Some(n) = sh.jobs.find_by_pid(pid) {
                        if let Some(job) = sh.jobs.get_mut(n) {
                            job.flags.known = true;
                        }
                    }
                }
                sh.last_bg_pid.map(|p| p.to_string())
            }
            "0" => Some(sh.vars.arg0.clone()),
            "@" | "*" => Some(sh.vars.positional.join(" ")),
            _ if name.bytes().all(|b| b.is_ascii_digit()) => {
                let idx: usize = name.parse().unwrap_or(0);
                sh.vars.positional.get(idx.wrapping_sub(1)).cloned()
            }
            _ => sh.vars.get(name).map(str::to_string),
        };
        let special = matches!(name, "!" | "@" | "*");
        if value.is_none() && sh.opts.nounset && !special {
            return Err(ShellError::Expansion(format!("{}: parameter not set", name)));
        }
        Ok(value)
    }

    /// `${...}` の中身を展開する。
    fn brace(&mut self, inner: &[char], ctx: Ctx) -> Result<(), ShellError> {
        let text: String = inner.iter().collect();
        if let Some(name) = text.strip_prefix('#') {
            if !name.is_empty() {
                let len = self.lookup(name)?.map(|v| v.chars().count()).unwrap_or(0);
                self.push_value(&len.to_string(), ctx);
                return Ok(());
            }
        }

        // 名前部分
        let name_len = match inner.first() {
            Some(c) if c.is_ascii_alphabetic() || *c == '_' => inner
                .iter()
                .take_while(|c| c.is_ascii_alphanumeric() || **c == '_')
                .count(),
            Some(c) if c.is_ascii_digit() => inner.iter().take_while(|c| c.is_ascii_digit()).count(),
            Some('?' | '$' | '!' | '#' | '-' | '@' | '*') => 1,
            _ => return Err(ShellError::Expansion(format!("${{{}}}: bad substitution", text))),
        };
        let name: String = inner[..name_len].iter().collect();
        let rest = &inner[name_len..];

        if rest.is_empty() {
            if name == "@" || name == "*" {
                self.positional(name == "*", ctx);
                return Ok(());
            }
            let value = self.lookup(&name)?;
            self.push_value(&value.unwrap_or_default(), ctx);
            return Ok(());
        }

        let (colon, op, word) = match rest {
            [':', op @ ('-' | '=' | '+' | '?'), word @ ..] => (true, *op, word),
            [op @ ('-' | '=' | '+' | '?'), word @ ..] => (false, *op, word),
            _ => return Err(ShellError::Expansion(format!("${{{}}}: bad substitution", text))),
        };

        // 演算子付きでは set -u のエラーを出さない
        let nounset = self.shell.opts.nounset;
        self.shell.opts.nounset = false;
        let value = self.lookup(&name);
        self.shell.opts.nounset = nounset;
        let value = value?;
        let set = match &value {
            Some(v) => !(colon && v.is_empty()),
            None => false,
        };
        let word_ctx = if ctx == Ctx::Bare { Ctx::Bare } else { Ctx::Double };

        match op {
            '-' if set => self.push_value(&value.unwrap_or_default(), ctx),
            '-' => self.scan(word, word_ctx, true)?,
            '+' if set => self.scan(word, word_ctx, true)?,
            '+' => {}
            '=' if set => self.push_value(&value.unwrap_or_default(), ctx),
            '=' => {
                if !is_valid_name(&name) {
                    return Err(ShellError::Expansion(format!(
                        "{}: cannot assign in this way",
                        name
                    )));
                }
                let w: String = word.iter().collect();
                let v = expand_word(self.shell, &w)?;
                self.shell.assign(&name, &v)?;
                self.push_value(&v, ctx);
            }
            '?' if set => self.push_value(&value.unwrap_or_default(), ctx),
            _ => {
                let w: String = word.iter().collect();
                let msg = if w.is_empty() {
                    "parameter null or not set".to_string()
                } else {
                    expand_word(self.shell, &w)?
                };
                return Err(ShellError::Expansion(format!("{}: {}", name, msg)));
            }
        }
        Ok(())
    }
}
