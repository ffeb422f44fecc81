//! トークナイザ + パーサー: 入力文字列からコマンドツリー（[`ast::Command`]）を構築する。
//!
//! 手書きトークナイザで演算子・リダイレクト・ワードを切り出し、再帰下降で組み立てる。
//! ワードはクォートを含む生テキストのまま保持し、展開は実行時に行う。
//!
//! ## 対応構文
//!
//! - リスト: `;`, 改行, `&`（バックグラウンド）, `|&`（コプロセス）
//! - `&&`, `||`, `!`, パイプライン `|`, `time`
//! - `( )`, `{ }`, `if/elif/else/fi`, `while/until`, `for`, `select`, `case`
//! - 関数定義: `name() body`, `function name body`
//! - リダイレクト: `<`, `>`, `>|`, `>>`, `<>`, `n>&m`, `n<&m`, `>&-`, `>&p`, `<&p`, `<<`, `<<-`
//! - クォート: `'...'`, `"..."`, `\X`, `$(...)`, `` `...` ``, `${...}`
//! - コメント `#`、行継続 `\` + 改行
//!
//! 入力が途中で終わっている場合（閉じていないクォート、末尾の演算子、閉じていない
//! 複合コマンドやヒアドキュメント）は [`ParseError::is_incomplete`] が真になる。
//! REPL はこれを見て継続行を読む。

use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use crate::ast::{
    Assignment, CaseArm, Command, CommandKind, Connector, RedirOp, Redirect, SimpleCommand, Word,
};
use crate::vars::is_valid_name;

// ── Error ───────────────────────────────────────────────────────────

/// パース時に発生しうるエラー。終了ステータスは 2。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// クォートが閉じられていない。引数は開始クォート文字。
    #[error("syntax error: unexpected EOF while looking for matching `{0}'")]
    UnterminatedQuote(char),
    /// 入力が構文の途中で終わった。
    #[error("syntax error: unexpected end of file")]
    Incomplete,
    /// ヒアドキュメントの終端行がない。
    #[error("here document `{0}' unclosed")]
    HereDocUnclosed(String),
    /// 予期しないトークン。
    #[error("syntax error: `{0}' unexpected")]
    Unexpected(String),
    /// リダイレクト演算子の後にターゲットがない。
    #[error("syntax error: missing redirect target after `{0}'")]
    MissingRedirectTarget(String),
    #[error("{0}: invalid function name")]
    BadFunctionName(String),
}

impl ParseError {
    /// 続きの入力があれば解決しうるエラーか。
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            Self::UnterminatedQuote(_) | Self::Incomplete | Self::HereDocUnclosed(_)
        )
    }
}

// ── Tokenizer ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Word(String),
    /// `|`, `||`, `&`, `&&`, `;`, `;;`, `(`, `)`, `|&`
    Op(&'static str),
    /// リダイレクト演算子と明示された fd。
    Redir(Option<i32>, &'static str),
    Newline,
    Eof,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Word(w) => f.write_str(w),
            Tok::Op(s) => f.write_str(s),
            Tok::Redir(Some(n), s) => write!(f, "{}{}", n, s),
            Tok::Redir(None, s) => f.write_str(s),
            Tok::Newline => f.write_str("newline"),
            Tok::Eof => f.write_str("end of file"),
        }
    }
}

impl Tok {
    fn is_word(&self, s: &str) -> bool {
        matches!(self, Tok::Word(w) if w == s)
    }
}

struct Lexer {
    input: Vec<char>,
    pos: usize,
}

fn is_meta(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | ';' | '&' | '|' | '<' | '>' | '(' | ')')
}

impl Lexer {
    fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }

    /// 空白・行継続・コメントを読み飛ばす。
    fn skip_blank(&mut self) -> Result<(), ParseError> {
        loop {
            match self.peek() {
                Some(' ' | '\t') => self.pos += 1,
                Some('\\') if self.peek_at(1) == Some('\n') => self.line_continuation()?,
                Some('#') => {
                    while !matches!(self.peek(), None | Some('\n')) {
                        self.pos += 1;
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// `\` + 改行を取り除く。入力末尾なら続きが必要。
    fn line_continuation(&mut self) -> Result<(), ParseError> {
        if self.pos + 2 >= self.input.len() {
            return Err(ParseError::Incomplete);
        }
        self.pos += 2;
        Ok(())
    }

    fn next_tok(&mut self) -> Result<Tok, ParseError> {
        self.skip_blank()?;
        let Some(c) = self.peek() else {
            return Ok(Tok::Eof);
        };
        let two = |l: &Self, s: char| l.peek_at(1) == Some(s);
        let tok = match c {
            '\n' => {
                self.pos += 1;
                return Ok(Tok::Newline);
            }
            '|' if two(self, '|') => Tok::Op("||"),
            '|' if two(self, '&') => Tok::Op("|&"),
            '|' => Tok::Op("|"),
            '&' if two(self, '&') => Tok::Op("&&"),
            '&' => Tok::Op("&"),
            ';' if two(self, ';') => Tok::Op(";;"),
            ';' => Tok::Op(";"),
            '(' => Tok::Op("("),
            ')' => Tok::Op(")"),
            '<' | '>' => return Ok(self.redir_op(None)),
            c if c.is_ascii_digit() => {
                let mut end = self.pos;
                while self.input.get(end).is_some_and(|d| d.is_ascii_digit()) {
                    end += 1;
                }
                if matches!(self.input.get(end), Some('<' | '>')) {
                    let n: String = self.input[self.pos..end].iter().collect();
                    let fd: i32 = n.parse().map_err(|_| ParseError::Unexpected(n.clone()))?;
                    self.pos = end;
                    return Ok(self.redir_op(Some(fd)));
                }
                return self.word().map(Tok::Word);
            }
            _ => return self.word().map(Tok::Word),
        };
        if let Tok::Op(s) = &tok {
            self.pos += s.len();
        }
        Ok(tok)
    }

    /// `<` / `>` で始まるリダイレクト演算子。
    fn redir_op(&mut self, fd: Option<i32>) -> Tok {
        let c = self.peek().unwrap_or('<');
        let next = self.peek_at(1);
        let (op, len) = match (c, next) {
            ('<', Some('<')) if self.peek_at(2) == Some('-') => ("<<-", 3),
            ('<', Some('<')) => ("<<", 2),
            ('<', Some('&')) => ("<&", 2),
            ('<', Some('>')) => ("<>", 2),
            ('<', _) => ("<", 1),
            ('>', Some('>')) => (">>", 2),
            ('>', Some('&')) => (">&", 2),
            ('>', Some('|')) => (">|", 2),
            _ => (">", 1),
        };
        self.pos += len;
        Tok::Redir(fd, op)
    }

    /// 1 ワードをクォートごと読み取る。
    fn word(&mut self) -> Result<String, ParseError> {
        let mut w = String::new();
        while let Some(c) = self.peek() {
            match c {
                c if is_meta(c) => break,
                '\\' => {
                    if self.peek_at(1) == Some('\n') {
                        self.line_continuation()?;
                        continue;
                    }
                    w.push('\\');
                    self.pos += 1;
                    if let Some(n) = self.peek() {
                        w.push(n);
                        self.pos += 1;
                    }
                }
                '\'' => self.single_quote(&mut w)?,
                '"' => self.double_quote(&mut w)?,
                '`' => self.backquote(&mut w)?,
                '$' => self.dollar(&mut w)?,
                _ => {
                    w.push(c);
                    self.pos += 1;
                }
            }
        }
        Ok(w)
    }

    fn single_quote(&mut self, w: &mut String) -> Result<(), ParseError> {
        w.push('\'');
        self.pos += 1;
        loop {
            let c = self.peek().ok_or(ParseError::UnterminatedQuote('\''))?;
            w.push(c);
            self.pos += 1;
            if c == '\'' {
                return Ok(());
            }
        }
    }

    fn double_quote(&mut self, w: &mut String) -> Result<(), ParseError> {
        w.push('"');
        self.pos += 1;
        loop {
            let c = self.peek().ok_or(ParseError::UnterminatedQuote('"'))?;
            match c {
                '"' => {
                    w.push('"');
                    self.pos += 1;
                    return Ok(());
                }
                '\\' => {
                    if self.peek_at(1) == Some('\n') {
                        self.pos += 2;
                        continue;
                    }
                    w.push('\\');
                    self.pos += 1;
                    if let Some(n) = self.peek() {
                        w.push(n);
                        self.pos += 1;
                    }
                }
                '`' => self.backquote(w)?,
                '$' => self.dollar(w)?,
                _ => {
                    w.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn backquote(&mut self, w: &mut String) -> Result<(), ParseError> {
        w.push('`');
        self.pos += 1;
        loop {
            let c = self.peek().ok_or(ParseError::UnterminatedQuote('`'))?;
            w.push(c);
            self.pos += 1;
            match c {
                '`' => return Ok(()),
                '\\' => {
                    if let Some(n) = self.peek() {
                        w.push(n);
                        self.pos += 1;
                    }
                }
                _ => {}
            }
        }
    }

    /// `$`、`$(...)`、`${...}`。
    fn dollar(&mut self, w: &mut String) -> Result<(), ParseError> {
        w.push('$');
        self.pos += 1;
        match self.peek() {
            Some('(') => self.balanced(w, '(', ')'),
            Some('{') => self.balanced(w, '{', '}'),
            _ => Ok(()),
        }
    }

    /// 対応する閉じ括弧までをクォートを考慮して読む。`self.pos` は開き括弧。
    fn balanced(&mut self, w: &mut String, open: char, close: char) -> Result<(), ParseError> {
        let mut depth = 0usize;
        loop {
            let c = self.peek().ok_or(ParseError::Incomplete)?;
            match c {
                '\'' => self.single_quote(w)?,
                '"' => self.double_quote(w)?,
                '`' => self.backquote(w)?,
                '\\' => {
                    w.push('\\');
                    self.pos += 1;
                    if let Some(n) = self.peek() {
                        w.push(n);
                        self.pos += 1;
                    }
                }
                _ => {
                    w.push(c);
                    self.pos += 1;
                    if c == open {
                        depth += 1;
                    } else if c == close {
                        depth -= 1;
                        if depth == 0 {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// 現在行の次の行からヒアドキュメント本文を読み、入力から取り除く。
    fn read_heredoc(&mut self, delim: &str, strip_tabs: bool) -> Result<String, ParseError> {
        let line_end = (self.pos..self.input.len())
            .find(|&i| self.input[i] == '\n')
            .ok_or(ParseError::Incomplete)?;
        let start = line_end + 1;
        let mut body = String::new();
        let mut i = start;
        while i < self.input.len() {
            let end = (i..self.input.len())
                .find(|&j| self.input[j] == '\n')
                .unwrap_or(self.input.len());
            let mut line: &[char] = &self.input[i..end];
            if strip_tabs {
                while line.first() == Some(&'\t') {
                    line = &line[1..];
                }
            }
            let text: String = line.iter().collect();
            let next = (end + 1).min(self.input.len());
            if text == delim {
                self.input.drain(start..next);
                return Ok(body);
            }
            if end == self.input.len() {
                break;
            }
            body.push_str(&text);
            body.push('\n');
            i = next;
        }
        Err(ParseError::HereDocUnclosed(delim.to_string()))
    }
}

/// ヒアドキュメント区切り語のクォートを取り除く。クォートがあったかも返す。
fn heredoc_delimiter(raw: &str) -> (String, bool) {
    let mut out = String::new();
    let mut quoted = false;
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => quoted = true,
            '\\' => {
                quoted = true;
                if let Some(n) = chars.next() {
                    out.push(n);
                }
            }
            _ => out.push(c),
        }
    }
    (out, quoted)
}

// ── Parser ──────────────────────────────────────────────────────────

/// リストの終端になる予約語。
const TERMINATORS: &[&str] = &["then", "else", "elif", "fi", "do", "done", "esac", "}"];

/// 再帰下降パーサー。
pub struct Parser {
    lex: Lexer,
    peeked: Option<Tok>,
}

/// 入力全体をパースする。空入力なら `Ok(None)`。
pub fn parse(input: &str) -> Result<Option<Command>, ParseError> {
    let mut p = Parser::new(input);
    let mut items = Vec::new();
    while let Some(cmd) = p.next_complete()? {
        items.push(cmd);
    }
    Ok(match items.len() {
        0 => None,
        1 => items.pop(),
        _ => Some(Command::new(CommandKind::List(items))),
    })
}

impl Parser {
    pub fn new(input: &str) -> Self {
        Self {
            lex: Lexer::new(input),
            peeked: None,
        }
    }

    /// 次の 1 行分（改行で終わるリスト）をパースする。入力の終わりなら `Ok(None)`。
    pub fn next_complete(&mut self) -> Result<Option<Command>, ParseError> {
        self.skip_newlines()?;
        if self.peek()? == Tok::Eof {
            return Ok(None);
        }
        let items = self.list(true)?;
        match self.peek()? {
            Tok::Eof => {}
            Tok::Newline => {
                self.next()?;
            }
            t => return Err(ParseError::Unexpected(t.to_string())),
        }
        Ok(Some(into_list(items)))
    }

    fn peek(&mut self) -> Result<Tok, ParseError> {
        if self.peeked.is_none() {
            self.peeked = Some(self.lex.next_tok()?);
        }
        Ok(self.peeked.clone().unwrap_or(Tok::Eof))
    }

    fn next(&mut self) -> Result<Tok, ParseError> {
        match self.peeked.take() {
            Some(t) => Ok(t),
            None => self.lex.next_tok(),
        }
    }

    fn skip_newlines(&mut self) -> Result<(), ParseError> {
        while self.peek()? == Tok::Newline {
            self.next()?;
        }
        Ok(())
    }

    /// 期待するトークンでなければエラー。入力の終わりなら続きが必要。
    fn unexpected(tok: Tok) -> ParseError {
        match tok {
            Tok::Eof => ParseError::Incomplete,
            t => ParseError::Unexpected(t.to_string()),
        }
    }

    fn expect_word(&mut self, kw: &str) -> Result<(), ParseError> {
        match self.next()? {
            t if t.is_word(kw) => Ok(()),
            t => Err(Self::unexpected(t)),
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), ParseError> {
        match self.next()? {
            Tok::Op(s) if s == op => Ok(()),
            t => Err(Self::unexpected(t)),
        }
    }

    fn at_list_end(&mut self) -> Result<bool, ParseError> {
        Ok(match self.peek()? {
            Tok::Eof | Tok::Op(")") | Tok::Op(";;") => true,
            Tok::Word(w) => TERMINATORS.contains(&w.as_str()),
            _ => false,
        })
    }

    /// and-or リストの並び。`line` が真なら改行で終わる（トップレベル）。
    fn list(&mut self, line: bool) -> Result<Vec<Command>, ParseError> {
        let mut items = Vec::new();
        loop {
            if !line {
                self.skip_newlines()?;
            }
            if self.at_list_end()? || (line && self.peek()? == Tok::Newline) {
                break;
            }
            let cmd = self.and_or()?;
            match self.peek()? {
                Tok::Op("&") => {
                    self.next()?;
                    items.push(Command::new(CommandKind::Background(Box::new(cmd))));
                }
                Tok::Op("|&") => {
                    self.next()?;
                    items.push(Command::new(CommandKind::Coprocess(Box::new(cmd))));
                }
                Tok::Op(";") => {
                    self.next()?;
                    items.push(cmd);
                }
                Tok::Newline if !line => {
                    self.next()?;
                    items.push(cmd);
                }
                _ => {
                    items.push(cmd);
                    break;
                }
            }
        }
        Ok(items)
    }

    /// 複合コマンドの本体。空は許さない。
    fn compound_list(&mut self) -> Result<Command, ParseError> {
        let items = self.list(false)?;
        if items.is_empty() {
            return Err(Self::unexpected(self.peek()?));
        }
        Ok(into_list(items))
    }

    fn and_or(&mut self) -> Result<Command, ParseError> {
        let mut left = self.pipeline()?;
        loop {
            let conn = match self.peek()? {
                Tok::Op("&&") => Connector::And,
                Tok::Op("||") => Connector::Or,
                _ => return Ok(left),
            };
            self.next()?;
            self.skip_newlines()?;
            let right = self.pipeline()?;
            left = Command::new(CommandKind::AndOr(Box::new(left), conn, Box::new(right)));
        }
    }

    fn pipeline(&mut self) -> Result<Command, ParseError> {
        match self.peek()? {
            t if t.is_word("!") => {
                self.next()?;
                let inner = self.pipeline()?;
                Ok(Command::new(CommandKind::Not(Box::new(inner))))
            }
            t if t.is_word("time") => {
                self.next()?;
                let bare = matches!(
                    self.peek()?,
                    Tok::Eof | Tok::Newline | Tok::Op(";" | "&" | ")" | "&&" | "||" | "|&")
                );
                let inner = if bare {
                    None
                } else {
                    Some(Box::new(self.pipeline()?))
                };
                Ok(Command::new(CommandKind::Time(inner)))
            }
            _ => {
                let mut stages = vec![self.command()?];
                while self.peek()? == Tok::Op("|") {
                    self.next()?;
                    self.skip_newlines()?;
                    stages.push(self.command()?);
                }
                Ok(if stages.len() == 1 {
                    stages.remove(0)
                } else {
                    Command::new(CommandKind::Pipeline(stages))
                })
            }
        }
    }

    fn command(&mut self) -> Result<Command, ParseError> {
        let tok = self.peek()?;
        let kind = match &tok {
            Tok::Op("(") => {
                self.next()?;
                let body = self.compound_list()?;
                self.expect_op(")")?;
                CommandKind::Subshell(Box::new(body))
            }
            Tok::Word(w) => match w.as_str() {
                "{" => {
                    self.next()?;
                    let body = self.compound_list()?;
                    self.expect_word("}")?;
                    CommandKind::Brace(Box::new(body))
                }
                "if" => {
                    self.next()?;
                    self.if_clause()?
                }
                "while" | "until" => {
                    self.next()?;
                    let cond = self.compound_list()?;
                    let body = self.do_group()?;
                    CommandKind::While {
                        until: w == "until",
                        cond: Box::new(cond),
                        body: Box::new(body),
                    }
                }
                "for" | "select" => {
                    self.next()?;
                    self.for_clause(w == "select")?
                }
                "case" => {
                    self.next()?;
                    self.case_clause()?
                }
                "function" => {
                    self.next()?;
                    let name = match self.next()? {
                        Tok::Word(n) => n,
                        t => return Err(Self::unexpected(t)),
                    };
                    if self.peek()? == Tok::Op("(") {
                        self.next()?;
                        self.expect_op(")")?;
                    }
                    return self.function_body(name);
                }
                w if TERMINATORS.contains(&w) => return Err(ParseError::Unexpected(w.to_string())),
                _ => return self.simple(),
            },
            Tok::Redir(..) => return self.simple(),
            t => return Err(Self::unexpected(t.clone())),
        };
        let mut cmd = Command::new(kind);
        self.redirects(&mut cmd.redirects)?;
        Ok(cmd)
    }

    fn do_group(&mut self) -> Result<Command, ParseError> {
        self.skip_newlines()?;
        self.expect_word("do")?;
        let body = self.compound_list()?;
        self.expect_word("done")?;
        Ok(body)
    }

    fn if_clause(&mut self) -> Result<CommandKind, ParseError> {
        let cond = self.compound_list()?;
        self.expect_word("then")?;
        let then_part = self.compound_list()?;
        let else_part = match self.next()? {
            t if t.is_word("fi") => None,
            t if t.is_word("else") => {
                let e = self.compound_list()?;
                self.expect_word("fi")?;
                Some(Box::new(e))
            }
            t if t.is_word("elif") => Some(Box::new(Command::new(self.if_clause()?))),
            t => return Err(Self::unexpected(t)),
        };
        Ok(CommandKind::If {
            cond: Box::new(cond),
            then_part: Box::new(then_part),
            else_part,
        })
    }

    fn for_clause(&mut self, select: bool) -> Result<CommandKind, ParseError> {
        let var = match self.next()? {
            Tok::Word(v) if is_valid_name(&v) => v,
            t => return Err(Self::unexpected(t)),
        };
        self.skip_newlines()?;
        let mut words = None;
        if self.peek()?.is_word("in") {
            self.next()?;
            let mut list = Vec::new();
            while let Tok::Word(w) = self.peek()? {
                self.next()?;
                list.push(w);
            }
            match self.next()? {
                Tok::Op(";") | Tok::Newline => {}
                t => return Err(Self::unexpected(t)),
            }
            words = Some(list);
        } else if self.peek()? == Tok::Op(";") {
            self.next()?;
        }
        let body = Box::new(self.do_group()?);
        Ok(if select {
            CommandKind::Select { var, words, body }
        } else {
            CommandKind::For { var, words, body }
        })
    }

    fn case_clause(&mut self) -> Result<CommandKind, ParseError> {
        let word = match self.next()? {
            Tok::Word(w) => w,
            t => return Err(Self::unexpected(t)),
        };
        self.skip_newlines()?;
        self.expect_word("in")?;
        let mut arms = Vec::new();
        loop {
            self.skip_newlines()?;
            if self.peek()?.is_word("esac") {
                self.next()?;
                break;
            }
            if self.peek()? == Tok::Op("(") {
                self.next()?;
            }
            let mut patterns = Vec::new();
            loop {
                match self.next()? {
                    Tok::Word(p) => patterns.push(p),
                    t => return Err(Self::unexpected(t)),
                }
                match self.next()? {
                    Tok::Op("|") => continue,
                    Tok::Op(")") => break,
                    t => return Err(Self::unexpected(t)),
                }
            }
            let items = self.list(false)?;
            let body = if items.is_empty() {
                None
            } else {
                Some(into_list(items))
            };
            arms.push(CaseArm { patterns, body });
            match self.peek()? {
                Tok::Op(";;") => {
                    self.next()?;
                }
                t if t.is_word("esac") => {}
                t => return Err(Self::unexpected(t)),
            }
        }
        Ok(CommandKind::Case { word, arms })
    }

    fn function_body(&mut self, name: String) -> Result<Command, ParseError> {
        if !is_valid_name(&name) {
            return Err(ParseError::BadFunctionName(name));
        }
        self.skip_newlines()?;
        let compound = match self.peek()? {
            Tok::Op("(") => true,
            Tok::Word(w) => matches!(
                w.as_str(),
                "{" | "if" | "while" | "until" | "for" | "select" | "case"
            ),
            _ => false,
        };
        if !compound {
            return Err(Self::unexpected(self.peek()?));
        }
        let body = self.command()?;
        Ok(Command::new(CommandKind::FunctionDef {
            name,
            body: Rc::new(body),
        }))
    }

    fn simple(&mut self) -> Result<Command, ParseError> {
        let mut sc = SimpleCommand::default();
        let mut redirects = Vec::new();
        loop {
            match self.peek()? {
                Tok::Redir(..) => self.redirect(&mut redirects)?,
                Tok::Word(w) => {
                    self.next()?;
                    match assignment(&w) {
                        Some(a) if sc.words.is_empty() => sc.assignments.push(a),
                        _ => sc.words.push(w),
                    }
                }
                Tok::Op("(")
                    if sc.words.len() == 1 && sc.assignments.is_empty() && redirects.is_empty() =>
                {
                    self.next()?;
                    self.expect_op(")")?;
                    let name = sc.words.remove(0);
                    return self.function_body(name);
                }
                _ => break,
            }
        }
        if sc.words.is_empty() && sc.assignments.is_empty() && redirects.is_empty() {
            return Err(Self::unexpected(self.peek()?));
        }
        let mut cmd = Command::new(CommandKind::Simple(sc));
        cmd.redirects = redirects;
        Ok(cmd)
    }

    fn redirects(&mut self, out: &mut Vec<Redirect>) -> Result<(), ParseError> {
        while let Tok::Redir(..) = self.peek()? {
            self.redirect(out)?;
        }
        Ok(())
    }

    fn redirect(&mut self, out: &mut Vec<Redirect>) -> Result<(), ParseError> {
        let Tok::Redir(fd, op) = self.next()? else {
            return Err(ParseError::Incomplete);
        };
        let target = match self.next()? {
            Tok::Word(w) => w,
            Tok::Eof => return Err(ParseError::Incomplete),
            _ => return Err(ParseError::MissingRedirectTarget(op.to_string())),
        };
        let default_fd = if op.starts_with('<') { 0 } else { 1 };
        let fd = fd.unwrap_or(default_fd);
        let op = match op {
            "<" => RedirOp::Input,
            ">" => RedirOp::Output,
            ">|" => RedirOp::Clobber,
            ">>" => RedirOp::Append,
            "<>" => RedirOp::ReadWrite,
            "<&" => RedirOp::DupInput,
            ">&" => RedirOp::DupOutput,
            _ => {
                let (delim, quoted) = heredoc_delimiter(&target);
                let body = self.lex.read_heredoc(&delim, op == "<<-")?;
                RedirOp::HereDoc {
                    body,
                    expand: !quoted,
                }
            }
        };
        out.push(Redirect { fd, op, target });
        Ok(())
    }
}

/// `name=value` なら代入として返す。
fn assignment(word: &Word) -> Option<Assignment> {
    let eq = word.find('=')?;
    let name = &word[..eq];
    if !is_valid_name(name) {
        return None;
    }
    Some(Assignment {
        name: name.to_string(),
        value: word[eq + 1..].to_string(),
    })
}

fn into_list(mut items: Vec<Command>) -> Command {
    if items.len() == 1 {
        items.remove(0)
    } else {
        Command::new(CommandKind::List(items))
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn one(input: &str) -> Command {
        parse(input).unwrap().unwrap()
    }

    fn words(cmd: &Command) -> Vec<String> {
        match &cmd.kind {
            CommandKind::Simple(sc) => sc.words.clone(),
            k => panic!("not simple: {:?}", k),
        }
    }

    // ── 単純コマンド ──

    #[test]
    fn simple_command() {
        assert_eq!(words(&one("echo hello world")), vec!["echo", "hello", "world"]);
    }

    #[test]
    fn quotes_are_kept_raw() {
        assert_eq!(
            words(&one(r#"echo 'a b' "c $d" e\ f"#)),
            vec!["echo", "'a b'", "\"c $d\"", "e\\ f"]
        );
    }

    #[test]
    fn command_substitution_is_one_word() {
        assert_eq!(words(&one("echo $(ls | wc -l) `date`")), vec!["echo", "$(ls | wc -l)", "`date`"]);
    }

    #[test]
    fn assignments_before_words() {
        let cmd = one("A=1 B=two env x=y");
        let CommandKind::Simple(sc) = &cmd.kind else { panic!() };
        assert_eq!(sc.assignments.len(), 2);
        assert_eq!(sc.assignments[1].name, "B");
        assert_eq!(sc.words, vec!["env", "x=y"]);
    }

    #[test]
    fn comment_is_skipped() {
        assert_eq!(words(&one("echo a # b c")), vec!["echo", "a"]);
        assert!(parse("# only a comment").unwrap().is_none());
    }

    #[test]
    fn empty_input() {
        assert!(parse("").unwrap().is_none());
        assert!(parse("   \n\n").unwrap().is_none());
    }

    // ── リダイレクト ──

    #[test]
    fn redirects_with_io_number() {
        let cmd = one("cmd <in 2>&1 >>log 3<>rw >&-");
        let r = &cmd.redirects;
        assert_eq!(r.len(), 5);
        assert_eq!(r[0], Redirect { fd: 0, op: RedirOp::Input, target: "in".into() });
        assert_eq!(r[1], Redirect { fd: 2, op: RedirOp::DupOutput, target: "1".into() });
        assert_eq!(r[2].op, RedirOp::Append);
        assert_eq!(r[3], Redirect { fd: 3, op: RedirOp::ReadWrite, target: "rw".into() });
    }

    #[test]
    fn close_and_clobber() {
        let cmd = one("cmd >&- >|f");
        assert_eq!(cmd.redirects[0].target, "-");
        assert_eq!(cmd.redirects[1].op, RedirOp::Clobber);
    }

    #[test]
    fn redirect_only_command() {
        let cmd = one(">out");
        let CommandKind::Simple(sc) = &cmd.kind else { panic!() };
        assert!(sc.words.is_empty());
        assert_eq!(cmd.redirects.len(), 1);
    }

    #[test]
    fn heredoc_body_is_read() {
        let cmd = one("cat <<EOF\nhello $x\nEOF\necho after\n");
        let CommandKind::List(items) = &cmd.kind else { panic!("{:?}", cmd) };
        assert_eq!(
            items[0].redirects[0].op,
            RedirOp::HereDoc { body: "hello $x\n".into(), expand: true }
        );
        assert_eq!(words(&items[1]), vec!["echo", "after"]);
    }

    #[test]
    fn heredoc_quoted_and_tab_stripped() {
        let cmd = one("cat <<-'E'\n\tline\n\tE\n");
        assert_eq!(
            cmd.redirects[0].op,
            RedirOp::HereDoc { body: "line\n".into(), expand: false }
        );
    }

    #[test]
    fn two_heredocs_on_one_line() {
        let cmd = one("cat <<A; cat <<B\na\nA\nb\nB\n");
        let CommandKind::List(items) = &cmd.kind else { panic!() };
        assert_eq!(items[0].redirects[0].op, RedirOp::HereDoc { body: "a\n".into(), expand: true });
        assert_eq!(items[1].redirects[0].op, RedirOp::HereDoc { body: "b\n".into(), expand: true });
    }

    // ── リスト・パイプライン ──

    #[test]
    fn pipeline_and_list() {
        let cmd = one("a | b | c; d && e || f");
        let CommandKind::List(items) = &cmd.kind else { panic!() };
        assert!(matches!(&items[0].kind, CommandKind::Pipeline(s) if s.len() == 3));
        assert!(matches!(&items[1].kind, CommandKind::AndOr(_, Connector::Or, _)));
    }

    #[test]
    fn background_and_coprocess() {
        let cmd = one("sleep 5 & cat |& echo x");
        let CommandKind::List(items) = &cmd.kind else { panic!() };
        assert!(matches!(items[0].kind, CommandKind::Background(_)));
        assert!(matches!(items[1].kind, CommandKind::Coprocess(_)));
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn negation_and_time() {
        assert!(matches!(one("! false").kind, CommandKind::Not(_)));
        assert!(matches!(one("time a | b").kind, CommandKind::Time(Some(_))));
        assert!(matches!(one("time").kind, CommandKind::Time(None)));
    }

    #[test]
    fn display_reconstructs_pipeline() {
        assert_eq!(one("ls -l|wc >out").to_string(), "ls -l | wc >out");
    }

    // ── 複合コマンド ──

    #[test]
    fn if_elif_else() {
        let cmd = one("if a; then b; elif c; then d; else e; fi");
        let CommandKind::If { else_part, .. } = &cmd.kind else { panic!() };
        let elif = else_part.as_ref().unwrap();
        assert!(matches!(&elif.kind, CommandKind::If { else_part: Some(_), .. }));
    }

    #[test]
    fn loops() {
        assert!(matches!(
            one("while true; do echo; done").kind,
            CommandKind::While { until: false, .. }
        ));
        assert!(matches!(one("until a\ndo b\ndone").kind, CommandKind::While { until: true, .. }));
        let CommandKind::For { var, words, .. } = one("for i in 1 2 3; do echo $i; done").kind
        else {
            panic!()
        };
        assert_eq!(var, "i");
        assert_eq!(words.unwrap(), vec!["1", "2", "3"]);
        assert!(matches!(
            one("for i do echo; done").kind,
            CommandKind::For { words: None, .. }
        ));
        assert!(matches!(
            one("select x in a b; do break; done").kind,
            CommandKind::Select { .. }
        ));
    }

    #[test]
    fn case_arms() {
        let cmd = one("case $x in\n a|b) echo ab;;\n (c*) ;;\n *) echo other\nesac");
        let CommandKind::Case { arms, .. } = &cmd.kind else { panic!() };
        assert_eq!(arms.len(), 3);
        assert_eq!(arms[0].patterns, vec!["a", "b"]);
        assert!(arms[1].body.is_none());
        assert_eq!(arms[2].patterns, vec!["*"]);
    }

    #[test]
    fn subshell_and_brace_with_redirect() {
        let cmd = one("( a; b ) >out");
        assert!(matches!(cmd.kind, CommandKind::Subshell(_)));
        assert_eq!(cmd.redirects.len(), 1);
        let cmd = one("{ a; b; } 2>err");
        assert!(matches!(cmd.kind, CommandKind::Brace(_)));
        assert_eq!(cmd.redirects[0].fd, 2);
    }

    #[test]
    fn function_definitions() {
        let CommandKind::FunctionDef { name, body } = one("f() { echo hi; }").kind else {
            panic!()
        };
        assert_eq!(name, "f");
        assert!(matches!(body.kind, CommandKind::Brace(_)));
        assert!(matches!(
            one("function g { :; }").kind,
            CommandKind::FunctionDef { .. }
        ));
    }

    #[test]
    fn next_complete_reads_line_by_line() {
        let mut p = Parser::new("echo a; echo b\nif x\nthen y\nfi\necho c\n");
        assert!(matches!(p.next_complete().unwrap().unwrap().kind, CommandKind::List(_)));
        assert!(matches!(p.next_complete().unwrap().unwrap().kind, CommandKind::If { .. }));
        assert_eq!(words(&p.next_complete().unwrap().unwrap()), vec!["echo", "c"]);
        assert!(p.next_complete().unwrap().is_none());
    }

    // ── エラー ──

    #[test]
    fn incomplete_inputs() {
        for input in [
            "echo 'abc",
            "echo \"abc",
            "a |",
            "a &&",
            "if true; then",
            "while x; do y",
            "cat <<EOF\nbody",
            "echo a \\\n",
            "echo $(ls",
            "f() {",
        ] {
            let err = parse(input).unwrap_err();
            assert!(err.is_incomplete(), "{input:?} -> {err:?}");
        }
    }

    #[test]
    fn syntax_errors() {
        for input in ["| a", "a ;; b", "fi", "( )", "a && ; b", "then x"] {
            let err = parse(input).unwrap_err();
            assert!(!err.is_incomplete(), "{input:?} -> {err:?}");
        }
        assert_eq!(
            parse(")").unwrap_err().to_string(),
            "syntax error: `)' unexpected"
        );
    }

    #[test]
    fn unterminated_quote_message() {
        assert_eq!(parse("echo 'x").unwrap_err(), ParseError::UnterminatedQuote('\''));
    }
}
