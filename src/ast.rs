//! コマンドツリー（AST）。
//!
//! [`parser`](crate::parser) が構築し、[`executor`](crate::executor) が読み取る。
//! ワード（[`Word`]）はクォートを含む生テキストのまま保持し、実行時に
//! [`expand`](crate::expand) で展開する（`$?` を実行時点の値にするため）。
//!
//! 各ノードは自身のリダイレクト列を持つ（`{ ...; } > out`, `(cmd) < in` など）。
//! [`fmt::Display`] はジョブ一覧に表示するコマンド文字列を再構成する。

use std::fmt;
use std::rc::Rc;

/// 未展開のワード（クォート・`$` を含む生テキスト）。
pub type Word = String;

/// `name=value` 形式の代入。
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub name: String,
    pub value: Word,
}

/// 単純コマンド: 前置代入 + ワード列。
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SimpleCommand {
    pub assignments: Vec<Assignment>,
    pub words: Vec<Word>,
}

/// リダイレクト演算子。
#[derive(Debug, Clone, PartialEq)]
pub enum RedirOp {
    /// `<`
    Input,
    /// `>`
    Output,
    /// `>|` — noclobber を無視
    Clobber,
    /// `>>`
    Append,
    /// `<>`
    ReadWrite,
    /// `<&` — ターゲットは fd 番号、`-`、`p`
    DupInput,
    /// `>&`
    DupOutput,
    /// `<<` / `<<-`。`body` は読み込み済みの本文。
    HereDoc {
        body: String,
        /// 区切り語がクォートされていなければ本文を展開する。
        expand: bool,
    },
}

/// リダイレクト 1 つ。`fd` は付け替え対象（`2>` なら 2）。
#[derive(Debug, Clone, PartialEq)]
pub struct Redirect {
    pub fd: i32,
    pub op: RedirOp,
    pub target: Word,
}

/// `&&` / `||`。
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Connector {
    And,
    Or,
}

/// `case` の 1 分岐。
#[derive(Debug, Clone, PartialEq)]
pub struct CaseArm {
    pub patterns: Vec<Word>,
    pub body: Option<Command>,
}

/// コマンドノードの種別。
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    Simple(SimpleCommand),
    /// `a | b | c`。2 要素以上。
    Pipeline(Vec<Command>),
    /// `a; b; c`
    List(Vec<Command>),
    AndOr(Box<Command>, Connector, Box<Command>),
    /// `! cmd`
    Not(Box<Command>),
    /// `for var [in words]; do body; done`。`words` が `None` なら `"$@"`。
    For {
        var: String,
        words: Option<Vec<Word>>,
        body: Box<Command>,
    },
    /// `select var [in words]; do body; done`
    Select {
        var: String,
        words: Option<Vec<Word>>,
        body: Box<Command>,
    },
    /// `while cond; do body; done`（`until` なら `until == true`）
    While {
        until: bool,
        cond: Box<Command>,
        body: Box<Command>,
    },
    /// `if cond; then a; [elif ...;] [else b;] fi`。elif は else 側の入れ子 If。
    If {
        cond: Box<Command>,
        then_part: Box<Command>,
        else_part: Option<Box<Command>>,
    },
    Case {
        word: Word,
        arms: Vec<CaseArm>,
    },
    /// `( list )`
    Subshell(Box<Command>),
    /// `{ list; }`
    Brace(Box<Command>),
    /// `name() body` / `function name body`
    FunctionDef {
        name: String,
        body: Rc<Command>,
    },
    /// `cmd &`
    Background(Box<Command>),
    /// `cmd |&`
    Coprocess(Box<Command>),
    /// `time [pipeline]`
    Time(Option<Box<Command>>),
}

/// コマンドノード: 種別 + ノード自身のリダイレクト。
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub kind: CommandKind,
    pub redirects: Vec<Redirect>,
}

impl Command {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            redirects: Vec::new(),
        }
    }

    /// ワード列だけの単純コマンド（テスト・ベンチ用）。
    pub fn simple<S: Into<String>>(words: impl IntoIterator<Item = S>) -> Self {
        Self::new(CommandKind::Simple(SimpleCommand {
            assignments: Vec::new(),
            words: words.into_iter().map(Into::into).collect(),
        }))
    }

    pub fn with_redirect(mut self, r: Redirect) -> Self {
        self.redirects.push(r);
        self
    }

    /// パイプラインの各段を返す。パイプラインでなければ自身 1 つ。
    pub fn stages(&self) -> Vec<&Command> {
        match &self.kind {
            CommandKind::Pipeline(cmds) => cmds.iter().collect(),
            _ => vec![self],
        }
    }
}

// ── 表示 ─────────────────────────────────────────────────────────────

impl fmt::Display for RedirOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RedirOp::Input => "<",
            RedirOp::Output => ">",
            RedirOp::Clobber => ">|",
            RedirOp::Append => ">>",
            RedirOp::ReadWrite => "<>",
            RedirOp::DupInput => "<&",
            RedirOp::DupOutput => ">&",
            RedirOp::HereDoc { .. } => "<<",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Redirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let default_fd = match self.op {
            RedirOp::Input | RedirOp::ReadWrite | RedirOp::DupInput | RedirOp::HereDoc { .. } => 0,
            _ => 1,
        };
        if self.fd != default_fd {
            write!(f, "{}", self.fd)?;
        }
        write!(f, "{}{}", self.op, self.target)
    }
}

fn write_words(f: &mut fmt::Formatter<'_>, words: &[Word]) -> fmt::Result {
    for (i, w) in words.iter().enumerate() {
        if i > 0 {
            f.write_str(" ")?;
        }
        f.write_str(w)?;
    }
    Ok(())
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            CommandKind::Simple(sc) => {
                let mut first = true;
                for a in &sc.assignments {
                    if !first {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}={}", a.name, a.value)?;
                    first = false;
                }
                if !sc.words.is_empty() {
                    if !first {
                        f.write_str(" ")?;
                    }
                    write_words(f, &sc.words)?;
                }
            }
            CommandKind::Pipeline(cmds) => {
                for (i, c) in cmds.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" | ")?;
                    }
                    write!(f, "{}", c)?;
                }
            }
            CommandKind::List(cmds) => {
                for (i, c) in cmds.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{}", c)?;
                }
            }
            CommandKind::AndOr(l, op, r) => {
                let op = match op {
                    Connector::And => "&&",
                    Connector::Or => "||",
                };
                write!(f, "{} {} {}", l, op, r)?;
            }
            CommandKind::Not(c) => write!(f, "! {}", c)?,
            CommandKind::For { var, words, body } | CommandKind::Select { var, words, body } => {
                let kw = if matches!(self.kind, CommandKind::For { .. }) {
                    "for"
                } else {
                    "select"
                };
                write!(f, "{} {}", kw, var)?;
                if let Some(words) = words {
                    f.write_str(" in ")?;
                    write_words(f, words)?;
                }
                write!(f, "; do {}; done", body)?;
            }
            CommandKind::While { until, cond, body } => {
                let kw = if *until { "until" } else { "while" };
                write!(f, "{} {}; do {}; done", kw, cond, body)?;
            }
            CommandKind::If {
                cond,
                then_part,
                else_part,
            } => {
                write!(f, "if {}; then {}", cond, then_part)?;
                if let Some(e) = else_part {
                    write!(f, "; else {}", e)?;
                }
                f.write_str("; fi")?;
            }
            CommandKind::Case { word, arms } => {
                write!(f, "case {} in", word)?;
                for arm in arms {
                    f.write_str(" ")?;
                    f.write_str(&arm.patterns.join("|"))?;
                    f.write_str(")")?;
                    if let Some(b) = &arm.body {
                        write!(f, " {}", b)?;
                    }
                    f.write_str(";;")?;
                }
                f.write_str(" esac")?;
            }
            CommandKind::Subshell(c) => write!(f, "( {} )", c)?,
            CommandKind::Brace(c) => write!(f, "{{ {}; }}", c)?,
            CommandKind::FunctionDef { name, body } => write!(f, "{}() {}", name, body)?,
            CommandKind::Background(c) => write!(f, "{} &", c)?,
            CommandKind::Coprocess(c) => write!(f, "{} |&", c)?,
            CommandKind::Time(c) => match c {
                Some(c) => write!(f, "time {}", c)?,
                None => f.write_str("time")?,
            },
        }
        for r in &self.redirects {
            write!(f, " {}", r)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_pipeline_with_redirect() {
        let cmd = Command::new(CommandKind::Pipeline(vec![
            Command::simple(["ls", "-l"]),
            Command::simple(["wc"]).with_redirect(Redirect {
                fd: 1,
                op: RedirOp::Output,
                target: "out".into(),
            }),
        ]));
        assert_eq!(cmd.to_string(), "ls -l | wc >out");
    }

    #[test]
    fn display_stderr_dup() {
        let cmd = Command::simple(["cc"]).with_redirect(Redirect {
            fd: 2,
            op: RedirOp::DupOutput,
            target: "1".into(),
        });
        assert_eq!(cmd.to_string(), "cc 2>&1");
    }

    #[test]
    fn stages_of_non_pipeline_is_self() {
        let cmd = Command::simple(["true"]);
        assert_eq!(cmd.stages().len(), 1);
    }
}
