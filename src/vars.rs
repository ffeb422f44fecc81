//! 変数テーブル。
//!
//! 環境変数で初期化し、`export` 属性付きの変数だけを子プロセスの環境に渡す。
//! 子プロセスは fork でテーブルの複製を得るため、サブシェル内の変更は親に見えない。
//! 位置パラメータ（`$1`〜`$N`）もここで保持する。

use std::collections::HashMap;

use crate::error::ShellError;

/// 1 変数。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Var {
    pub value: Option<String>,
    pub exported: bool,
    pub readonly: bool,
}

/// 一時代入（`VAR=x cmd`）の巻き戻し情報。
#[derive(Debug)]
pub struct TempScope {
    saved: Vec<(String, Option<Var>)>,
}

/// 変数テーブル。
#[derive(Debug, Default)]
pub struct Vars {
    map: HashMap<String, Var>,
    /// `$1`〜`$N`。
    pub positional: Vec<String>,
    /// `$0`。
    pub arg0: String,
}

/// 変数名として有効か（英字 or `_` で始まり、英数字 or `_` が続く）。
pub fn is_valid_name(s: &str) -> bool {
    let mut bytes = s.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphabetic() || b == b'_' => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    /// 現在のプロセス環境から構築する。全て export 属性付き。
    pub fn from_env() -> Self {
        let mut vars = Self::new();
        for (k, v) in std::env::vars_os() {
            if let (Ok(k), Ok(v)) = (k.into_string(), v.into_string()) {
                if is_valid_name(&k) {
                    vars.map.insert(
                        k,
                        Var {
                            value: Some(v),
                            exported: true,
                            readonly: false,
                        },
                    );
                }
            }
        }
        vars
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(name).and_then(|v| v.value.as_deref())
    }

    pub fn var(&self, name: &str) -> Option<&Var> {
        self.map.get(name)
    }

    /// 値を設定する。読み取り専用ならエラー。
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> Result<(), ShellError> {
        if !is_valid_name(name) {
            return Err(ShellError::BadName(name.to_string()));
        }
        let var = self.map.entry(name.to_string()).or_default();
        if var.readonly {
            return Err(ShellError::ReadOnly(name.to_string()));
        }
        var.value = Some(value.into());
        Ok(())
    }

    /// export 属性を付ける。`value` があれば同時に代入する。
    pub fn export(&mut self, name: &str, value: Option<String>) -> Result<(), ShellError> {
        if let Some(v) = value {
            self.set(name, v)?;
        } else if !is_valid_name(name) {
            return Err(ShellError::BadName(name.to_string()));
        }
        self.map.entry(name.to_string()).or_default().exported = true;
        Ok(())
    }

    pub fn set_readonly(&mut self, name: &str, value: Option<String>) -> Result<(), ShellError> {
        if let Some(v) = value {
            self.set(name, v)?;
        } else if !is_valid_name(name) {
            return Err(ShellError::BadName(name.to_string()));
        }
        self.map.entry(name.to_string()).or_default().readonly = true;
        Ok(())
    }

    pub fn unset(&mut self, name: &str) -> Result<(), ShellError> {
        if let Some(v) = self.map.get(name) {
            if v.readonly {
                return Err(ShellError::ReadOnly(name.to_string()));
            }
        }
        self.map.remove(name);
        Ok(())
    }

    /// 一時代入を適用する。`export` が真なら子プロセス向けに export 属性も付ける。
    pub fn push_temp(
        &mut self,
        assigns: &[(String, String)],
        export: bool,
    ) -> Result<TempScope, ShellError> {
        let mut scope = TempScope { saved: Vec::new() };
        for (name, value) in assigns {
            scope.saved.push((name.clone(), self.map.get(name).cloned()));
            if let Err(e) = self.set(name, value.clone()) {
                self.pop_temp(scope);
                return Err(e);
            }
            if export {
                self.map.entry(name.clone()).or_default().exported = true;
            }
        }
        Ok(scope)
    }

    /// [`push_temp`](Self::push_temp) の前の状態に戻す。
    pub fn pop_temp(&mut self, scope: TempScope) {
        for (name, old) in scope.saved.into_iter().rev() {
            match old {
                Some(v) => {
                    self.map.insert(name, v);
                }
                None => {
                    self.map.remove(&name);
                }
            }
        }
    }

    /// 子プロセスへ渡す `NAME=value` の列。
    pub fn environ(&self) -> Vec<String> {
        let mut env: Vec<String> = self
            .map
            .iter()
            .filter(|(_, v)| v.exported)
            .filter_map(|(k, v)| v.value.as_ref().map(|val| format!("{}={}", k, val)))
            .collect();
        env.sort();
        env
    }

    /// 全変数を名前順で返す（`set` の一覧表示用）。
    pub fn iter_sorted(&self) -> Vec<(&str, &Var)> {
        let mut all: Vec<(&str, &Var)> = self.map.iter().map(|(k, v)| (k.as_str(), v)).collect();
        all.sort_by(|a, b| a.0.cmp(b.0));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        assert!(is_valid_name("PATH"));
        assert!(is_valid_name("_x1"));
        assert!(!is_valid_name("1x"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("a-b"));
    }

    #[test]
    fn readonly_rejects_assignment() {
        let mut v = Vars::new();
        v.set_readonly("R", Some("1".into())).unwrap();
        assert!(matches!(v.set("R", "2"), Err(ShellError::ReadOnly(_))));
        assert!(matches!(v.unset("R"), Err(ShellError::ReadOnly(_))));
        assert_eq!(v.get("R"), Some("1"));
    }

    #[test]
    fn environ_has_only_exported() {
        let mut v = Vars::new();
        v.set("A", "1").unwrap();
        v.export("B", Some("2".into())).unwrap();
        assert_eq!(v.environ(), vec!["B=2".to_string()]);
    }

    #[test]
    fn temp_assignments_are_restored() {
        let mut v = Vars::new();
        v.set("X", "old").unwrap();
        let scope = v
            .push_temp(&[("X".into(), "new".into()), ("Y".into(), "y".into())], true)
            .unwrap();
        assert_eq!(v.get("X"), Some("new"));
        assert!(v.environ().contains(&"Y=y".to_string()));
        v.pop_temp(scope);
        assert_eq!(v.get("X"), Some("old"));
        assert_eq!(v.get("Y"), None);
        assert!(!v.var("X").unwrap().exported);
    }
}
