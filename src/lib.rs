//! kesh ライブラリ — ベンチマーク・テスト用にモジュールを公開する。
//!
//! バイナリ本体は `main.rs` の入力ループ。
//! この `lib.rs` は `benches/bench_main.rs` や `tests/` から
//! パーサー・実行系・ジョブテーブルに直接アクセスするために存在する。
//!
//! ## モジュール構成
//!
//! | モジュール | 役割 |
//! |-----------|------|
//! | [`ast`] | コマンドツリー（単純コマンド、パイプライン、複合コマンド、リダイレクト） |
//! | [`parser`] | 構文解析（リスト、パイプライン、`if`/`while`/`for`/`case`/`select`、関数定義、ヒアドキュメント） |
//! | [`expand`] | 語の展開（パラメータ、コマンド置換、チルダ、フィールド分割、パス名展開） |
//! | [`glob`] | パターンマッチ（`*`, `?`, `[...]`） |
//! | [`vars`] | シェル変数（export / readonly 属性、一時代入のスコープ） |
//! | [`executor`] | コマンド実行（ディスパッチ、ジョブ起動、フォアグラウンド待機、コマンド置換） |
//! | [`builtins`] | ビルトイン（特殊ビルトインと通常ビルトイン） |
//! | [`job`] | ジョブテーブル（番号割り当て、状態遷移、ジョブ指定の解決、一覧表示） |
//! | [`reap`] | SIGCHLD フラグによる子プロセスの回収と待機、`fg`/`bg` の再開 |
//! | [`launch`] | fork と子側の初期化（プロセスグループ、端末、シグナル、パイプ接続）、exec |
//! | [`fd`] | fd の退避・復元（スコープ付き）とパイプ |
//! | [`redir`] | リダイレクトの適用 |
//! | [`tty`] | 制御端末（フォアグラウンドプロセスグループ、端末モードの保存・復元） |
//! | [`path`] | コマンド検索と結果のキャッシュ |
//! | [`signal`] | シグナル名・番号・メッセージの対応表 |
//! | [`shell`] | シェルのグローバル状態（オプション、変数、関数、ジョブ、コプロセス） |
//! | [`error`] | エラー型と制御フローの脱出 |

pub mod ast;
pub mod builtins;
pub mod error;
pub mod executor;
pub mod expand;
pub mod fd;
pub mod glob;
pub mod job;
pub mod launch;
pub mod parser;
pub mod path;
pub mod reap;
pub mod redir;
pub mod shell;
pub mod signal;
pub mod tty;
pub mod vars;
