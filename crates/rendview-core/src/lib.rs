//! rendview-core
//!
//! RendView レンダリング dispatcher の構成要素。
//!
//! # モジュール構成
//! - **domain**: タスクレコード、状態、実行結果、descriptor
//! - **files**: タスクファイルのレジストリ
//! - **ports**: 抽象化レイヤー（TaskSource, WorkerLauncher, Clock）
//! - **app**: TaskManager スケジューラとそれを動かすもの
//! - **ldr**: LDR プロトコルと LDR task source
//! - **impls**: 実装（子プロセスの worker launcher）
//! - **config**: 設定モデル

pub mod app;
pub mod config;
pub mod domain;
pub mod files;
pub mod impls;
pub mod ldr;
pub mod ports;
