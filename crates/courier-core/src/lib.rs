//! courier-core
//!
//! Simulated outbound message delivery: a client submits a message, background
//! jobs "send" it through a provider and then walk it through its receipts.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, message + status machine, job kinds, errors）
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, Provider）
//! - **store**: MessageStore trait + in-memory implementation
//! - **queue**: JobQueue / JobLease traits, retry policy, in-memory broker
//! - **service**: MessageService（create / get / list / retry / cancel）
//! - **worker**: Processor（job ごとの状態遷移）+ WorkerGroup
//! - **config**: `COURIER_*` 環境変数からの設定

pub mod config;
pub mod domain;
pub mod ports;
pub mod queue;
pub mod service;
pub mod store;
pub mod worker;

pub use config::{Config, ConfigError};
pub use service::{CancelOutcome, MessageService, RemovedJob, RetryOutcome, SendJobPolicy};
pub use worker::{Processor, ProcessorSettings, WorkerGroup};
