//! Ports - 抽象化レイヤー
//!
//! 外部要素（時刻、ID 生成、送信プロバイダ）へのインターフェースです。
//! Store と Queue の trait はそれぞれ `store` / `queue` モジュールにあります。

pub mod clock;
pub mod id_generator;
pub mod provider;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::provider::{Provider, ProviderError, ScriptedProvider, SimulatedProvider};
