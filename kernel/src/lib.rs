// kernel/src/lib.rs
//
// mini32: 32bit ページング前提の小さなプリエンプティブ・カーネル
//
// - 物理ページ: bitmap アロケータ（mm）
// - 仮想空間: 2 段ページテーブル（mem）
// - タスク / スケジューラ / fork・exec・exit・wait（kernel）
// - mutex / semaphore（sync）
// - ハードウェア依存はすべて arch::Hal 越しに触る
//
// ホスト上では sim（std 使用）の HAL と FS で全操作をテストできる。

#![no_std]

#[cfg(any(test, feature = "sim"))]
extern crate std;

pub mod arch;
pub mod config;
pub mod error;
pub mod kernel;
pub mod logging;
pub mod mem;
pub mod mm;
pub mod sync;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

#[cfg(all(target_os = "none", not(test)))]
mod panic;

pub use config::KernelConfig;
pub use error::KernelError;
pub use kernel::{KernelState, TaskId, TaskState};
