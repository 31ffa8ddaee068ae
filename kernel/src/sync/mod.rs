// kernel/src/sync/mod.rs
//
// ブロッキング同期プリミティブ。
// - Mutex: 再帰可・所有者 1 つ。解放時は待ち先頭へ直接引き渡す。
// - Semaphore: 計数セマフォ。notify 時は待ち先頭へ直接 1 単位渡す。
//
// どちらも状態の読み書きは KernelState::enter_protection の区間内で行い、
// 待ち合わせはスケジューラの wait_on / wake_one に任せる。

pub mod mutex;
pub mod semaphore;

pub use mutex::Mutex;
pub use semaphore::Semaphore;
