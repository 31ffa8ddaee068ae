// kernel/src/mem/mod.rs
//
// 役割:
// - メモリ関連のサブモジュールをまとめる中継点。
// - addr.rs（アドレス型）/ paging.rs（エントリ表現）/ address_space.rs（2 段テーブル操作）

pub mod addr;
pub mod address_space;
pub mod paging;
