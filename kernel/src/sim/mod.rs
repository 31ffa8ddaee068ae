// kernel/src/sim/mod.rs
//
// ホスト上のシミュレーション用バックエンド（std 使用）。
// cfg(test) か feature "sim" のときだけコンパイルされる。
//
// - SimHal: Vec<u8> の物理メモリと、記録するだけの割り込み / CR3 / 切替
// - MemFs: メモリ上のファイルシステム
// - elf_image: exec テスト用の ELF32 生成器

pub mod elf_image;
pub mod fs;
pub mod hal;

pub use fs::MemFs;
pub use hal::SimHal;
