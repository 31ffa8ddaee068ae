// kernel/src/arch/mod.rs
//
// アーキ依存部。unsafe をできるだけここ（と x86/）に閉じ込める方針。
// - Hal: 割り込みフラグ / CR3 / CR2 / timer EOI / hlt
// - PhysMemory: 物理メモリの読み書き（ページテーブルもここ経由でしか触らない）
// - ContextSwitch: 実行コンテキストの保存と復元
//
// カーネル本体（kernel/）は Hal のメソッドしか呼ばない。
// 実機は x86::X86Hal、ホストでは sim::SimHal が実装する。

pub mod context;

#[cfg(target_arch = "x86")]
pub mod x86;

pub use context::{ContextSwitch, TaskContext};

use crate::mem::addr::{PhysAddr, VirtAddr};

/// 物理メモリへのアクセス手段。
///
/// - アドレスは物理アドレス。範囲外アクセスは実装側のバグとして扱う。
/// - ページテーブルのエントリ（u32）もここを通して読み書きする。
pub trait PhysMemory {
    fn read(&self, addr: PhysAddr, buf: &mut [u8]);
    fn write(&mut self, addr: PhysAddr, data: &[u8]);
    fn fill(&mut self, addr: PhysAddr, value: u8, len: usize);
    fn copy(&mut self, dst: PhysAddr, src: PhysAddr, len: usize);

    fn read_u32(&self, addr: PhysAddr) -> u32 {
        let mut b = [0u8; 4];
        self.read(addr, &mut b);
        u32::from_le_bytes(b)
    }

    fn write_u32(&mut self, addr: PhysAddr, value: u32) {
        self.write(addr, &value.to_le_bytes());
    }
}

/// カーネル本体が必要とするハードウェア操作の一式。
pub trait Hal: PhysMemory + ContextSwitch {
    /// 割り込み許可フラグ（EFLAGS.IF）の現在値
    fn interrupts_enabled(&self) -> bool;
    fn disable_interrupts(&mut self);
    fn enable_interrupts(&mut self);

    /// アクティブなページディレクトリを切り替える（CR3）
    fn set_page_dir(&mut self, root: PhysAddr);

    /// 直近のページフォルトのアドレス（CR2）
    fn fault_address(&self) -> VirtAddr;

    /// timer 割り込みの EOI
    fn ack_timer(&mut self);

    /// CPU を止める。戻らない。
    fn halt(&mut self) -> !;
}
