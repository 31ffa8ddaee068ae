// kernel/src/config.rs
//
// 役割:
// - カーネル全体で共有する定数と、起動時に決まる設定（KernelConfig）を集約する。
//
// やること:
// - メモリレイアウト・タスク数・tick 周期などの固定値を 1 か所に置く。
// - ブート時のメモリ量から KernelConfig を組み立てる。
//
// やらないこと:
// - 実際のページテーブル構築（mem 側）や CR3 操作（arch 側）。

use crate::mem::addr::{PhysAddr, VirtAddr};
use crate::mem::paging::PteFlags;

/// ページサイズ（4KiB 固定）
pub const PAGE_SIZE: u32 = 4096;

/// 1MiB 以上を拡張メモリとしてアロケータに渡す
pub const MEM_EXT_START: u32 = 1024 * 1024;
/// 管理する物理メモリの上限（128MiB）
pub const MEM_EXT_END: u32 = 128 * 1024 * 1024;

/// タスク空間の開始アドレス。これより下はカーネル共有領域。
pub const MEMORY_TASK_BASE: u32 = 0x8000_0000;

/// ユーザスタックの最上位（このアドレス自体は含まない）
pub const MEM_TASK_STACK_TOP: u32 = 0xE000_0000;
/// ユーザスタックのサイズ（500 ページ）
pub const MEM_TASK_STACK_SIZE: u32 = PAGE_SIZE * 500;
/// スタック最上位に確保する引数領域
pub const MEM_TASK_ARG_SIZE: u32 = PAGE_SIZE * 4;

/// timer 割り込みの周期（ms）
pub const OS_TICK_MS: u32 = 10;

/// 同時に存在できるタスク数
pub const TASK_NR: usize = 128;
/// 1 タスクが開けるファイル数
pub const TASK_OFILE_NR: usize = 128;
/// タスク名の最大長（終端含む）
pub const TASK_NAME_SIZE: usize = 32;
/// 既定の時間片（tick 数）
pub const TASK_TIME_SLICE_DEFAULT: u32 = 10;

/// syscall で user スタックから積まれる値の数（id + 引数 4 つ）
pub const SYSCALL_PARAM_COUNT: u32 = 5;

/// 最初のタスクに割り当てる領域（ページ数）
pub const FIRST_TASK_PAGES: u32 = 10;

pub const EFLAGS_DEFAULT: u32 = 1 << 1;
pub const EFLAGS_IF: u32 = 1 << 9;

// セグメントセレクタ（GDT の配置はブート側の責務。ここでは値だけ持つ）
pub const KERNEL_SELECTOR_CS: u32 = 0x08;
pub const KERNEL_SELECTOR_DS: u32 = 0x10;
pub const APP_SELECTOR_CS: u32 = 0x20;
pub const APP_SELECTOR_DS: u32 = 0x28;
pub const SEG_CPL3: u32 = 3;

/// カーネル空間に恒等マップする 1 区間
#[derive(Clone, Copy, Debug)]
pub struct KernelRegion {
    pub vstart: VirtAddr,
    pub vend: VirtAddr,
    pub pstart: PhysAddr,
    pub perm: PteFlags,
}

const MAX_KERNEL_REGIONS: usize = 4;

/// 起動時に決まる設定
#[derive(Clone, Copy, Debug)]
pub struct KernelConfig {
    /// アロケータが管理する物理領域 [mem_start, mem_end)
    pub mem_start: PhysAddr,
    pub mem_end: PhysAddr,
    pub tick_ms: u32,
    pub idle_entry: VirtAddr,
    pub kernel_regions: [Option<KernelRegion>; MAX_KERNEL_REGIONS],
}

impl KernelConfig {
    /// 物理メモリ総量から既定の設定を作る。
    ///
    /// - 1MiB 未満はアロケータに渡さない。
    /// - 128MiB を超える分は使わない。
    /// - [0, mem_end) をカーネル空間に恒等マップする。
    pub fn for_memory(total_bytes: u32) -> Self {
        let end = total_bytes.min(MEM_EXT_END) & !(PAGE_SIZE - 1);

        let mut kernel_regions = [None; MAX_KERNEL_REGIONS];
        kernel_regions[0] = Some(KernelRegion {
            vstart: VirtAddr(0),
            vend: VirtAddr(end),
            pstart: PhysAddr(0),
            perm: PteFlags::WRITABLE,
        });

        KernelConfig {
            mem_start: PhysAddr(MEM_EXT_START),
            mem_end: PhysAddr(end),
            tick_ms: OS_TICK_MS,
            idle_entry: VirtAddr(0),
            kernel_regions,
        }
    }

    pub fn with_idle_entry(mut self, entry: VirtAddr) -> Self {
        self.idle_entry = entry;
        self
    }

    pub fn mem_size(&self) -> u32 {
        self.mem_end.0.saturating_sub(self.mem_start.0)
    }

    pub fn regions(&self) -> impl Iterator<Item = &KernelRegion> {
        self.kernel_regions.iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_memory_clamps_and_aligns() {
        let cfg = KernelConfig::for_memory(200 * 1024 * 1024 + 123);
        assert_eq!(cfg.mem_start, PhysAddr(MEM_EXT_START));
        assert_eq!(cfg.mem_end, PhysAddr(MEM_EXT_END));

        let cfg = KernelConfig::for_memory(16 * 1024 * 1024 + 100);
        assert_eq!(cfg.mem_end, PhysAddr(16 * 1024 * 1024));
        assert_eq!(cfg.mem_size(), 15 * 1024 * 1024);
        assert_eq!(cfg.regions().count(), 1);
    }
}
