// kernel/src/mem/paging.rs
//
// 2 段ページテーブル（PDE 1024 / PTE 1024）のエントリ表現。
// - エントリは u32 1 つ。上位 20bit が 4KiB 境界の物理アドレス、下位が属性。
// - テーブル自体は物理メモリ上にあり、読み書きは address_space 側が行う。

use crate::mem::addr::{PhysAddr, VirtAddr};

pub const PDE_CNT: usize = 1024;
pub const PTE_CNT: usize = 1024;

/// エントリ 1 つのバイト数
pub const ENTRY_SIZE: u32 = 4;

bitflags::bitflags! {
    /// ページ属性
    ///
    /// - PRESENT: エントリが有効
    /// - WRITABLE: 書き込み可能
    /// - USER: ユーザ空間からアクセス可能
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const PAGE_SIZE = 1 << 7;
        const GLOBAL = 1 << 8;
    }
}

/// fork 時に子へ引き継ぐ権限ビットの範囲
const PERM_MASK: u32 = 0x1FF;
const ADDR_MASK: u32 = !0xFFF;

/// PDE / PTE 共通のエントリ
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Entry(pub u32);

impl Entry {
    pub const EMPTY: Entry = Entry(0);

    pub fn new(addr: PhysAddr, flags: PteFlags) -> Entry {
        Entry((addr.0 & ADDR_MASK) | flags.bits())
    }

    pub fn is_present(self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    pub fn addr(self) -> PhysAddr {
        PhysAddr(self.0 & ADDR_MASK)
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// 下位 9bit（P/W/U 〜 G）
    pub fn perm(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & PERM_MASK)
    }
}

impl core::fmt::Debug for Entry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Entry({:#x}, {:?})", self.addr().0, self.flags())
    }
}

/// 仮想アドレスの上位 10bit（ページディレクトリ index）
pub fn pde_index(vaddr: VirtAddr) -> usize {
    ((vaddr.0 >> 22) & 0x3FF) as usize
}

/// 仮想アドレスの中位 10bit（ページテーブル index）
pub fn pte_index(vaddr: VirtAddr) -> usize {
    ((vaddr.0 >> 12) & 0x3FF) as usize
}

/// (pde index, pte index) → 仮想アドレス
pub fn vaddr_of(pde: usize, pte: usize) -> VirtAddr {
    VirtAddr(((pde as u32) << 22) | ((pte as u32) << 12))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_split_round_trips() {
        let v = VirtAddr(0x8040_3000);
        assert_eq!(pde_index(v), 0x201);
        assert_eq!(pte_index(v), 0x003);
        assert_eq!(vaddr_of(0x201, 0x003), v);
    }

    #[test]
    fn entry_keeps_address_and_permission() {
        let e = Entry::new(
            PhysAddr(0x0012_3456),
            PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE,
        );
        assert!(e.is_present());
        assert_eq!(e.addr(), PhysAddr(0x0012_3000));
        assert_eq!(e.perm(), PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE);
        assert!(!Entry::EMPTY.is_present());
    }
}
