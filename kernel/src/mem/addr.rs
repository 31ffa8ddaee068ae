// src/mem/addr.rs
//
// 役割:
// - 物理アドレス / 仮想アドレスに型を付ける（32bit）。
// やること:
// - u32 の生アドレス値に対して「これは物理」「これは仮想」と区別できるようにする。
// - ページ境界への切り上げ・切り捨て、ページ内オフセットの計算。
// やらないこと:
// - ページテーブルの読み書き（mem::address_space 側で行う）。

use core::fmt;

use crate::config::PAGE_SIZE;

/// 物理アドレス（バイト単位）
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysAddr(pub u32);

/// 仮想アドレス（バイト単位）
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtAddr(pub u32);

/// size 以下の最大の align 倍数
pub const fn align_down(value: u32, align: u32) -> u32 {
    value & !(align - 1)
}

/// size 以上の最小の align 倍数（オーバーフロー時は None）
pub const fn align_up(value: u32, align: u32) -> Option<u32> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// バイト数 → 必要ページ数
pub const fn pages_for(size: u32) -> u32 {
    size / PAGE_SIZE + if size % PAGE_SIZE != 0 { 1 } else { 0 }
}

impl PhysAddr {
    /// 下位ビットを切り捨てて、ページ境界に揃える。
    pub const fn align_down(self) -> PhysAddr {
        PhysAddr(align_down(self.0, PAGE_SIZE))
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    pub const fn page_offset(self) -> u32 {
        self.0 & (PAGE_SIZE - 1)
    }

    pub const fn add(self, bytes: u32) -> PhysAddr {
        PhysAddr(self.0 + bytes)
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl VirtAddr {
    /// 下位ビットを切り捨てて、ページ境界に揃える。
    pub const fn align_down(self) -> VirtAddr {
        VirtAddr(align_down(self.0, PAGE_SIZE))
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    pub const fn page_offset(self) -> u32 {
        self.0 & (PAGE_SIZE - 1)
    }

    /// 32bit 空間を越える場合は None
    pub const fn checked_add(self, bytes: u32) -> Option<VirtAddr> {
        match self.0.checked_add(bytes) {
            Some(v) => Some(VirtAddr(v)),
            None => None,
        }
    }
}

// --- Debug 実装（ログで見やすくするため） ---

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0x1234, PAGE_SIZE), 0x1000);
        assert_eq!(align_up(0x1234, PAGE_SIZE), Some(0x2000));
        assert_eq!(align_up(0x2000, PAGE_SIZE), Some(0x2000));
        assert_eq!(align_up(0xFFFF_F001, PAGE_SIZE), None);
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
    }

    #[test]
    fn offsets_and_debug_format() {
        let v = VirtAddr(0x8000_1234);
        assert_eq!(v.page_offset(), 0x234);
        assert_eq!(v.align_down(), VirtAddr(0x8000_1000));
        assert_eq!(VirtAddr(u32::MAX).checked_add(1), None);
        assert_eq!(std::format!("{:?}", PhysAddr(0x1000)), "PhysAddr(0x1000)");
    }
}
