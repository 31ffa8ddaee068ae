// src/mm/mod.rs
//
// 物理メモリ管理の入り口。
// - 連続した 1 区間の物理メモリを、1bit = 1 ページの bitmap で管理する。
// - alloc(n) は先頭から n 連続の空きを探す（first fit）。
// - 状態は BitmapAllocator に閉じ込め、外からは spin::Mutex 越しにしか触らない。

use spin::Mutex;

use crate::config::{MEM_EXT_END, MEM_EXT_START, PAGE_SIZE};
use crate::mem::addr::PhysAddr;

/// 管理できる最大ページ数（MEM_EXT_START..MEM_EXT_END）
const MAX_PAGES: usize = ((MEM_EXT_END - MEM_EXT_START) / PAGE_SIZE) as usize;
const BITMAP_BYTES: usize = (MAX_PAGES + 7) / 8;

/// カーネル側から見える「物理メモリマネージャ」。
/// - 外部 API はすべて safe、&self で呼べる（内部でロックを取る）。
pub struct PhysicalMemoryManager {
    inner: Mutex<BitmapAllocator>,
}

impl PhysicalMemoryManager {
    /// [base, base + size) をページ単位で管理するアロケータを作る。
    ///
    /// # 設計上の前提
    /// - base は page_size 境界にあること。
    /// - size のうちページに満たない端数は捨てる。
    /// - MAX_PAGES を超える分は管理しない。
    pub fn new(base: PhysAddr, size: u32, page_size: u32) -> Self {
        PhysicalMemoryManager {
            inner: Mutex::new(BitmapAllocator::new(base, size, page_size)),
        }
    }

    /// 連続 n ページを確保する。空きが無ければ None。
    pub fn alloc(&self, pages: usize) -> Option<PhysAddr> {
        self.inner.lock().alloc(pages)
    }

    /// alloc で得た先頭アドレスから n ページを返却する。
    pub fn free(&self, addr: PhysAddr, pages: usize) {
        self.inner.lock().free(addr, pages)
    }

    pub fn free_pages(&self) -> usize {
        self.inner.lock().free_pages()
    }

    pub fn total_pages(&self) -> usize {
        self.inner.lock().page_count
    }

    pub fn base(&self) -> PhysAddr {
        self.inner.lock().base
    }

    pub fn page_size(&self) -> u32 {
        self.inner.lock().page_size
    }
}

/// bitmap 本体。
///
/// - 状態: `bits`（1 = 使用中）と `used`（使用中ページ数）
/// - 割り当て済みページは必ず 1 ビットだけに対応する。
struct BitmapAllocator {
    base: PhysAddr,
    page_size: u32,
    page_count: usize,
    used: usize,
    bits: [u8; BITMAP_BYTES],
}

impl BitmapAllocator {
    fn new(base: PhysAddr, size: u32, page_size: u32) -> Self {
        let page_count = ((size / page_size) as usize).min(MAX_PAGES);
        BitmapAllocator {
            base,
            page_size,
            page_count,
            used: 0,
            bits: [0; BITMAP_BYTES],
        }
    }

    fn get(&self, index: usize) -> bool {
        self.bits[index / 8] & (1 << (index % 8)) != 0
    }

    fn set(&mut self, index: usize, used: bool) {
        if used {
            self.bits[index / 8] |= 1 << (index % 8);
        } else {
            self.bits[index / 8] &= !(1 << (index % 8));
        }
    }

    fn alloc(&mut self, pages: usize) -> Option<PhysAddr> {
        if pages == 0 || pages > self.page_count {
            return None;
        }

        let mut run_start = 0;
        let mut run_len = 0;
        for index in 0..self.page_count {
            if self.get(index) {
                run_len = 0;
                run_start = index + 1;
                continue;
            }

            run_len += 1;
            if run_len == pages {
                for i in run_start..run_start + pages {
                    self.set(i, true);
                }
                self.used += pages;
                let offset = run_start as u32 * self.page_size;
                return Some(PhysAddr(self.base.0 + offset));
            }
        }

        None
    }

    fn free(&mut self, addr: PhysAddr, pages: usize) {
        assert!(addr.0 >= self.base.0, "free: address below managed range");
        let offset = addr.0 - self.base.0;
        assert!(offset % self.page_size == 0, "free: address not page aligned");

        let first = (offset / self.page_size) as usize;
        assert!(first + pages <= self.page_count, "free: range beyond managed memory");

        for index in first..first + pages {
            assert!(self.get(index), "free: page {:#x} was not allocated", addr.0);
            self.set(index, false);
        }
        self.used -= pages;
    }

    fn free_pages(&self) -> usize {
        self.page_count - self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    fn pmm(pages: u32) -> PhysicalMemoryManager {
        PhysicalMemoryManager::new(PhysAddr(MEM_EXT_START), pages * PAGE_SIZE, PAGE_SIZE)
    }

    #[test]
    fn first_fit_returns_lowest_run() {
        let pm = pmm(16);
        assert_eq!(pm.alloc(2), Some(PhysAddr(MEM_EXT_START)));
        assert_eq!(pm.alloc(1), Some(PhysAddr(MEM_EXT_START + 2 * PAGE_SIZE)));

        pm.free(PhysAddr(MEM_EXT_START), 2);
        // 3 ページは先頭の穴（2 ページ）に入らないので後ろへ
        assert_eq!(pm.alloc(3), Some(PhysAddr(MEM_EXT_START + 3 * PAGE_SIZE)));
        assert_eq!(pm.alloc(2), Some(PhysAddr(MEM_EXT_START)));
    }

    #[test]
    fn exhaustion_is_reported_not_fatal() {
        let pm = pmm(4);
        assert!(pm.alloc(4).is_some());
        assert_eq!(pm.alloc(1), None);
        assert_eq!(pm.alloc(0), None);
        assert_eq!(pm.free_pages(), 0);
    }

    #[test]
    fn runs_never_overlap_and_balance_restores_all_pages() {
        let pm = pmm(64);
        let mut live: Vec<(u32, usize)> = Vec::new();
        let mut seed: u32 = 0x1234_5678;

        for _ in 0..500 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let pages = 1 + (seed >> 16) as usize % 5;

            if (seed >> 8) & 1 == 0 || live.is_empty() {
                if let Some(addr) = pm.alloc(pages) {
                    let start = addr.0;
                    let end = start + pages as u32 * PAGE_SIZE;
                    for &(s, n) in &live {
                        let e = s + n as u32 * PAGE_SIZE;
                        assert!(end <= s || start >= e, "overlapping runs");
                    }
                    live.push((start, pages));
                }
            } else {
                let victim = (seed as usize >> 4) % live.len();
                let (s, n) = live.swap_remove(victim);
                pm.free(PhysAddr(s), n);
            }
        }

        for (s, n) in live.drain(..) {
            pm.free(PhysAddr(s), n);
        }
        assert_eq!(pm.free_pages(), 64);
        assert_eq!(pm.total_pages(), 64);
    }

    #[test]
    #[should_panic(expected = "was not allocated")]
    fn double_free_is_fatal() {
        let pm = pmm(4);
        let a = pm.alloc(1).unwrap();
        pm.free(a, 1);
        pm.free(a, 1);
    }
}
