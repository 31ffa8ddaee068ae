// kernel/src/mem/address_space.rs
//
// 役割:
// - タスクごとの仮想アドレス空間（ページディレクトリ + ページテーブル）を作る・壊す・複製する。
// - 別空間同士のバイト転送を、物理アドレスへの変換経由で行う。
//
// 設計方針:
// - MEMORY_TASK_BASE より下の PDE はカーネル正本テーブルからの値コピー（所有しない）。
// - それ以上の PDE が指すテーブルと、その PTE が指すページは、その空間だけが所有する。
// - テーブル本体は物理メモリ上にあり、読み書きは PhysMemory 越しに行う。
//
// やらないこと:
// - copy-on-write や demand paging（fork は全ページを即時複製する）
// - TLB flush（CR3 の載せ替えは呼び出し側 / Hal の責務）

use crate::arch::PhysMemory;
use crate::config::{KernelRegion, MEMORY_TASK_BASE, PAGE_SIZE};
use crate::mem::addr::{pages_for, PhysAddr, VirtAddr};
use crate::mem::paging::{pde_index, pte_index, vaddr_of, Entry, PteFlags, ENTRY_SIZE, PDE_CNT, PTE_CNT};
use crate::mm::PhysicalMemoryManager;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpaceError {
    /// 物理ページ（テーブル or データ）が確保できない
    OutOfMemory,
    /// 変換先が存在しない
    NotMapped,
    /// 32bit 空間を越える範囲
    BadAddress,
}

/// 空間間コピーで使う一時バッファのサイズ
const BOUNCE_SIZE: usize = 256;

/// 最初のタスク用 PDE index（これ未満はカーネル共有）
fn first_user_pde() -> usize {
    pde_index(VirtAddr(MEMORY_TASK_BASE))
}

/// ページテーブル操作の窓口。
///
/// 物理メモリとページアロケータを借りている間だけ生きる。
/// 状態として持つのはカーネル正本ディレクトリの位置だけ。
pub struct AddressSpaces<'a, M: PhysMemory> {
    mem: &'a mut M,
    frames: &'a PhysicalMemoryManager,
    kernel_dir: PhysAddr,
}

impl<'a, M: PhysMemory> AddressSpaces<'a, M> {
    pub fn new(mem: &'a mut M, frames: &'a PhysicalMemoryManager, kernel_dir: PhysAddr) -> Self {
        AddressSpaces {
            mem,
            frames,
            kernel_dir,
        }
    }

    pub fn kernel_dir(&self) -> PhysAddr {
        self.kernel_dir
    }

    // ────────────────────────────────────────────
    // 生成 / 破棄
    // ────────────────────────────────────────────

    /// カーネル正本ディレクトリを作り、regions を恒等マップする。
    ///
    /// 以降の create() はこのディレクトリの下位 PDE をコピーする。
    pub fn create_kernel_dir<'r, I>(&mut self, regions: I) -> Result<PhysAddr, AddressSpaceError>
    where
        I: IntoIterator<Item = &'r KernelRegion>,
    {
        let dir = self.alloc_zeroed()?;

        for region in regions {
            let start = region.vstart.align_down();
            let size = region.vend.0.saturating_sub(start.0);
            let count = pages_for(size);
            if count == 0 {
                continue;
            }
            if let Err(e) = self.map(dir, start, region.pstart.align_down(), count, region.perm) {
                self.destroy_tables(dir, 0, PDE_CNT, false);
                return Err(e);
            }
        }

        self.kernel_dir = dir;
        Ok(dir)
    }

    /// 空のタスク空間を作る（カーネル領域の PDE だけ値コピー済み）
    pub fn create(&mut self) -> Result<PhysAddr, AddressSpaceError> {
        let dir = self.alloc_zeroed()?;

        for index in 0..first_user_pde() {
            let offset = index as u32 * ENTRY_SIZE;
            let pde = self.mem.read_u32(self.kernel_dir.add(offset));
            if pde != 0 {
                self.mem.write_u32(dir.add(offset), pde);
            }
        }

        Ok(dir)
    }

    /// タスク領域のページ・テーブル・ディレクトリ本体を解放する。
    ///
    /// カーネル領域の PDE は別名なので触らない。
    pub fn destroy(&mut self, root: PhysAddr) {
        self.destroy_tables(root, first_user_pde(), PDE_CNT, true);
    }

    fn destroy_tables(&mut self, root: PhysAddr, from: usize, to: usize, free_pages: bool) {
        for index in from..to {
            let pde = Entry(self.mem.read_u32(root.add(index as u32 * ENTRY_SIZE)));
            if !pde.is_present() {
                continue;
            }

            let table = pde.addr();
            if free_pages {
                for slot in 0..PTE_CNT {
                    let pte = Entry(self.mem.read_u32(table.add(slot as u32 * ENTRY_SIZE)));
                    if pte.is_present() {
                        self.frames.free(pte.addr(), 1);
                    }
                }
            }
            self.frames.free(table, 1);
        }
        self.frames.free(root, 1);
    }

    // ────────────────────────────────────────────
    // マップ / 変換
    // ────────────────────────────────────────────

    /// vaddr から count ページを paddr 以降へ連続でマップする。
    ///
    /// - 足りないページテーブルは作る（P | W | U）。
    /// - 途中で失敗しても、それまでのマップは残す（後始末は呼び出し側）。
    /// - 既に存在する PTE への上書きは致命的エラー。
    pub fn map(
        &mut self,
        root: PhysAddr,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        count: u32,
        perm: PteFlags,
    ) -> Result<(), AddressSpaceError> {
        for i in 0..count {
            let offset = i * PAGE_SIZE;
            let va = vaddr.checked_add(offset).ok_or(AddressSpaceError::BadAddress)?;
            let slot = self.pte_slot(root, va, true)?.ok_or(AddressSpaceError::OutOfMemory)?;

            let old = Entry(self.mem.read_u32(slot));
            assert!(!old.is_present(), "map: {:#x} is already mapped", va.0);

            let pte = Entry::new(paddr.add(offset), perm | PteFlags::PRESENT);
            self.mem.write_u32(slot, pte.0);
        }
        Ok(())
    }

    /// vaddr → 物理アドレス（ページ内オフセット込み）。テーブルは作らない。
    pub fn translate(&mut self, root: PhysAddr, vaddr: VirtAddr) -> Option<PhysAddr> {
        let slot = self.pte_slot(root, vaddr, false).ok().flatten()?;
        let pte = Entry(self.mem.read_u32(slot));
        if !pte.is_present() {
            return None;
        }
        Some(pte.addr().add(vaddr.page_offset()))
    }

    /// PTE そのもの（未マップなら None）
    pub fn entry(&mut self, root: PhysAddr, vaddr: VirtAddr) -> Option<Entry> {
        let slot = self.pte_slot(root, vaddr, false).ok().flatten()?;
        let pte = Entry(self.mem.read_u32(slot));
        pte.is_present().then_some(pte)
    }

    /// [vaddr, vaddr + size) をページ単位で確保してマップする。
    ///
    /// vaddr はページ境界に切り下げる。ページは 0 で埋める。
    /// 途中失敗時、既にマップしたページは残る。
    pub fn alloc_and_map(
        &mut self,
        root: PhysAddr,
        vaddr: VirtAddr,
        size: u32,
        perm: PteFlags,
    ) -> Result<(), AddressSpaceError> {
        let start = vaddr.align_down();
        let end = vaddr.0.checked_add(size).ok_or(AddressSpaceError::BadAddress)?;
        let count = pages_for(end - start.0);

        for i in 0..count {
            let va = VirtAddr(start.0 + i * PAGE_SIZE);
            let page = self.alloc_zeroed()?;
            if let Err(e) = self.map(root, va, page, 1, perm) {
                self.frames.free(page, 1);
                return Err(e);
            }
        }
        Ok(())
    }

    /// [vaddr, vaddr + count ページ) のうちマップ済みのページを外して解放する。
    /// ページテーブル自体は残す。
    pub fn unmap(&mut self, root: PhysAddr, vaddr: VirtAddr, count: u32) {
        let start = vaddr.align_down();
        for i in 0..count {
            let Some(va) = start.checked_add(i * PAGE_SIZE) else {
                break;
            };
            let Ok(Some(slot)) = self.pte_slot(root, va, false) else {
                continue;
            };
            let pte = Entry(self.mem.read_u32(slot));
            if pte.is_present() {
                self.frames.free(pte.addr(), 1);
                self.mem.write_u32(slot, Entry::EMPTY.0);
            }
        }
    }

    /// src のタスク領域をすべて新しい空間へ即時複製する。
    ///
    /// 失敗した場合は作りかけの空間を丸ごと壊してから返す。
    pub fn copy(&mut self, src: PhysAddr) -> Result<PhysAddr, AddressSpaceError> {
        let dst = self.create()?;
        match self.copy_user_pages(src, dst) {
            Ok(()) => Ok(dst),
            Err(e) => {
                self.destroy(dst);
                Err(e)
            }
        }
    }

    fn copy_user_pages(&mut self, src: PhysAddr, dst: PhysAddr) -> Result<(), AddressSpaceError> {
        for index in first_user_pde()..PDE_CNT {
            let pde = Entry(self.mem.read_u32(src.add(index as u32 * ENTRY_SIZE)));
            if !pde.is_present() {
                continue;
            }

            let table = pde.addr();
            for slot in 0..PTE_CNT {
                let pte = Entry(self.mem.read_u32(table.add(slot as u32 * ENTRY_SIZE)));
                if !pte.is_present() {
                    continue;
                }

                let page = self.frames.alloc(1).ok_or(AddressSpaceError::OutOfMemory)?;
                if let Err(e) = self.map(dst, vaddr_of(index, slot), page, 1, pte.perm()) {
                    self.frames.free(page, 1);
                    return Err(e);
                }
                self.mem.copy(page, pte.addr(), PAGE_SIZE as usize);
            }
        }
        Ok(())
    }

    // ────────────────────────────────────────────
    // 空間越しのデータ転送
    // ────────────────────────────────────────────

    /// root 空間の va へ data を書く（ページ境界をまたいでよい）
    pub fn copy_to(&mut self, root: PhysAddr, va: VirtAddr, data: &[u8]) -> Result<(), AddressSpaceError> {
        let mut done = 0usize;
        while done < data.len() {
            let cur = va.checked_add(done as u32).ok_or(AddressSpaceError::BadAddress)?;
            let phys = self.translate(root, cur).ok_or(AddressSpaceError::NotMapped)?;
            let chunk = ((PAGE_SIZE - cur.page_offset()) as usize).min(data.len() - done);
            self.mem.write(phys, &data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// root 空間の va から buf.len() バイト読む
    pub fn read_from(&mut self, root: PhysAddr, va: VirtAddr, buf: &mut [u8]) -> Result<(), AddressSpaceError> {
        let mut done = 0usize;
        while done < buf.len() {
            let cur = va.checked_add(done as u32).ok_or(AddressSpaceError::BadAddress)?;
            let phys = self.translate(root, cur).ok_or(AddressSpaceError::NotMapped)?;
            let chunk = ((PAGE_SIZE - cur.page_offset()) as usize).min(buf.len() - done);
            self.mem.read(phys, &mut buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// 別空間同士で len バイトを転送する（exec の引数コピー用）
    pub fn copy_between(
        &mut self,
        dst_root: PhysAddr,
        dst_va: VirtAddr,
        src_root: PhysAddr,
        src_va: VirtAddr,
        len: u32,
    ) -> Result<(), AddressSpaceError> {
        let mut buf = [0u8; BOUNCE_SIZE];
        let mut done = 0u32;
        while done < len {
            let chunk = (len - done).min(BOUNCE_SIZE as u32);
            let src = src_va.checked_add(done).ok_or(AddressSpaceError::BadAddress)?;
            let dst = dst_va.checked_add(done).ok_or(AddressSpaceError::BadAddress)?;
            self.read_from(src_root, src, &mut buf[..chunk as usize])?;
            self.copy_to(dst_root, dst, &buf[..chunk as usize])?;
            done += chunk;
        }
        Ok(())
    }

    /// va から始まる NUL 終端文字列の長さ（max まで。NUL 自体は含まない）
    pub fn strlen(&mut self, root: PhysAddr, va: VirtAddr, max: u32) -> Result<u32, AddressSpaceError> {
        let mut len = 0u32;
        while len < max {
            let cur = va.checked_add(len).ok_or(AddressSpaceError::BadAddress)?;
            let mut b = [0u8; 1];
            self.read_from(root, cur, &mut b)?;
            if b[0] == 0 {
                return Ok(len);
            }
            len += 1;
        }
        Ok(max)
    }

    pub fn read_u32(&mut self, root: PhysAddr, va: VirtAddr) -> Result<u32, AddressSpaceError> {
        let mut b = [0u8; 4];
        self.read_from(root, va, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn write_u32(&mut self, root: PhysAddr, va: VirtAddr, value: u32) -> Result<(), AddressSpaceError> {
        self.copy_to(root, va, &value.to_le_bytes())
    }

    // ────────────────────────────────────────────
    // 内部ヘルパ
    // ────────────────────────────────────────────

    fn alloc_zeroed(&mut self) -> Result<PhysAddr, AddressSpaceError> {
        let page = self.frames.alloc(1).ok_or(AddressSpaceError::OutOfMemory)?;
        self.mem.fill(page, 0, PAGE_SIZE as usize);
        Ok(page)
    }

    /// vaddr に対応する PTE の物理アドレス。
    ///
    /// テーブルが無い場合、alloc なら作り、そうでなければ Ok(None)。
    fn pte_slot(&mut self, root: PhysAddr, vaddr: VirtAddr, alloc: bool) -> Result<Option<PhysAddr>, AddressSpaceError> {
        let pde_addr = root.add(pde_index(vaddr) as u32 * ENTRY_SIZE);
        let pde = Entry(self.mem.read_u32(pde_addr));

        let table = if pde.is_present() {
            pde.addr()
        } else if alloc {
            let table = self.alloc_zeroed()?;
            let flags = PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER;
            self.mem.write_u32(pde_addr, Entry::new(table, flags).0);
            table
        } else {
            return Ok(None);
        };

        Ok(Some(table.add(pte_index(vaddr) as u32 * ENTRY_SIZE)))
    }
}
