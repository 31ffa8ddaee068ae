// kernel/src/kernel/heap.rs
//
// user ヒープの伸長（sbrk）。
//
// - heap_end を incr バイト進め、古い heap_end を返す。
// - 新しく必要になったページだけを確保してマップする。
//   現在のページ内に収まる分は heap_end を進めるだけ。
// - 途中で確保に失敗したら、そこまでにマップしたページを外して失敗を返す。
// - 縮小（負の incr）は扱わない。

use crate::arch::Hal;
use crate::config::{MEM_TASK_STACK_SIZE, MEM_TASK_STACK_TOP, PAGE_SIZE};
use crate::error::KernelError;
use crate::kernel::fs::FileSystem;
use crate::kernel::KernelState;
use crate::mem::addr::{align_up, pages_for, VirtAddr};
use crate::mem::paging::PteFlags;

impl<H: Hal, F: FileSystem> KernelState<H, F> {
    pub fn grow_heap(&mut self, incr: i32) -> Result<u32, KernelError> {
        let cur = self.current;
        let old_end = self.tasks[cur].heap_end;

        if incr == 0 {
            return Ok(old_end);
        }
        if incr < 0 {
            log::warn!("sbrk: shrinking is not supported (incr = {})", incr);
            return Err(KernelError::InvalidArgument);
        }

        let end = old_end.checked_add(incr as u32).ok_or(KernelError::BadAddress)?;
        if end > MEM_TASK_STACK_TOP - MEM_TASK_STACK_SIZE {
            log::warn!("sbrk: heap would reach the stack ({:#x})", end);
            return Err(KernelError::BadAddress);
        }

        let start = align_up(old_end, PAGE_SIZE).ok_or(KernelError::BadAddress)?;
        if end > start {
            let root = self.current_root();
            let perm = PteFlags::USER | PteFlags::WRITABLE;
            if let Err(e) = self.spaces().alloc_and_map(root, VirtAddr(start), end - start, perm) {
                log::warn!("sbrk: alloc failed at {:#x}..{:#x}", start, end);
                self.spaces().unmap(root, VirtAddr(start), pages_for(end - start));
                return Err(e.into());
            }
        }

        self.tasks[cur].heap_end = end;
        Ok(old_end)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{FIRST_TASK_PAGES, MEMORY_TASK_BASE, PAGE_SIZE};
    use crate::error::KernelError;
    use crate::kernel::syscall::{SyscallFrame, SYS_SBRK};
    use crate::kernel::testutil::*;
    use crate::mem::addr::VirtAddr;

    const HEAP: u32 = MEMORY_TASK_BASE + FIRST_TASK_PAGES * PAGE_SIZE;

    fn init() -> SimKernel {
        let mut k = boot();
        k.create_first_task("init", &[0; 16]).unwrap();
        k
    }

    #[test]
    fn zero_increment_reports_current_end() {
        let mut k = init();
        assert_eq!(k.grow_heap(0), Ok(HEAP));
        assert_eq!(k.grow_heap(-4), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn growth_maps_only_new_pages() {
        let mut k = init();
        let free = k.frames().free_pages();

        assert_eq!(k.grow_heap(100), Ok(HEAP));
        assert_eq!(k.current_task().heap_end, HEAP + 100);
        // 新しいページテーブルは要らない（同じ 4MiB 内）
        assert_eq!(k.frames().free_pages(), free - 1);
        k.write_user_u32(VirtAddr(HEAP + 96), 42).unwrap();

        // 同じページ内
        assert_eq!(k.grow_heap(200), Ok(HEAP + 100));
        assert_eq!(k.frames().free_pages(), free - 1);

        // ページ境界をまたぐ
        assert_eq!(k.grow_heap(PAGE_SIZE as i32), Ok(HEAP + 300));
        assert_eq!(k.frames().free_pages(), free - 2);
        assert_eq!(k.read_user_u32(VirtAddr(HEAP + PAGE_SIZE + 200)), Ok(0));
        assert_eq!(k.read_user_u32(VirtAddr(HEAP + 96)), Ok(42));
    }

    #[test]
    fn failed_growth_is_rolled_back() {
        let mut k = init();
        while k.frames().free_pages() > 1 {
            k.frames().alloc(1).unwrap();
        }

        assert_eq!(k.grow_heap(3 * PAGE_SIZE as i32), Err(KernelError::OutOfMemory));
        assert_eq!(k.frames().free_pages(), 1);
        assert_eq!(k.current_task().heap_end, HEAP);
        assert!(k.read_user_u32(VirtAddr(HEAP)).is_err());

        // 1 ページなら入る
        assert_eq!(k.grow_heap(8), Ok(HEAP));
    }

    #[test]
    fn sbrk_syscall_returns_old_break() {
        let mut k = init();
        let mut frame = SyscallFrame::new(SYS_SBRK, [64, 0, 0, 0]);
        k.handle_syscall(&mut frame);
        assert_eq!(frame.eax, HEAP);

        let mut frame = SyscallFrame::new(SYS_SBRK, [0, 0, 0, 0]);
        k.handle_syscall(&mut frame);
        assert_eq!(frame.eax, HEAP + 64);

        let mut frame = SyscallFrame::new(SYS_SBRK, [i32::MAX as u32, 0, 0, 0]);
        k.handle_syscall(&mut frame);
        assert_eq!(frame.ret(), -1);
    }
}
