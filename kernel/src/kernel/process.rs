// kernel/src/kernel/process.rs
//
// 役割:
// - タスクの生成と破棄（create_task / start_task / uninit）
// - 最初の user タスクの起動（create_first_task）
// - プロセス操作 fork / exec / exit / wait
//
// やること:
// - カーネルスタック 1 ページとページディレクトリをタスクごとに持たせる。
// - fork はアドレス空間を即時コピーする。ファイルは参照カウントを増やして共有する。
// - exec は新しい空間を完全に組み立ててから差し替える。失敗したら元の空間はそのまま。
// - exit したタスクは ZOMBIE として残り、親の wait で回収される。
//   親が先に死んだ子は init（最初の user タスク）に引き取らせる。
//
// やらないこと:
// - copy-on-write、シグナル、kill。

use crate::arch::{Hal, TaskContext};
use crate::config::{
    APP_SELECTOR_CS, APP_SELECTOR_DS, EFLAGS_DEFAULT, EFLAGS_IF, FIRST_TASK_PAGES, KERNEL_SELECTOR_CS,
    KERNEL_SELECTOR_DS, MEMORY_TASK_BASE, MEM_TASK_ARG_SIZE, MEM_TASK_STACK_SIZE, MEM_TASK_STACK_TOP, PAGE_SIZE,
    SEG_CPL3, SYSCALL_PARAM_COUNT, TASK_NR, TASK_OFILE_NR, TASK_TIME_SLICE_DEFAULT,
};
use crate::error::KernelError;
use crate::kernel::elf::{ElfHeader, ProgramHeader, EHDR_SIZE, PHDR_SIZE, PT_LOAD};
use crate::kernel::fs::{FileId, FileSystem, O_RDONLY, SEEK_SET};
use crate::kernel::syscall::{SyscallFrame, PATH_MAX};
use crate::kernel::task::{self, TaskFlags};
use crate::kernel::{KernelState, LogEvent, TaskId, TaskState, IDLE_SLOT};
use crate::mem::addr::{PhysAddr, VirtAddr};
use crate::mem::paging::PteFlags;

/// user 領域のページ属性
const USER_RW: PteFlags = PteFlags::PRESENT.union(PteFlags::USER).union(PteFlags::WRITABLE);

/// セグメント読み込みの単位
const LOAD_CHUNK: usize = 512;

/// exec で組み立てた新しいイメージ
struct LoadedImage {
    entry: u32,
    heap: u32,
    stack_top: u32,
}

impl<H: Hal, F: FileSystem> KernelState<H, F> {
    // ────────────────────────────────────────────
    // 生成 / 破棄
    // ────────────────────────────────────────────

    /// タスクを作る（CREATED のまま。走らせるには start_task）。
    ///
    /// esp が 0 ならカーネルスタックの最上位を使う。
    pub fn create_task(
        &mut self,
        name: &str,
        flags: TaskFlags,
        entry: VirtAddr,
        esp: VirtAddr,
    ) -> Result<TaskId, KernelError> {
        let id = self.alloc_task_slot()?;
        if let Err(e) = self.task_init(id.index(), name, flags, entry, esp) {
            let irq = self.enter_protection();
            task::free_slot(&mut self.tasks, id.index());
            self.leave_protection(irq);
            return Err(e);
        }
        Ok(id)
    }

    fn alloc_task_slot(&mut self) -> Result<TaskId, KernelError> {
        let irq = self.enter_protection();
        let slot = task::alloc_slot(&mut self.tasks, 0);
        self.leave_protection(irq);
        slot.ok_or_else(|| {
            log::warn!("task table is full");
            KernelError::NoFreeTask
        })
    }

    fn task_init(
        &mut self,
        idx: usize,
        name: &str,
        flags: TaskFlags,
        entry: VirtAddr,
        esp: VirtAddr,
    ) -> Result<(), KernelError> {
        let kstack = self.frames.alloc(1).ok_or(KernelError::OutOfMemory)?;
        let root = match self.spaces().create() {
            Ok(root) => root,
            Err(e) => {
                self.frames.free(kstack, 1);
                return Err(e.into());
            }
        };

        let kstack_top = kstack.0 + PAGE_SIZE;
        let (cs, ds) = if flags.contains(TaskFlags::SYSTEM) {
            (KERNEL_SELECTOR_CS, KERNEL_SELECTOR_DS)
        } else {
            (APP_SELECTOR_CS | SEG_CPL3, APP_SELECTOR_DS | SEG_CPL3)
        };

        let t = &mut self.tasks[idx];
        t.context = TaskContext {
            eip: entry.0,
            esp: if esp.0 == 0 { kstack_top } else { esp.0 },
            esp0: kstack_top,
            ss0: KERNEL_SELECTOR_DS,
            eflags: EFLAGS_DEFAULT | EFLAGS_IF,
            cs,
            ds,
            es: ds,
            fs: ds,
            gs: ds,
            ss: ds,
            cr3: root.0,
            ..TaskContext::ZERO
        };
        t.set_name(name);
        t.flags = flags;
        t.state = TaskState::Created;
        t.time_slice = TASK_TIME_SLICE_DEFAULT;
        t.slice_ticks = TASK_TIME_SLICE_DEFAULT;

        let irq = self.enter_protection();
        self.task_list.push_back(&mut self.tasks, idx);
        self.leave_protection(irq);

        let id = self.id_of(idx);
        self.push_event(LogEvent::TaskCreated(id));
        Ok(())
    }

    /// 初回起動用の状態を作って ready に積む
    pub fn start_task(&mut self, id: TaskId) {
        let Some(idx) = self.slot_of(id) else {
            log::warn!("start_task: stale task id {}", id.as_pid());
            return;
        };
        self.hal.prepare(&mut self.tasks[idx].context);

        let irq = self.enter_protection();
        self.set_ready(idx);
        self.leave_protection(irq);
    }

    /// タスクの資源をすべて返し、スロットを空ける
    pub(crate) fn uninit(&mut self, idx: usize) {
        let ctx = self.tasks[idx].context;
        if ctx.esp0 != 0 {
            self.frames.free(PhysAddr(ctx.esp0 - PAGE_SIZE), 1);
        }
        if ctx.cr3 != 0 {
            self.spaces().destroy(PhysAddr(ctx.cr3));
        }
        self.close_files(idx);

        let irq = self.enter_protection();
        self.task_list.remove(&mut self.tasks, idx);
        self.ready_list.remove(&mut self.tasks, idx);
        self.sleep_list.remove(&mut self.tasks, idx);
        task::free_slot(&mut self.tasks, idx);
        self.leave_protection(irq);
    }

    fn close_files(&mut self, idx: usize) {
        for fd in 0..TASK_OFILE_NR {
            if let Some(file) = self.tasks[idx].files[fd].take() {
                self.fs.close(file);
            }
        }
    }

    /// 最初の user タスク（init）を作って走らせる。
    ///
    /// image は MEMORY_TASK_BASE から FIRST_TASK_PAGES ページの領域に置かれ、
    /// スタックはその領域の末尾から下へ伸びる。
    pub fn create_first_task(&mut self, name: &str, image: &[u8]) -> Result<TaskId, KernelError> {
        let base = MEMORY_TASK_BASE;
        let size = FIRST_TASK_PAGES * PAGE_SIZE;
        if image.len() > size as usize {
            log::error!("first task image too large: {} bytes", image.len());
            return Err(KernelError::BadExecutable);
        }

        let id = self.create_task(name, TaskFlags::empty(), VirtAddr(base), VirtAddr(base + size))?;
        let idx = id.index();
        let root = PhysAddr(self.tasks[idx].context.cr3);
        if let Err(e) = self.load_first_image(root, base, size, image) {
            self.uninit(idx);
            return Err(e);
        }

        let t = &mut self.tasks[idx];
        t.heap_start = base + size;
        t.heap_end = base + size;
        self.first_task = Some(idx);
        log::info!("first task: pid = {}, {} bytes at {:#x}", id.as_pid(), image.len(), base);

        self.start_task(id);
        self.dispatch();
        Ok(id)
    }

    fn load_first_image(&mut self, root: PhysAddr, base: u32, size: u32, image: &[u8]) -> Result<(), KernelError> {
        let mut spaces = self.spaces();
        spaces.alloc_and_map(root, VirtAddr(base), size, USER_RW)?;
        spaces.copy_to(root, VirtAddr(base), image)?;
        Ok(())
    }

    // ────────────────────────────────────────────
    // fork
    // ────────────────────────────────────────────

    /// 現在のタスクを複製する。子は syscall の戻り先から eax = 0 で再開する。
    pub fn fork(&mut self, frame: &SyscallFrame) -> Result<TaskId, KernelError> {
        let parent_idx = self.current;
        let parent_id = self.id_of(parent_idx);
        let child = self.alloc_task_slot()?;

        if let Err(e) = self.fork_into(child.index(), parent_idx, frame) {
            log::warn!("fork failed: parent = {}, {}", parent_id.as_pid(), e);
            self.uninit(child.index());
            return Err(e);
        }

        self.start_task(child);
        self.push_event(LogEvent::Forked {
            parent: parent_id,
            child,
        });
        Ok(child)
    }

    fn fork_into(&mut self, idx: usize, parent_idx: usize, frame: &SyscallFrame) -> Result<(), KernelError> {
        let parent = self.tasks[parent_idx];

        // 呼び出しゲートが user スタックから積んだ引数の分だけ戻す
        let user_esp = frame.esp.wrapping_add(4 * SYSCALL_PARAM_COUNT);
        self.task_init(idx, parent.name(), parent.flags, VirtAddr(frame.eip), VirtAddr(user_esp))?;

        let ctx = &mut self.tasks[idx].context;
        ctx.eax = 0;
        ctx.ebx = frame.ebx;
        ctx.ecx = frame.ecx;
        ctx.edx = frame.edx;
        ctx.esi = frame.esi;
        ctx.edi = frame.edi;
        ctx.ebp = frame.ebp;
        ctx.cs = frame.cs;
        ctx.ds = frame.ds;
        ctx.es = frame.es;
        ctx.fs = frame.fs;
        ctx.gs = frame.gs;
        ctx.eflags = frame.eflags;

        for (fd, file) in parent.files.iter().enumerate() {
            if let Some(file) = *file {
                self.fs.add_ref(file);
                self.tasks[idx].files[fd] = Some(file);
            }
        }

        // task_init が作った空の空間を親の複製に差し替える
        let fresh = PhysAddr(self.tasks[idx].context.cr3);
        self.spaces().destroy(fresh);
        self.tasks[idx].context.cr3 = 0;
        let root = self.spaces().copy(PhysAddr(parent.context.cr3))?;

        let parent_id = self.id_of(parent_idx);
        let t = &mut self.tasks[idx];
        t.context.cr3 = root.0;
        t.heap_start = parent.heap_start;
        t.heap_end = parent.heap_end;
        t.parent = Some(parent_id);
        Ok(())
    }

    // ────────────────────────────────────────────
    // exec
    // ────────────────────────────────────────────

    /// 現在のタスクを path の実行ファイルで置き換える。
    ///
    /// 成功すると frame は新しいイメージの入口を指す。
    /// 失敗した場合、タスクの空間・名前・ヒープは呼び出し前のまま。
    pub fn exec(
        &mut self,
        frame: &mut SyscallFrame,
        path: VirtAddr,
        argv: VirtAddr,
        env: VirtAddr,
    ) -> Result<(), KernelError> {
        // 環境変数は渡さない
        let _ = env;

        let mut path_buf = [0u8; PATH_MAX];
        let path = self.read_user_str(path, &mut path_buf)?;

        let old_root = self.current_root();
        let new_root = self.spaces().create()?;
        let image = match self.build_image(path, old_root, new_root, argv) {
            Ok(image) => image,
            Err(e) => {
                log::warn!("exec {} failed: {}", path, e);
                self.spaces().destroy(new_root);
                return Err(e);
            }
        };

        frame.eip = image.entry;
        frame.eax = 0;
        frame.ebx = 0;
        frame.ecx = 0;
        frame.edx = 0;
        frame.esi = 0;
        frame.edi = 0;
        frame.ebp = 0;
        frame.eflags = EFLAGS_DEFAULT | EFLAGS_IF;
        // 戻るときに引数分が捨てられて、esp が stack_top に揃う
        frame.esp = image.stack_top - 4 * SYSCALL_PARAM_COUNT;

        let cur = self.current;
        let t = &mut self.tasks[cur];
        t.set_name(basename(path));
        t.heap_start = image.heap;
        t.heap_end = image.heap;
        t.context.cr3 = new_root.0;

        self.hal.set_page_dir(new_root);
        self.spaces().destroy(old_root);

        let id = self.id_of(cur);
        self.push_event(LogEvent::Executed(id));
        log::info!("exec: pid = {} -> {} entry = {:#x}", id.as_pid(), path, image.entry);
        Ok(())
    }

    fn build_image(
        &mut self,
        path: &str,
        old_root: PhysAddr,
        new_root: PhysAddr,
        argv: VirtAddr,
    ) -> Result<LoadedImage, KernelError> {
        let file = self.fs.open(path, O_RDONLY)?;
        let loaded = self.load_segments(file, new_root);
        self.fs.close(file);
        let (entry, heap) = loaded?;

        let stack_base = MEM_TASK_STACK_TOP - MEM_TASK_STACK_SIZE;
        self.spaces()
            .alloc_and_map(new_root, VirtAddr(stack_base), MEM_TASK_STACK_SIZE, USER_RW)?;

        let stack_top = MEM_TASK_STACK_TOP - MEM_TASK_ARG_SIZE;
        self.copy_args(old_root, new_root, stack_top, argv)?;

        Ok(LoadedImage { entry, heap, stack_top })
    }

    /// PT_LOAD セグメントを new_root に読み込む。(入口, 最後のセグメントの末尾) を返す。
    fn load_segments(&mut self, file: FileId, root: PhysAddr) -> Result<(u32, u32), KernelError> {
        let mut hb = [0u8; EHDR_SIZE];
        self.read_exact(file, &mut hb)?;
        let header = ElfHeader::parse(&hb);
        header.validate()?;

        let mut heap = MEMORY_TASK_BASE;
        for i in 0..header.e_phnum {
            let offset = header.phdr_offset(i).ok_or(KernelError::BadExecutable)?;
            self.fs.lseek(file, offset as i32, SEEK_SET)?;
            let mut pb = [0u8; PHDR_SIZE];
            self.read_exact(file, &mut pb)?;
            let ph = ProgramHeader::parse(&pb);

            if ph.p_type != PT_LOAD || ph.p_vaddr < MEMORY_TASK_BASE {
                continue;
            }
            if !VirtAddr(ph.p_vaddr).is_page_aligned() {
                log::warn!("exec: skip unaligned segment at {:#x}", ph.p_vaddr);
                continue;
            }

            let end = ph.p_vaddr.checked_add(ph.p_memsz).ok_or(KernelError::BadExecutable)?;
            if ph.p_filesz > ph.p_memsz || end > MEM_TASK_STACK_TOP - MEM_TASK_STACK_SIZE {
                log::warn!("exec: bad segment {:#x}..{:#x}", ph.p_vaddr, end);
                return Err(KernelError::BadExecutable);
            }
            if self.any_mapped(root, ph.p_vaddr, ph.p_memsz) {
                log::warn!("exec: overlapping segment at {:#x}", ph.p_vaddr);
                return Err(KernelError::BadExecutable);
            }

            self.spaces().alloc_and_map(root, VirtAddr(ph.p_vaddr), ph.p_memsz, USER_RW)?;
            self.load_segment_data(file, root, &ph)?;
            heap = heap.max(end);
        }

        Ok((header.e_entry, heap))
    }

    fn load_segment_data(&mut self, file: FileId, root: PhysAddr, ph: &ProgramHeader) -> Result<(), KernelError> {
        self.fs.lseek(file, ph.p_offset as i32, SEEK_SET)?;

        let mut buf = [0u8; LOAD_CHUNK];
        let mut done = 0u32;
        while done < ph.p_filesz {
            let chunk = ((ph.p_filesz - done) as usize).min(LOAD_CHUNK);
            self.read_exact(file, &mut buf[..chunk])?;
            self.spaces().copy_to(root, VirtAddr(ph.p_vaddr + done), &buf[..chunk])?;
            done += chunk as u32;
        }
        Ok(())
    }

    fn any_mapped(&mut self, root: PhysAddr, start: u32, size: u32) -> bool {
        let mut spaces = self.spaces();
        let mut page = VirtAddr(start).align_down().0;
        let end = start.saturating_add(size);
        while page < end {
            if spaces.entry(root, VirtAddr(page)).is_some() {
                return true;
            }
            match page.checked_add(PAGE_SIZE) {
                Some(next) => page = next,
                None => break,
            }
        }
        false
    }

    fn read_exact(&mut self, file: FileId, buf: &mut [u8]) -> Result<(), KernelError> {
        let n = self.fs.read(file, buf)?;
        if n < buf.len() {
            log::warn!("exec: short read ({} of {} bytes)", n, buf.len());
            return Err(KernelError::BadExecutable);
        }
        Ok(())
    }

    /// 引数領域を組み立てる。
    ///
    /// stack_top: [戻り先 0][argc][argv] → argv[0..argc] と NULL → 各文字列
    fn copy_args(&mut self, old_root: PhysAddr, new_root: PhysAddr, top: u32, argv: VirtAddr) -> Result<(), KernelError> {
        let limit = top + MEM_TASK_ARG_SIZE;
        let mut spaces = self.spaces();

        let mut argc = 0u32;
        if argv.0 != 0 {
            loop {
                let slot = argv.checked_add(argc * 4).ok_or(KernelError::BadAddress)?;
                if spaces.read_u32(old_root, slot)? == 0 {
                    break;
                }
                argc += 1;
                if argc >= MEM_TASK_ARG_SIZE / 4 {
                    return Err(KernelError::ArgumentsTooLong);
                }
            }
        }

        let table = top + 12;
        let mut strings = table + (argc + 1) * 4;
        if strings > limit {
            return Err(KernelError::ArgumentsTooLong);
        }

        spaces.write_u32(new_root, VirtAddr(top), 0)?;
        spaces.write_u32(new_root, VirtAddr(top + 4), argc)?;
        spaces.write_u32(new_root, VirtAddr(top + 8), table)?;

        for i in 0..argc {
            let src = VirtAddr(spaces.read_u32(old_root, VirtAddr(argv.0 + i * 4))?);
            let room = limit - strings;
            let len = spaces.strlen(old_root, src, room)?;
            if len >= room {
                return Err(KernelError::ArgumentsTooLong);
            }
            spaces.copy_between(new_root, VirtAddr(strings), old_root, src, len)?;
            spaces.copy_to(new_root, VirtAddr(strings + len), &[0])?;
            spaces.write_u32(new_root, VirtAddr(table + i * 4), strings)?;
            strings += len + 1;
        }
        spaces.write_u32(new_root, VirtAddr(table + argc * 4), 0)?;
        Ok(())
    }

    // ────────────────────────────────────────────
    // exit / wait
    // ────────────────────────────────────────────

    /// 子の終了を待って眠っているか（mutex などの待ちとは区別する）
    fn waiting_for_child(&self, idx: usize) -> bool {
        let t = &self.tasks[idx];
        t.state == TaskState::Waiting && t.wait_node.owner().is_none()
    }

    /// 現在のタスクを終了させる。資源の残りは親の wait で回収される。
    pub fn exit(&mut self, status: i32) {
        let cur = self.current;
        if cur == IDLE_SLOT {
            log::error!("exit: idle task cannot exit");
            return;
        }
        self.close_files(cur);

        let me = self.id_of(cur);
        let irq = self.enter_protection();

        // 子は init に引き取らせる。init 自身が終わるときは親なしにし、
        // 回収する者がいなくなる ZOMBIE の子はここで回収する。
        let heir = match self.first_task {
            Some(init) if init != cur => Some(self.id_of(init)),
            _ => None,
        };
        let mut orphan_zombie = false;
        for idx in 0..TASK_NR {
            let t = &self.tasks[idx];
            if !t.in_use || t.parent != Some(me) {
                continue;
            }
            let zombie = t.state == TaskState::Zombie;
            if heir.is_none() && zombie {
                let child = self.id_of(idx);
                self.uninit(idx);
                self.push_event(LogEvent::Reaped { parent: me, child });
            } else {
                self.tasks[idx].parent = heir;
                orphan_zombie |= zombie;
            }
        }
        if let (true, Some(heir)) = (orphan_zombie, heir) {
            let init = heir.index();
            if self.waiting_for_child(init) {
                self.set_ready(init);
            }
        }

        if let Some(parent) = self.tasks[cur].parent.and_then(|p| self.slot_of(p)) {
            if self.waiting_for_child(parent) {
                self.set_ready(parent);
            }
        }

        self.tasks[cur].status = status;
        self.set_block(cur);
        self.set_state(cur, TaskState::Zombie);
        self.push_event(LogEvent::Exited(me, status));
        self.dispatch();

        self.leave_protection(irq);
    }

    /// 終了した子を 1 つ回収する。
    ///
    /// - ZOMBIE の子がいれば status を書き込んで回収し、その id を返す。
    /// - 生きている子しかいなければ眠って Ok(None)。起こされたら呼び直す。
    /// - 子がいなければ NoChild。
    pub fn wait(&mut self, status: VirtAddr) -> Result<Option<TaskId>, KernelError> {
        let cur = self.current;
        let me = self.id_of(cur);

        let mut has_child = false;
        let mut zombie = None;
        for idx in 0..TASK_NR {
            let t = &self.tasks[idx];
            if t.in_use && t.parent == Some(me) {
                has_child = true;
                if t.state == TaskState::Zombie {
                    zombie = Some(idx);
                    break;
                }
            }
        }

        if let Some(idx) = zombie {
            let child = self.id_of(idx);
            let code = self.tasks[idx].status;
            if status.0 != 0 {
                self.write_user_u32(status, code as u32)?;
            }
            self.uninit(idx);
            self.push_event(LogEvent::Reaped { parent: me, child });
            return Ok(Some(child));
        }

        if !has_child {
            return Err(KernelError::NoChild);
        }

        let irq = self.enter_protection();
        self.set_block(cur);
        self.set_state(cur, TaskState::Waiting);
        self.dispatch();
        self.leave_protection(irq);
        Ok(None)
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
