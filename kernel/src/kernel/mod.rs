// src/kernel/mod.rs
//
// mini32: ラウンドロビン＋侵入型キュー＋fork/exec/exit/wait 付きミニカーネル
//
// - KernelState: カーネル全体の状態を 1 つにまとめたもの。グローバル変数は持たない。
//   ブート側が 1 つ作り、割り込み / syscall の入口から &mut で渡す。
// - Task: 固定長テーブル上のスロット。TaskId は (index, 世代)。
// - キュー: ready / sleep / all（Task 内のリンクで連結）
// - ハードウェアは Hal、ファイルは FileSystem 越しにしか触らない。
//
// [設計上の不変条件（このモジュールにおける仕様）]
//
// 1. 生きているタスク（in_use）は必ず all リストに入っている。
// 2. ready と sleep には同時に入らない（同じリンクを共有している）。
// 3. RUNNING のタスクは常にちょうど 1 つで、それは current であり、ready にも sleep にもいない。
// 4. idle（スロット 0）は ready リストに入らない。ready が空のときだけ走る。
// 5. READY のタスク（idle 以外）は ready リストに、SLEEP のタスクは sleep リストにいる。
//
// これらは debug_check_invariants() によってログ出力ベースで検証される。

pub mod elf;
pub mod fs;
pub mod heap;
pub mod irq;
pub mod process;
pub mod queue;
pub mod sched;
pub mod syscall;
pub mod task;
pub mod trace;

pub use irq::{FaultFrame, IrqState};
pub use syscall::{SyscallFrame, SyscallOutcome};
pub use task::{Task, TaskFlags, TaskId, TaskState};

use crate::arch::Hal;
use crate::config::{KernelConfig, PAGE_SIZE, TASK_NR};
use crate::error::KernelError;
use crate::mem::addr::{PhysAddr, VirtAddr};
use crate::mem::address_space::AddressSpaces;
use crate::mm::PhysicalMemoryManager;

use fs::FileSystem;
use queue::{ListKind, TaskList};
use task::TaskTable;

const EVENT_LOG_CAP: usize = 256;

/// idle タスクのスロット
pub(crate) const IDLE_SLOT: usize = 0;

//
// ──────────────────────────────────────────────
// LogEvent（抽象イベントログ）
// ──────────────────────────────────────────────
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogEvent {
    TickStarted(u64),
    TaskCreated(TaskId),
    TaskSwitched { from: TaskId, to: TaskId },
    TaskStateChanged(TaskId, TaskState),
    ReadyQueued(TaskId),
    ReadyDequeued(TaskId),
    SleepQueued(TaskId, u32),
    WokenUp(TaskId),
    WaitQueued(TaskId),
    WaitDequeued(TaskId),
    QuantumExpired(TaskId),
    Forked { parent: TaskId, child: TaskId },
    Executed(TaskId),
    Exited(TaskId, i32),
    Reaped { parent: TaskId, child: TaskId },
    FaultKilled { task: TaskId, vector: u32, error_code: u32 },
}

//
// ──────────────────────────────────────────────
// KernelState（OS全体の状態）
// ──────────────────────────────────────────────
//

pub struct KernelState<H: Hal, F: FileSystem> {
    pub(crate) hal: H,
    pub(crate) fs: F,

    pub(crate) frames: PhysicalMemoryManager,
    pub(crate) kernel_dir: PhysAddr,
    pub(crate) tick_ms: u32,

    // タスク一覧
    pub(crate) tasks: TaskTable,
    pub(crate) ready_list: TaskList,
    pub(crate) sleep_list: TaskList,
    pub(crate) task_list: TaskList,
    pub(crate) current: usize,
    /// 最初に作られた user タスク（init）。孤児の引き取り先。
    pub(crate) first_task: Option<usize>,

    tick_count: u64,

    // 抽象イベントログ
    event_log: [Option<LogEvent>; EVENT_LOG_CAP],
    event_log_len: usize,
    invariant_violations: u32,
}

impl<H: Hal, F: FileSystem> KernelState<H, F> {
    //
    // new()
    //
    /// カーネルを組み立てる。
    ///
    /// - 物理ページアロケータを config の範囲で初期化
    /// - カーネル正本ページテーブルを作って CR3 に載せる
    /// - idle タスクを作り、それを現在のタスクにする
    pub fn new(mut hal: H, fs: F, config: KernelConfig) -> Result<Self, KernelError> {
        log::info!(
            "KernelState::new(): mem = {:#x}..{:#x}, tick = {}ms",
            config.mem_start.0,
            config.mem_end.0,
            config.tick_ms
        );

        let frames = PhysicalMemoryManager::new(config.mem_start, config.mem_size(), PAGE_SIZE);
        let kernel_dir =
            AddressSpaces::new(&mut hal, &frames, PhysAddr(0)).create_kernel_dir(config.regions())?;
        hal.set_page_dir(kernel_dir);
        log::info!(" kernel page dir = {:#x}, free pages = {}", kernel_dir.0, frames.free_pages());

        let mut k = KernelState {
            hal,
            fs,
            frames,
            kernel_dir,
            tick_ms: config.tick_ms.max(1),
            tasks: [Task::EMPTY; TASK_NR],
            ready_list: TaskList::new(ListKind::Ready),
            sleep_list: TaskList::new(ListKind::Sleep),
            task_list: TaskList::new(ListKind::All),
            current: IDLE_SLOT,
            first_task: None,
            tick_count: 0,
            event_log: [None; EVENT_LOG_CAP],
            event_log_len: 0,
            invariant_violations: 0,
        };

        let idle = k.create_task("idle", TaskFlags::SYSTEM, config.idle_entry, VirtAddr(0))?;
        debug_assert_eq!(idle.index(), IDLE_SLOT);
        k.tasks[IDLE_SLOT].state = TaskState::Running;
        k.push_event(LogEvent::TaskStateChanged(idle, TaskState::Running));

        Ok(k)
    }

    pub(crate) fn push_event(&mut self, ev: LogEvent) {
        if self.event_log_len < EVENT_LOG_CAP {
            self.event_log[self.event_log_len] = Some(ev);
            self.event_log_len += 1;
        }
    }

    // ────────────────────────────────────────────
    // 参照系
    // ────────────────────────────────────────────

    pub(crate) fn id_of(&self, idx: usize) -> TaskId {
        TaskId::new(idx, self.tasks[idx].generation)
    }

    /// id が今も同じタスクを指しているなら、そのスロット index
    pub(crate) fn slot_of(&self, id: TaskId) -> Option<usize> {
        let t = self.tasks.get(id.index())?;
        (t.in_use && t.generation == id.generation()).then_some(id.index())
    }

    pub fn current_id(&self) -> TaskId {
        self.id_of(self.current)
    }

    pub fn idle_id(&self) -> TaskId {
        self.id_of(IDLE_SLOT)
    }

    pub fn init_id(&self) -> Option<TaskId> {
        self.first_task.map(|i| self.id_of(i))
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.slot_of(id).map(|i| &self.tasks[i])
    }

    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.task(id).map(|t| t.state)
    }

    pub fn current_task(&self) -> &Task {
        &self.tasks[self.current]
    }

    /// ready キューの並び（先頭から）
    pub fn ready_order(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.ready_list.iter(&self.tasks).map(move |i| self.id_of(i))
    }

    pub fn live_tasks(&self) -> usize {
        self.task_list.len()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn events(&self) -> impl Iterator<Item = &LogEvent> {
        self.event_log[..self.event_log_len].iter().flatten()
    }

    pub fn invariant_violations(&self) -> u32 {
        self.invariant_violations
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    pub fn fs_mut(&mut self) -> &mut F {
        &mut self.fs
    }

    pub fn frames(&self) -> &PhysicalMemoryManager {
        &self.frames
    }

    pub fn kernel_dir(&self) -> PhysAddr {
        self.kernel_dir
    }

    /// ページテーブル操作の窓口を借りる
    pub fn spaces(&mut self) -> AddressSpaces<'_, H> {
        AddressSpaces::new(&mut self.hal, &self.frames, self.kernel_dir)
    }

    // ────────────────────────────────────────────
    // 現在タスクの user 空間アクセス
    // ────────────────────────────────────────────

    pub(crate) fn current_root(&self) -> PhysAddr {
        PhysAddr(self.tasks[self.current].context.cr3)
    }

    pub fn copy_to_user(&mut self, va: VirtAddr, data: &[u8]) -> Result<(), KernelError> {
        let root = self.current_root();
        self.spaces().copy_to(root, va, data)?;
        Ok(())
    }

    pub fn copy_from_user(&mut self, va: VirtAddr, buf: &mut [u8]) -> Result<(), KernelError> {
        let root = self.current_root();
        self.spaces().read_from(root, va, buf)?;
        Ok(())
    }

    pub fn read_user_u32(&mut self, va: VirtAddr) -> Result<u32, KernelError> {
        let root = self.current_root();
        Ok(self.spaces().read_u32(root, va)?)
    }

    pub fn write_user_u32(&mut self, va: VirtAddr, value: u32) -> Result<(), KernelError> {
        let root = self.current_root();
        self.spaces().write_u32(root, va, value)?;
        Ok(())
    }

    /// NUL 終端の user 文字列を buf に読み込む。buf に収まらなければ ArgumentsTooLong。
    pub fn read_user_str<'b>(&mut self, va: VirtAddr, buf: &'b mut [u8]) -> Result<&'b str, KernelError> {
        if va.0 == 0 {
            return Err(KernelError::BadAddress);
        }
        let root = self.current_root();
        let max = buf.len() as u32;
        let len = self.spaces().strlen(root, va, max)?;
        if len >= max {
            return Err(KernelError::ArgumentsTooLong);
        }
        let s = &mut buf[..len as usize];
        self.spaces().read_from(root, va, s)?;
        core::str::from_utf8(s).map_err(|_| KernelError::InvalidArgument)
    }

    //
    // 簡易的な不変条件チェック（デバッグ用）
    //
    pub(crate) fn debug_check_invariants(&mut self) {
        let mut violations = 0u32;
        let mut running = 0usize;

        for idx in 0..TASK_NR {
            let t = &self.tasks[idx];
            if !t.in_use {
                continue;
            }

            // 1. 生きているタスクは all にいる
            if t.all_node.owner() != Some(ListKind::All) {
                log::error!("INVARIANT VIOLATION: live task not in all list (task = {})", idx);
                violations += 1;
            }

            let run_owner = t.run_node.owner();
            match t.state {
                TaskState::Running => {
                    running += 1;
                    // 3. RUNNING は current で、ready / sleep にいない
                    if idx != self.current {
                        log::error!("INVARIANT VIOLATION: running task is not current (task = {})", idx);
                        violations += 1;
                    }
                    if run_owner.is_some() {
                        log::error!("INVARIANT VIOLATION: running task is queued (task = {})", idx);
                        violations += 1;
                    }
                }
                TaskState::Ready if idx != IDLE_SLOT => {
                    if run_owner != Some(ListKind::Ready) {
                        log::error!("INVARIANT VIOLATION: ready task not in ready list (task = {})", idx);
                        violations += 1;
                    }
                }
                TaskState::Sleep => {
                    if run_owner != Some(ListKind::Sleep) {
                        log::error!("INVARIANT VIOLATION: sleeping task not in sleep list (task = {})", idx);
                        violations += 1;
                    }
                }
                _ => {
                    if run_owner.is_some() {
                        log::error!(
                            "INVARIANT VIOLATION: task in state {:?} is queued on {:?} (task = {})",
                            t.state,
                            run_owner,
                            idx
                        );
                        violations += 1;
                    }
                }
            }
        }

        // 4. idle は ready にいない
        if self.tasks[IDLE_SLOT].run_node.owner().is_some() {
            log::error!("INVARIANT VIOLATION: idle task is queued");
            violations += 1;
        }

        if running != 1 {
            log::error!("INVARIANT VIOLATION: running task count = {}", running);
            violations += 1;
        }

        self.invariant_violations += violations;
    }

    //
    // dump_events()
    //
    pub fn dump_events(&self) {
        log::info!("=== KernelState Event Log Dump ===");
        for ev in self.events() {
            log_event(ev);
        }
        log::info!("=== End of Event Log ===");

        log::info!("=== Task Dump ===");
        for idx in self.task_list.iter(&self.tasks) {
            let t = &self.tasks[idx];
            log::info!(
                " task {} pid = {} name = {} state = {:?} cr3 = {:#x} heap = {:#x}..{:#x}",
                idx,
                self.id_of(idx).as_pid(),
                t.name(),
                t.state,
                t.context.cr3,
                t.heap_start,
                t.heap_end
            );
        }
        log::info!(
            " free pages = {} / {}, invariant violations = {}",
            self.frames.free_pages(),
            self.frames.total_pages(),
            self.invariant_violations
        );
        log::info!("=== End of Task Dump ===");
    }
}

// ─────────────────────────────────────────────
// LogEvent → ログ出力
// ─────────────────────────────────────────────

fn log_event(ev: &LogEvent) {
    match *ev {
        LogEvent::TickStarted(n) => log::info!("EVENT: TickStarted tick = {}", n),
        LogEvent::TaskCreated(t) => log::info!("EVENT: TaskCreated task = {}", t.as_pid()),
        LogEvent::TaskSwitched { from, to } => {
            log::info!("EVENT: TaskSwitched from = {} to = {}", from.as_pid(), to.as_pid())
        }
        LogEvent::TaskStateChanged(t, s) => {
            log::info!("EVENT: TaskStateChanged task = {} to {:?}", t.as_pid(), s)
        }
        LogEvent::ReadyQueued(t) => log::info!("EVENT: ReadyQueued task = {}", t.as_pid()),
        LogEvent::ReadyDequeued(t) => log::info!("EVENT: ReadyDequeued task = {}", t.as_pid()),
        LogEvent::SleepQueued(t, ticks) => {
            log::info!("EVENT: SleepQueued task = {} ticks = {}", t.as_pid(), ticks)
        }
        LogEvent::WokenUp(t) => log::info!("EVENT: WokenUp task = {}", t.as_pid()),
        LogEvent::WaitQueued(t) => log::info!("EVENT: WaitQueued task = {}", t.as_pid()),
        LogEvent::WaitDequeued(t) => log::info!("EVENT: WaitDequeued task = {}", t.as_pid()),
        LogEvent::QuantumExpired(t) => log::info!("EVENT: QuantumExpired task = {}", t.as_pid()),
        LogEvent::Forked { parent, child } => {
            log::info!("EVENT: Forked parent = {} child = {}", parent.as_pid(), child.as_pid())
        }
        LogEvent::Executed(t) => log::info!("EVENT: Executed task = {}", t.as_pid()),
        LogEvent::Exited(t, status) => {
            log::info!("EVENT: Exited task = {} status = {}", t.as_pid(), status)
        }
        LogEvent::Reaped { parent, child } => {
            log::info!("EVENT: Reaped parent = {} child = {}", parent.as_pid(), child.as_pid())
        }
        LogEvent::FaultKilled { task, vector, error_code } => log::info!(
            "EVENT: FaultKilled task = {} vector = {} error_code = {:#x}",
            task.as_pid(),
            vector,
            error_code
        ),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::config::MEMORY_TASK_BASE;
    use crate::mem::paging::PteFlags;
    use crate::sim::{MemFs, SimHal};

    pub const SIM_MEM: u32 = 16 * 1024 * 1024;

    pub type SimKernel = KernelState<SimHal, MemFs>;

    pub fn boot() -> SimKernel {
        boot_with(MemFs::new())
    }

    pub fn boot_with(fs: MemFs) -> SimKernel {
        let cfg = KernelConfig::for_memory(SIM_MEM).with_idle_entry(VirtAddr(0x0010_0000));
        KernelState::new(SimHal::new(SIM_MEM as usize), fs, cfg).unwrap()
    }

    /// user タスクを作って ready に積む（1 ページのコード領域付き）
    pub fn spawn(k: &mut SimKernel, name: &str) -> TaskId {
        let id = k
            .create_task(name, TaskFlags::empty(), VirtAddr(MEMORY_TASK_BASE), VirtAddr(0))
            .unwrap();
        let root = PhysAddr(k.task(id).unwrap().context.cr3);
        k.spaces()
            .alloc_and_map(root, VirtAddr(MEMORY_TASK_BASE), PAGE_SIZE, PteFlags::USER | PteFlags::WRITABLE)
            .unwrap();
        k.start_task(id);
        id
    }

    /// ready の先頭が走り出すまで dispatch する
    pub fn run_next(k: &mut SimKernel) -> TaskId {
        k.dispatch();
        k.current_id()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn boot_leaves_idle_running_on_kernel_dir() {
        let k = boot();
        assert_eq!(k.current_id(), k.idle_id());
        assert_eq!(k.task_state(k.idle_id()), Some(TaskState::Running));
        assert_eq!(k.hal().page_dir(), Some(k.kernel_dir()));
        assert_eq!(k.live_tasks(), 1);
        assert!(k.current_task().is_system());
        assert_eq!(k.current_task().name(), "idle");
    }

    #[test]
    fn stale_ids_do_not_resolve() {
        let mut k = boot();
        let a = spawn(&mut k, "a");
        assert!(k.task(a).is_some());
        let forged = TaskId::new(a.index(), a.generation() + 1);
        assert!(k.task(forged).is_none());
        assert!(k.task(TaskId::new(77, 1)).is_none());
    }

    #[test]
    fn event_log_is_bounded() {
        let mut k = boot();
        for _ in 0..(EVENT_LOG_CAP + 10) {
            k.push_event(LogEvent::TickStarted(0));
        }
        assert_eq!(k.events().count(), EVENT_LOG_CAP);
    }

    #[test]
    fn invariant_checker_flags_broken_state() {
        let mut k = boot();
        let a = spawn(&mut k, "a");
        k.debug_check_invariants();
        assert_eq!(k.invariant_violations(), 0);

        // ready リストから外したのに READY のまま
        k.ready_list.remove(&mut k.tasks, a.index());
        k.debug_check_invariants();
        assert!(k.invariant_violations() > 0);
    }

    #[test]
    fn user_strings_are_bounded() {
        let mut k = boot();
        let a = spawn(&mut k, "a");
        assert_eq!(run_next(&mut k), a);

        let base = VirtAddr(crate::config::MEMORY_TASK_BASE);
        k.copy_to_user(base, b"hello\0").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(k.read_user_str(base, &mut buf), Ok("hello"));

        let mut small = [0u8; 4];
        assert_eq!(k.read_user_str(base, &mut small), Err(KernelError::ArgumentsTooLong));
        assert_eq!(k.read_user_str(VirtAddr(0), &mut buf), Err(KernelError::BadAddress));
        assert_eq!(
            k.read_user_str(VirtAddr(0x9000_0000), &mut buf),
            Err(KernelError::BadAddress)
        );
    }
}
