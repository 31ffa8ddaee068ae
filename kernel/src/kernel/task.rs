// kernel/src/kernel/task.rs
//
// 役割:
// - タスク制御ブロック（Task）と、その識別子 TaskId。
// - 固定長のタスクテーブル上のスロット確保 / 解放。
//
// TaskId は (スロット index, 世代) の組。スロットを解放するたびに世代を進めるので、
// 回収済みタスクを指す古い TaskId が再利用後のタスクと一致することはない。
// user に見せる pid は (世代 << 16) | index。

use bitflags::bitflags;

use crate::arch::TaskContext;
use crate::config::{TASK_NAME_SIZE, TASK_NR, TASK_OFILE_NR, TASK_TIME_SLICE_DEFAULT};
use crate::kernel::fs::FileId;
use crate::kernel::queue::ListNode;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId {
    index: u16,
    generation: u16,
}

const MAX_GENERATION: u16 = 0x7FFF;

impl TaskId {
    pub(crate) fn new(index: usize, generation: u16) -> Self {
        TaskId {
            index: index as u16,
            generation,
        }
    }

    pub fn index(self) -> usize {
        self.index as usize
    }

    pub fn generation(self) -> u16 {
        self.generation
    }

    /// user 空間に返すプロセス ID（常に正）
    pub fn as_pid(self) -> i32 {
        (((self.generation as u32) << 16) | self.index as u32) as i32
    }

    pub fn from_pid(pid: i32) -> Option<TaskId> {
        if pid <= 0 {
            return None;
        }
        let raw = pid as u32;
        let index = (raw & 0xFFFF) as usize;
        let generation = (raw >> 16) as u16;
        if index >= TASK_NR || generation == 0 {
            return None;
        }
        Some(TaskId::new(index, generation))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Ready,
    Running,
    Sleep,
    Waiting,
    Zombie,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        /// 特権レベル 0 で走るタスク（idle など）
        const SYSTEM = 1 << 0;
    }
}

/// タスク制御ブロック
#[derive(Clone, Copy)]
pub struct Task {
    pub(crate) in_use: bool,
    pub(crate) generation: u16,

    pub(crate) name: [u8; TASK_NAME_SIZE],
    pub state: TaskState,
    pub flags: TaskFlags,
    /// 親タスク（所有はしない。再親付けと wait の検索にだけ使う）
    pub parent: Option<TaskId>,

    pub heap_start: u32,
    pub heap_end: u32,
    /// exit に渡された値
    pub status: i32,

    pub sleep_ticks: u32,
    pub time_slice: u32,
    pub slice_ticks: u32,

    pub files: [Option<FileId>; TASK_OFILE_NR],
    pub context: TaskContext,

    // 所属リストのリンク
    pub(crate) run_node: ListNode,
    pub(crate) wait_node: ListNode,
    pub(crate) all_node: ListNode,
}

impl Task {
    pub const EMPTY: Task = Task {
        in_use: false,
        generation: 0,
        name: [0; TASK_NAME_SIZE],
        state: TaskState::Created,
        flags: TaskFlags::empty(),
        parent: None,
        heap_start: 0,
        heap_end: 0,
        status: 0,
        sleep_ticks: 0,
        time_slice: TASK_TIME_SLICE_DEFAULT,
        slice_ticks: TASK_TIME_SLICE_DEFAULT,
        files: [None; TASK_OFILE_NR],
        context: TaskContext::ZERO,
        run_node: ListNode::UNLINKED,
        wait_node: ListNode::UNLINKED,
        all_node: ListNode::UNLINKED,
    };

    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(TASK_NAME_SIZE);
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }

    /// 終端を残して切り詰める
    pub fn set_name(&mut self, name: &str) {
        self.name = [0; TASK_NAME_SIZE];
        let mut len = name.len().min(TASK_NAME_SIZE - 1);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        self.name[..len].copy_from_slice(&name.as_bytes()[..len]);
    }

    pub fn is_live(&self) -> bool {
        self.in_use
    }

    pub fn is_system(&self) -> bool {
        self.flags.contains(TaskFlags::SYSTEM)
    }
}

pub type TaskTable = [Task; TASK_NR];

/// 未使用スロットを先頭から探して確保する（first fit）。
///
/// 確保したスロットは in_use だけ立った空の Task になる。
pub fn alloc_slot(tasks: &mut TaskTable, skip: usize) -> Option<TaskId> {
    let (index, slot) = tasks
        .iter_mut()
        .enumerate()
        .skip(skip)
        .find(|(_, t)| !t.in_use)?;

    let generation = if slot.generation == 0 { 1 } else { slot.generation };
    *slot = Task::EMPTY;
    slot.in_use = true;
    slot.generation = generation;
    Some(TaskId::new(index, generation))
}

/// スロットを空に戻し、世代を進める
pub fn free_slot(tasks: &mut TaskTable, index: usize) {
    let next = match tasks[index].generation {
        g if g >= MAX_GENERATION => 1,
        g => g + 1,
    };
    tasks[index] = Task::EMPTY;
    tasks[index].generation = next;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_round_trips_and_is_positive() {
        let id = TaskId::new(5, MAX_GENERATION);
        assert!(id.as_pid() > 0);
        assert_eq!(TaskId::from_pid(id.as_pid()), Some(id));
        assert_eq!(TaskId::from_pid(0), None);
        assert_eq!(TaskId::from_pid(-1), None);
        assert_eq!(TaskId::from_pid(TASK_NR as i32 | 1 << 16), None);
    }

    #[test]
    fn reused_slot_gets_new_identity() {
        let mut tasks = [Task::EMPTY; TASK_NR];
        let a = alloc_slot(&mut tasks, 0).unwrap();
        let b = alloc_slot(&mut tasks, 0).unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));

        free_slot(&mut tasks, 0);
        let c = alloc_slot(&mut tasks, 0).unwrap();
        assert_eq!(c.index(), 0);
        assert_ne!(c, a);
        assert_ne!(c.as_pid(), a.as_pid());
    }

    #[test]
    fn table_exhaustion_and_skip() {
        let mut tasks = [Task::EMPTY; TASK_NR];
        assert_eq!(alloc_slot(&mut tasks, 1).map(|t| t.index()), Some(1));
        for _ in 2..TASK_NR {
            assert!(alloc_slot(&mut tasks, 1).is_some());
        }
        assert_eq!(alloc_slot(&mut tasks, 1), None);
        assert!(!tasks[0].in_use);
    }

    #[test]
    fn generation_wraps_to_one() {
        let mut tasks = [Task::EMPTY; TASK_NR];
        tasks[3].generation = MAX_GENERATION;
        free_slot(&mut tasks, 3);
        assert_eq!(tasks[3].generation, 1);
    }

    #[test]
    fn names_are_truncated() {
        let mut t = Task::EMPTY;
        t.set_name("a-very-long-task-name-that-does-not-fit");
        assert_eq!(t.name().len(), TASK_NAME_SIZE - 1);
        t.set_name("init");
        assert_eq!(t.name(), "init");
    }
}
