// kernel/src/sync/mutex.rs
//
// 再帰ロック可能なブロッキング mutex。
//
// - owner が None ⇔ count == 0
// - unlock は所有者だけが呼べる（違反は致命的エラー）
// - 最後の unlock で待ちがいれば、その先頭に所有権を渡してから ready にする。
//   ready になったタスクが走るまでの間に、第三者がロックを取ることはない。

use crate::arch::Hal;
use crate::kernel::fs::FileSystem;
use crate::kernel::queue::{ListKind, TaskList};
use crate::kernel::{KernelState, TaskId};

pub struct Mutex {
    owner: Option<TaskId>,
    count: u32,
    wait_list: TaskList,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub const fn new() -> Self {
        Mutex {
            owner: None,
            count: 0,
            wait_list: TaskList::new(ListKind::Wait),
        }
    }

    pub fn owner(&self) -> Option<TaskId> {
        self.owner
    }

    /// 再帰ロックの深さ
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn waiters(&self) -> usize {
        self.wait_list.len()
    }

    fn deepen(&mut self) {
        match self.count.checked_add(1) {
            Some(n) => self.count = n,
            None => panic!("mutex: lock depth overflow"),
        }
    }

    /// ロックを取る。他タスクが持っていれば待ちに入る。
    pub fn lock<H: Hal, F: FileSystem>(&mut self, k: &mut KernelState<H, F>) {
        let irq = k.enter_protection();

        let me = k.current_id();
        match self.owner {
            None => {
                self.owner = Some(me);
                self.count = 1;
            }
            Some(owner) if owner == me => self.deepen(),
            Some(_) => {
                // 所有権は unlock 側で渡される
                k.wait_on(&mut self.wait_list);
            }
        }

        k.leave_protection(irq);
    }

    /// 待たずに取れるときだけ取る
    pub fn try_lock<H: Hal, F: FileSystem>(&mut self, k: &mut KernelState<H, F>) -> bool {
        let irq = k.enter_protection();
        let me = k.current_id();
        let acquired = match self.owner {
            None => {
                self.owner = Some(me);
                self.count = 1;
                true
            }
            Some(owner) if owner == me => {
                self.deepen();
                true
            }
            Some(_) => false,
        };
        k.leave_protection(irq);
        acquired
    }

    pub fn unlock<H: Hal, F: FileSystem>(&mut self, k: &mut KernelState<H, F>) {
        let irq = k.enter_protection();

        let me = k.current_id();
        assert_eq!(self.owner, Some(me), "mutex: unlock by non-owner");

        self.count -= 1;
        if self.count == 0 {
            self.owner = None;
            if let Some(next) = k.wake_one(&mut self.wait_list) {
                self.owner = Some(next);
                self.count = 1;
                k.dispatch();
            }
        }

        k.leave_protection(irq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testutil::*;
    use crate::kernel::TaskState;

    #[test]
    fn recursive_lock_counts_depth() {
        let mut k = boot();
        let a = spawn(&mut k, "a");
        run_next(&mut k);

        let mut m = Mutex::new();
        m.lock(&mut k);
        m.lock(&mut k);
        assert_eq!((m.owner(), m.count()), (Some(a), 2));
        m.unlock(&mut k);
        assert_eq!((m.owner(), m.count()), (Some(a), 1));
        m.unlock(&mut k);
        assert_eq!((m.owner(), m.count()), (None, 0));
    }

    #[test]
    fn contended_unlock_hands_off_to_wait_list_head() {
        let mut k = boot();
        let a = spawn(&mut k, "a");
        let b = spawn(&mut k, "b");
        let c = spawn(&mut k, "c");
        let d = spawn(&mut k, "d");
        let mut m = Mutex::new();

        assert_eq!(run_next(&mut k), a);
        m.lock(&mut k);
        k.yield_now();

        // b, c の順に待つ
        assert_eq!(k.current_id(), b);
        m.lock(&mut k);
        assert_eq!(k.task_state(b), Some(TaskState::Waiting));
        assert_eq!(k.current_id(), c);
        m.lock(&mut k);
        assert_eq!(k.task_state(c), Some(TaskState::Waiting));
        assert_eq!(m.waiters(), 2);

        // d は何もせず譲り、a に戻る
        assert_eq!(k.current_id(), d);
        k.yield_now();
        assert_eq!(k.current_id(), a);

        m.unlock(&mut k);
        assert_eq!((m.owner(), m.count()), (Some(b), 1));
        assert_eq!(k.task_state(b), Some(TaskState::Ready));
        assert_eq!(m.waiters(), 1);

        // b が走る前に d が取りに来ても取れない
        k.yield_now();
        assert_eq!(k.current_id(), d);
        assert!(!m.try_lock(&mut k));
        m.lock(&mut k);
        assert_eq!(k.task_state(d), Some(TaskState::Waiting));
        assert_eq!(m.owner(), Some(b));

        // 次に走るのは b で、ロックを持っている
        while k.current_id() != b {
            k.yield_now();
        }
        assert_eq!(m.owner(), Some(k.current_id()));

        // b が離すと c、その次に d
        m.unlock(&mut k);
        assert_eq!(m.owner(), Some(c));
        assert_eq!(m.waiters(), 1);
    }

    #[test]
    #[should_panic(expected = "non-owner")]
    fn unlock_by_non_owner_is_fatal() {
        let mut k = boot();
        spawn(&mut k, "a");
        spawn(&mut k, "b");
        let mut m = Mutex::new();
        run_next(&mut k);
        m.lock(&mut k);
        k.yield_now();
        m.unlock(&mut k);
    }

    #[test]
    #[should_panic(expected = "lock depth overflow")]
    fn lock_depth_overflow_is_fatal() {
        let mut k = boot();
        spawn(&mut k, "a");
        run_next(&mut k);
        let mut m = Mutex::new();
        m.lock(&mut k);
        m.count = u32::MAX;
        m.lock(&mut k);
    }
}
