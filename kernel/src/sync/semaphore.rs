// kernel/src/sync/semaphore.rs
//
// 計数セマフォ。
//
// - wait: count > 0 なら減らして続行。0 なら待ちに入る（count は触らない）。
// - notify: 待ちがいれば先頭を ready にする（count は触らない）。いなければ count + 1。
//   待ちキューの 1 エントリは「notify で直接満たされる、保留中の減算」を表す。

use crate::arch::Hal;
use crate::kernel::fs::FileSystem;
use crate::kernel::queue::{ListKind, TaskList};
use crate::kernel::KernelState;

pub struct Semaphore {
    count: u32,
    wait_list: TaskList,
}

impl Semaphore {
    pub const fn new(initial: u32) -> Self {
        Semaphore {
            count: initial,
            wait_list: TaskList::new(ListKind::Wait),
        }
    }

    pub fn wait<H: Hal, F: FileSystem>(&mut self, k: &mut KernelState<H, F>) {
        let irq = k.enter_protection();
        if self.count > 0 {
            self.count -= 1;
        } else {
            k.wait_on(&mut self.wait_list);
        }
        k.leave_protection(irq);
    }

    pub fn try_wait<H: Hal, F: FileSystem>(&mut self, k: &mut KernelState<H, F>) -> bool {
        let irq = k.enter_protection();
        let ok = self.count > 0;
        if ok {
            self.count -= 1;
        }
        k.leave_protection(irq);
        ok
    }

    pub fn notify<H: Hal, F: FileSystem>(&mut self, k: &mut KernelState<H, F>) {
        let irq = k.enter_protection();
        if k.wake_one(&mut self.wait_list).is_some() {
            k.dispatch();
        } else {
            match self.count.checked_add(1) {
                Some(n) => self.count = n,
                None => panic!("semaphore: count overflow"),
            }
        }
        k.leave_protection(irq);
    }

    pub fn count<H: Hal, F: FileSystem>(&self, k: &mut KernelState<H, F>) -> u32 {
        let irq = k.enter_protection();
        let count = self.count;
        k.leave_protection(irq);
        count
    }

    pub fn waiters(&self) -> usize {
        self.wait_list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testutil::*;
    use crate::kernel::TaskState;

    #[test]
    fn notify_without_waiters_increments() {
        let mut k = boot();
        spawn(&mut k, "a");
        run_next(&mut k);

        let mut s = Semaphore::new(0);
        s.notify(&mut k);
        assert_eq!(s.count(&mut k), 1);
        s.notify(&mut k);
        assert_eq!(s.count(&mut k), 2);

        s.wait(&mut k);
        assert_eq!(s.count(&mut k), 1);
        assert!(s.try_wait(&mut k));
        assert!(!s.try_wait(&mut k));
        assert_eq!(s.count(&mut k), 0);
    }

    #[test]
    fn waiter_is_woken_and_count_unchanged() {
        let mut k = boot();
        let a = spawn(&mut k, "a");
        let b = spawn(&mut k, "b");
        let mut s = Semaphore::new(0);

        assert_eq!(run_next(&mut k), a);
        s.wait(&mut k);
        assert_eq!(k.task_state(a), Some(TaskState::Waiting));
        assert_eq!(s.waiters(), 1);

        assert_eq!(k.current_id(), b);
        s.notify(&mut k);
        assert_eq!(k.task_state(a), Some(TaskState::Ready));
        assert_eq!(s.count(&mut k), 0);
        assert_eq!(s.waiters(), 0);
        assert_eq!(k.current_id(), b);
    }

    #[test]
    fn each_notify_releases_exactly_one_waiter() {
        let mut k = boot();
        let a = spawn(&mut k, "a");
        let b = spawn(&mut k, "b");
        let c = spawn(&mut k, "c");
        let mut s = Semaphore::new(0);

        assert_eq!(run_next(&mut k), a);
        s.wait(&mut k);
        assert_eq!(k.current_id(), b);
        s.wait(&mut k);
        assert_eq!(k.current_id(), c);

        s.notify(&mut k);
        assert_eq!(k.task_state(a), Some(TaskState::Ready));
        assert_eq!(k.task_state(b), Some(TaskState::Waiting));
        s.notify(&mut k);
        assert_eq!(k.task_state(b), Some(TaskState::Ready));
        s.notify(&mut k);
        assert_eq!(s.count(&mut k), 1);
    }

    #[test]
    #[should_panic(expected = "count overflow")]
    fn notify_overflow_is_fatal() {
        let mut k = boot();
        spawn(&mut k, "a");
        run_next(&mut k);
        let mut s = Semaphore::new(u32::MAX);
        s.notify(&mut k);
    }
}
