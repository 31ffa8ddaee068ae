// kernel/src/kernel/sched.rs
//
// 役割:
// - タスク状態遷移（set_ready / set_block / set_sleep / set_wakeup）
// - FIFO ラウンドロビンの dispatch / time_tick / yield / msleep
// - 同期プリミティブ用の wait_on / wake_one
//
// 方針:
// - 走っているタスクは ready キューに入れない。時間片が切れたら末尾に積み直す。
// - ready が空なら idle を走らせる。idle は ready キューに入らない。
// - キュー操作はすべて割り込み禁止区間で行う。
// - dispatch は実機では切替先が再びスケジュールされるまで戻らない。
//   dispatch の後ろに「再開後の処理」を書かないこと（sim では即座に戻るため）。

use crate::arch::Hal;
use crate::kernel::fs::FileSystem;
use crate::kernel::queue::TaskList;
use crate::kernel::trace;
use crate::kernel::{KernelState, LogEvent, TaskId, TaskState, IDLE_SLOT};

impl<H: Hal, F: FileSystem> KernelState<H, F> {
    // ────────────────────────────────────────────
    // 状態遷移
    // ────────────────────────────────────────────

    pub(crate) fn set_state(&mut self, idx: usize, state: TaskState) {
        if self.tasks[idx].state != state {
            self.tasks[idx].state = state;
            let id = self.id_of(idx);
            self.push_event(LogEvent::TaskStateChanged(id, state));
        }
    }

    /// ready キューの末尾に積む（idle は何もしない）
    pub(crate) fn set_ready(&mut self, idx: usize) {
        if idx == IDLE_SLOT {
            return;
        }
        self.ready_list.push_back(&mut self.tasks, idx);
        self.set_state(idx, TaskState::Ready);
        let id = self.id_of(idx);
        self.push_event(LogEvent::ReadyQueued(id));
    }

    /// ready キューから外す。状態は呼び出し側が決める。
    pub(crate) fn set_block(&mut self, idx: usize) {
        if idx == IDLE_SLOT {
            return;
        }
        if self.ready_list.remove(&mut self.tasks, idx) {
            let id = self.id_of(idx);
            self.push_event(LogEvent::ReadyDequeued(id));
        }
    }

    pub(crate) fn set_sleep(&mut self, idx: usize, ticks: u32) {
        if ticks == 0 {
            return;
        }
        self.tasks[idx].sleep_ticks = ticks;
        self.set_state(idx, TaskState::Sleep);
        self.sleep_list.push_back(&mut self.tasks, idx);
        let id = self.id_of(idx);
        self.push_event(LogEvent::SleepQueued(id, ticks));
    }

    pub(crate) fn set_wakeup(&mut self, idx: usize) {
        if self.sleep_list.remove(&mut self.tasks, idx) {
            let id = self.id_of(idx);
            self.push_event(LogEvent::WokenUp(id));
        }
    }

    // ────────────────────────────────────────────
    // ディスパッチ
    // ────────────────────────────────────────────

    /// 次に走らせるタスク（ready の先頭、空なら idle）
    pub fn next_run(&self) -> usize {
        self.ready_list.first().unwrap_or(IDLE_SLOT)
    }

    /// 現在のタスクが走り続けられないなら、次のタスクへ切り替える。
    ///
    /// - 現在のタスクが RUNNING のままなら何もしない（idle だけは ready があれば譲る）。
    /// - 切替先が自分自身なら、状態を RUNNING に戻すだけ。
    pub fn dispatch(&mut self) {
        let irq = self.enter_protection();

        let from = self.current;
        let still_running = self.tasks[from].state == TaskState::Running;
        if still_running && (from != IDLE_SLOT || self.ready_list.is_empty()) {
            self.leave_protection(irq);
            return;
        }

        let to = self.next_run();
        if to != IDLE_SLOT {
            self.ready_list.remove(&mut self.tasks, to);
            let id = self.id_of(to);
            self.push_event(LogEvent::ReadyDequeued(id));
        }
        if still_running {
            // ここに来るのは idle が譲る場合だけ
            self.set_state(from, TaskState::Ready);
        }
        self.set_state(to, TaskState::Running);

        if to != from {
            self.current = to;
            let (from_id, to_id) = (self.id_of(from), self.id_of(to));
            self.push_event(LogEvent::TaskSwitched {
                from: from_id,
                to: to_id,
            });
            trace::trace_switch(from_id, to_id, self.tasks[to].name());

            let to_ctx = self.tasks[to].context;
            self.hal.switch_to(&mut self.tasks[from].context, &to_ctx);
        }

        self.leave_protection(irq);
    }

    /// timer 割り込みごとの処理
    ///
    /// 1. 現在タスクの時間片を減らし、尽きたら ready 末尾へ
    /// 2. sleep キューを一巡し、残り 0 になったタスクを起こす
    /// 3. dispatch
    pub fn time_tick(&mut self) {
        let irq = self.enter_protection();

        self.tick_count += 1;
        let tick = self.tick_count;
        self.push_event(LogEvent::TickStarted(tick));

        let cur = self.current;
        if self.tasks[cur].state == TaskState::Running {
            let t = &mut self.tasks[cur];
            t.slice_ticks = t.slice_ticks.saturating_sub(1);
            if t.slice_ticks == 0 {
                t.slice_ticks = t.time_slice;
                if cur != IDLE_SLOT {
                    let id = self.id_of(cur);
                    self.push_event(LogEvent::QuantumExpired(id));
                    self.set_block(cur);
                    self.set_ready(cur);
                }
            }
        }

        let mut next = self.sleep_list.first();
        while let Some(idx) = next {
            next = self.sleep_list.next_of(&self.tasks, idx);
            let t = &mut self.tasks[idx];
            t.sleep_ticks = t.sleep_ticks.saturating_sub(1);
            if t.sleep_ticks == 0 {
                self.set_wakeup(idx);
                self.set_ready(idx);
            }
        }

        self.dispatch();
        self.leave_protection(irq);

        self.debug_check_invariants();
    }

    /// 他に ready なタスクがあるときだけ譲る
    pub fn yield_now(&mut self) {
        let irq = self.enter_protection();
        if !self.ready_list.is_empty() {
            let cur = self.current;
            self.set_block(cur);
            self.set_ready(cur);
            self.dispatch();
        }
        self.leave_protection(irq);
    }

    /// ms ミリ秒眠る（tick 単位に切り上げ、最低 1 tick）
    pub fn msleep(&mut self, ms: u32) {
        let cur = self.current;
        if cur == IDLE_SLOT {
            log::warn!("msleep: idle task cannot sleep");
            return;
        }

        let ms = ms.max(self.tick_ms);
        let ticks = ms.div_ceil(self.tick_ms);

        let irq = self.enter_protection();
        self.set_block(cur);
        self.set_sleep(cur, ticks);
        self.dispatch();
        self.leave_protection(irq);
    }

    // ────────────────────────────────────────────
    // 同期プリミティブから使う待ち合わせ
    // ────────────────────────────────────────────

    /// 現在のタスクを list の末尾で待たせ、他へ切り替える
    pub(crate) fn wait_on(&mut self, list: &mut TaskList) {
        let cur = self.current;
        self.set_block(cur);
        self.set_state(cur, TaskState::Waiting);
        list.push_back(&mut self.tasks, cur);
        let id = self.id_of(cur);
        self.push_event(LogEvent::WaitQueued(id));
        self.dispatch();
    }

    /// list の先頭を ready にする（空なら None）
    pub(crate) fn wake_one(&mut self, list: &mut TaskList) -> Option<TaskId> {
        let idx = list.pop_front(&mut self.tasks)?;
        let id = self.id_of(idx);
        self.push_event(LogEvent::WaitDequeued(id));
        self.set_ready(idx);
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::TASK_TIME_SLICE_DEFAULT;
    use crate::kernel::testutil::*;
    use crate::kernel::{LogEvent, TaskState};
    use std::vec::Vec;

    #[test]
    fn idle_runs_when_nothing_is_ready() {
        let mut k = boot();
        k.dispatch();
        assert_eq!(k.current_id(), k.idle_id());
        k.time_tick();
        assert_eq!(k.current_id(), k.idle_id());
        assert!(k.hal().switches.is_empty());
    }

    #[test]
    fn yield_rotates_ready_tasks_in_fifo_order() {
        let mut k = boot();
        let ids: Vec<_> = ["t1", "t2", "t3"].iter().map(|n| spawn(&mut k, n)).collect();
        assert_eq!(run_next(&mut k), ids[0]);

        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(k.current_id());
            k.yield_now();
        }
        let expect: Vec<_> = (0..7).map(|i| ids[i % 3]).collect();
        assert_eq!(seen, expect);
        assert_eq!(k.invariant_violations(), 0);
    }

    #[test]
    fn time_slice_expiry_is_round_robin() {
        let mut k = boot();
        let a = spawn(&mut k, "a");
        let b = spawn(&mut k, "b");

        // 最初の tick で idle から a へ
        k.time_tick();
        assert_eq!(k.current_id(), a);

        let mut order = Vec::new();
        for _ in 0..(4 * TASK_TIME_SLICE_DEFAULT) {
            k.time_tick();
            if order.last() != Some(&k.current_id()) {
                order.push(k.current_id());
            }
        }
        assert_eq!(order, [a, b, a, b, a]);
        assert_eq!(k.invariant_violations(), 0);
    }

    #[test]
    fn yield_alone_is_a_no_op() {
        let mut k = boot();
        let a = spawn(&mut k, "a");
        assert_eq!(run_next(&mut k), a);
        let switches = k.hal().switches.len();
        k.yield_now();
        assert_eq!(k.current_id(), a);
        assert_eq!(k.hal().switches.len(), switches);
    }

    #[test]
    fn sleep_of_25ms_wakes_after_exactly_3_ticks() {
        let mut k = boot();
        let a = spawn(&mut k, "a");
        assert_eq!(run_next(&mut k), a);

        k.msleep(25);
        assert_eq!(k.task_state(a), Some(TaskState::Sleep));
        assert_eq!(k.current_id(), k.idle_id());

        k.time_tick();
        assert_eq!(k.task_state(a), Some(TaskState::Sleep));
        k.time_tick();
        assert_eq!(k.task_state(a), Some(TaskState::Sleep));
        k.time_tick();
        assert_eq!(k.task_state(a), Some(TaskState::Running));
        assert_eq!(k.current_id(), a);
        assert!(k.events().any(|e| *e == LogEvent::SleepQueued(a, 3)));
        assert_eq!(k.invariant_violations(), 0);
    }

    #[test]
    fn short_sleep_rounds_up_to_one_tick() {
        let mut k = boot();
        let a = spawn(&mut k, "a");
        run_next(&mut k);
        k.msleep(1);
        assert!(k.events().any(|e| *e == LogEvent::SleepQueued(a, 1)));
        k.time_tick();
        assert_eq!(k.current_id(), a);
    }

    #[test]
    fn switches_load_the_target_page_dir() {
        let mut k = boot();
        let a = spawn(&mut k, "a");
        run_next(&mut k);
        let cr3 = k.task(a).unwrap().context.cr3;
        assert_eq!(k.hal().page_dir().map(|p| p.0), Some(cr3));
    }
}
