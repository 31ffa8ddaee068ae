// kernel/src/kernel/queue.rs
//
// タスクテーブル上の侵入型双方向リスト。
//
// - リンクは Task 内の ListNode に持つ（ready/sleep は run_node、wait は wait_node、
//   all は all_node を使う）。リスト本体は先頭 / 末尾の index と要素数だけ。
// - ListNode.owner で「今どの種類のリストに入っているか」を持つ。
//   同じノードを 2 つのリストに入れようとしたら致命的エラー。
// - 排他は呼び出し側（割り込み禁止区間）で取る。

use crate::kernel::task::{Task, TaskTable};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListKind {
    Ready,
    Sleep,
    Wait,
    All,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListNode {
    prev: Option<u16>,
    next: Option<u16>,
    owner: Option<ListKind>,
}

impl ListNode {
    pub const UNLINKED: ListNode = ListNode {
        prev: None,
        next: None,
        owner: None,
    };

    pub fn owner(&self) -> Option<ListKind> {
        self.owner
    }
}

fn node(task: &Task, kind: ListKind) -> &ListNode {
    match kind {
        ListKind::Ready | ListKind::Sleep => &task.run_node,
        ListKind::Wait => &task.wait_node,
        ListKind::All => &task.all_node,
    }
}

fn node_mut(task: &mut Task, kind: ListKind) -> &mut ListNode {
    match kind {
        ListKind::Ready | ListKind::Sleep => &mut task.run_node,
        ListKind::Wait => &mut task.wait_node,
        ListKind::All => &mut task.all_node,
    }
}

#[derive(Debug)]
pub struct TaskList {
    kind: ListKind,
    first: Option<u16>,
    last: Option<u16>,
    count: usize,
}

impl TaskList {
    pub const fn new(kind: ListKind) -> Self {
        TaskList {
            kind,
            first: None,
            last: None,
            count: 0,
        }
    }

    pub fn kind(&self) -> ListKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn first(&self) -> Option<usize> {
        self.first.map(usize::from)
    }

    /// idx の次の要素（idx 自身がこのリストにいる前提）
    pub fn next_of(&self, tasks: &TaskTable, idx: usize) -> Option<usize> {
        node(&tasks[idx], self.kind).next.map(usize::from)
    }

    /// idx がこの種類のリストに入っているか。
    ///
    /// wait リストは同種が複数あるので、「どれかの wait リスト」にいるかしか分からない。
    pub fn contains(&self, tasks: &TaskTable, idx: usize) -> bool {
        node(&tasks[idx], self.kind).owner == Some(self.kind)
    }

    pub fn push_back(&mut self, tasks: &mut TaskTable, idx: usize) {
        let kind = self.kind;
        let last = self.last;
        {
            let n = node_mut(&mut tasks[idx], kind);
            assert!(n.owner.is_none(), "list: task {} already linked on {:?}", idx, n.owner);
            *n = ListNode {
                prev: last,
                next: None,
                owner: Some(kind),
            };
        }

        match last {
            Some(l) => node_mut(&mut tasks[l as usize], kind).next = Some(idx as u16),
            None => self.first = Some(idx as u16),
        }
        self.last = Some(idx as u16);
        self.count += 1;
    }

    pub fn pop_front(&mut self, tasks: &mut TaskTable) -> Option<usize> {
        let first = self.first()?;
        self.unlink(tasks, first);
        Some(first)
    }

    /// idx がこのリストにいれば外して true
    pub fn remove(&mut self, tasks: &mut TaskTable, idx: usize) -> bool {
        if !self.contains(tasks, idx) {
            return false;
        }
        self.unlink(tasks, idx);
        true
    }

    fn unlink(&mut self, tasks: &mut TaskTable, idx: usize) {
        let kind = self.kind;
        let ListNode { prev, next, .. } = *node(&tasks[idx], kind);

        match prev {
            Some(p) => node_mut(&mut tasks[p as usize], kind).next = next,
            None => self.first = next,
        }
        match next {
            Some(n) => node_mut(&mut tasks[n as usize], kind).prev = prev,
            None => self.last = prev,
        }

        *node_mut(&mut tasks[idx], kind) = ListNode::UNLINKED;
        self.count -= 1;
    }

    pub fn iter<'t>(&self, tasks: &'t TaskTable) -> Iter<'t> {
        Iter {
            tasks,
            kind: self.kind,
            cur: self.first,
        }
    }
}

pub struct Iter<'t> {
    tasks: &'t TaskTable,
    kind: ListKind,
    cur: Option<u16>,
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let idx = self.cur? as usize;
        self.cur = node(&self.tasks[idx], self.kind).next;
        Some(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TASK_NR;
    use std::vec::Vec;

    fn table() -> TaskTable {
        [Task::EMPTY; TASK_NR]
    }

    #[test]
    fn fifo_order_and_removal_from_middle() {
        let mut tasks = table();
        let mut ready = TaskList::new(ListKind::Ready);
        for i in [3, 1, 7, 2] {
            ready.push_back(&mut tasks, i);
        }
        assert_eq!(ready.iter(&tasks).collect::<Vec<_>>(), [3, 1, 7, 2]);

        assert!(ready.remove(&mut tasks, 7));
        assert!(!ready.remove(&mut tasks, 7));
        assert_eq!(ready.iter(&tasks).collect::<Vec<_>>(), [3, 1, 2]);

        assert_eq!(ready.pop_front(&mut tasks), Some(3));
        assert!(ready.remove(&mut tasks, 2));
        assert_eq!(ready.pop_front(&mut tasks), Some(1));
        assert_eq!(ready.pop_front(&mut tasks), None);
        assert!(ready.is_empty());
    }

    #[test]
    fn separate_nodes_allow_membership_in_all_and_ready() {
        let mut tasks = table();
        let mut all = TaskList::new(ListKind::All);
        let mut ready = TaskList::new(ListKind::Ready);
        let mut sleep = TaskList::new(ListKind::Sleep);

        all.push_back(&mut tasks, 4);
        ready.push_back(&mut tasks, 4);
        assert!(all.contains(&tasks, 4));
        assert!(ready.contains(&tasks, 4));
        // ready と sleep は同じノードを共有する
        assert!(!sleep.contains(&tasks, 4));
        assert!(!sleep.remove(&mut tasks, 4));
        assert_eq!(ready.len(), 1);
    }

    #[test]
    #[should_panic(expected = "already linked")]
    fn double_link_is_fatal() {
        let mut tasks = table();
        let mut ready = TaskList::new(ListKind::Ready);
        let mut sleep = TaskList::new(ListKind::Sleep);
        ready.push_back(&mut tasks, 0);
        sleep.push_back(&mut tasks, 0);
    }
}
