// kernel/src/kernel/trace.rs
//
// 低コスト trace（観測性）を 1 箇所に集約する。
// - コンテキスト切替を 1 行ずつ trace できる
// - syscall の入口 / 出口を trace できる
//
// 設計方針:
// - feature off のときは何も出さず、引数を捨てるだけ（呼び出し側に cfg を書かせない）
// - 出力は log::trace!（ロガー側のレベル設定で絞れる）
//
// feature:
// - sched_trace:   dispatch での切替
// - syscall_trace: syscall 番号と戻り値

use super::TaskId;

/// dispatch で実際に切り替えたとき
#[inline(always)]
pub fn trace_switch(from: TaskId, to: TaskId, to_name: &str) {
    #[cfg(feature = "sched_trace")]
    log::trace!(
        "sched_trace switch from = {} to = {} ({})",
        from.as_pid(),
        to.as_pid(),
        to_name
    );
    #[cfg(not(feature = "sched_trace"))]
    {
        let _ = from;
        let _ = to;
        let _ = to_name;
    }
}

/// syscall 入口
#[inline(always)]
pub fn trace_syscall_enter(tid: TaskId, func_id: u32, args: [u32; 4]) {
    #[cfg(feature = "syscall_trace")]
    log::trace!(
        "syscall_trace enter task = {} id = {} args = {:#x} {:#x} {:#x} {:#x}",
        tid.as_pid(),
        func_id,
        args[0],
        args[1],
        args[2],
        args[3]
    );
    #[cfg(not(feature = "syscall_trace"))]
    {
        let _ = tid;
        let _ = func_id;
        let _ = args;
    }
}

/// syscall 出口（eax に入る値）
#[inline(always)]
pub fn trace_syscall_exit(tid: TaskId, func_id: u32, ret: i32) {
    #[cfg(feature = "syscall_trace")]
    log::trace!("syscall_trace exit task = {} id = {} ret = {}", tid.as_pid(), func_id, ret);
    #[cfg(not(feature = "syscall_trace"))]
    {
        let _ = tid;
        let _ = func_id;
        let _ = ret;
    }
}
