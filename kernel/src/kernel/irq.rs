// kernel/src/kernel/irq.rs
//
// 役割:
// - 割り込み禁止による臨界区間（enter_protection / leave_protection）
// - timer 割り込みの本体（on_timer）
// - 例外の扱い: user モードなら exit、カーネルモードなら停止
//
// やらないこと:
// - IDT / PIC の設定やベクタ登録（ブート側と arch::x86 の責務）

use crate::arch::Hal;
use crate::kernel::fs::FileSystem;
use crate::kernel::{KernelState, LogEvent};

/// enter_protection 時点の割り込み許可フラグ
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub struct IrqState(bool);

impl IrqState {
    pub fn was_enabled(self) -> bool {
        self.0
    }
}

pub const VECTOR_DIVIDE: u32 = 0;
pub const VECTOR_INVALID_OPCODE: u32 = 6;
pub const VECTOR_DOUBLE_FAULT: u32 = 8;
pub const VECTOR_GENERAL_PROTECTION: u32 = 13;
pub const VECTOR_PAGE_FAULT: u32 = 14;
pub const VECTOR_TIMER: u32 = 0x20;
pub const VECTOR_SYSCALL: u32 = 0x80;

// ページフォルトのエラーコード
const ERR_PAGE_P: u32 = 1 << 0;
const ERR_PAGE_WR: u32 = 1 << 1;
const ERR_PAGE_US: u32 = 1 << 2;

// 一般保護例外のエラーコード
const ERR_EXT: u32 = 1 << 0;
const ERR_IDT: u32 = 1 << 1;

/// 例外入口で積まれるレジスタ一式
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaultFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub num: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    /// 特権レベル 3 から入ったときだけ有効
    pub esp3: u32,
    pub ss3: u32,
}

impl FaultFrame {
    pub fn from_user(&self) -> bool {
        self.cs & 0x3 != 0
    }
}

fn vector_name(vector: u32) -> &'static str {
    match vector {
        VECTOR_DIVIDE => "Divider Error",
        1 => "Debug Exception",
        2 => "NMI Interrupt",
        3 => "Breakpoint",
        4 => "Overflow",
        5 => "BOUND Range Exceeded",
        VECTOR_INVALID_OPCODE => "Invalid Opcode",
        7 => "Device Not Available",
        VECTOR_DOUBLE_FAULT => "Double Fault",
        10 => "Invalid TSS",
        11 => "Segment Not Present",
        12 => "Stack-Segment Fault",
        VECTOR_GENERAL_PROTECTION => "General Protection",
        VECTOR_PAGE_FAULT => "Page Fault",
        16 => "x87 FPU Floating Point Error",
        17 => "Alignment Check",
        18 => "Machine Check",
        19 => "SIMD Floating Point Exception",
        20 => "Virtualization Exception",
        _ => "Unknown exception",
    }
}

impl<H: Hal, F: FileSystem> KernelState<H, F> {
    /// 割り込みを禁止し、直前の状態を返す
    pub fn enter_protection(&mut self) -> IrqState {
        let state = IrqState(self.hal.interrupts_enabled());
        self.hal.disable_interrupts();
        state
    }

    /// enter_protection 直前の状態にそのまま戻す
    pub fn leave_protection(&mut self, state: IrqState) {
        if state.0 {
            self.hal.enable_interrupts();
        } else {
            self.hal.disable_interrupts();
        }
    }

    /// 周期 timer 割り込み
    pub fn on_timer(&mut self) {
        self.hal.ack_timer();
        self.time_tick();
    }

    /// CPU 例外。
    ///
    /// user モードで起きたものは、そのタスクをエラーコードで exit させる。
    /// カーネルモードで起きたものは回復せず停止する。
    pub fn handle_fault(&mut self, vector: u32, frame: &FaultFrame) {
        log::error!("--------------------------------");
        log::error!("IRQ/Exception happened: {}.", vector_name(vector));

        match vector {
            VECTOR_GENERAL_PROTECTION => self.describe_gp(frame.error_code),
            VECTOR_PAGE_FAULT => self.describe_page_fault(frame.error_code),
            _ => {}
        }
        dump_core_regs(vector, frame);
        log::error!("--------------------------------");

        if frame.from_user() {
            let task = self.current_id();
            self.push_event(LogEvent::FaultKilled {
                task,
                vector,
                error_code: frame.error_code,
            });
            self.exit(frame.error_code as i32);
        } else {
            self.hal.halt();
        }
    }

    fn describe_gp(&self, code: u32) {
        if code & ERR_EXT != 0 {
            log::error!(" the exception occurred during delivery of an external event");
        } else {
            log::error!(" the exception occurred during delivery of a software interrupt");
        }
        if code & ERR_IDT != 0 {
            log::error!(" the selector refers to a gate descriptor in the IDT");
        } else {
            log::error!(" the selector refers to a descriptor in the GDT");
        }
        log::error!(" segment selector index = {:#x}", code & 0xFFF8);
    }

    fn describe_page_fault(&self, code: u32) {
        let addr = self.hal.fault_address().0;
        if code & ERR_PAGE_P != 0 {
            log::error!(" page-level protection violation: {:#x}", addr);
        } else {
            log::error!(" page not present: {:#x}", addr);
        }
        if code & ERR_PAGE_WR != 0 {
            log::error!(" the access causing the fault was a write");
        } else {
            log::error!(" the access causing the fault was a read");
        }
        if code & ERR_PAGE_US != 0 {
            log::error!(" a user-mode access caused the fault");
        } else {
            log::error!(" a supervisor-mode access caused the fault");
        }
    }
}

fn dump_core_regs(vector: u32, f: &FaultFrame) {
    // 特権レベル 3 から来たときは CPU が積んだ esp3 / ss3 が本来のスタック
    let (ss, esp) = if f.from_user() { (f.ss3, f.esp3) } else { (f.ds, f.esp) };
    log::error!("IRQ: {}, error code: {:#x}", vector, f.error_code);
    log::error!(
        "CS: {:#x} DS: {:#x} ES: {:#x} SS: {:#x} FS: {:#x} GS: {:#x}",
        f.cs,
        f.ds,
        f.es,
        ss,
        f.fs,
        f.gs
    );
    log::error!(
        "EAX: {:#x} EBX: {:#x} ECX: {:#x} EDX: {:#x} EDI: {:#x} ESI: {:#x} EBP: {:#x} ESP: {:#x}",
        f.eax,
        f.ebx,
        f.ecx,
        f.edx,
        f.edi,
        f.esi,
        f.ebp,
        esp
    );
    log::error!("EIP: {:#x} EFLAGS: {:#x}", f.eip, f.eflags);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{APP_SELECTOR_CS, KERNEL_SELECTOR_CS, SEG_CPL3};
    use crate::kernel::testutil::*;
    use crate::kernel::TaskState;

    #[test]
    fn protection_restores_exact_state() {
        let mut k = boot();
        k.hal_mut().enable_interrupts();
        let outer = k.enter_protection();
        assert!(!k.hal().interrupts_enabled());
        let inner = k.enter_protection();
        k.leave_protection(inner);
        assert!(!k.hal().interrupts_enabled());
        k.leave_protection(outer);
        assert!(k.hal().interrupts_enabled());

        k.hal_mut().disable_interrupts();
        let s = k.enter_protection();
        k.hal_mut().enable_interrupts();
        k.leave_protection(s);
        assert!(!k.hal().interrupts_enabled());
    }

    #[test]
    fn timer_acknowledges_then_ticks() {
        let mut k = boot();
        k.on_timer();
        k.on_timer();
        assert_eq!(k.hal().timer_acks, 2);
        assert_eq!(k.tick_count(), 2);
    }

    #[test]
    fn user_fault_exits_the_task_with_error_code() {
        let mut k = boot();
        let a = spawn(&mut k, "a");
        assert_eq!(run_next(&mut k), a);

        k.hal_mut().set_fault_address(crate::mem::addr::VirtAddr(0xDEAD_0000));
        let frame = FaultFrame {
            cs: APP_SELECTOR_CS | SEG_CPL3,
            error_code: 0x6,
            ..FaultFrame::default()
        };
        k.handle_fault(VECTOR_PAGE_FAULT, &frame);

        assert_eq!(k.task_state(a), Some(TaskState::Zombie));
        assert_eq!(k.task(a).unwrap().status, 6);
        assert_eq!(k.current_id(), k.idle_id());
        assert!(k
            .events()
            .any(|e| *e == LogEvent::FaultKilled { task: a, vector: VECTOR_PAGE_FAULT, error_code: 6 }));
    }

    #[test]
    #[should_panic(expected = "halt")]
    fn kernel_fault_halts() {
        let mut k = boot();
        let frame = FaultFrame {
            cs: KERNEL_SELECTOR_CS,
            error_code: 0x10,
            ..FaultFrame::default()
        };
        k.handle_fault(VECTOR_GENERAL_PROTECTION, &frame);
    }
}
