// kernel/src/panic.rs
//
// no_std カーネル用 panic ハンドラ。
// - 挙動は「緊急出力（ロック無し） → CPU 停止」に固定する。
// - logging はロックを取るので使わない（ロック保持中の panic で止まるため）。
// - 二重 panic は即停止。
// - message の文字列化は行わない。位置は行 / 列だけ出す。

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(target_arch = "x86")]
use crate::arch::x86::cpu;

static PANIC_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

// ─────────────────────────────────────────────
// 緊急出力（ロック無し）
// - QEMU debugcon(0xE9) と COM1(0x3F8)
// ─────────────────────────────────────────────

#[cfg(target_arch = "x86")]
fn emergency_write_byte(b: u8) {
    unsafe {
        cpu::outb(0xE9, b);
        for _ in 0..10_000 {
            if cpu::inb(0x3FD) & 0x20 != 0 {
                break;
            }
        }
        cpu::outb(0x3F8, b);
    }
}

#[cfg(not(target_arch = "x86"))]
fn emergency_write_byte(_b: u8) {}

fn emergency_write_str(s: &str) {
    for b in s.bytes() {
        emergency_write_byte(b);
    }
}

fn emergency_write_hex_u32(v: u32) {
    emergency_write_str("0x");
    for i in (0..8).rev() {
        let n = ((v >> (i * 4)) & 0xF) as u8;
        let c = if n < 10 { b'0' + n } else { b'a' + (n - 10) };
        emergency_write_byte(c);
    }
}

fn halt() -> ! {
    #[cfg(target_arch = "x86")]
    cpu::halt_loop();

    #[cfg(not(target_arch = "x86"))]
    loop {
        core::hint::spin_loop();
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    #[cfg(target_arch = "x86")]
    cpu::cli();

    if PANIC_IN_PROGRESS.swap(true, Ordering::AcqRel) {
        emergency_write_str("[PANIC] re-entered => halt\n");
        halt();
    }

    emergency_write_str("[PANIC] kernel panic\n");
    if let Some(loc) = info.location() {
        emergency_write_str("[PANIC] location line=");
        emergency_write_hex_u32(loc.line());
        emergency_write_str(" col=");
        emergency_write_hex_u32(loc.column());
        emergency_write_str("\n");
    } else {
        emergency_write_str("[PANIC] location unknown\n");
    }

    halt()
}
