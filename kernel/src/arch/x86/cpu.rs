// kernel/src/arch/x86/cpu.rs
// CPU 命令ラッパ（32bit）。unsafe は最小限。

use core::arch::asm;

const EFLAGS_IF: u32 = 1 << 9;

#[inline]
pub fn read_eflags() -> u32 {
    let eflags: u32;
    unsafe {
        asm!("pushfd", "pop {}", out(reg) eflags, options(nomem, preserves_flags));
    }
    eflags
}

#[inline]
pub fn interrupts_enabled() -> bool {
    read_eflags() & EFLAGS_IF != 0
}

#[inline]
pub fn cli() {
    unsafe { asm!("cli", options(nomem, nostack)) }
}

#[inline]
pub fn sti() {
    unsafe { asm!("sti", options(nomem, nostack)) }
}

#[inline]
pub fn hlt() {
    unsafe { asm!("hlt", options(nomem, nostack, preserves_flags)) }
}

pub fn halt_loop() -> ! {
    loop {
        cli();
        hlt();
    }
}

#[inline]
pub fn read_cr2() -> u32 {
    let v: u32;
    unsafe { asm!("mov {}, cr2", out(reg) v, options(nomem, nostack, preserves_flags)) }
    v
}

/// ページディレクトリを切り替える。
///
/// # Safety
/// root は現在実行中のコードとスタックをマップしているページディレクトリであること。
#[inline]
pub unsafe fn write_cr3(root: u32) {
    asm!("mov cr3, {}", in(reg) root, options(nostack, preserves_flags));
}

/// # Safety
/// port への書き込みが副作用を持つため、デバイスの手順どおりに呼ぶこと。
#[inline]
pub unsafe fn outb(port: u16, value: u8) {
    asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
}

/// # Safety
/// outb と同じ。
#[inline]
pub unsafe fn inb(port: u16) -> u8 {
    let value: u8;
    asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack, preserves_flags));
    value
}
