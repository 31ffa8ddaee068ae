// kernel/src/logging/serial.rs
//
// COM1 (0x3F8) への最小限のシリアル出力。
// - init(): 115200bps, 8N1 に初期化（2 回目以降は何もしない）
// - SerialWriter: fmt::Write。送信バッファが空くまで待ってから 1 バイトずつ送る。

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::x86::cpu::{inb, outb};

const COM1: u16 = 0x3F8;
const LSR_THR_EMPTY: u8 = 0x20;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

pub fn init() {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return;
    }
    unsafe {
        outb(COM1 + 1, 0x00); // 割り込み無効
        outb(COM1 + 3, 0x80); // DLAB
        outb(COM1, 0x01); // 115200bps
        outb(COM1 + 1, 0x00);
        outb(COM1 + 3, 0x03); // 8N1
        outb(COM1 + 2, 0xC7); // FIFO
        outb(COM1 + 4, 0x0B);
    }
}

fn write_byte(byte: u8) {
    unsafe {
        while inb(COM1 + 5) & LSR_THR_EMPTY == 0 {}
        outb(COM1, byte);
    }
}

pub struct SerialWriter;

impl fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            if b == b'\n' {
                write_byte(b'\r');
            }
            write_byte(b);
        }
        Ok(())
    }
}
