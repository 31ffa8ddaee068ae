// kernel/src/logging/vga.rs
//
// VGA テキストモード (0xb8000) への出力。
// - 最下行に書き、改行で全体を 1 行ずつ上へ送る。
// - ログレベルごとに文字色を変える（error は赤、warn は黄）。

use core::fmt;

use log::Level;
use spin::Mutex;
use volatile::Volatile;

const BUFFER_ADDR: usize = 0xb8000;
const BUFFER_HEIGHT: usize = 25;
const BUFFER_WIDTH: usize = 80;

#[derive(Clone, Copy)]
#[repr(u8)]
enum Color {
    Black = 0x0,
    LightGray = 0x7,
    DarkGray = 0x8,
    LightRed = 0xC,
    Yellow = 0xE,
}

const fn attr(fg: Color, bg: Color) -> u8 {
    (fg as u8) | ((bg as u8) << 4)
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Cell {
    ch: u8,
    attr: u8,
}

#[repr(transparent)]
struct Screen {
    cells: [[Volatile<Cell>; BUFFER_WIDTH]; BUFFER_HEIGHT],
}

pub struct Writer {
    col: usize,
    attr: u8,
    screen: &'static mut Screen,
}

impl Writer {
    fn put(&mut self, byte: u8) {
        if byte == b'\n' {
            self.scroll();
            return;
        }
        if self.col >= BUFFER_WIDTH {
            self.scroll();
        }
        // 表示できない文字は ■ に置き換える
        let ch = if (0x20..0x7f).contains(&byte) { byte } else { 0xfe };
        self.screen.cells[BUFFER_HEIGHT - 1][self.col].write(Cell { ch, attr: self.attr });
        self.col += 1;
    }

    fn scroll(&mut self) {
        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                let cell = self.screen.cells[row][col].read();
                self.screen.cells[row - 1][col].write(cell);
            }
        }
        let blank = Cell { ch: b' ', attr: self.attr };
        for col in 0..BUFFER_WIDTH {
            self.screen.cells[BUFFER_HEIGHT - 1][col].write(blank);
        }
        self.col = 0;
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            self.put(b);
        }
        Ok(())
    }
}

static WRITER: Mutex<Option<Writer>> = Mutex::new(None);

pub fn init() {
    let mut guard = WRITER.lock();
    if guard.is_none() {
        *guard = Some(Writer {
            col: 0,
            attr: attr(Color::LightGray, Color::Black),
            screen: unsafe { &mut *(BUFFER_ADDR as *mut Screen) },
        });
    }
}

/// level の色で f に書かせる
pub fn with_writer(level: Level, f: impl FnOnce(&mut Writer)) {
    let fg = match level {
        Level::Error => Color::LightRed,
        Level::Warn => Color::Yellow,
        Level::Info => Color::LightGray,
        Level::Debug | Level::Trace => Color::DarkGray,
    };
    if let Some(w) = WRITER.lock().as_mut() {
        w.attr = attr(fg, Color::Black);
        f(w);
    }
}
