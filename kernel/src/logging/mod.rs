// kernel/src/logging/mod.rs
//
// 役割:
// - log クレートのバックエンド（KernelLogger）。カーネル内は log::info! などで出力する。
//
// 出力先:
// - x86: COM1 シリアル（常に）と VGA テキスト画面（set_vga_enabled で切替）
// - それ以外: set_writer で差し込んだ fmt::Write（ホスト上のシミュレータ用）
//
// 1 レコード = "[LEVEL] message" の 1 行。

#[cfg(target_arch = "x86")]
mod serial;
#[cfg(target_arch = "x86")]
mod vga;

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

static VGA_ENABLED: AtomicBool = AtomicBool::new(true);

type Sink = &'static mut (dyn Write + Send);

static SINK: Mutex<Option<Sink>> = Mutex::new(None);

pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

/// ロガーを登録する。2 回目以降は何もしない。
pub fn init(level: LevelFilter) {
    #[cfg(target_arch = "x86")]
    {
        serial::init();
        vga::init();
    }
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

pub fn set_vga_enabled(enabled: bool) {
    VGA_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn is_vga_enabled() -> bool {
    VGA_ENABLED.load(Ordering::Relaxed)
}

/// 追加の出力先を差し替える（None で外す）
pub fn set_writer(writer: Option<Sink>) {
    *SINK.lock() = writer;
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "[ERROR] ",
        Level::Warn => "[WARN] ",
        Level::Info => "[INFO] ",
        Level::Debug => "[DEBUG] ",
        Level::Trace => "[TRACE] ",
    }
}

fn write_record(w: &mut dyn Write, record: &Record) -> fmt::Result {
    w.write_str(level_tag(record.level()))?;
    w.write_fmt(*record.args())?;
    w.write_str("\n")
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        #[cfg(target_arch = "x86")]
        {
            let _ = write_record(&mut serial::SerialWriter, record);
            if is_vga_enabled() {
                vga::with_writer(record.level(), |w| {
                    let _ = write_record(w, record);
                });
            }
        }

        if let Some(sink) = SINK.lock().as_mut() {
            let _ = write_record(&mut **sink, record);
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::String;

    struct Line(String);

    impl Write for Line {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            self.0.push_str(s);
            Ok(())
        }
    }

    #[test]
    fn record_is_one_tagged_line() {
        let mut out = Line(String::new());
        write_record(
            &mut out,
            &Record::builder()
                .level(Level::Warn)
                .args(format_args!("pid = {}", 3))
                .build(),
        )
        .unwrap();
        assert_eq!(out.0, "[WARN] pid = 3\n");
    }

    #[test]
    fn vga_switch() {
        set_vga_enabled(false);
        assert!(!is_vga_enabled());
        set_vga_enabled(true);
        assert!(is_vga_enabled());
    }
}
