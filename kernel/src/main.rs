// kernel/src/main.rs
//
// ホスト上のデモ（feature "sim" が必要）。
//
// init を起動して fork → 子が exec → 子が眠る → 子がコンソールへ書いて exit → 親が wait、
// の一巡を SimHal 上で timer を回しながら実行し、最後にイベントログを出す。
//
//   cargo run --features sim --bin mini32-sim

use std::boxed::Box;
use std::io::Write as _;

use mini32_kernel::config::MEMORY_TASK_BASE;
use mini32_kernel::kernel::syscall::{
    SyscallFrame, SyscallOutcome, SYS_EXECVE, SYS_EXIT, SYS_FORK, SYS_GETPID, SYS_MSLEEP, SYS_OPEN, SYS_WAIT,
    SYS_WRITE,
};
use mini32_kernel::mem::addr::VirtAddr;
use mini32_kernel::sim::elf_image::ElfBuilder;
use mini32_kernel::sim::fs::CONSOLE_PATH;
use mini32_kernel::sim::{MemFs, SimHal};
use mini32_kernel::{logging, KernelConfig, KernelError, KernelState, TaskId};

const SIM_MEM: u32 = 32 * 1024 * 1024;
const TICKS: u32 = 40;

type Kernel = KernelState<SimHal, MemFs>;

struct Stdout;

impl core::fmt::Write for Stdout {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        std::io::stdout().write_all(s.as_bytes()).map_err(|_| core::fmt::Error)
    }
}

fn syscall(k: &mut Kernel, id: u32, args: [u32; 4]) -> (SyscallOutcome, i32) {
    let mut frame = SyscallFrame::new(id, args);
    let outcome = k.handle_syscall(&mut frame);
    (outcome, frame.ret())
}

fn put_str(k: &mut Kernel, va: u32, s: &str) -> Result<(), KernelError> {
    k.copy_to_user(VirtAddr(va), s.as_bytes())?;
    k.copy_to_user(VirtAddr(va + s.len() as u32), &[0])
}

fn run() -> Result<(), KernelError> {
    let hello = ElfBuilder::new(0x8100_0000)
        .segment(0x8100_0000, b"\xeb\xfe", 0x1000)
        .build();
    let fs = MemFs::new().with_file("hello.elf", &hello);

    let cfg = KernelConfig::for_memory(SIM_MEM).with_idle_entry(VirtAddr(0x0010_0000));
    let mut k = KernelState::new(SimHal::new(SIM_MEM as usize), fs, cfg)?;
    let init = k.create_first_task("init", &[0xeb, 0xfe])?;

    let (_, pid) = syscall(&mut k, SYS_FORK, [0; 4]);
    let child = TaskId::from_pid(pid).ok_or(KernelError::NoFreeTask)?;
    log::info!("init forked pid {}", pid);

    // init は子を待って眠る
    let status = MEMORY_TASK_BASE + 0x800;
    syscall(&mut k, SYS_WAIT, [status, 0, 0, 0]);

    // 子の進み具合: exec 前 → exec 済み → 眠った後
    let mut child_step = 0;
    let mut waited = None;
    for _ in 0..TICKS {
        k.on_timer();

        let cur = k.current_id();
        if cur == child {
            match child_step {
                0 => {
                    put_str(&mut k, MEMORY_TASK_BASE + 0x100, "/hello.elf")?;
                    syscall(&mut k, SYS_EXECVE, [MEMORY_TASK_BASE + 0x100, 0, 0, 0]);
                    log::info!("child now runs {}", k.current_task().name());
                }
                1 => {
                    syscall(&mut k, SYS_MSLEEP, [25, 0, 0, 0]);
                }
                _ => {
                    // exec 後の子: スタックの引数領域の下を作業域に使う
                    let scratch = 0xDFFF_0000;
                    put_str(&mut k, scratch, CONSOLE_PATH)?;
                    let (_, fd) = syscall(&mut k, SYS_OPEN, [scratch, 0, 0, 0]);
                    let (_, me) = syscall(&mut k, SYS_GETPID, [0; 4]);
                    let msg = std::format!("hello from pid {}\n", me);
                    put_str(&mut k, scratch + 0x100, &msg)?;
                    syscall(&mut k, SYS_WRITE, [fd as u32, scratch + 0x100, msg.len() as u32, 0]);
                    syscall(&mut k, SYS_EXIT, [3, 0, 0, 0]);
                }
            }
            child_step += 1;
        } else if cur == init && waited.is_none() {
            if let (SyscallOutcome::Done, reaped) = syscall(&mut k, SYS_WAIT, [status, 0, 0, 0]) {
                let code = k.read_user_u32(VirtAddr(status))?;
                log::info!("init reaped pid {} with status {}", reaped, code);
                waited = Some(reaped);
            }
        }
    }

    log::info!("console: {:?}", k.fs().console_text());
    k.dump_events();
    Ok(())
}

fn main() {
    logging::set_writer(Some(Box::leak(Box::new(Stdout))));
    logging::init(log::LevelFilter::Info);

    if let Err(e) = run() {
        log::error!("sim failed: {}", e);
        std::process::exit(1);
    }
}
