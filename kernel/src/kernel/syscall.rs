// kernel/src/kernel/syscall.rs
//
// 役割:
// - syscall 番号 → ハンドラの振り分け（handle_syscall）
// - user バッファ / パスの受け渡し（ページテーブル経由でカーネル内バッファへ）
// - ファイル系 syscall を FileSystem へ転送する
//
// 戻り値の規約:
// - 成功: eax に結果（pid / fd / バイト数 / アドレス）
// - 失敗: eax = -1（理由は warn ログに出す）
// - wait のように「起こされてから条件を見直す」ものは Restart を返し、
//   入口側がタスク再開時にもう一度 handle_syscall を呼ぶ。

use crate::arch::Hal;
use crate::error::KernelError;
use crate::kernel::fs::{self, FileSystem};
use crate::kernel::{trace, KernelState};
use crate::mem::addr::VirtAddr;

pub const SYS_MSLEEP: u32 = 0;
pub const SYS_GETPID: u32 = 1;
pub const SYS_FORK: u32 = 2;
pub const SYS_EXECVE: u32 = 3;
pub const SYS_YIELD: u32 = 4;
pub const SYS_EXIT: u32 = 5;
pub const SYS_WAIT: u32 = 6;

pub const SYS_OPEN: u32 = 50;
pub const SYS_READ: u32 = 51;
pub const SYS_WRITE: u32 = 52;
pub const SYS_CLOSE: u32 = 53;
pub const SYS_LSEEK: u32 = 54;
pub const SYS_ISATTY: u32 = 55;
pub const SYS_SBRK: u32 = 56;
pub const SYS_FSTAT: u32 = 57;
pub const SYS_DUP: u32 = 58;
pub const SYS_IOCTL: u32 = 59;

pub const SYS_OPENDIR: u32 = 60;
pub const SYS_READDIR: u32 = 61;
pub const SYS_CLOSEDIR: u32 = 62;
pub const SYS_UNLINK: u32 = 63;

pub const SYS_PRINTMSG: u32 = 100;

/// パス / 文字列引数の上限
pub const PATH_MAX: usize = 256;
/// read / write で一度に運ぶ量
const IO_CHUNK: usize = 512;

/// syscall 入口でカーネルスタックに積まれるフレーム。
///
/// 入口のアセンブリが積む順番そのまま。
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyscallFrame {
    pub eflags: u32,
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    // pushad
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    // 呼び出しゲートが積む戻り先と、user スタックからコピーされる引数
    pub eip: u32,
    pub cs: u32,
    pub func_id: u32,
    pub arg0: u32,
    pub arg1: u32,
    pub arg2: u32,
    pub arg3: u32,
    pub esp: u32,
    pub ss: u32,
}

impl SyscallFrame {
    pub fn new(func_id: u32, args: [u32; 4]) -> Self {
        SyscallFrame {
            func_id,
            arg0: args[0],
            arg1: args[1],
            arg2: args[2],
            arg3: args[3],
            ..SyscallFrame::default()
        }
    }

    /// eax に載る値（符号付きで見たもの）
    pub fn ret(&self) -> i32 {
        self.eax as i32
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallOutcome {
    /// eax に結果を書いた
    Done,
    /// 起こされた後にもう一度同じ syscall を評価する
    Restart,
    /// 呼び出したタスクは終了した（user には戻らない）
    Exited,
}

enum Completion {
    Value(i32),
    Restart,
    Exited,
}

impl<H: Hal, F: FileSystem> KernelState<H, F> {
    pub fn handle_syscall(&mut self, frame: &mut SyscallFrame) -> SyscallOutcome {
        let id = frame.func_id;
        let tid = self.current_id();
        trace::trace_syscall_enter(tid, id, [frame.arg0, frame.arg1, frame.arg2, frame.arg3]);

        let result = self.dispatch_syscall(frame);

        let ret = match result {
            Ok(Completion::Value(v)) => v,
            Ok(Completion::Restart) => return SyscallOutcome::Restart,
            Ok(Completion::Exited) => return SyscallOutcome::Exited,
            Err(e) => {
                log::warn!("syscall {} failed: task = {}, {}", id, tid.as_pid(), e);
                e.as_errno()
            }
        };

        frame.eax = ret as u32;
        trace::trace_syscall_exit(tid, id, ret);
        SyscallOutcome::Done
    }

    fn dispatch_syscall(&mut self, frame: &mut SyscallFrame) -> Result<Completion, KernelError> {
        use Completion::Value;

        let (a0, a1, a2, a3) = (frame.arg0, frame.arg1, frame.arg2, frame.arg3);
        match frame.func_id {
            SYS_MSLEEP => {
                self.msleep(a0);
                Ok(Value(0))
            }
            SYS_GETPID => Ok(Value(self.current_id().as_pid())),
            SYS_FORK => Ok(Value(self.fork(frame)?.as_pid())),
            SYS_EXECVE => {
                self.exec(frame, VirtAddr(a0), VirtAddr(a1), VirtAddr(a2))?;
                Ok(Value(0))
            }
            SYS_YIELD => {
                self.yield_now();
                Ok(Value(0))
            }
            SYS_EXIT => {
                self.exit(a0 as i32);
                Ok(Completion::Exited)
            }
            SYS_WAIT => match self.wait(VirtAddr(a0))? {
                Some(child) => Ok(Value(child.as_pid())),
                None => Ok(Completion::Restart),
            },

            SYS_OPEN => self.sys_open(VirtAddr(a0), a1).map(Value),
            SYS_READ => self.sys_read(a0 as usize, VirtAddr(a1), a2).map(Value),
            SYS_WRITE => self.sys_write(a0 as usize, VirtAddr(a1), a2).map(Value),
            SYS_CLOSE => self.sys_close(a0 as usize).map(Value),
            SYS_LSEEK => {
                let file = self.fd_file(a0 as usize)?;
                Ok(Value(self.fs.lseek(file, a1 as i32, a2)? as i32))
            }
            SYS_ISATTY => {
                let file = self.fd_file(a0 as usize)?;
                Ok(Value(self.fs.isatty(file) as i32))
            }
            SYS_SBRK => Ok(Value(self.grow_heap(a0 as i32)? as i32)),
            SYS_FSTAT => {
                let file = self.fd_file(a0 as usize)?;
                let stat = self.fs.fstat(file)?;
                self.copy_to_user(VirtAddr(a1), &stat.to_user_bytes())?;
                Ok(Value(0))
            }
            SYS_DUP => self.sys_dup(a0 as usize).map(Value),
            SYS_IOCTL => {
                let file = self.fd_file(a0 as usize)?;
                Ok(Value(self.fs.ioctl(file, a1, a2, a3)?))
            }

            SYS_OPENDIR => {
                let mut buf = [0u8; PATH_MAX];
                let path = self.read_user_str(VirtAddr(a0), &mut buf)?;
                self.fs.opendir(path)?;
                // DIR.index = 0
                self.write_user_u32(VirtAddr(a1), 0)?;
                Ok(Value(0))
            }
            SYS_READDIR => {
                let dir = VirtAddr(a0);
                let index = self.read_user_u32(dir)?;
                let entry = self.fs.readdir(index)?;
                self.copy_to_user(VirtAddr(a1), &entry.to_user_bytes())?;
                self.write_user_u32(dir, index + 1)?;
                Ok(Value(0))
            }
            SYS_CLOSEDIR => {
                self.fs.closedir()?;
                Ok(Value(0))
            }
            SYS_UNLINK => {
                let mut buf = [0u8; PATH_MAX];
                let path = self.read_user_str(VirtAddr(a0), &mut buf)?;
                self.fs.unlink(path)?;
                Ok(Value(0))
            }

            SYS_PRINTMSG => {
                let mut buf = [0u8; PATH_MAX];
                let fmt = self.read_user_str(VirtAddr(a0), &mut buf)?;
                print_msg(fmt, a1 as i32);
                Ok(Value(0))
            }

            other => {
                log::error!("unknown syscall: id = {}", other);
                Err(KernelError::UnknownSyscall(other))
            }
        }
    }

    // ────────────────────────────────────────────
    // ファイル系
    // ────────────────────────────────────────────

    fn fd_file(&self, fd: usize) -> Result<fs::FileId, KernelError> {
        fs::task_file(&self.tasks[self.current], fd).ok_or(KernelError::BadFileDescriptor)
    }

    fn sys_open(&mut self, path: VirtAddr, flags: u32) -> Result<i32, KernelError> {
        let mut buf = [0u8; PATH_MAX];
        let path = self.read_user_str(path, &mut buf)?;
        let file = self.fs.open(path, flags)?;

        match fs::alloc_fd(&mut self.tasks[self.current], file) {
            Some(fd) => Ok(fd as i32),
            None => {
                self.fs.close(file);
                Err(KernelError::TooManyOpenFiles)
            }
        }
    }

    fn sys_read(&mut self, fd: usize, ptr: VirtAddr, len: u32) -> Result<i32, KernelError> {
        let file = self.fd_file(fd)?;
        let mut buf = [0u8; IO_CHUNK];
        let mut done = 0u32;

        while done < len {
            let chunk = ((len - done) as usize).min(IO_CHUNK);
            let n = self.fs.read(file, &mut buf[..chunk])?;
            let dst = ptr.checked_add(done).ok_or(KernelError::BadAddress)?;
            self.copy_to_user(dst, &buf[..n])?;
            done += n as u32;
            if n < chunk {
                break;
            }
        }
        Ok(done as i32)
    }

    fn sys_write(&mut self, fd: usize, ptr: VirtAddr, len: u32) -> Result<i32, KernelError> {
        let file = self.fd_file(fd)?;
        let mut buf = [0u8; IO_CHUNK];
        let mut done = 0u32;

        while done < len {
            let chunk = ((len - done) as usize).min(IO_CHUNK);
            let src = ptr.checked_add(done).ok_or(KernelError::BadAddress)?;
            self.copy_from_user(src, &mut buf[..chunk])?;
            let n = self.fs.write(file, &buf[..chunk])?;
            done += n as u32;
            if n < chunk {
                break;
            }
        }
        Ok(done as i32)
    }

    fn sys_close(&mut self, fd: usize) -> Result<i32, KernelError> {
        let file = fs::remove_fd(&mut self.tasks[self.current], fd).ok_or(KernelError::BadFileDescriptor)?;
        self.fs.close(file);
        Ok(0)
    }

    fn sys_dup(&mut self, fd: usize) -> Result<i32, KernelError> {
        let file = self.fd_file(fd)?;
        let new_fd = fs::alloc_fd(&mut self.tasks[self.current], file).ok_or(KernelError::TooManyOpenFiles)?;
        self.fs.add_ref(file);
        Ok(new_fd as i32)
    }
}

/// printmsg: 書式中の最初の %d / %x だけを arg で置き換えて出す
fn print_msg(fmt: &str, arg: i32) {
    let hit = ["%d", "%x"]
        .iter()
        .filter_map(|p| fmt.find(p).map(|at| (at, *p)))
        .min_by_key(|(at, _)| *at);

    match hit {
        Some((at, "%x")) => log::info!("{}{:#x}{}", &fmt[..at], arg, &fmt[at + 2..]),
        Some((at, _)) => log::info!("{}{}{}", &fmt[..at], arg, &fmt[at + 2..]),
        None => log::info!("{}", fmt),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MEMORY_TASK_BASE, PAGE_SIZE};
    use crate::kernel::fs::{FileKind, O_CREAT, O_RDWR};
    use crate::kernel::testutil::*;
    use crate::sim::fs::CONSOLE_PATH;
    use crate::sim::MemFs;

    const BASE: u32 = MEMORY_TASK_BASE;

    fn call(k: &mut SimKernel, id: u32, args: [u32; 4]) -> i32 {
        let mut frame = SyscallFrame::new(id, args);
        assert_eq!(k.handle_syscall(&mut frame), SyscallOutcome::Done);
        frame.ret()
    }

    fn put_str(k: &mut SimKernel, va: u32, s: &str) {
        k.copy_to_user(VirtAddr(va), s.as_bytes()).unwrap();
        k.copy_to_user(VirtAddr(va + s.len() as u32), &[0]).unwrap();
    }

    fn running(fs: MemFs) -> SimKernel {
        let mut k = boot_with(fs);
        spawn(&mut k, "t");
        run_next(&mut k);
        k
    }

    #[test]
    fn getpid_and_unknown_syscall() {
        let mut k = running(MemFs::new());
        let pid = k.current_id().as_pid();
        assert_eq!(call(&mut k, SYS_GETPID, [0; 4]), pid);
        assert_eq!(call(&mut k, 999, [0; 4]), -1);
    }

    #[test]
    fn open_write_seek_read_close() {
        let mut k = running(MemFs::new());
        put_str(&mut k, BASE, "/notes.txt");
        let fd = call(&mut k, SYS_OPEN, [BASE, O_CREAT | O_RDWR, 0, 0]);
        assert_eq!(fd, 0);

        // 1 チャンク (512) に収まらない 700 バイト
        let data: std::vec::Vec<u8> = (0..700u32).map(|i| (i % 251) as u8).collect();
        let src = BASE + PAGE_SIZE - 700;
        k.copy_to_user(VirtAddr(src), &data).unwrap();
        assert_eq!(call(&mut k, SYS_WRITE, [fd as u32, src, 700, 0]), 700);
        assert_eq!(k.fs().file_data("notes.txt").map(|d| d.len()), Some(700));

        assert_eq!(call(&mut k, SYS_LSEEK, [fd as u32, 0, 0, 0]), 0);
        assert_eq!(call(&mut k, SYS_READ, [fd as u32, BASE + 0x20, 400, 0]), 400);
        let mut back = [0u8; 400];
        k.copy_from_user(VirtAddr(BASE + 0x20), &mut back).unwrap();
        assert_eq!(&back[..], &data[..400]);

        assert_eq!(call(&mut k, SYS_CLOSE, [fd as u32, 0, 0, 0]), 0);
        assert_eq!(call(&mut k, SYS_CLOSE, [fd as u32, 0, 0, 0]), -1);
        assert_eq!(call(&mut k, SYS_READ, [fd as u32, BASE, 1, 0]), -1);
        assert_eq!(k.fs().open_count(), 0);
    }

    #[test]
    fn dup_shares_the_open_file() {
        let mut k = running(MemFs::new());
        put_str(&mut k, BASE, CONSOLE_PATH);
        let fd = call(&mut k, SYS_OPEN, [BASE, O_RDWR, 0, 0]);
        let copy = call(&mut k, SYS_DUP, [fd as u32, 0, 0, 0]);
        assert_eq!(copy, 1);
        assert_eq!(call(&mut k, SYS_ISATTY, [copy as u32, 0, 0, 0]), 1);

        put_str(&mut k, BASE + 0x40, "hi");
        assert_eq!(call(&mut k, SYS_WRITE, [copy as u32, BASE + 0x40, 2, 0]), 2);
        assert_eq!(k.fs().console_text(), "hi");

        call(&mut k, SYS_CLOSE, [fd as u32, 0, 0, 0]);
        assert_eq!(k.fs().open_count(), 1);
        assert_eq!(call(&mut k, SYS_IOCTL, [copy as u32, 1, 0, 0]), 0);
        call(&mut k, SYS_CLOSE, [copy as u32, 0, 0, 0]);
        assert_eq!(k.fs().open_count(), 0);
    }

    #[test]
    fn fstat_and_directory_walk() {
        let mut k = running(MemFs::new().with_file("a.elf", b"12345").with_file("b.txt", b"x"));
        put_str(&mut k, BASE, "/a.elf");
        let fd = call(&mut k, SYS_OPEN, [BASE, 0, 0, 0]);
        assert_eq!(call(&mut k, SYS_FSTAT, [fd as u32, BASE + 0x100, 0, 0]), 0);
        assert_eq!(k.read_user_u32(VirtAddr(BASE + 0x100)), Ok(FileKind::Regular as u32));
        assert_eq!(k.read_user_u32(VirtAddr(BASE + 0x104)), Ok(5));

        let dir = BASE + 0x200;
        let dirent = dir + 4;
        put_str(&mut k, BASE + 0x80, "/");
        assert_eq!(call(&mut k, SYS_OPENDIR, [BASE + 0x80, dir, 0, 0]), 0);
        assert_eq!(call(&mut k, SYS_READDIR, [dir, dirent, 0, 0]), 0);
        assert_eq!(call(&mut k, SYS_READDIR, [dir, dirent, 0, 0]), 0);
        assert_eq!(k.read_user_u32(VirtAddr(dir)), Ok(2));
        let mut name = [0u8; 5];
        k.copy_from_user(VirtAddr(dirent + 8), &mut name).unwrap();
        assert_eq!(&name, b"b.txt");
        assert_eq!(call(&mut k, SYS_READDIR, [dir, dirent, 0, 0]), -1);
        assert_eq!(call(&mut k, SYS_CLOSEDIR, [dir, 0, 0, 0]), 0);

        put_str(&mut k, BASE + 0x80, "b.txt");
        assert_eq!(call(&mut k, SYS_UNLINK, [BASE + 0x80, 0, 0, 0]), 0);
        assert_eq!(call(&mut k, SYS_UNLINK, [BASE + 0x80, 0, 0, 0]), -1);
    }

    #[test]
    fn bad_user_pointers_fail_cleanly() {
        let mut k = running(MemFs::new());
        assert_eq!(call(&mut k, SYS_OPEN, [0, 0, 0, 0]), -1);
        assert_eq!(call(&mut k, SYS_OPEN, [0x9000_0000, 0, 0, 0]), -1);
        put_str(&mut k, BASE, "/missing");
        assert_eq!(call(&mut k, SYS_OPEN, [BASE, 0, 0, 0]), -1);
        assert_eq!(call(&mut k, SYS_PRINTMSG, [BASE, 3, 0, 0]), 0);
    }

    #[test]
    fn fd_table_full_closes_the_new_file() {
        let mut k = running(MemFs::new());
        put_str(&mut k, BASE, CONSOLE_PATH);
        for _ in 0..crate::config::TASK_OFILE_NR {
            assert!(call(&mut k, SYS_OPEN, [BASE, 0, 0, 0]) >= 0);
        }
        let open = k.fs().open_count();
        assert_eq!(call(&mut k, SYS_OPEN, [BASE, 0, 0, 0]), -1);
        assert_eq!(k.fs().open_count(), open);
    }
}
