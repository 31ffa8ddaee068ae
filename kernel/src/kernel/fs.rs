// kernel/src/kernel/fs.rs
//
// 役割:
// - カーネルが使うファイル I/O の契約（FileSystem トレイト）。
// - タスクごとの fd テーブル操作（alloc_fd / remove_fd / task_file）。
//
// やらないこと:
// - ディスク上のファイルシステムやオープンファイル表の実装（外部コラボレータ）。
//   ここでは整数ハンドル FileId と参照カウントの増減だけを前提にする。

use crate::config::TASK_OFILE_NR;
use crate::kernel::task::Task;

/// ファイルシステム側のオープンファイルを指すハンドル
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileId(pub u16);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    BadHandle,
    NotSupported,
    NoSpace,
    Io,
}

// open の flags（newlib 互換の値）
pub const O_RDONLY: u32 = 0;
pub const O_WRONLY: u32 = 1;
pub const O_RDWR: u32 = 2;
pub const O_APPEND: u32 = 0x0008;
pub const O_CREAT: u32 = 0x0200;
pub const O_TRUNC: u32 = 0x0400;

// lseek の whence
pub const SEEK_SET: u32 = 0;
pub const SEEK_CUR: u32 = 1;
pub const SEEK_END: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum FileKind {
    Regular = 1,
    Directory = 2,
    Tty = 3,
}

/// fstat の結果。user 側には (kind, size) の 2 ワードで書き出す。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub kind: FileKind,
    pub size: u32,
}

impl FileStat {
    pub const USER_SIZE: usize = 8;

    pub fn to_user_bytes(self) -> [u8; Self::USER_SIZE] {
        let mut out = [0u8; Self::USER_SIZE];
        out[0..4].copy_from_slice(&(self.kind as u32).to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
        out
    }
}

pub const DIRENT_NAME_SIZE: usize = 255;

/// readdir の 1 エントリ
#[derive(Clone, Copy, Debug)]
pub struct DirEntry {
    pub index: u32,
    pub kind: FileKind,
    pub name: [u8; DIRENT_NAME_SIZE],
    pub size: u32,
}

impl DirEntry {
    /// user 側の dirent: index(4) / type(4) / name[255] + pad(1) / size(4)
    pub const USER_SIZE: usize = 268;

    pub fn new(index: u32, kind: FileKind, name: &str, size: u32) -> Self {
        let mut buf = [0u8; DIRENT_NAME_SIZE];
        let len = name.len().min(DIRENT_NAME_SIZE - 1);
        buf[..len].copy_from_slice(&name.as_bytes()[..len]);
        DirEntry {
            index,
            kind,
            name: buf,
            size,
        }
    }

    pub fn to_user_bytes(&self) -> [u8; Self::USER_SIZE] {
        let mut out = [0u8; Self::USER_SIZE];
        out[0..4].copy_from_slice(&self.index.to_le_bytes());
        out[4..8].copy_from_slice(&(self.kind as u32).to_le_bytes());
        out[8..8 + DIRENT_NAME_SIZE].copy_from_slice(&self.name);
        out[264..268].copy_from_slice(&self.size.to_le_bytes());
        out
    }
}

/// ファイルサブシステムとの契約。
///
/// - FileId は参照カウント付きの共有ハンドル。open で 1、add_ref で +1、close で -1。
/// - read / write はカーネル内のバッファに対して行う（user 空間への転送はカーネル側）。
pub trait FileSystem {
    fn open(&mut self, path: &str, flags: u32) -> Result<FileId, FsError>;
    fn read(&mut self, file: FileId, buf: &mut [u8]) -> Result<usize, FsError>;
    fn write(&mut self, file: FileId, data: &[u8]) -> Result<usize, FsError>;
    fn lseek(&mut self, file: FileId, offset: i32, whence: u32) -> Result<u32, FsError>;
    fn close(&mut self, file: FileId);
    fn add_ref(&mut self, file: FileId);

    fn isatty(&mut self, file: FileId) -> bool;
    fn fstat(&mut self, file: FileId) -> Result<FileStat, FsError>;
    fn ioctl(&mut self, file: FileId, cmd: u32, arg0: u32, arg1: u32) -> Result<i32, FsError>;

    fn opendir(&mut self, path: &str) -> Result<(), FsError>;
    fn readdir(&mut self, index: u32) -> Result<DirEntry, FsError>;
    fn closedir(&mut self) -> Result<(), FsError>;
    fn unlink(&mut self, path: &str) -> Result<(), FsError>;
}

// ────────────────────────────────────────────
// タスクごとの fd テーブル
// ────────────────────────────────────────────

/// 空いている最小の fd に file を入れる。満杯なら None。
pub fn alloc_fd(task: &mut Task, file: FileId) -> Option<usize> {
    let fd = task.files.iter().position(|f| f.is_none())?;
    task.files[fd] = Some(file);
    Some(fd)
}

pub fn remove_fd(task: &mut Task, fd: usize) -> Option<FileId> {
    task.files.get_mut(fd)?.take()
}

pub fn task_file(task: &Task, fd: usize) -> Option<FileId> {
    if fd >= TASK_OFILE_NR {
        return None;
    }
    task.files[fd]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fd_table_uses_lowest_free_slot() {
        let mut task = Task::EMPTY;
        assert_eq!(alloc_fd(&mut task, FileId(7)), Some(0));
        assert_eq!(alloc_fd(&mut task, FileId(8)), Some(1));
        assert_eq!(remove_fd(&mut task, 0), Some(FileId(7)));
        assert_eq!(task_file(&task, 0), None);
        assert_eq!(alloc_fd(&mut task, FileId(9)), Some(0));
        assert_eq!(task_file(&task, 1), Some(FileId(8)));
        assert_eq!(task_file(&task, TASK_OFILE_NR), None);
        assert_eq!(remove_fd(&mut task, TASK_OFILE_NR + 3), None);
    }

    #[test]
    fn fd_table_reports_full() {
        let mut task = Task::EMPTY;
        for i in 0..TASK_OFILE_NR {
            assert_eq!(alloc_fd(&mut task, FileId(i as u16)), Some(i));
        }
        assert_eq!(alloc_fd(&mut task, FileId(0)), None);
    }

    #[test]
    fn dirent_user_layout() {
        let e = DirEntry::new(3, FileKind::Regular, "shell.elf", 1234);
        let bytes = e.to_user_bytes();
        assert_eq!(&bytes[0..4], &3u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
        assert_eq!(&bytes[8..17], b"shell.elf");
        assert_eq!(bytes[17], 0);
        assert_eq!(&bytes[264..268], &1234u32.to_le_bytes());
    }
}
