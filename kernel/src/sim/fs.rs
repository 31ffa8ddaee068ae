// kernel/src/sim/fs.rs
//
// テスト / デモ用のメモリ上ファイルシステム。
// - ファイルは名前 + 中身の Vec。ディレクトリは "/" の 1 つだけ。
// - "/dev/tty0" はコンソール（書いた内容は console に溜まる）。
// - オープンファイル表は参照カウント付き。close で 0 になったら解放。

use std::string::String;
use std::vec::Vec;

use crate::kernel::fs::{
    DirEntry, FileId, FileKind, FileStat, FileSystem, FsError, O_APPEND, O_CREAT, O_TRUNC, SEEK_CUR, SEEK_END,
    SEEK_SET,
};

pub const CONSOLE_PATH: &str = "/dev/tty0";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Target {
    File(usize),
    Console,
}

#[derive(Clone, Copy, Debug)]
struct OpenFile {
    target: Target,
    pos: u32,
    append: bool,
    refs: u32,
}

struct MemFile {
    name: String,
    data: Vec<u8>,
}

#[derive(Default)]
pub struct MemFs {
    files: Vec<Option<MemFile>>,
    open: Vec<Option<OpenFile>>,
    dir_open: bool,
    pub console: Vec<u8>,
}

fn strip_root(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, name: &str, data: &[u8]) -> Self {
        self.add_file(name, data);
        self
    }

    pub fn add_file(&mut self, name: &str, data: &[u8]) {
        let name = strip_root(name);
        match self.lookup(name) {
            Some(i) => {
                if let Some(f) = self.files[i].as_mut() {
                    f.data = data.to_vec();
                }
            }
            None => self.files.push(Some(MemFile {
                name: String::from(name),
                data: data.to_vec(),
            })),
        }
    }

    pub fn file_data(&self, name: &str) -> Option<&[u8]> {
        let i = self.lookup(strip_root(name))?;
        self.files[i].as_ref().map(|f| f.data.as_slice())
    }

    /// 開いているハンドルの数
    pub fn open_count(&self) -> usize {
        self.open.iter().flatten().count()
    }

    pub fn refs(&self, file: FileId) -> u32 {
        self.open
            .get(file.0 as usize)
            .and_then(|o| o.as_ref())
            .map_or(0, |o| o.refs)
    }

    pub fn console_text(&self) -> String {
        String::from_utf8_lossy(&self.console).into_owned()
    }

    fn lookup(&self, name: &str) -> Option<usize> {
        self.files
            .iter()
            .position(|f| f.as_ref().map_or(false, |f| f.name == name))
    }

    fn entry(&mut self, file: FileId) -> Result<&mut OpenFile, FsError> {
        self.open
            .get_mut(file.0 as usize)
            .and_then(|o| o.as_mut())
            .ok_or(FsError::BadHandle)
    }

    fn size_of(&self, target: Target) -> u32 {
        match target {
            Target::File(i) => self.files[i].as_ref().map_or(0, |f| f.data.len() as u32),
            Target::Console => 0,
        }
    }

    fn insert_open(&mut self, of: OpenFile) -> FileId {
        match self.open.iter().position(|o| o.is_none()) {
            Some(i) => {
                self.open[i] = Some(of);
                FileId(i as u16)
            }
            None => {
                self.open.push(Some(of));
                FileId((self.open.len() - 1) as u16)
            }
        }
    }
}

impl FileSystem for MemFs {
    fn open(&mut self, path: &str, flags: u32) -> Result<FileId, FsError> {
        let target = if path == CONSOLE_PATH {
            Target::Console
        } else {
            let name = strip_root(path);
            let index = match self.lookup(name) {
                Some(i) => i,
                None if flags & O_CREAT != 0 => {
                    self.files.push(Some(MemFile {
                        name: String::from(name),
                        data: Vec::new(),
                    }));
                    self.files.len() - 1
                }
                None => return Err(FsError::NotFound),
            };
            if flags & O_TRUNC != 0 {
                if let Some(f) = self.files[index].as_mut() {
                    f.data.clear();
                }
            }
            Target::File(index)
        };

        Ok(self.insert_open(OpenFile {
            target,
            pos: 0,
            append: flags & O_APPEND != 0,
            refs: 1,
        }))
    }

    fn read(&mut self, file: FileId, buf: &mut [u8]) -> Result<usize, FsError> {
        let of = *self.entry(file)?;
        let Target::File(i) = of.target else {
            return Ok(0);
        };
        let data = self.files[i].as_ref().map_or(&[][..], |f| f.data.as_slice());
        let start = (of.pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.entry(file)?.pos += n as u32;
        Ok(n)
    }

    fn write(&mut self, file: FileId, data: &[u8]) -> Result<usize, FsError> {
        let of = *self.entry(file)?;
        match of.target {
            Target::Console => {
                self.console.extend_from_slice(data);
                Ok(data.len())
            }
            Target::File(i) => {
                let f = self.files[i].as_mut().ok_or(FsError::NotFound)?;
                let pos = if of.append { f.data.len() } else { of.pos as usize };
                if f.data.len() < pos + data.len() {
                    f.data.resize(pos + data.len(), 0);
                }
                f.data[pos..pos + data.len()].copy_from_slice(data);
                self.entry(file)?.pos = (pos + data.len()) as u32;
                Ok(data.len())
            }
        }
    }

    fn lseek(&mut self, file: FileId, offset: i32, whence: u32) -> Result<u32, FsError> {
        let of = *self.entry(file)?;
        let base = match whence {
            SEEK_SET => 0i64,
            SEEK_CUR => of.pos as i64,
            SEEK_END => self.size_of(of.target) as i64,
            _ => return Err(FsError::NotSupported),
        };
        let pos = base + offset as i64;
        if pos < 0 || pos > u32::MAX as i64 {
            return Err(FsError::Io);
        }
        self.entry(file)?.pos = pos as u32;
        Ok(pos as u32)
    }

    fn close(&mut self, file: FileId) {
        if let Some(slot) = self.open.get_mut(file.0 as usize) {
            if let Some(of) = slot.as_mut() {
                of.refs -= 1;
                if of.refs == 0 {
                    *slot = None;
                }
            }
        }
    }

    fn add_ref(&mut self, file: FileId) {
        if let Ok(of) = self.entry(file) {
            of.refs += 1;
        }
    }

    fn isatty(&mut self, file: FileId) -> bool {
        matches!(self.entry(file).map(|o| o.target), Ok(Target::Console))
    }

    fn fstat(&mut self, file: FileId) -> Result<FileStat, FsError> {
        let target = self.entry(file)?.target;
        let kind = match target {
            Target::Console => FileKind::Tty,
            Target::File(_) => FileKind::Regular,
        };
        Ok(FileStat {
            kind,
            size: self.size_of(target),
        })
    }

    fn ioctl(&mut self, file: FileId, _cmd: u32, _arg0: u32, _arg1: u32) -> Result<i32, FsError> {
        match self.entry(file)?.target {
            Target::Console => Ok(0),
            Target::File(_) => Err(FsError::NotSupported),
        }
    }

    fn opendir(&mut self, path: &str) -> Result<(), FsError> {
        if strip_root(path).is_empty() || path == "." {
            self.dir_open = true;
            Ok(())
        } else {
            Err(FsError::NotFound)
        }
    }

    fn readdir(&mut self, index: u32) -> Result<DirEntry, FsError> {
        if !self.dir_open {
            return Err(FsError::BadHandle);
        }
        let f = self
            .files
            .iter()
            .flatten()
            .nth(index as usize)
            .ok_or(FsError::NotFound)?;
        Ok(DirEntry::new(index, FileKind::Regular, &f.name, f.data.len() as u32))
    }

    fn closedir(&mut self) -> Result<(), FsError> {
        self.dir_open = false;
        Ok(())
    }

    fn unlink(&mut self, path: &str) -> Result<(), FsError> {
        let i = self.lookup(strip_root(path)).ok_or(FsError::NotFound)?;
        self.files[i] = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::fs::O_RDWR;

    #[test]
    fn read_write_seek() {
        let mut fs = MemFs::new().with_file("hello.txt", b"hello world");
        let f = fs.open("/hello.txt", O_RDWR).unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(fs.read(f, &mut buf), Ok(5));
        assert_eq!(&buf, b"hello");

        assert_eq!(fs.lseek(f, -5, SEEK_END), Ok(6));
        assert_eq!(fs.write(f, b"WORLD!"), Ok(6));
        assert_eq!(fs.file_data("hello.txt"), Some(&b"hello WORLD!"[..]));
        assert_eq!(fs.lseek(f, -1, SEEK_SET), Err(FsError::Io));
        assert_eq!(fs.fstat(f).unwrap().size, 12);
    }

    #[test]
    fn refcounted_handles() {
        let mut fs = MemFs::new();
        let tty = fs.open(CONSOLE_PATH, O_RDWR).unwrap();
        assert!(fs.isatty(tty));
        fs.add_ref(tty);
        assert_eq!(fs.refs(tty), 2);
        fs.close(tty);
        assert_eq!(fs.open_count(), 1);
        fs.close(tty);
        assert_eq!(fs.open_count(), 0);
        assert_eq!(fs.write(tty, b"x"), Err(FsError::BadHandle));
    }

    #[test]
    fn directory_listing_and_unlink() {
        let mut fs = MemFs::new().with_file("a", b"1").with_file("b", b"22");
        assert_eq!(fs.open("missing", 0), Err(FsError::NotFound));
        fs.opendir("/").unwrap();
        assert_eq!(fs.readdir(1).unwrap().size, 2);
        fs.unlink("/a").unwrap();
        assert_eq!(fs.readdir(0).unwrap().size, 2);
        assert_eq!(fs.readdir(1).map(|e| e.index), Err(FsError::NotFound));
        fs.closedir().unwrap();
        assert!(fs.readdir(0).is_err());
    }
}
