// kernel/src/error.rs
//
// カーネル内部で使うエラー型。
// - 内部関数は Result<_, KernelError> を返し、? で伝播する。
// - syscall 境界では as_errno() で負の値に潰して user に返す。

use core::fmt;

use crate::kernel::fs::FsError;
use crate::mem::address_space::AddressSpaceError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// 物理ページが足りない
    OutOfMemory,
    /// タスクテーブルに空きが無い
    NoFreeTask,
    /// 実行ファイルのヘッダ / プログラムヘッダが不正
    BadExecutable,
    /// user ポインタが未マップ、または範囲外
    BadAddress,
    BadFileDescriptor,
    TooManyOpenFiles,
    InvalidArgument,
    /// wait 対象の子が 1 つも無い
    NoChild,
    /// exec の引数が引数領域に収まらない
    ArgumentsTooLong,
    /// 未定義の syscall 番号
    UnknownSyscall(u32),
    Fs(FsError),
    AddressSpace(AddressSpaceError),
}

impl KernelError {
    /// user に見せる戻り値（失敗は一律 -1）
    pub fn as_errno(self) -> i32 {
        -1
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "out of physical memory"),
            KernelError::NoFreeTask => write!(f, "no free task slot"),
            KernelError::BadExecutable => write!(f, "bad executable image"),
            KernelError::BadAddress => write!(f, "bad user address"),
            KernelError::BadFileDescriptor => write!(f, "bad file descriptor"),
            KernelError::TooManyOpenFiles => write!(f, "too many open files"),
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::NoChild => write!(f, "no child process"),
            KernelError::ArgumentsTooLong => write!(f, "argument list too long"),
            KernelError::UnknownSyscall(id) => write!(f, "unknown syscall {}", id),
            KernelError::Fs(e) => write!(f, "file system: {:?}", e),
            KernelError::AddressSpace(e) => write!(f, "address space: {:?}", e),
        }
    }
}

impl From<FsError> for KernelError {
    fn from(e: FsError) -> Self {
        KernelError::Fs(e)
    }
}

impl From<AddressSpaceError> for KernelError {
    fn from(e: AddressSpaceError) -> Self {
        match e {
            AddressSpaceError::OutOfMemory => KernelError::OutOfMemory,
            AddressSpaceError::NotMapped => KernelError::BadAddress,
            other => KernelError::AddressSpace(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::ToString;

    #[test]
    fn address_space_errors_map_to_kernel_errors() {
        assert_eq!(KernelError::from(AddressSpaceError::OutOfMemory), KernelError::OutOfMemory);
        assert_eq!(KernelError::from(AddressSpaceError::NotMapped), KernelError::BadAddress);
        assert_eq!(KernelError::from(FsError::NotFound), KernelError::Fs(FsError::NotFound));
    }

    #[test]
    fn display_and_errno() {
        assert_eq!(KernelError::NoFreeTask.to_string(), "no free task slot");
        assert_eq!(KernelError::UnknownSyscall(77).to_string(), "unknown syscall 77");
        assert_eq!(KernelError::BadExecutable.as_errno(), -1);
    }
}
