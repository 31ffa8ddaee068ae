// kernel/src/kernel/elf.rs
//
// exec が読む実行ファイル形式（ELF32, i386）のヘッダ定義と検査。
// ロード処理そのものは process.rs にある。

use crate::error::KernelError;

pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
pub const ET_EXEC: u16 = 2;
pub const EM_386: u16 = 3;
pub const PT_LOAD: u32 = 1;

pub const EHDR_SIZE: usize = 52;
pub const PHDR_SIZE: usize = 32;

fn u16_at(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn u32_at(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElfHeader {
    pub ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
}

impl ElfHeader {
    pub fn parse(b: &[u8; EHDR_SIZE]) -> Self {
        let mut ident = [0u8; 16];
        ident.copy_from_slice(&b[0..16]);
        ElfHeader {
            ident,
            e_type: u16_at(b, 16),
            e_machine: u16_at(b, 18),
            e_version: u32_at(b, 20),
            e_entry: u32_at(b, 24),
            e_phoff: u32_at(b, 28),
            e_shoff: u32_at(b, 32),
            e_flags: u32_at(b, 36),
            e_ehsize: u16_at(b, 40),
            e_phentsize: u16_at(b, 42),
            e_phnum: u16_at(b, 44),
        }
    }

    /// マジック / 種別 / マシン / エントリ / プログラムヘッダの有無
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.ident[0..4] != ELF_MAGIC {
            log::warn!("exec: bad elf magic");
            return Err(KernelError::BadExecutable);
        }
        if self.e_type != ET_EXEC || self.e_machine != EM_386 || self.e_entry == 0 {
            log::warn!(
                "exec: not an i386 executable (type = {}, machine = {}, entry = {:#x})",
                self.e_type,
                self.e_machine,
                self.e_entry
            );
            return Err(KernelError::BadExecutable);
        }
        if self.e_phentsize == 0 || self.e_phoff == 0 || self.e_phnum == 0 {
            log::warn!("exec: no program header");
            return Err(KernelError::BadExecutable);
        }
        Ok(())
    }

    /// i 番目のプログラムヘッダのファイル内位置
    pub fn phdr_offset(&self, i: u16) -> Option<u32> {
        (i as u32)
            .checked_mul(self.e_phentsize as u32)?
            .checked_add(self.e_phoff)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

impl ProgramHeader {
    pub fn parse(b: &[u8; PHDR_SIZE]) -> Self {
        ProgramHeader {
            p_type: u32_at(b, 0),
            p_offset: u32_at(b, 4),
            p_vaddr: u32_at(b, 8),
            p_paddr: u32_at(b, 12),
            p_filesz: u32_at(b, 16),
            p_memsz: u32_at(b, 20),
            p_flags: u32_at(b, 24),
            p_align: u32_at(b, 28),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::elf_image::ElfBuilder;

    fn header_of(image: &[u8]) -> ElfHeader {
        let mut b = [0u8; EHDR_SIZE];
        b.copy_from_slice(&image[..EHDR_SIZE]);
        ElfHeader::parse(&b)
    }

    #[test]
    fn built_image_validates() {
        let image = ElfBuilder::new(0x8000_0000)
            .segment(0x8000_0000, b"\x90\x90", 0x1000)
            .build();
        let h = header_of(&image);
        assert_eq!(h.validate(), Ok(()));
        assert_eq!(h.e_entry, 0x8000_0000);
        assert_eq!(h.e_phnum, 1);

        let mut p = [0u8; PHDR_SIZE];
        let off = h.phdr_offset(0).unwrap() as usize;
        p.copy_from_slice(&image[off..off + PHDR_SIZE]);
        let ph = ProgramHeader::parse(&p);
        assert_eq!(ph.p_type, PT_LOAD);
        assert_eq!(ph.p_vaddr, 0x8000_0000);
        assert_eq!(ph.p_filesz, 2);
        assert_eq!(ph.p_memsz, 0x1000);
    }

    #[test]
    fn rejects_bad_headers() {
        let good = ElfBuilder::new(0x8000_0000)
            .segment(0x8000_0000, b"x", 1)
            .build();

        let mut bad_magic = good.clone();
        bad_magic[1] = b'X';
        assert_eq!(header_of(&bad_magic).validate(), Err(KernelError::BadExecutable));

        let mut not_exec = good.clone();
        not_exec[16] = 3; // ET_DYN
        assert_eq!(header_of(&not_exec).validate(), Err(KernelError::BadExecutable));

        let mut wrong_machine = good.clone();
        wrong_machine[18] = 0x3E;
        assert_eq!(header_of(&wrong_machine).validate(), Err(KernelError::BadExecutable));

        let no_entry = ElfBuilder::new(0).segment(0x8000_0000, b"x", 1).build();
        assert_eq!(header_of(&no_entry).validate(), Err(KernelError::BadExecutable));

        let no_segments = ElfBuilder::new(0x8000_0000).build();
        assert_eq!(header_of(&no_segments).validate(), Err(KernelError::BadExecutable));
    }
}
