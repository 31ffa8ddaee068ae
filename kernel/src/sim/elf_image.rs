// kernel/src/sim/elf_image.rs
//
// テスト用の最小 ELF32 実行ファイル生成器。
// ヘッダ(52) → プログラムヘッダ(32 * n) → 各セグメントの中身、の順に並べる。

use std::vec::Vec;

use crate::kernel::elf::{EHDR_SIZE, ELF_MAGIC, EM_386, ET_EXEC, PHDR_SIZE, PT_LOAD};

struct Segment {
    p_type: u32,
    vaddr: u32,
    data: Vec<u8>,
    memsz: u32,
}

pub struct ElfBuilder {
    entry: u32,
    segments: Vec<Segment>,
}

impl ElfBuilder {
    pub fn new(entry: u32) -> Self {
        ElfBuilder {
            entry,
            segments: Vec::new(),
        }
    }

    /// PT_LOAD セグメントを足す
    pub fn segment(self, vaddr: u32, data: &[u8], memsz: u32) -> Self {
        self.typed_segment(PT_LOAD, vaddr, data, memsz)
    }

    pub fn typed_segment(mut self, p_type: u32, vaddr: u32, data: &[u8], memsz: u32) -> Self {
        self.segments.push(Segment {
            p_type,
            vaddr,
            data: data.to_vec(),
            memsz,
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let phoff = EHDR_SIZE as u32;
        let mut data_off = phoff + (self.segments.len() * PHDR_SIZE) as u32;

        let mut out = Vec::new();
        out.extend_from_slice(&ELF_MAGIC);
        out.extend_from_slice(&[1, 1, 1]); // 32bit / little endian / version 1
        out.resize(16, 0);
        out.extend_from_slice(&ET_EXEC.to_le_bytes());
        out.extend_from_slice(&EM_386.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&self.entry.to_le_bytes());
        out.extend_from_slice(&phoff.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(self.segments.len() as u16).to_le_bytes());
        out.extend_from_slice(&[0u8; 6]); // shentsize / shnum / shstrndx
        debug_assert_eq!(out.len(), EHDR_SIZE);

        for seg in &self.segments {
            out.extend_from_slice(&seg.p_type.to_le_bytes());
            out.extend_from_slice(&data_off.to_le_bytes());
            out.extend_from_slice(&seg.vaddr.to_le_bytes());
            out.extend_from_slice(&seg.vaddr.to_le_bytes());
            out.extend_from_slice(&(seg.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&seg.memsz.to_le_bytes());
            out.extend_from_slice(&7u32.to_le_bytes()); // RWX
            out.extend_from_slice(&0x1000u32.to_le_bytes());
            data_off += seg.data.len() as u32;
        }

        for seg in &self.segments {
            out.extend_from_slice(&seg.data);
        }
        out
    }
}
