// kernel/src/sim/hal.rs
//
// ホスト上で動く Hal 実装。
// - 物理メモリは Vec<u8>（アドレス 0 から size バイト）。
// - 割り込みフラグ / CR3 / CR2 は値として持つだけ。
// - コンテキスト切替は「記録して即 return」。実機と違い、dispatch は
//   切替先のタスクを実際には走らせない。
// - halt は panic（テストで #[should_panic(expected = "halt")] として観測する）。

use std::vec;
use std::vec::Vec;

use crate::arch::{ContextSwitch, Hal, PhysMemory, TaskContext};
use crate::mem::addr::{PhysAddr, VirtAddr};

pub struct SimHal {
    memory: Vec<u8>,
    irq_enabled: bool,
    page_dir: Option<PhysAddr>,
    fault_addr: VirtAddr,

    /// set_page_dir / restore で載ったページディレクトリの履歴
    pub page_dir_loads: Vec<PhysAddr>,
    /// (from.cr3, to.cr3) の切替履歴
    pub switches: Vec<(u32, u32)>,
    pub prepared: usize,
    pub timer_acks: usize,
}

impl SimHal {
    pub fn new(mem_bytes: usize) -> Self {
        SimHal {
            memory: vec![0; mem_bytes],
            irq_enabled: false,
            page_dir: None,
            fault_addr: VirtAddr(0),
            page_dir_loads: Vec::new(),
            switches: Vec::new(),
            prepared: 0,
            timer_acks: 0,
        }
    }

    pub fn page_dir(&self) -> Option<PhysAddr> {
        self.page_dir
    }

    /// 次の fault_address() が返す値を仕込む
    pub fn set_fault_address(&mut self, addr: VirtAddr) {
        self.fault_addr = addr;
    }

    fn range(&self, addr: PhysAddr, len: usize) -> core::ops::Range<usize> {
        let start = addr.as_usize();
        let end = start + len;
        assert!(end <= self.memory.len(), "sim: physical access {:#x}+{} out of range", addr.0, len);
        start..end
    }
}

impl PhysMemory for SimHal {
    fn read(&self, addr: PhysAddr, buf: &mut [u8]) {
        let r = self.range(addr, buf.len());
        buf.copy_from_slice(&self.memory[r]);
    }

    fn write(&mut self, addr: PhysAddr, data: &[u8]) {
        let r = self.range(addr, data.len());
        self.memory[r].copy_from_slice(data);
    }

    fn fill(&mut self, addr: PhysAddr, value: u8, len: usize) {
        let r = self.range(addr, len);
        self.memory[r].fill(value);
    }

    fn copy(&mut self, dst: PhysAddr, src: PhysAddr, len: usize) {
        let s = self.range(src, len);
        let d = self.range(dst, len);
        self.memory.copy_within(s, d.start);
    }
}

impl ContextSwitch for SimHal {
    fn save(&mut self, _ctx: &mut TaskContext) {}

    fn restore(&mut self, ctx: &TaskContext) {
        self.page_dir = Some(PhysAddr(ctx.cr3));
        self.page_dir_loads.push(PhysAddr(ctx.cr3));
    }

    fn switch_to(&mut self, from: &mut TaskContext, to: &TaskContext) {
        self.switches.push((from.cr3, to.cr3));
        self.save(from);
        self.restore(to);
    }

    fn prepare(&mut self, _ctx: &mut TaskContext) {
        self.prepared += 1;
    }
}

impl Hal for SimHal {
    fn interrupts_enabled(&self) -> bool {
        self.irq_enabled
    }

    fn disable_interrupts(&mut self) {
        self.irq_enabled = false;
    }

    fn enable_interrupts(&mut self) {
        self.irq_enabled = true;
    }

    fn set_page_dir(&mut self, root: PhysAddr) {
        self.page_dir = Some(root);
        self.page_dir_loads.push(root);
    }

    fn fault_address(&self) -> VirtAddr {
        self.fault_addr
    }

    fn ack_timer(&mut self) {
        self.timer_acks += 1;
    }

    fn halt(&mut self) -> ! {
        panic!("sim: halt");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_ops() {
        let mut hal = SimHal::new(0x4000);
        hal.write(PhysAddr(0x1000), b"abcd");
        hal.copy(PhysAddr(0x2002), PhysAddr(0x1000), 4);
        let mut b = [0u8; 4];
        hal.read(PhysAddr(0x2002), &mut b);
        assert_eq!(&b, b"abcd");

        hal.fill(PhysAddr(0x2002), 0, 2);
        assert_eq!(hal.read_u32(PhysAddr(0x2002)), u32::from_le_bytes(*b"\0\0cd"));
        hal.write_u32(PhysAddr(0x3000), 0x1234_5678);
        assert_eq!(hal.read_u32(PhysAddr(0x3000)), 0x1234_5678);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_access_panics() {
        let hal = SimHal::new(0x1000);
        let mut b = [0u8; 8];
        hal.read(PhysAddr(0xFFC), &mut b);
    }
}
