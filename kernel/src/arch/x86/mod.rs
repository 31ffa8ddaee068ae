// kernel/src/arch/x86/mod.rs
//
// 役割:
// - 実機（i386, 保護モード＋ページング）向けの Hal 実装 X86Hal。
//
// やること:
// - 割り込みフラグ / CR3 / CR2 / PIC の EOI / hlt を命令で叩く。
// - 物理メモリは恒等マップされたカーネル領域越しに直接読み書きする。
// - タスク切替はカーネルスタックの付け替えで行い、TSS.esp0 を切替先に合わせる。
//
// やらないこと:
// - GDT / IDT / PIC / PIT の初期化と、割り込み入口のアセンブリ（ブート側の責務）。
//   ブート側は tss_addr() を GDT の TSS 記述子に載せ、ltr しておくこと。
//
// 初回起動の流れ:
// - prepare() がカーネルスタック上に「切替関数が pop する 4 レジスタ → 戻り先 mini32_first_entry →
//   pushad 形式の汎用レジスタ → gs/fs/es/ds → iretd フレーム」を積んでおく。
// - 最初の switch_to で mini32_first_entry に ret し、そこから iretd でタスクの入口へ入る。

pub mod cpu;

use core::arch::global_asm;

use spin::Mutex;

use crate::arch::{ContextSwitch, Hal, PhysMemory, TaskContext};
use crate::mem::addr::{PhysAddr, VirtAddr};

const PIC0_OCW2: u16 = 0x20;
const PIC_OCW2_EOI: u8 = 1 << 5;

/// 32bit TSS。使うのは esp0 / ss0 だけ。
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct Tss {
    pub link: u32,
    pub esp0: u32,
    pub ss0: u32,
    pub esp1: u32,
    pub ss1: u32,
    pub esp2: u32,
    pub ss2: u32,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u32,
    pub cs: u32,
    pub ss: u32,
    pub ds: u32,
    pub fs: u32,
    pub gs: u32,
    pub ldt: u32,
    pub iomap: u32,
}

static TSS: Mutex<Tss> = Mutex::new(Tss {
    link: 0,
    esp0: 0,
    ss0: 0,
    esp1: 0,
    ss1: 0,
    esp2: 0,
    ss2: 0,
    cr3: 0,
    eip: 0,
    eflags: 0,
    eax: 0,
    ecx: 0,
    edx: 0,
    ebx: 0,
    esp: 0,
    ebp: 0,
    esi: 0,
    edi: 0,
    es: 0,
    cs: 0,
    ss: 0,
    ds: 0,
    fs: 0,
    gs: 0,
    ldt: 0,
    // I/O 許可ビットマップなし
    iomap: (core::mem::size_of::<Tss>() as u32) << 16,
});

/// GDT の TSS 記述子に載せるアドレス
pub fn tss_addr() -> u32 {
    &*TSS.lock() as *const Tss as u32
}

global_asm!(
    ".global mini32_switch_stacks",
    "mini32_switch_stacks:",
    "    mov eax, [esp + 4]",
    "    mov edx, [esp + 8]",
    "    push edi",
    "    push esi",
    "    push ebx",
    "    push ebp",
    "    mov [eax], esp",
    "    mov esp, edx",
    "    pop ebp",
    "    pop ebx",
    "    pop esi",
    "    pop edi",
    "    ret",
    "",
    ".global mini32_first_entry",
    "mini32_first_entry:",
    "    popad",
    "    pop gs",
    "    pop fs",
    "    pop es",
    "    pop ds",
    "    iretd",
);

extern "C" {
    fn mini32_switch_stacks(from_esp: *mut u32, to_esp: u32);
    fn mini32_first_entry();
}

pub struct X86Hal {
    _private: (),
}

impl X86Hal {
    /// # Safety
    /// - 管理対象の物理メモリ全体がカーネル領域に恒等マップされていること。
    /// - 1 つのカーネルにつき 1 つだけ作ること。
    pub unsafe fn new() -> Self {
        X86Hal { _private: () }
    }

    fn load_esp0(&self, ctx: &TaskContext) {
        let mut tss = TSS.lock();
        tss.esp0 = ctx.esp0;
        tss.ss0 = ctx.ss0;
    }
}

impl PhysMemory for X86Hal {
    fn read(&self, addr: PhysAddr, buf: &mut [u8]) {
        unsafe { core::ptr::copy_nonoverlapping(addr.0 as *const u8, buf.as_mut_ptr(), buf.len()) }
    }

    fn write(&mut self, addr: PhysAddr, data: &[u8]) {
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), addr.0 as *mut u8, data.len()) }
    }

    fn fill(&mut self, addr: PhysAddr, value: u8, len: usize) {
        unsafe { core::ptr::write_bytes(addr.0 as *mut u8, value, len) }
    }

    fn copy(&mut self, dst: PhysAddr, src: PhysAddr, len: usize) {
        unsafe { core::ptr::copy(src.0 as *const u8, dst.0 as *mut u8, len) }
    }
}

impl ContextSwitch for X86Hal {
    // 汎用レジスタは切替関数がカーネルスタックに積む
    fn save(&mut self, _ctx: &mut TaskContext) {}

    fn restore(&mut self, ctx: &TaskContext) {
        self.load_esp0(ctx);
        unsafe { cpu::write_cr3(ctx.cr3) }
    }

    fn switch_to(&mut self, from: &mut TaskContext, to: &TaskContext) {
        self.restore(to);
        unsafe { mini32_switch_stacks(&mut from.kernel_esp, to.kernel_esp) }
    }

    fn prepare(&mut self, ctx: &mut TaskContext) {
        let frame: [u32; 22] = [
            // mini32_switch_stacks が pop する
            0, // ebp
            0, // ebx
            0, // esi
            0, // edi
            mini32_first_entry as usize as u32,
            // popad
            ctx.edi,
            ctx.esi,
            ctx.ebp,
            0,
            ctx.ebx,
            ctx.edx,
            ctx.ecx,
            ctx.eax,
            ctx.gs,
            ctx.fs,
            ctx.es,
            ctx.ds,
            // iretd
            ctx.eip,
            ctx.cs,
            ctx.eflags,
            ctx.esp,
            ctx.ss,
        ];

        let size = (frame.len() * 4) as u32;
        let base = ctx.esp0 - size;
        for (i, word) in frame.iter().enumerate() {
            self.write_u32(PhysAddr(base + i as u32 * 4), *word);
        }
        ctx.kernel_esp = base;
    }
}

impl Hal for X86Hal {
    fn interrupts_enabled(&self) -> bool {
        cpu::interrupts_enabled()
    }

    fn disable_interrupts(&mut self) {
        cpu::cli();
    }

    fn enable_interrupts(&mut self) {
        cpu::sti();
    }

    fn set_page_dir(&mut self, root: PhysAddr) {
        unsafe { cpu::write_cr3(root.0) }
    }

    fn fault_address(&self) -> VirtAddr {
        VirtAddr(cpu::read_cr2())
    }

    fn ack_timer(&mut self) {
        unsafe { cpu::outb(PIC0_OCW2, PIC_OCW2_EOI) }
    }

    fn halt(&mut self) -> ! {
        cpu::halt_loop()
    }
}
