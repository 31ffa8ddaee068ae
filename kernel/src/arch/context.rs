// kernel/src/arch/context.rs
//
// タスクの実行コンテキスト（TSS 相当のレジスタ一式）と、
// その保存・復元の抽象。
//
// 切替の実現方法（TSS ジャンプ / カーネルスタックの明示切替 / シミュレータの記録）
// は ContextSwitch の実装側が決める。呼び出し側は switch_to しか使わない。

/// 保存された実行コンテキスト
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskContext {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,

    pub cs: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    pub ss: u32,

    /// 特権レベル 0 のスタック（カーネルスタックの最上位）
    pub esp0: u32,
    pub ss0: u32,

    /// このタスクのページディレクトリ（物理アドレス）
    pub cr3: u32,

    /// カーネルスタック上で中断している位置（スタック切替方式でのみ使う）
    pub kernel_esp: u32,
}

impl TaskContext {
    pub const ZERO: TaskContext = TaskContext {
        eax: 0,
        ebx: 0,
        ecx: 0,
        edx: 0,
        esi: 0,
        edi: 0,
        ebp: 0,
        esp: 0,
        eip: 0,
        eflags: 0,
        cs: 0,
        ds: 0,
        es: 0,
        fs: 0,
        gs: 0,
        ss: 0,
        esp0: 0,
        ss0: 0,
        cr3: 0,
        kernel_esp: 0,
    };
}

/// 実行コンテキストの保存 / 復元
pub trait ContextSwitch {
    /// 現在の CPU 状態を ctx に書き出す
    fn save(&mut self, ctx: &mut TaskContext);

    /// ctx の状態で CPU を再開する
    fn restore(&mut self, ctx: &TaskContext);

    /// from を保存して to へ移る。
    ///
    /// 実機では to 側が再びスケジュールされるまで戻らない。
    /// 保存と復元を 1 命令で行う方式の実装はこれを上書きする。
    fn switch_to(&mut self, from: &mut TaskContext, to: &TaskContext) {
        self.save(from);
        self.restore(to);
    }

    /// 一度も走っていないタスクの初回起動用の状態を作る
    fn prepare(&mut self, ctx: &mut TaskContext) {
        let _ = ctx;
    }
}
