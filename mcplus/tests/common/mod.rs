#![allow(dead_code)]

use std::sync::Arc;

use bit_set::BitSet;
use mcinst::{
    Expr, Inst, InstrDesc, InstrFlags, InstrInfo, NO_REGISTER, Opcode, Operand, PhysReg,
    RegisterInfo, Symbol,
};
use mcplus::{
    BoxedMatcher, BuilderOptions, BuiltinAnnotation, Capture, IndirectBranchInfo,
    IndirectBranchType, InstMatcher, InstPatternMatcher, McPlusBuilder, Target,
    matcher::{locate, match_imm_into, match_reg_into, match_symbol_into},
};

/// Registers of the toy target.
#[derive(Debug, Clone, Copy)]
pub struct Regs {
    pub rax: PhysReg,
    pub eax: PhysReg,
    pub ax: PhysReg,
    pub al: PhysReg,
    pub ah: PhysReg,
    pub rbx: PhysReg,
    pub ebx: PhysReg,
    pub bx: PhysReg,
    pub bl: PhysReg,
    pub rcx: PhysReg,
    pub ecx: PhysReg,
    pub cx: PhysReg,
    pub cl: PhysReg,
    pub rsp: PhysReg,
    pub esp: PhysReg,
    pub rdi: PhysReg,
    pub rsi: PhysReg,
    pub eflags: PhysReg,
}

/// Opcodes of the toy target.
///
/// Operand layouts:
/// - `MOV_RR dst, src`, `MOV_RI dst, imm`
/// - `ADD_RR dst, lhs, rhs` (writes eflags), `CMP_RR lhs, rhs`
/// - `LEA_SYM dst, sym`
/// - `LOAD dst, base, scale, index, disp`, `STORE base, scale, index, disp, src`
/// - `JMP sym`, `JCC sym, cond`, `JMP_REG reg`, `JMP_MEM base, scale, index, disp`
/// - `CALL sym`, `CALL_REG reg`, `RET`
#[derive(Debug, Clone, Copy)]
pub struct Ops {
    pub nop: Opcode,
    pub mov_rr: Opcode,
    pub mov_ri: Opcode,
    pub add_rr: Opcode,
    pub cmp_rr: Opcode,
    pub lea_sym: Opcode,
    pub load: Opcode,
    pub store: Opcode,
    pub jmp: Opcode,
    pub jcc: Opcode,
    pub jmp_reg: Opcode,
    pub jmp_mem: Opcode,
    pub call: Opcode,
    pub call_reg: Opcode,
    pub ret: Opcode,
    pub lock: Opcode,
    pub cfi: Opcode,
}

pub struct ToyTarget {
    pub regs: Regs,
    pub ops: Ops,
}

fn register_table() -> (RegisterInfo, Regs) {
    let mut info = RegisterInfo::new();
    let mut add = |name: &str, size: u8| info.add_register(name, size);
    let regs = Regs {
        rax: add("rax", 8),
        eax: add("eax", 4),
        ax: add("ax", 2),
        al: add("al", 1),
        ah: add("ah", 1),
        rbx: add("rbx", 8),
        ebx: add("ebx", 4),
        bx: add("bx", 2),
        bl: add("bl", 1),
        rcx: add("rcx", 8),
        ecx: add("ecx", 4),
        cx: add("cx", 2),
        cl: add("cl", 1),
        rsp: add("rsp", 8),
        esp: add("esp", 4),
        rdi: add("rdi", 8),
        rsi: add("rsi", 8),
        eflags: add("eflags", 4),
    };

    let relations = [
        (regs.rax, regs.eax),
        (regs.eax, regs.ax),
        (regs.ax, regs.al),
        (regs.ax, regs.ah),
        (regs.rbx, regs.ebx),
        (regs.ebx, regs.bx),
        (regs.bx, regs.bl),
        (regs.rcx, regs.ecx),
        (regs.ecx, regs.cx),
        (regs.cx, regs.cl),
        (regs.rsp, regs.esp),
    ];
    for (sup, sub) in relations {
        info.add_sub_register(sup, sub).unwrap();
    }
    (info, regs)
}

fn instruction_table(regs: &Regs) -> (InstrInfo, Ops) {
    use InstrFlags as F;

    let mut info = InstrInfo::new();
    let ops = Ops {
        nop: info.add(InstrDesc::new("NOP", 0, 0)),
        mov_rr: info.add(InstrDesc::new("MOV_RR", 2, 1)),
        mov_ri: info.add(InstrDesc::new("MOV_RI", 2, 1)),
        add_rr: info.add(InstrDesc::new("ADD_RR", 3, 1).with_implicit_defs([regs.eflags])),
        cmp_rr: info.add(InstrDesc::new("CMP_RR", 2, 0).with_implicit_defs([regs.eflags])),
        lea_sym: info.add(InstrDesc::new("LEA_SYM", 2, 1)),
        load: info.add(InstrDesc::new("LOAD", 5, 1).with_flags(F::MAY_LOAD)),
        store: info.add(InstrDesc::new("STORE", 5, 0).with_flags(F::MAY_STORE)),
        jmp: info.add(
            InstrDesc::new("JMP", 1, 0).with_flags(F::BRANCH | F::BARRIER | F::TERMINATOR),
        ),
        jcc: info.add(
            InstrDesc::new("JCC", 2, 0)
                .with_flags(F::BRANCH | F::CONDITIONAL_BRANCH | F::TERMINATOR)
                .with_implicit_uses([regs.eflags]),
        ),
        jmp_reg: info.add(InstrDesc::new("JMP_REG", 1, 0).with_flags(
            F::BRANCH | F::INDIRECT_BRANCH | F::BARRIER | F::TERMINATOR,
        )),
        jmp_mem: info.add(InstrDesc::new("JMP_MEM", 4, 0).with_flags(
            F::BRANCH | F::INDIRECT_BRANCH | F::BARRIER | F::TERMINATOR | F::MAY_LOAD,
        )),
        call: info.add(
            InstrDesc::new("CALL", 1, 0)
                .with_flags(F::CALL)
                .with_implicit_defs([regs.rsp])
                .with_implicit_uses([regs.rsp]),
        ),
        call_reg: info.add(
            InstrDesc::new("CALL_REG", 1, 0)
                .with_flags(F::CALL)
                .with_implicit_defs([regs.rsp])
                .with_implicit_uses([regs.rsp]),
        ),
        ret: info.add(
            InstrDesc::new("RET", 0, 0)
                .with_flags(F::RETURN | F::BARRIER | F::TERMINATOR)
                .with_implicit_uses([regs.rsp]),
        ),
        lock: info.add(InstrDesc::new("LOCK", 0, 0).with_flags(F::PREFIX)),
        cfi: info.add(
            InstrDesc::new("CFI_INSTRUCTION", 1, 0)
                .with_flags(F::CFI | F::PSEUDO)
                .with_implicit_defs([regs.rsp]),
        ),
    };
    (info, ops)
}

/// Builder over the toy target with default options.
pub fn toy_builder() -> McPlusBuilder<ToyTarget> {
    toy_builder_with(BuilderOptions::default())
}

pub fn toy_builder_with(options: BuilderOptions) -> McPlusBuilder<ToyTarget> {
    let (reg_info, regs) = register_table();
    let (instr_info, ops) = instruction_table(&regs);
    McPlusBuilder::with_options(
        ToyTarget { regs, ops },
        Arc::new(instr_info),
        Arc::new(reg_info),
        options,
    )
}

pub fn regs(mcb: &McPlusBuilder<ToyTarget>) -> Regs {
    mcb.target().regs
}

pub fn ops(mcb: &McPlusBuilder<ToyTarget>) -> Ops {
    mcb.target().ops
}

pub fn reg(r: PhysReg) -> Operand {
    Operand::Reg(r)
}

pub fn imm(value: i64) -> Operand {
    Operand::Imm(value)
}

pub fn sym(name: &str) -> Operand {
    Operand::Expr(Expr::symbol_ref(name))
}

pub fn reg_set(regs: &[PhysReg]) -> BitSet {
    regs.iter().map(|&r| r as usize).collect()
}

impl Target for ToyTarget {
    fn name(&self) -> &'static str {
        "toy"
    }

    fn is_prefix(&self, mcb: &McPlusBuilder<Self>, inst: &Inst) -> bool {
        mcb.desc(inst).is_prefix()
    }

    fn is_cfi(&self, mcb: &McPlusBuilder<Self>, inst: &Inst) -> bool {
        mcb.desc(inst).is_cfi()
    }

    fn get_instruction_size(&self, _mcb: &McPlusBuilder<Self>, inst: &Inst) -> Option<u32> {
        (inst.opcode() == self.ops.nop).then_some(1)
    }

    fn is_indirect_call(&self, _mcb: &McPlusBuilder<Self>, inst: &Inst) -> bool {
        inst.opcode() == self.ops.call_reg
    }

    fn is_conditional_move(&self, _mcb: &McPlusBuilder<Self>, _inst: &Inst) -> bool {
        false
    }

    fn is_noop(&self, _mcb: &McPlusBuilder<Self>, inst: &Inst) -> bool {
        inst.opcode() == self.ops.nop
    }

    fn get_target_symbol(
        &self,
        _mcb: &McPlusBuilder<Self>,
        inst: &Inst,
        op_num: usize,
    ) -> Option<Symbol> {
        inst.operand(op_num)?.expr()?.symbol().cloned()
    }

    fn get_target_addend(&self, _mcb: &McPlusBuilder<Self>, inst: &Inst, op_num: usize) -> i64 {
        inst.operand(op_num)
            .and_then(Operand::expr)
            .and_then(Expr::symbol_and_addend)
            .map_or(0, |(_, addend)| addend)
    }

    fn regs_used_as_params(&self, _mcb: &McPlusBuilder<Self>) -> BitSet {
        reg_set(&[self.regs.rdi, self.regs.rsi])
    }

    fn default_live_out(&self, _mcb: &McPlusBuilder<Self>) -> BitSet {
        reg_set(&[self.regs.rax, self.regs.rsp])
    }

    fn callee_saved_regs(&self, _mcb: &McPlusBuilder<Self>) -> BitSet {
        reg_set(&[self.regs.rbx, self.regs.rsp])
    }

    fn get_alias_sized(&self, mcb: &McPlusBuilder<Self>, reg: PhysReg, size: u8) -> PhysReg {
        mcb.get_aliases(reg, false)
            .iter()
            .map(|r| r as PhysReg)
            .find(|&r| mcb.get_reg_size(r) == size)
            .unwrap_or(NO_REGISTER)
    }

    fn create_noop(&self, _mcb: &McPlusBuilder<Self>) -> Inst {
        Inst::new(self.ops.nop)
    }

    fn create_uncond_branch(&self, _mcb: &McPlusBuilder<Self>, target: &Symbol) -> Inst {
        Inst::with_operands(self.ops.jmp, [Operand::Expr(Expr::SymbolRef(target.clone()))])
    }

    fn create_direct_call(&self, _mcb: &McPlusBuilder<Self>, target: &Symbol) -> Inst {
        Inst::with_operands(self.ops.call, [Operand::Expr(Expr::SymbolRef(target.clone()))])
    }

    fn convert_jmp_to_tail_call(&self, mcb: &McPlusBuilder<Self>, inst: &mut Inst) -> bool {
        if inst.opcode() != self.ops.jmp || mcb.is_tail_call(inst) {
            return false;
        }
        mcb.set_tail_call(inst);
        true
    }

    fn convert_tail_call_to_jmp(&self, mcb: &McPlusBuilder<Self>, inst: &mut Inst) -> bool {
        if !mcb.is_tail_call(inst) {
            return false;
        }
        mcb.remove_annotation(inst, BuiltinAnnotation::TailCall);
        mcb.unset_conditional_tail_call(inst);
        true
    }

    fn analyze_indirect_branch(
        &self,
        mcb: &McPlusBuilder<Self>,
        window: &[Inst],
        ptr_size: u8,
    ) -> (IndirectBranchType, IndirectBranchInfo) {
        let base = Capture::new();
        let scale = Capture::new();
        let index = Capture::new();
        let table = Capture::new();

        let mut through_mem = mcb.match_ind_jmp_mem(
            match_reg_into(base.clone()),
            match_imm_into(scale.clone()),
            match_reg_into(index.clone()),
            match_symbol_into(table.clone()),
        );
        let mut through_load = mcb.match_ind_jmp(mcb.match_load(
            match_reg_into(base.clone()),
            match_imm_into(scale.clone()),
            match_reg_into(index.clone()),
            match_symbol_into(table.clone()),
        ));

        let mem_location = if through_mem.matches(mcb, window, None) {
            window.len().checked_sub(1)
        } else if through_load.matches(mcb, window, None) {
            locate(mcb, window, Some(0))
        } else {
            let last_is_jmp_reg = window
                .last()
                .is_some_and(|inst| inst.opcode() == self.ops.jmp_reg);
            let kind = if last_is_jmp_reg {
                IndirectBranchType::PossibleTailCall
            } else {
                IndirectBranchType::Unknown
            };
            return (kind, IndirectBranchInfo::default());
        };

        let info = IndirectBranchInfo {
            base_reg: base.get().filter(|&r| r != NO_REGISTER),
            scale: scale.get().unwrap_or(1),
            index_reg: index.get().filter(|&r| r != NO_REGISTER),
            displacement: 0,
            displacement_symbol: table.get(),
            mem_location,
        };
        let kind = if info.scale == ptr_size as i64 && info.displacement_symbol.is_some() {
            IndirectBranchType::PossibleJumpTable
        } else {
            IndirectBranchType::PossibleFixedBranch
        };
        (kind, info)
    }

    fn match_ind_jmp(&self, _mcb: &McPlusBuilder<Self>, target: BoxedMatcher<Self>) -> BoxedMatcher<Self> {
        InstPatternMatcher::opcode([self.ops.jmp_reg])
            .operand(0, target)
            .boxed()
    }

    fn match_ind_jmp_mem(
        &self,
        _mcb: &McPlusBuilder<Self>,
        base: BoxedMatcher<Self>,
        scale: BoxedMatcher<Self>,
        index: BoxedMatcher<Self>,
        offset: BoxedMatcher<Self>,
    ) -> BoxedMatcher<Self> {
        InstPatternMatcher::opcode([self.ops.jmp_mem])
            .operand(0, base)
            .operand(1, scale)
            .operand(2, index)
            .operand(3, offset)
            .boxed()
    }

    fn match_add(
        &self,
        _mcb: &McPlusBuilder<Self>,
        a: BoxedMatcher<Self>,
        b: BoxedMatcher<Self>,
    ) -> BoxedMatcher<Self> {
        InstPatternMatcher::opcode([self.ops.add_rr])
            .operand(1, a)
            .operand(2, b)
            .commutative(1, 2)
            .boxed()
    }

    fn match_load_addr(&self, _mcb: &McPlusBuilder<Self>, target: BoxedMatcher<Self>) -> BoxedMatcher<Self> {
        InstPatternMatcher::opcode([self.ops.lea_sym])
            .operand(1, target)
            .boxed()
    }

    fn match_load(
        &self,
        _mcb: &McPlusBuilder<Self>,
        base: BoxedMatcher<Self>,
        scale: BoxedMatcher<Self>,
        index: BoxedMatcher<Self>,
        offset: BoxedMatcher<Self>,
    ) -> BoxedMatcher<Self> {
        InstPatternMatcher::opcode([self.ops.load])
            .operand(1, base)
            .operand(2, scale)
            .operand(3, index)
            .operand(4, offset)
            .boxed()
    }
}

/// `LEA rbx, jt.0; MOV rcx, rdi; LOAD rax, [rbx + 8 * rcx]; JMP_REG rax`
pub fn jump_table_window(mcb: &McPlusBuilder<ToyTarget>) -> Vec<Inst> {
    let r = regs(mcb);
    let o = ops(mcb);
    vec![
        Inst::with_operands(o.lea_sym, [reg(r.rbx), sym("jt.0")]),
        Inst::with_operands(o.mov_rr, [reg(r.rcx), reg(r.rdi)]),
        Inst::with_operands(
            o.load,
            [reg(r.rax), reg(r.rbx), imm(8), reg(r.rcx), imm(0)],
        ),
        Inst::with_operands(o.jmp_reg, [reg(r.rax)]),
    ]
}

/// Assert that `set` holds exactly `expected`, in any order.
#[track_caller]
pub fn assert_regs(set: &BitSet, expected: &[PhysReg]) {
    let mut expected: Vec<usize> = expected.iter().map(|&r| r as usize).collect();
    expected.sort_unstable();
    expected.dedup();
    assert_eq!(set.iter().collect::<Vec<_>>(), expected);
}
