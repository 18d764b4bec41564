mod common;

use std::collections::{BTreeMap, VecDeque};

use common::{ToyTarget, imm, jump_table_window, ops, reg, regs, toy_builder};
use mcinst::Inst;
use mcplus::{
    DEFAULT_ALLOCATOR, InstMatcher, InstructionIteratorMut, InstructionSource,
    InstructionSourceMut, McPlusBuilder,
    matcher::{match_any_operand, match_imm, match_reg, match_symbol},
};

#[test]
fn annotations_never_change_the_prime_operands() {
    let mcb = toy_builder();
    let r = regs(&mcb);
    let mut inst = Inst::with_operands(ops(&mcb).mov_rr, [reg(r.rax), reg(r.rbx)]);
    assert_eq!(inst.num_prime_operands(), 2);

    mcb.set_annotation_op_value(&mut inst, "offset", 0x1000);
    mcb.set_annotation_op_value(&mut inst, "jt", 0x2000);
    assert_eq!(mcb.get_annotation_op_value(&inst, "offset"), Some(0x1000));
    assert_eq!(mcb.get_annotation_op_value(&inst, "jt"), Some(0x2000));
    assert_eq!(inst.num_prime_operands(), 2);
    assert_eq!(inst.num_operands(), 5);

    mcb.strip_annotations(&mut inst, false);
    assert_eq!(mcb.get_annotation_op_value(&inst, "offset"), None);
    assert_eq!(mcb.get_annotation_op_value(&inst, "jt"), None);
    assert_eq!(inst.num_operands(), 2);
    assert_eq!(
        inst.fmt(Some(mcb.instr_info()), Some(mcb.reg_info())).to_string(),
        "MOV_RR %rax, %rbx"
    );
}

/// Walks the block backwards from every indirect jump and records the jump
/// table it dispatches through.
fn annotate_jump_tables(mcb: &McPlusBuilder<ToyTarget>, block: &mut [Inst]) -> usize {
    let mut found = 0;
    for end in 1..=block.len() {
        let window = &block[..end];
        if !mcb.is_indirect_branch(&window[end - 1]) {
            continue;
        }
        let mut m = mcb.match_ind_jmp(mcb.match_load(
            mcb.match_load_addr(match_symbol()),
            match_imm(),
            match_reg(),
            match_any_operand(),
        ));
        if m.matches(mcb, window, None) {
            m.annotate(mcb, &mut block[..end], "JumpTableCode");
            let r = regs(mcb);
            mcb.set_jump_table(&mut block[end - 1], 0x2000, r.rcx, DEFAULT_ALLOCATOR);
            found += 1;
        }
    }
    found
}

#[test]
fn jump_table_recovery_over_a_block() {
    let mcb = toy_builder();
    let mut block = jump_table_window(&mcb);
    block.insert(0, Inst::with_operands(ops(&mcb).mov_ri, [reg(regs(&mcb).rdi), imm(3)]));

    assert_eq!(annotate_jump_tables(&mcb, &mut block), 1);
    let jmp = block.last().unwrap();
    assert_eq!(mcb.get_jump_table(jmp), 0x2000);
    assert_eq!(mcb.get_jump_table_index_reg(jmp), regs(&mcb).rcx);

    let tagged = block
        .iter()
        .filter(|inst| mcb.has_annotation(*inst, "JumpTableCode"))
        .count();
    assert_eq!(tagged, 3);

    // The same walk works whatever container holds the instructions.
    let deque: VecDeque<Inst> = block.iter().cloned().collect();
    let map: BTreeMap<u32, Inst> = block
        .iter()
        .cloned()
        .enumerate()
        .map(|(i, inst)| (i as u32 * 4, inst))
        .collect();
    let count = |it: mcplus::InstructionRange<'_>| {
        it.filter(|inst| mcb.has_annotation(*inst, "JumpTableCode"))
            .count()
    };
    assert_eq!(count(block.instructions()), 3);
    assert_eq!(count(deque.instructions()), 3);
    assert_eq!(count(map.instructions()), 3);

    let last_from_map = map.instructions().next_back().unwrap();
    assert!(mcb.is_indirect_branch(last_from_map));
}

#[test]
fn printing_shows_annotations_after_the_instruction() {
    let mcb = toy_builder();
    let mut block = jump_table_window(&mcb);
    annotate_jump_tables(&mcb, &mut block);

    let jmp = &block[3];
    let line = format!(
        "{} {}",
        jmp.fmt(Some(mcb.instr_info()), Some(mcb.reg_info())),
        mcb.fmt_annotations(jmp)
    );
    assert_eq!(
        line,
        "JMP_REG %rax # JumpTableCode: true # JumpTable: 8192 # JTIndexReg: 10"
    );
}

/// Numbers the instructions by offset going forward, then marks the last
/// indirect branch walking backward from the end.
fn annotate_in_place(mcb: &McPlusBuilder<ToyTarget>, mut it: InstructionIteratorMut<'_>) {
    let mut offset = 0;
    while let Some(inst) = it.get_mut() {
        mcb.set_offset(inst, offset);
        offset += 4;
        it.advance();
    }

    loop {
        it.retreat();
        let inst = it.get_mut().unwrap();
        if mcb.is_indirect_branch(inst) {
            mcb.set_annotation_op_value(inst, "Dispatch", 1);
            break;
        }
    }
}

fn offsets<S: InstructionSource + ?Sized>(mcb: &McPlusBuilder<ToyTarget>, source: &S) -> Vec<u32> {
    source
        .instructions()
        .filter_map(|inst| mcb.get_offset(inst))
        .collect()
}

#[test]
fn passes_annotate_through_mutable_cursors() {
    let mcb = toy_builder();
    let mut block = jump_table_window(&mcb);
    block.push(Inst::with_operands(ops(&mcb).mov_ri, [reg(regs(&mcb).rdi), imm(0)]));
    let mut deque: VecDeque<Inst> = block.iter().cloned().collect();
    let mut map: BTreeMap<u32, Inst> = block
        .iter()
        .cloned()
        .enumerate()
        .map(|(i, inst)| (0x100 + i as u32 * 8, inst))
        .collect();

    annotate_in_place(&mcb, block.begin_mut());
    annotate_in_place(&mcb, deque.begin_mut());
    annotate_in_place(&mcb, map.begin_mut());

    let expected: [u32; 5] = [0, 4, 8, 12, 16];
    assert_eq!(offsets(&mcb, &block), expected);
    assert_eq!(offsets(&mcb, &deque), expected);
    assert_eq!(offsets(&mcb, &map), expected);

    assert!(mcb.has_annotation(&block[3], "Dispatch"));
    assert!(mcb.has_annotation(&deque[3], "Dispatch"));
    assert!(mcb.has_annotation(&map[&0x118], "Dispatch"));
    let dispatches = map
        .instructions()
        .filter(|inst| mcb.has_annotation(*inst, "Dispatch"))
        .count();
    assert_eq!(dispatches, 1);

    let mut it = map.end_mut();
    assert!(it.is_end());
    it.retreat();
    assert_eq!(mcb.get_offset(it.get().unwrap()), Some(16));
}
