use std::sync::{Arc, atomic::AtomicU32};

use bit_set::BitSet;
use log::debug;
use mcinst::{Inst, InstrDesc, InstrInfo, PhysReg, RegisterInfo};

use crate::{
    aliases::RegisterAliasTable,
    allocator::{AllocatorId, AllocatorPool, AllocatorStats},
    annotation::{AnnotationRegistry, SymbolTable},
    matcher::BoxedMatcher,
    target::Target,
    utils::{
        conf::BuilderOptions,
        error::{McResult, OrFatal},
    },
};

/// Target-independent view of machine instructions.
///
/// A builder owns the annotation registry, the annotation allocators and the
/// register alias tables derived from the descriptor tables it was created
/// with. Target-specific behaviour is delegated to `T`.
///
/// The builder is meant to be shared by reference across the threads
/// analysing different functions, so every operation takes `&self`.
/// Allocator ids are expected to be confined to one thread each.
pub struct McPlusBuilder<T: Target> {
    target: T,
    info: Arc<InstrInfo>,
    regs: Arc<RegisterInfo>,
    aliases: RegisterAliasTable,
    pub(crate) registry: AnnotationRegistry,
    pub(crate) allocators: AllocatorPool,
    pub(crate) symbols: SymbolTable,
    pub(crate) label_counter: AtomicU32,
    options: BuilderOptions,
}

impl<T: Target> McPlusBuilder<T> {
    pub fn new(target: T, info: Arc<InstrInfo>, regs: Arc<RegisterInfo>) -> Self {
        Self::with_options(target, info, regs, BuilderOptions::default())
    }

    pub fn with_options(
        target: T,
        info: Arc<InstrInfo>,
        regs: Arc<RegisterInfo>,
        options: BuilderOptions,
    ) -> Self {
        let aliases = RegisterAliasTable::new(&regs);

        let registry = AnnotationRegistry::new();
        for name in &options.annotation_names {
            registry.index_or_create(name).or_fatal();
        }

        let allocators = AllocatorPool::new(options.arena_chunk_size);
        for _ in 0..options.preallocated_allocators {
            allocators.create().or_fatal();
        }

        debug!(
            "Created builder for target '{}' ({} opcodes, {} registers, {} annotation names)",
            target.name(),
            info.len(),
            regs.num_regs(),
            registry.len()
        );

        Self {
            target,
            info,
            regs,
            aliases,
            registry,
            allocators,
            symbols: SymbolTable::new(),
            label_counter: AtomicU32::new(0),
            options,
        }
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn instr_info(&self) -> &InstrInfo {
        &self.info
    }

    pub fn reg_info(&self) -> &RegisterInfo {
        &self.regs
    }

    pub fn options(&self) -> &BuilderOptions {
        &self.options
    }

    pub fn registry(&self) -> &AnnotationRegistry {
        &self.registry
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn alias_table(&self) -> &RegisterAliasTable {
        &self.aliases
    }

    /// Descriptor of the opcode of `inst`.
    pub fn desc(&self, inst: &Inst) -> &InstrDesc {
        self.info.desc_of(inst)
    }

    // Allocators

    /// Create a new annotation allocator and return its id.
    pub fn create_allocator(&self) -> AllocatorId {
        self.allocators.create().or_fatal()
    }

    pub fn allocator_exists(&self, id: AllocatorId) -> bool {
        self.allocators.exists(id)
    }

    /// Drop every value allocated in allocator `id`. Annotations still
    /// referring to them become stale.
    pub fn free_allocator_values(&self, id: AllocatorId) -> McResult<()> {
        self.allocators.free(id)
    }

    /// Drop the values of every allocator.
    ///
    /// # Panics
    /// If called from a closure running on one of the values.
    #[track_caller]
    pub fn free_annotations(&self) {
        self.allocators.free_all().or_fatal();
    }

    pub fn allocator_stats(&self, id: AllocatorId) -> Option<AllocatorStats> {
        self.allocators.stats(id)
    }

    // Register model

    pub fn get_aliases(&self, reg: PhysReg, only_smaller: bool) -> &BitSet {
        self.aliases.aliases(reg, only_smaller)
    }

    pub fn get_reg_size(&self, reg: PhysReg) -> u8 {
        self.aliases.reg_size(reg)
    }

    pub fn new_reg_set(&self) -> BitSet {
        self.aliases.new_reg_set()
    }

    // Classification passthroughs

    pub fn is_branch(&self, inst: &Inst) -> bool {
        self.target.is_branch(self, inst)
    }

    pub fn is_conditional_branch(&self, inst: &Inst) -> bool {
        self.target.is_conditional_branch(self, inst)
    }

    pub fn is_indirect_branch(&self, inst: &Inst) -> bool {
        self.target.is_indirect_branch(self, inst)
    }

    pub fn is_return(&self, inst: &Inst) -> bool {
        self.target.is_return(self, inst)
    }

    pub fn is_pseudo(&self, inst: &Inst) -> bool {
        self.target.is_pseudo(self, inst)
    }

    pub fn is_terminator(&self, inst: &Inst) -> bool {
        self.target.is_terminator(self, inst)
    }

    pub fn is_prefix(&self, inst: &Inst) -> bool {
        self.target.is_prefix(self, inst)
    }

    pub fn is_cfi(&self, inst: &Inst) -> bool {
        self.target.is_cfi(self, inst)
    }

    pub fn may_load(&self, inst: &Inst) -> bool {
        self.target.may_load(self, inst)
    }

    pub fn may_store(&self, inst: &Inst) -> bool {
        self.target.may_store(self, inst)
    }

    // Interior matchers

    pub fn match_ind_jmp(&self, target: BoxedMatcher<T>) -> BoxedMatcher<T> {
        self.target.match_ind_jmp(self, target)
    }

    pub fn match_ind_jmp_mem(
        &self,
        base: BoxedMatcher<T>,
        scale: BoxedMatcher<T>,
        index: BoxedMatcher<T>,
        offset: BoxedMatcher<T>,
    ) -> BoxedMatcher<T> {
        self.target.match_ind_jmp_mem(self, base, scale, index, offset)
    }

    pub fn match_add(&self, a: BoxedMatcher<T>, b: BoxedMatcher<T>) -> BoxedMatcher<T> {
        self.target.match_add(self, a, b)
    }

    pub fn match_load_addr(&self, target: BoxedMatcher<T>) -> BoxedMatcher<T> {
        self.target.match_load_addr(self, target)
    }

    pub fn match_load(
        &self,
        base: BoxedMatcher<T>,
        scale: BoxedMatcher<T>,
        index: BoxedMatcher<T>,
        offset: BoxedMatcher<T>,
    ) -> BoxedMatcher<T> {
        self.target.match_load(self, base, scale, index, offset)
    }
}

impl<T: Target> Drop for McPlusBuilder<T> {
    fn drop(&mut self) {
        debug!(
            "Releasing annotation values of {} allocators",
            self.allocators.len()
        );
        self.free_annotations();
    }
}
