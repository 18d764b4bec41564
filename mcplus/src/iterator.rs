//! Container-agnostic bidirectional cursor over instructions.
//!
//! Analyses walk instruction sequences that live in different containers:
//! the flat list of a basic block, a deque, or the offset-keyed map of a
//! function being disassembled. [`InstructionIterator`] hides which one is
//! behind it, so the same walking code serves all of them.
//! [`InstructionIteratorMut`] is the exclusive counterpart, used by passes
//! that annotate the instructions they walk over.
use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    ops::Bound,
};

use mcinst::Inst;

use crate::utils::error::{McPlusError, fatal};

/// Identity of a cursor position. Two cursors are equal when they point into
/// the same container at the same place.
///
/// Sequences are identified by address and length. Every empty sequence
/// shares the same dangling address, so cursors into two different empty
/// sequences compare equal; both can only be at the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorPosition {
    Seq { base: usize, len: usize, index: usize },
    Deque { base: usize, index: usize },
    Map { base: usize, key: Option<u32> },
}

trait Cursor<'a> {
    fn clone_box(&self) -> Box<dyn Cursor<'a> + 'a>;
    fn advance(&mut self);
    /// Step back; `false` when already at the first instruction.
    fn retreat(&mut self) -> bool;
    fn get(&self) -> Option<&'a Inst>;
    fn position(&self) -> CursorPosition;
}

#[derive(Clone)]
struct SliceCursor<'a> {
    slice: &'a [Inst],
    index: usize,
}

impl<'a> Cursor<'a> for SliceCursor<'a> {
    fn clone_box(&self) -> Box<dyn Cursor<'a> + 'a> {
        Box::new(self.clone())
    }

    fn advance(&mut self) {
        self.index = (self.index + 1).min(self.slice.len());
    }

    fn retreat(&mut self) -> bool {
        step_back(&mut self.index)
    }

    fn get(&self) -> Option<&'a Inst> {
        self.slice.get(self.index)
    }

    fn position(&self) -> CursorPosition {
        seq_position(self.slice, self.index)
    }
}

#[derive(Clone)]
struct DequeCursor<'a> {
    deque: &'a VecDeque<Inst>,
    index: usize,
}

impl<'a> Cursor<'a> for DequeCursor<'a> {
    fn clone_box(&self) -> Box<dyn Cursor<'a> + 'a> {
        Box::new(self.clone())
    }

    fn advance(&mut self) {
        self.index = (self.index + 1).min(self.deque.len());
    }

    fn retreat(&mut self) -> bool {
        step_back(&mut self.index)
    }

    fn get(&self) -> Option<&'a Inst> {
        self.deque.get(self.index)
    }

    fn position(&self) -> CursorPosition {
        deque_position(self.deque, self.index)
    }
}

/// Cursor over an offset-keyed map. `key == None` is the past-the-end
/// position.
#[derive(Clone)]
struct MapCursor<'a> {
    map: &'a BTreeMap<u32, Inst>,
    key: Option<u32>,
}

impl<'a> Cursor<'a> for MapCursor<'a> {
    fn clone_box(&self) -> Box<dyn Cursor<'a> + 'a> {
        Box::new(self.clone())
    }

    fn advance(&mut self) {
        self.key = next_key(self.map, self.key);
    }

    fn retreat(&mut self) -> bool {
        step_back_key(self.map, &mut self.key)
    }

    fn get(&self) -> Option<&'a Inst> {
        self.key.and_then(|key| self.map.get(&key))
    }

    fn position(&self) -> CursorPosition {
        map_position(self.map, self.key)
    }
}

fn step_back(index: &mut usize) -> bool {
    match index.checked_sub(1) {
        Some(prev) => {
            *index = prev;
            true
        }
        None => false,
    }
}

fn next_key(map: &BTreeMap<u32, Inst>, key: Option<u32>) -> Option<u32> {
    let key = key?;
    map.range((Bound::Excluded(key), Bound::Unbounded))
        .next()
        .map(|(key, _)| *key)
}

fn step_back_key(map: &BTreeMap<u32, Inst>, key: &mut Option<u32>) -> bool {
    let prev = match *key {
        Some(current) => map.range(..current).next_back(),
        None => map.iter().next_back(),
    };
    match prev {
        Some((prev, _)) => {
            *key = Some(*prev);
            true
        }
        None => false,
    }
}

fn seq_position(slice: &[Inst], index: usize) -> CursorPosition {
    CursorPosition::Seq {
        base: slice.as_ptr() as usize,
        len: slice.len(),
        index,
    }
}

fn deque_position(deque: &VecDeque<Inst>, index: usize) -> CursorPosition {
    CursorPosition::Deque {
        base: deque as *const VecDeque<Inst> as usize,
        index,
    }
}

fn map_position(map: &BTreeMap<u32, Inst>, key: Option<u32>) -> CursorPosition {
    CursorPosition::Map {
        base: map as *const BTreeMap<u32, Inst> as usize,
        key,
    }
}

/// Bidirectional cursor over instructions of any supported container.
pub struct InstructionIterator<'a> {
    cursor: Box<dyn Cursor<'a> + 'a>,
}

impl<'a> InstructionIterator<'a> {
    /// Cursor at `index` in `slice`; `index == slice.len()` is the end.
    pub fn from_slice(slice: &'a [Inst], index: usize) -> Self {
        Self {
            cursor: Box::new(SliceCursor {
                slice,
                index: index.min(slice.len()),
            }),
        }
    }

    pub fn from_deque(deque: &'a VecDeque<Inst>, index: usize) -> Self {
        Self {
            cursor: Box::new(DequeCursor {
                deque,
                index: index.min(deque.len()),
            }),
        }
    }

    /// Cursor at the instruction at `offset`, or at the end when `offset` is
    /// `None` or not in the map.
    pub fn from_map(map: &'a BTreeMap<u32, Inst>, offset: Option<u32>) -> Self {
        Self {
            cursor: Box::new(MapCursor {
                map,
                key: offset.filter(|key| map.contains_key(key)),
            }),
        }
    }

    /// Move to the next instruction. Advancing the end position is a no-op.
    pub fn advance(&mut self) -> &mut Self {
        self.cursor.advance();
        self
    }

    /// Move to the previous instruction.
    ///
    /// # Panics
    /// Retreating from the first instruction is a broken invariant.
    #[track_caller]
    pub fn retreat(&mut self) -> &mut Self {
        if !self.cursor.retreat() {
            fatal(McPlusError::IteratorUnderflow);
        }
        self
    }

    /// The current instruction, `None` at the end.
    pub fn get(&self) -> Option<&'a Inst> {
        self.cursor.get()
    }

    pub fn is_end(&self) -> bool {
        self.get().is_none()
    }
}

impl Clone for InstructionIterator<'_> {
    fn clone(&self) -> Self {
        Self {
            cursor: self.cursor.clone_box(),
        }
    }
}

impl PartialEq for InstructionIterator<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cursor.position() == other.cursor.position()
    }
}

impl Eq for InstructionIterator<'_> {}

impl fmt::Debug for InstructionIterator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InstructionIterator")
            .field(&self.cursor.position())
            .finish()
    }
}

/// The half-open range `[begin, end)` between two cursors, as a std iterator.
#[derive(Debug, Clone)]
pub struct InstructionRange<'a> {
    front: InstructionIterator<'a>,
    back: InstructionIterator<'a>,
}

impl<'a> InstructionRange<'a> {
    pub fn new(begin: InstructionIterator<'a>, end: InstructionIterator<'a>) -> Self {
        Self {
            front: begin,
            back: end,
        }
    }
}

impl<'a> Iterator for InstructionRange<'a> {
    type Item = &'a Inst;

    fn next(&mut self) -> Option<Self::Item> {
        if self.front == self.back {
            return None;
        }
        let inst = self.front.get();
        self.front.advance();
        inst
    }
}

impl DoubleEndedIterator for InstructionRange<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.front == self.back {
            return None;
        }
        self.back.retreat();
        self.back.get()
    }
}

/// Containers [`InstructionIterator`] can walk.
pub trait InstructionSource {
    fn begin(&self) -> InstructionIterator<'_>;
    fn end(&self) -> InstructionIterator<'_>;

    fn instructions(&self) -> InstructionRange<'_> {
        InstructionRange::new(self.begin(), self.end())
    }
}

impl InstructionSource for [Inst] {
    fn begin(&self) -> InstructionIterator<'_> {
        InstructionIterator::from_slice(self, 0)
    }

    fn end(&self) -> InstructionIterator<'_> {
        InstructionIterator::from_slice(self, self.len())
    }
}

impl InstructionSource for Vec<Inst> {
    fn begin(&self) -> InstructionIterator<'_> {
        self.as_slice().begin()
    }

    fn end(&self) -> InstructionIterator<'_> {
        self.as_slice().end()
    }
}

impl InstructionSource for VecDeque<Inst> {
    fn begin(&self) -> InstructionIterator<'_> {
        InstructionIterator::from_deque(self, 0)
    }

    fn end(&self) -> InstructionIterator<'_> {
        InstructionIterator::from_deque(self, self.len())
    }
}

impl InstructionSource for BTreeMap<u32, Inst> {
    fn begin(&self) -> InstructionIterator<'_> {
        InstructionIterator::from_map(self, self.keys().next().copied())
    }

    fn end(&self) -> InstructionIterator<'_> {
        InstructionIterator::from_map(self, None)
    }
}

/// Exclusive cursor. Unlike [`Cursor`] it cannot be cloned, and the
/// instruction it yields borrows the cursor.
trait CursorMut {
    fn advance(&mut self);
    fn retreat(&mut self) -> bool;
    fn get(&self) -> Option<&Inst>;
    fn get_mut(&mut self) -> Option<&mut Inst>;
    fn position(&self) -> CursorPosition;
}

struct SliceCursorMut<'a> {
    slice: &'a mut [Inst],
    index: usize,
}

impl CursorMut for SliceCursorMut<'_> {
    fn advance(&mut self) {
        self.index = (self.index + 1).min(self.slice.len());
    }

    fn retreat(&mut self) -> bool {
        step_back(&mut self.index)
    }

    fn get(&self) -> Option<&Inst> {
        self.slice.get(self.index)
    }

    fn get_mut(&mut self) -> Option<&mut Inst> {
        self.slice.get_mut(self.index)
    }

    fn position(&self) -> CursorPosition {
        seq_position(&*self.slice, self.index)
    }
}

struct DequeCursorMut<'a> {
    deque: &'a mut VecDeque<Inst>,
    index: usize,
}

impl CursorMut for DequeCursorMut<'_> {
    fn advance(&mut self) {
        self.index = (self.index + 1).min(self.deque.len());
    }

    fn retreat(&mut self) -> bool {
        step_back(&mut self.index)
    }

    fn get(&self) -> Option<&Inst> {
        self.deque.get(self.index)
    }

    fn get_mut(&mut self) -> Option<&mut Inst> {
        self.deque.get_mut(self.index)
    }

    fn position(&self) -> CursorPosition {
        deque_position(&*self.deque, self.index)
    }
}

struct MapCursorMut<'a> {
    map: &'a mut BTreeMap<u32, Inst>,
    key: Option<u32>,
}

impl CursorMut for MapCursorMut<'_> {
    fn advance(&mut self) {
        self.key = next_key(&*self.map, self.key);
    }

    fn retreat(&mut self) -> bool {
        step_back_key(&*self.map, &mut self.key)
    }

    fn get(&self) -> Option<&Inst> {
        self.key.and_then(|key| self.map.get(&key))
    }

    fn get_mut(&mut self) -> Option<&mut Inst> {
        self.key.and_then(|key| self.map.get_mut(&key))
    }

    fn position(&self) -> CursorPosition {
        map_position(&*self.map, self.key)
    }
}

/// Bidirectional cursor handing out mutable instructions.
///
/// Moves like [`InstructionIterator`]; positions compare the same way.
pub struct InstructionIteratorMut<'a> {
    cursor: Box<dyn CursorMut + 'a>,
}

impl<'a> InstructionIteratorMut<'a> {
    pub fn from_slice(slice: &'a mut [Inst], index: usize) -> Self {
        let index = index.min(slice.len());
        Self {
            cursor: Box::new(SliceCursorMut { slice, index }),
        }
    }

    pub fn from_deque(deque: &'a mut VecDeque<Inst>, index: usize) -> Self {
        let index = index.min(deque.len());
        Self {
            cursor: Box::new(DequeCursorMut { deque, index }),
        }
    }

    pub fn from_map(map: &'a mut BTreeMap<u32, Inst>, offset: Option<u32>) -> Self {
        let key = offset.filter(|key| map.contains_key(key));
        Self {
            cursor: Box::new(MapCursorMut { map, key }),
        }
    }

    pub fn advance(&mut self) -> &mut Self {
        self.cursor.advance();
        self
    }

    /// # Panics
    /// Retreating from the first instruction is a broken invariant.
    #[track_caller]
    pub fn retreat(&mut self) -> &mut Self {
        if !self.cursor.retreat() {
            fatal(McPlusError::IteratorUnderflow);
        }
        self
    }

    pub fn get(&self) -> Option<&Inst> {
        self.cursor.get()
    }

    pub fn get_mut(&mut self) -> Option<&mut Inst> {
        self.cursor.get_mut()
    }

    pub fn is_end(&self) -> bool {
        self.get().is_none()
    }
}

impl PartialEq for InstructionIteratorMut<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cursor.position() == other.cursor.position()
    }
}

impl Eq for InstructionIteratorMut<'_> {}

impl fmt::Debug for InstructionIteratorMut<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InstructionIteratorMut")
            .field(&self.cursor.position())
            .finish()
    }
}

/// Containers [`InstructionIteratorMut`] can walk.
pub trait InstructionSourceMut {
    fn begin_mut(&mut self) -> InstructionIteratorMut<'_>;
    fn end_mut(&mut self) -> InstructionIteratorMut<'_>;
}

impl InstructionSourceMut for [Inst] {
    fn begin_mut(&mut self) -> InstructionIteratorMut<'_> {
        InstructionIteratorMut::from_slice(self, 0)
    }

    fn end_mut(&mut self) -> InstructionIteratorMut<'_> {
        let len = self.len();
        InstructionIteratorMut::from_slice(self, len)
    }
}

impl InstructionSourceMut for Vec<Inst> {
    fn begin_mut(&mut self) -> InstructionIteratorMut<'_> {
        self.as_mut_slice().begin_mut()
    }

    fn end_mut(&mut self) -> InstructionIteratorMut<'_> {
        self.as_mut_slice().end_mut()
    }
}

impl InstructionSourceMut for VecDeque<Inst> {
    fn begin_mut(&mut self) -> InstructionIteratorMut<'_> {
        InstructionIteratorMut::from_deque(self, 0)
    }

    fn end_mut(&mut self) -> InstructionIteratorMut<'_> {
        let len = self.len();
        InstructionIteratorMut::from_deque(self, len)
    }
}

impl InstructionSourceMut for BTreeMap<u32, Inst> {
    fn begin_mut(&mut self) -> InstructionIteratorMut<'_> {
        let first = self.keys().next().copied();
        InstructionIteratorMut::from_map(self, first)
    }

    fn end_mut(&mut self) -> InstructionIteratorMut<'_> {
        InstructionIteratorMut::from_map(self, None)
    }
}
