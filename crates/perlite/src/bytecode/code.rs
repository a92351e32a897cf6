//! The bytecode artifact.
//!
//! Private and in-memory only: a dense instruction stream plus its pools
//! and metadata. The format is not a stable interchange format and is never
//! persisted across process boundaries.

use std::sync::Arc;

use ahash::AHashMap;

use crate::function::CaptureSpec;
use crate::value::Scalar;

/// One exception-handler range.
///
/// Ranges are recorded innermost-first; the interpreter picks the first
/// entry covering the faulting instruction.
#[derive(Debug, Clone)]
pub struct ExceptionEntry {
    /// First covered bytecode offset.
    pub start: u32,
    /// One past the last covered offset.
    pub end: u32,
    /// Handler entry point.
    pub handler: u32,
    /// Register whose slot receives the error value, if the handler binds
    /// a catch variable.
    pub catch_reg: Option<u8>,
}

impl ExceptionEntry {
    /// Whether this entry covers the given instruction offset.
    #[must_use]
    pub fn covers(&self, pc: u32) -> bool {
        self.start <= pc && pc < self.end
    }
}

/// One source-location record: instructions from `offset` onward (until the
/// next record) originate from `line`.
#[derive(Debug, Clone, Copy)]
pub struct LocationEntry {
    /// Bytecode offset where this location takes effect.
    pub offset: u32,
    /// 1-based source line.
    pub line: u32,
}

/// An interpreter-compiled subroutine.
#[derive(Debug)]
pub struct Code {
    bytecode: Vec<u8>,
    strings: Vec<Arc<str>>,
    consts: Vec<Scalar>,
    max_regs: u16,
    captures: Vec<CaptureSpec>,
    lexical_map: AHashMap<Arc<str>, Arc<str>>,
    exception_table: Vec<ExceptionEntry>,
    locations: Vec<LocationEntry>,
    name: Arc<str>,
    file: Arc<str>,
}

impl Code {
    /// Assembles an artifact from its parts. Used by the builder only.
    #[expect(clippy::too_many_arguments, reason = "artifact header fields are set once, here")]
    #[must_use]
    pub(crate) fn new(
        bytecode: Vec<u8>,
        strings: Vec<Arc<str>>,
        consts: Vec<Scalar>,
        max_regs: u16,
        captures: Vec<CaptureSpec>,
        lexical_map: AHashMap<Arc<str>, Arc<str>>,
        exception_table: Vec<ExceptionEntry>,
        locations: Vec<LocationEntry>,
        name: Arc<str>,
        file: Arc<str>,
    ) -> Self {
        Self {
            bytecode,
            strings,
            consts,
            max_regs,
            captures,
            lexical_map,
            exception_table,
            locations,
            name,
            file,
        }
    }

    /// The raw instruction stream.
    #[must_use]
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    /// The string pool.
    #[must_use]
    pub fn strings(&self) -> &[Arc<str>] {
        &self.strings
    }

    /// A string-pool entry.
    #[must_use]
    pub fn string(&self, index: u16) -> &Arc<str> {
        &self.strings[index as usize]
    }

    /// The constant pool.
    #[must_use]
    pub fn consts(&self) -> &[Scalar] {
        &self.consts
    }

    /// A constant-pool entry.
    #[must_use]
    pub fn constant(&self, index: u16) -> &Scalar {
        &self.consts[index as usize]
    }

    /// Registers the frame must allocate.
    #[must_use]
    pub fn max_regs(&self) -> u16 {
        self.max_regs
    }

    /// Captured-variable bindings (metadata; the prologue performs the
    /// actual persistent-slot retrievals).
    #[must_use]
    pub fn captures(&self) -> &[CaptureSpec] {
        &self.captures
    }

    /// Bare lexical name → persistent-slot name, for lexicals visible to
    /// dynamic eval.
    #[must_use]
    pub fn lexical_map(&self) -> &AHashMap<Arc<str>, Arc<str>> {
        &self.lexical_map
    }

    /// The first exception entry covering `pc`, if any.
    #[must_use]
    pub fn handler_for(&self, pc: u32) -> Option<&ExceptionEntry> {
        self.exception_table.iter().find(|entry| entry.covers(pc))
    }

    /// The source line for an instruction offset, if location metadata was
    /// recorded.
    #[must_use]
    pub fn line_for(&self, pc: u32) -> Option<u32> {
        let index = self.locations.partition_point(|entry| entry.offset <= pc);
        index.checked_sub(1).map(|i| self.locations[i].line)
    }

    /// Subroutine name for diagnostics.
    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Source file name for diagnostics.
    #[must_use]
    pub fn file(&self) -> &Arc<str> {
        &self.file
    }
}
