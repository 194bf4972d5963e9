//! Decoders for the classic `LC_DYLD_INFO` rebase and bind opcode
//! streams. Each stream is a little state machine over ULEB-encoded
//! operands; decoding yields `(segment, offset, type)` tuples.

use std::ops::ControlFlow;

use crate::diagnostics::LoadError;
use crate::mach_o::analyzer::SliceInfo;
use crate::mach_o::leb::{read_sleb128, read_uleb128};

// usr/include/mach-o/loader.h, fixup types shared by rebase and bind
pub const REBASE_TYPE_POINTER: u8 = 1;
pub const REBASE_TYPE_TEXT_ABSOLUTE32: u8 = 2;
pub const REBASE_TYPE_TEXT_PCREL32: u8 = 3;

const REBASE_OPCODE_MASK: u8 = 0xF0;
const REBASE_IMMEDIATE_MASK: u8 = 0x0F;
const REBASE_OPCODE_DONE: u8 = 0x00;
const REBASE_OPCODE_SET_TYPE_IMM: u8 = 0x10;
const REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x20;
const REBASE_OPCODE_ADD_ADDR_ULEB: u8 = 0x30;
const REBASE_OPCODE_ADD_ADDR_IMM_SCALED: u8 = 0x40;
const REBASE_OPCODE_DO_REBASE_IMM_TIMES: u8 = 0x50;
const REBASE_OPCODE_DO_REBASE_ULEB_TIMES: u8 = 0x60;
const REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB: u8 = 0x70;
const REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB: u8 = 0x80;

const BIND_OPCODE_MASK: u8 = 0xF0;
const BIND_IMMEDIATE_MASK: u8 = 0x0F;
const BIND_OPCODE_DONE: u8 = 0x00;
const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
const BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB: u8 = 0x20;
const BIND_OPCODE_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
const BIND_OPCODE_SET_ADDEND_SLEB: u8 = 0x60;
const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
const BIND_OPCODE_ADD_ADDR_ULEB: u8 = 0x80;
const BIND_OPCODE_DO_BIND: u8 = 0x90;
const BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB: u8 = 0xA0;
const BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED: u8 = 0xB0;
const BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB: u8 = 0xC0;
const BIND_OPCODE_THREADED: u8 = 0xD0;

// Special library ordinals, sign-extended from the immediate
pub const BIND_SPECIAL_DYLIB_SELF: i64 = 0;
pub const BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE: i64 = -1;
pub const BIND_SPECIAL_DYLIB_FLAT_LOOKUP: i64 = -2;
pub const BIND_SPECIAL_DYLIB_WEAK_LOOKUP: i64 = -3;

pub const BIND_SYMBOL_FLAGS_WEAK_IMPORT: u8 = 0x1;
pub const BIND_SYMBOL_FLAGS_NON_WEAK_DEFINITION: u8 = 0x8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebaseLocation {
    pub segment_index: u32,
    pub segment_offset: u64,
    pub kind: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct BindLocation<'b> {
    pub segment_index: u32,
    pub segment_offset: u64,
    pub kind: u8,
    pub lib_ordinal: i64,
    pub symbol_name: &'b str,
    pub weak_import: bool,
    pub addend: i64,
    pub lazy: bool,
    /// Weak-bind stream entries with the non-weak-definition flag are
    /// markers ("this image has a strong def"), not fixups.
    pub strong_override: bool,
}

struct Cursor<'i> {
    info: &'i SliceInfo,
    segment_index: u32,
    segment_offset: u64,
}

impl Cursor<'_> {
    fn set(&mut self, seg: u32, offset: u64, site: &'static str) -> Result<(), LoadError> {
        if seg as usize >= self.info.segments.len() {
            return Err(LoadError::malformed(site, "segment index out of range"));
        }
        self.segment_index = seg;
        self.segment_offset = offset;
        Ok(())
    }

    fn advance(&mut self, delta: u64) {
        // deltas are encoded as two's-complement u64 so a "negative"
        // advance wraps correctly
        self.segment_offset = self.segment_offset.wrapping_add(delta);
    }

    fn check_bounds(&self, ptr_size: u64, site: &'static str) -> Result<(), LoadError> {
        let seg = &self.info.segments[self.segment_index as usize];
        if self.segment_offset.checked_add(ptr_size).is_none_or(|end| end > seg.vm_size) {
            return Err(LoadError::malformed(site, "fixup location outside segment"));
        }
        Ok(())
    }
}

/// Runs the rebase opcode state machine over `bytes`, reporting each
/// rebase location to `f` until the stream ends or `f` breaks.
pub fn for_each_rebase(
    bytes: &[u8],
    info: &SliceInfo,
    f: &mut impl FnMut(RebaseLocation) -> ControlFlow<()>,
) -> Result<ControlFlow<()>, LoadError> {
    const SITE: &str = "rebase opcodes";
    let ptr_size = info.pointer_size();
    let mut cursor = Cursor { info, segment_index: 0, segment_offset: 0 };
    let mut kind = REBASE_TYPE_POINTER;
    let mut offset = 0usize;

    let mut emit = |cursor: &Cursor<'_>, kind: u8| -> Result<ControlFlow<()>, LoadError> {
        cursor.check_bounds(ptr_size, SITE)?;
        Ok(f(RebaseLocation {
            segment_index: cursor.segment_index,
            segment_offset: cursor.segment_offset,
            kind,
        }))
    };

    while offset < bytes.len() {
        let byte = bytes[offset];
        offset += 1;
        let imm = byte & REBASE_IMMEDIATE_MASK;
        match byte & REBASE_OPCODE_MASK {
            REBASE_OPCODE_DONE => return Ok(ControlFlow::Continue(())),
            REBASE_OPCODE_SET_TYPE_IMM => {
                if !(1..=3).contains(&imm) {
                    return Err(LoadError::malformed(SITE, "unknown rebase type"));
                }
                kind = imm;
            }
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                let seg_offset = read_uleb128(bytes, &mut offset, SITE)?;
                cursor.set(imm as u32, seg_offset, SITE)?;
            }
            REBASE_OPCODE_ADD_ADDR_ULEB => {
                cursor.advance(read_uleb128(bytes, &mut offset, SITE)?);
            }
            REBASE_OPCODE_ADD_ADDR_IMM_SCALED => {
                cursor.advance(imm as u64 * ptr_size);
            }
            REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
                for _ in 0..imm {
                    if emit(&cursor, kind)?.is_break() {
                        return Ok(ControlFlow::Break(()));
                    }
                    cursor.advance(ptr_size);
                }
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES => {
                let count = read_uleb128(bytes, &mut offset, SITE)?;
                for _ in 0..count {
                    if emit(&cursor, kind)?.is_break() {
                        return Ok(ControlFlow::Break(()));
                    }
                    cursor.advance(ptr_size);
                }
            }
            REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB => {
                if emit(&cursor, kind)?.is_break() {
                    return Ok(ControlFlow::Break(()));
                }
                let extra = read_uleb128(bytes, &mut offset, SITE)?;
                cursor.advance(ptr_size.wrapping_add(extra));
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB => {
                let count = read_uleb128(bytes, &mut offset, SITE)?;
                let skip = read_uleb128(bytes, &mut offset, SITE)?;
                for _ in 0..count {
                    if emit(&cursor, kind)?.is_break() {
                        return Ok(ControlFlow::Break(()));
                    }
                    cursor.advance(ptr_size.wrapping_add(skip));
                }
            }
            _ => {
                return Err(LoadError::malformed(SITE, format!("bad opcode {byte:#04x}")));
            }
        }
    }
    Ok(ControlFlow::Continue(()))
}

/// Runs the bind opcode state machine. `lazy` streams place a DONE after
/// every entry, so DONE only terminates the non-lazy form.
pub fn for_each_bind<'b>(
    bytes: &'b [u8],
    info: &SliceInfo,
    lazy: bool,
    f: &mut impl FnMut(BindLocation<'b>) -> ControlFlow<()>,
) -> Result<ControlFlow<()>, LoadError> {
    const SITE: &str = "bind opcodes";
    let ptr_size = info.pointer_size();
    let mut cursor = Cursor { info, segment_index: 0, segment_offset: 0 };
    let mut kind = REBASE_TYPE_POINTER;
    let mut lib_ordinal: i64 = 0;
    let mut symbol_name: &'b str = "";
    let mut weak_import = false;
    let mut strong_override = false;
    let mut addend: i64 = 0;
    let mut offset = 0usize;

    let mut emit = |cursor: &Cursor<'_>,
                    kind: u8,
                    lib_ordinal: i64,
                    symbol_name: &'b str,
                    weak_import: bool,
                    strong_override: bool,
                    addend: i64|
     -> Result<ControlFlow<()>, LoadError> {
        if !strong_override {
            cursor.check_bounds(ptr_size, SITE)?;
        }
        if symbol_name.is_empty() && !strong_override {
            return Err(LoadError::malformed(SITE, "bind with no symbol name"));
        }
        Ok(f(BindLocation {
            segment_index: cursor.segment_index,
            segment_offset: cursor.segment_offset,
            kind,
            lib_ordinal,
            symbol_name,
            weak_import,
            addend,
            lazy,
            strong_override,
        }))
    };

    while offset < bytes.len() {
        let byte = bytes[offset];
        offset += 1;
        let imm = byte & BIND_IMMEDIATE_MASK;
        match byte & BIND_OPCODE_MASK {
            BIND_OPCODE_DONE => {
                if !lazy {
                    return Ok(ControlFlow::Continue(()));
                }
            }
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => lib_ordinal = imm as i64,
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                lib_ordinal = read_uleb128(bytes, &mut offset, SITE)? as i64;
            }
            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                // sign extend the 4-bit immediate
                lib_ordinal = if imm == 0 { 0 } else { (imm as i64) | !0xf };
            }
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                let tail = &bytes[offset..];
                let nul = tail
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or(LoadError::malformed(SITE, "symbol name not terminated"))?;
                symbol_name = std::str::from_utf8(&tail[..nul])
                    .map_err(|_| LoadError::malformed(SITE, "symbol name not utf-8"))?;
                offset += nul + 1;
                weak_import = imm & BIND_SYMBOL_FLAGS_WEAK_IMPORT != 0;
                strong_override = imm & BIND_SYMBOL_FLAGS_NON_WEAK_DEFINITION != 0;
            }
            BIND_OPCODE_SET_TYPE_IMM => {
                if !(1..=3).contains(&imm) {
                    return Err(LoadError::malformed(SITE, "unknown bind type"));
                }
                kind = imm;
            }
            BIND_OPCODE_SET_ADDEND_SLEB => {
                addend = read_sleb128(bytes, &mut offset, SITE)?;
            }
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                let seg_offset = read_uleb128(bytes, &mut offset, SITE)?;
                cursor.set(imm as u32, seg_offset, SITE)?;
            }
            BIND_OPCODE_ADD_ADDR_ULEB => {
                cursor.advance(read_uleb128(bytes, &mut offset, SITE)?);
            }
            BIND_OPCODE_DO_BIND => {
                if emit(&cursor, kind, lib_ordinal, symbol_name, weak_import, strong_override, addend)?
                    .is_break()
                {
                    return Ok(ControlFlow::Break(()));
                }
                cursor.advance(ptr_size);
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                if emit(&cursor, kind, lib_ordinal, symbol_name, weak_import, strong_override, addend)?
                    .is_break()
                {
                    return Ok(ControlFlow::Break(()));
                }
                let extra = read_uleb128(bytes, &mut offset, SITE)?;
                cursor.advance(ptr_size.wrapping_add(extra));
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                if emit(&cursor, kind, lib_ordinal, symbol_name, weak_import, strong_override, addend)?
                    .is_break()
                {
                    return Ok(ControlFlow::Break(()));
                }
                cursor.advance(ptr_size + imm as u64 * ptr_size);
            }
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                let count = read_uleb128(bytes, &mut offset, SITE)?;
                let skip = read_uleb128(bytes, &mut offset, SITE)?;
                for _ in 0..count {
                    if emit(
                        &cursor,
                        kind,
                        lib_ordinal,
                        symbol_name,
                        weak_import,
                        strong_override,
                        addend,
                    )?
                    .is_break()
                    {
                        return Ok(ControlFlow::Break(()));
                    }
                    cursor.advance(ptr_size.wrapping_add(skip));
                }
            }
            BIND_OPCODE_THREADED => {
                // Superseded by LC_DYLD_CHAINED_FIXUPS; binaries still
                // using the threaded form are not loadable here.
                return Err(LoadError::malformed(SITE, "threaded binds not supported"));
            }
            _ => {
                return Err(LoadError::malformed(SITE, format!("bad opcode {byte:#04x}")));
            }
        }
    }
    Ok(ControlFlow::Continue(()))
}
