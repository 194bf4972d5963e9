//! Run-length compressed fixup tables. Adjacent pointer-sized rebases
//! collapse into contiguous runs, strided runs of equal shape collapse
//! into repeats, and binds merge when the same target repeats at a
//! constant stride.

use crate::closure::ResolvedSymbolTarget;
use crate::diagnostics::LoadError;

/// `{ repeat_count:20, contig_count:8, skip_count:4 }` over a running
/// cursor. `contig_count == 0` turns the record into a cursor
/// instruction: all-zero resets to the image start, otherwise the cursor
/// advances `repeat_count * skip_count` pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebasePattern {
    pub repeat_count: u32,
    pub contig_count: u8,
    pub skip_count: u8,
}

pub const REBASE_PATTERN_RESET: RebasePattern =
    RebasePattern { repeat_count: 0, contig_count: 0, skip_count: 0 };

const REBASE_MAX_REPEAT: u32 = (1 << 20) - 1;
const REBASE_MAX_SKIP: u8 = 15;

impl RebasePattern {
    pub fn to_raw(&self) -> u32 {
        (self.repeat_count & REBASE_MAX_REPEAT)
            | ((self.contig_count as u32) << 20)
            | (((self.skip_count & REBASE_MAX_SKIP) as u32) << 28)
    }

    pub fn from_raw(raw: u32) -> Self {
        Self {
            repeat_count: raw & REBASE_MAX_REPEAT,
            contig_count: ((raw >> 20) & 0xff) as u8,
            skip_count: ((raw >> 28) & 0xf) as u8,
        }
    }
}

/// Emits the same target at `start_vm_offset`, then every
/// `(1 + skip_count)` pointers, `repeat_count` times in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindPattern {
    pub target: ResolvedSymbolTarget,
    pub start_vm_offset: u64, // 40 bits
    pub skip_count: u8,
    pub repeat_count: u16,
}

impl BindPattern {
    pub fn to_raw(&self) -> (u64, u64) {
        let packed = (self.start_vm_offset & 0xFF_FFFF_FFFF)
            | ((self.skip_count as u64) << 40)
            | ((self.repeat_count as u64) << 48);
        (self.target.to_raw(), packed)
    }

    pub fn from_raw(target: u64, packed: u64) -> Self {
        Self {
            target: ResolvedSymbolTarget::from_raw(target),
            start_vm_offset: packed & 0xFF_FFFF_FFFF,
            skip_count: ((packed >> 40) & 0xff) as u8,
            repeat_count: ((packed >> 48) & 0xffff) as u16,
        }
    }
}

/// Like [`BindPattern`] but for i386 text relocations, which patch
/// `__TEXT` and therefore carry 32-bit offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextFixupPattern {
    pub target: ResolvedSymbolTarget,
    pub start_vm_offset: u32,
    pub repeat_count: u16,
    pub skip_count: u16,
}

/// Compresses rebase locations (image vm offsets, in opcode-stream
/// order) into patterns. Locations must be pointer aligned; streams that
/// move backwards get a reset record, preserving old binaries whose
/// rebases are not monotonic.
pub fn compress_rebases(offsets: &[u64], ptr_size: u64) -> Result<Vec<RebasePattern>, LoadError> {
    let mut out = Vec::new();
    let mut cursor: u64 = 0;
    let mut i = 0usize;

    while i < offsets.len() {
        let offset = offsets[i];
        if offset % ptr_size != 0 {
            return Err(LoadError::malformed(
                "rebase patterns",
                "rebase location not pointer aligned",
            ));
        }
        if offset < cursor {
            out.push(REBASE_PATTERN_RESET);
            cursor = 0;
        }
        if offset > cursor {
            emit_advance(&mut out, (offset - cursor) / ptr_size);
            cursor = offset;
        }

        // measure the contiguous run at the cursor
        let contig = run_length(&offsets[i..], cursor, ptr_size).min(255);
        // try to find repeats of the same run shape at a fixed stride
        let run_bytes = contig as u64 * ptr_size;
        let mut repeat = 1u32;
        let mut skip = 0u8;
        let mut consumed = contig;
        if let Some(&next_start) = offsets.get(i + contig) {
            if next_start > cursor + run_bytes {
                let gap = next_start - (cursor + run_bytes);
                if gap % ptr_size == 0 && gap / ptr_size <= REBASE_MAX_SKIP as u64 {
                    skip = (gap / ptr_size) as u8;
                }
            }
            if skip > 0 || next_start == cursor + run_bytes {
                let stride = run_bytes + skip as u64 * ptr_size;
                loop {
                    let group_start = cursor + repeat as u64 * stride;
                    let next = &offsets[i + consumed..];
                    if repeat as u64 >= REBASE_MAX_REPEAT as u64 {
                        break;
                    }
                    if run_length(next, group_start, ptr_size) < contig {
                        break;
                    }
                    // the group after this one must start on the stride
                    repeat += 1;
                    consumed += contig;
                    let after = offsets.get(i + consumed);
                    let expected_next = cursor + repeat as u64 * stride;
                    if skip == 0 {
                        break; // pure contiguous run, already consumed below
                    }
                    if after != Some(&expected_next) {
                        break;
                    }
                }
            }
        }

        if skip == 0 {
            // plain contiguous run
            out.push(RebasePattern {
                repeat_count: 1,
                contig_count: contig as u8,
                skip_count: 0,
            });
            cursor += contig as u64 * ptr_size;
            i += contig;
        } else {
            out.push(RebasePattern {
                repeat_count: repeat,
                contig_count: contig as u8,
                skip_count: skip,
            });
            cursor += repeat as u64 * (run_bytes + skip as u64 * ptr_size);
            i += consumed;
        }
    }
    Ok(out)
}

/// Length of the contiguous pointer run in `offsets` starting at `start`.
fn run_length(offsets: &[u64], start: u64, ptr_size: u64) -> usize {
    let mut n = 0usize;
    while let Some(&o) = offsets.get(n) {
        if o != start + n as u64 * ptr_size {
            break;
        }
        n += 1;
    }
    n
}

fn emit_advance(out: &mut Vec<RebasePattern>, mut pointers: u64) {
    while pointers > 0 {
        if pointers <= REBASE_MAX_REPEAT as u64 {
            out.push(RebasePattern {
                repeat_count: pointers as u32,
                contig_count: 0,
                skip_count: 1,
            });
            break;
        }
        let repeat = (pointers / REBASE_MAX_SKIP as u64).min(REBASE_MAX_REPEAT as u64);
        out.push(RebasePattern {
            repeat_count: repeat as u32,
            contig_count: 0,
            skip_count: REBASE_MAX_SKIP,
        });
        pointers -= repeat * REBASE_MAX_SKIP as u64;
    }
}

/// Expands patterns back into vm offsets, mirroring the cursor semantics
/// of [`compress_rebases`].
pub fn for_each_rebase_offset(
    patterns: &[RebasePattern],
    ptr_size: u64,
    f: &mut impl FnMut(u64),
) {
    let mut cursor: u64 = 0;
    for p in patterns {
        if p.contig_count == 0 {
            if p.repeat_count == 0 && p.skip_count == 0 {
                cursor = 0;
            } else {
                cursor += p.repeat_count as u64 * p.skip_count as u64 * ptr_size;
            }
            continue;
        }
        for _ in 0..p.repeat_count {
            for _ in 0..p.contig_count {
                f(cursor);
                cursor += ptr_size;
            }
            cursor += p.skip_count as u64 * ptr_size;
        }
    }
}

/// One resolved bind location prior to compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindFixup {
    pub vm_offset: u64,
    pub target: ResolvedSymbolTarget,
}

pub fn compress_binds(fixups: &[BindFixup], ptr_size: u64) -> Result<Vec<BindPattern>, LoadError> {
    let mut out: Vec<BindPattern> = Vec::new();
    for fx in fixups {
        if fx.vm_offset >= 1u64 << 40 {
            return Err(LoadError::malformed(
                "bind patterns",
                "bind location beyond 1TB image offset",
            ));
        }
        if let Some(last) = out.last_mut() {
            let stride = (1 + last.skip_count as u64) * ptr_size;
            let next = last.start_vm_offset + last.repeat_count as u64 * stride;
            if last.target == fx.target && last.repeat_count < u16::MAX {
                if fx.vm_offset == next {
                    last.repeat_count += 1;
                    continue;
                }
                // a second location fixes the stride of a fresh run
                if last.repeat_count == 1 && fx.vm_offset > last.start_vm_offset {
                    let gap = fx.vm_offset - last.start_vm_offset;
                    if gap % ptr_size == 0 && (gap / ptr_size - 1) <= u8::MAX as u64 {
                        last.skip_count = (gap / ptr_size - 1) as u8;
                        last.repeat_count = 2;
                        continue;
                    }
                }
            }
        }
        out.push(BindPattern {
            target: fx.target,
            start_vm_offset: fx.vm_offset,
            skip_count: 0,
            repeat_count: 1,
        });
    }
    Ok(out)
}

pub fn for_each_bind_location(
    patterns: &[BindPattern],
    ptr_size: u64,
    f: &mut impl FnMut(u64, ResolvedSymbolTarget),
) {
    for p in patterns {
        let stride = (1 + p.skip_count as u64) * ptr_size;
        for i in 0..p.repeat_count as u64 {
            f(p.start_vm_offset + i * stride, p.target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(offsets: &[u64], ptr_size: u64) -> Vec<u64> {
        let patterns = compress_rebases(offsets, ptr_size).unwrap();
        let mut out = Vec::new();
        for_each_rebase_offset(&patterns, ptr_size, &mut |o| out.push(o));
        out
    }

    #[test]
    fn contiguous_rebases_collapse() {
        let offsets = [0x1000, 0x1008, 0x1010, 0x1018];
        let patterns = compress_rebases(&offsets, 8).unwrap();
        // one advance + one contiguous run
        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[1].contig_count, 4);
        assert_eq!(roundtrip(&offsets, 8), offsets);
    }

    #[test]
    fn strided_rebases_collapse() {
        // pairs separated by one skipped pointer
        let offsets = [0x0, 0x8, 0x18, 0x20, 0x30, 0x38];
        let patterns = compress_rebases(&offsets, 8).unwrap();
        assert_eq!(roundtrip(&offsets, 8), offsets);
        assert!(patterns.iter().any(|p| p.repeat_count >= 2 && p.skip_count == 1));
    }

    #[test]
    fn non_monotonic_rebases_reset() {
        let offsets = [0x100, 0x108, 0x10, 0x18];
        let patterns = compress_rebases(&offsets, 8).unwrap();
        assert!(patterns.contains(&REBASE_PATTERN_RESET));
        assert_eq!(roundtrip(&offsets, 8), offsets);
    }

    #[test]
    fn unaligned_rebase_rejected() {
        assert!(compress_rebases(&[0x1001], 8).is_err());
    }

    #[test]
    fn raw_rebase_roundtrip() {
        let p = RebasePattern { repeat_count: 0x7_1234, contig_count: 9, skip_count: 3 };
        assert_eq!(RebasePattern::from_raw(p.to_raw()), p);
    }

    #[test]
    fn binds_merge_at_constant_stride() {
        let target = ResolvedSymbolTarget::SharedCache { offset: 0x1234 };
        let fixups: Vec<_> = (0..4)
            .map(|i| BindFixup { vm_offset: 0x2000 + i * 16, target })
            .collect();
        let patterns = compress_binds(&fixups, 8).unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].repeat_count, 4);
        assert_eq!(patterns[0].skip_count, 1);

        let mut expanded = Vec::new();
        for_each_bind_location(&patterns, 8, &mut |off, t| expanded.push((off, t)));
        assert_eq!(
            expanded,
            fixups.iter().map(|f| (f.vm_offset, f.target)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn binds_with_different_targets_stay_separate() {
        let fixups = [
            BindFixup { vm_offset: 0, target: ResolvedSymbolTarget::SharedCache { offset: 1 } },
            BindFixup { vm_offset: 8, target: ResolvedSymbolTarget::SharedCache { offset: 2 } },
        ];
        let patterns = compress_binds(&fixups, 8).unwrap();
        assert_eq!(patterns.len(), 2);
    }

    #[test]
    fn bind_pattern_raw_roundtrip() {
        let p = BindPattern {
            target: ResolvedSymbolTarget::Image { image_num: 0x2001, offset: 0x4020 },
            start_vm_offset: 0x12_3456_7890,
            skip_count: 7,
            repeat_count: 0x1234,
        };
        let (t, packed) = p.to_raw();
        assert_eq!(BindPattern::from_raw(t, packed), p);
    }
}
