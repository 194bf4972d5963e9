//! Code signature parsing: walk the embedded super-blob, pick the best
//! CodeDirectory, and compute the 20-byte cdHash the closure records.

use sha1::{Digest, Sha1};
use sha2::{Sha256, Sha384};

use crate::diagnostics::LoadError;
use crate::mach_o::analyzer::{LinkeditRange, SliceInfo};
use crate::mach_o::Platform;

// usr/include/kern/cs_blobs.h
const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;
const CSMAGIC_CODEDIRECTORY: u32 = 0xfade0c02;
const CSSLOT_CODEDIRECTORY: u32 = 0;
const CSSLOT_ALTERNATE_CODEDIRECTORIES: u32 = 0x1000;
const CSSLOT_ALTERNATE_CODEDIRECTORY_LIMIT: u32 = 0x1005;

pub const CS_HASHTYPE_SHA1: u8 = 1;
pub const CS_HASHTYPE_SHA256: u8 = 2;
pub const CS_HASHTYPE_SHA256_TRUNCATED: u8 = 3;
pub const CS_HASHTYPE_SHA384: u8 = 4;

const SITE: &str = "code signature";

/// The hash of the chosen CodeDirectory, truncated to the 20 bytes the
/// kernel tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CdHash {
    pub hash: [u8; 20],
    pub hash_type: u8,
}

/// Selection rank; the kernel prefers larger. watchOS pins to sha1 to
/// match its kernel.
fn rank(hash_type: u8, platform: Platform) -> u32 {
    if platform == Platform::WatchOS {
        return if hash_type == CS_HASHTYPE_SHA1 { 1 } else { 0 };
    }
    match hash_type {
        CS_HASHTYPE_SHA1 => 1,
        CS_HASHTYPE_SHA256_TRUNCATED => 2,
        CS_HASHTYPE_SHA256 => 3,
        CS_HASHTYPE_SHA384 => 4,
        _ => 0,
    }
}

fn read_be32(bytes: &[u8], offset: usize) -> Result<u32, LoadError> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(LoadError::malformed(SITE, "truncated blob"))
}

/// Computes the cdHash for a signed slice: locate the CodeDirectory in
/// the super-blob (best-ranked hash type wins), hash the directory blob
/// itself, take the first 20 bytes.
pub fn compute_cd_hash(
    data: &[u8],
    info: &SliceInfo,
    path: &str,
) -> Result<Option<CdHash>, LoadError> {
    let range = info.linkedit.code_signature;
    if range.is_empty() {
        return Ok(None);
    }
    let blob = signature_bytes(data, range, path)?;

    let magic = read_be32(blob, 0)?;
    if magic != CSMAGIC_EMBEDDED_SIGNATURE {
        return Err(LoadError::CodeSignatureInvalid {
            path: path.into(),
            reason: "not an embedded signature super-blob".into(),
        });
    }
    let count = read_be32(blob, 8)? as usize;
    if count > 64 {
        return Err(LoadError::CodeSignatureInvalid {
            path: path.into(),
            reason: "unreasonable blob count".into(),
        });
    }

    let mut best: Option<(u32, &[u8], u8)> = None;
    for i in 0..count {
        let slot = 12 + i * 8;
        let slot_type = read_be32(blob, slot)?;
        let offset = read_be32(blob, slot + 4)? as usize;
        let is_cd = slot_type == CSSLOT_CODEDIRECTORY
            || (CSSLOT_ALTERNATE_CODEDIRECTORIES..CSSLOT_ALTERNATE_CODEDIRECTORY_LIMIT)
                .contains(&slot_type);
        if !is_cd {
            continue;
        }
        if read_be32(blob, offset)? != CSMAGIC_CODEDIRECTORY {
            continue;
        }
        let length = read_be32(blob, offset + 4)? as usize;
        let cd = blob.get(offset..offset + length).ok_or(LoadError::CodeSignatureInvalid {
            path: path.into(),
            reason: "code directory extends past signature".into(),
        })?;
        // hashType is the second byte of the hashSize/hashType/platform/
        // pageSize quad at offset 36
        let hash_type = *cd.get(37).ok_or(LoadError::malformed(SITE, "truncated directory"))?;
        let r = rank(hash_type, info.platform);
        if r == 0 {
            continue;
        }
        if best.is_none_or(|(br, _, _)| r > br) {
            best = Some((r, cd, hash_type));
        }
    }

    let Some((_, cd, hash_type)) = best else {
        return Err(LoadError::CodeSignatureInvalid {
            path: path.into(),
            reason: "no usable code directory".into(),
        });
    };

    let mut hash = [0u8; 20];
    match hash_type {
        CS_HASHTYPE_SHA1 => {
            let digest = Sha1::digest(cd);
            hash.copy_from_slice(&digest);
        }
        CS_HASHTYPE_SHA256 | CS_HASHTYPE_SHA256_TRUNCATED => {
            let digest = Sha256::digest(cd);
            hash.copy_from_slice(&digest[..20]);
        }
        CS_HASHTYPE_SHA384 => {
            let digest = Sha384::digest(cd);
            hash.copy_from_slice(&digest[..20]);
        }
        _ => unreachable!("rank() filtered unknown hash types"),
    }
    Ok(Some(CdHash { hash, hash_type }))
}

fn signature_bytes<'d>(
    data: &'d [u8],
    range: LinkeditRange,
    path: &str,
) -> Result<&'d [u8], LoadError> {
    let start = range.file_offset as usize;
    data.get(start..start + range.size as usize)
        .ok_or(LoadError::CodeSignatureInvalid {
            path: path.into(),
            reason: "signature range outside file".into(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach_o::analyzer::LinkeditLayout;
    use crate::mach_o::{Arch, MachHeader, MH_DYLIB, MH_MAGIC_64};

    /// Assembles a super-blob with a single CodeDirectory of the given
    /// hash type.
    pub(crate) fn fake_signature(hash_type: u8) -> Vec<u8> {
        let mut cd = Vec::new();
        cd.extend(CSMAGIC_CODEDIRECTORY.to_be_bytes());
        let cd_len = 44u32;
        cd.extend(cd_len.to_be_bytes());
        cd.extend([0u8; 28]); // version..codeLimit
        cd.push(20); // hashSize
        cd.push(hash_type);
        cd.push(0); // platform
        cd.push(12); // pageSize log2
        cd.extend([0u8; 4]); // spare2
        assert_eq!(cd.len(), cd_len as usize);

        let mut blob = Vec::new();
        blob.extend(CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
        let total = 12 + 8 + cd.len();
        blob.extend((total as u32).to_be_bytes());
        blob.extend(1u32.to_be_bytes()); // count
        blob.extend(CSSLOT_CODEDIRECTORY.to_be_bytes());
        blob.extend(20u32.to_be_bytes()); // offset of cd
        blob.extend(&cd);
        blob
    }

    fn info_with_signature(sig_len: u32, platform: Platform) -> SliceInfo {
        SliceInfo {
            header: MachHeader {
                magic: MH_MAGIC_64,
                cpu_type: crate::mach_o::CPU_TYPE_X86_64,
                cpu_subtype: 3,
                file_type: MH_DYLIB,
                ncmds: 0,
                sizeofcmds: 0,
                flags: 0,
            },
            arch: Arch::X86_64,
            platform,
            sdk_version: 0,
            install_name: None,
            uuid: None,
            segments: vec![],
            sections: vec![],
            dependents: vec![],
            rpaths: vec![],
            linkedit: LinkeditLayout {
                code_signature: LinkeditRange { file_offset: 0, size: sig_len },
                ..Default::default()
            },
            entry: None,
            encryption: None,
            dylib_compat_version: None,
            dylib_current_version: None,
        }
    }

    #[test]
    fn sha256_hash_is_truncated_to_20() {
        let blob = fake_signature(CS_HASHTYPE_SHA256);
        let info = info_with_signature(blob.len() as u32, Platform::MacOS);
        let cd = compute_cd_hash(&blob, &info, "/t").unwrap().unwrap();
        assert_eq!(cd.hash_type, CS_HASHTYPE_SHA256);
        let full = Sha256::digest(&blob[20..]);
        assert_eq!(cd.hash, full[..20]);
    }

    #[test]
    fn watchos_only_accepts_sha1() {
        let blob = fake_signature(CS_HASHTYPE_SHA256);
        let info = info_with_signature(blob.len() as u32, Platform::WatchOS);
        assert!(matches!(
            compute_cd_hash(&blob, &info, "/t"),
            Err(LoadError::CodeSignatureInvalid { .. })
        ));

        let blob = fake_signature(CS_HASHTYPE_SHA1);
        let info = info_with_signature(blob.len() as u32, Platform::WatchOS);
        let cd = compute_cd_hash(&blob, &info, "/t").unwrap().unwrap();
        assert_eq!(cd.hash_type, CS_HASHTYPE_SHA1);
    }

    #[test]
    fn unsigned_image_has_no_cdhash() {
        let info = info_with_signature(0, Platform::MacOS);
        assert!(compute_cd_hash(&[], &info, "/t").unwrap().is_none());
    }
}
