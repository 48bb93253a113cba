//! Minimal self-relative security-descriptor constant used when a caller
//! adds a file without one (spec.md §4.4 `AddFile`). The core never
//! interprets SD bytes beyond storing/returning them; this single
//! constant is the one case it needs to construct bytes itself.

/// A self-relative `SECURITY_DESCRIPTOR` with owner and group set to the
/// well-known Local System SID (`S-1-5-18`) and an empty, present DACL
/// (`NULL DACL` — grants everyone access, which is what an under-
/// specified container layer file gets on real Windows too). No SACL.
///
/// Layout (all little-endian):
/// revision(1) control(2, u16 LE) owner_offset(4) group_offset(4)
/// sacl_offset(4, 0) dacl_offset(4) then owner SID, group SID, ACL.
pub fn null_dacl_sd() -> Vec<u8> {
    const SE_DACL_PRESENT: u16 = 0x0004;
    const SE_SELF_RELATIVE: u16 = 0x8000;

    // S-1-5-18: revision 1, 1 sub-authority, identifier authority 5, sub-authority 18.
    let system_sid: [u8; 12] = [
        1, 1, 0, 0, 0, 0, 0, 5, 18, 0, 0, 0,
    ];

    let header_len = 20u32;
    let owner_offset = header_len;
    let group_offset = owner_offset + system_sid.len() as u32;
    let dacl_offset = group_offset + system_sid.len() as u32;

    let mut out = Vec::with_capacity(dacl_offset as usize + 8);
    out.push(1); // revision
    out.push(0); // sbz1
    out.extend_from_slice(&(SE_DACL_PRESENT | SE_SELF_RELATIVE).to_le_bytes());
    out.extend_from_slice(&owner_offset.to_le_bytes());
    out.extend_from_slice(&group_offset.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // sacl_offset
    out.extend_from_slice(&dacl_offset.to_le_bytes());
    out.extend_from_slice(&system_sid);
    out.extend_from_slice(&system_sid);
    // Empty ACL: revision(1) sbz1(1) acl_size(2)=8 ace_count(2)=0 sbz2(2)
    out.push(2);
    out.push(0);
    out.extend_from_slice(&8u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_self_relative_header() {
        let sd = null_dacl_sd();
        assert_eq!(sd[0], 1);
        assert_eq!(u16::from_le_bytes([sd[2], sd[3]]) & 0x8000, 0x8000);
        assert!(!sd.is_empty());
    }
}
