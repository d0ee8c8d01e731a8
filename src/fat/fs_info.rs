use crate::Block;

/// The FAT32 FSInfo sector: hints for the free cluster count and where to
/// start looking for a free cluster. Neither value is trusted for
/// correctness.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsInfo {
    pub free_count: Option<u32>,
    pub next_free: Option<u32>,
}

impl FsInfo {
    const LEAD_SIGNATURE: u32 = 0x4161_5252;
    const STRUCT_SIGNATURE: u32 = 0x6141_7272;
    const TRAIL_SIGNATURE: u32 = 0xAA55_0000;
    const UNKNOWN: u32 = 0xFFFF_FFFF;

    /// Parse an FSInfo sector. `None` if any signature is missing.
    pub fn parse(block: &Block) -> Option<FsInfo> {
        let raw = FsInfoRaw::from_block(block.clone());
        if raw.lead_sig() != Self::LEAD_SIGNATURE
            || raw.struc_sig() != Self::STRUCT_SIGNATURE
            || raw.trail_sig() != Self::TRAIL_SIGNATURE
        {
            return None;
        }
        let known = |v| if v == Self::UNKNOWN { None } else { Some(v) };
        Some(FsInfo {
            free_count: known(raw.free_count()),
            next_free: known(raw.nxt_free()),
        })
    }

    /// Store the hints into an FSInfo sector, stamping the signatures.
    pub fn update(&self, block: &mut Block) {
        let mut raw = FsInfoRaw::from_block(block.clone());
        raw.set_lead_sig(Self::LEAD_SIGNATURE);
        raw.set_struc_sig(Self::STRUCT_SIGNATURE);
        raw.set_trail_sig(Self::TRAIL_SIGNATURE);
        raw.set_free_count(self.free_count.unwrap_or(Self::UNKNOWN));
        raw.set_nxt_free(self.next_free.unwrap_or(Self::UNKNOWN));
        *block = raw.block;
    }
}

struct FsInfoRaw {
    block: Block,
}

impl FsInfoRaw {
    fn from_block(block: Block) -> Self {
        FsInfoRaw { block }
    }

    fn data(&self) -> &[u8] {
        &self.block.contents
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.block.contents
    }

    define_field!(lead_sig, set_lead_sig, u32, 0);
    define_field!(struc_sig, set_struc_sig, u32, 484);
    define_field!(free_count, set_free_count, u32, 488);
    define_field!(nxt_free, set_nxt_free, u32, 492);
    define_field!(trail_sig, set_trail_sig, u32, 508);
}
