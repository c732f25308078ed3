use thiserror::Error;

/// Errors returned while laying out the guest physical address space.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("region base=0x{base:x} len=0x{len:x} is not aligned to the 0x{page_size:x}-byte page size")]
    Unaligned { base: u64, len: u64, page_size: u64 },

    #[error("empty region at 0x{base:x}")]
    Empty { base: u64 },

    #[error("region base=0x{base:x} len=0x{len:x} overflows the physical address space")]
    AddressOverflow { base: u64, len: u64 },

    #[error(
        "region 0x{base:x}..0x{end:x} overlaps existing {existing} region 0x{existing_base:x}..0x{existing_end:x}"
    )]
    Overlap {
        base: u64,
        end: u64,
        existing: &'static str,
        existing_base: u64,
        existing_end: u64,
    },

    #[error("RAM region of {pages} pages exceeds the host frame index space")]
    TooLarge { pages: u64 },
}
