/// Guest byte order used to assemble multi-byte loads and stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// Assembles up to 8 bytes into a zero-extended value.
    #[inline]
    pub fn load(self, bytes: &[u8]) -> u64 {
        debug_assert!(bytes.len() <= 8, "load of {} bytes", bytes.len());
        match self {
            ByteOrder::Little => bytes
                .iter()
                .rev()
                .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
            ByteOrder::Big => bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
        }
    }

    /// Writes the low `dst.len()` bytes of `value` into `dst`.
    #[inline]
    pub fn store(self, value: u64, dst: &mut [u8]) {
        debug_assert!(dst.len() <= 8, "store of {} bytes", dst.len());
        let len = dst.len();
        for (i, b) in dst.iter_mut().enumerate() {
            let shift = match self {
                ByteOrder::Little => i * 8,
                ByteOrder::Big => (len - 1 - i) * 8,
            };
            *b = (value >> shift) as u8;
        }
    }
}
