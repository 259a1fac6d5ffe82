//! 8.3 short file names.

/// An 8.3 name as stored on disk: 8 base bytes plus 3 extension bytes,
/// space padded, no dot.
///
/// No case folding is applied; FAT directories conventionally hold upper
/// case names, so callers should pass upper case strings or matching will
/// miss entries written by other systems.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ShortFileName {
    name: [u8; 8],
    ext: [u8; 3],
}

impl ShortFileName {
    /// Build a short name from `name`, splitting at the first dot.
    ///
    /// Base and extension are silently truncated to 8 and 3 bytes.
    pub fn new(name: &str) -> Self {
        let bytes = name.as_bytes();
        let (base, ext) = match bytes.iter().position(|&b| b == b'.') {
            Some(dot) => (&bytes[..dot], &bytes[dot + 1..]),
            None => (bytes, &bytes[0..0]),
        };
        let mut short = ShortFileName {
            name: [b' '; 8],
            ext: [b' '; 3],
        };
        let n = base.len().min(8);
        short.name[..n].copy_from_slice(&base[..n]);
        let n = ext.len().min(3);
        short.ext[..n].copy_from_slice(&ext[..n]);
        short
    }

    pub(crate) fn from_bytes(name: [u8; 8], ext: [u8; 3]) -> Self {
        ShortFileName { name, ext }
    }

    /// The 8 padded base bytes.
    pub fn base(&self) -> &[u8; 8] {
        &self.name
    }

    /// The 3 padded extension bytes.
    pub fn extension(&self) -> &[u8; 3] {
        &self.ext
    }
}
