use std::fmt;

/// Swaps the two bytes of every aligned pair in `data`.
///
/// A trailing unpaired byte is carried over unchanged, so the operation is
/// its own inverse for any input length.
pub fn swab_bytes(data: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(data.len());
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        result.push(pair[1]);
        result.push(pair[0]);
    }
    result.extend_from_slice(chunks.remainder());
    result
}

/// Given a list of fuse words and a list of `(index, mask)` pairs, returns
/// the words with each indicated slot AND-masked. Slots not mentioned in
/// `masks` are unchanged.
pub fn indexwise_and(words: &[u16], masks: &[(usize, u16)]) -> Vec<u16> {
    let mut result = words.to_vec();
    for &(index, mask) in masks {
        if let Some(slot) = result.get_mut(index) {
            *slot &= mask;
        }
    }
    result
}

pub struct HexSlice<T>(pub T)
where
    T: AsRef<[u8]>;

impl<T: AsRef<[u8]>> fmt::Debug for HexSlice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, byte) in self.0.as_ref().iter().enumerate() {
            if i != 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swab_is_involutive() {
        let data = [0x28, 0x0f, 0x3f, 0xff, 0x00, 0xa0];
        assert_eq!(swab_bytes(&data), [0x0f, 0x28, 0xff, 0x3f, 0xa0, 0x00]);
        assert_eq!(swab_bytes(&swab_bytes(&data)), data);
    }

    #[test]
    fn swab_keeps_trailing_byte() {
        assert_eq!(swab_bytes(&[0x01, 0x02, 0x03]), [0x02, 0x01, 0x03]);
    }

    #[test]
    fn indexwise_and_leaves_unmentioned_slots() {
        let words = [0x3fff, 0x3fff, 0xffff];
        assert_eq!(indexwise_and(&words, &[]), words);
        assert_eq!(
            indexwise_and(&words, &[(1, 0x3ff7)]),
            [0x3fff, 0x3ff7, 0xffff]
        );
    }

    #[test]
    fn indexwise_and_applies_every_pair() {
        let words = [0xffff, 0xffff];
        assert_eq!(
            indexwise_and(&words, &[(0, 0x3fff), (1, 0x00ff), (0, 0xfff0)]),
            [0x3ff0, 0x00ff]
        );
    }

    #[test]
    fn hex_slice_formats_bytes() {
        assert_eq!(format!("{:?}", HexSlice([0xab, 0x01])), "[ab, 01]");
    }
}
