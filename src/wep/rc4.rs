//! RC4 stream cipher as used by WEP
//!
//! The context lives only for the duration of one call; nothing is
//! persisted between frames.

/// Substitution box plus the two output cursors
pub struct Rc4 {
    i: u8,
    j: u8,
    sbox: [u8; 256],
}

impl Rc4 {
    /// Run the key schedule over `seed` (IV followed by the WEP key).
    ///
    /// `seed` must not be empty.
    pub fn new(seed: &[u8]) -> Self {
        debug_assert!(!seed.is_empty(), "RC4 seed must not be empty");

        let mut sbox = [0u8; 256];
        for (n, slot) in sbox.iter_mut().enumerate() {
            *slot = n as u8;
        }

        let mut j: u8 = 0;
        for (n, &k) in (0..256).zip(seed.iter().cycle()) {
            j = j.wrapping_add(sbox[n]).wrapping_add(k);
            sbox.swap(n, j as usize);
        }

        Self { i: 0, j: 0, sbox }
    }

    fn next_byte(&mut self) -> u8 {
        self.i = self.i.wrapping_add(1);
        let a = self.sbox[self.i as usize];
        self.j = self.j.wrapping_add(a);
        let b = self.sbox[self.j as usize];
        self.sbox[self.i as usize] = b;
        self.sbox[self.j as usize] = a;
        self.sbox[a.wrapping_add(b) as usize]
    }

    /// Fill `dest` with keystream XOR `src`.
    ///
    /// Source bytes past the end of `src` count as zero, so an empty `src`
    /// yields raw keystream.
    pub fn apply(&mut self, src: &[u8], dest: &mut [u8]) {
        for (n, out) in dest.iter_mut().enumerate() {
            let s = src.get(n).copied().unwrap_or(0);
            *out = self.next_byte() ^ s;
        }
    }
}

/// One-shot RC4 over `src`, producing exactly `len` output bytes
pub fn rc4(seed: &[u8], src: &[u8], len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    Rc4::new(seed).apply(src, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // Published RC4 test vectors ("Key"/"Plaintext", "Wiki"/"pedia")
    #[test]
    fn test_known_vectors() {
        assert_eq!(
            hex::encode(rc4(b"Key", b"Plaintext", 9)),
            "bbf316e8d940af0ad3"
        );
        assert_eq!(hex::encode(rc4(b"Wiki", b"pedia", 5)), "1021bf0420");
    }

    #[test]
    fn test_keystream_only() {
        // Keystream for key "Secret" starts 04 d4 6b 05 3c a8 7b 59
        let ks = rc4(b"Secret", &[], 8);
        assert_eq!(hex::encode(ks), "04d46b053ca87b59");
    }

    #[test]
    fn test_short_source_is_zero_padded() {
        let full = rc4(b"Key", &[0x41, 0, 0, 0], 4);
        let short = rc4(b"Key", &[0x41], 4);
        assert_eq!(full, short);
    }

    #[test]
    fn test_symmetric() {
        let seed = [1u8, 2, 3, 0xaa, 0xbb, 0xcc, 0xdd, 0xee];
        let ct = rc4(&seed, b"challenge text", 14);
        assert_eq!(rc4(&seed, &ct, 14), b"challenge text");
    }
}
