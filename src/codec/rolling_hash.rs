/// Adler32-style rolling checksum used to find candidate block matches.
///
/// Two 16-bit sums packed into a u32; sliding the window by one byte is O(1).
const MOD_ADLER: u32 = 65521;

#[derive(Debug, Clone, Copy)]
pub(crate) struct RollingHash {
    a: u32,
    b: u32,
    window: u32,
}

impl RollingHash {
    /// Checksum of a full window.
    pub(crate) fn over(window: &[u8]) -> Self {
        // u64 accumulators let the reduction happen once at the end.
        let (a, b) = window.iter().fold((1u64, 0u64), |(a, b), &byte| {
            let a = a + u64::from(byte);
            (a, b + a)
        });
        Self {
            a: (a % u64::from(MOD_ADLER)) as u32,
            b: (b % u64::from(MOD_ADLER)) as u32,
            window: window.len() as u32,
        }
    }

    /// Drop `outgoing` from the front of the window and append `incoming`.
    pub(crate) fn roll(&mut self, outgoing: u8, incoming: u8) {
        let out = u32::from(outgoing);
        let inc = u32::from(incoming);

        self.a = (self.a + MOD_ADLER - out + inc) % MOD_ADLER;
        self.b = (self.b + MOD_ADLER - 1 + self.a - (out * self.window) % MOD_ADLER) % MOD_ADLER;
    }

    pub(crate) fn digest(&self) -> u32 {
        (self.b << 16) | self.a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let data = b"directory patch";
        assert_eq!(RollingHash::over(data).digest(), RollingHash::over(data).digest());
    }

    #[test]
    fn test_distinguishes_content() {
        assert_ne!(
            RollingHash::over(b"alpha").digest(),
            RollingHash::over(b"omega").digest()
        );
    }

    #[test]
    fn test_roll_matches_fresh_window() {
        let data: Vec<u8> = (0..64u8).map(|i| i.wrapping_mul(37)).collect();
        let mut rolling = RollingHash::over(&data[0..16]);
        for start in 1..=data.len() - 16 {
            rolling.roll(data[start - 1], data[start + 15]);
            assert_eq!(
                rolling.digest(),
                RollingHash::over(&data[start..start + 16]).digest(),
                "window starting at {start}"
            );
        }
    }
}
