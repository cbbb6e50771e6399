//! Static-model range coder after Schindler's fast renormalisation method
//!
//! Coder state at any point consists of:
//! 1. bytes already written, which never change
//! 2. one pending byte (`working`) that may still absorb a single carry
//! 3. a run of carry-propagating bytes (`underflow`), kept as a count
//! 4. the low end of the range
//!
//! Encoded layout: `header (1B) | body | low state (2B) | length (2B)`.
//! Arithmetic is exact 32-bit integer arithmetic with floor division.

use super::ObfuscationError;

const CODE_BITS: u32 = 32;
const TOP_VALUE: u64 = 1 << (CODE_BITS - 1);
const SHIFT_BITS: u32 = CODE_BITS - 9;
const EXTRA_BITS: u32 = (CODE_BITS - 2) % 8 + 1;
const BOTTOM_VALUE: u64 = TOP_VALUE >> 8;
const MASK_32: u64 = 0xFFFF_FFFF;

/// Byte the encoder seeds its pending slot with; the decoder skips it
pub const HEADER_BYTE: u8 = 0xCA;

const MAX_PROB: u32 = 255;
const SCALER: f64 = 256.0;
const MAX_SUM: u32 = 16384;

#[derive(Debug, Clone, Copy)]
struct Interval {
    low: u32,
    length: u32,
    high: u32,
}

/// Symbol intervals derived from a 256-entry frequency table
#[derive(Debug, Clone)]
pub struct CodingTable {
    intervals: Vec<Interval>,
    total: u32,
}

impl CodingTable {
    pub fn new(frequencies: &[u32]) -> Result<Self, ObfuscationError> {
        if frequencies.len() != 256 {
            return Err(ObfuscationError::MissingParameter(format!(
                "frequencies must have 256 entries, got {}",
                frequencies.len()
            )));
        }
        let probs = Self::adjust(frequencies);

        let mut intervals = Vec::with_capacity(256);
        let mut low = 0u32;
        for &p in &probs {
            intervals.push(Interval {
                low,
                length: p,
                high: low + p,
            });
            low += p;
        }
        Ok(Self {
            intervals,
            total: low,
        })
    }

    /// Rescale so that no entry exceeds 255 and the sum stays below 2^14.
    /// Zero entries are raised to 1 so every byte stays encodable.
    fn adjust(frequencies: &[u32]) -> Vec<u32> {
        let mut probs: Vec<u32> = frequencies.iter().map(|&f| f.max(1)).collect();

        let highest = probs.iter().copied().max().unwrap_or(1);
        if highest > MAX_PROB {
            let divisor = highest as f64 / SCALER;
            probs = probs
                .iter()
                .map(|&p| ((p as f64 / divisor).floor() as u32).max(1))
                .collect();
        }

        while probs.iter().sum::<u32>() >= MAX_SUM {
            probs = probs.iter().map(|&p| (p / 2).max(1)).collect();
        }
        probs
    }

    fn interval(&self, symbol: u8) -> Interval {
        self.intervals[symbol as usize]
    }

    /// Symbol whose interval contains `position`, capped at the last symbol
    fn symbol_at(&self, position: u32) -> u8 {
        let index = self.intervals.partition_point(|i| i.high <= position);
        index.min(255) as u8
    }
}

/// Maps a byte string to a range-coded byte string
#[derive(Debug, Clone)]
pub struct Encoder {
    table: CodingTable,
}

struct EncoderState {
    low: u64,
    high: u64,
    working: u8,
    underflow: usize,
    output: Vec<u8>,
}

impl EncoderState {
    fn write_pending(&mut self, carry: bool) {
        let (digit, fill) = if carry {
            (self.working.wrapping_add(1), 0x00)
        } else {
            (self.working, 0xFF)
        };
        self.output.push(digit);
        self.output
            .extend(std::iter::repeat(fill).take(self.underflow));
        self.underflow = 0;
    }

    fn renormalize(&mut self) {
        while self.high <= BOTTOM_VALUE {
            if self.low < (0xFF << SHIFT_BITS) {
                // no carry possible: settle the pending byte and the run
                self.write_pending(false);
                self.working = ((self.low >> SHIFT_BITS) & 0xFF) as u8;
            } else if self.low & TOP_VALUE != 0 {
                // carry already happened
                self.write_pending(true);
                self.working = ((self.low >> SHIFT_BITS) & 0xFF) as u8;
            } else {
                self.underflow += 1;
            }
            self.high = (self.high << 8) & MASK_32;
            self.low = (self.low << 8) & (TOP_VALUE - 1);
        }
    }
}

impl Encoder {
    pub fn new(table: CodingTable) -> Self {
        Self { table }
    }

    pub fn encode(&self, input: &[u8]) -> Vec<u8> {
        let mut state = EncoderState {
            low: 0,
            high: TOP_VALUE,
            working: HEADER_BYTE,
            underflow: 0,
            output: Vec::with_capacity(input.len() + 8),
        };
        let total = self.table.total as u64;

        for &symbol in input {
            let interval = self.table.interval(symbol);
            state.renormalize();

            let range = state.high / total;
            let temp = range * interval.low as u64;
            if interval.high as u64 >= total {
                state.high -= temp;
            } else {
                state.high = range * interval.length as u64;
            }
            state.low += temp;
        }

        state.renormalize();
        let temp = state.low >> SHIFT_BITS;
        state.write_pending(temp > 0xFF);
        state.output.push((temp & 0xFF) as u8);
        state.output.push(((state.low >> (SHIFT_BITS - 8)) & 0xFF) as u8);

        let len = state.output.len();
        state.output.push(((len >> 8) & 0xFF) as u8);
        let len = state.output.len();
        state.output.push((len & 0xFF) as u8);
        state.output
    }
}

/// Inverse of `Encoder`
#[derive(Debug, Clone)]
pub struct Decoder {
    table: CodingTable,
}

struct DecoderState<'a> {
    input: &'a [u8],
    pos: usize,
    low: u32,
    high: u32,
    working: u8,
    output: Vec<u8>,
}

impl DecoderState<'_> {
    fn has_input(&self) -> bool {
        self.pos < self.input.len()
    }

    fn renormalize(&mut self) -> Result<(), ObfuscationError> {
        while self.high as u64 <= BOTTOM_VALUE {
            if self.high == 0 {
                return Err(ObfuscationError::Corrupt("range collapsed".to_string()));
            }
            self.high <<= 8;
            self.low = (self.low << 8) | ((self.working as u32) << EXTRA_BITS) & 0xFF;
            self.working = match self.input.get(self.pos) {
                Some(&b) => {
                    self.pos += 1;
                    b
                }
                None => 0,
            };
            self.low |= (self.working as u32) >> (8 - EXTRA_BITS);
        }
        Ok(())
    }

    fn decode_symbol(&mut self, table: &CodingTable) -> Result<(), ObfuscationError> {
        self.renormalize()?;

        let step = self.high / table.total;
        if step == 0 {
            return Err(ObfuscationError::Corrupt("range collapsed".to_string()));
        }
        let position = (self.low / step).min(table.total - 1);
        let symbol = table.symbol_at(position);
        self.output.push(symbol);

        let interval = table.interval(symbol);
        let temp = step.wrapping_mul(interval.low);
        self.low = self.low.wrapping_sub(temp);
        if interval.high >= table.total {
            self.high = self.high.wrapping_sub(temp);
        } else {
            self.high = step.wrapping_mul(interval.length);
        }
        Ok(())
    }
}

impl Decoder {
    pub fn new(table: CodingTable) -> Self {
        Self { table }
    }

    pub fn decode(&self, input: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
        if input.len() < 2 {
            return Err(ObfuscationError::Truncated {
                expected: 2,
                actual: input.len(),
            });
        }
        // input[0] is the encoder's seed byte and carries no information
        let working = input[1];
        let mut state = DecoderState {
            input,
            pos: 2,
            low: (working as u32) >> (8 - EXTRA_BITS),
            high: 1 << EXTRA_BITS,
            working,
            output: Vec::with_capacity(input.len()),
        };

        while state.has_input() {
            state.decode_symbol(&self.table)?;
        }
        state.decode_symbol(&self.table)?;
        state.renormalize()?;
        Ok(state.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG: &str = "0.1.0.5c.21.12.a4.42.48.4e.43.6a.4e.47.54.66.37.31.45.42.0.6.0.21.34.47.4a.39.65.49.69.4d.75.59.55.35.43.38.49.6a.3a.69.7a.72.51.34.77.72.57.66.70.31.6b.57.66.44.64.0.0.0.80.29.0.8.9a.85.cd.95.50.c8.ee.a.0.24.0.4.6e.7e.1e.ff.0.8.0.14.3.45.95.42.22.f0.da.66.3e.8e.b8.cc.79.a1.f7.ba.1.f.d5.0.80.28.0.4.e2.28.43.3";

    fn dotted_hex(s: &str) -> Vec<u8> {
        s.split('.').map(|t| u8::from_str_radix(t, 16).unwrap()).collect()
    }

    fn uniform() -> CodingTable {
        CodingTable::new(&[1u32; 256]).unwrap()
    }

    #[test]
    fn test_encode_short_vector() {
        let encoded = Encoder::new(uniform()).encode(&[0x00, 0x01, 0x02, 0x03]);
        assert_eq!(encoded, vec![0xca, 0x00, 0x01, 0x02, 0x03, 0x00, 0x00, 0x00, 0x08]);
    }

    #[test]
    fn test_decode_short_vector() {
        let decoded = Decoder::new(uniform())
            .decode(&[0xca, 0x00, 0x01, 0x02, 0x03, 0x00, 0x00, 0x00, 0x08])
            .unwrap();
        assert_eq!(&decoded[..decoded.len() - 2], &[0x00, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_long_vector() {
        let input = dotted_hex(LONG);
        let mut expected = vec![0xca];
        expected.extend(&input);
        expected.extend([0x00, 0x00, 0x00, 0x74]);

        let encoded = Encoder::new(uniform()).encode(&input);
        assert_eq!(encoded, expected);

        let decoded = Decoder::new(uniform()).decode(&encoded).unwrap();
        assert_eq!(&decoded[..decoded.len() - 2], &input[..]);
    }

    #[test]
    fn test_adjust_scales_large_frequencies() {
        let mut freqs = [1u32; 256];
        freqs[0] = 1024;
        let table = CodingTable::new(&freqs).unwrap();
        assert_eq!(table.intervals[0].length, 256);
        assert!(table.intervals.iter().all(|i| i.length >= 1));
        assert!(table.total < MAX_SUM);
    }

    #[test]
    fn test_adjust_bounds_sum() {
        let table = CodingTable::new(&[200u32; 256]).unwrap();
        assert!(table.total < MAX_SUM);
        assert_eq!(table.intervals[255].high, table.total);
    }

    #[test]
    fn test_table_size_checked() {
        assert!(CodingTable::new(&[1u32; 10]).is_err());
    }

    #[test]
    fn test_symbol_lookup_follows_intervals() {
        let mut freqs = [1u32; 256];
        freqs[0] = 200;
        freqs[65] = 50;
        let table = CodingTable::new(&freqs).unwrap();
        assert_eq!(table.symbol_at(0), 0);
        assert_eq!(table.symbol_at(199), 0);
        assert_eq!(table.symbol_at(200), 1);
        assert_eq!(table.symbol_at(264), 65);
        assert_eq!(table.symbol_at(313), 65);
        assert_eq!(table.symbol_at(314), 66);
        assert_eq!(table.symbol_at(table.total - 1), 255);
        assert_eq!(table.symbol_at(table.total + 10), 255);

        let uniform = uniform();
        assert!((0..256u32).all(|p| uniform.symbol_at(p) as u32 == p));
    }

    #[test]
    fn test_skewed_decode_terminates() {
        let mut freqs = [1u32; 256];
        freqs[0] = 200;
        freqs[65] = 50;
        let decoder = Decoder::new(CodingTable::new(&freqs).unwrap());
        let input: Vec<u8> = (0..64u32).map(|i| (i * 37 % 256) as u8).collect();
        let decoded = decoder.decode(&input).unwrap();
        assert!(!decoded.is_empty());
    }

    #[test]
    fn test_decode_rejects_tiny_input() {
        assert!(Decoder::new(uniform()).decode(&[0xca]).is_err());
    }
}
