use crate::error::{HlsError, HlsResult};

/// MSB-first bit reader with Exp-Golomb support.
pub(crate) struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    codec: &'static str,
}

impl<'a> BitReader<'a> {
    pub(crate) fn new(data: &'a [u8], codec: &'static str) -> Self {
        Self {
            data,
            pos: 0,
            codec,
        }
    }

    fn eof(&self) -> HlsError {
        HlsError::codec(self.codec, "not enough bits")
    }

    pub(crate) fn read_bit(&mut self) -> HlsResult<bool> {
        let byte = self.data.get(self.pos / 8).ok_or_else(|| self.eof())?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Ok(bit == 1)
    }

    pub(crate) fn read_bits(&mut self, n: u32) -> HlsResult<u64> {
        debug_assert!(n <= 64);
        let mut v = 0u64;
        for _ in 0..n {
            v = (v << 1) | self.read_bit()? as u64;
        }
        Ok(v)
    }

    pub(crate) fn read_u8(&mut self, n: u32) -> HlsResult<u8> {
        Ok(self.read_bits(n)? as u8)
    }

    pub(crate) fn read_u32(&mut self, n: u32) -> HlsResult<u32> {
        Ok(self.read_bits(n)? as u32)
    }

    pub(crate) fn skip(&mut self, n: usize) -> HlsResult<()> {
        if self.pos + n > self.data.len() * 8 {
            return Err(self.eof());
        }
        self.pos += n;
        Ok(())
    }

    /// Unsigned Exp-Golomb.
    pub(crate) fn read_ue(&mut self) -> HlsResult<u32> {
        let mut leading_zeros = 0;
        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(HlsError::codec(self.codec, "invalid Exp-Golomb code"));
            }
        }
        let rest = self.read_bits(leading_zeros)?;
        Ok(((1u64 << leading_zeros) - 1 + rest) as u32)
    }

    /// Signed Exp-Golomb.
    pub(crate) fn read_se(&mut self) -> HlsResult<i32> {
        let v = self.read_ue()? as i64;
        Ok(if v % 2 == 0 { -(v / 2) } else { (v + 1) / 2 } as i32)
    }

    /// AV1 variable length unsigned integer.
    pub(crate) fn read_uvlc(&mut self) -> HlsResult<u32> {
        let mut leading_zeros = 0;
        while !self.read_bit()? {
            leading_zeros += 1;
        }
        if leading_zeros >= 32 {
            return Ok(u32::MAX);
        }
        let rest = self.read_bits(leading_zeros)?;
        Ok(((1u64 << leading_zeros) - 1 + rest) as u32)
    }
}

/// Strips emulation prevention bytes (`00 00 03`) from a NAL unit.
pub(crate) fn remove_emulation_prevention(nalu: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nalu.len());
    let mut zeros = 0;
    for &b in nalu {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(b);
    }
    out
}
