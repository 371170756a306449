use crate::{Fmp4Error, Fmp4Result};

/// A box found while iterating over a buffer.
#[derive(Debug, Clone, Copy)]
pub struct RawBox<'a> {
    pub kind: [u8; 4],
    /// Offset of the box header inside the buffer given to [`BoxReader`].
    pub offset: usize,
    pub payload: &'a [u8],
}

impl RawBox<'_> {
    pub fn kind_str(&self) -> String {
        String::from_utf8_lossy(&self.kind).into_owned()
    }
}

/// Iterates over sibling boxes of a buffer.
pub struct BoxReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BoxReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn next_box(&mut self) -> Fmp4Result<Option<RawBox<'a>>> {
        let remaining = &self.data[self.pos..];
        if remaining.is_empty() {
            return Ok(None);
        }
        if remaining.len() < 8 {
            return Err(Fmp4Error::Truncated("header".to_string()));
        }

        let mut kind = [0u8; 4];
        kind.copy_from_slice(&remaining[4..8]);
        let kind_name = || String::from_utf8_lossy(&kind).into_owned();

        let (size, header_len) = match u32::from_be_bytes([
            remaining[0],
            remaining[1],
            remaining[2],
            remaining[3],
        ]) {
            0 => (remaining.len() as u64, 8),
            1 => {
                if remaining.len() < 16 {
                    return Err(Fmp4Error::Truncated(kind_name()));
                }
                let mut large = [0u8; 8];
                large.copy_from_slice(&remaining[8..16]);
                (u64::from_be_bytes(large), 16)
            }
            size => (size as u64, 8),
        };

        if size < header_len as u64 || size > remaining.len() as u64 {
            return Err(Fmp4Error::InvalidSize {
                kind: kind_name(),
                size,
            });
        }

        let raw = RawBox {
            kind,
            offset: self.pos,
            payload: &remaining[header_len..size as usize],
        };
        self.pos += size as usize;
        Ok(Some(raw))
    }

    /// Returns the first box of the given kind among the remaining siblings.
    pub fn find(&mut self, kind: &[u8; 4]) -> Fmp4Result<Option<RawBox<'a>>> {
        while let Some(b) = self.next_box()? {
            if &b.kind == kind {
                return Ok(Some(b));
            }
        }
        Ok(None)
    }
}

pub(crate) fn find_child<'a>(
    payload: &'a [u8],
    kind: &'static [u8; 4],
    name: &'static str,
) -> Fmp4Result<RawBox<'a>> {
    BoxReader::new(payload)
        .find(kind)?
        .ok_or(Fmp4Error::MissingBox(name))
}

/// Big-endian field reader over a box payload.
pub(crate) struct Fields<'a> {
    data: &'a [u8],
    pos: usize,
    kind: &'static str,
}

impl<'a> Fields<'a> {
    pub(crate) fn new(data: &'a [u8], kind: &'static str) -> Self {
        Self { data, pos: 0, kind }
    }

    fn take(&mut self, n: usize) -> Fmp4Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Fmp4Error::Truncated(self.kind.to_string()));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn skip(&mut self, n: usize) -> Fmp4Result<()> {
        self.take(n).map(|_| ())
    }

    pub(crate) fn u8(&mut self) -> Fmp4Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Fmp4Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Fmp4Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn i32(&mut self) -> Fmp4Result<i32> {
        Ok(self.u32()? as i32)
    }

    pub(crate) fn u64(&mut self) -> Fmp4Result<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    /// Reads the version and flags of a full box.
    pub(crate) fn full_header(&mut self) -> Fmp4Result<(u8, u32)> {
        let v = self.u32()?;
        Ok(((v >> 24) as u8, v & 0x00FF_FFFF))
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iterate_siblings() -> Fmp4Result<()> {
        let data = [
            0, 0, 0, 9, b'f', b'r', b'e', b'e', 1, //
            0, 0, 0, 8, b's', b'k', b'i', b'p',
        ];
        let mut reader = BoxReader::new(&data);
        let first = reader.next_box()?.ok_or(Fmp4Error::MissingBox("free"))?;
        assert_eq!(&first.kind, b"free");
        assert_eq!(first.payload, &[1]);
        let second = reader.next_box()?.ok_or(Fmp4Error::MissingBox("skip"))?;
        assert_eq!(second.offset, 9);
        assert!(second.payload.is_empty());
        assert!(reader.next_box()?.is_none());
        Ok(())
    }

    #[test]
    fn test_reject_oversized_box() {
        let data = [0, 0, 0, 64, b'm', b'o', b'o', b'f'];
        assert!(BoxReader::new(&data).next_box().is_err());
    }
}
