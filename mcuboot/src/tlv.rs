use crate::*;

/// Location of the TLV trailer inside an image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlvArea {
    hashed_len: usize,
    start: usize,
    end: usize,
}

pub struct Tlv<'a> {
    pub kind: u16,
    pub payload: &'a [u8],
}

pub struct TlvIterator<'a> {
    data: &'a [u8],
    offset: usize,
    end: usize,
}

impl TlvArea {
    /// Find the unprotected TLV area, stepping over the protected one.
    pub fn locate(
        data: &[u8],
        header: &ImageHeader,
    ) -> Result<TlvArea, VerifyResult> {
        let mut offset = header.tlv_offset();
        let (mut magic, mut total) = read_info(data, offset)?;

        if magic == TLV_PROT_INFO_MAGIC {
            offset += total as usize;
            (magic, total) = read_info(data, offset)?;
        }
        if magic != TLV_INFO_MAGIC {
            return Err(VerifyResult::InvalidTlvInfoMagic);
        }

        let end = offset + total as usize;
        if end > data.len() {
            return Err(VerifyResult::Truncated);
        }

        Ok(TlvArea {
            hashed_len: offset,
            start: offset + TLV_INFO_SIZE,
            end,
        })
    }

    /// Number of leading bytes covered by the image hash.
    pub fn hashed_len(&self) -> usize {
        self.hashed_len
    }

    pub fn iter<'a>(&self, data: &'a [u8]) -> TlvIterator<'a> {
        TlvIterator {
            data,
            offset: self.start,
            end: self.end,
        }
    }
}

impl<'a> Iterator for TlvIterator<'a> {
    type Item = Tlv<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + TLV_SIZE > self.end {
            return None;
        }
        let kind = extract_u16(self.data, self.offset);
        let len = extract_u16(self.data, self.offset + 2) as usize;
        let start = self.offset + TLV_SIZE;
        if start + len > self.end {
            self.offset = self.end;
            return None;
        }
        self.offset = start + len;
        Some(Tlv {
            kind,
            payload: &self.data[start..start + len],
        })
    }
}

fn read_info(data: &[u8], offset: usize) -> Result<(u16, u16), VerifyResult> {
    if offset + TLV_INFO_SIZE > data.len() {
        return Err(VerifyResult::Truncated);
    }
    Ok((extract_u16(data, offset), extract_u16(data, offset + 2)))
}
