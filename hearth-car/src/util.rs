use std::io::Read;

use cid::Cid;
use integer_encoding::VarIntReader;

use crate::error::Error;
use crate::header::CarHeader;

/// Maximum size accepted for a single section.
pub(crate) const MAX_ALLOC: usize = 4 * 1024 * 1024;

/// Reads one varint-length-delimited section into `buf`, returning `None` at
/// a clean end of stream.
pub(crate) fn ld_read<R>(mut reader: R, buf: &mut Vec<u8>) -> Result<Option<usize>, Error>
where
    R: Read,
{
    let length: usize = match VarIntReader::read_varint(&mut reader) {
        Ok(len) => len,
        Err(e) => {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(None);
            }
            return Err(Error::Parsing(e.to_string()));
        }
    };

    if length > MAX_ALLOC {
        return Err(Error::SectionTooLarge(length));
    }
    if length > buf.len() {
        buf.resize(length, 0);
    }

    reader
        .read_exact(&mut buf[..length])
        .map_err(|e| Error::Parsing(e.to_string()))?;

    Ok(Some(length))
}

/// Reads the next `(CID, bytes)` section.
pub(crate) fn read_node<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<Option<(Cid, Vec<u8>)>, Error>
where
    R: Read,
{
    if let Some(length) = ld_read(reader, buf)? {
        let mut cursor = std::io::Cursor::new(&buf[..length]);
        let cid = Cid::read_bytes(&mut cursor)?;
        let pos = cursor.position() as usize;

        return Ok(Some((cid, buf[pos..length].to_vec())));
    }
    Ok(None)
}

/// Number of bytes the unsigned varint encoding of `value` occupies.
pub fn varint_length(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Exact number of bytes one `(CID, bytes)` section occupies in an archive.
pub fn block_length(cid: &Cid, data: &[u8]) -> usize {
    let section = cid.encoded_len() + data.len();
    varint_length(section as u64) + section
}

/// Exact number of bytes the encoded header occupies, length prefix included.
pub fn header_length(header: &CarHeader) -> Result<usize, Error> {
    let bytes = header.encode()?;
    Ok(varint_length(bytes.len() as u64) + bytes.len())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use integer_encoding::VarIntWriter;

    use super::*;

    fn ld_write(buffer: &mut Vec<u8>, bytes: &[u8]) {
        buffer.write_varint(bytes.len()).unwrap();
        buffer.write_all(bytes).unwrap();
    }

    #[test]
    fn ld_read_write_good() {
        let mut buffer = Vec::new();
        ld_write(&mut buffer, b"test bytes");

        let mut out = vec![1u8; 1024];
        let read = ld_read(std::io::Cursor::new(buffer), &mut out)
            .unwrap()
            .unwrap();
        assert_eq!(&out[..read], b"test bytes");
    }

    #[test]
    fn ld_read_too_large() {
        let mut buffer = Vec::new();
        ld_write(&mut buffer, &vec![2u8; MAX_ALLOC + 1]);

        let mut out = vec![0u8; 16];
        let read = ld_read(std::io::Cursor::new(buffer), &mut out);
        assert!(matches!(read, Err(Error::SectionTooLarge(_))));
    }

    #[test]
    fn varint_length_matches_encoding() {
        for value in [0u64, 1, 127, 128, 300, 65536, u32::MAX as u64] {
            let mut buf = Vec::new();
            buf.write_varint(value).unwrap();
            assert_eq!(varint_length(value), buf.len(), "value {value}");
        }
    }
}
