use std::io::Read;

use cid::Cid;

use crate::error::Error;
use crate::header::CarHeader;
use crate::util::{ld_read, read_node};

/// Reads a CAR archive from any [`Read`] source.
pub struct CarReader<R> {
    reader: R,
    header: CarHeader,
    buffer: Vec<u8>,
}

impl<R> CarReader<R>
where
    R: Read,
{
    /// Creates a new reader and parses the header.
    pub fn new(mut reader: R) -> Result<Self, Error> {
        let mut buffer = Vec::new();

        if ld_read(&mut reader, &mut buffer)?.is_none() {
            return Err(Error::Parsing(
                "failed to parse uvarint for header".to_string(),
            ));
        }

        let header = CarHeader::decode(&buffer)?;

        Ok(CarReader {
            reader,
            header,
            buffer,
        })
    }

    /// Returns the header of this archive.
    pub fn header(&self) -> &CarHeader {
        &self.header
    }

    /// Returns the next block, or `None` at the end of the archive.
    pub fn next_block(&mut self) -> Result<Option<(Cid, Vec<u8>)>, Error> {
        read_node(&mut self.reader, &mut self.buffer)
    }

    /// Consumes the reader, iterating over all remaining blocks.
    pub fn blocks(self) -> impl Iterator<Item = Result<(Cid, Vec<u8>), Error>> {
        let mut this = self;
        std::iter::from_fn(move || this.next_block().transpose())
    }
}

impl CarReader<std::io::Cursor<Vec<u8>>> {
    /// Convenience constructor over owned archive bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, Error> {
        CarReader::new(std::io::Cursor::new(bytes))
    }
}

#[cfg(test)]
mod tests {
    use libipld::cbor::DagCborCodec;
    use multihash::{Code, MultihashDigest};

    use crate::writer::CarWriter;

    use super::*;

    #[test]
    fn car_write_read() {
        let digest_test = Code::Sha2_256.digest(b"test");
        let cid_test = Cid::new_v1(DagCborCodec.into(), digest_test);

        let digest_foo = Code::Sha2_256.digest(b"foo");
        let cid_foo = Cid::new_v1(DagCborCodec.into(), digest_foo);

        let header = CarHeader::new(vec![cid_foo]);

        let mut buffer = Vec::new();
        let mut writer = CarWriter::new(header.clone(), &mut buffer);
        writer.write(cid_test, b"test").unwrap();
        writer.write(cid_foo, b"foo").unwrap();
        writer.finish().unwrap();

        let reader = CarReader::from_bytes(buffer).unwrap();
        assert_eq!(reader.header(), &header);

        let blocks: Vec<_> = reader.blocks().collect::<Result<_, _>>().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].0, cid_test);
        assert_eq!(blocks[0].1, b"test");
        assert_eq!(blocks[1].0, cid_foo);
        assert_eq!(blocks[1].1, b"foo");
    }

    #[test]
    fn size_accounting_is_exact() {
        let digest = Code::Sha2_256.digest(b"sized");
        let cid = Cid::new_v1(DagCborCodec.into(), digest);
        let header = CarHeader::new(vec![cid]);

        let data = vec![7u8; 321];
        let mut buffer = Vec::new();
        let mut writer = CarWriter::new(header.clone(), &mut buffer);
        writer.write(cid, &data).unwrap();
        writer.finish().unwrap();

        let expected =
            crate::util::header_length(&header).unwrap() + crate::util::block_length(&cid, &data);
        assert_eq!(buffer.len(), expected);
    }
}
