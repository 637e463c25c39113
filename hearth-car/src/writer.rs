use std::io::Write;

use cid::Cid;
use integer_encoding::VarIntWriter;

use crate::error::Error;
use crate::header::CarHeader;
use crate::util::MAX_ALLOC;

/// Writes a CAR archive into any [`Write`] target, typically a `Vec<u8>`
/// owned by the commit pipeline.
#[derive(Debug)]
pub struct CarWriter<W> {
    header: CarHeader,
    writer: W,
    cid_buffer: Vec<u8>,
    is_header_written: bool,
}

impl<W> CarWriter<W>
where
    W: Write,
{
    pub fn new(header: CarHeader, writer: W) -> Self {
        CarWriter {
            header,
            writer,
            cid_buffer: Vec::new(),
            is_header_written: false,
        }
    }

    /// Writes the header (once) and the given block.
    pub fn write<T>(&mut self, cid: Cid, data: T) -> Result<(), Error>
    where
        T: AsRef<[u8]>,
    {
        if !self.is_header_written {
            let header_bytes = self.header.encode()?;
            self.writer.write_varint(header_bytes.len())?;
            self.writer.write_all(&header_bytes)?;
            self.is_header_written = true;
        }

        self.cid_buffer.clear();
        cid.write_bytes(&mut self.cid_buffer)
            .map_err(|e| Error::Parsing(e.to_string()))?;

        let data = data.as_ref();
        let len = self.cid_buffer.len() + data.len();
        // a section the reader would refuse must never be written
        if len > MAX_ALLOC {
            return Err(Error::SectionTooLarge(len));
        }

        self.writer.write_varint(len)?;
        self.writer.write_all(&self.cid_buffer)?;
        self.writer.write_all(data)?;

        Ok(())
    }

    /// Finishes writing, including flushing, and returns the writer.
    pub fn finish(mut self) -> Result<W, Error> {
        if !self.is_header_written {
            let header_bytes = self.header.encode()?;
            self.writer.write_varint(header_bytes.len())?;
            self.writer.write_all(&header_bytes)?;
            self.is_header_written = true;
        }
        self.writer.flush()?;
        Ok(self.writer)
    }
}
