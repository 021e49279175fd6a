//! Memory segments and Intel-HEX conversion
//!
//! The core trades in [Segment]s: plain `(address, bytes)` pairs. HEX
//! files use the AVR offset convention, where the upper address bits
//! select the memory region (see [crate::targets::route_hex_address]);
//! this module only converts between files and segments and leaves the
//! routing to the session.

use ihex::Record;

use crate::error::Error;

/// A contiguous run of bytes at an absolute (HEX-convention) address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub addr: u32,
    pub data: Vec<u8>,
}

impl Segment {
    pub fn new(addr: u32, data: Vec<u8>) -> Self {
        Segment { addr, data }
    }

    /// First address past the end of this segment
    pub fn end(&self) -> u32 {
        self.addr + self.data.len() as u32
    }
}

/// Parse an Intel-HEX file into segments. Contiguous data records are
/// coalesced; segment boundaries in the file are otherwise preserved.
pub fn segments_from_hex(hex: &str) -> Result<Vec<Segment>, Error> {
    let mut segments: Vec<Segment> = Vec::new();
    let mut base: u32 = 0;

    for record in ihex::Reader::new(hex) {
        let record = record.map_err(|err| Error::InvalidHex(err.to_string()))?;

        match record {
            Record::Data { offset, value } => {
                let address = base + offset as u32;
                match segments.last_mut() {
                    Some(last) if last.end() == address => last.data.extend(value),
                    _ => segments.push(Segment::new(address, value)),
                }
            }
            Record::ExtendedLinearAddress(upper) => base = (upper as u32) << 16,
            Record::ExtendedSegmentAddress(paragraph) => base = (paragraph as u32) << 4,
            Record::EndOfFile => break,
            // Entry-point records carry no data we care about.
            Record::StartLinearAddress(_) | Record::StartSegmentAddress { .. } => {}
        }
    }

    segments.sort_by_key(|segment| segment.addr);
    Ok(segments)
}

/// Render segments as an Intel-HEX object file, 16 bytes per record,
/// with extended linear address records wherever the upper word changes
pub fn segments_to_hex(segments: &[Segment]) -> Result<String, Error> {
    let mut records = Vec::new();
    let mut upper: Option<u16> = None;

    let mut ordered: Vec<&Segment> = segments.iter().collect();
    ordered.sort_by_key(|segment| segment.addr);

    for segment in ordered {
        let mut address = segment.addr;
        let mut remaining = segment.data.as_slice();

        while !remaining.is_empty() {
            let segment_upper = (address >> 16) as u16;
            if upper != Some(segment_upper) {
                records.push(Record::ExtendedLinearAddress(segment_upper));
                upper = Some(segment_upper);
            }

            // Never let one record cross a 64 KiB boundary.
            let offset = (address & 0xFFFF) as usize;
            let line = remaining.len().min(16).min(0x1_0000 - offset);
            let (head, tail) = remaining.split_at(line);

            records.push(Record::Data {
                offset: offset as u16,
                value: head.to_vec(),
            });

            address += line as u32;
            remaining = tail;
        }
    }

    records.push(Record::EndOfFile);

    ihex::create_object_file_representation(&records)
        .map_err(|err| Error::InvalidHex(err.to_string()))
}
