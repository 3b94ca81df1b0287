//! Intel HEX images.

use crate::memory::FlatMemory;

/// A run of contiguous bytes from the image.
#[derive(Debug, PartialEq, Eq)]
pub struct Segment {
    pub address: u32,
    pub data: Vec<u8>,
}

impl Segment {
    fn end(&self) -> u32 {
        self.address + self.data.len() as u32
    }
}

/// Decode an image into segments, merging records that follow each other.
pub fn segments(hexdata: &str) -> Result<Vec<Segment>, String> {
    let mut segments = Vec::<Segment>::new();
    let mut base = 0u32;

    for rec in ihex::Reader::new(hexdata) {
        match rec.map_err(|e| format!("Invalid record: {e}"))? {
            ihex::Record::Data { offset, value } => {
                let address = base + offset as u32;
                match segments.last_mut() {
                    Some(s) if s.end() == address => s.data.extend(value),
                    _ => segments.push(Segment { address, data: value }),
                }
            }
            ihex::Record::ExtendedSegmentAddress(esa) => base = (esa as u32) << 4,
            ihex::Record::ExtendedLinearAddress(ela) => base = (ela as u32) << 16,
            ihex::Record::EndOfFile => {
                segments.retain(|s| !s.data.is_empty());
                return Ok(segments);
            }
            _ => (),
        }
    }
    Err(String::from("Unexpected end of file"))
}

/// Write every segment of the image into `memory`. Returns the number of
/// bytes loaded.
pub fn load(memory: &FlatMemory, hexdata: &[u8]) -> Result<usize, String> {
    let text = std::str::from_utf8(hexdata).map_err(|e| format!("Invalid UTF-8 string ({e:?})"))?;
    let mut total = 0;
    for s in segments(text)? {
        log::debug!("Loading segment at 0x{:08x} ({} bytes)", s.address, s.data.len());
        memory.write(s.address, &s.data)?;
        total += s.data.len();
    }
    Ok(total)
}
