//! Minimal ISO-BMFF reading: box walking, key ids and fragment sample layout.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use thiserror::Error;

use crate::keys::KeyId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BoxError {
    #[error("box at offset {0} is truncated")]
    Truncated(usize),

    #[error("box at offset {offset} has invalid size {size}")]
    InvalidSize { offset: usize, size: u64 },

    #[error("missing {0} box")]
    Missing(&'static str),

    #[error("sample layout does not match mdat: {0}")]
    SampleLayout(String),
}

impl From<std::io::Error> for BoxError {
    fn from(_: std::io::Error) -> Self {
        BoxError::Truncated(0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Mp4Box<'a> {
    pub kind: [u8; 4],
    /// Offset of the box header inside the walked buffer
    pub offset: usize,
    header_len: usize,
    data: &'a [u8],
}

impl<'a> Mp4Box<'a> {
    pub fn payload(&self) -> &'a [u8] {
        &self.data[self.header_len..]
    }

    pub fn payload_offset(&self) -> usize {
        self.offset + self.header_len
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn children(&self) -> BoxIter<'a> {
        BoxIter {
            data: self.payload(),
            pos: 0,
            base: self.payload_offset(),
        }
    }
}

/// Iterates over sibling boxes. Stops at the first malformed header.
pub struct BoxIter<'a> {
    data: &'a [u8],
    pos: usize,
    base: usize,
}

pub fn boxes(data: &[u8]) -> BoxIter<'_> {
    BoxIter {
        data,
        pos: 0,
        base: 0,
    }
}

impl<'a> Iterator for BoxIter<'a> {
    type Item = Result<Mp4Box<'a>, BoxError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }

        let result = self.read_box();
        match &result {
            Ok(b) => self.pos += b.len(),
            Err(_) => self.pos = self.data.len(),
        }
        Some(result)
    }
}

impl<'a> BoxIter<'a> {
    fn read_box(&self) -> Result<Mp4Box<'a>, BoxError> {
        let offset = self.base + self.pos;
        let rest = &self.data[self.pos..];
        let mut cursor = Cursor::new(rest);

        let size = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| BoxError::Truncated(offset))?;
        let mut kind = [0u8; 4];
        cursor
            .read_exact(&mut kind)
            .map_err(|_| BoxError::Truncated(offset))?;

        let (size, header_len) = match size {
            0 => (rest.len() as u64, 8),
            1 => (
                cursor
                    .read_u64::<BigEndian>()
                    .map_err(|_| BoxError::Truncated(offset))?,
                16,
            ),
            size => (size as u64, 8),
        };
        if size < header_len as u64 {
            return Err(BoxError::InvalidSize { offset, size });
        }
        if size > rest.len() as u64 {
            return Err(BoxError::Truncated(offset));
        }

        Ok(Mp4Box {
            kind,
            offset,
            header_len,
            data: &rest[..size as usize],
        })
    }
}

/// First box following `path` from the top level, e.g. `[b"moov", b"trak"]`.
pub fn find<'a>(data: &'a [u8], path: &[&[u8; 4]]) -> Option<Mp4Box<'a>> {
    let (first, rest) = path.split_first()?;
    let mut current = boxes(data).map_while(Result::ok).find(|b| &b.kind == *first)?;
    for kind in rest {
        current = current
            .children()
            .map_while(Result::ok)
            .find(|b| &b.kind == *kind)?;
    }
    Some(current)
}

fn positions<'a>(data: &'a [u8], needle: &'a [u8; 4]) -> impl Iterator<Item = usize> + 'a {
    data.windows(4)
        .enumerate()
        .filter(move |(_, w)| w == needle)
        .map(|(i, _)| i)
}

fn key_id_at(data: &[u8], offset: usize) -> Option<KeyId> {
    let bytes: [u8; 16] = data.get(offset..offset + 16)?.try_into().ok()?;
    Some(KeyId::new(bytes))
}

/// `default_KID` of the first `tenc` box of an init segment.
pub fn tenc_key_id(init: &[u8]) -> Option<KeyId> {
    positions(init, b"tenc").find_map(|pos| {
        // size(4) 'tenc' version+flags(4) reserved(1) pattern(1) is_protected(1) iv_size(1) KID(16)
        let size = pos
            .checked_sub(4)
            .and_then(|start| init.get(start..pos))
            .map(|s| u32::from_be_bytes([s[0], s[1], s[2], s[3]]))?;
        if size < 32 {
            return None;
        }
        key_id_at(init, pos + 12)
    })
}

/// Key id of a `seig` sample group description inside a media segment.
pub fn seig_key_id(segment: &[u8]) -> Option<KeyId> {
    positions(segment, b"seig").find_map(|pos| {
        // 'seig' default_length(4)=20 entry_count(4) reserved(1) pattern(1) is_protected(1) iv_size(1) KID(16)
        let header = segment.get(pos + 4..pos + 16)?;
        let default_length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if default_length != 20 || header[10] != 1 {
            return None;
        }
        key_id_at(segment, pos + 16)
    })
}

/// Codec fourcc of the first sample entry, looking through `encv`/`enca` wrappers.
pub fn sample_entry(data: &[u8]) -> Option<[u8; 4]> {
    let stsd = find(data, &[b"moov", b"trak", b"mdia", b"minf", b"stbl", b"stsd"])?;
    // version+flags(4) entry_count(4)
    let entries = stsd.payload().get(8..)?;
    let entry = boxes(entries).next()?.ok()?;

    if &entry.kind == b"encv" || &entry.kind == b"enca" {
        let pos = positions(entry.payload(), b"frma").next()?;
        return entry.payload().get(pos + 4..pos + 8)?.try_into().ok();
    }
    Some(entry.kind)
}

#[derive(Debug, Default, Clone, Copy)]
struct TrackFragmentHeader {
    base_data_offset: Option<u64>,
    default_sample_size: Option<u32>,
}

fn parse_tfhd(payload: &[u8]) -> Result<TrackFragmentHeader, BoxError> {
    let mut cursor = Cursor::new(payload);
    let flags = cursor.read_u32::<BigEndian>()? & 0x00ff_ffff;
    let _track_id = cursor.read_u32::<BigEndian>()?;

    let mut header = TrackFragmentHeader::default();
    if flags & 0x01 != 0 {
        header.base_data_offset = Some(cursor.read_u64::<BigEndian>()?);
    }
    if flags & 0x02 != 0 {
        cursor.read_u32::<BigEndian>()?;
    }
    if flags & 0x08 != 0 {
        cursor.read_u32::<BigEndian>()?;
    }
    if flags & 0x10 != 0 {
        header.default_sample_size = Some(cursor.read_u32::<BigEndian>()?);
    }
    Ok(header)
}

/// `(data_offset, sample sizes)` of a `trun` box.
fn parse_trun(
    payload: &[u8],
    header: &TrackFragmentHeader,
) -> Result<(Option<i64>, Vec<u32>), BoxError> {
    let mut cursor = Cursor::new(payload);
    let flags = cursor.read_u32::<BigEndian>()? & 0x00ff_ffff;
    let sample_count = cursor.read_u32::<BigEndian>()?;

    let data_offset = if flags & 0x01 != 0 {
        Some(cursor.read_i32::<BigEndian>()? as i64)
    } else {
        None
    };
    if flags & 0x04 != 0 {
        cursor.read_u32::<BigEndian>()?;
    }

    let mut sizes = Vec::with_capacity(sample_count.min(4096) as usize);
    for _ in 0..sample_count {
        if flags & 0x100 != 0 {
            cursor.read_u32::<BigEndian>()?;
        }
        let size = if flags & 0x200 != 0 {
            cursor.read_u32::<BigEndian>()?
        } else {
            header
                .default_sample_size
                .ok_or(BoxError::Missing("sample size"))?
        };
        if flags & 0x400 != 0 {
            cursor.read_u32::<BigEndian>()?;
        }
        if flags & 0x800 != 0 {
            cursor.read_u32::<BigEndian>()?;
        }
        sizes.push(size);
    }
    Ok((data_offset, sizes))
}

/// Samples of every movie fragment in `data`.
///
/// The samples described by a `moof` must exactly cover the payload of the `mdat`
/// that follows it.
pub fn fragment_samples(data: &[u8]) -> Result<Vec<&[u8]>, BoxError> {
    let mut samples = Vec::new();
    let mut pending_moof: Option<Mp4Box> = None;
    let mut seen_moof = false;

    for b in boxes(data) {
        let b = b?;
        match &b.kind {
            b"moof" => {
                pending_moof = Some(b);
                seen_moof = true;
            }
            b"mdat" => {
                let Some(moof) = pending_moof.take() else {
                    continue;
                };
                samples.extend(mdat_samples(data, &moof, &b)?);
            }
            _ => {}
        }
    }

    if !seen_moof {
        return Err(BoxError::Missing("moof"));
    }
    if pending_moof.is_some() {
        return Err(BoxError::Missing("mdat"));
    }
    Ok(samples)
}

fn mdat_samples<'a>(
    data: &'a [u8],
    moof: &Mp4Box<'a>,
    mdat: &Mp4Box<'a>,
) -> Result<Vec<&'a [u8]>, BoxError> {
    let mdat_start = mdat.payload_offset();
    let mdat_end = mdat.offset + mdat.len();

    let mut samples = Vec::new();
    let mut covered = 0usize;
    let mut next_start = mdat_start;

    for traf in moof.children().filter(|b| matches!(b, Ok(b) if &b.kind == b"traf")) {
        let traf = traf?;
        let mut header = TrackFragmentHeader::default();
        for child in traf.children() {
            let child = child?;
            match &child.kind {
                b"tfhd" => header = parse_tfhd(child.payload())?,
                b"trun" => {
                    let (data_offset, sizes) = parse_trun(child.payload(), &header)?;
                    if let Some(data_offset) = data_offset {
                        let base = header.base_data_offset.unwrap_or(moof.offset as u64) as i64;
                        next_start = usize::try_from(base + data_offset).map_err(|_| {
                            BoxError::SampleLayout(format!("negative data offset {data_offset}"))
                        })?;
                    }

                    for size in sizes {
                        let end = next_start + size as usize;
                        if next_start < mdat_start || end > mdat_end {
                            return Err(BoxError::SampleLayout(format!(
                                "sample {next_start}..{end} outside mdat {mdat_start}..{mdat_end}"
                            )));
                        }
                        samples.push(&data[next_start..end]);
                        covered += size as usize;
                        next_start = end;
                    }
                }
                _ => {}
            }
        }
    }

    if covered != mdat_end - mdat_start {
        return Err(BoxError::SampleLayout(format!(
            "samples cover {covered} of {} bytes",
            mdat_end - mdat_start
        )));
    }
    Ok(samples)
}
