//! Byte offset of the first audio payload byte for the containers we can read cheaply.
//!
//! Only a prefix of the file is inspected. When the prefix ends before the payload marker
//! (or the container is not recognised) the offset is 0.

/// Offset of the audio payload inside `prefix`'s container.
pub fn data_offset(prefix: &[u8]) -> u64 {
    if prefix.starts_with(b"ID3") {
        return id3_offset(prefix);
    }
    if prefix.starts_with(b"fLaC") {
        return flac_offset(prefix, 0).unwrap_or(0);
    }
    if prefix.len() >= 12 && &prefix[0..4] == b"RIFF" && &prefix[8..12] == b"WAVE" {
        return riff_offset(prefix).unwrap_or(0);
    }
    if prefix.len() >= 12
        && &prefix[0..4] == b"FORM"
        && (&prefix[8..12] == b"AIFF" || &prefix[8..12] == b"AIFC")
    {
        return aiff_offset(prefix).unwrap_or(0);
    }
    0
}

fn id3_offset(prefix: &[u8]) -> u64 {
    if prefix.len() < 10 {
        return 0;
    }
    let flags = prefix[5];
    let size = prefix[6..10]
        .iter()
        .fold(0u64, |acc, b| (acc << 7) | u64::from(b & 0x7f));
    let mut offset = 10 + size;
    if flags & 0x10 != 0 {
        offset += 10;
    }
    // FLAC files occasionally carry an ID3v2 tag in front of the stream marker.
    let rest = usize::try_from(offset).ok().and_then(|o| prefix.get(o..));
    match rest {
        Some(rest) if rest.starts_with(b"fLaC") => flac_offset(prefix, offset as usize).unwrap_or(offset),
        _ => offset,
    }
}

fn flac_offset(prefix: &[u8], start: usize) -> Option<u64> {
    let mut pos = start + 4;
    loop {
        let header = prefix.get(pos..pos + 4)?;
        let last = header[0] & 0x80 != 0;
        let len = (usize::from(header[1]) << 16) | (usize::from(header[2]) << 8) | usize::from(header[3]);
        pos += 4 + len;
        if last {
            return Some(pos as u64);
        }
    }
}

fn riff_offset(prefix: &[u8]) -> Option<u64> {
    let mut pos = 12usize;
    loop {
        let id = prefix.get(pos..pos + 4)?;
        let size = u32::from_le_bytes(prefix.get(pos + 4..pos + 8)?.try_into().ok()?) as usize;
        if id == b"data" {
            return Some((pos + 8) as u64);
        }
        pos += 8 + size + (size & 1);
    }
}

fn aiff_offset(prefix: &[u8]) -> Option<u64> {
    let mut pos = 12usize;
    loop {
        let id = prefix.get(pos..pos + 4)?;
        let size = u32::from_be_bytes(prefix.get(pos + 4..pos + 8)?.try_into().ok()?) as usize;
        if id == b"SSND" {
            let skip = u32::from_be_bytes(prefix.get(pos + 8..pos + 12)?.try_into().ok()?);
            return Some((pos + 16) as u64 + u64::from(skip));
        }
        pos += 8 + size + (size & 1);
    }
}
