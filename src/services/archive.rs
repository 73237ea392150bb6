//! Best-effort listing of entry names in a finalized ZIP artifact.
//!
//! Only the end-of-central-directory record and the central directory are
//! read. Anything unexpected (not a ZIP, ZIP64, truncated records) yields an
//! empty listing; callers never see an error.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};
use tracing::debug;

const EOCD_SIGNATURE: u32 = 0x0605_4b50;
const CENTRAL_HEADER_SIGNATURE: u32 = 0x0201_4b50;
const EOCD_LEN: u64 = 22;
const MAX_COMMENT_LEN: u64 = u16::MAX as u64;
const CENTRAL_HEADER_LEN: usize = 46;

/// List entry names of the archive at `path`, or nothing if it cannot be read.
pub async fn list_entries(path: PathBuf) -> Vec<String> {
    let shown = path.display().to_string();
    match tokio::task::spawn_blocking(move || read_central_directory(&path)).await {
        Ok(Ok(names)) => names,
        Ok(Err(err)) => {
            debug!("artifact {} is not a readable archive: {}", shown, err);
            Vec::new()
        }
        Err(err) => {
            debug!("archive listing task for {} failed: {}", shown, err);
            Vec::new()
        }
    }
}

struct EndOfCentralDirectory {
    entries: u16,
    size: u32,
    offset: u32,
}

fn read_central_directory(path: &Path) -> io::Result<Vec<String>> {
    let mut file = File::open(path)?;
    let len = file.seek(SeekFrom::End(0))?;
    let eocd = find_eocd(&mut file, len)?;

    if eocd.entries == u16::MAX || eocd.offset == u32::MAX || eocd.size == u32::MAX {
        return Err(invalid("zip64 archives are not listed"));
    }
    let end = eocd.offset as u64 + eocd.size as u64;
    if end > len {
        return Err(invalid("central directory extends past end of file"));
    }

    let mut directory = vec![0u8; eocd.size as usize];
    file.seek(SeekFrom::Start(eocd.offset as u64))?;
    file.read_exact(&mut directory)?;

    let mut names = Vec::with_capacity(eocd.entries as usize);
    let mut pos = 0usize;
    for _ in 0..eocd.entries {
        let header = directory
            .get(pos..pos + CENTRAL_HEADER_LEN)
            .ok_or_else(|| invalid("truncated central directory header"))?;
        if le_u32(&header[0..4]) != CENTRAL_HEADER_SIGNATURE {
            return Err(invalid("bad central directory signature"));
        }
        let name_len = le_u16(&header[28..30]) as usize;
        let extra_len = le_u16(&header[30..32]) as usize;
        let comment_len = le_u16(&header[32..34]) as usize;

        let name_start = pos + CENTRAL_HEADER_LEN;
        let name = directory
            .get(name_start..name_start + name_len)
            .ok_or_else(|| invalid("truncated entry name"))?;
        names.push(String::from_utf8_lossy(name).into_owned());

        pos = name_start + name_len + extra_len + comment_len;
    }
    Ok(names)
}

/// Scan backwards over the trailing comment window for the EOCD record.
fn find_eocd(file: &mut File, len: u64) -> io::Result<EndOfCentralDirectory> {
    if len < EOCD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "file too small for an archive",
        ));
    }
    let window = (EOCD_LEN + MAX_COMMENT_LEN).min(len);
    let mut tail = vec![0u8; window as usize];
    file.seek(SeekFrom::Start(len - window))?;
    file.read_exact(&mut tail)?;

    let last_start = tail.len() - EOCD_LEN as usize;
    for start in (0..=last_start).rev() {
        let record = &tail[start..start + EOCD_LEN as usize];
        if le_u32(&record[0..4]) == EOCD_SIGNATURE {
            return Ok(EndOfCentralDirectory {
                entries: le_u16(&record[10..12]),
                size: le_u32(&record[12..16]),
                offset: le_u32(&record[16..20]),
            });
        }
    }
    Err(invalid("end of central directory not found"))
}

fn le_u16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}
