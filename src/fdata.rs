//! .fdata container decoding and .yumiamod.json sidecar parsing.
//!
//! An .fdata file packs game assets as a sequence of framed entries:
//!
//! - optional 16-byte outer header starting with `PDRK0000`
//! - per entry: 8-byte magic `IDRK0000`, three little-endian u64 sizes
//!   (entry, compressed, uncompressed), then u32 entry type, name hash,
//!   tkid hash and flags, then `entry_size - compressed_size - 0x30` bytes
//!   of metadata, then the payload
//! - payload is stored raw when compressed == uncompressed, otherwise as a
//!   run of zlib chunks; each chunk carries a u32 length prefix when flag
//!   bit 0x100000 is set, else a u16 length plus 8 reserved bytes
//! - entries are aligned to 16 bytes; a corrupt frame is recovered by
//!   scanning for the next entry magic instead of abandoning the decode
//!
//! The sidecar JSON maps `(name_hash, tkid_hash)` pairs to the asset's real
//! filename; entries without a sidecar match fall back to
//! `0x{name_hash:08X}.{ext}` using the tkid extension table. Decode only:
//! containers are never re-encoded, conversion is strictly one direction.

use std::collections::{BTreeSet, HashMap};
use std::io::{Cursor, Read};

use anyhow::{anyhow, bail, Context, Result as AnyResult};
use base64::Engine;
use binrw::prelude::*;
use flate2::read::ZlibDecoder;
use serde::Deserialize;

/// Magic opening an optional container-level header.
pub const OUTER_MAGIC: &[u8; 8] = b"PDRK0000";

/// Magic opening every asset entry.
pub const ENTRY_MAGIC: &[u8; 8] = b"IDRK0000";

/// Flag bit selecting the wide (u32) chunk length prefix.
const CHUNK_LEN_U32: u32 = 0x0010_0000;

/// Fixed header bytes per entry: magic + sizes + identity block.
const ENTRY_HEADER_SIZE: u64 = 0x30;

/// Entry frame header, immediately after the `IDRK0000` magic.
#[derive(Debug, BinRead)]
#[br(little, magic = b"IDRK0000")]
struct EntryHeader {
    entry_size: u64,
    compressed_size: u64,
    uncompressed_size: u64,
    #[allow(dead_code)]
    entry_type: u32,
    name_hash: u32,
    tkid_hash: u32,
    flags: u32,
}

/// One decoded asset from a container.
#[derive(Debug)]
pub struct ContainerEntry {
    pub name_hash: u32,
    pub tkid_hash: u32,
    /// Uncompressed payload bytes.
    pub data: Vec<u8>,
    /// Filename used when no sidecar override exists.
    pub fallback_name: String,
}

/// Decode every entry in a container.
pub fn decode_container(data: &[u8]) -> AnyResult<Vec<ContainerEntry>> {
    let mut pos = if data.starts_with(OUTER_MAGIC) { 0x10 } else { 0 };
    let mut entries = Vec::new();

    while pos < data.len() {
        let offset = match locate_entry(data, pos) {
            Some(offset) => offset,
            None => break,
        };

        let mut cursor = Cursor::new(data);
        cursor.set_position(offset as u64);
        let header = EntryHeader::read(&mut cursor)
            .with_context(|| format!("reading container entry header at 0x{offset:X}"))?;

        let payload = read_payload(data, offset, &header)
            .with_context(|| format!("decoding container entry at 0x{offset:X}"))?;

        entries.push(ContainerEntry {
            name_hash: header.name_hash,
            tkid_hash: header.tkid_hash,
            fallback_name: fallback_filename(header.name_hash, header.tkid_hash),
            data: payload,
        });

        let mut entry_end = offset
            .checked_add(header.entry_size as usize)
            .ok_or_else(|| anyhow!("entry size overflow at 0x{offset:X}"))?;
        if entry_end % 0x10 != 0 {
            entry_end += 0x10 - entry_end % 0x10;
        }
        pos = entry_end;
    }

    Ok(entries)
}

/// Find the next entry magic at or after `pos`.
///
/// A well-formed container has the magic exactly at `pos`; otherwise back up
/// one frame's worth and scan forward so a single corrupt entry doesn't sink
/// the rest of the file.
fn locate_entry(data: &[u8], pos: usize) -> Option<usize> {
    if data.len().saturating_sub(pos) >= ENTRY_MAGIC.len()
        && &data[pos..pos + ENTRY_MAGIC.len()] == ENTRY_MAGIC
    {
        return Some(pos);
    }
    let mut scan = pos.saturating_sub(0x18);
    while scan + ENTRY_MAGIC.len() <= data.len() {
        if &data[scan..scan + ENTRY_MAGIC.len()] == ENTRY_MAGIC {
            return Some(scan);
        }
        scan += 1;
    }
    None
}

fn read_payload(data: &[u8], offset: usize, header: &EntryHeader) -> AnyResult<Vec<u8>> {
    let metadata_size = header
        .entry_size
        .checked_sub(header.compressed_size)
        .and_then(|v| v.checked_sub(ENTRY_HEADER_SIZE))
        .ok_or_else(|| anyhow!("inconsistent entry sizes"))?;
    let payload_pos = offset + ENTRY_HEADER_SIZE as usize + metadata_size as usize;
    let unc_size = header.uncompressed_size as usize;

    if header.compressed_size == header.uncompressed_size {
        let raw = data
            .get(payload_pos..payload_pos + unc_size)
            .ok_or_else(|| anyhow!("truncated raw payload"))?;
        return Ok(raw.to_vec());
    }

    let mut out: Vec<u8> = Vec::with_capacity(unc_size);
    let mut pos = payload_pos;
    while out.len() < unc_size {
        let zsize = if header.flags & CHUNK_LEN_U32 != 0 {
            let prefix = data
                .get(pos..pos + 4)
                .ok_or_else(|| anyhow!("truncated chunk length"))?;
            pos += 4;
            u32::from_le_bytes(prefix.try_into().unwrap()) as usize
        } else {
            let prefix = data
                .get(pos..pos + 2)
                .ok_or_else(|| anyhow!("truncated chunk length"))?;
            pos += 2 + 8;
            u16::from_le_bytes(prefix.try_into().unwrap()) as usize
        };
        let chunk = data
            .get(pos..pos + zsize)
            .ok_or_else(|| anyhow!("truncated chunk data"))?;
        pos += zsize;

        let mut decoder = ZlibDecoder::new(chunk);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .context("inflating payload chunk")?;
        out.extend_from_slice(&decompressed);
    }

    if out.len() != unc_size {
        bail!(
            "chunked payload decoded to {} bytes, expected {}",
            out.len(),
            unc_size
        );
    }
    Ok(out)
}

/// Fallback filename for an entry with no sidecar record.
pub fn fallback_filename(name_hash: u32, tkid_hash: u32) -> String {
    match tkid_extension(tkid_hash) {
        Some(ext) => format!("0x{name_hash:08X}.{ext}"),
        None => format!("0x{name_hash:08X}.{tkid_hash:#x}"),
    }
}

/// Known tkid hash to asset extension mappings.
fn tkid_extension(tkid_hash: u32) -> Option<&'static str> {
    let ext = match tkid_hash {
        0x0BD05B27 => "mit",
        0x0D34474D => "srst",
        0x133D2C3B => "sid",
        0x17614AF5 => "g1mx",
        0x1A6300FD => "g1es",
        0x1AB40AE8 => "oid",
        0x1FDCAA40 => "kidstask",
        0x20A6A0BB => "kidsobjdb",
        0x27BC54B7 => "rigbin",
        0x2BCC0C02 => "g1frani",
        0x32AC9403 => "g1fpose",
        0x4D0102AC => "g1em",
        0x4F16D0EF => "kts",
        0x5153729B => "mtl",
        0x54738C76 => "g1co",
        0x5599AA51 => "kscl",
        0x563BDEF1 => "g1m",
        0x56D8DEDA => "sid",
        0x56EFE45C => "grp",
        0x5B2970FC => "ktf2",
        0x5C3E543C => "swg",
        0x6DBD6EA6 => "mit",
        0x6FA91671 => "g1a",
        0x757347E0 => "bpo",
        0x786DCD84 => "g1n",
        0x79C724C2 => "g1p",
        0x7BCD279F => "g1s",
        0x82945A44 => "lsqtree",
        0x8E39AA37 => "ktid",
        0x9CB3A4B6 => "oidex",
        0xA027E46B => "mov",
        0xA8D88566 => "g1cox",
        0xAD57EBBA => "g1t_new",
        0xAFBEC60C => "g1t",
        0xB097D41F => "g1e",
        0xB0A14534 => "sgcbin",
        0xB1630F51 => "kidsrender",
        0xB340861A => "mtl",
        0xBBD39F2D => "srsa",
        0xBBF9B49D => "grp",
        0xBE144B78 => "ktid",
        0xBF6B52C7 => "name",
        0xD7F47FB1 => "efpl",
        0xDBCB74A9 => "oid",
        0xE6A3C3BB => "oidex",
        0xED410290 => "kts",
        0xF13845EF => "sclshape",
        0xF20DE437 => "texinfo",
        _ => return None,
    };
    Some(ext)
}

// ── sidecar JSON ─────────────────────────────────────────────────────

/// Parsed .yumiamod.json sidecar.
#[derive(Debug, Default, Deserialize)]
pub struct Sidecar {
    #[serde(default)]
    pub files: Vec<SidecarEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SidecarEntry {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub name_hash: Option<u32>,
    #[serde(default)]
    pub tkid_hash: Option<u32>,
    #[serde(default)]
    pub entry_type: Option<serde_json::Value>,
    /// Opaque tool payloads, validated as base64 and otherwise untouched.
    #[serde(default)]
    pub f_extradata: Option<String>,
    #[serde(default)]
    pub r_extradata: Option<String>,
}

/// Parse sidecar bytes, tolerating a UTF-8 BOM.
pub fn parse_sidecar(data: &[u8]) -> AnyResult<Sidecar> {
    let data = data.strip_prefix(b"\xef\xbb\xbf").unwrap_or(data);
    let sidecar: Sidecar = serde_json::from_slice(data).context("parsing sidecar JSON")?;

    let b64 = base64::engine::general_purpose::STANDARD;
    for entry in &sidecar.files {
        for payload in [&entry.f_extradata, &entry.r_extradata].into_iter().flatten() {
            b64.decode(payload).context("invalid base64 extradata in sidecar")?;
        }
    }
    Ok(sidecar)
}

impl Sidecar {
    /// Authoritative filenames keyed by `(name_hash, tkid_hash)`.
    pub fn filename_overrides(&self) -> HashMap<(u32, u32), String> {
        self.files
            .iter()
            .filter_map(|entry| {
                let name_hash = entry.name_hash?;
                let tkid_hash = entry.tkid_hash?;
                let filename = entry.filename.clone()?;
                Some(((name_hash, tkid_hash), filename))
            })
            .collect()
    }

    /// All asset identity hashes this sidecar references.
    pub fn name_hashes(&self) -> BTreeSet<u32> {
        self.files.iter().filter_map(|entry| entry.name_hash).collect()
    }
}
