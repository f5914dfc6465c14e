//! Just enough fragmented-MP4 box walking to find protection data:
//! `pssh` boxes in init segments, and the `senc` table plus `mdat` payload
//! of an encrypted media fragment.

use std::ops::Range;

use mediaproc_codec::cenc::parse_subsamples;
use mediaproc_codec::{DecryptError, ProtectionInfo};
use thiserror::Error;

/// Per-sample IV size of the `cenc` scheme.
pub const CENC_IV_SIZE: usize = 8;
const SENC_USE_SUBSAMPLES: u32 = 0x2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FragmentError {
    #[error("senc box is truncated")]
    TruncatedSenc,
    #[error("bad subsample table: {0}")]
    Subsamples(#[from] DecryptError),
    #[error("fragment has sample encryption but no mdat")]
    MissingMdat,
    #[error("{0} samples without subsample tables cannot be sized")]
    UnsizedSamples(usize),
    #[error("samples need {needed} bytes but mdat holds {available}")]
    SamplesOverrunMdat { needed: usize, available: usize },
}

/// One encrypted sample: where it sits in the fragment and how to decrypt it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedSample {
    pub range: Range<usize>,
    pub info: ProtectionInfo,
}

/// Top-level boxes of `data` as (type, absolute payload range).
/// Stops at the first malformed header.
fn boxes(data: &[u8], base: usize) -> impl Iterator<Item = ([u8; 4], Range<usize>)> + '_ {
    let mut pos = 0usize;
    std::iter::from_fn(move || {
        if pos + 8 > data.len() {
            return None;
        }
        let size = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        if size < 8 || pos + size > data.len() {
            return None;
        }
        let kind = [data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]];
        let payload = base + pos + 8..base + pos + size;
        pos += size;
        Some((kind, payload))
    })
}

/// Find a `pssh` box at the top level or inside `moov`.
/// Returns the system id in UUID form and the whole box.
pub fn find_pssh(data: &[u8]) -> Option<(String, Vec<u8>)> {
    for (kind, payload) in boxes(data, 0) {
        match &kind {
            b"pssh" if payload.len() >= 20 => {
                let id = &data[payload.start + 4..payload.start + 20];
                let hex: String = id.iter().map(|b| format!("{b:02x}")).collect();
                let uuid = format!(
                    "{}-{}-{}-{}-{}",
                    &hex[0..8],
                    &hex[8..12],
                    &hex[12..16],
                    &hex[16..20],
                    &hex[20..32]
                );
                return Some((uuid, data[payload.start - 8..payload.end].to_vec()));
            }
            b"moov" => {
                if let Some(found) = find_pssh(&data[payload]) {
                    return Some(found);
                }
            }
            _ => {}
        }
    }
    None
}

fn find_senc(data: &[u8]) -> Option<Range<usize>> {
    let (_, moof) = boxes(data, 0).find(|(kind, _)| kind == b"moof")?;
    boxes(&data[moof.clone()], moof.start)
        .filter(|(kind, _)| kind == b"traf")
        .find_map(|(_, traf)| {
            boxes(&data[traf.clone()], traf.start)
                .find(|(kind, _)| kind == b"senc")
                .map(|(_, senc)| senc)
        })
}

fn parse_senc(senc: &[u8]) -> Result<Vec<ProtectionInfo>, FragmentError> {
    let header = senc.get(..8).ok_or(FragmentError::TruncatedSenc)?;
    let flags = u32::from_be_bytes([0, header[1], header[2], header[3]]);
    let count = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

    let mut pos = 8usize;
    let mut samples = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let iv = senc
            .get(pos..pos + CENC_IV_SIZE)
            .ok_or(FragmentError::TruncatedSenc)?
            .to_vec();
        pos += CENC_IV_SIZE;
        let subsamples = if flags & SENC_USE_SUBSAMPLES != 0 {
            let n = senc.get(pos..pos + 2).ok_or(FragmentError::TruncatedSenc)?;
            let n = u16::from_be_bytes([n[0], n[1]]) as usize;
            pos += 2;
            let table = parse_subsamples(&senc[pos..], n)?;
            pos += n * mediaproc_codec::cenc::SUBSAMPLE_ENTRY_SIZE;
            table
        } else {
            Vec::new()
        };
        samples.push(ProtectionInfo {
            encrypted: true,
            key_id: Vec::new(),
            iv,
            subsamples,
        });
    }
    Ok(samples)
}

/// The encrypted samples of a media fragment, or `None` when the fragment
/// carries no `senc` box.
///
/// Sample sizes come from the subsample tables, with the last sample taking
/// the rest of `mdat`. A fragment without subsample tables must hold a
/// single sample.
pub fn protected_samples(data: &[u8]) -> Result<Option<Vec<ProtectedSample>>, FragmentError> {
    let Some(senc) = find_senc(data) else {
        return Ok(None);
    };
    let infos = parse_senc(&data[senc])?;
    let (_, mdat) = boxes(data, 0)
        .find(|(kind, _)| kind == b"mdat")
        .ok_or(FragmentError::MissingMdat)?;

    if infos.len() > 1 && infos.iter().any(|info| info.subsamples.is_empty()) {
        return Err(FragmentError::UnsizedSamples(infos.len()));
    }

    let last = infos.len().saturating_sub(1);
    let mut start = mdat.start;
    let mut samples = Vec::with_capacity(infos.len());
    for (i, info) in infos.into_iter().enumerate() {
        let end = if i == last {
            mdat.end
        } else {
            start
                + info
                    .subsamples
                    .iter()
                    .map(|s| s.clear_bytes as usize + s.encrypted_bytes as usize)
                    .sum::<usize>()
        };
        if end > mdat.end {
            return Err(FragmentError::SamplesOverrunMdat {
                needed: end - mdat.start,
                available: mdat.len(),
            });
        }
        samples.push(ProtectedSample {
            range: start..end,
            info,
        });
        start = end;
    }
    Ok(Some(samples))
}
