//! Pure functions that turn a ClientHello payload into forged TLS records.
//!
//! Each fragment on the wire is a complete, self-contained TLS application
//! data record: `16 03 04 <u16 big-endian length> <payload>`. The `03 04`
//! record version is deliberately TLS 1.3's, regardless of what the client
//! actually negotiated — real TLS stacks reassemble on content, and this is
//! what confuses stateless SNI matchers that expect the ClientHello's true
//! record version to match.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Record header bytes shared by every forged fragment.
const RECORD_PREFIX: [u8; 3] = [0x16, 0x03, 0x04];

/// Fixed chunk size used by `split` and `split-jitter`.
const SPLIT_CHUNK_SIZE: usize = 32;

/// Inter-fragment jitter sleep bounds (inclusive lower, exclusive upper) in ms.
pub const JITTER_MIN_MS: u64 = 1;
/// See [`JITTER_MIN_MS`].
pub const JITTER_MAX_MS_EXCLUSIVE: u64 = 6;

/// Which fragmentation algorithm to apply to the first TLS record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentMethod {
    /// Variable-length random-size chunks.
    Random,
    /// Splits precisely around the located SNI extension.
    Sni,
    /// Fixed 32-byte chunks, written as one concatenated buffer.
    Split,
    /// Fixed 32-byte chunks, written one at a time with jitter sleeps between.
    SplitJitter,
}

impl std::str::FromStr for FragmentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "sni" => Ok(Self::Sni),
            "split" => Ok(Self::Split),
            "split-jitter" => Ok(Self::SplitJitter),
            other => Err(format!("unknown fragment method '{other}'")),
        }
    }
}

impl std::fmt::Display for FragmentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Random => "random",
            Self::Sni => "sni",
            Self::Split => "split",
            Self::SplitJitter => "split-jitter",
        };
        f.write_str(s)
    }
}

fn build_record(payload: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(RECORD_PREFIX.len() + 2 + payload.len());
    record.extend_from_slice(&RECORD_PREFIX);
    record.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    record.extend_from_slice(payload);
    record
}

/// Position of the SNI string within a ClientHello body, as a byte range.
fn extract_sni_position(data: &[u8]) -> Option<(usize, usize)> {
    let mut search_from = 0usize;
    while let Some(rel) = find_subslice(&data[search_from..], &[0x00, 0x00]) {
        let pos = search_from + rel;
        if pos + 9 <= data.len() {
            let ext_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
            let list_len = u16::from_be_bytes([data[pos + 4], data[pos + 5]]) as usize;
            let name_len = u16::from_be_bytes([data[pos + 7], data[pos + 8]]) as usize;
            let valid = ext_len.checked_sub(list_len) == Some(2)
                && list_len.checked_sub(name_len) == Some(3)
                && name_len > 0;
            if valid {
                let sni_start = pos + 9;
                let sni_end = sni_start + name_len;
                if sni_end <= data.len() {
                    return Some((sni_start, sni_end));
                }
            }
        }
        search_from = pos + 1;
        if search_from >= data.len() {
            break;
        }
    }
    None
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn fragment_sni(data: &[u8]) -> Option<Vec<Vec<u8>>> {
    let (sni_start, sni_end) = extract_sni_position(data)?;
    let pre = &data[..sni_start];
    let sni = &data[sni_start..sni_end];
    let post = &data[sni_end..];
    let mid = sni.len().div_ceil(2);
    Some(vec![
        build_record(pre),
        build_record(&sni[..mid]),
        build_record(&sni[mid..]),
        build_record(post),
    ])
}

fn fragment_split(data: &[u8]) -> Vec<Vec<u8>> {
    data.chunks(SPLIT_CHUNK_SIZE).map(build_record).collect()
}

fn fragment_random(data: &[u8]) -> Vec<Vec<u8>> {
    let mut parts = Vec::new();
    let mut rest = data;

    if let Some(pos0) = rest.iter().position(|&b| b == 0) {
        let (head, tail) = rest.split_at(pos0 + 1);
        parts.push(build_record(head));
        rest = tail;
    }

    let mut rng = rand::thread_rng();
    while !rest.is_empty() {
        let n = rng.gen_range(1..=rest.len());
        let (chunk, tail) = rest.split_at(n);
        parts.push(build_record(chunk));
        rest = tail;
    }
    parts
}

/// Fragment `data` (the bytes following the 5-byte TLS record header) per
/// `method`. Returns an empty vector for empty input — the caller is then
/// expected to forward `head + data` unmodified.
///
/// Concatenating the payloads of the returned records always reproduces
/// `data` exactly.
pub fn fragment(data: &[u8], method: FragmentMethod) -> Vec<Vec<u8>> {
    if data.is_empty() {
        return Vec::new();
    }

    match method {
        FragmentMethod::Sni => fragment_sni(data).unwrap_or_else(|| fragment_split(data)),
        FragmentMethod::Split | FragmentMethod::SplitJitter => fragment_split(data),
        FragmentMethod::Random => fragment_random(data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concat_payloads(records: &[Vec<u8>]) -> Vec<u8> {
        records
            .iter()
            .flat_map(|r| r[5..].to_vec())
            .collect::<Vec<u8>>()
    }

    fn synthetic_client_hello_with_sni(sni: &[u8]) -> Vec<u8> {
        let mut data = vec![0xAA; 10];
        data.extend_from_slice(&[0x00, 0x00]);
        let list_len = sni.len() + 3;
        let ext_len = list_len + 2;
        data.extend_from_slice(&(ext_len as u16).to_be_bytes());
        data.extend_from_slice(&(list_len as u16).to_be_bytes());
        data.push(0x00); // name type
        data.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        data.extend_from_slice(sni);
        data.extend_from_slice(&[0xBB; 20]);
        data
    }

    #[test]
    fn empty_data_produces_no_fragments() {
        assert!(fragment(&[], FragmentMethod::Sni).is_empty());
        assert!(fragment(&[], FragmentMethod::Random).is_empty());
        assert!(fragment(&[], FragmentMethod::Split).is_empty());
    }

    #[test]
    fn split_emits_32_byte_chunks_and_round_trips() {
        let data: Vec<u8> = (0..100).collect();
        let parts = fragment(&data, FragmentMethod::Split);
        assert_eq!(parts.len(), 4); // 32 + 32 + 32 + 4
        assert_eq!(concat_payloads(&parts), data);
        for part in &parts[..3] {
            assert_eq!(part.len(), 3 + 2 + 32);
        }
    }

    #[test]
    fn random_round_trips_for_arbitrary_data() {
        let data: Vec<u8> = (0..250).map(|i| (i % 251) as u8).collect();
        let parts = fragment(&data, FragmentMethod::Random);
        assert!(!parts.is_empty());
        assert_eq!(concat_payloads(&parts), data);
    }

    #[test]
    fn random_with_no_zero_byte_still_round_trips() {
        let data: Vec<u8> = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let parts = fragment(&data, FragmentMethod::Random);
        assert_eq!(concat_payloads(&parts), data);
    }

    #[test]
    fn sni_splits_into_four_records_around_extracted_name() {
        let data = synthetic_client_hello_with_sni(b"blocked.test");
        let parts = fragment(&data, FragmentMethod::Sni);
        assert_eq!(parts.len(), 4);
        assert_eq!(concat_payloads(&parts), data);
    }

    #[test]
    fn sni_falls_back_to_split_when_no_extension_found() {
        let data = vec![0x01; 70];
        let parts = fragment(&data, FragmentMethod::Sni);
        assert_eq!(concat_payloads(&parts), data);
        assert_eq!(parts.len(), 3);
    }

    #[test]
    fn every_record_has_the_forged_tls13_prefix() {
        let data = vec![0x42; 10];
        for part in fragment(&data, FragmentMethod::Split) {
            assert_eq!(&part[..3], &[0x16, 0x03, 0x04]);
        }
    }

    #[test]
    fn fragment_method_parses_from_str() {
        assert_eq!(
            "split-jitter".parse::<FragmentMethod>().unwrap(),
            FragmentMethod::SplitJitter
        );
        assert!("bogus".parse::<FragmentMethod>().is_err());
    }

    proptest::proptest! {
        #[test]
        fn round_trip_holds_for_arbitrary_bytes_and_methods(
            data in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..512),
            method_idx in 0..4usize,
        ) {
            let method = [
                FragmentMethod::Random,
                FragmentMethod::Sni,
                FragmentMethod::Split,
                FragmentMethod::SplitJitter,
            ][method_idx];
            let parts = fragment(&data, method);
            let rebuilt = concat_payloads(&parts);
            proptest::prop_assert_eq!(rebuilt, data);
        }
    }
}
