use crate::error::{ConvertError, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::{collections::HashMap, fs, path::Path};

/// `(token bytes, rank)` pairs in rank order.
pub type Ranks = Vec<(Vec<u8>, u32)>;

pub fn read_ranks(path: impl AsRef<Path>) -> Result<Ranks> {
    parse_ranks(&fs::read_to_string(path)?)
}

/// Parses a tiktoken rank file: one `<base64 token> <rank>` per line.
pub fn parse_ranks(text: &str) -> Result<Ranks> {
    let mut ranks = Ranks::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let err = |reason: String| ConvertError::Vocab { line: i + 1, reason };

        let Some((token, rank)) = line.split_once(' ') else {
            return Err(err("expected `<base64 token> <rank>`".into()));
        };
        let token = STANDARD
            .decode(token)
            .map_err(|e| err(format!("bad base64: {e}")))?;
        let rank = rank
            .trim()
            .parse::<u32>()
            .map_err(|e| err(format!("bad rank: {e}")))?;
        ranks.push((token, rank));
    }
    ranks.sort_by_key(|(_, rank)| *rank);
    Ok(ranks)
}

/// GPT-2 byte to printable char table used by byte-level BPE.
pub fn bytes_char() -> [char; 256] {
    let mut table = ['\0'; 256];
    let mut n = 0;
    for b in 0..=255u8 {
        table[b as usize] = if matches!(b, b'!'..=b'~' | 0xa1..=0xac | 0xae..=0xff) {
            b as char
        } else {
            n += 1;
            // 0x100..0x144, well below the surrogates
            char::from_u32(0xff + n).unwrap_or(char::REPLACEMENT_CHARACTER)
        };
    }
    table
}

/// Byte-level vocabulary and BPE merges recovered from tiktoken ranks.
///
/// Every way of splitting a token into two ranked halves is a merge, ordered by the rank of
/// the token it produces and, within one token, by the ranks of its halves.
pub fn vocab_and_merges(
    ranks: &[(Vec<u8>, u32)],
) -> (HashMap<String, u32>, Vec<(String, String)>) {
    let table = bytes_char();
    let to_str = |bytes: &[u8]| bytes.iter().map(|&b| table[b as usize]).collect::<String>();

    let lookup = ranks
        .iter()
        .map(|(token, rank)| (token.as_slice(), *rank))
        .collect::<HashMap<_, _>>();

    let mut vocab = HashMap::with_capacity(ranks.len());
    let mut merges = Vec::new();
    for (token, rank) in ranks {
        vocab.insert(to_str(token), *rank);
        if token.len() < 2 {
            continue;
        }
        let mut local = (1..token.len())
            .filter_map(|i| {
                let (l, r) = token.split_at(i);
                Some((lookup.get(l).copied()?, lookup.get(r).copied()?, l, r))
            })
            .collect::<Vec<_>>();
        local.sort_by_key(|&(rl, rr, ..)| (rl, rr));
        merges.extend(local.into_iter().map(|(.., l, r)| (*rank, l, r)));
    }
    merges.sort_by_key(|&(rank, ..)| rank);

    let merges = merges
        .into_iter()
        .map(|(_, l, r)| (to_str(l), to_str(r)))
        .collect();
    (vocab, merges)
}

#[cfg(test)]
pub(crate) fn encode_ranks(tokens: &[&str]) -> String {
    tokens
        .iter()
        .enumerate()
        .map(|(rank, token)| format!("{} {rank}\n", STANDARD.encode(token)))
        .collect()
}

#[test]
fn test_parse_ranks() {
    let ranks = parse_ranks("IQ== 1\n\nIA== 0\n").unwrap();
    assert_eq!(ranks, [(b" ".to_vec(), 0), (b"!".to_vec(), 1)]);

    assert!(matches!(
        parse_ranks("IA== 0\nIQ==\n"),
        Err(ConvertError::Vocab { line: 2, .. })
    ));
    assert!(matches!(
        parse_ranks("@@@ 0\n"),
        Err(ConvertError::Vocab { line: 1, .. })
    ));
    assert!(matches!(
        parse_ranks("IA== x\n"),
        Err(ConvertError::Vocab { line: 1, .. })
    ));
}

#[test]
fn test_bytes_char() {
    let table = bytes_char();
    assert_eq!(table[b'a' as usize], 'a');
    assert_eq!(table[b' ' as usize], 'Ġ');
    assert_eq!(table[b'\n' as usize], 'Ċ');
    assert_eq!(table[0], 'Ā');
    assert_eq!(table[0xad], 'Ń');
    let mut unique = table.to_vec();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 256);
}

#[test]
fn test_vocab_and_merges() {
    let ranks = parse_ranks(&encode_ranks(&[
        "a", "b", "c", " ", "ab", " a", "abc", "bc",
    ]))
    .unwrap();
    let (vocab, merges) = vocab_and_merges(&ranks);
    assert_eq!(vocab["Ġa"], 5);
    assert_eq!(vocab["abc"], 6);
    assert_eq!(vocab.len(), 8);
    let merges = merges
        .iter()
        .map(|(l, r)| (l.as_str(), r.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        merges,
        [
            ("a", "b"),
            ("Ġ", "a"),
            // both splits of "abc", lower-ranked left half first
            ("a", "bc"),
            ("ab", "c"),
            ("b", "c"),
        ]
    );
}
