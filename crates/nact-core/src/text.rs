//! Pont CP932 ↔ UTF-8 et compaction des kana demi-chasse.
//!
//! Le runtime représente un sous-ensemble des caractères SJIS deux octets
//! par un seul octet (« forme compactée ») ; les tables ci-dessous sont la
//! bijection entre les deux formes. Le transcodage proprement dit passe par
//! `encoding_rs` (SHIFT_JIS y implémente windows-31j), confiné à ce module.

use encoding_rs::SHIFT_JIS;

use crate::{CoreError, CoreResult};

/// Demi-chasse katakana (plage SJIS mono-octet).
pub fn is_sjis_half_kana(c: u8) -> bool {
    (0xa1..=0xdf).contains(&c)
}

/// Octet représentant un caractère compacté.
pub fn is_compacted_sjis(c: u8) -> bool {
    c == b' ' || (0xa1..=0xdd).contains(&c)
}

/// Premier octet d'une paire SJIS.
pub fn is_sjis_byte1(c: u8) -> bool {
    (0x81..=0x9f).contains(&c) || (0xe0..=0xfc).contains(&c)
}

/// Second octet d'une paire SJIS.
pub fn is_sjis_byte2(c: u8) -> bool {
    (0x40..=0xfc).contains(&c) && c != 0x7f
}

/// Paire SJIS bien formée.
pub fn is_valid_sjis(c1: u8, c2: u8) -> bool {
    is_sjis_byte1(c1) && is_sjis_byte2(c2)
}

/// Octet de continuation UTF-8.
pub fn is_utf8_trail(b: u8) -> bool {
    b & 0xc0 == 0x80
}

// Formes compactées des lignes SJIS 0x81xx, indexées par c2 - 0x40.
const HANKAKU81: [u8; 192] = [
    0x20, 0xa4, 0xa1, 0x00, 0x00, 0xa5, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0xb0, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0xa2, 0xa3, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

// Formes compactées des lignes SJIS 0x82xx, indexées par c2 - 0x40.
const HANKAKU82: [u8; 192] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xa7,
    0xb1, 0xa8, 0xb2, 0xa9, 0xb3, 0xaa, 0xb4, 0xab,
    0xb5, 0xb6, 0x00, 0xb7, 0x00, 0xb8, 0x00, 0xb9,
    0x00, 0xba, 0x00, 0xbb, 0x00, 0xbc, 0x00, 0xbd,
    0x00, 0xbe, 0x00, 0xbf, 0x00, 0xc0, 0x00, 0xc1,
    0x00, 0xaf, 0xc2, 0x00, 0xc3, 0x00, 0xc4, 0x00,
    0xc5, 0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0x00, 0x00,
    0xcb, 0x00, 0x00, 0xcc, 0x00, 0x00, 0xcd, 0x00,
    0x00, 0xce, 0x00, 0x00, 0xcf, 0xd0, 0xd1, 0xd2,
    0xd3, 0xac, 0xd4, 0xad, 0xd5, 0xae, 0xd6, 0xd7,
    0xd8, 0xd9, 0xda, 0xdb, 0x00, 0xdc, 0x00, 0x00,
    0xa6, 0xdd, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

// Formes pleines, indexées par (octet compacté) - 0xA0.
const KANATBL: [u16; 64] = [
    0x8140, 0x8142, 0x8175, 0x8176, 0x8141, 0x8145, 0x82f0, 0x829f,
    0x82a1, 0x82a3, 0x82a5, 0x82a7, 0x82e1, 0x82e3, 0x82e5, 0x82c1,
    0x815b, 0x82a0, 0x82a2, 0x82a4, 0x82a6, 0x82a8, 0x82a9, 0x82ab,
    0x82ad, 0x82af, 0x82b1, 0x82b3, 0x82b5, 0x82b7, 0x82b9, 0x82bb,
    0x82bd, 0x82bf, 0x82c2, 0x82c4, 0x82c6, 0x82c8, 0x82c9, 0x82ca,
    0x82cb, 0x82cc, 0x82cd, 0x82d0, 0x82d3, 0x82d6, 0x82d9, 0x82dc,
    0x82dd, 0x82de, 0x82df, 0x82e0, 0x82e2, 0x82e4, 0x82e6, 0x82e7,
    0x82e8, 0x82e9, 0x82ea, 0x82eb, 0x82ed, 0x82f1, 0x814a, 0x814b,
];

/// Forme compactée d'une paire SJIS, si elle existe.
pub fn compact_sjis(c1: u8, c2: u8) -> Option<u8> {
    let table = match c1 {
        0x81 => &HANKAKU81,
        0x82 => &HANKAKU82,
        _ => return None,
    };
    match table[usize::from(c2) - 0x40] {
        0 => None,
        hk => Some(hk),
    }
}

/// Forme pleine d'un octet compacté, si c'en est un.
pub fn expand_sjis(c: u8) -> Option<u16> {
    if c == b' ' {
        Some(KANATBL[0])
    } else if is_compacted_sjis(c) {
        Some(KANATBL[usize::from(c) - 0xa0])
    } else {
        None
    }
}

/// Décode un buffer CP932 en UTF-8. L'erreur porte l'offset du premier
/// octet invalide.
pub fn to_utf8(bytes: &[u8]) -> CoreResult<String> {
    if let Some(at) = validate_cp932(bytes) {
        return Err(CoreError::InvalidCp932(at));
    }
    let (s, _, _) = SHIFT_JIS.decode(bytes);
    Ok(s.into_owned())
}

/// Décode un buffer CP932 en remplaçant les séquences invalides (U+FFFD).
pub fn to_utf8_sub(bytes: &[u8]) -> String {
    SHIFT_JIS.decode(bytes).0.into_owned()
}

/// Encode une chaîne UTF-8 en CP932. Échoue sur le premier caractère non
/// représentable.
pub fn to_cp932(s: &str) -> CoreResult<Vec<u8>> {
    let (bytes, _, had_errors) = SHIFT_JIS.encode(s);
    if had_errors {
        for c in s.chars() {
            let mut one = [0u8; 4];
            let (_, _, bad) = SHIFT_JIS.encode(c.encode_utf8(&mut one));
            if bad {
                return Err(CoreError::Unencodable(c));
            }
        }
    }
    Ok(bytes.into_owned())
}

/// Encode en CP932 avec caractère de substitution.
pub fn to_cp932_sub(s: &str, sub: char) -> Vec<u8> {
    let (bytes, _, had_errors) = SHIFT_JIS.encode(s);
    if !had_errors {
        return bytes.into_owned();
    }
    let mut out = Vec::with_capacity(s.len());
    let mut one = [0u8; 4];
    let mut sub_buf = [0u8; 4];
    let sub = sub.encode_utf8(&mut sub_buf).as_bytes().to_vec();
    for c in s.chars() {
        let (bytes, _, bad) = SHIFT_JIS.encode(c.encode_utf8(&mut one));
        if bad {
            out.extend_from_slice(&sub);
        } else {
            out.extend_from_slice(&bytes);
        }
    }
    out
}

/// Offset du premier octet UTF-8 invalide, ou None si le buffer est valide.
pub fn validate_utf8(bytes: &[u8]) -> Option<usize> {
    std::str::from_utf8(bytes).err().map(|e| e.valid_up_to())
}

// Offset de la première séquence CP932 mal formée.
fn validate_cp932(bytes: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c < 0x80 || is_sjis_half_kana(c) {
            i += 1;
        } else if is_sjis_byte1(c) {
            match bytes.get(i + 1) {
                Some(&c2) if is_sjis_byte2(c2) => i += 2,
                _ => return Some(i),
            }
        } else {
            return Some(i);
        }
    }
    None
}

/// Vrai si la paire SJIS traverse Unicode sans perte (décodage puis
/// réencodage identiques). Les doublons NEC/IBM et les gaiji échouent.
pub fn is_unicode_safe(c1: u8, c2: u8) -> bool {
    let pair = [c1, c2];
    let (s, _, had_errors) = SHIFT_JIS.decode(&pair);
    if had_errors {
        return false;
    }
    let (back, _, bad) = SHIFT_JIS.encode(&s);
    !bad && back.as_ref() == pair
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn compaction_is_a_bijection() {
        for c in 0u8..=0xff {
            match expand_sjis(c) {
                Some(full) => {
                    assert!(is_compacted_sjis(c), "expand_sjis({c:#04x}) on a non-compacted byte");
                    let half = compact_sjis((full >> 8) as u8, full as u8);
                    assert_eq!(half, Some(c), "compact(expand({c:#04x}))");
                }
                None => assert!(!is_compacted_sjis(c)),
            }
        }
        for c1 in 0x81u8..=0x82 {
            for c2 in 0x40u8..=0xff {
                if let Some(half) = compact_sjis(c1, c2) {
                    assert_eq!(expand_sjis(half), Some(u16::from(c1) << 8 | u16::from(c2)));
                }
            }
        }
    }

    #[test]
    fn transcodes_both_ways() {
        let sjis: &[u8] = &[0x82, 0xa0, 0x82, 0xa2]; // あい
        assert_eq!(to_utf8(sjis).unwrap(), "あい");
        assert_eq!(to_cp932("あい").unwrap(), sjis);
    }

    #[test]
    fn half_kana_passes_through() {
        let sjis: &[u8] = &[0xb1, 0xb2]; // ｱｲ
        assert_eq!(to_utf8(sjis).unwrap(), "ｱｲ");
    }

    #[test]
    fn invalid_cp932_reports_offset() {
        let bytes: &[u8] = &[b'a', 0x82, 0xa0, 0x80, b'b'];
        assert_eq!(to_utf8(bytes), Err(CoreError::InvalidCp932(3)));
    }

    #[test]
    fn unencodable_chars_are_rejected_or_substituted() {
        assert!(matches!(to_cp932("héllo"), Err(CoreError::Unencodable('é'))));
        assert_eq!(to_cp932_sub("héllo", '?'), b"h?llo".to_vec());
    }

    #[test]
    fn utf8_validation_offset() {
        assert_eq!(validate_utf8(b"ok"), None);
        assert_eq!(validate_utf8(&[b'o', b'k', 0xff]), Some(2));
    }

    #[test]
    fn plain_kana_is_unicode_safe() {
        assert!(is_unicode_safe(0x82, 0xa0)); // あ
        assert!(!is_unicode_safe(0xf0, 0x40)); // gaiji
    }
}
