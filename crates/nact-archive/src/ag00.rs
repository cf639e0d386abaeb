//! Table AG00 : les noms de verbes et d'objets des menus verbe-objet.
//!
//! Format texte CP932 : un en-tête `uk1,verbes,objets,uk2` terminé CRLF,
//! puis chaque nom terminé par `\r`, et un octet final 0x1A. Les deux
//! compteurs sont limités à 256.

use std::fs;
use std::path::Path;

use nact_core::text;

use crate::{ArchiveError, Result};

/// Contenu d'un fichier AG00.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ag00 {
    /// Premier champ inconnu de l'en-tête.
    pub uk1: u32,
    /// Second champ inconnu de l'en-tête.
    pub uk2: u32,
    /// Noms de verbes (UTF-8).
    pub verbs: Vec<String>,
    /// Noms d'objets (UTF-8).
    pub objects: Vec<String>,
}

fn bad(path: &Path, msg: impl Into<String>) -> ArchiveError {
    ArchiveError::BadAg00 { path: path.to_owned(), msg: msg.into() }
}

// Une « ligne » AG00 : tout jusqu'au prochain \r, en ignorant les \n.
fn next_line<'d>(data: &mut &'d [u8]) -> Option<&'d [u8]> {
    if data.is_empty() || data[0] == 0x1a {
        return None;
    }
    let end = data.iter().position(|&b| b == b'\r').unwrap_or(data.len());
    let line = &data[..end];
    *data = &data[(end + 1).min(data.len())..];
    Some(line)
}

/// Lit un fichier AG00.
pub fn read(path: &Path) -> Result<Ag00> {
    let bytes = fs::read(path).map_err(|e| ArchiveError::io(path, e))?;
    let mut rest = bytes.as_slice();

    let header = next_line(&mut rest).ok_or_else(|| bad(path, "invalid AG00 header"))?;
    let header = std::str::from_utf8(header).map_err(|_| bad(path, "invalid AG00 header"))?;
    let fields: Vec<u32> = header
        .split(',')
        .map(|f| f.trim().parse::<u32>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| bad(path, "invalid AG00 header"))?;
    let &[uk1, nr_verbs, nr_objs, uk2] = fields.as_slice() else {
        return Err(bad(path, "invalid AG00 header"));
    };
    if nr_verbs > 256 || nr_objs > 256 {
        return Err(bad(path, "invalid AG00 data"));
    }

    let mut names = |count: u32| -> Result<Vec<String>> {
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let raw = next_line(&mut rest).ok_or_else(|| bad(path, "invalid AG00 file"))?;
            let raw: Vec<u8> = raw.iter().copied().filter(|&b| b != b'\n').collect();
            if raw.is_empty() {
                return Err(bad(path, "invalid AG00 file"));
            }
            let name = text::to_utf8(&raw)
                .map_err(|source| ArchiveError::Text { path: path.to_owned(), source })?;
            out.push(name);
        }
        Ok(out)
    };
    let verbs = names(nr_verbs)?;
    let objects = names(nr_objs)?;

    Ok(Ag00 { uk1, uk2, verbs, objects })
}

/// Écrit un fichier AG00.
pub fn write(ag00: &Ag00, path: &Path) -> Result<()> {
    let mut out = Vec::new();
    out.extend_from_slice(
        format!("{},{},{},{}\r\n", ag00.uk1, ag00.verbs.len(), ag00.objects.len(), ag00.uk2)
            .as_bytes(),
    );
    for name in ag00.verbs.iter().chain(&ag00.objects) {
        let sjis = text::to_cp932(name)
            .map_err(|source| ArchiveError::Text { path: path.to_owned(), source })?;
        out.extend_from_slice(&sjis);
        out.push(b'\r');
    }
    out.push(0x1a);
    fs::write(path, out).map_err(|e| ArchiveError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn roundtrips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AG00.DAT");
        let ag00 = Ag00 {
            uk1: 1,
            uk2: 4,
            verbs: vec!["見る".into(), "取る".into()],
            objects: vec!["ドア".into()],
        };
        write(&ag00, &path).unwrap();
        assert_eq!(read(&path).unwrap(), ag00);

        let bytes = fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"1,2,1,4\r\n"));
        assert_eq!(*bytes.last().unwrap(), 0x1a);
    }

    #[test]
    fn rejects_oversized_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AG00.DAT");
        fs::write(&path, b"0,999,0,0\r\n\x1a").unwrap();
        assert!(matches!(read(&path), Err(ArchiveError::BadAg00 { .. })));
    }

    #[test]
    fn rejects_missing_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("AG00.DAT");
        fs::write(&path, b"0,2,0,0\r\nlook\r\x1a").unwrap();
        assert!(matches!(read(&path), Err(ArchiveError::BadAg00 { .. })));
    }
}
