//! nact-archive — conteneur à volumes des scénarios.
//!
//! Une archive logique est répartie sur un à vingt-six fichiers physiques
//! identifiés par une lettre (`FOOA.DAT`, `FOOB.DAT`, …). Chaque fichier est
//! indexé par secteurs de 256 octets : région de pointeurs, secteur de
//! liens `(volume, ordinal)`, puis les données. Une entrée peut être
//! répliquée sur plusieurs volumes ; à la lecture les doublons doivent être
//! identiques octet à octet.

#![deny(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Table AG00 des verbes/objets.
pub mod ag00;
/// Lecture/écriture des fichiers de volume.
pub mod volume;

pub use volume::{read_volume, write_volume, VolumeKind};

/// Alias résultat du crate.
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Erreurs structurelles et d'entrées/sorties des archives.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Pointeur de secteur au-delà du fichier.
    #[error("{}: sector offset out of range: {offset}", path.display())]
    SectorOutOfRange {
        /// Fichier fautif.
        path: PathBuf,
        /// Offset calculé.
        offset: i64,
    },
    /// Entrée dépassant la fin du fichier.
    #[error("{}: entry {id} exceeds end of file", path.display())]
    EntryTruncated {
        /// Fichier fautif.
        path: PathBuf,
        /// Identifiant une-base de l'entrée.
        id: u32,
    },
    /// Doublon inter-volumes au contenu différent.
    #[error("duplicate entry with different content: {0}")]
    DuplicateMismatch(u32),
    /// La lettre de volume n'a pas pu être déduite du nom de fichier.
    #[error("{}: cannot determine volume letter from filename", .0.display())]
    BadVolumeName(PathBuf),
    /// Lettre de volume hors de A..Z.
    #[error("volume letter {0} out of range")]
    VolumeOutOfRange(u32),
    /// Table AG00 malformée.
    #[error("{}: {msg}", path.display())]
    BadAg00 {
        /// Fichier fautif.
        path: PathBuf,
        /// Détail.
        msg: String,
    },
    /// Erreur d'entrée/sortie sous-jacente.
    #[error("{}: {source}", path.display())]
    Io {
        /// Fichier fautif.
        path: PathBuf,
        /// Erreur système.
        source: std::io::Error,
    },
    /// Texte non transcodable dans la table AG00.
    #[error("{}: {source}", path.display())]
    Text {
        /// Fichier fautif.
        path: PathBuf,
        /// Erreur de transcodage.
        source: nact_core::CoreError,
    },
}

impl ArchiveError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        ArchiveError::Io { path: path.to_owned(), source }
    }
}

/// Une entrée d'archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Identifiant une-base ; fixe la position dans la séquence logique.
    pub id: u32,
    /// Contenu brut.
    pub data: Vec<u8>,
    /// Bit 1..=26 par lettre de volume A..Z où l'entrée est présente.
    pub volume_bits: u32,
}

impl Entry {
    /// Premier volume où l'entrée apparaît (1 = A).
    pub fn home_volume(&self) -> Option<u32> {
        (1..=volume::MAX_VOLUME).find(|v| self.volume_bits & 1 << v != 0)
    }
}

/// Lettre de volume (1..=26) déduite du premier caractère du nom de base.
pub fn volume_of_path(path: &Path) -> Result<u32> {
    let base = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ArchiveError::BadVolumeName(path.to_owned()))?;
    match base.bytes().next().map(|b| b.to_ascii_uppercase()) {
        Some(b @ b'A'..=b'Z') => Ok(u32::from(b - b'A') + 1),
        _ => Err(ArchiveError::BadVolumeName(path.to_owned())),
    }
}

/// Chemin du volume `volume` obtenu en substituant la lettre dans le nom
/// du volume A.
pub fn path_for_volume(adisk_path: &Path, volume: u32) -> Result<PathBuf> {
    if !(1..=volume::MAX_VOLUME).contains(&volume) {
        return Err(ArchiveError::VolumeOutOfRange(volume));
    }
    if volume == 1 {
        // Le volume A garde le nom donné, quelle que soit sa première
        // lettre.
        return Ok(adisk_path.to_owned());
    }
    let base = adisk_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ArchiveError::BadVolumeName(adisk_path.to_owned()))?;
    let first = base.as_bytes()[0];
    if first.to_ascii_uppercase() != b'A' {
        return Err(ArchiveError::BadVolumeName(adisk_path.to_owned()));
    }
    let letter = (first + (volume - 1) as u8) as char;
    let mut name = String::with_capacity(base.len());
    name.push(letter);
    name.push_str(&base[1..]);
    Ok(adisk_path.with_file_name(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_letter_from_filename() {
        assert_eq!(volume_of_path(Path::new("dir/ADISK.DAT")).unwrap(), 1);
        assert_eq!(volume_of_path(Path::new("bdisk.dat")).unwrap(), 2);
        assert!(volume_of_path(Path::new("1DISK.DAT")).is_err());
    }

    #[test]
    fn substitutes_letter_preserving_case() {
        assert_eq!(
            path_for_volume(Path::new("out/ADISK.DAT"), 3).unwrap(),
            PathBuf::from("out/CDISK.DAT")
        );
        assert_eq!(
            path_for_volume(Path::new("adisk.dat"), 2).unwrap(),
            PathBuf::from("bdisk.dat")
        );
        // Le volume A n'impose rien sur la première lettre.
        assert_eq!(
            path_for_volume(Path::new("GAME.DAT"), 1).unwrap(),
            PathBuf::from("GAME.DAT")
        );
        assert!(path_for_volume(Path::new("GDISK.DAT"), 2).is_err());
        assert!(path_for_volume(Path::new("ADISK.DAT"), 27).is_err());
    }

    #[test]
    fn home_volume_is_first_set_bit() {
        let e = Entry { id: 1, data: vec![], volume_bits: 0b0110 };
        assert_eq!(e.home_volume(), Some(1));
        let none = Entry { id: 1, data: vec![], volume_bits: 0 };
        assert_eq!(none.home_volume(), None);
    }
}
