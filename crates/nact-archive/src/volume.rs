//! Lecture/écriture d'un fichier de volume.
//!
//! Disposition physique, chaque région alignée sur 256 octets :
//!
//! ```text
//! pointeurs : u16 LE par cible, valeur = numéro de secteur + 1
//!   [0] début du secteur de liens   [1] fin du secteur de liens
//!   [2..] fin de chaque entrée présente dans ce volume, dans l'ordre
//! liens : 2 octets par entrée logique : (volume, ordinal 1-base)
//!   (0,0) pour les entrées absentes de toute l'archive ;
//!   variante DRI : octet terminateur 0x1A
//! données : entrées brutes, complétées au secteur
//! ```

use std::fs;
use std::io::Write;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::{ArchiveError, Entry, Result};

/// Nombre maximal de volumes (A..Z).
pub const MAX_VOLUME: u32 = 26;

/// Taille d'un secteur.
pub const SECTOR: usize = 256;

/// Variante du format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeKind {
    /// Un octet de volume par entrée, pas de terminateur de liens.
    Ald,
    /// Masque `volume_bits`, terminateur 0x1A après les liens.
    Dri,
}

impl From<nact_core::ArchiveKind> for VolumeKind {
    fn from(kind: nact_core::ArchiveKind) -> Self {
        match kind {
            nact_core::ArchiveKind::Ald => VolumeKind::Ald,
            nact_core::ArchiveKind::Dri => VolumeKind::Dri,
        }
    }
}

/* ─────────────────────────── Écriture ─────────────────────────── */

fn push_ptr(out: &mut Vec<u8>, sector: &mut u32, size: usize) {
    *sector += ((size + 0xff) >> 8) as u32;
    let n = *sector + 1;
    out.push(n as u8);
    out.push((n >> 8) as u8);
}

fn pad(out: &mut Vec<u8>) {
    while out.len() % SECTOR != 0 {
        out.push(0);
    }
}

fn in_volume(entry: &Entry, volume: u32) -> bool {
    entry.volume_bits & 1 << volume != 0
}

/// Sérialise un fichier de volume. `entries` est la séquence logique
/// complète (les trous sont `None`) ; seules les entrées dont le bit
/// `volume` est levé ont leurs données dans ce fichier.
pub fn write_volume(entries: &[Option<Entry>], volume: u32, kind: VolumeKind) -> Result<Vec<u8>> {
    if !(1..=MAX_VOLUME).contains(&volume) {
        return Err(ArchiveError::VolumeOutOfRange(volume));
    }
    let mut out = Vec::new();
    let mut sector = 0u32;

    let present: Vec<&Entry> = entries
        .iter()
        .flatten()
        .filter(|e| in_volume(e, volume))
        .collect();

    let link_size = entries.len() * 2 + usize::from(kind == VolumeKind::Dri);
    push_ptr(&mut out, &mut sector, (present.len() + 2) * 2);
    push_ptr(&mut out, &mut sector, link_size);
    for entry in &present {
        push_ptr(&mut out, &mut sector, entry.data.len());
    }
    pad(&mut out);

    // Ordinal par volume : combientième entrée de ce volume.
    let mut ordinals = [0u16; MAX_VOLUME as usize + 1];
    for slot in entries {
        let mut vol = 0u32;
        if let Some(entry) = slot {
            for v in 1..=MAX_VOLUME {
                if in_volume(entry, v) {
                    ordinals[v as usize] += 1;
                    if vol == 0 || v == volume {
                        vol = v;
                    }
                }
            }
        }
        out.push(vol as u8);
        out.push(ordinals[vol as usize] as u8);
    }
    if kind == VolumeKind::Dri {
        out.push(0x1a);
    }
    pad(&mut out);

    for entry in &present {
        out.extend_from_slice(&entry.data);
        pad(&mut out);
    }
    Ok(out)
}

/// Écrit le fichier du volume `volume` à `path`.
pub fn write_volume_file(
    entries: &[Option<Entry>],
    volume: u32,
    kind: VolumeKind,
    path: &Path,
) -> Result<()> {
    let bytes = write_volume(entries, volume, kind)?;
    let mut file = fs::File::create(path).map_err(|e| ArchiveError::io(path, e))?;
    file.write_all(&bytes).map_err(|e| ArchiveError::io(path, e))?;
    Ok(())
}

/* ─────────────────────────── Lecture ─────────────────────────── */

fn sector_offset(data: &[u8], index: usize, path: &Path) -> Result<usize> {
    let p = data
        .get(index * 2..index * 2 + 2)
        .ok_or_else(|| ArchiveError::SectorOutOfRange { path: path.to_owned(), offset: -1 })?;
    let offset = i64::from(LittleEndian::read_u16(p)) * SECTOR as i64 - SECTOR as i64;
    if offset < 0 || offset > data.len() as i64 {
        return Err(ArchiveError::SectorOutOfRange { path: path.to_owned(), offset });
    }
    Ok(offset as usize)
}

/// Lit un fichier de volume et fusionne ses entrées dans `entries`
/// (agrandie au besoin). La lettre du volume est déduite du nom de
/// fichier ; les doublons inter-volumes doivent être identiques.
///
/// Les pointeurs ne connaissent que des secteurs : la taille relue est
/// arrondie au secteur, le complément est à zéro. C'est la couche SCO qui
/// retrouve la taille exacte via son en-tête.
pub fn read_volume(entries: &mut Vec<Option<Entry>>, path: &Path) -> Result<()> {
    let volume = crate::volume_of_path(path)?;
    let data = fs::read(path).map_err(|e| ArchiveError::io(path, e))?;
    tracing::debug!(path = %path.display(), volume, size = data.len(), "reading volume");

    let link_start = sector_offset(&data, 0, path)?;
    let link_end = sector_offset(&data, 1, path)?;

    let mut id = 0u32;
    for link in data[link_start..link_end].chunks_exact(2) {
        id += 1;
        let (vol_nr, ptr_nr) = (link[0], link[1]);
        if u32::from(vol_nr) != volume {
            continue;
        }
        let start = sector_offset(&data, usize::from(ptr_nr), path)?;
        let end = sector_offset(&data, usize::from(ptr_nr) + 1, path)?;
        if end < start || end > data.len() {
            return Err(ArchiveError::EntryTruncated { path: path.to_owned(), id });
        }
        let bytes = &data[start..end];

        let slot = id as usize - 1;
        if entries.len() <= slot {
            entries.resize(slot + 1, None);
        }
        match &mut entries[slot] {
            Some(existing) => {
                if existing.data != bytes {
                    return Err(ArchiveError::DuplicateMismatch(id));
                }
                existing.volume_bits |= 1 << volume;
            }
            empty => {
                *empty = Some(Entry { id, data: bytes.to_vec(), volume_bits: 1 << volume });
            }
        }
    }
    Ok(())
}
