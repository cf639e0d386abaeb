//! Pré-analyse : repérage des tables de données.
//!
//! Le motif `#` + adresse 32 bits + cali de deux octets est une référence
//! de table : l'adresse pointe une table de pointeurs, chaque pointeur une
//! zone de données. Seules les références arrière sont marquées ici, les
//! références avant sont rattrapées par l'analyse à point fixe.

use crate::sco::{MarkFlags, Sco};

fn scan_for_data_tables(sco: &mut Sco) {
    let data = sco.data.clone();
    if sco.filesize < sco.hdr_size + 7 {
        return;
    }
    let end = sco.filesize - 6; // adresse + cali
    for p in sco.hdr_size..end {
        if data[p] != b'#' || data[p + 5] != 0x7f {
            continue;
        }
        let ptr_addr = u32::from_le_bytes(data[p + 1..p + 5].try_into().unwrap()) as usize;
        if ptr_addr < sco.hdr_size || ptr_addr > sco.filesize - 4 {
            continue;
        }
        if ptr_addr < p {
            sco.mark[ptr_addr].insert(MarkFlags::DATA_TABLE);
        }
        let data_addr = u32::from_le_bytes(data[ptr_addr..ptr_addr + 4].try_into().unwrap()) as usize;
        if data_addr >= sco.hdr_size && data_addr < sco.filesize {
            sco.mark[data_addr].insert(MarkFlags::DATA);
        }
    }
}

/// Passe de pré-analyse sur toutes les pages (dialectes à commande `#`).
pub fn preprocess(scos: &mut [Option<Sco>]) {
    for sco in scos.iter_mut().flatten() {
        if !sco.sys_ver.is_legacy() {
            scan_for_data_tables(sco);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nact_core::SysVer;

    #[test]
    fn backward_table_reference_is_marked() {
        // En-tête legacy simulé en 3.5 : on fabrique la page à la main.
        let mut data = Vec::new();
        data.extend_from_slice(b"S360");
        let name = b"t.adv";
        let hdr = 18 + name.len() + 2;
        data.extend_from_slice(&(hdr as u32).to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes()); // filesize, corrigé après
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&(name.len() as u16).to_le_bytes());
        data.extend_from_slice(name);
        data.extend_from_slice(&[0, 0]);

        let table = data.len(); // la table : un pointeur vers `blob`
        data.extend_from_slice(&0u32.to_le_bytes());
        let blob = data.len();
        data.extend_from_slice(b"hi\0");
        // La référence '#table' avec un cali simple.
        data.push(b'#');
        data.extend_from_slice(&(table as u32).to_le_bytes());
        data.extend_from_slice(&[0x41, 0x7f]);
        let filesize = data.len() as u32;
        data[8..12].copy_from_slice(&filesize.to_le_bytes());
        data[table..table + 4].copy_from_slice(&(blob as u32).to_le_bytes());

        let mut scos =
            vec![Some(Sco::new(0, data, 0b10, SysVer::System36).unwrap())];
        preprocess(&mut scos);
        let sco = scos[0].as_ref().unwrap();
        assert!(sco.mark[table].contains(MarkFlags::DATA_TABLE));
        assert!(sco.mark[blob].contains(MarkFlags::DATA));
    }

    #[test]
    fn legacy_pages_are_left_alone() {
        let mut data = vec![0x00, 0x00, b'#'];
        data.extend_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&[0x41, 0x7f, 0, 0, 0, 0]);
        let mut scos = vec![Some(Sco::new(0, data, 0b10, SysVer::System3).unwrap())];
        preprocess(&mut scos);
        assert!(scos[0].as_ref().unwrap().mark.iter().all(|m| m.is_empty()));
    }
}
