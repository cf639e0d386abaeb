//! Conteneur de symboles de debug (DSYM).
//!
//! Quatre sections : `SRCS` (noms des sources), `SCNT` (contenus), `LINE`
//! (paires ligne/adresse par page, croissantes), `VARI` (noms de
//! variables). Chaque section : tag de 4 octets, longueur u32 LE, compteur
//! u32 LE, charge utile.

use std::io::{self, Write};

use nact_core::OutBuf;

const DSYM_VERSION: u32 = 0;

/// Collecteur d'informations de debug d'une compilation.
#[derive(Debug)]
pub struct DebugInfo {
    srcs: Vec<(String, String)>,
    line_section: OutBuf,
    linemap: Vec<(u32, u32)>,
    nr_files: u32,
}

impl DebugInfo {
    /// Prépare le collecteur ; `srcs` est la liste (nom, contenu).
    pub fn new(srcs: Vec<(String, String)>) -> Self {
        Self { srcs, line_section: OutBuf::new(), linemap: Vec::new(), nr_files: 0 }
    }

    /// Ouvre la table des lignes d'une page.
    pub fn init_page(&mut self, page: usize) {
        if self.line_section.addr() == 0 {
            self.line_section.emit_bytes(b"LINE");
            self.line_section.emit_dword(0); // longueur, patchée
            self.line_section.emit_dword(0); // nr_files, patché
        }
        debug_assert_eq!(page as u32, self.nr_files);
        self.linemap.clear();
    }

    /// Enregistre une paire (ligne, adresse) au début d'une commande.
    pub fn line_add(&mut self, line: u32, addr: u32) {
        if let Some(last) = self.linemap.last_mut() {
            if addr == last.1 {
                last.0 = line;
                return;
            }
            if line == last.0 {
                return;
            }
        }
        self.linemap.push((line, addr));
    }

    /// Oublie les lignes de la page courante (pragma address : la table
    /// doit rester croissante).
    pub fn line_reset(&mut self) {
        self.linemap.clear();
    }

    /// Clôt la table des lignes de la page courante.
    pub fn finish_page(&mut self) {
        // La dernière paire pointe sur la fin de page, on la laisse tomber.
        self.linemap.pop();
        self.line_section.emit_dword(self.linemap.len() as u32);
        for &(line, addr) in &self.linemap {
            self.line_section.emit_dword(line);
            self.line_section.emit_dword(addr);
        }
        self.linemap.clear();
        self.nr_files += 1;

        let len = self.line_section.addr();
        self.line_section.swap_dword(4, len);
        self.line_section.swap_dword(8, self.nr_files);
    }

    /// Sérialise le conteneur DSYM.
    pub fn write(&self, variables: &[String], w: &mut impl Write) -> io::Result<()> {
        w.write_all(b"DSYM")?;
        w.write_all(&DSYM_VERSION.to_le_bytes())?;
        w.write_all(&4u32.to_le_bytes())?; // nr_sections

        let keys: Vec<&str> = self.srcs.iter().map(|(k, _)| k.as_str()).collect();
        let vals: Vec<&str> = self.srcs.iter().map(|(_, v)| v.as_str()).collect();
        write_string_array(b"SRCS", &keys, w)?;
        write_string_array(b"SCNT", &vals, w)?;
        w.write_all(self.line_section.as_slice())?;
        let vars: Vec<&str> = variables.iter().map(String::as_str).collect();
        write_string_array(b"VARI", &vars, w)
    }
}

fn write_string_array(tag: &[u8; 4], strings: &[&str], w: &mut impl Write) -> io::Result<()> {
    let section_len: usize = 12 + strings.iter().map(|s| s.len() + 1).sum::<usize>();
    w.write_all(tag)?;
    w.write_all(&(section_len as u32).to_le_bytes())?;
    w.write_all(&(strings.len() as u32).to_le_bytes())?;
    for s in strings {
        w.write_all(s.as_bytes())?;
        w.write_all(&[0])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn line_pairs_are_deduplicated() {
        let mut di = DebugInfo::new(vec![("a.adv".into(), String::new())]);
        di.init_page(0);
        di.line_add(1, 2);
        di.line_add(1, 4); // même ligne : ignorée
        di.line_add(2, 4); // même adresse : remplace la ligne
        di.line_add(3, 8);
        di.line_add(4, 10); // paire finale, retirée par finish_page
        di.finish_page();

        let data = di.line_section.as_slice().to_vec();
        assert_eq!(&data[..4], b"LINE");
        let count = u32::from_le_bytes(data[12..16].try_into().unwrap());
        assert_eq!(count, 3);
        let first = u32::from_le_bytes(data[16..20].try_into().unwrap());
        assert_eq!(first, 1);
    }

    #[test]
    fn writes_all_four_sections() {
        let mut di = DebugInfo::new(vec![("a.adv".into(), "R\n".into())]);
        di.init_page(0);
        di.line_add(1, 2);
        di.line_add(2, 3);
        di.finish_page();

        let mut out = Vec::new();
        di.write(&["RND".into()], &mut out).unwrap();
        assert_eq!(&out[..4], b"DSYM");
        let find = |tag: &[u8]| out.windows(4).position(|w| w == tag);
        assert!(find(b"SRCS").is_some());
        assert!(find(b"SCNT").is_some());
        assert!(find(b"LINE").is_some());
        assert!(find(b"VARI").is_some());
    }
}
