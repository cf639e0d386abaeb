//! Prologue et épilogue d'une page compilée.
//!
//! Toute page commence par un slot « adresse par défaut » de deux octets,
//! rempli en fin de compilation avec l'adresse du label `default` (ou la
//! fin du buffer moins deux). Les dialectes 3.5+ préfixent en plus un
//! en-tête structuré : magic, taille d'en-tête, taille de fichier, numéro
//! de page, nom de la source.

use nact_core::{text, OutBuf};

use crate::config::Config;
use crate::{CompileError, Result};

/// Émet l'en-tête de page et renvoie sa taille (slot par défaut compris) :
/// le code commence à cet offset.
pub fn init(out: &mut OutBuf, config: &Config, src_name: &str, page: usize) -> Result<u32> {
    let Some(magic) = config.sys_ver.sco_magic() else {
        out.emit_word(0);
        return Ok(2);
    };
    let name = if config.unicode {
        src_name.as_bytes().to_vec()
    } else {
        text::to_cp932(src_name).map_err(|e| CompileError::Msg(e.to_string()))?
    };
    let hdr_size = 18 + name.len() as u32 + 2;
    out.emit_bytes(magic);
    out.emit_dword(hdr_size);
    out.emit_dword(0); // filesize, patché par finalize()
    out.emit_dword(page as u32);
    out.emit_word(name.len() as u16);
    out.emit_bytes(&name);
    out.emit_word(0); // adresse par défaut, patchée par finalize()
    Ok(hdr_size)
}

/// Patche le slot d'adresse par défaut et, pour les dialectes à en-tête,
/// le champ de taille de fichier.
pub fn finalize(
    out: &mut OutBuf,
    config: &Config,
    hdr_size: u32,
    default_addr: Option<u16>,
) -> Result<()> {
    let addr = default_addr.unwrap_or((out.addr() - 2) as u16);
    out.swap_word(hdr_size - 2, addr);
    if config.sys_ver.sco_magic().is_some() {
        let len = out.addr();
        out.swap_dword(8, len);
    }
    Ok(())
}
