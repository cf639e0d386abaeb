//! Pages SCO et tableau de marques.
//!
//! Une marque par octet de page : des drapeaux (`CODE`, `LABEL`, `DATA`,
//! `DATA_TABLE`, `FUNC_TOP`) dans les bits hauts et une annotation typée
//! dans les bits bas. Les accesseurs préservent l'invariant : poser une
//! annotation ne doit jamais effacer un drapeau.

use std::rc::Rc;

use bitflags::bitflags;
use nact_core::SysVer;

use crate::{DcError, Result};

bitflags! {
    /// Drapeaux d'une marque.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MarkFlags: u8 {
        /// Début d'une commande.
        const CODE = 1 << 3;
        /// Cible d'un label.
        const LABEL = 1 << 4;
        /// Début d'un bloc de données.
        const DATA = 1 << 5;
        /// Table de pointeurs de données.
        const DATA_TABLE = 1 << 6;
        /// Entrée de fonction.
        const FUNC_TOP = 1 << 7;
    }
}

const TYPE_MASK: u8 = 0x07;

/// Annotation typée portée par les bits bas d'une marque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MarkType {
    /// Pas d'annotation.
    #[default]
    None = 0,
    /// Saut de fin de branche d'un `else`.
    Else = 1,
    /// Saut de fin de branche d'un `else if`.
    ElseIf = 2,
    /// Affectation ouvrant une boucle for.
    ForStart = 3,
    /// `{` ouvrant une boucle while.
    WhileStart = 4,
    /// Première affectation d'arguments d'un appel de fonction.
    FuncallTop = 5,
}

impl MarkType {
    fn from_bits(bits: u8) -> MarkType {
        match bits & TYPE_MASK {
            1 => MarkType::Else,
            2 => MarkType::ElseIf,
            3 => MarkType::ForStart,
            4 => MarkType::WhileStart,
            5 => MarkType::FuncallTop,
            _ => MarkType::None,
        }
    }
}

/// Marque d'un octet de page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mark(u8);

impl Mark {
    /// Marque vierge.
    pub const NONE: Mark = Mark(0);

    /// Drapeaux posés.
    pub fn flags(self) -> MarkFlags {
        MarkFlags::from_bits_truncate(self.0)
    }

    /// Annotation typée.
    pub fn typ(self) -> MarkType {
        MarkType::from_bits(self.0)
    }

    /// Vrai si aucune marque.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Vrai si la marque porte autre chose que `flag`.
    pub fn beyond(self, flags: MarkFlags) -> bool {
        self.0 & !flags.bits() != 0
    }

    /// Pose des drapeaux (l'annotation est conservée).
    pub fn insert(&mut self, flags: MarkFlags) {
        self.0 |= flags.bits();
    }

    /// Retire des drapeaux.
    pub fn remove(&mut self, flags: MarkFlags) {
        self.0 &= !flags.bits();
    }

    /// Teste un drapeau.
    pub fn contains(self, flags: MarkFlags) -> bool {
        self.flags().contains(flags)
    }

    /// Pose l'annotation typée sans toucher aux drapeaux.
    pub fn annotate(&mut self, typ: MarkType) {
        self.0 = (self.0 & !TYPE_MASK) | typ as u8;
    }

    /// La marque d'un début de commande ordinaire, sans rien d'autre.
    pub fn code_only() -> Mark {
        Mark(MarkFlags::CODE.bits())
    }
}

/// Une page en cours de décompilation.
#[derive(Debug)]
pub struct Sco {
    /// Octets bruts de l'entrée (padding de secteur compris).
    pub data: Rc<Vec<u8>>,
    /// Une marque par octet, plus une pour la fin de page.
    pub mark: Vec<Mark>,
    /// Dialecte de la page.
    pub sys_ver: SysVer,
    /// Taille de l'en-tête ; le code commence ici.
    pub hdr_size: usize,
    /// Taille réelle du bytecode (l'en-tête SCO fait foi).
    pub filesize: usize,
    /// Adresse par défaut lue dans l'en-tête.
    pub default_addr: u16,
    /// Index de page.
    pub page: usize,
    /// Nom du fichier source à produire.
    pub src_name: String,
    /// Nom interne de l'entrée.
    pub sco_name: String,
    /// Volumes d'archive d'origine.
    pub volume_bits: u32,
    /// Faux tant que l'analyse de la page doit être rejouée.
    pub analyzed: bool,
}

impl Sco {
    /// Monte une entrée d'archive en page. Le dialecte vient de l'en-tête
    /// SCO quand il y en a un, de la configuration sinon.
    pub fn new(page: usize, data: Vec<u8>, volume_bits: u32, fallback: SysVer) -> Result<Sco> {
        let sco_name = format!("{page}.sco");
        let (sys_ver, hdr_size, filesize, default_addr, src_name) =
            match data.get(..4).and_then(SysVer::from_sco_magic) {
                Some(ver) => {
                    if data.len() < 18 {
                        return Err(DcError::BadHeader { name: sco_name, page });
                    }
                    let dword =
                        |at: usize| u32::from_le_bytes(data[at..at + 4].try_into().unwrap());
                    let hdr_size = dword(4) as usize;
                    let filesize = dword(8) as usize;
                    let name_len = u16::from_le_bytes([data[16], data[17]]) as usize;
                    if hdr_size < 20 + name_len || filesize > data.len() || hdr_size > filesize {
                        return Err(DcError::BadHeader { name: sco_name, page });
                    }
                    let name = nact_core::text::to_utf8_sub(&data[18..18 + name_len]);
                    let default_addr =
                        u16::from_le_bytes([data[hdr_size - 2], data[hdr_size - 1]]);
                    (ver, hdr_size, filesize, default_addr, name)
                }
                None => {
                    if data.len() < 2 {
                        return Err(DcError::BadHeader { name: sco_name, page });
                    }
                    let default_addr = u16::from_le_bytes([data[0], data[1]]);
                    (fallback, 2, data.len(), default_addr, format!("{page}.adv"))
                }
            };

        let mut sco = Sco {
            mark: vec![Mark::NONE; filesize + 1],
            data: Rc::new(data),
            sys_ver,
            hdr_size,
            filesize,
            default_addr,
            page,
            src_name,
            sco_name,
            volume_bits,
            analyzed: false,
        };
        let default = usize::from(default_addr);
        if default >= hdr_size && default < filesize {
            sco.mark[default].insert(MarkFlags::LABEL);
        }
        Ok(sco)
    }
}
