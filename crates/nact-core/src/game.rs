//! Identités des jeux connus.
//!
//! Un jeu est reconnu par le CRC32 des 256 premiers octets de son archive
//! « A » (et, pour les collections partageant un disque A, celui du disque
//! B). L'identité fixe le dialecte System correspondant.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::SysVer;

/// Entrée de la table des jeux.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameInfo {
    /// Nom d'option (`-G <name>` / clé `game` du projet).
    pub name: &'static str,
    /// Dialecte du jeu.
    pub sys_ver: SysVer,
    /// CRC32 de l'archive A.
    pub adisk_crc: Option<u32>,
    /// CRC32 de l'archive B, pour les collections à disque A partagé.
    pub bdisk_crc: Option<u32>,
}

const fn game(name: &'static str, sys_ver: SysVer, adisk: u32) -> GameInfo {
    GameInfo { name, sys_ver, adisk_crc: Some(adisk), bdisk_crc: None }
}

const fn game2(name: &'static str, sys_ver: SysVer, adisk: u32, bdisk: u32) -> GameInfo {
    GameInfo { name, sys_ver, adisk_crc: Some(adisk), bdisk_crc: Some(bdisk) }
}

const fn generic(name: &'static str, sys_ver: SysVer) -> GameInfo {
    GameInfo { name, sys_ver, adisk_crc: None, bdisk_crc: None }
}

/// Table des jeux connus.
pub static GAME_TABLE: &[GameInfo] = &[
    generic("system1_generic", SysVer::System1),
    game("bunkasai", SysVer::System1, 0xc80f99b8),
    game("crescent", SysVer::System1, 0x42351f2c),
    game("rance", SysVer::System1, 0x2fffbd60),
    game("rance2", SysVer::System1, 0x28f8298f),
    game("rance2_hint", SysVer::System1, 0x2a85e5fa),
    game("dps", SysVer::System1, 0x69ea4865),
    game2("dps_sg_fahren", SysVer::System1, 0xab4cda48, 0xe405d57c),
    game2("dps_sg_katei", SysVer::System1, 0xab4cda48, 0x23e67d18),
    game2("dps_sg_nobunaga", SysVer::System1, 0xab4cda48, 0x2ec116f2),
    game2("dps_sg2_antique", SysVer::System1, 0xab4cda48, 0x41fe8b3d),
    game2("dps_sg2_ikenai", SysVer::System1, 0xab4cda48, 0x6b562c09),
    game2("dps_sg2_akai", SysVer::System1, 0xab4cda48, 0x1098e78c),
    game2("dps_sg3_rabbit", SysVer::System1, 0xb77ae133, 0xa3228b6c),
    game2("dps_sg3_shinkon", SysVer::System1, 0xb77ae133, 0x09b4448a),
    game2("dps_sg3_sotsugyou", SysVer::System1, 0xb77ae133, 0xbc4525d8),
    game("fukei", SysVer::System1, 0x026de326),
    game("intruder", SysVer::System1, 0xa7520fb2),
    game("tengu", SysVer::System1, 0xc942ff58),
    game("toushin", SysVer::System1, 0x62327908),
    game("toushin_hint", SysVer::System1, 0xac337537),
    game("little_vampire", SysVer::System1, 0x957bcfbf),
    game("little_vampire_eng", SysVer::System1, 0x61985a7f),
    game("yakata", SysVer::System1, 0x8cef6fa6),
    game("gakuen", SysVer::System1, 0xe4d6ec66),
    game("gakuen_eng", SysVer::System1, 0x6ba8c102),
    generic("system2_generic", SysVer::System2),
    game("ayumi_fd", SysVer::System2, 0x4e2fed2a),
    game("ayumi_hint", SysVer::System2, 0xf6bd963a),
    game("ayumi_proto", SysVer::System2, 0x4e2f5678),
    game("dalk", SysVer::System2, 0x77227088),
    game("dalk_hint", SysVer::System2, 0x4793b843),
    game("drstop", SysVer::System2, 0x73fa86c4),
    game("prog_fd", SysVer::System2, 0x5ffbfee7),
    game("rance3", SysVer::System2, 0x47a399a1),
    game("rance3_hint", SysVer::System2, 0x8d5ec610),
    game2("sdps_maria", SysVer::System2, 0xc7a20cdf, 0x80d4eaca),
    game2("sdps_tono", SysVer::System2, 0xc7a20cdf, 0xbb1edff1),
    game2("sdps_kaizoku", SysVer::System2, 0xc7a20cdf, 0xf81829e3),
    game("yakata2", SysVer::System2, 0x2df591ff),
    game("rance4", SysVer::System2, 0xebcfaff1),
    game("rance4_opt", SysVer::System2, 0xbe91c161),
    generic("system3_generic", SysVer::System3),
    game("ambivalenz_fd", SysVer::System3, 0xa6b48dfe),
    game("ambivalenz_cd", SysVer::System3, 0x4b10db69),
    game("dps_all", SysVer::System3, 0xd48b4ec6),
    game("funnybee_cd", SysVer::System3, 0xe14e3971),
    game("funnybee_fd", SysVer::System3, 0x731267fa),
    game("onlyyou", SysVer::System3, 0x832aeb97),
    game("onlyyou_demo", SysVer::System3, 0xc1d13e44),
    game("prog_cd", SysVer::System3, 0xfb0e4a63),
    game("prog_omake", SysVer::System3, 0x8ba18bff),
    game("rance41", SysVer::System3, 0xa43fb4b6),
    game("rance41_eng", SysVer::System3, 0x811f4ff3),
    game("rance42", SysVer::System3, 0x04d24d1e),
    game("rance42_eng", SysVer::System3, 0xa97cc370),
    game("ayumi_cd", SysVer::System3, 0xd2bed9ee),
    game("ayumi_live_256", SysVer::System3, 0x00d15a2b),
    game("ayumi_live_full", SysVer::System3, 0x5f66ff1d),
    game("yakata3_cd", SysVer::System3, 0x7f8f5e2a),
    game("yakata3_fd", SysVer::System3, 0x58ebcc99),
    game("hashirionna2", SysVer::System3, 0x09f47cbd),
    game("toushin2_gd", SysVer::System3, 0xb5eba798),
    game("toushin2_sp", SysVer::System3, 0x2172c7b2),
    game("otome", SysVer::System3, 0x49a4db15),
    game("ningyo", SysVer::System3, 0xd491e7ab),
    game("mugen", SysVer::System3, 0xbb27d1ba),
    game("toushin2", SysVer::System3, 0xe27dd441),
    game("nise_naguri", SysVer::System3, 0xfabe6302),
    game("gakuen_king", SysVer::System3, 0xd1bf243b),
];

/// Recherche par nom d'option (insensible à la casse).
pub fn by_name(name: &str) -> Option<&'static GameInfo> {
    GAME_TABLE.iter().find(|g| g.name.eq_ignore_ascii_case(name))
}

/// Détection par CRC des archives A/B.
pub fn detect(adisk_crc: u32, bdisk_crc: Option<u32>) -> Option<&'static GameInfo> {
    GAME_TABLE.iter().find(|g| {
        g.adisk_crc == Some(adisk_crc)
            && (g.bdisk_crc.is_none() || g.bdisk_crc == bdisk_crc)
    })
}

/// CRC32 des 256 premiers octets d'une archive.
pub fn archive_crc32(path: &Path) -> std::io::Result<u32> {
    let mut head = [0u8; 256];
    let mut file = File::open(path)?;
    let mut read = 0;
    while read < head.len() {
        match file.read(&mut head[read..])? {
            0 => break,
            n => read += n,
        }
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&head[..read]);
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name_is_case_insensitive() {
        assert_eq!(by_name("Rance3").map(|g| g.sys_ver), Some(SysVer::System2));
        assert!(by_name("no_such_game").is_none());
    }

    #[test]
    fn detection_requires_matching_bdisk_when_shared() {
        let g = detect(0xab4cda48, Some(0x23e67d18)).unwrap();
        assert_eq!(g.name, "dps_sg_katei");
        // Disque A partagé, disque B inconnu : pas de détection.
        assert!(detect(0xab4cda48, Some(0xdeadbeef)).is_none());
    }

    #[test]
    fn detection_ignores_bdisk_for_single_disk_games() {
        let g = detect(0xe27dd441, None).unwrap();
        assert_eq!(g.name, "toushin2");
    }
}
