// crates/nact-tools/src/bin/nactdc.rs
//! Décompilateur nact : archives de volumes -> projet source.
//! Usage basique :
//!   nactdc ADISK.DAT
//!   nactdc -o src -a ADISK.DAT BDISK.DAT
//! Le dialecte est pris des en-têtes SCO quand il y en a, de `-s`/`-G`
//! sinon, et à défaut de la détection CRC32 du volume A.

use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;

use nact_core::game;
use nact_decompiler::DcConfig;

#[derive(Parser, Debug)]
#[command(
    name = "nactdc",
    about = "Décompilateur de scénarios NACT (archives ALD/DRI -> .adv)",
    disable_version_flag = true
)]
struct Cli {
    /// Fichier(s) d'archive, un par volume
    archives: Vec<Utf8PathBuf>,

    /// Préfixer chaque ligne de son adresse
    #[arg(short = 'a', long = "address")]
    address: bool,

    /// Encodage de sortie : -Es (CP932) ou -Eu (UTF-8, défaut)
    #[arg(short = 'E', long = "encoding")]
    encoding: Option<String>,

    /// Identité de jeu
    #[arg(short = 'G', long = "game")]
    game: Option<String>,

    /// Répertoire de sortie
    #[arg(short = 'o', long = "outdir", default_value = ".")]
    outdir: Utf8PathBuf,

    /// Version du système (1|2|3)
    #[arg(short = 's', long = "sys-ver")]
    sys_ver: Option<String>,

    /// Ne pas reconstruire les else
    #[arg(long = "disable-else")]
    disable_else: bool,

    /// Être bavard
    #[arg(short = 'V', long = "verbose")]
    verbose: bool,

    /// Afficher la version et sortir
    #[arg(short = 'v', long = "version")]
    version: bool,
}

fn main() -> ExitCode {
    let verbose = std::env::args().any(|a| a == "-V" || a == "--verbose");
    nact_tools::init_tracing(verbose);
    match real_main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn real_main() -> Result<()> {
    let cli = Cli::parse();
    if cli.version {
        println!("nactdc {}", nact_tools::VERSION);
        return Ok(());
    }
    if cli.archives.is_empty() {
        return Err(anyhow!("no archive given; see nactdc --help"));
    }

    let mut config = DcConfig {
        address: cli.address,
        disable_else: cli.disable_else,
        ..DcConfig::default()
    };
    if let Some(encoding) = &cli.encoding {
        config.utf8_output = nact_tools::parse_encoding(encoding)?;
    }

    // Dialecte : -s, sinon -G, sinon détection CRC du volume A.
    let adisk = cli
        .archives
        .iter()
        .find(|p| {
            p.file_name().is_some_and(|n| n.as_bytes().first().map(u8::to_ascii_uppercase) == Some(b'A'))
        })
        .or(cli.archives.first());
    if let Some(ver) = &cli.sys_ver {
        config.sys_ver = nact_tools::parse_sys_ver(ver)?;
    } else if let Some(game) = &cli.game {
        config.sys_ver = nact_tools::parse_game(game)?.sys_ver;
    } else if let Some(adisk) = adisk {
        if let Ok(crc) = game::archive_crc32(adisk.as_std_path()) {
            if let Some(info) = game::detect(crc, None) {
                tracing::info!(game = info.name, sys_ver = %info.sys_ver, "game detected");
                config.sys_ver = info.sys_ver;
            }
        }
    }

    let mut entries = Vec::new();
    for path in &cli.archives {
        nact_archive::read_volume(&mut entries, path.as_std_path())
            .with_context(|| format!("reading {path}"))?;
    }

    // Table AG00 à côté du volume A, si présente.
    let ag00 = adisk
        .map(|p| p.as_std_path().with_file_name("AG00.DAT"))
        .filter(|p| p.exists())
        .map(|p| nact_archive::ag00::read(&p))
        .transpose()?;

    let adisk_name = adisk.and_then(|p| p.file_name()).map(str::to_owned);
    let project = nact_decompiler::decompile(
        entries,
        &config,
        adisk_name.as_deref(),
        ag00.as_ref(),
    )?;
    nact_decompiler::write_project(&project, cli.outdir.as_std_path(), config.utf8_output)?;
    tracing::info!(outdir = %cli.outdir, pages = project.sources.len(), "done");
    Ok(())
}
