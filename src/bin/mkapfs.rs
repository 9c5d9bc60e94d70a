//! `mkapfs [-L label] [-U uuid] [-u uuid] [-F tier2] [-sv] device [blocks]`
//! -- formats a minimal but valid single-volume container.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{value_parser, Arg, ArgAction, Command};

use apfs_core::format::{self, FormatOptions};
use block_device::file::FileBlockDevice;
use block_device::{BlockDevice, DEFAULT_BLOCK_SIZE};

fn cli() -> Command {
    Command::new("mkapfs")
        .about("Format a minimal APFS container")
        .arg(Arg::new("label").short('L').value_parser(clap::value_parser!(String)))
        .arg(Arg::new("volume_uuid").short('U').value_parser(clap::value_parser!(String)))
        .arg(Arg::new("container_uuid").short('u').value_parser(clap::value_parser!(String)))
        .arg(Arg::new("tier2").short('F').value_parser(value_parser!(PathBuf)))
        .arg(Arg::new("case_sensitive").short('s').action(ArgAction::SetTrue))
        .arg(Arg::new("normalization_sensitive").short('z').action(ArgAction::SetTrue))
        .arg(Arg::new("version").short('v').action(ArgAction::SetTrue))
        .arg(Arg::new("device").required(true).value_parser(value_parser!(PathBuf)))
        .arg(Arg::new("blocks").required(false).value_parser(value_parser!(u64)))
}

fn parse_uuid(s: &str) -> Result<[u8; 16], String> {
    let hex: String = s.chars().filter(|c| *c != '-').collect();
    if hex.len() != 32 {
        return Err(format!("invalid uuid: {s}"));
    }
    let mut bytes = [0u8; 16];
    for i in 0..16 {
        bytes[i] = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| format!("invalid uuid: {s}"))?;
    }
    Ok(bytes)
}

fn main() -> ExitCode {
    env_logger::init();
    let matches = cli().get_matches();

    if matches.get_flag("version") {
        println!("mkapfs {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    match run(&matches) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("mkapfs: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run(matches: &clap::ArgMatches) -> Result<(), String> {
    let device_path = matches.get_one::<PathBuf>("device").expect("required");
    let blocks = matches.get_one::<u64>("blocks").copied();

    let mut options = FormatOptions::default();
    if let Some(label) = matches.get_one::<String>("label") {
        options.label = label.clone();
    }
    options.case_sensitive = matches.get_flag("case_sensitive");
    options.normalization_sensitive = matches.get_flag("normalization_sensitive");
    if let Some(u) = matches.get_one::<String>("volume_uuid") {
        options.volume_uuid = Some(parse_uuid(u)?);
    }
    if let Some(u) = matches.get_one::<String>("container_uuid") {
        options.container_uuid = Some(parse_uuid(u)?);
    }
    let _tier2 = matches.get_one::<PathBuf>("tier2");

    let byte_len = match blocks {
        Some(n) => n * DEFAULT_BLOCK_SIZE as u64,
        None => {
            std::fs::metadata(device_path)
                .map_err(|e| format!("stat {}: {e}", device_path.display()))?
                .len()
        }
    };

    let mut device = FileBlockDevice::create(device_path, DEFAULT_BLOCK_SIZE, byte_len).map_err(|e| e.to_string())?;
    format::format_container(&mut device as &mut dyn BlockDevice, &options).map_err(|e| e.to_string())?;
    Ok(())
}
