//! `apfsck [-cuw] device [device]` -- checks a container, optionally a
//! Fusion pair, exiting 1 and printing a single line on the first
//! reported condition.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{value_parser, Arg, ArgAction, Command};

use apfs_core::checker::{Checker, Options};
use block_device::cache::CachingBlockDevice;
use block_device::file::FileBlockDevice;
use block_device::{BlockDevice, Fusion};

const NODE_CACHE_CAPACITY: usize = 4096;

fn cli() -> Command {
    Command::new("apfsck")
        .about("Consistency-check an APFS container")
        .arg(Arg::new("report_crash").short('c').action(ArgAction::SetTrue).help("report crash signs"))
        .arg(Arg::new("report_unknown").short('u').action(ArgAction::SetTrue).help("report unsupported features"))
        .arg(Arg::new("report_weird").short('w').action(ArgAction::SetTrue).help("report weird-but-not-corrupt cases"))
        .arg(Arg::new("device").required(true).value_parser(value_parser!(PathBuf)))
        .arg(Arg::new("tier2").required(false).value_parser(value_parser!(PathBuf)))
}

fn main() -> ExitCode {
    env_logger::init();
    let matches = cli().get_matches();

    let device_path = matches.get_one::<PathBuf>("device").expect("required");
    let tier2_path = matches.get_one::<PathBuf>("tier2").cloned();

    let options = Options {
        report_crash: matches.get_flag("report_crash"),
        report_unknown: matches.get_flag("report_unknown"),
        report_weird: matches.get_flag("report_weird"),
        tier2_path: tier2_path.clone(),
    };

    match run(device_path, tier2_path, options) {
        Ok(()) => {
            println!("{}: clean", device_path.display());
            ExitCode::SUCCESS
        }
        Err(message) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}

fn run(device_path: &PathBuf, tier2_path: Option<PathBuf>, options: Options) -> Result<(), String> {
    let main = FileBlockDevice::open(device_path, block_device::DEFAULT_BLOCK_SIZE).map_err(|e| e.to_string())?;
    let tier2 = tier2_path.as_ref().map(|p| FileBlockDevice::open(p, block_device::DEFAULT_BLOCK_SIZE)).transpose().map_err(|e| e.to_string())?;
    let fusion = Fusion::new(main, tier2);
    let mut device = CachingBlockDevice::new(fusion, NODE_CACHE_CAPACITY);

    let mut checker = Checker::open(&mut device as &mut dyn BlockDevice, options).map_err(|e| e.to_string())?;
    checker.check_all_volumes(&mut device as &mut dyn BlockDevice).map_err(|e| e.to_string())?;
    Ok(())
}
