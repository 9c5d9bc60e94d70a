//! `apfs-label [-v] device` -- prints `index<TAB>label` for every volume
//! in a container; a trivial specialisation of object-map lookup plus a
//! fixed-offset read of the volume superblock's label field.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{value_parser, Arg, ArgAction, Command};

use apfs_core::checkpoint;
use apfs_core::object::{read_object, Resolution};
use apfs_core::omap::Omap;
use block_device::file::FileBlockDevice;
use block_device::BlockDevice;

const VOLUME_LABEL_OFFSET: usize = 0xF0;
const VOLUME_LABEL_MAX_LEN: usize = 64;

fn cli() -> Command {
    Command::new("apfs-label")
        .about("Print the label of each volume in an APFS container")
        .arg(Arg::new("version").short('v').action(ArgAction::SetTrue).help("print version and exit"))
        .arg(Arg::new("device").required(true).value_parser(value_parser!(PathBuf)))
}

fn main() -> ExitCode {
    env_logger::init();
    let matches = cli().get_matches();

    if matches.get_flag("version") {
        println!("apfs-label {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let device_path = matches.get_one::<PathBuf>("device").expect("required");
    match run(device_path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}

fn run(device_path: &PathBuf) -> Result<(), String> {
    let mut device = FileBlockDevice::open(device_path, block_device::DEFAULT_BLOCK_SIZE).map_err(|e| e.to_string())?;
    let device: &mut dyn BlockDevice = &mut device;

    let (_zero_object, superblock) = checkpoint::read_block_zero(device).map_err(|e| e.to_string())?;
    let active = checkpoint::select_current_checkpoint(device, &superblock).map_err(|e| e.to_string())?;
    let mut container_omap = Omap::open(device, active.superblock.omap_oid, active.xid).map_err(|e| e.to_string())?;

    for (index, volume_oid) in active.superblock_volume_oids().into_iter().enumerate() {
        let at_xid = active.xid;
        let object = read_object(device, volume_oid, at_xid, Resolution::Virtual { omap: &mut container_omap, at_xid }).map_err(|e| e.to_string())?;
        let body = object.body();
        let label_bytes = body.get(VOLUME_LABEL_OFFSET..VOLUME_LABEL_OFFSET + VOLUME_LABEL_MAX_LEN).unwrap_or(&[]);
        let end = label_bytes.iter().position(|&b| b == 0).unwrap_or(label_bytes.len());
        let label = String::from_utf8_lossy(&label_bytes[..end]);
        println!("{index}\t{label}");
    }
    Ok(())
}
