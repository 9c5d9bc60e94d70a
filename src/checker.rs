//! The checker's entry point: opens a container, selects the current
//! checkpoint, walks every volume's catalog, and drains the audit
//! tables. Replaces the reference implementation's process-wide `sb`/
//! `vsb`/`options` globals with an explicit context threaded through
//! every routine.

use std::collections::HashSet;

use log::{debug, info};

use block_device::BlockDevice;

use crate::audit::AuditTables;
use crate::catalog;
use crate::checkpoint::{self, Checkpoint, CheckpointMapTable, NxSuperblockRaw};
use crate::error::{CheckError, CheckResult};
use crate::object::Object;
use crate::omap::Omap;
use crate::space::SpaceManager;
use crate::types::APFS_MAGIC;

/// CLI-level reporting configuration (`apfsck -cuw`).
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub report_crash: bool,
    pub report_unknown: bool,
    pub report_weird: bool,
    pub tier2_path: Option<std::path::PathBuf>,
}

/// The state that would otherwise be process-wide globals, now owned by
/// one run of the checker.
pub struct Checker {
    pub options: Options,
    pub zero_object: Object,
    pub superblock: NxSuperblockRaw,
    pub checkpoint: Checkpoint,
    pub checkpoint_map: CheckpointMapTable,
    pub container_omap: Omap,
    pub spaceman: SpaceManager,
    /// Every ephemeral oid resolved through `checkpoint_map`, whether by
    /// `open` itself (the spaceman) or by the space manager's own
    /// reconciliation pass (the free queues). Checked for completeness
    /// against `checkpoint_map.entries` once every volume has been
    /// walked.
    pub cpoint_maps_visited: HashSet<u64>,
}

impl Checker {
    /// Runs the checkpoint-selection protocol (spec 4.3 steps 1-4) and
    /// opens the container object map and space manager.
    pub fn open(device: &mut dyn BlockDevice, options: Options) -> CheckResult<Checker> {
        let (zero_object, superblock) = checkpoint::read_block_zero(device)?;
        info!("container block size {}", superblock.block_size);

        let checkpoint = checkpoint::select_current_checkpoint(device, &superblock)?;
        debug!("selected checkpoint xid {:#x}", checkpoint.xid);

        let checkpoint_map = checkpoint::parse_checkpoint_map(device, &superblock, &checkpoint)?;
        if let Err(e) = checkpoint::compare_against_block_zero(&zero_object, &checkpoint) {
            if matches!(e, CheckError::CrashSign(_)) && !options.report_crash {
                debug!("ignoring crash sign: {e}");
            } else {
                return Err(e);
            }
        }

        let container_omap = Omap::open(device, checkpoint.superblock.omap_oid, checkpoint.xid)?;

        let spaceman_bno = checkpoint_map.resolve(checkpoint.superblock.spaceman_oid)?;
        let spaceman = SpaceManager::open(device, spaceman_bno, checkpoint.xid)?;
        let mut cpoint_maps_visited = HashSet::new();
        cpoint_maps_visited.insert(checkpoint.superblock.spaceman_oid);

        Ok(Checker { options, zero_object, superblock, checkpoint, checkpoint_map, container_omap, spaceman, cpoint_maps_visited })
    }

    /// Walks every volume referenced by the container omap, checking
    /// each one's catalog, extentref tree, snapshot-metadata tree and
    /// (if sealed) fext tree; then reconciles the space manager's chunk
    /// bitmaps, internal-pool ring and free queues against the extents
    /// every volume's catalog walk marked used, and checks that every
    /// mapping in the checkpoint map was resolved by something.
    pub fn check_all_volumes(&mut self, device: &mut dyn BlockDevice) -> CheckResult<()> {
        let volume_oids = self.enumerate_volume_oids();
        for (index, oid) in volume_oids.into_iter().enumerate() {
            debug!("checking volume {} (oid {:#x})", index, oid);
            self.check_volume(device, oid)?;
        }

        let container_xid = self.checkpoint.xid;
        self.spaceman.reconcile(device, &self.checkpoint_map, container_xid, &mut self.cpoint_maps_visited)?;

        for entry in &self.checkpoint_map.entries {
            if !self.cpoint_maps_visited.contains(&entry.oid) {
                return Err(CheckError::corruption("checkpoint map", format!("oid {:#x} was never resolved by any checker", entry.oid)));
            }
        }
        Ok(())
    }

    fn enumerate_volume_oids(&self) -> Vec<u64> {
        self.checkpoint.superblock_volume_oids()
    }

    fn check_volume(&mut self, device: &mut dyn BlockDevice, volume_oid: u64) -> CheckResult<()> {
        let at_xid = self.checkpoint.xid;
        let object = crate::object::read_object(device, volume_oid, at_xid, crate::object::Resolution::Virtual { omap: &mut self.container_omap, at_xid })?;
        let body = object.body();
        if body.len() < 4 || u32::from_le_bytes(body[0..4].try_into().unwrap()) != APFS_MAGIC {
            return Err(CheckError::corruption("volume superblock", "not an apfs volume"));
        }

        let mut audits = AuditTables::default();
        catalog::walk_volume(device, &self.options, body, at_xid, &mut audits)?;

        for entry in audits.extents.values() {
            let length = entry.blocks.max(1);
            if self.spaceman.block_in_ip(entry.first_bno) {
                self.spaceman.mark_ip_used(entry.first_bno, length)?;
            } else {
                self.spaceman.mark_main_used(entry.first_bno, length, false)?;
            }
        }

        audits.drain_in_order(&self.options)?;
        Ok(())
    }

    /// Whether `error` should abort the run given the current options.
    pub fn should_report(&self, error: &CheckError) -> bool {
        error.is_reportable(self.options.report_crash, self.options.report_unknown, self.options.report_weird)
    }
}
