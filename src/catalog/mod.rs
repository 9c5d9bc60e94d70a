//! The volume catalog: opening a volume's object map and its catalog,
//! extent-reference, snapshot-metadata, and (if sealed) fext trees, then
//! running the single in-order walk that feeds the audit tables.

pub mod key;
pub mod record;

use log::debug;

use block_device::BlockDevice;

use crate::audit::AuditTables;
use crate::btree::{self, validate_footer, walk_in_order, Node};
use crate::checker::Options;
use crate::error::{CheckError, CheckResult};
use crate::omap::Omap;
use crate::sealed;
use crate::types::{APFS_FEATURE_SEALED_VOLUME, APFS_INCOMPAT_DATALESS_SNAPS, APFS_INCOMPAT_ENCRYPTED, APFS_INCOMPAT_ENC_ROLLED, APFS_INCOMPAT_INCOMPLETE_RESTORE, APFS_INCOMPAT_SECONDARY_FSROOT};

/// Fields of `apfs_superblock_t` the catalog walk needs. Offsets follow
/// the on-disk layout past the shared 32-byte object header.
struct VolumeLayout {
    incompat_features: u64,
    features: u64,
    omap_oid: u64,
    root_tree_oid: u64,
    extentref_tree_oid: u64,
    snap_meta_tree_oid: u64,
    fext_tree_oid: u64,
    block_size: u32,
}

fn parse_volume_layout(body: &[u8], container_block_size: u32) -> CheckResult<VolumeLayout> {
    let field = |off: usize| -> u64 { body.get(off..off + 8).map(|s| u64::from_le_bytes(s.try_into().unwrap())).unwrap_or(0) };
    const INCOMPAT_OFF: usize = 0x58;
    const FEATURES_OFF: usize = 0x48;
    const OMAP_OID_OFF: usize = 0x68;
    const ROOT_TREE_OID_OFF: usize = 0x70;
    const EXTENTREF_TREE_OID_OFF: usize = 0x78;
    const SNAP_META_TREE_OID_OFF: usize = 0x80;
    const FEXT_TREE_OID_OFF: usize = 0xF0;

    Ok(VolumeLayout {
        incompat_features: field(INCOMPAT_OFF),
        features: field(FEATURES_OFF),
        omap_oid: field(OMAP_OID_OFF),
        root_tree_oid: field(ROOT_TREE_OID_OFF),
        extentref_tree_oid: field(EXTENTREF_TREE_OID_OFF),
        snap_meta_tree_oid: field(SNAP_META_TREE_OID_OFF),
        fext_tree_oid: field(FEXT_TREE_OID_OFF),
        block_size: container_block_size,
    })
}

fn reject_unsupported_features(layout: &VolumeLayout) -> CheckResult<()> {
    const REJECTED: u64 = APFS_INCOMPAT_ENCRYPTED | APFS_INCOMPAT_DATALESS_SNAPS | APFS_INCOMPAT_ENC_ROLLED | APFS_INCOMPAT_INCOMPLETE_RESTORE | APFS_INCOMPAT_SECONDARY_FSROOT;
    if layout.incompat_features & APFS_INCOMPAT_ENCRYPTED != 0 {
        return Err(CheckError::UnsupportedFeature("encrypted volume".into()));
    }
    if layout.incompat_features & REJECTED != 0 {
        return Err(CheckError::UnsupportedFeature(format!("incompatible feature bits {:#x}", layout.incompat_features & REJECTED)));
    }
    Ok(())
}

/// Parses the volume superblock body, opens its omap and catalog, walks
/// the catalog in order feeding `audits`, then checks the extentref and
/// snapshot-metadata trees and (for sealed volumes) the hash chain.
pub fn walk_volume(device: &mut dyn BlockDevice, options: &Options, body: &[u8], container_xid: u64, audits: &mut AuditTables) -> CheckResult<()> {
    let layout = parse_volume_layout(body, device.block_size())?;
    reject_unsupported_features(&layout)?;

    let mut volume_omap = Omap::open(device, layout.omap_oid, container_xid)?;

    let catalog_root_record = volume_omap
        .lookup(device, layout.root_tree_oid, container_xid)?
        .ok_or_else(|| CheckError::corruption("Catalog", "no omap mapping for the catalog root"))?;
    let catalog_root_object = crate::object::read_object_nocheck(device, catalog_root_record.paddr)?;
    let catalog_root = Node::from_object(&catalog_root_object)?;

    let mut visit = |node: &Node, slice: &btree::RecordSlice| -> CheckResult<()> {
        let key_bytes = node.key_bytes(slice);
        let value = node.val_bytes(slice);
        let header = key::read_key_header(key_bytes).ok_or_else(|| CheckError::corruption("Catalog", "key too short for a record header"))?;
        let tail = &key_bytes[8.min(key_bytes.len())..];
        if let Err(e) = record::handle_record(header, tail, value, audits, layout.block_size) {
            if e.is_reportable(options.report_crash, options.report_unknown, options.report_weird) {
                return Err(e);
            }
            debug!("ignoring non-fatal catalog record error: {e}");
        }
        Ok(())
    };
    let tally = walk_in_order(device, container_xid, &catalog_root, 0, 0, &key::catalog_keycmp, &mut visit)?;
    validate_footer(&catalog_root, &tally, None, None)?;

    if layout.extentref_tree_oid != 0 {
        check_extentref_tree(device, &mut volume_omap, container_xid, layout.extentref_tree_oid, audits)?;
    }

    volume_omap.walk_all(device, |oid, xid| {
        audits.omap_records_visited.insert((oid, xid));
        Ok(())
    })?;

    if layout.features & APFS_FEATURE_SEALED_VOLUME != 0 {
        if layout.fext_tree_oid == 0 {
            return Err(CheckError::corruption("Sealed volume", "sealed feature set but no fext tree is present"));
        }
        let fext_record = volume_omap
            .lookup(device, layout.fext_tree_oid, container_xid)?
            .ok_or_else(|| CheckError::corruption("Sealed volume", "no omap mapping for the fext tree"))?;
        let fext_object = crate::object::read_object_nocheck(device, fext_record.paddr)?;
        let fext_root = Node::from_object(&fext_object)?;
        let ctx = sealed::SealedVolumeContext { block_size: layout.block_size, container_xid, fext_root };
        sealed::verify_sealed_volume(device, options, &ctx, audits)?;
    }

    Ok(())
}

/// Walks the extent-reference tree, which records each physical
/// extent's `total_refcnt` independent of the catalog's own
/// `references` tally, and copies that total into the extent audit
/// table for `drain_extents` to compare.
fn check_extentref_tree(device: &mut dyn BlockDevice, omap: &mut Omap, container_xid: u64, tree_oid: u64, audits: &mut AuditTables) -> CheckResult<()> {
    let record = omap.lookup(device, tree_oid, container_xid)?.ok_or_else(|| CheckError::corruption("Extent", "no omap mapping for the extentref tree"))?;
    let object = crate::object::read_object_nocheck(device, record.paddr)?;
    let root = Node::from_object(&object)?;

    let mut visit = |node: &Node, slice: &btree::RecordSlice| -> CheckResult<()> {
        let key_bytes = node.key_bytes(slice);
        if key_bytes.len() < 8 {
            return Err(CheckError::corruption("Extent", "extentref key too short"));
        }
        let bno = u64::from_le_bytes(key_bytes[0..8].try_into().unwrap());
        let value = node.val_bytes(slice);
        if value.len() < 8 {
            return Err(CheckError::corruption("Extent", "extentref value too short"));
        }
        let total_refcnt = u32::from_le_bytes(value[0..4].try_into().unwrap()) as u64;
        if let Some(entry) = audits.extents.get_mut(&bno) {
            entry.total_refcnt = Some(total_refcnt);
        }
        Ok(())
    };
    let fixed_cmp = |a: &[u8], b: &[u8]| a.cmp(b);
    let tally = walk_in_order(device, container_xid, &root, 0, 0, &fixed_cmp, &mut visit)?;
    validate_footer(&root, &tally, None, None)?;
    Ok(())
}
