//! The object layer: verifying checksums and resolving an object id to a
//! physical block address, either directly (physical), through the
//! checkpoint map (ephemeral) or through an object map (virtual).

use block_device::BlockDevice;

use crate::error::{CheckError, CheckResult};
use crate::omap::Omap;
use crate::types::{self, ObjPhysHeader, OBJ_EPHEMERAL, OBJ_PHYSICAL, OBJ_VIRTUAL};

/// An object read off disk: its parsed header plus the raw bytes
/// (including the header) so callers can re-interpret the body.
#[derive(Debug, Clone)]
pub struct Object {
    pub header: ObjPhysHeader,
    pub block_nr: u64,
    pub bytes: Vec<u8>,
}

impl Object {
    pub fn body(&self) -> &[u8] {
        &self.bytes[types::OBJ_HEADER_SIZE..]
    }
}

/// What storage class the caller expects the object to belong to, and
/// (for ephemeral objects) the physical block it was already resolved to
/// via the checkpoint-mapping table.
#[derive(Debug, Clone, Copy)]
pub enum Resolution<'a> {
    Physical,
    Virtual { omap: &'a mut Omap, at_xid: u64 },
    Ephemeral { bno: u64 },
}

/// Reads the object at block `bno` and verifies only its checksum; does
/// not check oid/xid/type expectations. Used by the checkpoint layer
/// while it is still hunting for the current superblock.
pub fn read_object_nocheck(device: &mut dyn BlockDevice, bno: u64) -> CheckResult<Object> {
    let block_size = device.block_size();
    let bytes = device
        .read(bno, 1)
        .map_err(|e| CheckError::corruption("object", format!("I/O error reading block {}: {}", bno, e)))?;
    if bytes.len() < types::OBJ_HEADER_SIZE {
        return Err(CheckError::corruption("object", format!("block {} is smaller than a header", bno)));
    }
    let header = ObjPhysHeader::parse(&bytes)
        .ok_or_else(|| CheckError::corruption("object", format!("malformed header at block {}", bno)))?;
    if !types::verify_object_checksum(&bytes) {
        return Err(CheckError::corruption("object", format!("bad checksum in block {:#x}", bno)));
    }
    let _ = block_size;
    Ok(Object { header, block_nr: bno, bytes })
}

/// Reads and fully validates an object, resolving `oid` to a physical
/// block per `resolution`.
///
/// Checks: the header's own `oid` matches; `xid` is within the container's
/// horizon; for virtual objects, the xid returned by the object map
/// matches the object's own xid; the object's storage class matches what
/// was asked for; the non-persistent flag is never set on anything read
/// off disk; the encrypted flag is an unsupported feature, not corruption.
pub fn read_object(
    device: &mut dyn BlockDevice,
    oid: u64,
    container_xid: u64,
    resolution: Resolution,
) -> CheckResult<Object> {
    match resolution {
        Resolution::Virtual { omap, at_xid } => {
            let record = omap
                .lookup(device, oid, at_xid)?
                .ok_or_else(|| CheckError::corruption("object map", format!("no mapping for oid {:#x} at xid {:#x}", oid, at_xid)))?;
            let object = read_object_nocheck(device, record.paddr)?;
            validate_common(&object, oid, container_xid)?;
            if object.header.xid != record.xid {
                return Err(CheckError::corruption(
                    "object",
                    format!("xid mismatch for oid {:#x}: object map says {:#x}, object says {:#x}", oid, record.xid, object.header.xid),
                ));
            }
            if object.header.storage_class() != OBJ_VIRTUAL {
                return Err(CheckError::corruption("object", format!("oid {:#x} is not marked virtual", oid)));
            }
            check_persistence(&object)?;
            Ok(object)
        }
        Resolution::Physical => {
            let object = read_object_nocheck(device, oid)?;
            validate_common(&object, oid, container_xid)?;
            if object.header.storage_class() != OBJ_PHYSICAL {
                return Err(CheckError::corruption("object", format!("oid {:#x} is not marked physical", oid)));
            }
            if object.header.oid != oid {
                return Err(CheckError::corruption("object", format!("physical object {:#x} does not satisfy oid == bno", oid)));
            }
            check_persistence(&object)?;
            Ok(object)
        }
        Resolution::Ephemeral { bno } => {
            let object = read_object_nocheck(device, bno)?;
            validate_common(&object, oid, container_xid)?;
            if object.header.storage_class() != OBJ_EPHEMERAL {
                return Err(CheckError::corruption("object", format!("oid {:#x} is not marked ephemeral", oid)));
            }
            check_persistence(&object)?;
            Ok(object)
        }
    }
}

fn validate_common(object: &Object, oid: u64, container_xid: u64) -> CheckResult<()> {
    if object.header.oid != oid {
        return Err(CheckError::corruption(
            "object",
            format!("header oid {:#x} does not match requested oid {:#x}", object.header.oid, oid),
        ));
    }
    if object.header.xid == 0 {
        return Err(CheckError::corruption("object", "xid is zero"));
    }
    if object.header.xid > container_xid {
        return Err(CheckError::corruption(
            "object",
            format!("xid {:#x} is newer than the container's xid {:#x}", object.header.xid, container_xid),
        ));
    }
    if oid >= types::APFS_OID_RESERVED_COUNT || oid == types::APFS_OID_NX_SUPERBLOCK {
        Ok(())
    } else {
        Err(CheckError::corruption("object", format!("oid {:#x} is in the reserved range", oid)))
    }
}

fn check_persistence(object: &Object) -> CheckResult<()> {
    if object.header.is_nonpersistent() {
        return Err(CheckError::corruption("object", "non-persistent flag set on an on-disk object"));
    }
    if object.header.is_encrypted() {
        return Err(CheckError::UnsupportedFeature(format!("encrypted object {:#x}", object.header.oid)));
    }
    Ok(())
}
