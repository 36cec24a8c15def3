//! Persistent storage for the address tables.
//!
//! Both tables serialize to a flat byte stream (see their `Encodable`
//! implementations) which this module wraps in a file envelope: the
//! payload followed by its 32-byte double-SHA256 checksum. The
//! checksum means *any* corruption of the file, down to a single
//! flipped byte, is caught before decoding begins, and the caller
//! starts from an empty table instead of a subtly damaged one.
//!
//! Writes go to a sibling `.new` file which is synced and renamed over
//! the target, so an interrupted write never clobbers the previous
//! good state.
use std::fs;
use std::io::Write;
use std::path::Path;

use bitcoin_hashes::{sha256d, Hash};

use crate::error::Error;

/// Length of the trailing checksum.
const CHECKSUM_SIZE: usize = 32;

/// Write a payload to the given path, checksummed and atomically
/// replacing any previous file.
pub fn write<P: AsRef<Path>>(path: P, payload: &[u8]) -> Result<(), Error> {
    let path = path.as_ref();
    let tmp = path.with_extension("new");
    let checksum = sha256d::Hash::hash(payload);

    let mut file = fs::File::create(&tmp)?;
    file.write_all(payload)?;
    file.write_all(&checksum.into_inner())?;
    file.sync_all()?;

    fs::rename(&tmp, path)?;

    Ok(())
}

/// Read a payload written by [`write`], verifying its checksum.
pub fn read<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, Error> {
    let mut data = fs::read(path)?;

    if data.len() < CHECKSUM_SIZE {
        return Err(Error::Corrupt("file too short to hold a checksum"));
    }
    let payload_len = data.len() - CHECKSUM_SIZE;
    let checksum = sha256d::Hash::hash(&data[..payload_len]);

    if data[payload_len..] != checksum.into_inner() {
        return Err(Error::Corrupt("checksum mismatch"));
    }
    data.truncate(payload_len);

    Ok(data)
}
