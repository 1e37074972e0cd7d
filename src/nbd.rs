// Benji backup system.

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.

//! NBD export of versions.
//!
//! Speaks the newstyle handshake with fixed-newstyle option negotiation and
//! the commands READ, WRITE, DISC, and FLUSH. Read-only exports advertise
//! `NBD_FLAG_READ_ONLY`. Writes on a read-write export go into a
//! copy-on-write store; on disconnect the accumulated writes are fixated
//! into a new protected version through the standard backup machinery
//! (hash, dedup, transform, storage put, row update) for the dirtied blocks
//! only, while untouched blocks inherit the original's rows.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::backup;
use crate::database::{LockDescriptor, LockMode};
use crate::errors::Error;
use crate::repository::Repository;
use crate::storage::cache::DiskCache;
use crate::version::{Version, VersionStatus, VersionUid};
use crate::Result;

// Magics.
const INIT_PASSWD: u64 = 0x4e42444d41474943; // b"NBDMAGIC"
const CLISERV_MAGIC: u64 = 0x49484156454f5054; // b"IHAVEOPT"
const NBD_OPT_REPLY_MAGIC: u64 = 0x3e889045565a9;
const NBD_REQUEST_MAGIC: u32 = 0x25609513;
const NBD_REPLY_MAGIC: u32 = 0x67446698;

// Options sent by the client.
const NBD_OPT_EXPORTNAME: u32 = 1;
const NBD_OPT_ABORT: u32 = 2;
const NBD_OPT_LIST: u32 = 3;
const NBD_OPT_GO: u32 = 7;

// Option replies.
const NBD_REP_ACK: u32 = 1;
const NBD_REP_SERVER: u32 = 2;
const NBD_REP_ERR_UNSUP: u32 = (1 << 31) | 1;

// Commands.
const NBD_CMD_MASK_COMMAND: u32 = 0x0000ffff;
const NBD_CMD_READ: u32 = 0;
const NBD_CMD_WRITE: u32 = 1;
const NBD_CMD_DISC: u32 = 2;
const NBD_CMD_FLUSH: u32 = 3;

// Handshake flags.
const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
const NBD_FLAG_NO_ZEROES: u16 = 1 << 1;

// Export flags.
const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
const NBD_FLAG_READ_ONLY: u16 = 1 << 1;
const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;

// Errnos permitted by the protocol.
const EPERM: u32 = 1;
const EIO: u32 = 5;
const EINVAL: u32 = 22;

/// The NBD device size is rounded up to a multiple of this; reads beyond
/// the version's size within the rounded extent return zeros.
const SIZE_ALIGNMENT: u64 = 4096;

/// A negotiation that stalls longer than this is abandoned.
const NEGOTIATION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub struct NbdServer {
    store: Arc<NbdStore>,
    read_only: bool,
    discard_changes: bool,
}

impl NbdServer {
    pub fn new(repo: Arc<Repository>, read_only: bool, discard_changes: bool) -> Result<NbdServer> {
        Ok(NbdServer {
            store: Arc::new(NbdStore::new(repo)?),
            read_only,
            discard_changes,
        })
    }

    /// Accept connections forever, one thread per client.
    pub fn serve(&self, addr: SocketAddr) -> Result<()> {
        if !addr.ip().is_loopback() {
            // No authentication and no transport encryption.
            warn!(%addr, "binding the NBD server to a non-loopback address, traffic is unprotected");
        }
        let listener = TcpListener::bind(addr)
            .map_err(|source| Error::io(addr.to_string(), source))?;
        info!(%addr, "NBD server listening");
        loop {
            let (stream, peer) = listener
                .accept()
                .map_err(|source| Error::io(addr.to_string(), source))?;
            info!(%peer, "incoming connection");
            let store = self.store.clone();
            let read_only = self.read_only;
            let discard_changes = self.discard_changes;
            std::thread::Builder::new()
                .name(format!("nbd ({})", peer))
                .spawn(move || {
                    let mut connection = Connection {
                        store,
                        read_only,
                        discard_changes,
                    };
                    if let Err(err) = connection.handle(stream) {
                        error!(%peer, %err, "connection failed");
                    }
                })
                .expect("spawn connection thread");
        }
    }
}

struct Connection {
    store: Arc<NbdStore>,
    read_only: bool,
    discard_changes: bool,
}

fn read_exact(stream: &mut TcpStream, buffer: &mut [u8]) -> Result<()> {
    stream
        .read_exact(buffer)
        .map_err(|source| Error::io("nbd client", source))
}

fn write_all(stream: &mut TcpStream, data: &[u8]) -> Result<()> {
    stream
        .write_all(data)
        .map_err(|source| Error::io("nbd client", source))
}

fn read_u32(stream: &mut TcpStream) -> Result<u32> {
    let mut buffer = [0u8; 4];
    read_exact(stream, &mut buffer)?;
    Ok(u32::from_be_bytes(buffer))
}

impl Connection {
    fn option_reply(
        &self,
        stream: &mut TcpStream,
        opt: u32,
        reply: u32,
        data: &[u8],
    ) -> Result<()> {
        let mut frame = Vec::with_capacity(20 + data.len());
        frame.extend_from_slice(&NBD_OPT_REPLY_MAGIC.to_be_bytes());
        frame.extend_from_slice(&opt.to_be_bytes());
        frame.extend_from_slice(&reply.to_be_bytes());
        frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
        frame.extend_from_slice(data);
        write_all(stream, &frame)
    }

    fn transmission_reply(
        &self,
        stream: &mut TcpStream,
        handle: u64,
        error: u32,
        data: Option<&[u8]>,
    ) -> Result<()> {
        let mut frame = Vec::with_capacity(16 + data.map_or(0, <[u8]>::len));
        frame.extend_from_slice(&NBD_REPLY_MAGIC.to_be_bytes());
        frame.extend_from_slice(&error.to_be_bytes());
        frame.extend_from_slice(&handle.to_be_bytes());
        if let Some(data) = data {
            frame.extend_from_slice(data);
        }
        write_all(stream, &frame)
    }

    fn handle(&mut self, mut stream: TcpStream) -> Result<()> {
        let mut version: Option<Version> = None;
        let mut cow: Option<CowContext> = None;
        let result = self.handle_inner(&mut stream, &mut version, &mut cow);

        let mut fixate_result = Ok(());
        if let Some(cow) = cow {
            fixate_result = if self.discard_changes {
                self.store.discard(cow)
            } else {
                self.store.fixate(cow)
            };
        }
        if let Some(version) = version {
            self.store.close(&version);
        }
        fixate_result?;
        match result {
            // A client that walks away right after negotiation is broken
            // but common; do not treat it as a hard error, the device
            // remains usable.
            Err(Error::Io { .. }) => Ok(()),
            other => other,
        }
    }

    fn handle_inner(
        &mut self,
        stream: &mut TcpStream,
        version: &mut Option<Version>,
        cow: &mut Option<CowContext>,
    ) -> Result<()> {
        stream
            .set_read_timeout(Some(NEGOTIATION_TIMEOUT))
            .map_err(|source| Error::io("nbd client", source))?;

        // Initial handshake.
        let mut greeting = Vec::with_capacity(18);
        greeting.extend_from_slice(&INIT_PASSWD.to_be_bytes());
        greeting.extend_from_slice(&CLISERV_MAGIC.to_be_bytes());
        greeting
            .extend_from_slice(&(NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES).to_be_bytes());
        write_all(stream, &greeting)?;

        let client_flags = read_u32(stream)?;
        let fixed = client_flags & u32::from(NBD_FLAG_FIXED_NEWSTYLE) != 0;
        if !fixed {
            warn!("client did not signal fixed newstyle handshake");
        }
        let no_zeroes = client_flags & u32::from(NBD_FLAG_NO_ZEROES) != 0;
        let unknown =
            client_flags & !u32::from(NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES);
        if unknown != 0 {
            return Err(Error::internal(format!(
                "handshake failed, unknown client flags {:#x}",
                unknown
            )));
        }

        // Option negotiation.
        loop {
            let mut header = [0u8; 16];
            read_exact(stream, &mut header)?;
            let magic = u64::from_be_bytes(header[0..8].try_into().expect("8 bytes"));
            let opt = u32::from_be_bytes(header[8..12].try_into().expect("4 bytes"));
            let length = u32::from_be_bytes(header[12..16].try_into().expect("4 bytes"));
            if magic != CLISERV_MAGIC {
                return Err(Error::internal("negotiation failed, bad option magic"));
            }
            let mut data = vec![0u8; length as usize];
            read_exact(stream, &mut data)?;
            debug!(opt, length, "received option");

            match opt {
                NBD_OPT_EXPORTNAME => {
                    let name = String::from_utf8_lossy(&data).into_owned();
                    let uid: VersionUid = match name.parse() {
                        Ok(uid) => uid,
                        Err(_) => {
                            if !fixed {
                                return Err(Error::internal("unknown export name"));
                            }
                            self.option_reply(stream, opt, NBD_REP_ERR_UNSUP, b"")?;
                            continue;
                        }
                    };
                    let export = match self.store.open(uid) {
                        Ok(export) => export,
                        Err(err) => {
                            warn!(%uid, %err, "export not available");
                            if !fixed {
                                return Err(Error::internal("unknown export name"));
                            }
                            self.option_reply(stream, opt, NBD_REP_ERR_UNSUP, b"")?;
                            continue;
                        }
                    };
                    info!(version = %export.uid, "negotiated export");

                    let mut export_flags = NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH;
                    if self.read_only {
                        export_flags |= NBD_FLAG_READ_ONLY;
                    }
                    let size = export.size.div_ceil(SIZE_ALIGNMENT) * SIZE_ALIGNMENT;
                    let mut frame = Vec::with_capacity(10 + 124);
                    frame.extend_from_slice(&size.to_be_bytes());
                    frame.extend_from_slice(&export_flags.to_be_bytes());
                    if !no_zeroes {
                        frame.extend_from_slice(&[0u8; 124]);
                    }
                    write_all(stream, &frame)?;
                    *version = Some(export);
                    break;
                }
                NBD_OPT_LIST => {
                    for export in self.store.list()? {
                        let name = export.to_string().into_bytes();
                        let mut payload = Vec::with_capacity(4 + name.len());
                        payload.extend_from_slice(&(name.len() as u32).to_be_bytes());
                        payload.extend_from_slice(&name);
                        self.option_reply(stream, opt, NBD_REP_SERVER, &payload)?;
                    }
                    self.option_reply(stream, opt, NBD_REP_ACK, b"")?;
                }
                NBD_OPT_ABORT => {
                    self.option_reply(stream, opt, NBD_REP_ACK, b"")?;
                    info!("client aborted negotiation");
                    return Ok(());
                }
                other => {
                    // nbd-client tries NBD_OPT_GO before NBD_OPT_EXPORTNAME,
                    // no point logging that one.
                    if other != NBD_OPT_GO {
                        warn!(opt = other, "received unsupported option");
                    }
                    if !fixed {
                        return Err(Error::internal(format!("unsupported option {}", other)));
                    }
                    self.option_reply(stream, opt, NBD_REP_ERR_UNSUP, b"")?;
                }
            }
        }

        let export = version.as_ref().expect("negotiated before transmission");

        // Transmission has no deadline: a quiet client is a healthy client.
        stream
            .set_read_timeout(None)
            .map_err(|source| Error::io("nbd client", source))?;

        // Transmission.
        loop {
            let mut header = [0u8; 28];
            read_exact(stream, &mut header)?;
            let magic = u32::from_be_bytes(header[0..4].try_into().expect("4 bytes"));
            let cmd_field = u32::from_be_bytes(header[4..8].try_into().expect("4 bytes"));
            let handle = u64::from_be_bytes(header[8..16].try_into().expect("8 bytes"));
            let offset = u64::from_be_bytes(header[16..24].try_into().expect("8 bytes"));
            let length = u32::from_be_bytes(header[24..28].try_into().expect("4 bytes"));
            if magic != NBD_REQUEST_MAGIC {
                return Err(Error::internal("bad request magic"));
            }
            let cmd = cmd_field & NBD_CMD_MASK_COMMAND;
            let cmd_flags = cmd_field & !NBD_CMD_MASK_COMMAND;
            debug!(cmd, handle, offset, length, "request");

            if cmd_flags != 0 {
                self.transmission_reply(stream, handle, EINVAL, None)?;
                continue;
            }
            match cmd {
                NBD_CMD_DISC => {
                    info!("client disconnecting");
                    return Ok(());
                }
                NBD_CMD_READ => {
                    match self
                        .store
                        .read(export, cow.as_ref(), offset, length as usize)
                    {
                        Ok(data) => self.transmission_reply(stream, handle, 0, Some(&data))?,
                        Err(err) => {
                            error!(%err, "read failed");
                            self.transmission_reply(stream, handle, EIO, None)?;
                        }
                    }
                }
                NBD_CMD_WRITE => {
                    let mut data = vec![0u8; length as usize];
                    read_exact(stream, &mut data)?;
                    if self.read_only {
                        self.transmission_reply(stream, handle, EPERM, None)?;
                        continue;
                    }
                    if cow.is_none() {
                        *cow = Some(self.store.create_cow(export)?);
                    }
                    let cow = cow.as_ref().expect("created above");
                    match self.store.write(cow, offset, &data) {
                        Ok(()) => self.transmission_reply(stream, handle, 0, None)?,
                        Err(err) => {
                            error!(%err, "write failed");
                            self.transmission_reply(stream, handle, EIO, None)?;
                        }
                    }
                }
                NBD_CMD_FLUSH => {
                    // The COW store is written through; nothing to sync.
                    self.transmission_reply(stream, handle, 0, None)?;
                }
                other => {
                    warn!(cmd = other, "unknown command");
                    self.transmission_reply(stream, handle, EINVAL, None)?;
                }
            }
        }
    }
}

/// State of one read-write export: the COW version and its dirtied blocks.
pub struct CowContext {
    pub version: Version,
    dirty: Mutex<HashSet<u64>>,
}

/// Access layer between the NBD protocol and the repository: block-granular
/// reads with a bounded on-disk cache, COW writes, and fixation.
pub struct NbdStore {
    repo: Arc<Repository>,
    block_cache: Option<DiskCache>,
    cow_directory: PathBuf,
}

impl NbdStore {
    pub fn new(repo: Arc<Repository>) -> Result<NbdStore> {
        let nbd_config = &repo.config().nbd;
        let block_cache = match &nbd_config.block_cache {
            Some(config) => Some(DiskCache::open(config)?),
            None => None,
        };
        let cow_directory = nbd_config
            .cow_store
            .as_ref()
            .map(|c| c.directory.clone())
            .ok_or_else(|| Error::config("nbd.cowStore.directory is not configured"))?;
        std::fs::create_dir_all(&cow_directory)
            .map_err(|source| Error::io(cow_directory.display().to_string(), source))?;
        Ok(NbdStore {
            repo,
            block_cache,
            cow_directory,
        })
    }

    pub fn list(&self) -> Result<Vec<VersionUid>> {
        Ok(self
            .repo
            .versions_with_filter(None)?
            .into_iter()
            .map(|v| v.uid)
            .collect())
    }

    pub fn open(&self, uid: VersionUid) -> Result<Version> {
        let version = self.repo.version_by_uid(uid)?;
        self.repo.db().lock(
            &LockDescriptor::version(uid),
            LockMode::Exclusive,
            "NBD export",
            false,
        )?;
        Ok(version)
    }

    pub fn close(&self, version: &Version) {
        let _ = self
            .repo
            .db()
            .unlock(&LockDescriptor::version(version.uid));
    }

    fn cow_block_path(&self, cow_uid: VersionUid, idx: u64) -> PathBuf {
        self.cow_directory
            .join(cow_uid.to_string())
            .join(format!("{:016x}", idx))
    }

    /// Fetch one stored block's payload through the block cache.
    fn fetch_block(&self, version: &Version, idx: u64) -> Result<Bytes> {
        let row = self
            .repo
            .db()
            .block_by_idx(version.uid, idx)?
            .ok_or_else(|| Error::NotFound {
                kind: "block",
                name: format!("{}/{}", version.uid, idx),
            })?;
        let Some(uid) = row.uid else {
            return Ok(Bytes::from(vec![0u8; row.size as usize]));
        };
        let cache_key = uid.storage_key();
        if let Some(cache) = &self.block_cache {
            if let Some(data) = cache.get(&cache_key) {
                return Ok(Bytes::from(data));
            }
        }
        let storage = self.repo.storage_by_id(version.storage_id)?;
        let (data, _) = storage.read_block(uid, true)?;
        if let Some(cache) = &self.block_cache {
            cache.set(&cache_key, &data);
        }
        Ok(data)
    }

    /// Byte-granular read over block-granular storage, zero-padded beyond
    /// the version's size up to the rounded device size.
    pub fn read(
        &self,
        version: &Version,
        cow: Option<&CowContext>,
        offset: u64,
        length: usize,
    ) -> Result<Vec<u8>> {
        let block_size = u64::from(version.block_size);
        let mut data = Vec::with_capacity(length);
        let mut position = offset;
        let end = offset + length as u64;
        while position < end {
            let idx = position / block_size;
            let offset_in_block = (position % block_size) as usize;
            let in_block = ((block_size as usize) - offset_in_block).min((end - position) as usize);

            if idx >= version.blocks_count() {
                // The device size is rounded up; reads past the content are
                // zeros.
                data.resize(data.len() + in_block, 0);
                position += in_block as u64;
                continue;
            }

            let dirty = cow.map_or(false, |c| c.dirty.lock().unwrap().contains(&idx));
            let block = if dirty {
                let cow = cow.expect("dirty implies cow");
                let path = self.cow_block_path(cow.version.uid, idx);
                Bytes::from(
                    std::fs::read(&path)
                        .map_err(|source| Error::io(path.display().to_string(), source))?,
                )
            } else {
                self.fetch_block(version, idx)?
            };
            let available = block.len().saturating_sub(offset_in_block);
            let take = in_block.min(available);
            if take > 0 {
                data.extend_from_slice(&block[offset_in_block..offset_in_block + take]);
            }
            // Short last block: pad to the requested length.
            data.resize(data.len() + (in_block - take), 0);
            position += in_block as u64;
        }
        Ok(data)
    }

    /// Create the copy-on-write version backing a read-write export. It is
    /// seeded from the original and fixated on disconnect.
    pub fn create_cow(&self, original: &Version) -> Result<CowContext> {
        let format = time::macros::format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second]Z"
        );
        let snapshot = format!(
            "nbd-cow-{}-{}",
            original.uid,
            time::OffsetDateTime::now_utc()
                .format(format)
                .expect("format UTC timestamp")
        );
        let storage = self.repo.storage_by_id(original.storage_id)?;
        let version = backup::create_version(
            &self.repo,
            None,
            &original.volume,
            &snapshot,
            original.size,
            original.block_size,
            Some(storage.name()),
            Some(original.uid),
        )?;
        let dir = self.cow_directory.join(version.uid.to_string());
        std::fs::create_dir_all(&dir)
            .map_err(|source| Error::io(dir.display().to_string(), source))?;
        info!(cow_version = %version.uid, original = %original.uid, "created COW version");
        Ok(CowContext {
            version,
            dirty: Mutex::new(HashSet::new()),
        })
    }

    /// Apply a write: dirtied blocks live as whole-block files in the COW
    /// store, created from the original content on first touch.
    pub fn write(&self, cow: &CowContext, offset: u64, data: &[u8]) -> Result<()> {
        let version = &cow.version;
        let block_size = u64::from(version.block_size);
        let mut position = 0usize;
        while position < data.len() {
            let absolute = offset + position as u64;
            let idx = absolute / block_size;
            let offset_in_block = (absolute % block_size) as usize;
            if idx >= version.blocks_count() {
                warn!(
                    offset,
                    "write beyond the end of the device, the data will be lost"
                );
                return Ok(());
            }
            let row = self
                .repo
                .db()
                .block_by_idx(version.uid, idx)?
                .ok_or_else(|| Error::NotFound {
                    kind: "block",
                    name: format!("{}/{}", version.uid, idx),
                })?;
            let in_block = (row.size as usize)
                .saturating_sub(offset_in_block)
                .min(data.len() - position);
            if in_block == 0 {
                warn!(offset, "write beyond the end of the device, the data will be lost");
                return Ok(());
            }

            let path = self.cow_block_path(version.uid, idx);
            let mut dirty = cow.dirty.lock().unwrap();
            let mut block = if dirty.contains(&idx) {
                std::fs::read(&path)
                    .map_err(|source| Error::io(path.display().to_string(), source))?
            } else {
                self.fetch_block(version, idx)?.to_vec()
            };
            block[offset_in_block..offset_in_block + in_block]
                .copy_from_slice(&data[position..position + in_block]);
            std::fs::write(&path, &block)
                .map_err(|source| Error::io(path.display().to_string(), source))?;
            dirty.insert(idx);
            drop(dirty);
            debug!(cow_version = %version.uid, idx, offset_in_block, in_block, "COW write");
            position += in_block;
        }
        Ok(())
    }

    /// Turn the COW store into a durable version: dirtied blocks run
    /// through hash, dedup, transform, and storage put; untouched blocks
    /// were inherited at creation time. The result is marked protected.
    pub fn fixate(&self, cow: CowContext) -> Result<()> {
        let version = &cow.version;
        info!(
            cow_version = %version.uid,
            blocks = cow.dirty.lock().unwrap().len(),
            "fixating COW version"
        );
        let storage = self.repo.storage_by_id(version.storage_id)?;
        let hasher = self.repo.hasher();
        let sparse_checksum = hasher.sparse_digest_hex(version.block_size);

        let result = (|| -> Result<()> {
            let dirty: Vec<u64> = {
                let mut indexes: Vec<u64> =
                    cow.dirty.lock().unwrap().iter().copied().collect();
                indexes.sort_unstable();
                indexes
            };
            for idx in dirty {
                let path = self.cow_block_path(version.uid, idx);
                let data = std::fs::read(&path)
                    .map_err(|source| Error::io(path.display().to_string(), source))?;
                let size = data.len() as u32;
                let checksum = hasher.digest_hex(&data);

                if checksum == sparse_checksum && size == version.block_size {
                    debug!(idx, "detected sparse block during fixation");
                    self.repo
                        .db()
                        .set_block(version.uid, idx, None, None, size, true)?;
                    continue;
                }
                let existing = match self.repo.db().block_by_checksum(&checksum, storage.id())? {
                    Some(existing) if existing.size == size => Some(existing),
                    _ => None,
                };
                let (uid, checksum) = match existing {
                    Some(existing) => (existing.uid, existing.checksum),
                    None => {
                        let uid = crate::version::BlockUid::new(version.uid.0, idx + 1);
                        storage.write_block(uid, &checksum, data)?;
                        (Some(uid), Some(checksum))
                    }
                };
                self.repo.db().set_block(
                    version.uid,
                    idx,
                    uid,
                    checksum.as_deref(),
                    size,
                    true,
                )?;
            }
            Ok(())
        })();

        if let Err(err) = result {
            let _ = self
                .repo
                .db()
                .unlock(&LockDescriptor::version(version.uid));
            return Err(err);
        }

        self.repo
            .db()
            .set_version_status(version.uid, VersionStatus::Valid)?;
        self.repo.db().set_version_protected(version.uid, true)?;
        self.repo.metadata_backup(&[version.uid], true)?;
        self.repo
            .db()
            .unlock(&LockDescriptor::version(version.uid))?;
        self.remove_cow_files(version.uid);
        info!(cow_version = %version.uid, "fixation finished");
        Ok(())
    }

    /// Throw the COW changes away and remove the COW version.
    pub fn discard(&self, cow: CowContext) -> Result<()> {
        let uid = cow.version.uid;
        let _ = self.repo.db().unlock(&LockDescriptor::version(uid));
        self.repo.db().rm_version(uid)?;
        self.remove_cow_files(uid);
        info!(cow_version = %uid, "discarded COW version");
        Ok(())
    }

    fn remove_cow_files(&self, uid: VersionUid) {
        let dir = self.cow_directory.join(uid.to_string());
        if let Err(err) = std::fs::remove_dir_all(&dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(?err, "unable to remove COW store directory");
            }
        }
    }
}
