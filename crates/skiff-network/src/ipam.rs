//! Bitmap-based IPv4 address management.
//!
//! The allocation table maps a subnet's CIDR string to a bitmap string with
//! one character per address in the block: `'0'` is free, `'1'` is taken.
//! Bit `i` stands for the address `network + i + 1`, so offset 0 never hands
//! out the network address itself.
//!
//! Every call loads the whole table from disk and rewrites it. Callers in
//! different processes are serialized with an exclusive `flock` on a sidecar
//! lock file, and the table is replaced atomically through a rename so a crash
//! never leaves a half-written file behind.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use rustix::fs::{FlockOperation, flock};
use skiff_common::{SkiffError, SkiffResult};

use crate::subnet::Subnet;

/// Subnet CIDR string to allocation bitmap.
type Table = BTreeMap<String, String>;

/// Persistent IP allocator.
#[derive(Debug, Clone)]
pub struct Ipam {
    table_path: PathBuf,
}

impl Ipam {
    /// Create an allocator backed by the table at `table_path`.
    pub fn new(table_path: impl Into<PathBuf>) -> Self {
        Self {
            table_path: table_path.into(),
        }
    }

    /// Path of the persisted table.
    #[must_use]
    pub fn table_path(&self) -> &Path {
        &self.table_path
    }

    /// Allocate the first free address of `subnet`.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::AddressExhausted`] when no usable address is
    /// left, or an I/O error if the table cannot be read or written.
    pub fn allocate(&self, subnet: &Subnet) -> SkiffResult<Ipv4Addr> {
        self.with_table(|table| {
            let bitmap = table
                .entry(subnet.to_string())
                .or_insert_with(|| "0".repeat(subnet.size()));
            check_len(subnet, bitmap)?;

            // The last two offsets map to the broadcast address and one past
            // the block; they are never handed out.
            let usable = subnet.size() - 2;
            let offset = bitmap.as_bytes()[..usable]
                .iter()
                .position(|&b| b == b'0')
                .ok_or_else(|| SkiffError::AddressExhausted {
                    subnet: subnet.to_string(),
                })?;
            bitmap.replace_range(offset..=offset, "1");

            let ip = subnet.nth(offset_to_host(offset)?);
            tracing::debug!(%subnet, %ip, "Allocated address");
            Ok(ip)
        })
    }

    /// Return `ip` to the free pool of `subnet`.
    ///
    /// Releasing into a subnet the table has never seen is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::AddressOutOfRange`] when `ip` is not an
    /// allocatable address of `subnet`.
    pub fn release(&self, subnet: &Subnet, ip: Ipv4Addr) -> SkiffResult<()> {
        let out_of_range = || SkiffError::AddressOutOfRange {
            ip: ip.to_string(),
            subnet: subnet.to_string(),
        };
        let offset = subnet
            .offset_of(ip)
            .and_then(|o| o.checked_sub(1))
            .ok_or_else(out_of_range)? as usize;

        self.with_table(|table| {
            let Some(bitmap) = table.get_mut(&subnet.to_string()) else {
                tracing::warn!(%subnet, %ip, "Release into unknown subnet ignored");
                return Ok(());
            };
            check_len(subnet, bitmap)?;
            if offset >= bitmap.len() {
                return Err(out_of_range());
            }
            bitmap.replace_range(offset..=offset, "0");
            tracing::debug!(%subnet, %ip, "Released address");
            Ok(())
        })
    }

    /// Current bitmap of `subnet`, if the table knows it.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be read.
    pub fn bitmap(&self, subnet: &Subnet) -> SkiffResult<Option<String>> {
        let _lock = self.lock()?;
        Ok(self.load()?.remove(&subnet.to_string()))
    }

    /// Run `f` on the loaded table under the lock, then persist it if `f` succeeded.
    fn with_table<T>(&self, f: impl FnOnce(&mut Table) -> SkiffResult<T>) -> SkiffResult<T> {
        let _lock = self.lock()?;
        let mut table = self.load()?;
        let value = f(&mut table)?;
        self.store(&table)?;
        Ok(value)
    }

    fn lock(&self) -> SkiffResult<File> {
        if let Some(parent) = self.table_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())?;
        flock(&file, FlockOperation::LockExclusive).map_err(|e| SkiffError::Io(e.into()))?;
        Ok(file)
    }

    fn load(&self) -> SkiffResult<Table> {
        match fs::read_to_string(&self.table_path) {
            Ok(content) if content.trim().is_empty() => Ok(Table::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Table::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, table: &Table) -> SkiffResult<()> {
        let tmp = self.table_path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(table)?)?;
        fs::rename(&tmp, &self.table_path)?;
        Ok(())
    }

    fn lock_path(&self) -> PathBuf {
        self.table_path.with_extension("json.lock")
    }
}

fn check_len(subnet: &Subnet, bitmap: &str) -> SkiffResult<()> {
    if bitmap.len() == subnet.size() {
        Ok(())
    } else {
        Err(SkiffError::Serialization(format!(
            "bitmap for {subnet} has {} entries, expected {}",
            bitmap.len(),
            subnet.size()
        )))
    }
}

fn offset_to_host(offset: usize) -> SkiffResult<u32> {
    u32::try_from(offset + 1).map_err(|_| SkiffError::Internal {
        message: format!("bitmap offset {offset} overflows an IPv4 address"),
    })
}
