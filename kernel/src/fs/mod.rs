//! Storage stack: device abstraction, block cache, file system, mounts.

pub mod blockdev;
pub mod cache;
pub mod flatfs;

use alloc::{string::String, sync::Arc, vec::Vec};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use blockdev::Storage;
use cache::BlockCache;
use flatfs::FlatFs;

/// Mounted volumes by mount-point name; the first entry is the root mount.
static MOUNTS: Mutex<Vec<(String, Arc<FlatFs>)>> = Mutex::new(Vec::new());

/// Register a volume under a mount-point name.
pub fn mount(name: &str, fs: Arc<FlatFs>) {
    let mut mounts = MOUNTS.lock();
    mounts.retain(|(n, _)| n != name);
    mounts.push((String::from(name), fs));
}

pub fn lookup(name: &str) -> Option<Arc<FlatFs>> {
    MOUNTS
        .lock()
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, fs)| fs.clone())
}

/// The first mounted volume, which the syscall layer treats as the root.
pub fn root_mount() -> Option<Arc<FlatFs>> {
    MOUNTS.lock().first().map(|(_, fs)| fs.clone())
}

/// Number of data blocks a RAM fallback disk carries.
const RAM_FALLBACK_BLOCKS: usize = 4096;

/// Boot step: put a cache over the probed disk (or a RAM disk when none
/// probed), mount it, formatting a blank image first.
pub fn init() -> KernelResult<()> {
    let dev: Arc<dyn Storage> = match crate::drivers::virtio::blk::device() {
        Some(dev) => {
            // The probed boot disk is a static; wrap it without ownership.
            struct Borrowed(&'static crate::drivers::virtio::blk::VirtioBlk);
            impl Storage for Borrowed {
                fn capacity_bytes(&self) -> u64 {
                    self.0.capacity_bytes()
                }
                fn read_block(
                    &self,
                    block: u64,
                    buf: &mut [u8; crate::config::BLKSZ],
                ) -> KernelResult<()> {
                    self.0.read_block(block, buf)
                }
                fn write_block(
                    &self,
                    block: u64,
                    buf: &[u8; crate::config::BLKSZ],
                ) -> KernelResult<()> {
                    self.0.write_block(block, buf)
                }
            }
            Arc::new(Borrowed(dev))
        }
        None => {
            log::warn!(target: "fs", "no disk probed, mounting a RAM disk");
            Arc::new(blockdev::RamDisk::new(RAM_FALLBACK_BLOCKS))
        }
    };

    let total_blocks = (dev.capacity_bytes() / crate::config::BLKSZ as u64) as u32;
    let cache = Arc::new(BlockCache::new(dev));
    let volume = match FlatFs::mount(cache.clone()) {
        Ok(volume) => volume,
        Err(KernelError::BadFormat { .. }) => {
            log::info!(target: "fs", "blank disk, formatting {} blocks", total_blocks);
            FlatFs::format(&cache, total_blocks, total_blocks / 4)?;
            FlatFs::mount(cache)?
        }
        Err(e) => return Err(e),
    };
    mount("disk", volume);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockdev::RamDisk;

    #[test]
    fn mount_registry_lookup_and_replace() {
        let disk = Arc::new(RamDisk::new(256));
        let cache = Arc::new(BlockCache::new(disk as Arc<dyn Storage>));
        FlatFs::format(&cache, 256, 16).unwrap();
        let fs = FlatFs::mount(cache).unwrap();

        mount("testvol", fs.clone());
        assert!(lookup("testvol").is_some());
        assert!(lookup("absent").is_none());

        // Remounting under the same name replaces the entry.
        mount("testvol", fs);
        let count = MOUNTS
            .lock()
            .iter()
            .filter(|(n, _)| n == "testvol")
            .count();
        assert_eq!(count, 1);
    }
}
