//! Container packing
//!
//! Chunks are appended into one open, fixed-capacity container held in memory.
//! When the next chunk does not fit, the open container is written to
//! `<container_dir>/<name>.container` and a fresh one takes its place. Names are
//! 15 lowercase letters; each new name is the next lexicographic permutation of
//! the previous one, starting from `abcdefghijklmno`.
//!
//! The open container's name and fill level live in a two-line sidecar file
//! (`<name>\n<used>\n`) so a restarted process appends exactly where the last
//! one stopped.

use std::path::{Path, PathBuf};

use tds_core::{ContainerLocation, TdsError, TdsResult};

use crate::cache::ReadCache;

pub const INITIAL_CONTAINER_NAME: &str = "abcdefghijklmno";
pub const CONTAINER_EXTENSION: &str = "container";

/// The in-memory container currently receiving appends.
#[derive(Debug)]
struct Container {
    name: String,
    body: Vec<u8>,
}

impl Container {
    fn used(&self) -> usize {
        self.body.len()
    }
}

/// Owns the open container, the container directory, and the restore read cache.
#[derive(Debug)]
pub struct ContainerManager {
    dir: PathBuf,
    state_file: PathBuf,
    capacity: usize,
    open: Container,
    cache: ReadCache,
    dirty: bool,
    rotations: u64,
    file_loads: u64,
}

impl ContainerManager {
    /// Open the container directory, resuming from the sidecar if one exists.
    ///
    /// `capacity` must be at least 2 bytes, since a payload is accepted only if
    /// it leaves the container strictly below capacity.
    pub fn open(
        dir: &Path,
        state_file: &Path,
        capacity: usize,
        cache: ReadCache,
    ) -> TdsResult<Self> {
        if capacity < 2 {
            return Err(TdsError::Config(format!(
                "container capacity must be at least 2 bytes (got {capacity})"
            )));
        }
        std::fs::create_dir_all(dir)?;

        let open = match read_sidecar(state_file)? {
            Some((name, used)) => {
                if used >= capacity {
                    return Err(TdsError::Corrupt(format!(
                        "sidecar {} records {used} used bytes, capacity is {capacity}",
                        state_file.display()
                    )));
                }
                let body = load_prefix(&container_path(dir, &name), used)?;
                tracing::info!(container = %name, used, "resumed open container");
                Container { name, body }
            }
            None => Container {
                name: INITIAL_CONTAINER_NAME.to_string(),
                body: Vec::new(),
            },
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            state_file: state_file.to_path_buf(),
            capacity,
            open,
            cache,
            dirty: false,
            rotations: 0,
            file_loads: 0,
        })
    }

    pub fn current_name(&self) -> &str {
        &self.open.name
    }

    pub fn used(&self) -> usize {
        self.open.used()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Containers closed by this manager since it was opened.
    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    /// Containers loaded from disk to serve reads.
    pub fn file_loads(&self) -> u64 {
        self.file_loads
    }

    pub fn cache(&self) -> &ReadCache {
        &self.cache
    }

    /// Append `payload` to the open container, rotating first if it does not fit.
    ///
    /// A payload that could never fit (length >= capacity) is rejected without
    /// touching the open container.
    pub fn write(&mut self, payload: &[u8]) -> TdsResult<ContainerLocation> {
        if payload.len() >= self.capacity {
            return Err(TdsError::Storage(format!(
                "payload of {} bytes cannot fit a {}-byte container",
                payload.len(),
                self.capacity
            )));
        }
        let length = u32::try_from(payload.len()).map_err(|_| {
            TdsError::Storage(format!("payload of {} bytes is too large", payload.len()))
        })?;

        if self.open.used() + payload.len() >= self.capacity {
            self.rotate()?;
        }

        let offset = self.open.used() as u64;
        if self.open.body.capacity() == 0 {
            self.open.body.reserve_exact(self.capacity);
        }
        self.open.body.extend_from_slice(payload);
        self.dirty = true;

        Ok(ContainerLocation {
            container: self.open.name.clone(),
            offset,
            length,
        })
    }

    /// Read the bytes at `loc`.
    ///
    /// Order: the open container, then the read cache, then the container file
    /// (which is then cached).
    pub fn read(&mut self, loc: &ContainerLocation) -> TdsResult<Vec<u8>> {
        if loc.container == self.open.name {
            return slice_at(&self.open.body, loc);
        }

        if let Some(body) = self.cache.get(&loc.container) {
            return slice_at(body, loc);
        }

        let path = container_path(&self.dir, &loc.container);
        let body = std::fs::read(&path).map_err(|e| {
            TdsError::Storage(format!("opening container {}: {e}", path.display()))
        })?;
        self.file_loads += 1;
        tracing::debug!(container = %loc.container, bytes = body.len(), "loaded container");

        let out = slice_at(&body, loc)?;
        self.cache.insert(loc.container.clone(), body);
        Ok(out)
    }

    /// Persist the open container and the sidecar recording its name and fill level.
    pub fn checkpoint(&mut self) -> TdsResult<()> {
        write_atomic(&container_path(&self.dir, &self.open.name), &self.open.body)?;
        let sidecar = format!("{}\n{}\n", self.open.name, self.open.used());
        write_atomic(&self.state_file, sidecar.as_bytes())?;
        self.dirty = false;
        tracing::debug!(
            container = %self.open.name,
            used = self.open.used(),
            "container checkpoint"
        );
        Ok(())
    }

    fn rotate(&mut self) -> TdsResult<()> {
        let path = container_path(&self.dir, &self.open.name);
        write_atomic(&path, &self.open.body)?;

        let mut next = self.open.name.clone().into_bytes();
        if !next_permutation(&mut next) {
            return Err(TdsError::Storage(format!(
                "container name space exhausted after {}",
                self.open.name
            )));
        }
        let next = String::from_utf8(next)
            .map_err(|e| TdsError::Storage(format!("container name not UTF-8: {e}")))?;

        tracing::info!(
            closed = %self.open.name,
            used = self.open.used(),
            next = %next,
            "container rotated"
        );
        // the closed container is complete on disk; point the sidecar past it
        write_atomic(&self.state_file, format!("{next}\n0\n").as_bytes())?;
        self.open = Container {
            name: next,
            body: Vec::new(),
        };
        self.rotations += 1;
        Ok(())
    }
}

impl Drop for ContainerManager {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.checkpoint() {
                tracing::warn!("failed to checkpoint open container on drop: {e}");
            }
        }
    }
}

pub fn container_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{CONTAINER_EXTENSION}"))
}

/// Rearrange `seq` into the next lexicographically greater permutation.
///
/// Returns `false` (leaving `seq` sorted ascending) when `seq` was the last one.
pub fn next_permutation(seq: &mut [u8]) -> bool {
    if seq.len() < 2 {
        return false;
    }
    let mut i = seq.len() - 1;
    while i > 0 && seq[i - 1] >= seq[i] {
        i -= 1;
    }
    if i == 0 {
        seq.reverse();
        return false;
    }
    let pivot = i - 1;
    let mut j = seq.len() - 1;
    while seq[j] <= seq[pivot] {
        j -= 1;
    }
    seq.swap(pivot, j);
    seq[i..].reverse();
    true
}

fn slice_at(body: &[u8], loc: &ContainerLocation) -> TdsResult<Vec<u8>> {
    let start = usize::try_from(loc.offset)
        .map_err(|_| TdsError::Corrupt(format!("offset {} out of range", loc.offset)))?;
    let end = start
        .checked_add(loc.length as usize)
        .filter(|end| *end <= body.len())
        .ok_or_else(|| {
            TdsError::Corrupt(format!(
                "short read from container {}: want {}+{}, have {} bytes",
                loc.container,
                loc.offset,
                loc.length,
                body.len()
            ))
        })?;
    Ok(body[start..end].to_vec())
}

fn read_sidecar(path: &Path) -> TdsResult<Option<(String, usize)>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let mut lines = content.lines();
    let name = lines.next().map(str::trim).unwrap_or_default();
    let used = lines.next().map(str::trim).unwrap_or_default();

    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_lowercase()) {
        return Err(TdsError::Corrupt(format!(
            "sidecar {} has an invalid container name: {name:?}",
            path.display()
        )));
    }
    let used = used.parse::<usize>().map_err(|e| {
        TdsError::Corrupt(format!(
            "sidecar {} has an invalid used count {used:?}: {e}",
            path.display()
        ))
    })?;
    Ok(Some((name.to_string(), used)))
}

fn load_prefix(path: &Path, used: usize) -> TdsResult<Vec<u8>> {
    if used == 0 && !path.exists() {
        return Ok(Vec::new());
    }
    let mut body = std::fs::read(path).map_err(|e| {
        TdsError::Corrupt(format!(
            "sidecar names container {} but it cannot be read: {e}",
            path.display()
        ))
    })?;
    if body.len() < used {
        return Err(TdsError::Corrupt(format!(
            "container {} holds {} bytes, sidecar records {used}",
            path.display(),
            body.len()
        )));
    }
    body.truncate(used);
    Ok(body)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> TdsResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn manager(dir: &Path, capacity: usize) -> ContainerManager {
        ContainerManager::open(
            &dir.join("containers"),
            &dir.join("state"),
            capacity,
            ReadCache::default(),
        )
        .unwrap()
    }

    #[test]
    fn next_permutation_advances_lexicographically() {
        let mut name = INITIAL_CONTAINER_NAME.as_bytes().to_vec();
        assert!(next_permutation(&mut name));
        assert_eq!(name, b"abcdefghijklmon");
        assert!(next_permutation(&mut name));
        assert_eq!(name, b"abcdefghijklnmo");
    }

    #[test]
    fn next_permutation_exhausts() {
        let mut last = b"cba".to_vec();
        assert!(!next_permutation(&mut last));
        assert_eq!(last, b"abc");
    }

    #[test]
    fn first_container_name() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 100);
        assert_eq!(mgr.current_name(), INITIAL_CONTAINER_NAME);
        assert_eq!(mgr.used(), 0);
    }

    #[test]
    fn write_requires_strictly_less_than_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = manager(dir.path(), 100);

        let a = mgr.write(&[1u8; 60]).unwrap();
        assert_eq!(a.offset, 0);
        // 60 + 40 == 100 is not < 100, so this rotates
        let b = mgr.write(&[2u8; 40]).unwrap();
        assert_ne!(a.container, b.container);
        assert_eq!(b.offset, 0);
        assert_eq!(mgr.rotations(), 1);
        assert!(container_path(&dir.path().join("containers"), &a.container).exists());
    }

    #[test]
    fn oversized_payload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = manager(dir.path(), 100);
        mgr.write(&[0u8; 10]).unwrap();

        assert!(mgr.write(&[0u8; 100]).is_err());
        assert_eq!(mgr.used(), 10);
        assert_eq!(mgr.rotations(), 0);
    }

    #[test]
    fn read_from_open_container_and_closed_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = manager(dir.path(), 100);

        let a = mgr.write(&[0xAAu8; 60]).unwrap();
        assert_eq!(mgr.read(&a).unwrap(), vec![0xAA; 60]);

        let b = mgr.write(&[0xBBu8; 60]).unwrap();
        assert_eq!(mgr.read(&b).unwrap(), vec![0xBB; 60]);
        assert_eq!(mgr.file_loads(), 0);

        assert_eq!(mgr.read(&a).unwrap(), vec![0xAA; 60]);
        assert_eq!(mgr.file_loads(), 1);
        // second read of the same closed container is served from cache
        assert_eq!(mgr.read(&a).unwrap(), vec![0xAA; 60]);
        assert_eq!(mgr.file_loads(), 1);
    }

    #[test]
    fn out_of_bounds_read_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = manager(dir.path(), 100);
        let mut loc = mgr.write(&[1u8; 10]).unwrap();
        loc.length = 50;
        assert!(mgr.read(&loc).unwrap_err().is_corruption());
    }

    #[test]
    fn missing_container_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = manager(dir.path(), 100);
        let loc = ContainerLocation {
            container: "zyxwvutsrqponml".into(),
            offset: 0,
            length: 1,
        };
        assert!(mgr.read(&loc).is_err());
    }

    #[test]
    fn checkpoint_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let (name, tail) = {
            let mut mgr = manager(dir.path(), 100);
            mgr.write(&[1u8; 30]).unwrap();
            let loc = mgr.write(&[2u8; 60]).unwrap();
            let loc2 = mgr.write(&[3u8; 20]).unwrap();
            assert_ne!(loc.container, loc2.container);
            mgr.checkpoint().unwrap();
            (mgr.current_name().to_string(), loc2)
        };

        let sidecar = std::fs::read_to_string(dir.path().join("state")).unwrap();
        assert_eq!(sidecar, format!("{name}\n20\n"));

        let mut mgr = manager(dir.path(), 100);
        assert_eq!(mgr.current_name(), name);
        assert_eq!(mgr.used(), 20);
        assert_eq!(mgr.read(&tail).unwrap(), vec![3u8; 20]);

        let next = mgr.write(&[4u8; 5]).unwrap();
        assert_eq!(next.container, name);
        assert_eq!(next.offset, 20);
    }

    #[test]
    fn drop_checkpoints_dirty_container() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut mgr = manager(dir.path(), 100);
            mgr.write(&[7u8; 12]).unwrap();
        }
        let mgr = manager(dir.path(), 100);
        assert_eq!(mgr.used(), 12);
    }

    #[test]
    fn sidecar_pointing_past_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let containers = dir.path().join("containers");
        std::fs::create_dir_all(&containers).unwrap();
        std::fs::write(container_path(&containers, INITIAL_CONTAINER_NAME), [0u8; 4]).unwrap();
        std::fs::write(dir.path().join("state"), format!("{INITIAL_CONTAINER_NAME}\n50\n")).unwrap();

        let err = ContainerManager::open(
            &containers,
            &dir.path().join("state"),
            100,
            ReadCache::default(),
        )
        .unwrap_err();
        assert!(err.is_corruption());
    }

    proptest! {
        #[test]
        fn used_never_reaches_capacity(sizes in proptest::collection::vec(1usize..120, 1..40)) {
            let dir = tempfile::tempdir().unwrap();
            let mut mgr = manager(dir.path(), 100);
            for size in sizes {
                let result = mgr.write(&vec![0u8; size]);
                if size >= 100 {
                    prop_assert!(result.is_err());
                } else {
                    let loc = result.unwrap();
                    prop_assert!(loc.offset as usize + size < 100);
                }
                prop_assert!(mgr.used() < mgr.capacity());
            }
        }
    }
}
