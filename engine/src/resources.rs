// SPDX-FileCopyrightText: 2025 Jens Pitkänen <jens.pitkanen@helsinki.fi>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Loading and storing resources asynchronously on the [`IoThread`].
//!
//! A [`BinaryResource`] is a buffer of bytes and the status of the last
//! operation done on it. [`load`] and [`store`] queue up a request on the IO
//! thread of a task scope, and signal the given fences when the request has
//! been run, whether it succeeded or not. File system errors don't propagate
//! to the scope, they're logged and recorded in [`BinaryResource::status`].
//!
//! [`IoThread`]: crate::multithreading::IoThread

use std::{
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
};

use platform::Fence;
use thiserror::Error;
use tracing::{debug, warn};

use crate::multithreading::Scope;

/// The state of a [`BinaryResource`] after the latest operation on it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResourceStatus {
    /// Nothing has been loaded, or the resource has been unloaded.
    #[default]
    Unloaded,
    /// The bytes were read from a file.
    Loaded,
    /// The bytes were written to a file.
    Stored,
    /// The latest load or store failed. Failed loads leave the bytes empty.
    Failed(ResourceError),
}

/// Reasons a [`load`] or [`store`] can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    /// The file does not exist.
    #[error("resource file {} does not exist", .path.display())]
    NotFound {
        /// The path that was loaded from.
        path: PathBuf,
    },
    /// Any other file system error.
    #[error("could not access resource file {}: {kind}", .path.display())]
    Io {
        /// The path that was loaded from or stored to.
        path: PathBuf,
        /// What went wrong.
        kind: io::ErrorKind,
    },
}

impl ResourceError {
    fn from_io(path: &Path, err: &io::Error) -> ResourceError {
        let path = path.to_path_buf();
        match err.kind() {
            io::ErrorKind::NotFound => ResourceError::NotFound { path },
            kind => ResourceError::Io { path, kind },
        }
    }
}

/// A resource stored as plain bytes, e.g. a file to be parsed later.
#[derive(Debug, Default)]
pub struct BinaryResource {
    /// The contents of the resource.
    pub bytes: Vec<u8>,
    /// The result of the latest operation.
    pub status: ResourceStatus,
}

impl BinaryResource {
    /// Creates a resource out of existing bytes, e.g. for storing them with
    /// [`store`].
    pub fn from_bytes(bytes: Vec<u8>) -> BinaryResource {
        BinaryResource {
            bytes,
            status: ResourceStatus::Unloaded,
        }
    }

    /// Returns true if the latest operation was a successful load.
    pub fn is_loaded(&self) -> bool {
        self.status == ResourceStatus::Loaded
    }
}

/// Queues up reading the file at `path` into the resource on the scope's IO
/// thread. The fences are signaled after the read, successful or not.
///
/// ### Panics
///
/// If the scope was created without an IO thread.
#[track_caller]
pub fn load<'scope>(
    scope: &Scope<'scope, '_>,
    fences: &[&'scope Fence],
    resource: &'scope mut BinaryResource,
    path: &'scope Path,
) {
    let BinaryResource { bytes, status } = resource;
    scope.push_io(fences, status, bytes, path, read_file);
}

/// Queues up writing the resource's bytes to the file at `path` on the scope's
/// IO thread, replacing the file if it exists. The fences are signaled after
/// the write, successful or not.
///
/// ### Panics
///
/// If the scope was created without an IO thread.
#[track_caller]
pub fn store<'scope>(
    scope: &Scope<'scope, '_>,
    fences: &[&'scope Fence],
    resource: &'scope mut BinaryResource,
    path: &'scope Path,
) {
    let BinaryResource { bytes, status } = resource;
    scope.push_io(fences, status, bytes, path, write_file);
}

/// Frees the resource's bytes.
pub fn unload(resource: &mut BinaryResource) {
    resource.bytes = Vec::new();
    resource.status = ResourceStatus::Unloaded;
}

fn read_file(status: &mut ResourceStatus, bytes: &mut Vec<u8>, path: &Path) {
    bytes.clear();
    let result = File::open(path).and_then(|mut file| file.read_to_end(bytes));
    match result {
        Ok(len) => {
            debug!("loaded {len} bytes from {}", path.display());
            *status = ResourceStatus::Loaded;
        }
        Err(err) => {
            warn!("failed to load {}: {err}", path.display());
            bytes.clear();
            *status = ResourceStatus::Failed(ResourceError::from_io(path, &err));
        }
    }
}

fn write_file(status: &mut ResourceStatus, bytes: &mut Vec<u8>, path: &Path) {
    match fs::write(path, bytes.as_slice()) {
        Ok(()) => {
            debug!("stored {} bytes to {}", bytes.len(), path.display());
            *status = ResourceStatus::Stored;
        }
        Err(err) => {
            warn!("failed to store {}: {err}", path.display());
            *status = ResourceStatus::Failed(ResourceError::from_io(path, &err));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf, time::Duration};

    use platform::Fence;

    use super::{load, store, unload, BinaryResource, ResourceError, ResourceStatus};
    use crate::{
        allocators::Arena,
        multithreading::{task_scope, IoThread, ThreadPool},
    };

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("hurdygurdy-{}-{name}", std::process::id()))
    }

    fn threads() -> (ThreadPool, IoThread) {
        let arena: &'static Arena = Box::leak(Box::new(Arena::new(256 * 1024)));
        let pool = ThreadPool::new(arena, 1, 16).unwrap();
        let io = IoThread::new(arena, 8, &pool).unwrap();
        (pool, io)
    }

    #[test]
    fn loads_file_contents() {
        let path = temp_path("load.bin");
        fs::write(&path, b"hello, world").unwrap();
        let (pool, io) = threads();

        let fence = Fence::new();
        let mut resource = BinaryResource::default();
        task_scope(&pool, Some(&io), |scope| {
            load(scope, &[&fence], &mut resource, &path);
            assert!(scope.wait(&fence, Duration::from_secs(5)));
        });

        assert!(resource.is_loaded());
        assert_eq!(b"hello, world", &resource.bytes[..]);
        unload(&mut resource);
        assert_eq!(ResourceStatus::Unloaded, resource.status);
        assert!(resource.bytes.is_empty());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_file_is_a_soft_failure() {
        let path = temp_path("does-not-exist.bin");
        let (pool, io) = threads();

        let fence = Fence::new();
        let mut resource = BinaryResource::from_bytes(vec![1, 2, 3]);
        task_scope(&pool, Some(&io), |scope| {
            load(scope, &[&fence], &mut resource, &path);
        });

        assert!(fence.is_complete());
        assert!(resource.bytes.is_empty());
        assert_eq!(
            ResourceStatus::Failed(ResourceError::NotFound { path: path.clone() }),
            resource.status,
        );
    }

    #[test]
    fn stored_bytes_can_be_loaded_back() {
        let path = temp_path("store.bin");
        let (pool, io) = threads();

        let stored = Fence::new();
        let loaded = Fence::new();
        let mut original = BinaryResource::from_bytes((0..=255).collect());
        let mut copy = BinaryResource::default();
        task_scope(&pool, Some(&io), |scope| {
            store(scope, &[&stored], &mut original, &path);
            // Requests run in order, so the load sees the stored file.
            load(scope, &[&loaded], &mut copy, &path);
        });

        assert!(stored.is_complete() && loaded.is_complete());
        assert_eq!(ResourceStatus::Stored, original.status);
        assert_eq!(original.bytes, copy.bytes);
        fs::remove_file(&path).unwrap();
    }
}
