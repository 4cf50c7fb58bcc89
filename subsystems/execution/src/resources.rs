//! # Open Files and Working Directory
//!
//! Files and directories belong to the file system; a unit only holds
//! counted references to them. Fork and clone duplicate every reference,
//! exit drops them.

use alloc::vec;
use alloc::vec::Vec;

use crate::{ExecError, ExecResult};

/// Reference to an open file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u64);

/// Reference to a directory inode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CwdHandle(pub u64);

/// Reference-counting operations of the file system
pub trait ResourceManager: Send + Sync {
    /// Take another reference to `file`
    fn duplicate_file(&self, file: FileHandle) -> FileHandle;

    /// Drop one reference to `file`
    fn close_file(&self, file: FileHandle);

    /// Reference to the root directory
    fn root_cwd(&self) -> CwdHandle;

    /// Take another reference to `cwd`
    fn duplicate_cwd(&self, cwd: CwdHandle) -> CwdHandle;

    /// Drop one reference to `cwd`
    fn release_cwd(&self, cwd: CwdHandle);
}

/// Per-unit descriptor table
#[derive(Debug, Clone, Default)]
pub struct FileTable {
    slots: Vec<Option<FileHandle>>,
}

impl FileTable {
    /// Empty table with `capacity` descriptors
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    /// Put `file` in the lowest free descriptor
    pub fn install(&mut self, file: FileHandle) -> ExecResult<usize> {
        let fd = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(ExecError::OutOfResources)?;
        self.slots[fd] = Some(file);
        Ok(fd)
    }

    /// Remove and return the file at `fd`
    pub fn take(&mut self, fd: usize) -> ExecResult<FileHandle> {
        self.slots
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(ExecError::InvalidArgument)
    }

    /// File at `fd`, if open
    pub fn get(&self, fd: usize) -> Option<FileHandle> {
        self.slots.get(fd).copied().flatten()
    }

    /// Number of open descriptors
    pub fn open_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Copy of this table with every reference duplicated
    pub fn duplicate(&self, resources: &dyn ResourceManager) -> Self {
        Self {
            slots: self
                .slots
                .iter()
                .map(|slot| slot.map(|file| resources.duplicate_file(file)))
                .collect(),
        }
    }

    /// Close every open descriptor
    pub fn close_all(&mut self, resources: &dyn ResourceManager) {
        for file in self.slots.iter_mut().filter_map(Option::take) {
            resources.close_file(file);
        }
    }
}
