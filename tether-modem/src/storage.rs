//! # storage - Where file upload bodies come from
//!
//! File bodies are streamed off storage that shares a bus with other
//! peripherals. The bus is taken with a non-blocking try, held for the
//! whole of the upload and given back on every path out of it.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// File access for upload bodies.
pub trait Storage {
	/// An open file
	type File;
	/// Take the bus if it is free. Never blocks.
	fn try_acquire_bus(&mut self) -> bool;
	/// Give the bus back.
	fn release_bus(&mut self);
	/// Open a file for reading.
	fn open(&mut self, path: &Path) -> Option<Self::File>;
	/// Read up to `buffer.len()` bytes. `Ok(0)` means end of file.
	fn read(&mut self, file: &mut Self::File, buffer: &mut [u8]) -> io::Result<usize>;
	/// The length of a file, if it exists.
	fn length(&mut self, path: &Path) -> Option<u64>;
	fn close(&mut self, file: Self::File);
}

/// A bus lock which can be shared between tasks. Cloning gives another
/// reference to the same lock.
#[derive(Debug, Clone, Default)]
pub struct StorageBus(Arc<AtomicBool>);

/// `Storage` on the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct FsStorage {
	bus: StorageBus,
}

// ****************************************************************************
//
// Public Functions
//
// ****************************************************************************

impl StorageBus {
	pub fn new() -> StorageBus {
		StorageBus::default()
	}

	pub fn try_acquire(&self) -> bool {
		self.0
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
	}

	pub fn release(&self) {
		if !self.0.swap(false, Ordering::AcqRel) {
			warn!("Released storage bus that wasn't held");
		}
	}

	pub fn is_held(&self) -> bool {
		self.0.load(Ordering::Acquire)
	}
}

impl FsStorage {
	pub fn new(bus: StorageBus) -> FsStorage {
		FsStorage { bus: bus }
	}

	pub fn bus(&self) -> &StorageBus {
		&self.bus
	}
}

impl Storage for FsStorage {
	type File = fs::File;

	fn try_acquire_bus(&mut self) -> bool {
		self.bus.try_acquire()
	}

	fn release_bus(&mut self) {
		self.bus.release()
	}

	fn open(&mut self, path: &Path) -> Option<fs::File> {
		match fs::File::open(path) {
			Ok(file) => Some(file),
			Err(err) => {
				warn!("Can't open {}: {}", path.display(), err);
				None
			}
		}
	}

	fn read(&mut self, file: &mut fs::File, buffer: &mut [u8]) -> io::Result<usize> {
		file.read(buffer)
	}

	fn length(&mut self, path: &Path) -> Option<u64> {
		fs::metadata(path).ok().map(|m| m.len())
	}

	fn close(&mut self, file: fs::File) {
		drop(file);
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::env;
	use std::process;

	#[test]
	fn bus_is_exclusive() {
		let bus = StorageBus::new();
		let other = bus.clone();
		assert!(bus.try_acquire());
		assert!(!other.try_acquire());
		assert!(other.is_held());
		bus.release();
		assert!(other.try_acquire());
	}

	#[test]
	fn reads_a_real_file() {
		let path = env::temp_dir().join(format!("tether-storage-{}", process::id()));
		fs::write(&path, b"0123456789").unwrap();
		let mut storage = FsStorage::new(StorageBus::new());
		assert_eq!(storage.length(&path), Some(10));
		let mut file = storage.open(&path).unwrap();
		let mut buffer = [0u8; 4];
		assert_eq!(storage.read(&mut file, &mut buffer).unwrap(), 4);
		assert_eq!(&buffer, b"0123");
		storage.close(file);
		fs::remove_file(&path).unwrap();
		assert!(storage.open(&path).is_none());
		assert_eq!(storage.length(&path), None);
	}
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
