use std::{
	io,
	path::{Path, PathBuf},
};

use tracing::{trace, warn};

use crate::error::FileIOError;

/// Path handed to the server's `-P` flag.
///
/// We only own the *name*: a temp file is created and removed right away so no other
/// reservation can be given the same name, then the server writes its pid there.
#[derive(Debug)]
pub struct PidFile {
	path: Option<PathBuf>,
}

impl PidFile {
	pub fn reserve(namespace: &str) -> Result<Self, FileIOError> {
		let temp_dir = std::env::temp_dir();

		let file = tempfile::Builder::new()
			.prefix(namespace)
			.tempfile()
			.map_err(|e| FileIOError::new(&temp_dir, "failed to create pid file", e))?;

		let path = file.path().to_path_buf();

		file.close()
			.map_err(|e| FileIOError::new(&path, "failed to release pid file name", e))?;

		trace!(path = %path.display(), "Reserved pid file name");

		Ok(Self { path: Some(path) })
	}

	pub fn path(&self) -> Option<&Path> {
		self.path.as_deref()
	}

	/// Removes the file if the server left one behind. Missing files are fine.
	pub fn remove(&mut self) {
		let Some(path) = self.path.take() else {
			return;
		};

		match std::fs::remove_file(&path) {
			Ok(()) => trace!(path = %path.display(), "Removed pid file"),
			Err(e) if e.kind() == io::ErrorKind::NotFound => {}
			Err(e) => warn!("{}", FileIOError::new(path, "failed to remove pid file", e)),
		}
	}
}

impl Drop for PidFile {
	fn drop(&mut self) {
		self.remove();
	}
}
