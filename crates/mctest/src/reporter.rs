use std::fmt;

use crate::error::Error;

/// Where fatal setup failures go.
///
/// A broken fixture should abort the test that asked for it, so there is no way back from
/// [`FailureReporter::fatal`]. Implementations usually record the error and panic.
pub trait FailureReporter: Send + Sync + 'static {
	fn fatal(&self, error: Error) -> !;
}

/// Fails the current test by panicking with the setup error.
#[derive(Debug, Default, Clone, Copy)]
pub struct PanicReporter;

impl FailureReporter for PanicReporter {
	fn fatal(&self, error: Error) -> ! {
		panic!("mctest: {error}")
	}
}

impl fmt::Debug for dyn FailureReporter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("FailureReporter")
	}
}
