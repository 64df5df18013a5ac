use std::{
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex, PoisonError,
	},
	time::Duration,
};

use mctest::{
	global_allocator, Error, FailureReporter, PortAllocator, PortLease, ServerConfig, VERBOSE_ENV,
};

pub const STUB_SERVER: &str = env!("CARGO_BIN_EXE_mctest-stub-server");

/// Config pointing at the stub server, with timeouts short enough for a test run.
pub fn stub_config() -> ServerConfig {
	ServerConfig::default()
		.with_binary(STUB_SERVER)
		.with_verbose(std::env::var(VERBOSE_ENV).is_ok_and(|value| value == "1"))
		.with_construction_timeout(Duration::from_secs(10))
		.with_stop_timeout(Duration::from_secs(5))
}

/// Keeps every fatal error it sees, then fails like a test would.
#[derive(Debug, Clone, Default)]
pub struct RecordingReporter {
	errors: Arc<Mutex<Vec<String>>>,
}

impl RecordingReporter {
	pub fn errors(&self) -> Vec<String> {
		self.errors
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
	}
}

impl FailureReporter for RecordingReporter {
	fn fatal(&self, error: Error) -> ! {
		let message = error.to_string();
		self.errors
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.push(message.clone());
		panic!("{message}")
	}
}

/// Hands out a port somebody else is already listening on, a set number of times, then behaves.
pub struct BusyPortAllocator {
	busy_port: u16,
	remaining: AtomicUsize,
	handed_out: AtomicUsize,
}

impl BusyPortAllocator {
	pub fn new(busy_port: u16, times: usize) -> Self {
		Self {
			busy_port,
			remaining: AtomicUsize::new(times),
			handed_out: AtomicUsize::new(0),
		}
	}

	pub fn busy_ports_handed_out(&self) -> usize {
		self.handed_out.load(Ordering::Acquire)
	}
}

impl PortAllocator for BusyPortAllocator {
	fn reserve_port(&self) -> Result<PortLease, Error> {
		let busy = self
			.remaining
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
			.is_ok();

		if busy {
			self.handed_out.fetch_add(1, Ordering::AcqRel);
			Ok(PortLease::untracked(self.busy_port))
		} else {
			global_allocator().reserve_port()
		}
	}
}

/// Pids of live processes whose command line contains `needle`.
#[cfg(target_os = "linux")]
pub fn processes_mentioning(needle: &std::ffi::OsStr) -> Vec<u32> {
	let needle = needle.as_encoded_bytes();

	std::fs::read_dir("/proc")
		.unwrap()
		.filter_map(Result::ok)
		.filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
		.filter(|pid| {
			// zombies and processes that exited meanwhile read back empty or fail
			std::fs::read(format!("/proc/{pid}/cmdline")).is_ok_and(|cmdline| {
				cmdline
					.windows(needle.len())
					.any(|window| window == needle)
			})
		})
		.collect()
}
