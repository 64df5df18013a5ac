use std::{
	ffi::OsString,
	fmt,
	num::NonZeroU32,
	path::PathBuf,
	sync::Arc,
	time::Duration,
};

use crate::port::{global_allocator, PortAllocator};

/// Substring memcached writes to stderr once its listener is up.
pub const SERVER_LISTENING: &str = "server listening";

/// Set to `1` to echo server diagnostics to our own stderr.
pub const VERBOSE_ENV: &str = "MCTEST_VERBOSE";
/// Overrides the server binary.
pub const BINARY_ENV: &str = "MCTEST_MEMCACHED";

const DEFAULT_BINARY: &str = "memcached";
const DEFAULT_CONSTRUCTION_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_MAX_EARLY_EXITS: NonZeroU32 = match NonZeroU32::new(3) {
	Some(n) => n,
	None => unreachable!(),
};

/// How a [`Server`](crate::Server) is launched, waited on and torn down.
#[derive(Clone)]
pub struct ServerConfig {
	pub binary: PathBuf,
	/// Number of `v`s in the verbosity flag, memcached needs at least one to log readiness.
	pub verbosity: u8,
	/// Memory ceiling in megabytes (`-m`).
	pub memory_limit_mb: u32,
	/// Item size ceiling (`-I`), in memcached's own notation.
	pub max_item_size: String,
	pub use_pid_file: bool,
	pub extra_args: Vec<OsString>,
	pub marker: String,
	pub verbose: bool,
	pub construction_timeout: Duration,
	pub stop_timeout: Duration,
	pub client_timeout: Duration,
	/// `None` keeps constructing until a server comes up.
	pub max_attempts: Option<NonZeroU32>,
	/// Consecutive exits before readiness that we tolerate before giving up.
	pub max_early_exits: NonZeroU32,
	/// Prefix for temp file names. Derived from the running test when unset.
	pub namespace: Option<String>,
	pub port_allocator: Arc<dyn PortAllocator>,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			binary: PathBuf::from(DEFAULT_BINARY),
			verbosity: 2,
			memory_limit_mb: 8,
			max_item_size: "256k".to_string(),
			use_pid_file: true,
			extra_args: Vec::new(),
			marker: SERVER_LISTENING.to_string(),
			verbose: false,
			construction_timeout: DEFAULT_CONSTRUCTION_TIMEOUT,
			stop_timeout: DEFAULT_STOP_TIMEOUT,
			client_timeout: DEFAULT_CLIENT_TIMEOUT,
			max_attempts: None,
			max_early_exits: DEFAULT_MAX_EARLY_EXITS,
			namespace: None,
			port_allocator: global_allocator(),
		}
	}
}

impl ServerConfig {
	/// Defaults, adjusted by `MCTEST_VERBOSE` and `MCTEST_MEMCACHED`.
	#[must_use]
	pub fn from_env() -> Self {
		Self::from_lookup(|key| std::env::var_os(key))
	}

	fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> Self {
		let mut config = Self::default();

		if lookup(VERBOSE_ENV).is_some_and(|value| value == "1") {
			config.verbose = true;
		}

		if let Some(binary) = lookup(BINARY_ENV).filter(|value| !value.is_empty()) {
			config.binary = PathBuf::from(binary);
		}

		config
	}

	#[must_use]
	pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
		self.binary = binary.into();
		self
	}

	#[must_use]
	pub fn with_verbosity(mut self, verbosity: u8) -> Self {
		self.verbosity = verbosity;
		self
	}

	#[must_use]
	pub fn with_memory_limit_mb(mut self, memory_limit_mb: u32) -> Self {
		self.memory_limit_mb = memory_limit_mb;
		self
	}

	#[must_use]
	pub fn with_max_item_size(mut self, max_item_size: impl Into<String>) -> Self {
		self.max_item_size = max_item_size.into();
		self
	}

	#[must_use]
	pub fn with_pid_file(mut self, use_pid_file: bool) -> Self {
		self.use_pid_file = use_pid_file;
		self
	}

	#[must_use]
	pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
		self.extra_args.push(arg.into());
		self
	}

	#[must_use]
	pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
		self.marker = marker.into();
		self
	}

	#[must_use]
	pub fn with_verbose(mut self, verbose: bool) -> Self {
		self.verbose = verbose;
		self
	}

	#[must_use]
	pub fn with_construction_timeout(mut self, timeout: Duration) -> Self {
		self.construction_timeout = timeout;
		self
	}

	#[must_use]
	pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
		self.stop_timeout = timeout;
		self
	}

	#[must_use]
	pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
		self.client_timeout = timeout;
		self
	}

	#[must_use]
	pub fn with_max_attempts(mut self, max_attempts: Option<NonZeroU32>) -> Self {
		self.max_attempts = max_attempts;
		self
	}

	#[must_use]
	pub fn with_max_early_exits(mut self, max_early_exits: NonZeroU32) -> Self {
		self.max_early_exits = max_early_exits;
		self
	}

	#[must_use]
	pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
		self.namespace = Some(namespace.into());
		self
	}

	#[must_use]
	pub fn with_port_allocator(mut self, allocator: Arc<dyn PortAllocator>) -> Self {
		self.port_allocator = allocator;
		self
	}

	pub(crate) fn verbosity_flag(&self) -> Option<String> {
		(self.verbosity > 0).then(|| format!("-{}", "v".repeat(usize::from(self.verbosity))))
	}
}

impl fmt::Debug for ServerConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ServerConfig")
			.field("binary", &self.binary)
			.field("verbosity", &self.verbosity)
			.field("memory_limit_mb", &self.memory_limit_mb)
			.field("max_item_size", &self.max_item_size)
			.field("use_pid_file", &self.use_pid_file)
			.field("extra_args", &self.extra_args)
			.field("marker", &self.marker)
			.field("verbose", &self.verbose)
			.field("construction_timeout", &self.construction_timeout)
			.field("stop_timeout", &self.stop_timeout)
			.field("client_timeout", &self.client_timeout)
			.field("max_attempts", &self.max_attempts)
			.field("max_early_exits", &self.max_early_exits)
			.field("namespace", &self.namespace)
			.finish_non_exhaustive()
	}
}
