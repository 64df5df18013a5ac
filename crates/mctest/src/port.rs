use std::{
	collections::HashSet,
	fmt,
	net::{Ipv4Addr, SocketAddr, TcpListener},
	sync::{Arc, Mutex, PoisonError},
};

use once_cell::sync::Lazy;
use tracing::{debug, trace};

use crate::error::Error;

/// How many times the default allocator asks the kernel for a port before giving up.
const MAX_RESERVE_ATTEMPTS: usize = 64;

static GLOBAL_ALLOCATOR: Lazy<Arc<LoopbackPortAllocator>> =
	Lazy::new(|| Arc::new(LoopbackPortAllocator::default()));

/// Hands out local TCP ports that no other live server is using.
///
/// Implementations must be safe to call from many constructions at once and must not hand
/// the same port to two callers while a [`PortLease`] for it is alive.
pub trait PortAllocator: Send + Sync + 'static {
	fn reserve_port(&self) -> Result<PortLease, Error>;
}

/// The process-wide allocator used when a config does not name its own.
#[must_use]
pub fn global_allocator() -> Arc<LoopbackPortAllocator> {
	Arc::clone(&GLOBAL_ALLOCATOR)
}

type Registry = Arc<Mutex<HashSet<u16>>>;

/// Asks the kernel for an ephemeral port on `127.0.0.1` and remembers it until the lease drops.
#[derive(Debug, Default)]
pub struct LoopbackPortAllocator {
	leased: Registry,
}

impl LoopbackPortAllocator {
	#[must_use]
	pub fn leased_count(&self) -> usize {
		self.leased
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.len()
	}
}

impl PortAllocator for LoopbackPortAllocator {
	fn reserve_port(&self) -> Result<PortLease, Error> {
		for attempt in 1..=MAX_RESERVE_ATTEMPTS {
			// The listener closes at the end of this scope, leaving the port free to bind
			let port = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
				.and_then(|listener| listener.local_addr())
				.map_err(Error::PortAllocation)?
				.port();

			if self
				.leased
				.lock()
				.unwrap_or_else(PoisonError::into_inner)
				.insert(port)
			{
				debug!(port, attempt, "Reserved port");
				return Ok(PortLease {
					port,
					registry: Some(Arc::clone(&self.leased)),
				});
			}

			trace!(port, attempt, "Kernel handed back a port that is still leased");
		}

		Err(Error::PortsExhausted {
			attempts: MAX_RESERVE_ATTEMPTS,
		})
	}
}

/// A reserved port. The reservation is dropped together with the lease.
pub struct PortLease {
	port: u16,
	registry: Option<Registry>,
}

impl PortLease {
	/// A lease that is not tracked by any registry, for allocators with their own bookkeeping.
	#[must_use]
	pub const fn untracked(port: u16) -> Self {
		Self {
			port,
			registry: None,
		}
	}

	#[must_use]
	pub const fn port(&self) -> u16 {
		self.port
	}

	pub(crate) fn release(&mut self) {
		if let Some(registry) = self.registry.take() {
			registry
				.lock()
				.unwrap_or_else(PoisonError::into_inner)
				.remove(&self.port);
			trace!(port = self.port, "Released port");
		}
	}
}

impl fmt::Debug for PortLease {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PortLease")
			.field("port", &self.port)
			.field("tracked", &self.registry.is_some())
			.finish()
	}
}

impl Drop for PortLease {
	fn drop(&mut self) {
		self.release();
	}
}
