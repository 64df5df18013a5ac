use std::{
	net::{Ipv4Addr, SocketAddr},
	panic::resume_unwind,
	path::Path,
	process::Stdio,
	sync::Arc,
	time::Duration,
};

use tokio::{
	process::{Child, Command},
	spawn,
	task::JoinHandle,
	time::timeout,
};
use tracing::{debug, info, instrument, warn};

use crate::{
	client::Client,
	config::ServerConfig,
	error::Error,
	pid_file::PidFile,
	port::PortLease,
	readiness::{spawn_diagnostic_pump, wait_until_accepting},
	reporter::FailureReporter,
	test_name,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
	NotStarted,
	Starting,
	Ready,
	Stopped,
}

/// A memcached process owned by one test.
///
/// Built ready to use by [`Server::new_started`]; torn down with [`Server::stop`]. Dropping a
/// server without stopping it still kills the process, but does not wait for it to exit.
#[derive(Debug)]
pub struct Server {
	port: PortLease,
	address: SocketAddr,
	child: Child,
	pid_file: Option<PidFile>,
	diagnostics: Option<JoinHandle<Vec<String>>>,
	stop_timeout: Duration,
	client_timeout: Duration,
	state: ServerState,
	reporter: Arc<dyn FailureReporter>,
}

impl Server {
	/// Starts a server configured from the environment. See [`Server::new_started_with`].
	pub async fn new_started(reporter: impl FailureReporter) -> Self {
		Self::new_started_with(ServerConfig::from_env(), reporter).await
	}

	/// Starts a server and returns once it is accepting connections.
	///
	/// Each attempt gets `config.construction_timeout` to become ready. Attempts that run out
	/// of time are cancelled (killing their process) and a fresh one is started. A process that
	/// dies before it is ready is retried too, until `config.max_early_exits` of them in a row
	/// turn into [`Error::KeepsExiting`]. Any other setup failure goes to `reporter`.
	pub async fn new_started_with(config: ServerConfig, reporter: impl FailureReporter) -> Self {
		let reporter: Arc<dyn FailureReporter> = Arc::new(reporter);

		// must be read here, attempts run on runtime worker threads
		let namespace = config.namespace.clone().unwrap_or_else(test_name::current);
		let config = Arc::new(config);

		let mut attempt = 0_u32;
		let mut early_exits = 0_u32;
		loop {
			attempt += 1;

			if let Some(max_attempts) = config.max_attempts {
				if attempt > max_attempts.get() {
					reporter.fatal(Error::AttemptsExhausted {
						attempts: max_attempts.get(),
					});
				}
			}

			let mut handle = spawn(Self::try_start(
				Arc::clone(&config),
				namespace.clone(),
				Arc::clone(&reporter),
				attempt,
			));

			match timeout(config.construction_timeout, &mut handle).await {
				Ok(Ok(Ok(server))) => return server,

				Ok(Ok(Err(Error::ExitedBeforeReady {
					status,
					stderr_tail,
				}))) => {
					early_exits += 1;
					if early_exits >= config.max_early_exits.get() {
						reporter.fatal(Error::KeepsExiting {
							attempts: early_exits,
							status,
							stderr_tail,
						});
					}

					warn!(
						attempt,
						early_exits,
						?status,
						?stderr_tail,
						"Server exited before becoming ready, retrying",
					);
				}

				Ok(Ok(Err(e))) => reporter.fatal(e),

				Ok(Err(e)) => {
					if e.is_panic() {
						resume_unwind(e.into_panic());
					}
					early_exits = 0;
					warn!(attempt, ?e, "Server start attempt was cancelled, retrying");
				}

				Err(_) => {
					early_exits = 0;
					warn!(
						attempt,
						timeout = ?config.construction_timeout,
						"Server was not ready in time, retrying",
					);
					// dropping the attempt kills its process and frees its port and pid file
					handle.abort();
				}
			}
		}
	}

	#[instrument(skip(config, reporter), err)]
	async fn try_start(
		config: Arc<ServerConfig>,
		namespace: String,
		reporter: Arc<dyn FailureReporter>,
		attempt: u32,
	) -> Result<Self, Error> {
		let mut state = ServerState::NotStarted;

		let port = config.port_allocator.reserve_port()?;
		let address = SocketAddr::from((Ipv4Addr::LOCALHOST, port.port()));

		let pid_file = if config.use_pid_file {
			Some(PidFile::reserve(&namespace)?)
		} else {
			None
		};

		let mut command = Command::new(&config.binary);
		if let Some(flag) = config.verbosity_flag() {
			command.arg(flag);
		}
		command
			.arg("-l")
			.arg(address.to_string())
			.arg("-m")
			.arg(config.memory_limit_mb.to_string())
			.arg("-I")
			.arg(&config.max_item_size);
		if let Some(path) = pid_file.as_ref().and_then(PidFile::path) {
			command.arg("-P").arg(path);
		}
		command
			.args(&config.extra_args)
			.stdin(Stdio::null())
			.stdout(if config.verbose {
				Stdio::inherit()
			} else {
				Stdio::null()
			})
			.stderr(Stdio::piped())
			.kill_on_drop(true);

		debug!(%address, ?state, binary = %config.binary.display(), "Launching server");

		let mut child = command.spawn().map_err(|source| Error::Spawn {
			binary: config.binary.clone(),
			source,
		})?;

		state = ServerState::Starting;
		debug!(%address, pid = ?child.id(), ?state, "Spawned server");

		let stderr = child.stderr.take().ok_or(Error::MissingDiagnosticStream)?;
		let (diagnostics, ready_rx) = spawn_diagnostic_pump(stderr, &config.marker, config.verbose);

		if ready_rx.await.is_err() {
			let status = child.wait().await.ok();
			// the stream is closed, so the pump is already done
			let stderr_tail = diagnostics.await.unwrap_or_default();
			return Err(Error::ExitedBeforeReady {
				status,
				stderr_tail,
			});
		}

		wait_until_accepting(address).await;

		state = ServerState::Ready;
		info!(%address, pid = ?child.id(), "Server is ready");

		Ok(Self {
			port,
			address,
			child,
			pid_file,
			diagnostics: Some(diagnostics),
			stop_timeout: config.stop_timeout,
			client_timeout: config.client_timeout,
			state,
			reporter,
		})
	}

	/// Kills the server and waits up to the stop timeout for it to exit.
	///
	/// The pid file is removed and the port released whether or not the process exited in
	/// time. Stopping an already stopped server does nothing.
	#[instrument(skip(self), fields(address = %self.address))]
	pub async fn stop(&mut self) {
		if self.state == ServerState::Stopped {
			debug!("Server already stopped");
			return;
		}
		self.state = ServerState::Stopped;

		if let Err(e) = self.child.start_kill() {
			// usually means it already exited on its own
			debug!(?e, "Failed to signal server");
		}

		match timeout(self.stop_timeout, self.child.wait()).await {
			Ok(Ok(status)) => debug!(%status, "Server exited"),
			Ok(Err(e)) => warn!(?e, "Failed to wait for server exit"),
			Err(_) => warn!(
				timeout = ?self.stop_timeout,
				"Server did not exit in time, giving up on it",
			),
		}

		if let Some(diagnostics) = self.diagnostics.take() {
			diagnostics.abort();
		}

		if let Some(mut pid_file) = self.pid_file.take() {
			pid_file.remove();
		}

		self.port.release();
	}

	#[must_use]
	pub const fn address(&self) -> SocketAddr {
		self.address
	}

	#[must_use]
	pub const fn port(&self) -> u16 {
		self.address.port()
	}

	#[must_use]
	pub fn pid_file(&self) -> Option<&Path> {
		self.pid_file.as_ref().and_then(PidFile::path)
	}

	#[must_use]
	pub const fn state(&self) -> ServerState {
		self.state
	}

	/// A client for this server, failing fast after the configured client timeout.
	#[must_use]
	pub fn client(&self) -> Client {
		if self.state != ServerState::Ready {
			self.reporter.fatal(Error::NotReady { state: self.state });
		}

		Client::new(self.address, self.client_timeout)
	}
}

impl Drop for Server {
	fn drop(&mut self) {
		if self.state != ServerState::Stopped {
			debug!(address = %self.address, "Server dropped without being stopped, killing it");
		}
	}
}
