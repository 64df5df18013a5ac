//! A stand-in for `memcached` that speaks enough of the text protocol for tests.
//!
//! It takes the same flags mctest passes to the real server, writes its pid file and logs
//! `server listening` to stderr once the socket is bound. A few extra flags let tests make it
//! misbehave.

use std::{
	collections::HashMap,
	net::SocketAddr,
	path::PathBuf,
	process::ExitCode,
	sync::{Arc, Mutex, PoisonError},
	time::Duration,
};

use clap::{ArgAction, Parser};
use tokio::{
	io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream},
	net::{TcpListener, TcpStream},
	spawn,
	time::sleep,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// memcached exits with `EX_OSERR` when it can't bind.
const EXIT_LISTEN_FAILED: u8 = 71;

#[derive(Debug, Parser)]
#[command(name = "mctest-stub-server", version)]
struct Args {
	/// Verbosity, memcached style (`-v`, `-vv`)
	#[arg(short = 'v', action = ArgAction::Count)]
	verbose: u8,
	/// Address to listen on
	#[arg(short = 'l')]
	listen: SocketAddr,
	/// Memory limit in megabytes, accepted and ignored
	#[arg(short = 'm', default_value_t = 64)]
	memory_limit_mb: u32,
	/// Largest item we accept, e.g. `256k` or `1m`
	#[arg(short = 'I', default_value = "1m", value_parser = parse_size)]
	max_item_size: usize,
	/// Where to write our pid
	#[arg(short = 'P')]
	pid_file: Option<PathBuf>,
	/// If this file exists, delete it and hang forever without ever becoming ready
	#[arg(long)]
	stall_once: Option<PathBuf>,
	/// Write the readiness line one byte at a time
	#[arg(long)]
	trickle_marker: bool,
	/// Exit on our own this long after becoming ready
	#[arg(long)]
	exit_after_ms: Option<u64>,
}

type Store = Arc<Mutex<HashMap<String, (u32, Vec<u8>)>>>;

fn parse_size(size: &str) -> Result<usize, String> {
	let size = size.trim();
	let (digits, multiplier) = match size.chars().last() {
		Some('k' | 'K') => (&size[..size.len() - 1], 1024),
		Some('m' | 'M') => (&size[..size.len() - 1], 1024 * 1024),
		_ => (size, 1),
	};

	digits
		.parse::<usize>()
		.map(|n| n * multiplier)
		.map_err(|e| format!("invalid item size '{size}': {e}"))
}

#[tokio::main]
async fn main() -> ExitCode {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
		)
		.with_writer(std::io::stderr)
		.init();

	let args = Args::parse();
	debug!(memory_limit_mb = args.memory_limit_mb, "Memory limit is not enforced");

	if let Some(path) = &args.stall_once {
		if std::fs::remove_file(path).is_ok() {
			warn!(path = %path.display(), "Stalling as requested");
			std::future::pending::<()>().await;
		}
	}

	let listener = match TcpListener::bind(args.listen).await {
		Ok(listener) => listener,
		Err(e) => {
			eprintln!("failed to listen on TCP port {}: {e}", args.listen.port());
			return ExitCode::from(EXIT_LISTEN_FAILED);
		}
	};

	if let Some(path) = &args.pid_file {
		if let Err(e) = std::fs::write(path, format!("{}\n", std::process::id())) {
			eprintln!("Could not open the pid file {} for writing: {e}", path.display());
		}
	}

	if args.verbose > 0 {
		announce_listening(args.trickle_marker).await;
	}

	if let Some(ms) = args.exit_after_ms {
		spawn(async move {
			sleep(Duration::from_millis(ms)).await;
			info!("Exiting on our own");
			std::process::exit(0);
		});
	}

	let store = Store::default();

	tokio::select! {
		() = accept_loop(listener, store, args.verbose, args.max_item_size) => {}
		() = shutdown_signal() => info!("Shutting down"),
	}

	if let Some(path) = &args.pid_file {
		std::fs::remove_file(path).ok();
	}

	ExitCode::SUCCESS
}

async fn announce_listening(trickle: bool) {
	let line = b"<26 server listening (auto-negotiate)\n";
	let mut stderr = tokio::io::stderr();

	if trickle {
		for byte in line {
			stderr.write_all(std::slice::from_ref(byte)).await.ok();
			stderr.flush().await.ok();
			sleep(Duration::from_millis(1)).await;
		}
	} else {
		stderr.write_all(line).await.ok();
		stderr.flush().await.ok();
	}
}

async fn shutdown_signal() {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{signal, SignalKind};

		match signal(SignalKind::terminate()) {
			Ok(mut terminate) => {
				tokio::select! {
					_ = terminate.recv() => {}
					_ = tokio::signal::ctrl_c() => {}
				}
			}
			Err(e) => {
				error!(?e, "Failed to install SIGTERM handler");
				tokio::signal::ctrl_c().await.ok();
			}
		}
	}

	#[cfg(not(unix))]
	tokio::signal::ctrl_c().await.ok();
}

async fn accept_loop(listener: TcpListener, store: Store, verbose: u8, max_item_size: usize) {
	loop {
		match listener.accept().await {
			Ok((stream, peer)) => {
				if verbose > 1 {
					eprintln!("<{} new auto-negotiating client connection", peer.port());
				}
				let store = Arc::clone(&store);
				spawn(async move {
					if let Err(e) = serve(stream, store, verbose, max_item_size).await {
						debug!(%peer, ?e, "Connection closed with error");
					}
				});
			}
			Err(e) => error!(?e, "Failed to accept connection"),
		}
	}
}

async fn serve(
	stream: TcpStream,
	store: Store,
	verbose: u8,
	max_item_size: usize,
) -> std::io::Result<()> {
	let mut conn = BufStream::new(stream);
	let mut line = String::new();

	loop {
		line.clear();
		if conn.read_line(&mut line).await? == 0 {
			return Ok(());
		}

		let command = line.trim_end_matches(['\r', '\n']).to_string();
		if verbose > 1 {
			eprintln!("<{command}");
		}

		let parts = command.split(' ').collect::<Vec<_>>();
		let reply = match parts.as_slice() {
			["set", key, flags, _exptime, len, rest @ ..] => {
				let (Ok(flags), Ok(len)) = (flags.parse::<u32>(), len.parse::<usize>()) else {
					conn.write_all(b"CLIENT_ERROR bad command line format\r\n").await?;
					conn.flush().await?;
					continue;
				};

				let mut data = vec![0; len + 2];
				conn.read_exact(&mut data).await?;

				let reply = if !data.ends_with(b"\r\n") {
					"CLIENT_ERROR bad data chunk".to_string()
				} else if len > max_item_size {
					"SERVER_ERROR object too large for cache".to_string()
				} else {
					data.truncate(len);
					store
						.lock()
						.unwrap_or_else(PoisonError::into_inner)
						.insert((*key).to_string(), (flags, data));
					"STORED".to_string()
				};

				if rest.first() == Some(&"noreply") {
					continue;
				}
				reply
			}

			["get" | "gets", keys @ ..] if !keys.is_empty() => {
				let mut reply = Vec::new();
				{
					let store = store.lock().unwrap_or_else(PoisonError::into_inner);
					for key in keys {
						if let Some((flags, value)) = store.get(*key) {
							reply.extend_from_slice(
								format!("VALUE {key} {flags} {}\r\n", value.len()).as_bytes(),
							);
							reply.extend_from_slice(value);
							reply.extend_from_slice(b"\r\n");
						}
					}
				}
				reply.extend_from_slice(b"END\r\n");

				conn.write_all(&reply).await?;
				conn.flush().await?;
				continue;
			}

			["delete", key, ..] => {
				let removed = store
					.lock()
					.unwrap_or_else(PoisonError::into_inner)
					.remove(*key)
					.is_some();
				(if removed { "DELETED" } else { "NOT_FOUND" }).to_string()
			}

			["version"] => format!("VERSION {}-mctest-stub", env!("CARGO_PKG_VERSION")),

			["quit"] => return Ok(()),

			_ => "ERROR".to_string(),
		};

		if verbose > 1 {
			eprintln!(">{reply}");
		}

		conn.write_all(reply.as_bytes()).await?;
		conn.write_all(b"\r\n").await?;
		conn.flush().await?;
	}
}
