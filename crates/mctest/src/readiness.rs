//! Readiness gate: the stderr marker scan and the TCP connectivity probe.
//!
//! Neither signal is enough on its own. memcached may log that it is listening a moment before
//! `accept` works, and a bare connect loop can't tell a slow start from a dead one.

use std::{collections::VecDeque, net::SocketAddr};

use tokio::{
	io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
	net::TcpStream,
	spawn,
	sync::oneshot,
	task::{yield_now, JoinHandle},
};
use tracing::{debug, trace};

const READ_BUFFER_SIZE: usize = 4096;
const TAIL_LINES: usize = 5;
const MAX_TAIL_LINE_LEN: usize = 512;

/// Incremental substring search over a byte stream.
///
/// Only the length of the marker prefix matched so far is kept, so a marker split over any
/// number of writes is still found, and it is reported exactly once.
#[derive(Debug)]
pub struct MarkerScanner {
	marker: Box<[u8]>,
	// failure[i]: length of the longest proper prefix of marker[..=i] that is also its suffix
	failure: Box<[usize]>,
	matched: usize,
	found: bool,
}

impl MarkerScanner {
	#[must_use]
	pub fn new(marker: impl AsRef<[u8]>) -> Self {
		let marker = marker.as_ref();
		let mut failure = vec![0; marker.len()];

		let mut k = 0;
		for i in 1..marker.len() {
			while k > 0 && marker[i] != marker[k] {
				k = failure[k - 1];
			}
			if marker[i] == marker[k] {
				k += 1;
			}
			failure[i] = k;
		}

		Self {
			marker: marker.into(),
			failure: failure.into_boxed_slice(),
			matched: 0,
			found: false,
		}
	}

	#[must_use]
	pub const fn found(&self) -> bool {
		self.found
	}

	/// Feeds the next chunk of the stream.
	///
	/// Returns `true` for the chunk that completes the first occurrence of the marker and
	/// `false` for every other call, before or after.
	pub fn feed(&mut self, chunk: &[u8]) -> bool {
		if self.found {
			return false;
		}

		if self.marker.is_empty() {
			self.found = true;
			return true;
		}

		for &byte in chunk {
			while self.matched > 0 && byte != self.marker[self.matched] {
				self.matched = self.failure[self.matched - 1];
			}
			if byte == self.marker[self.matched] {
				self.matched += 1;
			}
			if self.matched == self.marker.len() {
				self.found = true;
				return true;
			}
		}

		false
	}
}

/// The last few lines of a stream, each cut to a sane length.
#[derive(Debug, Default)]
pub(crate) struct LineTail {
	lines: VecDeque<String>,
	partial: Vec<u8>,
}

impl LineTail {
	pub(crate) fn push(&mut self, chunk: &[u8]) {
		for &byte in chunk {
			if byte == b'\n' {
				self.finish_line();
			} else if self.partial.len() < MAX_TAIL_LINE_LEN {
				self.partial.push(byte);
			}
		}
	}

	fn finish_line(&mut self) {
		let line = String::from_utf8_lossy(&self.partial)
			.trim_end_matches('\r')
			.to_string();
		self.partial.clear();

		if line.is_empty() {
			return;
		}
		if self.lines.len() == TAIL_LINES {
			self.lines.pop_front();
		}
		self.lines.push_back(line);
	}

	pub(crate) fn into_lines(mut self) -> Vec<String> {
		if !self.partial.is_empty() {
			self.finish_line();
		}

		self.lines.into()
	}
}

/// Drains a server's diagnostic stream for as long as the server lives.
///
/// The returned receiver completes once the marker shows up. It errors if the stream ends
/// first, which means the process went away. The task resolves to the last lines it read.
pub fn spawn_diagnostic_pump<R>(
	mut stream: R,
	marker: &str,
	echo: bool,
) -> (JoinHandle<Vec<String>>, oneshot::Receiver<()>)
where
	R: AsyncRead + Unpin + Send + 'static,
{
	let (ready_tx, ready_rx) = oneshot::channel();
	let mut scanner = MarkerScanner::new(marker);

	let handle = spawn(async move {
		let mut ready_tx = Some(ready_tx);
		let mut stderr = tokio::io::stderr();
		let mut buf = vec![0; READ_BUFFER_SIZE];
		let mut tail = LineTail::default();

		if scanner.feed(&[]) {
			if let Some(tx) = ready_tx.take() {
				tx.send(()).ok();
			}
		}

		loop {
			let read = match stream.read(&mut buf).await {
				Ok(0) => break,
				Ok(read) => read,
				Err(e) => {
					debug!(?e, "Diagnostic stream read failed");
					break;
				}
			};

			let chunk = &buf[..read];
			tail.push(chunk);

			if echo && stderr.write_all(chunk).await.is_err() {
				trace!("Our own stderr is gone, dropping diagnostic echo");
			}

			if scanner.feed(chunk) {
				if let Some(tx) = ready_tx.take() {
					trace!("Readiness marker found");
					// nobody waiting anymore means the attempt was abandoned
					tx.send(()).ok();
				}
			}
		}

		trace!("Diagnostic stream closed");
		tail.into_lines()
	});

	(handle, ready_rx)
}

/// Busy-polls `address` until a connection is accepted, then closes it.
pub async fn wait_until_accepting(address: SocketAddr) {
	let mut attempts = 0_u64;

	loop {
		attempts += 1;
		match TcpStream::connect(address).await {
			Ok(probe) => {
				drop(probe);
				debug!(%address, attempts, "Server is accepting connections");
				return;
			}
			Err(e) => {
				trace!(%address, ?e, "Probe connection refused");
				yield_now().await;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use tokio::{io::duplex, net::TcpListener, time::timeout};

	use super::*;

	#[test]
	fn finds_marker_in_a_single_chunk() {
		let mut scanner = MarkerScanner::new("server listening");

		assert!(scanner.feed(b"<26 server listening (auto-negotiate)\n"));
		assert!(scanner.found());
	}

	#[test]
	fn finds_marker_fed_one_byte_at_a_time() {
		let mut scanner = MarkerScanner::new("server listening");
		let stream = b"slab class 1: chunk size 96\n<26 server listening (udp)\n";

		let hits = stream
			.iter()
			.filter(|&&byte| scanner.feed(&[byte]))
			.count();

		assert_eq!(hits, 1);
	}

	#[test]
	fn fires_only_once() {
		let mut scanner = MarkerScanner::new("ready");

		assert!(!scanner.feed(b"rea"));
		assert!(scanner.feed(b"dy"));
		assert!(!scanner.feed(b"ready ready"));
	}

	#[test]
	fn recovers_from_partial_matches() {
		// "aab" inside "aaab" needs the failure table to fall back correctly
		let mut scanner = MarkerScanner::new("aab");
		assert!(!scanner.feed(b"a"));
		assert!(!scanner.feed(b"a"));
		assert!(!scanner.feed(b"a"));
		assert!(scanner.feed(b"b"));

		let mut scanner = MarkerScanner::new("server listening");
		assert!(!scanner.feed(b"server server listen"));
		assert!(scanner.feed(b"ing"));
	}

	#[test]
	fn ignores_near_misses() {
		let mut scanner = MarkerScanner::new("server listening");

		assert!(!scanner.feed(b"server listenin\n"));
		assert!(!scanner.feed(b"server_listening"));
		assert!(!scanner.found());
	}

	#[test]
	fn empty_marker_is_found_immediately() {
		let mut scanner = MarkerScanner::new("");

		assert!(scanner.feed(b""));
		assert!(!scanner.feed(b"anything"));
	}

	#[tokio::test]
	async fn pump_signals_marker_split_across_writes() {
		let (mut writer, reader) = duplex(64);
		let (handle, ready_rx) = spawn_diagnostic_pump(reader, "server listening", false);

		for byte in b"noise\nserver listening\nmore noise\n" {
			writer.write_all(std::slice::from_ref(byte)).await.unwrap();
			writer.flush().await.unwrap();
		}

		timeout(Duration::from_secs(5), ready_rx)
			.await
			.expect("marker was not detected")
			.expect("pump dropped the ready signal");

		drop(writer);
		handle.await.unwrap();
	}

	#[tokio::test]
	async fn pump_reports_stream_closed_before_marker() {
		let (mut writer, reader) = duplex(64);
		let (handle, ready_rx) = spawn_diagnostic_pump(reader, "server listening", false);

		writer
			.write_all(b"starting up\nfailed to listen on TCP port 11211")
			.await
			.unwrap();
		drop(writer);

		assert!(ready_rx.await.is_err());
		assert_eq!(
			handle.await.unwrap(),
			vec!["starting up", "failed to listen on TCP port 11211"]
		);
	}

	#[tokio::test]
	async fn pump_echoes_and_still_signals() {
		let (mut writer, reader) = duplex(64);
		let (handle, ready_rx) = spawn_diagnostic_pump(reader, "server listening", true);

		writer.write_all(b"<26 server listening\n").await.unwrap();

		timeout(Duration::from_secs(5), ready_rx)
			.await
			.expect("marker was not detected")
			.expect("pump dropped the ready signal");

		drop(writer);
		assert_eq!(handle.await.unwrap(), vec!["<26 server listening"]);
	}

	#[test]
	fn tail_keeps_only_the_last_lines() {
		let mut tail = LineTail::default();

		for i in 0..8 {
			tail.push(format!("line {i}\r\n").as_bytes());
		}
		tail.push(b"\n\nunterminated");

		assert_eq!(
			tail.into_lines(),
			vec!["line 4", "line 5", "line 6", "line 7", "unterminated"]
		);
	}

	#[test]
	fn tail_cuts_long_lines() {
		let mut tail = LineTail::default();
		tail.push(&[b'x'; MAX_TAIL_LINE_LEN * 2]);
		tail.push(b"\n");

		assert_eq!(tail.into_lines()[0].len(), MAX_TAIL_LINE_LEN);
	}

	#[tokio::test]
	async fn probe_returns_once_listener_accepts() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let address = listener.local_addr().unwrap();

		let accept = spawn(async move { listener.accept().await.map(|_| ()) });

		timeout(Duration::from_secs(5), wait_until_accepting(address))
			.await
			.expect("probe never connected");

		accept.await.unwrap().unwrap();
	}
}
