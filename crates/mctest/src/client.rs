use std::{net::SocketAddr, time::Duration};

use thiserror::Error;
use tokio::{
	io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream},
	net::TcpStream,
	sync::Mutex,
	time::{error::Elapsed, timeout},
};
use tracing::trace;

const MAX_KEY_LENGTH: usize = 250;

#[derive(Debug, Error)]
pub enum ClientError {
	#[error("memcache I/O error: {0}")]
	Io(#[from] std::io::Error),
	#[error("memcache operation timed out after {0:?}")]
	Timeout(Duration),
	#[error("malformed key: {0:?}")]
	MalformedKey(String),
	#[error("item not stored")]
	NotStored,
	#[error("server error: {0}")]
	ServerError(String),
	#[error("client error: {0}")]
	ClientError(String),
	#[error("unexpected response: {0:?}")]
	UnexpectedResponse(String),
}

/// A cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
	pub key: String,
	pub value: Vec<u8>,
	pub flags: u32,
	/// Seconds until expiry, `0` never expires.
	pub expiration: u32,
}

impl Item {
	pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
		Self {
			key: key.into(),
			value: value.into(),
			flags: 0,
			expiration: 0,
		}
	}
}

/// Minimal memcached text protocol client for a single server.
///
/// The connection is opened on first use and thrown away after any failure, so the next
/// operation starts from a clean stream. Every operation is bounded by the client timeout.
#[derive(Debug)]
pub struct Client {
	address: SocketAddr,
	timeout: Duration,
	conn: Mutex<Option<BufStream<TcpStream>>>,
}

impl Client {
	#[must_use]
	pub fn new(address: SocketAddr, timeout: Duration) -> Self {
		Self {
			address,
			timeout,
			conn: Mutex::new(None),
		}
	}

	#[must_use]
	pub const fn address(&self) -> SocketAddr {
		self.address
	}

	#[must_use]
	pub const fn timeout(&self) -> Duration {
		self.timeout
	}

	pub async fn set(&self, item: &Item) -> Result<(), ClientError> {
		check_key(&item.key)?;

		let mut request = format!(
			"set {} {} {} {}\r\n",
			item.key,
			item.flags,
			item.expiration,
			item.value.len()
		)
		.into_bytes();
		request.extend_from_slice(&item.value);
		request.extend_from_slice(b"\r\n");

		let mut slot = self.conn.lock().await;
		let res = timeout(self.timeout, async {
			let conn = connection(&mut slot, self.address).await?;
			send(conn, &request).await?;

			let line = read_line(conn).await?;
			match line.as_str() {
				"STORED" => Ok(()),
				"NOT_STORED" => Err(ClientError::NotStored),
				_ => Err(error_from_line(line)),
			}
		})
		.await;

		self.settle(&mut slot, res)
	}

	/// Fetches `key`, `None` on a cache miss.
	pub async fn get(&self, key: &str) -> Result<Option<Item>, ClientError> {
		check_key(key)?;

		let request = format!("get {key}\r\n");

		let mut slot = self.conn.lock().await;
		let res = timeout(self.timeout, async {
			let conn = connection(&mut slot, self.address).await?;
			send(conn, request.as_bytes()).await?;

			let mut found = None;
			loop {
				let line = read_line(conn).await?;
				if line == "END" {
					return Ok(found);
				}

				let Some((key, flags, len)) = line
					.strip_prefix("VALUE ")
					.and_then(parse_value_header)
				else {
					return Err(error_from_line(line));
				};

				// value plus its trailing \r\n
				let mut value = vec![0; len + 2];
				conn.read_exact(&mut value).await?;
				if !value.ends_with(b"\r\n") {
					return Err(ClientError::UnexpectedResponse(line));
				}
				value.truncate(len);

				found = Some(Item {
					key,
					value,
					flags,
					expiration: 0,
				});
			}
		})
		.await;

		self.settle(&mut slot, res)
	}

	/// Deletes `key`, returning whether it existed.
	pub async fn delete(&self, key: &str) -> Result<bool, ClientError> {
		check_key(key)?;

		let request = format!("delete {key}\r\n");

		let mut slot = self.conn.lock().await;
		let res = timeout(self.timeout, async {
			let conn = connection(&mut slot, self.address).await?;
			send(conn, request.as_bytes()).await?;

			let line = read_line(conn).await?;
			match line.as_str() {
				"DELETED" => Ok(true),
				"NOT_FOUND" => Ok(false),
				_ => Err(error_from_line(line)),
			}
		})
		.await;

		self.settle(&mut slot, res)
	}

	pub async fn version(&self) -> Result<String, ClientError> {
		let mut slot = self.conn.lock().await;
		let res = timeout(self.timeout, async {
			let conn = connection(&mut slot, self.address).await?;
			send(conn, b"version\r\n").await?;

			let line = read_line(conn).await?;
			line.strip_prefix("VERSION ")
				.map(ToString::to_string)
				.ok_or_else(|| error_from_line(line.clone()))
		})
		.await;

		self.settle(&mut slot, res)
	}

	fn settle<T>(
		&self,
		slot: &mut Option<BufStream<TcpStream>>,
		res: Result<Result<T, ClientError>, Elapsed>,
	) -> Result<T, ClientError> {
		let res = res.unwrap_or_else(|_| Err(ClientError::Timeout(self.timeout)));

		if let Err(e) = &res {
			if !matches!(e, ClientError::NotStored) && slot.take().is_some() {
				trace!(address = %self.address, ?e, "Dropping memcache connection");
			}
		}

		res
	}
}

async fn connection(
	slot: &mut Option<BufStream<TcpStream>>,
	address: SocketAddr,
) -> Result<&mut BufStream<TcpStream>, ClientError> {
	let conn = match slot.take() {
		Some(conn) => conn,
		None => {
			let stream = TcpStream::connect(address).await?;
			stream.set_nodelay(true)?;
			trace!(%address, "Opened memcache connection");
			BufStream::new(stream)
		}
	};

	Ok(slot.insert(conn))
}

async fn send(conn: &mut BufStream<TcpStream>, request: &[u8]) -> Result<(), ClientError> {
	conn.write_all(request).await?;
	conn.flush().await?;
	Ok(())
}

async fn read_line(conn: &mut BufStream<TcpStream>) -> Result<String, ClientError> {
	let mut line = String::new();
	if conn.read_line(&mut line).await? == 0 {
		return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
	}

	let trimmed = line.trim_end_matches(['\r', '\n']).len();
	line.truncate(trimmed);
	Ok(line)
}

fn check_key(key: &str) -> Result<(), ClientError> {
	if key.is_empty()
		|| key.len() > MAX_KEY_LENGTH
		|| key.bytes().any(|b| b <= b' ' || b == 0x7f)
	{
		return Err(ClientError::MalformedKey(key.to_string()));
	}

	Ok(())
}

fn parse_value_header(header: &str) -> Option<(String, u32, usize)> {
	let mut parts = header.split(' ');
	let key = parts.next()?.to_string();
	let flags = parts.next()?.parse().ok()?;
	let len = parts.next()?.parse().ok()?;

	Some((key, flags, len))
}

fn error_from_line(line: String) -> ClientError {
	if let Some(msg) = line.strip_prefix("SERVER_ERROR ") {
		ClientError::ServerError(msg.to_string())
	} else if let Some(msg) = line.strip_prefix("CLIENT_ERROR ") {
		ClientError::ClientError(msg.to_string())
	} else {
		ClientError::UnexpectedResponse(line)
	}
}

#[cfg(test)]
mod tests {
	use tokio::{io::AsyncWriteExt, net::TcpListener, spawn};

	use super::*;

	/// Replies to exactly one connection with a canned byte string, recording what was sent.
	async fn canned_server(reply: &'static [u8]) -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let address = listener.local_addr().unwrap();

		let handle = spawn(async move {
			let (mut stream, _) = listener.accept().await.unwrap();
			let mut request = vec![0; 1024];
			let read = stream.read(&mut request).await.unwrap();
			request.truncate(read);
			stream.write_all(reply).await.unwrap();
			stream.flush().await.unwrap();
			request
		});

		(address, handle)
	}

	#[test]
	fn rejects_malformed_keys() {
		assert!(check_key("1").is_ok());
		assert!(check_key(&"k".repeat(MAX_KEY_LENGTH)).is_ok());

		for key in ["", "has space", "new\nline", "tab\t", "\u{7f}"] {
			assert!(matches!(check_key(key), Err(ClientError::MalformedKey(_))), "{key:?}");
		}
		assert!(check_key(&"k".repeat(MAX_KEY_LENGTH + 1)).is_err());
	}

	#[test]
	fn parses_value_headers() {
		assert_eq!(
			parse_value_header("1 0 2"),
			Some(("1".to_string(), 0, 2))
		);
		assert_eq!(parse_value_header("key 7"), None);
		assert_eq!(parse_value_header("key x 2"), None);
	}

	#[test]
	fn maps_error_lines() {
		assert!(matches!(
			error_from_line("SERVER_ERROR object too large for cache".to_string()),
			ClientError::ServerError(msg) if msg == "object too large for cache"
		));
		assert!(matches!(
			error_from_line("CLIENT_ERROR bad data chunk".to_string()),
			ClientError::ClientError(_)
		));
		assert!(matches!(
			error_from_line("ERROR".to_string()),
			ClientError::UnexpectedResponse(_)
		));
	}

	#[tokio::test]
	async fn set_writes_the_storage_command() {
		let (address, server) = canned_server(b"STORED\r\n").await;
		let client = Client::new(address, Duration::from_secs(1));

		client.set(&Item::new("1", "42")).await.unwrap();

		assert_eq!(server.await.unwrap(), b"set 1 0 0 2\r\n42\r\n");
	}

	#[tokio::test]
	async fn get_reads_binary_values() {
		let (address, _server) =
			canned_server(b"VALUE 1 5 4\r\n\r\n\x00\xff\r\nEND\r\n").await;
		let client = Client::new(address, Duration::from_secs(1));

		let item = client.get("1").await.unwrap().unwrap();
		assert_eq!(item.value, b"\r\n\x00\xff");
		assert_eq!(item.flags, 5);
	}

	#[tokio::test]
	async fn get_reports_misses_as_none() {
		let (address, _server) = canned_server(b"END\r\n").await;
		let client = Client::new(address, Duration::from_secs(1));

		assert!(client.get("missing").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn silent_servers_time_out() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let address = listener.local_addr().unwrap();
		let _server = spawn(async move {
			let (stream, _) = listener.accept().await.unwrap();
			tokio::time::sleep(Duration::from_secs(30)).await;
			drop(stream);
		});

		let client = Client::new(address, Duration::from_millis(100));
		assert!(matches!(
			client.get("1").await,
			Err(ClientError::Timeout(_))
		));
	}

	#[tokio::test]
	async fn refused_connections_surface_io_errors() {
		let address = {
			let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
			listener.local_addr().unwrap()
		};

		let client = Client::new(address, Duration::from_secs(1));
		assert!(matches!(client.version().await, Err(ClientError::Io(_))));
	}
}
