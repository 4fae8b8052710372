//! `reqwest`-backed [`Transport`].
//!
//! Keeps one client per proxy endpoint so cookies and pooled connections
//! stay bound to the identity that created them. Per-request sessions get a
//! throwaway client instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::BytesMut;
use reqwest::{Client, Proxy};
use tokio::sync::Mutex;

use super::{SessionMode, Transport, TransportError, TransportRequest, TransportResponse};
use crate::modules::identity::ProxyAddress;

pub struct ReqwestTransport {
	clients: Mutex<HashMap<Option<String>, Client>>,
	created: AtomicUsize,
}

impl ReqwestTransport {
	pub fn new() -> Self {
		Self {
			clients: Mutex::new(HashMap::new()),
			created: AtomicUsize::new(0),
		}
	}

	/// Clients built so far, cached or not.
	pub fn clients_created(&self) -> usize {
		self.created.load(Ordering::Relaxed)
	}

	async fn client(&self, proxy: Option<&ProxyAddress>, session: SessionMode) -> Result<Client, TransportError> {
		if session == SessionMode::PerRequest {
			return self.build_client(proxy);
		}

		let mut guard = self.clients.lock().await;
		let key = proxy.map(|p| p.as_str().to_string());
		if let Some(client) = guard.get(&key) {
			return Ok(client.clone());
		}

		let client = self.build_client(proxy)?;
		guard.insert(key, client.clone());
		Ok(client)
	}

	fn build_client(&self, proxy: Option<&ProxyAddress>) -> Result<Client, TransportError> {
		let mut builder = Client::builder().cookie_store(true);
		if let Some(address) = proxy {
			let proxy = Proxy::all(address.as_str())
				.map_err(|err| TransportError::Proxy(format!("{address}: {err}")))?;
			builder = builder.proxy(proxy);
		}

		let client = builder
			.build()
			.map_err(|err| TransportError::Other(err.to_string()))?;
		let created = self.created.fetch_add(1, Ordering::Relaxed) + 1;
		log::debug!(
			"created http client #{created} for {}",
			proxy.map(ProxyAddress::redacted).unwrap_or_else(|| "direct".to_string())
		);
		Ok(client)
	}
}

impl Default for ReqwestTransport {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl Transport for ReqwestTransport {
	async fn fetch(&self, request: &TransportRequest<'_>) -> Result<TransportResponse, TransportError> {
		let client = self.client(request.proxy, request.session).await?;
		let spec = request.spec;

		let mut response = client
			.request(spec.method.clone(), spec.url.clone())
			.headers(spec.headers.clone())
			.timeout(request.timeout)
			.send()
			.await
			.map_err(|err| map_error(err, request))?;

		let status = response.status().as_u16();
		let headers = response.headers().clone();

		let mut sample = BytesMut::new();
		let mut body_size = 0;
		while let Some(chunk) = response.chunk().await.map_err(|err| map_error(err, request))? {
			body_size += chunk.len();
			keep_prefix(&mut sample, &chunk, request.body_limit);
		}

		Ok(TransportResponse {
			status,
			headers,
			body: sample.freeze(),
			body_size,
		})
	}
}

/// Append as much of `chunk` as still fits under `limit`.
fn keep_prefix(sample: &mut BytesMut, chunk: &[u8], limit: usize) {
	let room = limit.saturating_sub(sample.len());
	sample.extend_from_slice(&chunk[..chunk.len().min(room)]);
}

fn map_error(err: reqwest::Error, request: &TransportRequest<'_>) -> TransportError {
	let err = err.without_url();
	if err.is_timeout() {
		TransportError::Timeout(request.timeout)
	} else if err.is_connect() {
		match request.proxy {
			Some(proxy) => TransportError::Proxy(format!("{proxy}: {err}")),
			None => TransportError::Connect(err.to_string()),
		}
	} else if err.is_body() || err.is_decode() {
		TransportError::Body(err.to_string())
	} else {
		TransportError::Other(err.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn reuses_clients_per_proxy() {
		let transport = ReqwestTransport::new();
		let proxy = ProxyAddress::parse("http://127.0.0.1:3128").unwrap();

		transport.client(None, SessionMode::Persistent).await.unwrap();
		transport.client(Some(&proxy), SessionMode::Persistent).await.unwrap();
		transport.client(Some(&proxy), SessionMode::Persistent).await.unwrap();

		assert_eq!(transport.clients.lock().await.len(), 2);
		assert_eq!(transport.clients_created(), 2);
	}

	#[tokio::test]
	async fn per_request_sessions_never_reuse_a_client() {
		let transport = ReqwestTransport::new();
		let proxy = ProxyAddress::parse("http://127.0.0.1:3128").unwrap();

		for _ in 0..3 {
			transport.client(Some(&proxy), SessionMode::PerRequest).await.unwrap();
		}
		transport.client(None, SessionMode::PerRequest).await.unwrap();

		assert_eq!(transport.clients_created(), 4);
		assert!(transport.clients.lock().await.is_empty());

		// A persistent session alongside still gets its cached client.
		transport.client(Some(&proxy), SessionMode::Persistent).await.unwrap();
		transport.client(Some(&proxy), SessionMode::Persistent).await.unwrap();
		assert_eq!(transport.clients_created(), 5);
	}

	#[test]
	fn body_sample_stops_at_limit() {
		let mut sample = BytesMut::new();
		keep_prefix(&mut sample, b"hello ", 8);
		keep_prefix(&mut sample, b"world", 8);
		keep_prefix(&mut sample, b"ignored", 8);
		assert_eq!(&sample[..], b"hello wo");

		let mut unbounded = BytesMut::new();
		keep_prefix(&mut unbounded, b"abc", usize::MAX);
		assert_eq!(&unbounded[..], b"abc");
	}
}
