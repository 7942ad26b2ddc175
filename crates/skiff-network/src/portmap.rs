//! Userspace TCP port forwarding.
//!
//! Containers publish ports by sending [`PortMappingRequest`]s to a long-lived
//! proxy daemon. Each published host port gets one listener; every accepted
//! connection is relayed to one of the port's targets, chosen round-robin.
//! Removing the last target of a port closes its listener.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use skiff_common::{SkiffError, SkiffResult};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Host address listeners bind to unless configured otherwise.
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

/// Interval between polls of an empty request channel.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A batch of mappings to add and remove.
///
/// Entries are `hostPort:containerIp:containerPort`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMappingRequest {
    /// Mappings to publish.
    #[serde(rename = "PortMapping", default)]
    pub add: Vec<String>,
    /// Mappings to withdraw.
    #[serde(rename = "PortUnMapping", default)]
    pub remove: Vec<String>,
}

impl PortMappingRequest {
    /// Request publishing `entries`.
    #[must_use]
    pub fn mapping(entries: Vec<String>) -> Self {
        Self {
            add: entries,
            remove: Vec::new(),
        }
    }

    /// Request withdrawing `entries`.
    #[must_use]
    pub fn unmapping(entries: Vec<String>) -> Self {
        Self {
            add: Vec::new(),
            remove: entries,
        }
    }

    /// Whether the request carries no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Where requests are sent to.
pub trait PortMappingSink {
    /// Deliver one request.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be delivered.
    fn send(&self, request: &PortMappingRequest) -> SkiffResult<()>;
}

/// Where the daemon reads requests from.
pub trait PortMappingSource {
    /// Take the next pending request without blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be read.
    fn try_receive(&self) -> SkiffResult<Option<PortMappingRequest>>;
}

/// Turn a container's `hostPort:containerPort` specs into
/// `hostPort:ip:containerPort` entries.
///
/// # Errors
///
/// Returns [`SkiffError::InvalidPortMapping`] for a spec that is not two
/// port numbers separated by `:`.
pub fn endpoint_mappings(ip: Ipv4Addr, specs: &[String]) -> SkiffResult<Vec<String>> {
    specs
        .iter()
        .map(|spec| {
            let invalid = || SkiffError::InvalidPortMapping { spec: spec.clone() };
            let (host, container) = spec.split_once(':').ok_or_else(invalid)?;
            let host: u16 = host.parse().map_err(|_| invalid())?;
            let container: u16 = container.parse().map_err(|_| invalid())?;
            Ok(format!("{host}:{ip}:{container}"))
        })
        .collect()
}

/// Split an entry at its first `:` into the host port and the `ip:port` target.
///
/// # Errors
///
/// Returns [`SkiffError::InvalidPortMapping`] when the entry has no `:` or the
/// host port is not a number.
pub fn split_entry(entry: &str) -> SkiffResult<(u16, String)> {
    let invalid = || SkiffError::InvalidPortMapping {
        spec: entry.to_string(),
    };
    let (port, target) = entry.split_once(':').ok_or_else(invalid)?;
    let port = port.parse().map_err(|_| invalid())?;
    if target.is_empty() {
        return Err(invalid());
    }
    Ok((port, target.to_string()))
}

#[derive(Debug)]
struct PortEntry {
    targets: Vec<String>,
    next: usize,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

/// Table of published ports and the listeners serving them.
#[derive(Debug, Clone)]
pub struct PortProxy {
    ports: Arc<Mutex<HashMap<u16, PortEntry>>>,
    /// Listeners told to stop that may still hold their socket.
    stopping: Arc<Mutex<HashMap<u16, JoinHandle<()>>>>,
    bind_host: String,
}

impl Default for PortProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl PortProxy {
    /// Proxy listening on [`DEFAULT_BIND_HOST`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_bind_host(DEFAULT_BIND_HOST)
    }

    /// Proxy listening on `host`.
    pub fn with_bind_host(host: impl Into<String>) -> Self {
        Self {
            ports: Arc::new(Mutex::new(HashMap::new())),
            stopping: Arc::new(Mutex::new(HashMap::new())),
            bind_host: host.into(),
        }
    }

    /// Add `target` to `port`, starting a listener if the port has none.
    ///
    /// Adding a target that is already present is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind.
    pub async fn add_mapping(&self, port: u16, target: impl Into<String>) -> SkiffResult<()> {
        let target = target.into();
        if self.push_target(port, &target) {
            return Ok(());
        }

        // The previous listener on this port must release it before we bind.
        let stopping = self.stopping.lock().remove(&port);
        if let Some(task) = stopping {
            if let Err(e) = task.await {
                tracing::warn!(port, error = %e, "Previous listener ended abnormally");
            }
        }

        let listener = TcpListener::bind((self.bind_host.as_str(), port))
            .await
            .map_err(|e| SkiffError::from_io(e, format!("bind port {port}")))?;

        let shutdown = Arc::new(Notify::new());
        {
            let mut ports = self.ports.lock();
            if let Some(entry) = ports.get_mut(&port) {
                // Another caller started a listener while we were binding.
                if !entry.targets.contains(&target) {
                    entry.targets.push(target);
                }
                return Ok(());
            }
            ports.insert(
                port,
                PortEntry {
                    targets: vec![target.clone()],
                    next: 0,
                    shutdown: Arc::clone(&shutdown),
                    task: None,
                },
            );
        }

        tracing::info!(port, %target, host = %self.bind_host, "Listening");
        let task = tokio::spawn(accept_loop(self.clone(), port, listener, Arc::clone(&shutdown)));

        let mut ports = self.ports.lock();
        match ports.get_mut(&port) {
            Some(entry) if Arc::ptr_eq(&entry.shutdown, &shutdown) => entry.task = Some(task),
            // Removed before the task was recorded.
            _ => {
                self.stopping.lock().insert(port, task);
            }
        }
        Ok(())
    }

    /// Remove `target` from `port`; the listener stops once no target is left.
    pub fn remove_mapping(&self, port: u16, target: &str) {
        let mut ports = self.ports.lock();
        let Some(entry) = ports.get_mut(&port) else {
            tracing::debug!(port, target, "Port is not mapped");
            return;
        };
        entry.targets.retain(|t| t != target);
        if entry.targets.is_empty() {
            if let Some(entry) = ports.remove(&port) {
                entry.shutdown.notify_one();
                if let Some(task) = entry.task {
                    self.stopping.lock().insert(port, task);
                }
            }
            tracing::info!(port, "Stopped listening");
        }
    }

    /// Targets currently mapped to `port`.
    #[must_use]
    pub fn targets(&self, port: u16) -> Vec<String> {
        self.ports
            .lock()
            .get(&port)
            .map(|entry| entry.targets.clone())
            .unwrap_or_default()
    }

    /// Whether `port` has a listener.
    #[must_use]
    pub fn is_listening(&self, port: u16) -> bool {
        self.ports.lock().contains_key(&port)
    }

    /// Apply every entry of `request`, logging the ones that fail.
    pub async fn apply(&self, request: &PortMappingRequest) {
        for entry in &request.add {
            match split_entry(entry) {
                Ok((port, target)) => {
                    if let Err(e) = self.add_mapping(port, target).await {
                        tracing::error!(entry = %entry, error = %e, "Failed to add port mapping");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Skipping port mapping"),
            }
        }
        for entry in &request.remove {
            match split_entry(entry) {
                Ok((port, target)) => self.remove_mapping(port, &target),
                Err(e) => tracing::warn!(error = %e, "Skipping port unmapping"),
            }
        }
    }

    /// Poll `source` forever, applying each request, sleeping `poll` whenever
    /// the channel is empty.
    ///
    /// # Errors
    ///
    /// Returns the first error of reading the channel.
    pub async fn serve<S: PortMappingSource>(&self, source: &S, poll: Duration) -> SkiffResult<()> {
        loop {
            match source.try_receive()? {
                Some(request) => {
                    tracing::debug!(?request, "Received port mapping request");
                    self.apply(&request).await;
                }
                None => tokio::time::sleep(poll).await,
            }
        }
    }

    fn push_target(&self, port: u16, target: &str) -> bool {
        let mut ports = self.ports.lock();
        let Some(entry) = ports.get_mut(&port) else {
            return false;
        };
        if !entry.targets.iter().any(|t| t == target) {
            entry.targets.push(target.to_string());
        }
        true
    }

    fn next_target(&self, port: u16) -> Option<String> {
        let mut ports = self.ports.lock();
        let entry = ports.get_mut(&port)?;
        if entry.targets.is_empty() {
            return None;
        }
        let index = entry.next % entry.targets.len();
        entry.next = (index + 1) % entry.targets.len();
        Some(entry.targets[index].clone())
    }
}

async fn accept_loop(proxy: PortProxy, port: u16, listener: TcpListener, shutdown: Arc<Notify>) {
    loop {
        tokio::select! {
            () = shutdown.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok((inbound, peer)) => {
                    let Some(target) = proxy.next_target(port) else {
                        break;
                    };
                    tracing::debug!(port, %peer, %target, "Forwarding connection");
                    tokio::spawn(relay(inbound, target));
                }
                Err(e) => tracing::warn!(port, error = %e, "Accept failed"),
            },
        }
    }
    tracing::debug!(port, "Listener closed");
}

async fn relay(inbound: TcpStream, target: String) {
    let outbound = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(%target, error = %e, "Failed to reach target");
            return;
        }
    };

    let (mut client_read, mut client_write) = inbound.into_split();
    let (mut target_read, mut target_write) = outbound.into_split();

    let upstream = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut client_read, &mut target_write).await;
        let _ = target_write.shutdown().await;
        copied
    });

    if let Err(e) = tokio::io::copy(&mut target_read, &mut client_write).await {
        tracing::debug!(%target, error = %e, "Relay ended");
    }
    let _ = client_write.shutdown().await;
    upstream.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    /// Server that answers every connection with `reply` and closes it.
    async fn reply_server(reply: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let _ = stream.write_all(reply.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        addr
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn fetch(port: u16) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        reply
    }

    #[test]
    fn endpoint_mappings_insert_ip() {
        let ip = Ipv4Addr::new(172, 18, 0, 2);
        let mapped = endpoint_mappings(ip, &["8080:80".to_string()]).unwrap();
        assert_eq!(mapped, vec!["8080:172.18.0.2:80"]);

        assert!(endpoint_mappings(ip, &["8080".to_string()]).is_err());
        assert!(endpoint_mappings(ip, &["http:80".to_string()]).is_err());
    }

    #[test]
    fn split_entry_at_first_colon() {
        let (port, target) = split_entry("8080:172.18.0.2:80").unwrap();
        assert_eq!(port, 8080);
        assert_eq!(target, "172.18.0.2:80");

        assert!(split_entry("8080").is_err());
        assert!(split_entry("x:1.2.3.4:80").is_err());
        assert!(split_entry("8080:").is_err());
    }

    #[test]
    fn request_wire_format() {
        let request: PortMappingRequest =
            serde_json::from_str(r#"{"PortMapping":["80:10.0.0.2:8080"]}"#).unwrap();
        assert_eq!(request.add, vec!["80:10.0.0.2:8080"]);
        assert!(request.remove.is_empty());

        let json = serde_json::to_string(&PortMappingRequest::unmapping(vec!["1:2".into()])).unwrap();
        assert_eq!(json, r#"{"PortMapping":[],"PortUnMapping":["1:2"]}"#);
    }

    #[tokio::test]
    async fn round_robin_across_targets() {
        let first = reply_server("first").await;
        let second = reply_server("second").await;
        let proxy = PortProxy::with_bind_host("127.0.0.1");
        let port = free_port();

        proxy.add_mapping(port, first.clone()).await.unwrap();
        proxy.add_mapping(port, second.clone()).await.unwrap();
        proxy.add_mapping(port, first.clone()).await.unwrap();
        assert_eq!(proxy.targets(port), vec![first.clone(), second.clone()]);

        let mut replies = Vec::new();
        for _ in 0..4 {
            replies.push(fetch(port).await);
        }
        assert_eq!(replies, ["first", "second", "first", "second"]);

        proxy.remove_mapping(port, &first);
        assert_eq!(fetch(port).await, "second");
        assert_eq!(fetch(port).await, "second");
    }

    #[tokio::test]
    async fn last_removal_stops_listener() {
        let target = reply_server("only").await;
        let proxy = PortProxy::with_bind_host("127.0.0.1");
        let port = free_port();

        proxy
            .apply(&PortMappingRequest::mapping(vec![format!("{port}:{target}")]))
            .await;
        assert!(proxy.is_listening(port));
        assert_eq!(fetch(port).await, "only");

        proxy
            .apply(&PortMappingRequest::unmapping(vec![format!("{port}:{target}")]))
            .await;
        assert!(!proxy.is_listening(port));
        assert!(proxy.targets(port).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn port_is_reusable_right_after_last_removal() {
        let old = reply_server("old").await;
        let new = reply_server("new").await;
        let proxy = PortProxy::with_bind_host("127.0.0.1");
        let port = free_port();

        proxy.add_mapping(port, old.clone()).await.unwrap();
        proxy.remove_mapping(port, &old);
        proxy.add_mapping(port, new.clone()).await.unwrap();

        assert!(proxy.is_listening(port));
        assert_eq!(proxy.targets(port), vec![new]);
        assert_eq!(fetch(port).await, "new");
    }

    #[tokio::test]
    async fn removing_unknown_port_is_harmless() {
        let proxy = PortProxy::new();
        proxy.remove_mapping(1, "127.0.0.1:1");
        assert!(!proxy.is_listening(1));
    }

    #[tokio::test]
    async fn serve_applies_queued_requests() {
        struct Queue(Mutex<Vec<PortMappingRequest>>);

        impl PortMappingSource for Queue {
            fn try_receive(&self) -> SkiffResult<Option<PortMappingRequest>> {
                Ok(self.0.lock().pop())
            }
        }

        let target = reply_server("served").await;
        let port = free_port();
        let queue = Queue(Mutex::new(vec![PortMappingRequest::mapping(vec![format!(
            "{port}:{target}"
        )])]));
        let proxy = PortProxy::with_bind_host("127.0.0.1");

        let _ = tokio::time::timeout(
            Duration::from_millis(200),
            proxy.serve(&queue, Duration::from_millis(10)),
        )
        .await;

        assert!(proxy.is_listening(port));
        assert_eq!(fetch(port).await, "served");
    }
}
