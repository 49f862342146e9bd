//! The status server: a tiny CRLF line-protocol TCP listener for
//! introspection.
//!
//! Grounded on `original_source/src/status-loop.cpp`'s `StatusResponder`
//! (read one line, dispatch on `threads`/`counters`/`gauges`, write back and
//! close) and its periodic `setDeadline`/`handleDeadline` shutdown check,
//! rebuilt on `tokio::net::TcpListener` + per-connection tasks instead of
//! boost::asio's callback chain — each accepted connection gets its own
//! task, which is the natural Tokio equivalent of a `shared_from_this`
//! `StatusResponder` that outlives the accept loop.

use crate::metrics::Metrics;
use crate::registry::Registry;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const THREADS: &str = "threads";
const COUNTERS: &str = "counters";
const GAUGES: &str = "gauges";

/// Serves `threads`/`counters`/`gauges` over a plain-text TCP line protocol
/// until `shutdown` fires.
pub struct StatusServer {
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
}

impl StatusServer {
    pub fn new(registry: Arc<Registry>, metrics: Arc<Metrics>) -> Self {
        Self { registry, metrics }
    }

    /// Binds `bind_addr` and accepts connections until `shutdown` fires.
    /// Mirrors `StatusLoop::startAccept` checking `g_force_shutdown` before
    /// each `async_accept`, translated to racing the accept future against
    /// cancellation in a `tokio::select!`.
    pub async fn run(&self, bind_addr: &str, shutdown: CancellationToken) -> std::io::Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let registry = self.registry.clone();
                            let metrics = self.metrics.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, registry, metrics).await {
                                    debug!(error = %e, "status connection ended with an error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "status accept failed"),
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let command = line.trim_end_matches(['\r', '\n']);

    let response = match command {
        THREADS => render_threads(&registry),
        COUNTERS => render_metrics(&metrics.counters_snapshot()),
        GAUGES => render_metrics(&metrics.counters_snapshot()),
        _ => "Error: unrecognized command\r\n".to_string(),
    };

    write_half.write_all(response.as_bytes()).await?;
    Ok(())
}

/// `id\tpool\tshould_shutdown\tstate\r\n` per slot, matching the source's
/// tab-separated `thread_map` dump.
fn render_threads(registry: &Registry) -> String {
    let mut out = String::new();
    for slot in registry.snapshot() {
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\r\n",
            slot.id,
            slot.pool,
            slot.should_shutdown as u8,
            slot.state
        ));
    }
    out
}

fn render_metrics(snapshot: &[(String, f64)]) -> String {
    let mut out = String::new();
    for (name, value) in snapshot {
        out.push_str(&format!("{name}: {value}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SlotId;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream as ClientStream;

    async fn spawn_server() -> (String, CancellationToken, Arc<Registry>, Arc<Metrics>) {
        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(Metrics::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let server = StatusServer::new(registry.clone(), metrics.clone());
        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();
        let addr_clone = addr.clone();
        tokio::spawn(async move {
            let _ = server.run(&addr_clone, shutdown_clone).await;
        });
        // give the listener a moment to bind
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        (addr, shutdown, registry, metrics)
    }

    async fn query(addr: &str, command: &str) -> String {
        let mut stream = ClientStream::connect(addr).await.unwrap();
        stream.write_all(format!("{command}\n").as_bytes()).await.unwrap();
        let mut buf = String::new();
        stream.read_to_string(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn threads_command_lists_registered_slots() {
        let (addr, _shutdown, registry, _metrics) = spawn_server().await;
        let id = SlotId::new();
        registry.register("p1", id);
        registry.set_state(id, "grab_job");

        let response = query(&addr, "threads").await;
        assert!(response.contains("p1"));
        assert!(response.contains("grab_job"));
        assert!(response.ends_with("\r\n"));
    }

    #[tokio::test]
    async fn unrecognized_command_returns_error_line() {
        let (addr, _shutdown, _registry, _metrics) = spawn_server().await;
        let response = query(&addr, "bogus").await;
        assert_eq!(response, "Error: unrecognized command\r\n");
    }

    #[tokio::test]
    async fn counters_command_reflects_metrics() {
        let (addr, _shutdown, _registry, metrics) = spawn_server().await;
        metrics.http_error("p1", "Sum", 500);

        let response = query(&addr, "counters").await;
        assert!(response.contains("status=500"));
    }

    /// `counters`/`gauges` lines are LF-terminated, distinct from `threads`'
    /// CRLF terminator.
    #[tokio::test]
    async fn counters_lines_are_lf_terminated_not_crlf() {
        let (addr, _shutdown, _registry, metrics) = spawn_server().await;
        metrics.http_error("p1", "Sum", 500);

        let response = query(&addr, "counters").await;
        assert!(!response.contains('\r'));
        assert!(response.ends_with('\n'));
    }
}
