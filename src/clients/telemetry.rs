use std::fmt;
use std::future::Future;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use cadence::prelude::*;
use cadence::{BufferedUdpMetricSink, MetricResult, StatsdClient};
use log::{debug, info};

/// StatsD client writing through a buffered UDP sink.
///
/// Metrics are fire-and-forget and leave in batches; `flush` pushes the
/// buffer out now and `close` flushes one last time. Clones share the sink,
/// and once closed every metric call is a no-op.
#[derive(Clone)]
pub struct StatsClient {
    client: Arc<RwLock<Option<StatsdClient>>>,
    prefix: String,
}

impl StatsClient {
    /// Resolve `addr` (`host:port`) and set up the sink
    pub async fn connect(addr: &str, prefix: Option<&str>) -> Result<Self> {
        let target = tokio::net::lookup_host(addr)
            .await
            .with_context(|| format!("Failed to resolve StatsD host {}", addr))?
            .next()
            .ok_or_else(|| anyhow!("StatsD host {} has no addresses", addr))?;

        let local: SocketAddr = if target.is_ipv6() {
            "[::]:0".parse()?
        } else {
            "0.0.0.0:0".parse()?
        };
        let socket = UdpSocket::bind(local).context("Failed to bind StatsD socket")?;
        socket
            .set_nonblocking(true)
            .context("Failed to make StatsD socket non-blocking")?;
        let sink = BufferedUdpMetricSink::from(target, socket)
            .context("Failed to create StatsD sink")?;

        let prefix = prefix.unwrap_or_default().trim_end_matches('.').to_string();
        let client = StatsdClient::from_sink(&prefix, sink);
        info!("Sending metrics to StatsD at {}", target);

        Ok(Self {
            client: Arc::new(RwLock::new(Some(client))),
            prefix,
        })
    }

    pub fn incr(&self, stat: &str) {
        self.emit(stat, |client| client.incr(stat).map(drop));
    }

    pub fn decr(&self, stat: &str) {
        self.emit(stat, |client| client.decr(stat).map(drop));
    }

    pub fn count(&self, stat: &str, value: i64) {
        self.emit(stat, |client| client.count(stat, value).map(drop));
    }

    /// Set a gauge to `value`.
    ///
    /// StatsD reads a signed gauge as a delta, so a negative value is sent
    /// after resetting the gauge to zero.
    pub fn gauge(&self, stat: &str, value: f64) {
        self.emit(stat, |client| {
            if value < 0.0 {
                client.gauge(stat, 0.0_f64)?;
            }
            client.gauge(stat, value).map(drop)
        });
    }

    pub fn timing(&self, stat: &str, elapsed: Duration) {
        let millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.emit(stat, |client| client.time(stat, millis).map(drop));
    }

    /// Await `fut` and report how long it took
    pub async fn time<F: Future>(&self, stat: &str, fut: F) -> F::Output {
        let started = Instant::now();
        let output = fut.await;
        self.timing(stat, started.elapsed());
        output
    }

    /// Send everything buffered so far
    pub fn flush(&self) -> Result<()> {
        let client = self
            .client
            .read()
            .map_err(|_| anyhow!("StatsD client lock poisoned"))?;
        match client.as_ref() {
            Some(client) => client.flush().context("Failed to flush StatsD sink"),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.client.read().map(|c| c.is_none()).unwrap_or(true)
    }

    /// Flush the sink and stop sending; later metrics are dropped
    pub fn close(&self) -> Result<()> {
        let closed = self
            .client
            .write()
            .map_err(|_| anyhow!("StatsD client lock poisoned"))?
            .take();
        if let Some(client) = closed {
            client.flush().context("Failed to flush StatsD sink")?;
            info!("StatsD client closed");
        }
        Ok(())
    }

    fn emit(&self, stat: &str, send: impl FnOnce(&StatsdClient) -> MetricResult<()>) {
        let client = match self.client.read() {
            Ok(client) => client,
            Err(_) => {
                debug!("StatsD client lock poisoned, dropping {}", stat);
                return;
            }
        };
        match client.as_ref() {
            Some(client) => {
                if let Err(e) = send(client) {
                    debug!("Failed to send metric {}: {}", stat, e);
                }
            }
            None => debug!("StatsD client closed, dropping {}", stat),
        }
    }
}

impl fmt::Debug for StatsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsClient")
            .field("prefix", &self.prefix)
            .field("closed", &self.is_closed())
            .finish()
    }
}
