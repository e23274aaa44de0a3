//! Thin client for a running daemon: frames over TCP, queries over HTTP

use anyhow::{anyhow, Context, Result};
use ringdb_core::time::format_timestamp;
use ringdb_core::Timestamp;
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// How long to wait for the server to answer a batch of frames
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Client {
    http: reqwest::Client,
    base_url: String,
    tcp_addr: SocketAddr,
}

impl Client {
    pub fn new(base_url: &str, tcp_addr: SocketAddr) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tcp_addr,
        })
    }

    /// Send frames on a fresh connection and return every error line the
    /// server answered with
    pub async fn send(&self, frames: &str) -> Result<String> {
        let mut stream = TcpStream::connect(self.tcp_addr)
            .await
            .with_context(|| format!("connecting to {}", self.tcp_addr))?;
        stream.write_all(frames.as_bytes()).await?;
        stream.shutdown().await?;

        let mut reply = Vec::new();
        tokio::time::timeout(REPLY_TIMEOUT, stream.read_to_end(&mut reply))
            .await
            .map_err(|_| anyhow!("no reply from {} within {:?}", self.tcp_addr, REPLY_TIMEOUT))??;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    /// POST a JSON document and return the text body
    pub async fn post(&self, path: &str, body: &Value) -> Result<String> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .body(body.to_string())
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }

    pub async fn query(&self, query: &Value) -> Result<String> {
        self.post("/api/query", query).await
    }

    pub async fn stats(&self) -> Result<Value> {
        let url = format!("{}/api/stats", self.base_url);
        let stats = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(stats)
    }
}

/// A parsed CSV result line
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub series: String,
    pub timestamp: String,
    pub values: Vec<String>,
}

impl Row {
    pub fn value(&self, i: usize) -> Result<f64> {
        self.values
            .get(i)
            .ok_or_else(|| anyhow!("row `{}` has no column {}", self.series, i))?
            .parse()
            .with_context(|| format!("row `{}` column {} is not a number", self.series, i))
    }
}

/// Split a response body into rows; a `-` line is an error
pub fn parse_rows(body: &str) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    for line in body.split_terminator("\r\n") {
        if let Some(message) = line.strip_prefix('-') {
            return Err(anyhow!("server error: {}", message));
        }
        let mut columns = line.split(',');
        let series = columns.next().unwrap_or_default().to_string();
        let timestamp = columns.next().unwrap_or_default().to_string();
        rows.push(Row {
            series,
            timestamp,
            values: columns.map(str::to_string).collect(),
        });
    }
    Ok(rows)
}

/// One sample frame
pub fn sample_frame(series: &str, ts: Timestamp, value: f64) -> String {
    format!("+{}\r\n+{}\r\n+{}\r\n", series, format_timestamp(ts), value)
}

/// One bulk frame: `metrics` share the tags, one value per metric
pub fn bulk_frame(metrics: &[&str], tags: &str, ts: Timestamp, values: &[f64]) -> String {
    let mut frame = format!(
        "+{} {}\r\n+{}\r\n*{}\r\n",
        metrics.join("|"),
        tags,
        format_timestamp(ts),
        values.len()
    );
    for value in values {
        frame.push_str(&format!("+{}\r\n", value));
    }
    frame
}
