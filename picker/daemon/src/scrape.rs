//! HTTP telemetry fetcher
//!
//! Scrapes a backend's Prometheus text endpoint and maps vLLM's serving
//! metrics onto the picker's telemetry keys:
//!
//! ```text
//! vllm:num_requests_waiting   -> queued-requests       (integer, required)
//! vllm:num_requests_running   -> running-requests      (integer, required)
//! vllm:gpu_cache_usage_perc   -> kv-cache-utilization  (float)
//! vllm:lora_requests_info     -> lora-info             (record)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use picker_core::datalayer::plugins::{
    KV_CACHE_UTILIZATION, LORA_INFO, LORA_INFO_SCHEMA, QUEUED_REQUESTS, RUNNING_REQUESTS,
};
use picker_core::{
    Backend, Datastore, FetchError, TelemetryConfig, TelemetryFetcher, TelemetrySnapshot,
    TelemetryValue,
};

const WAITING: &str = "vllm:num_requests_waiting";
const RUNNING: &str = "vllm:num_requests_running";
const KV_CACHE: &str = "vllm:gpu_cache_usage_perc";
const LORA_REQUESTS: &str = "vllm:lora_requests_info";

const LORA_RUNNING_LABEL: &str = "running_lora_adapters";
const LORA_MAX_LABEL: &str = "max_lora";

// =============================================================================
// Exposition Parsing
// =============================================================================

/// One sample line of the Prometheus text format
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub value: f64,
}

/// Parse the samples of a text exposition, skipping comments and blank lines
pub fn parse_exposition(body: &str) -> Result<Vec<Sample>, FetchError> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(parse_sample)
        .collect()
}

fn parse_sample(line: &str) -> Result<Sample, FetchError> {
    let malformed = |why: &str| FetchError::Malformed(format!("{why}: {line}"));

    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .ok_or_else(|| malformed("missing value"))?;
    let name = &line[..name_end];
    if name.is_empty() {
        return Err(malformed("missing metric name"));
    }

    let (labels, rest) = if line[name_end..].starts_with('{') {
        parse_labels(&line[name_end + 1..]).ok_or_else(|| malformed("bad label set"))?
    } else {
        (HashMap::new(), &line[name_end..])
    };

    let value = rest
        .split_whitespace()
        .next()
        .ok_or_else(|| malformed("missing value"))?;
    let value = parse_value(value).ok_or_else(|| malformed("bad value"))?;

    Ok(Sample {
        name: name.to_string(),
        labels,
        value,
    })
}

/// Parse `k="v",...}` and return the labels plus what follows the brace
fn parse_labels(input: &str) -> Option<(HashMap<String, String>, &str)> {
    let mut labels = HashMap::new();
    let mut rest = input.trim_start();

    loop {
        if let Some(after) = rest.strip_prefix('}') {
            return Some((labels, after));
        }

        let eq = rest.find('=')?;
        let key = rest[..eq].trim();
        rest = rest[eq + 1..].trim_start().strip_prefix('"')?;

        let mut value = String::new();
        let mut chars = rest.char_indices();
        let close = loop {
            let (i, c) = chars.next()?;
            match c {
                '"' => break i,
                '\\' => match chars.next()?.1 {
                    'n' => value.push('\n'),
                    other => value.push(other),
                },
                other => value.push(other),
            }
        };
        labels.insert(key.to_string(), value);

        rest = rest[close + 1..].trim_start();
        if let Some(after) = rest.strip_prefix(',') {
            rest = after.trim_start();
        }
    }
}

fn parse_value(raw: &str) -> Option<f64> {
    match raw {
        "+Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        _ => raw.parse().ok(),
    }
}

// =============================================================================
// Mapping
// =============================================================================

/// Build a snapshot from scraped samples
///
/// The queue metrics are required; the rest are filled in when present.
pub fn snapshot_from_samples(samples: &[Sample]) -> Result<TelemetrySnapshot, FetchError> {
    let first = |name: &str| samples.iter().find(|s| s.name == name);
    let required = |name: &str| {
        first(name)
            .map(|s| s.value)
            .filter(|v| v.is_finite())
            .ok_or_else(|| FetchError::Malformed(format!("missing metric {name}")))
    };

    let mut snapshot = TelemetrySnapshot::new()
        .with(
            QUEUED_REQUESTS,
            TelemetryValue::integer(required(WAITING)?.round() as i64),
        )
        .with(
            RUNNING_REQUESTS,
            TelemetryValue::integer(required(RUNNING)?.round() as i64),
        );

    if let Some(kv) = first(KV_CACHE).filter(|s| s.value.is_finite()) {
        snapshot.insert(KV_CACHE_UTILIZATION, TelemetryValue::float(kv.value));
    }

    // the series value is its creation timestamp; the newest one is current
    let lora = samples
        .iter()
        .filter(|s| s.name == LORA_REQUESTS)
        .max_by(|a, b| a.value.total_cmp(&b.value));
    if let Some(lora) = lora {
        let active: Vec<&str> = lora
            .labels
            .get(LORA_RUNNING_LABEL)
            .map(|names| names.split(',').filter(|n| !n.is_empty()).collect())
            .unwrap_or_default();
        let max = lora
            .labels
            .get(LORA_MAX_LABEL)
            .and_then(|m| m.parse::<u64>().ok())
            .unwrap_or(0);
        snapshot.insert(
            LORA_INFO,
            TelemetryValue::record(
                LORA_INFO_SCHEMA,
                json!({ "active_adapters": active, "max_adapters": max }),
            ),
        );
    }

    Ok(snapshot)
}

// =============================================================================
// Fetcher
// =============================================================================

/// Scrapes `<scheme>://<address>:<pool port><metrics path>`
pub struct HttpTelemetryFetcher {
    datastore: Arc<Datastore>,
    scheme: String,
    metrics_path: String,
    http_client: reqwest::Client,
}

impl HttpTelemetryFetcher {
    pub fn new(
        datastore: Arc<Datastore>,
        config: &TelemetryConfig,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            datastore,
            scheme: config.scheme.clone(),
            metrics_path: config.metrics_path.clone(),
            http_client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    fn metrics_url(&self, backend: &Backend, port: u16) -> String {
        format!(
            "{}://{}:{}{}",
            self.scheme, backend.address, port, self.metrics_path
        )
    }
}

#[async_trait]
impl TelemetryFetcher for HttpTelemetryFetcher {
    async fn fetch(
        &self,
        backend: &Backend,
        _previous: Option<&TelemetrySnapshot>,
    ) -> Result<TelemetrySnapshot, FetchError> {
        let pool = self
            .datastore
            .pool()
            .get()
            .map_err(|e| FetchError::Unavailable(e.to_string()))?;
        let url = self.metrics_url(backend, pool.target_port);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::Unavailable(format!("{url}: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(FetchError::Unavailable(format!("{url} returned {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Unavailable(format!("{url}: {e}")))?;

        snapshot_from_samples(&parse_exposition(&body)?)
    }
}
