//! Poll-based aircraft state feed over HTTP
//!
//! `GET {base_url}{api_path}?devSn={dev_sn}` on a fixed interval. The body is
//! `{ "code": 0, "msg": "", "timestamp": <ms>, "data": { ...state... } }`.
//! Bridged feeds like this one rarely carry receiver quality fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};

use super::push_feed::{message_timestamp, parse_state};
use super::{PoseBuffer, PoseSource, DEFAULT_BUFFER_CAPACITY};
use crate::error::{GeolocError, GeolocResult};
use crate::types::{PoseSample, SourceKind};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpPollConfig {
    pub base_url: String,
    pub api_path: String,
    pub dev_sn: String,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
    /// Consecutive failures before the source reports unavailable
    pub max_consecutive_errors: u32,
    pub buffer_capacity: usize,
    /// Subtracted from every message timestamp. Set it to the epoch time of
    /// video frame 0 to pair live samples with video-relative frame times.
    pub time_offset_ms: i64,
}

impl Default for HttpPollConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:10006".to_string(),
            api_path: "/ai/getDrone".to_string(),
            dev_sn: String::new(),
            poll_interval_ms: 100, // 10 Hz
            request_timeout_ms: 2000,
            max_consecutive_errors: 5,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            time_offset_ms: 0,
        }
    }
}

pub struct HttpPollSource {
    name: String,
    config: HttpPollConfig,
    url: String,
    client: reqwest::Client,
    buffer: PoseBuffer,
    consecutive_errors: AtomicU32,
    messages: AtomicU64,
    errors: AtomicU64,
}

impl HttpPollSource {
    pub fn new(name: &str, config: HttpPollConfig) -> GeolocResult<Self> {
        if config.poll_interval_ms == 0 || config.max_consecutive_errors == 0 {
            return Err(GeolocError::InvalidConfig(
                "poll interval and error limit must be > 0".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        let url = format!("{}{}", config.base_url.trim_end_matches('/'), config.api_path);
        Ok(Self {
            name: name.to_string(),
            buffer: PoseBuffer::bounded(config.buffer_capacity.max(1)),
            config,
            url,
            client,
            consecutive_errors: AtomicU32::new(0),
            messages: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Validate a response body and buffer its state.
    pub fn handle_body(&self, body: &Value) -> GeolocResult<PoseSample> {
        let code = body.get("code").and_then(Value::as_i64);
        if !matches!(code, Some(0) | Some(200)) {
            let msg = body.get("msg").and_then(Value::as_str).unwrap_or("");
            return Err(GeolocError::SourceUnavailable(format!(
                "{}: response code {:?} {}",
                self.name, code, msg
            )));
        }
        let data = body
            .get("data")
            .filter(|d| d.as_object().map_or(false, |o| !o.is_empty()))
            .ok_or_else(|| GeolocError::SourceUnavailable(format!("{}: empty data field", self.name)))?;

        let timestamp_ms = message_timestamp(body) - self.config.time_offset_ms;
        let sample = parse_state(data, timestamp_ms, &self.name, SourceKind::Poll)?;
        self.buffer.push(sample.clone());
        Ok(sample)
    }

    fn record_success(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        let previous = self.consecutive_errors.swap(0, Ordering::Relaxed);
        if previous >= self.config.max_consecutive_errors {
            log::info!("[{}] recovered after {} failed polls", self.name, previous);
        }
    }

    fn record_error(&self, err: &GeolocError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        let n = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
        if n <= 3 || n % 10 == 0 {
            log::warn!("[{}] poll failed ({} in a row): {}", self.name, n, err);
        }
        if n == self.config.max_consecutive_errors {
            log::warn!("[{}] marked unavailable", self.name);
        }
    }

    /// Apply one poll result to the error counters.
    pub fn record(&self, result: &GeolocResult<PoseSample>) {
        match result {
            Ok(_) => self.record_success(),
            Err(e) => self.record_error(e),
        }
    }

    async fn fetch(&self) -> GeolocResult<PoseSample> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("devSn", self.config.dev_sn.as_str())])
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;
        self.handle_body(&body)
    }

    pub async fn poll_once(&self) -> GeolocResult<PoseSample> {
        let result = self.fetch().await;
        self.record(&result);
        result
    }

    /// Poll until `stop` is set.
    pub async fn run(self: Arc<Self>, stop: Arc<AtomicBool>) {
        let mut ticker = interval(Duration::from_millis(self.config.poll_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!("[{}] polling {} every {} ms", self.name, self.url, self.config.poll_interval_ms);

        loop {
            ticker.tick().await;
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let _ = self.poll_once().await;
        }
        log::info!(
            "[{}] stopped: {} samples, {} errors",
            self.name,
            self.message_count(),
            self.error_count()
        );
    }

    pub fn spawn(self: &Arc<Self>, stop: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(stop))
    }

    pub fn message_count(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

impl PoseSource for HttpPollSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Poll
    }

    fn buffer(&self) -> &PoseBuffer {
        &self.buffer
    }

    fn is_available(&self) -> bool {
        self.consecutive_errors.load(Ordering::Relaxed) < self.config.max_consecutive_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> HttpPollSource {
        HttpPollSource::new("http", HttpPollConfig::default()).unwrap()
    }

    #[test]
    fn test_url_joins_base_and_path() {
        let config = HttpPollConfig {
            base_url: "http://10.0.0.2:8080/".into(),
            ..HttpPollConfig::default()
        };
        let src = HttpPollSource::new("http", config).unwrap();
        assert_eq!(src.url(), "http://10.0.0.2:8080/ai/getDrone");
    }

    #[test]
    fn test_body_without_quality_fields() {
        let src = source();
        let body = json!({
            "code": 0,
            "msg": "",
            "timestamp": 1234,
            "data": { "latitude": 22.78, "longitude": 114.1, "altitude": 100.0,
                      "yaw": 10.0, "pitch": -90.0, "roll": 0.0, "gimbalPitch": -90.0 }
        });
        let pose = src.handle_body(&body).unwrap();
        src.record(&Ok(pose.clone()));

        assert_eq!(pose.timestamp_ms, 1234);
        assert_eq!(pose.source_kind, SourceKind::Poll);
        assert!(pose.gps_level.is_none() && pose.satellite_count.is_none());
        assert_eq!(src.nearest(1234, 0).map(|p| p.lat), Some(22.78));
        assert_eq!(src.message_count(), 1);
    }

    #[test]
    fn test_time_offset_moves_samples_into_video_time() {
        let config = HttpPollConfig {
            time_offset_ms: 1_714_550_400_000,
            ..HttpPollConfig::default()
        };
        let src = HttpPollSource::new("http", config).unwrap();
        let body = json!({
            "code": 0,
            "timestamp": 1_714_550_400_500_i64,
            "data": { "latitude": 22.78, "longitude": 114.1, "altitude": 100.0 }
        });
        assert_eq!(src.handle_body(&body).unwrap().timestamp_ms, 500);
        assert!(src.nearest(450, 100).is_some());
    }

    #[test]
    fn test_error_codes_and_empty_data() {
        let src = source();
        assert!(src.handle_body(&json!({"code": 500, "msg": "down"})).is_err());
        assert!(src.handle_body(&json!({"code": 200, "data": {}})).is_err());
        assert!(src.handle_body(&json!({"code": 200, "data": null})).is_err());
        assert!(src.buffer().is_empty());
    }

    #[test]
    fn test_consecutive_errors_mark_unavailable_until_success() {
        let src = source();
        let failure: GeolocResult<PoseSample> = Err(GeolocError::SourceUnavailable("timeout".into()));
        for _ in 0..4 {
            src.record(&failure);
        }
        assert!(src.is_available());
        src.record(&failure);
        assert!(!src.is_available());

        let ok = PoseSample::new(0, 22.78, 114.1, 100.0, 0.0, -90.0, 0.0);
        src.record(&Ok(ok));
        assert!(src.is_available());
        assert_eq!(src.error_count(), 5);
    }

    #[tokio::test]
    async fn test_run_exits_when_stopped() {
        let src = Arc::new(source());
        let stop = Arc::new(AtomicBool::new(true));
        src.spawn(stop).await.unwrap();
        assert_eq!(src.message_count(), 0);
    }
}
