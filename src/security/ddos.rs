use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::RegexSet;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, SecurityError};

/// Reason reported when the per-IP connection cap is breached.
pub const CONNECTION_LIMIT_REASON: &str = "connection limit exceeded";

const BEHAVIOUR_SAMPLE: usize = 20;
const BEHAVIOUR_MIN_INTERVALS: usize = 5;

const DEFAULT_PATTERNS: &[&str] = &[
    // path traversal
    r"(?i)(\.\./|\.\.\\|%2e%2e(%2f|/|%5c)|/etc/passwd|/proc/self)",
    // script injection
    r"(?i)(<script|%3cscript|javascript:|onerror\s*=|onload\s*=)",
    // sql injection
    r"(?i)(union(\s|%20|\+)+select|'\s*or\s+'?\d+'?\s*=\s*'?\d+|;\s*drop\s+table|\bsleep\s*\(|benchmark\s*\(|--\s*$)",
    // command injection
    r"(?i)(;\s*(cat|ls|wget|curl|nc|bash)\s|\$\(|`)",
];

fn default_bot_agents() -> Vec<String> {
    [
        "sqlmap", "nikto", "nmap", "masscan", "zgrab", "nuclei", "dirbuster", "gobuster",
        "python-requests", "go-http-client", "curl/", "wget/", "scrapy", "libwww-perl",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Relative weight of each heuristic in the aggregate score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicWeights {
    pub connections: f64,
    pub patterns: f64,
    pub geo: f64,
    pub user_agent: f64,
    pub size: f64,
    pub behaviour: f64,
}

impl Default for HeuristicWeights {
    fn default() -> Self {
        Self {
            connections: 0.25,
            patterns: 0.30,
            geo: 0.15,
            user_agent: 0.10,
            size: 0.10,
            behaviour: 0.10,
        }
    }
}

impl HeuristicWeights {
    fn all(&self) -> [f64; 6] {
        [
            self.connections,
            self.patterns,
            self.geo,
            self.user_agent,
            self.size,
            self.behaviour,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdosConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections_per_window: u32,
    #[serde(default = "default_block_threshold")]
    pub block_threshold: f64,
    #[serde(default = "default_blacklist_threshold")]
    pub blacklist_threshold: f64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
    #[serde(default = "default_max_path_len")]
    pub max_path_len: usize,
    /// ISO country codes always scored as hostile.
    #[serde(default)]
    pub blocked_countries: Vec<String>,
    /// When non-empty, countries outside this list are suspicious.
    #[serde(default)]
    pub allowed_countries: Vec<String>,
    #[serde(default = "default_bot_agents")]
    pub bot_user_agents: Vec<String>,
    /// Extra regexes added to the built-in request pattern scan.
    #[serde(default)]
    pub extra_patterns: Vec<String>,
    #[serde(default)]
    pub weights: HeuristicWeights,
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// JSON file persisting the blacklist across restarts.
    #[serde(default)]
    pub blacklist_path: Option<String>,
    #[serde(default)]
    pub threat_feed_url: Option<String>,
    #[serde(default = "default_threat_refresh_secs")]
    pub threat_refresh_secs: u64,
}

fn default_window_secs() -> u64 {
    60
}
fn default_max_connections() -> u32 {
    100
}
fn default_block_threshold() -> f64 {
    0.8
}
fn default_blacklist_threshold() -> f64 {
    0.9
}
fn default_max_body_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_max_path_len() -> usize {
    2048
}
fn default_threat_refresh_secs() -> u64 {
    3600
}

impl Default for DdosConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_connections_per_window: default_max_connections(),
            block_threshold: default_block_threshold(),
            blacklist_threshold: default_blacklist_threshold(),
            max_body_bytes: default_max_body_bytes(),
            max_path_len: default_max_path_len(),
            blocked_countries: Vec::new(),
            allowed_countries: Vec::new(),
            bot_user_agents: default_bot_agents(),
            extra_patterns: Vec::new(),
            weights: HeuristicWeights::default(),
            whitelist: Vec::new(),
            blacklist_path: None,
            threat_feed_url: None,
            threat_refresh_secs: default_threat_refresh_secs(),
        }
    }
}

impl DdosConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_secs == 0 || self.max_connections_per_window == 0 {
            return Err(SecurityError::Validation(
                "ddos window and connection cap must be positive".into(),
            ));
        }
        if self.weights.all().iter().any(|w| !(0.0..=1.0).contains(w)) {
            return Err(SecurityError::Validation(
                "ddos heuristic weights must lie in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// The parts of an inbound request the guard looks at.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundRequest {
    pub ip: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub content_length: u64,
}

impl InboundRequest {
    pub fn new(ip: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn with_content_length(mut self, len: u64) -> Self {
        self.content_length = len;
        self
    }
}

/// Partial scores in [0, 1] per heuristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeuristicScores {
    pub connections: f64,
    pub patterns: f64,
    pub geo: f64,
    pub user_agent: f64,
    pub size: f64,
    pub behaviour: f64,
}

impl HeuristicScores {
    fn all(&self) -> [f64; 6] {
        [
            self.connections,
            self.patterns,
            self.geo,
            self.user_agent,
            self.size,
            self.behaviour,
        ]
    }

    fn aggregate(&self, weights: &HeuristicWeights) -> f64 {
        self.all()
            .iter()
            .zip(weights.all())
            .map(|(s, w)| s * w)
            .sum::<f64>()
            .clamp(0.0, 1.0)
    }

    fn strongest_reason(&self, weights: &HeuristicWeights) -> &'static str {
        const REASONS: [&str; 6] = [
            "high connection rate",
            "suspicious request pattern",
            "geo restricted origin",
            "suspicious user agent",
            "oversized request",
            "automated request cadence",
        ];
        let mut best = (0usize, f64::MIN);
        for (idx, (s, w)) in self.all().iter().zip(weights.all()).enumerate() {
            if s * w > best.1 {
                best = (idx, s * w);
            }
        }
        REASONS[best.0]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DdosVerdict {
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub score: f64,
    pub signals: HeuristicScores,
}

impl DdosVerdict {
    fn pass() -> Self {
        Self {
            blocked: false,
            reason: None,
            score: 0.0,
            signals: HeuristicScores::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockSource {
    Manual,
    Heuristic,
    ThreatFeed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub reason: String,
    pub source: BlockSource,
    pub added_at: DateTime<Utc>,
}

/// Per-IP tracking state.
#[derive(Debug)]
pub struct ConnectionRecord {
    pub ip: String,
    pub request_count: u64,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub suspicion: u32,
    /// In-window arrivals dropped once the retained history was full.
    pub overflow: u64,
    arrivals: VecDeque<Instant>,
}

impl ConnectionRecord {
    fn new(ip: &str, now: Instant) -> Self {
        Self {
            ip: ip.to_string(),
            request_count: 0,
            first_seen: now,
            last_seen: now,
            suspicion: 0,
            overflow: 0,
            arrivals: VecDeque::new(),
        }
    }

    /// Register an arrival and return the count inside the sliding window.
    ///
    /// At most `retain` arrivals are kept, so the returned count saturates
    /// there. Arrivals dropped while still inside the window are tallied in
    /// `overflow`.
    fn observe(&mut self, now: Instant, window: Duration, retain: usize) -> usize {
        self.request_count += 1;
        self.last_seen = now;
        self.arrivals.push_back(now);
        while let Some(front) = self.arrivals.front() {
            if now.duration_since(*front) >= window {
                self.arrivals.pop_front();
            } else {
                break;
            }
        }
        while self.arrivals.len() > retain.max(1) {
            self.arrivals.pop_front();
            self.overflow += 1;
        }
        self.arrivals.len()
    }

    /// Very fast or very regular cadence over the latest arrivals scores high.
    fn cadence_score(&self) -> f64 {
        let recent: Vec<&Instant> = self.arrivals.iter().rev().take(BEHAVIOUR_SAMPLE + 1).collect();
        if recent.len() < BEHAVIOUR_MIN_INTERVALS + 1 {
            return 0.0;
        }
        let gaps: Vec<f64> = recent
            .windows(2)
            .map(|w| w[0].duration_since(*w[1]).as_secs_f64() * 1000.0)
            .collect();
        let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
        if mean < 50.0 {
            return 1.0;
        }
        let variance = gaps.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / gaps.len() as f64;
        let cv = variance.sqrt() / mean;
        if cv < 0.05 {
            0.8
        } else if cv < 0.15 {
            0.4
        } else {
            0.0
        }
    }
}

/// Source of known-hostile addresses.
#[async_trait]
pub trait ThreatFeed: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedPayload {
    Wrapped { ips: Vec<String> },
    Plain(Vec<String>),
}

/// Threat feed served as JSON, either `["1.2.3.4", ..]` or `{"ips": [..]}`.
#[derive(Debug, Clone)]
pub struct HttpThreatFeed {
    url: String,
    client: Client,
}

impl HttpThreatFeed {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("creating HTTP client")?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl ThreatFeed for HttpThreatFeed {
    fn name(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> anyhow::Result<Vec<String>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .context("requesting threat feed")?;
        if !response.status().is_success() {
            anyhow::bail!("threat feed returned status {}", response.status());
        }
        let payload: FeedPayload = response.json().await.context("parsing threat feed")?;
        Ok(match payload {
            FeedPayload::Wrapped { ips } | FeedPayload::Plain(ips) => ips,
        })
    }
}

fn parse_ip(ip: &str) -> Result<IpAddr> {
    ip.trim()
        .parse()
        .map_err(|_| SecurityError::Validation(format!("invalid ip address '{ip}'")))
}

/// Per-IP connection tracking and heuristic threat scoring.
#[derive(Clone)]
pub struct DdosGuard {
    config: Arc<DdosConfig>,
    patterns: Arc<RegexSet>,
    records: Arc<RwLock<HashMap<String, Arc<Mutex<ConnectionRecord>>>>>,
    whitelist: Arc<RwLock<HashSet<String>>>,
    blacklist: Arc<RwLock<HashMap<String, BlacklistEntry>>>,
    blacklist_path: Option<PathBuf>,
}

impl std::fmt::Debug for DdosGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DdosGuard")
            .field("config", &self.config)
            .field("blacklist_path", &self.blacklist_path)
            .finish()
    }
}

impl DdosGuard {
    pub fn new(config: DdosConfig) -> Result<Self> {
        config.validate()?;
        let patterns = RegexSet::new(
            DEFAULT_PATTERNS
                .iter()
                .copied()
                .chain(config.extra_patterns.iter().map(String::as_str)),
        )
        .map_err(|e| SecurityError::Validation(format!("invalid request pattern: {e}")))?;

        let whitelist = config
            .whitelist
            .iter()
            .map(|ip| parse_ip(ip).map(|addr| addr.to_string()))
            .collect::<Result<HashSet<_>>>()?;

        let blacklist_path = config.blacklist_path.as_ref().map(PathBuf::from);
        let blacklist = match &blacklist_path {
            Some(path) => load_blacklist(path)?,
            None => HashMap::new(),
        };
        if !blacklist.is_empty() {
            info!(entries = blacklist.len(), "loaded persisted blacklist");
        }

        Ok(Self {
            config: Arc::new(config),
            patterns: Arc::new(patterns),
            records: Arc::new(RwLock::new(HashMap::new())),
            whitelist: Arc::new(RwLock::new(whitelist)),
            blacklist: Arc::new(RwLock::new(blacklist)),
            blacklist_path,
        })
    }

    pub fn config(&self) -> &DdosConfig {
        &self.config
    }

    async fn record(&self, ip: &str) -> Arc<Mutex<ConnectionRecord>> {
        if let Some(record) = self.records.read().await.get(ip) {
            return record.clone();
        }
        let mut records = self.records.write().await;
        records
            .entry(ip.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ConnectionRecord::new(ip, Instant::now()))))
            .clone()
    }

    fn pattern_score(&self, req: &InboundRequest) -> f64 {
        if self.patterns.is_match(&req.path) {
            1.0
        } else {
            0.0
        }
    }

    fn geo_score(&self, req: &InboundRequest) -> f64 {
        let Some(country) = req.country.as_deref() else {
            return 0.0;
        };
        let matches = |list: &[String]| list.iter().any(|c| c.eq_ignore_ascii_case(country));
        if matches(&self.config.blocked_countries) {
            1.0
        } else if !self.config.allowed_countries.is_empty() && !matches(&self.config.allowed_countries) {
            0.7
        } else {
            0.0
        }
    }

    fn user_agent_score(&self, req: &InboundRequest) -> f64 {
        let ua = req.user_agent.as_deref().map(str::trim).unwrap_or_default();
        if ua.is_empty() {
            return 0.8;
        }
        let lowered = ua.to_ascii_lowercase();
        if self
            .config
            .bot_user_agents
            .iter()
            .any(|sig| lowered.contains(&sig.to_ascii_lowercase()))
        {
            1.0
        } else if ua.len() < 10 {
            0.4
        } else {
            0.0
        }
    }

    fn size_score(&self, req: &InboundRequest) -> f64 {
        if req.content_length > self.config.max_body_bytes || req.path.len() > self.config.max_path_len {
            1.0
        } else if req.content_length > self.config.max_body_bytes / 2 {
            0.3
        } else {
            0.0
        }
    }

    /// Screen one request. A connection-cap breach blocks regardless of the
    /// aggregate score; otherwise the weighted score decides.
    pub async fn should_block(&self, req: &InboundRequest) -> DdosVerdict {
        let ip = match parse_ip(&req.ip) {
            Ok(addr) => addr.to_string(),
            Err(_) => {
                warn!(ip = %req.ip, "request with unparseable source address");
                return DdosVerdict {
                    blocked: true,
                    reason: Some("invalid source address".into()),
                    score: 1.0,
                    signals: HeuristicScores::default(),
                };
            }
        };

        if self.whitelist.read().await.contains(&ip) {
            return DdosVerdict::pass();
        }
        if let Some(entry) = self.blacklist.read().await.get(&ip) {
            debug!(ip = %ip, reason = %entry.reason, "blacklisted address");
            return DdosVerdict {
                blocked: true,
                reason: Some("ip blacklisted".into()),
                score: 1.0,
                signals: HeuristicScores::default(),
            };
        }

        let cap = self.config.max_connections_per_window as usize;
        let record = self.record(&ip).await;
        let mut record = record.lock().await;
        let retain = (cap + 1).max(BEHAVIOUR_SAMPLE + 1);
        let in_window = record.observe(Instant::now(), self.config.window(), retain);

        let signals = HeuristicScores {
            connections: (in_window as f64 / cap as f64).min(1.0),
            patterns: self.pattern_score(req),
            geo: self.geo_score(req),
            user_agent: self.user_agent_score(req),
            size: self.size_score(req),
            behaviour: record.cadence_score(),
        };
        let score = signals.aggregate(&self.config.weights);
        let cap_breached = in_window > cap;
        let blocked = cap_breached || score > self.config.block_threshold;
        if blocked || score >= 0.5 {
            record.suspicion += 1;
        }
        let suspicion = record.suspicion;
        drop(record);

        if !blocked {
            return DdosVerdict {
                blocked: false,
                reason: None,
                score,
                signals,
            };
        }

        let reason = if cap_breached {
            CONNECTION_LIMIT_REASON
        } else {
            signals.strongest_reason(&self.config.weights)
        };
        warn!(ip = %ip, path = %req.path, score, suspicion, reason, "request blocked");

        if score > self.config.blacklist_threshold {
            if let Err(e) = self
                .add_to_blacklist(&ip, reason, BlockSource::Heuristic)
                .await
            {
                warn!(ip = %ip, error = %e, "failed to persist blacklist entry");
            }
        }

        DdosVerdict {
            blocked: true,
            reason: Some(reason.to_string()),
            score,
            signals,
        }
    }

    async fn add_to_blacklist(&self, ip: &str, reason: &str, source: BlockSource) -> Result<()> {
        self.blacklist.write().await.insert(
            ip.to_string(),
            BlacklistEntry {
                reason: reason.to_string(),
                source,
                added_at: Utc::now(),
            },
        );
        info!(ip = %ip, reason, source = ?source, "ip blacklisted");
        self.persist_blacklist().await
    }

    /// Whitelist an address; it bypasses every check and leaves the blacklist.
    pub async fn allow_ip(&self, ip: &str) -> Result<()> {
        let ip = parse_ip(ip)?.to_string();
        self.whitelist.write().await.insert(ip.clone());
        if self.blacklist.write().await.remove(&ip).is_some() {
            self.persist_blacklist().await?;
        }
        Ok(())
    }

    pub async fn block_ip(&self, ip: &str, reason: &str) -> Result<()> {
        let ip = parse_ip(ip)?.to_string();
        self.whitelist.write().await.remove(&ip);
        self.add_to_blacklist(&ip, reason, BlockSource::Manual).await
    }

    pub async fn unblock_ip(&self, ip: &str) -> Result<bool> {
        let ip = parse_ip(ip)?.to_string();
        let removed = self.blacklist.write().await.remove(&ip).is_some();
        if removed {
            self.persist_blacklist().await?;
        }
        Ok(removed)
    }

    pub async fn is_blacklisted(&self, ip: &str) -> bool {
        match parse_ip(ip) {
            Ok(addr) => self.blacklist.read().await.contains_key(&addr.to_string()),
            Err(_) => false,
        }
    }

    pub async fn blacklist(&self) -> HashMap<String, BlacklistEntry> {
        self.blacklist.read().await.clone()
    }

    async fn persist_blacklist(&self) -> Result<()> {
        let Some(path) = &self.blacklist_path else {
            return Ok(());
        };
        let snapshot = self.blacklist.read().await.clone();
        let json = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| SecurityError::StorageUnavailable(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| SecurityError::StorageUnavailable(e.to_string()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| SecurityError::StorageUnavailable(e.to_string()))
    }

    /// Merge addresses from a threat feed into the blacklist. Whitelisted and
    /// malformed entries are skipped. Returns the number of new entries.
    pub async fn refresh_threat_intel(&self, feed: &dyn ThreatFeed) -> anyhow::Result<usize> {
        let ips = feed.fetch().await?;
        let whitelist = self.whitelist.read().await.clone();
        let mut added = 0;
        {
            let mut blacklist = self.blacklist.write().await;
            for raw in ips {
                let Ok(addr) = parse_ip(&raw) else {
                    debug!(entry = %raw, "skipping malformed threat feed entry");
                    continue;
                };
                let ip = addr.to_string();
                if whitelist.contains(&ip) || blacklist.contains_key(&ip) {
                    continue;
                }
                blacklist.insert(
                    ip,
                    BlacklistEntry {
                        reason: format!("threat feed {}", feed.name()),
                        source: BlockSource::ThreatFeed,
                        added_at: Utc::now(),
                    },
                );
                added += 1;
            }
        }
        if added > 0 {
            self.persist_blacklist()
                .await
                .context("persisting blacklist after threat feed refresh")?;
        }
        info!(feed = %feed.name(), added, "threat intelligence refreshed");
        Ok(added)
    }

    /// Evict connection records idle for more than twice the tracking window.
    pub async fn sweep(&self) -> usize {
        let idle_after = self.config.window() * 2;
        let now = Instant::now();
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| match record.try_lock() {
            Ok(r) => now.duration_since(r.last_seen) <= idle_after,
            Err(_) => true,
        });
        let evicted = before - records.len();
        if evicted > 0 {
            debug!(evicted, "swept idle connection records");
        }
        evicted
    }

    pub async fn tracked_ips(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn suspicion(&self, ip: &str) -> Option<u32> {
        let record = self.records.read().await.get(ip).cloned()?;
        let suspicion = record.lock().await.suspicion;
        Some(suspicion)
    }
}

fn load_blacklist(path: &PathBuf) -> Result<HashMap<String, BlacklistEntry>> {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
            SecurityError::StorageUnavailable(format!("corrupt blacklist {}: {e}", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(SecurityError::StorageUnavailable(e.to_string())),
    }
}
