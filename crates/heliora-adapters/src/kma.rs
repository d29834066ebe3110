//! Upstream irradiance fetch.
//!
//! The KMA surface-observation product (typ01) is a fixed-width text
//! table with `#`-prefixed header lines. The client fetches the most
//! recent full hour, walking back up to `backoff_hours` hours when the
//! freshest timestamp has no rows yet, extracts the
//! `YYMMDDHHMI`/`STN`/`SI` columns and joins each station onto its
//! region through a configured mapping table.
//!
//! Negative irradiance marks a missing measurement and becomes `None`;
//! the baseline derivation discards it.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, DurationRound, FixedOffset, Utc};
use tracing::{debug, warn};

use heliora_core::baseline::RegionSample;
use heliora_core::config::KmaConfig;
use heliora_core::{OracleError, Result};

use crate::egress::validate_outbound_url;

/// Anything that can deliver one regional snapshot of irradiance
/// samples. The scheduler only sees this seam, so its tests run without
/// a network.
pub trait SampleSource: Send + Sync {
    fn fetch_samples(&self) -> Result<Vec<RegionSample>>;
}

/// One parsed observation before the region join.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub station: String,
    /// Irradiance in MJ/m^2; `None` when the station reported a
    /// missing value.
    pub irradiance: Option<f64>,
}

/// Blocking KMA fetch client.
pub struct KmaClient {
    config: KmaConfig,
    regions: HashMap<String, String>,
    utc_offset_secs: i32,
    client: reqwest::blocking::Client,
}

impl KmaClient {
    /// Build a client; validates the endpoint and loads the
    /// station-to-region mapping table (a JSON object of
    /// `station id -> region name`).
    pub fn new(config: KmaConfig, utc_offset_secs: i32) -> Result<Self> {
        validate_outbound_url(&config.api_url)?;
        if config.auth_key.is_empty() {
            return Err(OracleError::Config("kma.auth_key is required".into()));
        }
        let raw = std::fs::read_to_string(&config.stations_path).map_err(|e| {
            OracleError::Config(format!(
                "station mapping {} unreadable: {e}",
                config.stations_path
            ))
        })?;
        let regions: HashMap<String, String> = serde_json::from_str(&raw)
            .map_err(|e| OracleError::Config(format!("station mapping parse failed: {e}")))?;

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| OracleError::Config(format!("http client build failed: {e}")))?;

        Ok(Self {
            config,
            regions,
            utc_offset_secs,
            client,
        })
    }

    fn local_now(&self) -> DateTime<FixedOffset> {
        let offset =
            FixedOffset::east_opt(self.utc_offset_secs).expect("validated utc offset");
        Utc::now().with_timezone(&offset)
    }

    fn fetch_text(&self, tm: &str) -> Result<String> {
        let mut url = validate_outbound_url(&self.config.api_url)?;
        url.query_pairs_mut()
            .append_pair("tm", tm)
            .append_pair("help", "0")
            .append_pair("authKey", &self.config.auth_key);
        if !self.config.station.is_empty() {
            url.query_pairs_mut()
                .append_pair("stn", &self.config.station);
        }

        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| OracleError::Baseline(format!("kma fetch failed: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|e| OracleError::Baseline(format!("kma body read failed: {e}")))?;
        if !status.is_success() {
            return Err(OracleError::Baseline(format!(
                "kma fetch returned {status}: {}",
                body.trim()
            )));
        }
        Ok(body)
    }

    /// Join observations onto regions. Stations absent from the
    /// mapping land in an empty region, which the derivation skips.
    fn join_regions(&self, observations: Vec<Observation>) -> Vec<RegionSample> {
        observations
            .into_iter()
            .map(|obs| RegionSample {
                region: self.regions.get(&obs.station).cloned().unwrap_or_default(),
                value: obs.irradiance,
            })
            .collect()
    }
}

impl SampleSource for KmaClient {
    fn fetch_samples(&self) -> Result<Vec<RegionSample>> {
        let start = nearest_past_hour(self.local_now());
        for hours_back in 0..=self.config.backoff_hours {
            let tm = minus_hours(&start, hours_back, self.utc_offset_secs)?;
            let text = match self.fetch_text(&tm) {
                Ok(text) => text,
                Err(e) => {
                    warn!(tm, error = %e, "kma fetch attempt failed");
                    continue;
                }
            };
            let (headers, rows) = parse_typ01(&text);
            let observations = select_core_columns(&headers, &rows);
            if !observations.is_empty() {
                debug!(tm, records = observations.len(), "kma snapshot fetched");
                return Ok(self.join_regions(observations));
            }
        }
        Err(OracleError::Baseline(format!(
            "no observations up to backoff={}h (start tm={start})",
            self.config.backoff_hours
        )))
    }
}

/// Most recent full hour before `now`, in the product's `YYYYMMDDHHMM`
/// timestamp format.
pub fn nearest_past_hour(now: DateTime<FixedOffset>) -> String {
    let truncated = now
        .duration_trunc(chrono::Duration::hours(1))
        .unwrap_or(now);
    (truncated - chrono::Duration::hours(1))
        .format("%Y%m%d%H%M")
        .to_string()
}

/// Walk a `YYYYMMDDHHMM` timestamp back by whole hours.
pub fn minus_hours(tm: &str, hours: u32, utc_offset_secs: i32) -> Result<String> {
    let offset = FixedOffset::east_opt(utc_offset_secs)
        .ok_or_else(|| OracleError::Config("invalid utc offset".into()))?;
    let naive = chrono::NaiveDateTime::parse_from_str(tm, "%Y%m%d%H%M")
        .map_err(|e| OracleError::Baseline(format!("bad tm {tm}: {e}")))?;
    let local = naive
        .and_local_timezone(offset)
        .single()
        .ok_or_else(|| OracleError::Baseline(format!("ambiguous tm {tm}")))?;
    Ok((local - chrono::Duration::hours(i64::from(hours)))
        .format("%Y%m%d%H%M")
        .to_string())
}

/// Split the typ01 text into the last plausible header row and the data
/// rows. Header candidates are the `#`-prefixed lines; the winner is
/// the last one starting with a `YYMMDDHH...` time column.
pub fn parse_typ01(text: &str) -> (Vec<String>, Vec<Vec<String>>) {
    let mut header_candidates: Vec<String> = Vec::new();
    let mut rows: Vec<Vec<String>> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(stripped) = trimmed.strip_prefix('#') {
            header_candidates.push(stripped.trim().to_string());
            continue;
        }
        let fields: Vec<String> = trimmed
            .split_whitespace()
            .map(|f| f.to_string())
            .collect();
        if !fields.is_empty() {
            rows.push(fields);
        }
    }

    let headers = header_candidates
        .into_iter()
        .rev()
        .map(|candidate| {
            candidate
                .split_whitespace()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
        })
        .find(|tokens| {
            tokens.len() >= 5
                && tokens[0]
                    .to_ascii_uppercase()
                    .starts_with("YYMMDDHH")
        })
        .unwrap_or_default();

    (headers, rows)
}

fn header_index(headers: &[String], candidates: &[&str]) -> Option<usize> {
    for candidate in candidates {
        if let Some(index) = headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(candidate))
        {
            return Some(index);
        }
    }
    None
}

/// Extract station and irradiance columns from the parsed table.
pub fn select_core_columns(headers: &[String], rows: &[Vec<String>]) -> Vec<Observation> {
    let Some(idx_tm) = header_index(headers, &["YYMMDDHHMI", "TM"]) else {
        return Vec::new();
    };
    let Some(idx_stn) = header_index(headers, &["STN", "ID"]) else {
        return Vec::new();
    };
    let Some(idx_si) = header_index(headers, &["SI"]) else {
        return Vec::new();
    };

    rows.iter()
        .filter(|row| row.len() > idx_tm.max(idx_stn).max(idx_si))
        .map(|row| {
            let irradiance = row[idx_si]
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && *v >= 0.0);
            Observation {
                station: row[idx_stn].clone(),
                irradiance,
            }
        })
        .collect()
}
