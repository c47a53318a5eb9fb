//! Configuration: a string key/value map parsed into typed settings.
//!
//! Durations use ISO-8601 strings (`"PT1S"`, `"PT0.5S"`, `"PT1M"`); the
//! internal representation is `std::time::Duration` at nanosecond
//! resolution. Unknown keys and malformed values are rejected with the
//! offending key or value in the error.

use crate::GroupError;
use relicast_evs::ProtoConfig;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub evs: ProtoConfig,
    /// Byte cap of the receive queue before senders are paused.
    pub fc_limit: usize,
    /// Resume threshold as a fraction of the cap.
    pub fc_factor: f64,
    /// Fragmentation size before the application tunes it.
    pub max_packet_size: usize,
    pub cache_size: usize,
    pub cache_name: String,
    pub cache_page_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            evs: ProtoConfig::default(),
            fc_limit: 1 << 20,
            fc_factor: 0.5,
            max_packet_size: relicast_proto::constants::DEFAULT_PACKET_SIZE,
            cache_size: 128 << 20,
            cache_name: "relicast.cache".to_owned(),
            cache_page_size: 4096,
        }
    }
}

/// Parse an ISO-8601 duration of the restricted `PnDTnHnMnS` shape used in
/// the configuration surface. Seconds may carry a fraction.
pub fn parse_duration(s: &str) -> Result<Duration, GroupError> {
    let bad = || GroupError::Config(format!("malformed duration '{s}'"));
    let rest = s.strip_prefix('P').ok_or_else(bad)?;
    let mut seconds = 0f64;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, t),
        None => (rest, ""),
    };

    let mut parse_fields = |part: &str, in_time: bool| -> Result<(), GroupError> {
        let mut num = String::new();
        for ch in part.chars() {
            if ch.is_ascii_digit() || ch == '.' {
                num.push(ch);
                continue;
            }
            let value: f64 = num.parse().map_err(|_| bad())?;
            num.clear();
            let factor = match (ch, in_time) {
                ('D', false) => 86400.0,
                ('H', true) => 3600.0,
                ('M', true) => 60.0,
                ('S', true) => 1.0,
                _ => return Err(bad()),
            };
            seconds += value * factor;
        }
        if num.is_empty() {
            Ok(())
        } else {
            Err(bad())
        }
    };
    parse_fields(date_part, false)?;
    parse_fields(time_part, true)?;
    if seconds < 0.0 || !seconds.is_finite() {
        return Err(bad());
    }
    Ok(Duration::from_nanos((seconds * 1e9).round() as u64))
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, GroupError> {
    value
        .parse()
        .map_err(|_| GroupError::Config(format!("malformed value '{value}' for key '{key}'")))
}

impl Config {
    /// Build a configuration from a key/value map.
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self, GroupError> {
        let mut cfg = Config::default();
        for (key, value) in map {
            match key.as_str() {
                "evs.send_window" => cfg.evs.send_window = parse_num(key, value)?,
                "evs.user_send_window" => cfg.evs.user_send_window = parse_num(key, value)?,
                "evs.suspect_timeout" => cfg.evs.suspect_timeout = parse_duration(value)?,
                "evs.inactive_timeout" => cfg.evs.inactive_timeout = parse_duration(value)?,
                "evs.inactive_check_period" => {
                    cfg.evs.inactive_check_period = parse_duration(value)?
                }
                "evs.install_timeout" => cfg.evs.install_timeout = parse_duration(value)?,
                "evs.max_install_timeouts" => {
                    cfg.evs.max_install_timeouts = parse_num(key, value)?
                }
                "evs.retrans_period" => cfg.evs.retrans_period = parse_duration(value)?,
                "evs.join_retrans_period" => {
                    cfg.evs.join_retrans_period = parse_duration(value)?
                }
                "evs.stats_report_period" => {
                    cfg.evs.stats_report_period = parse_duration(value)?
                }
                "evs.causal_keepalive_period" => {
                    cfg.evs.causal_keepalive_period = parse_duration(value)?
                }
                "evs.delay_margin" => cfg.evs.delay_margin = parse_duration(value)?,
                "evs.delayed_keep_period" => {
                    cfg.evs.delayed_keep_period = parse_duration(value)?
                }
                "evs.view_forget_timeout" => {
                    cfg.evs.view_forget_timeout = parse_duration(value)?
                }
                "evs.auto_evict" => cfg.evs.auto_evict = parse_num(key, value)?,
                "gcs.fc_limit" => cfg.fc_limit = parse_num(key, value)?,
                "gcs.fc_factor" => {
                    let f: f64 = parse_num(key, value)?;
                    if !(0.0..=1.0).contains(&f) {
                        return Err(GroupError::Config(format!(
                            "fc_factor {f} outside [0, 1]"
                        )));
                    }
                    cfg.fc_factor = f;
                }
                "gcs.max_packet_size" => cfg.max_packet_size = parse_num(key, value)?,
                "gcache.size" => cfg.cache_size = parse_num(key, value)?,
                "gcache.name" => cfg.cache_name = value.clone(),
                "gcache.page_size" => cfg.cache_page_size = parse_num(key, value)?,
                _ => {
                    return Err(GroupError::Config(format!("unknown key '{key}'")));
                }
            }
        }
        if cfg.evs.user_send_window > cfg.evs.send_window {
            return Err(GroupError::Config(
                "evs.user_send_window exceeds evs.send_window".into(),
            ));
        }
        // The ring needs room for its preamble, header record and at least
        // one buffer header; anything smaller would fault at open time.
        if cfg.cache_size < relicast_cache::header::MIN_FILE_SIZE {
            return Err(GroupError::Config(format!(
                "gcache.size {} below the minimum {}",
                cfg.cache_size,
                relicast_cache::header::MIN_FILE_SIZE
            )));
        }
        if cfg.cache_page_size == 0 {
            return Err(GroupError::Config("gcache.page_size must be positive".into()));
        }
        Ok(cfg)
    }
}
