//! Telemetry aggregation with per-category dead-bands
//!
//! Producers [`submit`](TelemetryAggregator::submit) samples at any rate; only the
//! latest value per parameter is kept. [`flush`](TelemetryAggregator::flush)
//! turns every channel with a parameter outside its dead-band into one
//! JSON-RPC message on the outbound queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use devlink_proto::TelemetryMessage;
use log::*;
use tokio::time::Instant;

use crate::queue::{OutboundMessage, OutboundQueue};

/// Dead-band rule, chosen by parameter name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// `current*`, `flow*`
    CurrentFlow,
    /// `voltage*`
    Voltage,
    /// `power*`
    Power,
    /// `energy*`
    Energy,
    /// `vbat*`
    Battery,
    /// `gauge*`
    Gauge,
    /// exactly `r00`
    R00,
    /// `t0*`, `target-temp*`, `schedule-status*`
    Temperature,
    /// `cons*`
    Consumption,
    /// `active*`, `leak*`, `plugged*`, `methane*`
    Binary,
    Default,
}

impl Category {
    pub fn of(name: &str) -> Self {
        let starts = |prefixes: &[&str]| prefixes.iter().any(|p| name.starts_with(p));

        if starts(&["current", "flow"]) {
            Category::CurrentFlow
        } else if starts(&["voltage"]) {
            Category::Voltage
        } else if starts(&["power"]) {
            Category::Power
        } else if starts(&["energy"]) {
            Category::Energy
        } else if starts(&["vbat"]) {
            Category::Battery
        } else if starts(&["gauge"]) {
            Category::Gauge
        } else if name == "r00" {
            Category::R00
        } else if starts(&["t0", "target-temp", "schedule-status"]) {
            Category::Temperature
        } else if starts(&["cons"]) {
            Category::Consumption
        } else if starts(&["active", "leak", "plugged", "methane"]) {
            Category::Binary
        } else {
            Category::Default
        }
    }

    /// Whether moving from `old` to `new` is worth sending
    ///
    /// A parameter that was never sent (`old == None`) always is.
    pub fn should_send(self, old: Option<f64>, new: f64) -> bool {
        let Some(old) = old else {
            return true;
        };
        let delta = (new - old).abs();

        match self {
            Category::CurrentFlow => delta >= 0.3,
            Category::Voltage => delta >= 5.0,
            Category::Energy => delta >= 100.0,
            Category::Battery => delta >= 0.2,
            Category::Gauge => delta >= 0.1,
            Category::R00 => delta >= 3.0,
            Category::Temperature | Category::Consumption => delta >= 1.0,
            Category::Binary => new != old,
            Category::Power | Category::Default => relative_change(old, delta) >= 0.05,
        }
    }
}

/// |Δ| / |old|; any movement away from zero counts as unbounded
fn relative_change(old: f64, delta: f64) -> f64 {
    if old == 0.0 {
        if delta == 0.0 { 0.0 } else { f64::INFINITY }
    } else {
        delta / old.abs()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSample {
    pub name: String,
    pub value: f64,
    pub category: Category,
    pub method: String,
    pub at: Instant,
}

/// Pending samples of one channel during a flush
#[derive(Debug, Default)]
struct MethodGroup {
    samples: Vec<ParameterSample>,
    dirty: bool,
}

pub struct TelemetryAggregator {
    topic: String,
    pending: Mutex<BTreeMap<String, ParameterSample>>,
    last_sent: Mutex<HashMap<String, f64>>,
}

impl TelemetryAggregator {
    /// Messages are published on `topic` (the device's rpcout stream)
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            pending: Mutex::new(BTreeMap::new()),
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Record the latest value of `name` on channel `method`
    pub fn submit(&self, method: &str, name: &str, value: f64) {
        if method.is_empty() || name.is_empty() {
            warn!("Dropping sample with empty method or parameter name");
            return;
        }
        let sample = ParameterSample {
            name: name.to_string(),
            value,
            category: Category::of(name),
            method: method.to_string(),
            at: Instant::now(),
        };
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(sample.name.clone(), sample);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Last value published for `name`
    pub fn last_sent(&self, name: &str) -> Option<f64> {
        self.last_sent.lock().ok()?.get(name).copied()
    }

    /// Move pending samples into messages on `queue`; returns how many were queued
    ///
    /// Samples of channels that stayed inside their dead-bands are discarded.
    pub fn flush(&self, queue: &OutboundQueue) -> usize {
        let pending = match self.pending.lock() {
            Ok(mut p) => std::mem::take(&mut *p),
            Err(_) => return 0,
        };
        if pending.is_empty() {
            return 0;
        }

        let Ok(mut last_sent) = self.last_sent.lock() else {
            return 0;
        };

        let mut groups: BTreeMap<String, MethodGroup> = BTreeMap::new();
        for sample in pending.into_values() {
            let previous = last_sent.get(&sample.name).copied();
            let group = groups.entry(sample.method.clone()).or_default();
            if sample.category.should_send(previous, sample.value) {
                group.dirty = true;
            }
            group.samples.push(sample);
        }

        let mut queued = 0;
        for (method, group) in groups {
            if !group.dirty {
                continue;
            }
            let mut message = TelemetryMessage::new(method.as_str());
            for sample in &group.samples {
                message = message.param(sample.name.as_str(), sample.value);
                last_sent.insert(sample.name.clone(), sample.value);
            }
            debug!("Queueing {} with {} parameter(s)", method, group.samples.len());
            queue.enqueue(OutboundMessage::new(self.topic.clone(), message.to_bytes()));
            queued += 1;
        }
        queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn dead_band_table() {
        // (name, old, new, expected)
        let rows: &[(&str, f64, f64, bool)] = &[
            ("current", 0.0, 0.3, true),
            ("current", 0.0, 0.29, false),
            ("flow_in", 2.0, 1.5, true),
            ("voltage", 220.0, 225.0, true),
            ("voltage", 220.0, 224.9, false),
            ("power", 100.0, 105.0, true),
            ("power", 100.0, 104.9, false),
            ("power", 100.0, 95.0, true),
            ("energy", 1000.0, 1100.0, true),
            ("energy", 1000.0, 1099.0, false),
            ("vbat", 0.0, 0.2, true),
            ("vbat", 0.0, 0.19, false),
            ("gauge", 0.0, 0.1, true),
            ("gauge", 0.0, 0.09, false),
            ("r00", 10.0, 13.0, true),
            ("r00", 10.0, 12.9, false),
            ("t0", 20.0, 21.0, true),
            ("t01", 20.0, 20.5, false),
            ("target-temp", 20.0, 19.0, true),
            ("schedule-status", 1.0, 1.5, false),
            ("cons", 10.0, 11.0, true),
            ("cons_day", 10.0, 10.5, false),
            ("active", 0.0, 1.0, true),
            ("leak", 1.0, 1.0, false),
            ("plugged", 1.0, 0.0, true),
            ("methane", 0.0, 0.0, false),
            ("humidity", 50.0, 52.5, true),
            ("humidity", 50.0, 52.0, false),
        ];

        for &(name, old, new, expected) in rows {
            assert_eq!(
                Category::of(name).should_send(Some(old), new),
                expected,
                "{} {} -> {}",
                name,
                old,
                new
            );
        }
    }

    #[test]
    fn r00_is_an_exact_match() {
        assert_eq!(Category::of("r00"), Category::R00);
        assert_eq!(Category::of("r001"), Category::Default);
    }

    #[test]
    fn never_sent_always_sends() {
        for name in ["current", "voltage", "power", "active", "r00", "whatever"] {
            assert!(Category::of(name).should_send(None, 0.0));
        }
    }

    #[test]
    fn relative_rule_from_zero() {
        assert!(Category::Default.should_send(Some(0.0), 0.01));
        assert!(!Category::Default.should_send(Some(0.0), 0.0));
    }

    fn payload(msg: &OutboundMessage) -> Value {
        serde_json::from_slice(&msg.payload).unwrap()
    }

    #[tokio::test]
    async fn later_sample_overwrites_pending() {
        let agg = TelemetryAggregator::new("stream/dev/rpcout");
        agg.submit("sensor-data", "voltage", 200.0);
        agg.submit("sensor-data", "voltage", 230.0);
        assert_eq!(agg.pending_len(), 1);

        let q = OutboundQueue::new(10);
        assert_eq!(agg.flush(&q), 1);
        let msg = q.dequeue().unwrap();
        assert_eq!(msg.topic, "stream/dev/rpcout");
        assert_eq!(payload(&msg)["params"]["voltage"]["value"], json!(230.0));
    }

    #[tokio::test]
    async fn dirty_method_sends_all_its_parameters() {
        let agg = TelemetryAggregator::new("t");
        let q = OutboundQueue::new(10);

        agg.submit("meter", "voltage", 230.0);
        agg.submit("meter", "current", 1.0);
        agg.flush(&q);
        q.clear();

        // voltage within band, current outside: both go out together
        agg.submit("meter", "voltage", 231.0);
        agg.submit("meter", "current", 2.0);
        assert_eq!(agg.flush(&q), 1);
        let p = payload(&q.dequeue().unwrap());
        assert_eq!(p["method"], "meter");
        assert_eq!(p["params"]["voltage"]["value"], json!(231.0));
        assert_eq!(p["params"]["current"]["value"], json!(2.0));
        assert_eq!(agg.last_sent("voltage"), Some(231.0));
    }

    #[tokio::test]
    async fn quiet_method_is_not_sent() {
        let agg = TelemetryAggregator::new("t");
        let q = OutboundQueue::new(10);

        agg.submit("meter", "voltage", 230.0);
        agg.submit("relay", "active", 1.0);
        assert_eq!(agg.flush(&q), 2);
        q.clear();

        agg.submit("meter", "voltage", 232.0);
        agg.submit("relay", "active", 0.0);
        assert_eq!(agg.flush(&q), 1);
        assert_eq!(payload(&q.dequeue().unwrap())["method"], "relay");
        // unsent value does not move the reference point
        assert_eq!(agg.last_sent("voltage"), Some(230.0));
        assert_eq!(agg.pending_len(), 0);
    }
}
