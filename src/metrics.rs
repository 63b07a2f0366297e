//! Transfer progress metrics.
//!
//! A labelled gauge holding the cumulative byte count per transfer, rendered
//! in the Prometheus text exposition format for `/metrics`.

use parking_lot::RwLock;
use std::{collections::BTreeMap, fmt::Write as _, sync::Arc};

/// Receives progress samples from the transfer engine.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, transfer_id: &str, bytes: u64);
}

struct GaugeInner {
    name: String,
    help: String,
    label: String,
    values: RwLock<BTreeMap<String, u64>>,
}

/// A gauge vector with a single label, e.g. `image_id`.
#[derive(Clone)]
pub struct ProgressGauge {
    inner: Arc<GaugeInner>,
}

impl ProgressGauge {
    pub fn new(subsystem: &str, name: &str, help: &str, label: &str) -> Self {
        Self {
            inner: Arc::new(GaugeInner {
                name: format!("{}_{}", subsystem, name),
                help: help.to_string(),
                label: label.to_string(),
                values: RwLock::new(BTreeMap::new()),
            }),
        }
    }

    /// The populator's gauge, keyed by the transferred object's id.
    pub fn populator() -> Self {
        Self::new(
            "volume_populators",
            "gcp_volume_populator",
            "Amount of data transferred",
            "image_id",
        )
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn set(&self, label_value: &str, value: u64) {
        self.inner
            .values
            .write()
            .insert(label_value.to_string(), value);
    }

    pub fn get(&self, label_value: &str) -> Option<u64> {
        self.inner.values.read().get(label_value).copied()
    }

    /// Prometheus text exposition of every series.
    pub fn render(&self) -> String {
        let inner = &self.inner;
        let mut out = String::new();
        let _ = writeln!(out, "# HELP {} {}", inner.name, inner.help);
        let _ = writeln!(out, "# TYPE {} gauge", inner.name);
        for (label_value, value) in inner.values.read().iter() {
            let _ = writeln!(
                out,
                "{}{{{}=\"{}\"}} {}",
                inner.name,
                inner.label,
                escape_label(label_value),
                value
            );
        }
        out
    }
}

impl ProgressSink for ProgressGauge {
    fn publish(&self, transfer_id: &str, bytes: u64) {
        self.set(transfer_id, bytes);
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_prometheus_text() {
        let gauge = ProgressGauge::populator();
        gauge.publish("vm1-forklift.qcow2", 1024);
        gauge.publish("vm2-forklift.qcow2", 0);
        let text = gauge.render();
        assert!(text.starts_with(
            "# HELP volume_populators_gcp_volume_populator Amount of data transferred\n\
             # TYPE volume_populators_gcp_volume_populator gauge\n"
        ));
        assert!(text.contains(
            "volume_populators_gcp_volume_populator{image_id=\"vm1-forklift.qcow2\"} 1024\n"
        ));
        assert!(text.contains("{image_id=\"vm2-forklift.qcow2\"} 0\n"));
    }

    #[test]
    fn label_values_are_escaped() {
        let gauge = ProgressGauge::new("s", "g", "h", "id");
        gauge.set("a\"b\\c", 1);
        assert!(gauge.render().contains("s_g{id=\"a\\\"b\\\\c\"} 1"));
    }

    #[test]
    fn clones_share_series() {
        let gauge = ProgressGauge::populator();
        gauge.clone().set("x", 7);
        assert_eq!(gauge.get("x"), Some(7));
    }
}
