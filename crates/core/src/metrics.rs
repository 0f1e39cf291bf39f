use std::collections::BTreeMap;
use std::sync::Mutex;

/// Labelled counter: one value per label tuple.
#[derive(Debug, Default)]
pub struct Counter {
    values: Mutex<BTreeMap<Vec<String>, u64>>,
}

impl Counter {
    pub fn inc(&self, labels: &[&str]) {
        self.add(labels, 1);
    }

    pub fn add(&self, labels: &[&str], n: u64) {
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        *values.entry(key).or_insert(0) += n;
    }

    pub fn get(&self, labels: &[&str]) -> u64 {
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.get(&key).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.values().sum()
    }

    pub fn snapshot(&self) -> Vec<(Vec<String>, u64)> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}

/// Process metrics. Built once by the runtime and handed to each component
/// as `Arc<Metrics>`; there is no global instance.
#[derive(Debug, Default)]
pub struct Metrics {
    /// labels: scheme, destination
    pub messages_sent: Counter,
    /// labels: scheme
    pub delivery_failures: Counter,
    /// labels: scheme, subscription
    pub messages_received: Counter,
    /// labels: command_type
    pub commands_dispatched: Counter,
    /// labels: tenant_id, event_type
    pub events_saved: Counter,
    /// labels: tenant_id
    pub audit_records: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flat `name{labels} value` lines, sorted, for display.
    pub fn render(&self) -> Vec<String> {
        let counters: [(&str, &Counter); 6] = [
            ("messages_sent_total", &self.messages_sent),
            ("delivery_failures_total", &self.delivery_failures),
            ("messages_received_total", &self.messages_received),
            ("commands_dispatched_total", &self.commands_dispatched),
            ("events_saved_total", &self.events_saved),
            ("audit_records_total", &self.audit_records),
        ];
        let mut lines = Vec::new();
        for (name, counter) in counters {
            for (labels, value) in counter.snapshot() {
                lines.push(format!("{}{{{}}} {}", name, labels.join(","), value));
            }
        }
        lines
    }
}
