// ABOUTME: Bounded per-machine history of resource usage samples
// ABOUTME: Process-local ring buffers with oldest-first eviction

use crate::types::UsageSample;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct UsageHistory {
    capacity: usize,
    samples: Arc<RwLock<HashMap<String, VecDeque<UsageSample>>>>,
}

impl UsageHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append in arrival order, evicting the oldest sample once full
    pub async fn record(&self, machine_id: &str, sample: UsageSample) {
        let mut samples = self.samples.write().await;
        Self::push(&mut samples, machine_id, sample, self.capacity);
    }

    /// Record only if `still_present` resolves true. The check runs under the
    /// write lock, so a `clear` issued after the machine disappears always wins.
    pub async fn record_if<F>(&self, machine_id: &str, sample: UsageSample, still_present: F) -> bool
    where
        F: Future<Output = bool>,
    {
        let mut samples = self.samples.write().await;
        if !still_present.await {
            return false;
        }
        Self::push(&mut samples, machine_id, sample, self.capacity);
        true
    }

    fn push(
        samples: &mut HashMap<String, VecDeque<UsageSample>>,
        machine_id: &str,
        sample: UsageSample,
        capacity: usize,
    ) {
        let history = samples
            .entry(machine_id.to_string())
            .or_insert_with(|| VecDeque::with_capacity(capacity));

        history.push_back(sample);
        while history.len() > capacity {
            history.pop_front();
        }
    }

    /// Oldest first
    pub async fn snapshot(&self, machine_id: &str) -> Vec<UsageSample> {
        self.samples
            .read()
            .await
            .get(machine_id)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn clear(&self, machine_id: &str) {
        self.samples.write().await.remove(machine_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn sample(n: i64) -> UsageSample {
        UsageSample {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(n),
            cpu_percent: format!("{}%", n),
            mem_usage: "10MiB".to_string(),
            mem_limit: "2GiB".to_string(),
            net_rx: "0B".to_string(),
            net_tx: "0B".to_string(),
        }
    }

    #[tokio::test]
    async fn test_history_never_exceeds_capacity() {
        let history = UsageHistory::new(100);
        for n in 0..101 {
            history.record("m1", sample(n)).await;
        }

        let samples = history.snapshot("m1").await;
        assert_eq!(samples.len(), 100);
        assert_eq!(samples.first().unwrap().cpu_percent, "1%");
        assert_eq!(samples.last().unwrap().cpu_percent, "100%");
        assert!(samples.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn test_out_of_order_samples_keep_arrival_order() {
        let history = UsageHistory::new(10);
        history.record("m1", sample(5)).await;
        history.record("m1", sample(2)).await;

        let cpu: Vec<_> = history
            .snapshot("m1")
            .await
            .into_iter()
            .map(|s| s.cpu_percent)
            .collect();
        assert_eq!(cpu, vec!["5%", "2%"]);
    }

    #[tokio::test]
    async fn test_histories_are_per_machine() {
        let history = UsageHistory::new(10);
        history.record("m1", sample(1)).await;
        history.record("m2", sample(2)).await;
        history.clear("m1").await;

        assert!(history.snapshot("m1").await.is_empty());
        assert_eq!(history.snapshot("m2").await.len(), 1);
    }

    #[tokio::test]
    async fn test_record_if_skips_machines_that_are_gone() {
        let history = UsageHistory::new(10);

        assert!(!history.record_if("gone", sample(1), async { false }).await);
        assert!(history.record_if("m1", sample(2), async { true }).await);

        assert!(history.snapshot("gone").await.is_empty());
        assert_eq!(history.snapshot("m1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_waits_for_pending_presence_check() {
        let history = UsageHistory::new(10);
        let (release, checked) = tokio::sync::oneshot::channel::<bool>();

        let pending = {
            let history = history.clone();
            tokio::spawn(async move {
                history
                    .record_if("m1", sample(1), async move { checked.await.unwrap_or(false) })
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let clearing = {
            let history = history.clone();
            tokio::spawn(async move { history.clear("m1").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!clearing.is_finished());

        release.send(true).unwrap();
        assert!(pending.await.unwrap());
        clearing.await.unwrap();
        assert!(history.snapshot("m1").await.is_empty());
    }
}
