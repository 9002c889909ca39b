//! Publish/subscribe fan-out for pipeline job progress.
//!
//! Every event goes to the job's own topic and to the global wildcard topic,
//! so a job detail view and a global notification feed both see it.

use crate::models::{JobStatus, StepStatus};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{Mutex, broadcast};

const TOPIC_CAPACITY: usize = 64;
const GLOBAL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    StepUpdated {
        job_id: String,
        step: String,
        status: StepStatus,
        job_status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    Progress {
        job_id: String,
        step: String,
        current: u32,
        total: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::StepUpdated { job_id, .. } | JobEvent::Progress { job_id, .. } => job_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::StepUpdated { .. } => "step",
            JobEvent::Progress { .. } => "progress",
        }
    }
}

pub struct EventBus {
    global: broadcast::Sender<JobEvent>,
    topics: Mutex<HashMap<String, broadcast::Sender<JobEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (global, _) = broadcast::channel(GLOBAL_CAPACITY);
        Self {
            global,
            topics: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<JobEvent> {
        self.global.subscribe()
    }

    /// Subscribes to one job's topic, creating it on demand. Topics nobody
    /// listens to any more are dropped first, so the map only holds live ones.
    pub async fn subscribe_job(&self, job_id: &str) -> broadcast::Receiver<JobEvent> {
        let mut topics = self.topics.lock().await;
        topics.retain(|_, topic| topic.receiver_count() > 0);
        topics
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Delivers to the job topic (if it has subscribers) and the global topic.
    /// Having no live subscribers is not an error; an abandoned topic is dropped.
    pub async fn publish(&self, event: JobEvent) {
        {
            let mut topics = self.topics.lock().await;
            if let Some(topic) = topics.get(event.job_id())
                && topic.send(event.clone()).is_err()
            {
                topics.remove(event.job_id());
            }
        }
        let _ = self.global.send(event);
    }

    /// Drops the job topic; live subscribers see the channel close.
    pub async fn close_job(&self, job_id: &str) {
        self.topics.lock().await.remove(job_id);
    }

    #[cfg(test)]
    pub async fn topic_count(&self) -> usize {
        self.topics.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(job_id: &str, current: u32) -> JobEvent {
        JobEvent::Progress {
            job_id: job_id.to_string(),
            step: "process_images".to_string(),
            current,
            total: 4,
            message: None,
        }
    }

    #[tokio::test]
    async fn job_and_global_subscribers_both_receive() {
        let bus = EventBus::new();
        let mut job_rx = bus.subscribe_job("job-a").await;
        let mut other_rx = bus.subscribe_job("job-b").await;
        let mut global_rx = bus.subscribe_all();

        bus.publish(progress("job-a", 1)).await;

        assert_eq!(job_rx.recv().await.expect("job event").job_id(), "job-a");
        assert_eq!(global_rx.recv().await.expect("global event").job_id(), "job-a");
        assert!(matches!(
            other_rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn closing_a_topic_ends_its_stream() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_job("job-a").await;
        bus.close_job("job-a").await;
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn abandoned_topics_do_not_accumulate() {
        let bus = EventBus::new();
        for n in 0..500 {
            drop(bus.subscribe_job(&format!("missing-{n}")).await);
        }
        assert!(bus.topic_count().await <= 1);

        let mut live = bus.subscribe_job("job-a").await;
        drop(bus.subscribe_job("job-b").await);
        bus.publish(progress("job-b", 1)).await;
        assert_eq!(bus.topic_count().await, 1);

        bus.publish(progress("job-a", 2)).await;
        assert_eq!(live.recv().await.expect("live event").job_id(), "job-a");
    }
}
