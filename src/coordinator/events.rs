use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures_util::stream::Stream;
use serde::{Serialize, Serializer};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::models::FailureReason;

/// Custom serializer for Arc<str> that serializes as a plain string.
fn serialize_arc_str<S>(data: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(data)
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum JobEvent {
    Started {
        job_id: Uuid,
        pid: Option<u32>,
        timestamp: DateTime<Utc>,
    },
    Progress {
        job_id: Uuid,
        #[serde(serialize_with = "serialize_arc_str")]
        line: Arc<str>,
        timestamp: DateTime<Utc>,
    },
    Succeeded {
        job_id: Uuid,
        exit_code: i32,
        output_bytes: u64,
        timestamp: DateTime<Utc>,
    },
    Failed {
        job_id: Uuid,
        exit_code: i32,
        reason: FailureReason,
        timestamp: DateTime<Utc>,
    },
    Cancelled {
        job_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    /// The subscriber fell behind and `missed` events were dropped.
    Overflow { missed: u64 },
}

impl JobEvent {
    /// The job this event belongs to; `None` for `Overflow`.
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            JobEvent::Started { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Succeeded { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Cancelled { job_id, .. } => Some(*job_id),
            JobEvent::Overflow { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEvent::Succeeded { .. } | JobEvent::Failed { .. } | JobEvent::Cancelled { .. }
        )
    }
}

/// Callback interface for consumers that prefer push delivery.
pub trait JobObserver: Send + Sync {
    fn on_event(&self, job_id: Option<Uuid>, event: &JobEvent);
}

/// Identifies an observer registered with [`EventBus::subscribe_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

/// Pull-side view of the bus. Each subscription has its own bounded queue;
/// when it overflows the oldest events are dropped and the next read yields
/// a single `Overflow` marker.
pub struct Subscription {
    rx: broadcast::Receiver<JobEvent>,
}

impl Subscription {
    /// Next event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => Some(JobEvent::Overflow { missed }),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<JobEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                Some(JobEvent::Overflow { missed })
            }
            Err(_) => None,
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = JobEvent> {
        BroadcastStream::new(self.rx).map(|result| match result {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(missed)) => JobEvent::Overflow { missed },
        })
    }
}

/// Fan-out of job events. Publishing never waits on subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
    observers: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
    next_handle: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            observers: Arc::new(Mutex::new(HashMap::new())),
            next_handle: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn publish(&self, event: JobEvent) {
        // Err only means nobody is listening
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Deliver every subsequent event to `observer` from a background task.
    pub fn subscribe_observer(&self, observer: Arc<dyn JobObserver>) -> SubscriptionHandle {
        let mut subscription = self.subscribe();
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                if let JobEvent::Overflow { missed } = event {
                    tracing::warn!("Observer lagged by {} events", missed);
                }
                observer.on_event(event.job_id(), &event);
            }
        });

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, task);
        SubscriptionHandle(id)
    }

    /// Stop delivering to an observer. Returns false if the handle is unknown.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let task = self
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.0);
        match task {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn progress(i: usize) -> JobEvent {
        JobEvent::Progress {
            job_id: Uuid::nil(),
            line: Arc::from(format!("frame={}", i).as_str()),
            timestamp: Utc::now(),
        }
    }

    struct Recorder {
        seen: Mutex<Vec<(Option<Uuid>, JobEvent)>>,
    }

    impl JobObserver for Recorder {
        fn on_event(&self, job_id: Option<Uuid>, event: &JobEvent) {
            self.seen
                .lock()
                .expect("lock")
                .push((job_id, event.clone()));
        }
    }

    #[test]
    fn test_failed_event_serializes() {
        let event = JobEvent::Failed {
            job_id: Uuid::nil(),
            exit_code: 1,
            reason: FailureReason::RuntimeFailure,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"event\":\"Failed\""));
        assert!(json.contains("\"exit_code\":1"));
        assert!(json.contains("\"reason\":\"RuntimeFailure\""));
    }

    #[test]
    fn test_progress_event_serializes_with_arc_str() {
        let json = serde_json::to_string(&progress(7)).expect("serialize");
        let value: serde_json::Value = serde_json::from_str(&json).expect("parse");
        assert_eq!(value["event"], "Progress");
        assert_eq!(value["data"]["line"], "frame=7");
    }

    #[test]
    fn test_job_id_and_terminal() {
        let id = Uuid::now_v7();
        let cancelled = JobEvent::Cancelled {
            job_id: id,
            timestamp: Utc::now(),
        };
        assert_eq!(cancelled.job_id(), Some(id));
        assert!(cancelled.is_terminal());
        assert!(!progress(0).is_terminal());
        let overflow = JobEvent::Overflow { missed: 3 };
        assert_eq!(overflow.job_id(), None);
        assert!(!overflow.is_terminal());
    }

    #[tokio::test]
    async fn test_two_subscribers_both_receive() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(progress(1));

        assert!(matches!(a.recv().await, Some(JobEvent::Progress { .. })));
        assert!(matches!(b.recv().await, Some(JobEvent::Progress { .. })));
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(progress(1));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_subscriber_gets_overflow_marker() {
        let bus = EventBus::new(8);
        let mut idle = bus.subscribe();

        for i in 0..10_000 {
            bus.publish(progress(i));
        }

        match idle.recv().await {
            Some(JobEvent::Overflow { missed }) => assert_eq!(missed, 10_000 - 8),
            other => panic!("Expected Overflow, got {:?}", other),
        }
        // The newest events are still there
        let mut remaining = 0;
        while idle.try_recv().is_some() {
            remaining += 1;
        }
        assert_eq!(remaining, 8);
    }

    #[tokio::test]
    async fn test_stream_maps_lag_to_overflow() {
        let bus = EventBus::new(2);
        let sub = bus.subscribe();
        for i in 0..5 {
            bus.publish(progress(i));
        }
        drop(bus);

        let events: Vec<JobEvent> = sub.into_stream().collect().await;
        assert!(matches!(events[0], JobEvent::Overflow { missed: 3 }));
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn test_observer_receives_and_unsubscribe_stops() {
        let bus = EventBus::new(16);
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let handle = bus.subscribe_observer(Arc::clone(&recorder) as Arc<dyn JobObserver>);

        let id = Uuid::now_v7();
        bus.publish(JobEvent::Cancelled {
            job_id: id,
            timestamp: Utc::now(),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        {
            let seen = recorder.seen.lock().expect("lock");
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].0, Some(id));
        }

        assert!(bus.unsubscribe(handle));
        assert!(!bus.unsubscribe(handle));
        tokio::time::sleep(Duration::from_millis(20)).await;

        bus.publish(progress(2));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.seen.lock().expect("lock").len(), 1);
    }
}
