//! Topic-per-course event fan-out.
//!
//! Events are published only after the state change that caused them has been
//! committed, so a subscriber that queries after seeing an event always finds
//! the corresponding state. Delivery is best-effort: a failed or lagging
//! subscriber is logged and skipped, never rolled back.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::domain::RegistrationEventType;

const DEFAULT_TOPIC_CAPACITY: usize = 256;

/// Wire-shaped course event: `{type, courseId, payload, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseEvent {
    #[serde(rename = "type")]
    pub event_type: RegistrationEventType,
    pub course_id: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl CourseEvent {
    pub fn new(
        event_type: RegistrationEventType,
        course_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            course_id: course_id.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Publish/subscribe surface with one broadcast topic per course.
pub struct EventBus {
    topics: DashMap<String, broadcast::Sender<CourseEvent>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity,
        }
    }

    fn sender(&self, course_id: &str) -> broadcast::Sender<CourseEvent> {
        self.topics
            .entry(course_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Subscribes to one course topic. Events published after this call are
    /// observed in publish order; a lagging receiver loses the oldest events
    /// and should reconcile via a snapshot query.
    pub fn subscribe(&self, course_id: &str) -> broadcast::Receiver<CourseEvent> {
        self.sender(course_id).subscribe()
    }

    /// Publishes an event to its course topic. Must be called after the
    /// underlying state change is durable.
    pub fn publish(&self, event: CourseEvent) {
        let sender = self.sender(&event.course_id);
        match sender.send(event) {
            Ok(receivers) => {
                tracing::trace!(receivers, "event published");
            }
            Err(broadcast::error::SendError(event)) => {
                // No live subscribers; clients reconcile via snapshots.
                tracing::debug!(
                    course_id = %event.course_id,
                    event_type = %event.event_type,
                    "event dropped, no subscribers"
                );
            }
        }
    }

    pub fn subscriber_count(&self, course_id: &str) -> usize {
        self.topics
            .get(course_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_observe_publish_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("x");

        bus.publish(CourseEvent::new(
            RegistrationEventType::SeatBooked,
            "x",
            json!({"seatLabel": "A1"}),
        ));
        bus.publish(CourseEvent::new(
            RegistrationEventType::SeatReleased,
            "x",
            json!({"seatLabel": "A1"}),
        ));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.event_type, RegistrationEventType::SeatBooked);
        assert_eq!(second.event_type, RegistrationEventType::SeatReleased);
    }

    #[tokio::test]
    async fn topics_are_isolated_per_course() {
        let bus = EventBus::new();
        let mut rx_x = bus.subscribe("x");
        let mut rx_y = bus.subscribe("y");

        bus.publish(CourseEvent::new(
            RegistrationEventType::WaitlistUpdated,
            "y",
            json!({}),
        ));

        let event = rx_y.recv().await.unwrap();
        assert_eq!(event.course_id, "y");
        assert!(rx_x.try_recv().is_err());
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(CourseEvent::new(
            RegistrationEventType::BookingStatusChanged,
            "x",
            json!({}),
        ));
        assert_eq!(bus.subscriber_count("x"), 0);
    }

    #[test]
    fn event_serializes_to_wire_shape() {
        let event = CourseEvent::new(
            RegistrationEventType::StudentAutoEnrolled,
            "cs101",
            json!({"studentId": "s1"}),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "STUDENT_AUTO_ENROLLED");
        assert_eq!(value["courseId"], "cs101");
        assert_eq!(value["payload"]["studentId"], "s1");
        assert!(value["timestamp"].is_string());
    }
}
