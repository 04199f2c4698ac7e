use serde::{Deserialize, Serialize};

/// Client-to-server commands on the streaming channel. A connection must
/// authenticate before subscribing.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum Command {
    #[serde(rename = "authenticate")]
    Authenticate {
        #[serde(rename = "studentId")]
        student_id: String,
    },
    #[serde(rename = "subscribe:course")]
    SubscribeCourse {
        #[serde(rename = "courseId")]
        course_id: String,
    },
    #[serde(rename = "unsubscribe:course")]
    UnsubscribeCourse {
        #[serde(rename = "courseId")]
        course_id: String,
    },
}

/// Server-to-client control frames. Course updates themselves are the
/// serialized [`enroll_core::CourseEvent`] shape
/// `{type, courseId, payload, timestamp}`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "authenticated")]
    Authenticated {
        #[serde(rename = "studentId")]
        student_id: String,
    },
    #[serde(rename = "subscribed")]
    Subscribed {
        #[serde(rename = "courseId")]
        course_id: String,
    },
    #[serde(rename = "unsubscribed")]
    Unsubscribed {
        #[serde(rename = "courseId")]
        course_id: String,
    },
    #[serde(rename = "error")]
    Error { message: String },
}
