//! Detector output and the single-slot detection feed.
//!
//! Frame acquisition and inference run in their own task; the mission loop
//! only ever reads the freshest qualifying detection and ignores anything
//! older than the configured freshness window.

use crate::config::EngagementConfig;
use crate::error::SensorError;
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, warn};

pub const MAX_LABEL_SIZE: usize = 32;

pub type Label = ArrayString<MAX_LABEL_SIZE>;

/// Frame-normalized box, origin at the top-left corner, y pointing down.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width * 0.5, self.y + self.height * 0.5)
    }

    /// Offset of the box center from the frame center. Positive x is right
    /// of center, positive y is below center.
    pub fn offset_from_center(&self) -> (f32, f32) {
        let (cx, cy) = self.center();
        (cx - 0.5, cy - 0.5)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub label: Label,
    pub confidence: f32,
    pub captured_at: Instant,
}

impl Detection {
    /// Labels longer than [`MAX_LABEL_SIZE`] bytes are truncated on a char boundary.
    pub fn new(label: &str, confidence: f32, bbox: BoundingBox, captured_at: Instant) -> Self {
        let mut bounded = Label::new();
        for ch in label.chars() {
            if bounded.try_push(ch).is_err() {
                break;
            }
        }
        Self { bbox, label: bounded, confidence, captured_at }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.captured_at)
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
    pub pixels: Vec<u8>,
}

pub trait FrameSource: Send + 'static {
    /// An error means the stream is gone for good.
    fn next_frame(&mut self) -> impl Future<Output = Result<Frame, SensorError>> + Send;
}

pub trait Detector: Send + 'static {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, SensorError>;
}

impl<F> Detector for F
where
    F: FnMut(&Frame) -> Result<Vec<Detection>, SensorError> + Send + 'static,
{
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, SensorError> {
        self(frame)
    }
}

/// Confidence threshold plus recognized label set.
#[derive(Debug, Clone)]
pub struct DetectionFilter {
    pub confidence_threshold: f32,
    pub labels: Vec<String>,
}

impl DetectionFilter {
    pub fn from_config(config: &EngagementConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            labels: config.target_labels.clone(),
        }
    }

    pub fn qualifies(&self, detection: &Detection) -> bool {
        detection.confidence >= self.confidence_threshold
            && (self.labels.is_empty() || self.labels.iter().any(|l| l == detection.label.as_str()))
    }

    /// Highest-confidence qualifying detection.
    pub fn best(&self, detections: Vec<Detection>) -> Option<Detection> {
        detections
            .into_iter()
            .filter(|d| self.qualifies(d))
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum FeedState {
    Starting,
    Live(Option<Detection>),
    Unavailable(String),
}

/// What the mission loop sees when it reads the feed on a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedReading {
    Target(Detection),
    Clear,
    Unavailable(String),
}

#[derive(Debug)]
pub struct DetectionPublisher {
    tx: watch::Sender<FeedState>,
}

#[derive(Debug, Clone)]
pub struct DetectionFeed {
    rx: watch::Receiver<FeedState>,
}

pub fn detection_channel() -> (DetectionPublisher, DetectionFeed) {
    let (tx, rx) = watch::channel(FeedState::Starting);
    (DetectionPublisher { tx }, DetectionFeed { rx })
}

impl DetectionPublisher {
    pub fn publish(&self, detection: Option<Detection>) {
        self.tx.send_replace(FeedState::Live(detection));
    }

    pub fn mark_unavailable(&self, reason: impl Into<String>) {
        self.tx.send_replace(FeedState::Unavailable(reason.into()));
    }
}

impl DetectionFeed {
    pub fn read(&self, now: Instant, max_age: Duration) -> FeedReading {
        match &*self.rx.borrow() {
            FeedState::Starting | FeedState::Live(None) => FeedReading::Clear,
            FeedState::Live(Some(detection)) if detection.age(now) <= max_age => {
                FeedReading::Target(detection.clone())
            }
            FeedState::Live(Some(_)) => FeedReading::Clear,
            FeedState::Unavailable(reason) => FeedReading::Unavailable(reason.clone()),
        }
    }
}

/// Pull frames, run the detector and publish the best qualifying detection.
/// A frame-source failure marks the feed unavailable and ends the task.
pub fn spawn_detection_feed<S, D>(
    mut source: S,
    mut detector: D,
    filter: DetectionFilter,
    publisher: DetectionPublisher,
    poll: Duration,
) -> JoinHandle<()>
where
    S: FrameSource,
    D: Detector,
{
    tokio::spawn(async move {
        let mut interval = time::interval(poll);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let frame = match source.next_frame().await {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("frame source failed, engagement disabled: {}", e);
                    publisher.mark_unavailable(e.to_string());
                    break;
                }
            };
            match detector.detect(&frame) {
                Ok(detections) => publisher.publish(filter.best(detections)),
                Err(e) => {
                    debug!("detector error on frame: {}", e);
                    publisher.publish(None);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(label: &str, confidence: f32, at: Instant) -> Detection {
        Detection::new(label, confidence, BoundingBox { x: 0.4, y: 0.4, width: 0.2, height: 0.2 }, at)
    }

    #[test]
    fn test_best_detection_respects_threshold_and_labels() {
        let now = Instant::now();
        let filter = DetectionFilter { confidence_threshold: 0.5, labels: vec!["fire".into()] };
        let best = filter.best(vec![
            detection("fire", 0.6, now),
            detection("smoke", 0.9, now),
            detection("fire", 0.8, now),
            detection("fire", 0.3, now),
        ]);
        assert_eq!(best.map(|d| d.confidence), Some(0.8));
        assert!(filter.best(vec![detection("smoke", 0.99, now)]).is_none());
    }

    #[test]
    fn test_label_truncated_on_char_boundary() {
        let long = "é".repeat(40);
        let d = detection(&long, 0.9, Instant::now());
        assert!(d.label.len() <= MAX_LABEL_SIZE);
        assert!(d.label.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_offset_from_center() {
        let bbox = BoundingBox { x: 0.6, y: 0.2, width: 0.2, height: 0.2 };
        let (dx, dy) = bbox.offset_from_center();
        assert!((dx - 0.2).abs() < 1e-6);
        assert!((dy + 0.2).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_feed_ignores_stale_detections() {
        let (publisher, feed) = detection_channel();
        let now = Instant::now();
        assert_eq!(feed.read(now, Duration::from_millis(500)), FeedReading::Clear);
        publisher.publish(Some(detection("fire", 0.9, now)));
        assert!(matches!(feed.read(now, Duration::from_millis(500)), FeedReading::Target(_)));
        assert_eq!(feed.read(now + Duration::from_secs(1), Duration::from_millis(500)), FeedReading::Clear);
        publisher.mark_unavailable("stream closed");
        assert!(matches!(feed.read(now, Duration::from_millis(500)), FeedReading::Unavailable(_)));
    }
}
