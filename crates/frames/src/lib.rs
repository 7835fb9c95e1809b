//! Transform tree shared by every task in the process.
//!
//! One most-recent sample is kept per directed (parent, child) edge, plus
//! timeless static edges seeded from configuration. Lookups walk the
//! undirected graph and compose isometries along the path. There is no
//! sample interpolation; a sample answers a lookup at time `t` when it is
//! static or within the validity window (plus any caller slack) of `t`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nalgebra::{Isometry3, Translation3};
use thiserror::Error;

use cs_types::{StampedPose, StampedVector};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("can't transform from {from_frame} to {target}")]
    Unavailable { target: String, from_frame: String },
}

/// A frame relation: the pose of `child` expressed in `parent`.
#[derive(Debug, Clone)]
pub struct Transform {
    pub parent: String,
    pub child: String,
    /// `None` marks a static relation, valid at any time.
    pub stamp: Option<DateTime<Utc>>,
    pub iso: Isometry3<f64>,
}

impl Transform {
    pub fn from_pose(pose: &StampedPose, child: impl Into<String>) -> Self {
        Transform {
            parent: pose.frame_id.clone(),
            child: child.into(),
            stamp: Some(pose.stamp),
            iso: Isometry3::from_parts(
                Translation3::from(pose.position),
                pose.orientation,
            ),
        }
    }

    fn usable_at(&self, at: DateTime<Utc>, tolerance: chrono::Duration) -> bool {
        match self.stamp {
            None => true,
            Some(stamp) => (at - stamp).abs() <= tolerance,
        }
    }
}

pub struct TransformBuffer {
    edges: RwLock<HashMap<(String, String), Transform>>,
    /// How long a timed sample keeps answering lookups.
    window: chrono::Duration,
}

impl Default for TransformBuffer {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl TransformBuffer {
    pub fn new(window: Duration) -> Self {
        TransformBuffer {
            edges: RwLock::new(HashMap::new()),
            window: to_chrono(window),
        }
    }

    /// Publishes a frame relation, replacing any previous sample for the
    /// same (parent, child) pair.
    pub fn broadcast(&self, transform: Transform) {
        let key = (transform.parent.clone(), transform.child.clone());
        self.edges.write().unwrap().insert(key, transform);
    }

    /// Seeds a timeless relation, e.g. an aliased reference frame.
    pub fn set_static(&self, parent: &str, child: &str, iso: Isometry3<f64>) {
        self.broadcast(Transform {
            parent: parent.to_owned(),
            child: child.to_owned(),
            stamp: None,
            iso,
        });
    }

    pub fn can_transform(&self, target: &str, source: &str, at: DateTime<Utc>) -> bool {
        self.lookup(target, source, at, Duration::ZERO).is_ok()
    }

    /// Isometry taking coordinates in `source` to coordinates in `target`,
    /// allowing samples up to `slack` beyond the validity window.
    pub fn lookup(
        &self,
        target: &str,
        source: &str,
        at: DateTime<Utc>,
        slack: Duration,
    ) -> Result<Isometry3<f64>, TransformError> {
        if target == source {
            return Ok(Isometry3::identity());
        }

        let tolerance = self.window + to_chrono(slack);
        let edges = self.edges.read().unwrap();

        // Adjacency over usable edges; each hop carries the isometry that
        // maps data from the current frame into the neighbor.
        let mut adjacency: HashMap<&str, Vec<(&str, Isometry3<f64>)>> = HashMap::new();
        for ((parent, child), t) in edges.iter() {
            if !t.usable_at(at, tolerance) {
                continue;
            }
            adjacency
                .entry(child.as_str())
                .or_default()
                .push((parent.as_str(), t.iso));
            adjacency
                .entry(parent.as_str())
                .or_default()
                .push((child.as_str(), t.iso.inverse()));
        }

        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<(&str, Isometry3<f64>)> = VecDeque::new();
        visited.insert(source);
        queue.push_back((source, Isometry3::identity()));

        while let Some((frame, acc)) = queue.pop_front() {
            if frame == target {
                return Ok(acc);
            }
            if let Some(neighbors) = adjacency.get(frame) {
                for (next, hop) in neighbors {
                    if visited.insert(*next) {
                        queue.push_back((*next, hop * &acc));
                    }
                }
            }
        }

        Err(TransformError::Unavailable {
            target: target.to_owned(),
            from_frame: source.to_owned(),
        })
    }

    /// Re-expresses a pose in `target`, rotating the orientation along.
    pub fn transform_pose(
        &self,
        pose: &StampedPose,
        target: &str,
        slack: Duration,
    ) -> Result<StampedPose, TransformError> {
        let iso = self.lookup(target, &pose.frame_id, pose.stamp, slack)?;
        Ok(StampedPose {
            frame_id: target.to_owned(),
            stamp: pose.stamp,
            position: iso.transform_point(&pose.position.into()).coords,
            orientation: iso.rotation * pose.orientation,
        })
    }

    /// Re-expresses a free vector in `target`. Only rotation applies.
    pub fn transform_vector(
        &self,
        vector: &StampedVector,
        target: &str,
        slack: Duration,
    ) -> Result<StampedVector, TransformError> {
        let iso = self.lookup(target, &vector.frame_id, vector.stamp, slack)?;
        Ok(StampedVector {
            frame_id: target.to_owned(),
            stamp: vector.stamp,
            vector: iso.rotation * vector.vector,
        })
    }

    /// Polls for a path to appear without blocking other tasks. Returns
    /// false once `timeout` elapses.
    pub async fn wait_for_transform(
        &self,
        target: &str,
        source: &str,
        at: DateTime<Utc>,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.can_transform(target, source, at) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::max_value())
}
