//! The single authoritative record of what the vehicle was last told to
//! do. The arbiter writes it, the publisher reads it every tick; nothing
//! else touches it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nalgebra::Vector3;
use tokio::sync::watch;

use cs_types::{StampedPose, StampedVector};

/// How yaw is commanded while the current setpoint is active. The wire
/// encodes this in the yaw field itself: NaN selects a rate, +inf selects
/// facing the direction of travel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum YawPolicy {
    /// Hold the yaw baked into the target orientation.
    Absolute,
    /// Turn at a fixed rate, rad/s.
    Rate(f32),
    /// Face from the navigation start toward the current target.
    TowardsTarget,
}

impl YawPolicy {
    /// Splits a wire yaw value into the policy and the yaw angle to build
    /// the target orientation from.
    pub fn classify(yaw: f32, yaw_rate: f32) -> (YawPolicy, f32) {
        if yaw.is_nan() {
            (YawPolicy::Rate(yaw_rate), 0.0)
        } else if yaw.is_infinite() && yaw > 0.0 {
            (YawPolicy::TowardsTarget, 0.0)
        } else {
            (YawPolicy::Absolute, yaw)
        }
    }
}

/// Linear run from `start` to `target` at constant speed.
#[derive(Debug, Clone, PartialEq)]
pub struct NavigateGoal {
    /// Local pose snapshotted at acceptance; interpolation time starts at
    /// its stamp.
    pub start: StampedPose,
    /// Stored in the resolved reference frame, re-transformed every tick.
    pub target: StampedPose,
    pub speed: f64,
    pub yaw: YawPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActiveSetpoint {
    Navigate(NavigateGoal),
    NavigateGlobal {
        nav: NavigateGoal,
        latitude: f64,
        longitude: f64,
    },
    Position {
        target: StampedPose,
        yaw: YawPolicy,
    },
    Velocity {
        target: StampedVector,
        /// Carries the commanded yaw through frame changes.
        yaw_reference: StampedPose,
        yaw: YawPolicy,
    },
    Attitude {
        pose: StampedPose,
        thrust: f32,
    },
    Rates {
        rates: Vector3<f64>,
        thrust: f32,
    },
}

impl ActiveSetpoint {
    /// The stored pose the publisher re-expresses in the local frame each
    /// tick, if this kind has one.
    pub fn stored_pose(&self) -> Option<&StampedPose> {
        match self {
            ActiveSetpoint::Navigate(nav) | ActiveSetpoint::NavigateGlobal { nav, .. } => {
                Some(&nav.target)
            }
            ActiveSetpoint::Position { target, .. } => Some(target),
            ActiveSetpoint::Velocity { yaw_reference, .. } => Some(yaw_reference),
            ActiveSetpoint::Attitude { pose, .. } => Some(pose),
            ActiveSetpoint::Rates { .. } => None,
        }
    }

    pub fn navigate_goal(&self) -> Option<&NavigateGoal> {
        match self {
            ActiveSetpoint::Navigate(nav) | ActiveSetpoint::NavigateGlobal { nav, .. } => Some(nav),
            _ => None,
        }
    }

    /// Kinds whose transformed target is rebroadcast as the goal frame.
    pub fn has_position_target(&self) -> bool {
        matches!(
            self,
            ActiveSetpoint::Navigate(_)
                | ActiveSetpoint::NavigateGlobal { .. }
                | ActiveSetpoint::Position { .. }
        )
    }
}

/// An accepted command, tagged so the publisher can tell a fresh
/// acceptance from a re-read of the same one.
#[derive(Debug, Clone, PartialEq)]
pub struct Commanded {
    pub seq: u64,
    pub setpoint: ActiveSetpoint,
}

/// Shared access to the current setpoint, the arming gate, and the
/// publish counter the arbiter uses to sequence its first tick.
#[derive(Clone)]
pub struct SetpointHandle {
    seq: Arc<AtomicU64>,
    current_tx: Arc<watch::Sender<Option<Commanded>>>,
    current_rx: watch::Receiver<Option<Commanded>>,
    wait_armed_tx: Arc<watch::Sender<bool>>,
    wait_armed_rx: watch::Receiver<bool>,
    published_tx: Arc<watch::Sender<u64>>,
    published_rx: watch::Receiver<u64>,
}

impl Default for SetpointHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SetpointHandle {
    pub fn new() -> Self {
        let (current_tx, current_rx) = watch::channel(None);
        let (wait_armed_tx, wait_armed_rx) = watch::channel(false);
        let (published_tx, published_rx) = watch::channel(0);

        SetpointHandle {
            seq: Arc::new(AtomicU64::new(0)),
            current_tx: Arc::new(current_tx),
            current_rx,
            wait_armed_tx: Arc::new(wait_armed_tx),
            wait_armed_rx,
            published_tx: Arc::new(published_tx),
            published_rx,
        }
    }

    /// Replaces the current setpoint. Committing an identical setpoint
    /// keeps its tag, so the outgoing stream is unchanged.
    pub fn commit(&self, setpoint: ActiveSetpoint) {
        let seq = match self.current_rx.borrow().as_ref() {
            Some(current) if current.setpoint == setpoint => current.seq,
            _ => self.seq.fetch_add(1, Ordering::SeqCst) + 1,
        };
        let _ = self.current_tx.send(Some(Commanded { seq, setpoint }));
    }

    pub fn clear(&self) {
        let _ = self.current_tx.send(None);
    }

    pub fn current(&self) -> Option<Commanded> {
        self.current_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Commanded>> {
        self.current_rx.clone()
    }

    pub fn set_wait_armed(&self, value: bool) {
        let _ = self.wait_armed_tx.send(value);
    }

    pub fn wait_armed(&self) -> bool {
        *self.wait_armed_rx.borrow()
    }

    pub fn note_published(&self) {
        self.published_tx.send_modify(|count| *count += 1);
    }

    pub fn published_count(&self) -> u64 {
        *self.published_rx.borrow()
    }

    /// Waits until the publisher has emitted past `since`, or gives up.
    pub async fn wait_for_publish(&self, since: u64, timeout: Duration) -> bool {
        let mut rx = self.published_rx.clone();
        let wait = async move {
            loop {
                if *rx.borrow_and_update() > since {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn position_setpoint(x: f64) -> ActiveSetpoint {
        let mut target = StampedPose::new("map", Utc::now());
        target.position.x = x;
        ActiveSetpoint::Position {
            target,
            yaw: YawPolicy::Absolute,
        }
    }

    #[test]
    fn classify_covers_the_three_encodings() {
        assert_eq!(
            YawPolicy::classify(f32::NAN, 0.4),
            (YawPolicy::Rate(0.4), 0.0)
        );
        assert_eq!(
            YawPolicy::classify(f32::INFINITY, 0.0),
            (YawPolicy::TowardsTarget, 0.0)
        );
        assert_eq!(YawPolicy::classify(1.1, 0.0), (YawPolicy::Absolute, 1.1));
        // -inf is an ordinary (if odd) absolute yaw encoding upstream
        // validation never lets through
        assert_eq!(
            YawPolicy::classify(f32::NEG_INFINITY, 0.0).0,
            YawPolicy::Absolute
        );
    }

    #[test]
    fn recommitting_an_identical_setpoint_keeps_the_tag() {
        let handle = SetpointHandle::new();
        let setpoint = position_setpoint(1.0);

        handle.commit(setpoint.clone());
        let first = handle.current().unwrap().seq;
        handle.commit(setpoint);
        assert_eq!(handle.current().unwrap().seq, first);

        handle.commit(position_setpoint(2.0));
        assert_ne!(handle.current().unwrap().seq, first);
    }

    #[tokio::test]
    async fn publish_wait_resolves_after_a_bump() {
        let handle = SetpointHandle::new();
        let since = handle.published_count();

        let bumper = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            bumper.note_published();
        });

        assert!(
            handle
                .wait_for_publish(since, Duration::from_secs(1))
                .await
        );
        assert!(
            !handle
                .wait_for_publish(since + 5, Duration::from_millis(50))
                .await
        );
    }
}
