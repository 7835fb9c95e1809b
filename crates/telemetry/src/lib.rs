//! Most-recent-wins cache of everything the autopilot reports. One slot
//! per stream, overwritten on arrival; readers judge freshness against the
//! configured budget for that stream.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nalgebra::{Isometry3, Translation3, Vector3};
use tokio::select;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::*;

use cs_bridge::AutopilotEvent;
use cs_client::Task;
use cs_frames::{Transform, TransformBuffer};
use cs_types::{
    yaw_quat, AutopilotState, BatteryReading, GeoFix, StampedPose, StampedVector, StatusText,
};

mod config;

pub use config::TelemetryConfig;

/// Linear velocity in the local frame paired with body-frame angular
/// rates, as the autopilot reports them.
#[derive(Debug, Clone)]
pub struct Velocity {
    pub linear: StampedVector,
    pub angular: Vector3<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    pub state: Option<AutopilotState>,
    pub local_pose: Option<StampedPose>,
    pub velocity: Option<Velocity>,
    pub global_fix: Option<GeoFix>,
    pub battery: Option<BatteryReading>,
    pub status: Option<StatusText>,
}

impl Telemetry {
    pub fn fresh_state(&self, config: &TelemetryConfig, now: DateTime<Utc>) -> Option<&AutopilotState> {
        self.state
            .as_ref()
            .filter(|s| within(s.stamp, now, config.state_timeout))
    }

    pub fn fresh_local_pose(
        &self,
        config: &TelemetryConfig,
        now: DateTime<Utc>,
    ) -> Option<&StampedPose> {
        self.local_pose
            .as_ref()
            .filter(|p| within(p.stamp, now, config.local_position_timeout))
    }

    pub fn fresh_velocity(&self, config: &TelemetryConfig, now: DateTime<Utc>) -> Option<&Velocity> {
        self.velocity
            .as_ref()
            .filter(|v| within(v.linear.stamp, now, config.velocity_timeout))
    }

    pub fn fresh_global_fix(&self, config: &TelemetryConfig, now: DateTime<Utc>) -> Option<&GeoFix> {
        self.global_fix
            .as_ref()
            .filter(|g| within(g.stamp, now, config.global_position_timeout))
    }

    pub fn fresh_battery(
        &self,
        config: &TelemetryConfig,
        now: DateTime<Utc>,
    ) -> Option<&BatteryReading> {
        self.battery
            .as_ref()
            .filter(|b| within(b.stamp, now, config.battery_timeout))
    }
}

fn within(stamp: DateTime<Utc>, now: DateTime<Utc>, budget_secs: f64) -> bool {
    (now - stamp).num_milliseconds() as f64 <= budget_secs * 1000.0
}

pub struct TelemetryTask {
    config: TelemetryConfig,
    evt_rx: flume::Receiver<AutopilotEvent>,
    frames: Arc<TransformBuffer>,
    telem_tx: watch::Sender<Telemetry>,
    telem_rx: watch::Receiver<Telemetry>,
}

pub fn create_task(
    config: TelemetryConfig,
    evt_rx: flume::Receiver<AutopilotEvent>,
    frames: Arc<TransformBuffer>,
) -> TelemetryTask {
    let (telem_tx, telem_rx) = watch::channel(Telemetry::default());

    TelemetryTask {
        config,
        evt_rx,
        frames,
        telem_tx,
        telem_rx,
    }
}

impl TelemetryTask {
    pub fn telemetry(&self) -> watch::Receiver<Telemetry> {
        self.telem_rx.clone()
    }
}

#[async_trait]
impl Task for TelemetryTask {
    fn name(&self) -> &'static str {
        "telemetry"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let Self {
            config,
            evt_rx,
            frames,
            telem_tx,
            ..
        } = *self;

        let loop_fut = async move {
            let mut current = Telemetry::default();

            while let Ok(event) = evt_rx.recv_async().await {
                match event {
                    AutopilotEvent::State(state) => current.state = Some(state),
                    AutopilotEvent::LocalPose(pose) => {
                        publish_fcu_frame(&frames, &config.fcu_frame, &pose);
                        publish_body_frame(&frames, &config.body_frame, &pose);
                        current.local_pose = Some(pose);
                    }
                    AutopilotEvent::Velocity { linear, angular } => {
                        current.velocity = Some(Velocity { linear, angular })
                    }
                    AutopilotEvent::GlobalFix(fix) => current.global_fix = Some(fix),
                    AutopilotEvent::Battery(battery) => current.battery = Some(battery),
                    AutopilotEvent::Status(status) => current.status = Some(status),
                }

                let _ = telem_tx.send(current.clone());
            }

            trace!("autopilot event stream closed");
            Ok::<_, anyhow::Error>(())
        };

        select! {
          _ = cancel.cancelled() => {}
          res = loop_fut => { res? }
        }

        Ok(())
    }
}

/// Tracks the flight controller with its full orientation.
fn publish_fcu_frame(frames: &TransformBuffer, fcu_frame: &str, pose: &StampedPose) {
    if fcu_frame.is_empty() {
        return;
    }

    frames.broadcast(Transform::from_pose(pose, fcu_frame));
}

/// Tracks the vehicle with a yaw-only rotation so planar offsets can be
/// commanded relative to the body without inheriting roll and pitch.
fn publish_body_frame(frames: &TransformBuffer, body_frame: &str, pose: &StampedPose) {
    if body_frame.is_empty() {
        return;
    }

    frames.broadcast(Transform {
        parent: pose.frame_id.clone(),
        child: body_frame.to_owned(),
        stamp: Some(pose.stamp),
        iso: Isometry3::from_parts(Translation3::from(pose.position), yaw_quat(pose.yaw())),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use cs_types::quat_from_rpy;
    use std::time::Duration;

    fn pose_at(stamp: DateTime<Utc>) -> StampedPose {
        let mut pose = StampedPose::new("map", stamp);
        pose.position = Vector3::new(1.0, 2.0, 3.0);
        pose.orientation = quat_from_rpy(0.3, -0.2, 1.0);
        pose
    }

    #[test]
    fn freshness_respects_the_budget() {
        let config = TelemetryConfig::default();
        let now = Utc::now();

        let mut telemetry = Telemetry::default();
        telemetry.local_pose = Some(pose_at(now - chrono::Duration::seconds(1)));
        assert!(telemetry.fresh_local_pose(&config, now).is_some());

        telemetry.local_pose = Some(pose_at(now - chrono::Duration::seconds(10)));
        assert!(telemetry.fresh_local_pose(&config, now).is_none());
    }

    #[test]
    fn body_frame_strips_roll_and_pitch() {
        let frames = TransformBuffer::default();
        let stamp = Utc::now();
        publish_body_frame(&frames, "body", &pose_at(stamp));

        let iso = frames
            .lookup("map", "body", stamp, Duration::ZERO)
            .unwrap();
        let (roll, pitch, yaw) = iso.rotation.euler_angles();
        assert_relative_eq!(roll, 0.0, epsilon = 1e-12);
        assert_relative_eq!(pitch, 0.0, epsilon = 1e-12);
        assert_relative_eq!(yaw, 1.0, epsilon = 1e-12);
        assert_relative_eq!(iso.translation.vector.x, 1.0);
    }

    #[test]
    fn fcu_frame_keeps_full_orientation() {
        let frames = TransformBuffer::default();
        let stamp = Utc::now();
        publish_fcu_frame(&frames, "base_link", &pose_at(stamp));

        let iso = frames
            .lookup("map", "base_link", stamp, Duration::ZERO)
            .unwrap();
        let (roll, pitch, _) = iso.rotation.euler_angles();
        assert_relative_eq!(roll, 0.3, epsilon = 1e-12);
        assert_relative_eq!(pitch, -0.2, epsilon = 1e-12);
    }

    #[test]
    fn empty_body_frame_disables_the_broadcast() {
        let frames = TransformBuffer::default();
        let stamp = Utc::now();
        publish_body_frame(&frames, "", &pose_at(stamp));
        assert!(!frames.can_transform("map", "", stamp));
    }

    #[tokio::test]
    async fn cache_keeps_the_most_recent_value() {
        let (evt_tx, evt_rx) = flume::bounded(16);
        let frames = Arc::new(TransformBuffer::default());
        let task = create_task(TelemetryConfig::default(), evt_rx, frames);
        let mut telem_rx = task.telemetry();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Box::new(task).run(cancel.clone()));

        let first = pose_at(Utc::now());
        let second = pose_at(Utc::now() + chrono::Duration::milliseconds(50));
        evt_tx
            .send_async(AutopilotEvent::LocalPose(first))
            .await
            .unwrap();
        evt_tx
            .send_async(AutopilotEvent::LocalPose(second.clone()))
            .await
            .unwrap();

        // wait until the second write lands
        loop {
            telem_rx.changed().await.unwrap();
            let seen = telem_rx.borrow().local_pose.clone();
            if seen.map_or(false, |p| p.stamp == second.stamp) {
                break;
            }
        }

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
