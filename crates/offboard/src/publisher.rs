//! Fixed-rate setpoint publisher. Each tick re-expresses the stored
//! target in the local frame, derives one outgoing message from the
//! current setpoint kind, and rebroadcasts the goal frame.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nalgebra::Vector3;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::*;

use cs_bridge::{
    AttitudeTarget, AttitudeTargetTypemask, PositionTarget, PositionTargetTypemask,
    SetpointMessage, ThrustSetpoint,
};
use cs_client::Task;
use cs_frames::{Transform, TransformBuffer};
use cs_types::{yaw_quat, StampedPose, StampedVector};

use crate::config::OffboardConfig;
use crate::setpoint::{ActiveSetpoint, Commanded, NavigateGoal, SetpointHandle, YawPolicy};

/// Extrapolation slack when re-expressing the stored target at tick time.
const TRANSFORM_SLACK: Duration = Duration::from_millis(50);
const TRANSFORM_WARN_PERIOD: Duration = Duration::from_secs(10);

/// Per-tick computation, kept free of channels and clocks so tests can
/// drive it with explicit stamps.
pub struct Pipeline {
    local_frame: String,
    fcu_frame: String,
    target_frame: String,

    /// Tag of the command the shadow state below belongs to.
    seq: Option<u64>,
    /// Last successfully transformed target; reused while the frame graph
    /// is unavailable.
    transformed_pose: Option<StampedPose>,
    transformed_velocity: Option<StampedVector>,
    /// Interpolation origin time; advanced while arming is pending.
    nav_started: Option<DateTime<Utc>>,

    last_transform_warn: Option<Instant>,
}

impl Pipeline {
    pub fn new(config: &OffboardConfig) -> Self {
        Pipeline {
            local_frame: config.local_frame.clone(),
            fcu_frame: config.fcu_frame.clone(),
            target_frame: config.target_frame.clone(),
            seq: None,
            transformed_pose: None,
            transformed_velocity: None,
            nav_started: None,
            last_transform_warn: None,
        }
    }

    /// One tick at time `now`. Returns the messages to emit, already
    /// stamped with `now`.
    pub fn step(
        &mut self,
        now: DateTime<Utc>,
        current: Option<&Commanded>,
        wait_armed: bool,
        frames: &TransformBuffer,
    ) -> Vec<SetpointMessage> {
        let Some(current) = current else {
            self.seq = None;
            return vec![];
        };

        if self.seq != Some(current.seq) {
            self.seq = Some(current.seq);
            self.transformed_pose = None;
            self.transformed_velocity = None;
            self.nav_started = current
                .setpoint
                .navigate_goal()
                .map(|goal| goal.start.stamp);
        }

        // the command was accepted but the vehicle is still arming; hold
        // the interpolation origin at the present so time starts once
        // arming completes
        if wait_armed && self.nav_started.is_some() {
            self.nav_started = Some(now);
        }

        self.refresh_transforms(now, &current.setpoint, frames);
        self.broadcast_target(&current.setpoint, frames);
        self.build(now, &current.setpoint)
    }

    fn refresh_transforms(
        &mut self,
        now: DateTime<Utc>,
        setpoint: &ActiveSetpoint,
        frames: &TransformBuffer,
    ) {
        if let Some(stored) = setpoint.stored_pose() {
            let mut stamped = stored.clone();
            stamped.stamp = now;
            match frames.transform_pose(&stamped, &self.local_frame, TRANSFORM_SLACK) {
                Ok(pose) => self.transformed_pose = Some(pose),
                Err(_) => self.warn_transform(),
            }
        }

        if let ActiveSetpoint::Velocity { target, .. } = setpoint {
            let mut stamped = target.clone();
            stamped.stamp = now;
            match frames.transform_vector(&stamped, &self.local_frame, TRANSFORM_SLACK) {
                Ok(vector) => self.transformed_velocity = Some(vector),
                Err(_) => self.warn_transform(),
            }
        }
    }

    fn broadcast_target(&self, setpoint: &ActiveSetpoint, frames: &TransformBuffer) {
        if self.target_frame.is_empty() || !setpoint.has_position_target() {
            return;
        }
        if let Some(pose) = &self.transformed_pose {
            frames.broadcast(Transform::from_pose(pose, self.target_frame.clone()));
        }
    }

    fn build(&self, now: DateTime<Utc>, setpoint: &ActiveSetpoint) -> Vec<SetpointMessage> {
        match setpoint {
            ActiveSetpoint::Navigate(goal) | ActiveSetpoint::NavigateGlobal { nav: goal, .. } => {
                let Some(target) = &self.transformed_pose else {
                    return vec![];
                };
                let started = self.nav_started.unwrap_or(goal.start.stamp);
                let position = interpolate(goal, target, started, now);

                let orientation = match goal.yaw {
                    YawPolicy::TowardsTarget => yaw_quat(
                        (position.y - goal.start.position.y)
                            .atan2(position.x - goal.start.position.x),
                    ),
                    _ => target.orientation,
                };

                vec![self.positional(now, position, orientation, goal.yaw)]
            }

            ActiveSetpoint::Position { yaw, .. } => {
                let Some(target) = &self.transformed_pose else {
                    return vec![];
                };
                vec![self.positional(now, target.position, target.orientation, *yaw)]
            }

            ActiveSetpoint::Velocity { yaw, .. } => {
                let (Some(velocity), Some(reference)) =
                    (&self.transformed_velocity, &self.transformed_pose)
                else {
                    return vec![];
                };

                let mut mask = PositionTargetTypemask::POSITION_TARGET_TYPEMASK_X_IGNORE
                    | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_Y_IGNORE
                    | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_Z_IGNORE
                    | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AX_IGNORE
                    | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AY_IGNORE
                    | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AZ_IGNORE;

                let (yaw_angle, yaw_rate) = match yaw {
                    YawPolicy::Rate(rate) => {
                        mask |= PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_IGNORE;
                        (0.0, *rate)
                    }
                    _ => {
                        mask |= PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_RATE_IGNORE;
                        (reference.yaw() as f32, 0.0)
                    }
                };

                vec![SetpointMessage::PositionRaw(PositionTarget {
                    stamp: now,
                    frame_id: self.local_frame.clone(),
                    type_mask: mask,
                    position: Vector3::zeros(),
                    velocity: velocity.vector,
                    yaw: yaw_angle,
                    yaw_rate,
                })]
            }

            ActiveSetpoint::Attitude { thrust, .. } => {
                let Some(pose) = &self.transformed_pose else {
                    return vec![];
                };
                let mut pose = pose.clone();
                pose.stamp = now;
                // thrust first so the frame assembled from the attitude
                // pose carries the current value
                vec![
                    SetpointMessage::Thrust(ThrustSetpoint {
                        stamp: now,
                        thrust: *thrust,
                    }),
                    SetpointMessage::AttitudePose(pose),
                ]
            }

            ActiveSetpoint::Rates { rates, thrust } => {
                vec![SetpointMessage::AttitudeRaw(AttitudeTarget {
                    stamp: now,
                    frame_id: self.fcu_frame.clone(),
                    type_mask: AttitudeTargetTypemask::ATTITUDE_TARGET_TYPEMASK_ATTITUDE_IGNORE,
                    body_rate: *rates,
                    thrust: *thrust,
                })]
            }
        }
    }

    /// Position-style emission: the pose channel for absolute/towards yaw,
    /// the raw channel with a yaw-rate when yaw is rate-commanded.
    fn positional(
        &self,
        now: DateTime<Utc>,
        position: Vector3<f64>,
        orientation: nalgebra::UnitQuaternion<f64>,
        yaw: YawPolicy,
    ) -> SetpointMessage {
        match yaw {
            YawPolicy::Rate(rate) => SetpointMessage::PositionRaw(PositionTarget {
                stamp: now,
                frame_id: self.local_frame.clone(),
                type_mask: PositionTargetTypemask::POSITION_TARGET_TYPEMASK_VX_IGNORE
                    | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_VY_IGNORE
                    | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_VZ_IGNORE
                    | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AX_IGNORE
                    | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AY_IGNORE
                    | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AZ_IGNORE
                    | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_IGNORE,
                position,
                velocity: Vector3::zeros(),
                yaw: 0.0,
                yaw_rate: rate,
            }),
            _ => SetpointMessage::Pose(StampedPose {
                frame_id: self.local_frame.clone(),
                stamp: now,
                position,
                orientation,
            }),
        }
    }

    fn warn_transform(&mut self) {
        let now = Instant::now();
        let due = self
            .last_transform_warn
            .map_or(true, |last| now - last > TRANSFORM_WARN_PERIOD);
        if due {
            warn!("can't transform setpoint, reusing the last good value");
            self.last_transform_warn = Some(now);
        }
    }
}

/// Straight-line interpolation from the navigation start to the
/// transformed target, parameterized by elapsed time and speed.
fn interpolate(
    goal: &NavigateGoal,
    target: &StampedPose,
    started: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Vector3<f64> {
    let span = target.position - goal.start.position;
    let distance = span.norm();
    if distance == 0.0 {
        return target.position;
    }

    let duration = distance / goal.speed;
    let elapsed = (now - started).num_milliseconds() as f64 / 1000.0;
    let passed = (elapsed / duration).clamp(0.0, 1.0);

    goal.start.position + span * passed
}

pub struct PublisherTask {
    config: OffboardConfig,
    handle: SetpointHandle,
    frames: Arc<TransformBuffer>,
    out: flume::Sender<SetpointMessage>,
}

pub fn create_task(
    config: OffboardConfig,
    handle: SetpointHandle,
    frames: Arc<TransformBuffer>,
    out: flume::Sender<SetpointMessage>,
) -> PublisherTask {
    PublisherTask {
        config,
        handle,
        frames,
        out,
    }
}

#[async_trait]
impl Task for PublisherTask {
    fn name(&self) -> &'static str {
        "offboard/publisher"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let Self {
            config,
            handle,
            frames,
            out,
        } = *self;

        let loop_fut = async move {
            let mut pipeline = Pipeline::new(&config);
            let mut current_rx = handle.subscribe();
            let mut ticker =
                tokio::time::interval(Duration::from_secs_f64(1.0 / config.setpoint_rate));

            loop {
                // a freshly accepted command publishes immediately, before
                // its mode/arm sequencing starts
                select! {
                    _ = ticker.tick() => {}
                    changed = current_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }

                let now = Utc::now();
                let current = current_rx.borrow_and_update().clone();
                let messages =
                    pipeline.step(now, current.as_ref(), handle.wait_armed(), &frames);

                if messages.is_empty() {
                    continue;
                }
                for message in messages {
                    out.send_async(message).await?;
                }
                handle.note_published();
            }

            Ok::<_, anyhow::Error>(())
        };

        select! {
          _ = cancel.cancelled() => {}
          res = loop_fut => { res? }
        }

        Ok(())
    }
}
