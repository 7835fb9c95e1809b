//! Command arbitration: validates each request against fresh telemetry,
//! resolves its frames, installs the new setpoint, and drives the
//! mode/arm sequencing. At most one command is in flight; the rest are
//! turned away with `Busy` while this one suspends on transforms or
//! state waits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use nalgebra::Vector3;
use tokio::select;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::*;

use cs_client::{ServiceSink, ServiceSource, Task};
use cs_frames::TransformBuffer;
use cs_telemetry::{Telemetry, TelemetryConfig};
use cs_types::{quat_from_rpy, StampedPose, StampedVector};

use crate::command::{Ack, ApiRequest, ApiResponse, GetTelemetryRequest, TelemetrySnapshot};
use crate::config::OffboardConfig;
use crate::error::CommandError;
use crate::geodesic;
use crate::sequencer;
use crate::setpoint::{ActiveSetpoint, NavigateGoal, SetpointHandle, YawPolicy};

pub type CommandSink = ServiceSink<ApiRequest, ApiResponse>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Navigate,
    NavigateGlobal,
    Position,
    Velocity,
    Attitude,
    Rates,
}

/// Flattened command input, one shape for every setpoint kind.
#[derive(Debug, Clone)]
struct Raw {
    kind: Kind,
    x: f32,
    y: f32,
    z: f32,
    vx: f32,
    vy: f32,
    vz: f32,
    roll: f32,
    pitch: f32,
    yaw: f32,
    roll_rate: f32,
    pitch_rate: f32,
    yaw_rate: f32,
    lat: f64,
    lon: f64,
    thrust: f32,
    speed: f32,
    frame_id: String,
    auto_arm: bool,
}

impl Raw {
    fn zero(kind: Kind) -> Self {
        Raw {
            kind,
            x: 0.0,
            y: 0.0,
            z: 0.0,
            vx: 0.0,
            vy: 0.0,
            vz: 0.0,
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
            roll_rate: 0.0,
            pitch_rate: 0.0,
            yaw_rate: 0.0,
            lat: 0.0,
            lon: 0.0,
            thrust: 0.0,
            speed: 0.0,
            frame_id: String::new(),
            auto_arm: false,
        }
    }
}

#[derive(Clone)]
struct CommandContext {
    config: Arc<OffboardConfig>,
    telemetry_config: Arc<TelemetryConfig>,
    services: cs_bridge::ServiceSink,
    telemetry: watch::Receiver<Telemetry>,
    frames: Arc<TransformBuffer>,
    setpoint: SetpointHandle,
    busy: Arc<AtomicBool>,
}

pub struct ControlTask {
    context: CommandContext,
    cmd_tx: CommandSink,
    cmd_rx: ServiceSource<ApiRequest, ApiResponse>,
}

pub fn create_task(
    config: OffboardConfig,
    telemetry_config: TelemetryConfig,
    services: cs_bridge::ServiceSink,
    telemetry: watch::Receiver<Telemetry>,
    frames: Arc<TransformBuffer>,
    setpoint: SetpointHandle,
) -> ControlTask {
    let (cmd_tx, cmd_rx) = flume::bounded(64);

    ControlTask {
        context: CommandContext {
            config: Arc::new(config),
            telemetry_config: Arc::new(telemetry_config),
            services,
            telemetry,
            frames,
            setpoint,
            busy: Arc::new(AtomicBool::new(false)),
        },
        cmd_tx,
        cmd_rx,
    }
}

impl ControlTask {
    pub fn cmd(&self) -> CommandSink {
        self.cmd_tx.clone()
    }
}

#[async_trait]
impl Task for ControlTask {
    fn name(&self) -> &'static str {
        "offboard/control"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let Self {
            context, cmd_rx, ..
        } = *self;

        info!("ready");

        let loop_fut = async move {
            // handlers run detached so the next request can be answered
            // (with Busy) while one is suspended on a wait
            while let Ok((request, reply)) = cmd_rx.recv_async().await {
                let context = context.clone();
                tokio::spawn(async move {
                    let response = context.handle(request).await;
                    let _ = reply.send(Ok(response));
                });
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

impl CommandContext {
    async fn handle(&self, request: ApiRequest) -> ApiResponse {
        let raw = match request {
            ApiRequest::GetTelemetry(req) => {
                return ApiResponse::Telemetry(self.snapshot(req).await)
            }
            ApiRequest::Land => return respond(self.land().await),

            ApiRequest::Navigate(r) => Raw {
                x: r.x,
                y: r.y,
                z: r.z,
                yaw: r.yaw,
                yaw_rate: r.yaw_rate,
                speed: r.speed,
                frame_id: r.frame_id,
                auto_arm: r.auto_arm,
                ..Raw::zero(Kind::Navigate)
            },
            ApiRequest::NavigateGlobal(r) => Raw {
                lat: r.lat,
                lon: r.lon,
                z: r.z,
                yaw: r.yaw,
                yaw_rate: r.yaw_rate,
                speed: r.speed,
                frame_id: r.frame_id,
                auto_arm: r.auto_arm,
                ..Raw::zero(Kind::NavigateGlobal)
            },
            ApiRequest::SetPosition(r) => Raw {
                x: r.x,
                y: r.y,
                z: r.z,
                yaw: r.yaw,
                yaw_rate: r.yaw_rate,
                frame_id: r.frame_id,
                auto_arm: r.auto_arm,
                ..Raw::zero(Kind::Position)
            },
            ApiRequest::SetVelocity(r) => Raw {
                vx: r.vx,
                vy: r.vy,
                vz: r.vz,
                yaw: r.yaw,
                yaw_rate: r.yaw_rate,
                frame_id: r.frame_id,
                auto_arm: r.auto_arm,
                ..Raw::zero(Kind::Velocity)
            },
            ApiRequest::SetAttitude(r) => Raw {
                roll: r.roll,
                pitch: r.pitch,
                yaw: r.yaw,
                thrust: r.thrust,
                frame_id: r.frame_id,
                auto_arm: r.auto_arm,
                ..Raw::zero(Kind::Attitude)
            },
            ApiRequest::SetRates(r) => Raw {
                roll_rate: r.roll_rate,
                pitch_rate: r.pitch_rate,
                yaw_rate: r.yaw_rate,
                thrust: r.thrust,
                auto_arm: r.auto_arm,
                ..Raw::zero(Kind::Rates)
            },
        };

        respond(self.serve(raw).await)
    }

    /// Whole-command critical section: `busy` is held from acceptance
    /// until the response is decided.
    async fn serve(&self, raw: Raw) -> Result<(), CommandError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(CommandError::Busy);
        }
        let result = self.accept(raw).await;
        self.busy.store(false, Ordering::SeqCst);
        result
    }

    async fn accept(&self, raw: Raw) -> Result<(), CommandError> {
        let stamp = Utc::now();
        let config = &self.config;
        let tc = &self.telemetry_config;
        let telemetry = self.telemetry.borrow().clone();

        let state = telemetry
            .fresh_state(tc, stamp)
            .ok_or(CommandError::StateStale)?;
        if !state.connected {
            return Err(CommandError::NotConnected);
        }

        if matches!(
            raw.kind,
            Kind::Navigate | Kind::NavigateGlobal | Kind::Position | Kind::Velocity
        ) && telemetry.fresh_local_pose(tc, stamp).is_none()
        {
            return Err(CommandError::NoLocalPosition);
        }

        let mut speed = raw.speed as f64;
        if matches!(raw.kind, Kind::Navigate | Kind::NavigateGlobal) {
            if raw.speed < 0.0 {
                return Err(CommandError::BadArgument(format!(
                    "Navigate speed must be positive, {} passed",
                    raw.speed
                )));
            }
            if raw.speed == 0.0 {
                speed = config.default_speed as f64;
            }
        }

        if matches!(
            raw.kind,
            Kind::Navigate | Kind::NavigateGlobal | Kind::Position | Kind::Velocity
        ) {
            if raw.yaw_rate != 0.0 && !raw.yaw.is_nan() {
                return Err(CommandError::BadArgument(
                    "Yaw value should be NaN for setting yaw rate".to_owned(),
                ));
            }
            if raw.yaw.is_nan() && raw.yaw_rate.is_nan() {
                return Err(CommandError::BadArgument(
                    "Both yaw and yaw_rate cannot be NaN".to_owned(),
                ));
            }
        }

        let fix = match raw.kind {
            Kind::NavigateGlobal => Some(
                *telemetry
                    .fresh_global_fix(tc, stamp)
                    .ok_or(CommandError::NoGlobalFix)?,
            ),
            _ => None,
        };

        // empty frame_id means the local frame, and a configured alias may
        // redirect storage to another reference frame
        let frame_id = if raw.frame_id.is_empty() {
            config.local_frame.clone()
        } else {
            raw.frame_id.clone()
        };
        let reference_frame = config
            .reference_frames
            .get(&frame_id)
            .cloned()
            .unwrap_or_else(|| frame_id.clone());

        if raw.kind != Kind::Rates {
            for (target, source) in [
                (reference_frame.as_str(), frame_id.as_str()),
                (config.local_frame.as_str(), reference_frame.as_str()),
            ] {
                let available = self
                    .frames
                    .wait_for_transform(target, source, stamp, config.transform_timeout())
                    .await;
                if !available {
                    return Err(CommandError::TransformUnavailable {
                        target: target.to_owned(),
                        from_frame: source.to_owned(),
                    });
                }
            }
        }

        let (mut x, mut y) = (raw.x as f64, raw.y as f64);
        if let Some(fix) = &fix {
            let projected = geodesic::global_to_local(
                fix,
                raw.lat,
                raw.lon,
                &self.frames,
                &config.local_frame,
                &config.fcu_frame,
            )?;
            let in_caller = self
                .frames
                .transform_pose(&projected, &frame_id, Duration::ZERO)?;
            x = in_caller.position.x;
            y = in_caller.position.y;
        }

        let (policy, yaw_angle) = YawPolicy::classify(raw.yaw, raw.yaw_rate);

        let build_pose = |px: f64, py: f64, pz: f64| -> Result<StampedPose, CommandError> {
            let mut pose = StampedPose::new(frame_id.clone(), stamp);
            pose.position = Vector3::new(px, py, pz);
            if policy == YawPolicy::Absolute {
                pose.orientation =
                    quat_from_rpy(raw.roll as f64, raw.pitch as f64, yaw_angle as f64);
            }
            Ok(self
                .frames
                .transform_pose(&pose, &reference_frame, Duration::ZERO)?)
        };

        let setpoint = match raw.kind {
            Kind::Navigate | Kind::NavigateGlobal => {
                let start = telemetry
                    .fresh_local_pose(tc, stamp)
                    .ok_or(CommandError::NoLocalPosition)?
                    .clone();
                let nav = NavigateGoal {
                    start,
                    target: build_pose(x, y, raw.z as f64)?,
                    speed,
                    yaw: policy,
                };
                match raw.kind {
                    Kind::Navigate => ActiveSetpoint::Navigate(nav),
                    _ => ActiveSetpoint::NavigateGlobal {
                        nav,
                        latitude: raw.lat,
                        longitude: raw.lon,
                    },
                }
            }
            Kind::Position => ActiveSetpoint::Position {
                target: build_pose(x, y, raw.z as f64)?,
                yaw: policy,
            },
            Kind::Velocity => {
                let vector = StampedVector {
                    frame_id: frame_id.clone(),
                    stamp,
                    vector: Vector3::new(raw.vx as f64, raw.vy as f64, raw.vz as f64),
                };
                ActiveSetpoint::Velocity {
                    target: self
                        .frames
                        .transform_vector(&vector, &reference_frame, Duration::ZERO)?,
                    yaw_reference: build_pose(0.0, 0.0, 0.0)?,
                    yaw: policy,
                }
            }
            Kind::Attitude => ActiveSetpoint::Attitude {
                pose: build_pose(0.0, 0.0, 0.0)?,
                thrust: raw.thrust,
            },
            Kind::Rates => ActiveSetpoint::Rates {
                rates: Vector3::new(
                    raw.roll_rate as f64,
                    raw.pitch_rate as f64,
                    raw.yaw_rate as f64,
                ),
                thrust: raw.thrust,
            },
        };

        // commit, then let the stream lead the mode/arm sequence
        self.setpoint.set_wait_armed(raw.auto_arm);
        let since = self.setpoint.published_count();
        self.setpoint.commit(setpoint);
        if !self
            .setpoint
            .wait_for_publish(since, Duration::from_secs(1))
            .await
        {
            debug!("publisher has not confirmed the warm start");
        }

        if raw.auto_arm {
            let sequenced = sequencer::offboard_and_arm(
                &self.services,
                &self.telemetry,
                config.offboard_timeout(),
                config.arming_timeout(),
            )
            .await;
            if let Err(err) = sequenced {
                self.setpoint.clear();
                return Err(err);
            }
            self.setpoint.set_wait_armed(false);
        } else {
            // state may have advanced during the transform waits
            let state = self
                .telemetry
                .borrow()
                .state
                .clone()
                .ok_or(CommandError::StateStale)?;
            if state.mode != "OFFBOARD" {
                self.setpoint.clear();
                return Err(CommandError::NotOffboard);
            }
            if !state.armed {
                self.setpoint.clear();
                return Err(CommandError::NotArmed);
            }
        }

        Ok(())
    }

    async fn land(&self) -> Result<(), CommandError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(CommandError::Busy);
        }
        let result = self.land_locked().await;
        self.busy.store(false, Ordering::SeqCst);
        result
    }

    async fn land_locked(&self) -> Result<(), CommandError> {
        let stamp = Utc::now();
        let telemetry = self.telemetry.borrow().clone();

        let state = telemetry
            .fresh_state(&self.telemetry_config, stamp)
            .ok_or(CommandError::StateStale)?;
        if !state.connected {
            return Err(CommandError::NotConnected);
        }
        if self.config.land_only_in_offboard && state.mode != "OFFBOARD" {
            return Err(CommandError::NotOffboard);
        }

        sequencer::await_land(&self.services, &self.telemetry, self.config.land_timeout())
            .await?;

        // the landing autopilot owns the vehicle now; stop the stream
        self.setpoint.clear();
        Ok(())
    }

    /// One coherent reading in the requested frame. Sections whose source
    /// is stale or untransformable stay NaN; the call itself always
    /// answers.
    async fn snapshot(&self, request: GetTelemetryRequest) -> TelemetrySnapshot {
        let stamp = Utc::now();
        let tc = &self.telemetry_config;
        let frame_id = if request.frame_id.is_empty() {
            self.config.local_frame.clone()
        } else {
            request.frame_id
        };

        let mut out = TelemetrySnapshot::empty(frame_id.clone());
        let telemetry = self.telemetry.borrow().clone();

        if let Some(state) = telemetry.fresh_state(tc, stamp) {
            out.connected = state.connected;
            out.armed = state.armed;
            out.mode = state.mode.clone();
        }

        self.frames
            .wait_for_transform(
                &frame_id,
                &self.config.local_frame,
                stamp,
                self.config.telemetry_transform_timeout(),
            )
            .await;

        if let Some(pose) = telemetry.fresh_local_pose(tc, stamp) {
            if let Ok(pose) = self.frames.transform_pose(pose, &frame_id, Duration::ZERO) {
                out.x = pose.position.x as f32;
                out.y = pose.position.y as f32;
                out.z = pose.position.z as f32;
                let (roll, pitch, yaw) = pose.orientation.euler_angles();
                out.roll = roll as f32;
                out.pitch = pitch as f32;
                out.yaw = yaw as f32;
            }
        }

        if let Some(velocity) = telemetry.fresh_velocity(tc, stamp) {
            if let Ok(linear) =
                self.frames
                    .transform_vector(&velocity.linear, &frame_id, Duration::ZERO)
            {
                out.vx = linear.vector.x as f32;
                out.vy = linear.vector.y as f32;
                out.vz = linear.vector.z as f32;
            }
            // angular rates are reported in the body frame as-is
            out.roll_rate = velocity.angular.x as f32;
            out.pitch_rate = velocity.angular.y as f32;
            out.yaw_rate = velocity.angular.z as f32;
        }

        if let Some(fix) = telemetry.fresh_global_fix(tc, stamp) {
            out.lat = fix.latitude as f32;
            out.lon = fix.longitude as f32;
            out.alt = fix.altitude as f32;
        }

        if let Some(battery) = telemetry.fresh_battery(tc, stamp) {
            out.voltage = battery.voltage;
            out.cell_voltage = battery.cell_voltage.unwrap_or(f32::NAN);
        }

        out
    }
}

fn respond(result: Result<(), CommandError>) -> ApiResponse {
    match result {
        Ok(()) => ApiResponse::Ack(Ack {
            success: true,
            message: String::new(),
        }),
        Err(err) => {
            info!("{}", err);
            ApiResponse::Ack(Ack {
                success: false,
                message: err.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{NavigateGlobalRequest, NavigateRequest, SetPositionRequest};
    use crate::publisher;
    use approx::assert_relative_eq;
    use cs_bridge::{ServiceAck, ServiceRequest, SetpointMessage};
    use cs_types::{AutopilotState, GeoFix};
    use nalgebra::Isometry3;

    struct Rig {
        context: CommandContext,
        telem_tx: watch::Sender<Telemetry>,
        frames: Arc<TransformBuffer>,
        out_rx: flume::Receiver<SetpointMessage>,
        cancel: CancellationToken,
    }

    impl Drop for Rig {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    fn telemetry(mode: &str, armed: bool) -> Telemetry {
        let now = Utc::now();
        let mut t = Telemetry::default();
        t.state = Some(AutopilotState {
            stamp: now,
            connected: true,
            armed,
            mode: mode.to_owned(),
        });
        t.local_pose = Some(StampedPose::new("map", now));
        t
    }

    fn rig(initial: Telemetry) -> Rig {
        rig_with(OffboardConfig::default(), initial)
    }

    fn rig_with(config: OffboardConfig, initial: Telemetry) -> Rig {
        let frames = Arc::new(TransformBuffer::default());
        let (telem_tx, telem_rx) = watch::channel(initial);
        let setpoint = SetpointHandle::new();
        let (out_tx, out_rx) = flume::bounded(256);
        let cancel = CancellationToken::new();

        let (srv_tx, srv_rx) =
            flume::bounded::<cs_client::ServiceCall<ServiceRequest, ServiceAck>>(16);
        tokio::spawn(async move {
            while let Ok((_, reply)) = srv_rx.recv_async().await {
                let _ = reply.send(Ok(ServiceAck { accepted: true }));
            }
        });

        let publisher = publisher::create_task(
            config.clone(),
            setpoint.clone(),
            frames.clone(),
            out_tx,
        );
        tokio::spawn(Box::new(publisher).run(cancel.clone()));

        let context = CommandContext {
            config: Arc::new(config),
            telemetry_config: Arc::new(TelemetryConfig::default()),
            services: srv_tx,
            telemetry: telem_rx,
            frames: frames.clone(),
            setpoint,
            busy: Arc::new(AtomicBool::new(false)),
        };

        Rig {
            context,
            telem_tx,
            frames,
            out_rx,
            cancel,
        }
    }

    fn navigate_request(x: f32, speed: f32) -> ApiRequest {
        ApiRequest::Navigate(NavigateRequest {
            x,
            y: 0.0,
            z: 0.0,
            yaw: 0.0,
            yaw_rate: 0.0,
            speed,
            frame_id: String::new(),
            auto_arm: false,
        })
    }

    fn success(response: &ApiResponse) -> bool {
        matches!(response, ApiResponse::Ack(ack) if ack.success)
    }

    fn message(response: &ApiResponse) -> &str {
        match response {
            ApiResponse::Ack(ack) => &ack.message,
            _ => panic!("expected an ack"),
        }
    }

    #[tokio::test]
    async fn navigate_installs_a_setpoint_and_streams() {
        let rig = rig(telemetry("OFFBOARD", true));

        let response = rig.context.handle(navigate_request(2.0, 1.0)).await;
        assert!(success(&response), "{:?}", response);

        let current = rig.context.setpoint.current().unwrap();
        assert!(matches!(current.setpoint, ActiveSetpoint::Navigate(_)));

        let first = rig.out_rx.recv_async().await.unwrap();
        assert!(matches!(first, SetpointMessage::Pose(_)));
    }

    #[tokio::test]
    async fn busy_commands_do_not_disturb_the_current_setpoint() {
        let rig = rig(telemetry("OFFBOARD", true));

        let response = rig.context.handle(navigate_request(2.0, 1.0)).await;
        assert!(success(&response));
        let installed = rig.context.setpoint.current().unwrap();

        rig.context.busy.store(true, Ordering::SeqCst);
        let rejected = rig
            .context
            .handle(ApiRequest::SetPosition(SetPositionRequest {
                x: 9.0,
                y: 9.0,
                z: 9.0,
                yaw: 0.0,
                yaw_rate: 0.0,
                frame_id: String::new(),
                auto_arm: false,
            }))
            .await;
        rig.context.busy.store(false, Ordering::SeqCst);

        assert!(!success(&rejected));
        assert_eq!(message(&rejected), "Busy");
        assert_eq!(rig.context.setpoint.current().unwrap(), installed);
    }

    #[tokio::test]
    async fn negative_speed_is_a_bad_argument() {
        let rig = rig(telemetry("OFFBOARD", true));
        let response = rig.context.handle(navigate_request(2.0, -1.0)).await;
        assert!(!success(&response));
        assert!(message(&response).contains("must be positive"));
        assert!(rig.context.setpoint.current().is_none());
    }

    #[tokio::test]
    async fn conflicting_yaw_inputs_are_rejected() {
        let rig = rig(telemetry("OFFBOARD", true));

        let conflicting = ApiRequest::SetPosition(SetPositionRequest {
            x: 0.0,
            y: 0.0,
            z: 1.0,
            yaw: 1.0,
            yaw_rate: 0.5,
            frame_id: String::new(),
            auto_arm: false,
        });
        let response = rig.context.handle(conflicting).await;
        assert_eq!(
            message(&response),
            "Yaw value should be NaN for setting yaw rate"
        );

        let both_nan = ApiRequest::SetPosition(SetPositionRequest {
            x: 0.0,
            y: 0.0,
            z: 1.0,
            yaw: f32::NAN,
            yaw_rate: f32::NAN,
            frame_id: String::new(),
            auto_arm: false,
        });
        let response = rig.context.handle(both_nan).await;
        assert_eq!(message(&response), "Both yaw and yaw_rate cannot be NaN");
    }

    #[tokio::test]
    async fn stale_local_pose_rejects_position_commands() {
        let mut initial = telemetry("OFFBOARD", true);
        initial.local_pose.as_mut().unwrap().stamp = Utc::now() - chrono::Duration::seconds(30);
        let rig = rig(initial);

        let response = rig
            .context
            .handle(ApiRequest::SetPosition(SetPositionRequest {
                x: 0.0,
                y: 0.0,
                z: 1.0,
                yaw: 0.0,
                yaw_rate: 0.0,
                frame_id: String::new(),
                auto_arm: false,
            }))
            .await;
        assert!(!success(&response));
        assert_eq!(message(&response), "No local position");
        assert!(rig.context.setpoint.current().is_none());
    }

    #[tokio::test]
    async fn stale_state_fails_closed() {
        let mut stale = telemetry("OFFBOARD", true);
        stale.state.as_mut().unwrap().stamp = Utc::now() - chrono::Duration::seconds(30);
        let rig = rig(stale);

        let response = rig.context.handle(navigate_request(1.0, 1.0)).await;
        assert!(message(&response).contains("State timeout"));
    }

    #[tokio::test]
    async fn manual_mode_without_auto_arm_clears_the_setpoint() {
        let rig = rig(telemetry("POSCTL", true));

        let response = rig.context.handle(navigate_request(1.0, 1.0)).await;
        assert!(!success(&response));
        assert!(message(&response).contains("not in OFFBOARD"));
        assert!(rig.context.setpoint.current().is_none());
    }

    #[tokio::test]
    async fn auto_arm_sequences_and_releases_the_gate() {
        let rig = rig(telemetry("POSCTL", false));

        let telem_tx = rig.telem_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            telem_tx.send(telemetry("OFFBOARD", false)).unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            telem_tx.send(telemetry("OFFBOARD", true)).unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let request = ApiRequest::Navigate(NavigateRequest {
            x: 2.0,
            y: 0.0,
            z: 0.0,
            yaw: 0.0,
            yaw_rate: 0.0,
            speed: 1.0,
            frame_id: String::new(),
            auto_arm: true,
        });
        let response = rig.context.handle(request).await;
        assert!(success(&response), "{:?}", response);
        assert!(!rig.context.setpoint.wait_armed());
        assert!(rig.context.setpoint.current().is_some());
    }

    #[tokio::test]
    async fn navigate_global_projects_the_fix_eastward() {
        let mut initial = telemetry("OFFBOARD", true);
        initial.global_fix = Some(GeoFix {
            stamp: Utc::now(),
            latitude: 55.7558,
            longitude: 37.6173,
            altitude: 150.0,
        });
        let rig = rig(initial);
        rig.frames
            .set_static("map", "base_link", Isometry3::identity());

        let request = ApiRequest::NavigateGlobal(NavigateGlobalRequest {
            lat: 55.7558,
            lon: 37.6183,
            z: 5.0,
            yaw: 0.0,
            yaw_rate: 0.0,
            speed: 1.0,
            frame_id: String::new(),
            auto_arm: false,
        });
        let response = rig.context.handle(request).await;
        assert!(success(&response), "{:?}", response);

        let current = rig.context.setpoint.current().unwrap();
        match current.setpoint {
            ActiveSetpoint::NavigateGlobal { nav, latitude, .. } => {
                assert_relative_eq!(latitude, 55.7558);
                assert_relative_eq!(nav.target.position.x, 62.8, epsilon = 0.3);
                assert!(nav.target.position.y.abs() < 0.1);
                assert_relative_eq!(nav.target.position.z, 5.0);
            }
            other => panic!("unexpected setpoint: {:?}", other),
        }
    }

    #[tokio::test]
    async fn aliased_frames_store_identical_targets() {
        let mut config = OffboardConfig::default();
        config
            .reference_frames
            .insert("terrain".to_owned(), "map".to_owned());
        let rig = rig_with(config, telemetry("OFFBOARD", true));
        rig.frames
            .set_static("map", "terrain", Isometry3::identity());

        let in_frame = |frame_id: &str| {
            ApiRequest::SetPosition(SetPositionRequest {
                x: 1.0,
                y: 2.0,
                z: 3.0,
                yaw: 0.5,
                yaw_rate: 0.0,
                frame_id: frame_id.to_owned(),
                auto_arm: false,
            })
        };

        assert!(success(&rig.context.handle(in_frame("terrain")).await));
        let aliased = rig.context.setpoint.current().unwrap();

        assert!(success(&rig.context.handle(in_frame("map")).await));
        let direct = rig.context.setpoint.current().unwrap();

        match (&aliased.setpoint, &direct.setpoint) {
            (
                ActiveSetpoint::Position { target: a, .. },
                ActiveSetpoint::Position { target: b, .. },
            ) => {
                assert_eq!(a.frame_id, "map");
                assert_eq!(a.frame_id, b.frame_id);
                assert_relative_eq!((a.position - b.position).norm(), 0.0);
            }
            other => panic!("unexpected setpoints: {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_frame_is_a_transform_error() {
        let mut rig_telemetry = telemetry("OFFBOARD", true);
        rig_telemetry.local_pose = Some(StampedPose::new("map", Utc::now()));
        let rig = rig(rig_telemetry);

        let request = ApiRequest::SetPosition(SetPositionRequest {
            x: 1.0,
            y: 0.0,
            z: 0.0,
            yaw: 0.0,
            yaw_rate: 0.0,
            frame_id: "aruco_7".to_owned(),
            auto_arm: false,
        });
        let response = rig.context.handle(request).await;
        assert!(message(&response).contains("can't transform"));
    }

    #[tokio::test]
    async fn land_requires_offboard_when_configured() {
        let rig = rig(telemetry("POSCTL", true));
        let response = rig.context.handle(ApiRequest::Land).await;
        assert!(!success(&response));
        assert!(message(&response).contains("not in OFFBOARD"));
    }

    #[tokio::test]
    async fn land_clears_the_setpoint_once_the_mode_takes() {
        let rig = rig(telemetry("OFFBOARD", true));

        let response = rig.context.handle(navigate_request(1.0, 1.0)).await;
        assert!(success(&response));
        assert!(rig.context.setpoint.current().is_some());

        let telem_tx = rig.telem_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            telem_tx.send(telemetry("AUTO.LAND", true)).unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let response = rig.context.handle(ApiRequest::Land).await;
        assert!(success(&response), "{:?}", response);
        assert!(rig.context.setpoint.current().is_none());
    }

    #[tokio::test]
    async fn snapshot_reports_in_the_requested_frame() {
        let now = Utc::now();
        let mut initial = telemetry("OFFBOARD", true);
        let mut pose = StampedPose::new("map", now);
        pose.position = Vector3::new(1.0, 2.0, 3.0);
        initial.local_pose = Some(pose);
        initial.velocity = Some(cs_telemetry::Velocity {
            linear: StampedVector {
                frame_id: "map".to_owned(),
                stamp: now,
                vector: Vector3::new(0.5, 0.0, 0.0),
            },
            angular: Vector3::new(0.0, 0.0, 0.1),
        });
        initial.battery = Some(cs_types::BatteryReading {
            stamp: now,
            voltage: 14.8,
            cell_voltage: Some(3.7),
        });
        let rig = rig(initial);

        let snapshot = rig
            .context
            .snapshot(GetTelemetryRequest {
                frame_id: String::new(),
            })
            .await;

        assert_eq!(snapshot.frame_id, "map");
        assert!(snapshot.connected && snapshot.armed);
        assert_eq!(snapshot.mode, "OFFBOARD");
        assert_relative_eq!(snapshot.x, 1.0);
        assert_relative_eq!(snapshot.vx, 0.5);
        assert_relative_eq!(snapshot.yaw_rate, 0.1);
        assert_relative_eq!(snapshot.voltage, 14.8);
        // no global fix cached: the section stays NaN
        assert!(snapshot.lat.is_nan());
    }
}
