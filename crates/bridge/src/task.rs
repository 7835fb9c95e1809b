use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use nalgebra::{UnitQuaternion, Vector3};
use tokio::select;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::*;

use cs_client::{ServiceSource, Task};
use cs_types::{
    quat_from_rpy, AutopilotState, BatteryReading, GeoFix, StampedPose, StampedVector, StatusText,
};
use mavlink::common::{self, MavMessage};

use crate::convert::{swap_attitude, swap_body_rates, swap_ned_enu, swap_yaw};
use crate::interface::{AutopilotInterface, AutopilotSender};
use crate::px4;
use crate::setpoint::SetpointMessage;
use crate::{AutopilotEvent, BridgeConfig, ServiceAck, ServiceRequest};

pub struct BridgeTask {
    config: BridgeConfig,
    local_frame: String,
    evt_tx: flume::Sender<AutopilotEvent>,
    evt_rx: flume::Receiver<AutopilotEvent>,
    spt_tx: flume::Sender<SetpointMessage>,
    spt_rx: flume::Receiver<SetpointMessage>,
    srv_tx: crate::ServiceSink,
    srv_rx: ServiceSource<ServiceRequest, ServiceAck>,
}

pub fn create_task(config: BridgeConfig, local_frame: impl Into<String>) -> BridgeTask {
    let (evt_tx, evt_rx) = flume::bounded(256);
    let (spt_tx, spt_rx) = flume::bounded(256);
    let (srv_tx, srv_rx) = flume::bounded(16);

    BridgeTask {
        config,
        local_frame: local_frame.into(),
        evt_tx,
        evt_rx,
        spt_tx,
        spt_rx,
        srv_tx,
        srv_rx,
    }
}

impl BridgeTask {
    pub fn events(&self) -> flume::Receiver<AutopilotEvent> {
        self.evt_rx.clone()
    }

    pub fn setpoints(&self) -> flume::Sender<SetpointMessage> {
        self.spt_tx.clone()
    }

    pub fn services(&self) -> crate::ServiceSink {
        self.srv_tx.clone()
    }
}

/// An in-flight command service call, resolved by ack or deadline.
struct Pending {
    command: common::MavCmd,
    deadline: tokio::time::Instant,
    reply: oneshot::Sender<anyhow::Result<ServiceAck>>,
}

#[async_trait]
impl Task for BridgeTask {
    fn name(&self) -> &'static str {
        "bridge"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let Self {
            config,
            local_frame,
            evt_tx,
            spt_rx,
            srv_rx,
            ..
        } = *self;

        let loop_fut = async move {
            let mut interface = AutopilotInterface::connect(config.address).await?;
            let sender = interface.sender();
            let ack_timeout = Duration::from_secs_f64(config.ack_timeout);

            let mut attitude: Option<(UnitQuaternion<f64>, Vector3<f64>)> = None;
            let mut thrust: f32 = 0.0;
            let mut target = (1u8, 1u8);
            let mut pending: Option<Pending> = None;

            let mut heartbeat = tokio::time::interval(Duration::from_secs(1));

            loop {
                let ack_deadline = pending
                    .as_ref()
                    .map(|p| p.deadline)
                    .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

                select! {
                    incoming = interface.recv() => {
                        let (header, message) = incoming?;

                        if let MavMessage::HEARTBEAT(data) = &message {
                            if data.autopilot != common::MavAutopilot::MAV_AUTOPILOT_INVALID {
                                target = (header.system_id, header.component_id);
                            }
                        }

                        if let MavMessage::COMMAND_ACK(data) = &message {
                            let acked = pending
                                .as_ref()
                                .map_or(false, |p| p.command == data.command);
                            if let Some(p) = acked.then(|| pending.take()).flatten() {
                                let accepted = matches!(
                                    data.result,
                                    common::MavResult::MAV_RESULT_ACCEPTED
                                        | common::MavResult::MAV_RESULT_IN_PROGRESS
                                );
                                debug!("{:?} acknowledged, accepted={}", data.command, accepted);
                                let _ = p.reply.send(Ok(ServiceAck { accepted }));
                            }
                        }

                        for event in decode(&message, &local_frame, &mut attitude) {
                            let _ = evt_tx.send(event);
                        }
                    }

                    outgoing = spt_rx.recv_async() => {
                        match outgoing {
                            Ok(SetpointMessage::Thrust(t)) => thrust = t.thrust,
                            Ok(message) => {
                                let encoded =
                                    encode(&message, sender.boot_ms(), target, thrust);
                                sender.send(encoded).await?;
                            }
                            Err(_) => break,
                        }
                    }

                    call = srv_rx.recv_async() => {
                        let Ok((request, reply)) = call else { break };

                        if pending.is_some() {
                            let _ = reply.send(Err(anyhow::anyhow!(
                                "another autopilot command is awaiting acknowledgement"
                            )));
                            continue;
                        }

                        match encode_service(&request, target) {
                            Ok((command, message)) => {
                                info!("autopilot command: {:?}", request);
                                sender.send(message).await?;
                                pending = Some(Pending {
                                    command,
                                    deadline: tokio::time::Instant::now() + ack_timeout,
                                    reply,
                                });
                            }
                            Err(err) => {
                                let _ = reply.send(Err(err));
                            }
                        }
                    }

                    _ = heartbeat.tick() => {
                        sender.send(own_heartbeat()).await?;
                    }

                    _ = tokio::time::sleep_until(ack_deadline), if pending.is_some() => {
                        if let Some(p) = pending.take() {
                            warn!("{:?} was never acknowledged", p.command);
                            let _ = p.reply.send(Err(anyhow::anyhow!(
                                "timed out waiting for {:?} acknowledgement",
                                p.command
                            )));
                        }
                    }
                }
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

/// Telemetry events carried by one incoming message. ATTITUDE only updates
/// the running orientation; poses go out at position rate.
fn decode(
    message: &MavMessage,
    local_frame: &str,
    attitude: &mut Option<(UnitQuaternion<f64>, Vector3<f64>)>,
) -> Vec<AutopilotEvent> {
    let stamp = Utc::now();

    match message {
        MavMessage::HEARTBEAT(data) => {
            if data.autopilot == common::MavAutopilot::MAV_AUTOPILOT_INVALID {
                return vec![];
            }
            vec![AutopilotEvent::State(AutopilotState {
                stamp,
                connected: true,
                armed: data
                    .base_mode
                    .contains(common::MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED),
                mode: px4::mode_name(data.custom_mode),
            })]
        }

        MavMessage::ATTITUDE(data) => {
            let (roll, pitch, yaw) =
                swap_attitude(data.roll as f64, data.pitch as f64, data.yaw as f64);
            let rates = swap_body_rates(Vector3::new(
                data.rollspeed as f64,
                data.pitchspeed as f64,
                data.yawspeed as f64,
            ));
            *attitude = Some((quat_from_rpy(roll, pitch, yaw), rates));
            vec![]
        }

        MavMessage::LOCAL_POSITION_NED(data) => {
            let (orientation, angular) =
                (*attitude).unwrap_or((UnitQuaternion::identity(), Vector3::zeros()));

            let pose = StampedPose {
                frame_id: local_frame.to_owned(),
                stamp,
                position: swap_ned_enu(Vector3::new(
                    data.x as f64,
                    data.y as f64,
                    data.z as f64,
                )),
                orientation,
            };
            let linear = StampedVector {
                frame_id: local_frame.to_owned(),
                stamp,
                vector: swap_ned_enu(Vector3::new(
                    data.vx as f64,
                    data.vy as f64,
                    data.vz as f64,
                )),
            };
            vec![
                AutopilotEvent::LocalPose(pose),
                AutopilotEvent::Velocity { linear, angular },
            ]
        }

        MavMessage::GLOBAL_POSITION_INT(data) => vec![AutopilotEvent::GlobalFix(GeoFix {
            stamp,
            latitude: data.lat as f64 / 1e7,
            longitude: data.lon as f64 / 1e7,
            altitude: data.alt as f64 / 1e3,
        })],

        MavMessage::BATTERY_STATUS(data) => {
            let cells: Vec<f32> = data
                .voltages
                .iter()
                .filter(|&&v| v != 0 && v != u16::MAX)
                .map(|&v| v as f32 / 1000.0)
                .collect();
            if cells.is_empty() {
                return vec![];
            }
            vec![AutopilotEvent::Battery(BatteryReading {
                stamp,
                voltage: cells.iter().sum(),
                cell_voltage: cells.first().copied(),
            })]
        }

        MavMessage::STATUSTEXT(data) => {
            let text = String::from_utf8_lossy(&data.text)
                .trim_end_matches('\0')
                .to_owned();
            debug!("autopilot status: {}", text);
            vec![AutopilotEvent::Status(StatusText { stamp, text })]
        }

        _ => vec![],
    }
}

/// Wire encoding of an outgoing setpoint. `Thrust` never reaches here; the
/// run loop folds it into the next attitude frame.
fn encode(
    message: &SetpointMessage,
    boot_ms: u32,
    target: (u8, u8),
    thrust: f32,
) -> MavMessage {
    use common::PositionTargetTypemask as P;

    match message {
        SetpointMessage::Pose(pose) => {
            let ned = swap_ned_enu(pose.position);
            MavMessage::SET_POSITION_TARGET_LOCAL_NED(common::SET_POSITION_TARGET_LOCAL_NED_DATA {
                time_boot_ms: boot_ms,
                coordinate_frame: common::MavFrame::MAV_FRAME_LOCAL_NED,
                type_mask: P::POSITION_TARGET_TYPEMASK_VX_IGNORE
                    | P::POSITION_TARGET_TYPEMASK_VY_IGNORE
                    | P::POSITION_TARGET_TYPEMASK_VZ_IGNORE
                    | P::POSITION_TARGET_TYPEMASK_AX_IGNORE
                    | P::POSITION_TARGET_TYPEMASK_AY_IGNORE
                    | P::POSITION_TARGET_TYPEMASK_AZ_IGNORE
                    | P::POSITION_TARGET_TYPEMASK_YAW_RATE_IGNORE,
                x: ned.x as f32,
                y: ned.y as f32,
                z: ned.z as f32,
                vx: 0.0,
                vy: 0.0,
                vz: 0.0,
                afx: 0.0,
                afy: 0.0,
                afz: 0.0,
                yaw: swap_yaw(pose.yaw()) as f32,
                yaw_rate: 0.0,
                target_system: target.0,
                target_component: target.1,
            })
        }

        SetpointMessage::PositionRaw(t) => {
            let ned = swap_ned_enu(t.position);
            let vel = swap_ned_enu(t.velocity);
            MavMessage::SET_POSITION_TARGET_LOCAL_NED(common::SET_POSITION_TARGET_LOCAL_NED_DATA {
                time_boot_ms: boot_ms,
                coordinate_frame: common::MavFrame::MAV_FRAME_LOCAL_NED,
                type_mask: t.type_mask,
                x: ned.x as f32,
                y: ned.y as f32,
                z: ned.z as f32,
                vx: vel.x as f32,
                vy: vel.y as f32,
                vz: vel.z as f32,
                afx: 0.0,
                afy: 0.0,
                afz: 0.0,
                yaw: swap_yaw(t.yaw as f64) as f32,
                yaw_rate: -t.yaw_rate,
                target_system: target.0,
                target_component: target.1,
            })
        }

        SetpointMessage::AttitudePose(pose) => {
            let (roll, pitch, yaw) = pose.orientation.euler_angles();
            let (roll, pitch, yaw) = swap_attitude(roll, pitch, yaw);
            let q = quat_from_rpy(roll, pitch, yaw);
            MavMessage::SET_ATTITUDE_TARGET(common::SET_ATTITUDE_TARGET_DATA {
                time_boot_ms: boot_ms,
                q: [
                    q.w as f32,
                    q.i as f32,
                    q.j as f32,
                    q.k as f32,
                ],
                body_roll_rate: 0.0,
                body_pitch_rate: 0.0,
                body_yaw_rate: 0.0,
                thrust,
                type_mask: common::AttitudeTargetTypemask::ATTITUDE_TARGET_TYPEMASK_BODY_ROLL_RATE_IGNORE
                    | common::AttitudeTargetTypemask::ATTITUDE_TARGET_TYPEMASK_BODY_PITCH_RATE_IGNORE
                    | common::AttitudeTargetTypemask::ATTITUDE_TARGET_TYPEMASK_BODY_YAW_RATE_IGNORE,
                target_system: target.0,
                target_component: target.1,
            })
        }

        SetpointMessage::AttitudeRaw(t) => {
            let rates = swap_body_rates(t.body_rate);
            MavMessage::SET_ATTITUDE_TARGET(common::SET_ATTITUDE_TARGET_DATA {
                time_boot_ms: boot_ms,
                q: [1.0, 0.0, 0.0, 0.0],
                body_roll_rate: rates.x as f32,
                body_pitch_rate: rates.y as f32,
                body_yaw_rate: rates.z as f32,
                thrust: t.thrust,
                type_mask:
                    common::AttitudeTargetTypemask::ATTITUDE_TARGET_TYPEMASK_ATTITUDE_IGNORE,
                target_system: target.0,
                target_component: target.1,
            })
        }

        SetpointMessage::Thrust(t) => MavMessage::SET_ATTITUDE_TARGET(
            common::SET_ATTITUDE_TARGET_DATA {
                time_boot_ms: boot_ms,
                q: [1.0, 0.0, 0.0, 0.0],
                body_roll_rate: 0.0,
                body_pitch_rate: 0.0,
                body_yaw_rate: 0.0,
                thrust: t.thrust,
                type_mask:
                    common::AttitudeTargetTypemask::ATTITUDE_TARGET_TYPEMASK_ATTITUDE_IGNORE,
                target_system: target.0,
                target_component: target.1,
            },
        ),
    }
}

fn encode_service(
    request: &ServiceRequest,
    target: (u8, u8),
) -> anyhow::Result<(common::MavCmd, MavMessage)> {
    let (command, param1, param2, param3) = match request {
        ServiceRequest::Arm { value } => (
            common::MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            if *value { 1.0 } else { 0.0 },
            0.0,
            0.0,
        ),
        ServiceRequest::SetMode { custom_mode } => {
            let word = px4::custom_mode(custom_mode)
                .with_context(|| format!("unknown flight mode {:?}", custom_mode))?;
            (
                common::MavCmd::MAV_CMD_DO_SET_MODE,
                1.0, // custom mode enabled
                ((word >> 16) & 0xff) as f32,
                ((word >> 24) & 0xff) as f32,
            )
        }
    };

    let message = MavMessage::COMMAND_LONG(common::COMMAND_LONG_DATA {
        command,
        confirmation: 0,
        param1,
        param2,
        param3,
        param4: 0.0,
        param5: 0.0,
        param6: 0.0,
        param7: 0.0,
        target_system: target.0,
        target_component: target.1,
    });

    Ok((command, message))
}

fn own_heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(common::HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: common::MavType::MAV_TYPE_ONBOARD_CONTROLLER,
        autopilot: common::MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: common::MavModeFlag::empty(),
        system_status: common::MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn fcu_heartbeat(custom_mode: u32, armed: bool) -> MavMessage {
        let mut base_mode = common::MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED;
        if armed {
            base_mode |= common::MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED;
        }
        MavMessage::HEARTBEAT(common::HEARTBEAT_DATA {
            custom_mode,
            mavtype: common::MavType::MAV_TYPE_QUADROTOR,
            autopilot: common::MavAutopilot::MAV_AUTOPILOT_PX4,
            base_mode,
            system_status: common::MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        })
    }

    #[test]
    fn heartbeat_becomes_state() {
        let mut attitude = None;
        let word = px4::custom_mode("OFFBOARD").unwrap();
        let events = decode(&fcu_heartbeat(word, true), "map", &mut attitude);

        match events.as_slice() {
            [AutopilotEvent::State(state)] => {
                assert!(state.connected);
                assert!(state.armed);
                assert_eq!(state.mode, "OFFBOARD");
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn ground_station_heartbeats_are_ignored() {
        let mut attitude = None;
        let msg = MavMessage::HEARTBEAT(common::HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: common::MavType::MAV_TYPE_GCS,
            autopilot: common::MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: common::MavModeFlag::empty(),
            system_status: common::MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        });
        assert!(decode(&msg, "map", &mut attitude).is_empty());
    }

    #[test]
    fn local_position_converts_to_enu() {
        let mut attitude = None;
        let msg = MavMessage::LOCAL_POSITION_NED(common::LOCAL_POSITION_NED_DATA {
            time_boot_ms: 0,
            x: 1.0, // north
            y: 2.0, // east
            z: -3.0, // down
            vx: 0.5,
            vy: 0.0,
            vz: 0.0,
        });
        let events = decode(&msg, "map", &mut attitude);
        match events.as_slice() {
            [AutopilotEvent::LocalPose(pose), AutopilotEvent::Velocity { linear, .. }] => {
                assert_relative_eq!(pose.position.x, 2.0);
                assert_relative_eq!(pose.position.y, 1.0);
                assert_relative_eq!(pose.position.z, 3.0);
                assert_relative_eq!(linear.vector.y, 0.5);
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn battery_sums_cells() {
        let mut attitude = None;
        let mut voltages = [u16::MAX; 10];
        voltages[0] = 3700;
        voltages[1] = 3800;
        let msg = MavMessage::BATTERY_STATUS(common::BATTERY_STATUS_DATA {
            voltages,
            ..Default::default()
        });
        let events = decode(&msg, "map", &mut attitude);
        match events.as_slice() {
            [AutopilotEvent::Battery(b)] => {
                assert_relative_eq!(b.voltage, 7.5, epsilon = 1e-5);
                assert_relative_eq!(b.cell_voltage.unwrap(), 3.7, epsilon = 1e-5);
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn pose_setpoint_encodes_to_ned() {
        let mut pose = StampedPose::new("map", Utc::now());
        pose.position = Vector3::new(2.0, 1.0, 5.0); // east, north, up
        let encoded = encode(&SetpointMessage::Pose(pose), 42, (1, 1), 0.0);

        match encoded {
            MavMessage::SET_POSITION_TARGET_LOCAL_NED(data) => {
                assert_relative_eq!(data.x, 1.0); // north
                assert_relative_eq!(data.y, 2.0); // east
                assert_relative_eq!(data.z, -5.0); // down
                assert!(data
                    .type_mask
                    .contains(common::PositionTargetTypemask::POSITION_TARGET_TYPEMASK_VX_IGNORE));
                assert!(!data
                    .type_mask
                    .contains(common::PositionTargetTypemask::POSITION_TARGET_TYPEMASK_X_IGNORE));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn rates_setpoint_ignores_attitude() {
        let raw = crate::AttitudeTarget {
            stamp: Utc::now(),
            frame_id: "base_link".into(),
            type_mask: common::AttitudeTargetTypemask::ATTITUDE_TARGET_TYPEMASK_ATTITUDE_IGNORE,
            body_rate: Vector3::new(0.1, 0.2, 0.3),
            thrust: 0.6,
        };
        match encode(&SetpointMessage::AttitudeRaw(raw), 0, (1, 1), 0.0) {
            MavMessage::SET_ATTITUDE_TARGET(data) => {
                assert_relative_eq!(data.body_roll_rate, 0.1);
                assert_relative_eq!(data.body_pitch_rate, -0.2);
                assert_relative_eq!(data.body_yaw_rate, -0.3);
                assert_relative_eq!(data.thrust, 0.6);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
