//! HTTP surface for the control commands. A thin transport: every route
//! deserializes its body, forwards to the control task, and answers with
//! the `success`/`message` pair (or the telemetry snapshot).

use std::net::SocketAddr;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::*;
use warp::filters::BoxedFilter;
use warp::reply::Json;
use warp::Filter;

use cs_client::{CallService, Task};
use cs_offboard::{
    Ack, ApiRequest, ApiResponse, CommandSink, GetTelemetryRequest, NavigateGlobalRequest,
    NavigateRequest, SetAttitudeRequest, SetPositionRequest, SetRatesRequest,
    SetVelocityRequest,
};

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            address: default_address(),
        }
    }
}

fn default_address() -> SocketAddr {
    ([0, 0, 0, 0], 8080).into()
}

pub struct ServerTask {
    config: ServerConfig,
    cmd: CommandSink,
}

pub fn create_task(config: ServerConfig, cmd: CommandSink) -> ServerTask {
    ServerTask { config, cmd }
}

#[async_trait]
impl Task for ServerTask {
    fn name(&self) -> &'static str {
        "server"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        let Self { config, cmd } = *self;

        let (_, server) =
            warp::serve(api(cmd)).bind_with_graceful_shutdown(config.address, async move {
                cancel.cancelled().await;
            });

        info!("listening at {:?}", config.address);
        server.await;

        Ok(())
    }
}

fn api(cmd: CommandSink) -> BoxedFilter<(Json,)> {
    let online = warp::path!("api" / "online")
        .and(warp::get())
        .map(|| warp::reply::json(&"ok"))
        .boxed();

    let land = warp::path!("api" / "land")
        .and(warp::post())
        .then({
            let cmd = cmd.clone();
            move || dispatch(cmd.clone(), ApiRequest::Land)
        })
        .boxed();

    let telemetry_query = warp::path!("api" / "telemetry")
        .and(warp::get())
        .and(warp::query::<GetTelemetryRequest>())
        .then({
            let cmd = cmd.clone();
            move |request| dispatch(cmd.clone(), ApiRequest::GetTelemetry(request))
        })
        .boxed();

    online
        .or(command::<NavigateRequest>("navigate", &cmd, ApiRequest::Navigate))
        .unify()
        .or(command::<NavigateGlobalRequest>(
            "navigate_global",
            &cmd,
            ApiRequest::NavigateGlobal,
        ))
        .unify()
        .or(command::<SetPositionRequest>(
            "set_position",
            &cmd,
            ApiRequest::SetPosition,
        ))
        .unify()
        .or(command::<SetVelocityRequest>(
            "set_velocity",
            &cmd,
            ApiRequest::SetVelocity,
        ))
        .unify()
        .or(command::<SetAttitudeRequest>(
            "set_attitude",
            &cmd,
            ApiRequest::SetAttitude,
        ))
        .unify()
        .or(command::<SetRatesRequest>(
            "set_rates",
            &cmd,
            ApiRequest::SetRates,
        ))
        .unify()
        .or(command::<GetTelemetryRequest>(
            "get_telemetry",
            &cmd,
            ApiRequest::GetTelemetry,
        ))
        .unify()
        .or(land)
        .unify()
        .or(telemetry_query)
        .unify()
        .boxed()
}

/// POST /api/<name> with a JSON body of the request's fields.
fn command<R>(
    name: &'static str,
    cmd: &CommandSink,
    wrap: fn(R) -> ApiRequest,
) -> BoxedFilter<(Json,)>
where
    R: DeserializeOwned + Send + 'static,
{
    let cmd = cmd.clone();
    warp::path("api")
        .and(warp::path(name))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::json())
        .then(move |body: R| dispatch(cmd.clone(), wrap(body)))
        .boxed()
}

async fn dispatch(cmd: CommandSink, request: ApiRequest) -> Json {
    match cmd.call(request).await {
        Ok(response) => warp::reply::json(&response),
        Err(err) => warp::reply::json(&ApiResponse::Ack(Ack {
            success: false,
            message: format!("control is not available: {}", err),
        })),
    }
}
