use async_trait::async_trait;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A long-running unit of the system. Tasks are created up front, spawned
/// together, and wind down when the shared token is cancelled.
#[async_trait]
pub trait Task {
    fn name(&self) -> &'static str;

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// A request paired with the channel its response travels back on.
pub type ServiceCall<Req, Res> = (Req, oneshot::Sender<anyhow::Result<Res>>);
pub type ServiceSink<Req, Res> = flume::Sender<ServiceCall<Req, Res>>;
pub type ServiceSource<Req, Res> = flume::Receiver<ServiceCall<Req, Res>>;

/// Round-trip helper for the calling side of a service channel.
#[async_trait]
pub trait CallService {
    type Request;
    type Response;

    async fn call(&self, request: Self::Request) -> anyhow::Result<Self::Response>;
}

#[async_trait]
impl<Req: Send, Res: Send> CallService for ServiceSink<Req, Res> {
    type Request = Req;
    type Response = Res;

    async fn call(&self, request: Self::Request) -> anyhow::Result<Self::Response> {
        let (tx, rx) = oneshot::channel();
        if self.send_async((request, tx)).await.is_err() {
            anyhow::bail!("service is not running");
        }
        rx.await?
    }
}
