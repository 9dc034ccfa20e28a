use crate::config::LinkSimulation;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::trace;

/// Abstraction for sending a datagram on a UDP socket, introduced to facilitate mocking the
///  I/O part away for testing. Errors are surfaced to the caller because the MTU probe logic
///  depends on distinguishing them.
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait SendSocket: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> std::io::Result<()>;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> std::io::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", datagram.len(), to);
        self.send_to(datagram, to).await.map(|_| ())
    }
}

/// All outgoing datagrams funnel through here. When link simulation is configured, loss,
///  duplication and latency are applied on this path; otherwise it is a plain forward to the
///  socket.
pub(crate) struct SendPipeline {
    socket: Arc<dyn SendSocket>,
    simulation: LinkSimulation,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>, simulation: LinkSimulation) -> SendPipeline {
        SendPipeline { socket, simulation }
    }

    pub async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> std::io::Result<()> {
        if !self.simulation.is_active() {
            return self.socket.send_datagram(to, datagram).await;
        }

        // decide the datagram's fate up front; the RNG must not be held across an await
        let (dropped, duplicated, latency) = {
            let mut rng = rand::thread_rng();
            let dropped = rng.gen::<f32>() < self.simulation.loss_chance;
            let duplicated = rng.gen::<f32>() < self.simulation.duplicate_chance;
            let latency = self.simulation.minimum_latency
                + self
                    .simulation
                    .random_latency
                    .mul_f32(rng.gen::<f32>());
            (dropped, duplicated, latency)
        };

        if dropped {
            trace!("simulation: dropping datagram to {:?}", to);
            return Ok(());
        }

        let copies = if duplicated { 2 } else { 1 };
        if latency.is_zero() {
            for _ in 0..copies {
                self.socket.send_datagram(to, datagram).await?;
            }
        } else {
            // send errors on the delayed path are swallowed; simulation is a debug facility
            let socket = self.socket.clone();
            let delayed: Vec<u8> = datagram.to_vec();
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                for _ in 0..copies {
                    let _ = socket.send_datagram(to, &delayed).await;
                }
            });
        }
        Ok(())
    }
}
