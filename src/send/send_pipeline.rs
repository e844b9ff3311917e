use crate::send::bundler::Bundle;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// This is an abstraction for sending a datagram on a UDP socket, introduced to facilitate
///  mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    /// returns `false` if sending failed
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> bool;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> bool {
        trace!("UDP socket: sending packet to {:?}", to);

        match self.send_to(packet_buf, to).await {
            Ok(_) => true,
            Err(e) => {
                error!("error sending UDP packet to {:?}: {}", to, e);
                false
            }
        }
    }
}

/// Sends bundles on an IPV4 and an IPV6 socket, picking the socket by the address family of
///  the destination
#[derive(Clone)]
pub struct SendPipeline {
    socket_v4: Arc<dyn SendSocket>,
    socket_v6: Arc<dyn SendSocket>,
}

impl SendPipeline {
    pub fn new(socket_v4: Arc<dyn SendSocket>, socket_v6: Arc<dyn SendSocket>) -> SendPipeline {
        SendPipeline { socket_v4, socket_v6 }
    }

    fn socket_for(&self, to: SocketAddr) -> &Arc<dyn SendSocket> {
        if to.is_ipv4() {
            &self.socket_v4
        }
        else {
            &self.socket_v6
        }
    }

    /// returns the number of failed sends
    pub async fn send_bundle(&self, bundle: &Bundle) -> usize {
        let mut failures = 0;
        for &to in &bundle.addresses {
            if !self.socket_for(to).do_send_packet(to, &bundle.message).await {
                failures += 1;
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mockall::predicate::eq;

    #[tokio::test]
    async fn test_send_bundle_picks_socket_by_address_family() {
        let v4: SocketAddr = "127.0.0.1:7400".parse().unwrap();
        let v6: SocketAddr = "[::1]:7400".parse().unwrap();
        let unreachable: SocketAddr = "127.0.0.2:7400".parse().unwrap();

        let mut socket_v4 = MockSendSocket::new();
        socket_v4.expect_do_send_packet()
            .with(eq(v4), eq(b"RTPS".as_slice()))
            .once()
            .return_const(true);
        socket_v4.expect_do_send_packet()
            .with(eq(unreachable), eq(b"RTPS".as_slice()))
            .once()
            .return_const(false);
        let mut socket_v6 = MockSendSocket::new();
        socket_v6.expect_do_send_packet()
            .with(eq(v6), eq(b"RTPS".as_slice()))
            .once()
            .return_const(true);

        let pipeline = SendPipeline::new(Arc::new(socket_v4), Arc::new(socket_v6));
        let failures = pipeline.send_bundle(&Bundle {
            addresses: vec![v4, v6, unreachable],
            message: Bytes::from_static(b"RTPS"),
        }).await;
        assert_eq!(failures, 1);
    }
}
