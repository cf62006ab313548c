//! Network utilities shared by the instance listener, dispatcher, and
//! tunnel endpoints: socket tuning and the raw byte-copy relay loop.

use crate::Result;
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::buffer;

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
    let _ = sock.set_reuse_address(true);
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let _ = sock.set_reuse_port(true);
}

/// Copy data between two streams bidirectionally until either side hits EOF.
pub async fn copy_bidirectional<A, B>(a: &mut A, b: &mut B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    buffer::greedy_copy_bidirectional(a, b).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn configure_tcp_stream_does_not_panic_on_a_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
        configure_tcp_stream(&accepted.unwrap().0);
        configure_tcp_stream(&connected.unwrap());
    }
}
