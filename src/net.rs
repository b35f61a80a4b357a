use std::io;

use tokio::net::TcpStream;

/// Opens the outbound leg toward an origin server or a next-hop proxy.
/// Failure is reported to the caller and logged here; the caller decides
/// what to do with the client connection.
pub async fn connect(host: &str, port: u16) -> io::Result<TcpStream> {
    match TcpStream::connect((host, port)).await {
        Ok(stream) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Err(err) => {
            log::warn!("could not connect to host {host:?} port {port}: {err}");
            Err(err)
        }
    }
}
