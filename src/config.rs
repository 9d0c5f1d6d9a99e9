use futures::{Sink, Stream};
use tokio::net::TcpStream;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::codec::Framed;
use tracing::info;
use url::Url;
use anyhow::{Result, Context, bail};

use crate::protocol::codec::{Frame, FrameCodec};


/// CN105 line speed.
pub const DEFAULT_BAUD_RATE: u32 = 2400;


pub enum Port {
    Serial(SerialStream),
    TcpRaw(TcpStream)
}


/// A framed byte stream to a heat pump: a `Stream` of received frames and a
/// `Sink` for frames to send.
pub trait PortStream: Stream<Item = std::io::Result<Frame>> + Sink<Frame, Error = std::io::Error> + Send + Unpin {}

impl<T> PortStream for T
where
    T: Stream<Item = std::io::Result<Frame>> + Sink<Frame, Error = std::io::Error> + Send + Unpin,
{}


/// Baud rate from a `?baud=` query parameter, if any.
fn baud_rate(url: &Url) -> Result<u32> {
    match url.query_pairs().find(|(key, _)| key == "baud") {
        Some((_, value)) => value.parse()
            .with_context(|| format!("invalid baud rate {value:?} in {url}")),
        None => Ok(DEFAULT_BAUD_RATE),
    }
}

impl Port {
    /// Open `serial:///dev/path[?baud=N]` or `tcp+raw://host:port`.
    pub async fn open(url: &Url) -> Result<Self> {
        match url.scheme() {
            "serial" => {
                let path = url.path();
                let baud = baud_rate(url)?;

                let port = tokio_serial::new(path, baud)
                    .data_bits(tokio_serial::DataBits::Eight)
                    .stop_bits(tokio_serial::StopBits::One)
                    .parity(tokio_serial::Parity::Even)
                    .open_native_async()
                    .with_context(|| format!("failed to open serial port {path}"))
                    ?;

                info!(path, baud, "opened serial port");

                Ok(Self::Serial(port))
            },
            "tcp+raw" => {
                let host = url.host_str()
                    .with_context(|| format!("tcp+raw requires a host to be specified in the url: {url}"))?;

                let port = url.port()
                    .with_context(|| format!("tcp+raw requires a port number to be specified in the url: {url}"))?;

                let stream = TcpStream::connect((host, port)).await
                    .with_context(|| format!("failed to open tcp+raw connection to: {url}"))?;

                stream.set_nodelay(true)?;

                info!(host, port, "opened tcp+raw connection");

                Ok(Self::TcpRaw(stream))
            },
            other => {
                bail!("url scheme {other} not supported");
            }
        }
    }

    pub fn framed(self) -> Box<dyn PortStream> {
        match self {
            Port::Serial(port) => {
                Box::new(Framed::new(port, FrameCodec::new()))
            },
            Port::TcpRaw(stream) => {
                Box::new(Framed::new(stream, FrameCodec::new()))
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_rate_from_query() {
        let url = Url::parse("serial:///dev/ttyUSB0").unwrap();
        assert_eq!(baud_rate(&url).unwrap(), DEFAULT_BAUD_RATE);
        assert_eq!(url.path(), "/dev/ttyUSB0");

        let url = Url::parse("serial:///dev/ttyAMA0?baud=4800").unwrap();
        assert_eq!(baud_rate(&url).unwrap(), 4800);

        let url = Url::parse("serial:///dev/ttyAMA0?baud=fast").unwrap();
        assert!(baud_rate(&url).is_err());
    }

    #[tokio::test]
    async fn unsupported_scheme() {
        let url = Url::parse("udp://localhost:1234").unwrap();
        assert!(Port::open(&url).await.is_err());
    }
}
