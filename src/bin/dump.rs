use std::io::{self, Write};

use anyhow::Result;
use clap::Parser;
use colored::{ColoredString, Colorize};
use futures::{Stream, TryStreamExt};
use mitsubishi2mqtt::{
    config::Port,
    protocol::{codec::Frame, packets::Packet},
};
use tokio::time::Instant;
use url::Url;


/// Print every frame seen on a CN105 line
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL of the port to connect to
    ///
    /// either serial:///device/path[?baud=N] or tcp+raw://host:port URLs supported
    port: Url,
}


fn packet_desc(packet: &Packet) -> String {
    match packet {
        Packet::ConnectRequest => "Connect".to_string(),
        Packet::ConnectAck => "Connect Ack".to_string(),
        Packet::InfoRequest(info_type) => format!("Info Request: {info_type}"),
        Packet::StatusReport(s) => format!(
            "Settings: power {} mode {} temp {} fan {} vane {} dir {}",
            s.power, s.mode, s.target_temp, s.fan, s.vane, s.dir
        ),
        Packet::TemperatureReport { room_temp } => format!("Room Temperature: {room_temp}"),
        Packet::SetRequest(request) => {
            let s = &request.settings;
            format!(
                "Set {:02x}: power {} mode {} temp {} fan {} vane {} dir {}",
                request.changed.bits(), s.power, s.mode, s.target_temp, s.fan, s.vane, s.dir
            )
        },
        Packet::SetAck => "Set Ack".to_string(),
        Packet::Unknown { .. } => "Unknown".to_string(),
    }
}

/// Requests from the controller are 0x4x/0x5x, replies from the heat pump 0x6x/0x7x.
fn coloured(frame: &Frame, line: String) -> ColoredString {
    match frame.packet_type {
        0x40..=0x5f => line.on_cyan().bright_white(),
        0x60..=0x7f => line.on_green().bright_white(),
        _ => line.on_black(),
    }
}


/// Print frames until the port closes. A port error ends the dump with that error.
async fn dump<S>(frames: &mut S, out: &mut impl Write) -> Result<()> where
    S: Stream<Item = io::Result<Frame>> + Unpin
{
    let start_time = Instant::now();
    let mut last_frame_time: Option<Instant> = None;

    while let Some(frame) = frames.try_next().await? {
        let start_delta_ms = start_time.elapsed().as_millis();
        let last_frame_delta_ms = last_frame_time.map_or(0, |time| time.elapsed().as_millis());

        let packet = Packet::interpret(&frame);

        let packet_type = frame.packet_type;
        let payload = &frame.payload[..];
        let line = format!(
            "[{start_delta_ms:8}, {last_frame_delta_ms:8}] {packet_type:02x}: {desc: <60} {payload:02x?}",
            desc = packet_desc(&packet)
        );

        writeln!(out, "{}", coloured(&frame, line))?;

        last_frame_time = Some(Instant::now());
    }

    Ok(())
}


#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut framed = Port::open(&args.port).await?.framed();

    dump(&mut framed, &mut io::stdout().lock()).await
}


#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;

    #[tokio::test]
    async fn port_error_is_returned() {
        let ack = Packet::ConnectAck.to_frame().unwrap();
        let mut frames = stream::iter(vec![
            Ok(ack),
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "port went away")),
        ]);

        let mut out = Vec::new();
        let err = dump(&mut frames, &mut out).await.unwrap_err();

        assert_eq!(err.downcast_ref::<io::Error>().unwrap().kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 1);
    }

    #[tokio::test]
    async fn end_of_stream_is_clean() {
        let mut frames = stream::iter(Vec::<io::Result<Frame>>::new());

        let mut out = Vec::new();
        assert!(dump(&mut frames, &mut out).await.is_ok());
        assert!(out.is_empty());
    }
}
