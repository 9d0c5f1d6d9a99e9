use anyhow::Result;
use clap::Parser;
use mitsubishi2mqtt::{
    emulator::{serve, HeatPump},
    init_tracing,
    protocol::{
        codec::FrameCodec,
        packets::Settings,
        types::{Fan, Mode, Power, Temperature, Vane, WideVane},
    },
};
use tokio::net::TcpListener;
use tokio_util::codec::Framed;
use tracing::{info, warn};


/// Emulator for a Mitsubishi heat pump's CN105 port
///
/// Listens for a single controller at a time. Point the gateway at it with
/// a tcp+raw://host:port URL. Settings persist across connections.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address and port to listen on (host:port)
    listen: String,

    #[arg(long, default_value = "OFF")]
    power: Power,

    #[arg(long, default_value = "AUTO")]
    mode: Mode,

    #[arg(long, default_value = "22")]
    temp: Temperature,

    #[arg(long, default_value = "AUTO")]
    fan: Fan,

    #[arg(long, default_value = "AUTO")]
    vane: Vane,

    #[arg(long, default_value = "|")]
    dir: WideVane,

    #[arg(long, default_value = "21")]
    room_temp: Temperature,

    /// Let the room temperature wander
    #[arg(long)]
    drift: bool,
}


#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing("info");

    let settings = Settings {
        power: args.power,
        mode: args.mode,
        target_temp: args.temp,
        fan: args.fan,
        vane: args.vane,
        dir: args.dir,
    };

    let mut heat_pump = HeatPump::new(settings, args.room_temp)
        .with_drift(args.drift);

    let listener = TcpListener::bind(&args.listen).await?;
    info!(listen = %args.listen, "waiting for controller");

    loop {
        let (stream, addr) = listener.accept().await?;
        stream.set_nodelay(true)?;

        info!(%addr, "controller attached");

        let mut framed = Framed::new(stream, FrameCodec::new());

        match serve(&mut framed, &mut heat_pump).await {
            Ok(()) => info!(%addr, "controller detached"),
            Err(err) => warn!(%addr, %err, "controller connection failed"),
        }
    }
}
