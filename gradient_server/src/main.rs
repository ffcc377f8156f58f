use std::{env, fs, io};

use comms::{
    msg::{self, Command, Msg},
    specs::server::ServerSpec,
};
use log::{info, warn};
use tokio::{net::TcpListener, signal};

use gradient_server::service::ServerBuilder;

const DEFAULT_HOST: &str = "127.0.0.1";

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let addr = format!(
        "{}:{}",
        env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string()),
        env::var("PORT").map_err(io::Error::other)?,
    );

    let list = TcpListener::bind(&addr).await?;
    info!("listening at {addr}");

    let spec = match env::var("SERVER_SPEC") {
        Ok(path) => {
            info!("reading server spec from {path}");
            serde_json::from_slice(&fs::read(path)?)?
        }
        Err(_) => recv_spec(&list).await?,
    };

    let ServerSpec {
        workers, params, ..
    } = spec;
    let mut server = ServerBuilder::new().build(spec)?;

    for _ in 1..workers {
        let (stream, addr) = list.accept().await?;
        info!("worker connected from {addr}");

        let (rx, tx) = stream.into_split();
        let (rx, tx) = comms::channel(rx, tx);
        server.spawn(rx.with_frame_limit(msg::max_frame_len(params)), tx);
    }

    tokio::select! {
        _ = server.run() => info!("wrapping up, every worker disconnected"),
        _ = signal::ctrl_c() => info!("received SIGINT"),
    }

    Ok(())
}

/// Waits for the orchestrator to send the server's specification.
async fn recv_spec(list: &TcpListener) -> io::Result<ServerSpec> {
    let (stream, addr) = list.accept().await?;
    let (rx, tx) = stream.into_split();
    let (mut rx, _) = comms::channel(rx, tx);
    info!("orchestrator connected from {addr}");

    let mut rx_buf: Vec<u32> = Vec::new();
    loop {
        match rx.recv_into(&mut rx_buf).await {
            Ok(Msg::Control(Command::CreateServer(spec))) => return Ok(spec),
            Ok(msg) => warn!("expected CreateServer, got {msg:?}"),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => warn!("io error {e}"),
            Err(e) => return Err(e),
        }
    }
}
