//! Bridge one ISO-TP connection to TCP: PDUs travel over the socket as `<HEXSTRING>` frames.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;

use can_frame_io::Id;
use can_tp::{PaddingCheck, Progress, RxStorage, TpConfig, TpNode, st_min_to_duration};
use isotp_tools::bridge::{PduScanner, encode_bridge_pdu};
use isotp_tools::canid::parse_can_id;
use isotp_tools::opts::{
    ExtAddrPair, LinkLayerOpts, PaddingPair, parse_ext_addr, parse_hex_u8, parse_link_layer,
    parse_nanos, parse_pad_check, parse_padding,
};
use isotp_tools::shared::split_shared;

/// PDUs above 4095 bytes are allowed per ISO 15765-2:2015.
const MAX_PDU: usize = 6000;

const SEND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser, Clone)]
#[command(version, about = "Bridge an ISO-TP connection to a TCP socket (<HEXSTRING> framing)")]
struct Cli {
    /// Local TCP port for the server.
    #[arg(short = 'l', value_name = "port")]
    port: u16,

    /// Source can_id (frames this endpoint transmits). Use 8 digits for extended IDs.
    #[arg(short = 's', value_name = "can_id", value_parser = parse_can_id)]
    src: Id,

    /// Destination can_id (frames this endpoint expects). Use 8 digits for extended IDs.
    #[arg(short = 'd', value_name = "can_id", value_parser = parse_can_id)]
    dst: Id,

    /// Extended addressing, optionally with a separate rx address (addr[:rxaddr], hex).
    #[arg(short = 'x', value_name = "addr", value_parser = parse_ext_addr)]
    ext_addr: Option<ExtAddrPair>,

    /// Set and enable tx/rx padding bytes ([tx]:[rx], hex).
    #[arg(short = 'p', value_name = "pad", value_parser = parse_padding)]
    padding: Option<PaddingPair>,

    /// Check rx padding for (l)ength, (c)ontent or (a)ll.
    #[arg(short = 'P', value_name = "mode", value_parser = parse_pad_check)]
    pad_check: Option<PaddingCheck>,

    /// Blocksize advertised in flow control (hex, 0 = off).
    #[arg(short = 'b', value_name = "bs", value_parser = parse_hex_u8)]
    block_size: Option<u8>,

    /// STmin advertised in flow control, raw byte value (hex).
    #[arg(short = 'm', value_name = "val", value_parser = parse_hex_u8)]
    st_min: Option<u8>,

    /// Max wait frame transmissions tolerated (hex).
    #[arg(short = 'w', value_name = "num", value_parser = parse_hex_u8)]
    wft_max: Option<u8>,

    /// Frame transmit time in nanoseconds, honoured as a gap between frames.
    #[arg(short = 't', value_name = "time ns", value_parser = parse_nanos)]
    frame_txtime: Option<Duration>,

    /// Link layer options for CAN FD (mtu:tx_dl:tx_flags).
    #[arg(short = 'L', value_name = "ll", value_parser = parse_link_layer)]
    link_layer: Option<LinkLayerOpts>,

    /// Print the bridged PDUs.
    #[arg(short = 'v')]
    verbose: bool,

    /// CAN interface (e.g. can0, vcan0).
    interface: String,
}

fn build_config(cli: &Cli) -> Result<TpConfig> {
    let mut cfg = TpConfig {
        tx_id: cli.src,
        rx_id: cli.dst,
        max_pdu_len: MAX_PDU,
        ..TpConfig::default()
    };
    if let Some(ext) = cli.ext_addr {
        cfg.tx_addr = Some(ext.tx);
        cfg.rx_addr = Some(ext.rx.unwrap_or(ext.tx));
    }
    if let Some(pad) = cli.padding {
        cfg.tx_padding = pad.tx;
        cfg.rx_padding = pad.rx;
    }
    if let Some(check) = cli.pad_check {
        cfg.padding_check = check;
    }
    if let Some(bs) = cli.block_size {
        cfg.block_size = bs;
    }
    if let Some(raw) = cli.st_min {
        cfg.st_min = st_min_to_duration(raw).unwrap_or(Duration::from_millis(0x7F));
    }
    if let Some(wft) = cli.wft_max {
        cfg.wft_max = wft;
    }
    if let Some(gap) = cli.frame_txtime {
        cfg.n_cs = gap;
    }
    if let Some(ll) = cli.link_layer {
        if ll.tx_dl != 0 {
            if !(8..=64).contains(&ll.tx_dl) {
                bail!("link layer tx_dl must be within 8..=64");
            }
            cfg.frame_len = ll.tx_dl as usize;
        }
    }
    Ok(cfg)
}

/// Bridge one TCP connection to one ISO-TP endpoint until either side drops.
fn serve_connection(cli: &Cli, mut stream: TcpStream) -> Result<()> {
    let cfg = build_config(cli)?;
    // Reads poll with a short timeout so the CAN side stays serviced; writes stay blocking so
    // bridged PDUs are never cut short.
    stream
        .set_read_timeout(Some(Duration::from_millis(1)))
        .context("tcp read timeout")?;

    let can = can_tp_socketcan::SocketCanFd::open(&cli.interface)
        .with_context(|| format!("open CAN interface {}", cli.interface))?;
    let (tx, rx) = split_shared(can);
    let mut node = TpNode::with_std_clock(tx, rx, cfg, RxStorage::Owned(vec![0u8; MAX_PDU]))
        .map_err(|err| anyhow::anyhow!("invalid ISO-TP configuration: {err}"))?;

    let mut scanner = PduScanner::new(MAX_PDU);
    let mut tcp_buf = [0u8; 4096];

    loop {
        let now = Instant::now();
        let mut idle = true;

        // CAN -> TCP
        let mut inbound: Option<Vec<u8>> = None;
        match node.poll_recv(now, &mut |data| inbound = Some(data.to_vec())) {
            Ok(Progress::WouldBlock) => {}
            Ok(_) => idle = false,
            Err(err) => {
                // One broken transfer does not take the bridge down.
                log::error!("isotp receive error: {err}");
            }
        }
        if let Some(pdu) = inbound {
            let text = encode_bridge_pdu(&pdu);
            if cli.verbose {
                print!("CAN>TCP {text}");
            }
            stream
                .write_all(text.as_bytes())
                .context("write to tcp socket")?;
        }

        // TCP -> CAN
        match stream.read(&mut tcp_buf) {
            Ok(0) => return Ok(()),
            Ok(n) => {
                idle = false;
                for pdu in scanner.push_slice(&tcp_buf[..n]) {
                    if cli.verbose {
                        println!("TCP>CAN <{}>", isotp_tools::hex::to_hex_compact(&pdu));
                    }
                    if let Err(err) = node.send(&pdu, SEND_TIMEOUT) {
                        log::error!("isotp send error: {err}");
                    }
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) => {}
            Err(err) => return Err(err).context("read from tcp socket"),
        }

        if idle {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    // Fail early on bad options instead of at the first connection.
    build_config(&cli)?;

    let listener = TcpListener::bind(("0.0.0.0", cli.port))
        .with_context(|| format!("bind TCP port {}", cli.port))?;
    log::info!("listening on port {}", cli.port);

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "<unknown>".into());
                log::info!("client connected: {peer}");
                let cli = cli.clone();
                thread::spawn(move || {
                    if let Err(err) = serve_connection(&cli, stream) {
                        log::error!("connection {peer} closed with error: {err:#}");
                    } else {
                        log::info!("client disconnected: {peer}");
                    }
                });
            }
            Err(err) => log::warn!("accept failed: {err}"),
        }
    }
    Ok(())
}
