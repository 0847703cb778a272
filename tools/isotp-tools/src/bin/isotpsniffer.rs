//! Passively reassemble and display the ISO-TP traffic of both directions of a connection.

use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;

use can_frame_io::{FilterConfig, Id, IdMaskFilter};
use can_tp::{Progress, RxStorage, TpConfig, TpNode};
use isotp_tools::canid::{parse_can_id, raw_id};
use isotp_tools::opts::parse_hex_u8;
use isotp_tools::shared::split_shared;
use isotp_tools::stamp::{StampMode, Stamper, parse_stamp_mode};

const ATTRESET: &str = "\x1b[0m";
const FGRED: &str = "\x1b[31m";
const FGBLUE: &str = "\x1b[34m";

const FORMAT_HEX: u8 = 1;
const FORMAT_ASCII: u8 = 2;
const FORMAT_DEFAULT: u8 = FORMAT_ASCII | FORMAT_HEX;

const MAX_PDU: usize = 5000;

#[derive(Parser)]
#[command(version, about = "Sniff both directions of an ISO-TP connection and print the PDUs")]
struct Cli {
    /// Source can_id. Use 8 digits for extended IDs.
    #[arg(short = 's', value_name = "can_id", value_parser = parse_can_id)]
    src: Id,

    /// Destination can_id. Use 8 digits for extended IDs.
    #[arg(short = 'd', value_name = "can_id", value_parser = parse_can_id)]
    dst: Id,

    /// Extended addressing byte (hex).
    #[arg(short = 'x', value_name = "addr", value_parser = parse_hex_u8)]
    ext: Option<u8>,

    /// Extended addressing rx address byte (hex).
    #[arg(short = 'X', value_name = "addr", value_parser = parse_hex_u8)]
    rx_ext: Option<u8>,

    /// Color mode.
    #[arg(short = 'c')]
    color: bool,

    /// Timestamp mode: (a)bsolute, (d)elta, (z)ero, (A)bsolute with date.
    #[arg(short = 't', value_name = "type", value_parser = parse_stamp_mode)]
    timestamp: Option<StampMode>,

    /// Output format: 1 = HEX, 2 = ASCII, 3 = HEX & ASCII.
    #[arg(short = 'f', value_name = "format", default_value_t = FORMAT_DEFAULT)]
    format: u8,

    /// Print only the first <len> bytes of each PDU.
    #[arg(short = 'h', value_name = "len", default_value_t = 0)]
    head: usize,

    /// CAN interface (e.g. can0, vcan0).
    interface: String,
}

fn open_observer(iface: &str, src: Id, dst: Id) -> Result<can_tp_socketcan::SocketCanFd> {
    let mut can = can_tp_socketcan::SocketCanFd::open(iface)
        .with_context(|| format!("open CAN interface {iface}"))?;
    can.set_filters(&[IdMaskFilter::exact(src), IdMaskFilter::exact(dst)])
        .context("set CAN acceptance filter")?;
    Ok(can)
}

/// Listen-only endpoint configuration for one direction of the connection.
fn listen_cfg(data_id: Id, other_id: Id, addr: Option<u8>) -> TpConfig {
    TpConfig {
        tx_id: other_id,
        rx_id: data_id,
        rx_addr: addr,
        listen_only: true,
        max_pdu_len: MAX_PDU,
        frame_len: 64,
        ..TpConfig::default()
    }
}

fn print_pdu(cli: &Cli, stamp: &str, data_id: Id, payload: &[u8], color: &str) -> Result<()> {
    let mut line = String::new();
    if cli.color {
        line.push_str(color);
    }
    line.push_str(stamp);
    line.push_str(&format!(
        " {}  {:03X}  [{}]  ",
        cli.interface,
        raw_id(data_id),
        payload.len()
    ));

    let shown = if cli.head > 0 {
        payload.len().min(cli.head)
    } else {
        payload.len()
    };
    let truncated = shown < payload.len();

    if cli.format & FORMAT_HEX != 0 {
        for b in &payload[..shown] {
            line.push_str(&format!("{b:02X} "));
        }
        if truncated {
            line.push_str("... ");
        }
        if cli.format & FORMAT_ASCII != 0 {
            line.push_str(" - ");
        }
    }
    if cli.format & FORMAT_ASCII != 0 {
        line.push('\'');
        for b in &payload[..shown] {
            line.push(if (0x20..0x7F).contains(b) {
                *b as char
            } else {
                '.'
            });
        }
        line.push('\'');
        if truncated {
            line.push_str(" ... ");
        }
    }
    if cli.color {
        line.push_str(ATTRESET);
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "{line}")
        .and_then(|()| out.flush())
        .context("write to stdout")
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    if cli.rx_ext.is_some() && cli.ext.is_none() {
        bail!("-X requires -x");
    }

    // One observer per direction, like the two listen-mode sockets of the classic tool. The
    // PDU data of the connection flows on `dst` frames; replies flow on `src` frames.
    let (tx_a, rx_a) = split_shared(open_observer(&cli.interface, cli.src, cli.dst)?);
    let (tx_b, rx_b) = split_shared(open_observer(&cli.interface, cli.src, cli.dst)?);

    let mut forward = TpNode::with_std_clock(
        tx_a,
        rx_a,
        listen_cfg(cli.dst, cli.src, cli.ext),
        RxStorage::Owned(vec![0u8; MAX_PDU]),
    )
    .map_err(|err| anyhow::anyhow!("invalid ISO-TP configuration: {err}"))?;
    let mut backward = TpNode::with_std_clock(
        tx_b,
        rx_b,
        listen_cfg(cli.src, cli.dst, cli.rx_ext.or(cli.ext)),
        RxStorage::Owned(vec![0u8; MAX_PDU]),
    )
    .map_err(|err| anyhow::anyhow!("invalid ISO-TP configuration: {err}"))?;

    let mut stamper = Stamper::new(cli.timestamp.unwrap_or_default());

    loop {
        let now = Instant::now();
        let mut idle = true;

        let mut done: Option<(Id, Vec<u8>, &str)> = None;
        match forward.poll_recv(now, &mut |data| {
            done = Some((cli.dst, data.to_vec(), FGBLUE));
        }) {
            Ok(Progress::WouldBlock) => {}
            Ok(_) => idle = false,
            Err(err) => log::warn!("sniffer ({}->) error: {err}", cli.interface),
        }
        if let Some((id, payload, color)) = done.take() {
            print_pdu(&cli, &stamper.prefix(), id, &payload, color)?;
        }

        match backward.poll_recv(now, &mut |data| {
            done = Some((cli.src, data.to_vec(), FGRED));
        }) {
            Ok(Progress::WouldBlock) => {}
            Ok(_) => idle = false,
            Err(err) => log::warn!("sniffer (<-{}) error: {err}", cli.interface),
        }
        if let Some((id, payload, color)) = done {
            print_pdu(&cli, &stamper.prefix(), id, &payload, color)?;
        }

        if idle {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
