//! Send one ISO-TP PDU; the payload is read from stdin as ASCII hex bytes.

use std::io::Read;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use embedded_can::Frame;

use can_frame_io::{Id, RxFrameIo, TxFrameIo};
use can_tp::{PaddingCheck, RxStorage, TpConfig, TpNode};
use isotp_tools::canid::parse_can_id;
use isotp_tools::hex::parse_hex_bytes;
use isotp_tools::opts::{
    ExtAddrPair, LinkLayerOpts, PaddingPair, parse_ext_addr, parse_link_layer, parse_nanos,
    parse_pad_check, parse_padding,
};
use isotp_tools::shared::split_shared;

/// Upper bound on one blocking transfer; protocol deadlines abort much earlier on dead peers.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(3600);

/// Large payloads are legal via the First Frame escape encoding (ISO 15765-2:2015).
const MAX_SEND_LEN: usize = 5000;

#[derive(Parser)]
#[command(version, about = "Send an ISO-TP PDU read from STDIN as space separated hex values")]
struct Cli {
    /// Source can_id (frames this tool transmits). Use 8 digits for extended IDs.
    #[arg(short = 's', value_name = "can_id", value_parser = parse_can_id)]
    src: Id,

    /// Destination can_id (frames this tool expects). Use 8 digits for extended IDs.
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

    /// Frame transmit time (N_As) in nanoseconds, honoured as a gap between frames.
    #[arg(short = 't', value_name = "time ns", value_parser = parse_nanos)]
    frame_txtime: Option<Duration>,

    /// Ignore received flow control and force this local tx STmin (nanoseconds).
    #[arg(short = 'f', value_name = "time ns", value_parser = parse_nanos)]
    force_tx_stmin: Option<Duration>,

    /// Send a fixed test PDU with this many bytes instead of reading STDIN.
    #[arg(short = 'D', value_name = "len")]
    datalen: Option<usize>,

    /// Link layer options for CAN FD (mtu:tx_dl:tx_flags).
    #[arg(short = 'L', value_name = "ll", value_parser = parse_link_layer)]
    link_layer: Option<LinkLayerOpts>,

    /// CAN interface (e.g. can0, vcan0).
    interface: String,
}

fn build_config(cli: &Cli) -> Result<TpConfig> {
    let mut cfg = TpConfig {
        tx_id: cli.src,
        rx_id: cli.dst,
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
    if let Some(gap) = cli.frame_txtime {
        cfg.n_cs = gap;
    }
    cfg.force_tx_st_min = cli.force_tx_stmin;
    if let Some(ll) = cli.link_layer {
        if ll.tx_dl != 0 {
            if !(8..=64).contains(&ll.tx_dl) {
                bail!("link layer tx_dl must be within 8..=64");
            }
            cfg.frame_len = ll.tx_dl as usize;
        }
    }
    cfg.max_pdu_len = MAX_SEND_LEN;
    Ok(cfg)
}

fn read_payload(cli: &Cli) -> Result<Vec<u8>> {
    if let Some(len) = cli.datalen {
        if len == 0 || len > MAX_SEND_LEN {
            bail!("fixed PDU length must be within 1..={MAX_SEND_LEN}");
        }
        // Same ramp pattern the classic tool generates.
        return Ok((0..len).map(|i| (((i % 0xFF) + 1) & 0xFF) as u8).collect());
    }
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("read payload from stdin")?;
    let payload = parse_hex_bytes(&input).map_err(|err| anyhow::anyhow!(err))?;
    if payload.len() > MAX_SEND_LEN {
        bail!("payload exceeds {MAX_SEND_LEN} bytes");
    }
    Ok(payload)
}

fn transfer<S, F>(can: S, cfg: TpConfig, payload: &[u8]) -> Result<()>
where
    S: TxFrameIo<Frame = F> + RxFrameIo<Frame = F, Error = <S as TxFrameIo>::Error>,
    F: Frame,
    <S as TxFrameIo>::Error: core::fmt::Debug,
{
    let (tx, rx) = split_shared(can);
    let storage = RxStorage::Owned(vec![0u8; cfg.max_pdu_len]);
    let mut node = TpNode::with_std_clock(tx, rx, cfg, storage)
        .map_err(|err| anyhow::anyhow!("invalid ISO-TP configuration: {err}"))?;
    node.send(payload, TRANSFER_TIMEOUT)
        .map_err(|err| anyhow::anyhow!("send failed: {err}"))
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let cfg = build_config(&cli)?;
    let payload = read_payload(&cli)?;

    if cfg.frame_len > 8 {
        let can = can_tp_socketcan::SocketCanFd::open(&cli.interface)
            .with_context(|| format!("open CAN FD interface {}", cli.interface))?;
        transfer(can, cfg, &payload)
    } else {
        let can = can_tp_socketcan::SocketCan::open(&cli.interface)
            .with_context(|| format!("open CAN interface {}", cli.interface))?;
        transfer(can, cfg, &payload)
    }
}
