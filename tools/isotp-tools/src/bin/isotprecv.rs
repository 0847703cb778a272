//! Receive ISO-TP PDUs and print them to stdout as space separated hex values.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use embedded_can::Frame;

use can_frame_io::{Id, RxFrameIo, TxFrameIo};
use can_tp::{
    PaddingCheck, RxStorage, TimeoutKind, TpConfig, TpError, TpNode, st_min_to_duration,
};
use isotp_tools::canid::parse_can_id;
use isotp_tools::hex::write_hex_line;
use isotp_tools::opts::{
    ExtAddrPair, LinkLayerOpts, PaddingPair, parse_ext_addr, parse_hex_u8, parse_link_layer,
    parse_nanos, parse_pad_check, parse_padding,
};
use isotp_tools::shared::split_shared;

const MAX_RECV_LEN: usize = 5000;

#[derive(Parser)]
#[command(version, about = "Receive ISO-TP PDUs and print them as space separated hex values")]
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

    /// Blocksize advertised in flow control (hex, 0 = off).
    #[arg(short = 'b', value_name = "bs", value_parser = parse_hex_u8)]
    block_size: Option<u8>,

    /// STmin advertised in flow control, raw byte value (hex).
    #[arg(short = 'm', value_name = "val", value_parser = parse_hex_u8)]
    st_min: Option<u8>,

    /// Max wait frame transmissions tolerated (hex).
    #[arg(short = 'w', value_name = "num", value_parser = parse_hex_u8)]
    wft_max: Option<u8>,

    /// Force rx STmin value in nanoseconds, overriding -m.
    #[arg(short = 'f', value_name = "time ns", value_parser = parse_nanos)]
    force_rx_stmin: Option<Duration>,

    /// Loop: do not exit after the first PDU reception.
    #[arg(short = 'l')]
    r#loop: bool,

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
    if let Some(bs) = cli.block_size {
        cfg.block_size = bs;
    }
    if let Some(raw) = cli.st_min {
        // Reserved raw values clamp to the longest millisecond separation.
        cfg.st_min = st_min_to_duration(raw).unwrap_or(Duration::from_millis(0x7F));
    }
    if let Some(force) = cli.force_rx_stmin {
        cfg.st_min = force;
    }
    if let Some(wft) = cli.wft_max {
        cfg.wft_max = wft;
    }
    if let Some(ll) = cli.link_layer {
        if ll.tx_dl != 0 {
            if !(8..=64).contains(&ll.tx_dl) {
                bail!("link layer tx_dl must be within 8..=64");
            }
            cfg.frame_len = ll.tx_dl as usize;
        }
    }
    cfg.max_pdu_len = MAX_RECV_LEN;
    Ok(cfg)
}

fn receive_loop<S, F>(can: S, cfg: TpConfig, keep_looping: bool) -> Result<()>
where
    S: TxFrameIo<Frame = F> + RxFrameIo<Frame = F, Error = <S as TxFrameIo>::Error>,
    F: Frame,
    <S as TxFrameIo>::Error: core::fmt::Debug,
{
    let (tx, rx) = split_shared(can);
    let storage = RxStorage::Owned(vec![0u8; cfg.max_pdu_len]);
    let mut node = TpNode::with_std_clock(tx, rx, cfg, storage)
        .map_err(|err| anyhow::anyhow!("invalid ISO-TP configuration: {err}"))?;

    let stdout = std::io::stdout();
    loop {
        let mut result = Ok(());
        let recv = node.recv(Duration::from_secs(3600), &mut |data| {
            let mut out = stdout.lock();
            result = write_hex_line(&mut out, data).and_then(|()| out.flush());
        });
        match recv {
            Ok(()) => result.context("write to stdout")?,
            // Idle waiting is not a failure; keep listening for the next sender.
            Err(TpError::Timeout(TimeoutKind::NAr)) => continue,
            Err(err) => bail!("receive failed: {err}"),
        }
        if !keep_looping {
            return Ok(());
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let cfg = build_config(&cli)?;

    if cfg.frame_len > 8 {
        let can = can_tp_socketcan::SocketCanFd::open(&cli.interface)
            .with_context(|| format!("open CAN FD interface {}", cli.interface))?;
        receive_loop(can, cfg, cli.r#loop)
    } else {
        let can = can_tp_socketcan::SocketCan::open(&cli.interface)
            .with_context(|| format!("open CAN interface {}", cli.interface))?;
        receive_loop(can, cfg, cli.r#loop)
    }
}
