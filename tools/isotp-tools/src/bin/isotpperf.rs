//! ISO-TP protocol performance visualisation: watch one direction of a transfer and display
//! progress, link-layer mode, flow-control parameters and throughput.

use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use embedded_can::Frame;

use can_frame_io::{FilterConfig, Id, IdMaskFilter, RxFrameIo};
use isotp_tools::canid::parse_can_id;
use isotp_tools::opts::parse_hex_u8;

/// Bargraph resolution in percent.
const PERCENT_RES: usize = 2;
const NUM_BAR: usize = 100 / PERCENT_RES;

#[derive(Parser)]
#[command(version, about = "ISO15765-2 protocol performance visualisation")]
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

    /// CAN interface (e.g. can0, vcan0).
    interface: String,
}

/// Reassembly progress of the PDU currently being observed.
#[derive(Default)]
struct Observation {
    total_len: u64,
    received: u64,
    last_sn: u8,
    fd_frames: bool,
    ll_dl: usize,
    block_size: u8,
    st_min: u8,
    started: Option<Instant>,
}

fn frame_view(frame: &socketcan::CanAnyFrame) -> Option<(Id, Vec<u8>, bool)> {
    match frame {
        socketcan::CanAnyFrame::Normal(f) => Some((f.id(), f.data().to_vec(), false)),
        socketcan::CanAnyFrame::Fd(f) => Some((f.id(), f.data().to_vec(), true)),
        _ => None,
    }
}

fn print_progress(obs: &Observation) {
    let percent = ((obs.received * 100) / obs.total_len.max(1)).min(100) as usize;
    let digits = obs.total_len.to_string().len();
    let mut bar = String::with_capacity(NUM_BAR);
    for slot in 0..NUM_BAR {
        bar.push(if slot < percent / PERCENT_RES { 'X' } else { '.' });
    }
    print!(
        "\r {percent:3}% |{bar}| {:>digits$}/{} ",
        obs.received, obs.total_len
    );
    let _ = std::io::stdout().flush();
}

fn print_summary(obs: &Observation) {
    print!(
        "\r{} {:02}  (BS:{:2} # ",
        if obs.fd_frames { "CAN-FD" } else { "CAN2.0" },
        obs.ll_dl,
        obs.block_size
    );
    let st = obs.st_min;
    if st < 0x80 {
        print!("STmin:{st:3} msec)");
    } else if st > 0xF0 && st < 0xFA {
        print!("STmin:{:3} usec)", (st & 0x0F) as u32 * 100);
    } else {
        print!("STmin: invalid   )");
    }
    print!(" : {} byte in ", obs.total_len);

    match obs.started.map(|t| t.elapsed()) {
        Some(elapsed) if !elapsed.is_zero() => {
            print!(
                "{}.{:06}s => {} byte/s",
                elapsed.as_secs(),
                elapsed.subsec_micros(),
                (obs.total_len as f64 / elapsed.as_secs_f64()) as u64
            );
        }
        _ => print!("(no time available)     "),
    }
    println!();
    let _ = std::io::stdout().flush();
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut can = can_tp_socketcan::SocketCanFd::open(&cli.interface)
        .with_context(|| format!("open CAN interface {}", cli.interface))?;
    can.set_filters(&[IdMaskFilter::exact(cli.src), IdMaskFilter::exact(cli.dst)])
        .context("set CAN acceptance filter")?;

    let ext_idx = usize::from(cli.ext.is_some());
    let rx_ext_idx = usize::from(cli.rx_ext.is_some());
    let mut obs = Observation::default();

    loop {
        // A started transfer that stalls for a second has timed out.
        let frame = match can.recv_timeout(Duration::from_secs(1)) {
            Ok(frame) => frame,
            Err(_) => {
                if obs.total_len != 0 {
                    print!("\r{:<78}", " (transmission timed out)");
                    let _ = std::io::stdout().flush();
                    obs = Observation::default();
                }
                continue;
            }
        };
        let Some((id, data, fd)) = frame_view(&frame) else {
            continue;
        };

        if let Some(addr) = cli.ext
            && data.first().copied() != Some(addr)
        {
            continue;
        }

        // Flow control information comes from the opposite direction.
        if id == cli.dst {
            if let Some(addr) = cli.rx_ext
                && data.first().copied() != Some(addr)
            {
                continue;
            }
            if let Some(&pci) = data.get(rx_ext_idx)
                && pci & 0xF0 == 0x30
            {
                obs.block_size = data.get(rx_ext_idx + 1).copied().unwrap_or(0);
                obs.st_min = data.get(rx_ext_idx + 2).copied().unwrap_or(0);
            }
            continue;
        }

        let Some(&pci) = data.get(ext_idx) else {
            continue;
        };
        let byte_at = |idx: usize| data.get(idx).copied().unwrap_or(0);

        match pci & 0xF0 {
            0x00 => {
                // Single frame: complete in one shot.
                let (len, datidx) = if pci & 0x0F != 0 {
                    ((pci & 0x0F) as u64, ext_idx + 1)
                } else {
                    (byte_at(ext_idx + 1) as u64, ext_idx + 2)
                };
                if data.len() < datidx + len as usize {
                    continue;
                }
                obs = Observation {
                    total_len: len,
                    received: len,
                    fd_frames: fd,
                    ll_dl: data.len().max(8),
                    started: Some(Instant::now()),
                    ..Observation::default()
                };
            }
            0x10 => {
                let short = (((pci & 0x0F) as u64) << 8) + byte_at(ext_idx + 1) as u64;
                let (total, datidx) = if short != 0 {
                    (short, ext_idx + 2)
                } else {
                    let long = u32::from_be_bytes([
                        byte_at(ext_idx + 2),
                        byte_at(ext_idx + 3),
                        byte_at(ext_idx + 4),
                        byte_at(ext_idx + 5),
                    ]);
                    (long as u64, ext_idx + 6)
                };
                obs = Observation {
                    total_len: total,
                    received: (data.len() - datidx.min(data.len())) as u64,
                    last_sn: 0,
                    fd_frames: fd,
                    ll_dl: data.len(),
                    started: Some(Instant::now()),
                    ..Observation::default()
                };
            }
            0x20 => {
                if obs.total_len != 0 {
                    let sn = pci & 0x0F;
                    if sn == (obs.last_sn + 1) & 0x0F {
                        obs.last_sn = sn;
                        obs.received += (data.len() - (ext_idx + 1)) as u64;
                    }
                }
            }
            _ => {}
        }

        if obs.total_len != 0 {
            obs.received = obs.received.min(obs.total_len);
            print_progress(&obs);
            if obs.received >= obs.total_len {
                print_summary(&obs);
                obs = Observation::default();
            }
        }
    }
}
