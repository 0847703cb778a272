//! Decode and display raw ISO-TP protocol frames exchanged between two CAN identifiers.

use std::io::Write;

use anyhow::{Context, Result, bail};
use clap::Parser;
use embedded_can::Frame;

use can_frame_io::{FilterConfig, Id, IdMaskFilter, RxFrameIo};
use isotp_tools::canid::{fmt_can_id, parse_can_id};
use isotp_tools::opts::parse_hex_u8;
use isotp_tools::stamp::{StampMode, Stamper, parse_stamp_mode};

const ATTRESET: &str = "\x1b[0m";
const FGRED: &str = "\x1b[31m";
const FGBLUE: &str = "\x1b[34m";

const FC_INFO: [&str; 4] = ["CTS", "WT", "OVFLW", "reserved"];

/// Extended-address match: a specific byte or any.
#[derive(Debug, Clone, Copy)]
enum AddrFilter {
    Any,
    Byte(u8),
}

fn parse_addr_filter(s: &str) -> Result<AddrFilter, String> {
    if s.eq_ignore_ascii_case("any") {
        return Ok(AddrFilter::Any);
    }
    parse_hex_u8(s).map(AddrFilter::Byte)
}

#[derive(Parser)]
#[command(version, about = "Display raw ISO-TP protocol frames in human readable format")]
struct Cli {
    /// Source can_id. Use 8 digits for extended IDs.
    #[arg(short = 's', value_name = "can_id", value_parser = parse_can_id)]
    src: Id,

    /// Destination can_id. Use 8 digits for extended IDs.
    #[arg(short = 'd', value_name = "can_id", value_parser = parse_can_id)]
    dst: Id,

    /// Extended addressing mode; use 'any' to match all addresses.
    #[arg(short = 'x', value_name = "addr", value_parser = parse_addr_filter)]
    ext: Option<AddrFilter>,

    /// Extended addressing mode rx address; use 'any' to match all.
    #[arg(short = 'X', value_name = "addr", value_parser = parse_addr_filter)]
    rx_ext: Option<AddrFilter>,

    /// Color mode.
    #[arg(short = 'c')]
    color: bool,

    /// Print the data also in ASCII characters.
    #[arg(short = 'a')]
    ascii: bool,

    /// Timestamp mode: (a)bsolute, (d)elta, (z)ero, (A)bsolute with date.
    #[arg(short = 't', value_name = "type", value_parser = parse_stamp_mode)]
    timestamp: Option<StampMode>,

    /// CAN interface (e.g. can0, vcan0).
    interface: String,
}

struct FrameView {
    id: Id,
    data: Vec<u8>,
    fd: bool,
}

fn view(frame: &socketcan::CanAnyFrame) -> Option<FrameView> {
    match frame {
        socketcan::CanAnyFrame::Normal(f) => Some(FrameView {
            id: f.id(),
            data: f.data().to_vec(),
            fd: false,
        }),
        socketcan::CanAnyFrame::Fd(f) => Some(FrameView {
            id: f.id(),
            data: f.data().to_vec(),
            fd: true,
        }),
        _ => None,
    }
}

fn matches_addr(filter: Option<AddrFilter>, first_byte: Option<u8>) -> bool {
    match filter {
        None | Some(AddrFilter::Any) => true,
        Some(AddrFilter::Byte(addr)) => first_byte == Some(addr),
    }
}

/// Render the PCI portion of one frame, returning the index where payload data starts
/// (0 = nothing further to print).
fn describe_pci(out: &mut String, data: &[u8], ext: usize) -> usize {
    let Some(&pci) = data.get(ext) else {
        out.push_str("[??]");
        return 0;
    };
    let byte_at = |idx: usize| data.get(idx).copied().unwrap_or(0);

    match pci & 0xF0 {
        0x00 => {
            if pci & 0x0F != 0 {
                out.push_str(&format!("[SF] ln: {:<4} data:", pci & 0x0F));
                ext + 1
            } else {
                out.push_str(&format!("[SF] ln: {:<4} data:", byte_at(ext + 1)));
                ext + 2
            }
        }
        0x10 => {
            let short = (((pci & 0x0F) as u32) << 8) + byte_at(ext + 1) as u32;
            let (fflen, datidx) = if short != 0 {
                (short, ext + 2)
            } else {
                let long = u32::from_be_bytes([
                    byte_at(ext + 2),
                    byte_at(ext + 3),
                    byte_at(ext + 4),
                    byte_at(ext + 5),
                ]);
                (long, ext + 6)
            };
            out.push_str(&format!("[FF] ln: {fflen:<4} data:"));
            datidx
        }
        0x20 => {
            out.push_str(&format!("[CF] sn: {:X}    data:", pci & 0x0F));
            ext + 1
        }
        0x30 => {
            let fs = (pci & 0x0F) as usize;
            out.push_str(&format!("[FC] FC: {fs} = {} # ", FC_INFO[fs.min(3)]));
            let bs = byte_at(ext + 1);
            out.push_str(&format!(
                "BS: {bs} {}# ",
                if bs != 0 { "" } else { "= off " }
            ));
            let st = byte_at(ext + 2);
            out.push_str(&format!("STmin: 0x{st:02X} = "));
            if st < 0x80 {
                out.push_str(&format!("{st} ms"));
            } else if st > 0xF0 && st < 0xFA {
                out.push_str(&format!("{} us", (st & 0x0F) as u32 * 100));
            } else {
                out.push_str("reserved");
            }
            0
        }
        _ => {
            out.push_str("[??]");
            0
        }
    }
}

fn render_line(cli: &Cli, stamp: String, view: &FrameView) -> Option<String> {
    let first = view.data.first().copied();
    if view.id == cli.src && !matches_addr(cli.ext, first) {
        return None;
    }
    if view.id == cli.dst && !matches_addr(cli.rx_ext, first) {
        return None;
    }
    let ext_idx = usize::from(cli.ext.is_some());

    let mut line = String::new();
    if cli.color {
        line.push_str(if view.id == cli.src { FGRED } else { FGBLUE });
    }
    line.push_str(&stamp);
    line.push_str(&format!(" {}  {}", cli.interface, fmt_can_id(view.id)));
    if cli.ext.is_some() {
        line.push_str(&format!("{{{:02X}}}", first.unwrap_or(0)));
    }
    if view.fd {
        line.push_str(&format!(" [{:02}]  ", view.data.len()));
    } else {
        line.push_str(&format!("  [{}]  ", view.data.len()));
    }

    let datidx = describe_pci(&mut line, &view.data, ext_idx);

    if datidx != 0 && view.data.len() > datidx {
        line.push(' ');
        for b in &view.data[datidx..] {
            line.push_str(&format!("{b:02X} "));
        }
        if cli.ascii {
            let printed = view.data.len() - datidx;
            let pad = (7 - ext_idx).saturating_sub(printed) * 3 + 5;
            line.push_str(&format!("{:>pad$}", "-  '"));
            for b in &view.data[datidx..] {
                line.push(if (0x20..0x7F).contains(b) {
                    *b as char
                } else {
                    '.'
                });
            }
            line.push('\'');
        }
    }

    if cli.color {
        line.push_str(ATTRESET);
    }
    Some(line)
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    if cli.rx_ext.is_some() && cli.ext.is_none() {
        bail!("-X requires -x");
    }

    let mut can = can_tp_socketcan::SocketCanFd::open(&cli.interface)
        .with_context(|| format!("open CAN interface {}", cli.interface))?;
    can.set_filters(&[IdMaskFilter::exact(cli.src), IdMaskFilter::exact(cli.dst)])
        .context("set CAN acceptance filter")?;

    let mut stamper = Stamper::new(cli.timestamp.unwrap_or_default());
    let stdout = std::io::stdout();

    loop {
        let frame = can
            .recv()
            .map_err(|err| anyhow::anyhow!("read from CAN socket failed: {err}"))?;
        let Some(view) = view(&frame) else {
            continue;
        };
        if let Some(line) = render_line(&cli, stamper.prefix(), &view) {
            let mut out = stdout.lock();
            writeln!(out, "{line}")
                .and_then(|()| out.flush())
                .context("write to stdout")?;
        }
    }
}
