// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

// Slipsend: SLIP framed stop-and-wait file transfer
mod protocol;
mod slip;
mod sender;
mod receiver;
mod serial;

use clap::{Parser, Subcommand};
use serialport::{DataBits, Parity, StopBits};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::EnvFilter;
use serial::RealSerialPort;
use sender::{ProgressReporter, TransferConfig};
use receiver::ReceiverConfig;

#[derive(Parser)]
#[command(name = "slipsend")]
#[command(about = "SLIP framed stop-and-wait file transfer over a serial link", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long)]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name="BITS")]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name="BITS")]
    stop_bits: u8,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file
    Send {
        /// File to send
        file: PathBuf,

        /// Bytes per data frame (clamped to 64..=4096)
        #[arg(long, default_value = "1024", value_name = "BYTES")]
        chunk_size: usize,

        /// Retransmissions per frame before giving up
        #[arg(long, default_value = "5")]
        retries: u32,

        /// Time to wait for each acknowledgment
        #[arg(long, default_value = "1000", value_name = "MS")]
        ack_timeout_ms: u64,

        /// Delay after each acknowledged frame
        #[arg(long, default_value = "0", value_name = "MS")]
        frame_delay_ms: u64,
    },
    /// Receive a single file
    Receive {
        /// Directory to save the received file
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// Largest file to accept
        #[arg(long, default_value = "67108864", value_name = "BYTES")]
        max_size: u32,

        /// Give up when a started transfer is silent this long
        #[arg(long, default_value = "30", value_name = "SECS")]
        idle_timeout_secs: u64,

        /// Keep answering retransmissions until the line is quiet this long
        #[arg(long, default_value = "5", value_name = "SECS")]
        linger_secs: u64,
    },
}

fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(format!("Invalid data bits: {}. Must be 5, 6, 7, or 8", bits)),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!("Invalid parity: {}. Must be 'none', 'odd', or 'even'", parity)),
    }
}

fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let data_bits = match parse_data_bits(cli.data_bits) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let parity = match parse_parity(&cli.parity) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let stop_bits = match parse_stop_bits(cli.stop_bits) {
        Ok(sb) => sb,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    println!("Opening serial port: {}", cli.port);
    println!("Settings: {} baud, {:?}, {:?}, {:?}", cli.baud, data_bits, parity, stop_bits);

    let serial_port = match RealSerialPort::open(&cli.port, cli.baud, data_bits, parity, stop_bits) {
        Ok(port) => port,
        Err(e) => {
            eprintln!("Failed to open serial port: {}", e);
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Send { file, chunk_size, retries, ack_timeout_ms, frame_delay_ms } => {
            println!("\nSending file: {}", file.display());
            let config = TransferConfig {
                chunk_size,
                retries,
                ack_timeout: Duration::from_millis(ack_timeout_ms),
                frame_delay: Duration::from_millis(frame_delay_ms),
            };
            if let Err(e) = send_file(serial_port, file, config) {
                error!("send failed: {}", e);
                eprintln!("Send failed: {}", e);
                std::process::exit(1);
            }
            println!("\nFile sent successfully!");
        }
        Commands::Receive { output_dir, max_size, idle_timeout_secs, linger_secs } => {
            println!("\nReceiving file to: {}", output_dir.display());
            let config = ReceiverConfig {
                max_file_size: max_size,
                idle_timeout: Duration::from_secs(idle_timeout_secs),
                linger: Duration::from_secs(linger_secs),
            };
            if let Err(e) = receive_file(serial_port, output_dir, config) {
                error!("receive failed: {}", e);
                eprintln!("Receive failed: {}", e);
                std::process::exit(1);
            }
            println!("\nFile received successfully!");
        }
    }
}

/// Prints a progress line every 16 frames and on the last one.
struct ConsoleProgress;

/// Progress goes to stdout every 16 frames and on the last one; logs stay on stderr.
fn progress_line(sent: usize, total: usize, frames: u32) -> Option<String> {
    if frames % 16 == 0 || sent == total {
        Some(format!("\r[DATA] {}/{} bytes sent", sent, total))
    } else {
        None
    }
}

impl ProgressReporter for ConsoleProgress {
    fn report(&mut self, sent: usize, total: usize, frames: u32) {
        if let Some(line) = progress_line(sent, total, frames) {
            print!("{}", line);
            let _ = std::io::stdout().flush();
        }
    }
}

fn send_file(serial_port: RealSerialPort, file: PathBuf, config: TransferConfig) -> Result<(), sender::SenderError> {
    if !file.is_file() {
        return Err(sender::SenderError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("File not found: {}", file.display()),
        )));
    }

    let data = std::fs::read(&file)?;
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let report = sender::send_file(Box::new(serial_port), data, &name, config, Box::new(ConsoleProgress))?;

    let secs = report.elapsed.as_secs_f64().max(1e-9);
    println!(
        "\n[DONE] {} bytes in {:.3}s ({:.1} KB/s, frames={}, retransmissions={}, fid=0x{:08x})",
        report.total_bytes,
        secs,
        report.total_bytes as f64 / 1024.0 / secs,
        report.frames,
        report.retransmissions,
        report.file_id,
    );
    Ok(())
}

fn receive_file(serial_port: RealSerialPort, output_dir: PathBuf, config: ReceiverConfig) -> Result<(), receiver::ReceiverError> {
    if !output_dir.is_dir() {
        return Err(receiver::ReceiverError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Output directory not found: {}", output_dir.display()),
        )));
    }

    let received = receiver::receive_file(Box::new(serial_port), output_dir, config)?;
    println!(
        "[DONE] {} bytes in {} frames written to {} (fid=0x{:08x})",
        received.bytes,
        received.frames,
        received.path.display(),
        received.file_id,
    );
    Ok(())
}
