use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "fpgafifo",
    version,
    about = "Streaming FIFO engine for PCIe-attached FPGAs",
    long_about = "Encode FPGA streaming commands and run producer/consumer sessions.\n\
                  Sessions run against the built-in FPGA simulator."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show the command words and packet size for a requested value
    Encode(EncodeArgs),
    /// Print the default session configuration as JSON
    Config(ConfigArgs),
    /// Stream packets from the simulated FPGA
    Run(RunArgs),
}

#[derive(Args)]
pub struct EncodeArgs {
    /// Requested transfer value (decimal or 0x-prefixed hex)
    #[arg(long, value_parser = parse_value)]
    pub value: u32,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Output file (default: stdout)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Compact JSON output (no indentation)
    #[arg(long, default_value_t = false)]
    pub compact: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ValidateMode {
    /// Commit every packet
    None,
    /// Check the hardware sequence word
    Sequence,
}

#[derive(Args)]
pub struct RunArgs {
    /// Requested transfer value (decimal or 0x-prefixed hex)
    #[arg(long, value_parser = parse_value)]
    pub value: u32,

    /// Stop after this many packets were drained
    #[arg(long)]
    pub packets: Option<u64>,

    /// Stop after this many milliseconds
    #[arg(long)]
    pub duration_ms: Option<u64>,

    /// Session configuration file (JSON)
    #[arg(long, env = "FPGAFIFO_CONFIG")]
    pub config: Option<String>,

    /// Ring buffer capacity in bytes
    #[arg(long)]
    pub capacity: Option<usize>,

    /// Maximum number of unread packets
    #[arg(long)]
    pub max_pending: Option<usize>,

    /// Packet validation policy
    #[arg(long, value_enum)]
    pub validate: Option<ValidateMode>,

    /// Simulated consumer processing time per packet, in microseconds
    #[arg(long, default_value_t = 0)]
    pub consumer_delay_us: u64,

    /// Make the simulator fail every receive after this many packets
    #[arg(long)]
    pub fail_recv_after: Option<u64>,

    /// Write drained packets to this file as raw little-endian bytes
    #[arg(short, long)]
    pub output: Option<String>,

    /// Print the final report as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Suppress progress messages on stderr
    #[arg(long, default_value_t = false)]
    pub quiet: bool,
}

/// Parse a transfer value given in decimal or with a 0x prefix.
pub fn parse_value(s: &str) -> Result<u32, String> {
    let trimmed = s.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => trimmed.parse::<u32>(),
    };
    let value = parsed.map_err(|_| format!("Invalid value '{}': expected a 32-bit integer", s))?;
    if value == 0 {
        return Err("Value must be greater than zero".to_string());
    }
    Ok(value)
}
