use crate::cli::EncodeArgs;
use crate::exit_codes;
use crate::output;
use fpga_fifo::wire::{self, PacketLayout, CONTINUE_COMMAND};
use serde::Serialize;

#[derive(Serialize)]
struct EncodeOutput {
    value: u32,
    init_command: Vec<String>,
    continue_command: Vec<String>,
    packet_words: usize,
    packet_bytes: usize,
}

fn hex_words(words: &[u32]) -> Vec<String> {
    words.iter().map(|w| format!("0x{:08x}", w)).collect()
}

pub fn execute(args: EncodeArgs) -> i32 {
    let init = wire::init_command(args.value);
    let layout = PacketLayout::new(args.value);

    let encoded = EncodeOutput {
        value: args.value,
        init_command: hex_words(&init),
        continue_command: hex_words(&CONTINUE_COMMAND),
        packet_words: layout.words(),
        packet_bytes: layout.bytes(),
    };

    if args.json {
        return output::print_json(&encoded, false);
    }

    println!("Value:      {} (0x{:08x})", encoded.value, encoded.value);
    println!("Initiation: {}", wire::format_words(&init));
    println!("Continue:   {}", wire::format_words(&CONTINUE_COMMAND));
    println!(
        "Packet:     {} words, {} bytes",
        encoded.packet_words, encoded.packet_bytes
    );
    exit_codes::SUCCESS
}
