use crate::cli::ConfigArgs;
use crate::exit_codes;
use crate::output;
use fpga_fifo::SessionConfig;

pub fn execute(args: ConfigArgs) -> i32 {
    let json = match output::to_json(&SessionConfig::default(), args.compact) {
        Ok(json) => json,
        Err(e) => {
            eprintln!("Error: {}", e);
            return exit_codes::EXECUTION_ERROR;
        }
    };

    if let Err(e) = output::write_output(&json, args.output.as_deref()) {
        eprintln!("Error: {}", e);
        return exit_codes::EXECUTION_ERROR;
    }
    if let Some(ref path) = args.output {
        eprintln!("Default configuration written to {}", path);
    }
    exit_codes::SUCCESS
}
