use std::process::ExitCode;

fn main() -> ExitCode {
    pledge_cli::run()
}
