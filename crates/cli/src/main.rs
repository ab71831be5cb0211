use std::process::ExitCode;

fn main() -> ExitCode {
    chatcart_cli::run()
}
