use std::process::ExitCode;

fn main() -> ExitCode {
    captioner_lib::run()
}
