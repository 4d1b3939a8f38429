mod infra;
mod runtime;

use std::process::ExitCode;

fn main() -> ExitCode {
    match runtime::run_from_args() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "stand-ctl failed");
            eprintln!("stand-ctl: {e}");
            ExitCode::FAILURE
        }
    }
}
