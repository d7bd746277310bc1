//! Example: one bench session against a running CANoe.
//!
//! Connects, reads a temperature from whichever namespace holds it, samples it
//! into a CSV capture, then calls the `ResetAll` CAPL function.
//!
//! Prerequisites:
//!   - CANoe installed with a configuration loaded
//!   - canoe-com-bridge.exe built:
//!     cargo build --target x86_64-pc-windows-gnu -p canoe-com-bridge --release
//!   - on Linux: WINE installed and CANoe registered in the WINE prefix
//!
//! Run:
//!   cargo run --example bench_session -p canoe-link

use std::time::Duration;

use canoe_link::{CaptureLog, LinkConfig, LinkError, Session};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = LinkConfig::default();
    let mut session = Session::from_config(&config);

    let info = session.connect()?;
    println!("Connected to {} {}", info.application, info.version);

    let candidates = session.candidates().to_vec();
    let handle = match session.resolve("Temperature", &candidates)?.or_not_found("Temperature") {
        Ok(handle) => handle,
        Err(err @ LinkError::VariableNotFound { .. }) => {
            println!("{err}");
            println!("Creating Measurement::Temperature instead");
            session.ensure_variable("Measurement", "Temperature", 0.0)?
        }
        Err(err) => return Err(err.into()),
    };

    let mut log = CaptureLog::csv("temperature.csv")?;
    for _ in 0..5 {
        let value = session.read(&handle)?;
        let record = log.append(value)?;
        println!("{}  {} = {value}", record.timestamp, handle.qualified_name());
        std::thread::sleep(Duration::from_millis(200));
    }

    match session.invoke_procedure("ResetAll") {
        Ok(()) => println!("ResetAll called"),
        Err(err) => println!("ResetAll skipped: {err}"),
    }

    session.disconnect();
    Ok(())
}
