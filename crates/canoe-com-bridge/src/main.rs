//! CANoe COM Bridge: a Windows process that holds the `CANoe.Application`
//! COM object and serves it to `canoe-link` as JSON commands over stdin/stdout.
//!
//! Built with `--target x86_64-pc-windows-gnu`; runs natively on Windows or
//! under WINE on Linux.
//!
//! Protocol: one JSON object per line (newline-delimited JSON).
//! - Reads `Request` objects from stdin
//! - Writes `Response` objects to stdout
//! - Diagnostics go to stderr, never stdout

#[cfg(windows)]
mod canoe;
#[cfg(windows)]
mod dispatch;
#[cfg_attr(not(windows), allow(dead_code))]
mod handles;

#[cfg(not(windows))]
fn main() {
    eprintln!("canoe-com-bridge must be compiled for Windows (--target x86_64-pc-windows-gnu)");
    eprintln!("and run natively or under WINE on Linux.");
    std::process::exit(1);
}

#[cfg(windows)]
fn main() {
    use std::io::{self, BufRead, Write};

    use canoe_com_protocol::{Command, Request, Response};

    eprintln!("[canoe-com-bridge] Starting up...");

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    let mut canoe: Option<canoe::CanoeApp> = None;

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                eprintln!("[canoe-com-bridge] stdin read error: {e}");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => {
                let response = handle_command(&mut canoe, &request);
                if matches!(request.command, Command::Release) {
                    send(&mut out, &response);
                    break;
                }
                response
            }
            Err(e) => {
                eprintln!("[canoe-com-bridge] JSON parse error: {e}; line was: {line}");
                // id 0: the request id could not be read
                Response::error(0, format!("JSON parse error: {e}"))
            }
        };
        send(&mut out, &response);
    }

    // Handles are dropped before COM goes away. CANoe itself keeps running.
    if let Some(app) = canoe.take() {
        eprintln!("[canoe-com-bridge] releasing {} handles", app.handle_count());
        drop(app);
        uninit_com();
    }

    eprintln!("[canoe-com-bridge] Process exiting.");

    fn send(out: &mut impl Write, response: &Response) {
        match serde_json::to_string(response) {
            Ok(json) => {
                let _ = writeln!(out, "{json}");
                let _ = out.flush();
            }
            Err(e) => eprintln!("[canoe-com-bridge] cannot encode response: {e}"),
        }
    }
}

#[cfg(windows)]
fn handle_command(
    canoe: &mut Option<canoe::CanoeApp>,
    request: &canoe_com_protocol::Request,
) -> canoe_com_protocol::Response {
    use canoe_com_protocol::{Command, Response, ResponseData};

    let id = request.id;

    let result = match &request.command {
        Command::Init { prog_id } => init_com_and_canoe(canoe, prog_id).map(ResponseData::Identity).map(Some),
        Command::Release => Ok(None),
        command => match canoe.as_mut() {
            Some(app) => dispatch_command(app, command),
            None => Err("CANoe not attached. Send 'Init' first.".to_string()),
        },
    };

    match result {
        Ok(data) => Response::ok(id, data),
        Err(message) => Response::error(id, message),
    }
}

#[cfg(windows)]
fn dispatch_command(
    app: &mut canoe::CanoeApp,
    command: &canoe_com_protocol::Command,
) -> Result<Option<canoe_com_protocol::ResponseData>, String> {
    use canoe_com_protocol::{Command, ResponseData};

    let data = match command {
        Command::Namespaces { parent } => ResponseData::Entries(app.namespaces(*parent)?),
        Command::FindNamespace { parent, name } => {
            ResponseData::Lookup(app.find_namespace(*parent, name)?)
        }
        Command::AddNamespace { parent, name } => {
            ResponseData::Handle(app.add_namespace(*parent, name)?)
        }
        Command::Variables { namespace } => ResponseData::Entries(app.variables(*namespace)?),
        Command::FindVariable { namespace, name } => {
            ResponseData::Lookup(app.find_variable(*namespace, name)?)
        }
        Command::AddVariable {
            namespace,
            name,
            initial,
        } => ResponseData::Handle(app.add_variable(*namespace, name, initial)?),
        Command::GetValue { variable } => ResponseData::Value(app.get_value(*variable)?),
        Command::SetValue { variable, value } => {
            app.set_value(*variable, value)?;
            return Ok(None);
        }
        Command::FindProcedure { name } => ResponseData::Lookup(app.find_procedure(name)?),
        Command::CallProcedure { procedure, args } => {
            ResponseData::Value(app.call_procedure(*procedure, args)?)
        }
        Command::MeasurementRunning => ResponseData::Flag(app.measurement_running()?),
        Command::StartMeasurement => {
            app.start_measurement()?;
            return Ok(None);
        }
        Command::StopMeasurement => {
            app.stop_measurement()?;
            return Ok(None);
        }
        Command::Init { .. } | Command::Release => return Ok(None),
    };
    Ok(Some(data))
}

#[cfg(windows)]
fn init_com_and_canoe(
    canoe: &mut Option<canoe::CanoeApp>,
    prog_id: &str,
) -> Result<canoe_com_protocol::AppIdentity, String> {
    use windows::Win32::System::Com::{CoInitializeEx, COINIT_APARTMENTTHREADED};

    if let Some(app) = canoe.as_ref() {
        return app.identity();
    }

    // CANoe's automation server requires a single-threaded apartment
    unsafe {
        CoInitializeEx(None, COINIT_APARTMENTTHREADED)
            .ok()
            .map_err(|e| format!("CoInitializeEx failed: {e}"))?;
    }
    eprintln!("[canoe-com-bridge] COM initialized (STA)");

    let app = match canoe::CanoeApp::attach(prog_id) {
        Ok(app) => app,
        Err(e) => {
            uninit_com();
            return Err(format!("Failed to attach to {prog_id}: {e}"));
        }
    };
    let identity = match app.identity() {
        Ok(identity) => identity,
        Err(e) => {
            drop(app);
            uninit_com();
            return Err(format!("Cannot read application identity: {e}"));
        }
    };
    eprintln!(
        "[canoe-com-bridge] attached to {} {}",
        identity.name, identity.version
    );
    *canoe = Some(app);
    Ok(identity)
}

#[cfg(windows)]
fn uninit_com() {
    unsafe {
        windows::Win32::System::Com::CoUninitialize();
    }
    eprintln!("[canoe-com-bridge] COM uninitialized");
}
