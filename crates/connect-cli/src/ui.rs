use std::io::{self, Write};

use connect_core::prompts::PIN_ON_DEVICE;
use connect_core::{Core, DeviceSummary, Notification, UiResponse};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub fn prompt_line(prompt: &str) -> io::Result<String> {
    let mut stderr = io::stderr();
    write!(stderr, "{prompt}")?;
    stderr.flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

async fn ask(prompt: String) -> Option<String> {
    match tokio::task::spawn_blocking(move || prompt_line(&prompt)).await {
        Ok(Ok(line)) => Some(line),
        Ok(Err(err)) => {
            warn!("failed to read terminal input: {err}");
            None
        }
        Err(err) => {
            warn!("terminal prompt task failed: {err}");
            None
        }
    }
}

fn label(device: &DeviceSummary) -> &str {
    device.name.as_deref().unwrap_or(&device.connect_id)
}

/// Input typed at a PIN prompt: `device` defers entry to the device screen.
pub fn pin_reply(input: &str) -> String {
    if input.eq_ignore_ascii_case("device") {
        PIN_ON_DEVICE.to_string()
    } else {
        input.to_string()
    }
}

/// Input typed at a passphrase prompt. `device` enters it on the device.
pub fn passphrase_reply(connect_id: String, input: &str) -> UiResponse {
    let on_device = input.eq_ignore_ascii_case("device");
    UiResponse::ReceivePassphrase {
        connect_id: Some(connect_id),
        value: if on_device { String::new() } else { input.to_string() },
        passphrase_on_device: on_device,
        attach_pin_on_device: false,
        save: false,
    }
}

/// Index typed at the device picker, 1-based.
pub fn selected_device(devices: &[DeviceSummary], input: &str) -> Option<String> {
    let index: usize = input.parse().ok()?;
    devices
        .get(index.checked_sub(1)?)
        .map(|device| device.connect_id.clone())
}

/// Answers prompts raised by the core on the terminal until aborted.
pub fn spawn_terminal_prompter(core: Core) -> JoinHandle<()> {
    let mut events = core.subscribe();
    tokio::spawn(async move {
        loop {
            let notification = match events.recv().await {
                Ok(notification) => notification,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "terminal prompter lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match notification {
                Notification::RequestPin { device, kind } => {
                    let prompt = format!("{} PIN ({kind}, or 'device'): ", label(&device));
                    if let Some(input) = ask(prompt).await {
                        core.handle_ui_response(UiResponse::ReceivePin {
                            connect_id: Some(device.connect_id),
                            pin: pin_reply(&input),
                        });
                    }
                }
                Notification::RequestPassphrase { device, .. } => {
                    let prompt = format!("{} passphrase (or 'device'): ", label(&device));
                    if let Some(input) = ask(prompt).await {
                        core.handle_ui_response(passphrase_reply(device.connect_id, &input));
                    }
                }
                Notification::SelectDevice { devices } => {
                    eprintln!("Several devices are connected:");
                    for (index, device) in devices.iter().enumerate() {
                        eprintln!("  {}. {} ({})", index + 1, label(device), device.path);
                    }
                    if let Some(input) = ask("Select device: ".to_string()).await {
                        core.handle_ui_response(UiResponse::ReceiveSelectedDevice {
                            connect_id: selected_device(&devices, &input),
                        });
                    }
                }
                Notification::RequestButton { device, .. } => {
                    eprintln!("Confirm the action on {}", label(&device));
                }
                Notification::RequestPassphraseOnDevice { device } => {
                    eprintln!("Enter the passphrase on {}", label(&device));
                }
                Notification::FirmwareProgress { progress, .. } => {
                    eprintln!("Firmware upload {progress}%");
                }
                Notification::FirmwareProcessing { message, .. } => {
                    eprintln!("{message}");
                }
                _ => {}
            }
        }
    })
}
