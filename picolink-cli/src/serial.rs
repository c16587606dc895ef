//! Interactive serial port selection.
//!
//! The resolver picks a port automatically when the configured criteria
//! match. When nothing matches, interactive sessions get a picker over
//! every detected port; non-interactive sessions fail instead so scripts
//! never hang on a prompt.

use anyhow::{Result, bail};
use console::style;
use dialoguer::{Select, theme::ColorfulTheme};
use picolink::{PortDescriptor, detect_ports};
use std::io::IsTerminal;

/// Format one port for the selection list.
fn port_label(port: &PortDescriptor) -> String {
    let ids = match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
        _ => String::new(),
    };
    let product = port
        .product
        .as_deref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();
    format!("{}{ids}{product}", port.name)
}

/// Pick a port by hand when auto-detection found nothing.
pub fn choose_port(non_interactive: bool) -> Result<String> {
    let ports = detect_ports();

    if ports.is_empty() {
        bail!("No serial ports found. Is the device plugged in?");
    }

    if ports.len() == 1 {
        let only = &ports[0];
        eprintln!(
            "{} Using the only available port: {}",
            style("→").green(),
            style(&only.name).cyan()
        );
        return Ok(only.name.clone());
    }

    if non_interactive || !std::io::stdin().is_terminal() || !std::io::stderr().is_terminal() {
        bail!(
            "Multiple serial ports found and no match for the configured criteria; \
             pass --port or tighten --vid/--pid/--product"
        );
    }

    let labels: Vec<String> = ports.iter().map(port_label).collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the device port")
        .items(&labels)
        .default(0)
        .interact_opt()?;

    match selection {
        Some(index) => Ok(ports[index].name.clone()),
        None => bail!("Port selection cancelled"),
    }
}
