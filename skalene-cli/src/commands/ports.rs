//! Serial port listing.

use anyhow::Result;
use console::style;
use skalene::{NativePortEnumerator, PortEnumerator, PortInfo};

/// Human readable line for one port.
fn describe(port: &PortInfo) -> String {
    match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => {
            let product = port
                .product
                .as_deref()
                .or(port.manufacturer.as_deref())
                .unwrap_or("USB serial");
            format!("{} [{vid:04X}:{pid:04X}] {product}", port.name)
        },
        _ => port.name.clone(),
    }
}

/// `list-ports`
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = NativePortEnumerator::list_ports()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    if ports.is_empty() {
        eprintln!("{} No serial ports found", style("⚠").yellow());
        return Ok(());
    }

    for port in &ports {
        println!("{}", describe(port));
    }
    Ok(())
}
