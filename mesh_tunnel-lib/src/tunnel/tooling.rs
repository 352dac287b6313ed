use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use crate::tunnel::{Driver, Error};

/// Driver backed by the host `wg` / `wg-quick` binaries.
#[derive(Debug, Default)]
pub struct Tooling {}

pub fn available() -> Result<(), Error> {
    for binary in ["wg", "wg-quick"] {
        let code = Command::new("which")
            .arg(binary)
            // suppress log output
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if !code.success() {
            return Err(Error::NotAvailable);
        }
    }
    Ok(())
}

impl Tooling {
    pub fn new() -> Self {
        Tooling {}
    }
}

fn check_wg(output: Output, context: &str) -> Result<Output, Error> {
    if output.status.success() {
        Ok(output)
    } else {
        Err(Error::Wg(
            output.status.code().unwrap_or_default(),
            format!("{context} failed: {}", String::from_utf8_lossy(&output.stderr)),
        ))
    }
}

fn wg_quick(verb: &str, config_path: &Path) -> Result<(), Error> {
    let output = Command::new("wg-quick").arg(verb).arg(config_path).output()?;
    if !output.stdout.is_empty() {
        tracing::info!("wg-quick {verb} stdout: {}", String::from_utf8_lossy(&output.stdout));
    }

    if output.status.success() {
        if !output.stderr.is_empty() {
            // wg-quick populates stderr with info and warnings, log those in debug mode
            tracing::debug!("wg-quick {verb} stderr: {}", String::from_utf8_lossy(&output.stderr));
        }
        Ok(())
    } else {
        Err(Error::WgQuick(
            output.status.code().unwrap_or_default(),
            format!("wg-quick {verb} failed: {}", String::from_utf8_lossy(&output.stderr)),
        ))
    }
}

impl Driver for Tooling {
    fn generate_key(&self) -> Result<String, Error> {
        let output = check_wg(Command::new("wg").arg("genkey").output()?, "wg genkey")?;
        let key = String::from_utf8(output.stdout).map(|s| s.trim().to_string())?;
        Ok(key)
    }

    fn public_key(&self, private_key: &str) -> Result<String, Error> {
        let mut command = Command::new("wg")
            .arg("pubkey")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;

        if let Some(stdin) = command.stdin.as_mut() {
            stdin.write_all(private_key.as_bytes())?
        }

        let output = check_wg(command.wait_with_output()?, "wg pubkey")?;
        let key = String::from_utf8(output.stdout).map(|s| s.trim().to_string())?;
        Ok(key)
    }

    fn interface_up(&self, config_path: &Path) -> Result<(), Error> {
        wg_quick("up", config_path)
    }

    fn interface_down(&self, config_path: &Path) -> Result<(), Error> {
        wg_quick("down", config_path)
    }

    fn add_peer(&self, interface: &str, public_key: &str, allowed_ips: &[String]) -> Result<(), Error> {
        let output = Command::new("wg")
            .args(["set", interface, "peer", public_key, "allowed-ips"])
            .arg(allowed_ips.join(","))
            .output()?;
        check_wg(output, "wg set peer")?;
        Ok(())
    }

    fn remove_peer(&self, interface: &str, public_key: &str) -> Result<(), Error> {
        let output = Command::new("wg")
            .args(["set", interface, "peer", public_key, "remove"])
            .output()?;
        check_wg(output, "wg set peer remove")?;
        Ok(())
    }

    fn latest_handshakes(&self, interface: &str) -> Result<HashMap<String, u64>, Error> {
        let output = Command::new("wg")
            .args(["show", interface, "latest-handshakes"])
            .output()?;
        let output = check_wg(output, "wg show latest-handshakes")?;
        let stdout = String::from_utf8(output.stdout)?;

        let mut handshakes = HashMap::new();
        for line in stdout.lines().filter(|line| !line.trim().is_empty()) {
            let mut fields = line.split_whitespace();
            let (Some(key), Some(epoch)) = (fields.next(), fields.next()) else {
                return Err(Error::MalformedHandshake(line.to_string()));
            };
            let epoch = epoch
                .parse::<u64>()
                .map_err(|_| Error::MalformedHandshake(line.to_string()))?;
            handshakes.insert(key.to_string(), epoch);
        }
        Ok(handshakes)
    }
}
