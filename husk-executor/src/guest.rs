//! Files injected into a guest root filesystem.
//!
//! Pure text generators; [`crate::jail`] decides where they land.

use husk_core::VmId;

/// Guest path of the agent binary.
pub const AGENT_BIN: &str = "usr/local/bin/husk-agent";
/// Guest path of the agent environment file.
pub const AGENT_ENV: &str = "etc/husk/agent.env";
/// Unit name of the agent service.
pub const AGENT_UNIT: &str = "husk-agent.service";
/// Directory holding the demo page.
pub const WELCOME_DIR: &str = "opt/husk/welcome";
/// Unit name of the demo page service.
pub const WELCOME_UNIT: &str = "husk-welcome.service";
/// Guest directory for systemd units.
pub const SYSTEMD_DIR: &str = "etc/systemd/system";
/// Guest directory whose symlinks enable units at boot.
pub const WANTS_DIR: &str = "etc/systemd/system/multi-user.target.wants";

#[must_use]
pub fn agent_service() -> String {
    format!(
        "[Unit]
Description=husk VM agent
After=network.target

[Service]
Type=simple
ExecStart=/{AGENT_BIN}
EnvironmentFile=/{AGENT_ENV}
Restart=always
RestartSec=2

[Install]
WantedBy=multi-user.target
"
    )
}

#[must_use]
pub fn agent_env(token: &str, port: u16, vm_id: &VmId) -> String {
    format!("HUSK_AGENT_TOKEN={token}\nHUSK_AGENT_PORT={port}\nHUSK_VM_ID={vm_id}\n")
}

fn join_ports(ports: &[u16]) -> String {
    ports.iter().map(u16::to_string).collect::<Vec<_>>().join(", ")
}

/// Static landing page listing the VM and its published ports.
#[must_use]
pub fn welcome_html(vm_id: &VmId, ports: &[u16]) -> String {
    let items: String = ports.iter().map(|p| format!("\n        <li>{p}</li>")).collect();
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>husk VM {vm_id}</title>
  <style>
    body {{ font-family: system-ui, sans-serif; background: #0f172a; color: #e2e8f0; padding: 2rem; }}
    code {{ color: #f97316; }}
  </style>
</head>
<body>
  <h1>Your microVM is running</h1>
  <p>VM <code>{vm_id}</code> is serving this page on:</p>
  <ul>{items}
  </ul>
  <p>Stop it with <code>systemctl stop husk-welcome</code> and run your own server on the same port.</p>
</body>
</html>
"#
    )
}

/// Node script serving `index.html` on every published port.
#[must_use]
pub fn welcome_server(ports: &[u16]) -> String {
    let listeners: String = ports
        .iter()
        .map(|p| format!("server.listen({p}, \"0.0.0.0\");\n"))
        .collect();
    format!(
        r#""use strict";
const http = require("node:http");
const fs = require("node:fs");
const path = require("node:path");

const html = fs.readFileSync(path.join(__dirname, "index.html"), "utf-8");
const server = http.createServer((req, res) => {{
  res.writeHead(200, {{ "Content-Type": "text/html; charset=utf-8", "Cache-Control": "no-cache" }});
  res.end(html);
}});

{listeners}"#
    )
}

#[must_use]
pub fn welcome_service(ports: &[u16]) -> String {
    format!(
        "[Unit]
Description=husk welcome page on port(s) {}
After=network.target

[Service]
Type=simple
ExecStart=/usr/local/bin/node /{WELCOME_DIR}/server.js
Restart=on-failure
RestartSec=2

[Install]
WantedBy=multi-user.target
",
        join_ports(ports)
    )
}
