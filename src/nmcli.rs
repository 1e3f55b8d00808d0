use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::link::{LinkEvent, LinkEventSink, NetworkLink};

/// Seconds nmcli waits for the connection to activate.
const ACTIVATION_WAIT_SECS: u64 = 30;

/// nmcli exit status for "timeout expired".
const EXIT_TIMEOUT: i32 = 3;

const MONITOR_INTERVAL: Duration = Duration::from_secs(2);

/// The PSK is never stored in the profile; it is handed over on activation.
const PSK_NOT_SAVED: &str = "2";

struct ActiveLink {
    ssid: String,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct LinkState {
    active: Option<ActiveLink>,
    /// Profile removal started by the last `disconnect`.
    teardown: Option<JoinHandle<()>>,
}

/// Joins the peer's access point through NetworkManager's `nmcli`.
///
/// A dedicated connection profile named after the SSID is created for every
/// attempt and deleted again on disconnect. A new attempt waits for the
/// previous deletion to finish first.
pub struct NmcliLink {
    program: PathBuf,
    state: Mutex<LinkState>,
}

impl Default for NmcliLink {
    fn default() -> Self {
        Self::with_program("nmcli")
    }
}

impl NmcliLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `program` in place of `nmcli` from `PATH`.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            state: Mutex::new(LinkState::default()),
        }
    }

    /// Waits until the profile removal started by the last `disconnect` has
    /// run. Call before the runtime shuts down.
    pub async fn wait_teardown(&self) {
        let pending = self.state.lock().teardown.take();
        if let Some(task) = pending {
            if let Err(e) = task.await {
                warn!(error = %e, "profile removal did not finish");
            }
        }
    }
}

async fn nmcli(program: &Path, args: &[&str]) -> std::io::Result<Output> {
    debug!(?args, "nmcli");
    Command::new(program).args(args).output().await
}

fn succeeded(result: &std::io::Result<Output>) -> bool {
    matches!(result, Ok(output) if output.status.success())
}

fn log_failure(step: &str, result: &std::io::Result<Output>) {
    match result {
        Ok(output) => error!(
            step,
            status = ?output.status.code(),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "nmcli failed"
        ),
        Err(e) => error!(step, error = %e, "could not run nmcli"),
    }
}

/// Whether a profile named `ssid` appears in `nmcli -t -f NAME` output.
fn lists_profile(stdout: &[u8], ssid: &str) -> bool {
    String::from_utf8_lossy(stdout)
        .lines()
        .any(|line| line.replace("\\:", ":") == ssid)
}

async fn profile_exists(program: &Path, ssid: &str, active_only: bool) -> std::io::Result<bool> {
    let mut args = vec!["-t", "-f", "NAME", "connection", "show"];
    if active_only {
        args.push("--active");
    }
    let output = nmcli(program, &args).await?;
    Ok(lists_profile(&output.stdout, ssid))
}

/// Secrets file for `connection up ... passwd-file`. Only the owner can read
/// it, and it is removed when dropped.
fn secrets_file(password: &str) -> std::io::Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    writeln!(file, "802-11-wireless-security.psk:{password}")?;
    file.flush()?;
    Ok(file)
}

async fn establish(
    program: PathBuf,
    ssid: String,
    password: String,
    events: LinkEventSink,
    previous_teardown: Option<JoinHandle<()>>,
) {
    if let Some(task) = previous_teardown {
        debug!("waiting for previous profile removal");
        let _ = task.await;
    }

    match profile_exists(&program, &ssid, false).await {
        Ok(true) => {
            let removed = nmcli(&program, &["connection", "delete", "id", &ssid]).await;
            if !succeeded(&removed) {
                log_failure("remove", &removed);
                events.emit(LinkEvent::RemoveConfigFailed { ssid });
                return;
            }
        }
        Ok(false) => {}
        Err(e) => {
            error!(error = %e, "could not list connection profiles");
            events.emit(LinkEvent::RemoveConfigFailed { ssid });
            return;
        }
    }

    let added = nmcli(
        &program,
        &[
            "connection", "add",
            "type", "wifi",
            "con-name", &ssid,
            "ssid", &ssid,
            "wifi-sec.key-mgmt", "wpa-psk",
            "wifi-sec.psk-flags", PSK_NOT_SAVED,
            "connection.autoconnect", "no",
        ],
    )
    .await;
    if !succeeded(&added) {
        log_failure("add", &added);
        events.emit(LinkEvent::AddConfigFailed);
        return;
    }

    let secrets = match secrets_file(&password) {
        Ok(file) => file,
        Err(e) => {
            error!(error = %e, "could not write secrets file");
            events.emit(LinkEvent::EnableFailed);
            return;
        }
    };
    let secrets_path = secrets.path().to_string_lossy().into_owned();
    let wait = ACTIVATION_WAIT_SECS.to_string();
    let up = nmcli(
        &program,
        &["--wait", &wait, "connection", "up", "id", &ssid, "passwd-file", &secrets_path],
    )
    .await;
    drop(secrets);
    if !succeeded(&up) {
        log_failure("enable", &up);
        let timed_out = matches!(&up, Ok(output) if output.status.code() == Some(EXIT_TIMEOUT));
        events.emit(if timed_out {
            LinkEvent::Unavailable
        } else {
            LinkEvent::EnableFailed
        });
        return;
    }

    info!(ssid = %ssid, "wifi link up");
    if !events.emit(LinkEvent::Up) {
        return;
    }

    loop {
        tokio::time::sleep(MONITOR_INTERVAL).await;
        match profile_exists(&program, &ssid, true).await {
            Ok(true) => continue,
            Ok(false) => {
                warn!(ssid = %ssid, "wifi link lost");
                events.emit(LinkEvent::Lost);
                return;
            }
            Err(e) => warn!(error = %e, "could not poll active connections"),
        }
    }
}

impl NetworkLink for NmcliLink {
    fn connect(&self, ssid: &str, password: &str, events: LinkEventSink) {
        let mut state = self.state.lock();
        if state.active.is_some() {
            warn!(ssid, "link already pending, ignoring connect");
            return;
        }
        let task = tokio::spawn(establish(
            self.program.clone(),
            ssid.to_string(),
            password.to_string(),
            events,
            state.teardown.take(),
        ));
        state.active = Some(ActiveLink {
            ssid: ssid.to_string(),
            task,
        });
    }

    fn disconnect(&self) {
        let mut state = self.state.lock();
        let Some(link) = state.active.take() else {
            return;
        };
        link.task.abort();
        let program = self.program.clone();
        state.teardown = Some(tokio::spawn(async move {
            let deleted = nmcli(&program, &["connection", "delete", "id", &link.ssid]).await;
            if succeeded(&deleted) {
                info!(ssid = %link.ssid, "wifi profile removed");
            } else {
                log_failure("disconnect", &deleted);
            }
        }));
    }
}
