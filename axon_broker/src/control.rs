//! The broker's control endpoint: an AF_UNIX listener for client
//! registration, keepalives, and deregistration.
//!
//! Per-client threads parse newline-delimited JSON (`ControlRequest`) and
//! forward events to the broker's main loop over an mpsc channel; the
//! REGISTER response (segment names) is written directly from the client
//! thread. A closed socket counts as a deregistration — that is how plain
//! process death is detected promptly.

use std::io::{BufRead, BufReader};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

use axon_core::runtime::{write_control, ControlRequest, ControlResponse};
use axon_core::{AxonError, AxonResult};

/// Events surfaced to the broker main loop.
#[derive(Debug)]
pub enum ClientEvent {
    Registered { pid: u32, name: String },
    Keepalive { pid: u32 },
    Disconnected { pid: u32 },
}

/// Segment names handed to registering clients.
#[derive(Clone)]
pub struct WelcomeInfo {
    pub management_segment: String,
    pub payload_segments: Vec<String>,
}

/// The listening endpoint. Dropping it removes the socket file.
pub struct ControlServer {
    path: PathBuf,
    _accept_thread: std::thread::JoinHandle<()>,
}

impl ControlServer {
    /// Bind the socket and start accepting clients.
    pub fn start(
        path: &Path,
        welcome: WelcomeInfo,
        events: Sender<ClientEvent>,
    ) -> AxonResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // A previous run may have left the socket file behind.
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path).map_err(|e| {
            AxonError::runtime(format!("cannot bind control socket {}: {e}", path.display()))
        })?;
        log::info!("control socket listening at {}", path.display());

        let accept_thread = std::thread::Builder::new()
            .name("axond-accept".to_string())
            .spawn(move || {
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => {
                            let welcome = welcome.clone();
                            let events = events.clone();
                            let spawned = std::thread::Builder::new()
                                .name("axond-client".to_string())
                                .spawn(move || serve_client(stream, welcome, events));
                            if let Err(e) = spawned {
                                log::error!("cannot spawn client thread: {e}");
                            }
                        }
                        Err(e) => {
                            log::warn!("control accept failed: {e}");
                            return;
                        }
                    }
                }
            })
            .map_err(AxonError::Io)?;

        Ok(Self {
            path: path.to_path_buf(),
            _accept_thread: accept_thread,
        })
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Per-client read loop.
fn serve_client(stream: UnixStream, welcome: WelcomeInfo, events: Sender<ClientEvent>) {
    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(e) => {
            log::warn!("client stream clone failed: {e}");
            return;
        }
    };
    let reader = BufReader::new(stream);
    let mut registered_pid: Option<u32> = None;

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let request: ControlRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("malformed control request: {e}");
                let _ = write_control(
                    &mut writer,
                    &ControlResponse::Error {
                        message: format!("malformed request: {e}"),
                    },
                );
                continue;
            }
        };
        match request {
            ControlRequest::Register { name, pid } => {
                let response = ControlResponse::Welcome {
                    management_segment: welcome.management_segment.clone(),
                    payload_segments: welcome.payload_segments.clone(),
                };
                if write_control(&mut writer, &response).is_err() {
                    break;
                }
                registered_pid = Some(pid);
                if events.send(ClientEvent::Registered { pid, name }).is_err() {
                    return; // broker shutting down
                }
            }
            ControlRequest::Keepalive { pid } => {
                if events.send(ClientEvent::Keepalive { pid }).is_err() {
                    return;
                }
            }
            ControlRequest::Deregister { pid } => {
                let _ = events.send(ClientEvent::Disconnected { pid });
                return;
            }
        }
    }

    // EOF or error without a clean deregister: the process is gone.
    if let Some(pid) = registered_pid {
        let _ = events.send(ClientEvent::Disconnected { pid });
    }
}
