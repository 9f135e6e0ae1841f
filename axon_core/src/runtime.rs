//! The per-process runtime context.
//!
//! A [`Runtime`] is the explicit handle everything else hangs off: the
//! mapped segment table and the management segment. There are no ambient
//! singletons — port constructors take the runtime, and dropping it detaches
//! the process.
//!
//! Two ways in:
//! - [`Runtime::connect`] performs the broker handshake: REGISTER over the
//!   AF_UNIX control socket, receive the segment names, map everything, and
//!   keep a keepalive thread running so the broker can tell a live process
//!   from a dead one.
//! - [`Runtime::attach_local`] maps already-provisioned segments directly —
//!   the path used by tests and by the broker process itself.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::discovery::service::ServiceDescriptor;
use crate::error::{AxonError, AxonResult};
use crate::memory::platform::default_control_socket;
use crate::memory::segment::{Segment, SegmentMap, SegmentStats};
use crate::mgmt::MgmtSegment;
use crate::port::publisher::{PublisherOptions, PublisherPort};
use crate::port::subscriber::SubscriberPort;
use crate::waitset::waitset::WaitSet;

/// Interval between keepalives; a fraction of the broker's default timeout.
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(500);

/// Requests a client sends on the control socket (newline-delimited JSON).
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    Register { name: String, pid: u32 },
    Keepalive { pid: u32 },
    Deregister { pid: u32 },
}

/// Broker responses on the control socket.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Welcome {
        management_segment: String,
        payload_segments: Vec<String>,
    },
    Error {
        message: String,
    },
}

/// Write one control message and a newline.
pub fn write_control<T: Serialize>(stream: &mut impl Write, msg: &T) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    stream.write_all(&line)
}

struct ControlChannel {
    stream: UnixStream,
    stop: Arc<AtomicBool>,
    keepalive: Option<std::thread::JoinHandle<()>>,
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        let _ = write_control(
            &mut self.stream,
            &ControlRequest::Deregister {
                pid: std::process::id(),
            },
        );
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        if let Some(handle) = self.keepalive.take() {
            let _ = handle.join();
        }
    }
}

/// Process-wide AXON context.
pub struct Runtime {
    map: Arc<SegmentMap>,
    mgmt: MgmtSegment,
    _control: Option<ControlChannel>,
}

impl Runtime {
    /// Register with the broker on the default control socket.
    pub fn connect(app_name: &str) -> AxonResult<Self> {
        Self::connect_with_socket(app_name, &default_control_socket())
    }

    /// Register with the broker on a specific control socket.
    pub fn connect_with_socket(app_name: &str, socket: &Path) -> AxonResult<Self> {
        let mut stream = UnixStream::connect(socket).map_err(|e| {
            AxonError::runtime(format!(
                "broker not reachable at {}: {e} (is axond running?)",
                socket.display()
            ))
        })?;
        write_control(
            &mut stream,
            &ControlRequest::Register {
                name: app_name.to_string(),
                pid: std::process::id(),
            },
        )?;

        let mut reader = BufReader::new(stream.try_clone()?);
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let response: ControlResponse = serde_json::from_str(line.trim())
            .map_err(|e| AxonError::runtime(format!("bad broker handshake: {e}")))?;
        let (mgmt_name, payload_names) = match response {
            ControlResponse::Welcome {
                management_segment,
                payload_segments,
            } => (management_segment, payload_segments),
            ControlResponse::Error { message } => {
                return Err(AxonError::runtime(format!("broker refused: {message}")))
            }
        };

        let mut runtime = Self::attach_segments(&mgmt_name, &payload_names)?;

        // Keepalives let the broker reap us if we hang; socket close covers
        // plain termination.
        let stop = Arc::new(AtomicBool::new(false));
        let keepalive = {
            let stop = Arc::clone(&stop);
            let mut stream = stream.try_clone()?;
            std::thread::Builder::new()
                .name("axon-keepalive".to_string())
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        std::thread::sleep(KEEPALIVE_INTERVAL);
                        let msg = ControlRequest::Keepalive {
                            pid: std::process::id(),
                        };
                        if write_control(&mut stream, &msg).is_err() {
                            log::warn!("broker control socket closed; keepalive stopped");
                            return;
                        }
                    }
                })
                .map_err(AxonError::Io)?
        };
        runtime._control = Some(ControlChannel {
            stream,
            stop,
            keepalive: Some(keepalive),
        });
        Ok(runtime)
    }

    /// Map already-provisioned segments without a broker handshake.
    ///
    /// Tests and the broker process itself use this; discovery still needs
    /// someone to run a [`DiscoveryEngine`] over the same management
    /// segment.
    ///
    /// [`DiscoveryEngine`]: crate::discovery::engine::DiscoveryEngine
    pub fn attach_local(mgmt_name: &str, payload_names: &[&str]) -> AxonResult<Self> {
        let names: Vec<String> = payload_names.iter().map(|s| s.to_string()).collect();
        Self::attach_segments(mgmt_name, &names)
    }

    fn attach_segments(mgmt_name: &str, payload_names: &[String]) -> AxonResult<Self> {
        let mut segments = vec![Segment::open(mgmt_name)?];
        for name in payload_names {
            segments.push(Segment::open(name)?);
        }
        let mgmt = MgmtSegment::open(Arc::clone(&segments[0]))?;
        let map = Arc::new(SegmentMap::new(segments)?);
        Ok(Self {
            map,
            mgmt,
            _control: None,
        })
    }

    /// The process's segment mapping table.
    pub fn segment_map(&self) -> &Arc<SegmentMap> {
        &self.map
    }

    pub fn mgmt(&self) -> &MgmtSegment {
        &self.mgmt
    }

    /// Claim a publisher port for `service`.
    pub fn create_publisher(
        &self,
        service: ServiceDescriptor,
        opts: PublisherOptions,
    ) -> AxonResult<PublisherPort> {
        let (data, loc) = self.mgmt.claim_publisher(service, opts.history_capacity)?;
        // SAFETY: freshly claimed block in this runtime's management segment.
        Ok(unsafe {
            PublisherPort::from_parts(
                Arc::clone(&self.map),
                data,
                loc,
                self.mgmt.broker_notifier(),
            )
        })
    }

    /// Claim a subscriber port for `service`.
    pub fn create_subscriber(&self, service: ServiceDescriptor) -> AxonResult<SubscriberPort> {
        let (data, loc) = self.mgmt.claim_subscriber(service)?;
        // SAFETY: freshly claimed block in this runtime's management segment.
        Ok(unsafe {
            SubscriberPort::from_parts(
                Arc::clone(&self.map),
                data,
                loc,
                self.mgmt.broker_notifier(),
            )
        })
    }

    /// Claim a notifier slot and build a waitset on it.
    pub fn create_waitset(&self) -> AxonResult<WaitSet> {
        let (notifier, loc) = self.mgmt.claim_notifier()?;
        // SAFETY: freshly claimed notifier in this runtime's management
        // segment.
        Ok(unsafe { WaitSet::from_parts(Arc::clone(&self.map), notifier, loc) })
    }

    /// Pool usage counters for every mapped payload segment.
    pub fn stats(&self) -> Vec<SegmentStats> {
        self.map.stats()
    }
}
