//! Per-port serial link management and the MicroPython raw-REPL codec.
//!
//! A [`Session`] owns one serial link end to end: connect/disconnect,
//! a background reader that captures device output into a ring buffer,
//! and the raw-REPL dialogue used by [`Session::execute`] and by the
//! file-transfer engine built on top of it.
//!
//! The central invariant is that the background reader is never running
//! while a synchronous exchange (execute, info probe, reset) is reading
//! the same stream — see [`Session::with_reader_paused`].

pub mod codec;
pub mod sim;

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use event_bus::{EventBus, EventKind};
use repl_proto::{DeviceInfo, DeviceState};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;

/// Output lines retained per device, oldest discarded first.
const OUTPUT_RING_CAPACITY: usize = 1000;

/// Interval the background reader waits for data before checking for
/// cancellation again. Short enough that `pause_reader` returns promptly.
const READER_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to open {port_id}: {message}")]
    Connect { port_id: String, message: String },
    #[error("write failed: {0}")]
    Write(String),
    #[error("session is not connected")]
    NotConnected,
}

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

struct ReaderHandle {
    handle: JoinHandle<()>,
}

impl ReaderHandle {
    /// Cancel the reader task and wait for it to actually stop. Aborting
    /// is safe here because every await point inside the reader loop
    /// (the shared-mutex lock and the timed read) is cancel-safe: dropping
    /// the future mid-poll releases the mutex guard cleanly.
    async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

/// An open connection to one MicroPython device.
pub struct Session {
    pub port_id: String,
    pub baudrate: u32,
    bus: Arc<EventBus>,
    state: RwLock<DeviceState>,
    info: RwLock<DeviceInfo>,
    reader: Arc<AsyncMutex<BoxedReader>>,
    writer: Arc<AsyncMutex<BoxedWriter>>,
    reader_task: AsyncMutex<Option<ReaderHandle>>,
    ring: Arc<std::sync::Mutex<VecDeque<String>>>,
    in_raw_mode: std::sync::atomic::AtomicBool,
    /// Serializes raw-REPL exchanges on this device: two concurrent
    /// `execute` calls queue rather than interleave.
    codec_lock: AsyncMutex<()>,
}

impl Session {
    /// Build a session around an already-open transport. Used both by
    /// [`connect`] (real serial ports) and by tests with
    /// [`sim::spawn_simulated_device`].
    pub fn from_transport(
        bus: Arc<EventBus>,
        port_id: String,
        baudrate: u32,
        reader: BoxedReader,
        writer: BoxedWriter,
    ) -> Arc<Session> {
        let session = Arc::new(Session {
            port_id,
            baudrate,
            bus,
            state: RwLock::new(DeviceState::Connected),
            info: RwLock::new(DeviceInfo::default()),
            reader: Arc::new(AsyncMutex::new(reader)),
            writer: Arc::new(AsyncMutex::new(writer)),
            reader_task: AsyncMutex::new(None),
            ring: Arc::new(std::sync::Mutex::new(VecDeque::with_capacity(
                OUTPUT_RING_CAPACITY,
            ))),
            in_raw_mode: std::sync::atomic::AtomicBool::new(false),
            codec_lock: AsyncMutex::new(()),
        });
        Session::spawn_reader(&session);
        session
    }

    fn spawn_reader(self: &Arc<Self>) {
        let reader = Arc::clone(&self.reader);
        let ring = Arc::clone(&self.ring);
        let bus = Arc::clone(&self.bus);
        let session = Arc::clone(self);
        let port_id = self.port_id.clone();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                let read_result = {
                    let mut guard = reader.lock().await;
                    tokio::time::timeout(READER_POLL_INTERVAL, guard.read(&mut buf)).await
                };
                match read_result {
                    Ok(Ok(0)) => {
                        // Reader EOF: the device closed the connection out
                        // from under us. This is the "device fatal" case
                        // (§7), distinct from a transient read error, so the
                        // session moves to ERROR rather than staying CONNECTED.
                        session.set_state(DeviceState::Error).await;
                        bus.emit(
                            EventKind::DeviceError,
                            json!({ "message": "device closed the connection" }),
                            Some(port_id.clone()),
                        );
                        break;
                    }
                    Ok(Ok(n)) => {
                        let text = String::from_utf8_lossy(&buf[..n]).to_string();
                        {
                            let mut ring = ring.lock().expect("output ring poisoned");
                            ring.push_back(text.clone());
                            while ring.len() > OUTPUT_RING_CAPACITY {
                                ring.pop_front();
                            }
                        }
                        bus.emit(
                            EventKind::DeviceOutput,
                            json!({ "text": text }),
                            Some(port_id.clone()),
                        );
                    }
                    Ok(Err(error)) => {
                        tracing::warn!(port = %port_id, %error, "serial read error");
                    }
                    Err(_timeout) => {}
                }
            }
        });
        // Called either from the constructor (no contention possible yet) or
        // from `resume_reader`, which only runs after `pause_reader` has
        // taken and dropped the previous guard. Either way the lock is free.
        let mut guard = self
            .reader_task
            .try_lock()
            .expect("reader_task lock unexpectedly contended in spawn_reader");
        *guard = Some(ReaderHandle { handle });
    }

    pub async fn state(&self) -> DeviceState {
        *self.state.read().await
    }

    pub async fn info(&self) -> DeviceInfo {
        self.info.read().await.clone()
    }

    async fn set_state(&self, state: DeviceState) {
        *self.state.write().await = state;
    }

    /// Stop the background reader and wait for it to fully join, run `f`,
    /// then restart the reader. `f` is the only code permitted to read
    /// from the transport directly while this call is in flight.
    pub async fn with_reader_paused<F, Fut, T>(self: &Arc<Self>, f: F) -> T
    where
        F: FnOnce(Arc<Session>) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        self.pause_reader().await;
        let result = f(Arc::clone(self)).await;
        self.resume_reader();
        result
    }

    async fn pause_reader(&self) {
        if let Some(handle) = self.reader_task.lock().await.take() {
            handle.stop().await;
        }
    }

    fn resume_reader(self: &Arc<Self>) {
        Session::spawn_reader(self);
    }

    /// Write raw bytes to the device. Callers inside a paused reader
    /// section and the public `write`/`write_line` API both funnel here.
    /// A write failure is device-fatal (§7): the closed port is not going to
    /// recover on the next call, so the session moves to `ERROR`.
    pub async fn write_bytes(&self, bytes: &[u8]) -> Result<(), SessionError> {
        let mut writer = self.writer.lock().await;
        let result = async {
            writer
                .write_all(bytes)
                .await
                .map_err(|e| SessionError::Write(e.to_string()))?;
            writer
                .flush()
                .await
                .map_err(|e| SessionError::Write(e.to_string()))
        }
        .await;
        if let Err(ref e) = result {
            self.set_state(DeviceState::Error).await;
            self.bus.emit(
                EventKind::DeviceError,
                json!({ "message": e.to_string() }),
                Some(self.port_id.clone()),
            );
        }
        result
    }

    pub async fn write_line(&self, line: &str) -> Result<(), SessionError> {
        self.write_bytes(line.as_bytes()).await?;
        self.write_bytes(b"\r\n").await
    }

    /// Ctrl-C: interrupt any running program. Does not wait for a response.
    pub async fn interrupt(&self) -> Result<(), SessionError> {
        self.write_bytes(&[0x03]).await?;
        self.bus.emit(
            EventKind::DeviceInterrupted,
            json!({}),
            Some(self.port_id.clone()),
        );
        Ok(())
    }

    /// Soft (Ctrl-D) or hard (`machine.reset()`) reset. Soft is the
    /// spec-mandated default; hard is an explicit caller opt-in.
    pub async fn reset(self: &Arc<Self>, soft: bool) -> Result<(), SessionError> {
        self.with_reader_paused(|session| async move {
            session.in_raw_mode.store(false, std::sync::atomic::Ordering::SeqCst);
            if soft {
                session.write_bytes(&[0x04]).await?;
            } else {
                session.write_bytes(b"\r\nimport machine; machine.reset()\r\n").await?;
            }
            let _ = codec::read_until_any(
                &session.reader,
                Duration::from_secs(3),
                &["MicroPython", ">>>"],
            )
            .await;
            Ok(())
        })
        .await?;
        self.bus.emit(
            EventKind::DeviceReset,
            json!({ "soft": soft }),
            Some(self.port_id.clone()),
        );
        Ok(())
    }

    /// Execute Python source via the raw REPL and return its result.
    pub async fn execute(
        self: &Arc<Self>,
        source: &str,
        timeout: Duration,
    ) -> repl_proto::ReplResult {
        let _serialize = self.codec_lock.lock().await;
        self.with_reader_paused(|session| async move {
            codec::execute(&session, source, timeout).await
        })
        .await
    }

    /// Fallback used only when raw mode is unreachable: submit `source`
    /// line by line through the friendly REPL and classify failure by
    /// scanning the captured text for a traceback.
    pub async fn execute_friendly(self: &Arc<Self>, source: &str) -> repl_proto::ReplResult {
        let _serialize = self.codec_lock.lock().await;
        self.with_reader_paused(|session| async move {
            codec::execute_friendly(&session, source).await
        })
        .await
    }

    /// Probe `sys.version`/`sys.platform`/`os.uname()` right after connect.
    /// Failures are non-fatal: the session still reaches `Connected`.
    pub async fn probe_info(self: &Arc<Self>) {
        let result = self
            .execute(
                "import sys, os\nprint(sys.version)\nprint(sys.platform)\ntry:\n    print(os.uname().machine)\nexcept Exception:\n    print('')\n",
                Duration::from_secs(3),
            )
            .await;
        if !result.success {
            return;
        }
        let mut lines = result.output.lines();
        let version = lines.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        let platform = lines.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        let machine = lines.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        *self.info.write().await = DeviceInfo {
            version,
            platform,
            machine,
        };
    }

    /// Snapshot of captured output, optionally clearing the ring.
    pub fn get_output(&self, clear: bool) -> String {
        let mut ring = self.ring.lock().expect("output ring poisoned");
        let joined: String = ring.iter().cloned().collect();
        if clear {
            ring.clear();
        }
        joined
    }

    /// Disconnect: stop the reader, mark disconnected, emit the event.
    /// Write errors during the final flush are ignored.
    pub async fn disconnect(self: &Arc<Self>) {
        self.pause_reader().await;
        self.set_state(DeviceState::Disconnected).await;
        self.bus.emit(
            EventKind::DeviceDisconnected,
            json!({}),
            Some(self.port_id.clone()),
        );
    }
}

/// Open a real serial port and bring up a session.
pub async fn connect(
    bus: Arc<EventBus>,
    port_id: &str,
    baudrate: u32,
) -> Result<Arc<Session>, SessionError> {
    bus.emit(
        EventKind::DeviceConnecting,
        json!({}),
        Some(port_id.to_string()),
    );
    let port = tokio_serial::new(port_id, baudrate)
        .timeout(Duration::from_millis(50))
        .open_native_async()
        .map_err(|e| SessionError::Connect {
            port_id: port_id.to_string(),
            message: e.to_string(),
        })?;
    let (read_half, write_half) = tokio::io::split(port);
    let session = Session::from_transport(
        bus.clone(),
        port_id.to_string(),
        baudrate,
        Box::pin(read_half),
        Box::pin(write_half),
    );
    session.probe_info().await;
    bus.emit(
        EventKind::DeviceConnected,
        json!({ "baudrate": baudrate }),
        Some(port_id.to_string()),
    );
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn reader_captures_output_into_ring() {
        let bus = Arc::new(EventBus::new());
        bus.start();
        let (session, mut device) = sim::spawn_simulated_device(bus, "SIMPORT".into());
        device.push_raw(b"hello from device\r\n").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.get_output(false).contains("hello from device"));
    }

    #[tokio::test]
    async fn execute_round_trips_through_simulated_raw_repl() {
        let bus = Arc::new(EventBus::new());
        bus.start();
        let (session, _device) = sim::spawn_simulated_device(bus, "SIMPORT".into());
        let result = session
            .execute("print('hi')", Duration::from_secs(2))
            .await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.output.trim(), "hi");
    }

    #[tokio::test]
    async fn execute_reports_device_side_error() {
        let bus = Arc::new(EventBus::new());
        bus.start();
        let (session, _device) = sim::spawn_simulated_device(bus, "SIMPORT".into());
        let result = session
            .execute("raise ValueError('boom')", Duration::from_secs(2))
            .await;
        assert!(!result.success);
        assert!(result.error.contains("boom"));
    }

    #[tokio::test]
    async fn execute_times_out_when_device_never_acks() {
        let bus = Arc::new(EventBus::new());
        bus.start();
        let (session, _device) = sim::spawn_simulated_device(bus, "SIMPORT".into());
        let started = std::time::Instant::now();
        let result = session
            .execute("while True: pass", Duration::from_millis(300))
            .await;
        assert!(!result.success);
        assert!(result.error.contains("timeout"), "{result:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn interrupt_after_timeout_recovers_the_session() {
        let bus = Arc::new(EventBus::new());
        bus.start();
        let (session, _device) = sim::spawn_simulated_device(bus, "SIMPORT".into());
        let timed_out = session
            .execute("while True: pass", Duration::from_millis(300))
            .await;
        assert!(!timed_out.success);

        session.interrupt().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = session.execute("print('ok')", Duration::from_secs(2)).await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.output.trim(), "ok");
    }

    #[tokio::test]
    async fn reader_is_not_running_during_execute() {
        let bus = Arc::new(EventBus::new());
        bus.start();
        let (session, _device) = sim::spawn_simulated_device(bus, "SIMPORT".into());
        assert!(session.reader_task.lock().await.is_some());
        let fut = session.execute("print(1)", Duration::from_secs(2));
        tokio::pin!(fut);
        // Poll once to let with_reader_paused take the reader handle.
        let _ = std::future::poll_fn(|cx| {
            let _ = fut.as_mut().poll(cx);
            std::task::Poll::Ready(())
        })
        .await;
        assert!(session.reader_task.lock().await.is_none());
        let _ = fut.await;
        assert!(session.reader_task.lock().await.is_some());
    }
}
