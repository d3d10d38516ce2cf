//! Recording lifecycle and destinations.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};

use parking_lot::Mutex;
use tracing::{debug, info};
use url::Url;

use streamer_ipc::{ConnectionId, ConnectionState, RecordState};

use crate::error::SessionError;
use crate::SessionResult;

/// A record state change to report to the delegate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordChange {
    pub state: RecordState,
    pub url: Option<Url>,
}

/// Recording lifecycle for one connection.
///
/// `Initialized → Started → Stopped | Failed`. A terminal record may be
/// replaced by a fresh recording while the connection is in `Record`.
#[derive(Debug, Default)]
pub struct RecordTracker {
    state: RecordState,
    url: Option<Url>,
}

impl RecordTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    /// Destination of the current or last recording.
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Check that a recording may start given the connection state.
    pub fn ensure_startable(&self, connection: ConnectionState) -> SessionResult<()> {
        if !connection.is_recordable() || self.is_active() {
            return Err(SessionError::NotRecordable);
        }
        Ok(())
    }

    /// The destination opened successfully.
    pub fn started(&mut self, url: Url) -> RecordChange {
        self.change(RecordState::Started, Some(url))
    }

    /// The destination could not be opened.
    pub fn open_failed(&mut self, url: Url) -> RecordChange {
        self.change(RecordState::Failed, Some(url))
    }

    /// Stop a running recording. `None` if nothing is running.
    pub fn stop(&mut self) -> Option<RecordChange> {
        if !self.is_active() {
            return None;
        }
        let url = self.url.clone();
        Some(self.change(RecordState::Stopped, url))
    }

    /// A running recording hit a write failure. `None` if nothing is running.
    pub fn fail(&mut self) -> Option<RecordChange> {
        if !self.is_active() {
            return None;
        }
        let url = self.url.clone();
        Some(self.change(RecordState::Failed, url))
    }

    fn change(&mut self, state: RecordState, url: Option<Url>) -> RecordChange {
        debug!(from = ?self.state, to = ?state, "Record state transition");
        self.state = state;
        self.url = url.clone();
        RecordChange { state, url }
    }
}

/// Destination a recording writes to.
pub trait Recorder: Send + Sync {
    /// Open the destination for `connection_id`.
    fn open(&self, connection_id: ConnectionId, url: &Url) -> io::Result<()>;

    /// Release the destination. Safe to call for an unknown id.
    fn close(&self, connection_id: ConnectionId);
}

/// Records to local files addressed by `file://` URLs.
#[derive(Debug, Default)]
pub struct FileRecorder {
    files: Mutex<HashMap<ConnectionId, File>>,
}

impl FileRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append muxed bytes to the open recording of `connection_id`.
    pub fn write(&self, connection_id: ConnectionId, data: &[u8]) -> io::Result<()> {
        let mut files = self.files.lock();
        let file = files
            .get_mut(&connection_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no open recording"))?;
        file.write_all(data)
    }

    pub fn is_open(&self, connection_id: ConnectionId) -> bool {
        self.files.lock().contains_key(&connection_id)
    }
}

impl Recorder for FileRecorder {
    fn open(&self, connection_id: ConnectionId, url: &Url) -> io::Result<()> {
        if url.scheme() != "file" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported record scheme: {}", url.scheme()),
            ));
        }
        let path = url
            .to_file_path()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "record URL is not a local path"))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        info!(%connection_id, path = %path.display(), "Recording opened");

        self.files.lock().insert(connection_id, file);
        Ok(())
    }

    fn close(&self, connection_id: ConnectionId) {
        if let Some(mut file) = self.files.lock().remove(&connection_id) {
            let _ = file.flush();
            info!(%connection_id, "Recording closed");
        }
    }
}
