//! Serialized command writer.
//!
//! Commands are written through a shared handle guarded by a mutex so that
//! any number of contexts can send concurrently without interleaving bytes:
//!
//! ```text
//! Session       ─┐
//! Policy task 1 ─┼─► CommandWriter (Arc<Mutex<W>>) ─► Device
//! Policy task N ─┘
//! ```
//!
//! Each command is encoded into a single buffer and handed to the sink in
//! exactly one `write` call. The driver consumes a command per write, so a
//! short write cannot be completed by writing the tail later; it is reported
//! as [`KextError::ShortWrite`] instead of retried.

use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::error::{KextError, Result};
use crate::protocol::{Command, RedirectV4, RedirectV6, UpdateV4, UpdateV6, Verdict};

/// Handle for sending commands to the driver.
///
/// This is cheaply cloneable and can be shared across tasks and threads.
#[derive(Debug)]
pub struct CommandWriter<W> {
    sink: Arc<Mutex<W>>,
}

impl<W> Clone for CommandWriter<W> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
        }
    }
}

impl<W: Write> CommandWriter<W> {
    /// Wrap a byte sink.
    pub fn new(sink: W) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    /// Encode `command` and write it with a single call.
    ///
    /// # Errors
    ///
    /// - [`KextError::ShortWrite`] if the sink accepted fewer bytes than the
    ///   command occupies.
    /// - [`KextError::Io`] if the write fails.
    pub fn send(&self, command: &Command) -> Result<()> {
        let bytes = command.encode();

        let written = {
            let mut sink = self.lock();
            sink.write(&bytes)?
        };

        if written != bytes.len() {
            return Err(KextError::ShortWrite {
                expected: bytes.len(),
                written,
            });
        }

        debug!(command = ?command.command_type(), len = written, "command sent");
        Ok(())
    }

    /// Ask the driver to shut down.
    pub fn shutdown(&self) -> Result<()> {
        self.send(&Command::Shutdown)
    }

    /// Deliver a verdict for a pending connection.
    pub fn verdict(&self, id: u64, verdict: Verdict) -> Result<()> {
        self.send(&Command::verdict(id, verdict))
    }

    pub fn redirect_v4(&self, redirect: RedirectV4) -> Result<()> {
        self.send(&Command::RedirectV4(redirect))
    }

    pub fn redirect_v6(&self, redirect: RedirectV6) -> Result<()> {
        self.send(&Command::RedirectV6(redirect))
    }

    /// Change the cached verdict of an already established connection.
    pub fn update_v4(&self, update: UpdateV4) -> Result<()> {
        self.send(&Command::UpdateV4(update))
    }

    pub fn update_v6(&self, update: UpdateV6) -> Result<()> {
        self.send(&Command::UpdateV6(update))
    }

    /// Drop every cached verdict in the driver.
    pub fn clear_cache(&self) -> Result<()> {
        self.send(&Command::ClearCache)
    }

    pub fn get_logs(&self) -> Result<()> {
        self.send(&Command::GetLogs)
    }

    pub fn get_bandwidth_stats(&self) -> Result<()> {
        self.send(&Command::GetBandwidthStats)
    }

    /// Request counters for connections active since `threshold`.
    ///
    /// The reply is a run of update frames closed by `ConnectionUpdateEnd`.
    /// When batching is enabled prefer
    /// [`Session::get_connections_update`](crate::session::Session::get_connections_update),
    /// which also registers the pending request.
    pub fn get_connections_update(&self, threshold: u64) -> Result<()> {
        self.send(&Command::GetConnectionsUpdate { threshold })
    }

    pub fn clean_ended_connections(&self) -> Result<()> {
        self.send(&Command::CleanEndedConnections)
    }

    pub fn print_memory_stats(&self) -> Result<()> {
        self.send(&Command::PrintMemoryStats)
    }

    /// Run `f` with exclusive access to the sink.
    pub fn with_sink<T>(&self, f: impl FnOnce(&mut W) -> T) -> T {
        f(&mut self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, W> {
        // A panic while holding the lock cannot leave a half-written command
        // behind: the single write either happened or it did not.
        self.sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
