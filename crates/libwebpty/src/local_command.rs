use async_trait::async_trait;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backend::{BackendError, Factory, Slave};

const PTY_READ_CHUNK_BYTES: usize = 4096;
const IO_THREAD_STACK_BYTES: usize = 64 * 1024;

/// A local process attached to a PTY.
pub struct LocalCommand {
    command: String,
    argv: Vec<String>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    output_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: AtomicBool,
}

impl LocalCommand {
    /// Spawn `command` with `argv` on a fresh PTY of the given size.
    pub fn spawn(command: &str, argv: &[String], columns: u16, rows: u16) -> Result<Self, BackendError> {
        let pty_system = native_pty_system();
        let size = PtySize {
            rows,
            cols: columns,
            pixel_width: 0,
            pixel_height: 0,
        };

        // openpty can fail transiently under fd pressure; retry briefly.
        let mut pair = None;
        let mut last_err = None;
        for attempt in 0..5 {
            match pty_system.openpty(size) {
                Ok(opened) => {
                    pair = Some(opened);
                    break;
                }
                Err(err) => {
                    last_err = Some(err);
                    if attempt < 4 {
                        thread::sleep(Duration::from_millis(20));
                    }
                }
            }
        }
        let pair = pair.ok_or_else(|| {
            BackendError::Spawn(format!(
                "failed to open PTY: {}",
                last_err.map(|e| e.to_string()).unwrap_or_default()
            ))
        })?;

        let mut cmd = CommandBuilder::new(command);
        for arg in argv {
            cmd.arg(arg);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| BackendError::Spawn(e.to_string()))?;
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| BackendError::Spawn(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| BackendError::Spawn(e.to_string()))?;

        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(64);

        let thread_label = command.to_string();
        thread::Builder::new()
            .name(format!("webpty-io-{thread_label}"))
            .stack_size(IO_THREAD_STACK_BYTES)
            .spawn(move || {
                let mut reader = reader;
                let mut child = child;
                let mut buf = vec![0u8; PTY_READ_CHUNK_BYTES];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }

                match child.wait() {
                    Ok(status) => {
                        debug!(command = %thread_label, code = status.exit_code(), "backend exited")
                    }
                    Err(e) => warn!(command = %thread_label, error = %e, "backend wait failed"),
                }
                // output_tx drops here; the session observes EOF.
            })
            .map_err(|e| BackendError::Spawn(e.to_string()))?;

        Ok(Self {
            command: command.to_string(),
            argv: argv.to_vec(),
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            output_rx: tokio::sync::Mutex::new(output_rx),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Slave for LocalCommand {
    async fn read_output(&self) -> Option<Vec<u8>> {
        self.output_rx.lock().await.recv().await
    }

    fn write_input(&self, data: &[u8]) -> Result<(), BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Closed);
        }
        let mut writer = self.writer.lock().expect("pty writer lock poisoned");
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    fn resize_terminal(&self, columns: u16, rows: u16) -> Result<(), BackendError> {
        let size = PtySize {
            rows,
            cols: columns,
            pixel_width: 0,
            pixel_height: 0,
        };
        self.master
            .lock()
            .expect("pty master lock poisoned")
            .resize(size)
            .map_err(|e| BackendError::Spawn(e.to_string()))
    }

    fn window_title_variables(&self) -> HashMap<String, serde_json::Value> {
        let mut vars = HashMap::new();
        vars.insert("command".to_string(), self.command.clone().into());
        vars.insert("argv".to_string(), self.argv.join(" ").into());
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        vars.insert("hostname".to_string(), host.into());
        vars
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.killer.lock().expect("killer lock poisoned").kill() {
            debug!(command = %self.command, error = %e, "kill after exit");
        }
    }
}

impl Drop for LocalCommand {
    fn drop(&mut self) {
        self.close();
    }
}

/// Spawns a `LocalCommand` per session.
pub struct LocalCommandFactory {
    command: String,
    argv: Vec<String>,
    default_columns: u16,
    default_rows: u16,
}

impl LocalCommandFactory {
    pub fn new(command: String, argv: Vec<String>, default_columns: u16, default_rows: u16) -> Self {
        Self {
            command,
            argv,
            default_columns,
            default_rows,
        }
    }
}

#[async_trait]
impl Factory for LocalCommandFactory {
    fn name(&self) -> &str {
        &self.command
    }

    async fn create(
        &self,
        params: &HashMap<String, Vec<String>>,
        _headers: &HashMap<String, Vec<String>>,
    ) -> Result<Arc<dyn Slave>, BackendError> {
        let mut argv = self.argv.clone();
        if let Some(extra) = params.get("arg") {
            argv.extend(extra.iter().cloned());
        }

        let columns = first_dimension(params, "cols").unwrap_or(self.default_columns);
        let rows = first_dimension(params, "rows").unwrap_or(self.default_rows);

        let slave = LocalCommand::spawn(&self.command, &argv, columns, rows)?;
        Ok(Arc::new(slave))
    }
}

fn first_dimension(params: &HashMap<String, Vec<String>>, key: &str) -> Option<u16> {
    params
        .get(key)
        .and_then(|values| values.first())
        .and_then(|value| value.parse::<u16>().ok())
        .filter(|n| *n > 0)
}
