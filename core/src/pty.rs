//! PTY channel: attach a pseudo-terminal to an existing tmux session and
//! bridge it to the async side. The reader runs in a blocking thread and
//! feeds a bounded channel; writes go through a dedicated writer thread so
//! input stays ordered without blocking the connection task; resize has its
//! own thread running `master.resize`.
//!
//! `pause`/`resume` gate the reader: while paused it stops pulling from the
//! PTY, tmux blocks writing to the tty, and output buffers upstream. That
//! is the cooperative flow control the gateway's backpressure relies on.

use std::io::{Read, Write};
use std::sync::{self, Arc, Condvar, Mutex};

use bytes::Bytes;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::sync::{mpsc, watch};

/// Chunks buffered between the reader thread and the connection task.
const OUTPUT_CHANNEL_CAP: usize = 256;

/// Read unit for the PTY master.
const READ_BUF_SIZE: usize = 8192;

/// Exit notification delivered once through the watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtyExit {
    pub exit_code: u32,
}

/// Reader gate for pause/resume. The reader thread waits here between
/// reads; `resume` wakes it.
#[derive(Default)]
struct PauseGate {
    paused: Mutex<bool>,
    resumed: Condvar,
}

impl PauseGate {
    fn pause(&self) {
        *self.paused.lock().expect("pause gate mutex") = true;
    }

    fn resume(&self) {
        let mut paused = self.paused.lock().expect("pause gate mutex");
        *paused = false;
        self.resumed.notify_all();
    }

    /// Block the calling (reader) thread while paused.
    fn wait_if_paused(&self) {
        let mut paused = self.paused.lock().expect("pause gate mutex");
        while *paused {
            paused = self.resumed.wait(paused).expect("pause gate wait");
        }
    }

    fn is_paused(&self) -> bool {
        *self.paused.lock().expect("pause gate mutex")
    }
}

/// Handle to an attached PTY. Dropping does not kill the tmux session;
/// `kill` terminates only the attach client.
pub struct PtyChannel {
    input_tx: sync::mpsc::Sender<Vec<u8>>,
    resize_tx: sync::mpsc::Sender<(u16, u16)>,
    gate: Arc<PauseGate>,
    killer: Mutex<Box<dyn portable_pty::ChildKiller + Send + Sync>>,
}

/// `tmux attach` command for an exact-named session, presenting as a
/// modern 256/truecolor terminal (matches xterm.js). TMUX is unset to
/// avoid nested-session refusal when the gateway itself runs under tmux.
fn attach_command(name: &str) -> CommandBuilder {
    let mut cmd = CommandBuilder::new("tmux");
    cmd.arg("attach-session");
    cmd.arg("-t");
    cmd.arg(format!("={name}"));
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
    cmd.env_remove("TMUX");
    cmd
}

impl PtyChannel {
    /// Attach to `name` at the given size. Returns the channel handle, the
    /// output receiver, and the exit watch (None until the client exits).
    pub fn attach(
        name: &str,
        cols: u16,
        rows: u16,
    ) -> anyhow::Result<(Self, mpsc::Receiver<Bytes>, watch::Receiver<Option<PtyExit>>)> {
        let pty_system = native_pty_system();
        let pair = pty_system.openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })?;

        let child = pair.slave.spawn_command(attach_command(name))?;
        let killer = child.clone_killer();
        drop(pair.slave);

        let mut reader = pair.master.try_clone_reader()?;
        let mut writer = pair.master.take_writer()?;
        let master = pair.master;

        let (output_tx, output_rx) = mpsc::channel::<Bytes>(OUTPUT_CHANNEL_CAP);
        let (input_tx, input_rx) = sync::mpsc::channel::<Vec<u8>>();
        let (resize_tx, resize_rx) = sync::mpsc::channel::<(u16, u16)>();
        let (exit_tx, exit_rx) = watch::channel::<Option<PtyExit>>(None);

        let gate = Arc::new(PauseGate::default());

        // Blocking reader: PTY output to the async side, honoring the gate.
        let reader_gate = Arc::clone(&gate);
        std::thread::spawn(move || {
            let mut buf = [0u8; READ_BUF_SIZE];
            loop {
                reader_gate.wait_if_paused();
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        // Writer thread: ordered input delivery without blocking the
        // connection task.
        std::thread::spawn(move || {
            while let Ok(data) = input_rx.recv() {
                if writer.write_all(&data).is_err() || writer.flush().is_err() {
                    break;
                }
            }
        });

        // Resize thread: owns the master after reader/writer are split off.
        std::thread::spawn(move || {
            while let Ok((cols, rows)) = resize_rx.recv() {
                let _ = master.resize(PtySize {
                    cols,
                    rows,
                    pixel_width: 0,
                    pixel_height: 0,
                });
            }
        });

        // Wait thread: one exit notification when the attach client ends.
        let mut wait_child = child;
        std::thread::spawn(move || {
            let exit_code = match wait_child.wait() {
                Ok(status) => status.exit_code(),
                Err(_) => 1,
            };
            let _ = exit_tx.send(Some(PtyExit { exit_code }));
        });

        Ok((
            Self {
                input_tx,
                resize_tx,
                gate,
                killer: Mutex::new(killer),
            },
            output_rx,
            exit_rx,
        ))
    }

    /// Queue user input for the session. Ordered per connection; errors
    /// only after the writer thread has gone away (client exited).
    pub fn write(&self, data: &[u8]) {
        let _ = self.input_tx.send(data.to_vec());
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        let _ = self.resize_tx.send((cols, rows));
    }

    pub fn pause(&self) {
        self.gate.pause();
    }

    pub fn resume(&self) {
        self.gate.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    /// Terminate the attach client. The tmux session stays alive; that is
    /// the whole point of resume.
    pub fn kill(&self) {
        if let Ok(mut killer) = self.killer.lock() {
            let _ = killer.kill();
        }
        // A paused reader would otherwise never observe EOF.
        self.gate.resume();
    }
}

impl Drop for PtyChannel {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_pause_resume_state() {
        let gate = PauseGate::default();
        assert!(!gate.is_paused());
        gate.pause();
        assert!(gate.is_paused());
        gate.resume();
        assert!(!gate.is_paused());
    }

    #[test]
    fn gate_unblocks_waiting_thread_on_resume() {
        let gate = Arc::new(PauseGate::default());
        gate.pause();

        let waiter_gate = Arc::clone(&gate);
        let handle = std::thread::spawn(move || {
            waiter_gate.wait_if_paused();
            true
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!handle.is_finished());
        gate.resume();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn attach_command_targets_exact_name() {
        let cmd = attach_command("webmux-abc");
        let argv = cmd.get_argv();
        assert_eq!(argv[0].to_str(), Some("tmux"));
        assert!(argv.iter().any(|a| a.to_str() == Some("attach-session")));
        assert!(argv.iter().any(|a| a.to_str() == Some("=webmux-abc")));
    }
}
