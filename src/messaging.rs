/*!
Messaging: line-oriented RPC between a checker child and the fleet parent.

One message per line over a pair of named pipes. The parent creates the
pipes and advertises their names through the dynamic PP file (`O`/`I`
directives); the child connects after loading that file. Child-to-parent
traffic carries liveness, progress estimates, newly discovered preemption
points, and bug reports; the parent only ever asks for progress or tells
the child to die.

Unknown inbound lines are warned about and skipped on both sides, so a
version-skewed peer degrades instead of wedging the fleet.
*/

use std::ffi::CString;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::sched::ThreadId;

#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("pipe i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("unparseable message: {0:?}")]
    Parse(String),
}

// ---------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub enum ChildMessage {
    Alive,
    Progress {
        branches: u32,
        proportion: f64,
        elapsed_usecs: u64,
        eta_usecs: u64,
        icb_bound: u32,
    },
    PpDiscovered {
        eip: u32,
        /// `None` encodes the wildcard tid on the wire (-1).
        tid: Option<ThreadId>,
        last_call: u32,
        most_recent_syscall: u32,
    },
    BugFound {
        trace_path: String,
        fab_timestamp: u64,
        fab_cputime: u64,
    },
    TimedOut,
    NeedRerun,
    Exiting,
}

impl fmt::Display for ChildMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildMessage::Alive => write!(f, "alive"),
            ChildMessage::Progress {
                branches,
                proportion,
                elapsed_usecs,
                eta_usecs,
                icb_bound,
            } => write!(
                f,
                "progress {branches} {proportion} {elapsed_usecs} {eta_usecs} {icb_bound}"
            ),
            ChildMessage::PpDiscovered {
                eip,
                tid,
                last_call,
                most_recent_syscall,
            } => {
                let tid = tid.map_or(-1, |t| t as i64);
                write!(f, "pp {eip:x} {tid} {last_call:x} {most_recent_syscall}")
            }
            ChildMessage::BugFound {
                trace_path,
                fab_timestamp,
                fab_cputime,
            } => write!(f, "bug {trace_path} {fab_timestamp} {fab_cputime}"),
            ChildMessage::TimedOut => write!(f, "timeout"),
            ChildMessage::NeedRerun => write!(f, "rerun"),
            ChildMessage::Exiting => write!(f, "exiting"),
        }
    }
}

impl FromStr for ChildMessage {
    type Err = MessagingError;

    fn from_str(line: &str) -> Result<Self, MessagingError> {
        let bad = || MessagingError::Parse(line.to_owned());
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("alive") => Ok(ChildMessage::Alive),
            Some("progress") => {
                let mut next = || parts.next().ok_or_else(|| bad());
                Ok(ChildMessage::Progress {
                    branches: next()?.parse().map_err(|_| bad())?,
                    proportion: next()?.parse().map_err(|_| bad())?,
                    elapsed_usecs: next()?.parse().map_err(|_| bad())?,
                    eta_usecs: next()?.parse().map_err(|_| bad())?,
                    icb_bound: next()?.parse().map_err(|_| bad())?,
                })
            }
            Some("pp") => {
                let mut next = || parts.next().ok_or_else(|| bad());
                let eip = u32::from_str_radix(next()?, 16).map_err(|_| bad())?;
                let tid: i64 = next()?.parse().map_err(|_| bad())?;
                let last_call = u32::from_str_radix(next()?, 16).map_err(|_| bad())?;
                let most_recent_syscall = next()?.parse().map_err(|_| bad())?;
                Ok(ChildMessage::PpDiscovered {
                    eip,
                    tid: u32::try_from(tid).ok(),
                    last_call,
                    most_recent_syscall,
                })
            }
            Some("bug") => {
                let mut next = || parts.next().ok_or_else(|| bad());
                Ok(ChildMessage::BugFound {
                    trace_path: next()?.to_owned(),
                    fab_timestamp: next()?.parse().map_err(|_| bad())?,
                    fab_cputime: next()?.parse().map_err(|_| bad())?,
                })
            }
            Some("timeout") => Ok(ChildMessage::TimedOut),
            Some("rerun") => Ok(ChildMessage::NeedRerun),
            Some("exiting") => Ok(ChildMessage::Exiting),
            _ => Err(bad()),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParentMessage {
    RequestProgress,
    PleaseDie,
}

impl fmt::Display for ParentMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParentMessage::RequestProgress => write!(f, "request_progress"),
            ParentMessage::PleaseDie => write!(f, "please_die"),
        }
    }
}

impl FromStr for ParentMessage {
    type Err = MessagingError;

    fn from_str(line: &str) -> Result<Self, MessagingError> {
        match line.trim_end() {
            "request_progress" => Ok(ParentMessage::RequestProgress),
            "please_die" => Ok(ParentMessage::PleaseDie),
            _ => Err(MessagingError::Parse(line.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------
// Child endpoint
// ---------------------------------------------------------------------

/// Checker-side endpoint. Sends are synchronous writes on the hot path's
/// edge; receives are strictly non-blocking polls, because the checker is
/// single-threaded and must never stall the simulator.
pub struct ChildMessenger {
    output: File,
    input: File,
    input_buf: Vec<u8>,
}

impl ChildMessenger {
    /// Connect to the pipes the parent advertised. Opening our write end
    /// blocks until the parent's reader arrives, which doubles as the
    /// startup handshake barrier; `alive` is sent immediately after.
    pub fn connect(input: &Path, output: &Path) -> Result<Self, MessagingError> {
        let output = OpenOptions::new().write(true).open(output)?;
        let input = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(input)?;
        let mut messenger = ChildMessenger {
            output,
            input,
            input_buf: Vec::new(),
        };
        messenger.send(&ChildMessage::Alive)?;
        Ok(messenger)
    }

    pub fn send(&mut self, msg: &ChildMessage) -> Result<(), MessagingError> {
        writeln!(self.output, "{msg}")?;
        self.output.flush()?;
        Ok(())
    }

    /// Non-blocking poll for a parent directive.
    pub fn poll(&mut self) -> Result<Option<ParentMessage>, MessagingError> {
        let mut chunk = [0u8; 256];
        loop {
            if let Some(pos) = self.input_buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.input_buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
                match line.parse() {
                    Ok(msg) => return Ok(Some(msg)),
                    Err(_) => {
                        warn!("unrecognised parent message: {line:?}");
                        continue;
                    }
                }
            }
            match self.input.read(&mut chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => self.input_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

// ---------------------------------------------------------------------
// Parent endpoint
// ---------------------------------------------------------------------

fn mkfifo(path: &Path) -> io::Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    if unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) } != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Parent-side endpoint for one job: owns the two fifos and a reader
/// thread pumping child messages into a channel.
pub struct JobComms {
    /// Pipe the child reads directives from.
    child_input: PathBuf,
    /// Pipe the child writes messages to.
    child_output: PathBuf,
    rx: Option<mpsc::Receiver<ChildMessage>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<File>,
    job_id: u32,
}

impl JobComms {
    /// Create the fifos next to the dynamic config file and advertise them
    /// in it. Must run before the child is spawned.
    pub fn init(
        dynamic_config: &mut impl Write,
        dir: &Path,
        job_id: u32,
    ) -> Result<Self, MessagingError> {
        let child_output = dir.join(format!("messages.out.{job_id}.fifo"));
        let child_input = dir.join(format!("messages.in.{job_id}.fifo"));
        mkfifo(&child_output)?;
        mkfifo(&child_input)?;
        writeln!(dynamic_config, "O {}", child_output.display())?;
        writeln!(dynamic_config, "I {}", child_input.display())?;
        Ok(JobComms {
            child_input,
            child_output,
            rx: None,
            reader: None,
            writer: None,
            job_id,
        })
    }

    /// Start the reader and wait (bounded) for the child's `alive`
    /// handshake. Call after the child process is spawned.
    pub fn wait_for_child(&mut self, timeout: Duration) -> bool {
        let (tx, rx) = mpsc::channel();
        let path = self.child_output.clone();
        let job_id = self.job_id;
        self.reader = Some(thread::spawn(move || {
            // Blocks until the child opens its write end.
            let Ok(file) = File::open(&path) else {
                return;
            };
            for line in BufReader::new(file).lines() {
                let Ok(line) = line else { break };
                match line.parse::<ChildMessage>() {
                    Ok(msg) => {
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(_) => warn!("[job {job_id}] unrecognised child message: {line:?}"),
                }
            }
        }));
        let alive = matches!(
            rx.recv_timeout(timeout),
            Ok(ChildMessage::Alive)
        );
        self.rx = Some(rx);
        alive
    }

    /// Receive the next child message, waiting at most `timeout`.
    pub fn recv(&self, timeout: Duration) -> Result<ChildMessage, mpsc::RecvTimeoutError> {
        match &self.rx {
            Some(rx) => rx.recv_timeout(timeout),
            None => Err(mpsc::RecvTimeoutError::Disconnected),
        }
    }

    /// Send a directive to the child. The write end is opened lazily; a
    /// child that has not opened its read end yet yields `WouldBlock`-style
    /// failure rather than hanging the controller.
    pub fn send(&mut self, msg: &ParentMessage) -> Result<(), MessagingError> {
        if self.writer.is_none() {
            self.writer = Some(
                OpenOptions::new()
                    .write(true)
                    .custom_flags(libc::O_NONBLOCK)
                    .open(&self.child_input)?,
            );
        }
        let writer = self.writer.as_mut().unwrap();
        writeln!(writer, "{msg}")?;
        writer.flush()?;
        Ok(())
    }

    fn remove_fifos(&self) {
        for path in [&self.child_input, &self.child_output] {
            if let Err(err) = std::fs::remove_file(path) {
                debug!("[job {}] fifo cleanup: {err}", self.job_id);
            }
        }
    }

    /// Tear down before any child was spawned (pre-fork cancellation).
    pub fn abort(self) {
        assert!(self.reader.is_none(), "abort after the reader was started");
        self.remove_fifos();
    }

    /// Tear down after the child exited.
    pub fn finish(mut self) {
        if let Some(reader) = self.reader.take() {
            if !reader.is_finished() {
                // The reader is stuck in open() because the child never
                // connected. A write-end open rendezvouses with it; the
                // immediate close then EOFs the read loop.
                match OpenOptions::new()
                    .write(true)
                    .custom_flags(libc::O_NONBLOCK)
                    .open(&self.child_output)
                {
                    Ok(_poke) => {}
                    Err(_) => {
                        let _ = OpenOptions::new().write(true).open(&self.child_output);
                    }
                }
            }
            let _ = reader.join();
        }
        self.remove_fifos();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_messages_round_trip() {
        let msgs = [
            ChildMessage::Alive,
            ChildMessage::Progress {
                branches: 17,
                proportion: 0.25,
                elapsed_usecs: 1_000_000,
                eta_usecs: 3_000_000,
                icb_bound: 2,
            },
            ChildMessage::PpDiscovered {
                eip: 0xdead_beef,
                tid: Some(4),
                last_call: 0x1000,
                most_recent_syscall: 0,
            },
            ChildMessage::PpDiscovered {
                eip: 0x100,
                tid: None,
                last_call: 0,
                most_recent_syscall: 31,
            },
            ChildMessage::BugFound {
                trace_path: "/tmp/trace.html".to_owned(),
                fab_timestamp: 55,
                fab_cputime: 44,
            },
            ChildMessage::TimedOut,
            ChildMessage::NeedRerun,
            ChildMessage::Exiting,
        ];
        for msg in msgs {
            let line = msg.to_string();
            assert_eq!(line.parse::<ChildMessage>().unwrap(), msg, "{line}");
        }
    }

    #[test]
    fn parent_messages_round_trip() {
        for msg in [ParentMessage::RequestProgress, ParentMessage::PleaseDie] {
            assert_eq!(msg.to_string().parse::<ParentMessage>().unwrap(), msg);
        }
    }

    #[test]
    fn garbage_lines_fail_to_parse() {
        assert!("".parse::<ChildMessage>().is_err());
        assert!("progress 1 2".parse::<ChildMessage>().is_err());
        assert!("pp zz 1 0 0".parse::<ChildMessage>().is_err());
        assert!("die".parse::<ParentMessage>().is_err());
    }

    #[test]
    fn endpoints_talk_over_fifos() {
        let dir = tempfile::tempdir().unwrap();
        let mut dynamic = Vec::new();
        let mut comms = JobComms::init(&mut dynamic, dir.path(), 7).unwrap();

        // The "child": parse the advertised pipe names, connect, chat.
        let advert = String::from_utf8(dynamic).unwrap();
        let mut out_path = None;
        let mut in_path = None;
        for line in advert.lines() {
            if let Some(p) = line.strip_prefix("O ") {
                out_path = Some(PathBuf::from(p));
            } else if let Some(p) = line.strip_prefix("I ") {
                in_path = Some(PathBuf::from(p));
            }
        }
        let (out_path, in_path) = (out_path.unwrap(), in_path.unwrap());
        let child = thread::spawn(move || {
            let mut m = ChildMessenger::connect(&in_path, &out_path).unwrap();
            m.send(&ChildMessage::Progress {
                branches: 1,
                proportion: 0.5,
                elapsed_usecs: 10,
                eta_usecs: 10,
                icb_bound: 0,
            })
            .unwrap();
            // Wait for the parent's directive to show up.
            loop {
                match m.poll().unwrap() {
                    Some(msg) => break msg,
                    None => thread::sleep(Duration::from_millis(5)),
                }
            }
        });

        assert!(comms.wait_for_child(Duration::from_secs(10)));
        match comms.recv(Duration::from_secs(10)) {
            Ok(ChildMessage::Progress { branches: 1, .. }) => {}
            other => panic!("unexpected message: {other:?}"),
        }
        // The child has connected, so the lazy write-open succeeds.
        let mut sent = false;
        for _ in 0..200 {
            if comms.send(&ParentMessage::PleaseDie).is_ok() {
                sent = true;
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(sent);
        assert_eq!(child.join().unwrap(), ParentMessage::PleaseDie);
        comms.finish();
    }
}
