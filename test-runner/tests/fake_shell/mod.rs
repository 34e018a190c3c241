//! A scripted shell on the far side of a pseudo-terminal, standing in for a
//! board's serial console.

use std::{
    ffi::CStr,
    fs::File,
    io::{Read, Write},
    os::fd::{FromRawFd, OwnedFd},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

pub const PROMPT: &str = "/ # ";

type Responder = Box<dyn Fn(&str) -> String + Send>;

pub struct FakeShell {
    device: PathBuf,
    received: Arc<Mutex<Vec<String>>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    _slave: OwnedFd,
}

impl FakeShell {
    /// Starts a shell that echoes each command line, then writes whatever
    /// `respond` returns for it. An empty line prints a fresh prompt and
    /// Ctrl-C prints `^C` and a prompt.
    pub fn spawn(respond: impl Fn(&str) -> String + Send + 'static) -> Self {
        let mut master = -1;
        let mut slave = -1;
        let mut name = [0 as libc::c_char; 128];
        // SAFETY: the out-pointers are valid and `name` exceeds the longest
        // pts path.
        let rc = unsafe {
            libc::openpty(
                &mut master,
                &mut slave,
                name.as_mut_ptr(),
                std::ptr::null(),
                std::ptr::null(),
            )
        };
        assert_eq!(rc, 0, "openpty failed: {}", std::io::Error::last_os_error());

        // SAFETY: `slave` is an open terminal fd and `termios` is fully
        // written by tcgetattr before use.
        unsafe {
            let mut termios: libc::termios = std::mem::zeroed();
            assert_eq!(libc::tcgetattr(slave, &mut termios), 0);
            libc::cfmakeraw(&mut termios);
            assert_eq!(libc::tcsetattr(slave, libc::TCSANOW, &termios), 0);
        }

        // SAFETY: openpty returned a NUL-terminated path and two fresh fds
        // that nothing else owns.
        let device = unsafe { CStr::from_ptr(name.as_ptr()) }
            .to_str()
            .unwrap()
            .into();
        let slave = unsafe { OwnedFd::from_raw_fd(slave) };
        let master = unsafe { File::from_raw_fd(master) };

        let received = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let thread = std::thread::spawn({
            let received = received.clone();
            let stop = stop.clone();
            move || serve(master, Box::new(respond), &received, &stop)
        });

        Self {
            device,
            received,
            stop,
            thread: Some(thread),
            _slave: slave,
        }
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    /// Command lines received, with Ctrl-C recorded as `^C`. Waits until
    /// nothing new has arrived for a short while, since the last write of a
    /// run may still be in flight.
    pub async fn received(&self) -> Vec<String> {
        let snapshot = || self.received.lock().unwrap().clone();
        let mut seen = snapshot();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let now = snapshot();
            if now == seen {
                break;
            }
            seen = now;
        }
        seen
    }
}

impl Drop for FakeShell {
    fn drop(&mut self) {
        // Closing the master side ends any read still pending on the
        // console device.
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn serve(mut master: File, respond: Responder, received: &Mutex<Vec<String>>, stop: &AtomicBool) {
    let mut line = String::new();
    let mut buf = [0u8; 256];
    while !stop.load(Ordering::SeqCst) {
        let mut pollfd = libc::pollfd {
            fd: std::os::fd::AsRawFd::as_raw_fd(&master),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: one valid pollfd.
        if unsafe { libc::poll(&mut pollfd, 1, 20) } <= 0 {
            continue;
        }
        let n = match master.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };

        for &byte in &buf[..n] {
            let reply = match byte {
                0x03 => {
                    line.clear();
                    received.lock().unwrap().push("^C".to_owned());
                    format!("^C\r\n{PROMPT}")
                }
                b'\n' | b'\r' => {
                    let command = std::mem::take(&mut line);
                    received.lock().unwrap().push(command.clone());
                    let output = if command.is_empty() {
                        PROMPT.to_owned()
                    } else {
                        respond(&command)
                    };
                    format!("{command}\r\n{output}")
                }
                other => {
                    line.push(char::from(other));
                    continue;
                }
            };
            if master.write_all(reply.as_bytes()).is_err() {
                return;
            }
        }
    }
}
