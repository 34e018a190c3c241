//! Fan-out of console lines to independent sinks.
//!
//! Every line read from a session goes to all sinks in the same order, so the
//! live echo and the captured log never disagree. A sink that fails is
//! dropped from the fan-out with a warning; the remaining sinks keep
//! receiving data.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::Path,
};
use tracing::warn;

struct Sink {
    name: String,
    writer: Box<dyn Write + Send>,
    broken: bool,
}

#[derive(Default)]
pub struct OutputTee {
    sinks: Vec<Sink>,
}

impl OutputTee {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&mut self, name: impl Into<String>, writer: impl Write + Send + 'static) {
        self.sinks.push(Sink {
            name: name.into(),
            writer: Box::new(writer),
            broken: false,
        });
    }

    /// Adds stdout as a live-progress sink.
    pub fn with_echo(mut self) -> Self {
        self.add_sink("echo", io::stdout());
        self
    }

    /// Adds `path` as a capture sink. With `append` unset the file is
    /// truncated first.
    pub fn with_file(mut self, path: &Path, append: bool) -> io::Result<Self> {
        let file = open_log(path, append)?;
        self.add_sink(path.display().to_string(), BufWriter::new(file));
        Ok(self)
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.iter().filter(|sink| !sink.broken).count()
    }

    pub fn write_line(&mut self, line: &str) {
        for sink in self.sinks.iter_mut().filter(|sink| !sink.broken) {
            let res = sink
                .writer
                .write_all(line.as_bytes())
                .and_then(|()| sink.writer.write_all(b"\n"));
            if let Err(err) = res {
                warn!(sink = %sink.name, error = %err, "output sink failed, detaching it");
                sink.broken = true;
            }
        }
    }

    pub fn flush(&mut self) {
        for sink in self.sinks.iter_mut().filter(|sink| !sink.broken) {
            if let Err(err) = sink.writer.flush() {
                warn!(sink = %sink.name, error = %err, "failed to flush output sink");
                sink.broken = true;
            }
        }
    }
}

impl Drop for OutputTee {
    fn drop(&mut self) {
        self.flush();
    }
}

fn open_log(path: &Path, append: bool) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true);
    if append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    options.open(path)
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use std::{
        io::{self, Write},
        sync::{Arc, Mutex},
    };

    /// An in-memory sink whose contents stay readable after it is handed to a
    /// tee.
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        pub(crate) fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
